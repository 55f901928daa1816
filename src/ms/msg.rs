//! Wire records exchanged with the metadata service. All of them are
//! MessagePack-encoded; the signed ones carry their signature inline and
//! follow the empty-signature-then-sign convention.
use serde::{Deserialize, Serialize};

use syndicate_util::crypto::SignedMessage;
use syndicate_util::data::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
	File,
	Directory,
}

/// Metadata record for one filesystem entry, as the MS stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsEntry {
	pub file_id: FileId,
	pub entry_type: EntryType,
	pub name: String,
	pub parent_id: FileId,

	pub file_version: FileVersion,
	pub write_nonce: WriteNonce,
	pub coordinator_id: GatewayId,

	pub owner_id: UserId,
	pub volume_id: VolumeId,
	pub mode: u32,
	pub size: u64,
	pub mtime_sec: i64,
	pub mtime_nsec: u32,
	pub ctime_sec: i64,
	pub ctime_nsec: u32,

	/// Timestamp of the currently replicated manifest
	pub manifest_mtime_sec: i64,
	pub manifest_mtime_nsec: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateOp {
	Create,
	Mkdir,
	Update,
	/// Data-bearing update; the block list feeds the MS-side vacuum log
	UpdateWrite {
		affected_blocks: Vec<BlockId>,
	},
	Delete,
	Rename {
		new_parent_id: FileId,
		new_name: String,
	},
	/// Drop one row from the file's vacuum log
	VacuumRemove {
		manifest_mtime_sec: i64,
		manifest_mtime_nsec: u32,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsUpdate {
	pub op: UpdateOp,
	pub entry: MsEntry,
}

/// One signed batch of metadata updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsUpdates {
	pub volume_id: VolumeId,
	pub gateway_id: GatewayId,
	pub owner_id: UserId,
	pub updates: Vec<MsUpdate>,
	#[serde(with = "serde_bytes")]
	pub signature: Vec<u8>,
}

impl SignedMessage for MsUpdates {
	fn signature(&self) -> &[u8] {
		&self.signature
	}
	fn set_signature(&mut self, sig: Vec<u8>) {
		self.signature = sig;
	}
}

/// Signed reply to any MS RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsReply {
	/// 0 on success, negative errno-style code otherwise
	pub error: i32,
	pub volume_version: u64,
	pub cert_version: u64,
	pub entries: Vec<MsEntry>,
	pub write_nonce: Option<WriteNonce>,
	pub vacuum_entries: Vec<VacuumLogEntry>,
	#[serde(with = "serde_bytes")]
	pub signature: Vec<u8>,
}

impl SignedMessage for MsReply {
	fn signature(&self) -> &[u8] {
		&self.signature
	}
	fn set_signature(&mut self, sig: Vec<u8>) {
		self.signature = sig;
	}
}

/// Signed certificate for one gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCertMsg {
	pub gateway_type: GatewayType,
	pub gateway_id: GatewayId,
	pub owner_id: UserId,
	pub volume_id: VolumeId,
	pub name: String,
	pub host: String,
	pub port: u16,
	pub caps: u64,
	pub version: u64,
	pub public_key_pem: String,
	/// Blocksize override, only meaningful for AGs
	pub blocksize: Option<u64>,
	#[serde(with = "serde_bytes")]
	pub signature: Vec<u8>,
}

impl SignedMessage for GatewayCertMsg {
	fn signature(&self) -> &[u8] {
		&self.signature
	}
	fn set_signature(&mut self, sig: Vec<u8>) {
		self.signature = sig;
	}
}

/// Signed volume record, the root of trust for everything else
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMetadata {
	pub volume_id: VolumeId,
	pub name: String,
	pub owner_id: UserId,
	pub blocksize: u64,
	pub volume_version: u64,
	pub cert_version: u64,
	pub root: MsEntry,
	pub public_key_pem: String,
	#[serde(with = "serde_bytes")]
	pub signature: Vec<u8>,
}

impl SignedMessage for VolumeMetadata {
	fn signature(&self) -> &[u8] {
		&self.signature
	}
	fn set_signature(&mut self, sig: Vec<u8>) {
		self.signature = sig;
	}
}

/// Index of the current certificate bundle; individual certificates are
/// fetched separately when their version advances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertManifest {
	pub volume_id: VolumeId,
	pub cert_version: u64,
	pub certs: Vec<CertStub>,
	#[serde(with = "serde_bytes")]
	pub signature: Vec<u8>,
}

impl SignedMessage for CertManifest {
	fn signature(&self) -> &[u8] {
		&self.signature
	}
	fn set_signature(&mut self, sig: Vec<u8>) {
		self.signature = sig;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertStub {
	pub gateway_type: GatewayType,
	pub gateway_id: GatewayId,
	pub version: u64,
}

/// One row of a file's vacuum log: a write whose replicas may need to be
/// reclaimed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VacuumLogEntry {
	pub file_id: FileId,
	pub file_version: FileVersion,
	pub writer_id: GatewayId,
	pub manifest_mtime_sec: i64,
	pub manifest_mtime_nsec: u32,
	pub affected_blocks: Vec<(BlockId, BlockVersion)>,
}

/// Map the MS's errno-style reply codes onto the local error taxonomy
pub fn ms_reply_error(code: i32) -> Option<syndicate_util::error::Error> {
	use syndicate_util::error::Error;
	match code {
		0 => None,
		-2 => Some(Error::NotFound),
		-13 => Some(Error::Unauthorized("MS denied the operation".into())),
		-17 => Some(Error::Exists),
		-39 => Some(Error::NotEmpty),
		-116 => Some(Error::Stale),
		c => Some(Error::Message(format!("MS error code {}", c))),
	}
}
