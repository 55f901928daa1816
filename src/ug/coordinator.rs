//! The signed write protocol between gateways, and the coordinator
//! handoff: a non-coordinator that cannot reach the coordinator takes over
//! the file, republishes its manifest and commits metadata itself.
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use syndicate_download::RequestSpec;
use syndicate_util::crypto::{self, SignedMessage};
use syndicate_util::data::*;
use syndicate_util::error::Error;
use syndicate_util::time::now_timespec;

use crate::core::FsCore;
use crate::fent::FentState;
use crate::sync::{build_signed_manifest, SyncContext};
use crate::url;

/// Upper bound on a control message body
pub const WRITEMSG_MAX_LEN: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteMsgKind {
	/// Writer -> coordinator: these blocks now have these versions
	Prepare {
		blocks: Vec<(BlockId, BlockVersion)>,
		size: u64,
	},
	/// Coordinator -> writer: merged, metadata committed
	Promise { write_nonce: WriteNonce },
	/// Writer -> coordinator: truncate the file
	Truncate {
		new_size: u64,
		new_version: FileVersion,
	},
	/// Writer -> coordinator: unlink the file
	Detach,
	/// Either direction: staged blocks are durably held remotely
	Accepted {
		blocks: Vec<(BlockId, BlockVersion)>,
	},
	/// Coordinator -> writer: talk to this gateway instead (or take over,
	/// if it names the receiver)
	CoordinatorChange { new_coordinator: GatewayId },
	Error { code: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteMsg {
	pub kind: WriteMsgKind,
	pub volume_id: VolumeId,
	pub file_id: FileId,
	pub file_version: FileVersion,
	pub fs_path: String,
	pub sender_id: GatewayId,
	pub sender_owner_id: UserId,
	pub write_nonce: WriteNonce,
	#[serde(with = "serde_bytes")]
	pub signature: Vec<u8>,
}

impl SignedMessage for WriteMsg {
	fn signature(&self) -> &[u8] {
		&self.signature
	}
	fn set_signature(&mut self, sig: Vec<u8>) {
		self.signature = sig;
	}
}

impl WriteMsg {
	pub fn new(
		core: &FsCore,
		kind: WriteMsgKind,
		file_id: FileId,
		file_version: FileVersion,
		fs_path: &str,
		write_nonce: WriteNonce,
	) -> Self {
		Self {
			kind,
			volume_id: core.volume_id,
			file_id,
			file_version,
			fs_path: fs_path.to_string(),
			sender_id: core.gateway_id,
			sender_owner_id: core.owner_id,
			write_nonce,
			signature: vec![],
		}
	}

	pub fn signed(mut self, core: &FsCore) -> Result<Self, Error> {
		crypto::sign_message(&mut self, core.my_key())?;
		Ok(self)
	}

	pub fn encode(&self) -> Result<Bytes, Error> {
		Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		Ok(rmp_serde::from_read_ref(bytes)?)
	}
}

/// Encode a WriteMsg as the one-field multipart form the peer protocol
/// uses; returns (content-type, body)
pub fn encode_writemsg_form(msg_bytes: &[u8]) -> (String, Bytes) {
	let boundary = format!("syndicate-writemsg-{:016x}", rand::random::<u64>());
	let mut body = Vec::with_capacity(msg_bytes.len() + 256);
	body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
	body.extend_from_slice(
		b"Content-Disposition: form-data; name=\"WriteMsg\"\r\n\
		  Content-Type: application/octet-stream\r\n\r\n",
	);
	body.extend_from_slice(msg_bytes);
	body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
	(
		format!("multipart/form-data; boundary={}", boundary),
		Bytes::from(body),
	)
}

/// Verify an inbound WriteMsg against its sender's certificate
pub fn verify_writemsg(core: &FsCore, msg: &WriteMsg) -> Result<(), Error> {
	let cert = core.cert_for(msg.sender_id)?;
	if cert.owner_id != msg.sender_owner_id {
		return Err(Error::Unauthorized(format!(
			"gateway {} does not belong to user {}",
			msg.sender_id, msg.sender_owner_id
		)));
	}
	crypto::verify_message(msg, &cert.public_key).map_err(|_| Error::BadSignature(msg.sender_id))
}

/// POST a signed WriteMsg to a peer. Returns None when the peer is
/// unreachable (connection failure, timeout, cancellation), the verified
/// reply otherwise.
pub async fn post_writemsg(
	core: &Arc<FsCore>,
	cert: &syndicate_ms::GatewayCert,
	fs_path: &str,
	msg: &WriteMsg,
) -> Result<Option<WriteMsg>, Error> {
	let (content_type, body) = encode_writemsg_form(&msg.encode()?);
	let request = RequestSpec {
		method: http::Method::POST,
		url: url::writemsg_url(cert, core.volume_id, fs_path),
		headers: vec![(
			http::header::CONTENT_TYPE,
			http::header::HeaderValue::from_str(&content_type)
				.map_err(|e| Error::Message(format!("bad content type: {}", e)))?,
		)],
		body: Some(body),
	};

	let res = core.downloader.run_once(request, WRITEMSG_MAX_LEN).await;
	if res.error.is_some() {
		return Ok(None);
	}
	res.interpret_errors()?;

	let reply = WriteMsg::decode(&res.data)?;
	verify_writemsg(core, &reply)?;
	Ok(Some(reply))
}

pub enum RemoteWriteOutcome {
	/// The coordinator accepted the write (PROMISE)
	Done { write_nonce: WriteNonce },
	/// This gateway is the coordinator now; caller must publish the
	/// manifest and commit metadata itself
	NowCoordinator,
}

/// Send the coordinator our PREPARE for this flush, taking over
/// coordination if it is unreachable or cedes. This is the only place
/// `coordinator_id` ever changes on the writer side.
pub async fn remote_write_or_coordinate(
	core: &Arc<FsCore>,
	fs_path: &str,
	st: &mut FentState,
	sync_ctx: &SyncContext,
) -> Result<RemoteWriteOutcome, Error> {
	let cert = core.cert_for(st.coordinator_id)?;

	let blocks: Vec<(BlockId, BlockVersion)> = sync_ctx
		.dirty_blocks
		.iter()
		.map(|(id, db)| (*id, db.block_version))
		.collect();
	let msg = WriteMsg::new(
		core,
		WriteMsgKind::Prepare {
			blocks,
			size: sync_ctx.snapshot.size,
		},
		st.file_id,
		sync_ctx.snapshot.file_version,
		fs_path,
		st.write_nonce,
	)
	.signed(core)?;

	let reply = match post_writemsg(core, &cert, fs_path, &msg).await? {
		None => {
			// coordinator unreachable: take over
			info!(
				"Coordinator {} unreachable for {}, taking over coordination",
				st.coordinator_id, fs_path
			);
			st.coordinator_id = core.gateway_id;
			return Ok(RemoteWriteOutcome::NowCoordinator);
		}
		Some(reply) => reply,
	};

	match reply.kind {
		WriteMsgKind::Promise { write_nonce } => Ok(RemoteWriteOutcome::Done { write_nonce }),
		WriteMsgKind::CoordinatorChange { new_coordinator } => {
			if new_coordinator == core.gateway_id {
				st.coordinator_id = core.gateway_id;
				Ok(RemoteWriteOutcome::NowCoordinator)
			} else {
				// someone else took over; note it and let the caller retry
				st.coordinator_id = new_coordinator;
				Err(Error::Busy)
			}
		}
		WriteMsgKind::Error { code } => match code {
			-116 => Err(Error::Stale),
			c => Err(Error::Message(format!("coordinator error {}", c))),
		},
		other => Err(Error::InvalidRequest(format!(
			"unexpected coordinator reply {:?}",
			other
		))),
	}
}

/// Coordinator-side handler for an inbound, already-parsed WriteMsg.
/// Returns the signed reply.
pub async fn handle_write_msg(core: &Arc<FsCore>, msg: WriteMsg) -> Result<WriteMsg, Error> {
	verify_writemsg(core, &msg)?;

	let fent = match core.get_fent(msg.file_id) {
		Some(f) => f,
		None => {
			let entry = core.ms.get_entry(msg.file_id).await?;
			core.ensure_fent(&entry)
		}
	};

	let reply_kind = match msg.kind.clone() {
		WriteMsgKind::Prepare { blocks, size } => {
			let mut st = fent.lock.write().await;
			if st.coordinator_id != core.gateway_id {
				WriteMsgKind::CoordinatorChange {
					new_coordinator: st.coordinator_id,
				}
			} else if msg.file_version != st.file_version {
				WriteMsgKind::Error { code: -116 }
			} else {
				// merge the remote write into our manifest; superseded
				// versions become garbage to collect
				for (block_id, block_version) in blocks.iter() {
					if let Some(old) = st.manifest.put_block(*block_id, *block_version, msg.sender_id)
					{
						if old.block_version != *block_version {
							st.garbage_blocks
								.insert((*block_id, old.block_version), old.writer_id);
						}
					}
				}
				if size > st.size {
					st.size = size;
					st.manifest.size = size;
				}
				st.mtime = now_timespec();
				st.manifest.set_mtime(now_timespec());

				// republish the merged manifest and commit metadata
				let snapshot = st.snapshot(core.gateway_id, &msg.fs_path);
				let manifest_bytes = build_signed_manifest(core, &st).await?;
				core.rg.replicate_manifest(
					&snapshot,
					snapshot.manifest_mtime,
					manifest_bytes,
					None,
				);

				let affected: Vec<BlockId> = blocks.iter().map(|(id, _)| *id).collect();
				let md_entry = snapshot.to_ms_entry();
				let nonce = core.ms.update_write(&md_entry, affected).await?;
				st.write_nonce = nonce;
				WriteMsgKind::Promise { write_nonce: nonce }
			}
		}

		WriteMsgKind::Truncate {
			new_size,
			new_version,
		} => {
			let mut st = fent.lock.write().await;
			if st.coordinator_id != core.gateway_id {
				WriteMsgKind::CoordinatorChange {
					new_coordinator: st.coordinator_id,
				}
			} else if msg.file_version != st.file_version {
				WriteMsgKind::Error { code: -116 }
			} else {
				// version 0 means "you pick"
				let forced = if new_version > 0 { Some(new_version) } else { None };
				crate::ops::truncate_locked(core, &msg.fs_path, &mut st, new_size, forced).await?;
				WriteMsgKind::Accepted { blocks: vec![] }
			}
		}

		WriteMsgKind::Detach => {
			{
				let mut st = fent.lock.write().await;
				st.deleted = true;
				let _ = core.cache.evict_file(st.file_id, st.file_version).await;
			}
			core.remove_fent(msg.file_id);
			WriteMsgKind::Accepted { blocks: vec![] }
		}

		WriteMsgKind::Accepted { blocks } => {
			// a remote gateway now holds durable copies of these staged
			// blocks; release them from our buffers
			let mut st = fent.lock.write().await;
			for (block_id, block_version) in blocks.iter() {
				let matches = st
					.dirty_blocks
					.get(block_id)
					.map(|db| db.block_version == *block_version)
					.unwrap_or(false);
				if matches {
					st.dirty_blocks.remove(block_id);
				}
			}
			WriteMsgKind::Accepted { blocks }
		}

		WriteMsgKind::Promise { .. }
		| WriteMsgKind::CoordinatorChange { .. }
		| WriteMsgKind::Error { .. } => {
			return Err(Error::InvalidRequest(
				"reply-only WriteMsg kind received as a request".into(),
			));
		}
	};

	let (file_version, write_nonce) = {
		let st = fent.lock.read().await;
		(st.file_version, st.write_nonce)
	};
	WriteMsg::new(
		core,
		reply_kind,
		msg.file_id,
		file_version,
		&msg.fs_path,
		write_nonce,
	)
	.signed(core)
}
