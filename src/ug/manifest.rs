//! Per-file manifests: the ordered map naming the current version and
//! writer of every block, plus the signed wire form replicated to RGs
use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use syndicate_download::Downloader;
use syndicate_util::crypto::SignedMessage;
use syndicate_util::data::*;
use syndicate_util::error::Error;

use crate::driver::StorageDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
	pub block_version: BlockVersion,
	pub writer_id: GatewayId,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Manifest {
	pub file_version: FileVersion,
	pub size: u64,
	pub mtime_sec: i64,
	pub mtime_nsec: u32,
	pub blocks: BTreeMap<BlockId, BlockInfo>,
}

impl Manifest {
	pub fn block_version(&self, block_id: BlockId) -> Option<BlockVersion> {
		self.blocks.get(&block_id).map(|b| b.block_version)
	}

	pub fn block_writer(&self, block_id: BlockId) -> Option<GatewayId> {
		self.blocks.get(&block_id).map(|b| b.writer_id)
	}

	/// Record a new block version; returns the superseded entry if any
	pub fn put_block(
		&mut self,
		block_id: BlockId,
		block_version: BlockVersion,
		writer_id: GatewayId,
	) -> Option<BlockInfo> {
		self.blocks.insert(
			block_id,
			BlockInfo {
				block_version,
				writer_id,
			},
		)
	}

	/// Drop every block at or beyond `num_blocks`, returning what was cut
	pub fn truncate_blocks(&mut self, num_blocks: u64) -> Vec<(BlockId, BlockInfo)> {
		let cut: Vec<_> = self
			.blocks
			.range(num_blocks..)
			.map(|(id, info)| (*id, *info))
			.collect();
		for (id, _) in cut.iter() {
			self.blocks.remove(id);
		}
		cut
	}

	pub fn mtime(&self) -> (i64, u32) {
		(self.mtime_sec, self.mtime_nsec)
	}

	pub fn set_mtime(&mut self, mtime: (i64, u32)) {
		self.mtime_sec = mtime.0;
		self.mtime_nsec = mtime.1;
	}

	/// A fetched manifest older than what we already hold is stale and
	/// must not replace it
	pub fn is_newer_than(&self, mtime: (i64, u32)) -> bool {
		(self.mtime_sec, self.mtime_nsec) > mtime
	}
}

/// Signed wire form of a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMsg {
	pub volume_id: VolumeId,
	pub file_id: FileId,
	pub file_version: FileVersion,
	pub owner_id: UserId,
	pub writer_id: GatewayId,
	pub size: u64,
	pub mtime_sec: i64,
	pub mtime_nsec: u32,
	pub blocks: Vec<(BlockId, BlockVersion, GatewayId)>,
	#[serde(with = "serde_bytes")]
	pub signature: Vec<u8>,
}

impl SignedMessage for ManifestMsg {
	fn signature(&self) -> &[u8] {
		&self.signature
	}
	fn set_signature(&mut self, sig: Vec<u8>) {
		self.signature = sig;
	}
}

impl ManifestMsg {
	pub fn from_manifest(
		manifest: &Manifest,
		volume_id: VolumeId,
		file_id: FileId,
		owner_id: UserId,
		writer_id: GatewayId,
	) -> Self {
		Self {
			volume_id,
			file_id,
			file_version: manifest.file_version,
			owner_id,
			writer_id,
			size: manifest.size,
			mtime_sec: manifest.mtime_sec,
			mtime_nsec: manifest.mtime_nsec,
			blocks: manifest
				.blocks
				.iter()
				.map(|(id, info)| (*id, info.block_version, info.writer_id))
				.collect(),
			signature: vec![],
		}
	}

	pub fn to_manifest(&self) -> Manifest {
		Manifest {
			file_version: self.file_version,
			size: self.size,
			mtime_sec: self.mtime_sec,
			mtime_nsec: self.mtime_nsec,
			blocks: self
				.blocks
				.iter()
				.map(|(id, version, writer)| {
					(
						*id,
						BlockInfo {
							block_version: *version,
							writer_id: *writer,
						},
					)
				})
				.collect(),
		}
	}

	pub fn mtime(&self) -> (i64, u32) {
		(self.mtime_sec, self.mtime_nsec)
	}
}

/// Fetch a manifest: bounded download, optional driver transform, parse.
/// The signature is NOT checked here; callers verify it against the
/// writer's certificate once they know which one to use.
pub async fn download_manifest(
	dl: &Downloader,
	driver: &dyn StorageDriver,
	url: &str,
	max_len: usize,
) -> Result<ManifestMsg, Error> {
	let mut res = dl
		.run_once(syndicate_download::RequestSpec::get(url), max_len)
		.await;
	// the peer redirects requests for superseded manifests to the newest one
	if res.http_status == 302 {
		if let Some(location) = res.location.clone() {
			let target = crate::url::resolve_location(url, &location);
			res = dl
				.run_once(syndicate_download::RequestSpec::get(target), max_len)
				.await;
		}
	}
	res.interpret_errors()?;
	if res.http_status != 200 {
		return Err(Error::RemoteHttp(res.http_status));
	}
	let raw = driver.read_manifest(res.data).await?;
	let msg: ManifestMsg = rmp_serde::from_read_ref(&raw)?;
	Ok(msg)
}
