//! In-core file entries. The tree is an arena of entries keyed by file id;
//! directories hold child ids by name. Each entry carries its own
//! reader-writer lock; nothing in here touches the network.
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::RwLock;

use syndicate_ms::{EntryType, MsEntry};
use syndicate_util::data::*;
use syndicate_util::future::OpFuture;
use syndicate_util::time::now_msec;

use crate::manifest::Manifest;

/// A block written locally but not yet flushed to the on-disk cache
#[derive(Debug, Clone)]
pub struct BufferedBlock {
	pub data: BytesMut,
	pub dirty: bool,
}

/// A block flushed to the cache but not yet replicated
#[derive(Debug, Clone)]
pub struct DirtyBlock {
	pub block_version: BlockVersion,
	pub data: Bytes,
}

/// One writer's turn in the per-file metadata commit order
pub struct SyncQueueSlot {
	pub turn: OpFuture<()>,
}

impl SyncQueueSlot {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			turn: OpFuture::new(),
		})
	}
}

/// Frozen attributes of a file at one instant; what replication and
/// garbage collection carry around after the fent lock is dropped
#[derive(Debug, Clone, PartialEq)]
pub struct FentSnapshot {
	pub file_id: FileId,
	pub file_version: FileVersion,
	pub coordinator_id: GatewayId,
	pub writer_id: GatewayId,
	pub owner_id: UserId,
	pub volume_id: VolumeId,
	pub name: String,
	pub parent_id: FileId,
	pub mode: u32,
	pub size: u64,
	pub mtime: (i64, u32),
	pub ctime: (i64, u32),
	pub write_nonce: WriteNonce,
	pub manifest_mtime: (i64, u32),
	pub fs_path: String,
}

impl FentSnapshot {
	pub fn to_ms_entry(&self) -> MsEntry {
		MsEntry {
			file_id: self.file_id,
			entry_type: EntryType::File,
			name: self.name.clone(),
			parent_id: self.parent_id,
			file_version: self.file_version,
			write_nonce: self.write_nonce,
			coordinator_id: self.coordinator_id,
			owner_id: self.owner_id,
			volume_id: self.volume_id,
			mode: self.mode,
			size: self.size,
			mtime_sec: self.mtime.0,
			mtime_nsec: self.mtime.1,
			ctime_sec: self.ctime.0,
			ctime_nsec: self.ctime.1,
			manifest_mtime_sec: self.manifest_mtime.0,
			manifest_mtime_nsec: self.manifest_mtime.1,
		}
	}
}

/// Mutable state of one file entry, guarded by the fent's rwlock
pub struct FentState {
	pub entry_type: EntryType,
	pub name: String,
	pub parent_id: FileId,

	pub file_id: FileId,
	pub file_version: FileVersion,
	pub coordinator_id: GatewayId,

	pub owner_id: UserId,
	pub volume_id: VolumeId,
	pub mode: u32,
	pub size: u64,
	pub mtime: (i64, u32),
	pub ctime: (i64, u32),
	pub write_nonce: WriteNonce,

	pub manifest: Manifest,
	/// False until the manifest has been fetched from the coordinator (or
	/// built locally by a create)
	pub manifest_initialized: bool,

	/// Local metadata is suspected out of date; reads must revalidate
	pub read_stale: bool,
	pub deleted: bool,

	pub bufferred_blocks: BTreeMap<BlockId, BufferedBlock>,
	pub dirty_blocks: BTreeMap<BlockId, DirtyBlock>,
	/// Superseded, already-replicated versions awaiting GC
	pub garbage_blocks: BTreeMap<(BlockId, BlockVersion), GatewayId>,

	/// Last successfully replicated state
	pub old_snapshot: Option<FentSnapshot>,

	/// Directories only: children by name
	pub children: Option<BTreeMap<String, FileId>>,

	pub sync_queue: VecDeque<Arc<SyncQueueSlot>>,
}

impl FentState {
	pub fn from_ms_entry(entry: &MsEntry) -> Self {
		Self {
			entry_type: entry.entry_type,
			name: entry.name.clone(),
			parent_id: entry.parent_id,
			file_id: entry.file_id,
			file_version: entry.file_version,
			coordinator_id: entry.coordinator_id,
			owner_id: entry.owner_id,
			volume_id: entry.volume_id,
			mode: entry.mode,
			size: entry.size,
			mtime: (entry.mtime_sec, entry.mtime_nsec),
			ctime: (entry.ctime_sec, entry.ctime_nsec),
			write_nonce: entry.write_nonce,
			manifest: Manifest {
				file_version: entry.file_version,
				size: entry.size,
				mtime_sec: entry.manifest_mtime_sec,
				mtime_nsec: entry.manifest_mtime_nsec,
				blocks: BTreeMap::new(),
			},
			manifest_initialized: false,
			read_stale: false,
			deleted: false,
			bufferred_blocks: BTreeMap::new(),
			dirty_blocks: BTreeMap::new(),
			garbage_blocks: BTreeMap::new(),
			old_snapshot: None,
			children: match entry.entry_type {
				EntryType::Directory => Some(BTreeMap::new()),
				EntryType::File => None,
			},
			sync_queue: VecDeque::new(),
		}
	}

	pub fn is_dir(&self) -> bool {
		self.entry_type == EntryType::Directory
	}

	pub fn has_dirty(&self) -> bool {
		self.bufferred_blocks.values().any(|b| b.dirty) || !self.dirty_blocks.is_empty()
	}

	pub fn snapshot(&self, writer_id: GatewayId, fs_path: &str) -> FentSnapshot {
		FentSnapshot {
			file_id: self.file_id,
			file_version: self.file_version,
			coordinator_id: self.coordinator_id,
			writer_id,
			owner_id: self.owner_id,
			volume_id: self.volume_id,
			name: self.name.clone(),
			parent_id: self.parent_id,
			mode: self.mode,
			size: self.size,
			mtime: self.mtime,
			ctime: self.ctime,
			write_nonce: self.write_nonce,
			manifest_mtime: self.manifest.mtime(),
			fs_path: fs_path.to_string(),
		}
	}

	/// Allocate the next version for a block: strictly newer than whatever
	/// the manifest names, clock-derived so versions order across gateways
	pub fn next_block_version(&self, block_id: BlockId) -> BlockVersion {
		let clock = now_msec() as BlockVersion;
		match self.manifest.block_version(block_id) {
			Some(current) if clock <= current => current + 1,
			_ => clock,
		}
	}

	pub fn next_file_version(&self) -> FileVersion {
		let clock = now_msec() as FileVersion;
		if clock <= self.file_version {
			self.file_version + 1
		} else {
			clock
		}
	}
}

/// One entry in the arena
pub struct Fent {
	pub file_id: FileId,
	pub lock: RwLock<FentState>,
}

impl Fent {
	pub fn new(state: FentState) -> Arc<Self> {
		Arc::new(Self {
			file_id: state.file_id,
			lock: RwLock::new(state),
		})
	}
}

/// Open-file handle given out to front-ends
pub struct FileHandle {
	pub fent: Arc<Fent>,
	pub fs_path: String,
	pub read_only: bool,
	pub dirty: std::sync::atomic::AtomicBool,
}

impl FileHandle {
	pub fn new(fent: Arc<Fent>, fs_path: String, read_only: bool) -> Self {
		Self {
			fent,
			fs_path,
			read_only,
			dirty: std::sync::atomic::AtomicBool::new(false),
		}
	}

	pub fn mark_dirty(&self) {
		self.dirty.store(true, std::sync::atomic::Ordering::SeqCst);
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty.load(std::sync::atomic::Ordering::SeqCst)
	}

	pub fn mark_clean(&self) {
		self.dirty.store(false, std::sync::atomic::Ordering::SeqCst);
	}
}
