use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, Semaphore};

use syndicate_util::background::BackgroundRunner;
use syndicate_util::data::*;
use syndicate_util::error::Error;
use syndicate_util::future::OpFuture;

use crate::metrics::CacheMetrics;
use crate::worker::CacheWorker;

/// Caller does not intend to wait on the returned future
pub const CACHE_FLAG_DETACHED: u64 = 0x1;
/// The cache keeps the byte buffer to itself; the finalized future will not
/// carry the data back to the caller
pub const CACHE_FLAG_UNSHARED: u64 = 0x2;

/// Identity of one cached block on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
	pub file_id: FileId,
	pub file_version: FileVersion,
	pub block_id: BlockId,
	pub block_version: BlockVersion,
}

impl CacheKey {
	pub fn new(
		file_id: FileId,
		file_version: FileVersion,
		block_id: BlockId,
		block_version: BlockVersion,
	) -> Self {
		Self {
			file_id,
			file_version,
			block_id,
			block_version,
		}
	}
}

impl std::fmt::Display for CacheKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}.{}/{}.{}",
			file_id_hex(self.file_id),
			self.file_version,
			self.block_id,
			self.block_version
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWriteError {
	Io(std::io::ErrorKind),
	Stopped,
}

#[derive(Debug, Clone)]
pub struct CacheWriteResult {
	pub key: CacheKey,
	/// Present unless the write was flagged DETACHED or UNSHARED
	pub data: Option<Bytes>,
	pub error: Option<CacheWriteError>,
}

/// Completion handle for one asynchronous block write
pub struct CacheBlockFuture {
	pub key: CacheKey,
	flags: u64,
	pub(crate) inner: OpFuture<CacheWriteResult>,
}

impl CacheBlockFuture {
	fn new(key: CacheKey, flags: u64) -> Arc<Self> {
		Arc::new(Self {
			key,
			flags,
			inner: OpFuture::new(),
		})
	}

	pub fn is_finalized(&self) -> bool {
		self.inner.is_finalized()
	}

	pub async fn wait(&self) -> Result<CacheWriteResult, Error> {
		let res = self.inner.wait().await;
		match res.error {
			None => Ok(res),
			Some(CacheWriteError::Io(kind)) => Err(Error::Io(kind.into())),
			Some(CacheWriteError::Stopped) => Err(Error::Busy),
		}
	}
}

/// Wait on a batch of cache futures, surfacing the first error after all
/// of them have settled
pub async fn flush_writes(futs: &[Arc<CacheBlockFuture>]) -> Result<(), Error> {
	let mut rc = Ok(());
	for f in futs.iter() {
		if let Err(e) = f.wait().await {
			if rc.is_ok() {
				rc = Err(e);
			}
		}
	}
	rc
}

pub(crate) struct PendingWrite {
	pub(crate) key: CacheKey,
	pub(crate) file: tokio::fs::File,
	pub(crate) data: Bytes,
	pub(crate) flags: u64,
	pub(crate) fut: Arc<CacheBlockFuture>,
}

/// The on-disk block cache. All mutation of on-disk state happens on the
/// single cache worker; client threads only enqueue work and wait on
/// futures. Limits are counted in blocks.
pub struct BlockCache {
	pub volume_id: VolumeId,
	pub data_root: PathBuf,
	soft_limit: usize,

	num_blocks_written: AtomicUsize,
	running: AtomicBool,

	pending: Mutex<Vec<PendingWrite>>,
	ongoing: RwLock<HashSet<CacheKey>>,
	lru: Mutex<VecDeque<CacheKey>>,
	promotes: Mutex<Vec<CacheKey>>,
	evicts: Mutex<Vec<CacheKey>>,

	work_notify: Notify,
	hard_slots: Semaphore,

	pub(crate) metrics: CacheMetrics,
}

impl BlockCache {
	pub fn new(
		volume_id: VolumeId,
		data_root: PathBuf,
		soft_limit: usize,
		hard_limit: usize,
	) -> Arc<Self> {
		Arc::new(Self {
			volume_id,
			data_root,
			soft_limit,
			num_blocks_written: AtomicUsize::new(0),
			running: AtomicBool::new(true),
			pending: Mutex::new(Vec::new()),
			ongoing: RwLock::new(HashSet::new()),
			lru: Mutex::new(VecDeque::new()),
			promotes: Mutex::new(Vec::new()),
			evicts: Mutex::new(Vec::new()),
			work_notify: Notify::new(),
			hard_slots: Semaphore::new(hard_limit),
			metrics: CacheMetrics::new(),
		})
	}

	pub fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) {
		bg.spawn_worker(CacheWorker::new(self.clone()));
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		self.work_notify.notify_one();
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// Number of blocks currently durable on disk
	pub fn num_blocks(&self) -> usize {
		self.num_blocks_written.load(Ordering::SeqCst)
	}

	// ---- paths ----

	pub fn file_dir(&self, file_id: FileId, file_version: FileVersion) -> PathBuf {
		let mut path = self.data_root.clone();
		path.push(self.volume_id.to_string());
		path.push(file_id_hex(file_id));
		path.push(file_version.to_string());
		path
	}

	fn block_path(&self, key: &CacheKey) -> PathBuf {
		let mut path = self.file_dir(key.file_id, key.file_version);
		path.push(format!("{}.{}", key.block_id, key.block_version));
		path
	}

	fn parse_block_name(name: &str) -> Option<(BlockId, BlockVersion)> {
		let mut parts = name.splitn(2, '.');
		let block_id = parts.next()?.parse().ok()?;
		let block_version = parts.next()?.parse().ok()?;
		Some((block_id, block_version))
	}

	async fn remove_empty_parents(&self, file_id: FileId, file_version: FileVersion) {
		// removal fails harmlessly while siblings remain
		let version_dir = self.file_dir(file_id, file_version);
		let _ = tokio::fs::remove_dir(&version_dir).await;
		if let Some(file_dir) = version_dir.parent() {
			let _ = tokio::fs::remove_dir(file_dir).await;
		}
	}

	// ---- write path ----

	/// Reserve a slot against the hard limit (waiting if the cache is
	/// full), create the block file exclusively, and enqueue the write for
	/// the worker. The block becomes readable once the returned future
	/// finalizes without error.
	pub async fn write_block_async(
		&self,
		key: CacheKey,
		data: Bytes,
		flags: u64,
	) -> Result<Arc<CacheBlockFuture>, Error> {
		if !self.is_running() {
			return Err(Error::Busy);
		}

		let permit = self
			.hard_slots
			.acquire()
			.await
			.map_err(|_| Error::Busy)?;
		permit.forget();

		let dir = self.file_dir(key.file_id, key.file_version);
		let path = self.block_path(&key);

		let open_res = async {
			tokio::fs::create_dir_all(&dir).await?;
			tokio::fs::OpenOptions::new()
				.write(true)
				.create_new(true)
				.open(&path)
				.await
		}
		.await;

		let file = match open_res {
			Ok(f) => f,
			Err(e) => {
				self.hard_slots.add_permits(1);
				if e.kind() == std::io::ErrorKind::AlreadyExists {
					return Err(Error::Exists);
				}
				return Err(e.into());
			}
		};

		let fut = CacheBlockFuture::new(key, flags);
		self.ongoing.write().unwrap().insert(key);
		self.pending.lock().unwrap().push(PendingWrite {
			key,
			file,
			data,
			flags,
			fut: fut.clone(),
		});
		self.work_notify.notify_one();

		Ok(fut)
	}

	// ---- worker internals (driven by CacheWorker, callable from tests) ----

	pub(crate) async fn notified(&self) {
		self.work_notify.notified().await
	}

	pub(crate) fn has_queued_work(&self) -> bool {
		!self.pending.lock().unwrap().is_empty()
			|| !self.promotes.lock().unwrap().is_empty()
			|| !self.evicts.lock().unwrap().is_empty()
			|| self.num_blocks() > self.soft_limit
	}

	/// One worker pass: drain pending writes, then do LRU maintenance.
	/// Returns the number of operations performed.
	pub async fn tick(&self) -> usize {
		let pending = std::mem::take(&mut *self.pending.lock().unwrap());
		let mut ops = pending.len();

		let mut new_writes = Vec::with_capacity(pending.len());
		for w in pending {
			if let Some(key) = self.write_one(w).await {
				new_writes.push(key);
			}
		}

		ops += self.lru_maintenance(new_writes).await;
		ops
	}

	async fn write_one(&self, mut w: PendingWrite) -> Option<CacheKey> {
		let write_res = async {
			w.file.write_all(&w.data).await?;
			w.file.flush().await?;
			Ok::<_, std::io::Error>(())
		}
		.await;

		// no longer an ongoing write either way; on success the block
		// must be readable before the future is observable as finalized
		self.ongoing.write().unwrap().remove(&w.key);

		match write_res {
			Ok(()) => {
				self.num_blocks_written.fetch_add(1, Ordering::SeqCst);
				self.metrics.add_bytes_written(w.data.len() as u64);
				let data = if w.flags & (CACHE_FLAG_DETACHED | CACHE_FLAG_UNSHARED) != 0 {
					None
				} else {
					Some(w.data.clone())
				};
				w.fut.inner.finalize(CacheWriteResult {
					key: w.key,
					data,
					error: None,
				});
				Some(w.key)
			}
			Err(e) => {
				warn!("Cache write for block {} failed: {}", w.key, e);
				// the file was never durable, remove it
				let _ = tokio::fs::remove_file(self.block_path(&w.key)).await;
				self.remove_empty_parents(w.key.file_id, w.key.file_version)
					.await;
				self.hard_slots.add_permits(1);
				self.metrics.add_write_error();
				w.fut.inner.finalize(CacheWriteResult {
					key: w.key,
					data: None,
					error: Some(CacheWriteError::Io(e.kind())),
				});
				None
			}
		}
	}

	/// Apply queued promotions and evictions, append new writes to the MRU
	/// tail, then evict down to the soft limit.
	async fn lru_maintenance(&self, new_writes: Vec<CacheKey>) -> usize {
		let victims = {
			let mut lru = self.lru.lock().unwrap();

			let promotes = std::mem::take(&mut *self.promotes.lock().unwrap());
			for key in promotes {
				if let Some(pos) = lru.iter().position(|k| *k == key) {
					lru.remove(pos);
					lru.push_back(key);
				}
			}

			for key in new_writes {
				lru.push_back(key);
			}

			let mut victims = std::mem::take(&mut *self.evicts.lock().unwrap());
			for v in victims.iter() {
				if let Some(pos) = lru.iter().position(|k| k == v) {
					lru.remove(pos);
				}
			}

			let mut projected = self.num_blocks();
			while projected > self.soft_limit {
				match lru.pop_front() {
					Some(key) => {
						victims.push(key);
						projected -= 1;
					}
					None => break,
				}
			}

			victims
		};

		let n = victims.len();
		for key in victims {
			self.evict_one(key).await;
		}
		n
	}

	async fn evict_one(&self, key: CacheKey) {
		match tokio::fs::remove_file(self.block_path(&key)).await {
			Ok(()) => {
				self.num_blocks_written.fetch_sub(1, Ordering::SeqCst);
				self.hard_slots.add_permits(1);
				self.metrics.add_eviction();
				self.remove_empty_parents(key.file_id, key.file_version).await;
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				// stale LRU entry (reversioned or already evicted)
			}
			Err(e) => {
				// drop the key from the LRU; a later hit reinserts it
				error!("Could not evict cached block {}: {}", key, e);
				self.metrics.add_eviction_error();
			}
		}
	}

	// ---- read path ----

	/// A block is readable once its write has completed and it has not
	/// been evicted
	pub async fn is_block_readable(&self, key: &CacheKey) -> bool {
		if self.ongoing.read().unwrap().contains(key) {
			return false;
		}
		tokio::fs::metadata(self.block_path(key)).await.is_ok()
	}

	pub async fn open_block(&self, key: &CacheKey) -> Result<tokio::fs::File, Error> {
		if self.ongoing.read().unwrap().contains(key) {
			return Err(Error::Busy);
		}
		match tokio::fs::File::open(self.block_path(key)).await {
			Ok(f) => Ok(f),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
			Err(e) => Err(e.into()),
		}
	}

	pub async fn read_block(file: &mut tokio::fs::File) -> Result<Bytes, Error> {
		let mut data = vec![];
		file.read_to_end(&mut data).await?;
		Ok(data.into())
	}

	pub async fn read_cached_block(&self, key: &CacheKey) -> Result<Bytes, Error> {
		let mut f = self.open_block(key).await?;
		let data = Self::read_block(&mut f).await?;
		self.metrics.add_bytes_read(data.len() as u64);
		Ok(data)
	}

	pub async fn stat_block(&self, key: &CacheKey) -> Result<std::fs::Metadata, Error> {
		match tokio::fs::metadata(self.block_path(key)).await {
			Ok(md) => Ok(md),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
			Err(e) => Err(e.into()),
		}
	}

	// ---- eviction and promotion ----

	/// Synchronous eviction: the block is gone when this returns
	pub async fn evict_block(&self, key: &CacheKey) {
		{
			let mut lru = self.lru.lock().unwrap();
			if let Some(pos) = lru.iter().position(|k| k == key) {
				lru.remove(pos);
			}
		}
		self.evict_one(*key).await;
	}

	/// Queue the block for eviction on the next worker pass
	pub fn evict_block_async(&self, key: &CacheKey) {
		self.evicts.lock().unwrap().push(*key);
		self.work_notify.notify_one();
	}

	/// Queue the block for promotion to the MRU tail
	pub fn promote_block(&self, key: &CacheKey) {
		self.promotes.lock().unwrap().push(*key);
		self.work_notify.notify_one();
	}

	/// Unlink every cached block of one file version
	pub async fn evict_file(&self, file_id: FileId, file_version: FileVersion) -> Result<(), Error> {
		let dir = self.file_dir(file_id, file_version);
		let mut rd = match tokio::fs::read_dir(&dir).await {
			Ok(rd) => rd,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		};

		while let Some(ent) = rd.next_entry().await? {
			match tokio::fs::remove_file(ent.path()).await {
				Ok(()) => {
					self.num_blocks_written.fetch_sub(1, Ordering::SeqCst);
					self.hard_slots.add_permits(1);
					self.metrics.add_eviction();
				}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
				Err(e) => return Err(e.into()),
			}
		}
		self.remove_empty_parents(file_id, file_version).await;

		self.lru
			.lock()
			.unwrap()
			.retain(|k| !(k.file_id == file_id && k.file_version == file_version));
		Ok(())
	}

	/// Rename the file's on-disk version directory and reinsert its blocks
	/// into the LRU under the new version. Stale entries for the old
	/// version age out of the LRU on their own.
	pub async fn reversion_file(
		&self,
		file_id: FileId,
		old_version: FileVersion,
		new_version: FileVersion,
	) -> Result<(), Error> {
		let old_dir = self.file_dir(file_id, old_version);
		let new_dir = self.file_dir(file_id, new_version);

		match tokio::fs::rename(&old_dir, &new_dir).await {
			Ok(()) => (),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		}

		let mut reinserted = vec![];
		let mut rd = tokio::fs::read_dir(&new_dir).await?;
		while let Some(ent) = rd.next_entry().await? {
			let name = match ent.file_name().into_string() {
				Ok(n) => n,
				Err(_) => continue,
			};
			if let Some((block_id, block_version)) = Self::parse_block_name(&name) {
				reinserted.push(CacheKey::new(file_id, new_version, block_id, block_version));
			}
		}

		let mut lru = self.lru.lock().unwrap();
		for key in reinserted {
			lru.push_back(key);
		}
		Ok(())
	}
}
