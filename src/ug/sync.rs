//! The write synchronization pipeline: flush dirty in-memory blocks to the
//! cache, replicate blocks and manifest to the RGs, commit metadata to the
//! MS in per-file fsync order, then garbage-collect what was superseded.
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use syndicate_cache::{flush_writes, CacheBlockFuture, CacheKey};
use syndicate_ms::MsEntry;
use syndicate_util::crypto;
use syndicate_util::data::*;
use syndicate_util::error::Error;
use syndicate_util::time::now_timespec;

use crate::coordinator::{remote_write_or_coordinate, RemoteWriteOutcome};
use crate::core::FsCore;
use crate::fent::*;
use crate::gc;
use crate::manifest::ManifestMsg;
use crate::replication::{wait_replicas, ReplicaContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
	Pending,
	Committed,
	Reverted,
}

/// Snapshot of a file taken at the instant a flush begins. Owns the maps
/// stolen off the fent; exactly one of commit or revert must dispose of it.
pub struct SyncContext {
	pub snapshot: FentSnapshot,
	pub md_entry: MsEntry,
	pub dirty_blocks: BTreeMap<BlockId, DirtyBlock>,
	pub garbage_blocks: BTreeMap<(BlockId, BlockVersion), GatewayId>,
	/// Versions this flush superseded, to GC once metadata commits
	pub old_blocks: BTreeMap<BlockId, (BlockVersion, GatewayId)>,
	pub replica_futs: Vec<Arc<ReplicaContext>>,
	pub slot: Arc<SyncQueueSlot>,
	disposition: Disposition,
}

impl SyncContext {
	fn mark_committed(&mut self) {
		self.disposition = Disposition::Committed;
	}

	fn mark_reverted(&mut self) {
		self.disposition = Disposition::Reverted;
	}
}

impl Drop for SyncContext {
	fn drop(&mut self) {
		debug_assert!(
			self.disposition != Disposition::Pending,
			"sync context dropped without commit or revert"
		);
	}
}

/// Serialize, sign and driver-transform the fent's current manifest
pub async fn build_signed_manifest(
	core: &FsCore,
	st: &FentState,
) -> Result<Bytes, Error> {
	let mut msg = ManifestMsg::from_manifest(
		&st.manifest,
		st.volume_id,
		st.file_id,
		st.owner_id,
		core.gateway_id,
	);
	crypto::sign_message(&mut msg, core.my_key())?;
	let bytes = Bytes::from(rmp_serde::to_vec_named(&msg)?);
	core.driver.write_manifest(bytes).await
}

/// Flush dirty buffered blocks into the cache, allocating fresh block
/// versions and advancing the manifest. Also repairs missing cache entries
/// for blocks left dirty by a previous reverted flush.
async fn flush_bufferred_blocks_async(
	core: &FsCore,
	fs_path: &str,
	st: &mut FentState,
) -> Result<(Vec<Arc<CacheBlockFuture>>, BTreeMap<BlockId, (BlockVersion, GatewayId)>), Error> {
	let mut cache_futs = vec![];
	let mut old_blocks = BTreeMap::new();
	let snapshot = st.snapshot(core.gateway_id, fs_path);

	let buffered = std::mem::take(&mut st.bufferred_blocks);
	for (block_id, buf) in buffered {
		if !buf.dirty {
			continue;
		}
		let block_version = st.next_block_version(block_id);
		let data = core.driver.write_block(&snapshot, buf.data.freeze()).await?;

		if let Some(old) = st.manifest.put_block(block_id, block_version, core.gateway_id) {
			old_blocks.insert(block_id, (old.block_version, old.writer_id));
		}

		let key = CacheKey::new(st.file_id, st.file_version, block_id, block_version);
		cache_futs.push(core.cache.write_block_async(key, data.clone(), 0).await?);
		st.dirty_blocks.insert(
			block_id,
			DirtyBlock {
				block_version,
				data,
			},
		);
	}

	// a previous revert may have left dirty blocks without cache entries
	for (block_id, db) in st.dirty_blocks.iter() {
		let key = CacheKey::new(st.file_id, st.file_version, *block_id, db.block_version);
		if !core.cache.is_block_readable(&key).await {
			match core.cache.write_block_async(key, db.data.clone(), 0).await {
				Ok(fut) => cache_futs.push(fut),
				Err(Error::Exists) => (),
				Err(e) => return Err(e),
			}
		}
	}

	st.manifest.size = st.size;
	st.manifest.file_version = st.file_version;
	Ok((cache_futs, old_blocks))
}

/// Phase 1: snapshot the fent, flush to cache, start asynchronous
/// replication. Returns None when there is nothing to replicate.
pub async fn sync_data_begin(
	core: &FsCore,
	fs_path: &str,
	st: &mut FentState,
) -> Result<Option<SyncContext>, Error> {
	let (cache_futs, old_blocks) = flush_bufferred_blocks_async(core, fs_path, st).await?;

	if st.dirty_blocks.is_empty() {
		return Ok(None);
	}

	// this write gets a fresh manifest timestamp
	st.manifest.set_mtime(now_timespec());
	let snapshot = st.snapshot(core.gateway_id, fs_path);
	let md_entry = snapshot.to_ms_entry();

	// steal the maps; subsequent writes race forward on empty ones
	let dirty_blocks = std::mem::take(&mut st.dirty_blocks);
	let garbage_blocks = std::mem::take(&mut st.garbage_blocks);

	if let Err(e) = flush_writes(&cache_futs).await {
		// cache write failed: put everything back and drop the cache
		// entries that did land
		for fut in cache_futs.iter() {
			core.cache.evict_block_async(&fut.key);
		}
		restore_stolen(st, dirty_blocks, garbage_blocks);
		return Err(e);
	}

	let mut sync_ctx = SyncContext {
		snapshot: snapshot.clone(),
		md_entry,
		dirty_blocks,
		garbage_blocks,
		old_blocks,
		replica_futs: vec![],
		slot: SyncQueueSlot::new(),
		disposition: Disposition::Pending,
	};

	// the coordinator also republishes the manifest
	if st.coordinator_id == core.gateway_id {
		let manifest_bytes = match build_signed_manifest(core, st).await {
			Ok(b) => b,
			Err(e) => {
				restore_stolen(
					st,
					std::mem::take(&mut sync_ctx.dirty_blocks),
					std::mem::take(&mut sync_ctx.garbage_blocks),
				);
				sync_ctx.mark_reverted();
				return Err(e);
			}
		};
		sync_ctx.replica_futs.push(core.rg.replicate_manifest(
			&snapshot,
			snapshot.manifest_mtime,
			manifest_bytes,
			None,
		));
	}

	for (block_id, db) in sync_ctx.dirty_blocks.iter() {
		sync_ctx.replica_futs.push(core.rg.replicate_block(
			&snapshot,
			*block_id,
			db.block_version,
			db.data.clone(),
			None,
		));
	}

	Ok(Some(sync_ctx))
}

fn restore_stolen(
	st: &mut FentState,
	dirty: BTreeMap<BlockId, DirtyBlock>,
	garbage: BTreeMap<(BlockId, BlockVersion), GatewayId>,
) {
	for (block_id, db) in dirty {
		// keep whatever a later write produced
		if st.manifest.block_version(block_id) == Some(db.block_version)
			&& !st.dirty_blocks.contains_key(&block_id)
			&& !st.bufferred_blocks.contains_key(&block_id)
		{
			st.dirty_blocks.insert(block_id, db);
		}
	}
	for (key, writer) in garbage {
		st.garbage_blocks.entry(key).or_insert(writer);
	}
}

/// Phase 3 failure path: merge unreplicated state back onto the fent
pub fn sync_data_revert(core: &FsCore, st: &mut FentState, sync_ctx: &mut SyncContext) {
	let dirty = std::mem::take(&mut sync_ctx.dirty_blocks);
	let garbage = std::mem::take(&mut sync_ctx.garbage_blocks);

	// drop cache entries of blocks that were superseded while we were
	// replicating; their dirty data is gone from the fent too
	for (block_id, db) in dirty.iter() {
		if st.manifest.block_version(*block_id) != Some(db.block_version) {
			let key = CacheKey::new(
				sync_ctx.snapshot.file_id,
				sync_ctx.snapshot.file_version,
				*block_id,
				db.block_version,
			);
			core.cache.evict_block_async(&key);
		}
	}

	restore_stolen(st, dirty, garbage);
	sync_ctx.mark_reverted();
}

fn enqueue_slot(st: &mut FentState, slot: &Arc<SyncQueueSlot>) {
	st.sync_queue.push_back(slot.clone());
	if st.sync_queue.len() == 1 {
		slot.turn.finalize(());
	}
}

fn remove_slot(st: &mut FentState, slot: &Arc<SyncQueueSlot>) {
	let was_head = st
		.sync_queue
		.front()
		.map(|s| Arc::ptr_eq(s, slot))
		.unwrap_or(false);
	st.sync_queue.retain(|s| !Arc::ptr_eq(s, slot));
	if was_head {
		if let Some(next) = st.sync_queue.front() {
			next.turn.finalize(());
		}
	}
}

/// Phase 6: pop our slot off the head and hand the metadata turn to the
/// next queued flush
fn pop_head_and_wake(st: &mut FentState, slot: &Arc<SyncQueueSlot>) {
	debug_assert!(st
		.sync_queue
		.front()
		.map(|s| Arc::ptr_eq(s, slot))
		.unwrap_or(false));
	st.sync_queue.pop_front();
	if let Some(next) = st.sync_queue.front() {
		next.turn.finalize(());
	}
}

/// Full fsync of one open handle
pub async fn fsync_fh(core: &Arc<FsCore>, fh: &FileHandle) -> Result<(), Error> {
	// Phase 0: nothing was written through this handle
	if !fh.is_dirty() {
		return Ok(());
	}

	let fent = &fh.fent;
	let fs_path = fh.fs_path.as_str();

	// Phase 1: begin data sync under the write lock
	let mut st = fent.lock.write().await;
	let mut sync_ctx = match sync_data_begin(core, fs_path, &mut st).await? {
		None => {
			fh.mark_clean();
			return Ok(());
		}
		Some(ctx) => ctx,
	};

	// Phase 2: queue for metadata order
	enqueue_slot(&mut st, &sync_ctx.slot);

	// Phase 3: release the fent so readers and later writers proceed,
	// then await replication
	drop(st);
	if let Err(e) = wait_replicas(&sync_ctx.replica_futs).await {
		let mut st = fent.lock.write().await;
		sync_data_revert(core, &mut st, &mut sync_ctx);
		remove_slot(&mut st, &sync_ctx.slot);
		return Err(e);
	}

	// wait for our turn to touch the MS
	sync_ctx.slot.turn.wait().await;

	// Phase 4: metadata sync
	let mut st = fent.lock.write().await;
	let version_bumped = st.file_version != sync_ctx.snapshot.file_version;
	let mut was_coordinator = st.coordinator_id == core.gateway_id;

	if !version_bumped {
		let affected: Vec<BlockId> = sync_ctx.dirty_blocks.keys().copied().collect();
		let metadata_rc = if was_coordinator {
			match core.ms.update_write(&sync_ctx.md_entry, affected).await {
				Ok(nonce) => {
					st.write_nonce = nonce;
					Ok(())
				}
				Err(e) => Err(e),
			}
		} else {
			match remote_write_or_coordinate(core, fs_path, &mut st, &sync_ctx).await {
				Ok(RemoteWriteOutcome::Done { write_nonce }) => {
					st.write_nonce = write_nonce;
					Ok(())
				}
				Ok(RemoteWriteOutcome::NowCoordinator) => {
					// we just became the coordinator: publish the manifest
					// synchronously, then take the coordinator path
					was_coordinator = true;
					let rc = async {
						let manifest_bytes = build_signed_manifest(core, &st).await?;
						let fut = core.rg.replicate_manifest(
							&sync_ctx.snapshot,
							sync_ctx.snapshot.manifest_mtime,
							manifest_bytes,
							None,
						);
						wait_replicas(&[fut]).await?;
						let affected: Vec<BlockId> =
							sync_ctx.dirty_blocks.keys().copied().collect();
						let nonce = core.ms.update_write(&sync_ctx.md_entry, affected).await?;
						Ok::<_, Error>(nonce)
					}
					.await;
					match rc {
						Ok(nonce) => {
							st.write_nonce = nonce;
							Ok(())
						}
						Err(e) => Err(e),
					}
				}
				Err(e) => {
					if let Error::Stale = e {
						st.read_stale = true;
					}
					Err(e)
				}
			}
		};

		if let Err(e) = metadata_rc {
			sync_data_revert(core, &mut st, &mut sync_ctx);
			remove_slot(&mut st, &sync_ctx.slot);
			return Err(e);
		}
	}

	// Phase 5: garbage-collect superseded data in the background
	let mut gc_garbage = std::mem::take(&mut sync_ctx.garbage_blocks);
	let gc_snapshot = if version_bumped {
		// an intervening truncate published newer metadata; everything
		// this flush replicated under the old version is garbage
		for (block_id, db) in sync_ctx.dirty_blocks.iter() {
			gc_garbage.insert((*block_id, db.block_version), core.gateway_id);
		}
		Some(sync_ctx.snapshot.clone())
	} else {
		for (block_id, (version, writer)) in sync_ctx.old_blocks.iter() {
			gc_garbage.insert((*block_id, *version), *writer);
		}
		st.old_snapshot.clone()
	};

	// never reclaim a version the current manifest still names
	gc_garbage.retain(|(block_id, version), _| {
		st.manifest.block_version(*block_id) != Some(*version)
	});

	if let Some(gc_snapshot) = gc_snapshot {
		if !gc_garbage.is_empty() || was_coordinator {
			let core2 = core.clone();
			let fs_path2 = fs_path.to_string();
			tokio::spawn(async move {
				if let Err(e) = gc::garbage_collect_kickoff(
					&core2,
					&fs_path2,
					gc_snapshot,
					gc_garbage,
					was_coordinator,
				)
				.await
				{
					warn!("Garbage collection kickoff failed for {}: {}", fs_path2, e);
				}
			});
		}
	}

	// Phase 6: this state is now the last successfully replicated one
	if !version_bumped {
		let mut new_snapshot = sync_ctx.snapshot.clone();
		new_snapshot.write_nonce = st.write_nonce;
		st.old_snapshot = Some(new_snapshot);
	}
	pop_head_and_wake(&mut st, &sync_ctx.slot);
	fh.mark_clean();
	sync_ctx.mark_committed();
	Ok(())
}
