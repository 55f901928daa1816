//! Gateway operations consumed by the front-end adapters (FUSE, HTTP,
//! IPC): open/create, read, write, fsync, truncate, rename, unlink and the
//! metadata-only operations.
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::StreamExt;

use syndicate_cache::CacheKey;
use syndicate_download::RequestSpec;
use syndicate_ms::{EntryType, GatewayCert, MsEntry};
use syndicate_util::data::*;
use syndicate_util::error::Error;
use syndicate_util::time::now_timespec;

use crate::coordinator::{post_writemsg, WriteMsg, WriteMsgKind};
use crate::core::FsCore;
use crate::fent::*;
use crate::manifest::download_manifest;
use crate::sync;
use crate::url;
use crate::vacuumer::vacuum_log_entries;

/// Default deadline for queued metadata-only updates
const MS_UPDATE_DEADLINE_MS: u64 = 5_000;
const MS_UPDATE_DELTA_MS: u64 = 1_000;

/// Largest manifest we will accept from a peer
const MANIFEST_MAX_LEN: usize = 16 << 20;

// ---- create / mkdir / open ----

fn new_entry_template(
	core: &FsCore,
	entry_type: EntryType,
	parent_id: FileId,
	name: &str,
	mode: u32,
) -> MsEntry {
	let now = now_timespec();
	MsEntry {
		file_id: 0,
		entry_type,
		name: name.to_string(),
		parent_id,
		file_version: 1,
		write_nonce: 0,
		coordinator_id: core.gateway_id,
		owner_id: core.owner_id,
		volume_id: core.volume_id,
		mode,
		size: 0,
		mtime_sec: now.0,
		mtime_nsec: now.1,
		ctime_sec: now.0,
		ctime_nsec: now.1,
		manifest_mtime_sec: now.0,
		manifest_mtime_nsec: now.1,
	}
}

async fn attach_child(core: &FsCore, parent: &Arc<Fent>, entry: &MsEntry) -> Arc<Fent> {
	let fent = core.ensure_fent(entry);
	let mut pst = parent.lock.write().await;
	if let Some(children) = pst.children.as_mut() {
		children.insert(entry.name.clone(), entry.file_id);
	}
	fent
}

/// Create a file on the MS (which assigns its id) and open it
pub async fn create(core: &Arc<FsCore>, fs_path: &str, mode: u32) -> Result<FileHandle, Error> {
	let (parent_path, name) = FsCore::split_path(fs_path)?;
	let parent = core.resolve(parent_path).await?;
	let parent_id = parent.file_id;

	let template = new_entry_template(core, EntryType::File, parent_id, name, mode);
	let created = core.ms.create(&template).await?;

	let fent = attach_child(core, &parent, &created).await;
	{
		// we coordinate a file we just created; its manifest starts empty
		let mut st = fent.lock.write().await;
		st.manifest_initialized = true;
	}
	Ok(FileHandle::new(fent, fs_path.to_string(), false))
}

pub async fn mkdir(core: &Arc<FsCore>, fs_path: &str, mode: u32) -> Result<(), Error> {
	let (parent_path, name) = FsCore::split_path(fs_path)?;
	let parent = core.resolve(parent_path).await?;
	let parent_id = parent.file_id;

	let template = new_entry_template(core, EntryType::Directory, parent_id, name, mode);
	let created = core.ms.mkdir(&template).await?;
	attach_child(core, &parent, &created).await;
	Ok(())
}

pub async fn open(core: &Arc<FsCore>, fs_path: &str, read_only: bool) -> Result<FileHandle, Error> {
	let fent = core.resolve(fs_path).await?;
	{
		let st = fent.lock.read().await;
		if st.is_dir() {
			return Err(Error::InvalidRequest(format!("{} is a directory", fs_path)));
		}
		if st.deleted {
			return Err(Error::NotFound);
		}
	}
	Ok(FileHandle::new(fent, fs_path.to_string(), read_only))
}

// ---- manifest acquisition ----

/// Make sure the fent has a live manifest, fetching it from the
/// coordinator when the local one is missing or suspect
pub async fn ensure_manifest(core: &Arc<FsCore>, fs_path: &str, fent: &Arc<Fent>) -> Result<(), Error> {
	let (needs, coordinator_id, file_version, mtime, file_id) = {
		let st = fent.lock.read().await;
		(
			!st.manifest_initialized || st.read_stale,
			st.coordinator_id,
			st.file_version,
			st.manifest.mtime(),
			st.file_id,
		)
	};
	if !needs {
		return Ok(());
	}

	if coordinator_id == core.gateway_id {
		// we are authoritative; nothing to fetch
		let mut st = fent.lock.write().await;
		st.manifest_initialized = true;
		st.read_stale = false;
		return Ok(());
	}

	let cert = core.cert_for(coordinator_id)?;
	let murl = url::manifest_url(&cert, core.volume_id, fs_path, file_version, mtime);
	let msg = download_manifest(&core.downloader, core.driver.as_ref(), &murl, MANIFEST_MAX_LEN)
		.await?;

	// the manifest is signed by whoever wrote it; verify before trusting
	let writer_cert = core.cert_for(msg.writer_id)?;
	syndicate_util::crypto::verify_message(&msg, &writer_cert.public_key)
		.map_err(|_| Error::BadSignature(msg.writer_id))?;

	if msg.file_id != file_id || msg.volume_id != core.volume_id {
		return Err(Error::InvalidRequest(
			"manifest does not describe the requested file".into(),
		));
	}

	let mut st = fent.lock.write().await;
	// a fetched manifest older than what we already hold must not win
	if st.manifest_initialized && !msg.to_manifest().is_newer_than(st.manifest.mtime()) {
		st.read_stale = false;
		return Ok(());
	}
	st.manifest = msg.to_manifest();
	st.size = msg.size;
	st.file_version = msg.file_version;
	st.manifest_initialized = true;
	st.read_stale = false;
	Ok(())
}

// ---- read path ----

/// Fetch one block from its writer, falling back to the coordinator and
/// then the RGs
async fn fetch_remote_block(
	core: &Arc<FsCore>,
	snapshot: &FentSnapshot,
	fs_path: &str,
	block_id: BlockId,
	block_version: BlockVersion,
	writer_id: GatewayId,
) -> Result<Bytes, Error> {
	let mut candidates: Vec<GatewayCert> = vec![];
	if let Ok(c) = core.cert_for(writer_id) {
		candidates.push(c);
	}
	if snapshot.coordinator_id != writer_id {
		if let Ok(c) = core.cert_for(snapshot.coordinator_id) {
			candidates.push(c);
		}
	}
	candidates.extend(core.rg_list()?);

	let mut last_err = Error::NotFound;
	for cert in candidates {
		let target = url::block_url(
			&cert,
			core.volume_id,
			fs_path,
			snapshot.file_version,
			block_id,
			block_version,
		);
		let mut request = RequestSpec::get(target);
		if let Err(e) = core.driver.connect_cache(&mut request) {
			return Err(e);
		}
		let mut res = core
			.downloader
			.run_once(request, core.blocksize as usize)
			.await;

		// the peer may 302 us to a newer version of the data
		if res.http_status == 302 {
			if let Some(location) = res.location.clone() {
				let target = url::resolve_location(&res.effective_url, &location);
				res = core
					.downloader
					.run_once(RequestSpec::get(target), core.blocksize as usize)
					.await;
			}
		}

		match res.interpret_errors() {
			Ok(()) if res.http_status == 200 => {
				return core.driver.read_block(snapshot, res.data).await;
			}
			Ok(()) => last_err = Error::RemoteHttp(res.http_status),
			Err(e) => last_err = e,
		}
	}
	Err(last_err)
}

/// Read up to `len` bytes at `offset`. Consults buffered writes, then the
/// cache, then the peer network; fetched blocks are inserted into the
/// cache on the way back.
pub async fn read(
	core: &Arc<FsCore>,
	fh: &FileHandle,
	offset: u64,
	len: usize,
) -> Result<Bytes, Error> {
	ensure_manifest(core, &fh.fs_path, &fh.fent).await?;

	let bs = core.blocksize;
	let (snapshot, size) = {
		let st = fh.fent.lock.read().await;
		(st.snapshot(core.gateway_id, &fh.fs_path), st.size)
	};

	if offset >= size || len == 0 {
		return Ok(Bytes::new());
	}
	let len = len.min((size - offset) as usize);
	let first_block = offset / bs;
	let last_block = (offset + len as u64 - 1) / bs;

	// gather what we can locally, remember what must be fetched
	let mut assembled: Vec<Option<Bytes>> = vec![None; (last_block - first_block + 1) as usize];
	let mut missing: Vec<(BlockId, BlockVersion, GatewayId)> = vec![];
	{
		let st = fh.fent.lock.read().await;
		for block_id in first_block..=last_block {
			let slot = (block_id - first_block) as usize;
			if let Some(buf) = st.bufferred_blocks.get(&block_id) {
				assembled[slot] = Some(Bytes::copy_from_slice(&buf.data));
				continue;
			}
			if let Some(db) = st.dirty_blocks.get(&block_id) {
				assembled[slot] = Some(db.data.clone());
				continue;
			}
			match st.manifest.blocks.get(&block_id) {
				Some(info) => {
					let key = CacheKey::new(
						st.file_id,
						st.file_version,
						block_id,
						info.block_version,
					);
					if let Ok(data) = core.cache.read_cached_block(&key).await {
						core.cache.promote_block(&key);
						assembled[slot] = Some(data);
					} else {
						missing.push((block_id, info.block_version, info.writer_id));
					}
				}
				// hole: unwritten range reads as zeroes
				None => assembled[slot] = Some(Bytes::from(vec![0u8; bs as usize])),
			}
		}
	}

	// fetch the rest from peers, a bounded number in flight
	if !missing.is_empty() {
		let mut fetches = futures::stream::iter(missing.into_iter().map(
			|(block_id, block_version, writer_id)| {
				let core2 = core.clone();
				let snapshot2 = snapshot.clone();
				let fs_path2 = fh.fs_path.clone();
				async move {
					let data = fetch_remote_block(
						&core2,
						&snapshot2,
						&fs_path2,
						block_id,
						block_version,
						writer_id,
					)
					.await?;
					Ok::<_, Error>((block_id, block_version, data))
				}
			},
		))
		.buffer_unordered(core.max_downloads.max(1));
		while let Some(fetched) = fetches.next().await {
			let (block_id, block_version, data) = fetched?;
			let slot = (block_id - first_block) as usize;

			// opportunistically cache what we fetched
			let key = CacheKey::new(
				snapshot.file_id,
				snapshot.file_version,
				block_id,
				block_version,
			);
			match core
				.cache
				.write_block_async(
					key,
					data.clone(),
					syndicate_cache::CACHE_FLAG_DETACHED | syndicate_cache::CACHE_FLAG_UNSHARED,
				)
				.await
			{
				Ok(_) | Err(Error::Exists) => (),
				Err(e) => debug!("Could not cache fetched block {}: {}", key, e),
			}

			assembled[slot] = Some(data);
		}
	}

	// splice the blocks into one buffer
	let mut out = BytesMut::with_capacity(len);
	for (i, block) in assembled.into_iter().enumerate() {
		let block = block.unwrap_or_default();
		let block_start = (first_block + i as u64) * bs;
		let from = offset.saturating_sub(block_start) as usize;
		let to = ((offset + len as u64).min(block_start + bs) - block_start) as usize;
		if from >= to {
			continue;
		}
		// a short block reads as zero-padded up to the requested range
		let mut piece = BytesMut::zeroed(to - from);
		if from < block.len() {
			let avail = (to.min(block.len())) - from;
			piece[..avail].copy_from_slice(&block[from..from + avail]);
		}
		out.extend_from_slice(&piece);
	}
	Ok(out.freeze())
}

// ---- write path ----

/// Pull a block's current content into a buffered block for partial
/// overwrite; zero-filled if the block was never written
async fn block_content_for_write(
	core: &Arc<FsCore>,
	fs_path: &str,
	st: &FentState,
	snapshot: &FentSnapshot,
	block_id: BlockId,
) -> Result<BytesMut, Error> {
	if let Some(db) = st.dirty_blocks.get(&block_id) {
		return Ok(BytesMut::from(&db.data[..]));
	}
	if let Some(info) = st.manifest.blocks.get(&block_id) {
		let key = CacheKey::new(st.file_id, st.file_version, block_id, info.block_version);
		if let Ok(data) = core.cache.read_cached_block(&key).await {
			return Ok(BytesMut::from(&data[..]));
		}
		let data = fetch_remote_block(
			core,
			snapshot,
			fs_path,
			block_id,
			info.block_version,
			info.writer_id,
		)
		.await?;
		return Ok(BytesMut::from(&data[..]));
	}
	Ok(BytesMut::new())
}

/// Buffer `data` at `offset`; nothing touches the network or disk until
/// the next fsync
pub async fn write(
	core: &Arc<FsCore>,
	fh: &FileHandle,
	offset: u64,
	data: &[u8],
) -> Result<usize, Error> {
	if fh.read_only {
		return Err(Error::Unauthorized("handle is read-only".into()));
	}
	if data.is_empty() {
		return Ok(0);
	}
	ensure_manifest(core, &fh.fs_path, &fh.fent).await?;

	let bs = core.blocksize;
	let mut st = fh.fent.lock.write().await;
	let snapshot = st.snapshot(core.gateway_id, &fh.fs_path);

	let first_block = offset / bs;
	let last_block = (offset + data.len() as u64 - 1) / bs;

	for block_id in first_block..=last_block {
		let block_start = block_id * bs;
		let from = offset.saturating_sub(block_start) as usize;
		let data_from = (block_start + from as u64 - offset) as usize;
		let to = (((offset + data.len() as u64).min(block_start + bs)) - block_start) as usize;

		if !st.bufferred_blocks.contains_key(&block_id) {
			let whole_block = from == 0 && to == bs as usize;
			let content = if whole_block {
				BytesMut::new()
			} else {
				block_content_for_write(core, &fh.fs_path, &st, &snapshot, block_id).await?
			};
			st.bufferred_blocks.insert(
				block_id,
				BufferedBlock {
					data: content,
					dirty: false,
				},
			);
		}

		let buf = st.bufferred_blocks.get_mut(&block_id).unwrap();
		if buf.data.len() < to {
			buf.data.resize(to, 0);
		}
		buf.data[from..to].copy_from_slice(&data[data_from..data_from + (to - from)]);
		buf.dirty = true;
	}

	st.size = st.size.max(offset + data.len() as u64);
	st.mtime = now_timespec();
	drop(st);

	fh.mark_dirty();
	Ok(data.len())
}

/// Flush this handle: replicate its dirty blocks and commit metadata
pub async fn fsync(core: &Arc<FsCore>, fh: &FileHandle) -> Result<(), Error> {
	sync::fsync_fh(core, fh).await
}

pub async fn close(core: &Arc<FsCore>, fh: &FileHandle) -> Result<(), Error> {
	fsync(core, fh).await
}

// ---- truncate ----

/// Apply a truncate with the fent already write-locked. Bumps the file
/// version, reshapes the manifest, reversions the cache, and (on the
/// coordinator) publishes the new metadata.
pub async fn truncate_locked(
	core: &Arc<FsCore>,
	fs_path: &str,
	st: &mut FentState,
	new_size: u64,
	forced_version: Option<FileVersion>,
) -> Result<(), Error> {
	let bs = core.blocksize;
	let old_version = st.file_version;
	let new_version = forced_version.unwrap_or_else(|| st.next_file_version());
	let keep_blocks = (new_size + bs - 1) / bs;

	for (block_id, info) in st.manifest.truncate_blocks(keep_blocks) {
		st.garbage_blocks
			.insert((block_id, info.block_version), info.writer_id);
	}
	st.bufferred_blocks.retain(|id, _| *id < keep_blocks);
	let dropped_dirty: Vec<BlockId> = st
		.dirty_blocks
		.keys()
		.copied()
		.filter(|id| *id >= keep_blocks)
		.collect();
	for block_id in dropped_dirty {
		if let Some(db) = st.dirty_blocks.remove(&block_id) {
			core.cache.evict_block_async(&CacheKey::new(
				st.file_id,
				old_version,
				block_id,
				db.block_version,
			));
		}
	}

	core.cache
		.reversion_file(st.file_id, old_version, new_version)
		.await?;

	st.file_version = new_version;
	st.size = new_size;
	st.mtime = now_timespec();
	st.manifest.file_version = new_version;
	st.manifest.size = new_size;
	st.manifest.set_mtime(now_timespec());

	if st.coordinator_id == core.gateway_id {
		let snapshot = st.snapshot(core.gateway_id, fs_path);
		let manifest_bytes = sync::build_signed_manifest(core, st).await?;
		core.rg
			.replicate_manifest(&snapshot, snapshot.manifest_mtime, manifest_bytes, None);
		core.ms.update(&snapshot.to_ms_entry()).await?;
	}
	Ok(())
}

pub async fn truncate(core: &Arc<FsCore>, fs_path: &str, new_size: u64) -> Result<(), Error> {
	let fent = core.resolve(fs_path).await?;
	ensure_manifest(core, fs_path, &fent).await?;

	let mut st = fent.lock.write().await;
	if st.coordinator_id == core.gateway_id {
		return truncate_locked(core, fs_path, &mut st, new_size, None).await;
	}

	// ask the coordinator to run the truncate
	let cert = core.cert_for(st.coordinator_id)?;
	let msg = WriteMsg::new(
		core,
		WriteMsgKind::Truncate {
			new_size,
			new_version: 0,
		},
		st.file_id,
		st.file_version,
		fs_path,
		st.write_nonce,
	)
	.signed(core)?;

	match post_writemsg(core, &cert, fs_path, &msg).await? {
		None => {
			// coordinator unreachable: take over and truncate locally
			st.coordinator_id = core.gateway_id;
			truncate_locked(core, fs_path, &mut st, new_size, None).await
		}
		Some(reply) => match reply.kind {
			WriteMsgKind::Accepted { .. } => {
				// adopt the version the coordinator picked
				let old_version = st.file_version;
				core.cache
					.reversion_file(st.file_id, old_version, reply.file_version)
					.await?;
				st.file_version = reply.file_version;
				st.size = new_size;
				st.manifest_initialized = false;
				Ok(())
			}
			WriteMsgKind::Error { code } if code == -116 => {
				st.read_stale = true;
				Err(Error::Stale)
			}
			other => Err(Error::InvalidRequest(format!(
				"unexpected truncate reply {:?}",
				other
			))),
		},
	}
}

// ---- metadata-only operations ----

pub async fn stat(core: &Arc<FsCore>, fs_path: &str) -> Result<MsEntry, Error> {
	let fent = core.resolve(fs_path).await?;
	let refetch = {
		let st = fent.lock.read().await;
		st.read_stale
	};
	if refetch {
		let fresh = core.ms.get_entry(fent.file_id).await?;
		let mut st = fent.lock.write().await;
		st.size = fresh.size;
		st.mode = fresh.mode;
		st.mtime = (fresh.mtime_sec, fresh.mtime_nsec);
		st.write_nonce = fresh.write_nonce;
		st.coordinator_id = fresh.coordinator_id;
		if st.file_version != fresh.file_version {
			st.file_version = fresh.file_version;
			st.manifest_initialized = false;
		}
		st.read_stale = false;
	}
	let st = fent.lock.read().await;
	Ok(st.snapshot(core.gateway_id, fs_path).to_ms_entry())
}

pub async fn readdir(core: &Arc<FsCore>, fs_path: &str) -> Result<Vec<(String, FileId)>, Error> {
	let dir = core.resolve(fs_path).await?;
	{
		let st = dir.lock.read().await;
		if !st.is_dir() {
			return Err(Error::InvalidRequest(format!("{} is not a directory", fs_path)));
		}
	}
	let listing = core.ms.get_listing(dir.file_id).await?;
	let mut st = dir.lock.write().await;
	let children = st
		.children
		.as_mut()
		.ok_or_else(|| Error::InvalidRequest(format!("{} is not a directory", fs_path)))?;
	children.clear();
	for entry in listing.iter() {
		children.insert(entry.name.clone(), entry.file_id);
	}
	let out = children.iter().map(|(n, id)| (n.clone(), *id)).collect();
	drop(st);
	for entry in listing.iter() {
		core.ensure_fent(entry);
	}
	Ok(out)
}

pub async fn chmod(core: &Arc<FsCore>, fs_path: &str, mode: u32) -> Result<(), Error> {
	let fent = core.resolve(fs_path).await?;
	let entry = {
		let mut st = fent.lock.write().await;
		st.mode = mode;
		st.snapshot(core.gateway_id, fs_path).to_ms_entry()
	};
	core.ms.queue_update(
		entry,
		syndicate_util::time::now_msec() + MS_UPDATE_DEADLINE_MS,
		MS_UPDATE_DELTA_MS,
	);
	Ok(())
}

pub async fn utime(core: &Arc<FsCore>, fs_path: &str, mtime: (i64, u32)) -> Result<(), Error> {
	let fent = core.resolve(fs_path).await?;
	let entry = {
		let mut st = fent.lock.write().await;
		st.mtime = mtime;
		st.snapshot(core.gateway_id, fs_path).to_ms_entry()
	};
	core.ms.queue_update(
		entry,
		syndicate_util::time::now_msec() + MS_UPDATE_DEADLINE_MS,
		MS_UPDATE_DELTA_MS,
	);
	Ok(())
}

/// The wire protocol has no chown semantics
pub async fn chown(_core: &Arc<FsCore>, _fs_path: &str, _new_owner: UserId) -> Result<(), Error> {
	Err(Error::Unsupported("chown"))
}

pub async fn rename(core: &Arc<FsCore>, old_path: &str, new_path: &str) -> Result<(), Error> {
	let fent = core.resolve(old_path).await?;
	let (_, old_name) = FsCore::split_path(old_path)?;
	let (new_parent_path, new_name) = FsCore::split_path(new_path)?;
	let new_parent = core.resolve(new_parent_path).await?;

	let entry = {
		let st = fent.lock.read().await;
		st.snapshot(core.gateway_id, old_path).to_ms_entry()
	};
	core.ms
		.rename(&entry, new_parent.file_id, new_name.to_string())
		.await?;

	// fix up the in-core tree
	let old_parent_id = entry.parent_id;
	if let Some(old_parent) = core.get_fent(old_parent_id) {
		let mut pst = old_parent.lock.write().await;
		if let Some(children) = pst.children.as_mut() {
			children.remove(old_name);
		}
	}
	{
		let mut pst = new_parent.lock.write().await;
		if let Some(children) = pst.children.as_mut() {
			children.insert(new_name.to_string(), fent.file_id);
		}
	}
	let mut st = fent.lock.write().await;
	st.name = new_name.to_string();
	st.parent_id = new_parent.file_id;
	Ok(())
}

/// Unlink: reclaim every replicated write, detach the coordinator, delete
/// the MS record, drop local state
pub async fn unlink(core: &Arc<FsCore>, fs_path: &str) -> Result<(), Error> {
	let fent = core.resolve(fs_path).await?;
	let (snapshot, is_coordinator, file_version) = {
		let st = fent.lock.read().await;
		if st.is_dir() {
			return Err(Error::InvalidRequest(format!("{} is a directory", fs_path)));
		}
		(
			st.snapshot(core.gateway_id, fs_path),
			st.coordinator_id == core.gateway_id,
			st.file_version,
		)
	};

	// reclaim everything this file ever replicated, head included
	vacuum_log_entries(core, fs_path, &snapshot, true).await?;

	if !is_coordinator {
		if let Ok(cert) = core.cert_for(snapshot.coordinator_id) {
			let msg = WriteMsg::new(
				core,
				WriteMsgKind::Detach,
				snapshot.file_id,
				file_version,
				fs_path,
				snapshot.write_nonce,
			)
			.signed(core)?;
			// best effort: an unreachable coordinator learns of the
			// unlink from the MS
			if let Ok(None) = post_writemsg(core, &cert, fs_path, &msg).await {
				debug!("Coordinator unreachable for detach of {}", fs_path);
			}
		}
	}

	core.ms.delete(&snapshot.to_ms_entry()).await?;

	{
		let mut st = fent.lock.write().await;
		st.deleted = true;
	}
	let _ = core.cache.evict_file(snapshot.file_id, file_version).await;
	core.remove_fent(snapshot.file_id);

	let (parent_path, name) = FsCore::split_path(fs_path)?;
	if let Ok(parent) = core.resolve(parent_path).await {
		let mut pst = parent.lock.write().await;
		if let Some(children) = pst.children.as_mut() {
			children.remove(name);
		}
	}
	Ok(())
}
