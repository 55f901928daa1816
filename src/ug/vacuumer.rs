//! The vacuumer: a background task that reclaims orphaned writes named by
//! a file's vacuum log on the MS, and removes log rows whose data is gone.
//! Requests are inserted into a pending set that is swapped into the
//! working set each loop tick.
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use syndicate_util::background::worker::{Worker, WorkerStatus};
use syndicate_util::background::BackgroundRunner;
use syndicate_util::error::{Error, OkOrMessage};

use crate::core::FsCore;
use crate::fent::FentSnapshot;
use crate::replication::wait_replicas;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumRequestType {
	/// Reclaim the replicas of an orphaned write found in the vacuum log
	Write,
	/// Only remove the vacuum-log row (the data is already gone)
	LogEntry,
}

#[derive(Debug, Clone)]
pub struct VacuumRequest {
	pub rtype: VacuumRequestType,
	pub fs_path: String,
	pub snapshot: FentSnapshot,
}

impl VacuumRequest {
	fn dedup_key(&self) -> (VacuumRequestType, u64, (i64, u32)) {
		(
			self.rtype,
			self.snapshot.file_id,
			self.snapshot.manifest_mtime,
		)
	}
}

pub struct Vacuumer {
	core: Weak<FsCore>,
	pending: Mutex<Vec<VacuumRequest>>,
	notify: Notify,
}

impl Vacuumer {
	pub fn new(core: &Arc<FsCore>) -> Arc<Self> {
		let vac = Arc::new(Self {
			core: Arc::downgrade(core),
			pending: Mutex::new(Vec::new()),
			notify: Notify::new(),
		});
		core.set_vacuumer(vac.clone());
		vac
	}

	pub fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) {
		bg.spawn_worker(VacuumWorker { vac: self.clone() });
	}

	fn insert(&self, req: VacuumRequest) {
		let mut pending = self.pending.lock().unwrap();
		if !pending.iter().any(|r| r.dedup_key() == req.dedup_key()) {
			pending.push(req);
		}
		drop(pending);
		self.notify.notify_one();
	}

	/// Reclaim this write's replicas in the background
	pub fn write_bg(&self, fs_path: &str, snapshot: FentSnapshot) {
		self.insert(VacuumRequest {
			rtype: VacuumRequestType::Write,
			fs_path: fs_path.to_string(),
			snapshot,
		});
	}

	/// Remove this write's vacuum-log row in the background
	pub fn log_entry_bg(&self, fs_path: &str, snapshot: FentSnapshot) {
		self.insert(VacuumRequest {
			rtype: VacuumRequestType::LogEntry,
			fs_path: fs_path.to_string(),
			snapshot,
		});
	}

	pub(crate) fn take_pending(&self) -> Vec<VacuumRequest> {
		std::mem::take(&mut *self.pending.lock().unwrap())
	}

	pub(crate) async fn notified(&self) {
		self.notify.notified().await
	}

	pub fn pending_len(&self) -> usize {
		self.pending.lock().unwrap().len()
	}

	async fn process(&self, req: &VacuumRequest) -> Result<(), Error> {
		let core = self
			.core
			.upgrade()
			.ok_or_message("gateway state torn down")?;
		match req.rtype {
			VacuumRequestType::LogEntry => {
				core.ms
					.remove_vacuum_log_entry(
						&req.snapshot.to_ms_entry(),
						req.snapshot.manifest_mtime.0,
						req.snapshot.manifest_mtime.1,
					)
					.await
			}
			VacuumRequestType::Write => {
				vacuum_log_entries(&core, &req.fs_path, &req.snapshot, false).await
			}
		}
	}
}

/// Walk the file's vacuum log from the oldest entry, deleting each
/// write's blocks and manifest from the RGs and then dropping the log row.
/// Stops at the entry describing the file's live manifest unless
/// `include_head` (unlink reclaims everything).
pub async fn vacuum_log_entries(
	core: &Arc<FsCore>,
	fs_path: &str,
	snapshot: &FentSnapshot,
	include_head: bool,
) -> Result<(), Error> {
	loop {
		let entry = match core.ms.peek_vacuum_log(snapshot.file_id).await? {
			None => return Ok(()),
			Some(e) => e,
		};

		if !include_head {
			// the head of the log describes the live write; keep it
			let head_mtime = match core.get_fent(snapshot.file_id) {
				Some(fent) => {
					let st = fent.lock.read().await;
					Some(st.manifest.mtime())
				}
				None => None,
			};
			if head_mtime == Some((entry.manifest_mtime_sec, entry.manifest_mtime_nsec)) {
				return Ok(());
			}
		}

		// one log row: delete its blocks, then its manifest, then the row
		let mut gc_snapshot = snapshot.clone();
		gc_snapshot.file_version = entry.file_version;
		gc_snapshot.manifest_mtime = (entry.manifest_mtime_sec, entry.manifest_mtime_nsec);

		let mut futs = vec![];
		for (block_id, block_version) in entry.affected_blocks.iter() {
			futs.push(
				core.rg
					.delete_block(&gc_snapshot, *block_id, *block_version, None),
			);
		}
		futs.push(
			core.rg
				.delete_manifest(&gc_snapshot, gc_snapshot.manifest_mtime, None),
		);
		wait_replicas(&futs).await?;

		core.ms
			.remove_vacuum_log_entry(
				&gc_snapshot.to_ms_entry(),
				entry.manifest_mtime_sec,
				entry.manifest_mtime_nsec,
			)
			.await?;

		debug!(
			"Vacuumed write {}.{} of {}",
			entry.manifest_mtime_sec, entry.manifest_mtime_nsec, fs_path
		);
	}
}

pub struct VacuumWorker {
	vac: Arc<Vacuumer>,
}

#[async_trait]
impl Worker for VacuumWorker {
	fn name(&self) -> String {
		"Vacuumer".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let batch = self.vac.take_pending();
		if batch.is_empty() {
			return Ok(WorkerStatus::Idle);
		}
		let mut rc = Ok(WorkerStatus::Busy);
		for req in batch {
			if let Err(e) = self.vac.process(&req).await {
				warn!(
					"Vacuum request for {} failed, requeueing: {}",
					req.fs_path, e
				);
				self.vac.insert(req);
				// surface the error so the processor backs off before the
				// requeued request is retried
				rc = Err(e);
			}
		}
		rc
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		self.vac.notified().await;
		WorkerStatus::Busy
	}
}
