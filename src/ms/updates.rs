//! Pending-update queue: deferred metadata updates keyed by file, coalesced
//! in place, uploaded in batches when their deadlines expire
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use syndicate_util::background::worker::{Worker, WorkerStatus};
use syndicate_util::data::*;
use syndicate_util::error::Error;
use syndicate_util::time::now_msec;

use crate::client::MsClient;
use crate::msg::*;

/// How long a failed batch waits before it is retried
const UPLOAD_RETRY_DELAY_MS: u64 = 30_000;

struct QueuedUpdate {
	update: MsUpdate,
	deadline_ms: u64,
}

type UpdateKey = (VolumeId, FileId);

fn key_of(update: &MsUpdate) -> UpdateKey {
	(update.entry.volume_id, update.entry.file_id)
}

#[derive(Default)]
pub struct UpdateQueue {
	inner: Mutex<HashMap<UpdateKey, QueuedUpdate>>,
	wake: Notify,
}

impl UpdateQueue {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or coalesce. A second update for the same file replaces the
	/// first in place and pushes the deadline forward by
	/// `deadline_delta_ms`, so a steadily written file does not spam the
	/// MS.
	pub fn queue_update(&self, update: MsUpdate, deadline_ms: u64, deadline_delta_ms: u64) {
		let key = key_of(&update);
		let mut inner = self.inner.lock().unwrap();
		match inner.get_mut(&key) {
			Some(existing) => {
				existing.update = update;
				existing.deadline_ms += deadline_delta_ms;
			}
			None => {
				inner.insert(
					key,
					QueuedUpdate {
						update,
						deadline_ms,
					},
				);
			}
		}
		drop(inner);
		self.wake.notify_one();
	}

	pub fn clear_update(&self, volume_id: VolumeId, file_id: FileId) -> Option<MsUpdate> {
		self.inner
			.lock()
			.unwrap()
			.remove(&(volume_id, file_id))
			.map(|q| q.update)
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn next_deadline(&self) -> Option<u64> {
		self.inner
			.lock()
			.unwrap()
			.values()
			.map(|q| q.deadline_ms)
			.min()
	}

	/// Remove and return every update whose deadline has passed
	pub fn pop_expired(&self, now_ms: u64) -> Vec<MsUpdate> {
		let mut inner = self.inner.lock().unwrap();
		let expired: Vec<UpdateKey> = inner
			.iter()
			.filter(|(_, q)| q.deadline_ms <= now_ms)
			.map(|(k, _)| *k)
			.collect();
		expired
			.into_iter()
			.filter_map(|k| inner.remove(&k))
			.map(|q| q.update)
			.collect()
	}

	/// Put failed updates back, unless a newer update for the same file
	/// arrived in the meantime (in which case the failed one is obsolete)
	pub fn reinsert_if_not_superseded(&self, updates: Vec<MsUpdate>, deadline_ms: u64) -> usize {
		let mut inner = self.inner.lock().unwrap();
		let mut reinserted = 0;
		for update in updates {
			let key = key_of(&update);
			if !inner.contains_key(&key) {
				inner.insert(
					key,
					QueuedUpdate {
						update,
						deadline_ms,
					},
				);
				reinserted += 1;
			}
		}
		if reinserted > 0 {
			self.wake.notify_one();
		}
		reinserted
	}

	pub(crate) async fn wake_notified(&self) {
		self.wake.notified().await
	}
}

/// Uploader worker: sleeps until the nearest deadline, then uploads every
/// expired update as one signed batch
pub struct UpdateUploadWorker {
	client: Arc<MsClient>,
}

impl UpdateUploadWorker {
	pub fn new(client: Arc<MsClient>) -> Self {
		Self { client }
	}
}

#[async_trait]
impl Worker for UpdateUploadWorker {
	fn name(&self) -> String {
		"MS update uploader".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let now = now_msec();
		match self.client.updates.next_deadline() {
			Some(deadline) if deadline <= now => {
				let batch = self.client.updates.pop_expired(now);
				if batch.is_empty() {
					return Ok(WorkerStatus::Idle);
				}
				let n = batch.len();
				match self.client.post_update_batch(batch.clone()).await {
					Ok(_) => {
						debug!("Uploaded {} queued metadata updates", n);
						Ok(WorkerStatus::Busy)
					}
					Err(e) => {
						let kept = self
							.client
							.updates
							.reinsert_if_not_superseded(batch, now + UPLOAD_RETRY_DELAY_MS);
						warn!(
							"Failed to upload {} metadata updates ({} requeued): {}",
							n, kept, e
						);
						Err(e)
					}
				}
			}
			_ => Ok(WorkerStatus::Idle),
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		let sleep_for = match self.client.updates.next_deadline() {
			Some(deadline) => Duration::from_millis(deadline.saturating_sub(now_msec())),
			None => Duration::from_secs(3600),
		};
		tokio::select! {
			_ = tokio::time::sleep(sleep_for) => (),
			_ = self.client.updates.wake_notified() => (),
		}
		WorkerStatus::Busy
	}
}
