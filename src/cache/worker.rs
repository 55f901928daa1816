use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use syndicate_util::background::worker::{Worker, WorkerStatus};
use syndicate_util::error::Error;

use crate::manager::BlockCache;

/// The single cache worker: drains pending writes, applies promotions and
/// evictions, and keeps the LRU under the soft limit
pub struct CacheWorker {
	cache: Arc<BlockCache>,
}

impl CacheWorker {
	pub fn new(cache: Arc<BlockCache>) -> Self {
		Self { cache }
	}
}

#[async_trait]
impl Worker for CacheWorker {
	fn name(&self) -> String {
		"Block cache worker".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let ops = self.cache.tick().await;
		if ops > 0 || self.cache.has_queued_work() {
			Ok(WorkerStatus::Busy)
		} else if !self.cache.is_running() {
			Ok(WorkerStatus::Done)
		} else {
			Ok(WorkerStatus::Idle)
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		self.cache.notified().await;
		WorkerStatus::Busy
	}
}
