use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use syndicate_util::error::Error;

use crate::context::DownloadContext;

/// Groups download contexts so one waiter can be woken whenever any member
/// finalizes
pub struct DownloadSet {
	members: Mutex<Vec<Arc<DownloadContext>>>,
	notify: Notify,
}

impl DownloadSet {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			members: Mutex::new(Vec::new()),
			notify: Notify::new(),
		})
	}

	pub fn add(self: &Arc<Self>, ctx: &Arc<DownloadContext>) {
		*ctx.set.lock().unwrap() = Some(Arc::downgrade(self));
		self.members.lock().unwrap().push(ctx.clone());
	}

	pub fn clear(&self, ctx: &Arc<DownloadContext>) {
		*ctx.set.lock().unwrap() = None;
		self.members
			.lock()
			.unwrap()
			.retain(|m| !Arc::ptr_eq(m, ctx));
	}

	pub fn len(&self) -> usize {
		self.members.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn members(&self) -> Vec<Arc<DownloadContext>> {
		self.members.lock().unwrap().clone()
	}

	pub(crate) fn wake(&self) {
		self.notify.notify_one();
	}

	fn take_finalized(&self) -> Option<Arc<DownloadContext>> {
		self.members
			.lock()
			.unwrap()
			.iter()
			.find(|m| m.is_finalized())
			.cloned()
	}

	/// Wait until any member is finalized and return it. The context stays
	/// in the set; callers `clear` it once they have consumed the result.
	pub async fn wait_any(&self, timeout: Duration) -> Result<Arc<DownloadContext>, Error> {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			if let Some(ctx) = self.take_finalized() {
				return Ok(ctx);
			}
			if tokio::time::timeout_at(deadline, self.notify.notified())
				.await
				.is_err()
			{
				return Err(Error::Timeout);
			}
		}
	}
}
