//! Completion primitive shared by cache writes, downloads and replica
//! uploads: a slot that is finalized exactly once and can be awaited by any
//! number of waiters, with or without a timeout.
use std::time::Duration;

use tokio::sync::watch;

use crate::error::Error;

pub struct OpFuture<T: Clone + Send + Sync + 'static> {
	tx: watch::Sender<Option<T>>,
	rx: watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Default for OpFuture<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone + Send + Sync + 'static> OpFuture<T> {
	pub fn new() -> Self {
		let (tx, rx) = watch::channel(None);
		Self { tx, rx }
	}

	/// Store the result and wake all waiters. Returns false if the future
	/// was already finalized, in which case the result is unchanged.
	pub fn finalize(&self, value: T) -> bool {
		let mut value = Some(value);
		self.tx.send_if_modified(|slot| {
			if slot.is_none() {
				*slot = value.take();
				true
			} else {
				false
			}
		})
	}

	pub fn is_finalized(&self) -> bool {
		self.rx.borrow().is_some()
	}

	pub fn poll_value(&self) -> Option<T> {
		self.rx.borrow().clone()
	}

	pub async fn wait(&self) -> T {
		let mut rx = self.rx.clone();
		loop {
			if let Some(v) = rx.borrow_and_update().clone() {
				return v;
			}
			// the sender half lives in self, so changed() cannot fail here
			let _ = rx.changed().await;
		}
	}

	pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, Error> {
		match tokio::time::timeout(timeout, self.wait()).await {
			Ok(v) => Ok(v),
			Err(_) => Err(Error::Timeout),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	#[tokio::test]
	async fn test_finalize_exactly_once() {
		let fut = OpFuture::new();
		assert!(!fut.is_finalized());
		assert!(fut.finalize(1));
		assert!(!fut.finalize(2));
		assert_eq!(fut.poll_value(), Some(1));
		assert_eq!(fut.wait().await, 1);
	}

	#[tokio::test]
	async fn test_many_waiters() {
		let fut = Arc::new(OpFuture::new());
		let mut handles = vec![];
		for _ in 0..8 {
			let fut = fut.clone();
			handles.push(tokio::spawn(async move { fut.wait().await }));
		}
		tokio::task::yield_now().await;
		fut.finalize(7u32);
		for h in handles {
			assert_eq!(h.await.unwrap(), 7);
		}
	}

	#[tokio::test]
	async fn test_wait_timeout() {
		let fut: OpFuture<u32> = OpFuture::new();
		match fut.wait_timeout(Duration::from_millis(10)).await {
			Err(Error::Timeout) => (),
			other => panic!("expected timeout, got {:?}", other.map(|_| ())),
		}

		// zero timeout on an already-finalized future returns the result
		fut.finalize(3);
		assert_eq!(fut.wait_timeout(Duration::from_millis(0)).await.unwrap(), 3);
	}
}
