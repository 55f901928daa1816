//! Runner for the gateway's long-lived background workers (cache writer,
//! downloader, MS uploader and view reloader, replica workers, vacuumer)

pub mod worker;

use core::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use worker::{Worker, WorkerProcessor};

/// Handle through which subsystems register their workers and fire
/// one-shot background jobs
pub struct BackgroundRunner {
	send_worker: mpsc::UnboundedSender<Box<dyn Worker>>,
}

impl BackgroundRunner {
	/// The returned join handle completes once every worker has drained
	/// after the stop signal flips to true.
	pub fn new(stop_signal: watch::Receiver<bool>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
		let (send_worker, worker_out) = mpsc::unbounded_channel::<Box<dyn Worker>>();

		let await_all_done = tokio::spawn(async move {
			WorkerProcessor::new(worker_out, stop_signal).run().await;
		});

		let bgrunner = Arc::new(Self { send_worker });
		(bgrunner, await_all_done)
	}

	pub fn spawn_worker<W>(&self, worker: W)
	where
		W: Worker + 'static,
	{
		self.send_worker
			.send(Box::new(worker))
			.ok()
			.expect("Could not put worker in queue");
	}

	/// Fire-and-forget job; errors are logged with the given label
	pub fn spawn<F>(&self, label: &'static str, job: F)
	where
		F: Future<Output = Result<(), crate::error::Error>> + Send + 'static,
	{
		tokio::spawn(async move {
			if let Err(e) = job.await {
				error!("Background job {} failed: {}", label, e);
			}
		});
	}
}
