use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::FutureExt;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::select;
use tokio::sync::{mpsc, watch};

use crate::error::Error;

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum WorkerStatus {
	Busy,
	Idle,
	Done,
}

#[async_trait]
pub trait Worker: Send {
	fn name(&self) -> String;

	/// Do one unit of work if any is queued, or return Idle immediately.
	/// This future is only interrupted at shutdown, after the drain
	/// deadline. An error is logged and work() is retried after a pause.
	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error>;

	/// Await the arrival of more work. May be interrupted at any point;
	/// the processor handles watching must_exit for you.
	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus;
}

pub(crate) struct WorkerProcessor {
	stop_signal: watch::Receiver<bool>,
	worker_chan: mpsc::UnboundedReceiver<Box<dyn Worker>>,
}

impl WorkerProcessor {
	pub(crate) fn new(
		worker_chan: mpsc::UnboundedReceiver<Box<dyn Worker>>,
		stop_signal: watch::Receiver<bool>,
	) -> Self {
		Self {
			stop_signal,
			worker_chan,
		}
	}

	pub(crate) async fn run(&mut self) {
		let mut workers = FuturesUnordered::new();
		let mut next_task_id = 1;

		while !*self.stop_signal.borrow() {
			let await_next_worker = async {
				if workers.is_empty() {
					futures::future::pending().await
				} else {
					workers.next().await
				}
			};
			select! {
				new_worker_opt = self.worker_chan.recv() => {
					if let Some(new_worker) = new_worker_opt {
						let task_id = next_task_id;
						next_task_id += 1;
						let mut handler = WorkerHandler {
							task_id,
							stop_signal: self.stop_signal.clone(),
							worker: new_worker,
							status: WorkerStatus::Busy,
						};
						workers.push(async move {
							handler.step().await;
							handler
						}.boxed());
					}
				}
				worker = await_next_worker => {
					if let Some(mut handler) = worker {
						if handler.status == WorkerStatus::Done {
							info!("Worker {} (TID {}) exited", handler.worker.name(), handler.task_id);
						} else {
							workers.push(async move {
								handler.step().await;
								handler
							}.boxed());
						}
					}
				}
				_ = self.stop_signal.changed() => (),
			}
		}

		// Exiting. Give workers a grace period to finish their current
		// unit of work, then stop polling them.
		let drain_deadline = Instant::now() + Duration::from_secs(5);
		let drain_everything = async move {
			while let Some(mut handler) = workers.next().await {
				if handler.status == WorkerStatus::Done {
					info!(
						"Worker {} (TID {}) exited",
						handler.worker.name(),
						handler.task_id
					);
				} else if Instant::now() > drain_deadline {
					warn!(
						"Worker {} (TID {}) interrupted between iterations in state {:?}",
						handler.worker.name(),
						handler.task_id,
						handler.status
					);
				} else {
					workers.push(
						async move {
							handler.step().await;
							handler
						}
						.boxed(),
					);
				}
			}
		};

		select! {
			_ = drain_everything => {
				info!("All workers exited in time");
			}
			_ = tokio::time::sleep(Duration::from_secs(9)) => {
				error!("Some workers did not exit in time, cancelling them mid-work");
			}
		}
	}
}

struct WorkerHandler {
	task_id: usize,
	stop_signal: watch::Receiver<bool>,
	worker: Box<dyn Worker>,
	status: WorkerStatus,
}

impl WorkerHandler {
	async fn step(&mut self) {
		match self.status {
			WorkerStatus::Busy => {
				let mut must_exit = self.stop_signal.clone();
				match self.worker.work(&mut must_exit).await {
					Ok(s) => {
						self.status = s;
					}
					Err(e) => {
						error!(
							"Error in worker {} (TID {}): {}",
							self.worker.name(),
							self.task_id,
							e
						);
						// don't let a failing worker spin
						tokio::time::sleep(Duration::from_secs(10)).await;
					}
				}
			}
			WorkerStatus::Idle => {
				let mut stop_signal = self.stop_signal.clone();
				if *stop_signal.borrow() {
					select! {
						new_st = self.worker.wait_for_work(&stop_signal) => {
							self.status = new_st;
						}
						_ = tokio::time::sleep(Duration::from_secs(1)) => (),
					}
				} else {
					let wait_signal = self.stop_signal.clone();
					select! {
						new_st = self.worker.wait_for_work(&wait_signal) => {
							self.status = new_st;
						}
						_ = stop_signal.changed() => (),
					}
				}
			}
			WorkerStatus::Done => unreachable!(),
		}
	}
}
