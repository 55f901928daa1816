//! Replica client: an asynchronous queue of PUT/DELETE operations against
//! the volume's replica gateways, executed by a pool of workers, each with
//! an optional continuation for chained work (garbage collection)
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, Notify};

use syndicate_download::{Downloader, RequestSpec};
use syndicate_ms::MsClient;
use syndicate_util::background::worker::{Worker, WorkerStatus};
use syndicate_util::background::BackgroundRunner;
use syndicate_util::data::*;
use syndicate_util::error::Error;
use syndicate_util::future::OpFuture;

use crate::fent::FentSnapshot;
use crate::url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOp {
	Put,
	Delete,
}

/// What is being replicated or reclaimed
#[derive(Debug, Clone)]
pub enum ReplicaTarget {
	Block {
		block_id: BlockId,
		block_version: BlockVersion,
	},
	Manifest {
		mtime: (i64, u32),
	},
}

#[derive(Debug, Clone)]
pub struct ReplicaResult {
	/// None on success (at least one RG accepted), message otherwise
	pub error: Option<String>,
}

impl ReplicaResult {
	pub fn is_ok(&self) -> bool {
		self.error.is_none()
	}
}

pub type ReplicaCont = Box<dyn FnOnce(&ReplicaContext, &ReplicaResult) + Send>;

/// One pending RG operation
pub struct ReplicaContext {
	pub op: ReplicaOp,
	pub target: ReplicaTarget,
	pub snapshot: FentSnapshot,
	/// Payload for PUTs, empty for DELETEs
	pub payload: Bytes,
	pub result: OpFuture<ReplicaResult>,
	continuation: Mutex<Option<ReplicaCont>>,
}

impl ReplicaContext {
	fn new(
		op: ReplicaOp,
		target: ReplicaTarget,
		snapshot: FentSnapshot,
		payload: Bytes,
		continuation: Option<ReplicaCont>,
	) -> Arc<Self> {
		Arc::new(Self {
			op,
			target,
			snapshot,
			payload,
			result: OpFuture::new(),
			continuation: Mutex::new(continuation),
		})
	}

	pub async fn wait(&self) -> ReplicaResult {
		self.result.wait().await
	}
}

/// Await a batch of replica operations; EREMOTEIO semantics (first failure
/// reported after all settle)
pub async fn wait_replicas(ctxs: &[Arc<ReplicaContext>]) -> Result<(), Error> {
	let mut rc = Ok(());
	for ctx in ctxs.iter() {
		let res = ctx.wait().await;
		if let Some(msg) = res.error {
			if rc.is_ok() {
				rc = Err(Error::RemoteIo(msg));
			}
		}
	}
	rc
}

pub struct RgClient {
	ms: Arc<MsClient>,
	dl: Arc<Downloader>,
	queue: Mutex<VecDeque<Arc<ReplicaContext>>>,
	notify: Notify,
	running: AtomicBool,
}

impl RgClient {
	pub fn new(ms: Arc<MsClient>, dl: Arc<Downloader>) -> Arc<Self> {
		Arc::new(Self {
			ms,
			dl,
			queue: Mutex::new(VecDeque::new()),
			notify: Notify::new(),
			running: AtomicBool::new(true),
		})
	}

	pub fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner, n_workers: usize) {
		for index in 0..n_workers {
			bg.spawn_worker(ReplicaWorker {
				rg: self.clone(),
				index,
			});
		}
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	pub fn queue_len(&self) -> usize {
		self.queue.lock().unwrap().len()
	}

	fn enqueue(&self, ctx: Arc<ReplicaContext>) -> Arc<ReplicaContext> {
		self.queue.lock().unwrap().push_back(ctx.clone());
		self.notify.notify_one();
		ctx
	}

	// ---- operations ----

	pub fn replicate_block(
		&self,
		snapshot: &FentSnapshot,
		block_id: BlockId,
		block_version: BlockVersion,
		data: Bytes,
		continuation: Option<ReplicaCont>,
	) -> Arc<ReplicaContext> {
		self.enqueue(ReplicaContext::new(
			ReplicaOp::Put,
			ReplicaTarget::Block {
				block_id,
				block_version,
			},
			snapshot.clone(),
			data,
			continuation,
		))
	}

	pub fn replicate_manifest(
		&self,
		snapshot: &FentSnapshot,
		mtime: (i64, u32),
		data: Bytes,
		continuation: Option<ReplicaCont>,
	) -> Arc<ReplicaContext> {
		self.enqueue(ReplicaContext::new(
			ReplicaOp::Put,
			ReplicaTarget::Manifest { mtime },
			snapshot.clone(),
			data,
			continuation,
		))
	}

	pub fn delete_block(
		&self,
		snapshot: &FentSnapshot,
		block_id: BlockId,
		block_version: BlockVersion,
		continuation: Option<ReplicaCont>,
	) -> Arc<ReplicaContext> {
		self.enqueue(ReplicaContext::new(
			ReplicaOp::Delete,
			ReplicaTarget::Block {
				block_id,
				block_version,
			},
			snapshot.clone(),
			Bytes::new(),
			continuation,
		))
	}

	pub fn delete_manifest(
		&self,
		snapshot: &FentSnapshot,
		mtime: (i64, u32),
		continuation: Option<ReplicaCont>,
	) -> Arc<ReplicaContext> {
		self.enqueue(ReplicaContext::new(
			ReplicaOp::Delete,
			ReplicaTarget::Manifest { mtime },
			snapshot.clone(),
			Bytes::new(),
			continuation,
		))
	}

	// ---- execution ----

	fn target_url(ctx: &ReplicaContext, rg: &syndicate_ms::GatewayCert) -> String {
		let s = &ctx.snapshot;
		match &ctx.target {
			ReplicaTarget::Block {
				block_id,
				block_version,
			} => url::block_url(
				rg,
				s.volume_id,
				&s.fs_path,
				s.file_version,
				*block_id,
				*block_version,
			),
			ReplicaTarget::Manifest { mtime } => {
				url::manifest_url(rg, s.volume_id, &s.fs_path, s.file_version, *mtime)
			}
		}
	}

	/// Run one replica operation against every RG. Success means at least
	/// one RG holds the data; DELETEs succeed only if every reachable RG
	/// confirmed, so reclamation is retried rather than leaked.
	async fn execute(&self, ctx: &Arc<ReplicaContext>) -> ReplicaResult {
		let rgs = match self.ms.view.require().map(|v| v.rg_list()) {
			Ok(rgs) => rgs,
			Err(e) => {
				return ReplicaResult {
					error: Some(format!("no volume view: {}", e)),
				}
			}
		};
		if rgs.is_empty() {
			return ReplicaResult {
				error: Some("no replica gateways in volume".into()),
			};
		}

		let mut successes = 0;
		let mut failures = 0;
		let mut last_error = String::new();
		for rg in rgs.iter() {
			let target = Self::target_url(ctx, rg);
			let request = match ctx.op {
				ReplicaOp::Put => RequestSpec {
					method: http::Method::PUT,
					url: target,
					headers: vec![],
					body: Some(ctx.payload.clone()),
				},
				ReplicaOp::Delete => RequestSpec {
					method: http::Method::DELETE,
					url: target,
					headers: vec![],
					body: None,
				},
			};
			let res = self.dl.run_once(request, 4096).await;
			match res.interpret_errors() {
				// a DELETE of something already gone counts as done
				Err(Error::NotFound) if ctx.op == ReplicaOp::Delete => successes += 1,
				Err(e) => {
					failures += 1;
					last_error = format!("RG {}: {}", rg.gateway_id, e);
				}
				Ok(()) => successes += 1,
			}
		}

		let ok = match ctx.op {
			ReplicaOp::Put => successes > 0,
			ReplicaOp::Delete => failures == 0,
		};
		if ok {
			ReplicaResult { error: None }
		} else {
			ReplicaResult {
				error: Some(last_error),
			}
		}
	}

	pub(crate) async fn notified(&self) {
		self.notify.notified().await
	}

	pub(crate) fn pop(&self) -> Option<Arc<ReplicaContext>> {
		self.queue.lock().unwrap().pop_front()
	}

	/// Execute one queued operation; used by workers and by tests that
	/// drive the queue by hand
	pub async fn process_one(&self) -> Option<ReplicaResult> {
		let ctx = self.pop()?;
		let result = self.execute(&ctx).await;
		let cont = ctx.continuation.lock().unwrap().take();
		ctx.result.finalize(result.clone());
		if let Some(cont) = cont {
			cont(&ctx, &result);
		}
		Some(result)
	}
}

pub struct ReplicaWorker {
	rg: Arc<RgClient>,
	index: usize,
}

#[async_trait]
impl Worker for ReplicaWorker {
	fn name(&self) -> String {
		format!("Replica worker #{}", self.index)
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		match self.rg.process_one().await {
			Some(res) => {
				if let Some(e) = &res.error {
					warn!("Replica operation failed: {}", e);
				}
				Ok(WorkerStatus::Busy)
			}
			None if !self.rg.is_running() => Ok(WorkerStatus::Done),
			None => Ok(WorkerStatus::Idle),
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		self.rg.notified().await;
		WorkerStatus::Busy
	}
}
