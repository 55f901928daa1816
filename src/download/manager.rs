use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hyper::body::HttpBody;
use tokio::sync::{watch, Notify};

use syndicate_util::background::worker::{Worker, WorkerStatus};
use syndicate_util::background::BackgroundRunner;
use syndicate_util::error::Error;

use crate::context::*;
use crate::metrics::DownloadMetrics;

pub type HttpClient = hyper::Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>;

pub fn new_http_client() -> HttpClient {
	let https = hyper_rustls::HttpsConnectorBuilder::new()
		.with_native_roots()
		.https_or_http()
		.enable_http1()
		.build();
	hyper::Client::builder().build::<_, hyper::Body>(https)
}

/// Hook run before a context is dispatched; may rewrite the request (CDN
/// routing) or refuse the transfer altogether
pub trait CacheConnector: Send + Sync {
	fn rewrite(&self, request: &mut RequestSpec) -> Result<(), Error>;
}

/// The downloader: accepts contexts, dispatches them as concurrent
/// transfers, delivers results through the contexts' futures
pub struct Downloader {
	pub name: String,
	client: HttpClient,
	transfer_timeout: Duration,
	running: AtomicBool,
	pending: Mutex<Vec<Arc<DownloadContext>>>,
	work_notify: Notify,
	connector: Mutex<Option<Arc<dyn CacheConnector>>>,
	pub(crate) metrics: DownloadMetrics,
}

impl Downloader {
	pub fn new(name: impl Into<String>, transfer_timeout: Duration) -> Arc<Self> {
		let name = name.into();
		Arc::new(Self {
			metrics: DownloadMetrics::new(&name),
			name,
			client: new_http_client(),
			transfer_timeout,
			running: AtomicBool::new(true),
			pending: Mutex::new(Vec::new()),
			work_notify: Notify::new(),
			connector: Mutex::new(None),
		})
	}

	pub fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) {
		bg.spawn_worker(DownloadWorker {
			downloader: self.clone(),
		});
	}

	/// Standalone dispatch loop for tests that don't set up a full
	/// background runner
	#[cfg(test)]
	pub(crate) fn spawn_workers_for_test(self: &Arc<Self>) {
		let this = self.clone();
		tokio::spawn(async move {
			loop {
				this.tick().await;
				this.notified().await;
			}
		});
	}

	pub fn set_cache_connector(&self, connector: Arc<dyn CacheConnector>) {
		*self.connector.lock().unwrap() = Some(connector);
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	pub fn transfer_timeout(&self) -> Duration {
		self.transfer_timeout
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		self.work_notify.notify_one();
	}

	/// Enqueue a context for transfer. The connector hook runs here, so a
	/// refused rewrite fails the start and the context never enters the
	/// pool.
	pub fn start(&self, ctx: &Arc<DownloadContext>) -> Result<(), Error> {
		if !self.is_running() {
			return Err(Error::Busy);
		}

		{
			let mut state = ctx.state.lock().unwrap();
			if *state != DownloadState::Init {
				return Err(Error::InvalidRequest(format!(
					"download context in state {:?} cannot be started",
					*state
				)));
			}
			let connector = self.connector.lock().unwrap().clone();
			if let Some(connector) = connector {
				let mut request = ctx.request.lock().unwrap();
				connector.rewrite(&mut request)?;
			}
			*state = DownloadState::Pending;
		}

		self.pending.lock().unwrap().push(ctx.clone());
		self.work_notify.notify_one();
		self.metrics.add_started();
		Ok(())
	}

	/// Cancel a transfer. Returns Ok once the context is finalized; a
	/// context that already finalized is left as-is. A second concurrent
	/// cancel gets Busy and should wait on the context instead.
	pub async fn cancel(&self, ctx: &Arc<DownloadContext>) -> Result<(), Error> {
		{
			let mut state = ctx.state.lock().unwrap();
			match *state {
				DownloadState::Finalized => return Ok(()),
				DownloadState::Cancelling => return Err(Error::Busy),
				DownloadState::Init => {
					return Err(Error::InvalidRequest(
						"cannot cancel a download that was never started".into(),
					))
				}
				DownloadState::Pending | DownloadState::Running => {
					*state = DownloadState::Cancelling;
				}
			}
		}

		// a pending context is finalized on the spot (it never ran); a
		// running one also gets its transfer task signalled so the
		// connection is torn down
		let _ = ctx.cancel_tx.send(true);
		ctx.finalize_cancelled();
		ctx.wait().await;
		self.metrics.add_cancelled();
		Ok(())
	}

	// ---- worker internals ----

	pub(crate) async fn notified(&self) {
		self.work_notify.notified().await
	}

	pub(crate) fn has_queued_work(&self) -> bool {
		!self.pending.lock().unwrap().is_empty()
	}

	/// One dispatch pass: move pending contexts into running transfer
	/// tasks. Returns the number of contexts dispatched.
	pub async fn tick(self: &Arc<Self>) -> usize {
		let pending = std::mem::take(&mut *self.pending.lock().unwrap());
		let n = pending.len();
		for ctx in pending {
			{
				let mut state = ctx.state.lock().unwrap();
				match *state {
					DownloadState::Pending => {
						*state = DownloadState::Running;
					}
					// cancelled while pending: already finalized, skip
					_ => continue,
				}
			}
			let this = self.clone();
			tokio::spawn(async move {
				this.run_transfer(ctx).await;
			});
		}
		n
	}

	async fn run_transfer(&self, ctx: Arc<DownloadContext>) {
		let request = ctx.request.lock().unwrap().clone();
		let mut cancel_rx = ctx.cancel_rx.clone();

		let transfer = Self::execute(&self.client, &request, ctx.max_len);
		let result = tokio::select! {
			res = transfer => res,
			_ = tokio::time::sleep(self.transfer_timeout) => DownloadResult {
				http_status: 0,
				effective_url: request.url.clone(),
				location: None,
				data: Bytes::new(),
				error: Some(TransferError::Timeout),
			},
			_ = cancel_rx.changed() => DownloadResult {
				http_status: 0,
				effective_url: request.url.clone(),
				location: None,
				data: Bytes::new(),
				error: Some(TransferError::Cancelled),
			},
		};

		match &result.error {
			None => self.metrics.add_finished(result.data.len() as u64),
			Some(TransferError::Cancelled) => (),
			Some(_) => self.metrics.add_error(),
		}
		ctx.finalize(result);
	}

	async fn execute(client: &HttpClient, request: &RequestSpec, max_len: usize) -> DownloadResult {
		let failed = |error| DownloadResult {
			http_status: 0,
			effective_url: request.url.clone(),
			location: None,
			data: Bytes::new(),
			error: Some(error),
		};

		let uri: http::Uri = match request.url.parse() {
			Ok(uri) => uri,
			Err(_) => return failed(TransferError::Protocol),
		};

		let mut builder = http::Request::builder().method(request.method.clone()).uri(uri);
		for (name, value) in request.headers.iter() {
			builder = builder.header(name, value);
		}
		let body = match &request.body {
			Some(b) => hyper::Body::from(b.clone()),
			None => hyper::Body::empty(),
		};
		let req = match builder.body(body) {
			Ok(r) => r,
			Err(_) => return failed(TransferError::Protocol),
		};

		let resp = match client.request(req).await {
			Ok(r) => r,
			Err(e) => {
				debug!("Transfer to {} failed: {}", request.url, e);
				return failed(TransferError::Connect);
			}
		};

		let http_status = resp.status().as_u16();
		let location = resp
			.headers()
			.get(http::header::LOCATION)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string());

		let mut body = resp.into_body();
		let mut buf = BytesMut::new();
		while let Some(chunk) = body.data().await {
			let chunk = match chunk {
				Ok(c) => c,
				Err(_) => return failed(TransferError::Connect),
			};
			if buf.len() + chunk.len() > max_len {
				return failed(TransferError::TooLarge);
			}
			buf.extend_from_slice(&chunk);
		}

		DownloadResult {
			http_status,
			effective_url: request.url.clone(),
			location,
			data: buf.freeze(),
			error: None,
		}
	}

	/// Run one transfer to completion without queueing it on the worker
	pub async fn run_once(&self, request: RequestSpec, max_len: usize) -> DownloadResult {
		let res = tokio::select! {
			res = Self::execute(&self.client, &request, max_len) => res,
			_ = tokio::time::sleep(self.transfer_timeout) => DownloadResult {
				http_status: 0,
				effective_url: request.url.clone(),
				location: None,
				data: Bytes::new(),
				error: Some(TransferError::Timeout),
			},
		};
		match &res.error {
			None => self.metrics.add_finished(res.data.len() as u64),
			Some(TransferError::Cancelled) => (),
			Some(_) => self.metrics.add_error(),
		}
		res
	}
}

/// Dispatcher worker: one per downloader instance
pub struct DownloadWorker {
	downloader: Arc<Downloader>,
}

#[async_trait]
impl Worker for DownloadWorker {
	fn name(&self) -> String {
		format!("Downloader {}", self.downloader.name)
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let n = self.downloader.tick().await;
		if n > 0 || self.downloader.has_queued_work() {
			Ok(WorkerStatus::Busy)
		} else if !self.downloader.is_running() {
			Ok(WorkerStatus::Done)
		} else {
			Ok(WorkerStatus::Idle)
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		self.downloader.notified().await;
		WorkerStatus::Busy
	}
}
