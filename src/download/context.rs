use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::Method;

use syndicate_util::error::Error;
use syndicate_util::future::OpFuture;

use crate::set::DownloadSet;

/// What one transfer should do. This plays the role of a caller-configured
/// transfer handle: the downloader executes it as given, after the optional
/// cache connector had a chance to rewrite it.
#[derive(Debug, Clone)]
pub struct RequestSpec {
	pub method: Method,
	pub url: String,
	pub headers: Vec<(HeaderName, HeaderValue)>,
	pub body: Option<Bytes>,
}

impl RequestSpec {
	pub fn get(url: impl Into<String>) -> Self {
		Self {
			method: Method::GET,
			url: url.into(),
			headers: vec![],
			body: None,
		}
	}

	pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.headers.push((name, value));
		self
	}

	/// Inclusive byte range, for partial block fetches
	pub fn with_range(self, start: u64, end: u64) -> Self {
		self.with_header(
			http::header::RANGE,
			HeaderValue::from_str(&format!("bytes={}-{}", start, end))
				.expect("range header is always ascii"),
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
	Init,
	Pending,
	Running,
	Cancelling,
	Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
	/// The transfer was cancelled before it finished; safe to retry
	Cancelled,
	Timeout,
	/// Response exceeded the context's length bound
	TooLarge,
	/// Connection-level failure (refused, reset, DNS, TLS)
	Connect,
	/// The response could not be interpreted
	Protocol,
}

impl TransferError {
	pub fn into_error(self) -> Error {
		match self {
			TransferError::Cancelled => Error::Cancelled,
			TransferError::Timeout => Error::Timeout,
			TransferError::TooLarge => Error::TooLarge(0),
			TransferError::Connect => Error::RemoteIo("connection failed".into()),
			TransferError::Protocol => Error::RemoteIo("protocol error".into()),
		}
	}
}

/// Everything there is to know about a finished transfer
#[derive(Debug, Clone)]
pub struct DownloadResult {
	/// 0 if the transfer failed before any response arrived
	pub http_status: u16,
	/// URL the transfer actually hit, after connector rewriting
	pub effective_url: String,
	pub location: Option<String>,
	pub data: Bytes,
	pub error: Option<TransferError>,
}

impl DownloadResult {
	pub fn succeeded(&self, desired_status: u16) -> bool {
		self.error.is_none() && self.http_status == desired_status
	}

	/// Map HTTP statuses and transfer failures onto the error taxonomy
	pub fn interpret_errors(&self) -> Result<(), Error> {
		if let Some(e) = self.error {
			return Err(e.into_error());
		}
		match self.http_status {
			200..=299 => Ok(()),
			302 => Ok(()),
			202 => Err(Error::Busy),
			400 => Err(Error::InvalidRequest("remote rejected request".into())),
			403 => Err(Error::Unauthorized("remote denied access".into())),
			404 => Err(Error::NotFound),
			409 => Err(Error::Exists),
			413 => Err(Error::TooLarge(0)),
			422 => Err(Error::NotEmpty),
			504 => Err(Error::Timeout),
			s => Err(Error::RemoteHttp(s)),
		}
	}
}

/// One transfer tracked by the downloader. State transitions are
/// `Init -> Pending -> Running -> Finalized`, with cancellation short-
/// circuiting from Pending or Running through Cancelling.
pub struct DownloadContext {
	pub(crate) request: Mutex<RequestSpec>,
	pub(crate) max_len: usize,
	pub(crate) state: Mutex<DownloadState>,
	pub(crate) cancel_tx: tokio::sync::watch::Sender<bool>,
	pub(crate) cancel_rx: tokio::sync::watch::Receiver<bool>,
	pub(crate) result: OpFuture<DownloadResult>,
	pub(crate) set: Mutex<Option<Weak<DownloadSet>>>,
}

impl DownloadContext {
	pub fn new(request: RequestSpec, max_len: usize) -> Arc<Self> {
		let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
		Arc::new(Self {
			request: Mutex::new(request),
			max_len,
			state: Mutex::new(DownloadState::Init),
			cancel_tx,
			cancel_rx,
			result: OpFuture::new(),
			set: Mutex::new(None),
		})
	}

	pub fn state(&self) -> DownloadState {
		*self.state.lock().unwrap()
	}

	pub fn is_finalized(&self) -> bool {
		self.state() == DownloadState::Finalized
	}

	pub fn is_pending(&self) -> bool {
		self.state() == DownloadState::Pending
	}

	pub fn is_running(&self) -> bool {
		self.state() == DownloadState::Running
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(
			self.result.poll_value(),
			Some(DownloadResult {
				error: Some(TransferError::Cancelled),
				..
			})
		)
	}

	pub fn effective_url(&self) -> String {
		self.request.lock().unwrap().url.clone()
	}

	/// Block until the transfer finalizes. After this returns, every field
	/// of the result is settled.
	pub async fn wait(&self) -> DownloadResult {
		self.result.wait().await
	}

	/// As `wait`, with an absolute timeout. A finalized context returns
	/// immediately even with a zero timeout; on timeout the transfer is
	/// NOT cancelled.
	pub async fn wait_timeout(&self, timeout: Duration) -> Result<DownloadResult, Error> {
		self.result.wait_timeout(timeout).await
	}

	pub(crate) fn finalize(&self, result: DownloadResult) -> bool {
		let fresh = self.result.finalize(result);
		if fresh {
			*self.state.lock().unwrap() = DownloadState::Finalized;
			let set = self.set.lock().unwrap().clone();
			if let Some(set) = set.and_then(|w| w.upgrade()) {
				set.wake();
			}
		}
		fresh
	}

	pub(crate) fn finalize_cancelled(&self) -> bool {
		let url = self.effective_url();
		self.finalize(DownloadResult {
			http_status: 0,
			effective_url: url,
			location: None,
			data: Bytes::new(),
			error: Some(TransferError::Cancelled),
		})
	}
}
