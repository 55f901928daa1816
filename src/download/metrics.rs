use opentelemetry::{global, metrics::*, Context, KeyValue};

pub struct DownloadMetrics {
	instance: String,
	transfers_started: Counter<u64>,
	transfers_finished: Counter<u64>,
	transfer_errors: Counter<u64>,
	transfers_cancelled: Counter<u64>,
	bytes_fetched: Counter<u64>,
}

impl DownloadMetrics {
	pub fn new(instance: &str) -> Self {
		let meter = global::meter("syndicate_download");
		Self {
			instance: instance.to_string(),
			transfers_started: meter
				.u64_counter("download.transfers_started")
				.with_description("Number of transfers accepted by the downloader")
				.init(),
			transfers_finished: meter
				.u64_counter("download.transfers_finished")
				.with_description("Number of transfers that ran to completion")
				.init(),
			transfer_errors: meter
				.u64_counter("download.transfer_errors")
				.with_description("Number of transfers that failed")
				.init(),
			transfers_cancelled: meter
				.u64_counter("download.transfers_cancelled")
				.with_description("Number of transfers cancelled by the caller")
				.init(),
			bytes_fetched: meter
				.u64_counter("download.bytes_fetched")
				.with_description("Number of response body bytes received")
				.init(),
		}
	}

	fn tags(&self) -> [KeyValue; 1] {
		[KeyValue::new("instance", self.instance.clone())]
	}

	pub(crate) fn add_started(&self) {
		self.transfers_started.add(&Context::current(), 1, &self.tags());
	}

	pub(crate) fn add_finished(&self, bytes: u64) {
		self.transfers_finished.add(&Context::current(), 1, &self.tags());
		self.bytes_fetched.add(&Context::current(), bytes, &self.tags());
	}

	pub(crate) fn add_error(&self) {
		self.transfer_errors.add(&Context::current(), 1, &self.tags());
	}

	pub(crate) fn add_cancelled(&self) {
		self.transfers_cancelled.add(&Context::current(), 1, &self.tags());
	}
}
