use opentelemetry::{global, metrics::*, Context};

/// Counters for cache activity
pub struct CacheMetrics {
	pub(crate) bytes_written: Counter<u64>,
	pub(crate) bytes_read: Counter<u64>,
	pub(crate) blocks_evicted: Counter<u64>,
	pub(crate) write_errors: Counter<u64>,
	pub(crate) eviction_errors: Counter<u64>,
}

impl CacheMetrics {
	pub fn new() -> Self {
		let meter = global::meter("syndicate_cache");
		Self {
			bytes_written: meter
				.u64_counter("cache.bytes_written")
				.with_description("Number of bytes written to the on-disk cache")
				.init(),
			bytes_read: meter
				.u64_counter("cache.bytes_read")
				.with_description("Number of bytes read from the on-disk cache")
				.init(),
			blocks_evicted: meter
				.u64_counter("cache.blocks_evicted")
				.with_description("Number of cached blocks evicted")
				.init(),
			write_errors: meter
				.u64_counter("cache.write_errors")
				.with_description("Number of cache writes that failed")
				.init(),
			eviction_errors: meter
				.u64_counter("cache.eviction_errors")
				.with_description("Number of evictions that failed")
				.init(),
		}
	}

	pub(crate) fn add_bytes_written(&self, n: u64) {
		self.bytes_written.add(&Context::current(), n, &[]);
	}

	pub(crate) fn add_bytes_read(&self, n: u64) {
		self.bytes_read.add(&Context::current(), n, &[]);
	}

	pub(crate) fn add_eviction(&self) {
		self.blocks_evicted.add(&Context::current(), 1, &[]);
	}

	pub(crate) fn add_write_error(&self) {
		self.write_errors.add(&Context::current(), 1, &[]);
	}

	pub(crate) fn add_eviction_error(&self) {
		self.eviction_errors.add(&Context::current(), 1, &[]);
	}
}

impl Default for CacheMetrics {
	fn default() -> Self {
		Self::new()
	}
}
