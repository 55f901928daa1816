//! Driver hooks: the pluggable transform layer over block bytes, manifest
//! bytes and URLs. The gateway consumes this as a trait; real drivers live
//! outside the core.
use async_trait::async_trait;
use bytes::Bytes;

use syndicate_download::RequestSpec;
use syndicate_util::error::Error;

use crate::fent::FentSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcVerdict {
	Proceed,
	/// The driver keeps the write alive; the vacuumer owns reclamation
	NotGarbage,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
	/// Transform block bytes on their way into the cache and to the RGs
	async fn write_block(&self, _snapshot: &FentSnapshot, data: Bytes) -> Result<Bytes, Error> {
		Ok(data)
	}

	/// Transform block bytes fetched from a peer before they are served
	async fn read_block(&self, _snapshot: &FentSnapshot, data: Bytes) -> Result<Bytes, Error> {
		Ok(data)
	}

	/// Undo whatever `write_manifest` did before parsing a fetched manifest
	async fn read_manifest(&self, data: Bytes) -> Result<Bytes, Error> {
		Ok(data)
	}

	async fn write_manifest(&self, data: Bytes) -> Result<Bytes, Error> {
		Ok(data)
	}

	/// Per-write veto over garbage collection
	async fn gc_verdict(&self, _snapshot: &FentSnapshot) -> GcVerdict {
		GcVerdict::Proceed
	}

	/// URL rewrite hook, e.g. to route block fetches through a CDN
	fn connect_cache(&self, _request: &mut RequestSpec) -> Result<(), Error> {
		Ok(())
	}
}

/// Identity driver
pub struct PassthroughDriver;

#[async_trait]
impl StorageDriver for PassthroughDriver {}
