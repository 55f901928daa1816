use std::sync::Arc;

use syndicate_util::error::Error;

use crate::context::*;
use crate::manager::Downloader;
use crate::set::DownloadSet;

/// Post-processor verdict for one finished transfer in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcess {
	Continue,
	/// Stop the batch; transfers still in flight are cancelled
	Finish,
}

/// Batch runner: keeps up to `max_downloads` transfers in flight, pulling
/// new requests from `next_request` and feeding every finished transfer to
/// `postprocess`. Used for parallel block fetches.
pub async fn download_all<G, P>(
	dl: &Arc<Downloader>,
	max_downloads: usize,
	max_len: usize,
	mut next_request: G,
	mut postprocess: P,
) -> Result<(), Error>
where
	G: FnMut() -> Option<RequestSpec>,
	P: FnMut(DownloadResult) -> Result<PostProcess, Error>,
{
	let set = DownloadSet::new();
	let mut exhausted = false;
	let wait_slice = dl.transfer_timeout() * 2;

	let res = 'batch: loop {
		// keep the pool full
		while set.len() < max_downloads && !exhausted {
			match next_request() {
				Some(req) => {
					let ctx = DownloadContext::new(req, max_len);
					set.add(&ctx);
					if let Err(e) = dl.start(&ctx) {
						set.clear(&ctx);
						break 'batch Err(e);
					}
				}
				None => exhausted = true,
			}
		}

		if set.is_empty() {
			break Ok(());
		}

		let ctx = match set.wait_any(wait_slice).await {
			Ok(ctx) => ctx,
			Err(e) => break Err(e),
		};
		set.clear(&ctx);
		let result = ctx.wait().await;

		match postprocess(result) {
			Ok(PostProcess::Continue) => (),
			Ok(PostProcess::Finish) => break Ok(()),
			Err(e) => break Err(e),
		}
	};

	// tear down whatever is still in flight
	for ctx in set.members() {
		if !ctx.is_finalized() {
			let _ = dl.cancel(&ctx).await;
		}
		set.clear(&ctx);
	}

	res
}
