//! Two-phase garbage collection of a superseded write: one DELETE per
//! garbage block, and once the last of those lands, a DELETE for the old
//! manifest, and once that lands, removal of the vacuum-log row on the MS.
//! Driven entirely by replica-context continuations.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use syndicate_util::data::*;
use syndicate_util::error::Error;

use crate::core::FsCore;
use crate::driver::GcVerdict;
use crate::fent::FentSnapshot;
use crate::replication::{ReplicaContext, ReplicaResult, ReplicaTarget};

struct CompletionMap {
	done: HashMap<(BlockId, BlockVersion), bool>,
	expected: usize,
}

pub(crate) struct GcContext {
	fs_path: String,
	snapshot: FentSnapshot,
	gc_manifest: bool,
	completion: Mutex<CompletionMap>,
}

impl GcContext {
	/// Record one completed block DELETE. Returns Some(all_ok) once every
	/// expected completion arrived.
	fn record(&self, key: (BlockId, BlockVersion), ok: bool) -> Option<bool> {
		let mut map = self.completion.lock().unwrap();
		map.done.insert(key, ok);
		if map.done.len() == map.expected {
			Some(map.done.values().all(|ok| *ok))
		} else {
			None
		}
	}
}

/// Ask the driver, then kick off the DELETE fan-out in the background.
/// The caller must only pass versions that are no longer referenced by the
/// current manifest.
pub async fn garbage_collect_kickoff(
	core: &Arc<FsCore>,
	fs_path: &str,
	old_snapshot: FentSnapshot,
	garbage: BTreeMap<(BlockId, BlockVersion), GatewayId>,
	gc_manifest: bool,
) -> Result<(), Error> {
	if core.driver.gc_verdict(&old_snapshot).await == GcVerdict::NotGarbage {
		// the driver kept the write alive; the vacuumer owns it now
		if let Some(vac) = core.vacuumer() {
			vac.write_bg(fs_path, old_snapshot);
		}
		return Ok(());
	}

	if garbage.is_empty() {
		if gc_manifest {
			enqueue_manifest_delete(core, Arc::new(GcContext {
				fs_path: fs_path.to_string(),
				snapshot: old_snapshot,
				gc_manifest,
				completion: Mutex::new(CompletionMap {
					done: HashMap::new(),
					expected: 0,
				}),
			}));
		}
		return Ok(());
	}

	let cls = Arc::new(GcContext {
		fs_path: fs_path.to_string(),
		snapshot: old_snapshot.clone(),
		gc_manifest,
		completion: Mutex::new(CompletionMap {
			done: HashMap::new(),
			expected: garbage.len(),
		}),
	});

	for ((block_id, block_version), _writer) in garbage {
		let core2 = core.clone();
		let cls2 = cls.clone();
		core.rg.delete_block(
			&old_snapshot,
			block_id,
			block_version,
			Some(Box::new(move |ctx: &ReplicaContext, res: &ReplicaResult| {
				gc_block_cont(&core2, &cls2, ctx, res);
			})),
		);
	}
	Ok(())
}

fn gc_block_cont(core: &Arc<FsCore>, cls: &Arc<GcContext>, ctx: &ReplicaContext, res: &ReplicaResult) {
	let key = match &ctx.target {
		ReplicaTarget::Block {
			block_id,
			block_version,
		} => (*block_id, *block_version),
		ReplicaTarget::Manifest { .. } => return,
	};

	if let Some(all_ok) = cls.record(key, res.is_ok()) {
		if all_ok {
			if cls.gc_manifest {
				enqueue_manifest_delete(core, cls.clone());
			}
		} else {
			// some block DELETE failed; the vacuum log still names this
			// write, so hand the whole thing to the vacuumer to retry
			warn!(
				"Garbage collection of {} incomplete, deferring to vacuumer",
				cls.fs_path
			);
			if let Some(vac) = core.vacuumer() {
				vac.write_bg(&cls.fs_path, cls.snapshot.clone());
			}
		}
	}
}

fn enqueue_manifest_delete(core: &Arc<FsCore>, cls: Arc<GcContext>) {
	let core2 = core.clone();
	let snapshot = cls.snapshot.clone();
	core.rg.delete_manifest(
		&snapshot,
		snapshot.manifest_mtime,
		Some(Box::new(move |_ctx: &ReplicaContext, res: &ReplicaResult| {
			gc_manifest_cont(&core2, &cls, res);
		})),
	);
}

fn gc_manifest_cont(core: &Arc<FsCore>, cls: &Arc<GcContext>, res: &ReplicaResult) {
	let vac = match core.vacuumer() {
		Some(v) => v,
		None => return,
	};
	if res.is_ok() {
		// all replicas reclaimed; drop the vacuum-log row in the background
		vac.log_entry_bg(&cls.fs_path, cls.snapshot.clone());
	} else {
		warn!(
			"Manifest reclamation of {} failed, deferring to vacuumer",
			cls.fs_path
		);
		vac.write_bg(&cls.fs_path, cls.snapshot.clone());
	}
}
