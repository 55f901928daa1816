//! Global gateway state: the fent arena plus handles on every subsystem.
//! Created once at startup and threaded through explicitly.
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rsa::RsaPrivateKey;

use syndicate_cache::BlockCache;
use syndicate_download::Downloader;
use syndicate_ms::{GatewayCert, MsClient, MsEntry};
use syndicate_util::data::*;
use syndicate_util::error::{Error, OkOrMessage};

use crate::fent::*;
use crate::driver::StorageDriver;
use crate::replication::RgClient;
use crate::vacuumer::Vacuumer;

pub struct FsCore {
	pub gateway_id: GatewayId,
	pub owner_id: UserId,
	pub volume_id: VolumeId,
	pub blocksize: u64,
	pub root_id: FileId,
	pub max_downloads: usize,

	pub fents: std::sync::RwLock<HashMap<FileId, Arc<Fent>>>,

	pub cache: Arc<BlockCache>,
	pub downloader: Arc<Downloader>,
	pub ms: Arc<MsClient>,
	pub rg: Arc<RgClient>,
	pub driver: Arc<dyn StorageDriver>,
	vacuumer: ArcSwapOption<Vacuumer>,
}

impl FsCore {
	/// Requires a loaded volume view (the root entry and blocksize come
	/// from it)
	pub fn new(
		ms: Arc<MsClient>,
		cache: Arc<BlockCache>,
		downloader: Arc<Downloader>,
		rg: Arc<RgClient>,
		driver: Arc<dyn StorageDriver>,
		max_downloads: usize,
	) -> Result<Arc<Self>, Error> {
		let view = ms.view.require()?;
		let root = Fent::new(FentState::from_ms_entry(&view.root));
		let root_id = root.file_id;

		let mut fents = HashMap::new();
		fents.insert(root_id, root);

		Ok(Arc::new(Self {
			gateway_id: ms.gateway_id,
			owner_id: ms.owner_id,
			volume_id: view.volume_id,
			blocksize: view.blocksize,
			root_id,
			max_downloads,
			fents: std::sync::RwLock::new(fents),
			cache,
			downloader,
			ms,
			rg,
			driver,
			vacuumer: ArcSwapOption::new(None),
		}))
	}

	pub fn my_key(&self) -> &RsaPrivateKey {
		self.ms.my_key()
	}

	pub fn set_vacuumer(&self, vac: Arc<Vacuumer>) {
		self.vacuumer.store(Some(vac));
	}

	pub fn vacuumer(&self) -> Option<Arc<Vacuumer>> {
		self.vacuumer.load_full()
	}

	// ---- arena ----

	pub fn get_fent(&self, file_id: FileId) -> Option<Arc<Fent>> {
		self.fents.read().unwrap().get(&file_id).cloned()
	}

	pub fn ensure_fent(&self, entry: &MsEntry) -> Arc<Fent> {
		let mut fents = self.fents.write().unwrap();
		fents
			.entry(entry.file_id)
			.or_insert_with(|| Fent::new(FentState::from_ms_entry(entry)))
			.clone()
	}

	pub fn insert_fent(&self, fent: Arc<Fent>) {
		self.fents.write().unwrap().insert(fent.file_id, fent);
	}

	pub fn remove_fent(&self, file_id: FileId) -> Option<Arc<Fent>> {
		self.fents.write().unwrap().remove(&file_id)
	}

	// ---- view helpers ----

	pub fn cert_for(&self, gateway_id: GatewayId) -> Result<GatewayCert, Error> {
		let view = self.ms.view.require()?;
		match view.cert(gateway_id) {
			Some(c) => Ok(c.clone()),
			None => {
				self.ms.view.sched_reload();
				Err(Error::Stale)
			}
		}
	}

	pub fn rg_list(&self) -> Result<Vec<GatewayCert>, Error> {
		Ok(self.ms.view.require()?.rg_list())
	}

	// ---- path resolution ----

	async fn load_children(&self, dir: &Arc<Fent>) -> Result<(), Error> {
		let listing = self.ms.get_listing(dir.file_id).await?;
		let mut st = dir.lock.write().await;
		let children = st
			.children
			.as_mut()
			.ok_or_message("listing of a non-directory")?;
		for entry in listing.iter() {
			children.insert(entry.name.clone(), entry.file_id);
		}
		drop(st);
		for entry in listing.iter() {
			self.ensure_fent(entry);
		}
		Ok(())
	}

	/// Walk the path from the root, loading directory listings from the
	/// MS where the in-core tree has gaps
	pub async fn resolve(&self, fs_path: &str) -> Result<Arc<Fent>, Error> {
		let mut cur = self
			.get_fent(self.root_id)
			.ok_or_message("root entry missing from arena")?;

		let clean = fs_path.trim_matches('/');
		if clean.is_empty() {
			return Ok(cur);
		}

		for comp in clean.split('/') {
			let child = {
				let st = cur.lock.read().await;
				let children = st.children.as_ref().ok_or(Error::NotFound)?;
				children.get(comp).copied()
			};
			let child_id = match child {
				Some(id) => id,
				None => {
					self.load_children(&cur).await?;
					let st = cur.lock.read().await;
					let children = st.children.as_ref().ok_or(Error::NotFound)?;
					children.get(comp).copied().ok_or(Error::NotFound)?
				}
			};
			cur = match self.get_fent(child_id) {
				Some(f) => f,
				None => {
					let entry = self.ms.get_entry(child_id).await?;
					self.ensure_fent(&entry)
				}
			};
		}
		Ok(cur)
	}

	/// Split a path into (parent path, entry name)
	pub fn split_path(fs_path: &str) -> Result<(&str, &str), Error> {
		let clean = fs_path.trim_end_matches('/');
		if clean.is_empty() || clean == "/" {
			return Err(Error::InvalidRequest("cannot operate on the root".into()));
		}
		match clean.rfind('/') {
			Some(idx) => Ok((if idx == 0 { "/" } else { &clean[..idx] }, &clean[idx + 1..])),
			None => Err(Error::InvalidRequest(format!(
				"path {} is not absolute",
				fs_path
			))),
		}
	}
}
