//! The gateway's view of the volume: the signed volume record and the
//! certificate bundles of every gateway in it. Reloaded periodically by a
//! background worker, or immediately when something hints that it is stale.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::{watch, Notify};

use syndicate_util::background::worker::{Worker, WorkerStatus};
use syndicate_util::crypto;
use syndicate_util::data::*;
use syndicate_util::error::Error;

use crate::client::MsClient;
use crate::msg::*;

/// A verified, parsed gateway certificate
#[derive(Debug, Clone)]
pub struct GatewayCert {
	pub gateway_type: GatewayType,
	pub gateway_id: GatewayId,
	pub owner_id: UserId,
	pub name: String,
	pub host: String,
	pub port: u16,
	pub caps: u64,
	pub version: u64,
	pub public_key: RsaPublicKey,
	pub blocksize: Option<u64>,
}

impl GatewayCert {
	pub fn from_msg(msg: &GatewayCertMsg) -> Result<Self, Error> {
		Ok(Self {
			gateway_type: msg.gateway_type,
			gateway_id: msg.gateway_id,
			owner_id: msg.owner_id,
			name: msg.name.clone(),
			host: msg.host.clone(),
			port: msg.port,
			caps: msg.caps,
			version: msg.version,
			public_key: crypto::load_public_key(&msg.public_key_pem)?,
			blocksize: msg.blocksize,
		})
	}
}

/// Immutable snapshot of the volume state at one (volume_version,
/// cert_version) pair
#[derive(Debug, Clone)]
pub struct VolumeView {
	pub volume_id: VolumeId,
	pub name: String,
	pub owner_id: UserId,
	pub blocksize: u64,
	pub volume_version: u64,
	pub cert_version: u64,
	pub root: MsEntry,

	pub ug_certs: HashMap<GatewayId, GatewayCert>,
	pub rg_certs: HashMap<GatewayId, GatewayCert>,
	pub ag_certs: HashMap<GatewayId, GatewayCert>,
}

impl VolumeView {
	pub fn cert(&self, gateway_id: GatewayId) -> Option<&GatewayCert> {
		self.ug_certs
			.get(&gateway_id)
			.or_else(|| self.rg_certs.get(&gateway_id))
			.or_else(|| self.ag_certs.get(&gateway_id))
	}

	pub fn certs_of_type(&self, gt: GatewayType) -> &HashMap<GatewayId, GatewayCert> {
		match gt {
			GatewayType::UG => &self.ug_certs,
			GatewayType::RG => &self.rg_certs,
			GatewayType::AG => &self.ag_certs,
		}
	}

	fn certs_of_type_mut(&mut self, gt: GatewayType) -> &mut HashMap<GatewayId, GatewayCert> {
		match gt {
			GatewayType::UG => &mut self.ug_certs,
			GatewayType::RG => &mut self.rg_certs,
			GatewayType::AG => &mut self.ag_certs,
		}
	}

	/// Replica gateways, in stable order for deterministic fan-out
	pub fn rg_list(&self) -> Vec<GatewayCert> {
		let mut rgs: Vec<_> = self.rg_certs.values().cloned().collect();
		rgs.sort_by_key(|c| c.gateway_id);
		rgs
	}
}

/// Shared handle on the current view
pub struct MsView {
	volume_pubkey: RsaPublicKey,
	current: ArcSwapOption<VolumeView>,
	early_reload: AtomicBool,
	reload_notify: Notify,
}

impl MsView {
	pub fn new(volume_pubkey: RsaPublicKey) -> Self {
		Self {
			volume_pubkey,
			current: ArcSwapOption::new(None),
			early_reload: AtomicBool::new(false),
			reload_notify: Notify::new(),
		}
	}

	pub fn volume_pubkey(&self) -> &RsaPublicKey {
		&self.volume_pubkey
	}

	pub fn get(&self) -> Option<Arc<VolumeView>> {
		self.current.load_full()
	}

	pub fn require(&self) -> Result<Arc<VolumeView>, Error> {
		self.get().ok_or(Error::Stale)
	}

	/// Swap in a freshly built view (bootstrap, reload, tests)
	pub fn install(&self, view: VolumeView) {
		self.current.store(Some(Arc::new(view)));
	}

	/// Ask the view worker to reload on its next wakeup, now
	pub fn sched_reload(&self) {
		self.early_reload.store(true, Ordering::SeqCst);
		self.reload_notify.notify_one();
	}

	pub(crate) fn take_early_reload(&self) -> bool {
		self.early_reload.swap(false, Ordering::SeqCst)
	}

	pub(crate) async fn reload_notified(&self) {
		self.reload_notify.notified().await
	}

	/// Version counters observed in an MS reply; anything newer than the
	/// current view triggers an early reload
	pub fn process_reply_versions(&self, volume_version: u64, cert_version: u64) {
		if let Some(cur) = self.get() {
			if volume_version > cur.volume_version || cert_version > cur.cert_version {
				debug!(
					"MS reports volume {}/{} vs local {}/{}, scheduling view reload",
					volume_version, cert_version, cur.volume_version, cur.cert_version
				);
				self.sched_reload();
			}
		}
	}

	/// Verify a peer gateway's signature over `data`. An unknown gateway
	/// schedules a view reload and reports the view as stale so the caller
	/// retries.
	pub fn verify_gateway_message(
		&self,
		user_id: UserId,
		gateway_id: GatewayId,
		data: &[u8],
		sig: &[u8],
	) -> Result<(), Error> {
		let view = match self.get() {
			Some(v) => v,
			None => {
				self.sched_reload();
				return Err(Error::Stale);
			}
		};
		let cert = match view.cert(gateway_id) {
			Some(c) => c,
			None => {
				self.sched_reload();
				return Err(Error::Stale);
			}
		};
		if cert.owner_id != user_id {
			return Err(Error::Unauthorized(format!(
				"gateway {} does not belong to user {}",
				gateway_id, user_id
			)));
		}
		crypto::verify_bytes(&cert.public_key, data, sig)
			.map_err(|_| Error::BadSignature(gateway_id))
	}

	/// Sign `data` on behalf of this gateway
	pub fn sign_gateway_message(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, Error> {
		crypto::sign_bytes(key, data)
	}
}

/// Which certificates must be fetched to move from `current` to the bundle
/// named by `manifest`, and which local certificates are gone. Version
/// regressions are ignored: a stub older than the local certificate does
/// not replace it.
pub(crate) fn cert_diff(
	current: Option<&VolumeView>,
	manifest: &CertManifest,
) -> (Vec<CertStub>, Vec<GatewayId>) {
	let mut to_fetch = vec![];
	for stub in manifest.certs.iter() {
		let local_version = current.and_then(|v| v.cert(stub.gateway_id)).map(|c| c.version);
		match local_version {
			None => to_fetch.push(*stub),
			Some(lv) if lv < stub.version => to_fetch.push(*stub),
			Some(_) => (),
		}
	}

	let mut dropped = vec![];
	if let Some(cur) = current {
		let named: std::collections::HashSet<GatewayId> =
			manifest.certs.iter().map(|s| s.gateway_id).collect();
		for bundle in [&cur.ug_certs, &cur.rg_certs, &cur.ag_certs] {
			for id in bundle.keys() {
				if !named.contains(id) {
					dropped.push(*id);
				}
			}
		}
	}

	(to_fetch, dropped)
}

/// Build the next view from the freshly fetched volume record, reusing
/// current certificates and applying the fetched delta
pub(crate) fn build_view(
	current: Option<&VolumeView>,
	volume: &VolumeMetadata,
	fetched: Vec<GatewayCert>,
	dropped: &[GatewayId],
) -> VolumeView {
	let mut view = VolumeView {
		volume_id: volume.volume_id,
		name: volume.name.clone(),
		owner_id: volume.owner_id,
		blocksize: volume.blocksize,
		volume_version: volume.volume_version,
		cert_version: volume.cert_version,
		root: volume.root.clone(),
		ug_certs: current.map(|v| v.ug_certs.clone()).unwrap_or_default(),
		rg_certs: current.map(|v| v.rg_certs.clone()).unwrap_or_default(),
		ag_certs: current.map(|v| v.ag_certs.clone()).unwrap_or_default(),
	};

	for id in dropped {
		view.ug_certs.remove(id);
		view.rg_certs.remove(id);
		view.ag_certs.remove(id);
	}

	for cert in fetched {
		view.certs_of_type_mut(cert.gateway_type)
			.insert(cert.gateway_id, cert);
	}

	view
}

/// Periodically refetches the volume record and certificate delta
pub struct ViewReloadWorker {
	client: Arc<MsClient>,
	reload_freq: Duration,
	next_reload: tokio::time::Instant,
}

impl ViewReloadWorker {
	pub fn new(client: Arc<MsClient>, reload_freq: Duration) -> Self {
		Self {
			client,
			reload_freq,
			next_reload: tokio::time::Instant::now(),
		}
	}
}

#[async_trait]
impl Worker for ViewReloadWorker {
	fn name(&self) -> String {
		"MS view reload worker".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		self.client.view.take_early_reload();
		self.next_reload = tokio::time::Instant::now() + self.reload_freq;
		match self.client.reload_view().await {
			Ok(changed) => {
				if changed {
					info!("Volume view reloaded");
				}
				Ok(WorkerStatus::Idle)
			}
			Err(e) => Err(e),
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::select! {
			_ = tokio::time::sleep_until(self.next_reload) => (),
			_ = self.client.view.reload_notified() => (),
		}
		WorkerStatus::Busy
	}
}
