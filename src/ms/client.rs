//! The metadata service client proper: authenticated signed RPCs over
//! HTTPS, with two independent request channels (read and write) so a slow
//! upload does not delay metadata reads.
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hyper::body::HttpBody;
use rsa::RsaPrivateKey;

use syndicate_download::{new_http_client, HttpClient};
use syndicate_util::background::BackgroundRunner;
use syndicate_util::crypto;
use syndicate_util::data::*;
use syndicate_util::error::{Error, OkOrMessage};
use syndicate_util::time::now_msec;

use crate::msg::*;
use crate::updates::{UpdateQueue, UpdateUploadWorker};
use crate::view::*;

/// Replies larger than this are treated as malformed
const MS_MAX_REPLY: usize = 16 << 20;

pub const HTTP_VOLUME_TIME: &str = "X-Volume-Time";
pub const HTTP_GATEWAY_TIME: &str = "X-Gateway-Time";
pub const HTTP_TOTAL_TIME: &str = "X-Total-Time";
pub const HTTP_RESOLVE_TIME: &str = "X-Resolve-Time";
pub const HTTP_MS_LASTMOD: &str = "X-MS-LastMod";
pub const HTTP_POSIX_MODE: &str = "X-POSIX-Mode";

/// Session credential produced by the (external) OpenID handshake
#[derive(Debug, Clone)]
pub struct Session {
	pub password: String,
	pub expires_msec: u64,
}

/// External collaborator performing the OpenID handshake
#[async_trait::async_trait]
pub trait SessionAuthenticator: Send + Sync {
	async fn authenticate(&self) -> Result<Session, Error>;
}

/// Server-side timing reported by the MS, kept for observability
#[derive(Debug, Default, Clone, Copy)]
pub struct MsTiming {
	pub volume_time: u64,
	pub gateway_time: u64,
	pub total_time: u64,
	pub resolve_time: u64,
	pub last_mod: u64,
}

pub(crate) fn parse_timing(headers: &http::HeaderMap) -> MsTiming {
	let field = |name: &str| -> u64 {
		headers
			.get(name)
			.and_then(|v| v.to_str().ok())
			.and_then(|s| s.parse().ok())
			.unwrap_or(0)
	};
	MsTiming {
		volume_time: field(HTTP_VOLUME_TIME),
		gateway_time: field(HTTP_GATEWAY_TIME),
		total_time: field(HTTP_TOTAL_TIME),
		resolve_time: field(HTTP_RESOLVE_TIME),
		last_mod: field(HTTP_MS_LASTMOD),
	}
}

pub struct MsClient {
	pub base_url: String,
	pub volume_name: String,
	pub gateway_type: GatewayType,
	pub gateway_id: GatewayId,
	pub owner_id: UserId,

	my_key: RsaPrivateKey,
	authenticator: Arc<dyn SessionAuthenticator>,
	session: tokio::sync::Mutex<Option<Session>>,

	client: HttpClient,
	read_chan: tokio::sync::Mutex<()>,
	write_chan: tokio::sync::Mutex<()>,

	pub view: MsView,
	pub updates: UpdateQueue,
	timing: std::sync::Mutex<MsTiming>,
}

impl MsClient {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		base_url: String,
		volume_name: String,
		gateway_type: GatewayType,
		gateway_id: GatewayId,
		owner_id: UserId,
		my_key: RsaPrivateKey,
		volume_pubkey: rsa::RsaPublicKey,
		authenticator: Arc<dyn SessionAuthenticator>,
	) -> Arc<Self> {
		Arc::new(Self {
			base_url: base_url.trim_end_matches('/').to_string(),
			volume_name,
			gateway_type,
			gateway_id,
			owner_id,
			my_key,
			authenticator,
			session: tokio::sync::Mutex::new(None),
			client: new_http_client(),
			read_chan: tokio::sync::Mutex::new(()),
			write_chan: tokio::sync::Mutex::new(()),
			view: MsView::new(volume_pubkey),
			updates: UpdateQueue::new(),
			timing: std::sync::Mutex::new(MsTiming::default()),
		})
	}

	pub fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner, reload_freq: Duration) {
		bg.spawn_worker(ViewReloadWorker::new(self.clone(), reload_freq));
		bg.spawn_worker(UpdateUploadWorker::new(self.clone()));
	}

	pub fn my_key(&self) -> &RsaPrivateKey {
		&self.my_key
	}

	pub fn last_timing(&self) -> MsTiming {
		*self.timing.lock().unwrap()
	}

	// ---- HTTP plumbing ----

	async fn auth_header(&self) -> Result<String, Error> {
		let mut session = self.session.lock().await;
		let expired = match &*session {
			None => true,
			Some(s) => now_msec() >= s.expires_msec,
		};
		if expired {
			*session = Some(self.authenticator.authenticate().await?);
		}
		let s = session.as_ref().unwrap();
		let username = format!("{}_{}", self.gateway_type, self.gateway_id);
		Ok(crypto::basic_auth_header(&username, &s.password))
	}

	async fn expire_session(&self) {
		*self.session.lock().await = None;
	}

	async fn http_call(
		&self,
		chan: &tokio::sync::Mutex<()>,
		method: http::Method,
		path: &str,
		body: Option<Bytes>,
		extra_headers: &[(&str, String)],
	) -> Result<(u16, Bytes), Error> {
		let _guard = chan.lock().await;
		let url = format!("{}{}", self.base_url, path);

		for attempt in 0..2 {
			let auth = self.auth_header().await?;
			let mut builder = http::Request::builder()
				.method(method.clone())
				.uri(&url)
				.header(http::header::AUTHORIZATION, auth.as_str());
			if body.is_some() {
				builder = builder.header(http::header::CONTENT_TYPE, "application/x-msgpack");
			}
			for (name, value) in extra_headers.iter() {
				builder = builder.header(*name, value.as_str());
			}
			let req = builder.body(match &body {
				Some(b) => hyper::Body::from(b.clone()),
				None => hyper::Body::empty(),
			})?;

			let resp = self.client.request(req).await?;
			let status = resp.status().as_u16();

			// session password expired server-side: re-auth once
			if status == 401 && attempt == 0 {
				self.expire_session().await;
				continue;
			}

			*self.timing.lock().unwrap() = parse_timing(resp.headers());

			let mut body_stream = resp.into_body();
			let mut buf = BytesMut::new();
			while let Some(chunk) = body_stream.data().await {
				let chunk = chunk?;
				if buf.len() + chunk.len() > MS_MAX_REPLY {
					return Err(Error::TooLarge(MS_MAX_REPLY));
				}
				buf.extend_from_slice(&chunk);
			}
			return Ok((status, buf.freeze()));
		}
		unreachable!()
	}

	fn check_status(status: u16) -> Result<(), Error> {
		match status {
			200..=299 => Ok(()),
			401 | 403 => Err(Error::Unauthorized("MS rejected credentials".into())),
			404 => Err(Error::NotFound),
			413 => Err(Error::TooLarge(0)),
			504 => Err(Error::Timeout),
			s => Err(Error::RemoteHttp(s)),
		}
	}

	/// Parse, verify and unpack a signed MsReply
	fn decode_reply(&self, bytes: &Bytes) -> Result<MsReply, Error> {
		let reply: MsReply = rmp_serde::from_read_ref(bytes)?;
		crypto::verify_message(&reply, self.view.volume_pubkey())
			.map_err(|_| Error::BadSignature(0))?;
		self.view
			.process_reply_versions(reply.volume_version, reply.cert_version);
		if let Some(e) = ms_reply_error(reply.error) {
			return Err(e);
		}
		Ok(reply)
	}

	// ---- signed update RPCs ----

	/// Sign and POST a batch of updates, returning the verified reply
	pub(crate) async fn post_update_batch(&self, updates: Vec<MsUpdate>) -> Result<MsReply, Error> {
		let volume_id = self.view.require()?.volume_id;
		let mut msg = MsUpdates {
			volume_id,
			gateway_id: self.gateway_id,
			owner_id: self.owner_id,
			updates,
			signature: vec![],
		};
		crypto::sign_message(&mut msg, &self.my_key)?;
		let body = Bytes::from(rmp_serde::to_vec_named(&msg)?);

		// mode bits ride along in a header for the MS's access checks
		let posix_mode: Vec<(&str, String)> = msg
			.updates
			.first()
			.map(|u| vec![(HTTP_POSIX_MODE, format!("{:o}", u.entry.mode))])
			.unwrap_or_default();

		let path = format!("/FILE/{}", volume_id);
		let (status, bytes) = self
			.http_call(
				&self.write_chan,
				http::Method::POST,
				&path,
				Some(body),
				&posix_mode,
			)
			.await?;
		Self::check_status(status)?;
		self.decode_reply(&bytes)
	}

	async fn single_update(&self, op: UpdateOp, entry: &MsEntry) -> Result<MsReply, Error> {
		self.post_update_batch(vec![MsUpdate {
			op,
			entry: entry.clone(),
		}])
		.await
	}

	/// Create a file; the MS assigns its file_id
	pub async fn create(&self, entry: &MsEntry) -> Result<MsEntry, Error> {
		let reply = self.single_update(UpdateOp::Create, entry).await?;
		reply
			.entries
			.into_iter()
			.next()
			.ok_or_message("MS create reply carried no entry")
	}

	pub async fn mkdir(&self, entry: &MsEntry) -> Result<MsEntry, Error> {
		let reply = self.single_update(UpdateOp::Mkdir, entry).await?;
		reply
			.entries
			.into_iter()
			.next()
			.ok_or_message("MS mkdir reply carried no entry")
	}

	pub async fn update(&self, entry: &MsEntry) -> Result<(), Error> {
		self.single_update(UpdateOp::Update, entry).await.map(|_| ())
	}

	pub async fn rename(
		&self,
		entry: &MsEntry,
		new_parent_id: FileId,
		new_name: String,
	) -> Result<(), Error> {
		self.single_update(
			UpdateOp::Rename {
				new_parent_id,
				new_name,
			},
			entry,
		)
		.await
		.map(|_| ())
	}

	pub async fn delete(&self, entry: &MsEntry) -> Result<(), Error> {
		self.single_update(UpdateOp::Delete, entry).await.map(|_| ())
	}

	/// Data-bearing metadata update. The affected block list feeds the
	/// MS-side vacuum log; the reply carries the file's next write nonce.
	pub async fn update_write(
		&self,
		entry: &MsEntry,
		affected_blocks: Vec<BlockId>,
	) -> Result<WriteNonce, Error> {
		let reply = self
			.single_update(UpdateOp::UpdateWrite { affected_blocks }, entry)
			.await?;
		reply
			.write_nonce
			.ok_or_message("MS update_write reply carried no write nonce")
	}

	pub async fn remove_vacuum_log_entry(
		&self,
		entry: &MsEntry,
		manifest_mtime_sec: i64,
		manifest_mtime_nsec: u32,
	) -> Result<(), Error> {
		self.single_update(
			UpdateOp::VacuumRemove {
				manifest_mtime_sec,
				manifest_mtime_nsec,
			},
			entry,
		)
		.await
		.map(|_| ())
	}

	// ---- deferred updates ----

	/// Queue a metadata update for the uploader; repeated updates for the
	/// same file coalesce, nudging the deadline forward
	pub fn queue_update(&self, entry: MsEntry, deadline_ms: u64, deadline_delta_ms: u64) {
		self.updates.queue_update(
			MsUpdate {
				op: UpdateOp::Update,
				entry,
			},
			deadline_ms,
			deadline_delta_ms,
		);
	}

	/// Flush every queued update now
	pub async fn sync_updates(&self) -> Result<(), Error> {
		let batch = self.updates.pop_expired(u64::MAX);
		if batch.is_empty() {
			return Ok(());
		}
		match self.post_update_batch(batch.clone()).await {
			Ok(_) => Ok(()),
			Err(e) => {
				self.updates
					.reinsert_if_not_superseded(batch, now_msec() + 30_000);
				Err(e)
			}
		}
	}

	// ---- reads ----

	async fn get_reply(&self, path: String) -> Result<MsReply, Error> {
		let (status, bytes) = self
			.http_call(&self.read_chan, http::Method::GET, &path, None, &[])
			.await?;
		Self::check_status(status)?;
		self.decode_reply(&bytes)
	}

	pub async fn get_entry(&self, file_id: FileId) -> Result<MsEntry, Error> {
		let volume_id = self.view.require()?.volume_id;
		let reply = self
			.get_reply(format!("/ENTRY/{}/{}", volume_id, file_id_hex(file_id)))
			.await?;
		reply
			.entries
			.into_iter()
			.next()
			.ok_or(Error::NotFound)
	}

	pub async fn get_listing(&self, file_id: FileId) -> Result<Vec<MsEntry>, Error> {
		let volume_id = self.view.require()?.volume_id;
		let reply = self
			.get_reply(format!("/LISTING/{}/{}", volume_id, file_id_hex(file_id)))
			.await?;
		Ok(reply.entries)
	}

	/// Oldest unreclaimed write of the file, if any
	pub async fn peek_vacuum_log(&self, file_id: FileId) -> Result<Option<VacuumLogEntry>, Error> {
		let volume_id = self.view.require()?.volume_id;
		let reply = self
			.get_reply(format!("/VACUUM/{}/{}", volume_id, file_id_hex(file_id)))
			.await?;
		Ok(reply.vacuum_entries.into_iter().next())
	}

	// ---- view reload ----

	async fn fetch_volume(&self) -> Result<VolumeMetadata, Error> {
		let path = format!("/VOLUME/{}", self.volume_name);
		let (status, bytes) = self
			.http_call(&self.read_chan, http::Method::GET, &path, None, &[])
			.await?;
		Self::check_status(status)?;
		let volume: VolumeMetadata = rmp_serde::from_read_ref(&bytes)?;
		crypto::verify_message(&volume, self.view.volume_pubkey())
			.map_err(|_| Error::BadSignature(0))?;
		Ok(volume)
	}

	async fn fetch_cert_manifest(
		&self,
		volume_id: VolumeId,
		cert_version: u64,
	) -> Result<CertManifest, Error> {
		let path = format!("/CERTS/{}/manifest.{}", volume_id, cert_version);
		let (status, bytes) = self
			.http_call(&self.read_chan, http::Method::GET, &path, None, &[])
			.await?;
		Self::check_status(status)?;
		let manifest: CertManifest = rmp_serde::from_read_ref(&bytes)?;
		crypto::verify_message(&manifest, self.view.volume_pubkey())
			.map_err(|_| Error::BadSignature(0))?;
		Ok(manifest)
	}

	async fn fetch_cert(
		&self,
		volume_id: VolumeId,
		stub: &CertStub,
	) -> Result<GatewayCert, Error> {
		let path = format!(
			"/CERT/{}/{}/{}/{}",
			volume_id, stub.gateway_type, stub.gateway_id, stub.version
		);
		let (status, bytes) = self
			.http_call(&self.read_chan, http::Method::GET, &path, None, &[])
			.await?;
		Self::check_status(status)?;
		let msg: GatewayCertMsg = rmp_serde::from_read_ref(&bytes)?;
		crypto::verify_message(&msg, self.view.volume_pubkey())
			.map_err(|_| Error::BadSignature(stub.gateway_id))?;
		if msg.version < stub.version {
			return Err(Error::Message(format!(
				"MS served gateway {} cert version {} older than advertised {}",
				stub.gateway_id, msg.version, stub.version
			)));
		}
		GatewayCert::from_msg(&msg)
	}

	/// Refetch the volume record; on a version bump, refetch the changed
	/// certificates and swap in a fresh view. Returns whether anything
	/// changed.
	pub async fn reload_view(&self) -> Result<bool, Error> {
		let volume = self.fetch_volume().await?;
		let current = self.view.get();

		if let Some(cur) = &current {
			// a regressing MS is not to be trusted
			if volume.volume_version < cur.volume_version
				|| volume.cert_version < cur.cert_version
			{
				return Err(Error::Message(format!(
					"MS volume record regressed to {}/{} from {}/{}",
					volume.volume_version,
					volume.cert_version,
					cur.volume_version,
					cur.cert_version
				)));
			}
			if volume.volume_version == cur.volume_version
				&& volume.cert_version == cur.cert_version
			{
				return Ok(false);
			}
		}

		let cert_changed = match &current {
			None => true,
			Some(cur) => volume.cert_version != cur.cert_version,
		};

		let (mut fetched, mut dropped) = (vec![], vec![]);
		if cert_changed {
			let manifest = self
				.fetch_cert_manifest(volume.volume_id, volume.cert_version)
				.await?;
			let (to_fetch, gone) = cert_diff(current.as_deref(), &manifest);
			dropped = gone;
			for stub in to_fetch {
				fetched.push(self.fetch_cert(volume.volume_id, &stub).await?);
			}
		}

		let view = build_view(current.as_deref(), &volume, fetched, &dropped);
		self.view.install(view);
		Ok(true)
	}
}
