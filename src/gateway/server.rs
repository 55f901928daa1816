//! Gateway process lifecycle and the peer-facing HTTP server: block and
//! manifest GETs (with byte ranges and staleness redirects) and signed
//! WriteMsg POSTs.
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_range::HttpRange;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::watch;

use syndicate_cache::{BlockCache, CacheKey};
use syndicate_download::Downloader;
use syndicate_ms::{MsClient, Session, SessionAuthenticator, VolumeView};
use syndicate_ug::coordinator::{handle_write_msg, WriteMsg};
use syndicate_ug::driver::PassthroughDriver;
use syndicate_ug::ops;
use syndicate_ug::replication::RgClient;
use syndicate_ug::sync::build_signed_manifest;
use syndicate_ug::url::file_path_segment;
use syndicate_ug::vacuumer::Vacuumer;
use syndicate_ug::FsCore;
use syndicate_util::background::BackgroundRunner;
use syndicate_util::config::{read_config, Config};
use syndicate_util::crypto;
use syndicate_util::data::*;
use syndicate_util::error::{Error, OkOrMessage};

use crate::cli::{apply_overrides, Opt};

/// Session credential supplied on the command line or environment; the
/// OpenID handshake that normally produces it is an external concern
struct StaticAuthenticator {
	password: String,
}

#[async_trait::async_trait]
impl SessionAuthenticator for StaticAuthenticator {
	async fn authenticate(&self) -> Result<Session, Error> {
		Ok(Session {
			password: self.password.clone(),
			expires_msec: u64::MAX,
		})
	}
}

/// Routes the downloader's pre-dispatch hook through the storage driver
struct DriverConnector(Arc<dyn syndicate_ug::driver::StorageDriver>);

impl syndicate_download::CacheConnector for DriverConnector {
	fn rewrite(&self, request: &mut syndicate_download::RequestSpec) -> Result<(), Error> {
		self.0.connect_cache(request)
	}
}

async fn wait_from(mut chan: watch::Receiver<bool>) {
	while !*chan.borrow() {
		if chan.changed().await.is_err() {
			return;
		}
	}
}

/// The gateway id is not known until we see our own certificate, but MS
/// requests authenticate with it. Probe with a provisional identity, find
/// our certificate by name, then build the real client around it.
async fn bootstrap_ms(
	config: &Config,
	my_key: rsa::RsaPrivateKey,
	volume_pubkey: rsa::RsaPublicKey,
	authenticator: Arc<dyn SessionAuthenticator>,
) -> Result<Arc<MsClient>, Error> {
	let probe = MsClient::new(
		config.ms_url.clone(),
		config.volume_name.clone(),
		GatewayType::UG,
		0,
		0,
		my_key.clone(),
		volume_pubkey.clone(),
		authenticator.clone(),
	);
	probe.reload_view().await?;
	let view = probe.view.require()?;

	let cert = view
		.certs_of_type(GatewayType::UG)
		.values()
		.find(|c| c.name == config.gateway_name)
		.ok_or_message(format!(
			"gateway {} is not registered in volume {}",
			config.gateway_name, config.volume_name
		))?;

	let ms = MsClient::new(
		config.ms_url.clone(),
		config.volume_name.clone(),
		GatewayType::UG,
		cert.gateway_id,
		cert.owner_id,
		my_key,
		volume_pubkey,
		authenticator,
	);
	ms.view.install(VolumeView::clone(&view));
	Ok(ms)
}

pub async fn run_gateway(opt: Opt) -> Result<(), Error> {
	info!("Loading configuration...");
	let mut config = read_config(opt.config_file.clone())?;
	apply_overrides(&mut config, &opt);

	let volume_pubkey = crypto::load_public_key_file(&config.volume_pubkey_path)?;
	let my_key = crypto::load_private_key_file(&config.gateway_key_path)?;

	let password = match &opt.password {
		Some(p) => p.clone(),
		None => std::env::var("SYNDICATE_PASSWORD").ok().ok_or_message(
			"no session password; pass -p or set SYNDICATE_PASSWORD",
		)?,
	};
	let authenticator = Arc::new(StaticAuthenticator { password });

	info!("Contacting metadata service at {}...", config.ms_url);
	let ms = bootstrap_ms(&config, my_key, volume_pubkey, authenticator).await?;
	let view = ms.view.require()?;
	info!(
		"Bound to volume {} as gateway {} (view {}/{})",
		view.name, ms.gateway_id, view.volume_version, view.cert_version
	);

	if let Some(pidfile) = &config.pidfile_path {
		std::fs::write(pidfile, format!("{}\n", std::process::id()))?;
	}

	// cache limits are configured in bytes, enforced in blocks
	let soft_limit = (config.cache_soft_limit / view.blocksize).max(1) as usize;
	let hard_limit = (config.cache_hard_limit / view.blocksize).max(2) as usize;
	let cache = BlockCache::new(
		view.volume_id,
		config.data_root.clone(),
		soft_limit,
		hard_limit,
	);
	let downloader = Downloader::new(
		"gateway",
		Duration::from_millis(config.transfer_timeout_ms),
	);
	let driver: Arc<dyn syndicate_ug::driver::StorageDriver> = Arc::new(PassthroughDriver);
	downloader.set_cache_connector(Arc::new(DriverConnector(driver.clone())));
	let rg = RgClient::new(ms.clone(), downloader.clone());
	let core = FsCore::new(
		ms.clone(),
		cache.clone(),
		downloader.clone(),
		rg.clone(),
		driver,
		config.max_downloads,
	)?;
	let vacuumer = Vacuumer::new(&core);

	info!("Spawning workers...");
	let watch_cancel = watch_shutdown_signal();
	let (background, await_background_done) = BackgroundRunner::new(watch_cancel.clone());
	cache.spawn_workers(&background);
	downloader.spawn_workers(&background);
	ms.spawn_workers(&background, Duration::from_millis(config.view_reload_freq_ms));
	rg.spawn_workers(&background, config.replica_workers);
	vacuumer.spawn_workers(&background);

	if config.tls_cert_path.is_some() || config.tls_key_path.is_some() {
		info!("TLS material configured; termination is expected from the fronting listener");
	}

	let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
	info!("Serving peer traffic on {}...", addr);
	let shared = Arc::new(GatewayServer { core: core.clone() });
	let make_svc = make_service_fn(move |_| {
		let shared = shared.clone();
		async move {
			Ok::<_, Infallible>(service_fn(move |req| {
				let shared = shared.clone();
				async move { Ok::<_, Infallible>(shared.handle(req).await) }
			}))
		}
	});
	let server = hyper::Server::bind(&addr)
		.serve(make_svc)
		.with_graceful_shutdown(wait_from(watch_cancel.clone()));
	if let Err(e) = server.await {
		error!("Peer server exited with error: {}", e);
	}

	info!("Shutting down...");
	// teardown mirrors construction, in reverse
	rg.stop();
	downloader.stop();
	cache.stop();
	drop(core);
	let _ = await_background_done.await;

	if let Some(pidfile) = &config.pidfile_path {
		let _ = std::fs::remove_file(pidfile);
	}
	info!("Cleaning up...");
	Ok(())
}

#[cfg(unix)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::unix::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
		let mut sigterm =
			signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received SIGINT, shutting down."),
			_ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}

#[cfg(not(unix))]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		tokio::signal::ctrl_c()
			.await
			.expect("Failed to install Ctrl-C handler");
		info!("Received Ctrl-C, shutting down.");
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}

// ---- request handling ----

pub struct GatewayServer {
	pub core: Arc<FsCore>,
}

/// What a data URL names
#[derive(Debug, Clone, PartialEq)]
pub enum DataPath {
	Block {
		fs_path: String,
		file_version: FileVersion,
		block_id: BlockId,
		block_version: BlockVersion,
	},
	Manifest {
		fs_path: String,
		file_version: FileVersion,
		mtime: (i64, u32),
	},
	File {
		fs_path: String,
	},
}

fn decode_segment(seg: &str) -> Result<String, Error> {
	percent_encoding::percent_decode_str(seg)
		.decode_utf8()
		.map(|s| s.to_string())
		.map_err(|_| Error::InvalidRequest(format!("bad path segment {}", seg)))
}

/// Parse `/{type}/{volume}/{fs_path}.{version}/{block}.{version}` and its
/// manifest and plain-file variants
pub fn parse_data_path(path: &str, volume_id: VolumeId, is_post: bool) -> Result<DataPath, Error> {
	let mut segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
	if segs.len() < 3 {
		return Err(Error::InvalidRequest(format!("short data path {}", path)));
	}
	if GatewayType::from_str(segs[0]) != Some(GatewayType::UG) {
		return Err(Error::InvalidRequest(format!(
			"not a UG path: {}",
			path
		)));
	}
	let vol: VolumeId = segs[1]
		.parse()
		.map_err(|_| Error::InvalidRequest(format!("bad volume id in {}", path)))?;
	if vol != volume_id {
		return Err(Error::NotFound);
	}
	segs.drain(..2);

	if is_post {
		let mut fs_path = String::new();
		for seg in segs {
			fs_path.push('/');
			fs_path.push_str(&decode_segment(seg)?);
		}
		return Ok(DataPath::File { fs_path });
	}

	// the last segment names a block or a manifest
	let data_seg = segs
		.pop()
		.ok_or_else(|| Error::InvalidRequest("missing data segment".into()))?;

	// the remaining path's final component carries the file version
	let versioned = segs
		.pop()
		.ok_or_else(|| Error::InvalidRequest("missing file path".into()))?;
	let dot = versioned
		.rfind('.')
		.ok_or_else(|| Error::InvalidRequest(format!("unversioned file path {}", path)))?;
	let file_version: FileVersion = versioned[dot + 1..]
		.parse()
		.map_err(|_| Error::InvalidRequest(format!("bad file version in {}", path)))?;
	let mut fs_path = String::new();
	for seg in segs {
		fs_path.push('/');
		fs_path.push_str(&decode_segment(seg)?);
	}
	fs_path.push('/');
	fs_path.push_str(&decode_segment(&versioned[..dot])?);

	let parts: Vec<&str> = data_seg.split('.').collect();
	match parts.as_slice() {
		["manifest", sec, nsec] => Ok(DataPath::Manifest {
			fs_path,
			file_version,
			mtime: (
				sec.parse()
					.map_err(|_| Error::InvalidRequest("bad manifest time".into()))?,
				nsec.parse()
					.map_err(|_| Error::InvalidRequest("bad manifest time".into()))?,
			),
		}),
		[block, version] => Ok(DataPath::Block {
			fs_path,
			file_version,
			block_id: block
				.parse()
				.map_err(|_| Error::InvalidRequest("bad block id".into()))?,
			block_version: version
				.parse()
				.map_err(|_| Error::InvalidRequest("bad block version".into()))?,
		}),
		_ => Err(Error::InvalidRequest(format!(
			"unrecognized data segment {}",
			data_seg
		))),
	}
}

fn error_response(e: &Error) -> Response<Body> {
	let status =
		StatusCode::from_u16(e.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	Response::builder()
		.status(status)
		.body(Body::from(format!("{}\n", e)))
		.unwrap()
}

fn redirect_response(location: String) -> Response<Body> {
	Response::builder()
		.status(StatusCode::FOUND)
		.header(http::header::LOCATION, location)
		.body(Body::empty())
		.unwrap()
}

impl GatewayServer {
	pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let res = self.dispatch(req).await;
		match res {
			Ok(resp) => resp,
			Err(e) => {
				debug!("{} {} -> {}", method, path, e);
				error_response(&e)
			}
		}
	}

	async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
		let path = req.uri().path().to_string();
		let is_post = req.method() == Method::POST;
		let parsed = parse_data_path(&path, self.core.volume_id, is_post)?;

		match (req.method().clone(), parsed) {
			(Method::GET, DataPath::Block {
				fs_path,
				file_version,
				block_id,
				block_version,
			}) => {
				self.serve_block(&req, &fs_path, file_version, block_id, block_version)
					.await
			}
			(Method::GET, DataPath::Manifest {
				fs_path,
				file_version,
				mtime,
			}) => self.serve_manifest(&fs_path, file_version, mtime).await,
			(Method::POST, DataPath::File { fs_path }) => self.serve_writemsg(req, &fs_path).await,
			_ => Err(Error::InvalidRequest("unsupported method for path".into())),
		}
	}

	async fn serve_block(
		&self,
		req: &Request<Body>,
		fs_path: &str,
		file_version: FileVersion,
		block_id: BlockId,
		block_version: BlockVersion,
	) -> Result<Response<Body>, Error> {
		let core = &self.core;
		let fent = core.resolve(fs_path).await?;
		ops::ensure_manifest(core, fs_path, &fent).await?;

		let st = fent.lock.read().await;

		// asked for an old file version: point at the current one
		if st.file_version != file_version {
			let current = st
				.manifest
				.blocks
				.get(&block_id)
				.ok_or(Error::NotFound)?;
			let location = format!(
				"{}/{}.{}",
				file_path_segment(GatewayType::UG, core.volume_id, fs_path, st.file_version),
				block_id,
				current.block_version
			);
			return Ok(redirect_response(location));
		}

		let info = st.manifest.blocks.get(&block_id).ok_or(Error::NotFound)?;
		if info.block_version != block_version {
			if info.block_version > block_version {
				let location = format!(
					"{}/{}.{}",
					file_path_segment(GatewayType::UG, core.volume_id, fs_path, st.file_version),
					block_id,
					info.block_version
				);
				return Ok(redirect_response(location));
			}
			return Err(Error::NotFound);
		}

		// serve from dirty data first, then the cache
		let data = match st.dirty_blocks.get(&block_id) {
			Some(db) if db.block_version == block_version => db.data.clone(),
			_ => {
				let key = CacheKey::new(st.file_id, st.file_version, block_id, block_version);
				core.cache.read_cached_block(&key).await?
			}
		};
		drop(st);

		// byte ranges are honored on blocks
		if let Some(range_header) = req.headers().get(http::header::RANGE) {
			let range_str = range_header
				.to_str()
				.map_err(|_| Error::InvalidRequest("bad range header".into()))?;
			let ranges = HttpRange::parse(range_str, data.len() as u64)
				.map_err(|_| Error::InvalidRequest("unsatisfiable range".into()))?;
			if let Some(r) = ranges.first() {
				let start = r.start as usize;
				let end = (r.start + r.length) as usize;
				return Ok(Response::builder()
					.status(StatusCode::PARTIAL_CONTENT)
					.header(
						http::header::CONTENT_RANGE,
						format!("bytes {}-{}/{}", start, end - 1, data.len()),
					)
					.body(Body::from(data.slice(start..end)))?);
			}
		}

		Ok(Response::new(Body::from(data)))
	}

	async fn serve_manifest(
		&self,
		fs_path: &str,
		file_version: FileVersion,
		mtime: (i64, u32),
	) -> Result<Response<Body>, Error> {
		let core = &self.core;
		let fent = core.resolve(fs_path).await?;
		ops::ensure_manifest(core, fs_path, &fent).await?;

		let st = fent.lock.read().await;

		// only the coordinator serves manifests; everyone else redirects
		if st.coordinator_id != core.gateway_id {
			let cert = core.cert_for(st.coordinator_id)?;
			return Ok(redirect_response(syndicate_ug::url::manifest_url(
				&cert,
				core.volume_id,
				fs_path,
				st.file_version,
				st.manifest.mtime(),
			)));
		}

		let current = st.manifest.mtime();
		if st.file_version == file_version && current == mtime {
			let body = build_signed_manifest(core, &st).await?;
			return Ok(Response::new(Body::from(body)));
		}
		if st.file_version > file_version || current > mtime {
			// stale request: emit the URL of the newer manifest
			let location = format!(
				"{}/manifest.{}.{}",
				file_path_segment(GatewayType::UG, core.volume_id, fs_path, st.file_version),
				current.0,
				current.1
			);
			return Ok(redirect_response(location));
		}
		Err(Error::NotFound)
	}

	async fn serve_writemsg(
		&self,
		req: Request<Body>,
		_fs_path: &str,
	) -> Result<Response<Body>, Error> {
		let content_type = req
			.headers()
			.get(http::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.ok_or_else(|| Error::InvalidRequest("missing content type".into()))?
			.to_string();
		let boundary = multer::parse_boundary(&content_type)
			.map_err(|e| Error::InvalidRequest(format!("bad multipart request: {}", e)))?;

		let mut multipart = multer::Multipart::new(req.into_body(), boundary);
		let mut msg_bytes: Option<Bytes> = None;
		while let Some(field) = multipart
			.next_field()
			.await
			.map_err(|e| Error::InvalidRequest(format!("bad multipart request: {}", e)))?
		{
			if field.name() == Some("WriteMsg") {
				msg_bytes = Some(
					field
						.bytes()
						.await
						.map_err(|e| Error::InvalidRequest(format!("bad WriteMsg field: {}", e)))?,
				);
				break;
			}
		}
		let msg_bytes = msg_bytes
			.ok_or_else(|| Error::InvalidRequest("no WriteMsg field in request".into()))?;

		let msg = WriteMsg::decode(&msg_bytes)?;
		let reply = handle_write_msg(&self.core, msg).await?;

		Ok(Response::builder()
			.header(http::header::CONTENT_TYPE, "application/octet-stream")
			.body(Body::from(reply.encode()?))?)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_parse_data_path() {
		match parse_data_path("/UG/7/dir/file.3/5.12345", 7, false).unwrap() {
			DataPath::Block {
				fs_path,
				file_version,
				block_id,
				block_version,
			} => {
				assert_eq!(fs_path, "/dir/file");
				assert_eq!(file_version, 3);
				assert_eq!(block_id, 5);
				assert_eq!(block_version, 12345);
			}
			other => panic!("unexpected parse {:?}", other),
		}

		match parse_data_path("/UG/7/dir/file.3/manifest.100.200", 7, false).unwrap() {
			DataPath::Manifest {
				fs_path,
				file_version,
				mtime,
			} => {
				assert_eq!(fs_path, "/dir/file");
				assert_eq!(file_version, 3);
				assert_eq!(mtime, (100, 200));
			}
			other => panic!("unexpected parse {:?}", other),
		}

		match parse_data_path("/UG/7/dir/file", 7, true).unwrap() {
			DataPath::File { fs_path } => assert_eq!(fs_path, "/dir/file"),
			other => panic!("unexpected parse {:?}", other),
		}

		// volume mismatch
		assert!(matches!(
			parse_data_path("/UG/8/dir/file.3/0.1", 7, false),
			Err(Error::NotFound)
		));
		// wrong gateway type
		assert!(parse_data_path("/RG/7/dir/file.3/0.1", 7, false).is_err());
		// escaped segments decode
		match parse_data_path("/UG/7/has%20space/x.1/0.2", 7, false).unwrap() {
			DataPath::Block { fs_path, .. } => assert_eq!(fs_path, "/has space/x"),
			other => panic!("unexpected parse {:?}", other),
		}
	}

	#[test]
	fn test_parse_data_path_negative_versions() {
		// negative file versions parse (i64); odd but representable
		match parse_data_path("/UG/7/f.-2/0.1", 7, false).unwrap() {
			DataPath::Block { file_version, .. } => assert_eq!(file_version, -2),
			other => panic!("unexpected parse {:?}", other),
		}
	}
}
