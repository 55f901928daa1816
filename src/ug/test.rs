use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rsa::{RsaPrivateKey, RsaPublicKey};

use syndicate_cache::BlockCache;
use syndicate_download::Downloader;
use syndicate_ms::*;
use syndicate_util::crypto;
use syndicate_util::data::*;
use syndicate_util::error::Error;

use crate::coordinator::{encode_writemsg_form, WriteMsg, WriteMsgKind};
use crate::core::FsCore;
use crate::driver::PassthroughDriver;
use crate::fent::*;
use crate::manifest::*;
use crate::ops;
use crate::replication::RgClient;
use crate::url;
use crate::vacuumer::Vacuumer;

const TEST_BLOCKSIZE: u64 = 16;
const SELF_GATEWAY: GatewayId = 10;

fn test_key() -> RsaPrivateKey {
	static KEY: std::sync::OnceLock<RsaPrivateKey> = std::sync::OnceLock::new();
	KEY.get_or_init(|| {
		let mut rng = rand::rngs::OsRng;
		RsaPrivateKey::new(&mut rng, 2048).unwrap()
	})
	.clone()
}

fn dir_entry(file_id: FileId, name: &str, parent_id: FileId) -> MsEntry {
	MsEntry {
		file_id,
		entry_type: EntryType::Directory,
		name: name.to_string(),
		parent_id,
		file_version: 1,
		write_nonce: 0,
		coordinator_id: SELF_GATEWAY,
		owner_id: 100,
		volume_id: 1,
		mode: 0o755,
		size: TEST_BLOCKSIZE,
		mtime_sec: 1000,
		mtime_nsec: 0,
		ctime_sec: 1000,
		ctime_nsec: 0,
		manifest_mtime_sec: 1000,
		manifest_mtime_nsec: 0,
	}
}

fn file_entry(file_id: FileId, name: &str, coordinator_id: GatewayId) -> MsEntry {
	MsEntry {
		entry_type: EntryType::File,
		coordinator_id,
		mode: 0o644,
		size: 0,
		..dir_entry(file_id, name, 1)
	}
}

struct NoAuth;

#[async_trait::async_trait]
impl SessionAuthenticator for NoAuth {
	async fn authenticate(&self) -> Result<Session, Error> {
		Ok(Session {
			password: "test".into(),
			expires_msec: u64::MAX,
		})
	}
}

fn test_core(data_root: PathBuf) -> Arc<FsCore> {
	let key = test_key();
	let volume_pubkey = RsaPublicKey::from(&key);
	let ms = MsClient::new(
		"http://127.0.0.1:1".into(),
		"testvolume".into(),
		GatewayType::UG,
		SELF_GATEWAY,
		100,
		key,
		volume_pubkey,
		Arc::new(NoAuth),
	);
	ms.view.install(VolumeView {
		volume_id: 1,
		name: "testvolume".into(),
		owner_id: 100,
		blocksize: TEST_BLOCKSIZE,
		volume_version: 1,
		cert_version: 1,
		root: dir_entry(1, "/", 0),
		ug_certs: HashMap::new(),
		rg_certs: HashMap::new(),
		ag_certs: HashMap::new(),
	});

	let cache = BlockCache::new(1, data_root, 100, 200);
	let downloader = Downloader::new("test", Duration::from_secs(5));
	let rg = RgClient::new(ms.clone(), downloader.clone());
	FsCore::new(
		ms,
		cache,
		downloader,
		rg,
		Arc::new(PassthroughDriver),
		4,
	)
	.unwrap()
}

fn scratch() -> (mktemp::Temp, PathBuf) {
	let tmp = mktemp::Temp::new_dir().unwrap();
	let path = tmp.as_ref().to_path_buf();
	(tmp, path)
}

/// A fent this gateway coordinates, with a live manifest
async fn coordinated_file(core: &Arc<FsCore>, file_id: FileId, name: &str) -> Arc<Fent> {
	let fent = core.ensure_fent(&file_entry(file_id, name, SELF_GATEWAY));
	let mut st = fent.lock.write().await;
	st.manifest_initialized = true;
	drop(st);
	fent
}

// ---- paths and urls ----

#[test]
fn test_split_path() {
	assert_eq!(FsCore::split_path("/a").unwrap(), ("/", "a"));
	assert_eq!(FsCore::split_path("/a/b/c").unwrap(), ("/a/b", "c"));
	assert_eq!(FsCore::split_path("/a/b/").unwrap(), ("/a", "b"));
	assert!(FsCore::split_path("/").is_err());
	assert!(FsCore::split_path("relative").is_err());
}

fn test_cert(gt: GatewayType) -> GatewayCert {
	GatewayCert {
		gateway_type: gt,
		gateway_id: 77,
		owner_id: 100,
		name: "peer".into(),
		host: "peer.example.com".into(),
		port: 32780,
		caps: CAP_READ_DATA,
		version: 1,
		public_key: RsaPublicKey::from(&test_key()),
		blocksize: None,
	}
}

#[test]
fn test_url_scheme() {
	let cert = test_cert(GatewayType::UG);
	assert_eq!(
		url::block_url(&cert, 7, "/dir/file", 3, 5, 12345),
		"http://peer.example.com:32780/UG/7/dir/file.3/5.12345"
	);
	assert_eq!(
		url::manifest_url(&cert, 7, "/dir/file", 3, (100, 200)),
		"http://peer.example.com:32780/UG/7/dir/file.3/manifest.100.200"
	);
	assert_eq!(
		url::writemsg_url(&cert, 7, "/dir/file"),
		"http://peer.example.com:32780/UG/7/dir/file"
	);
	// path segments are escaped
	assert_eq!(
		url::writemsg_url(&cert, 7, "/has space/x"),
		"http://peer.example.com:32780/UG/7/has%20space/x"
	);
}

// ---- manifests ----

#[test]
fn test_manifest_block_bookkeeping() {
	let mut m = Manifest::default();
	assert!(m.put_block(0, 100, 10).is_none());
	assert!(m.put_block(1, 101, 10).is_none());

	// superseding returns the old version
	let old = m.put_block(0, 200, 11).unwrap();
	assert_eq!(old.block_version, 100);
	assert_eq!(old.writer_id, 10);
	assert_eq!(m.block_version(0), Some(200));
	assert_eq!(m.block_writer(0), Some(11));

	// truncation cuts everything at or beyond the boundary
	m.put_block(2, 102, 10);
	m.put_block(3, 103, 10);
	let cut = m.truncate_blocks(2);
	assert_eq!(
		cut.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
		vec![2, 3]
	);
	assert_eq!(m.blocks.len(), 2);
}

#[test]
fn test_manifest_freshness() {
	let mut m = Manifest::default();
	m.set_mtime((100, 5));
	assert!(m.is_newer_than((100, 4)));
	assert!(m.is_newer_than((99, 999)));
	assert!(!m.is_newer_than((100, 5)));
	assert!(!m.is_newer_than((101, 0)));
}

#[test]
fn test_manifest_msg_roundtrip() {
	let key = test_key();
	let pubkey = RsaPublicKey::from(&key);

	let mut m = Manifest {
		file_version: 2,
		size: 48,
		mtime_sec: 1234,
		mtime_nsec: 5678,
		blocks: Default::default(),
	};
	m.put_block(0, 100, 10);
	m.put_block(1, 101, 11);
	m.put_block(2, 102, 10);

	let mut msg = ManifestMsg::from_manifest(&m, 1, 42, 100, 10);
	crypto::sign_message(&mut msg, &key).unwrap();

	let bytes = rmp_serde::to_vec_named(&msg).unwrap();
	let decoded: ManifestMsg = rmp_serde::from_read_ref(&bytes).unwrap();
	crypto::verify_message(&decoded, &pubkey).unwrap();
	assert_eq!(decoded.to_manifest(), m);

	let mut tampered = decoded;
	tampered.blocks[1].1 = 999;
	assert!(crypto::verify_message(&tampered, &pubkey).is_err());
}

// ---- write protocol messages ----

#[tokio::test]
async fn test_writemsg_sign_and_form_encoding() {
	let (_tmp, path) = scratch();
	let core = test_core(path);

	let msg = WriteMsg::new(
		&core,
		WriteMsgKind::Prepare {
			blocks: vec![(0, 100), (1, 101)],
			size: 32,
		},
		42,
		1,
		"/a",
		7,
	)
	.signed(&core)
	.unwrap();

	// the signature covers the whole message
	let pubkey = RsaPublicKey::from(&test_key());
	crypto::verify_message(&msg, &pubkey).unwrap();

	let encoded = msg.encode().unwrap();
	let decoded = WriteMsg::decode(&encoded).unwrap();
	assert_eq!(decoded, msg);

	let (content_type, body) = encode_writemsg_form(&encoded);
	assert!(content_type.starts_with("multipart/form-data; boundary="));
	let boundary = content_type.split('=').nth(1).unwrap();
	let body_str = String::from_utf8_lossy(&body);
	assert!(body_str.starts_with(&format!("--{}", boundary)));
	assert!(body_str.contains("name=\"WriteMsg\""));
	assert!(body_str.trim_end().ends_with(&format!("--{}--", boundary)));
}

#[test]
fn test_resolve_location() {
	assert_eq!(
		url::resolve_location("http://h:1/UG/7/a.1/0.5", "/UG/7/a.1/0.9"),
		"http://h:1/UG/7/a.1/0.9"
	);
	assert_eq!(
		url::resolve_location("http://h:1/x", "http://other:2/y"),
		"http://other:2/y"
	);
}

/// A view whose UG bundle contains this gateway itself, so locally signed
/// messages verify
fn install_self_cert(core: &Arc<FsCore>) {
	let view = core.ms.view.require().unwrap();
	let mut view = VolumeView::clone(&view);
	view.ug_certs.insert(
		SELF_GATEWAY,
		GatewayCert {
			gateway_type: GatewayType::UG,
			gateway_id: SELF_GATEWAY,
			owner_id: 100,
			name: "self".into(),
			host: "localhost".into(),
			port: 32780,
			caps: CAP_READ_DATA | CAP_WRITE_DATA | CAP_COORDINATE,
			version: 1,
			public_key: RsaPublicKey::from(&test_key()),
			blocksize: None,
		},
	);
	core.ms.view.install(view);
}

#[tokio::test]
async fn test_prepare_against_stale_version_is_rejected() {
	let (_tmp, path) = scratch();
	let core = test_core(path);
	install_self_cert(&core);
	let _fent = coordinated_file(&core, 42, "a").await;

	// the sender believes the file is one version behind
	let msg = WriteMsg::new(
		&core,
		WriteMsgKind::Prepare {
			blocks: vec![(0, 100)],
			size: 16,
		},
		42,
		0,
		"/a",
		0,
	)
	.signed(&core)
	.unwrap();

	let reply = crate::coordinator::handle_write_msg(&core, msg).await.unwrap();
	match reply.kind {
		WriteMsgKind::Error { code } => assert_eq!(code, -116),
		other => panic!("expected stale error, got {:?}", other),
	}
}

#[tokio::test]
async fn test_prepare_redirects_to_real_coordinator() {
	let (_tmp, path) = scratch();
	let core = test_core(path);
	install_self_cert(&core);
	// someone else coordinates this file
	let fent = core.ensure_fent(&file_entry(42, "a", 99));
	{
		let mut st = fent.lock.write().await;
		st.manifest_initialized = true;
	}

	let msg = WriteMsg::new(
		&core,
		WriteMsgKind::Prepare {
			blocks: vec![(0, 100)],
			size: 16,
		},
		42,
		1,
		"/a",
		0,
	)
	.signed(&core)
	.unwrap();

	let reply = crate::coordinator::handle_write_msg(&core, msg).await.unwrap();
	match reply.kind {
		WriteMsgKind::CoordinatorChange { new_coordinator } => assert_eq!(new_coordinator, 99),
		other => panic!("expected coordinator change, got {:?}", other),
	}
}

#[tokio::test]
async fn test_writemsg_bad_signature_rejected() {
	let (_tmp, path) = scratch();
	let core = test_core(path);
	install_self_cert(&core);
	let _fent = coordinated_file(&core, 42, "a").await;

	let mut msg = WriteMsg::new(
		&core,
		WriteMsgKind::Detach,
		42,
		1,
		"/a",
		0,
	)
	.signed(&core)
	.unwrap();
	// tamper after signing
	msg.write_nonce = 999;

	match crate::coordinator::handle_write_msg(&core, msg).await {
		Err(Error::BadSignature(SELF_GATEWAY)) => (),
		other => panic!("expected BadSignature, got {:?}", other.map(|_| ())),
	}
}

// ---- fent ----

#[test]
fn test_fent_snapshot_roundtrip() {
	let entry = file_entry(42, "a", SELF_GATEWAY);
	let st = FentState::from_ms_entry(&entry);
	let snapshot = st.snapshot(SELF_GATEWAY, "/a");
	let back = snapshot.to_ms_entry();
	assert_eq!(back.file_id, entry.file_id);
	assert_eq!(back.name, entry.name);
	assert_eq!(back.file_version, entry.file_version);
	assert_eq!(back.coordinator_id, entry.coordinator_id);
	assert_eq!(back.size, entry.size);
	assert_eq!(back.mtime_sec, entry.mtime_sec);
}

#[test]
fn test_next_block_version_monotone() {
	let entry = file_entry(42, "a", SELF_GATEWAY);
	let mut st = FentState::from_ms_entry(&entry);

	let v1 = st.next_block_version(0);
	st.manifest.put_block(0, v1, SELF_GATEWAY);
	let v2 = st.next_block_version(0);
	assert!(v2 > v1);

	// a manifest from the future still yields a newer version
	st.manifest.put_block(0, i64::MAX - 1, SELF_GATEWAY);
	assert_eq!(st.next_block_version(0), i64::MAX);
}

// ---- buffered write / read ----

#[tokio::test]
async fn test_write_then_read_buffered() {
	let (_tmp, path) = scratch();
	let core = test_core(path);
	let fent = coordinated_file(&core, 42, "a").await;
	let fh = FileHandle::new(fent, "/a".into(), false);

	assert_eq!(ops::write(&core, &fh, 0, b"hello world").await.unwrap(), 11);
	assert!(fh.is_dirty());

	let data = ops::read(&core, &fh, 0, 11).await.unwrap();
	assert_eq!(&data[..], b"hello world");

	// a write spanning a block boundary (blocksize 16)
	let long = b"0123456789abcdefghijklmnops";
	assert_eq!(
		ops::write(&core, &fh, 5, long).await.unwrap(),
		long.len()
	);
	let all = ops::read(&core, &fh, 0, 64).await.unwrap();
	assert_eq!(all.len(), 5 + long.len());
	assert_eq!(&all[..5], b"hello");
	assert_eq!(&all[5..], &long[..]);

	// reads past EOF are empty
	assert!(ops::read(&core, &fh, 1000, 10).await.unwrap().is_empty());

	// partial mid-file read
	let mid = ops::read(&core, &fh, 3, 8).await.unwrap();
	assert_eq!(&mid[..], &all[3..11]);
}

#[tokio::test]
async fn test_read_only_handle_rejects_writes() {
	let (_tmp, path) = scratch();
	let core = test_core(path);
	let fent = coordinated_file(&core, 42, "a").await;
	let fh = FileHandle::new(fent, "/a".into(), true);
	match ops::write(&core, &fh, 0, b"x").await {
		Err(Error::Unauthorized(_)) => (),
		other => panic!("expected Unauthorized, got {:?}", other),
	}
}

#[tokio::test]
async fn test_chown_unsupported() {
	let (_tmp, path) = scratch();
	let core = test_core(path);
	match ops::chown(&core, "/a", 5).await {
		Err(Error::Unsupported(_)) => (),
		other => panic!("expected Unsupported, got {:?}", other),
	}
}

// ---- truncate ----

#[tokio::test]
async fn test_truncate_locked_reshapes_manifest() {
	let (_tmp, path) = scratch();
	let core = test_core(path);
	// coordinated elsewhere so no metadata publish happens here
	let fent = core.ensure_fent(&file_entry(42, "a", 99));
	let mut st = fent.lock.write().await;
	st.manifest_initialized = true;
	st.size = 5 * TEST_BLOCKSIZE;
	for block_id in 0..5u64 {
		st.manifest
			.put_block(block_id, 1000 + block_id as i64, SELF_GATEWAY);
	}
	let old_version = st.file_version;

	ops::truncate_locked(&core, "/a", &mut st, 40, None)
		.await
		.unwrap();

	// 40 bytes at blocksize 16 keeps blocks 0..3
	assert_eq!(st.manifest.blocks.len(), 3);
	assert_eq!(st.size, 40);
	assert!(st.file_version > old_version);
	assert_eq!(st.manifest.file_version, st.file_version);

	// the cut blocks became garbage
	assert_eq!(st.garbage_blocks.len(), 2);
	assert!(st.garbage_blocks.contains_key(&(3, 1003)));
	assert!(st.garbage_blocks.contains_key(&(4, 1004)));
}

// ---- vacuumer ----

#[tokio::test]
async fn test_vacuumer_dedups_requests() {
	let (_tmp, path) = scratch();
	let core = test_core(path);
	let vac = Vacuumer::new(&core);
	let fent = coordinated_file(&core, 42, "a").await;
	let snapshot = {
		let st = fent.lock.read().await;
		st.snapshot(SELF_GATEWAY, "/a")
	};

	vac.write_bg("/a", snapshot.clone());
	vac.write_bg("/a", snapshot.clone());
	assert_eq!(vac.pending_len(), 1);

	// a log-entry request for the same write is distinct
	vac.log_entry_bg("/a", snapshot);
	assert_eq!(vac.pending_len(), 2);

	assert_eq!(vac.take_pending().len(), 2);
	assert_eq!(vac.pending_len(), 0);
}

// ---- resolution against the in-core tree ----

#[tokio::test]
async fn test_resolve_root_and_children() {
	let (_tmp, path) = scratch();
	let core = test_core(path);

	let root = core.resolve("/").await.unwrap();
	assert_eq!(root.file_id, core.root_id);

	// attach a child by hand and resolve it
	let child = core.ensure_fent(&file_entry(42, "a", SELF_GATEWAY));
	{
		let mut st = root.lock.write().await;
		st.children.as_mut().unwrap().insert("a".into(), 42);
	}
	let resolved = core.resolve("/a").await.unwrap();
	assert!(Arc::ptr_eq(&resolved, &child));
}

#[tokio::test]
async fn test_sync_nothing_to_flush() {
	let (_tmp, path) = scratch();
	let core = test_core(path);
	let fent = coordinated_file(&core, 42, "a").await;
	let fh = FileHandle::new(fent, "/a".into(), false);

	// clean handle: fsync is a no-op and must not touch the network
	ops::fsync(&core, &fh).await.unwrap();
}
