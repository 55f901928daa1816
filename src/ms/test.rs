use std::collections::HashMap;

use rsa::{RsaPrivateKey, RsaPublicKey};

use syndicate_util::crypto;
use syndicate_util::data::*;
use syndicate_util::error::Error;

use crate::client::parse_timing;
use crate::msg::*;
use crate::updates::UpdateQueue;
use crate::view::*;

fn entry(volume_id: VolumeId, file_id: FileId, size: u64) -> MsEntry {
	MsEntry {
		file_id,
		entry_type: EntryType::File,
		name: format!("file-{}", file_id),
		parent_id: 0,
		file_version: 1,
		write_nonce: 1,
		coordinator_id: 10,
		owner_id: 100,
		volume_id,
		mode: 0o644,
		size,
		mtime_sec: 1000,
		mtime_nsec: 0,
		ctime_sec: 1000,
		ctime_nsec: 0,
		manifest_mtime_sec: 1000,
		manifest_mtime_nsec: 0,
	}
}

fn update(volume_id: VolumeId, file_id: FileId, size: u64) -> MsUpdate {
	MsUpdate {
		op: UpdateOp::Update,
		entry: entry(volume_id, file_id, size),
	}
}

#[test]
fn test_queue_update_coalesces() {
	let queue = UpdateQueue::new();

	queue.queue_update(update(1, 7, 100), 5000, 1000);
	queue.queue_update(update(1, 7, 200), 9999, 1000);
	queue.queue_update(update(1, 8, 50), 6000, 1000);

	assert_eq!(queue.len(), 2);
	// file 7's deadline was nudged, not replaced
	assert_eq!(queue.next_deadline(), Some(6000));

	// flushing everything yields exactly one update per file, the latest
	let mut batch = queue.pop_expired(u64::MAX);
	batch.sort_by_key(|u| u.entry.file_id);
	assert_eq!(batch.len(), 2);
	assert_eq!(batch[0].entry.file_id, 7);
	assert_eq!(batch[0].entry.size, 200);
	assert_eq!(batch[1].entry.file_id, 8);
	assert!(queue.is_empty());
}

#[test]
fn test_pop_expired_respects_deadlines() {
	let queue = UpdateQueue::new();
	queue.queue_update(update(1, 1, 1), 1000, 0);
	queue.queue_update(update(1, 2, 2), 2000, 0);
	queue.queue_update(update(1, 3, 3), 3000, 0);

	let batch = queue.pop_expired(2000);
	assert_eq!(batch.len(), 2);
	assert_eq!(queue.len(), 1);
	assert_eq!(queue.next_deadline(), Some(3000));
}

#[test]
fn test_reinsert_if_not_superseded() {
	let queue = UpdateQueue::new();
	queue.queue_update(update(1, 1, 10), 1000, 0);
	let batch = queue.pop_expired(u64::MAX);
	assert_eq!(batch.len(), 1);

	// a newer update for file 1 lands while the batch is in flight
	queue.queue_update(update(1, 1, 20), 1000, 0);

	// the failed batch must not clobber it
	assert_eq!(queue.reinsert_if_not_superseded(batch, 5000), 0);
	let current = queue.pop_expired(u64::MAX);
	assert_eq!(current[0].entry.size, 20);

	// with nothing newer queued, the failed update is requeued
	let old = vec![update(1, 1, 10)];
	assert_eq!(queue.reinsert_if_not_superseded(old, 5000), 1);
	assert_eq!(queue.len(), 1);
}

#[test]
fn test_clear_update() {
	let queue = UpdateQueue::new();
	queue.queue_update(update(3, 9, 1), 1000, 0);
	assert_eq!(queue.clear_update(3, 9).unwrap().entry.file_id, 9);
	assert!(queue.clear_update(3, 9).is_none());
}

// ---- certificate diffing ----

// key generation is slow, share one pair across tests
fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
	static KEY: std::sync::OnceLock<RsaPrivateKey> = std::sync::OnceLock::new();
	let key = KEY.get_or_init(|| {
		let mut rng = rand::rngs::OsRng;
		RsaPrivateKey::new(&mut rng, 2048).unwrap()
	});
	(key.clone(), RsaPublicKey::from(key))
}

fn cert(gt: GatewayType, id: GatewayId, version: u64) -> GatewayCert {
	let (_, pubkey) = test_keypair();
	GatewayCert {
		gateway_type: gt,
		gateway_id: id,
		owner_id: 100,
		name: format!("gw-{}", id),
		host: "localhost".into(),
		port: 32780,
		caps: CAP_READ_DATA | CAP_WRITE_DATA,
		version,
		public_key: pubkey,
		blocksize: None,
	}
}

fn view_with_certs(certs: Vec<GatewayCert>) -> VolumeView {
	let mut view = VolumeView {
		volume_id: 1,
		name: "vol".into(),
		owner_id: 100,
		blocksize: 65536,
		volume_version: 1,
		cert_version: 1,
		root: entry(1, 0, 4096),
		ug_certs: HashMap::new(),
		rg_certs: HashMap::new(),
		ag_certs: HashMap::new(),
	};
	for c in certs {
		match c.gateway_type {
			GatewayType::UG => view.ug_certs.insert(c.gateway_id, c),
			GatewayType::RG => view.rg_certs.insert(c.gateway_id, c),
			GatewayType::AG => view.ag_certs.insert(c.gateway_id, c),
		};
	}
	view
}

fn stub(gt: GatewayType, id: GatewayId, version: u64) -> CertStub {
	CertStub {
		gateway_type: gt,
		gateway_id: id,
		version,
	}
}

#[test]
fn test_cert_diff() {
	let current = view_with_certs(vec![
		cert(GatewayType::UG, 1, 3),
		cert(GatewayType::RG, 2, 1),
		cert(GatewayType::RG, 3, 1),
	]);

	let manifest = CertManifest {
		volume_id: 1,
		cert_version: 2,
		certs: vec![
			// unchanged
			stub(GatewayType::UG, 1, 3),
			// bumped: refetch
			stub(GatewayType::RG, 2, 2),
			// regressed: keep local, no fetch
			// (gateway 3 advertises an older version than we hold)
			stub(GatewayType::RG, 3, 0),
			// brand new
			stub(GatewayType::AG, 4, 1),
		],
		signature: vec![],
	};

	let (to_fetch, dropped) = cert_diff(Some(&current), &manifest);
	assert_eq!(to_fetch.len(), 2);
	assert!(to_fetch.contains(&stub(GatewayType::RG, 2, 2)));
	assert!(to_fetch.contains(&stub(GatewayType::AG, 4, 1)));
	assert!(dropped.is_empty());
}

#[test]
fn test_cert_diff_drops_unlisted() {
	let current = view_with_certs(vec![cert(GatewayType::UG, 1, 1), cert(GatewayType::RG, 2, 1)]);
	let manifest = CertManifest {
		volume_id: 1,
		cert_version: 2,
		certs: vec![stub(GatewayType::UG, 1, 1)],
		signature: vec![],
	};
	let (to_fetch, dropped) = cert_diff(Some(&current), &manifest);
	assert!(to_fetch.is_empty());
	assert_eq!(dropped, vec![2]);
}

#[test]
fn test_cert_diff_empty_view_fetches_all() {
	let manifest = CertManifest {
		volume_id: 1,
		cert_version: 1,
		certs: vec![stub(GatewayType::UG, 1, 1), stub(GatewayType::RG, 2, 1)],
		signature: vec![],
	};
	let (to_fetch, dropped) = cert_diff(None, &manifest);
	assert_eq!(to_fetch.len(), 2);
	assert!(dropped.is_empty());
}

// ---- gateway message verification ----

#[test]
fn test_verify_gateway_message() {
	let (gw_key, gw_pubkey) = test_keypair();
	let (_, volume_pubkey) = test_keypair();

	let mut peer = cert(GatewayType::UG, 42, 1);
	peer.public_key = gw_pubkey;
	let view = view_with_certs(vec![peer]);

	let ms_view = MsView::new(volume_pubkey);

	let data = b"signed write message";
	let sig = crypto::sign_bytes(&gw_key, data).unwrap();

	// no view yet: stale, reload scheduled
	match ms_view.verify_gateway_message(100, 42, data, &sig) {
		Err(Error::Stale) => (),
		other => panic!("expected Stale, got {:?}", other),
	}

	ms_view.install(view);
	ms_view.verify_gateway_message(100, 42, data, &sig).unwrap();

	// wrong owner
	match ms_view.verify_gateway_message(101, 42, data, &sig) {
		Err(Error::Unauthorized(_)) => (),
		other => panic!("expected Unauthorized, got {:?}", other),
	}

	// unknown gateway: stale
	match ms_view.verify_gateway_message(100, 43, data, &sig) {
		Err(Error::Stale) => (),
		other => panic!("expected Stale, got {:?}", other),
	}

	// tampered payload
	match ms_view.verify_gateway_message(100, 42, b"other data", &sig) {
		Err(Error::BadSignature(42)) => (),
		other => panic!("expected BadSignature, got {:?}", other),
	}
}

#[test]
fn test_signed_updates_roundtrip() {
	let (key, pubkey) = test_keypair();
	let mut msg = MsUpdates {
		volume_id: 1,
		gateway_id: 10,
		owner_id: 100,
		updates: vec![update(1, 7, 4096)],
		signature: vec![],
	};
	crypto::sign_message(&mut msg, &key).unwrap();

	// serialize/deserialize keeps the signature valid
	let bytes = rmp_serde::to_vec_named(&msg).unwrap();
	let decoded: MsUpdates = rmp_serde::from_read_ref(&bytes).unwrap();
	crypto::verify_message(&decoded, &pubkey).unwrap();

	let mut tampered = decoded;
	tampered.updates[0].entry.size = 9999;
	assert!(crypto::verify_message(&tampered, &pubkey).is_err());
}

// ---- misc ----

#[test]
fn test_parse_timing_headers() {
	let mut headers = http::HeaderMap::new();
	headers.insert("X-Volume-Time", "12".parse().unwrap());
	headers.insert("X-Gateway-Time", "34".parse().unwrap());
	headers.insert("X-Total-Time", "46".parse().unwrap());
	headers.insert("X-MS-LastMod", "1700000000".parse().unwrap());

	let t = parse_timing(&headers);
	assert_eq!(t.volume_time, 12);
	assert_eq!(t.gateway_time, 34);
	assert_eq!(t.total_time, 46);
	assert_eq!(t.resolve_time, 0);
	assert_eq!(t.last_mod, 1_700_000_000);
}

#[test]
fn test_ms_reply_error_mapping() {
	assert!(ms_reply_error(0).is_none());
	assert!(matches!(ms_reply_error(-2), Some(Error::NotFound)));
	assert!(matches!(ms_reply_error(-17), Some(Error::Exists)));
	assert!(matches!(ms_reply_error(-39), Some(Error::NotEmpty)));
	assert!(matches!(ms_reply_error(-116), Some(Error::Stale)));
	assert!(matches!(ms_reply_error(-999), Some(Error::Message(_))));
}
