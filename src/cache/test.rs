use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use syndicate_util::error::Error;

use crate::manager::*;

fn scratch() -> (mktemp::Temp, PathBuf) {
	let tmp = mktemp::Temp::new_dir().unwrap();
	let path = tmp.as_ref().to_path_buf();
	(tmp, path)
}

fn test_cache(path: PathBuf, soft: usize, hard: usize) -> Arc<BlockCache> {
	BlockCache::new(7, path, soft, hard)
}

#[tokio::test]
async fn test_write_read_roundtrip() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 10, 20);

	let key = CacheKey::new(0x42, 1, 0, 1);
	let data = Bytes::from_static(b"hello world");

	let fut = cache.write_block_async(key, data.clone(), 0).await.unwrap();
	// still an ongoing write, not readable yet
	assert!(!cache.is_block_readable(&key).await);
	assert!(!fut.is_finalized());

	cache.tick().await;

	let res = fut.wait().await.unwrap();
	assert_eq!(res.key, key);
	assert_eq!(res.data, Some(data.clone()));
	assert!(cache.is_block_readable(&key).await);
	assert_eq!(cache.read_cached_block(&key).await.unwrap(), data);
	assert_eq!(cache.num_blocks(), 1);

	// a second write to the same key fails fast
	match cache.write_block_async(key, data, 0).await {
		Err(Error::Exists) => (),
		other => panic!("expected Exists, got {:?}", other.map(|_| ())),
	}
}

#[tokio::test]
async fn test_unshared_write_keeps_data() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 10, 20);

	let key = CacheKey::new(1, 1, 0, 1);
	let fut = cache
		.write_block_async(key, Bytes::from_static(b"x"), CACHE_FLAG_UNSHARED)
		.await
		.unwrap();
	cache.tick().await;
	let res = fut.wait().await.unwrap();
	assert_eq!(res.data, None);
}

#[tokio::test]
async fn test_hard_limit_backpressure() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 1, 2);
	let data = Bytes::from_static(b"block data");

	let f1 = cache
		.write_block_async(CacheKey::new(1, 1, 0, 1), data.clone(), 0)
		.await
		.unwrap();
	let f2 = cache
		.write_block_async(CacheKey::new(1, 1, 1, 1), data.clone(), 0)
		.await
		.unwrap();

	// both hard-limit slots are taken; a third write must block until an
	// eviction completes
	let cache2 = cache.clone();
	let data2 = data.clone();
	let third = tokio::spawn(async move {
		cache2
			.write_block_async(CacheKey::new(1, 1, 2, 1), data2, 0)
			.await
	});

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(!third.is_finished());

	// the worker writes both blocks, then evicts down to the soft limit,
	// freeing one slot
	cache.tick().await;
	f1.wait().await.unwrap();
	f2.wait().await.unwrap();

	let f3 = tokio::time::timeout(Duration::from_secs(5), third)
		.await
		.unwrap()
		.unwrap()
		.unwrap();
	cache.tick().await;
	f3.wait().await.unwrap();
}

#[tokio::test]
async fn test_soft_limit_eviction_order() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 4, 8);
	let data = Bytes::from_static(b"0123456789");

	for block_id in 0..10u64 {
		let key = CacheKey::new(0xf00d, 1, block_id, 1);
		let fut = cache.write_block_async(key, data.clone(), 0).await.unwrap();
		cache.tick().await;
		fut.wait().await.unwrap();
	}

	assert_eq!(cache.num_blocks(), 4);
	for block_id in 0..6u64 {
		assert!(
			!cache
				.is_block_readable(&CacheKey::new(0xf00d, 1, block_id, 1))
				.await
		);
	}
	for block_id in 6..10u64 {
		assert!(
			cache
				.is_block_readable(&CacheKey::new(0xf00d, 1, block_id, 1))
				.await
		);
	}
}

#[tokio::test]
async fn test_promotion_changes_eviction_order() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 2, 8);
	let data = Bytes::from_static(b"z");

	for block_id in 0..2u64 {
		cache
			.write_block_async(CacheKey::new(5, 1, block_id, 1), data.clone(), 0)
			.await
			.unwrap();
	}
	cache.tick().await;

	// promote block 0 so block 1 becomes the LRU head
	cache.promote_block(&CacheKey::new(5, 1, 0, 1));
	cache
		.write_block_async(CacheKey::new(5, 1, 2, 1), data.clone(), 0)
		.await
		.unwrap();
	cache.tick().await;

	assert_eq!(cache.num_blocks(), 2);
	assert!(cache.is_block_readable(&CacheKey::new(5, 1, 0, 1)).await);
	assert!(!cache.is_block_readable(&CacheKey::new(5, 1, 1, 1)).await);
	assert!(cache.is_block_readable(&CacheKey::new(5, 1, 2, 1)).await);
}

#[tokio::test]
async fn test_eviction_removes_empty_dirs() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 10, 20);

	let key = CacheKey::new(0xabc, 3, 9, 2);
	cache
		.write_block_async(key, Bytes::from_static(b"d"), 0)
		.await
		.unwrap();
	cache.tick().await;

	let dir = cache.file_dir(key.file_id, key.file_version);
	assert!(dir.is_dir());

	cache.evict_block(&key).await;
	assert!(!cache.is_block_readable(&key).await);
	assert!(!dir.exists());
	assert!(!dir.parent().unwrap().exists());
	assert_eq!(cache.num_blocks(), 0);
}

#[tokio::test]
async fn test_evict_block_async() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 10, 20);

	let key = CacheKey::new(1, 1, 1, 1);
	cache
		.write_block_async(key, Bytes::from_static(b"d"), 0)
		.await
		.unwrap();
	cache.tick().await;
	assert!(cache.is_block_readable(&key).await);

	cache.evict_block_async(&key);
	cache.tick().await;
	assert!(!cache.is_block_readable(&key).await);
}

#[tokio::test]
async fn test_evict_file() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 10, 20);

	for block_id in 0..3u64 {
		cache
			.write_block_async(
				CacheKey::new(0x11, 2, block_id, 4),
				Bytes::from_static(b"d"),
				0,
			)
			.await
			.unwrap();
	}
	cache.tick().await;
	assert_eq!(cache.num_blocks(), 3);

	cache.evict_file(0x11, 2).await.unwrap();
	assert_eq!(cache.num_blocks(), 0);
	for block_id in 0..3u64 {
		assert!(
			!cache
				.is_block_readable(&CacheKey::new(0x11, 2, block_id, 4))
				.await
		);
	}
}

#[tokio::test]
async fn test_reversion_file() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 10, 20);
	let data = Bytes::from_static(b"contents");

	for block_id in 0..2u64 {
		cache
			.write_block_async(CacheKey::new(0x77, 1, block_id, 5), data.clone(), 0)
			.await
			.unwrap();
	}
	cache.tick().await;

	cache.reversion_file(0x77, 1, 2).await.unwrap();

	for block_id in 0..2u64 {
		let old_key = CacheKey::new(0x77, 1, block_id, 5);
		let new_key = CacheKey::new(0x77, 2, block_id, 5);
		assert!(!cache.is_block_readable(&old_key).await);
		assert!(cache.is_block_readable(&new_key).await);
		assert_eq!(cache.read_cached_block(&new_key).await.unwrap(), data);
	}

	// reversioning a file with no cached blocks is a no-op
	cache.reversion_file(0xdead, 1, 2).await.unwrap();
}

#[tokio::test]
async fn test_stopped_cache_rejects_writes() {
	let (_tmp, path) = scratch();
	let cache = test_cache(path, 10, 20);
	cache.stop();
	match cache
		.write_block_async(CacheKey::new(1, 1, 1, 1), Bytes::from_static(b"d"), 0)
		.await
	{
		Err(Error::Busy) => (),
		other => panic!("expected Busy, got {:?}", other.map(|_| ())),
	}
}
