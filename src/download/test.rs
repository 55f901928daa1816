use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};

use syndicate_util::error::Error;

use crate::batch::*;
use crate::context::*;
use crate::manager::Downloader;
use crate::set::DownloadSet;

/// Local server: `/data` answers with a body, `/slow` stalls, `/big`
/// answers with more bytes than the tests' length bound
async fn test_handler(req: Request<Body>) -> Result<Response<Body>, Infallible> {
	let resp = match req.uri().path() {
		"/data" => Response::new(Body::from("payload bytes")),
		"/slow" => {
			tokio::time::sleep(Duration::from_secs(30)).await;
			Response::new(Body::from("too late"))
		}
		"/big" => Response::new(Body::from(vec![0u8; 4096])),
		"/redirect" => Response::builder()
			.status(302)
			.header("Location", "/data")
			.body(Body::empty())
			.unwrap(),
		_ => Response::builder().status(404).body(Body::empty()).unwrap(),
	};
	Ok(resp)
}

fn spawn_test_server() -> SocketAddr {
	let make_svc =
		make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(test_handler)) });
	let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
	let addr = server.local_addr();
	tokio::spawn(server);
	addr
}

fn test_downloader() -> Arc<Downloader> {
	Downloader::new("test", Duration::from_secs(10))
}

#[tokio::test]
async fn test_basic_download() {
	let addr = spawn_test_server();
	let dl = test_downloader();

	let ctx = DownloadContext::new(
		RequestSpec::get(format!("http://{}/data", addr)),
		1 << 20,
	);
	dl.start(&ctx).unwrap();
	assert!(ctx.is_pending());

	dl.tick().await;
	let res = ctx.wait().await;
	assert!(res.succeeded(200));
	assert_eq!(&res.data[..], b"payload bytes");
	assert!(ctx.is_finalized());

	// the result is settled: waiting again returns the same thing
	let res2 = ctx.wait().await;
	assert_eq!(res2.http_status, 200);
	assert_eq!(res2.data, res.data);

	// zero timeout on a finalized context returns immediately
	let res3 = ctx.wait_timeout(Duration::from_millis(0)).await.unwrap();
	assert_eq!(res3.http_status, 200);
}

#[tokio::test]
async fn test_status_interpretation() {
	let addr = spawn_test_server();
	let dl = test_downloader();

	let res = dl
		.run_once(RequestSpec::get(format!("http://{}/missing", addr)), 1024)
		.await;
	assert_eq!(res.http_status, 404);
	match res.interpret_errors() {
		Err(Error::NotFound) => (),
		other => panic!("expected NotFound, got {:?}", other),
	}

	let res = dl
		.run_once(RequestSpec::get(format!("http://{}/redirect", addr)), 1024)
		.await;
	assert_eq!(res.http_status, 302);
	assert_eq!(res.location.as_deref(), Some("/data"));
}

#[tokio::test]
async fn test_bounded_response() {
	let addr = spawn_test_server();
	let dl = test_downloader();

	let res = dl
		.run_once(RequestSpec::get(format!("http://{}/big", addr)), 1024)
		.await;
	assert_eq!(res.error, Some(TransferError::TooLarge));
}

#[tokio::test]
async fn test_cancel_pending_never_runs() {
	let addr = spawn_test_server();
	let dl = test_downloader();

	let ctx = DownloadContext::new(
		RequestSpec::get(format!("http://{}/data", addr)),
		1024,
	);
	dl.start(&ctx).unwrap();

	// no dispatch happened yet: cancellation must finalize the context
	// without ever transferring
	dl.cancel(&ctx).await.unwrap();
	assert!(ctx.is_finalized());
	assert!(ctx.is_cancelled());
	let res = ctx.wait().await;
	assert_eq!(res.error, Some(TransferError::Cancelled));

	// the later dispatch pass skips it
	assert_eq!(dl.tick().await, 1);
	assert!(ctx.is_cancelled());
}

#[tokio::test]
async fn test_cancel_running() {
	let addr = spawn_test_server();
	let dl = test_downloader();

	let ctx = DownloadContext::new(
		RequestSpec::get(format!("http://{}/slow", addr)),
		1024,
	);
	dl.start(&ctx).unwrap();
	dl.tick().await;
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(ctx.is_running());

	dl.cancel(&ctx).await.unwrap();
	let res = ctx.wait().await;
	assert_eq!(res.error, Some(TransferError::Cancelled));
}

#[tokio::test]
async fn test_wait_timeout_leaves_transfer_running() {
	let addr = spawn_test_server();
	let dl = test_downloader();

	let ctx = DownloadContext::new(
		RequestSpec::get(format!("http://{}/slow", addr)),
		1024,
	);
	dl.start(&ctx).unwrap();
	dl.tick().await;

	match ctx.wait_timeout(Duration::from_millis(50)).await {
		Err(Error::Timeout) => (),
		other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
	}
	// not cancelled by the timeout
	assert!(!ctx.is_finalized());
	dl.cancel(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_download_set_wait_any() {
	let addr = spawn_test_server();
	let dl = test_downloader();
	let set = DownloadSet::new();

	let slow = DownloadContext::new(
		RequestSpec::get(format!("http://{}/slow", addr)),
		1024,
	);
	let fast = DownloadContext::new(
		RequestSpec::get(format!("http://{}/data", addr)),
		1024,
	);
	set.add(&slow);
	set.add(&fast);
	dl.start(&slow).unwrap();
	dl.start(&fast).unwrap();
	dl.tick().await;

	let done = set.wait_any(Duration::from_secs(5)).await.unwrap();
	assert!(Arc::ptr_eq(&done, &fast));
	set.clear(&done);
	assert_eq!(set.len(), 1);

	dl.cancel(&slow).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_all_batch() {
	let addr = spawn_test_server();
	let dl = test_downloader();
	dl.spawn_workers_for_test();

	let mut remaining = 5u32;
	let mut seen = 0u32;
	download_all(
		&dl,
		2,
		1024,
		|| {
			if remaining > 0 {
				remaining -= 1;
				Some(RequestSpec::get(format!("http://{}/data", addr)))
			} else {
				None
			}
		},
		|res| {
			assert!(res.succeeded(200));
			seen += 1;
			Ok(PostProcess::Continue)
		},
	)
	.await
	.unwrap();
	assert_eq!(seen, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_all_finish_early() {
	let addr = spawn_test_server();
	let dl = test_downloader();
	dl.spawn_workers_for_test();

	let mut started = 0u32;
	let mut seen = 0u32;
	download_all(
		&dl,
		2,
		1024,
		|| {
			started += 1;
			Some(RequestSpec::get(format!("http://{}/data", addr)))
		},
		|_res| {
			seen += 1;
			Ok(PostProcess::Finish)
		},
	)
	.await
	.unwrap();
	assert_eq!(seen, 1);
	assert!(started >= 1);
}
