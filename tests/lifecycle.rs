//! Graceful and hard shutdown.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rpc_server::client::{CallOptions, RpcClient};
use rpc_server::health::proto;
use rpc_server::{echo, Code, ServingStatus, ShutdownMode};

use common::{config, connect, start, within};

#[tokio::test]
async fn graceful_shutdown_lets_in_flight_calls_finish() {
    let routes = echo::routes().unary("test.Slow", "Work", |_, _| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(Bytes::from_static(b"done"))
    });
    let handle = Arc::new(start(config(), routes).await);
    let addr = handle.local_addr();
    let client = connect(&handle).await;

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.unary("/test.Slow/Work", "x").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopping = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            handle
                .shutdown(ShutdownMode::Graceful {
                    timeout: Duration::from_secs(5),
                })
                .await
        })
    };

    assert_eq!(within(2, in_flight).await.unwrap().unwrap(), Bytes::from_static(b"done"));
    within(5, stopping).await.unwrap();
    assert_eq!(handle.active_connections(), 0);
    assert_eq!(handle.health().check(""), ServingStatus::NotServing);

    let refused = async {
        let client = RpcClient::connect(addr).await.ok()?;
        client.unary("/service.Echo/Ping", "x").await.ok()
    };
    assert!(within(2, refused).await.is_none());
}

#[tokio::test]
async fn grace_period_escalates_to_hard_stop() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let routes = echo::routes().unary("test.Stuck", "Forever", move |ctx, _| {
        let flag = Arc::clone(&flag);
        async move {
            let signal = ctx.cancel_signal().clone();
            tokio::spawn(async move {
                signal.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            });
            std::future::pending::<Result<Bytes, rpc_server::Status>>().await
        }
    });
    let handle = Arc::new(start(config(), routes).await);
    let client = connect(&handle).await;

    let stuck = {
        let client = client.clone();
        tokio::spawn(async move { client.unary("/test.Stuck/Forever", "x").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    within(
        5,
        handle.shutdown(ShutdownMode::Graceful {
            timeout: Duration::from_millis(200),
        }),
    )
    .await;
    assert!(started.elapsed() >= Duration::from_millis(200));

    assert!(within(2, stuck).await.unwrap().is_err());
    within(2, async {
        while !cancelled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn hard_shutdown_cancels_active_calls() {
    let handle = start(config(), echo::routes()).await;
    let client = connect(&handle).await;

    let (sender, mut stream) = client
        .streaming("/service.Echo/PingStream", &CallOptions::default())
        .await
        .unwrap();
    sender.send("open").await.unwrap();
    assert_eq!(within(2, stream.message()).await.unwrap().unwrap(), Bytes::from_static(b"open"));

    within(2, handle.shutdown(ShutdownMode::Hard)).await;
    assert_eq!(handle.active_connections(), 0);

    let outcome = within(2, stream.message()).await;
    match outcome {
        Err(status) => assert!(matches!(status.code(), Code::Unavailable | Code::Cancelled | Code::Internal)),
        Ok(message) => panic!("stream should have failed, got {:?}", message),
    }
}

#[tokio::test]
async fn shutdown_ends_health_watches() {
    let handle = start(config(), echo::routes()).await;
    let client = connect(&handle).await;

    let mut watch = client
        .server_streaming(
            "/grpc.health.v1.Health/Watch",
            proto::encode_request("service.Echo"),
            &CallOptions::default(),
        )
        .await
        .unwrap();
    let first = within(2, watch.message()).await.unwrap().unwrap();
    assert_eq!(proto::decode_response(&first).unwrap(), ServingStatus::Serving);

    let shutdown = handle.shutdown(ShutdownMode::Graceful {
        timeout: Duration::from_secs(5),
    });
    let watch_end = async {
        let last = watch.message().await.unwrap().unwrap();
        assert_eq!(proto::decode_response(&last).unwrap(), ServingStatus::NotServing);
        assert_eq!(watch.message().await.unwrap(), None);
    };
    within(5, async { tokio::join!(shutdown, watch_end) }).await;
}

#[tokio::test]
async fn health_updates_after_shutdown_are_ignored() {
    let handle = start(config(), echo::routes()).await;
    within(2, handle.shutdown(ShutdownMode::Hard)).await;

    handle.health().set_status("service.Echo", ServingStatus::Serving);
    assert_eq!(handle.health().check("service.Echo"), ServingStatus::NotServing);
}
