// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation tests for weft-protocol under concurrency.

use std::time::Duration;

use futures::future::join_all;
use weft_protocol::frame::{read_frame, write_frame};
use weft_protocol::{DispatchError, Envelope, MessageKind, RequestDispatcher};

/// Peer that echoes the `n` property back, optionally after a delay.
fn spawn_echo_peer(far: tokio::io::DuplexStream, delay: Option<Duration>) {
    tokio::spawn(async move {
        let (mut reader, writer) = tokio::io::split(far);
        let writer = std::sync::Arc::new(tokio::sync::Mutex::new(writer));
        while let Ok(request) = read_frame(&mut reader).await {
            let writer = writer.clone();
            tokio::spawn(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(mut reply) = request.reply() {
                    if let Some(n) = request.i64_prop("n") {
                        reply.set_i64("n", n);
                    }
                    let mut writer = writer.lock().await;
                    let _ = write_frame(&mut *writer, &reply).await;
                }
            });
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_callers_each_get_their_own_reply() {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let (dispatcher, _pushes) = RequestDispatcher::connect(near, Duration::from_secs(5));
    spawn_echo_peer(far, None);

    let calls = (0..100i64).map(|n| {
        let dispatcher = dispatcher.clone();
        async move {
            let reply = dispatcher
                .send(Envelope::new(MessageKind::WorkflowQuery).with_i64("n", n))
                .await
                .unwrap();
            assert_eq!(reply.i64_prop("n"), Some(n));
        }
    });
    join_all(calls).await;

    assert_eq!(dispatcher.pending_requests(), 0);
}

/// Every request resolves with exactly one of {reply, timeout} — never
/// both, never neither — even when replies land right around the
/// deadline.
#[tokio::test(flavor = "multi_thread")]
async fn reply_or_timeout_fires_exactly_once() {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let (dispatcher, _pushes) = RequestDispatcher::connect(near, Duration::from_secs(5));
    spawn_echo_peer(far, Some(Duration::from_millis(25)));

    let calls = (0..50i64).map(|n| {
        let dispatcher = dispatcher.clone();
        // Timeouts straddle the peer's 25ms reply delay.
        let timeout = Duration::from_millis(5 + (n as u64 % 5) * 10);
        async move {
            let result = dispatcher
                .send_with_timeout(
                    Envelope::new(MessageKind::WorkflowQuery).with_i64("n", n),
                    timeout,
                )
                .await;
            match result {
                Ok(reply) => assert_eq!(reply.i64_prop("n"), Some(n)),
                Err(DispatchError::Timeout(_)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
    });
    join_all(calls).await;

    // Late replies to timed-out requests drain as idempotent discards.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.pending_requests(), 0);
}

#[tokio::test]
async fn dispatcher_close_is_clean_with_no_traffic() {
    let (near, far) = tokio::io::duplex(1024);
    let (dispatcher, _pushes) = RequestDispatcher::connect(near, Duration::from_secs(1));

    dispatcher.close().await;
    assert!(dispatcher.is_closed());
    let err = dispatcher
        .send(Envelope::new(MessageKind::Heartbeat))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ConnectionClosed));
    drop(far);
}
