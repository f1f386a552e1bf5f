// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end bridge tests over an in-memory pipe.
//!
//! A stub proxy sits on the far end of a duplex stream, acknowledges
//! the session traffic, and lets each test drive proxy-initiated
//! messages (invokes, completions, signals) by hand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use weft_protocol::envelope::keys;
use weft_protocol::frame::{read_frame, write_frame};
use weft_protocol::{Envelope, MessageKind};
use weft_sdk::replay::{RecordedKind, RecordedResult};
use weft_sdk::{
    BridgeConfig, BridgeError, RemoteError, WeftClient, WorkerMode, WorkerOptions,
};

/// Handle to the stub proxy on the far end of the pipe.
struct StubProxy {
    /// Every envelope the stub receives, in arrival order.
    received: mpsc::UnboundedReceiver<Envelope>,
    /// Envelopes for the stub to write to the client.
    to_client: mpsc::UnboundedSender<Envelope>,
    /// While false, heartbeats are swallowed instead of acknowledged.
    ack_heartbeats: Arc<AtomicBool>,
}

impl StubProxy {
    /// Wait for the next received envelope of the given kind, skipping
    /// heartbeats and unrelated traffic.
    async fn expect(&mut self, kind: MessageKind) -> Envelope {
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(5), self.received.recv())
                .await
                .expect("timed out waiting for stub traffic")
                .expect("stub closed");
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    /// The very next received envelope, whatever it is.
    async fn next(&mut self) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for stub traffic")
            .expect("stub closed")
    }

    fn push(&self, envelope: Envelope) {
        self.to_client.send(envelope).expect("stub writer gone");
    }
}

/// Spawn the stub proxy: acknowledges session traffic automatically,
/// answers execute requests with canned results, and forwards everything
/// it sees for assertions.
fn spawn_stub(far: tokio::io::DuplexStream) -> StubProxy {
    let (mut reader, mut writer) = tokio::io::split(far);
    let (received_tx, received) = mpsc::unbounded_channel();
    let (to_client, mut to_client_rx) = mpsc::unbounded_channel::<Envelope>();
    let ack_heartbeats = Arc::new(AtomicBool::new(true));

    let outbound = to_client.clone();
    let heartbeats = ack_heartbeats.clone();
    tokio::spawn(async move {
        while let Ok(request) = read_frame(&mut reader).await {
            let _ = received_tx.send(request.clone());
            match request.kind {
                MessageKind::Initialize => {
                    let reply = request
                        .reply()
                        .expect("initialize has a reply kind")
                        .with_str(keys::LIBRARY_VERSION, "proxy-0.9");
                    let _ = outbound.send(reply);
                }
                MessageKind::Heartbeat => {
                    if heartbeats.load(Ordering::SeqCst) {
                        if let Some(reply) = request.reply() {
                            let _ = outbound.send(reply);
                        }
                    }
                }
                MessageKind::WorkflowExecute => {
                    let reply = request
                        .reply()
                        .expect("execute has a reply kind")
                        .with_str(keys::WORKFLOW_ID, "wf-1")
                        .with_str(keys::RUN_ID, "run-1");
                    let _ = outbound.send(reply);
                }
                MessageKind::ActivityExecute => {
                    let args = request.payload.clone().unwrap_or_default();
                    match request.i64_prop(keys::CONTEXT_ID) {
                        // Scheduled from a workflow context: ack now,
                        // complete asynchronously via a push.
                        Some(context_id) => {
                            let _ = outbound.send(request.reply().expect("reply kind"));
                            let done = [b"ok:".as_ref(), &args[..]].concat();
                            let completion = Envelope::new(MessageKind::ActivityCompleted)
                                .with_i64(keys::CONTEXT_ID, context_id)
                                .with_i64(
                                    keys::ACTIVITY_ID,
                                    request.i64_prop(keys::ACTIVITY_ID).unwrap_or(0),
                                )
                                .with_payload(done);
                            let _ = outbound.send(completion);
                        }
                        // Direct execution: the reply itself carries the
                        // result.
                        None => {
                            let reply = request
                                .reply()
                                .expect("reply kind")
                                .with_payload([b"direct:".as_ref(), &args[..]].concat());
                            let _ = outbound.send(reply);
                        }
                    }
                }
                MessageKind::WorkflowQuery => {
                    let reply = request
                        .reply()
                        .expect("query has a reply kind")
                        .with_payload(&b"queried-state"[..]);
                    let _ = outbound.send(reply);
                }
                MessageKind::ChildWorkflowStart => {
                    let _ = outbound.send(request.reply().expect("reply kind"));
                    let completion = Envelope::new(MessageKind::ChildWorkflowCompleted)
                        .with_i64(
                            keys::CONTEXT_ID,
                            request.i64_prop(keys::CONTEXT_ID).unwrap_or(0),
                        )
                        .with_i64(keys::CHILD_ID, request.i64_prop(keys::CHILD_ID).unwrap_or(0))
                        .with_payload(&b"child-done"[..]);
                    let _ = outbound.send(completion);
                }
                _ => {
                    // Everything else gets a bare ack if it wants one.
                    if let Some(reply) = request.reply() {
                        let _ = outbound.send(reply);
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(envelope) = to_client_rx.recv().await {
            if write_frame(&mut writer, &envelope).await.is_err() {
                break;
            }
        }
    });

    StubProxy {
        received,
        to_client,
        ack_heartbeats,
    }
}

fn test_config() -> BridgeConfig {
    BridgeConfig::new("orders")
        .with_request_timeout_ms(2_000)
        .with_heartbeat_interval_ms(0)
}

async fn connect_pair(config: BridgeConfig) -> (WeftClient, StubProxy) {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let mut stub = spawn_stub(far);
    let client = WeftClient::establish(near, config)
        .await
        .expect("establish failed");
    // Consume the handshake so tests start from a quiet stream.
    stub.expect(MessageKind::Initialize).await;
    (client, stub)
}

#[tokio::test]
async fn initialize_handshake_precedes_everything() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let mut stub = spawn_stub(far);

    let client = WeftClient::establish(near, test_config()).await.unwrap();

    let init = stub.expect(MessageKind::Initialize).await;
    assert!(init.str_prop(keys::LIBRARY_VERSION).is_some());
    assert_eq!(init.str_prop(keys::DOMAIN), Some("orders"));
    assert!(init.request_id != 0);

    client.close().await;
}

#[tokio::test]
async fn initialize_rejection_fails_the_connect() {
    let (near, far) = tokio::io::duplex(64 * 1024);

    // A proxy that rejects the handshake.
    tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(far);
        let request = read_frame(&mut reader).await.unwrap();
        let mut reply = request.reply().unwrap();
        RemoteError::generic("version mismatch").write_to(&mut reply);
        write_frame(&mut writer, &reply).await.unwrap();
    });

    let err = WeftClient::establish(near, test_config())
        .await
        .err()
        .expect("connect should fail");
    assert!(matches!(err, BridgeError::Remote(e) if e.message == "version mismatch"));
}

#[tokio::test]
async fn start_workflow_round_trip() {
    let (client, mut stub) = connect_pair(test_config()).await;

    let run = client.start_workflow("ship-order", &b"{\"sku\":7}"[..]).await.unwrap();
    assert_eq!(run.workflow_id, "wf-1");
    assert_eq!(run.run_id, "run-1");

    let seen = stub.expect(MessageKind::WorkflowExecute).await;
    assert_eq!(seen.str_prop(keys::DOMAIN), Some("orders"));
    assert_eq!(seen.str_prop(keys::TASK_QUEUE), Some("default"));
    assert_eq!(seen.str_prop(keys::WORKFLOW_NAME), Some("ship-order"));
    assert_eq!(seen.payload.as_deref(), Some(&b"{\"sku\":7}"[..]));

    client.close().await;
}

#[tokio::test]
async fn signal_query_cancel_round_trips() {
    let (client, mut stub) = connect_pair(test_config()).await;

    client
        .signal_workflow("wf-1", Some("run-1"), "approve", &b"yes"[..])
        .await
        .unwrap();
    let signal = stub.expect(MessageKind::WorkflowSignal).await;
    assert_eq!(signal.str_prop(keys::SIGNAL_NAME), Some("approve"));
    assert_eq!(signal.str_prop(keys::RUN_ID), Some("run-1"));

    let state = client
        .query_workflow("wf-1", None, "status", &b""[..])
        .await
        .unwrap();
    assert_eq!(&state[..], b"queried-state");

    client.cancel_workflow("wf-1", Some("run-1")).await.unwrap();
    let cancel = stub.expect(MessageKind::WorkflowCancel).await;
    assert_eq!(cancel.str_prop(keys::WORKFLOW_ID), Some("wf-1"));

    client.close().await;
}

#[tokio::test]
async fn direct_activity_execution_returns_reply_payload() {
    let (client, mut stub) = connect_pair(test_config()).await;

    let out = client.execute_activity("charge-card", &b"now"[..]).await.unwrap();
    assert_eq!(&out[..], b"direct:now");

    let seen = stub.expect(MessageKind::ActivityExecute).await;
    assert!(seen.i64_prop(keys::CONTEXT_ID).is_none());
    assert_eq!(seen.str_prop(keys::ACTIVITY_NAME), Some("charge-card"));

    client.close().await;
}

#[tokio::test]
async fn hosted_workflow_invocation_runs_activities_end_to_end() {
    let (client, mut stub) = connect_pair(test_config()).await;

    client
        .register_workflow("ship-order", |ctx, args| async move {
            let pending = ctx
                .schedule_activity("charge-card", args)
                .await
                .map_err(|e| RemoteError::generic(e.to_string()))?;
            let receipt = pending
                .await_result()
                .await
                .map_err(|e| RemoteError::generic(e.to_string()))?;

            let child = ctx
                .start_child("notify-customer", receipt.clone())
                .await
                .map_err(|e| RemoteError::generic(e.to_string()))?;
            child
                .await_result()
                .await
                .map_err(|e| RemoteError::generic(e.to_string()))?;

            Ok(receipt)
        })
        .await
        .unwrap();
    stub.expect(MessageKind::WorkflowRegister).await;

    // Proxy invokes the hosted workflow.
    stub.push(
        Envelope::new(MessageKind::WorkflowInvoke)
            .with_request_id(501)
            .with_str(keys::WORKFLOW_NAME, "ship-order")
            .with_payload(&b"card-42"[..]),
    );

    // The workflow schedules its activity and child through the bridge.
    let activity = stub.expect(MessageKind::ActivityExecute).await;
    assert_eq!(activity.str_prop(keys::ACTIVITY_NAME), Some("charge-card"));
    assert_eq!(activity.i64_prop(keys::CONTEXT_ID), Some(1));
    assert_eq!(activity.i64_prop(keys::ACTIVITY_ID), Some(1));

    let child = stub.expect(MessageKind::ChildWorkflowStart).await;
    assert_eq!(child.str_prop(keys::WORKFLOW_NAME), Some("notify-customer"));
    assert_eq!(child.i64_prop(keys::CHILD_ID), Some(1));

    // And finally delivers its result on the proxy's request ID.
    let result = stub.expect(MessageKind::WorkflowInvokeReply).await;
    assert_eq!(result.request_id, 501);
    assert_eq!(result.payload.as_deref(), Some(&b"ok:card-42"[..]));

    // The context is gone once the invocation finished.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.live_contexts(), 0);

    client.close().await;
}

#[tokio::test]
async fn hosted_activity_invocation_replies_with_result() {
    let (client, mut stub) = connect_pair(test_config()).await;

    client
        .register_activity("resize-image", |actx, args| async move {
            actx.record_heartbeat(&b"halfway"[..])
                .await
                .map_err(|e| RemoteError::generic(e.to_string()))?;
            Ok(Bytes::from([b"resized:".as_ref(), &args[..]].concat()))
        })
        .await
        .unwrap();
    stub.expect(MessageKind::ActivityRegister).await;

    stub.push(
        Envelope::new(MessageKind::ActivityInvoke)
            .with_request_id(601)
            .with_str(keys::ACTIVITY_NAME, "resize-image")
            .with_payload(&b"cat.png"[..]),
    );

    let heartbeat = stub.expect(MessageKind::ActivityRecordHeartbeat).await;
    assert_eq!(heartbeat.payload.as_deref(), Some(&b"halfway"[..]));

    let result = stub.expect(MessageKind::ActivityInvokeReply).await;
    assert_eq!(result.request_id, 601);
    assert_eq!(result.payload.as_deref(), Some(&b"resized:cat.png"[..]));

    client.close().await;
}

#[tokio::test]
async fn unregistered_workflow_invoke_gets_an_error_reply() {
    let (client, mut stub) = connect_pair(test_config()).await;

    stub.push(
        Envelope::new(MessageKind::WorkflowInvoke)
            .with_request_id(88)
            .with_str(keys::WORKFLOW_NAME, "nobody-home"),
    );

    let reply = stub.expect(MessageKind::WorkflowInvokeReply).await;
    assert_eq!(reply.request_id, 88);
    let error = RemoteError::from_reply(&reply).expect("error property");
    assert!(error.message.contains("not registered"));

    client.close().await;
}

#[tokio::test]
async fn signals_flow_into_context_queues() {
    let (client, mut stub) = connect_pair(test_config()).await;

    client
        .register_workflow("wait-for-approval", |ctx, _args| async move {
            let queue = ctx
                .new_queue(4)
                .await
                .map_err(|e| RemoteError::generic(e.to_string()))?;
            let approval = queue
                .read()
                .await
                .map_err(|e| RemoteError::generic(e.to_string()))?;
            Ok(approval)
        })
        .await
        .unwrap();
    stub.expect(MessageKind::WorkflowRegister).await;

    stub.push(
        Envelope::new(MessageKind::WorkflowInvoke)
            .with_request_id(700)
            .with_str(keys::WORKFLOW_NAME, "wait-for-approval"),
    );

    // Wait for the workflow to open its queue, then signal it.
    let queue_new = stub.expect(MessageKind::QueueNew).await;
    let context_id = queue_new.i64_prop(keys::CONTEXT_ID).unwrap();
    let queue_id = queue_new.i64_prop(keys::QUEUE_ID).unwrap();
    stub.push(
        Envelope::new(MessageKind::SignalReceived)
            .with_i64(keys::CONTEXT_ID, context_id)
            .with_i64(keys::QUEUE_ID, queue_id)
            .with_payload(&b"approved"[..]),
    );

    let result = stub.expect(MessageKind::WorkflowInvokeReply).await;
    assert_eq!(result.request_id, 700);
    assert_eq!(result.payload.as_deref(), Some(&b"approved"[..]));

    client.close().await;
}

#[tokio::test]
async fn replayed_invocation_never_touches_the_wire() {
    let (client, mut stub) = connect_pair(test_config()).await;

    client
        .register_workflow("ship-order", |ctx, args| async move {
            let pending = ctx
                .schedule_activity("charge-card", args)
                .await
                .map_err(|e| RemoteError::generic(e.to_string()))?;
            pending
                .await_result()
                .await
                .map_err(|e| RemoteError::generic(e.to_string()))
        })
        .await
        .unwrap();
    stub.expect(MessageKind::WorkflowRegister).await;

    let history = vec![RecordedResult::ok(
        RecordedKind::Activity,
        1,
        b"recorded-receipt".to_vec(),
    )];
    let mut invoke = Envelope::new(MessageKind::WorkflowInvoke)
        .with_request_id(900)
        .with_str(keys::WORKFLOW_NAME, "ship-order")
        .with_bool(keys::REPLAYING, true);
    invoke.set_json(keys::REPLAY_HISTORY, &history).unwrap();
    stub.push(invoke);

    // The reply is the next thing on the wire: no ActivityExecute in
    // between, since the recorded outcome was served locally.
    let reply = stub.next().await;
    assert_eq!(reply.kind, MessageKind::WorkflowInvokeReply);
    assert_eq!(reply.request_id, 900);
    assert_eq!(reply.payload.as_deref(), Some(&b"recorded-receipt"[..]));

    client.close().await;
}

#[tokio::test]
async fn worker_lifecycle_over_the_wire() {
    let (client, mut stub) = connect_pair(test_config()).await;

    let h1 = client
        .start_worker(WorkerMode::Both, "orders", "default", WorkerOptions::default())
        .await
        .unwrap();
    stub.expect(MessageKind::WorkerRegister).await;

    // Second start shares the registration; nothing new on the wire.
    let h2 = client
        .start_worker(WorkerMode::Both, "orders", "default", WorkerOptions::default())
        .await
        .unwrap();
    assert_eq!(h1.worker_id(), h2.worker_id());

    client.stop_worker(&h1).await.unwrap();
    client.stop_worker(&h2).await.unwrap();
    stub.expect(MessageKind::WorkerDeregister).await;

    let err = client
        .start_worker(WorkerMode::Both, "orders", "default", WorkerOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::AlreadyStoppedCannotRestart { .. }));

    client.close().await;
}

#[tokio::test]
async fn heartbeat_failure_flips_health_and_recovers() {
    let config = test_config()
        .with_heartbeat_interval_ms(20)
        .with_heartbeat_max_missed(2);
    // Keep each probe's timeout short enough for quick misses.
    let mut config = config;
    config.heartbeat_timeout_ms = 50;

    let (near, far) = tokio::io::duplex(64 * 1024);
    let stub = spawn_stub(far);
    let client = WeftClient::establish(near, config).await.unwrap();
    assert!(client.is_healthy());

    // Stop acknowledging probes; health flips after the miss threshold.
    stub.ack_heartbeats.store(false, Ordering::SeqCst);
    let flipped = async {
        while client.is_healthy() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), flipped)
        .await
        .expect("peer never became unhealthy");

    // Calls now fail fast instead of waiting out their timeouts.
    let err = client.start_workflow("x", &b""[..]).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Connection(weft_sdk::DispatchError::PeerUnhealthy)
    ));

    // Resume acks; the monitor detects recovery.
    stub.ack_heartbeats.store(true, Ordering::SeqCst);
    let recovered = async {
        while !client.is_healthy() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), recovered)
        .await
        .expect("peer never recovered");

    client.close().await;
}

#[tokio::test]
async fn terminate_is_acknowledged_and_closes_down() {
    let (client, mut stub) = connect_pair(test_config()).await;

    client.terminate().await.unwrap();
    let seen = stub.expect(MessageKind::Terminate).await;
    assert!(seen.request_id != 0);

    // The connection is gone afterwards.
    let err = client.start_workflow("x", &b""[..]).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Connection(weft_sdk::DispatchError::ConnectionClosed)
    ));
}
