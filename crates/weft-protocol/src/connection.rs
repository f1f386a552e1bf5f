// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duplex framed transport to the proxy process.
//!
//! One [`Connection`] owns one duplex byte stream (a loopback TCP socket
//! in production, an in-memory pipe in tests). Concurrent senders are
//! serialized behind a single write lock so frames are never interleaved;
//! a dedicated background task runs the read loop, decoding one frame at
//! a time and handing each envelope to the [`InboundHandler`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::envelope::Envelope;
use crate::frame::{ProtocolError, read_frame, write_frame};

/// Receiver for everything the read loop decodes.
///
/// Both callbacks run on the read-loop task. Implementations must only
/// resolve a completion slot or enqueue the envelope — any long-running
/// handling has to be handed off, otherwise one slow message stalls
/// delivery of unrelated replies behind it.
pub trait InboundHandler: Send + Sync {
    /// One decoded envelope arrived.
    fn on_envelope(&self, envelope: Envelope);

    /// The read loop exited; called exactly once. `error` is
    /// [`ProtocolError::ConnectionClosed`] for an orderly shutdown or
    /// EOF, and the decode/IO error otherwise.
    fn on_closed(&self, error: ProtocolError);
}

/// A framed duplex channel with a background read loop.
pub struct Connection {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Take ownership of `stream`, spawn the read loop, and return the
    /// writable half. Envelopes decoded from the stream flow into
    /// `handler` until EOF, a protocol error, or [`Connection::shutdown`].
    pub fn open<S>(stream: S, handler: Arc<dyn InboundHandler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let shutdown = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(
            reader,
            handler,
            shutdown.clone(),
            closed.clone(),
        ));

        Self {
            writer: Mutex::new(Box::new(writer)),
            shutdown,
            closed,
        }
    }

    /// Write one frame. Concurrent callers are serialized here; a frame
    /// is always written whole.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, envelope).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the read loop and close the writable half. Idempotent.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "error closing connection writer");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Stop the read loop; the writer half is dropped with self.
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
    }
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    handler: Arc<dyn InboundHandler>,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let error = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break ProtocolError::ConnectionClosed,
            result = read_frame(&mut reader) => match result {
                Ok(envelope) => handler.on_envelope(envelope),
                Err(e) => break e,
            },
        }
    };

    closed.store(true, Ordering::Release);
    debug!(error = %error, "connection read loop exiting");
    handler.on_closed(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        envelopes: StdMutex<Vec<Envelope>>,
        closed: StdMutex<Vec<String>>,
        notify: Notify,
    }

    impl InboundHandler for Recorder {
        fn on_envelope(&self, envelope: Envelope) {
            self.envelopes.lock().unwrap().push(envelope);
            self.notify.notify_one();
        }

        fn on_closed(&self, error: ProtocolError) {
            self.closed.lock().unwrap().push(error.to_string());
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (near, far) = tokio::io::duplex(1024);
        let recorder = Arc::new(Recorder::default());
        let conn = Connection::open(near, recorder.clone());

        // The peer end is also a connection; send from a raw writer.
        let (mut far_reader, mut far_writer) = tokio::io::split(far);

        let outbound = Envelope::new(MessageKind::Heartbeat).with_request_id(3);
        conn.send(&outbound).await.unwrap();
        let at_peer = read_frame(&mut far_reader).await.unwrap();
        assert_eq!(at_peer, outbound);

        let inbound = Envelope::new(MessageKind::HeartbeatReply).with_request_id(3);
        write_frame(&mut far_writer, &inbound).await.unwrap();
        recorder.notify.notified().await;
        assert_eq!(*recorder.envelopes.lock().unwrap(), vec![inbound]);
    }

    #[tokio::test]
    async fn test_peer_eof_reports_closed_once() {
        let (near, far) = tokio::io::duplex(64);
        let recorder = Arc::new(Recorder::default());
        let conn = Connection::open(near, recorder.clone());

        drop(far);
        recorder.notify.notified().await;

        let closed = recorder.closed.lock().unwrap().clone();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0], "connection closed");
        assert!(conn.is_closed());

        let err = conn
            .send(&Envelope::new(MessageKind::Heartbeat))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_shutdown_stops_read_loop() {
        let (near, far) = tokio::io::duplex(64);
        let recorder = Arc::new(Recorder::default());
        let conn = Connection::open(near, recorder.clone());

        conn.shutdown().await;
        recorder.notify.notified().await;
        assert_eq!(recorder.closed.lock().unwrap().len(), 1);
        drop(far);
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave_frames() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let recorder = Arc::new(Recorder::default());
        let conn = Arc::new(Connection::open(near, recorder));
        let (mut far_reader, _far_writer) = tokio::io::split(far);

        let mut tasks = Vec::new();
        for i in 0..20i64 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                let env = Envelope::new(MessageKind::WorkflowSignal)
                    .with_i64("n", i)
                    .with_payload(vec![i as u8; 512]);
                conn.send(&env).await.unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..20 {
            let env = read_frame(&mut far_reader).await.unwrap();
            assert_eq!(env.kind, MessageKind::WorkflowSignal);
            seen.push(env.i64_prop("n").unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());

        for task in tasks {
            task.await.unwrap();
        }
    }
}
