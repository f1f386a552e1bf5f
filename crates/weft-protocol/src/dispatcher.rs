// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/reply correlation over a connection.
//!
//! Every outbound request gets a fresh `request_id` and a pending-table
//! entry; the read loop resolves the entry when a reply with the same ID
//! arrives. Replies may arrive in any order — correlation is a keyed
//! map, never a FIFO assumption. Removal from the table is the single
//! source of truth for the timeout/reply race: whichever side removes
//! the entry wins, and the loser finds nothing and does nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::connection::{Connection, InboundHandler};
use crate::envelope::Envelope;
use crate::frame::ProtocolError;
use crate::heartbeat::PeerHealth;
use crate::ids::IdGenerator;

/// Errors surfaced to a caller awaiting a correlated request.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The pending request exceeded its deadline. Retry is the caller's
    /// own policy decision; blind retry of non-idempotent operations is
    /// unsafe without an idempotency key.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The heartbeat monitor declared the peer unhealthy; the call
    /// failed fast instead of waiting out its own timeout.
    #[error("peer is unhealthy")]
    PeerUnhealthy,

    #[error("connection closed")]
    ConnectionClosed,

    /// Connection-fatal wire error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A correlation-table entry: timestamp plus a single-assignment
/// completion slot, fulfilled exactly once.
struct PendingRequest {
    sent_at: Instant,
    slot: oneshot::Sender<Envelope>,
}

struct Shared {
    pending: StdMutex<HashMap<u64, PendingRequest>>,
    pushes: mpsc::UnboundedSender<Envelope>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl InboundHandler for Shared {
    fn on_envelope(&self, envelope: Envelope) {
        // Only reply kinds resolve pending entries. Proxy-initiated
        // requests carry the proxy's own request IDs, which live in a
        // separate ID space from ours.
        if envelope.request_id != 0 && envelope.kind.is_reply() {
            let entry = {
                let mut pending = self.pending.lock().expect("pending table poisoned");
                pending.remove(&envelope.request_id)
            };
            match entry {
                Some(request) => {
                    debug!(
                        request_id = envelope.request_id,
                        kind = ?envelope.kind,
                        elapsed_ms = request.sent_at.elapsed().as_millis() as u64,
                        "reply resolved"
                    );
                    if request.slot.send(envelope).is_err() {
                        // Caller cancelled its future after the entry was
                        // removed; the late reply is simply discarded.
                        debug!("reply for abandoned request discarded");
                    }
                }
                None => {
                    error!(
                        request_id = envelope.request_id,
                        kind = ?envelope.kind,
                        "reply does not match any pending request; dropping"
                    );
                }
            }
        } else if self.pushes.send(envelope).is_err() {
            warn!("push receiver dropped; server message discarded");
        }
    }

    fn on_closed(&self, error: ProtocolError) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            pending.drain().map(|(_, request)| request).collect()
        };
        if !drained.is_empty() {
            warn!(
                count = drained.len(),
                error = %error,
                "connection closed with requests in flight"
            );
        }
        // Dropping the slots resolves every waiter with ConnectionClosed.
    }
}

struct Inner {
    conn: Connection,
    shared: Arc<Shared>,
    ids: IdGenerator,
    default_timeout: Duration,
    health: PeerHealth,
}

/// Correlates outbound requests with inbound replies on one connection.
/// Cheap to clone; all clones share the pending table.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<Inner>,
}

impl RequestDispatcher {
    /// Wrap `stream` in a connection and return the dispatcher plus the
    /// receiver for server-push envelopes (proxy-initiated requests and
    /// notifications with no matching pending entry).
    pub fn connect<S>(
        stream: S,
        default_timeout: Duration,
    ) -> (RequestDispatcher, mpsc::UnboundedReceiver<Envelope>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: StdMutex::new(HashMap::new()),
            pushes: push_tx,
            closed: AtomicBool::new(false),
        });
        let conn = Connection::open(stream, shared.clone());
        let dispatcher = RequestDispatcher {
            inner: Arc::new(Inner {
                conn,
                shared,
                ids: IdGenerator::new(),
                default_timeout,
                health: PeerHealth::new(),
            }),
        };
        (dispatcher, push_rx)
    }

    /// Send a request and await its correlated reply with the default
    /// timeout.
    pub async fn send(&self, envelope: Envelope) -> Result<Envelope, DispatchError> {
        self.dispatch(envelope, self.inner.default_timeout, true)
            .await
    }

    /// Send a request and await its correlated reply.
    pub async fn send_with_timeout(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, DispatchError> {
        self.dispatch(envelope, timeout, true).await
    }

    /// Send a request without the peer-health fast-fail gate. Used by
    /// the heartbeat monitor, which must keep probing an unhealthy peer
    /// to detect recovery.
    pub async fn send_bypassing_health(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, DispatchError> {
        self.dispatch(envelope, timeout, false).await
    }

    async fn dispatch(
        &self,
        mut envelope: Envelope,
        timeout: Duration,
        gate_health: bool,
    ) -> Result<Envelope, DispatchError> {
        if gate_health && !self.inner.health.is_healthy() {
            return Err(DispatchError::PeerUnhealthy);
        }
        if self.inner.shared.is_closed() {
            return Err(DispatchError::ConnectionClosed);
        }

        let request_id = self.inner.ids.next() as u64;
        envelope.request_id = request_id;

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self
                .inner
                .shared
                .pending
                .lock()
                .expect("pending table poisoned");
            pending.insert(
                request_id,
                PendingRequest {
                    sent_at: Instant::now(),
                    slot: tx,
                },
            );
        }

        if let Err(e) = self.inner.conn.send(&envelope).await {
            self.remove_pending(request_id);
            return Err(match e {
                ProtocolError::ConnectionClosed => DispatchError::ConnectionClosed,
                other => DispatchError::Protocol(other),
            });
        }

        let mut health = self.inner.health.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let reply = tokio::select! {
            reply = &mut rx => Some(reply),
            _ = &mut deadline => None,
            _ = wait_unhealthy(&mut health), if gate_health => {
                // The entry stays pending: a late reply finds it, resolves
                // into a dropped receiver, and is discarded idempotently.
                return Err(DispatchError::PeerUnhealthy);
            }
        };

        match reply {
            Some(reply) => reply.map_err(|_| DispatchError::ConnectionClosed),
            None => {
                if self.remove_pending(request_id) {
                    Err(DispatchError::Timeout(timeout))
                } else {
                    // The reply won the removal race a moment ago; it is
                    // already in (or about to land in) the slot.
                    rx.await.map_err(|_| DispatchError::ConnectionClosed)
                }
            }
        }
    }

    fn remove_pending(&self, request_id: u64) -> bool {
        let mut pending = self
            .inner
            .shared
            .pending
            .lock()
            .expect("pending table poisoned");
        pending.remove(&request_id).is_some()
    }

    /// Fire-and-forget notification: `request_id` 0, no table entry, no
    /// reply expected.
    pub async fn notify(&self, mut envelope: Envelope) -> Result<(), DispatchError> {
        envelope.request_id = 0;
        self.write(&envelope).await
    }

    /// Write a reply to a proxy-initiated request, preserving the
    /// peer-assigned `request_id`.
    pub async fn reply(&self, envelope: Envelope) -> Result<(), DispatchError> {
        self.write(&envelope).await
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        self.inner.conn.send(envelope).await.map_err(|e| match e {
            ProtocolError::ConnectionClosed => DispatchError::ConnectionClosed,
            other => DispatchError::Protocol(other),
        })
    }

    /// The shared peer-health flag for this connection.
    pub fn health(&self) -> PeerHealth {
        self.inner.health.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Number of requests currently awaiting replies.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .shared
            .pending
            .lock()
            .expect("pending table poisoned")
            .len()
    }

    /// Close the connection; every in-flight request resolves with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        self.inner.conn.shutdown().await;
    }
}

async fn wait_unhealthy(health: &mut watch::Receiver<bool>) {
    // The dispatcher owns a PeerHealth clone, so the sender outlives us;
    // park forever on the (unreachable) error path rather than spuriously
    // reporting an unhealthy peer.
    if health.wait_for(|healthy| !*healthy).await.is_err() {
        std::future::pending::<()>().await;
    }
}
