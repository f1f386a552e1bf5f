// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Peer liveness: the shared health flag and the heartbeat task.
//!
//! The proxy's liveness cannot be observed directly, only through
//! protocol heartbeats. [`HeartbeatMonitor`] probes on a fixed interval
//! and flips the shared [`PeerHealth`] flag after a configured number of
//! consecutive misses; the dispatcher fails calls fast while the flag is
//! down instead of letting every caller wait out its own timeout.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchError, RequestDispatcher};
use crate::envelope::Envelope;

/// Shared "peer healthy" flag, cheap to clone.
///
/// Backed by a watch channel so in-flight calls can race a flip to
/// unhealthy and fail fast.
#[derive(Debug, Clone)]
pub struct PeerHealth {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl PeerHealth {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    pub fn is_healthy(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.tx.send_if_modified(|current| {
            if *current != healthy {
                *current = healthy;
                true
            } else {
                false
            }
        });
    }
}

impl Default for PeerHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Heartbeat probe tuning.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between probes.
    pub interval: Duration,
    /// Per-probe reply timeout.
    pub timeout: Duration,
    /// Consecutive misses before the peer is declared unhealthy.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
            max_missed: 3,
        }
    }
}

/// Background heartbeat task handle. Dropping the handle stops the task.
pub struct HeartbeatMonitor {
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Spawn the heartbeat loop. `make_envelope` builds each probe (the
    /// SDK stamps timestamps into it); probes bypass the dispatcher's
    /// health gate so a recovered peer is detected and the flag flips
    /// back.
    pub fn start<F>(
        dispatcher: RequestDispatcher,
        config: HeartbeatConfig,
        make_envelope: F,
    ) -> Self
    where
        F: Fn() -> Envelope + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let health = dispatcher.health();

        tokio::spawn(async move {
            debug!(
                interval_ms = config.interval.as_millis() as u64,
                max_missed = config.max_missed,
                "heartbeat task started"
            );
            let mut missed = 0u32;

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!("heartbeat task cancelled");
                        break;
                    }

                    _ = tokio::time::sleep(config.interval) => {
                        match dispatcher
                            .send_bypassing_health(make_envelope(), config.timeout)
                            .await
                        {
                            Ok(_) => {
                                if missed > 0 {
                                    info!(missed, "peer heartbeat recovered");
                                }
                                missed = 0;
                                health.set_healthy(true);
                            }
                            Err(DispatchError::ConnectionClosed) => {
                                warn!("connection closed; heartbeat task exiting");
                                health.set_healthy(false);
                                break;
                            }
                            Err(e) => {
                                missed += 1;
                                warn!(missed, error = %e, "heartbeat failed");
                                if missed >= config.max_missed && health.is_healthy() {
                                    error!(missed, "peer declared unhealthy");
                                    health.set_healthy(false);
                                }
                            }
                        }
                    }
                }
            }
        });

        Self { cancel }
    }

    /// Stop the heartbeat task. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
