// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replay cursor for deterministic re-execution.
//!
//! After a proxy restart the workflow body is re-executed from recorded
//! history to rebuild in-memory state. While the cursor is replaying,
//! every suspension point (activity, child workflow, queue write) is
//! served from the recorded outcome instead of sending a request, so the
//! re-execution produces no externally visible side effects; per-context
//! ID allocation is strictly increasing, so the IDs requested during
//! replay match the recorded ones exactly. The first operation past the
//! end of the history flips the context live. Any divergence between the
//! requested operation and the recorded one is surfaced as a
//! non-determinism error rather than silently misattributed.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, RemoteError, Result};

/// Which suspension point a recorded outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordedKind {
    Activity,
    Child,
    Queue,
}

/// One recorded suspension-point outcome from workflow history, as
/// shipped in the invoke message's `ReplayHistory` property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedResult {
    pub kind: RecordedKind,
    /// The context-local ID the operation was allocated on first
    /// execution.
    pub local_id: i64,
    /// Result bytes on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Failure carried instead of a payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl RecordedResult {
    pub fn ok(kind: RecordedKind, local_id: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            local_id,
            payload: Some(payload.into()),
            error: None,
        }
    }

    pub fn failed(kind: RecordedKind, local_id: i64, error: RemoteError) -> Self {
        Self {
            kind,
            local_id,
            payload: None,
            error: Some(error),
        }
    }

    fn into_outcome(self) -> std::result::Result<Bytes, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(Bytes::from(self.payload.unwrap_or_default())),
        }
    }
}

/// Cursor over recorded history plus the live/replaying flag.
#[derive(Debug, Default)]
pub struct ReplayCursor {
    replaying: AtomicBool,
    recorded: Mutex<VecDeque<RecordedResult>>,
}

impl ReplayCursor {
    /// A cursor in live mode with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load recorded history and enter replay mode (a no-op for an
    /// empty history).
    pub fn load(&self, history: Vec<RecordedResult>) {
        let mut recorded = self.recorded.lock().expect("replay cursor poisoned");
        self.replaying.store(!history.is_empty(), Ordering::Release);
        *recorded = history.into();
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::Acquire)
    }

    /// Force live mode, discarding any remaining history.
    pub fn mark_live(&self) {
        let mut recorded = self.recorded.lock().expect("replay cursor poisoned");
        recorded.clear();
        self.replaying.store(false, Ordering::Release);
    }

    /// Consume the next recorded outcome for the given suspension point.
    ///
    /// Consuming the last record flips the cursor live, so the next
    /// operation runs for real. A mismatch means the workflow body did
    /// not re-issue the same operations in the same order.
    pub fn take(
        &self,
        kind: RecordedKind,
        local_id: i64,
    ) -> Result<std::result::Result<Bytes, RemoteError>> {
        let mut recorded = self.recorded.lock().expect("replay cursor poisoned");
        match recorded.pop_front() {
            Some(record) if record.kind == kind && record.local_id == local_id => {
                if recorded.is_empty() {
                    self.replaying.store(false, Ordering::Release);
                }
                Ok(record.into_outcome())
            }
            Some(record) => Err(BridgeError::NonDeterministic(format!(
                "history recorded {:?} #{}, workflow requested {:?} #{}",
                record.kind, record.local_id, kind, local_id
            ))),
            None => Err(BridgeError::NonDeterministic(format!(
                "history exhausted but workflow requested {kind:?} #{local_id} during replay"
            ))),
        }
    }
}
