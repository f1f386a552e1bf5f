// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bridge error taxonomy.
//!
//! Protocol-level failures ([`BridgeError::Connection`] and
//! [`BridgeError::Protocol`]) are kept distinct from remote/business
//! failures ([`RemoteError`]): the former indicate something wrong with
//! the bridge or the transport, the latter are a normal failure result
//! of the workflow or activity that ran on the other side.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use weft_protocol::envelope::keys;
use weft_protocol::{DispatchError, Envelope, ProtocolError};

use crate::context::ContextState;

/// Errors that can occur in the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration error (missing or invalid setting)
    #[error("configuration error: {0}")]
    Config(String),

    /// No proxy address could be reached
    #[error("could not reach the proxy: {0}")]
    Unreachable(String),

    /// Transport/correlation failure (timeout, unhealthy peer, closed
    /// connection)
    #[error("connection error: {0}")]
    Connection(#[from] DispatchError),

    /// Malformed frame or envelope; connection-fatal
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Operation attempted against a context that already closed
    #[error("context {context_id} is closed")]
    ContextClosed {
        /// ID of the closed context
        context_id: i64,
    },

    /// Context state machine violation
    #[error("invalid context transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the context was in
        from: ContextState,
        /// State the caller asked for
        to: ContextState,
    },

    /// Replayed workflow code diverged from recorded history
    #[error("non-deterministic workflow code: {0}")]
    NonDeterministic(String),

    /// A fully stopped worker registration can never be restarted on
    /// the same connection; this reflects a hard limitation of the
    /// external worker runtime.
    #[error("worker for domain {domain:?} task queue {task_queue:?} was stopped and cannot be restarted")]
    AlreadyStoppedCannotRestart {
        /// Domain of the dead registration
        domain: String,
        /// Task queue of the dead registration
        task_queue: String,
    },

    /// A workflow or activity implementation name was registered twice
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    /// The remote workflow/activity implementation failed; a normal
    /// failure result, not a protocol fault
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A reply arrived without the fields this operation requires
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The operation was refused by local bookkeeping
    #[error("rejected: {0}")]
    Rejected(String),

    /// Internal bridge error
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Whether this failure came from the remote implementation rather
    /// than the bridge or transport.
    pub fn is_remote(&self) -> bool {
        matches!(self, BridgeError::Remote(_))
    }
}

/// Type alias for bridge results.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Classification of a remote failure, mirroring the error envelope the
/// proxy protocol carries in the reply's JSON `Error` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteErrorKind {
    Cancelled,
    Custom,
    Generic,
    Panic,
    Terminated,
    Timeout,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RemoteErrorKind::Cancelled => "cancelled",
            RemoteErrorKind::Custom => "custom",
            RemoteErrorKind::Generic => "generic",
            RemoteErrorKind::Panic => "panic",
            RemoteErrorKind::Terminated => "terminated",
            RemoteErrorKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// A failure reported by the workflow or activity implementation on the
/// other side of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("remote {kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Generic, message)
    }

    pub fn custom(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Custom, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Cancelled, message)
    }

    /// Read the remote error out of a reply's `Error` property, if any.
    /// A malformed blob reads as absent, matching the tolerant reader
    /// convention of the property bag.
    pub fn from_reply(reply: &Envelope) -> Option<RemoteError> {
        reply.json_prop(keys::ERROR)
    }

    /// Stamp this error into an envelope's `Error` property.
    pub fn write_to(&self, envelope: &mut Envelope) {
        let value = serde_json::to_value(self)
            .unwrap_or_else(|_| serde_json::Value::String(self.to_string()));
        envelope.set(keys::ERROR, weft_protocol::PropertyValue::Json(value));
    }
}
