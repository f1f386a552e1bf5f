// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft SDK - client bridge for externally-hosted workflow execution.
//!
//! This crate lets a host process drive workflow and activity execution
//! that actually runs inside an out-of-process worker ("the proxy"). It
//! wraps the low-level `weft-protocol` correlator and provides:
//!
//! - **Session lifecycle**: initialize handshake, heartbeat liveness,
//!   orderly terminate
//! - **Workflow operations**: start, signal, query, cancel
//! - **Hosted implementations**: register workflow/activity functions
//!   that the proxy invokes back into this process
//! - **Execution contexts**: per-invocation handles with child,
//!   activity, and queue registries scoped by context-local IDs
//! - **Replay**: deterministic re-execution from recorded history with
//!   side-effect suppression and non-determinism detection
//! - **Worker lifecycle**: reference-counted `(mode, domain, task queue)`
//!   registrations
//!
//! # Quick Start
//!
//! ```ignore
//! use weft_sdk::{BridgeConfig, RemoteError, WeftClient, WorkerMode, WorkerOptions};
//!
//! #[tokio::main]
//! async fn main() -> weft_sdk::Result<()> {
//!     let client = WeftClient::connect(BridgeConfig::localhost("orders")).await?;
//!
//!     // Host a workflow implementation the proxy can invoke.
//!     client.register_workflow("ship-order", |ctx, args| async move {
//!         let pending = ctx.schedule_activity("charge-card", args).await
//!             .map_err(|e| RemoteError::generic(e.to_string()))?;
//!         let receipt = pending.await_result().await
//!             .map_err(|e| RemoteError::generic(e.to_string()))?;
//!         Ok(receipt)
//!     }).await?;
//!
//!     // Poll for work.
//!     let worker = client
//!         .start_worker(WorkerMode::Both, "orders", "default", WorkerOptions::default())
//!         .await?;
//!
//!     // Kick one off and interact with it.
//!     let run = client.start_workflow("ship-order", &b"{\"sku\":1}"[..]).await?;
//!     client.signal_workflow(&run.workflow_id, Some(&run.run_id), "approve", &b"yes"[..]).await?;
//!
//!     client.stop_worker(&worker).await?;
//!     client.terminate().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! The bridge can be configured via environment variables or
//! programmatically; see [`BridgeConfig`].
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `WEFT_PROXY_ADDRS` | Yes | - | Comma-separated proxy addresses |
//! | `WEFT_DOMAIN` | Yes | - | Default domain |
//! | `WEFT_TASK_QUEUE` | No | `default` | Default task queue |
//! | `WEFT_CONNECT_TIMEOUT_MS` | No | `10000` | Dial timeout |
//! | `WEFT_REQUEST_TIMEOUT_MS` | No | `30000` | Request timeout |
//! | `WEFT_HEARTBEAT_INTERVAL_MS` | No | `15000` | Probe interval (0 disables) |
//!
//! # Error taxonomy
//!
//! Transport and protocol failures ([`BridgeError::Connection`],
//! [`BridgeError::Protocol`]) are distinct from remote/business
//! failures ([`RemoteError`]), from lifecycle violations
//! ([`BridgeError::ContextClosed`],
//! [`BridgeError::AlreadyStoppedCannotRestart`]) and from replay
//! divergence ([`BridgeError::NonDeterministic`]); see [`BridgeError`].

pub mod client;
pub mod config;
pub mod context;
pub mod error;
mod events;
mod global;
pub mod registry;
pub mod replay;
pub mod slot;
pub mod worker;

// Main types
pub use client::{WeftClient, WorkflowRun};
pub use config::BridgeConfig;
pub use context::{
    ActivityContext, CommandSink, ContextState, Outcome, PendingActivity, PendingChild,
    QueueHandle, WorkflowContext, WorkflowQueue,
};
pub use error::{BridgeError, RemoteError, RemoteErrorKind, Result};
pub use registry::EntityRegistry;
pub use replay::{RecordedKind, RecordedResult, ReplayCursor};
pub use slot::CompletionSlot;
pub use worker::{WorkerHandle, WorkerKey, WorkerMode, WorkerOptions};

// Global bridge accessor
pub use global::{bridge, register_bridge, try_bridge};

// Re-export the protocol layer for advanced usage
pub use weft_protocol as protocol;
pub use weft_protocol::{DispatchError, Envelope, MessageKind, ProtocolError};
