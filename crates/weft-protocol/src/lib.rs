// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft Protocol - framed envelope communication layer
//!
//! This crate provides the wire protocol between a host process and the
//! out-of-process worker ("the proxy") that executes workflows and
//! activities on its behalf:
//! - Length-prefixed binary frames over a duplex byte stream
//! - A generic, self-describing [`Envelope`] with a typed property bag
//! - Request/reply correlation with per-request timeouts
//! - Heartbeat-based peer liveness
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       weft-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Correlation: RequestDispatcher + pending-reply table       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: Envelope codec (length-prefixed, little-endian)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: duplex byte stream (loopback TCP / in-memory)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::time::Duration;
//! use weft_protocol::{Envelope, MessageKind, RequestDispatcher, keys};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:5050").await?;
//! let (dispatcher, mut pushes) = RequestDispatcher::connect(stream, Duration::from_secs(30));
//!
//! let request = Envelope::new(MessageKind::Initialize)
//!     .with_str(keys::LIBRARY_VERSION, env!("CARGO_PKG_VERSION"));
//! let reply = dispatcher.send(request).await?;
//!
//! // Server pushes (proxy-initiated requests, completion notifications)
//! // arrive on the push channel and are handled off the read loop.
//! while let Some(envelope) = pushes.recv().await {
//!     // route by envelope.kind ...
//! }
//! ```

pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod frame;
pub mod heartbeat;
pub mod ids;

// Re-export main types
pub use connection::{Connection, InboundHandler};
pub use dispatcher::{DispatchError, RequestDispatcher};
pub use envelope::{Envelope, MessageCategory, MessageKind, Property, PropertyValue, keys};
pub use frame::{FRAME_MAGIC, MAX_FRAME_SIZE, ProtocolError, read_frame, write_frame};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, PeerHealth};
pub use ids::IdGenerator;
