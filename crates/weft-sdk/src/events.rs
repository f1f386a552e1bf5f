// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Envelope builders for session traffic.

use bytes::Bytes;
use weft_protocol::envelope::keys;
use weft_protocol::{Envelope, MessageKind};

use crate::config::BridgeConfig;
use crate::error::RemoteError;

fn stamped(kind: MessageKind) -> Envelope {
    Envelope::new(kind).with_i64(keys::TIMESTAMP_MS, chrono::Utc::now().timestamp_millis())
}

/// The handshake request sent before any other traffic.
pub(crate) fn initialize_envelope(config: &BridgeConfig) -> Envelope {
    let mut envelope = stamped(MessageKind::Initialize)
        .with_str(keys::LIBRARY_VERSION, config.library_version.clone())
        .with_str(keys::DOMAIN, config.default_domain.clone());
    if let Some(listen_address) = &config.listen_address {
        envelope.set_str(keys::LISTEN_ADDRESS, listen_address.clone());
    }
    envelope
}

/// A liveness probe.
pub(crate) fn heartbeat_envelope() -> Envelope {
    stamped(MessageKind::Heartbeat)
}

/// The orderly shutdown request; the proxy closes its side of the
/// transport after acknowledging.
pub(crate) fn terminate_envelope() -> Envelope {
    stamped(MessageKind::Terminate)
}

/// Success reply for a proxy-initiated invoke request.
pub(crate) fn invoke_success_reply(request: &Envelope, result: Bytes) -> Option<Envelope> {
    Some(request.reply()?.with_payload(result))
}

/// Failure reply for a proxy-initiated invoke request; the error rides
/// in the JSON `Error` property.
pub(crate) fn invoke_failure_reply(request: &Envelope, error: &RemoteError) -> Option<Envelope> {
    let mut reply = request.reply()?;
    error.write_to(&mut reply);
    Some(reply)
}
