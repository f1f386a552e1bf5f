// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Optional process-wide bridge registration.
//!
//! Long-lived host processes usually hold exactly one bridge; this
//! module lets them register it once at startup and reach it from
//! anywhere without threading the handle through every call site.

use once_cell::sync::OnceCell;

use crate::client::WeftClient;

static BRIDGE: OnceCell<WeftClient> = OnceCell::new();

/// Register the bridge globally.
///
/// # Panics
///
/// Panics if called more than once.
pub fn register_bridge(client: WeftClient) {
    if BRIDGE.set(client).is_err() {
        panic!("bridge already registered; register_bridge() should only be called once");
    }
}

/// The registered bridge.
///
/// # Panics
///
/// Panics if no bridge has been registered.
pub fn bridge() -> &'static WeftClient {
    BRIDGE
        .get()
        .expect("no bridge registered; call register_bridge() at startup")
}

/// The registered bridge, or `None` if none has been registered.
pub fn try_bridge() -> Option<&'static WeftClient> {
    BRIDGE.get()
}
