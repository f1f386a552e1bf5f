// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment-variable configuration tests.

use weft_sdk::{BridgeConfig, BridgeError};

/// Env-var loading is exercised in one test to keep the process
/// environment single-writer.
#[test]
fn from_env_reads_required_and_optional_variables() {
    // Missing required variables fail loudly.
    unsafe {
        std::env::remove_var("WEFT_PROXY_ADDRS");
        std::env::remove_var("WEFT_DOMAIN");
    }
    assert!(matches!(
        BridgeConfig::from_env(),
        Err(BridgeError::Config(_))
    ));

    unsafe {
        std::env::set_var("WEFT_PROXY_ADDRS", "127.0.0.1:5050,127.0.0.1:5051");
        std::env::set_var("WEFT_DOMAIN", "orders");
        std::env::set_var("WEFT_TASK_QUEUE", "priority");
        std::env::set_var("WEFT_REQUEST_TIMEOUT_MS", "7000");
        std::env::set_var("WEFT_HEARTBEAT_INTERVAL_MS", "0");
    }

    let config = BridgeConfig::from_env().unwrap();
    assert_eq!(config.proxy_addrs.len(), 2);
    assert_eq!(config.default_domain, "orders");
    assert_eq!(config.default_task_queue, "priority");
    assert_eq!(config.request_timeout_ms, 7_000);
    assert_eq!(config.heartbeat_interval_ms, 0);
    // Untouched settings keep their defaults.
    assert_eq!(config.connect_timeout_ms, 10_000);
    assert_eq!(config.heartbeat_max_missed, 3);

    // A malformed address is a configuration error, not a panic.
    unsafe {
        std::env::set_var("WEFT_PROXY_ADDRS", "not-an-address");
    }
    assert!(matches!(
        BridgeConfig::from_env(),
        Err(BridgeError::Config(_))
    ));

    unsafe {
        std::env::remove_var("WEFT_PROXY_ADDRS");
        std::env::remove_var("WEFT_DOMAIN");
        std::env::remove_var("WEFT_TASK_QUEUE");
        std::env::remove_var("WEFT_REQUEST_TIMEOUT_MS");
        std::env::remove_var("WEFT_HEARTBEAT_INTERVAL_MS");
    }
}
