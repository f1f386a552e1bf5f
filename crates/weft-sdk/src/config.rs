// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bridge configuration for connecting to the weft proxy.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use weft_protocol::HeartbeatConfig;

use crate::error::{BridgeError, Result};

/// Bridge configuration for connecting to the weft proxy.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Proxy addresses, tried in order at connect time.
    pub proxy_addrs: Vec<SocketAddr>,
    /// Default domain for workflow/activity operations.
    pub default_domain: String,
    /// Default task queue for workflow/activity operations (default: "default").
    pub default_task_queue: String,
    /// Connection timeout per dial attempt in milliseconds (default: 10_000).
    pub connect_timeout_ms: u64,
    /// Correlated request timeout in milliseconds (default: 30_000).
    pub request_timeout_ms: u64,
    /// Extra dial rounds over the address list before giving up (default: 3).
    pub connect_retry_count: u32,
    /// Delay between dial rounds in milliseconds (default: 500).
    pub connect_retry_delay_ms: u64,
    /// Heartbeat probe interval in milliseconds (default: 15_000).
    /// Set to 0 to disable heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Per-probe heartbeat reply timeout in milliseconds (default: 5_000).
    pub heartbeat_timeout_ms: u64,
    /// Consecutive missed heartbeats before the peer is declared
    /// unhealthy (default: 3).
    pub heartbeat_max_missed: u32,
    /// Address the proxy can reach this client back on, reported in the
    /// initialize handshake when set.
    pub listen_address: Option<String>,
    /// Library version reported in the initialize handshake.
    pub library_version: String,
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `WEFT_PROXY_ADDRS` - Comma-separated proxy addresses
    /// - `WEFT_DOMAIN` - Default domain
    ///
    /// # Optional Environment Variables
    /// - `WEFT_TASK_QUEUE` - Default task queue (default: "default")
    /// - `WEFT_CONNECT_TIMEOUT_MS` - Dial timeout (default: 10000)
    /// - `WEFT_REQUEST_TIMEOUT_MS` - Request timeout (default: 30000)
    /// - `WEFT_CONNECT_RETRY_COUNT` - Extra dial rounds (default: 3)
    /// - `WEFT_CONNECT_RETRY_DELAY_MS` - Delay between rounds (default: 500)
    /// - `WEFT_HEARTBEAT_INTERVAL_MS` - Probe interval (default: 15000, 0 to disable)
    /// - `WEFT_HEARTBEAT_TIMEOUT_MS` - Probe timeout (default: 5000)
    /// - `WEFT_HEARTBEAT_MAX_MISSED` - Miss threshold (default: 3)
    /// - `WEFT_LISTEN_ADDRESS` - Callback address reported at initialize
    pub fn from_env() -> Result<Self> {
        let addrs = env::var("WEFT_PROXY_ADDRS")
            .map_err(|_| BridgeError::Config("WEFT_PROXY_ADDRS is required".to_string()))?;
        let proxy_addrs = parse_addr_list(&addrs)?;

        let default_domain = env::var("WEFT_DOMAIN")
            .map_err(|_| BridgeError::Config("WEFT_DOMAIN is required".to_string()))?;

        let default_task_queue =
            env::var("WEFT_TASK_QUEUE").unwrap_or_else(|_| "default".to_string());

        Ok(Self {
            proxy_addrs,
            default_domain,
            default_task_queue,
            connect_timeout_ms: env_u64("WEFT_CONNECT_TIMEOUT_MS", 10_000),
            request_timeout_ms: env_u64("WEFT_REQUEST_TIMEOUT_MS", 30_000),
            connect_retry_count: env_u64("WEFT_CONNECT_RETRY_COUNT", 3) as u32,
            connect_retry_delay_ms: env_u64("WEFT_CONNECT_RETRY_DELAY_MS", 500),
            heartbeat_interval_ms: env_u64("WEFT_HEARTBEAT_INTERVAL_MS", 15_000),
            heartbeat_timeout_ms: env_u64("WEFT_HEARTBEAT_TIMEOUT_MS", 5_000),
            heartbeat_max_missed: env_u64("WEFT_HEARTBEAT_MAX_MISSED", 3) as u32,
            listen_address: env::var("WEFT_LISTEN_ADDRESS").ok(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Create a new configuration with the given domain, connecting to
    /// the default local proxy address.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            proxy_addrs: vec!["127.0.0.1:5050".parse().expect("static address")],
            default_domain: domain.into(),
            default_task_queue: "default".to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            connect_retry_count: 3,
            connect_retry_delay_ms: 500,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 5_000,
            heartbeat_max_missed: 3,
            listen_address: None,
            library_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Configuration for local development: short timeouts, single
    /// local proxy address.
    pub fn localhost(domain: impl Into<String>) -> Self {
        Self {
            connect_timeout_ms: 2_000,
            connect_retry_count: 1,
            ..Self::new(domain)
        }
    }

    /// Replace the proxy address list.
    pub fn with_proxy_addrs(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.proxy_addrs = addrs;
        self
    }

    /// Set the default task queue.
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.default_task_queue = task_queue.into();
        self
    }

    /// Set the correlated request timeout.
    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Set the heartbeat probe interval. Set to 0 to disable heartbeats.
    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set the missed-heartbeat threshold.
    pub fn with_heartbeat_max_missed(mut self, max_missed: u32) -> Self {
        self.heartbeat_max_missed = max_missed;
        self
    }

    /// Set the callback address reported in the initialize handshake.
    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = Some(address.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            max_missed: self.heartbeat_max_missed,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.proxy_addrs.is_empty() {
            return Err(BridgeError::Config(
                "at least one proxy address is required".to_string(),
            ));
        }
        if self.default_domain.is_empty() {
            return Err(BridgeError::Config("default domain must not be empty".to_string()));
        }
        Ok(())
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_addr_list(list: &str) -> Result<Vec<SocketAddr>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|e| BridgeError::Config(format!("invalid proxy address {s:?}: {e}")))
        })
        .collect()
}
