// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_system_cache_ttl_s() -> u64 {
    300
}

fn default_system_refresh_buffer_s() -> u64 {
    30
}

fn default_system_refresh_retries() -> u32 {
    3
}

fn default_system_min_refresh_interval_ms() -> u64 {
    1_000
}

fn default_max_cache_entries() -> usize {
    1_000
}

fn default_backend_flush_interval_s() -> u64 {
    15
}

fn default_flush_queue_capacity() -> usize {
    10_000
}

fn default_http_client_timeout_s() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Tunables for the authorization manager's two caches and their background
/// workers. All fields have defaults matching what the spec calls out as
/// sane out-of-the-box behavior; operators override via the config file or
/// environment.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// How long a cached `ProxyConfig` is considered fresh without a refresh.
    #[serde(default = "default_system_cache_ttl_s")]
    pub system_cache_ttl_s: u64,
    /// How far ahead of expiry the proactive refresh worker wakes an entry.
    #[serde(default = "default_system_refresh_buffer_s")]
    pub system_refresh_buffer_s: u64,
    /// Retries allowed per refresh pass before an entry is marked
    /// misbehaving for the remainder of that pass.
    #[serde(default = "default_system_refresh_retries")]
    pub system_refresh_retries: u32,
    /// Floor under which two refresh wake-ups for the same entry are
    /// coalesced into one.
    #[serde(default = "default_system_min_refresh_interval_ms")]
    pub system_min_refresh_interval_ms: u64,
    /// Upper bound on live entries held by each cache before eviction.
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
    /// Whether Backend-side local caching/batched reporting is enabled at
    /// all. When `false`, every `authorize`/`report` call goes straight to
    /// Backend and no flush worker is started.
    #[serde(default = "default_true")]
    pub backend_caching_enabled: bool,
    /// Interval between flush worker passes.
    #[serde(default = "default_backend_flush_interval_s")]
    pub backend_flush_interval_s: u64,
    /// Bound on the flush queue; oldest batch is dropped on overflow
    /// (FIFO-bounded, per spec - no backpressure to callers).
    #[serde(default = "default_flush_queue_capacity")]
    pub flush_queue_capacity: usize,
    /// Timeout applied to each outbound System/Backend gRPC call.
    #[serde(default = "default_http_client_timeout_s")]
    pub http_client_timeout_s: u64,
    /// Skip TLS verification on outbound channels. Never set this in
    /// staging or production; it exists for local development against
    /// self-signed endpoints.
    #[serde(default)]
    pub allow_insecure_connection: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            system_cache_ttl_s: default_system_cache_ttl_s(),
            system_refresh_buffer_s: default_system_refresh_buffer_s(),
            system_refresh_retries: default_system_refresh_retries(),
            system_min_refresh_interval_ms: default_system_min_refresh_interval_ms(),
            max_cache_entries: default_max_cache_entries(),
            backend_caching_enabled: true,
            backend_flush_interval_s: default_backend_flush_interval_s(),
            flush_queue_capacity: default_flush_queue_capacity(),
            http_client_timeout_s: default_http_client_timeout_s(),
            allow_insecure_connection: false,
        }
    }
}

impl Config {
    pub fn from_str(raw_config: &str) -> Result<Config, String> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }

    pub fn system_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.system_cache_ttl_s)
    }

    pub fn system_refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.system_refresh_buffer_s)
    }

    pub fn system_min_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.system_min_refresh_interval_ms)
    }

    pub fn backend_flush_interval(&self) -> Duration {
        Duration::from_secs(self.backend_flush_interval_s)
    }

    pub fn http_client_timeout(&self) -> Duration {
        Duration::from_secs(self.http_client_timeout_s)
    }
}
