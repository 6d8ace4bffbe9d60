// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use grpc_util::retry::RetryBudget;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::warn;

use crate::clients::{SystemClient, SystemLookup};
use crate::error::{CoreError, NetworkErrorKind};
use crate::model::ProxyConfig;
use crate::telemetry::{CacheKind, RemoteOutcome, Telemetry};
use crate::wire::proxy_config_from_wire;

struct SystemCacheEntry {
    config: ProxyConfig,
    expiry: Instant,
    lookup: SystemLookup,
}

/// TTL map over fetched `ProxyConfig` documents, with a background worker
/// that refreshes entries ahead of expiry (spec §4.4).
pub struct SystemCache {
    entries: RwLock<HashMap<String, SystemCacheEntry>>,
    client: Arc<dyn SystemClient>,
    ttl: Duration,
    refresh_buffer: Duration,
    retries: u32,
    telemetry: Telemetry,
}

impl SystemCache {
    pub fn new(client: Arc<dyn SystemClient>, ttl: Duration, refresh_buffer: Duration, retries: u32, telemetry: Telemetry) -> Self {
        SystemCache {
            entries: RwLock::new(HashMap::new()),
            client,
            ttl,
            refresh_buffer,
            retries,
            telemetry,
        }
    }

    fn cache_key(lookup: &SystemLookup) -> String {
        format!("{}_{}", lookup.service_id, lookup.environment)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn refresh_interval(&self) -> Duration {
        self.ttl.saturating_sub(self.refresh_buffer)
    }

    /// `get(lookup)`: serves a live cache hit, otherwise fills on miss. The
    /// request is rejected up front when any of the three lookup fields is
    /// empty (spec §4.4).
    pub async fn get(&self, lookup: &SystemLookup) -> Result<ProxyConfig, CoreError> {
        lookup.validate()?;
        let key = Self::cache_key(lookup);
        let now = Instant::now();
        if let Some(config) = self.entries.read().get(&key).filter(|entry| entry.expiry > now).map(|entry| entry.config.clone()) {
            (self.telemetry.on_cache_hit)(CacheKind::System, true);
            return Ok(config);
        }
        (self.telemetry.on_cache_hit)(CacheKind::System, false);
        self.fill(lookup).await
    }

    async fn fill(&self, lookup: &SystemLookup) -> Result<ProxyConfig, CoreError> {
        let wire_config = self.fetch(lookup).await?;
        let config = proxy_config_from_wire(&wire_config).ok_or_else(|| CoreError::ServiceConfigUnavailable {
            service_id: lookup.service_id.clone(),
        })?;
        let key = Self::cache_key(lookup);
        self.entries.write().insert(
            key,
            SystemCacheEntry {
                config: config.clone(),
                expiry: Instant::now() + self.ttl,
                lookup: lookup.clone(),
            },
        );
        Ok(config)
    }

    async fn fetch(&self, lookup: &SystemLookup) -> Result<crate::clients::WireProxyConfigDocument, CoreError> {
        let result = self.client.fetch_latest_proxy_config(lookup).await;
        let outcome = match &result {
            Ok(_) => RemoteOutcome::Success,
            Err(CoreError::RemoteUnavailable { kind, .. }) if kind.is_transient() => RemoteOutcome::Timeout,
            Err(_) => RemoteOutcome::Failure,
        };
        (self.telemetry.on_remote_response)(CacheKind::System, outcome);
        result
    }

    /// One refresh pass: any entry within `refresh_buffer` of expiry is
    /// refreshed in place. A host that fails non-transiently, or exhausts
    /// its retry budget on transient failures, is recorded as misbehaving
    /// for the remainder of *this* pass only and skipped (spec §4.4).
    pub async fn run_refresh_pass(&self) {
        let due: Vec<(String, SystemLookup)> = {
            let entries = self.entries.read();
            let now = Instant::now();
            entries
                .iter()
                .filter(|(_, entry)| entry.expiry.saturating_duration_since(now) <= self.refresh_buffer)
                .map(|(key, entry)| (key.clone(), entry.lookup.clone()))
                .collect()
        };

        let mut misbehaving = HashSet::new();
        for (key, lookup) in due {
            let host = lookup.service_id.clone();
            if misbehaving.contains(&host) {
                continue;
            }
            let mut budget = RetryBudget::new(self.retries);
            loop {
                match self.fetch(&lookup).await {
                    Ok(wire_config) => {
                        if let Some(config) = proxy_config_from_wire(&wire_config) {
                            self.entries.write().insert(
                                key.clone(),
                                SystemCacheEntry { config, expiry: Instant::now() + self.ttl, lookup: lookup.clone() },
                            );
                        } else {
                            warn!(service_id = %host, "refresh: fetched config carried an unrecognized auth pattern");
                            misbehaving.insert(host);
                        }
                        break;
                    }
                    Err(CoreError::RemoteUnavailable { kind, ref message }) if kind.is_transient() => {
                        if budget.consume() {
                            continue;
                        }
                        warn!(service_id = %host, error = %message, "refresh: retry budget exhausted, marking misbehaving");
                        misbehaving.insert(host);
                        break;
                    }
                    Err(err) => {
                        warn!(service_id = %host, error = %err, "refresh: non-transient failure, marking misbehaving");
                        misbehaving.insert(host);
                        break;
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry past its deadline. Safe to run concurrently with a
    /// refresh pass: both only ever take the map's own lock for a scan, plus
    /// per-key mutation (spec §4.4).
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.write().retain(|_, entry| entry.expiry > now);
    }
}

/// Runs `SystemCache::run_refresh_pass` on a fixed interval until `shutdown`
/// fires, the same `tokio::select!`-over-`watch` pattern the teacher's infra
/// admin server uses to stop on signal.
pub async fn run_refresh_worker(cache: Arc<SystemCache>, interval: Duration, mut shutdown: watch::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cache.run_refresh_pass().await;
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
}

/// Runs `SystemCache::evict_expired` on an interval equal to the cache's TTL,
/// stopped the same way as the refresh worker.
pub async fn run_eviction_worker(cache: Arc<SystemCache>, interval: Duration, mut shutdown: watch::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cache.evict_expired();
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use protos::system::v1::ProxyConfig as WireProxyConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wire_config(backend_endpoint: &str) -> WireProxyConfig {
        WireProxyConfig {
            backend_endpoint: backend_endpoint.to_owned(),
            auth_pattern: protos::system::v1::AuthPattern::ApiKey as i32,
            backend_auth_type: "user_key".to_owned(),
            backend_auth_value: "secret".to_owned(),
            rules: Vec::new(),
            hierarchy: HashMap::new(),
            openid_client_id_claim: None,
        }
    }

    fn lookup() -> SystemLookup {
        SystemLookup {
            access_token: "token".to_owned(),
            service_id: "svc".to_owned(),
            environment: "production".to_owned(),
        }
    }

    struct ScriptedSystemClient {
        responses: Mutex<Vec<Result<WireProxyConfig, CoreError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSystemClient {
        fn new(responses: Vec<Result<WireProxyConfig, CoreError>>) -> Self {
            ScriptedSystemClient { responses: Mutex::new(responses), calls: AtomicUsize::new(0) }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SystemClient for ScriptedSystemClient {
        async fn fetch_latest_proxy_config(&self, _lookup: &SystemLookup) -> Result<WireProxyConfig, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                panic!("no scripted system response left");
            }
            responses.remove(0)
        }
    }

    #[tokio::test]
    async fn get_fills_on_miss_and_hits_thereafter() {
        let client = Arc::new(ScriptedSystemClient::new(vec![Ok(wire_config("backend:3000"))]));
        let cache = SystemCache::new(client.clone(), Duration::from_secs(300), Duration::from_secs(30), 3, Telemetry::default());

        let first = cache.get(&lookup()).await.unwrap();
        assert_eq!(first.backend_endpoint, "backend:3000");
        let second = cache.get(&lookup()).await.unwrap();
        assert_eq!(second.backend_endpoint, "backend:3000");
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn get_rejects_empty_lookup_fields() {
        let client = Arc::new(ScriptedSystemClient::new(vec![]));
        let cache = SystemCache::new(client, Duration::from_secs(300), Duration::from_secs(30), 3, Telemetry::default());
        let bad_lookup = SystemLookup { access_token: String::new(), service_id: "svc".to_owned(), environment: "production".to_owned() };
        let result = cache.get(&bad_lookup).await;
        assert!(matches!(result, Err(CoreError::InvalidArguments { .. })));
    }

    // Scenario 6: refresh retry budget - timeout twice then success.
    #[tokio::test]
    async fn refresh_pass_retries_then_succeeds_within_budget() {
        let client = Arc::new(ScriptedSystemClient::new(vec![
            Ok(wire_config("initial:3000")),
            Err(CoreError::RemoteUnavailable { message: "timeout".to_owned(), kind: NetworkErrorKind::Timeout }),
            Err(CoreError::RemoteUnavailable { message: "timeout".to_owned(), kind: NetworkErrorKind::Timeout }),
            Ok(wire_config("refreshed:3000")),
        ]));
        let cache = Arc::new(SystemCache::new(
            client.clone(),
            Duration::from_secs(10),
            Duration::from_secs(9),
            2,
            Telemetry::default(),
        ));
        cache.fill(&lookup()).await.unwrap();

        cache.run_refresh_pass().await;

        let refreshed = cache.get(&lookup()).await.unwrap();
        assert_eq!(refreshed.backend_endpoint, "refreshed:3000");
        assert_eq!(client.call_count(), 4);
    }

    #[tokio::test]
    async fn refresh_pass_marks_misbehaving_after_budget_exhausted() {
        let client = Arc::new(ScriptedSystemClient::new(vec![
            Ok(wire_config("initial:3000")),
            Err(CoreError::RemoteUnavailable { message: "timeout".to_owned(), kind: NetworkErrorKind::Timeout }),
            Err(CoreError::RemoteUnavailable { message: "timeout".to_owned(), kind: NetworkErrorKind::Timeout }),
        ]));
        let cache = Arc::new(SystemCache::new(
            client.clone(),
            Duration::from_secs(10),
            Duration::from_secs(9),
            1,
            Telemetry::default(),
        ));
        cache.fill(&lookup()).await.unwrap();

        cache.run_refresh_pass().await;

        // Entry is left stale (not refreshed) once the budget for this pass
        // is exhausted; the next `get` still serves the unexpired document.
        let config = cache.get(&lookup()).await.unwrap();
        assert_eq!(config.backend_endpoint, "initial:3000");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn evict_expired_drops_only_past_deadline_entries() {
        let client = Arc::new(ScriptedSystemClient::new(vec![Ok(wire_config("backend:3000"))]));
        let cache = SystemCache::new(client, Duration::from_millis(10), Duration::from_millis(1), 1, Telemetry::default());
        cache.fill(&lookup()).await.unwrap();
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.evict_expired();
        assert!(cache.is_empty());
    }
}
