// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use protos::backend::v1::{AuthorizeRequest, ReportRequest, ReportResponse};
use tokio::sync::{watch, Notify};

use crate::backend_engine::{AuthorizeOutcome, BackendEngine};
use crate::clients::SystemLookup;
use crate::error::CoreError;
use crate::model::ProxyConfig;
use crate::system_cache::{run_eviction_worker, run_refresh_worker, SystemCache};

/// The orchestrator request-path code actually calls (spec §2, §4.5):
/// System cache lookups and Backend engine calls, fronted by one shutdown
/// signal for the System cache's two background workers.
pub struct AuthorizationManager {
    system_cache: Arc<SystemCache>,
    backend_engine: Arc<BackendEngine>,
    shutdown_tx: watch::Sender<()>,
    refresh_done: Arc<Notify>,
    eviction_done: Arc<Notify>,
}

impl AuthorizationManager {
    pub fn new(system_cache: Arc<SystemCache>, backend_engine: Arc<BackendEngine>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let refresh_done = Arc::new(Notify::new());
        let eviction_done = Arc::new(Notify::new());

        let refresh_interval = system_cache.refresh_interval();
        let ttl = system_cache.ttl();

        tokio::spawn({
            let cache = system_cache.clone();
            let shutdown_rx = shutdown_rx.clone();
            let done = refresh_done.clone();
            async move {
                run_refresh_worker(cache, refresh_interval, shutdown_rx).await;
                done.notify_one();
            }
        });
        tokio::spawn({
            let cache = system_cache.clone();
            let done = eviction_done.clone();
            async move {
                run_eviction_worker(cache, ttl, shutdown_rx).await;
                done.notify_one();
            }
        });

        Arc::new(AuthorizationManager {
            system_cache,
            backend_engine,
            shutdown_tx,
            refresh_done,
            eviction_done,
        })
    }

    /// `authorize(system_request) -> policy_document` (spec §4.5): delegates
    /// to the System cache, filling on miss.
    pub async fn authorize(&self, lookup: &SystemLookup) -> Result<ProxyConfig, CoreError> {
        self.system_cache.get(lookup).await
    }

    /// `auth_rep(backend_request) -> decision` (spec §4.5): delegates to the
    /// Backend engine.
    pub async fn auth_rep(&self, request: AuthorizeRequest) -> Result<AuthorizeOutcome, CoreError> {
        self.backend_engine.auth_rep(request).await
    }

    pub fn report(&self, request: ReportRequest) -> ReportResponse {
        self.backend_engine.report(request)
    }

    pub async fn flush(&self) -> Result<(), CoreError> {
        self.backend_engine.flush().await
    }

    pub fn backend_engine(&self) -> &Arc<BackendEngine> {
        &self.backend_engine
    }

    pub fn system_cache(&self) -> &Arc<SystemCache> {
        &self.system_cache
    }

    /// Signals both System workers to stop and waits for each to finish its
    /// current pass. No timeout is applied - the caller is expected to wrap
    /// this in its own deadline (spec §4.5).
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.refresh_done.notified().await;
        self.eviction_done.notified().await;
    }
}
