// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;

use grpc_util::infra::setup_infra_endpoints;
use grpc_util::logging::setup_logging;
use grpc_util::sentry::setup_sentry;
use sidecar_core::backend_engine::{BackendEngine, FailClosed};
use sidecar_core::clients::ClientBuilder;
use sidecar_core::manager::AuthorizationManager;
use sidecar_core::system_cache::SystemCache;
use sidecar_core::telemetry::Telemetry;

mod config;
mod facade;

/// CLI surface: a required config file plus the handful of fields worth
/// overriding per-deployment without editing the file (mirrors `worker`'s
/// `clap::Parser` + `env` feature).
#[derive(Parser)]
#[command(name = "sidecar_server")]
#[command(about = "Authorization sidecar fronting System and Backend.", long_about = None)]
struct ServerCommand {
    /// Path to the YAML config file.
    #[arg(short, long, env)]
    config: String,
    /// Overrides `system_endpoint.address` from the config file.
    #[arg(long, env)]
    system_endpoint: Option<String>,
    /// Overrides `backend_endpoint.address` from the config file.
    #[arg(long, env)]
    backend_endpoint: Option<String>,
    /// Overrides `listen_addr` from the config file.
    #[arg(long, env)]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cmd = ServerCommand::parse();

    let mut config = {
        let config_content = tokio::fs::read_to_string(&cmd.config)
            .await
            .map_err(|err| format!("Failed to read config from {}: {err}", cmd.config))?;
        config::Config::from_str(&config_content)?
    };
    if let Some(address) = cmd.system_endpoint {
        config.system_endpoint.address = address;
    }
    if let Some(address) = cmd.backend_endpoint {
        config.backend_endpoint.address = address;
    }
    if let Some(listen_addr) = cmd.listen_addr {
        config.listen_addr = listen_addr;
    }

    setup_logging(config.infra.as_ref(), "sidecar_server");
    log::info!("sidecar server config: {config:?}");
    let _sentry_guard = setup_sentry(config.infra.as_ref(), "sidecar_server");

    let system_client = ClientBuilder::new(config.system_endpoint.address.clone(), config.system_endpoint.connections)
        .build_system_client()
        .await?;
    let backend_client = ClientBuilder::new(config.backend_endpoint.address.clone(), config.backend_endpoint.connections)
        .build_backend_client()
        .await?;

    let telemetry = Telemetry::default();
    let system_cache = Arc::new(SystemCache::new(
        system_client,
        config.core.system_cache_ttl(),
        config.core.system_refresh_buffer(),
        config.core.system_refresh_retries,
        telemetry.clone(),
    ));

    // A nil/absent policy is fail-closed (spec §4.3); this sidecar doesn't
    // yet expose a config knob for choosing fail-open, so it always starts
    // fail-closed.
    let backend_engine = Arc::new(BackendEngine::new(backend_client, Some(Arc::new(FailClosed)), telemetry));

    let manager = AuthorizationManager::new(system_cache, backend_engine);
    let _authz_service = facade::AuthzService::new(manager.clone());

    let shutdown_receiver = setup_infra_endpoints(config.infra.unwrap_or_default(), || {}).expect("setup infra endpoints");

    if config.core.backend_caching_enabled {
        tokio::spawn(run_flush_worker(manager.clone(), config.core.backend_flush_interval(), shutdown_receiver.clone()));
    }

    log::info!("sidecar server listening for shutdown signal, inbound serving delegated to {}", config.listen_addr);
    await_shutdown(shutdown_receiver).await;

    manager.shutdown().await;
    Ok(())
}

/// Blocks until the infra admin thread drops its shutdown sender (spec
/// §4.5), the same `changed().await.is_ok()` pattern `proxy_server` uses.
async fn await_shutdown(mut shutdown_receiver: watch::Receiver<()>) {
    while shutdown_receiver.changed().await.is_ok() {}
}

/// `flush()` is caller-triggered (spec §4.3: "the core does not run its own
/// timer"); this binary is the caller, ticking on `backend_flush_interval`
/// until the infra shutdown signal fires.
async fn run_flush_worker(manager: Arc<AuthorizationManager>, interval: Duration, mut shutdown_receiver: watch::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = manager.flush().await {
                    log::warn!("backend flush pass failed: {err}");
                }
            }
            _ = shutdown_receiver.changed() => break,
        }
    }
}
