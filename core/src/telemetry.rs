// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

/// Outcome of a remote call made on behalf of a cache, reported to whatever
/// observer the embedder wired up (metrics, logs, both).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    Success,
    Failure,
    Timeout,
}

/// Which cache a hit/miss happened against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKind {
    System,
    Backend,
}

pub type OnRemoteResponse = Arc<dyn Fn(CacheKind, RemoteOutcome) + Send + Sync>;
pub type OnCacheHit = Arc<dyn Fn(CacheKind, bool) + Send + Sync>;

/// The set of callbacks an `AuthorizationManager` invokes as it runs. Both
/// fields default to no-ops so embedders only wire up what they care about.
#[derive(Clone)]
pub struct Telemetry {
    pub on_remote_response: OnRemoteResponse,
    pub on_cache_hit: OnCacheHit,
}

impl Default for Telemetry {
    fn default() -> Self {
        Telemetry {
            on_remote_response: Arc::new(|_, _| {}),
            on_cache_hit: Arc::new(|_, _| {}),
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn default_callbacks_are_no_ops() {
        let telemetry = Telemetry::default();
        (telemetry.on_remote_response)(CacheKind::System, RemoteOutcome::Success);
        (telemetry.on_cache_hit)(CacheKind::Backend, true);
    }

    #[test]
    fn custom_callback_is_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let telemetry = Telemetry {
            on_remote_response: Arc::new(move |_, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
            ..Telemetry::default()
        };
        (telemetry.on_remote_response)(CacheKind::System, RemoteOutcome::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
