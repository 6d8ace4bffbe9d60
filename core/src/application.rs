// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::{Granularity, Hierarchy, LimitCounter, UnlimitedCounter, UsageReport};

/// The mutable half of an `Application`: everything guarded by the
/// per-entry read/write lock (spec §3, §4.1).
#[derive(Clone, Debug, Default)]
pub struct ApplicationState {
    pub remote_state: LimitCounter,
    pub local_state: LimitCounter,
    pub unlimited_counter: UnlimitedCounter,
    /// Epoch-seconds start of the lowest-granularity window last observed
    /// from Backend; used to detect period rollover during flush.
    pub timestamp: i64,
}

/// A value-copy of an application taken during the snapshot phase of a
/// flush. Carries the `ownedBy`/`id` pair the flush pipeline groups and
/// re-derives the cache key from.
#[derive(Clone, Debug)]
pub struct ApplicationSnapshot {
    pub owned_by: String,
    pub id: String,
    pub auth_type: String,
    pub auth_value: String,
    pub params: HashMap<String, String>,
    pub hierarchy: Hierarchy,
    pub state: ApplicationState,
}

/// The per-(service, app) accounting object (spec §3, §4.1). Identity and
/// replay material are immutable for the life of the entry; everything that
/// changes on the request path lives behind `state`.
///
/// `auth_type`/`auth_value` are the proxy's own credentials for calling
/// Backend on the service's behalf (mirrors `ProxyConfig::backend_auth_type`/
/// `backend_auth_value`); `params` are the per-app replay parameters Backend
/// needs to identify *this* application within the service (e.g. a
/// `user_key` or `app_id`/`app_key` pair) and are echoed back verbatim as a
/// transaction's `params` on every outbound call.
pub struct Application {
    pub service_id: String,
    pub application_id: String,
    pub auth_type: String,
    pub auth_value: String,
    pub params: HashMap<String, String>,
    pub hierarchy: Hierarchy,
    state: RwLock<ApplicationState>,
}

impl Application {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_id: String,
        application_id: String,
        auth_type: String,
        auth_value: String,
        params: HashMap<String, String>,
        hierarchy: Hierarchy,
        remote_state: LimitCounter,
        local_state: LimitCounter,
        timestamp: i64,
    ) -> Self {
        Application {
            service_id,
            application_id,
            auth_type,
            auth_value,
            params,
            hierarchy,
            state: RwLock::new(ApplicationState {
                remote_state,
                local_state,
                unlimited_counter: UnlimitedCounter::default(),
                timestamp,
            }),
        }
    }

    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.service_id, self.application_id)
    }

    pub fn cache_key_for(service_id: &str, application_id: &str) -> String {
        format!("{service_id}_{application_id}")
    }

    /// Canonical identifier for an application derived from its replay
    /// params, used as the cache key's application component when a caller
    /// has not already resolved one explicitly. Prefers the well-known
    /// `user_key`/`app_id` keys the two supported auth patterns populate,
    /// falling back to a stable join of every param so two distinct
    /// credential sets never collide.
    pub fn derive_application_id(params: &HashMap<String, String>) -> String {
        if let Some(user_key) = params.get("user_key") {
            return user_key.clone();
        }
        if let Some(app_id) = params.get("app_id") {
            return app_id.clone();
        }
        let mut pairs: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs.join("&")
    }

    /// Expand a request's metric set by walking the hierarchy one level: for
    /// every request metric that is a child of some parent, the parent also
    /// receives the same delta. No transitive closure (spec §4.1).
    pub fn compute_affected_metrics(&self, request_metrics: &HashMap<String, i64>) -> HashMap<String, i64> {
        let mut affected = request_metrics.clone();
        for (parent, children) in &self.hierarchy {
            for child in children {
                if let Some(&delta) = request_metrics.get(child) {
                    *affected.entry(parent.clone()).or_insert(0) += delta;
                }
            }
        }
        affected
    }

    /// `true` iff none of the affected metrics would breach their limit at
    /// any granularity. Takes only a read lock so concurrent authorizations
    /// against the same app scale with readers.
    pub fn is_authorized(&self, affected_metrics: &HashMap<String, i64>) -> bool {
        let state = self.state.read();
        for (metric, &increment) in affected_metrics {
            if let Some(usage) = state.local_state.get(metric) {
                for report in usage.reports() {
                    if report.current_value + increment > report.max_value {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Apply locally observed activity. Limited metrics get every
    /// granularity bumped by the increment; unlimited metrics accumulate in
    /// `unlimited_counter`. Never clamps to `max_value` - breach detection
    /// is read-side only.
    pub fn local_report(&self, affected_metrics: &HashMap<String, i64>) {
        if affected_metrics.is_empty() {
            return;
        }
        let mut state = self.state.write();
        for (metric, &increment) in affected_metrics {
            if let Some(usage) = state.local_state.get_mut(metric) {
                for report in usage.reports_mut() {
                    report.current_value += increment;
                }
            } else {
                *state.unlimited_counter.entry(metric.clone()).or_insert(0) += increment;
            }
        }
    }

    /// Deltas to send Backend on the next report: for limited metrics, the
    /// local-minus-remote difference at the lowest comparable granularity;
    /// for unlimited metrics, the raw counter value.
    pub fn calculate_deltas(&self) -> HashMap<String, i64> {
        calculate_deltas_from_state(&self.state.read())
    }

    /// A value-copy suitable for snapshotting during flush; does not share
    /// storage with `self`.
    pub fn deep_copy(&self) -> ApplicationSnapshot {
        let state = self.state.read();
        ApplicationSnapshot {
            owned_by: self.service_id.clone(),
            id: self.application_id.clone(),
            auth_type: self.auth_type.clone(),
            auth_value: self.auth_value.clone(),
            params: self.params.clone(),
            hierarchy: self.hierarchy.clone(),
            state: state.clone(),
        }
    }

    /// Replace the mutable state wholesale. Used by the flush pipeline's
    /// cache-update phase, which computes a full new `ApplicationState` from
    /// the reconciliation matrix and installs it under one write lock.
    pub fn replace_state(&self, new_state: ApplicationState) {
        *self.state.write() = new_state;
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&ApplicationState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut ApplicationState) -> R) -> R {
        f(&mut self.state.write())
    }
}

/// Same computation as `Application::calculate_deltas`, operating directly
/// on a detached `ApplicationState` (e.g. from a flush snapshot, which has
/// no lock of its own to take).
pub fn calculate_deltas_from_state(state: &ApplicationState) -> HashMap<String, i64> {
    let mut deltas = HashMap::new();
    for (metric, local_usage) in &state.local_state {
        if let (Some(local_lowest), Some(remote_usage)) = (local_usage.lowest(), state.remote_state.get(metric)) {
            if let Some(remote_lowest) = remote_usage.lowest() {
                if remote_lowest.period == local_lowest.period {
                    deltas.insert(metric.clone(), local_lowest.current_value - remote_lowest.current_value);
                }
            }
        }
    }
    for (metric, &value) in &state.unlimited_counter {
        deltas.insert(metric.clone(), value);
    }
    deltas
}

fn usage(period: Granularity, current_value: i64, max_value: i64) -> UsageReport {
    UsageReport {
        period,
        period_start: 0,
        period_end: 60,
        current_value,
        max_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricUsage;

    fn app_with_hits(local_current: i64, max: i64) -> Application {
        let mut local = LimitCounter::default();
        local.insert("hits".to_owned(), MetricUsage::new(vec![usage(Granularity::Minute, local_current, max)]));
        let mut hierarchy = Hierarchy::default();
        hierarchy.insert("hits".to_owned(), vec!["hits_child".to_owned()]);
        Application::new(
            "svc".to_owned(),
            "app".to_owned(),
            "user_key".to_owned(),
            "key-123".to_owned(),
            HashMap::new(),
            hierarchy,
            LimitCounter::default(),
            local,
            0,
        )
    }

    #[test]
    fn is_authorized_denies_on_breach() {
        let app = app_with_hits(3, 4);
        let mut request = HashMap::new();
        request.insert("hits".to_owned(), 2);
        assert!(!app.is_authorized(&request));
    }

    #[test]
    fn is_authorized_allows_within_limit() {
        let app = app_with_hits(2, 4);
        let mut request = HashMap::new();
        request.insert("hits".to_owned(), 1);
        assert!(app.is_authorized(&request));
    }

    #[test]
    fn compute_affected_metrics_propagates_to_parent() {
        let app = app_with_hits(0, 10);
        let mut request = HashMap::new();
        request.insert("hits_child".to_owned(), 2);
        let affected = app.compute_affected_metrics(&request);
        assert_eq!(affected.get("hits_child"), Some(&2));
        assert_eq!(affected.get("hits"), Some(&2));
    }

    #[test]
    fn local_report_bumps_limited_and_unlimited() {
        let app = app_with_hits(0, 10);
        let mut metrics = HashMap::new();
        metrics.insert("hits".to_owned(), 3);
        metrics.insert("orphan".to_owned(), 2);
        app.local_report(&metrics);
        app.with_state(|state| {
            assert_eq!(state.local_state.get("hits").unwrap().lowest().unwrap().current_value, 3);
            assert_eq!(state.unlimited_counter.get("orphan"), Some(&2));
        });
    }

    #[test]
    fn local_report_empty_is_a_no_op() {
        let app = app_with_hits(5, 10);
        app.local_report(&HashMap::new());
        app.with_state(|state| {
            assert_eq!(state.local_state.get("hits").unwrap().lowest().unwrap().current_value, 5);
            assert!(state.unlimited_counter.is_empty());
        });
    }

    #[test]
    fn calculate_deltas_uses_lowest_comparable_granularity() {
        let mut local = LimitCounter::default();
        local.insert("hits".to_owned(), MetricUsage::new(vec![usage(Granularity::Hour, 50, 100)]));
        let mut remote = LimitCounter::default();
        remote.insert("hits".to_owned(), MetricUsage::new(vec![usage(Granularity::Hour, 30, 100)]));
        let app = Application::new(
            "svc".to_owned(),
            "app".to_owned(),
            "user_key".to_owned(),
            "key-123".to_owned(),
            HashMap::new(),
            Hierarchy::default(),
            remote,
            local,
            1000,
        );
        let deltas = app.calculate_deltas();
        assert_eq!(deltas.get("hits"), Some(&20));
    }

    #[test]
    fn deep_copy_does_not_share_storage() {
        let app = app_with_hits(3, 4);
        let snapshot = app.deep_copy();
        let mut metrics = HashMap::new();
        metrics.insert("hits".to_owned(), 1);
        app.local_report(&metrics);
        assert_eq!(snapshot.state.local_state.get("hits").unwrap().lowest().unwrap().current_value, 3);
        app.with_state(|state| {
            assert_eq!(state.local_state.get("hits").unwrap().lowest().unwrap().current_value, 4);
        });
    }

    #[test]
    fn derive_application_id_prefers_user_key() {
        let mut params = HashMap::new();
        params.insert("user_key".to_owned(), "abc".to_owned());
        params.insert("app_id".to_owned(), "def".to_owned());
        assert_eq!(Application::derive_application_id(&params), "abc");
    }

    #[test]
    fn derive_application_id_falls_back_to_app_id() {
        let mut params = HashMap::new();
        params.insert("app_id".to_owned(), "def".to_owned());
        assert_eq!(Application::derive_application_id(&params), "def");
    }
}
