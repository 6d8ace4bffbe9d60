// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use protos::backend::v1::{AuthorizeRequest, AuthorizeResponse, ReportRequest, ReportResponse, Transaction};
use tracing::warn;

use crate::application::{calculate_deltas_from_state, Application, ApplicationSnapshot, ApplicationState};
use crate::backend_cache::{BackendCache, FlushQueue};
use crate::clients::BackendClient;
use crate::error::CoreError;
use crate::model::{Granularity, LimitCounter};
use crate::telemetry::{CacheKind, RemoteOutcome, Telemetry};
use crate::wire;

/// User-supplied predicate invoked when Backend is transiently unreachable;
/// decides whether the request should be authorized anyway (spec §4.3,
/// glossary "Failure policy").
pub trait FailurePolicy: Send + Sync {
    fn should_authorize(&self) -> bool;
}

/// Authorize every request when Backend is down. Appropriate when
/// occasional over-admission is cheaper than rejecting traffic.
pub struct FailOpen;

impl FailurePolicy for FailOpen {
    fn should_authorize(&self) -> bool {
        true
    }
}

/// Deny every request when Backend is down. The default when no policy is
/// supplied (spec §4.3: "a nil/absent policy is equivalent to fail-closed").
pub struct FailClosed;

impl FailurePolicy for FailClosed {
    fn should_authorize(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizeOutcome {
    pub authorized: bool,
    pub error_code: Option<String>,
}

/// `Authorize`/`AuthRep`/`Report`/`Flush` against the Backend cache (spec
/// §2, §4.3) - the largest single component of the core.
pub struct BackendEngine {
    cache: Arc<BackendCache>,
    client: Arc<dyn BackendClient>,
    failure_policy: Option<Arc<dyn FailurePolicy>>,
    flush_queue_headroom: usize,
    telemetry: Telemetry,
}

impl BackendEngine {
    pub fn new(client: Arc<dyn BackendClient>, failure_policy: Option<Arc<dyn FailurePolicy>>, telemetry: Telemetry) -> Self {
        BackendEngine {
            cache: Arc::new(BackendCache::new()),
            client,
            failure_policy,
            flush_queue_headroom: 16,
            telemetry,
        }
    }

    pub fn cache(&self) -> &BackendCache {
        &self.cache
    }

    /// `authorize(request)`: no counting on success.
    pub async fn authorize(&self, request: AuthorizeRequest) -> Result<AuthorizeOutcome, CoreError> {
        self.authorize_internal(request, false).await
    }

    /// `auth_rep(request)`: authorize, and on success apply `local_report`.
    pub async fn auth_rep(&self, request: AuthorizeRequest) -> Result<AuthorizeOutcome, CoreError> {
        self.authorize_internal(request, true).await
    }

    async fn authorize_internal(&self, request: AuthorizeRequest, count: bool) -> Result<AuthorizeOutcome, CoreError> {
        let transaction = request.transactions.first().cloned().ok_or(CoreError::InvalidTransactions)?;
        let application_id = Application::derive_application_id(&transaction.params);
        let key = Application::cache_key_for(&request.service_id, &application_id);

        let app = match self.cache.get(&key) {
            Some(app) => {
                (self.telemetry.on_cache_hit)(CacheKind::Backend, true);
                app
            }
            None => {
                (self.telemetry.on_cache_hit)(CacheKind::Backend, false);
                match self
                    .fill_on_miss(&request.service_id, &request.auth_type, &request.auth_value, &transaction.params)
                    .await
                {
                    Ok(app) => app,
                    Err(err) => return self.consult_failure_policy(err),
                }
            }
        };

        let affected = app.compute_affected_metrics(&transaction.metrics);
        let authorized = app.is_authorized(&affected);
        if authorized {
            if count {
                app.local_report(&affected);
            }
            Ok(AuthorizeOutcome { authorized: true, error_code: None })
        } else {
            Ok(AuthorizeOutcome {
                authorized: false,
                error_code: Some("usage limits are exceeded".to_owned()),
            })
        }
    }

    /// `report(request)`: returns immediately; the actual accounting runs on
    /// a detached task (spec §4.3 "Report path"). Requires an `Arc<Self>`
    /// handle since the spawned task must outlive this call.
    pub fn report(self: &Arc<Self>, request: ReportRequest) -> ReportResponse {
        if request.transactions.is_empty() {
            return ReportResponse { accepted: true };
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let ReportRequest { service_id, auth_type, auth_value, transactions } = request;
            for transaction in transactions {
                let application_id = Application::derive_application_id(&transaction.params);
                let key = Application::cache_key_for(&service_id, &application_id);
                let app = match engine.cache.get(&key) {
                    Some(app) => app,
                    None => match engine.fill_on_miss(&service_id, &auth_type, &auth_value, &transaction.params).await {
                        Ok(app) => app,
                        Err(err) => {
                            warn!(%service_id, %application_id, error = %err, "report: cache fill failed, skipping transaction");
                            continue;
                        }
                    },
                };
                let affected = app.compute_affected_metrics(&transaction.metrics);
                app.local_report(&affected);
            }
        });
        ReportResponse { accepted: true }
    }

    /// Blanket authorize (no metrics, hierarchy extension requested) to
    /// learn an application's current state and hierarchy. Inserts the
    /// resulting `Application` into the cache on success.
    async fn fill_on_miss(
        &self,
        service_id: &str,
        auth_type: &str,
        auth_value: &str,
        params: &HashMap<String, String>,
    ) -> Result<Arc<Application>, CoreError> {
        let response = self.blanket_authorize(service_id, auth_type, auth_value, params).await?;
        let remote_state = wire::limit_counter_from_wire(&response.usage_reports);
        let local_state = remote_state.clone();
        let hierarchy = wire::hierarchy_from_wire(&response.hierarchy);
        let timestamp = wire::lowest_timestamp(&remote_state);
        let application_id = Application::derive_application_id(params);
        let app = Arc::new(Application::new(
            service_id.to_owned(),
            application_id,
            auth_type.to_owned(),
            auth_value.to_owned(),
            params.clone(),
            hierarchy,
            remote_state,
            local_state,
            timestamp,
        ));
        self.cache.set(app.cache_key(), app.clone());
        Ok(app)
    }

    async fn blanket_authorize(
        &self,
        service_id: &str,
        auth_type: &str,
        auth_value: &str,
        params: &HashMap<String, String>,
    ) -> Result<AuthorizeResponse, CoreError> {
        let request = AuthorizeRequest {
            service_id: service_id.to_owned(),
            auth_type: auth_type.to_owned(),
            auth_value: auth_value.to_owned(),
            transactions: vec![Transaction { metrics: HashMap::new(), params: params.clone(), timestamp: None }],
            extend_hierarchy: true,
        };
        let result = self.client.authorize(request).await;
        let outcome = match &result {
            Ok(_) => RemoteOutcome::Success,
            Err(CoreError::RemoteUnavailable { kind, .. }) if kind.is_transient() => RemoteOutcome::Timeout,
            Err(_) => RemoteOutcome::Failure,
        };
        (self.telemetry.on_remote_response)(CacheKind::Backend, outcome);
        result
    }

    fn consult_failure_policy(&self, err: CoreError) -> Result<AuthorizeOutcome, CoreError> {
        if let CoreError::RemoteUnavailable { kind, .. } = &err {
            if kind.is_transient() {
                if let Some(policy) = &self.failure_policy {
                    if policy.should_authorize() {
                        return Ok(AuthorizeOutcome { authorized: true, error_code: None });
                    }
                }
            }
        }
        Err(err)
    }

    /// The four-phase reconciliation operation (spec §4.3 "Flush"). Caller
    /// triggered; the core runs no timer of its own.
    pub async fn flush(&self) -> Result<(), CoreError> {
        let keys = self.cache.keys();
        let queue = FlushQueue::new(keys.len() + self.flush_queue_headroom);

        // Phase 1: snapshot.
        for key in &keys {
            if let Some(app) = self.cache.get(key) {
                let snapshot = app.deep_copy();
                if !queue.append(snapshot) {
                    return Err(CoreError::QueueFull);
                }
            }
        }

        // Phase 2: grouped remote report, draining the queue in FIFO order.
        let mut handled = Vec::new();
        let mut batch: Vec<ApplicationSnapshot> = Vec::new();
        while let Some(snapshot) = queue.shift() {
            if let Some(first) = batch.first() {
                if first.owned_by != snapshot.owned_by {
                    handled.extend(self.report_batch(std::mem::take(&mut batch)).await);
                    queue.prepend(snapshot);
                    continue;
                }
            }
            batch.push(snapshot);
        }
        if !batch.is_empty() {
            handled.extend(self.report_batch(batch).await);
        }

        // Phase 3: per-app authorize.
        let mut with_auth = Vec::with_capacity(handled.len());
        for handled_app in handled {
            let auth_response = self
                .blanket_authorize(
                    &handled_app.snapshot.owned_by,
                    &handled_app.snapshot.auth_type,
                    &handled_app.snapshot.auth_value,
                    &handled_app.snapshot.params,
                )
                .await
                .ok();
            with_auth.push((handled_app, auth_response));
        }

        // Phase 4: cache update, applying the four-outcome matrix.
        for (handled_app, auth_response) in with_auth {
            let key = Application::cache_key_for(&handled_app.snapshot.owned_by, &handled_app.snapshot.id);
            if let Some(app) = self.cache.get(&key) {
                app.with_state_mut(|cur| {
                    let next = reconcile(
                        &handled_app.snapshot,
                        cur,
                        &handled_app.deltas,
                        handled_app.reporting_err,
                        auth_response.as_ref(),
                    );
                    *cur = next;
                });
            }
        }
        Ok(())
    }

    /// Send one grouped report call for a same-service batch and pair each
    /// snapshot with the deltas actually transmitted and whether the call
    /// failed.
    async fn report_batch(&self, batch: Vec<ApplicationSnapshot>) -> Vec<HandledApp> {
        if batch.is_empty() {
            return Vec::new();
        }
        let service_id = batch[0].owned_by.clone();
        let auth_type = batch[0].auth_type.clone();
        let auth_value = batch[0].auth_value.clone();

        let mut transactions = Vec::with_capacity(batch.len());
        let mut deltas_per_app = Vec::with_capacity(batch.len());
        for snapshot in &batch {
            let deltas = calculate_deltas_from_state(&snapshot.state);
            transactions.push(Transaction {
                metrics: deltas.clone(),
                params: snapshot.params.clone(),
                timestamp: Some(snapshot.state.timestamp),
            });
            deltas_per_app.push(deltas);
        }

        let request = ReportRequest { service_id, auth_type, auth_value, transactions };
        let result = self.client.report(request).await;
        let outcome = match &result {
            Ok(_) => RemoteOutcome::Success,
            Err(CoreError::RemoteUnavailable { kind, .. }) if kind.is_transient() => RemoteOutcome::Timeout,
            Err(_) => RemoteOutcome::Failure,
        };
        (self.telemetry.on_remote_response)(CacheKind::Backend, outcome);
        let reporting_err = result.is_err();

        batch
            .into_iter()
            .zip(deltas_per_app)
            .map(|(snapshot, deltas)| HandledApp { snapshot, deltas, reporting_err })
            .collect()
    }
}

struct HandledApp {
    snapshot: ApplicationSnapshot,
    deltas: HashMap<String, i64>,
    reporting_err: bool,
}

/// Length in seconds of a granularity's window, for period-elapsed
/// detection. `Week` is left unresolved per the open design question
/// (spec §9) - treated as never rolling over.
fn period_seconds(period: Granularity) -> Option<i64> {
    match period {
        Granularity::Minute => Some(60),
        Granularity::Hour => Some(3_600),
        Granularity::Day => Some(86_400),
        Granularity::Week => None,
        Granularity::Month => Some(30 * 86_400),
        Granularity::Year => Some(365 * 86_400),
        Granularity::Eternity => None,
    }
}

fn elapsed_periods(local_state: &LimitCounter, cur_timestamp: i64, new_timestamp: i64) -> HashSet<String> {
    let mut elapsed = HashSet::new();
    if new_timestamp <= cur_timestamp {
        return elapsed;
    }
    for (metric, usage) in local_state {
        if let Some(lowest) = usage.lowest() {
            if let Some(len) = period_seconds(lowest.period) {
                if cur_timestamp / len != new_timestamp / len {
                    elapsed.insert(metric.clone());
                }
            }
        }
    }
    elapsed
}

/// Keep only unlimited-counter traffic accumulated since `snapshot` was
/// taken: a metric absent from the snapshot is dropped, otherwise the
/// snapshot's value is subtracted and the entry dropped if that leaves less
/// than one unit (spec §4.3 "Prune unlimited counter").
fn prune_unlimited_counter(current: &HashMap<String, i64>, snapshot: &HashMap<String, i64>) -> HashMap<String, i64> {
    let mut pruned = HashMap::new();
    for (metric, &value) in current {
        if let Some(&snap_value) = snapshot.get(metric) {
            let remaining = value - snap_value;
            if remaining >= 1 {
                pruned.insert(metric.clone(), remaining);
            }
        }
    }
    pruned
}

/// Apply the four-outcome reconciliation matrix (spec §4.3 phase 4) to
/// produce the next `ApplicationState` for the live cache entry.
fn reconcile(
    snapshot: &ApplicationSnapshot,
    cur: &ApplicationState,
    delta: &HashMap<String, i64>,
    reporting_err: bool,
    auth_response: Option<&AuthorizeResponse>,
) -> ApplicationState {
    match (reporting_err, auth_response) {
        (true, None) => cur.clone(),
        (false, None) => {
            let mut next = cur.clone();
            for (metric, &d) in delta {
                if let Some(usage) = next.remote_state.get_mut(metric) {
                    if let Some(lowest) = usage.lowest_mut() {
                        lowest.current_value += d;
                    }
                }
            }
            next.unlimited_counter = prune_unlimited_counter(&next.unlimited_counter, &snapshot.state.unlimited_counter);
            next
        }
        (_, Some(response)) => {
            let new_remote = wire::limit_counter_from_wire(&response.usage_reports);
            let new_timestamp = wire::lowest_timestamp(&new_remote);
            let elapsed = elapsed_periods(&cur.local_state, cur.timestamp, new_timestamp);

            let mut next = cur.clone();

            for (metric, local_usage) in next.local_state.iter_mut() {
                let Some(new_lowest) = new_remote.get(metric).and_then(|u| u.lowest()) else {
                    continue;
                };
                let Some(cur_lowest) = local_usage.lowest().map(|r| r.current_value) else {
                    continue;
                };
                let snap_local = snapshot
                    .state
                    .local_state
                    .get(metric)
                    .and_then(|u| u.lowest())
                    .map(|r| r.current_value)
                    .unwrap_or(0);

                let new_current = if elapsed.contains(metric) {
                    new_lowest.current_value + cur_lowest
                } else if reporting_err {
                    let d = delta.get(metric).copied().unwrap_or(0);
                    cur_lowest + new_lowest.current_value - (snap_local - d)
                } else {
                    cur_lowest + new_lowest.current_value - snap_local
                };

                if let Some(report) = local_usage.lowest_mut() {
                    report.current_value = new_current;
                }
            }

            // State sync: metrics newly present in `new_remote`.
            for (metric, new_usage) in &new_remote {
                if !next.local_state.contains_key(metric) {
                    let mut usage = new_usage.clone();
                    if !reporting_err {
                        if let Some(&existing) = next.unlimited_counter.get(metric) {
                            if existing > 0 {
                                if let Some(lowest) = usage.lowest_mut() {
                                    lowest.current_value += existing;
                                }
                                next.unlimited_counter.remove(metric);
                            }
                        }
                    }
                    next.local_state.insert(metric.clone(), usage);
                }
            }

            // State sync: metrics present locally but dropped from Backend.
            let local_metrics: Vec<String> = next.local_state.keys().cloned().collect();
            for metric in local_metrics {
                if new_remote.contains_key(&metric) {
                    continue;
                }
                let current_value =
                    next.local_state.get(&metric).and_then(|u| u.lowest()).map(|r| r.current_value).unwrap_or(0);
                let migrated = if reporting_err {
                    current_value
                } else {
                    let snap_value = snapshot
                        .state
                        .local_state
                        .get(&metric)
                        .and_then(|u| u.lowest())
                        .map(|r| r.current_value)
                        .unwrap_or(0);
                    current_value - snap_value
                };
                *next.unlimited_counter.entry(metric.clone()).or_insert(0) += migrated;
                next.local_state.remove(&metric);
            }

            next.remote_state = new_remote;
            next.timestamp = new_timestamp;

            if !reporting_err {
                next.unlimited_counter = prune_unlimited_counter(&next.unlimited_counter, &snapshot.state.unlimited_counter);
            }
            next
        }
    }
}
