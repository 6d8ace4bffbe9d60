// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A rate-limit window, ordered from smallest to largest.
///
/// `Ord` reflects the ascending order the spec requires `UsageReport` lists
/// to be kept in: `Minute < Hour < Day < Week < Month < Year < Eternity`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
    Eternity,
}

impl Granularity {
    fn rank(self) -> u8 {
        match self {
            Granularity::Minute => 0,
            Granularity::Hour => 1,
            Granularity::Day => 2,
            Granularity::Week => 3,
            Granularity::Month => 4,
            Granularity::Year => 5,
            Granularity::Eternity => 6,
        }
    }
}

impl Ord for Granularity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Granularity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Usage for one metric at one granularity, as carried in a `UsageReport`
/// from Backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageReport {
    pub period: Granularity,
    pub period_start: i64,
    pub period_end: i64,
    pub current_value: i64,
    pub max_value: i64,
}

/// A metric's usage reports, kept sorted ascending by granularity.
///
/// The sortedness invariant (spec §3) is enforced at construction time by
/// `MetricUsage::new`/`push`, rather than re-validated on every read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetricUsage(Vec<UsageReport>);

impl MetricUsage {
    pub fn new(mut reports: Vec<UsageReport>) -> Self {
        reports.sort_by_key(|r| r.period);
        MetricUsage(reports)
    }

    pub fn reports(&self) -> &[UsageReport] {
        &self.0
    }

    pub fn reports_mut(&mut self) -> &mut [UsageReport] {
        &mut self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The lowest-granularity usage report, if any. Used wherever the spec
    /// refers to "the lowest granularity" for rollover detection and delta
    /// computation.
    pub fn lowest(&self) -> Option<&UsageReport> {
        self.0.first()
    }

    pub fn lowest_mut(&mut self) -> Option<&mut UsageReport> {
        self.0.first_mut()
    }

    pub fn get(&self, period: Granularity) -> Option<&UsageReport> {
        self.0.iter().find(|r| r.period == period)
    }

    pub fn get_mut(&mut self, period: Granularity) -> Option<&mut UsageReport> {
        self.0.iter_mut().find(|r| r.period == period)
    }

    pub fn insert(&mut self, report: UsageReport) {
        match self.0.iter().position(|r| r.period == report.period) {
            Some(idx) => self.0[idx] = report,
            None => {
                self.0.push(report);
                self.0.sort_by_key(|r| r.period);
            }
        }
    }

    pub fn remove(&mut self, period: Granularity) -> Option<UsageReport> {
        let idx = self.0.iter().position(|r| r.period == period)?;
        Some(self.0.remove(idx))
    }
}

/// A mapping of metric name to its usage across granularities.
pub type LimitCounter = HashMap<String, MetricUsage>;

/// Non-negative counters for metrics with no rate limit attached.
pub type UnlimitedCounter = HashMap<String, i64>;

/// Parent metric -> child metric names, one level deep (spec §4.1
/// "Hierarchy propagation ordering": no transitive closure required).
pub type Hierarchy = HashMap<String, Vec<String>>;

/// The identifier-source pattern a service's ProxyConfig selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum AuthPattern {
    ApiKey,
    AppIdKey,
    OpenId,
}

/// `(method, path-pattern, metric, delta, position, last)` - matched in
/// position order to translate requests into metrics (spec §3, §6).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyRule {
    pub http_method: String,
    pub path_pattern: String,
    pub metric_name: String,
    pub delta: i64,
    pub position: u32,
    pub last: bool,
}

/// The fetched System configuration that drives authorization (spec §3).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub backend_endpoint: String,
    pub auth_pattern: AuthPattern,
    pub backend_auth_type: String,
    pub backend_auth_value: String,
    /// Kept in ascending `position` order; `rule_order` guarantees this on
    /// construction so matching never needs to re-sort.
    pub rules: Vec<ProxyRule>,
    pub hierarchy: Hierarchy,
    /// OpenID claim carrying the client identifier. Defaults to `"azp"`.
    pub openid_client_id_claim: Option<String>,
}

impl ProxyConfig {
    pub fn new(
        backend_endpoint: String,
        auth_pattern: AuthPattern,
        backend_auth_type: String,
        backend_auth_value: String,
        mut rules: Vec<ProxyRule>,
        hierarchy: Hierarchy,
        openid_client_id_claim: Option<String>,
    ) -> Self {
        rules.sort_by_key(|r| r.position);
        ProxyConfig {
            backend_endpoint,
            auth_pattern,
            backend_auth_type,
            backend_auth_value,
            rules,
            hierarchy,
            openid_client_id_claim,
        }
    }

    pub fn openid_claim(&self) -> &str {
        self.openid_client_id_claim.as_deref().unwrap_or("azp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_usage_stays_sorted_on_construction() {
        let usage = MetricUsage::new(vec![
            UsageReport {
                period: Granularity::Hour,
                period_start: 0,
                period_end: 3600,
                current_value: 1,
                max_value: 10,
            },
            UsageReport {
                period: Granularity::Minute,
                period_start: 0,
                period_end: 60,
                current_value: 1,
                max_value: 10,
            },
        ]);
        let periods: Vec<_> = usage.reports().iter().map(|r| r.period).collect();
        assert_eq!(periods, vec![Granularity::Minute, Granularity::Hour]);
    }

    #[test]
    fn metric_usage_insert_keeps_sorted() {
        let mut usage = MetricUsage::default();
        usage.insert(UsageReport {
            period: Granularity::Day,
            period_start: 0,
            period_end: 1,
            current_value: 0,
            max_value: 1,
        });
        usage.insert(UsageReport {
            period: Granularity::Minute,
            period_start: 0,
            period_end: 1,
            current_value: 0,
            max_value: 1,
        });
        let periods: Vec<_> = usage.reports().iter().map(|r| r.period).collect();
        assert_eq!(periods, vec![Granularity::Minute, Granularity::Day]);
    }

    #[test]
    fn granularity_ordering() {
        assert!(Granularity::Minute < Granularity::Hour);
        assert!(Granularity::Hour < Granularity::Day);
        assert!(Granularity::Day < Granularity::Week);
        assert!(Granularity::Week < Granularity::Month);
        assert!(Granularity::Month < Granularity::Year);
        assert!(Granularity::Year < Granularity::Eternity);
    }

    #[test]
    fn proxy_config_sorts_rules_by_position() {
        let config = ProxyConfig::new(
            "backend:3000".to_owned(),
            AuthPattern::ApiKey,
            "user_key".to_owned(),
            "".to_owned(),
            vec![
                ProxyRule {
                    http_method: "GET".to_owned(),
                    path_pattern: "/b".to_owned(),
                    metric_name: "b".to_owned(),
                    delta: 1,
                    position: 2,
                    last: true,
                },
                ProxyRule {
                    http_method: "GET".to_owned(),
                    path_pattern: "/a".to_owned(),
                    metric_name: "a".to_owned(),
                    delta: 1,
                    position: 1,
                    last: false,
                },
            ],
            Hierarchy::default(),
            None,
        );
        assert_eq!(config.rules[0].metric_name, "a");
        assert_eq!(config.rules[1].metric_name, "b");
    }

    #[test]
    fn openid_claim_defaults_to_azp() {
        let config = ProxyConfig::new(
            "backend:3000".to_owned(),
            AuthPattern::OpenId,
            "".to_owned(),
            "".to_owned(),
            Vec::new(),
            Hierarchy::default(),
            None,
        );
        assert_eq!(config.openid_claim(), "azp");
    }
}
