// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Conversions between the on-the-wire Backend/System protobuf types and
//! the core's own data model (`crate::model`). Kept separate from
//! `crate::model` so that module stays free of any `protos` dependency.

use std::collections::HashMap;

use protos::backend::v1::{ChildMetrics, Granularity as WireGranularity, UsageReport as WireUsageReport};
use protos::system::v1::{AuthPattern as WireAuthPattern, ProxyConfig as WireProxyConfig, ProxyRule as WireProxyRule};

use crate::model::{AuthPattern, Granularity, Hierarchy, LimitCounter, MetricUsage, ProxyConfig, ProxyRule, UsageReport};

pub fn granularity_from_wire(value: i32) -> Option<Granularity> {
    match WireGranularity::from_i32(value) {
        Some(WireGranularity::Minute) => Some(Granularity::Minute),
        Some(WireGranularity::Hour) => Some(Granularity::Hour),
        Some(WireGranularity::Day) => Some(Granularity::Day),
        Some(WireGranularity::Week) => Some(Granularity::Week),
        Some(WireGranularity::Month) => Some(Granularity::Month),
        Some(WireGranularity::Year) => Some(Granularity::Year),
        Some(WireGranularity::Eternity) => Some(Granularity::Eternity),
        _ => None,
    }
}

pub fn granularity_to_wire(period: Granularity) -> WireGranularity {
    match period {
        Granularity::Minute => WireGranularity::Minute,
        Granularity::Hour => WireGranularity::Hour,
        Granularity::Day => WireGranularity::Day,
        Granularity::Week => WireGranularity::Week,
        Granularity::Month => WireGranularity::Month,
        Granularity::Year => WireGranularity::Year,
        Granularity::Eternity => WireGranularity::Eternity,
    }
}

/// Build a `LimitCounter` from a flat list of wire usage reports, grouping
/// by metric name. Reports carrying an unrecognized granularity value are
/// skipped rather than rejecting the whole response.
pub fn limit_counter_from_wire(reports: &[WireUsageReport]) -> LimitCounter {
    let mut counter = LimitCounter::new();
    for report in reports {
        let Some(period) = granularity_from_wire(report.period) else {
            continue;
        };
        let usage = UsageReport {
            period,
            period_start: report.period_start,
            period_end: report.period_end,
            current_value: report.current_value,
            max_value: report.max_value,
        };
        counter.entry(report.metric.clone()).or_insert_with(|| MetricUsage::new(Vec::new())).insert(usage);
    }
    counter
}

pub fn limit_counter_to_wire(counter: &LimitCounter) -> Vec<WireUsageReport> {
    let mut reports = Vec::new();
    for (metric, usage) in counter {
        for report in usage.reports() {
            reports.push(WireUsageReport {
                metric: metric.clone(),
                period: granularity_to_wire(report.period) as i32,
                period_start: report.period_start,
                period_end: report.period_end,
                current_value: report.current_value,
                max_value: report.max_value,
            });
        }
    }
    reports
}

/// The epoch-seconds start of the lowest-granularity window across every
/// metric in a counter, used to seed `Application::timestamp` on cache
/// fill. `0` when the counter carries no usage reports at all.
pub fn lowest_timestamp(counter: &LimitCounter) -> i64 {
    counter.values().filter_map(|usage| usage.lowest()).map(|report| report.period_start).min().unwrap_or(0)
}

pub fn hierarchy_from_wire(map: &HashMap<String, ChildMetrics>) -> Hierarchy {
    map.iter().map(|(parent, children)| (parent.clone(), children.children.clone())).collect()
}

pub fn hierarchy_to_wire(hierarchy: &Hierarchy) -> HashMap<String, ChildMetrics> {
    hierarchy
        .iter()
        .map(|(parent, children)| {
            (
                parent.clone(),
                ChildMetrics { children: children.clone() },
            )
        })
        .collect()
}

fn auth_pattern_from_wire(value: i32) -> Option<AuthPattern> {
    match WireAuthPattern::from_i32(value) {
        Some(WireAuthPattern::ApiKey) => Some(AuthPattern::ApiKey),
        Some(WireAuthPattern::AppIdKey) => Some(AuthPattern::AppIdKey),
        Some(WireAuthPattern::Openid) => Some(AuthPattern::OpenId),
        _ => None,
    }
}

fn auth_pattern_to_wire(pattern: AuthPattern) -> WireAuthPattern {
    match pattern {
        AuthPattern::ApiKey => WireAuthPattern::ApiKey,
        AuthPattern::AppIdKey => WireAuthPattern::AppIdKey,
        AuthPattern::OpenId => WireAuthPattern::Openid,
    }
}

fn proxy_rule_from_wire(rule: &WireProxyRule) -> ProxyRule {
    ProxyRule {
        http_method: rule.http_method.clone(),
        path_pattern: rule.path_pattern.clone(),
        metric_name: rule.metric_name.clone(),
        delta: rule.delta,
        position: rule.position,
        last: rule.last,
    }
}

fn proxy_rule_to_wire(rule: &ProxyRule) -> WireProxyRule {
    WireProxyRule {
        http_method: rule.http_method.clone(),
        path_pattern: rule.path_pattern.clone(),
        metric_name: rule.metric_name.clone(),
        delta: rule.delta,
        position: rule.position,
        last: rule.last,
    }
}

/// Convert a fetched System document into the core model. Returns `None`
/// when `auth_pattern` carries an unrecognized/unspecified value - the
/// document is unusable rather than silently defaulted.
pub fn proxy_config_from_wire(wire: &WireProxyConfig) -> Option<ProxyConfig> {
    let auth_pattern = auth_pattern_from_wire(wire.auth_pattern)?;
    let rules = wire.rules.iter().map(proxy_rule_from_wire).collect();
    let hierarchy = wire.hierarchy.iter().map(|(parent, children)| (parent.clone(), children.children.clone())).collect();
    Some(ProxyConfig::new(
        wire.backend_endpoint.clone(),
        auth_pattern,
        wire.backend_auth_type.clone(),
        wire.backend_auth_value.clone(),
        rules,
        hierarchy,
        wire.openid_client_id_claim.clone(),
    ))
}

pub fn proxy_config_to_wire(config: &ProxyConfig) -> WireProxyConfig {
    WireProxyConfig {
        backend_endpoint: config.backend_endpoint.clone(),
        auth_pattern: auth_pattern_to_wire(config.auth_pattern) as i32,
        backend_auth_type: config.backend_auth_type.clone(),
        backend_auth_value: config.backend_auth_value.clone(),
        rules: config.rules.iter().map(proxy_rule_to_wire).collect(),
        hierarchy: config
            .hierarchy
            .iter()
            .map(|(parent, children)| {
                (parent.clone(), protos::system::v1::ChildMetrics { children: children.clone() })
            })
            .collect(),
        openid_client_id_claim: config.openid_client_id_claim.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_limit_counter_through_wire() {
        let mut counter = LimitCounter::new();
        counter.insert(
            "hits".to_owned(),
            MetricUsage::new(vec![UsageReport {
                period: Granularity::Minute,
                period_start: 0,
                period_end: 60,
                current_value: 3,
                max_value: 4,
            }]),
        );
        let wire = limit_counter_to_wire(&counter);
        let roundtripped = limit_counter_from_wire(&wire);
        assert_eq!(roundtripped, counter);
    }

    #[test]
    fn unrecognized_granularity_is_skipped() {
        let reports = vec![WireUsageReport {
            metric: "hits".to_owned(),
            period: 99,
            period_start: 0,
            period_end: 1,
            current_value: 1,
            max_value: 1,
        }];
        let counter = limit_counter_from_wire(&reports);
        assert!(counter.is_empty());
    }

    #[test]
    fn hierarchy_roundtrips_through_wire() {
        let mut hierarchy = Hierarchy::new();
        hierarchy.insert("hits".to_owned(), vec!["hits_child".to_owned()]);
        let wire = hierarchy_to_wire(&hierarchy);
        let roundtripped = hierarchy_from_wire(&wire);
        assert_eq!(roundtripped, hierarchy);
    }

    #[test]
    fn proxy_config_roundtrips_through_wire() {
        let config = ProxyConfig::new(
            "backend:3000".to_owned(),
            AuthPattern::AppIdKey,
            "user_key".to_owned(),
            "secret".to_owned(),
            vec![ProxyRule {
                http_method: "GET".to_owned(),
                path_pattern: "/widgets/{id}".to_owned(),
                metric_name: "hits".to_owned(),
                delta: 1,
                position: 1,
                last: true,
            }],
            Hierarchy::default(),
            Some("client_id".to_owned()),
        );
        let wire = proxy_config_to_wire(&config);
        let roundtripped = proxy_config_from_wire(&wire).unwrap();
        assert_eq!(roundtripped.backend_endpoint, config.backend_endpoint);
        assert_eq!(roundtripped.rules, config.rules);
        assert_eq!(roundtripped.openid_client_id_claim, config.openid_client_id_claim);
    }

    #[test]
    fn proxy_config_from_wire_rejects_unspecified_auth_pattern() {
        let wire = WireProxyConfig {
            backend_endpoint: "backend:3000".to_owned(),
            auth_pattern: 0,
            backend_auth_type: String::new(),
            backend_auth_value: String::new(),
            rules: Vec::new(),
            hierarchy: HashMap::new(),
            openid_client_id_claim: None,
        };
        assert!(proxy_config_from_wire(&wire).is_none());
    }
}
