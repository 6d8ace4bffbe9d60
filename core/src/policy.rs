// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use crate::model::ProxyRule;

/// Translate an HTTP method/path into a metrics map by walking `rules` in
/// ascending `position` order (spec §6 Inbound). The first match wins for a
/// given rule's metric; iteration continues past a match unless that rule's
/// `last` flag is set, in which case it stops immediately.
///
/// An empty return means *no-matching-rule*; the caller externalizes that
/// as not-found.
pub fn match_metrics(rules: &[ProxyRule], method: &str, path: &str) -> HashMap<String, i64> {
    let mut metrics = HashMap::new();
    for rule in rules {
        if rule.http_method.eq_ignore_ascii_case(method) && path_matches(&rule.path_pattern, path) {
            *metrics.entry(rule.metric_name.clone()).or_insert(0) += rule.delta;
            if rule.last {
                break;
            }
        }
    }
    metrics
}

/// `pattern` may contain `{name}` placeholders that match one path segment.
/// An exact literal match is required for every other segment.
fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if pattern_segments.len() != path_segments.len() {
        return false;
    }
    pattern_segments.iter().zip(path_segments.iter()).all(|(p, s)| {
        (p.starts_with('{') && p.ends_with('}')) || p == s
    })
}
