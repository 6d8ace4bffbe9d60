// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::application::{Application, ApplicationSnapshot};

/// Concurrent keyed map of application states (spec §4.2). Does not take
/// locks on applications themselves - that is the caller's duty once a
/// handle is obtained.
#[derive(Default)]
pub struct BackendCache {
    entries: RwLock<HashMap<String, Arc<Application>>>,
}

impl BackendCache {
    pub fn new() -> Self {
        BackendCache::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Application>> {
        self.entries.read().get(key).cloned()
    }

    pub fn set(&self, key: String, app: Arc<Application>) {
        self.entries.write().insert(key, app);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// A bounded FIFO double-ended queue of application snapshots used by the
/// flush pipeline (spec §4.2). `append`/`prepend` return `false` without
/// mutating the queue when it is at capacity - flushing must hold snapshots
/// in that case rather than drop live state.
pub struct FlushQueue {
    capacity: usize,
    items: RwLock<VecDeque<ApplicationSnapshot>>,
}

impl FlushQueue {
    pub fn new(capacity: usize) -> Self {
        FlushQueue {
            capacity,
            items: RwLock::new(VecDeque::new()),
        }
    }

    pub fn append(&self, snapshot: ApplicationSnapshot) -> bool {
        let mut items = self.items.write();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(snapshot);
        true
    }

    /// Push an item back onto the head of the queue. Used when the flush
    /// pipeline peeks a snapshot that starts a new service batch and needs
    /// to put it back until the current batch is reported.
    pub fn prepend(&self, snapshot: ApplicationSnapshot) -> bool {
        let mut items = self.items.write();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_front(snapshot);
        true
    }

    pub fn shift(&self) -> Option<ApplicationSnapshot> {
        self.items.write().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Hierarchy, LimitCounter};
    use std::collections::HashMap;

    fn app(service_id: &str, application_id: &str) -> Arc<Application> {
        Arc::new(Application::new(
            service_id.to_owned(),
            application_id.to_owned(),
            "user_key".to_owned(),
            "key-123".to_owned(),
            HashMap::new(),
            Hierarchy::default(),
            LimitCounter::default(),
            LimitCounter::default(),
            0,
        ))
    }

    fn snapshot(owned_by: &str, id: &str) -> ApplicationSnapshot {
        app(owned_by, id).deep_copy()
    }

    #[test]
    fn cache_get_set_roundtrip() {
        let cache = BackendCache::new();
        let key = "svc_app".to_owned();
        cache.set(key.clone(), app("svc", "app"));
        assert!(cache.get(&key).is_some());
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.keys(), vec![key]);
    }

    #[test]
    fn flush_queue_is_fifo() {
        let queue = FlushQueue::new(10);
        assert!(queue.append(snapshot("svc-a", "1")));
        assert!(queue.append(snapshot("svc-b", "2")));
        let first = queue.shift().unwrap();
        assert_eq!(first.owned_by, "svc-a");
        let second = queue.shift().unwrap();
        assert_eq!(second.owned_by, "svc-b");
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_queue_rejects_append_past_capacity() {
        let queue = FlushQueue::new(1);
        assert!(queue.append(snapshot("svc-a", "1")));
        assert!(!queue.append(snapshot("svc-b", "2")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn flush_queue_prepend_puts_item_at_head() {
        let queue = FlushQueue::new(10);
        queue.append(snapshot("svc-a", "1"));
        queue.prepend(snapshot("svc-b", "2"));
        let first = queue.shift().unwrap();
        assert_eq!(first.owned_by, "svc-b");
    }
}
