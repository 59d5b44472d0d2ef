use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use tokio::sync::mpsc;

use super::{Query, Snapshot, Subscription};

/// One live subscription: the query it watches and where its snapshots go.
#[derive(Debug, Clone)]
pub struct Listener {
    pub id: u64,
    pub query: Query,
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl Listener {
    /// False once the subscriber is gone.
    pub fn deliver(&self, snapshot: Snapshot) -> bool {
        self.tx.send(snapshot).is_ok()
    }
}

// Map subscription id -> listener. The lock is a plain mutex because
// cancellation runs from `Drop`.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<HashMap<u64, Listener>>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `query`; the returned subscription unregisters itself when cancelled.
    pub fn register(&self, query: Query) -> (Listener, Subscription) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener { id, query, tx };
        let total = {
            let mut map = self.lock();
            map.insert(id, listener.clone());
            map.len()
        };
        debug!(
            "[REGISTRY] Registered subscription {} on {} (total={})",
            id, listener.query.collection, total
        );
        let registry = self.clone();
        let subscription = Subscription::new(rx, move || {
            registry.unregister(id);
        });
        (listener, subscription)
    }

    pub fn unregister(&self, id: u64) -> bool {
        let mut map = self.lock();
        let removed = map.remove(&id).is_some();
        if removed {
            debug!("[REGISTRY] Unregistered subscription {} (remaining={})", id, map.len());
        }
        removed
    }

    /// Listeners whose query reads one of `collections`.
    pub fn listeners_for<'a>(&self, collections: impl IntoIterator<Item = &'a str>) -> Vec<Listener> {
        let wanted: Vec<&str> = collections.into_iter().collect();
        let map = self.lock();
        let mut out: Vec<Listener> = map
            .values()
            .filter(|l| wanted.contains(&l.query.collection.as_str()))
            .cloned()
            .collect();
        out.sort_by_key(|l| l.id);
        out
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Listener>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_unregisters() {
        let registry = SubscriptionRegistry::new();
        let (_, sub_a) = registry.register(Query::collection("friends"));
        let (_, _sub_b) = registry.register(Query::collection("users"));
        assert_eq!(registry.count(), 2);
        drop(sub_a);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_listeners_for_matches_collection() {
        let registry = SubscriptionRegistry::new();
        let (a, _sa) = registry.register(Query::collection("friends"));
        let (_, _sb) = registry.register(Query::collection("users"));
        let (c, _sc) = registry.register(Query::collection("friends").where_eq("userId", "u1"));
        let ids: Vec<u64> = registry.listeners_for(["friends"]).iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn test_deliver_after_cancel_fails() {
        let registry = SubscriptionRegistry::new();
        let (listener, mut sub) = registry.register(Query::collection("users"));
        assert!(listener.deliver(Snapshot::default()));
        assert!(sub.next_snapshot().await.is_some());
        sub.cancel();
        assert!(!listener.deliver(Snapshot::default()));
        assert_eq!(registry.count(), 0);
    }
}
