//! Bounded caches for tree nodes and driver handles

use crate::driver::Driver;
use crate::error::Result;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Capacity-bounded map evicting the least recently used entry
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    // Front is least recently used
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    /// A capacity of zero is treated as one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity.min(64)),
            order: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry and mark it most recently used
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if self.entries.contains_key(key) {
            self.touch(key);
        }
        self.entries.get(key)
    }

    /// Look up an entry without changing recency
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.get(key)
    }

    /// Check for an entry without changing recency
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Insert or replace an entry; returns the entry evicted to make room
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.contains_key(&key) {
            self.touch(&key);
            self.entries.insert(key, value);
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.order
                .pop_front()
                .and_then(|old| self.entries.remove(&old).map(|v| (old, v)))
        } else {
            None
        };

        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        evicted
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let value = self.entries.remove(key)?;
        if let Some(pos) = self.order.iter().position(|k| Borrow::<Q>::borrow(k) == key) {
            self.order.remove(pos);
        }
        Some(value)
    }

    /// Remove every entry whose key matches the predicate
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let before = self.entries.len();
        self.order.retain(|k| !predicate(k));
        let kept: std::collections::HashSet<&K> = self.order.iter().collect();
        self.entries.retain(|k, _| kept.contains(k));
        before - self.entries.len()
    }

    /// Keys from least to most recently used
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    fn touch<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if let Some(pos) = self.order.iter().position(|k| Borrow::<Q>::borrow(k) == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }
}

/// Handles that finished creation, plus creations still in flight
struct SlotTable<V> {
    ready: BoundedCache<String, V>,
    pending: HashMap<String, Arc<OnceCell<V>>>,
}

/// One bounded map of lazily created handles
///
/// A creation in flight is tracked by a once-cell outside the bounded map, so
/// concurrent first access to the same key runs the creation future once and
/// every caller gets the same handle. Only created handles take a capacity
/// slot; a failed creation leaves nothing behind.
struct HandleSlots<V> {
    kind: &'static str,
    slots: Mutex<SlotTable<V>>,
}

impl<V: Clone> HandleSlots<V> {
    fn new(kind: &'static str, capacity: usize) -> Self {
        Self {
            kind,
            slots: Mutex::new(SlotTable {
                ready: BoundedCache::new(capacity),
                pending: HashMap::new(),
            }),
        }
    }

    async fn get_or_create<F, Fut>(&self, identifier: &str, create: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let cell = {
            let mut slots = self.slots.lock();
            if let Some(handle) = slots.ready.get(identifier) {
                debug!("Reusing cached {} handle: {}", self.kind, identifier);
                return Ok(handle.clone());
            }
            slots
                .pending
                .entry(identifier.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell.get_or_try_init(create).await.cloned();

        let mut slots = self.slots.lock();
        let owned = slots
            .pending
            .get(identifier)
            .is_some_and(|current| Arc::ptr_eq(current, &cell));
        if !owned {
            // invalidated while in flight, or already published by another caller
            return result;
        }

        match &result {
            Ok(handle) => {
                slots.pending.remove(identifier);
                let evicted = slots.ready.insert(identifier.to_string(), handle.clone());
                if let Some((evicted, _)) = evicted {
                    debug!("Evicted cached {} handle: {}", self.kind, evicted);
                }
            }
            // Callers still waiting on the cell retry creation themselves
            Err(_) if Arc::strong_count(&cell) == 2 => {
                slots.pending.remove(identifier);
            }
            Err(_) => {}
        }
        result
    }

    fn is_ready(&self, identifier: &str) -> bool {
        self.slots.lock().ready.peek(identifier).is_some()
    }

    fn invalidate_tree(&self, identifier: &str) -> usize {
        let prefix = format!("{}.", identifier);
        let in_tree = |key: &String| key == identifier || key.starts_with(&prefix);

        let mut slots = self.slots.lock();
        slots.pending.retain(|key, _| !in_tree(key));
        slots.ready.remove_where(in_tree)
    }

    fn len(&self) -> usize {
        self.slots.lock().ready.len()
    }
}

/// Memoized driver handles keyed by node identifier
///
/// Servers, databases and collections are held in independent bounded
/// caches. Entries never expire; once evicted, the next access recreates
/// the handle.
pub struct ConnectionCache<D: Driver> {
    servers: HandleSlots<D::Server>,
    databases: HandleSlots<D::Database>,
    collections: HandleSlots<D::Collection>,
}

impl<D: Driver> ConnectionCache<D> {
    pub fn new(
        server_capacity: usize,
        database_capacity: usize,
        collection_capacity: usize,
    ) -> Self {
        Self {
            servers: HandleSlots::new("server", server_capacity),
            databases: HandleSlots::new("database", database_capacity),
            collections: HandleSlots::new("collection", collection_capacity),
        }
    }

    pub async fn server<F, Fut>(&self, identifier: &str, create: F) -> Result<D::Server>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<D::Server>>,
    {
        self.servers.get_or_create(identifier, create).await
    }

    pub async fn database<F, Fut>(&self, identifier: &str, create: F) -> Result<D::Database>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<D::Database>>,
    {
        self.databases.get_or_create(identifier, create).await
    }

    pub async fn collection<F, Fut>(&self, identifier: &str, create: F) -> Result<D::Collection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<D::Collection>>,
    {
        self.collections.get_or_create(identifier, create).await
    }

    /// Whether a handle for this identifier is cached and ready
    pub fn is_cached(&self, identifier: &str) -> bool {
        self.servers.is_ready(identifier)
            || self.databases.is_ready(identifier)
            || self.collections.is_ready(identifier)
    }

    /// Drop the handles of a node and of everything below it
    pub fn invalidate(&self, identifier: &str) -> usize {
        let dropped = self.servers.invalidate_tree(identifier)
            + self.databases.invalidate_tree(identifier)
            + self.collections.invalidate_tree(identifier);
        if dropped > 0 {
            debug!("Invalidated {} cached handles under {}", dropped, identifier);
        }
        dropped
    }

    /// Number of cached (server, database, collection) entries
    pub fn len(&self) -> (usize, usize, usize) {
        (
            self.servers.len(),
            self.databases.len(),
            self.collections.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_cache_evicts_least_recently_used() {
        let mut cache = BoundedCache::new(2);
        assert!(cache.insert("a".to_string(), 1).is_none());
        assert!(cache.insert("b".to_string(), 2).is_none());

        // touching "a" makes "b" the eviction candidate
        assert_eq!(cache.get("a"), Some(&1));
        let evicted = cache.insert("c".to_string(), 3);
        assert_eq!(evicted, Some(("b".to_string(), 2)));

        assert!(cache.contains_key("a"));
        assert!(cache.contains_key("c"));
        assert_eq!(cache.len(), 2);
        let keys: Vec<&String> = cache.keys().collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn test_bounded_cache_replace_does_not_evict() {
        let mut cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert!(cache.insert("a", 10).is_none());
        assert_eq!(cache.get(&"a"), Some(&10));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_bounded_cache_zero_capacity() {
        let mut cache = BoundedCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(1, "one");
        assert_eq!(cache.insert(2, "two"), Some((1, "one")));
    }

    #[test]
    fn test_bounded_cache_remove_where() {
        let mut cache = BoundedCache::new(8);
        for key in ["p", "p.shop", "p.shop.orders", "q.shop"] {
            cache.insert(key.to_string(), ());
        }
        let removed = cache.remove_where(|k| k == "p" || k.starts_with("p."));
        assert_eq!(removed, 3);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key("q.shop"));
        assert_eq!(cache.remove("q.shop"), Some(()));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_handle_slots_create_once() {
        let slots: HandleSlots<u32> = HandleSlots::new("server", 2);
        let first = slots.get_or_create("a", || async { Ok(1) }).await.unwrap();
        let second = slots.get_or_create("a", || async { Ok(2) }).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert!(slots.is_ready("a"));
    }

    #[tokio::test]
    async fn test_handle_slots_retry_after_failure() {
        let slots: HandleSlots<u32> = HandleSlots::new("server", 2);
        let failed = slots
            .get_or_create("a", || async {
                Err(crate::error::TapError::credentials_not_found("a"))
            })
            .await;
        assert!(failed.is_err());
        assert!(!slots.is_ready("a"));

        let value = slots.get_or_create("a", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_failed_creation_takes_no_slot() {
        let slots: HandleSlots<u32> = HandleSlots::new("server", 2);
        slots.get_or_create("a", || async { Ok(1) }).await.unwrap();
        slots.get_or_create("b", || async { Ok(2) }).await.unwrap();

        let failed = slots
            .get_or_create("c", || async {
                Err(crate::error::TapError::credentials_not_found("c"))
            })
            .await;
        assert!(failed.is_err());
        assert!(slots.is_ready("a"));
        assert!(slots.is_ready("b"));
        assert_eq!(slots.len(), 2);
        assert!(slots.slots.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_readiness_check_keeps_recency() {
        let slots: HandleSlots<u32> = HandleSlots::new("server", 2);
        slots.get_or_create("a", || async { Ok(1) }).await.unwrap();
        slots.get_or_create("b", || async { Ok(2) }).await.unwrap();

        // "a" stays least recently used
        assert!(slots.is_ready("a"));
        slots.get_or_create("c", || async { Ok(3) }).await.unwrap();
        assert!(!slots.is_ready("a"));
        assert!(slots.is_ready("b"));
        assert!(slots.is_ready("c"));
    }

    #[test]
    fn test_bounded_cache_peek_keeps_recency() {
        let mut cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.peek(&"a"), Some(&1));
        assert_eq!(cache.insert("c", 3), Some(("a", 1)));
    }

    #[tokio::test]
    async fn test_handle_slots_invalidate_tree() {
        let slots: HandleSlots<u32> = HandleSlots::new("collection", 8);
        for id in ["p.shop", "p.shop.orders", "p.shopping.orders"] {
            slots.get_or_create(id, || async { Ok(0) }).await.unwrap();
        }
        assert_eq!(slots.invalidate_tree("p.shop"), 2);
        assert!(slots.is_ready("p.shopping.orders"));
        assert_eq!(slots.len(), 1);
    }
}
