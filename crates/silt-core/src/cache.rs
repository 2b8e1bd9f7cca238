//! LRU-bounded read cache
//!
//! Decoded values keyed by string, with recency tracked by the `lru`
//! crate's hash-plus-linked-list (O(1) touch, insert, evict). Eviction is a
//! cache-local event — the index never changes because a value fell out of
//! memory. The engine handles the one delicate case itself: a dirty value
//! must be written to the data log before its cache slot is surrendered.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::value::Value;

pub struct ReadCache {
    lru: LruCache<String, Value>,
    cap: Option<NonZeroUsize>,
}

impl ReadCache {
    /// `cap = None` means unbounded.
    pub fn new(cap: Option<NonZeroUsize>) -> Self {
        let lru = match cap {
            Some(n) => LruCache::new(n),
            None => LruCache::unbounded(),
        };
        Self { lru, cap }
    }

    /// Look up and mark most-recently-used.
    pub fn get(&mut self, key: &str) -> Option<&Value> {
        self.lru.get(key)
    }

    /// Look up without touching recency (flush paths).
    pub fn peek(&self, key: &str) -> Option<&Value> {
        self.lru.peek(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lru.contains(key)
    }

    /// Insert or update, marking most-recently-used. The caller must have
    /// made room first; this never evicts an unrelated entry silently.
    pub fn insert(&mut self, key: String, value: Value) {
        self.lru.put(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.lru.pop(key)
    }

    /// True when inserting a new key would exceed the cap.
    pub fn at_capacity(&self) -> bool {
        match self.cap {
            Some(cap) => self.lru.len() >= cap.get(),
            None => false,
        }
    }

    /// Remove and return the least-recently-used entry.
    pub fn pop_lru(&mut self) -> Option<(String, Value)> {
        self.lru.pop_lru()
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    pub fn clear(&mut self) {
        self.lru.clear();
    }
}
