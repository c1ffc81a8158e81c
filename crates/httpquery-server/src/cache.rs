//! Bounded cache of compiled queries keyed by query text.

use dashmap::DashMap;
use httpquery::{CompiledQuery, QueryResult};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Cache counters, reported on `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Compiled queries shared across requests.
///
/// Compilation for a missing key runs under that key's shard lock, so each
/// distinct text compiles at most once while it is cached. Failed
/// compilations are never stored. A slot is reserved before inserting, so
/// concurrent misses never push the cache past `capacity`; once every slot
/// is taken, new texts are compiled but not stored.
pub struct CompiledQueryCache {
    entries: DashMap<String, Arc<CompiledQuery>>,
    capacity: usize,
    /// Slots claimed by stored entries or by inserts in flight.
    reserved: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CompiledQueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            reserved: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get_or_compile<F>(&self, text: &str, compile: F) -> QueryResult<Arc<CompiledQuery>>
    where
        F: FnOnce(&str) -> QueryResult<CompiledQuery>,
    {
        if let Some(hit) = self.entries.get(text) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(len = text.len(), "compiled query cache hit");
            return Ok(Arc::clone(hit.value()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if !self.reserve_slot() {
            return compile(text).map(Arc::new);
        }

        let mut inserted = false;
        let outcome = self
            .entries
            .entry(text.to_string())
            .or_try_insert_with(|| {
                inserted = true;
                compile(text).map(Arc::new)
            })
            .map(|entry| Arc::clone(entry.value()));

        // Keep the slot only if this call stored a new entry.
        if !(inserted && outcome.is_ok()) {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
        }
        outcome
    }

    fn reserve_slot(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: true,
            entries: self.entries.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
