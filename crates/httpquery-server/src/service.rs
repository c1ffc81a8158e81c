//! Query service — compile, execute and compose for one request.

use crate::cache::{CacheStats, CompiledQueryCache};
use crate::config::ServerConfig;
use httpquery::{
    compile, execute, CompiledQuery, Dataset, Query, QueryResult, ResponseEnvelope, Value,
    DEFAULT_PARAMETER,
};
use std::sync::Arc;
use std::time::Instant;

/// Shared by every surface. Holds no per-request state.
pub struct QueryService {
    dataset_size: usize,
    max_dataset_size: usize,
    diagnostics: bool,
    cache: Option<CompiledQueryCache>,
}

impl QueryService {
    pub fn new(config: &ServerConfig) -> Self {
        let cache = (config.cache_capacity > 0)
            .then(|| CompiledQueryCache::new(config.cache_capacity));
        Self {
            dataset_size: config.dataset_size,
            max_dataset_size: config.max_dataset_size,
            diagnostics: config.diagnostics,
            cache,
        }
    }

    pub fn dataset_size(&self) -> usize {
        self.dataset_size
    }

    pub fn max_dataset_size(&self) -> usize {
        self.max_dataset_size
    }

    pub fn compile(&self, text: &str) -> QueryResult<Arc<CompiledQuery>> {
        let compile_text = |text: &str| compile(DEFAULT_PARAMETER, text);
        match &self.cache {
            Some(cache) => cache.get_or_compile(text, compile_text),
            None => compile_text(text).map(Arc::new),
        }
    }

    /// Evaluate `query` over a fresh dataset of `size` records.
    pub fn evaluate(&self, query: &Query, size: usize) -> QueryResult<Value> {
        let started = Instant::now();
        let compiled = self.compile(query.as_str())?;
        let compiled_at = started.elapsed();

        let dataset = Dataset::generate(size);
        let value = execute(&compiled, dataset.people())?;

        tracing::debug!(
            size,
            compile_us = compiled_at.as_micros() as u64,
            total_us = started.elapsed().as_micros() as u64,
            "query executed"
        );
        Ok(value)
    }

    /// Evaluate and wrap the outcome in a response envelope.
    pub fn run(&self, query: Query, source: Option<&str>, size: usize) -> ResponseEnvelope {
        let outcome = self.evaluate(&query, size);
        if let Err(e) = &outcome {
            tracing::debug!(kind = e.kind(), "query failed: {e}");
        }
        ResponseEnvelope::compose(query, source, outcome, self.diagnostics)
    }

    pub fn cache_stats(&self) -> CacheStats {
        match &self.cache {
            Some(cache) => cache.stats(),
            None => CacheStats {
                enabled: false,
                entries: 0,
                capacity: 0,
                hits: 0,
                misses: 0,
            },
        }
    }
}
