//! Memoized candidate lookups for the read path.
//!
//! Keyed by the resource's cache key and the per-dimension matching
//! scopes; cleared wholesale whenever a snapshot is installed, so entries
//! never outlive the matchers they point at.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;

use rstag_domain::{ResourceElementMatchingScope, ServiceResourceMatcher};

type ScopeMap = BTreeMap<String, ResourceElementMatchingScope>;
type Evaluators = Arc<Vec<Arc<ServiceResourceMatcher>>>;

/// Two-level memo `resource cache key -> (scopes -> matcher set)`.
///
/// Internally synchronized; brief reads and writes from any thread.
#[derive(Debug, Default)]
pub struct CachedResourceEvaluators {
    cache: DashMap<String, HashMap<ScopeMap, Evaluators>>,
}

impl CachedResourceEvaluators {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Metrics
    ///
    /// Records hit/miss to `rstag_evaluator_cache_hits_total` /
    /// `rstag_evaluator_cache_misses_total`.
    pub fn get(&self, resource_key: &str, scopes: &ScopeMap) -> Option<Evaluators> {
        let result = self
            .cache
            .get(resource_key)
            .and_then(|by_scope| by_scope.get(scopes).cloned());

        if result.is_some() {
            metrics::counter!("rstag_evaluator_cache_hits_total").increment(1);
        } else {
            metrics::counter!("rstag_evaluator_cache_misses_total").increment(1);
        }

        result
    }

    pub fn insert(&self, resource_key: String, scopes: ScopeMap, evaluators: Evaluators) {
        self.cache
            .entry(resource_key)
            .or_default()
            .insert(scopes, evaluators);
    }

    /// Drops every entry. Called under the write lock on snapshot install.
    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Registers evaluator-cache metric descriptions. Optional; call once at
/// startup for better dashboards.
pub fn register_evaluator_cache_metrics() {
    metrics::describe_counter!(
        "rstag_evaluator_cache_hits_total",
        "Total number of evaluator cache hits"
    );
    metrics::describe_counter!(
        "rstag_evaluator_cache_misses_total",
        "Total number of evaluator cache misses"
    );
}
