//! The retriever contract and the registry that resolves one by name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use rstag_domain::{ServiceDef, ServiceTags};

use crate::config::PluginConfig;
use crate::error::RetrieverResult;

/// Everything a retriever needs to know about the plugin instance it
/// serves. Passed once at initialization.
#[derive(Debug, Clone)]
pub struct RetrieverInitContext {
    pub service_name: String,
    pub service_def: Arc<ServiceDef>,
    pub app_id: String,
    pub plugin_config: PluginConfig,
    pub options: HashMap<String, String>,
}

/// Pulls versioned service-tags payloads from wherever they live
/// (admin REST endpoint, file, test fixture). Called only from the
/// refresher task.
#[async_trait]
pub trait TagRetriever: Send + Sync {
    /// One-time initialization with the plugin's context.
    fn init(&mut self, _context: &RetrieverInitContext) -> RetrieverResult<()> {
        Ok(())
    }

    /// Returns the payload newer than `last_known_version`, or `None` when
    /// nothing changed since. `RetrieverError::ServiceNotFound` signals the
    /// service was deleted upstream.
    async fn retrieve_tags(
        &self,
        last_known_version: i64,
        last_activation_time_ms: i64,
    ) -> RetrieverResult<Option<ServiceTags>>;
}

type RetrieverConstructor = Box<dyn Fn() -> Box<dyn TagRetriever> + Send + Sync>;

/// Maps retriever names (the `tagRetrieverClassName` option) to
/// constructors. Stands in for runtime class loading: deployments register
/// their retriever implementations up front.
#[derive(Default)]
pub struct RetrieverRegistry {
    constructors: HashMap<String, RetrieverConstructor>,
}

impl RetrieverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn TagRetriever> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn TagRetriever>> {
        self.constructors.get(name).map(|constructor| constructor())
    }
}

impl std::fmt::Debug for RetrieverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrieverRegistry")
            .field("names", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRetriever;

    #[async_trait]
    impl TagRetriever for NullRetriever {
        async fn retrieve_tags(
            &self,
            _last_known_version: i64,
            _last_activation_time_ms: i64,
        ) -> RetrieverResult<Option<ServiceTags>> {
            Ok(None)
        }
    }

    #[test]
    fn registry_resolves_registered_names_only() {
        let mut registry = RetrieverRegistry::new();
        registry.register("null", || Box::new(NullRetriever));

        assert!(registry.create("null").is_some());
        assert!(registry.create("missing").is_none());
    }
}
