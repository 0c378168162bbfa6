//! The immutable in-memory form of one installed service-tags payload.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rstag_domain::{MatchType, ResourceTrie, ServiceResourceMatcher, ServiceTags, TagForEval};

/// One installed snapshot: the payload, one matcher per retained service
/// resource, the per-dimension trie index, and the precomputed answer for
/// an empty resource with any-access.
///
/// Readers treat the bundle as immutable; a writer may mutate the shared
/// index pieces only while it holds the write lock and owns the only
/// reference.
#[derive(Debug, Clone)]
pub struct EnrichedServiceTags {
    service_tags: Arc<ServiceTags>,
    resource_matchers: Arc<Vec<Arc<ServiceResourceMatcher>>>,
    resource_trie: Option<Arc<HashMap<String, ResourceTrie>>>,
    tags_for_empty_resource_and_any_access: HashSet<TagForEval>,
    resource_trie_version: i64,
}

impl EnrichedServiceTags {
    pub fn new(
        service_tags: ServiceTags,
        resource_matchers: Vec<Arc<ServiceResourceMatcher>>,
        resource_trie: Option<HashMap<String, ResourceTrie>>,
    ) -> Self {
        Self::from_shared(
            Arc::new(service_tags),
            Arc::new(resource_matchers),
            resource_trie.map(Arc::new),
        )
    }

    /// Wraps a new payload around a prior snapshot's matchers and tries,
    /// for deltas that only touch tag attributes.
    pub fn reusing_index(service_tags: ServiceTags, prior: &EnrichedServiceTags) -> Self {
        Self::from_shared(
            Arc::new(service_tags),
            Arc::clone(&prior.resource_matchers),
            prior.resource_trie.clone(),
        )
    }

    pub(crate) fn from_shared(
        service_tags: Arc<ServiceTags>,
        resource_matchers: Arc<Vec<Arc<ServiceResourceMatcher>>>,
        resource_trie: Option<Arc<HashMap<String, ResourceTrie>>>,
    ) -> Self {
        let tags_for_empty_resource_and_any_access = service_tags
            .tags
            .values()
            .map(|tag| TagForEval::new(tag, MatchType::Descendant))
            .collect();
        let resource_trie_version = service_tags.tag_version;

        Self {
            service_tags,
            resource_matchers,
            resource_trie,
            tags_for_empty_resource_and_any_access,
            resource_trie_version,
        }
    }

    pub fn service_tags(&self) -> &ServiceTags {
        &self.service_tags
    }

    pub fn resource_matchers(&self) -> &[Arc<ServiceResourceMatcher>] {
        &self.resource_matchers
    }

    pub fn resource_trie(&self) -> Option<&HashMap<String, ResourceTrie>> {
        self.resource_trie.as_deref()
    }

    pub fn tags_for_empty_resource_and_any_access(&self) -> &HashSet<TagForEval> {
        &self.tags_for_empty_resource_and_any_access
    }

    /// The payload version the index was (re)built at.
    pub fn resource_trie_version(&self) -> i64 {
        self.resource_trie_version
    }

    pub(crate) fn matchers_arc(&self) -> Arc<Vec<Arc<ServiceResourceMatcher>>> {
        Arc::clone(&self.resource_matchers)
    }

    pub(crate) fn trie_arc(&self) -> Option<Arc<HashMap<String, ResourceTrie>>> {
        self.resource_trie.clone()
    }

    pub(crate) fn service_tags_arc(&self) -> Arc<ServiceTags> {
        Arc::clone(&self.service_tags)
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn into_parts(
        self,
    ) -> (
        Arc<ServiceTags>,
        Arc<Vec<Arc<ServiceResourceMatcher>>>,
        Option<Arc<HashMap<String, ResourceTrie>>>,
    ) {
        (self.service_tags, self.resource_matchers, self.resource_trie)
    }
}
