//! rstag-domain: Tag model and resource-matching core
//!
//! This crate contains the synchronous core of the tag enricher:
//! - Service-tags payload model and delta merging
//! - Service-definition helper (resource hierarchies per policy type)
//! - Service-resource matcher (self/ancestor/descendant classification)
//! - Per-dimension resource trie used as a lookup pre-filter
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                rstag-domain                  │
//! ├─────────────────────────────────────────────┤
//! │  model/     - Payload types & delta merge   │
//! │  resource/  - Access model, matcher, trie   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Nothing in this crate performs I/O or spawns tasks; the async engine
//! lives in `rstag-enricher`.

pub mod error;
pub mod model;
pub mod resource;

// Re-export commonly used types at the crate root
pub use error::{DomainError, DomainResult};
pub use model::{
    apply_delta, PolicyResource, PolicyType, ResourceDef, ServiceDef, ServiceDefHelper,
    ServiceResource, ServiceTags, Tag, TagsChangeExtent, ValidityPeriod,
};
pub use resource::{
    collect_evaluators, get_request_tags_from_context, set_request_tags_in_context, AccessRequest,
    AccessResource, ContextValue, MatchType, ResourceElementMatchingScope, ResourceHierarchies,
    ResourceMatchingScope, ResourceTrie, ServiceResourceMatcher, TagForEval, ACCESS_TYPE_ANY,
    TAGS_CONTEXT_KEY,
};
