//! Access-resource model, service-resource matcher and trie pre-filter.

mod access;
mod lookup;
mod matcher;
mod trie;

pub use access::{
    get_request_tags_from_context, set_request_tags_in_context, AccessRequest, AccessResource,
    ContextValue, ResourceElementMatchingScope, ResourceMatchingScope, ACCESS_TYPE_ANY,
    TAGS_CONTEXT_KEY,
};
pub use lookup::collect_evaluators;
pub use matcher::{MatchType, ResourceHierarchies, ServiceResourceMatcher, TagForEval};
pub use trie::ResourceTrie;
