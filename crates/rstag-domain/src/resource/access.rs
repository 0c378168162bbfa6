//! Accessed-resource model and enrichment request.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::model::ServiceDef;
use crate::resource::matcher::TagForEval;

/// The access type that matches any operation.
pub const ACCESS_TYPE_ANY: &str = "_any";

/// Context key under which matched tags are attached to a request.
pub const TAGS_CONTEXT_KEY: &str = "TAGS";

/// How the overall resource is matched against tagged resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResourceMatchingScope {
    #[default]
    SelfOnly,
    SelfOrDescendants,
}

/// How one dimension's value is matched during trie lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceElementMatchingScope {
    #[default]
    SelfOnly,
    SelfOrChild,
    SelfOrPrefix,
}

/// A concrete accessed resource: dimension values plus the derived leaf
/// name and a stable cache key.
///
/// The leaf is the deepest populated dimension in service-definition
/// order; the cache key is a dimension-ordered join of the populated
/// values, stable across identical resources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessResource {
    values: HashMap<String, Vec<String>>,
    leaf_name: Option<String>,
    cache_key: String,
}

impl AccessResource {
    pub fn new(service_def: &ServiceDef, values: HashMap<String, Vec<String>>) -> Self {
        let mut leaf_name = None;
        let mut cache_key = String::new();

        for def in &service_def.resources {
            if let Some(dim_values) = values.get(&def.name) {
                if dim_values.is_empty() {
                    continue;
                }
                leaf_name = Some(def.name.clone());
                cache_key.push_str(&def.name);
                cache_key.push('=');
                cache_key.push_str(&dim_values.join("|"));
                cache_key.push(';');
            }
        }

        Self {
            values,
            leaf_name,
            cache_key,
        }
    }

    /// A resource with no populated dimensions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Convenience constructor for single-valued dimensions.
    pub fn from_pairs<'a>(
        service_def: &ServiceDef,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let values = pairs
            .into_iter()
            .map(|(dim, value)| (dim.to_string(), vec![value.to_string()]))
            .collect();
        Self::new(service_def, values)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() || self.values.values().all(Vec::is_empty)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + Clone {
        self.values.keys().map(String::as_str)
    }

    pub fn value(&self, dimension: &str) -> Option<&[String]> {
        self.values.get(dimension).map(Vec::as_slice)
    }

    pub fn as_map(&self) -> &HashMap<String, Vec<String>> {
        &self.values
    }

    /// Deepest populated dimension, per service-definition order.
    pub fn leaf_name(&self) -> Option<&str> {
        self.leaf_name.as_deref()
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }
}

/// A value attached to a request's context by an enricher.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Tags(HashSet<TagForEval>),
    Text(String),
}

/// An authorization request as seen by the enricher: the accessed resource,
/// the access type, and the context the matched tags are attached to.
#[derive(Debug, Clone, Default)]
pub struct AccessRequest {
    pub resource: AccessResource,
    pub access_type: String,
    pub access_time: Option<DateTime<Utc>>,
    pub resource_matching_scope: ResourceMatchingScope,
    pub resource_element_matching_scopes: BTreeMap<String, ResourceElementMatchingScope>,
    pub context: HashMap<String, ContextValue>,
}

impl AccessRequest {
    pub fn new(resource: AccessResource) -> Self {
        Self {
            resource,
            ..Self::default()
        }
    }

    pub fn with_access_type(mut self, access_type: impl Into<String>) -> Self {
        self.access_type = access_type.into();
        self
    }

    pub fn with_access_time(mut self, access_time: DateTime<Utc>) -> Self {
        self.access_time = Some(access_time);
        self
    }

    pub fn with_resource_matching_scope(mut self, scope: ResourceMatchingScope) -> Self {
        self.resource_matching_scope = scope;
        self
    }

    /// An unspecified or `_any` access type matches any operation.
    pub fn is_access_type_any(&self) -> bool {
        self.access_type.is_empty() || self.access_type == ACCESS_TYPE_ANY
    }
}

/// Attaches matched tags to the request context, or clears the entry when
/// nothing matched.
pub fn set_request_tags_in_context(
    context: &mut HashMap<String, ContextValue>,
    tags: Option<HashSet<TagForEval>>,
) {
    match tags {
        Some(tags) if !tags.is_empty() => {
            context.insert(TAGS_CONTEXT_KEY.to_string(), ContextValue::Tags(tags));
        }
        _ => {
            context.remove(TAGS_CONTEXT_KEY);
        }
    }
}

/// Reads the tags a prior enrichment attached to the request context.
pub fn get_request_tags_from_context(
    context: &HashMap<String, ContextValue>,
) -> Option<&HashSet<TagForEval>> {
    match context.get(TAGS_CONTEXT_KEY) {
        Some(ContextValue::Tags(tags)) => Some(tags),
        _ => None,
    }
}
