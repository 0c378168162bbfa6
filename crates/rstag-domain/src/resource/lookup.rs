//! Candidate lookup across per-dimension tries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::resource::access::{AccessResource, ResourceElementMatchingScope};
use crate::resource::matcher::ServiceResourceMatcher;
use crate::resource::trie::ResourceTrie;

/// Intersects per-dimension trie lookups for the populated dimensions of
/// `resource`, smallest set first, then applies the optional predicate.
///
/// Matchers are identified by their service-resource id, so the
/// intersection is stable across trie copies. A populated dimension with no
/// trie yields no candidates. The result is sorted by resource id.
pub fn collect_evaluators(
    tries: &HashMap<String, ResourceTrie>,
    resource: &AccessResource,
    scopes: &BTreeMap<String, ResourceElementMatchingScope>,
    predicate: Option<&dyn Fn(&ServiceResourceMatcher) -> bool>,
) -> Vec<Arc<ServiceResourceMatcher>> {
    let mut per_dimension: Vec<Vec<Arc<ServiceResourceMatcher>>> = Vec::new();

    for (dimension, values) in resource.as_map() {
        if values.is_empty() {
            continue;
        }

        let Some(trie) = tries.get(dimension) else {
            return Vec::new();
        };
        let scope = scopes.get(dimension).copied().unwrap_or_default();

        let mut found: HashMap<i64, Arc<ServiceResourceMatcher>> = HashMap::new();
        for value in values {
            for matcher in trie.get_evaluators_for_resource(value, scope) {
                found.insert(matcher.resource_id(), matcher);
            }
        }

        if found.is_empty() {
            return Vec::new();
        }
        per_dimension.push(found.into_values().collect());
    }

    per_dimension.sort_by_key(Vec::len);

    let mut iter = per_dimension.into_iter();
    let mut result: Vec<Arc<ServiceResourceMatcher>> = match iter.next() {
        Some(smallest) => smallest,
        None => return Vec::new(),
    };

    for other in iter {
        let present: std::collections::HashSet<i64> =
            other.iter().map(|m| m.resource_id()).collect();
        result.retain(|m| present.contains(&m.resource_id()));
        if result.is_empty() {
            return result;
        }
    }

    if let Some(predicate) = predicate {
        result.retain(|m| predicate(m));
    }

    result.sort_by_key(|m| m.resource_id());
    result
}
