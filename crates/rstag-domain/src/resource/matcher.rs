//! Service-resource matcher: classifies how an accessed resource relates to
//! a tagged service resource on its dimension hierarchy.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{
    PolicyResource, PolicyType, ResourceDef, ServiceDefHelper, ServiceResource, Tag,
    ValidityPeriod,
};
use crate::resource::access::{AccessResource, ResourceElementMatchingScope};

/// Relation between an accessed resource and a tagged service resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    /// No overlap on the hierarchy.
    None,
    /// Keys and values agree exactly.
    Exact,
    /// The service resource sits above the accessed resource.
    Ancestor,
    /// The service resource sits below the accessed resource.
    Descendant,
    /// The service resource covers itself and everything below it.
    ExactAndAllDescendants,
}

/// A tag resolved for evaluation, carrying the relation under which its
/// resource matched. Identity is `(tag id, match kind)`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagForEval {
    pub tag_id: i64,
    pub tag_type: String,
    pub attributes: HashMap<String, String>,
    pub match_type: MatchType,
    #[serde(skip)]
    validity_periods: Vec<ValidityPeriod>,
}

impl TagForEval {
    pub fn new(tag: &Tag, match_type: MatchType) -> Self {
        Self {
            tag_id: tag.id,
            tag_type: tag.tag_type.clone(),
            attributes: tag.attributes.clone(),
            match_type,
            validity_periods: tag.validity_periods.clone(),
        }
    }

    pub fn is_applicable(&self, access_time: DateTime<Utc>) -> bool {
        self.validity_periods.is_empty()
            || self
                .validity_periods
                .iter()
                .any(|p| p.start_time.map_or(true, |s| s <= access_time)
                    && p.end_time.map_or(true, |e| access_time <= e))
    }
}

impl PartialEq for TagForEval {
    fn eq(&self, other: &Self) -> bool {
        self.tag_id == other.tag_id && self.match_type == other.match_type
    }
}

impl Eq for TagForEval {}

impl std::hash::Hash for TagForEval {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.tag_id.hash(state);
        self.match_type.hash(state);
    }
}

/// Memo of `(policy type, dimension-key set) -> covers some hierarchy`.
///
/// Shared across the service resources of one snapshot build: the number of
/// distinct key sets is bounded by the dimension combinations of the
/// service definition, which is far smaller than the resource count.
#[derive(Debug, Default)]
pub struct ResourceHierarchies {
    validated: HashMap<(PolicyType, Vec<String>), bool>,
}

impl ResourceHierarchies {
    pub fn is_valid(&self, policy_type: PolicyType, keys: &[String]) -> Option<bool> {
        self.validated.get(&(policy_type, keys.to_vec())).copied()
    }

    pub fn record(&mut self, policy_type: PolicyType, keys: Vec<String>, valid: bool) {
        self.validated.insert((policy_type, keys), valid);
    }
}

/// Decides whether an accessed resource matches one tagged service resource
/// and in what relation.
///
/// Built from the first policy type (access, datamask, rowfilter) whose
/// hierarchy set contains a hierarchy covering the resource's dimension
/// keys; construction fails when no policy type admits the resource.
#[derive(Debug)]
pub struct ServiceResourceMatcher {
    service_resource: ServiceResource,
    policy_type: PolicyType,
    hierarchy: Vec<ResourceDef>,
    /// Deepest hierarchy index the service resource populates.
    leaf_index: Option<usize>,
    /// Whether the leaf value subsumes every descendant (`*` or recursive).
    leaf_covers_all: bool,
}

impl ServiceResourceMatcher {
    pub fn build(
        service_resource: &ServiceResource,
        helper: &ServiceDefHelper,
        hierarchies: &mut ResourceHierarchies,
    ) -> Option<Self> {
        let mut keys: Vec<String> = service_resource.resource_elements.keys().cloned().collect();
        keys.sort_unstable();

        for policy_type in PolicyType::ALL {
            let valid = match hierarchies.is_valid(policy_type, &keys) {
                Some(valid) => valid,
                None => {
                    let valid = helper.resource_hierarchies(policy_type).iter().any(|h| {
                        ServiceDefHelper::hierarchy_has_all_resources(
                            h,
                            keys.iter().map(String::as_str),
                        )
                    });
                    hierarchies.record(policy_type, keys.clone(), valid);
                    valid
                }
            };

            if !valid {
                continue;
            }

            let hierarchy_names = helper.resource_hierarchies(policy_type).iter().find(|h| {
                ServiceDefHelper::hierarchy_has_all_resources(h, keys.iter().map(String::as_str))
            })?;

            let hierarchy: Vec<ResourceDef> = hierarchy_names
                .iter()
                .map(|name| {
                    helper
                        .resource_def(name)
                        .cloned()
                        .unwrap_or_else(|| ResourceDef::new(name.clone(), None))
                })
                .collect();

            let leaf_index = hierarchy.iter().rposition(|def| {
                service_resource
                    .resource_elements
                    .get(&def.name)
                    .is_some_and(|p| !p.values.is_empty())
            });

            let leaf_covers_all = leaf_index
                .and_then(|i| service_resource.resource_elements.get(&hierarchy[i].name))
                .map(|p| p.is_recursive || (p.values.len() == 1 && p.values[0] == "*"))
                .unwrap_or(false);

            return Some(Self {
                service_resource: service_resource.clone(),
                policy_type,
                hierarchy,
                leaf_index,
                leaf_covers_all,
            });
        }

        None
    }

    pub fn service_resource(&self) -> &ServiceResource {
        &self.service_resource
    }

    pub fn resource_id(&self) -> i64 {
        self.service_resource.id
    }

    pub fn policy_type(&self) -> PolicyType {
        self.policy_type
    }

    /// Whether the given dimension is this matcher's deepest populated one.
    pub fn is_leaf(&self, dimension: &str) -> bool {
        self.leaf_index
            .is_some_and(|i| self.hierarchy[i].name == dimension)
    }

    /// Whether this matcher's resource sits strictly above the given
    /// dimension on its hierarchy.
    pub fn is_ancestor_of(&self, leaf_def: &ResourceDef) -> bool {
        let position = self
            .hierarchy
            .iter()
            .position(|def| def.name == leaf_def.name);

        match (self.leaf_index, position) {
            (Some(own), Some(other)) => other > own,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Classifies the accessed resource against this service resource.
    pub fn match_type(
        &self,
        resource: &AccessResource,
        scopes: &BTreeMap<String, ResourceElementMatchingScope>,
    ) -> MatchType {
        let policy_depth = self.leaf_index.map(|i| i as isize).unwrap_or(-1);
        let access_depth = self
            .hierarchy
            .iter()
            .rposition(|def| resource.value(&def.name).is_some_and(|v| !v.is_empty()))
            .map(|i| i as isize)
            .unwrap_or(-1);

        // compare the shared prefix of the hierarchy
        let shared_depth = policy_depth.min(access_depth);
        for (i, def) in self.hierarchy.iter().enumerate() {
            if i as isize > shared_depth {
                break;
            }

            let policy = self.service_resource.resource_elements.get(&def.name);
            let access_values = resource.value(&def.name);

            let (Some(policy), Some(access_values)) = (policy, access_values) else {
                continue;
            };
            if policy.values.is_empty() || access_values.is_empty() {
                continue;
            }

            let scope = scopes.get(&def.name).copied().unwrap_or_default();
            let mut dim_matches = access_values
                .iter()
                .all(|value| value_matches(def, policy, value, scope));

            if policy.is_excludes {
                dim_matches = !dim_matches;
            }

            if !dim_matches {
                return MatchType::None;
            }
        }

        // dimensions populated outside this hierarchy put the access on a
        // sibling branch: the shared prefix matched, so the service
        // resource can only be an ancestor of the accessed object; a
        // service resource deeper than the prefix contains nothing of what
        // was accessed and matches nothing
        let has_foreign_keys = resource.as_map().iter().any(|(key, values)| {
            !values.is_empty() && !self.hierarchy.iter().any(|def| def.name == *key)
        });
        if has_foreign_keys {
            return if policy_depth <= access_depth {
                MatchType::Ancestor
            } else {
                MatchType::None
            };
        }

        match policy_depth.cmp(&access_depth) {
            Ordering::Less => MatchType::Ancestor,
            Ordering::Greater => MatchType::Descendant,
            Ordering::Equal => {
                if policy_depth >= 0 && self.leaf_covers_all {
                    MatchType::ExactAndAllDescendants
                } else {
                    MatchType::Exact
                }
            }
        }
    }
}

fn value_matches(
    def: &ResourceDef,
    policy: &PolicyResource,
    access_value: &str,
    scope: ResourceElementMatchingScope,
) -> bool {
    let access_folded = fold_case(def, access_value);

    policy.values.iter().any(|policy_value| {
        let policy_folded = fold_case(def, policy_value);

        let matched = if def.wildcards_enabled {
            wildcard_match(&policy_folded, &access_folded)
        } else {
            policy_folded == access_folded
        };

        matched
            || (scope == ResourceElementMatchingScope::SelfOrPrefix
                && policy_folded.starts_with(access_folded.as_str()))
    })
}

fn fold_case(def: &ResourceDef, value: &str) -> String {
    if def.ignore_case {
        value.to_lowercase()
    } else {
        value.to_string()
    }
}

/// Glob match supporting `*` (any run) and `?` (any single character).
pub(crate) fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut pi, mut vi) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while vi < value.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == value[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            backtrack = Some((pi, vi));
            pi += 1;
        } else if let Some((star_pi, star_vi)) = backtrack {
            pi = star_pi + 1;
            vi = star_vi + 1;
            backtrack = Some((star_pi, star_vi + 1));
        } else {
            return false;
        }
    }

    pattern[pi..].iter().all(|c| *c == '*')
}
