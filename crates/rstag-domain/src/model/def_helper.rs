//! Derived views over a service definition.
//!
//! A service definition lists resource dimensions with parent links; the
//! helper flattens them into the set of legal resource paths (hierarchies)
//! per policy type, and answers the coverage queries the matcher and the
//! read path need.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{DomainError, DomainResult};
use crate::model::types::{PolicyType, ResourceDef, ServiceDef};

/// Precomputed hierarchies for one service definition.
///
/// A hierarchy is an ordered list of dimension names, root first, ending at
/// a leaf dimension. One hierarchy exists per leaf of the parent-link
/// forest of each policy type's dimension list.
#[derive(Debug)]
pub struct ServiceDefHelper {
    service_def: Arc<ServiceDef>,
    hierarchies: HashMap<PolicyType, Vec<Vec<String>>>,
    defs_by_name: HashMap<String, ResourceDef>,
}

impl ServiceDefHelper {
    pub fn new(service_def: Arc<ServiceDef>) -> DomainResult<Self> {
        let mut hierarchies = HashMap::new();

        for policy_type in PolicyType::ALL {
            let defs = service_def.resources_for_policy_type(policy_type);
            hierarchies.insert(policy_type, derive_hierarchies(defs)?);
        }

        let mut defs_by_name = HashMap::new();
        for policy_type in PolicyType::ALL {
            for def in service_def.resources_for_policy_type(policy_type) {
                defs_by_name
                    .entry(def.name.clone())
                    .or_insert_with(|| def.clone());
            }
        }

        Ok(Self {
            service_def,
            hierarchies,
            defs_by_name,
        })
    }

    pub fn service_def(&self) -> &Arc<ServiceDef> {
        &self.service_def
    }

    /// All hierarchies admitted by the given policy type.
    pub fn resource_hierarchies(&self, policy_type: PolicyType) -> &[Vec<String>] {
        self.hierarchies
            .get(&policy_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether the hierarchy contains every one of the given dimension names.
    pub fn hierarchy_has_all_resources<'a>(
        hierarchy: &[String],
        mut keys: impl Iterator<Item = &'a str>,
    ) -> bool {
        keys.all(|key| hierarchy.iter().any(|dim| dim == key))
    }

    /// The hierarchies of a policy type that contain every given key.
    pub fn hierarchies_for_keys<'a, 'b>(
        &'a self,
        policy_type: PolicyType,
        keys: impl Iterator<Item = &'b str> + Clone,
    ) -> Vec<&'a Vec<String>> {
        self.resource_hierarchies(policy_type)
            .iter()
            .filter(|hierarchy| Self::hierarchy_has_all_resources(hierarchy, keys.clone()))
            .collect()
    }

    /// Looks up a dimension definition by name, across all policy types.
    pub fn resource_def(&self, name: &str) -> Option<&ResourceDef> {
        self.defs_by_name.get(name)
    }
}

/// Flattens parent links into root-to-leaf paths. A leaf is a dimension no
/// other dimension names as its parent; a parent outside the list is an
/// error, as is a cycle.
fn derive_hierarchies(defs: &[ResourceDef]) -> DomainResult<Vec<Vec<String>>> {
    let by_name: HashMap<&str, &ResourceDef> =
        defs.iter().map(|d| (d.name.as_str(), d)).collect();
    let parents: HashSet<&str> = defs
        .iter()
        .filter_map(|d| d.parent.as_deref())
        .collect();

    let mut hierarchies = Vec::new();

    for leaf in defs.iter().filter(|d| !parents.contains(d.name.as_str())) {
        let mut path = vec![leaf.name.clone()];
        let mut current = leaf;

        while let Some(parent_name) = current.parent.as_deref() {
            let parent = by_name.get(parent_name).ok_or_else(|| {
                DomainError::UnknownParent {
                    dimension: current.name.clone(),
                    parent: parent_name.to_string(),
                }
            })?;

            if path.iter().any(|seen| seen == &parent.name) {
                return Err(DomainError::HierarchyCycle {
                    dimension: parent.name.clone(),
                });
            }

            path.push(parent.name.clone());
            current = parent;
        }

        path.reverse();
        hierarchies.push(path);
    }

    // A non-empty, acyclic forest always has at least one leaf.
    if hierarchies.is_empty() {
        if let Some(def) = defs.first() {
            return Err(DomainError::HierarchyCycle {
                dimension: def.name.clone(),
            });
        }
    }

    Ok(hierarchies)
}
