//! Core type definitions for the service-tags payload.
//!
//! These types mirror the wire/cache-file document shape (camelCase field
//! names) published by the tag service: a versioned bundle of tagged
//! service resources, the tags themselves, and the mapping between them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The policy types that admit resource hierarchies, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyType {
    Access,
    DataMask,
    RowFilter,
}

impl PolicyType {
    /// All policy types, in the order resource matchers try them.
    pub const ALL: [PolicyType; 3] = [PolicyType::Access, PolicyType::DataMask, PolicyType::RowFilter];
}

/// Definition of one resource dimension (e.g. `database`, `table`, `column`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDef {
    pub name: String,

    /// Name of the parent dimension; `None` for a hierarchy root.
    #[serde(default)]
    pub parent: Option<String>,

    /// Whether values of this dimension may carry `*`/`?` wildcards.
    #[serde(default = "default_true")]
    pub wildcards_enabled: bool,

    /// Whether value comparison folds case.
    #[serde(default)]
    pub ignore_case: bool,
}

impl ResourceDef {
    pub fn new(name: impl Into<String>, parent: Option<&str>) -> Self {
        Self {
            name: name.into(),
            parent: parent.map(|p| p.to_string()),
            wildcards_enabled: true,
            ignore_case: false,
        }
    }

    pub fn with_ignore_case(mut self, ignore_case: bool) -> Self {
        self.ignore_case = ignore_case;
        self
    }
}

/// A service definition: the ordered resource dimensions admitted per
/// policy type. The `resources` list (access) defines the dimension set
/// that per-dimension tries are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDef {
    pub name: String,
    pub resources: Vec<ResourceDef>,
    #[serde(default)]
    pub data_mask_resources: Vec<ResourceDef>,
    #[serde(default)]
    pub row_filter_resources: Vec<ResourceDef>,
}

impl ServiceDef {
    pub fn new(name: impl Into<String>, resources: Vec<ResourceDef>) -> Self {
        Self {
            name: name.into(),
            resources,
            data_mask_resources: Vec::new(),
            row_filter_resources: Vec::new(),
        }
    }

    /// The dimension list admitted by the given policy type.
    pub fn resources_for_policy_type(&self, policy_type: PolicyType) -> &[ResourceDef] {
        match policy_type {
            PolicyType::Access => &self.resources,
            PolicyType::DataMask => &self.data_mask_resources,
            PolicyType::RowFilter => &self.row_filter_resources,
        }
    }
}

/// One dimension's values on a tagged service resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResource {
    #[serde(default)]
    pub values: Vec<String>,

    /// When set, the values enumerate what the resource does NOT cover.
    #[serde(default)]
    pub is_excludes: bool,

    /// When set, the resource covers everything below its deepest value.
    #[serde(default)]
    pub is_recursive: bool,
}

impl PolicyResource {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            is_excludes: false,
            is_recursive: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An identified tuple of dimension values representing a tagged object.
///
/// A zero-length `resource_signature` inside a delta marks the resource as
/// deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResource {
    pub id: i64,
    #[serde(default)]
    pub resource_signature: String,
    #[serde(default)]
    pub resource_elements: HashMap<String, PolicyResource>,
}

impl ServiceResource {
    pub fn new(
        id: i64,
        resource_signature: impl Into<String>,
        resource_elements: HashMap<String, PolicyResource>,
    ) -> Self {
        Self {
            id,
            resource_signature: resource_signature.into(),
            resource_elements,
        }
    }

    /// Whether this record is a deletion marker within a delta.
    pub fn is_deleted(&self) -> bool {
        self.resource_signature.is_empty()
    }
}

/// A period during which a tag applies. Open bounds are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidityPeriod {
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl ValidityPeriod {
    fn admits(&self, at: DateTime<Utc>) -> bool {
        self.start_time.map_or(true, |s| s <= at) && self.end_time.map_or(true, |e| at <= e)
    }
}

/// An identified tag: a type, free-form attributes and optional validity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: i64,
    #[serde(rename = "type")]
    pub tag_type: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub validity_periods: Vec<ValidityPeriod>,
}

impl Tag {
    pub fn new(id: i64, tag_type: impl Into<String>) -> Self {
        Self {
            id,
            tag_type: tag_type.into(),
            attributes: HashMap::new(),
            validity_periods: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// A tag with no validity periods applies at any time.
    pub fn is_applicable(&self, access_time: DateTime<Utc>) -> bool {
        self.validity_periods.is_empty()
            || self.validity_periods.iter().any(|p| p.admits(access_time))
    }

    /// Identity of the tag excluding its id, used when collapsing duplicates.
    fn dedup_signature(&self) -> (String, Vec<(String, String)>) {
        let mut attrs: Vec<(String, String)> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        attrs.sort();
        (self.tag_type.clone(), attrs)
    }
}

/// How far a delta reaches into the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TagsChangeExtent {
    /// Version-only change.
    None,
    /// Tag attributes changed; the resource set is untouched.
    Tags,
    /// The resource set changed.
    ServiceResources,
    /// Both tags and resources changed.
    #[default]
    All,
}

/// The versioned `(resource -> tags)` payload published by the tag service,
/// either as a full snapshot or as a delta against a prior version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceTags {
    pub service_name: String,
    pub tag_version: i64,
    pub is_delta: bool,
    pub tags_change_extent: TagsChangeExtent,
    pub service_resources: Vec<ServiceResource>,
    pub resource_to_tag_ids: HashMap<i64, Vec<i64>>,
    pub tags: HashMap<i64, Tag>,
    pub is_tags_deduped: bool,
}

impl ServiceTags {
    pub fn new(service_name: impl Into<String>, tag_version: i64) -> Self {
        Self {
            service_name: service_name.into(),
            tag_version,
            ..Self::default()
        }
    }

    /// Collapses tags that are identical except for their id onto a single
    /// id, rewriting `resource_to_tag_ids` accordingly. Returns the number
    /// of duplicate tags removed.
    pub fn dedup_tags(&mut self) -> usize {
        let mut canonical: HashMap<(String, Vec<(String, String)>), i64> = HashMap::new();
        let mut remap: HashMap<i64, i64> = HashMap::new();

        let mut ids: Vec<i64> = self.tags.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            if let Some(tag) = self.tags.get(&id) {
                let signature = tag.dedup_signature();
                match canonical.get(&signature) {
                    Some(&keep) => {
                        remap.insert(id, keep);
                    }
                    None => {
                        canonical.insert(signature, id);
                    }
                }
            }
        }

        for tag_ids in self.resource_to_tag_ids.values_mut() {
            for tag_id in tag_ids.iter_mut() {
                if let Some(&keep) = remap.get(tag_id) {
                    *tag_id = keep;
                }
            }
            tag_ids.sort_unstable();
            tag_ids.dedup();
        }

        for dup in remap.keys() {
            self.tags.remove(dup);
        }

        self.is_tags_deduped = true;

        remap.len()
    }

    /// Normalizes the payload: sorts and dedups every tag-id list and
    /// releases excess map capacity. Stands in for the string interning the
    /// upstream service applies to its own payloads.
    pub fn normalize(&mut self) {
        for tag_ids in self.resource_to_tag_ids.values_mut() {
            tag_ids.sort_unstable();
            tag_ids.dedup();
        }
        self.resource_to_tag_ids.shrink_to_fit();
        self.tags.shrink_to_fit();
        self.service_resources.shrink_to_fit();
    }
}

fn default_true() -> bool {
    true
}
