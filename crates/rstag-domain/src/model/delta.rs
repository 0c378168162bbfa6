//! Merging a service-tags delta onto a prior payload.

use std::collections::HashSet;

use crate::model::types::{ServiceTags, TagsChangeExtent};

/// Merges `delta` onto `prior`, producing the full payload the delta
/// encodes.
///
/// Service resources in the delta replace prior resources with the same id;
/// a resource with an empty signature is a pure deletion. Tag definitions
/// from the delta overlay the prior map, and tags left unreferenced by any
/// resource are pruned. The merged payload adopts the delta's version and
/// is itself a full (non-delta) payload.
pub fn apply_delta(prior: &ServiceTags, delta: &ServiceTags, dedup_tags: bool) -> ServiceTags {
    let mut merged = prior.clone();

    merged.service_name = delta.service_name.clone();
    merged.tag_version = delta.tag_version;
    merged.is_delta = false;
    merged.tags_change_extent = TagsChangeExtent::All;
    merged.is_tags_deduped = prior.is_tags_deduped && delta.is_tags_deduped;

    let changed_ids: HashSet<i64> = delta.service_resources.iter().map(|r| r.id).collect();

    merged
        .service_resources
        .retain(|resource| !changed_ids.contains(&resource.id));

    for resource in &delta.service_resources {
        merged.resource_to_tag_ids.remove(&resource.id);

        if !resource.is_deleted() {
            merged.service_resources.push(resource.clone());

            if let Some(tag_ids) = delta.resource_to_tag_ids.get(&resource.id) {
                merged.resource_to_tag_ids.insert(resource.id, tag_ids.clone());
            }
        }
    }

    for (tag_id, tag) in &delta.tags {
        merged.tags.insert(*tag_id, tag.clone());
    }

    let referenced: HashSet<i64> = merged
        .resource_to_tag_ids
        .values()
        .flatten()
        .copied()
        .collect();
    merged.tags.retain(|tag_id, _| referenced.contains(tag_id));

    if dedup_tags {
        merged.dedup_tags();
    }

    merged
}
