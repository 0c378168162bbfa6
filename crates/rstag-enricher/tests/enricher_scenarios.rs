//! End-to-end scenarios for the tag enricher: matching, delta application,
//! refresher behavior and cache-file handling.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use rstag_domain::{
    AccessRequest, AccessResource, MatchType, PolicyResource, ResourceDef, ServiceDef,
    ServiceResource, ServiceTags, Tag, TagsChangeExtent,
};
use rstag_enricher::{
    cache_file_path, EnricherOptions, PluginConfig, RetrieverError, RetrieverRegistry,
    RetrieverResult, TagEnricher, TagRetriever,
};

// ============================================================
// Test fixtures
// ============================================================

fn hive_def() -> Arc<ServiceDef> {
    Arc::new(ServiceDef::new(
        "hive",
        vec![
            ResourceDef::new("database", None),
            ResourceDef::new("table", Some("database")),
            ResourceDef::new("column", Some("table")),
        ],
    ))
}

fn service_resource(id: i64, signature: &str, pairs: &[(&str, &str)]) -> ServiceResource {
    let elements = pairs
        .iter()
        .map(|(dim, value)| (dim.to_string(), PolicyResource::new([*value])))
        .collect();
    ServiceResource::new(id, signature, elements)
}

/// Full snapshot: each resource paired with its `(tag id, tag type)` list.
fn snapshot(version: i64, entries: &[(ServiceResource, &[(i64, &str)])]) -> ServiceTags {
    let mut service_tags = ServiceTags::new("dev_hive", version);
    for (resource, tags) in entries {
        let tag_ids: Vec<i64> = tags.iter().map(|(id, _)| *id).collect();
        service_tags
            .resource_to_tag_ids
            .insert(resource.id, tag_ids);
        for (tag_id, tag_type) in *tags {
            service_tags.tags.insert(*tag_id, Tag::new(*tag_id, *tag_type));
        }
        service_tags.service_resources.push(resource.clone());
    }
    service_tags
}

fn delta(version: i64, entries: &[(ServiceResource, &[(i64, &str)])]) -> ServiceTags {
    let mut service_tags = snapshot(version, entries);
    service_tags.is_delta = true;
    service_tags.tags_change_extent = TagsChangeExtent::ServiceResources;
    service_tags
}

fn enricher_with(plugin_config: PluginConfig) -> Arc<TagEnricher> {
    TagEnricher::new(
        "dev_hive",
        "hive",
        hive_def(),
        EnricherOptions::default(),
        plugin_config,
    )
    .expect("valid service def")
}

fn request(pairs: &[(&str, &str)], access_type: &str) -> AccessRequest {
    let def = hive_def();
    AccessRequest::new(AccessResource::from_pairs(&def, pairs.iter().copied()))
        .with_access_type(access_type)
}

/// Runs `enrich` and returns the matched `(tag type, match type)` pairs.
fn enriched_tags(enricher: &TagEnricher, pairs: &[(&str, &str)], access_type: &str) -> Vec<(String, MatchType)> {
    let mut req = request(pairs, access_type);
    enricher.enrich(&mut req);

    let mut found: Vec<(String, MatchType)> =
        rstag_domain::get_request_tags_from_context(&req.context)
            .map(|tags| {
                tags.iter()
                    .map(|tag| (tag.tag_type.clone(), tag.match_type))
                    .collect()
            })
            .unwrap_or_default();
    found.sort();
    found
}

// ============================================================
// Mock retriever
// ============================================================

struct MockState {
    responses: Mutex<VecDeque<RetrieverResult<Option<ServiceTags>>>>,
    calls: Mutex<Vec<i64>>,
}

impl MockState {
    fn new(responses: Vec<RetrieverResult<Option<ServiceTags>>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn recorded_versions(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

struct MockTagRetriever {
    state: Arc<MockState>,
}

#[async_trait]
impl TagRetriever for MockTagRetriever {
    async fn retrieve_tags(
        &self,
        last_known_version: i64,
        _last_activation_time_ms: i64,
    ) -> RetrieverResult<Option<ServiceTags>> {
        self.state.calls.lock().unwrap().push(last_known_version);
        self.state
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None))
    }
}

fn registry_for(state: &Arc<MockState>) -> RetrieverRegistry {
    let state = Arc::clone(state);
    let mut registry = RetrieverRegistry::new();
    registry.register("mock", move || {
        Box::new(MockTagRetriever {
            state: Arc::clone(&state),
        })
    });
    registry
}

fn options_with_mock() -> EnricherOptions {
    EnricherOptions::default().with_retriever("mock")
}

// ============================================================
// Matching scenarios
// ============================================================

#[tokio::test]
async fn tag_on_database_matches_deeper_table_request_as_ancestor() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    let found = enriched_tags(
        &enricher,
        &[("database", "sales"), ("table", "orders")],
        "select",
    );

    assert_eq!(found, vec![("PII".to_string(), MatchType::Ancestor)]);
}

#[tokio::test]
async fn empty_resource_with_any_access_sees_every_tag_as_descendant() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    let found = enriched_tags(&enricher, &[], "");

    assert_eq!(found, vec![("PII".to_string(), MatchType::Descendant)]);
}

#[tokio::test]
async fn unrelated_resource_matches_nothing() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    let found = enriched_tags(&enricher, &[("database", "finance")], "select");

    assert!(found.is_empty());
}

#[tokio::test]
async fn explicitly_empty_dimensions_do_not_alter_enrichment() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    let def = hive_def();
    let mut values = HashMap::new();
    values.insert("database".to_string(), vec!["sales".to_string()]);
    values.insert("table".to_string(), vec!["orders".to_string()]);
    values.insert("column".to_string(), Vec::new());
    let mut padded =
        AccessRequest::new(AccessResource::new(&def, values)).with_access_type("select");
    enricher.enrich(&mut padded);

    let mut padded_tags: Vec<(String, MatchType)> =
        rstag_domain::get_request_tags_from_context(&padded.context)
            .map(|tags| {
                tags.iter()
                    .map(|tag| (tag.tag_type.clone(), tag.match_type))
                    .collect()
            })
            .unwrap_or_default();
    padded_tags.sort();

    let clean_tags = enriched_tags(
        &enricher,
        &[("database", "sales"), ("table", "orders")],
        "select",
    );

    assert_eq!(padded_tags, clean_tags);
    assert_eq!(clean_tags, vec![("PII".to_string(), MatchType::Ancestor)]);
}

#[tokio::test]
async fn full_install_exposes_payload_and_index_versions() {
    let enricher = enricher_with(PluginConfig::default());
    assert_eq!(enricher.service_tags_version(), -1);

    enricher.set_service_tags(Some(snapshot(
        7,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    assert_eq!(enricher.service_tags_version(), 7);
    assert_eq!(enricher.resource_trie_version(), 7);
}

#[tokio::test]
async fn trie_map_covers_every_service_def_dimension() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    let enriched = enricher.enriched_service_tags().expect("snapshot installed");
    let tries = enriched.resource_trie().expect("prefilter enabled");
    let mut dimensions: Vec<&str> = tries.keys().map(String::as_str).collect();
    dimensions.sort_unstable();

    assert_eq!(dimensions, vec!["column", "database", "table"]);
}

#[tokio::test]
async fn invalid_resource_is_dropped_from_full_rebuild_with_its_tags() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[
            (service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")]),
            (service_resource(2, "sig-2", &[("bucket", "b1")]), &[(11, "PCI")]),
        ],
    )));

    let enriched = enricher.enriched_service_tags().expect("snapshot installed");
    assert_eq!(enriched.resource_matchers().len(), 1);
    assert_eq!(enriched.service_tags().service_resources.len(), 1);
    assert!(!enriched.service_tags().resource_to_tag_ids.contains_key(&2));

    // surviving resources still match
    let found = enriched_tags(&enricher, &[("database", "sales")], "select");
    assert_eq!(found, vec![("PII".to_string(), MatchType::Exact)]);
}

#[tokio::test]
async fn clearing_service_tags_empties_enrichment() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    enricher.set_service_tags(None);

    assert_eq!(enricher.service_tags_version(), -1);
    assert!(enriched_tags(&enricher, &[("database", "sales")], "select").is_empty());
}

// ============================================================
// Delta application
// ============================================================

/// Replaces `{database: sales}` with `{database: sales, table: orders}`
/// through a delta (a delete entry for the old values plus an add entry),
/// then verifies the new matcher answers and the old one is gone.
async fn replace_resource_through_delta(plugin_config: PluginConfig) {
    let enricher = enricher_with(plugin_config);
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    let mut change = delta(
        2,
        &[(
            service_resource(2, "sig-2", &[("database", "sales"), ("table", "orders")]),
            &[(10, "PII")],
        )],
    );
    // the old resource leaves as a deletion entry carrying its old values
    change
        .service_resources
        .insert(0, service_resource(1, "", &[("database", "sales")]));

    let effective = enricher.set_service_tags(Some(change));
    assert_eq!(effective, 2);
    assert_eq!(enricher.service_tags_version(), 2);

    // deeper request matches the replacement as ancestor
    let found = enriched_tags(
        &enricher,
        &[("database", "sales"), ("table", "orders"), ("column", "ssn")],
        "select",
    );
    assert_eq!(found, vec![("PII".to_string(), MatchType::Ancestor)]);

    // the prior database-level matcher is no longer found: a request at
    // database depth now only sees the deeper resource (a descendant)
    let found = enriched_tags(&enricher, &[("database", "sales")], "select");
    assert!(found.is_empty());
}

#[tokio::test]
async fn delta_replaces_resource_with_copy_on_write_index() {
    replace_resource_through_delta(PluginConfig::default()).await;
}

#[tokio::test]
async fn delta_replaces_resource_with_in_place_index_updates() {
    replace_resource_through_delta(PluginConfig::default().with_deltas(true, true)).await;
}

#[tokio::test]
async fn attribute_only_delta_reuses_matchers_and_tries() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));
    let prior = enricher.enriched_service_tags().expect("snapshot installed");

    let mut change = ServiceTags::new("dev_hive", 2);
    change.is_delta = true;
    change.tags_change_extent = TagsChangeExtent::Tags;
    change
        .tags
        .insert(10, Tag::new(10, "PII").with_attribute("level", "high"));

    let effective = enricher.set_service_tags(Some(change));
    assert_eq!(effective, 2);

    let current = enricher.enriched_service_tags().expect("snapshot installed");

    // index is shared with the prior snapshot, not rebuilt
    assert!(std::ptr::eq(
        prior.resource_trie().expect("prior tries"),
        current.resource_trie().expect("current tries"),
    ));
    assert_eq!(
        prior.resource_matchers().as_ptr(),
        current.resource_matchers().as_ptr()
    );

    // the updated attribute is visible through enrich
    let mut req = request(&[("database", "sales"), ("table", "orders")], "select");
    enricher.enrich(&mut req);
    let tags = rstag_domain::get_request_tags_from_context(&req.context).expect("tags attached");
    let tag = tags.iter().next().expect("one tag");
    assert_eq!(tag.attributes.get("level").map(String::as_str), Some("high"));
}

#[tokio::test]
async fn version_only_delta_keeps_the_installed_snapshot() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    let mut change = ServiceTags::new("dev_hive", 2);
    change.is_delta = true;
    change.tags_change_extent = TagsChangeExtent::None;

    let effective = enricher.set_service_tags(Some(change));

    // version bookkeeping only: the refresher advances, the snapshot stays
    assert_eq!(effective, 2);
    assert_eq!(enricher.service_tags_version(), 1);
}

#[tokio::test]
async fn aborted_delta_preserves_every_observable_answer() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[
            (service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")]),
            (service_resource(2, "sig-2", &[("database", "finance")]), &[(11, "PCI")]),
        ],
    )));

    let probe: &[(&[(&str, &str)], &str)] = &[
        (&[("database", "sales")], "select"),
        (&[("database", "sales"), ("table", "orders")], "select"),
        (&[("database", "finance")], "select"),
        (&[], ""),
    ];
    let before: Vec<_> = probe
        .iter()
        .map(|(pairs, access)| enriched_tags(&enricher, pairs, access))
        .collect();

    // a delta carrying one valid change and one unbuildable resource
    let mut change = delta(
        2,
        &[(service_resource(3, "sig-3", &[("database", "hr")]), &[(12, "PII")])],
    );
    change
        .service_resources
        .push(service_resource(4, "sig-4", &[("bucket", "b1")]));

    let effective = enricher.set_service_tags(Some(change));

    assert_eq!(effective, -1);
    assert_eq!(enricher.service_tags_version(), 1);

    let after: Vec<_> = probe
        .iter()
        .map(|(pairs, access)| enriched_tags(&enricher, pairs, access))
        .collect();
    assert_eq!(before, after);

    // the valid part of the delta was not applied either
    assert!(enriched_tags(&enricher, &[("database", "hr")], "select").is_empty());
}

#[tokio::test]
async fn delta_then_equivalent_full_snapshot_produce_the_same_index() {
    let initial = snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    );

    // path A: initial + delta
    let incremental = enricher_with(PluginConfig::default());
    incremental.set_service_tags(Some(initial.clone()));
    let mut change = delta(
        2,
        &[(
            service_resource(2, "sig-2", &[("database", "sales"), ("table", "orders")]),
            &[(10, "PII")],
        )],
    );
    change
        .service_resources
        .insert(0, service_resource(1, "", &[("database", "sales")]));
    incremental.set_service_tags(Some(change));

    // path B: the merged state as one full snapshot
    let rebuilt = enricher_with(PluginConfig::default());
    rebuilt.set_service_tags(Some(snapshot(
        2,
        &[(
            service_resource(2, "sig-2", &[("database", "sales"), ("table", "orders")]),
            &[(10, "PII")],
        )],
    )));

    let a = incremental.enriched_service_tags().expect("snapshot installed");
    let b = rebuilt.enriched_service_tags().expect("snapshot installed");

    let ids = |snapshot: &rstag_enricher::EnrichedServiceTags| {
        let mut ids: Vec<i64> = snapshot
            .resource_matchers()
            .iter()
            .map(|m| m.resource_id())
            .collect();
        ids.sort_unstable();
        ids
    };
    assert_eq!(ids(&a), ids(&b));
    assert_eq!(
        a.service_tags().resource_to_tag_ids,
        b.service_tags().resource_to_tag_ids
    );
    assert_eq!(a.service_tags().tags, b.service_tags().tags);

    // per-dimension trie answers agree on a probe grid
    let tries_a = a.resource_trie().expect("tries");
    let tries_b = b.resource_trie().expect("tries");
    for (dimension, value) in [
        ("database", "sales"),
        ("database", "finance"),
        ("table", "orders"),
        ("table", "lineitems"),
        ("column", "ssn"),
    ] {
        let answer = |tries: &HashMap<String, rstag_domain::ResourceTrie>| {
            let mut ids: Vec<i64> = tries[dimension]
                .get_evaluators_for_resource(value, Default::default())
                .iter()
                .map(|m| m.resource_id())
                .collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(answer(tries_a), answer(tries_b), "dimension {dimension} value {value}");
    }

    // and enrichment agrees
    for (pairs, access) in [
        (&[("database", "sales"), ("table", "orders")][..], "select"),
        (&[("database", "sales")][..], "select"),
    ] {
        assert_eq!(
            enriched_tags(&incremental, pairs, access),
            enriched_tags(&rebuilt, pairs, access)
        );
    }
}

#[tokio::test]
async fn snapshot_install_invalidates_memoized_lookups() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    // this request takes the memoized self-or-ancestor path
    let probe: &[(&str, &str)] = &[("database", "sales"), ("table", "orders")];
    let found = enriched_tags(&enricher, probe, "select");
    assert_eq!(found, vec![("PII".to_string(), MatchType::Ancestor)]);

    // replace the snapshot with one where a different resource answers
    enricher.set_service_tags(Some(snapshot(
        2,
        &[(
            service_resource(2, "sig-2", &[("database", "sales"), ("table", "orders")]),
            &[(20, "PCI")],
        )],
    )));

    // a stale memo would still point at the dropped database-level matcher
    let found = enriched_tags(&enricher, probe, "select");
    assert_eq!(found, vec![("PCI".to_string(), MatchType::Exact)]);
}

#[tokio::test]
async fn rebuild_only_index_keeps_payload_but_replays_the_index() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));

    let mut change = delta(
        2,
        &[(service_resource(2, "sig-2", &[("database", "finance")]), &[(11, "PCI")])],
    );
    change
        .service_resources
        .insert(0, service_resource(1, "", &[("database", "sales")]));

    enricher.set_service_tags_opts(Some(change), true);

    // payload untouched
    let enriched = enricher.enriched_service_tags().expect("snapshot installed");
    assert_eq!(enriched.service_tags().tag_version, 1);
    assert_eq!(enriched.service_tags().service_resources.len(), 1);
    assert_eq!(enriched.service_tags().service_resources[0].id, 1);

    // index replayed: the old matcher is out, the new resource is indexed
    let tries = enriched.resource_trie().expect("tries");
    let lookup = |value: &str| -> Vec<i64> {
        tries["database"]
            .get_evaluators_for_resource(value, Default::default())
            .iter()
            .map(|m| m.resource_id())
            .collect()
    };
    assert!(lookup("sales").is_empty());
    assert_eq!(lookup("finance"), vec![2]);
}

// ============================================================
// Refresher and cache file
// ============================================================

#[tokio::test]
async fn initial_populate_installs_the_retrieved_snapshot() {
    let state = MockState::new(vec![Ok(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )))]);
    let enricher = TagEnricher::new(
        "dev_hive",
        "hive",
        hive_def(),
        options_with_mock(),
        PluginConfig::default(),
    )
    .expect("valid service def");

    enricher.init(&registry_for(&state)).await;

    assert_eq!(enricher.service_tags_version(), 1);
    assert_eq!(state.recorded_versions(), vec![-1]);

    let found = enriched_tags(&enricher, &[("database", "sales")], "select");
    assert_eq!(found, vec![("PII".to_string(), MatchType::Exact)]);

    enricher.pre_cleanup().await;
}

#[tokio::test]
async fn full_snapshot_is_persisted_to_the_cache_file() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let state = MockState::new(vec![Ok(Some(snapshot(
        3,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )))]);
    let enricher = TagEnricher::new(
        "dev_hive",
        "hive",
        hive_def(),
        options_with_mock(),
        PluginConfig::default().with_cache_dir(cache_dir.path()),
    )
    .expect("valid service def");

    enricher.init(&registry_for(&state)).await;

    let path = cache_file_path(cache_dir.path(), "hive", "dev_hive");
    let text = std::fs::read_to_string(&path).expect("cache file written");
    let persisted: ServiceTags = serde_json::from_str(&text).expect("cache file parses");

    assert_eq!(persisted.service_name, "dev_hive");
    assert_eq!(persisted.tag_version, 3);
    assert_eq!(persisted.service_resources.len(), 1);

    enricher.pre_cleanup().await;
}

#[tokio::test]
async fn first_run_without_upstream_change_falls_back_to_the_cache_file() {
    let cache_dir = tempfile::tempdir().expect("tempdir");

    // a payload persisted by some earlier instance, under a stale name
    let mut persisted = snapshot(
        5,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    );
    persisted.service_name = "other_service".to_string();
    let path = cache_file_path(cache_dir.path(), "hive", "dev_hive");
    std::fs::write(&path, serde_json::to_vec(&persisted).expect("serializes"))
        .expect("cache file seeded");

    let state = MockState::new(vec![Ok(None)]);
    let enricher = TagEnricher::new(
        "dev_hive",
        "hive",
        hive_def(),
        options_with_mock(),
        PluginConfig::default().with_cache_dir(cache_dir.path()),
    )
    .expect("valid service def");

    enricher.init(&registry_for(&state)).await;

    assert_eq!(enricher.service_tags_version(), 5);
    // the stale service name is overwritten, not rejected
    let enriched = enricher.enriched_service_tags().expect("snapshot installed");
    assert_eq!(enriched.service_tags().service_name, "dev_hive");

    let found = enriched_tags(&enricher, &[("database", "sales")], "select");
    assert_eq!(found, vec![("PII".to_string(), MatchType::Exact)]);

    enricher.pre_cleanup().await;
}

#[tokio::test]
async fn service_not_found_renames_cache_clears_tags_and_resets_version() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let state = MockState::new(vec![
        Ok(Some(snapshot(
            1,
            &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
        ))),
        Err(RetrieverError::ServiceNotFound {
            service_name: "dev_hive".to_string(),
        }),
        Ok(None),
    ]);
    let enricher = TagEnricher::new(
        "dev_hive",
        "hive",
        hive_def(),
        options_with_mock(),
        PluginConfig::default().with_cache_dir(cache_dir.path()),
    )
    .expect("valid service def");

    enricher.init(&registry_for(&state)).await;
    assert_eq!(enricher.service_tags_version(), 1);

    enricher.sync_tags_with_admin().await.expect("refresher running");

    // tags are gone
    assert_eq!(enricher.service_tags_version(), -1);
    assert!(enriched_tags(&enricher, &[("database", "sales")], "select").is_empty());

    // the cache file was renamed out of the way, not deleted
    let path = cache_file_path(cache_dir.path(), "hive", "dev_hive");
    assert!(!path.exists());
    let renamed = std::fs::read_dir(cache_dir.path())
        .expect("readable dir")
        .filter_map(Result::ok)
        .any(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("hive_dev_hive_tag.json_")
        });
    assert!(renamed, "renamed cache file exists");

    // the next retrieve starts over from version -1
    enricher.sync_tags_with_admin().await.expect("refresher running");
    assert_eq!(state.recorded_versions(), vec![-1, 1, -1]);

    enricher.pre_cleanup().await;
}

#[tokio::test]
async fn delta_through_refresher_persists_the_merged_payload() {
    let cache_dir = tempfile::tempdir().expect("tempdir");

    let mut change = delta(
        2,
        &[(
            service_resource(2, "sig-2", &[("database", "sales"), ("table", "orders")]),
            &[(10, "PII")],
        )],
    );
    change
        .service_resources
        .insert(0, service_resource(1, "", &[("database", "sales")]));

    let state = MockState::new(vec![
        Ok(Some(snapshot(
            1,
            &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
        ))),
        Ok(Some(change)),
    ]);
    let enricher = TagEnricher::new(
        "dev_hive",
        "hive",
        hive_def(),
        options_with_mock(),
        PluginConfig::default().with_cache_dir(cache_dir.path()),
    )
    .expect("valid service def");

    enricher.init(&registry_for(&state)).await;
    enricher.sync_tags_with_admin().await.expect("refresher running");

    assert_eq!(enricher.service_tags_version(), 2);

    // the cache file holds the merged full payload, not the delta
    let path = cache_file_path(cache_dir.path(), "hive", "dev_hive");
    let persisted: ServiceTags =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("cache file"))
            .expect("cache file parses");
    assert_eq!(persisted.tag_version, 2);
    assert!(!persisted.is_delta);
    assert_eq!(persisted.service_resources.len(), 1);
    assert_eq!(persisted.service_resources[0].id, 2);

    enricher.pre_cleanup().await;
}

#[tokio::test]
async fn aborted_delta_through_refresher_requests_full_download_next() {
    let state = MockState::new(vec![
        Ok(Some(snapshot(
            1,
            &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
        ))),
        Ok(Some(delta(
            2,
            &[(service_resource(3, "sig-3", &[("bucket", "b1")]), &[(12, "PII")])],
        ))),
        Ok(None),
    ]);
    let enricher = TagEnricher::new(
        "dev_hive",
        "hive",
        hive_def(),
        options_with_mock(),
        PluginConfig::default(),
    )
    .expect("valid service def");

    enricher.init(&registry_for(&state)).await;
    enricher.sync_tags_with_admin().await.expect("refresher running");

    // prior snapshot still serves
    assert_eq!(enricher.service_tags_version(), 1);
    let found = enriched_tags(&enricher, &[("database", "sales")], "select");
    assert_eq!(found, vec![("PII".to_string(), MatchType::Exact)]);

    // the aborted delta forced the next request back to version -1
    enricher.sync_tags_with_admin().await.expect("refresher running");
    assert_eq!(state.recorded_versions(), vec![-1, 1, -1]);

    enricher.pre_cleanup().await;
}

#[tokio::test]
async fn pre_cleanup_stops_the_refresher() {
    let state = MockState::new(vec![Ok(None)]);
    let enricher = TagEnricher::new(
        "dev_hive",
        "hive",
        hive_def(),
        options_with_mock(),
        PluginConfig::default(),
    )
    .expect("valid service def");

    enricher.init(&registry_for(&state)).await;
    enricher.pre_cleanup().await;

    assert!(enricher.sync_tags_with_admin().await.is_err());
}

#[tokio::test]
async fn auth_context_listener_fires_on_every_install() {
    let enricher = enricher_with(PluginConfig::default());
    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    let versions = Arc::clone(&seen);
    enricher.set_auth_context_listener(Box::new(move |snapshot| {
        versions
            .lock()
            .unwrap()
            .push(snapshot.map(|s| s.service_tags().tag_version).unwrap_or(-1));
    }));

    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));
    enricher.set_service_tags(None);

    assert_eq!(*seen.lock().unwrap(), vec![1, -1]);
}

#[tokio::test]
async fn enrich_with_evaluates_against_the_given_snapshot() {
    let enricher = enricher_with(PluginConfig::default());
    enricher.set_service_tags(Some(snapshot(
        1,
        &[(service_resource(1, "sig-1", &[("database", "sales")]), &[(10, "PII")])],
    )));
    let old = enricher.enriched_service_tags().expect("snapshot installed");

    enricher.set_service_tags(Some(snapshot(
        2,
        &[(service_resource(2, "sig-2", &[("database", "finance")]), &[(11, "PCI")])],
    )));

    // the held snapshot still answers as it did when it was current
    let mut req = request(&[("database", "sales")], "select");
    enricher.enrich_with(&mut req, Some(&old));
    let tags = rstag_domain::get_request_tags_from_context(&req.context).expect("tags attached");
    assert_eq!(tags.iter().next().map(|t| t.tag_type.as_str()), Some("PII"));

    // while the current snapshot answers with the replacement
    let found = enriched_tags(&enricher, &[("database", "finance")], "select");
    assert_eq!(found, vec![("PCI".to_string(), MatchType::Exact)]);
}

#[tokio::test]
async fn missing_retriever_leaves_the_enricher_serving_empty_enrichment() {
    let enricher = TagEnricher::new(
        "dev_hive",
        "hive",
        hive_def(),
        EnricherOptions::default().with_retriever("unregistered"),
        PluginConfig::default(),
    )
    .expect("valid service def");

    enricher.init(&RetrieverRegistry::new()).await;

    assert!(enricher.sync_tags_with_admin().await.is_err());
    assert!(enriched_tags(&enricher, &[("database", "sales")], "select").is_empty());
}
