//! The tag enricher engine.
//!
//! Owns the current enriched snapshot and serves `enrich` from it under
//! the read lock; installs full payloads and deltas under the write lock;
//! drives the background refresher and the polling timer.
//!
//! # Publication discipline
//!
//! The snapshot lives behind an atomic pointer swap. With locking
//! disabled, writers never mutate a published snapshot: they build (or
//! copy-on-write) a fresh one and swap it in, so lock-free readers always
//! observe a consistent bundle. With locking enabled, the write lock
//! excludes readers and the writer may reclaim the installed index and
//! mutate it in place.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rstag_domain::model::apply_delta;
use rstag_domain::resource::{collect_evaluators, set_request_tags_in_context};
use rstag_domain::{
    AccessRequest, AccessResource, DomainResult, MatchType, PolicyType, ResourceHierarchies,
    ResourceMatchingScope, ResourceTrie, ServiceDef, ServiceDefHelper, ServiceResource,
    ServiceResourceMatcher, ServiceTags, TagForEval, TagsChangeExtent,
};

use crate::cache::CachedResourceEvaluators;
use crate::config::{cache_file_path, EnricherOptions, PluginConfig};
use crate::enriched::EnrichedServiceTags;
use crate::error::EnricherError;
use crate::lock::TagLock;
use crate::refresher::{DownloadTrigger, TagRefresher};
use crate::retriever::{RetrieverInitContext, RetrieverRegistry};

/// Callback invoked after every snapshot install, with the snapshot that
/// is now current.
pub type AuthContextListener = Box<dyn Fn(Option<Arc<EnrichedServiceTags>>) + Send + Sync>;

const TRIGGER_QUEUE_CAPACITY: usize = 64;

struct RefresherRuntime {
    trigger_tx: mpsc::Sender<DownloadTrigger>,
    shutdown_tx: watch::Sender<bool>,
    refresher: JoinHandle<()>,
    timer: JoinHandle<()>,
}

/// Per-service tag-context enricher.
pub struct TagEnricher {
    service_name: String,
    app_id: String,
    service_def: Arc<ServiceDef>,
    def_helper: Arc<ServiceDefHelper>,
    options: EnricherOptions,
    plugin_config: PluginConfig,
    lock: TagLock,
    enriched: ArcSwapOption<EnrichedServiceTags>,
    evaluator_cache: CachedResourceEvaluators,
    auth_context_listener: Mutex<Option<AuthContextListener>>,
    runtime: Mutex<Option<RefresherRuntime>>,
    /// Handed to the refresher so a forgotten `pre_cleanup` cannot keep the
    /// enricher alive through its own background task.
    weak_self: Weak<TagEnricher>,
}

impl TagEnricher {
    pub fn new(
        service_name: impl Into<String>,
        app_id: impl Into<String>,
        service_def: Arc<ServiceDef>,
        options: EnricherOptions,
        plugin_config: PluginConfig,
    ) -> DomainResult<Arc<Self>> {
        let def_helper = Arc::new(ServiceDefHelper::new(Arc::clone(&service_def))?);
        let use_lock = plugin_config.use_read_write_lock();

        info!(
            locking = use_lock,
            "tag enricher will {}use read-write locking to update tags in place",
            if use_lock { "" } else { "not " }
        );

        let service_name = service_name.into();
        let app_id = app_id.into();

        Ok(Arc::new_cyclic(|weak_self| Self {
            service_name,
            app_id,
            service_def,
            def_helper,
            options,
            plugin_config,
            lock: TagLock::new(use_lock),
            enriched: ArcSwapOption::empty(),
            evaluator_cache: CachedResourceEvaluators::new(),
            auth_context_listener: Mutex::new(None),
            runtime: Mutex::new(None),
            weak_self: weak_self.clone(),
        }))
    }

    /// Instantiates the configured retriever, performs the initial
    /// populate, then starts the refresher task and the polling timer.
    ///
    /// A missing or failing retriever is logged; the enricher then serves
    /// empty enrichment rather than failing requests.
    pub async fn init(&self, registry: &RetrieverRegistry) {
        debug!(service = %self.service_name, "initializing tag enricher");

        let retriever_name = self.options.tag_retriever_name.clone();
        if retriever_name.is_empty() {
            error!("no tag retriever configured for the tag enricher; tags will not be downloaded");
            return;
        }

        let Some(mut retriever) = registry.create(&retriever_name) else {
            error!(
                retriever = %retriever_name,
                "tag retriever not found in registry; tags will not be downloaded"
            );
            return;
        };

        let context = RetrieverInitContext {
            service_name: self.service_name.clone(),
            service_def: Arc::clone(&self.service_def),
            app_id: self.app_id.clone(),
            plugin_config: self.plugin_config.clone(),
            options: self.options.retriever_options.clone(),
        };
        if let Err(error) = retriever.init(&context) {
            error!(
                retriever = %retriever_name,
                %error,
                "tag retriever failed to initialize; tags will not be downloaded"
            );
            return;
        }

        let cache_file = self
            .plugin_config
            .policy_cache_dir
            .as_deref()
            .map(|dir| cache_file_path(dir, &self.app_id, &self.service_name));

        let mut refresher = TagRefresher::new(
            retriever,
            self.weak_self.clone(),
            self.service_name.clone(),
            cache_file,
            self.plugin_config.disable_cache_if_service_not_found,
        );

        // initial synchronous populate, so the first request sees a
        // populated snapshot; a failure is logged without preventing service
        refresher.populate_tags().await;

        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let refresher_handle = tokio::spawn(refresher.run(trigger_rx, shutdown_rx));
        let timer_handle = tokio::spawn(Self::run_trigger_timer(
            trigger_tx.clone(),
            Duration::from_millis(self.options.polling_interval_ms),
        ));

        let mut runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *runtime = Some(RefresherRuntime {
            trigger_tx,
            shutdown_tx,
            refresher: refresher_handle,
            timer: timer_handle,
        });

        info!(
            service = %self.service_name,
            polling_interval_ms = self.options.polling_interval_ms,
            "tag refresher scheduled"
        );
    }

    async fn run_trigger_timer(trigger_tx: mpsc::Sender<DownloadTrigger>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately; init already populated
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let (trigger, _completion) = DownloadTrigger::new();
            if trigger_tx.send(trigger).await.is_err() {
                break;
            }
        }
    }

    /// Attaches the tags matching the request's resource to its context.
    /// Never fails; an empty or missing snapshot yields no tags.
    pub fn enrich(&self, request: &mut AccessRequest) {
        self.enrich_with(request, None);
    }

    /// Like [`enrich`](Self::enrich), but evaluating against the given
    /// snapshot instead of the enricher's current one.
    pub fn enrich_with(
        &self,
        request: &mut AccessRequest,
        data_store: Option<&Arc<EnrichedServiceTags>>,
    ) {
        let _read = self.lock.read();

        let snapshot = match data_store {
            Some(snapshot) => Some(Arc::clone(snapshot)),
            None => self.enriched.load_full(),
        };

        let matched = snapshot
            .as_ref()
            .map(|snapshot| self.find_matching_tags(request, snapshot));

        set_request_tags_in_context(&mut request.context, matched);
    }

    /// Installs a payload; `None` clears the snapshot. Returns the
    /// effective version: the payload's version, or `-1` when cleared or
    /// when a delta was aborted (forcing a full redownload next round).
    pub fn set_service_tags(&self, service_tags: Option<ServiceTags>) -> i64 {
        self.set_service_tags_opts(service_tags, false)
    }

    /// `rebuild_only_index` keeps the prior payload verbatim and only
    /// replays the delta's resource list against the index.
    pub fn set_service_tags_opts(
        &self,
        service_tags: Option<ServiceTags>,
        rebuild_only_index: bool,
    ) -> i64 {
        let write = self.lock.write();
        if write.is_locking_enabled() {
            debug!("acquired write lock for snapshot install");
        }

        let effective_version = match service_tags {
            None => {
                info!(service = %self.service_name, "service tags are empty; clearing snapshot");
                self.enriched.store(None);
                -1
            }
            Some(mut service_tags) => {
                if self.plugin_config.dedup_strings {
                    service_tags.normalize();
                }

                if !service_tags.is_delta {
                    if service_tags.is_tags_deduped {
                        let removed = service_tags.dedup_tags();
                        info!(
                            removed,
                            remaining = service_tags.tags.len(),
                            "removed duplicate tags from received service tags"
                        );
                    }
                    let version = service_tags.tag_version;
                    self.process_service_tags(service_tags);
                    version
                } else {
                    debug!(
                        version = service_tags.tag_version,
                        extent = ?service_tags.tags_change_extent,
                        "received service-tags delta"
                    );
                    self.process_delta(&service_tags, rebuild_only_index)
                }
            }
        };

        self.notify_auth_context_changed();
        self.evaluator_cache.clear();

        effective_version
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Version of the currently installed payload, `-1` when none.
    pub fn service_tags_version(&self) -> i64 {
        self.enriched
            .load_full()
            .map(|enriched| enriched.service_tags().tag_version)
            .unwrap_or(-1)
    }

    /// Version the resource index was last (re)built at, `-1` when none.
    pub fn resource_trie_version(&self) -> i64 {
        self.enriched
            .load_full()
            .map(|enriched| enriched.resource_trie_version())
            .unwrap_or(-1)
    }

    pub fn enriched_service_tags(&self) -> Option<Arc<EnrichedServiceTags>> {
        self.enriched.load_full()
    }

    /// Registers the callback notified after every snapshot install.
    pub fn set_auth_context_listener(&self, listener: AuthContextListener) {
        let mut slot = self
            .auth_context_listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(listener);
    }

    /// Enqueues a refresh trigger and blocks until the refresher has
    /// processed it.
    pub async fn sync_tags_with_admin(&self) -> Result<(), EnricherError> {
        let trigger_tx = {
            let runtime = self
                .runtime
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            runtime.as_ref().map(|rt| rt.trigger_tx.clone())
        };
        let Some(trigger_tx) = trigger_tx else {
            return Err(EnricherError::RefresherNotRunning);
        };

        let (trigger, completion) = DownloadTrigger::new();
        trigger_tx
            .send(trigger)
            .await
            .map_err(|_| EnricherError::RefresherNotRunning)?;

        // a dropped trigger also resolves the handle
        let _ = completion.await;
        Ok(())
    }

    /// Cancels the polling timer, interrupts the refresher and joins both.
    pub async fn pre_cleanup(&self) {
        debug!(service = %self.service_name, "cleaning up tag enricher");

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(runtime) = runtime else {
            return;
        };

        runtime.timer.abort();
        let _ = runtime.shutdown_tx.send(true);
        drop(runtime.trigger_tx);

        if let Err(error) = runtime.refresher.await {
            if !error.is_cancelled() {
                warn!(%error, "tag refresher task ended abnormally");
            }
        }
        let _ = runtime.timer.await;

        debug!(service = %self.service_name, "tag enricher cleaned up");
    }

    // ---- write path ----------------------------------------------------

    /// Full replacement: one matcher per service resource (dropping
    /// resources no policy type admits, with their tag associations) and a
    /// fresh per-dimension trie map.
    fn process_service_tags(&self, mut service_tags: ServiceTags) {
        if service_tags.service_resources.is_empty() {
            info!(service = %self.service_name, "no tagged resources for service");
            self.enriched.store(None);
            return;
        }

        let mut hierarchies = ResourceHierarchies::default();
        let mut matchers: Vec<Arc<ServiceResourceMatcher>> = Vec::new();

        let resources = std::mem::take(&mut service_tags.service_resources);
        let mut kept = Vec::with_capacity(resources.len());

        for resource in resources {
            match ServiceResourceMatcher::build(&resource, &self.def_helper, &mut hierarchies) {
                Some(matcher) => {
                    matchers.push(Arc::new(matcher));
                    kept.push(resource);
                }
                None => {
                    let dropped_tags = service_tags
                        .resource_to_tag_ids
                        .remove(&resource.id)
                        .map(|ids| ids.len())
                        .unwrap_or(0);
                    warn!(
                        resource_id = resource.id,
                        dropped_tags,
                        "failed to create resource matcher; ignoring resource and its tags"
                    );
                }
            }
        }
        service_tags.service_resources = kept;

        let resource_trie = if self.options.disable_trie_lookup_prefilter {
            None
        } else {
            Some(
                self.service_def
                    .resources
                    .iter()
                    .map(|def| (def.name.clone(), ResourceTrie::new(def, &matchers)))
                    .collect(),
            )
        };

        self.enriched.store(Some(Arc::new(EnrichedServiceTags::new(
            service_tags,
            matchers,
            resource_trie,
        ))));
    }

    /// Delta branch of the install protocol. Returns the effective
    /// version (`-1` when the delta was aborted).
    fn process_delta(&self, delta: &ServiceTags, rebuild_only_index: bool) -> i64 {
        let prior = self.enriched.load_full();

        let all_service_tags = {
            let empty = ServiceTags::default();
            let old_payload = prior
                .as_ref()
                .map(|enriched| enriched.service_tags())
                .unwrap_or(&empty);

            if rebuild_only_index {
                old_payload.clone()
            } else {
                apply_delta(old_payload, delta, delta.is_tags_deduped)
            }
        };

        match delta.tags_change_extent {
            TagsChangeExtent::None => {
                debug!("no change to service tags other than version");
                delta.tag_version
            }
            TagsChangeExtent::Tags => {
                debug!("delta contains only tag attribute changes");
                let next = match prior.as_deref() {
                    Some(prior) => EnrichedServiceTags::reusing_index(all_service_tags, prior),
                    None => EnrichedServiceTags::new(
                        all_service_tags,
                        Vec::new(),
                        self.fresh_trie_map(),
                    ),
                };
                self.enriched.store(Some(Arc::new(next)));
                delta.tag_version
            }
            TagsChangeExtent::ServiceResources | TagsChangeExtent::All => {
                drop(prior);
                self.process_service_tag_deltas(delta, all_service_tags)
            }
        }
    }

    /// Applies a resource-changing delta. The delta is validated in full
    /// before any mutation, so an abort leaves the prior snapshot and its
    /// `enrich` answers untouched.
    fn process_service_tag_deltas(&self, delta: &ServiceTags, all_service_tags: ServiceTags) -> i64 {
        let mut hierarchies = ResourceHierarchies::default();
        let mut built: HashMap<i64, Arc<ServiceResourceMatcher>> = HashMap::new();

        for resource in &delta.service_resources {
            if resource.is_deleted() {
                continue;
            }
            match ServiceResourceMatcher::build(resource, &self.def_helper, &mut hierarchies) {
                Some(matcher) => {
                    built.insert(resource.id, Arc::new(matcher));
                }
                None => {
                    error!(
                        resource_id = resource.id,
                        "could not create resource matcher for delta resource; \
                         keeping previous tags and forcing a full tag download"
                    );
                    return -1;
                }
            }
        }

        {
            // deletions run against the prior index; every dimension must
            // be covered before any of them may proceed
            let prior = self.enriched.load_full();
            if let Some(tries) = prior.as_ref().and_then(|enriched| enriched.resource_trie()) {
                for def in &self.service_def.resources {
                    if !tries.contains_key(&def.name) {
                        error!(
                            dimension = %def.name,
                            "no resource trie for dimension; \
                             keeping previous tags and forcing a full tag download"
                        );
                        return -1;
                    }
                }
            }
        }

        let (mut matchers, mut trie_map) = self.take_working_parts();

        for resource in &delta.service_resources {
            if !resource.resource_elements.is_empty() {
                self.remove_old_service_resource(resource, &mut matchers, &mut trie_map);
            }

            if resource.is_deleted() {
                debug!(
                    resource_id = resource.id,
                    "service resource deleted; resource signature is empty"
                );
                continue;
            }

            let Some(matcher) = built.remove(&resource.id) else {
                continue;
            };

            if let Some(tries) = trie_map.as_mut() {
                for def in &self.service_def.resources {
                    let policy_resource = resource.resource_elements.get(&def.name);
                    match tries.get_mut(&def.name) {
                        Some(trie) => {
                            trie.add(policy_resource, &matcher);
                            trie.wrap_up_update();
                        }
                        None => {
                            tries.insert(
                                def.name.clone(),
                                ResourceTrie::new(def, std::slice::from_ref(&matcher)),
                            );
                        }
                    }
                }
            }
            matchers.push(matcher);
        }

        if let Some(tries) = trie_map.as_mut() {
            for trie in tries.values_mut() {
                trie.wrap_up_update();
            }
        }

        let version = all_service_tags.tag_version;
        self.enriched.store(Some(Arc::new(EnrichedServiceTags::new(
            all_service_tags,
            matchers,
            trie_map,
        ))));
        version
    }

    /// Hands the writer a matcher list and trie map to mutate. With
    /// locking enabled the installed snapshot is reclaimed and its index
    /// mutated in place when no other reference remains; otherwise the
    /// tries are deep-copied so racing readers stay unaffected.
    fn take_working_parts(
        &self,
    ) -> (
        Vec<Arc<ServiceResourceMatcher>>,
        Option<HashMap<String, ResourceTrie>>,
    ) {
        if self.lock.is_locking_enabled() {
            match self.enriched.swap(None) {
                Some(snapshot) => {
                    let (matchers_arc, trie_arc) = match Arc::try_unwrap(snapshot) {
                        Ok(owned) => {
                            let (_, matchers, tries) = owned.into_parts();
                            (matchers, tries)
                        }
                        Err(shared) => (shared.matchers_arc(), shared.trie_arc()),
                    };

                    let matchers = match Arc::try_unwrap(matchers_arc) {
                        Ok(matchers) => matchers,
                        Err(shared) => (*shared).clone(),
                    };
                    let tries = trie_arc.map(|arc| match Arc::try_unwrap(arc) {
                        Ok(tries) => tries,
                        Err(shared) => (*shared).clone(),
                    });

                    (matchers, tries)
                }
                None => (Vec::new(), self.fresh_trie_map()),
            }
        } else {
            match self.enriched.load_full() {
                Some(snapshot) => (
                    snapshot.resource_matchers().to_vec(),
                    snapshot.resource_trie().cloned(),
                ),
                None => (Vec::new(), self.fresh_trie_map()),
            }
        }
    }

    fn fresh_trie_map(&self) -> Option<HashMap<String, ResourceTrie>> {
        if self.options.disable_trie_lookup_prefilter {
            None
        } else {
            Some(HashMap::new())
        }
    }

    /// Finds the matchers indexed for exactly this service resource's
    /// values and removes them from the tries and the matcher list.
    /// Resources never indexed delete trivially.
    fn remove_old_service_resource(
        &self,
        service_resource: &ServiceResource,
        matchers: &mut Vec<Arc<ServiceResourceMatcher>>,
        trie_map: &mut Option<HashMap<String, ResourceTrie>>,
    ) {
        let values: HashMap<String, Vec<String>> = service_resource
            .resource_elements
            .iter()
            .map(|(dimension, policy)| (dimension.clone(), policy.values.clone()))
            .collect();
        let access_resource = AccessResource::new(&self.service_def, values);
        let scopes = BTreeMap::new();

        let candidates = match trie_map.as_ref() {
            Some(tries) => collect_evaluators(tries, &access_resource, &scopes, None),
            None => matchers.clone(),
        };

        // only an exact match identifies the old indexed entry; ancestors
        // and descendants of the changed resource stay indexed
        let exact: Vec<Arc<ServiceResourceMatcher>> = candidates
            .into_iter()
            .filter(|matcher| matcher.match_type(&access_resource, &scopes) == MatchType::Exact)
            .collect();

        if exact.is_empty() {
            return;
        }

        if let Some(tries) = trie_map.as_mut() {
            for matcher in &exact {
                for def in &self.service_def.resources {
                    if let Some(trie) = tries.get_mut(&def.name) {
                        trie.delete(service_resource.resource_elements.get(&def.name), matcher);
                    }
                }
            }
        }

        matchers.retain(|matcher| !exact.iter().any(|old| Arc::ptr_eq(old, matcher)));

        debug!(
            resource_id = service_resource.id,
            removed = exact.len(),
            "removed matchers for changed service resource"
        );
    }

    fn notify_auth_context_changed(&self) {
        let listener = self
            .auth_context_listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(listener) = listener.as_ref() {
            listener(self.enriched.load_full());
        }
    }

    // ---- read path -----------------------------------------------------

    fn find_matching_tags(
        &self,
        request: &AccessRequest,
        snapshot: &EnrichedServiceTags,
    ) -> HashSet<TagForEval> {
        if request.resource.is_empty() && request.is_access_type_any() {
            return snapshot.tags_for_empty_resource_and_any_access().clone();
        }

        let evaluators = self.get_evaluators(request, snapshot);
        let mut matched = HashSet::new();

        for matcher in evaluators.iter() {
            let match_type = matcher.match_type(
                &request.resource,
                &request.resource_element_matching_scopes,
            );

            let is_matched = if request.is_access_type_any()
                || request.resource_matching_scope == ResourceMatchingScope::SelfOrDescendants
            {
                match_type != MatchType::None
            } else {
                matches!(
                    match_type,
                    MatchType::Exact | MatchType::ExactAndAllDescendants | MatchType::Ancestor
                )
            };

            if is_matched {
                collect_tags_for_resource(
                    request,
                    snapshot.service_tags(),
                    matcher.resource_id(),
                    match_type,
                    &mut matched,
                );
            }
        }

        matched
    }

    /// Candidate matchers for a request: all matchers when the resource is
    /// empty or the pre-filter is off, a (possibly memoized) trie
    /// intersection otherwise.
    fn get_evaluators(
        &self,
        request: &AccessRequest,
        snapshot: &EnrichedServiceTags,
    ) -> Arc<Vec<Arc<ServiceResourceMatcher>>> {
        let resource = &request.resource;

        let Some(tries) = snapshot.resource_trie() else {
            return snapshot.matchers_arc();
        };
        if resource.is_empty() {
            return snapshot.matchers_arc();
        }

        let leaf_def = if self.exclude_descendant_matches(request) {
            resource
                .leaf_name()
                .and_then(|leaf| self.def_helper.resource_def(leaf))
                .cloned()
        } else {
            None
        };

        if leaf_def.is_some() {
            if let Some(cached) = self
                .evaluator_cache
                .get(resource.cache_key(), &request.resource_element_matching_scopes)
            {
                return cached;
            }
        }

        let found = match &leaf_def {
            Some(leaf) => {
                let predicate = |matcher: &ServiceResourceMatcher| {
                    matcher.is_leaf(&leaf.name) || matcher.is_ancestor_of(leaf)
                };
                collect_evaluators(
                    tries,
                    resource,
                    &request.resource_element_matching_scopes,
                    Some(&predicate),
                )
            }
            None => collect_evaluators(
                tries,
                resource,
                &request.resource_element_matching_scopes,
                None,
            ),
        };

        debug!(
            count = found.len(),
            resource = resource.cache_key(),
            "found candidate matchers by trie lookup"
        );

        let found = Arc::new(found);
        if leaf_def.is_some() {
            self.evaluator_cache.insert(
                resource.cache_key().to_string(),
                request.resource_element_matching_scopes.clone(),
                Arc::clone(&found),
            );
        }
        found
    }

    /// Whether the read path may narrow to self-or-ancestor matches: true
    /// for a concrete access whose resource either fits several
    /// hierarchies or stops short of its single hierarchy's leaf.
    fn exclude_descendant_matches(&self, request: &AccessRequest) -> bool {
        if request.is_access_type_any() {
            return false;
        }
        let Some(leaf_name) = request.resource.leaf_name() else {
            return false;
        };

        // only populated dimensions count toward the applicable
        // hierarchies; an empty value list does not place the resource on
        // a dimension, mirroring how the leaf name is derived
        let populated_keys = request
            .resource
            .as_map()
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(dimension, _)| dimension.as_str());

        let applicable = self
            .def_helper
            .hierarchies_for_keys(PolicyType::Access, populated_keys);

        if applicable.len() == 1 {
            applicable[0].last().map(String::as_str) != Some(leaf_name)
        } else {
            true
        }
    }
}

impl std::fmt::Debug for TagEnricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagEnricher")
            .field("service_name", &self.service_name)
            .field("app_id", &self.app_id)
            .field("service_tags_version", &self.service_tags_version())
            .finish()
    }
}

fn collect_tags_for_resource(
    request: &AccessRequest,
    service_tags: &ServiceTags,
    resource_id: i64,
    match_type: MatchType,
    out: &mut HashSet<TagForEval>,
) {
    let Some(tag_ids) = service_tags.resource_to_tag_ids.get(&resource_id) else {
        debug!(resource_id, "no tag mapping for resource");
        return;
    };

    let access_time = request.access_time.unwrap_or_else(Utc::now);

    for tag_id in tag_ids {
        if let Some(tag) = service_tags.tags.get(tag_id) {
            let tag_for_eval = TagForEval::new(tag, match_type);
            if tag_for_eval.is_applicable(access_time) {
                out.insert(tag_for_eval);
            }
        }
    }
}
