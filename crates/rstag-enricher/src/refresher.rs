//! Background refresher: pulls service tags, feeds the enricher and keeps
//! the local cache file current.
//!
//! The refresher is a task blocking on a trigger channel. A timer task
//! feeds the channel on the polling interval; `sync_tags_with_admin`
//! enqueues an extra trigger and awaits its completion handle.

use std::path::PathBuf;
use std::sync::Weak;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use rstag_domain::ServiceTags;

use crate::enricher::TagEnricher;
use crate::error::RetrieverError;
use crate::retriever::TagRetriever;

/// A one-shot wake-up for the refresher, carrying a completion signal.
///
/// Dropping the trigger without an explicit signal also resolves the
/// completion handle, so abandoned triggers never strand a waiter.
#[derive(Debug)]
pub struct DownloadTrigger {
    completion: Option<oneshot::Sender<()>>,
}

impl DownloadTrigger {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (completion, handle) = oneshot::channel();
        (
            Self {
                completion: Some(completion),
            },
            handle,
        )
    }

    pub fn signal_completion(mut self) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(());
        }
    }
}

pub(crate) struct TagRefresher {
    retriever: Box<dyn TagRetriever>,
    enricher: Weak<TagEnricher>,
    service_name: String,
    cache_file: Option<PathBuf>,
    disable_cache_if_service_not_found: bool,
    last_known_version: i64,
    last_activation_time_ms: i64,
    has_provided_tags_to_receiver: bool,
}

impl TagRefresher {
    pub(crate) fn new(
        retriever: Box<dyn TagRetriever>,
        enricher: Weak<TagEnricher>,
        service_name: String,
        cache_file: Option<PathBuf>,
        disable_cache_if_service_not_found: bool,
    ) -> Self {
        Self {
            retriever,
            enricher,
            service_name,
            cache_file,
            disable_cache_if_service_not_found,
            last_known_version: -1,
            last_activation_time_ms: 0,
            has_provided_tags_to_receiver: false,
        }
    }

    /// Trigger loop. Exits on shutdown signal or when every trigger sender
    /// is gone; each processed trigger is signalled even when the refresh
    /// itself failed.
    pub(crate) async fn run(
        mut self,
        mut triggers: mpsc::Receiver<DownloadTrigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(service = %self.service_name, "tag refresher started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(service = %self.service_name, "tag refresher interrupted; exiting");
                        break;
                    }
                }
                trigger = triggers.recv() => {
                    match trigger {
                        Some(trigger) => {
                            self.populate_tags().await;
                            trigger.signal_completion();
                        }
                        None => {
                            info!(service = %self.service_name, "trigger queue closed; tag refresher exiting");
                            break;
                        }
                    }
                }
            }
        }

        debug!(service = %self.service_name, "tag refresher stopped");
    }

    /// One refresh round: retrieve, fall back to the cache file on first
    /// run, install, persist. Failures are logged and swallowed so the
    /// next trigger retries.
    pub(crate) async fn populate_tags(&mut self) {
        let Some(enricher) = self.enricher.upgrade() else {
            return;
        };

        match self
            .retriever
            .retrieve_tags(self.last_known_version, self.last_activation_time_ms)
            .await
        {
            Ok(retrieved) => {
                let service_tags = match retrieved {
                    Some(service_tags) => {
                        if !service_tags.is_delta {
                            self.save_to_cache(&service_tags).await;
                        }
                        Some(service_tags)
                    }
                    None if !self.has_provided_tags_to_receiver => self.load_from_cache().await,
                    None => None,
                };

                match service_tags {
                    Some(service_tags) => {
                        let is_delta = service_tags.is_delta;
                        let effective_version = enricher.set_service_tags(Some(service_tags));

                        if is_delta && effective_version != -1 {
                            if let Some(enriched) = enricher.enriched_service_tags() {
                                self.save_to_cache(enriched.service_tags()).await;
                            }
                        }

                        info!(
                            service = %self.service_name,
                            last_known_version = self.last_known_version,
                            new_version = effective_version,
                            "updated tags to new version"
                        );

                        self.has_provided_tags_to_receiver = true;
                        self.last_known_version = effective_version;
                        self.last_activation_time_ms = Utc::now().timestamp_millis();
                    }
                    None => {
                        debug!(
                            service = %self.service_name,
                            last_known_version = self.last_known_version,
                            "no tag update needed"
                        );
                    }
                }
            }
            Err(RetrieverError::ServiceNotFound { .. }) => {
                error!(service = %self.service_name, "service not found upstream");

                if self.disable_cache_if_service_not_found {
                    self.disable_cache().await;
                    enricher.set_service_tags(None);
                    self.last_known_version = -1;
                    self.last_activation_time_ms = Utc::now().timestamp_millis();
                }
            }
            Err(error) => {
                error!(
                    service = %self.service_name,
                    %error,
                    "unexpected error while retrieving tags; ignoring"
                );
            }
        }
    }

    /// Loads the last persisted payload. A service-name mismatch is
    /// tolerated: the field is overwritten and a warning logged. An
    /// unreadable or unparseable file counts as absent.
    async fn load_from_cache(&self) -> Option<ServiceTags> {
        let Some(path) = &self.cache_file else {
            return None;
        };

        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(error) => {
                warn!(
                    cache_file = %path.display(),
                    %error,
                    "tags cache file does not exist or is not readable"
                );
                return None;
            }
        };

        match serde_json::from_str::<ServiceTags>(&text) {
            Ok(mut service_tags) => {
                if service_tags.service_name != self.service_name {
                    warn!(
                        cache_file = %path.display(),
                        unexpected = %service_tags.service_name,
                        "ignoring unexpected service name in tags cache file"
                    );
                    service_tags.service_name = self.service_name.clone();
                }
                Some(service_tags)
            }
            Err(error) => {
                error!(
                    cache_file = %path.display(),
                    %error,
                    "failed to load service tags from cache file"
                );
                None
            }
        }
    }

    async fn save_to_cache(&self, service_tags: &ServiceTags) {
        let Some(path) = &self.cache_file else {
            return;
        };

        match serde_json::to_vec(service_tags) {
            Ok(document) => {
                if let Err(error) = tokio::fs::write(path, document).await {
                    error!(
                        cache_file = %path.display(),
                        %error,
                        "failed to save service tags to cache file"
                    );
                }
            }
            Err(error) => {
                error!(
                    cache_file = %path.display(),
                    %error,
                    "failed to serialize service tags for cache file"
                );
            }
        }
    }

    /// Renames the cache file out of the way so a later restart cannot
    /// resurrect tags for a deleted service.
    async fn disable_cache(&self) {
        let Some(path) = &self.cache_file else {
            return;
        };

        if tokio::fs::metadata(path).await.is_err() {
            debug!(service = %self.service_name, "no local tags cache found; nothing to disable");
            return;
        }

        warn!(service = %self.service_name, "cleaning up local tags cache");

        let renamed = PathBuf::from(format!(
            "{}_{}",
            path.display(),
            Utc::now().timestamp_millis()
        ));

        match tokio::fs::rename(path, &renamed).await {
            Ok(()) => warn!(
                from = %path.display(),
                to = %renamed.display(),
                "moved tags cache file"
            ),
            Err(error) => error!(
                from = %path.display(),
                to = %renamed.display(),
                %error,
                "failed to move tags cache file"
            ),
        }
    }
}
