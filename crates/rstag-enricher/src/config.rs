//! Enricher options and plugin configuration.
//!
//! Option keys follow the enricher-definition document the plugin is
//! deployed with (camelCase), plugin keys follow the plugin's property
//! file (dotted, rendered here as a struct). Field defaults match the
//! deployed defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Options taken from the enricher definition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EnricherOptions {
    /// Registry name of the retriever implementation. Required; with no
    /// retriever the enricher serves empty enrichment.
    #[serde(rename = "tagRetrieverClassName", default)]
    pub tag_retriever_name: String,

    /// Poll interval for the background refresher, in milliseconds.
    #[serde(rename = "tagRefresherPollingInterval", default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Disables the per-dimension trie pre-filter; every lookup then
    /// considers all matchers.
    #[serde(rename = "disableTrieLookupPrefilter", default)]
    pub disable_trie_lookup_prefilter: bool,

    /// Options passed through to the retriever's `init`.
    #[serde(default)]
    pub retriever_options: HashMap<String, String>,
}

impl Default for EnricherOptions {
    fn default() -> Self {
        Self {
            tag_retriever_name: String::new(),
            polling_interval_ms: default_polling_interval_ms(),
            disable_trie_lookup_prefilter: false,
            retriever_options: HashMap::new(),
        }
    }
}

impl EnricherOptions {
    pub fn with_retriever(mut self, name: impl Into<String>) -> Self {
        self.tag_retriever_name = name.into();
        self
    }

    pub fn with_polling_interval_ms(mut self, interval_ms: u64) -> Self {
        self.polling_interval_ms = interval_ms;
        self
    }

    pub fn with_trie_prefilter_disabled(mut self, disabled: bool) -> Self {
        self.disable_trie_lookup_prefilter = disabled;
        self
    }
}

/// Plugin-level configuration the enricher reads.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Normalize incoming payloads (`<prefix>.dedup.strings`).
    #[serde(default = "default_true")]
    pub dedup_strings: bool,

    /// Invalidate the cache file when the service disappears upstream
    /// (`<prefix>.disable.cache.if.servicenotfound`).
    #[serde(default = "default_true")]
    pub disable_cache_if_service_not_found: bool,

    /// Directory for the tag cache file (`<prefix>.policy.cache.dir`).
    /// With no directory, no cache file is read or written.
    #[serde(default)]
    pub policy_cache_dir: Option<PathBuf>,

    /// Whether the tag source may deliver deltas
    /// (`<prefix>.tag.delta.enabled`).
    #[serde(default)]
    pub tag_delta_enabled: bool,

    /// Whether deltas may mutate the index in place under the write lock
    /// (`<prefix>.in.place.tag.update.enabled`).
    #[serde(default)]
    pub in_place_tag_update_enabled: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            dedup_strings: true,
            disable_cache_if_service_not_found: true,
            policy_cache_dir: None,
            tag_delta_enabled: false,
            in_place_tag_update_enabled: false,
        }
    }
}

impl PluginConfig {
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.policy_cache_dir = Some(dir.into());
        self
    }

    pub fn with_deltas(mut self, deltas: bool, in_place: bool) -> Self {
        self.tag_delta_enabled = deltas;
        self.in_place_tag_update_enabled = in_place;
        self
    }

    pub fn with_dedup_strings(mut self, dedup: bool) -> Self {
        self.dedup_strings = dedup;
        self
    }

    pub fn with_disable_cache_if_service_not_found(mut self, disable: bool) -> Self {
        self.disable_cache_if_service_not_found = disable;
        self
    }

    /// Readers see in-place updates only behind a real lock, so locking is
    /// worthwhile exactly when both delta features are on.
    pub fn use_read_write_lock(&self) -> bool {
        self.tag_delta_enabled && self.in_place_tag_update_enabled
    }
}

/// Builds the cache file path `<dir>/<app_id>_<service_name>_tag.json`,
/// replacing path separators in the name so the file never nests.
pub fn cache_file_path(cache_dir: &Path, app_id: &str, service_name: &str) -> PathBuf {
    let file_name = format!("{app_id}_{service_name}_tag.json").replace(['/', '\\', ':'], "_");
    cache_dir.join(file_name)
}

fn default_polling_interval_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}
