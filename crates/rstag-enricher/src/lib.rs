//! rstag-enricher: the tag-context enricher engine
//!
//! Attaches, per authorization request, the tags applying to the accessed
//! resource. A retriever pulls versioned `(resource -> tags)` payloads
//! from the tag service; the enricher indexes them in memory and serves
//! lookups while a background task refreshes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 rstag-enricher                    │
//! ├──────────────────────────────────────────────────┤
//! │  enricher/   - engine, install protocol, lookup  │
//! │  enriched/   - indexed snapshot bundle           │
//! │  refresher/  - pull loop, cache file, triggers   │
//! │  retriever/  - tag source contract + registry    │
//! │  cache/      - memoized candidate lookups        │
//! │  config/     - enricher options, plugin config   │
//! │  lock/       - degradable read-write lock        │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Data flow: refresher -> retriever -> (cache file) ->
//! `TagEnricher::set_service_tags` -> snapshot -> `enrich(request)`.

pub mod cache;
pub mod config;
pub mod enriched;
pub mod enricher;
pub mod error;
pub mod lock;
pub mod refresher;
pub mod retriever;

// Re-export commonly used types at the crate root
pub use cache::{register_evaluator_cache_metrics, CachedResourceEvaluators};
pub use config::{cache_file_path, EnricherOptions, PluginConfig};
pub use enriched::EnrichedServiceTags;
pub use enricher::{AuthContextListener, TagEnricher};
pub use error::{EnricherError, RetrieverError, RetrieverResult};
pub use refresher::DownloadTrigger;
pub use retriever::{RetrieverInitContext, RetrieverRegistry, TagRetriever};
