//! Enricher and retriever error types.

use thiserror::Error;

/// Errors surfaced by the retriever contract.
///
/// `ServiceNotFound` is load-bearing: the refresher reacts to it by
/// invalidating the local cache and clearing the in-memory snapshot.
#[derive(Debug, Error)]
pub enum RetrieverError {
    /// The service has been deleted upstream.
    #[error("service not found: {service_name}")]
    ServiceNotFound { service_name: String },

    /// Retriever initialization failed.
    #[error("retriever init failed: {message}")]
    Init { message: String },

    /// Any other failure of the tag source; the refresher retries on the
    /// next trigger.
    #[error("tag source error: {message}")]
    Source { message: String },
}

/// Errors surfaced by the enricher's control operations. The read path
/// (`enrich`) never fails.
#[derive(Debug, Error)]
pub enum EnricherError {
    /// No refresher is running (init was skipped or failed, or the
    /// enricher was already cleaned up).
    #[error("tag refresher is not running")]
    RefresherNotRunning,
}

/// Result type for retriever operations.
pub type RetrieverResult<T> = Result<T, RetrieverError>;
