//! Domain error types.

use thiserror::Error;

/// Errors raised while deriving views over a service definition.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A resource dimension names a parent that is not part of the definition.
    #[error("dimension '{dimension}' references unknown parent '{parent}'")]
    UnknownParent { dimension: String, parent: String },

    /// The parent links of the resource dimensions form a cycle.
    #[error("cycle in resource-dimension parent chain at '{dimension}'")]
    HierarchyCycle { dimension: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
