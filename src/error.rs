use thiserror::Error;

pub type Result<T> = std::result::Result<T, CascadeError>;

/// Crate-wide error type.
///
/// `Locked` and `NotFound` are control-flow variants: the dispatch loop
/// requeues events whose target row is locked, and callers decide whether a
/// vanished entity is skipped or recreated.
#[derive(Error, Debug)]
pub enum CascadeError {
    // Storage
    #[error("store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // Entity lifecycle
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: u64 },

    #[error("{kind} {id} is locked by another worker")]
    Locked { kind: &'static str, id: u64 },

    #[error("unresolved input dependency: {scope}:{name} has no matching output content")]
    UnresolvedDependency { scope: String, name: String },

    // Work plugin contract
    #[error("process format not supported: {0}")]
    ProcessFormatNotSupported(String),

    #[error("work type not registered: {0}")]
    WorkTypeNotRegistered(String),

    // External back-end
    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend authentication failed: {0}")]
    BackendAuth(String),

    #[error("backend request timed out after {0:?}")]
    BackendTimeout(std::time::Duration),

    // Configuration / validation
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    // Agent harness
    #[error("agent is shutting down")]
    ShuttingDown,
}

impl CascadeError {
    pub fn not_found(kind: &'static str, id: u64) -> Self {
        CascadeError::NotFound { kind, id }
    }

    pub fn locked(kind: &'static str, id: u64) -> Self {
        CascadeError::Locked { kind, id }
    }

    /// Transient failures are charged to the entity's retry budget; contract
    /// and validation violations go terminal on the first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CascadeError::Store(_)
                | CascadeError::Database(_)
                | CascadeError::Backend(_)
                | CascadeError::BackendTimeout(_)
                | CascadeError::NotFound { .. }
        )
    }
}
