use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// Store error type covering both backends and the coordinator
#[derive(Error, Debug, Diagnostic)]
pub enum StoreError {
    /// Transient condition; the caller's retry loop should go around
    /// again within its deadline
    #[error("Transient store condition: {reason}")]
    #[diagnostic(
        code(sextant::store::retry),
        help("This is expected under contention; the operation retries automatically")
    )]
    Retry {
        #[allow(unused)]
        reason: String,
    },

    /// Pool missing where it was required to exist
    #[error("IP pool not found: {name}")]
    #[diagnostic(
        code(sextant::store::pool_not_found),
        help("Pools are created on first allocation; check the range configuration")
    )]
    PoolNotFound {
        #[allow(unused)]
        name: String,
    },

    /// Kubernetes API error that is not retryable
    #[error("Kubernetes API error during {operation}: {message}")]
    #[diagnostic(
        code(sextant::store::api_error),
        help("Check apiserver availability, RBAC for the sextant CRDs, and the kubeconfig in use")
    )]
    ApiError {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Local database error
    #[error("Database error: {message}")]
    #[diagnostic(
        code(sextant::store::database_error),
        help("Check database logs and ensure the data directory is accessible and not corrupted")
    )]
    DatabaseError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Local transaction error
    #[error("Transaction error: {message}")]
    #[diagnostic(
        code(sextant::store::transaction_error),
        help("Ensure the transaction is not already committed or aborted")
    )]
    TransactionError {
        #[allow(unused)]
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(sextant::store::serialization_error),
        help("The stored document does not match the expected schema")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The retry budget ran out before the write went through
    #[error("Gave up on {operation} after {attempts} attempts")]
    #[diagnostic(
        code(sextant::store::retries_exhausted),
        help("Heavy contention on one pool; if this persists, check for a crash-looping workload")
    )]
    RetriesExhausted {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        attempts: usize,
    },

    /// The operation's wall-clock budget expired
    #[error("{operation} did not finish within {budget:?}")]
    #[diagnostic(
        code(sextant::store::deadline_exceeded),
        help("The apiserver may be slow or unreachable; the runtime will re-invoke the plugin")
    )]
    DeadlineExceeded {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        budget: Duration,
    },

    /// The surrounding invocation was cancelled
    #[error("{operation} was cancelled")]
    #[diagnostic(code(sextant::store::cancelled))]
    Cancelled {
        #[allow(unused)]
        operation: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] sextant_core::CoreError),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
        }
    }

    pub fn pool_not_found(name: impl Into<String>) -> Self {
        Self::PoolNotFound { name: name.into() }
    }

    pub fn api_error(
        operation: impl Into<String>,
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ApiError {
            operation: operation.into(),
            message: message.into(),
            source,
        }
    }

    pub fn database_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::DatabaseError {
            message: message.into(),
            source,
        }
    }

    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
        }
    }

    pub fn retries_exhausted(operation: impl Into<String>, attempts: usize) -> Self {
        Self::RetriesExhausted {
            operation: operation.into(),
            attempts,
        }
    }

    pub fn deadline_exceeded(operation: impl Into<String>, budget: Duration) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
            budget,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Whether the coordinator's retry loop should go around again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Classify a Kubernetes API failure. Conflicts (stale resourceVersion,
/// duplicate create) and rejected patches (failed test operations
/// surface as 422 Invalid) are transient; everything else is fatal.
pub fn classify_kube_error(operation: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ref response) if response.code == 409 || response.code == 422 => {
            StoreError::retry(format!(
                "{}: {} ({})",
                operation, response.reason, response.code
            ))
        }
        other => StoreError::api_error(operation, other.to_string(), Some(Box::new(other))),
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            message: format!("JSON error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        StoreError::database_error(format!("redb error: {}", err), Some(Box::new(err)))
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        StoreError::transaction_error(format!("Transaction error: {}", err))
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        StoreError::database_error(format!("Storage error: {}", err), Some(Box::new(err)))
    }
}

impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        StoreError::database_error(format!("Table error: {}", err), Some(Box::new(err)))
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        StoreError::transaction_error(format!("Commit error: {}", err))
    }
}
