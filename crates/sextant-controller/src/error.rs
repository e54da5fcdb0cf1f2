use miette::Diagnostic;
use thiserror::Error;

/// Controller error type for the reconciler, watchers, and election
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes API error during {operation}: {message}")]
    #[diagnostic(
        code(sextant::controller::api_error),
        help("Check apiserver availability and RBAC for pods, leases, and network attachments")
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

    /// Cron expression failed to parse
    #[error("Invalid cron expression '{expression}': {reason}")]
    #[diagnostic(
        code(sextant::controller::invalid_schedule),
        help("Use five fields (minute first) or six fields (seconds first), e.g. '30 4 * * *'")
    )]
    InvalidSchedule {
        #[allow(unused)]
        expression: String,
        #[allow(unused)]
        reason: String,
    },

    /// Filesystem watch failed
    #[error("Watch error on {path}: {message}")]
    #[diagnostic(
        code(sextant::controller::watch_error),
        help("Verify the schedule directory exists and is readable")
    )]
    WatchError {
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        message: String,
    },

    /// I/O error
    #[error("I/O error: {message}")]
    #[diagnostic(
        code(sextant::controller::io_error),
        help("Check filesystem permissions")
    )]
    IoError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Store error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] sextant_store::StoreError),

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] sextant_core::CoreError),
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn api_error(operation: impl Into<String>, err: kube::Error) -> Self {
        Self::ApiError {
            operation: operation.into(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn invalid_schedule(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    pub fn watch_error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WatchError {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
