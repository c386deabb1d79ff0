//! Error types for nrmesh

use thiserror::Error;

/// Result type alias using nrmesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// nrmesh error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed prefix. The whole resource is rejected.
    #[error("Address error: {0}")]
    Address(String),

    /// An OS object could not be created or moved while building a resource.
    #[error("Provisioning failed for {prefix} at stage {stage}: {message}")]
    Provisioning {
        prefix: String,
        stage: String,
        message: String,
    },

    /// The topology snapshot is inconsistent.
    #[error("Planning error: {0}")]
    Planning(String),

    /// Key, address, peer or route configuration failed inside the namespace.
    #[error("Apply failed for {prefix} during {operation}: {message}")]
    Apply {
        prefix: String,
        operation: ApplyOperation,
        message: String,
    },

    #[error("Key error: {0}")]
    Key(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cleanup failed: {}", .0.join("; "))]
    Cleanup(Vec<String>),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Step of the apply sequence an [`Error::Apply`] originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOperation {
    Key,
    EnterNamespace,
    Address,
    Configure,
    Route,
}

impl std::fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyOperation::Key => write!(f, "key"),
            ApplyOperation::EnterNamespace => write!(f, "enter-namespace"),
            ApplyOperation::Address => write!(f, "address"),
            ApplyOperation::Configure => write!(f, "configure"),
            ApplyOperation::Route => write!(f, "route"),
        }
    }
}

impl Error {
    pub fn provisioning(
        prefix: impl ToString,
        stage: impl ToString,
        message: impl ToString,
    ) -> Self {
        Error::Provisioning {
            prefix: prefix.to_string(),
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }

    pub fn apply(prefix: impl ToString, operation: ApplyOperation, message: impl ToString) -> Self {
        Error::Apply {
            prefix: prefix.to_string(),
            operation,
            message: message.to_string(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether re-running the whole provision-plan-apply sequence may succeed.
    ///
    /// Bad input (addresses, topology) is never retried. A route that the
    /// kernel refused points at a routing conflict and is surfaced as fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provisioning { .. } | Error::Io(_) | Error::Cleanup(_) => true,
            Error::Apply { operation, .. } => *operation != ApplyOperation::Route,
            _ => false,
        }
    }
}
