//! Error types and result aliases for granary.
//!
//! Errors carry the retryable/permanent classification the load workers use
//! to decide between re-queueing a manifest and leaving it for operator
//! triage. Database errors are classified once, here, so the metadata store
//! and the warehouse adapter agree on what counts as transient.

/// The result type used throughout granary.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in granary operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A metadata-store (Postgres) operation failed.
    #[error("metadata store error: {message}")]
    Metadata {
        /// Description of the failure.
        message: String,
        /// Whether retrying the operation may succeed.
        retryable: bool,
    },

    /// A warehouse operation (COPY, DDL, introspection) failed.
    #[error("warehouse error: {message}")]
    Warehouse {
        /// Description of the failure.
        message: String,
        /// Whether retrying the operation may succeed.
        retryable: bool,
    },

    /// An object-storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The schema registry returned an error or unusable response.
    #[error("schema registry error: {0}")]
    Registry(String),

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// The service configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a metadata-store error from a sqlx failure, classifying it.
    #[must_use]
    pub fn metadata(context: impl Into<String>, err: &sqlx::Error) -> Self {
        Self::Metadata {
            message: format!("{}: {err}", context.into()),
            retryable: sqlx_retryable(err),
        }
    }

    /// Creates a warehouse error from a sqlx failure, classifying it.
    #[must_use]
    pub fn warehouse(context: impl Into<String>, err: &sqlx::Error) -> Self {
        Self::Warehouse {
            message: format!("{}: {err}", context.into()),
            retryable: sqlx_retryable(err),
        }
    }

    /// Creates a permanent warehouse error (schema mismatch, malformed input).
    #[must_use]
    pub fn warehouse_permanent(message: impl Into<String>) -> Self {
        Self::Warehouse {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a retryable warehouse error (warehouse busy, transient network).
    #[must_use]
    pub fn warehouse_retryable(message: impl Into<String>) -> Self {
        Self::Warehouse {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a load worker should re-queue the failed manifest.
    ///
    /// Storage failures count as retryable: object storage outages are
    /// transient by assumption. Everything not explicitly classified is
    /// permanent, so unknown failures surface to an operator instead of
    /// looping.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Metadata { retryable, .. } | Self::Warehouse { retryable, .. } => *retryable,
            Self::Storage { .. } => true,
            _ => false,
        }
    }
}

/// Classifies a sqlx error as transient or permanent.
///
/// Transient: connection-level failures, pool exhaustion, and the SQLSTATE
/// classes for serialization failure, deadlock, lock timeout, statement
/// timeout, and connection exceptions.
fn sqlx_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001" | "40P01" | "55P03" | "57014" | "08000" | "08003" | "08006")
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_retryable() {
        let err = Error::metadata(
            "inserting fragment",
            &sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            )),
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let err = Error::warehouse("copy", &sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }

    #[test]
    fn decode_errors_are_permanent() {
        let err = Error::warehouse("copy", &sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn explicit_classification_wins() {
        assert!(Error::warehouse_retryable("busy").is_retryable());
        assert!(!Error::warehouse_permanent("column mismatch").is_retryable());
    }

    #[test]
    fn storage_errors_are_retryable() {
        assert!(Error::storage("upload failed").is_retryable());
    }

    #[test]
    fn invalid_input_is_permanent() {
        assert!(!Error::InvalidInput("nul byte".into()).is_retryable());
    }
}
