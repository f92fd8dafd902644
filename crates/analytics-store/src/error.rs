//! Error types for the storage layer.
//!
//! Backend-native errors are translated into [`StoreError`] inside the driver
//! modules; callers only ever see this taxonomy.

use thiserror::Error;

/// Main error type for storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The identifier does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Malformed input to a write.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Stored bytes do not match their recorded length or checksum.
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    /// Connectivity, timeout or pool exhaustion. Retryable with backoff.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Bad call parameters.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A record references data that is missing from the store.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Non-transient rejection by the backend that fits no other class.
    #[error("{backend} error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// Configuration error (invalid YAML, missing fields, unknown backend).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another migration run holds the same source/destination pair.
    #[error("Migration already in progress: {0}")]
    MigrationInProgress(String),

    /// The ledger file belongs to a different source/destination pair.
    #[error("Ledger belongs to a different backend pair - use a new ledger path")]
    LedgerMismatch,

    /// A migration run finished with failed records.
    #[error("Migration incomplete: {failed} record(s) failed")]
    MigrationIncomplete { failed: usize },

    /// Operation was cancelled (SIGINT, etc.)
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Create a NotFound error for a dataset.
    pub fn dataset_not_found(id: impl ToString) -> Self {
        StoreError::NotFound {
            kind: "dataset",
            id: id.to_string(),
        }
    }

    /// Create a NotFound error for a blob.
    pub fn blob_not_found(id: impl ToString) -> Self {
        StoreError::NotFound {
            kind: "blob",
            id: id.to_string(),
        }
    }

    /// Create a Backend error.
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        StoreError::Backend {
            backend,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Only connectivity-class failures are worth retrying; everything else is
    /// deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::BackendUnavailable(_))
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            StoreError::Config(_) | StoreError::Yaml(_) => 1,
            StoreError::BackendUnavailable(_) => 2,
            StoreError::Validation(_) | StoreError::InvalidArgument(_) => 3,
            StoreError::NotFound { .. } => 4,
            StoreError::CorruptPayload(_) | StoreError::Integrity(_) => 5,
            StoreError::MigrationIncomplete { .. } => 6,
            StoreError::MigrationInProgress(_) | StoreError::LedgerMismatch => 7,
            StoreError::Io(_) | StoreError::Json(_) => 8,
            StoreError::Backend { .. } => 9,
            StoreError::Cancelled => 130,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
