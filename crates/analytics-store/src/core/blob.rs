//! Blob metadata and payloads.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::BlobId;

/// Caller-declared metadata accompanying `put_blob`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInput {
    pub content_type: String,
    pub filename: String,
    /// Free-form shape hints (e.g. `rows`, `delimiter`, `sheet`). Stored verbatim.
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

impl BlobInput {
    pub fn new(content_type: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            filename: filename.into(),
            hints: BTreeMap::new(),
        }
    }

    pub fn with_hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.insert(key.into(), value.into());
        self
    }
}

/// Stored metadata of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub id: BlobId,
    pub content_type: String,
    pub filename: String,
    /// Length of the original payload.
    pub byte_length: u64,
    /// Length of the persisted envelope (differs when compressed).
    pub stored_length: u64,
    /// Hex SHA256 of the original payload.
    pub checksum: Option<String>,
    pub compressed: bool,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// A blob as returned by `get_blob`: original bytes plus metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub metadata: BlobMetadata,
    pub bytes: Bytes,
}
