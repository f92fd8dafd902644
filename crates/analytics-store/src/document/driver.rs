//! Native primitives of the document store.
//!
//! The adapter is written against [`DocumentDriver`] so that the same
//! inline-vs-chunked logic runs over MongoDB/GridFS in production and over the
//! in-memory driver in tests and local development.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{BlobId, BlobMetadata, Column, Dataset, DatasetId, WorkspaceId};
use crate::error::{Result, StoreError};

/// Dataset record as stored in the `datasets` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub workspace_id: String,
    pub row_count: i64,
    pub columns: Vec<Column>,
    /// Absent rather than null so the partial unique index skips it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    /// Set (epoch millis) once deletion has started. Such records are invisible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleting_since: Option<i64>,
}

impl DatasetDocument {
    pub fn from_dataset(dataset: &Dataset) -> Self {
        Self {
            id: dataset.id.to_string(),
            name: dataset.name.clone(),
            workspace_id: dataset.workspace_id.to_string(),
            // Range checked by DatasetDraft::validate.
            row_count: i64::try_from(dataset.row_count).unwrap_or(i64::MAX),
            columns: dataset.columns.clone(),
            blob_id: dataset.blob_id.as_ref().map(|b| b.to_string()),
            created_at: dataset.created_at,
            deleting_since: None,
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting_since.is_some()
    }

    pub fn into_dataset(self) -> Dataset {
        Dataset {
            id: DatasetId::new(self.id),
            name: self.name,
            workspace_id: WorkspaceId::new(self.workspace_id),
            row_count: u64::try_from(self.row_count).unwrap_or_default(),
            columns: self.columns,
            blob_id: self.blob_id.map(BlobId::new),
            created_at: self.created_at,
        }
    }
}

/// Blob record as stored in the `blobs` collection. Exactly one of
/// `inline_data` and `file_id` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub content_type: String,
    pub filename: String,
    pub byte_length: i64,
    pub stored_length: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub compressed: bool,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<bson::Binary>,
    /// Large-object file holding the envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Set (epoch millis) while the blob is being deleted. No dataset may
    /// start referencing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleting_since: Option<i64>,
}

impl BlobDocument {
    pub fn is_deleting(&self) -> bool {
        self.deleting_since.is_some()
    }

    pub fn metadata(&self) -> BlobMetadata {
        BlobMetadata {
            id: BlobId::new(self.id.clone()),
            content_type: self.content_type.clone(),
            filename: self.filename.clone(),
            byte_length: u64::try_from(self.byte_length).unwrap_or_default(),
            stored_length: u64::try_from(self.stored_length).unwrap_or_default(),
            checksum: self.checksum.clone(),
            compressed: self.compressed,
            hints: self.hints.clone(),
            created_at: self.created_at,
        }
    }

    /// Where the payload lives.
    pub fn payload_location(&self) -> Result<PayloadLocation<'_>> {
        match (&self.inline_data, &self.file_id) {
            (Some(data), None) => Ok(PayloadLocation::Inline(&data.bytes)),
            (None, Some(file_id)) => Ok(PayloadLocation::File(file_id)),
            _ => Err(StoreError::Integrity(format!(
                "blob {} must have exactly one of inline data or a file reference",
                self.id
            ))),
        }
    }
}

pub enum PayloadLocation<'a> {
    Inline(&'a [u8]),
    File(&'a str),
}

/// Primitives the document adapter needs from its backend.
///
/// Every method is a single backend round trip (or one streamed large-object
/// transfer) and may be retried by the caller on `BackendUnavailable`.
#[async_trait]
pub trait DocumentDriver: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Create indexes. Idempotent.
    async fn ensure_indexes(&self) -> Result<()>;

    /// Insert or replace by `_id`. A second dataset with the same `blob_id`
    /// violates the unique index and fails with `Validation`.
    async fn upsert_dataset(&self, doc: DatasetDocument) -> Result<()>;

    /// Includes records that are being deleted.
    async fn find_dataset(&self, id: &str) -> Result<Option<DatasetDocument>>;

    /// Visible datasets of a workspace, newest first.
    async fn find_datasets(&self, workspace_id: &str, limit: i64) -> Result<Vec<DatasetDocument>>;

    /// Visible dataset ids in ascending order after `after`.
    async fn find_dataset_ids(&self, after: Option<&str>, limit: i64) -> Result<Vec<String>>;

    /// The dataset (visible or not) referencing a blob.
    async fn find_dataset_by_blob(&self, blob_id: &str) -> Result<Option<DatasetDocument>>;

    /// Set `deleting_since` unless already set. Returns whether this call set it.
    async fn mark_dataset_deleting(&self, id: &str, at_ms: i64) -> Result<bool>;

    async fn delete_dataset(&self, id: &str) -> Result<bool>;

    /// Records whose deletion started at or before `cutoff_ms`.
    async fn find_stale_deletions(&self, cutoff_ms: i64) -> Result<Vec<DatasetDocument>>;

    /// Insert or replace by `_id`.
    async fn upsert_blob(&self, doc: BlobDocument) -> Result<()>;

    async fn find_blob(&self, id: &str) -> Result<Option<BlobDocument>>;

    async fn delete_blob(&self, id: &str) -> Result<bool>;

    /// Set the blob's `deleting_since` unless already set. Returns whether
    /// this call set it.
    async fn mark_blob_deleting(&self, id: &str, at_ms: i64) -> Result<bool>;

    /// Clear `deleting_since` on a blob whose deletion was abandoned.
    async fn clear_blob_deleting(&self, id: &str) -> Result<bool>;

    /// Blobs whose deletion started at or before `cutoff_ms`.
    async fn find_stale_blob_deletions(&self, cutoff_ms: i64) -> Result<Vec<BlobDocument>>;

    /// Store bytes through the chunked large-object facility. Returns the file id.
    async fn upload_file(&self, filename: &str, bytes: Bytes) -> Result<String>;

    async fn download_file(&self, file_id: &str) -> Result<Option<Bytes>>;

    async fn delete_file(&self, file_id: &str) -> Result<bool>;

    /// Large-object files uploaded at or before `cutoff_ms`.
    async fn find_files(&self, cutoff_ms: i64) -> Result<Vec<String>>;

    /// File ids referenced by any blob record.
    async fn referenced_file_ids(&self) -> Result<HashSet<String>>;
}
