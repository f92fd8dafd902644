//! Native primitives of the relational store.
//!
//! Tables:
//!
//! - `blobs`: one row of metadata per blob
//! - `blob_payloads`: the envelope, either in `inline_data` or as a large
//!   object referenced by `large_object`; removed with its blob
//! - `datasets`: dataset rows, `blob_id` unique and restricted against blob
//!   removal
//!
//! Multi-row changes run inside one transaction, so a crash never leaves a
//! dataset without its blob or a blob without its payload.

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec::StoragePath;
use crate::core::{BlobMetadata, Dataset};
use crate::error::Result;

/// Envelope bytes together with where they are to be kept.
#[derive(Debug, Clone)]
pub struct BlobPayload {
    pub path: StoragePath,
    pub bytes: Bytes,
}

#[async_trait]
pub trait RelationalDriver: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Create schema, tables and indexes. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert or replace by id. Constraint violations (unknown blob, blob
    /// already owned) fail with `Validation`.
    async fn upsert_dataset(&self, dataset: &Dataset) -> Result<()>;

    async fn find_dataset(&self, id: &str) -> Result<Option<Dataset>>;

    /// Datasets of a workspace, newest first.
    async fn find_datasets(&self, workspace_id: &str, limit: i64) -> Result<Vec<Dataset>>;

    /// Dataset ids in ascending order after `after`.
    async fn find_dataset_ids(&self, after: Option<&str>, limit: i64) -> Result<Vec<String>>;

    /// Id of the dataset referencing a blob.
    async fn find_dataset_by_blob(&self, blob_id: &str) -> Result<Option<String>>;

    /// Remove a dataset, its blob, the payload row and any large object in
    /// one transaction. Returns false when the dataset did not exist.
    async fn delete_dataset_cascade(&self, id: &str) -> Result<bool>;

    /// Insert blob metadata and payload in one transaction.
    async fn insert_blob(&self, metadata: &BlobMetadata, payload: BlobPayload) -> Result<()>;

    async fn find_blob(&self, id: &str) -> Result<Option<BlobMetadata>>;

    /// Persisted envelope of a blob. `Integrity` when the payload row or its
    /// large object is missing.
    async fn read_payload(&self, id: &str) -> Result<Option<Bytes>>;

    /// Remove a blob with its payload. Fails with `Validation` while a dataset
    /// references it.
    async fn delete_blob(&self, id: &str) -> Result<bool>;
}
