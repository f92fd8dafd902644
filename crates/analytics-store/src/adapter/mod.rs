//! The storage adapter contract.
//!
//! [`StorageAdapter`] is the only persistence API callers use. Both concrete
//! adapters implement it:
//!
//! - **Document store**: `DocumentAdapter` in `document/`
//! - **Relational store**: `RelationalAdapter` in `relational/`
//!
//! Callers obtain one instance from the selector at startup and never branch
//! on which backend is behind it.

mod gate;
mod retry;

pub use gate::OperationGate;
pub use retry::{OperationRunner, RetryPolicy};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::BackendKind;
use crate::core::{Blob, BlobId, BlobInput, BlobMetadata, Dataset, DatasetDraft, DatasetId, WorkspaceId};
use crate::error::{Result, StoreError};

/// Persistence operations shared by every backend.
///
/// # Thread Safety
///
/// Implementations are `Send + Sync` and safe to call concurrently without
/// external locking. Operations on different identifiers do not wait on each
/// other beyond the bounded session pool.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Which backend this adapter talks to.
    fn kind(&self) -> BackendKind;

    /// Credential-free description of the backing store.
    fn location(&self) -> String;

    /// Insert or fully replace a dataset record.
    ///
    /// Fails with `Validation` when required fields are missing, when the
    /// referenced blob does not exist, or when that blob already belongs to
    /// another dataset.
    async fn put_dataset(&self, draft: DatasetDraft) -> Result<DatasetId>;

    async fn get_dataset(&self, id: &DatasetId) -> Result<Dataset>;

    /// Datasets of a workspace, newest first.
    async fn list_datasets(&self, workspace_id: &WorkspaceId, limit: i64) -> Result<Vec<Dataset>>;

    /// Delete a dataset together with the blob it owns.
    async fn delete_dataset(&self, id: &DatasetId) -> Result<()>;

    async fn dataset_exists(&self, id: &DatasetId) -> Result<bool>;

    /// Dataset identifiers across all workspaces in ascending order, starting
    /// after `after`. Used for administrative enumeration.
    async fn list_dataset_ids(&self, after: Option<&DatasetId>, limit: i64) -> Result<Vec<DatasetId>>;

    /// Store a payload through the blob codec.
    async fn put_blob(&self, bytes: Bytes, input: BlobInput) -> Result<BlobId>;

    /// Original bytes plus metadata. `CorruptPayload` if the stored bytes fail
    /// their length or checksum check.
    async fn get_blob(&self, id: &BlobId) -> Result<Blob>;

    /// Metadata only, without reading the payload.
    async fn head_blob(&self, id: &BlobId) -> Result<BlobMetadata>;

    async fn blob_exists(&self, id: &BlobId) -> Result<bool> {
        match self.head_blob(id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a blob. Refused with `Validation` while a dataset references it.
    async fn delete_blob(&self, id: &BlobId) -> Result<()>;

    /// Cheap connectivity probe.
    async fn health_check(&self) -> Result<()>;
}

/// Convert a caller-supplied limit into a usable one.
pub(crate) fn check_limit(limit: i64) -> Result<i64> {
    if limit <= 0 {
        return Err(StoreError::InvalidArgument(format!(
            "limit must be positive, got {}",
            limit
        )));
    }
    Ok(limit)
}

/// Reject a dataset write whose blob is owned by a different dataset.
pub(crate) fn check_blob_owner(
    blob_id: &BlobId,
    owner: Option<&DatasetId>,
    writer: &DatasetId,
) -> Result<()> {
    match owner {
        Some(owner) if owner != writer => Err(StoreError::Validation(format!(
            "blob {} is already owned by dataset {}",
            blob_id, owner
        ))),
        _ => Ok(()),
    }
}
