//! Relational-store adapter.
//!
//! Dataset and blob metadata are rows. The blob envelope sits in a BYTEA
//! column when it fits under the inline threshold and in a PostgreSQL large
//! object otherwise. Cascading deletes run in a single transaction, so this
//! backend needs no reconciliation sweep.

pub mod driver;
pub mod memory;
pub mod postgres;
pub mod tls;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use tracing::{debug, info};

use crate::adapter::{check_blob_owner, check_limit, OperationRunner, StorageAdapter};
use crate::codec::{BlobCodec, StoragePath};
use crate::config::{BackendKind, BlobConfig, RelationalConfig, RuntimeConfig};
use crate::core::{
    Blob, BlobId, BlobInput, BlobMetadata, Dataset, DatasetDraft, DatasetId, WorkspaceId,
};
use crate::error::{Result, StoreError};

use driver::{BlobPayload, RelationalDriver};
pub use memory::MemoryRelationalDriver;
pub use postgres::PostgresDriver;

pub struct RelationalAdapter {
    driver: Arc<dyn RelationalDriver>,
    codec: BlobCodec,
    runner: OperationRunner,
    inline_threshold: usize,
    location: String,
}

impl RelationalAdapter {
    pub fn new(
        driver: Arc<dyn RelationalDriver>,
        blob: &BlobConfig,
        runtime: &RuntimeConfig,
        pool_size: usize,
        location: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            codec: BlobCodec::new(blob),
            runner: OperationRunner::from_config("relational", pool_size, runtime),
            inline_threshold: blob.inline_threshold_bytes,
            location: location.into(),
        }
    }

    /// Open the configured database and make sure the tables exist.
    pub async fn connect(
        config: &RelationalConfig,
        blob: &BlobConfig,
        runtime: &RuntimeConfig,
        location: impl Into<String>,
    ) -> Result<Self> {
        let driver: Arc<dyn RelationalDriver> = if config.ephemeral {
            info!("Using in-memory relational store for '{}'", config.database);
            Arc::new(MemoryRelationalDriver::new())
        } else {
            Arc::new(PostgresDriver::connect(config).await?)
        };

        let adapter = Self::new(driver, blob, runtime, config.get_pool_size(), location);
        let driver = &adapter.driver;
        adapter
            .runner
            .run("ensure_schema", move || driver.ensure_schema())
            .await?;
        Ok(adapter)
    }

    async fn find_blob(&self, id: &BlobId) -> Result<Option<BlobMetadata>> {
        let driver = &self.driver;
        let key = id.as_str();
        self.runner
            .run("find_blob", move || driver.find_blob(key))
            .await
    }
}

#[async_trait]
impl StorageAdapter for RelationalAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    async fn put_dataset(&self, draft: DatasetDraft) -> Result<DatasetId> {
        draft.validate()?;
        let driver = &self.driver;
        let id = draft.id.clone().unwrap_or_else(DatasetId::generate);

        if let Some(blob_id) = &draft.blob_id {
            if self.find_blob(blob_id).await?.is_none() {
                return Err(StoreError::Validation(format!(
                    "blob {} does not exist",
                    blob_id
                )));
            }
            let blob_key = blob_id.as_str();
            let owner = self
                .runner
                .run("find_dataset_by_blob", move || {
                    driver.find_dataset_by_blob(blob_key)
                })
                .await?
                .map(DatasetId::new);
            check_blob_owner(blob_id, owner.as_ref(), &id)?;
        }

        let key = id.as_str();
        let existing = self
            .runner
            .run("find_dataset", move || driver.find_dataset(key))
            .await?;
        let dataset = draft
            .with_id(id.clone())
            .into_dataset(existing.map(|d| d.created_at));
        let record = &dataset;
        self.runner
            .run("upsert_dataset", move || driver.upsert_dataset(record))
            .await?;

        debug!("Stored dataset {} ({} rows)", id, dataset.row_count);
        Ok(id)
    }

    async fn get_dataset(&self, id: &DatasetId) -> Result<Dataset> {
        let driver = &self.driver;
        let key = id.as_str();
        self.runner
            .run("find_dataset", move || driver.find_dataset(key))
            .await?
            .ok_or_else(|| StoreError::dataset_not_found(id))
    }

    async fn list_datasets(&self, workspace_id: &WorkspaceId, limit: i64) -> Result<Vec<Dataset>> {
        let limit = check_limit(limit)?;
        let driver = &self.driver;
        let workspace = workspace_id.as_str();
        self.runner
            .run("find_datasets", move || driver.find_datasets(workspace, limit))
            .await
    }

    async fn delete_dataset(&self, id: &DatasetId) -> Result<()> {
        let driver = &self.driver;
        let key = id.as_str();
        let deleted = self
            .runner
            .run("delete_dataset_cascade", move || {
                driver.delete_dataset_cascade(key)
            })
            .await?;
        if !deleted {
            return Err(StoreError::dataset_not_found(id));
        }
        info!("Deleted dataset {} with its blob", id);
        Ok(())
    }

    async fn dataset_exists(&self, id: &DatasetId) -> Result<bool> {
        let driver = &self.driver;
        let key = id.as_str();
        Ok(self
            .runner
            .run("find_dataset", move || driver.find_dataset(key))
            .await?
            .is_some())
    }

    async fn list_dataset_ids(&self, after: Option<&DatasetId>, limit: i64) -> Result<Vec<DatasetId>> {
        let limit = check_limit(limit)?;
        let driver = &self.driver;
        let after = after.map(DatasetId::as_str);
        let ids = self
            .runner
            .run("find_dataset_ids", move || driver.find_dataset_ids(after, limit))
            .await?;
        Ok(ids.into_iter().map(DatasetId::new).collect())
    }

    async fn put_blob(&self, bytes: Bytes, input: BlobInput) -> Result<BlobId> {
        if input.content_type.trim().is_empty() {
            return Err(StoreError::Validation("blob content type is required".into()));
        }
        let driver = &self.driver;
        let envelope = self.codec.encode_offloaded(bytes, &input.content_type).await?;
        let path = StoragePath::for_stored_len(envelope.payload.len(), self.inline_threshold);

        let metadata = BlobMetadata {
            id: BlobId::generate(),
            content_type: input.content_type,
            filename: input.filename,
            byte_length: envelope.byte_length,
            stored_length: envelope.payload.len() as u64,
            checksum: envelope.checksum,
            compressed: envelope.compressed,
            hints: input.hints,
            created_at: Utc::now().trunc_subsecs(3),
        };
        let payload = BlobPayload {
            path,
            bytes: envelope.payload,
        };

        let record = &metadata;
        self.runner
            .run("insert_blob", move || driver.insert_blob(record, payload.clone()))
            .await?;

        info!(
            "Stored blob {} ({} bytes, {:?}{})",
            metadata.id,
            metadata.byte_length,
            path,
            if metadata.compressed { ", compressed" } else { "" }
        );
        Ok(metadata.id)
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Blob> {
        let driver = &self.driver;
        let key = id.as_str();
        let metadata = self
            .find_blob(id)
            .await?
            .ok_or_else(|| StoreError::blob_not_found(id))?;
        let payload = self
            .runner
            .run("read_payload", move || driver.read_payload(key))
            .await?
            .ok_or_else(|| StoreError::blob_not_found(id))?;

        let bytes = self.codec.decode_offloaded(payload, &metadata).await?;
        Ok(Blob { metadata, bytes })
    }

    async fn head_blob(&self, id: &BlobId) -> Result<BlobMetadata> {
        self.find_blob(id)
            .await?
            .ok_or_else(|| StoreError::blob_not_found(id))
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        let driver = &self.driver;
        let key = id.as_str();
        let deleted = self
            .runner
            .run("delete_blob", move || driver.delete_blob(key))
            .await?;
        if !deleted {
            return Err(StoreError::blob_not_found(id));
        }
        info!("Deleted blob {}", id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let driver = &self.driver;
        self.runner.run("ping", move || driver.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, ColumnType};

    fn adapter_with(threshold: usize) -> (RelationalAdapter, Arc<MemoryRelationalDriver>) {
        let driver = Arc::new(MemoryRelationalDriver::new());
        let blob = BlobConfig {
            inline_threshold_bytes: threshold,
            ..BlobConfig::default()
        };
        let runtime = RuntimeConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..RuntimeConfig::default()
        };
        let adapter = RelationalAdapter::new(driver.clone(), &blob, &runtime, 4, "relational:memory");
        (adapter, driver)
    }

    #[tokio::test]
    async fn test_threshold_selects_storage_path() {
        let (adapter, driver) = adapter_with(100);
        let small = adapter
            .put_blob(Bytes::from(vec![1u8; 100]), BlobInput::new("application/octet-stream", "s"))
            .await
            .unwrap();
        let large = adapter
            .put_blob(Bytes::from(vec![2u8; 101]), BlobInput::new("application/octet-stream", "l"))
            .await
            .unwrap();

        assert!(!driver.is_large_object(small.as_str()));
        assert!(driver.is_large_object(large.as_str()));
        assert_eq!(adapter.get_blob(&small).await.unwrap().bytes.len(), 100);
        assert_eq!(adapter.get_blob(&large).await.unwrap().bytes.len(), 101);
    }

    #[tokio::test]
    async fn test_dataset_round_trip_keeps_created_at_on_replace() {
        let (adapter, _) = adapter_with(100);
        let draft = DatasetDraft::new("sales", "ws-1")
            .with_row_count(10)
            .with_columns(vec![
                Column::new("region", ColumnType::Categorical),
                Column::new("amount", ColumnType::Float),
            ]);
        let id = adapter.put_dataset(draft).await.unwrap();
        let first = adapter.get_dataset(&id).await.unwrap();

        let replaced = DatasetDraft::new("sales v2", "ws-1").with_id(id.clone());
        adapter.put_dataset(replaced).await.unwrap();
        let second = adapter.get_dataset(&id).await.unwrap();
        assert_eq!(second.name, "sales v2");
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_blob_cannot_be_shared() {
        let (adapter, _) = adapter_with(100);
        let blob = adapter
            .put_blob(Bytes::from_static(b"a,b\n1,2\n"), BlobInput::new("text/csv", "x.csv"))
            .await
            .unwrap();
        adapter
            .put_dataset(DatasetDraft::new("one", "ws").with_blob(blob.clone()))
            .await
            .unwrap();
        let err = adapter
            .put_dataset(DatasetDraft::new("two", "ws").with_blob(blob.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        assert!(matches!(
            adapter.delete_blob(&blob).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_cascade_and_not_found() {
        let (adapter, driver) = adapter_with(10);
        let blob = adapter
            .put_blob(Bytes::from(vec![9u8; 64]), BlobInput::new("application/octet-stream", "b"))
            .await
            .unwrap();
        let ds = adapter
            .put_dataset(DatasetDraft::new("d", "ws").with_blob(blob.clone()))
            .await
            .unwrap();

        adapter.delete_dataset(&ds).await.unwrap();
        assert!(adapter.get_blob(&blob).await.unwrap_err().is_not_found());
        assert_eq!(driver.large_object_count(), 0);
        assert!(adapter.delete_dataset(&ds).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_corrupt_payload_detected() {
        let (adapter, driver) = adapter_with(1024);
        let id = adapter
            .put_blob(Bytes::from_static(b"hello"), BlobInput::new("text/plain", "h.txt"))
            .await
            .unwrap();
        assert!(driver.corrupt_blob(id.as_str()));
        assert!(matches!(
            adapter.get_blob(&id).await,
            Err(StoreError::CorruptPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_large_object_is_integrity_error() {
        let (adapter, driver) = adapter_with(10);
        let id = adapter
            .put_blob(Bytes::from(vec![5u8; 64]), BlobInput::new("application/octet-stream", "b"))
            .await
            .unwrap();
        assert!(driver.drop_large_object(id.as_str()));
        assert!(matches!(
            adapter.get_blob(&id).await,
            Err(StoreError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_outage_surfaces_as_unavailable() {
        let (adapter, driver) = adapter_with(100);
        driver.set_available(false);
        assert!(matches!(
            adapter.get_dataset(&DatasetId::new("x")).await,
            Err(StoreError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_list_limit_must_be_positive() {
        let (adapter, _) = adapter_with(100);
        assert!(matches!(
            adapter.list_datasets(&WorkspaceId::new("ws"), 0).await,
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
