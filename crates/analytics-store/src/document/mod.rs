//! Document-store adapter.
//!
//! Payloads at or below the inline threshold live in the blob record itself;
//! larger ones go through the chunked large-object facility (GridFS) and the
//! blob record points at the file.
//!
//! The document store has no multi-collection transactions, so deleting a
//! dataset is an ordered sequence: mark the dataset as deleting (it vanishes
//! from every read), delete its blob, then remove the dataset record. A crash
//! part-way leaves either an invisible dataset or an unreferenced file; the
//! reconciliation sweep finishes both once they are older than the grace
//! period.
//!
//! Deleting a standalone blob is two-phase for the same reason. The blob is
//! marked first, and its ownership is checked only after the mark is in place.
//! `put_dataset` writes the reference first and re-reads the blob afterwards,
//! backing out if it finds the mark. Whichever side comes second sees the
//! other, so a dataset never ends up pointing at a removed blob.

pub mod driver;
pub mod memory;
pub mod mongo;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{check_blob_owner, check_limit, OperationRunner, StorageAdapter};
use crate::codec::{BlobCodec, StoragePath};
use crate::config::{BackendKind, BlobConfig, DocumentConfig, RuntimeConfig};
use crate::core::{
    Blob, BlobId, BlobInput, BlobMetadata, Dataset, DatasetDraft, DatasetId, WorkspaceId,
};
use crate::error::{Result, StoreError};

use driver::{BlobDocument, DatasetDocument, DocumentDriver, PayloadLocation};
pub use memory::MemoryDocumentDriver;
pub use mongo::MongoDriver;

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Interrupted dataset deletions that were completed.
    pub tombstones_finished: usize,
    /// Interrupted blob deletions that were completed or released.
    pub blob_deletions_settled: usize,
    /// Large-object files no blob record referenced.
    pub files_removed: usize,
}

pub struct DocumentAdapter {
    driver: Arc<dyn DocumentDriver>,
    codec: BlobCodec,
    runner: OperationRunner,
    inline_threshold: usize,
    location: String,
}

impl DocumentAdapter {
    /// Build an adapter over an existing driver.
    pub fn new(
        driver: Arc<dyn DocumentDriver>,
        blob: &BlobConfig,
        runtime: &RuntimeConfig,
        pool_size: usize,
        location: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            codec: BlobCodec::new(blob),
            runner: OperationRunner::from_config("document", pool_size, runtime),
            inline_threshold: blob.inline_threshold_bytes,
            location: location.into(),
        }
    }

    /// Build the driver the configuration asks for and create indexes.
    pub async fn connect(
        config: &DocumentConfig,
        blob: &BlobConfig,
        runtime: &RuntimeConfig,
        location: impl Into<String>,
    ) -> Result<Self> {
        let driver: Arc<dyn DocumentDriver> = if config.ephemeral {
            info!("Using in-memory document store for '{}'", config.database);
            Arc::new(MemoryDocumentDriver::new(config.chunk_size_bytes as usize))
        } else {
            Arc::new(MongoDriver::connect(config).await?)
        };

        let adapter = Self::new(driver, blob, runtime, config.get_pool_size(), location);
        let driver = &adapter.driver;
        adapter
            .runner
            .run("ensure_indexes", move || driver.ensure_indexes())
            .await?;
        Ok(adapter)
    }

    /// Finish interrupted deletions and drop unreferenced large-object files
    /// older than `grace`.
    pub async fn reconcile(&self, grace: Duration) -> Result<ReconcileReport> {
        let driver = &self.driver;
        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(grace_ms);
        let mut report = ReconcileReport::default();

        let stale = self
            .runner
            .run("find_stale_deletions", move || driver.find_stale_deletions(cutoff))
            .await?;
        for doc in stale {
            warn!("Completing interrupted deletion of dataset {}", doc.id);
            if let Some(blob_id) = &doc.blob_id {
                self.remove_blob_data(blob_id).await?;
            }
            let id = doc.id.as_str();
            self.runner
                .run("delete_dataset", move || driver.delete_dataset(id))
                .await?;
            report.tombstones_finished += 1;
        }

        let stale_blobs = self
            .runner
            .run("find_stale_blob_deletions", move || {
                driver.find_stale_blob_deletions(cutoff)
            })
            .await?;
        for doc in stale_blobs {
            let key = doc.id.as_str();
            let owner = self
                .runner
                .run("find_dataset_by_blob", move || driver.find_dataset_by_blob(key))
                .await?;
            if owner.is_some() {
                warn!("Releasing blob {} from an abandoned deletion", key);
                self.runner
                    .run("clear_blob_deleting", move || driver.clear_blob_deleting(key))
                    .await?;
            } else {
                warn!("Completing interrupted deletion of blob {}", key);
                self.remove_blob_data(key).await?;
            }
            report.blob_deletions_settled += 1;
        }

        // Referenced ids are read after the candidate list so a file whose blob
        // record lands in between is seen as referenced.
        let candidates = self
            .runner
            .run("find_files", move || driver.find_files(cutoff))
            .await?;
        if !candidates.is_empty() {
            let referenced = self
                .runner
                .run("referenced_file_ids", move || driver.referenced_file_ids())
                .await?;
            for file_id in candidates.iter().filter(|f| !referenced.contains(*f)) {
                let file_id = file_id.as_str();
                if self
                    .runner
                    .run("delete_file", move || driver.delete_file(file_id))
                    .await?
                {
                    warn!("Removed orphaned large object {}", file_id);
                    report.files_removed += 1;
                }
            }
        }

        info!(
            "Reconciliation finished: {} deletion(s) completed, {} blob deletion(s) settled, {} orphaned file(s) removed",
            report.tombstones_finished, report.blob_deletions_settled, report.files_removed
        );
        Ok(report)
    }

    /// Run `reconcile` every `interval` until `cancel` fires.
    pub fn spawn_reconciler(
        self: &Arc<Self>,
        interval: Duration,
        grace: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Reconciler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = adapter.reconcile(grace).await {
                            error!("Reconciliation sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Delete a blob record, then its file. Missing pieces are fine.
    async fn remove_blob_data(&self, blob_id: &str) -> Result<()> {
        let driver = &self.driver;
        let Some(doc) = self
            .runner
            .run("find_blob", move || driver.find_blob(blob_id))
            .await?
        else {
            return Ok(());
        };

        self.runner
            .run("delete_blob", move || driver.delete_blob(blob_id))
            .await?;
        if let Some(file_id) = doc.file_id.as_deref() {
            self.runner
                .run("delete_file", move || driver.delete_file(file_id))
                .await?;
        }
        Ok(())
    }

    async fn find_visible(&self, id: &DatasetId) -> Result<Option<DatasetDocument>> {
        let driver = &self.driver;
        let key = id.as_str();
        let doc = self
            .runner
            .run("find_dataset", move || driver.find_dataset(key))
            .await?;
        Ok(doc.filter(|d| !d.is_deleting()))
    }

    /// Put back the record `put_dataset` replaced, or drop the one it created.
    async fn restore_dataset(&self, key: &str, previous: Option<DatasetDocument>) -> Result<()> {
        let driver = &self.driver;
        match previous {
            Some(doc) => {
                self.runner
                    .run("upsert_dataset", move || driver.upsert_dataset(doc.clone()))
                    .await
            }
            None => self
                .runner
                .run("delete_dataset", move || driver.delete_dataset(key))
                .await
                .map(|_| ()),
        }
    }
}

#[async_trait]
impl StorageAdapter for DocumentAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    async fn put_dataset(&self, draft: DatasetDraft) -> Result<DatasetId> {
        draft.validate()?;
        let driver = &self.driver;
        let id = draft.id.clone().unwrap_or_else(DatasetId::generate);
        let key = id.as_str();

        let existing = self
            .runner
            .run("find_dataset", move || driver.find_dataset(key))
            .await?;
        if existing.as_ref().map_or(false, |d| d.is_deleting()) {
            return Err(StoreError::Validation(format!(
                "dataset {} is being deleted",
                id
            )));
        }

        if let Some(blob_id) = &draft.blob_id {
            let blob_key = blob_id.as_str();
            let blob = self
                .runner
                .run("find_blob", move || driver.find_blob(blob_key))
                .await?;
            match blob {
                None => {
                    return Err(StoreError::Validation(format!(
                        "blob {} does not exist",
                        blob_id
                    )))
                }
                Some(b) if b.is_deleting() => {
                    return Err(StoreError::Validation(format!(
                        "blob {} is being deleted",
                        blob_id
                    )))
                }
                Some(_) => {}
            }
            let owner = self
                .runner
                .run("find_dataset_by_blob", move || {
                    driver.find_dataset_by_blob(blob_key)
                })
                .await?
                .map(|d| DatasetId::new(d.id));
            check_blob_owner(blob_id, owner.as_ref(), &id)?;
        }

        let dataset = draft
            .with_id(id.clone())
            .into_dataset(existing.as_ref().map(|d| d.created_at));
        let doc = DatasetDocument::from_dataset(&dataset);
        self.runner
            .run("upsert_dataset", move || driver.upsert_dataset(doc.clone()))
            .await?;

        // A blob deletion may have started between the check and the write.
        if let Some(blob_id) = &dataset.blob_id {
            let blob_key = blob_id.as_str();
            let still_usable = self
                .runner
                .run("find_blob", move || driver.find_blob(blob_key))
                .await?
                .map_or(false, |b| !b.is_deleting());
            if !still_usable {
                warn!(
                    "Blob {} was deleted while dataset {} was written; backing out",
                    blob_id, id
                );
                self.restore_dataset(key, existing).await?;
                return Err(StoreError::Validation(format!(
                    "blob {} is being deleted",
                    blob_id
                )));
            }
        }

        debug!("Stored dataset {} ({} rows)", id, dataset.row_count);
        Ok(id)
    }

    async fn get_dataset(&self, id: &DatasetId) -> Result<Dataset> {
        self.find_visible(id)
            .await?
            .map(DatasetDocument::into_dataset)
            .ok_or_else(|| StoreError::dataset_not_found(id))
    }

    async fn list_datasets(&self, workspace_id: &WorkspaceId, limit: i64) -> Result<Vec<Dataset>> {
        let limit = check_limit(limit)?;
        let driver = &self.driver;
        let workspace = workspace_id.as_str();
        let docs = self
            .runner
            .run("find_datasets", move || driver.find_datasets(workspace, limit))
            .await?;
        Ok(docs.into_iter().map(DatasetDocument::into_dataset).collect())
    }

    async fn delete_dataset(&self, id: &DatasetId) -> Result<()> {
        let driver = &self.driver;
        let key = id.as_str();
        let Some(doc) = self.find_visible(id).await? else {
            return Err(StoreError::dataset_not_found(id));
        };

        let now = Utc::now().timestamp_millis();
        let marked = self
            .runner
            .run("mark_dataset_deleting", move || {
                driver.mark_dataset_deleting(key, now)
            })
            .await?;
        if !marked {
            // Lost the race against another delete of the same record.
            return Err(StoreError::dataset_not_found(id));
        }

        if let Some(blob_id) = &doc.blob_id {
            self.remove_blob_data(blob_id).await?;
        }
        self.runner
            .run("delete_dataset", move || driver.delete_dataset(key))
            .await?;

        info!("Deleted dataset {} (blob: {:?})", id, doc.blob_id);
        Ok(())
    }

    async fn dataset_exists(&self, id: &DatasetId) -> Result<bool> {
        Ok(self.find_visible(id).await?.is_some())
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
        let id = BlobId::generate();
        let envelope = self.codec.encode_offloaded(bytes, &input.content_type).await?;
        let stored_length = envelope.payload.len();

        let mut doc = BlobDocument {
            id: id.to_string(),
            content_type: input.content_type,
            filename: input.filename,
            byte_length: envelope.byte_length as i64,
            stored_length: stored_length as i64,
            checksum: envelope.checksum,
            compressed: envelope.compressed,
            hints: input.hints,
            created_at: Utc::now().trunc_subsecs(3),
            inline_data: None,
            file_id: None,
            deleting_since: None,
        };

        match StoragePath::for_stored_len(stored_length, self.inline_threshold) {
            StoragePath::Inline => {
                doc.inline_data = Some(bson::Binary {
                    subtype: bson::spec::BinarySubtype::Generic,
                    bytes: envelope.payload.to_vec(),
                });
            }
            StoragePath::LargeObject => {
                let payload = envelope.payload;
                let name = doc.id.as_str();
                let file_id = self
                    .runner
                    .run("upload_file", move || driver.upload_file(name, payload.clone()))
                    .await?;
                doc.file_id = Some(file_id);
            }
        }

        let file_id = doc.file_id.clone();
        let stored = self
            .runner
            .run("upsert_blob", move || driver.upsert_blob(doc.clone()))
            .await;
        if let Err(e) = stored {
            if let Some(file_id) = file_id.as_deref() {
                // Best effort; the sweep removes it otherwise.
                if let Err(cleanup) = driver.delete_file(file_id).await {
                    warn!("Could not remove large object {} after failed put: {}", file_id, cleanup);
                }
            }
            return Err(e);
        }

        info!(
            "Stored blob {} ({} bytes, {} path{})",
            id,
            envelope.byte_length,
            if file_id.is_some() { "large-object" } else { "inline" },
            if envelope.compressed { ", compressed" } else { "" }
        );
        Ok(id)
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Blob> {
        let driver = &self.driver;
        let key = id.as_str();
        let doc = self
            .runner
            .run("find_blob", move || driver.find_blob(key))
            .await?
            .ok_or_else(|| StoreError::blob_not_found(id))?;
        let metadata = doc.metadata();

        let payload = match doc.payload_location()? {
            PayloadLocation::Inline(data) => Bytes::copy_from_slice(data),
            PayloadLocation::File(file_id) => self
                .runner
                .run("download_file", move || driver.download_file(file_id))
                .await?
                .ok_or_else(|| {
                    StoreError::Integrity(format!(
                        "blob {} references missing large object {}",
                        id, file_id
                    ))
                })?,
        };

        let bytes = self.codec.decode_offloaded(payload, &metadata).await?;
        Ok(Blob { metadata, bytes })
    }

    async fn head_blob(&self, id: &BlobId) -> Result<BlobMetadata> {
        let driver = &self.driver;
        let key = id.as_str();
        self.runner
            .run("find_blob", move || driver.find_blob(key))
            .await?
            .map(|doc| doc.metadata())
            .ok_or_else(|| StoreError::blob_not_found(id))
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        let driver = &self.driver;
        let key = id.as_str();
        let exists = self
            .runner
            .run("find_blob", move || driver.find_blob(key))
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::blob_not_found(id));
        }

        let now = Utc::now().timestamp_millis();
        let marked = self
            .runner
            .run("mark_blob_deleting", move || driver.mark_blob_deleting(key, now))
            .await?;
        if !marked {
            // Another delete of the same blob is in progress.
            return Err(StoreError::blob_not_found(id));
        }

        let owner = self
            .runner
            .run("find_dataset_by_blob", move || driver.find_dataset_by_blob(key))
            .await?;
        if let Some(owner) = owner {
            self.runner
                .run("clear_blob_deleting", move || driver.clear_blob_deleting(key))
                .await?;
            return Err(StoreError::Validation(format!(
                "blob {} is owned by dataset {}; delete or repoint the dataset first",
                id, owner.id
            )));
        }

        self.remove_blob_data(key).await?;
        info!("Deleted blob {}", id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let driver = &self.driver;
        self.runner.run("ping", move || driver.ping()).await
    }
}
