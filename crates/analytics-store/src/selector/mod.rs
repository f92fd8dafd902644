//! Backend selection.
//!
//! [`Backend::connect`] turns a validated [`StorageConfig`] into the single
//! adapter a process uses for its lifetime. The choice is a closed set of two
//! variants; nothing downstream inspects which one it got.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapter::StorageAdapter;
use crate::config::{BackendConfig, BackendKind, StorageConfig};
use crate::core::{
    Blob, BlobId, BlobInput, BlobMetadata, Dataset, DatasetDraft, DatasetId, WorkspaceId,
};
use crate::document::{DocumentAdapter, ReconcileReport};
use crate::error::{Result, StoreError};
use crate::relational::RelationalAdapter;

/// The active storage backend.
#[derive(Clone)]
pub enum Backend {
    Document {
        adapter: Arc<DocumentAdapter>,
        reconcile_interval: Duration,
        orphan_grace: Duration,
    },
    Relational(Arc<RelationalAdapter>),
}

impl Backend {
    /// Validate the configuration, connect to the active backend and probe it.
    ///
    /// A failed probe is reported as `BackendUnavailable`; the process should
    /// not start serving.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let location = config.backend.location();
        info!("Selecting {} backend at {}", config.backend.kind(), location);

        let backend = match &config.backend {
            BackendConfig::Document(doc) => {
                let adapter =
                    DocumentAdapter::connect(doc, &config.blob, &config.runtime, location.clone())
                        .await?;
                Backend::Document {
                    adapter: Arc::new(adapter),
                    reconcile_interval: Duration::from_secs(doc.reconcile_interval_secs),
                    orphan_grace: Duration::from_secs(doc.orphan_grace_secs),
                }
            }
            BackendConfig::Relational(rel) => {
                let adapter =
                    RelationalAdapter::connect(rel, &config.blob, &config.runtime, location.clone())
                        .await?;
                Backend::Relational(Arc::new(adapter))
            }
        };

        let started = Instant::now();
        backend.health_check().await.map_err(|e| match e {
            StoreError::BackendUnavailable(_) => e,
            other => StoreError::BackendUnavailable(format!(
                "health check against {} failed: {}",
                location, other
            )),
        })?;
        info!(
            "{} backend healthy ({}ms)",
            backend.kind(),
            started.elapsed().as_millis()
        );
        Ok(backend)
    }

    /// The adapter as a trait object, for callers that hold it behind `Arc<dyn _>`.
    pub fn into_shared(self) -> Arc<dyn StorageAdapter> {
        match self {
            Backend::Document { adapter, .. } => adapter,
            Backend::Relational(adapter) => adapter,
        }
    }

    /// One reconciliation sweep. The relational backend deletes transactionally
    /// and has nothing to reconcile.
    pub async fn reconcile(&self, grace: Option<Duration>) -> Result<ReconcileReport> {
        match self {
            Backend::Document {
                adapter,
                orphan_grace,
                ..
            } => adapter.reconcile(grace.unwrap_or(*orphan_grace)).await,
            Backend::Relational(_) => Ok(ReconcileReport::default()),
        }
    }

    /// Start the periodic reconciliation task if this backend needs one.
    pub fn start_maintenance(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        match self {
            Backend::Document {
                adapter,
                reconcile_interval,
                orphan_grace,
            } if !reconcile_interval.is_zero() => {
                info!(
                    "Starting reconciler (every {}s, grace {}s)",
                    reconcile_interval.as_secs(),
                    orphan_grace.as_secs()
                );
                Some(adapter.spawn_reconciler(*reconcile_interval, *orphan_grace, cancel))
            }
            _ => None,
        }
    }

    fn adapter(&self) -> &dyn StorageAdapter {
        match self {
            Backend::Document { adapter, .. } => adapter.as_ref(),
            Backend::Relational(adapter) => adapter.as_ref(),
        }
    }
}

#[async_trait]
impl StorageAdapter for Backend {
    fn kind(&self) -> BackendKind {
        self.adapter().kind()
    }

    fn location(&self) -> String {
        self.adapter().location()
    }

    async fn put_dataset(&self, draft: DatasetDraft) -> Result<DatasetId> {
        self.adapter().put_dataset(draft).await
    }

    async fn get_dataset(&self, id: &DatasetId) -> Result<Dataset> {
        self.adapter().get_dataset(id).await
    }

    async fn list_datasets(&self, workspace_id: &WorkspaceId, limit: i64) -> Result<Vec<Dataset>> {
        self.adapter().list_datasets(workspace_id, limit).await
    }

    async fn delete_dataset(&self, id: &DatasetId) -> Result<()> {
        self.adapter().delete_dataset(id).await
    }

    async fn dataset_exists(&self, id: &DatasetId) -> Result<bool> {
        self.adapter().dataset_exists(id).await
    }

    async fn list_dataset_ids(&self, after: Option<&DatasetId>, limit: i64) -> Result<Vec<DatasetId>> {
        self.adapter().list_dataset_ids(after, limit).await
    }

    async fn put_blob(&self, bytes: Bytes, input: BlobInput) -> Result<BlobId> {
        self.adapter().put_blob(bytes, input).await
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Blob> {
        self.adapter().get_blob(id).await
    }

    async fn head_blob(&self, id: &BlobId) -> Result<BlobMetadata> {
        self.adapter().head_blob(id).await
    }

    async fn blob_exists(&self, id: &BlobId) -> Result<bool> {
        self.adapter().blob_exists(id).await
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        self.adapter().delete_blob(id).await
    }

    async fn health_check(&self) -> Result<()> {
        self.adapter().health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DocumentConfig, RelationalConfig};

    #[tokio::test]
    async fn test_connects_ephemeral_document() {
        let config = StorageConfig::new(BackendConfig::Document(DocumentConfig::ephemeral("t")));
        let backend = Backend::connect(&config).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Document);
        assert_eq!(backend.location(), "document:memory/t/blobs");
        assert!(backend.start_maintenance(CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn test_connects_ephemeral_relational() {
        let config =
            StorageConfig::new(BackendConfig::Relational(RelationalConfig::ephemeral("t")));
        let backend = Backend::connect(&config).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Relational);
        assert_eq!(backend.reconcile(None).await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_connecting() {
        let mut config =
            StorageConfig::new(BackendConfig::Relational(RelationalConfig::ephemeral("t")));
        config.blob.inline_threshold_bytes = 0;
        assert!(matches!(
            Backend::connect(&config).await,
            Err(StoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_document_store_fails_fast() {
        let mut doc = DocumentConfig::ephemeral("t");
        doc.ephemeral = false;
        doc.uri = "mongodb://127.0.0.1:1/?directConnection=true".into();
        doc.connect_timeout_ms = 200;
        let mut config = StorageConfig::new(BackendConfig::Document(doc));
        config.runtime.retry_max_attempts = 1;
        assert!(matches!(
            Backend::connect(&config).await,
            Err(StoreError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_maintenance_task_stops_on_cancel() {
        let mut doc = DocumentConfig::ephemeral("t");
        doc.reconcile_interval_secs = 3600;
        let config = StorageConfig::new(BackendConfig::Document(doc));
        let backend = Backend::connect(&config).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = backend.start_maintenance(cancel.clone()).unwrap();
        cancel.cancel();
        handle.await.unwrap();
    }
}
