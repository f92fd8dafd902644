//! Migration engine: copies every dataset and its blob from one adapter to
//! another, verifying each blob byte-for-byte through the destination's
//! `get_blob`.
//!
//! Runs are resumable. Each record's progress goes into a [`MigrationLedger`]
//! and records already verified by an earlier run are only re-checked, not
//! copied again. A failed record is logged to the ledger and the run moves on;
//! the report tells the operator whether anything is left to fix.

pub mod ledger;
mod lock;

pub use ledger::{EntityKind, LedgerEntry, MigrationLedger, RecordStatus, RunRecord, RunStatus};
pub use lock::lock_path_for;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::StorageAdapter;
use crate::codec::sha256_hex;
use crate::config::{MigrationConfig, StorageConfig};
use crate::core::{BlobId, BlobInput, Dataset, DatasetId};
use crate::error::{Result, StoreError};
use crate::selector::Backend;
use lock::RunGuard;

/// Summary of one migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: String,
    pub status: RunStatus,
    /// Records written to the destination in this run.
    pub copied: usize,
    /// Records whose destination copy matched the source in this run.
    pub verified: usize,
    pub failed: usize,
    /// Records left alone: verified earlier and still intact, or gone from the source.
    pub skipped: usize,
    pub failed_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl MigrationReport {
    /// True only for a run that finished and had no failed records.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.status == RunStatus::Completed
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Default)]
struct Tally {
    copied: usize,
    verified: usize,
    failed: usize,
    skipped: usize,
    failed_ids: Vec<String>,
}

/// Result of re-checking a previously verified record.
enum Recheck {
    Intact,
    SourceGone,
    Changed(String),
}

pub struct MigrationEngine {
    source: Arc<dyn StorageAdapter>,
    destination: Arc<dyn StorageAdapter>,
    options: MigrationConfig,
    pair_key: String,
    /// Ledger kept between runs when no ledger path is configured.
    memory_ledger: Mutex<Option<MigrationLedger>>,
}

impl MigrationEngine {
    pub fn new(
        source: Arc<dyn StorageAdapter>,
        destination: Arc<dyn StorageAdapter>,
        options: MigrationConfig,
    ) -> Result<Self> {
        let (from, to) = (source.location(), destination.location());
        if from == to {
            return Err(StoreError::InvalidArgument(format!(
                "source and destination are the same store ({})",
                from
            )));
        }
        if options.page_size == 0 {
            return Err(StoreError::InvalidArgument("page_size must be at least 1".into()));
        }

        let mut hasher = Sha256::new();
        hasher.update(from.as_bytes());
        hasher.update(b"\n->\n");
        hasher.update(to.as_bytes());
        let pair_key = hex::encode(hasher.finalize());

        Ok(Self {
            source,
            destination,
            options,
            pair_key,
            memory_ledger: Mutex::new(None),
        })
    }

    /// Connect both stores through the selector.
    pub async fn from_configs(
        source: &StorageConfig,
        destination: &StorageConfig,
        options: MigrationConfig,
    ) -> Result<Self> {
        info!(
            "Migrating {} -> {}",
            source.backend.location(),
            destination.backend.location()
        );
        let from = Backend::connect(source).await?.into_shared();
        let to = Backend::connect(destination).await?.into_shared();
        Self::new(from, to, options)
    }

    /// Identifies the source/destination pair.
    pub fn pair_key(&self) -> &str {
        &self.pair_key
    }

    /// Copy of the in-memory ledger, when no ledger path is configured.
    pub fn ledger_snapshot(&self) -> Option<MigrationLedger> {
        self.memory_ledger.lock().ok().and_then(|l| l.clone())
    }

    /// Run one migration pass. Stops between records when `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MigrationReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let ledger_path = self.options.ledger_path.as_deref();
        let _guard = RunGuard::acquire(&self.pair_key, ledger_path, &run_id)?;

        let mut ledger = match ledger_path {
            Some(path) => MigrationLedger::open(path, &self.pair_key)?,
            None => self
                .memory_ledger
                .lock()
                .ok()
                .and_then(|mut l| l.take())
                .unwrap_or_else(|| MigrationLedger::new(self.pair_key.clone())),
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        ledger.runs.push(RunRecord {
            run_id: run_id.clone(),
            started_at,
            completed_at: None,
            status: RunStatus::Running,
            copied: 0,
            verified: 0,
            failed: 0,
            skipped: 0,
        });
        info!("Starting migration run {}", run_id);

        let mut tally = Tally::default();
        let outcome = self.process_all(&mut ledger, &mut tally, &cancel).await;

        let status = match &outcome {
            Ok(false) => RunStatus::Cancelled,
            Ok(true) if tally.failed == 0 => RunStatus::Completed,
            _ => RunStatus::Failed,
        };
        let completed_at = Utc::now();
        if let Some(record) = ledger.runs.last_mut() {
            record.completed_at = Some(completed_at);
            record.status = status;
            record.copied = tally.copied;
            record.verified = tally.verified;
            record.failed = tally.failed;
            record.skipped = tally.skipped;
        }
        let saved = self.persist(&mut ledger);
        if ledger_path.is_none() {
            if let Ok(mut slot) = self.memory_ledger.lock() {
                *slot = Some(ledger);
            }
        }
        outcome?;
        saved?;

        let report = MigrationReport {
            run_id,
            status,
            copied: tally.copied,
            verified: tally.verified,
            failed: tally.failed,
            skipped: tally.skipped,
            failed_ids: tally.failed_ids,
            started_at,
            completed_at,
            duration_seconds: clock.elapsed().as_secs_f64(),
        };
        info!(
            "Migration {:?}: {} copied, {} verified, {} failed, {} skipped in {:.1}s",
            report.status,
            report.copied,
            report.verified,
            report.failed,
            report.skipped,
            report.duration_seconds
        );
        Ok(report)
    }

    /// Walk the source page by page. Returns false when cancelled.
    async fn process_all(
        &self,
        ledger: &mut MigrationLedger,
        tally: &mut Tally,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let page_size = i64::try_from(self.options.page_size).unwrap_or(i64::MAX);
        let mut after: Option<DatasetId> = None;

        loop {
            let page = self.source.list_dataset_ids(after.as_ref(), page_size).await?;
            debug!("Enumerated {} dataset id(s)", page.len());

            for id in &page {
                if cancel.is_cancelled() {
                    warn!("Migration cancelled before dataset {}", id);
                    return Ok(false);
                }
                if let Err(e) = self.migrate_dataset(ledger, tally, id).await {
                    error!("Dataset {} failed: {}", id, e);
                    ledger
                        .entry_mut(EntityKind::Dataset, id.as_str())
                        .mark_failed(e.to_string());
                    tally.failed += 1;
                    tally.failed_ids.push(id.to_string());
                }
                self.persist(ledger)?;
            }

            match page.last() {
                Some(last) if page.len() as i64 == page_size => after = Some(last.clone()),
                _ => return Ok(true),
            }
        }
    }

    async fn migrate_dataset(
        &self,
        ledger: &mut MigrationLedger,
        tally: &mut Tally,
        id: &DatasetId,
    ) -> Result<()> {
        let key = id.as_str();

        if ledger.status(EntityKind::Dataset, key) == Some(RecordStatus::Verified) {
            match self.recheck(ledger, id).await? {
                Recheck::Intact => {
                    debug!("Dataset {} already verified", id);
                    tally.skipped += 1;
                    return Ok(());
                }
                Recheck::SourceGone => {
                    info!("Dataset {} no longer exists on the source, skipping", id);
                    tally.skipped += 1;
                    return Ok(());
                }
                Recheck::Changed(reason) => {
                    warn!("Dataset {} was verified earlier but {}; copying again", id, reason);
                    ledger
                        .entry_mut(EntityKind::Dataset, key)
                        .mark_failed(format!("previously verified copy no longer matches: {}", reason));
                }
            }
        }

        let source = match self.source.get_dataset(id).await {
            Ok(dataset) => dataset,
            Err(e) if e.is_not_found() => {
                info!("Dataset {} disappeared from the source, skipping", id);
                tally.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let previous_blob = match self.destination.get_dataset(id).await {
            Ok(existing) => existing.blob_id,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        // A blob copied by an interrupted attempt that no destination dataset uses.
        if let Some(source_blob) = &source.blob_id {
            let leftover = ledger
                .entry(EntityKind::Blob, source_blob.as_str())
                .and_then(|e| e.destination_id.clone())
                .map(BlobId::new)
                .filter(|b| Some(b) != previous_blob.as_ref());
            if let Some(leftover) = leftover {
                debug!("Removing blob {} left by an earlier attempt", leftover);
                self.discard_destination_blob(&leftover).await;
            }
        }

        let new_blob = match &source.blob_id {
            Some(blob_id) => Some(self.copy_blob(ledger, &source, blob_id).await?),
            None => None,
        };

        let fingerprint = source.content_fingerprint();
        let mut draft = source.to_draft();
        draft.blob_id = new_blob.clone();
        if let Err(e) = self.destination.put_dataset(draft).await {
            if let Some(blob) = &new_blob {
                self.discard_destination_blob(blob).await;
            }
            return Err(e);
        }
        ledger
            .entry_mut(EntityKind::Dataset, key)
            .mark_copied(key, fingerprint.clone());
        tally.copied += 1;

        if let Some(stale) = previous_blob.filter(|b| Some(b) != new_blob.as_ref()) {
            debug!("Removing superseded destination blob {}", stale);
            self.discard_destination_blob(&stale).await;
        }

        let copy = self.destination.get_dataset(id).await?;
        let copy_fingerprint = copy.content_fingerprint();
        if copy_fingerprint != fingerprint || copy.blob_id != new_blob {
            return Err(StoreError::Integrity(format!(
                "destination dataset {} does not match the source after copy",
                id
            )));
        }
        ledger
            .entry_mut(EntityKind::Dataset, key)
            .mark_verified(copy_fingerprint);
        tally.verified += 1;
        info!("Dataset {} copied and verified", id);
        Ok(())
    }

    /// Copy a blob and check it round-trips. Returns the destination id.
    async fn copy_blob(
        &self,
        ledger: &mut MigrationLedger,
        owner: &Dataset,
        source_id: &BlobId,
    ) -> Result<BlobId> {
        let key = source_id.as_str();
        let blob = self.source.get_blob(source_id).await.map_err(|e| {
            if e.is_not_found() {
                StoreError::Integrity(format!(
                    "dataset {} references missing blob {}",
                    owner.id, source_id
                ))
            } else {
                e
            }
        })?;

        let source_sum = sha256_hex(&blob.bytes);
        let byte_length = blob.bytes.len();
        let input = BlobInput {
            content_type: blob.metadata.content_type,
            filename: blob.metadata.filename,
            hints: blob.metadata.hints,
        };
        let new_id = match self.destination.put_blob(blob.bytes, input).await {
            Ok(id) => id,
            Err(e) => {
                ledger.entry_mut(EntityKind::Blob, key).mark_failed(e.to_string());
                return Err(e);
            }
        };
        ledger
            .entry_mut(EntityKind::Blob, key)
            .mark_copied(new_id.as_str(), source_sum.clone());

        let checked = match self.destination.get_blob(&new_id).await {
            Ok(copy) => {
                let dest_sum = sha256_hex(&copy.bytes);
                if dest_sum == source_sum {
                    Ok(dest_sum)
                } else {
                    Err(StoreError::CorruptPayload(format!(
                        "blob {} -> {}: checksum {} on source, {} on destination",
                        source_id, new_id, source_sum, dest_sum
                    )))
                }
            }
            Err(e) => Err(e),
        };

        match checked {
            Ok(dest_sum) => {
                ledger
                    .entry_mut(EntityKind::Blob, key)
                    .mark_verified(dest_sum);
                debug!("Blob {} -> {} verified ({} bytes)", source_id, new_id, byte_length);
                Ok(new_id)
            }
            Err(e) => {
                ledger.entry_mut(EntityKind::Blob, key).mark_failed(e.to_string());
                self.discard_destination_blob(&new_id).await;
                Err(e)
            }
        }
    }

    async fn recheck(&self, ledger: &MigrationLedger, id: &DatasetId) -> Result<Recheck> {
        let Some(entry) = ledger.entry(EntityKind::Dataset, id.as_str()) else {
            return Ok(Recheck::Changed("ledger entry is missing".into()));
        };

        let source = match self.source.get_dataset(id).await {
            Ok(d) => d,
            Err(e) if e.is_not_found() => return Ok(Recheck::SourceGone),
            Err(e) => return Err(e),
        };
        let copy = match self.destination.get_dataset(id).await {
            Ok(d) => d,
            Err(e) if e.is_not_found() => {
                return Ok(Recheck::Changed("it is missing on the destination".into()))
            }
            Err(e) => return Err(e),
        };

        let fingerprint = source.content_fingerprint();
        if entry.source_checksum.as_deref() != Some(fingerprint.as_str()) {
            return Ok(Recheck::Changed("the source record changed".into()));
        }
        if copy.content_fingerprint() != fingerprint {
            return Ok(Recheck::Changed("the destination record differs".into()));
        }

        match (&source.blob_id, &copy.blob_id) {
            (None, None) => Ok(Recheck::Intact),
            (Some(src), Some(dst)) => self.recheck_blob(ledger, src, dst).await,
            _ => Ok(Recheck::Changed("the blob reference changed".into())),
        }
    }

    /// Compare stored metadata on both sides against the ledger, then (unless
    /// disabled) re-read the destination payload and compare its checksum.
    async fn recheck_blob(
        &self,
        ledger: &MigrationLedger,
        source_id: &BlobId,
        dest_id: &BlobId,
    ) -> Result<Recheck> {
        let entry = match ledger.entry(EntityKind::Blob, source_id.as_str()) {
            Some(e) if e.status == RecordStatus::Verified => e,
            _ => return Ok(Recheck::Changed("its blob was never verified".into())),
        };
        if entry.destination_id.as_deref() != Some(dest_id.as_str()) {
            return Ok(Recheck::Changed("the destination points at another blob".into()));
        }

        let source = match self.source.head_blob(source_id).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => {
                return Ok(Recheck::Changed("the source blob is missing".into()))
            }
            Err(e) => return Err(e),
        };
        let copy = match self.destination.head_blob(dest_id).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => {
                return Ok(Recheck::Changed("the destination blob is missing".into()))
            }
            Err(e) => return Err(e),
        };

        if source.byte_length != copy.byte_length {
            return Ok(Recheck::Changed("blob lengths differ".into()));
        }
        if let Some(sum) = &source.checksum {
            if entry.source_checksum.as_ref() != Some(sum) {
                return Ok(Recheck::Changed("the source blob checksum changed".into()));
            }
        }
        if let Some(sum) = &copy.checksum {
            if entry.destination_checksum.as_ref() != Some(sum) {
                return Ok(Recheck::Changed("the destination blob checksum differs".into()));
            }
        }

        if self.options.reverify_payloads {
            let payload = match self.destination.get_blob(dest_id).await {
                Ok(blob) => blob,
                Err(e) if e.is_not_found() => {
                    return Ok(Recheck::Changed("the destination blob is missing".into()))
                }
                Err(e @ (StoreError::CorruptPayload(_) | StoreError::Integrity(_))) => {
                    return Ok(Recheck::Changed(format!(
                        "the destination payload is unreadable ({})",
                        e
                    )))
                }
                Err(e) => return Err(e),
            };
            let sum = sha256_hex(&payload.bytes);
            if entry.destination_checksum.as_deref() != Some(sum.as_str()) {
                return Ok(Recheck::Changed("the destination payload checksum differs".into()));
            }
        }
        Ok(Recheck::Intact)
    }

    /// Best-effort removal of a destination blob nothing points at.
    async fn discard_destination_blob(&self, id: &BlobId) {
        match self.destination.delete_blob(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Could not remove destination blob {}: {}", id, e),
        }
    }

    fn persist(&self, ledger: &mut MigrationLedger) -> Result<()> {
        match self.options.ledger_path.as_deref() {
            Some(path) => ledger.save(path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, DocumentConfig, RelationalConfig};
    use crate::core::{Column, ColumnType, DatasetDraft};
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn pair(threshold: usize) -> (Arc<dyn StorageAdapter>, Arc<dyn StorageAdapter>) {
        let mut src = StorageConfig::new(BackendConfig::Document(DocumentConfig::ephemeral("src")));
        src.blob.inline_threshold_bytes = threshold;
        let mut dst =
            StorageConfig::new(BackendConfig::Relational(RelationalConfig::ephemeral("dst")));
        dst.blob.inline_threshold_bytes = threshold;
        (
            Backend::connect(&src).await.unwrap().into_shared(),
            Backend::connect(&dst).await.unwrap().into_shared(),
        )
    }

    async fn seed(store: &Arc<dyn StorageAdapter>, name: &str, payload: &[u8]) -> DatasetId {
        let blob = store
            .put_blob(Bytes::copy_from_slice(payload), BlobInput::new("text/csv", format!("{}.csv", name)))
            .await
            .unwrap();
        store
            .put_dataset(
                DatasetDraft::new(name, "ws-1")
                    .with_row_count(2)
                    .with_columns(vec![Column::new("a", ColumnType::Integer)])
                    .with_blob(blob),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_copies_and_is_idempotent() {
        let (src, dst) = pair(64).await;
        let a = seed(&src, "a", b"a\n1\n2\n").await;
        let _b = seed(&src, "b", &[7u8; 500]).await;
        src.put_dataset(DatasetDraft::new("no-blob", "ws-1")).await.unwrap();

        let engine = MigrationEngine::new(src.clone(), dst.clone(), MigrationConfig::default()).unwrap();
        let first = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!((first.copied, first.verified, first.failed), (3, 3, 0));
        assert!(first.is_success());

        let copy = dst.get_dataset(&a).await.unwrap();
        let original = src.get_dataset(&a).await.unwrap();
        assert_eq!(copy.content_fingerprint(), original.content_fingerprint());
        assert_ne!(copy.blob_id, original.blob_id);

        let second = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!((second.copied, second.verified, second.failed), (0, 0, 0));
        assert_eq!(second.skipped, 3);
        assert_eq!(dst.list_datasets(&"ws-1".into(), 100).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_changed_source_is_recopied_and_stale_blob_removed() {
        let (src, dst) = pair(64).await;
        let id = seed(&src, "a", b"x\n1\n").await;
        let engine = MigrationEngine::new(src.clone(), dst.clone(), MigrationConfig::default()).unwrap();
        engine.run(CancellationToken::new()).await.unwrap();
        let old_copy_blob = dst.get_dataset(&id).await.unwrap().blob_id.unwrap();

        // Re-ingest on the source: new blob, dataset repointed.
        let original = src.get_dataset(&id).await.unwrap();
        let new_blob = src
            .put_blob(Bytes::from_static(b"x\n1\n2\n"), BlobInput::new("text/csv", "a.csv"))
            .await
            .unwrap();
        let mut draft = original.to_draft().with_row_count(3);
        draft.blob_id = Some(new_blob.clone());
        src.put_dataset(draft).await.unwrap();

        let report = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!((report.copied, report.verified, report.failed), (1, 1, 0));
        assert!(!dst.blob_exists(&old_copy_blob).await.unwrap());
        let copy = dst.get_dataset(&id).await.unwrap();
        assert_eq!(dst.get_blob(&copy.blob_id.unwrap()).await.unwrap().bytes, "x\n1\n2\n");
    }

    #[tokio::test]
    async fn test_cancelled_before_first_record() {
        let (src, dst) = pair(64).await;
        seed(&src, "a", b"1").await;
        let engine = MigrationEngine::new(src, dst.clone(), MigrationConfig::default()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = engine.run(cancel).await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(!report.is_success());
        assert_eq!(report.copied, 0);
        let runs = engine.ledger_snapshot().unwrap().runs;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_paginates_past_first_page() {
        let (src, dst) = pair(64).await;
        for i in 0..5 {
            seed(&src, &format!("d{}", i), b"1\n").await;
        }
        let options = MigrationConfig {
            page_size: 2,
            ..MigrationConfig::default()
        };
        let engine = MigrationEngine::new(src, dst, options).unwrap();
        let report = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.copied, 5);
    }

    #[tokio::test]
    async fn test_persisted_ledger_resumes_and_locks() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join("ledger.json");
        let (src, dst) = pair(64).await;
        seed(&src, "a", b"1\n").await;
        let options = MigrationConfig {
            page_size: 10,
            ledger_path: Some(ledger_path.clone()),
            ..MigrationConfig::default()
        };

        let engine = MigrationEngine::new(src.clone(), dst.clone(), options.clone()).unwrap();
        engine.run(CancellationToken::new()).await.unwrap();
        assert!(!lock_path_for(&ledger_path).exists());

        // A fresh engine over the same pair picks up the ledger.
        let again = MigrationEngine::new(src.clone(), dst.clone(), options).unwrap();
        let report = again.run(CancellationToken::new()).await.unwrap();
        assert_eq!((report.copied, report.skipped), (0, 1));

        let ledger = MigrationLedger::load(&ledger_path).unwrap();
        assert_eq!(ledger.runs.len(), 2);
        assert_eq!(ledger.count(EntityKind::Dataset, RecordStatus::Verified), 1);
    }

    #[test]
    fn test_same_store_rejected() {
        let store: Arc<dyn StorageAdapter> = Arc::new(crate::relational::RelationalAdapter::new(
            Arc::new(crate::relational::MemoryRelationalDriver::new()),
            &Default::default(),
            &Default::default(),
            1,
            "relational:memory/x/public",
        ));
        assert!(matches!(
            MigrationEngine::new(store.clone(), store, MigrationConfig::default()),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
