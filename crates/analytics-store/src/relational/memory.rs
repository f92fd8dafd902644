//! In-process relational store with the same constraints as the SQL schema.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::driver::{BlobPayload, RelationalDriver};
use crate::codec::StoragePath;
use crate::core::{BlobMetadata, Dataset};
use crate::error::{Result, StoreError};

#[derive(Clone)]
enum PayloadRow {
    Inline(Bytes),
    LargeObject(u32),
}

#[derive(Default)]
struct Tables {
    datasets: BTreeMap<String, Dataset>,
    blobs: HashMap<String, BlobMetadata>,
    payloads: HashMap<String, PayloadRow>,
    large_objects: HashMap<u32, Bytes>,
    next_oid: u32,
}

impl Tables {
    fn unlink_payload(&mut self, blob_id: &str) {
        if let Some(PayloadRow::LargeObject(oid)) = self.payloads.remove(blob_id) {
            self.large_objects.remove(&oid);
        }
    }
}

pub struct MemoryRelationalDriver {
    tables: Mutex<Tables>,
    available: AtomicBool,
    fail_next: AtomicU32,
    ping_latency_ms: AtomicU64,
}

impl Default for MemoryRelationalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelationalDriver {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_oid: 16384,
                ..Tables::default()
            }),
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            ping_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `BackendUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every ping take `latency`, holding its session meanwhile.
    pub fn set_ping_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.ping_latency_ms.store(ms, Ordering::SeqCst);
    }

    pub fn large_object_count(&self) -> usize {
        self.lock().map(|t| t.large_objects.len()).unwrap_or_default()
    }

    pub fn blob_count(&self) -> usize {
        self.lock().map(|t| t.blobs.len()).unwrap_or_default()
    }

    /// Whether the blob's payload went to a large object.
    pub fn is_large_object(&self, blob_id: &str) -> bool {
        self.lock()
            .map(|t| matches!(t.payloads.get(blob_id), Some(PayloadRow::LargeObject(_))))
            .unwrap_or(false)
    }

    /// Flip the first byte of a stored payload.
    pub fn corrupt_blob(&self, blob_id: &str) -> bool {
        let Ok(mut tables) = self.lock() else {
            return false;
        };
        let target = match tables.payloads.get(blob_id).cloned() {
            Some(row) => row,
            None => return false,
        };
        let flip = |bytes: &Bytes| {
            let mut data = bytes.to_vec();
            if let Some(b) = data.first_mut() {
                *b ^= 0xFF;
            }
            Bytes::from(data)
        };
        match target {
            PayloadRow::Inline(bytes) => {
                tables
                    .payloads
                    .insert(blob_id.to_string(), PayloadRow::Inline(flip(&bytes)));
            }
            PayloadRow::LargeObject(oid) => {
                let Some(bytes) = tables.large_objects.get(&oid).cloned() else {
                    return false;
                };
                tables.large_objects.insert(oid, flip(&bytes));
            }
        }
        true
    }

    /// Unlink a blob's large object without touching its rows.
    pub fn drop_large_object(&self, blob_id: &str) -> bool {
        let Ok(mut tables) = self.lock() else {
            return false;
        };
        match tables.payloads.get(blob_id).cloned() {
            Some(PayloadRow::LargeObject(oid)) => tables.large_objects.remove(&oid).is_some(),
            _ => false,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::backend("relational", "in-memory store lock poisoned"))
    }

    fn check(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::BackendUnavailable(
                "relational store is not reachable".into(),
            ));
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_next
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::BackendUnavailable("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RelationalDriver for MemoryRelationalDriver {
    async fn ping(&self) -> Result<()> {
        let latency = self.ping_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check()
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.check()
    }

    async fn upsert_dataset(&self, dataset: &Dataset) -> Result<()> {
        self.check()?;
        let mut tables = self.lock()?;
        if let Some(blob_id) = &dataset.blob_id {
            if !tables.blobs.contains_key(blob_id.as_str()) {
                return Err(StoreError::Validation(format!(
                    "foreign key violation: blob {} does not exist",
                    blob_id
                )));
            }
            let taken = tables
                .datasets
                .values()
                .any(|d| d.id != dataset.id && d.blob_id.as_ref() == Some(blob_id));
            if taken {
                return Err(StoreError::Validation(format!(
                    "unique violation: blob {} is already referenced",
                    blob_id
                )));
            }
        }
        tables
            .datasets
            .insert(dataset.id.to_string(), dataset.clone());
        Ok(())
    }

    async fn find_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        self.check()?;
        Ok(self.lock()?.datasets.get(id).cloned())
    }

    async fn find_datasets(&self, workspace_id: &str, limit: i64) -> Result<Vec<Dataset>> {
        self.check()?;
        let tables = self.lock()?;
        let mut rows: Vec<Dataset> = tables
            .datasets
            .values()
            .filter(|d| d.workspace_id.as_str() == workspace_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn find_dataset_ids(&self, after: Option<&str>, limit: i64) -> Result<Vec<String>> {
        self.check()?;
        let tables = self.lock()?;
        Ok(tables
            .datasets
            .keys()
            .filter(|id| after.map_or(true, |a| id.as_str() > a))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn find_dataset_by_blob(&self, blob_id: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self
            .lock()?
            .datasets
            .values()
            .find(|d| d.blob_id.as_ref().map(|b| b.as_str()) == Some(blob_id))
            .map(|d| d.id.to_string()))
    }

    async fn delete_dataset_cascade(&self, id: &str) -> Result<bool> {
        self.check()?;
        let mut tables = self.lock()?;
        let Some(dataset) = tables.datasets.remove(id) else {
            return Ok(false);
        };
        if let Some(blob_id) = dataset.blob_id {
            tables.blobs.remove(blob_id.as_str());
            tables.unlink_payload(blob_id.as_str());
        }
        Ok(true)
    }

    async fn insert_blob(&self, metadata: &BlobMetadata, payload: BlobPayload) -> Result<()> {
        self.check()?;
        let mut tables = self.lock()?;
        let id = metadata.id.to_string();
        if tables.blobs.contains_key(&id) {
            return Err(StoreError::Validation(format!(
                "unique violation: blob {} already exists",
                id
            )));
        }
        let row = match payload.path {
            StoragePath::Inline => PayloadRow::Inline(payload.bytes),
            StoragePath::LargeObject => {
                let oid = tables.next_oid;
                tables.next_oid = oid.wrapping_add(1);
                tables.large_objects.insert(oid, payload.bytes);
                PayloadRow::LargeObject(oid)
            }
        };
        tables.blobs.insert(id.clone(), metadata.clone());
        tables.payloads.insert(id, row);
        Ok(())
    }

    async fn find_blob(&self, id: &str) -> Result<Option<BlobMetadata>> {
        self.check()?;
        Ok(self.lock()?.blobs.get(id).cloned())
    }

    async fn read_payload(&self, id: &str) -> Result<Option<Bytes>> {
        self.check()?;
        let tables = self.lock()?;
        if !tables.blobs.contains_key(id) {
            return Ok(None);
        }
        match tables.payloads.get(id) {
            Some(PayloadRow::Inline(bytes)) => Ok(Some(bytes.clone())),
            Some(PayloadRow::LargeObject(oid)) => tables
                .large_objects
                .get(oid)
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    StoreError::Integrity(format!("blob {} references missing large object {}", id, oid))
                }),
            None => Err(StoreError::Integrity(format!("blob {} has no payload row", id))),
        }
    }

    async fn delete_blob(&self, id: &str) -> Result<bool> {
        self.check()?;
        let mut tables = self.lock()?;
        if tables
            .datasets
            .values()
            .any(|d| d.blob_id.as_ref().map(|b| b.as_str()) == Some(id))
        {
            return Err(StoreError::Validation(format!(
                "foreign key violation: blob {} is still referenced",
                id
            )));
        }
        if tables.blobs.remove(id).is_none() {
            return Ok(false);
        }
        tables.unlink_payload(id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlobId, DatasetDraft};
    use chrono::Utc;

    fn metadata(id: &str) -> BlobMetadata {
        BlobMetadata {
            id: BlobId::new(id),
            content_type: "application/octet-stream".into(),
            filename: "f".into(),
            byte_length: 3,
            stored_length: 3,
            checksum: None,
            compressed: false,
            hints: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cascade_unlinks_large_object() {
        let driver = MemoryRelationalDriver::new();
        driver
            .insert_blob(
                &metadata("b1"),
                BlobPayload {
                    path: StoragePath::LargeObject,
                    bytes: Bytes::from_static(b"abc"),
                },
            )
            .await
            .unwrap();
        assert_eq!(driver.large_object_count(), 1);

        let dataset = DatasetDraft::new("d", "ws")
            .with_blob(BlobId::new("b1"))
            .into_dataset(None);
        driver.upsert_dataset(&dataset).await.unwrap();

        assert!(matches!(
            driver.delete_blob("b1").await,
            Err(StoreError::Validation(_))
        ));
        assert!(driver.delete_dataset_cascade(dataset.id.as_str()).await.unwrap());
        assert_eq!(driver.large_object_count(), 0);
        assert_eq!(driver.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_dataset_with_unknown_blob_rejected() {
        let driver = MemoryRelationalDriver::new();
        let dataset = DatasetDraft::new("d", "ws")
            .with_blob(BlobId::new("missing"))
            .into_dataset(None);
        assert!(matches!(
            driver.upsert_dataset(&dataset).await,
            Err(StoreError::Validation(_))
        ));
    }
}
