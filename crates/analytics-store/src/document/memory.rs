//! In-process document store.
//!
//! Mirrors the MongoDB layout closely enough to exercise the adapter: records
//! live in per-collection maps, large objects are split into fixed-size
//! chunks, and the unique index on `datasets.blob_id` is enforced. Outages and
//! transient failures can be simulated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;

use super::driver::{BlobDocument, DatasetDocument, DocumentDriver};
use crate::error::{Result, StoreError};

struct StoredFile {
    chunks: Vec<Bytes>,
    length: usize,
    uploaded_at_ms: i64,
}

#[derive(Default)]
struct Collections {
    datasets: BTreeMap<String, DatasetDocument>,
    blobs: HashMap<String, BlobDocument>,
    files: HashMap<String, StoredFile>,
    /// Blob to mark as deleting right after the next dataset write.
    mark_after_dataset_write: Option<String>,
}

pub struct MemoryDocumentDriver {
    chunk_size: usize,
    state: Mutex<Collections>,
    available: AtomicBool,
    fail_next: AtomicU32,
    ping_latency_ms: AtomicU64,
}

impl MemoryDocumentDriver {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            state: Mutex::new(Collections::default()),
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            ping_latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every call fails with `BackendUnavailable`.
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

    pub fn file_count(&self) -> usize {
        self.lock().map(|s| s.files.len()).unwrap_or_default()
    }

    pub fn blob_count(&self) -> usize {
        self.lock().map(|s| s.blobs.len()).unwrap_or_default()
    }

    /// Number of chunks a stored file was split into.
    pub fn chunk_count(&self, file_id: &str) -> Option<usize> {
        self.lock()
            .ok()
            .and_then(|s| s.files.get(file_id).map(|f| f.chunks.len()))
    }

    /// Flip one byte of a stored payload, wherever it lives.
    pub fn corrupt_blob(&self, blob_id: &str) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        let Some(doc) = state.blobs.get(blob_id).cloned() else {
            return false;
        };
        if let Some(mut data) = doc.inline_data.clone() {
            if let Some(b) = data.bytes.first_mut() {
                *b ^= 0xFF;
            }
            if let Some(stored) = state.blobs.get_mut(blob_id) {
                stored.inline_data = Some(data);
            }
            return true;
        }
        if let Some(file_id) = &doc.file_id {
            if let Some(file) = state.files.get_mut(file_id) {
                if let Some(first) = file.chunks.first_mut() {
                    let mut chunk = first.to_vec();
                    if let Some(b) = chunk.first_mut() {
                        *b ^= 0xFF;
                    }
                    *first = Bytes::from(chunk);
                    return true;
                }
            }
        }
        false
    }

    /// Mark `blob_id` as deleting immediately after the next dataset write,
    /// as a concurrent `delete_blob` landing in that window would.
    pub fn mark_blob_after_next_dataset_write(&self, blob_id: &str) {
        if let Ok(mut state) = self.lock() {
            state.mark_after_dataset_write = Some(blob_id.to_string());
        }
    }

    /// Drop a large-object file behind the adapter's back.
    pub fn remove_file(&self, file_id: &str) -> bool {
        self.lock()
            .map(|mut s| s.files.remove(file_id).is_some())
            .unwrap_or(false)
    }

    /// Store a file that no blob references, as an interrupted upload would.
    pub fn insert_orphan_file(&self, bytes: Bytes, uploaded_at_ms: i64) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let file = self.chunk(bytes, uploaded_at_ms);
        self.lock()?.files.insert(id.clone(), file);
        Ok(id)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Collections>> {
        self.state
            .lock()
            .map_err(|_| StoreError::backend("document", "in-memory store lock poisoned"))
    }

    fn check(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::BackendUnavailable(
                "document store is not reachable".into(),
            ));
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_next
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::BackendUnavailable(
                "simulated transient failure".into(),
            ));
        }
        Ok(())
    }

    fn chunk(&self, bytes: Bytes, uploaded_at_ms: i64) -> StoredFile {
        let length = bytes.len();
        let mut chunks = Vec::with_capacity(length / self.chunk_size + 1);
        let mut offset = 0;
        while offset < length {
            let end = (offset + self.chunk_size).min(length);
            chunks.push(bytes.slice(offset..end));
            offset = end;
        }
        StoredFile {
            chunks,
            length,
            uploaded_at_ms,
        }
    }
}

#[async_trait]
impl DocumentDriver for MemoryDocumentDriver {
    async fn ping(&self) -> Result<()> {
        let latency = self.ping_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check()
    }

    async fn ensure_indexes(&self) -> Result<()> {
        self.check()
    }

    async fn upsert_dataset(&self, doc: DatasetDocument) -> Result<()> {
        self.check()?;
        let mut state = self.lock()?;
        if let Some(blob_id) = &doc.blob_id {
            let clash = state
                .datasets
                .values()
                .any(|d| d.id != doc.id && d.blob_id.as_deref() == Some(blob_id.as_str()));
            if clash {
                return Err(StoreError::Validation(format!(
                    "duplicate key: blob {} is already referenced",
                    blob_id
                )));
            }
        }
        state.datasets.insert(doc.id.clone(), doc);
        if let Some(blob_id) = state.mark_after_dataset_write.take() {
            let now = Utc::now().timestamp_millis();
            if let Some(blob) = state.blobs.get_mut(&blob_id) {
                blob.deleting_since.get_or_insert(now);
            }
        }
        Ok(())
    }

    async fn find_dataset(&self, id: &str) -> Result<Option<DatasetDocument>> {
        self.check()?;
        Ok(self.lock()?.datasets.get(id).cloned())
    }

    async fn find_datasets(&self, workspace_id: &str, limit: i64) -> Result<Vec<DatasetDocument>> {
        self.check()?;
        let state = self.lock()?;
        let mut docs: Vec<DatasetDocument> = state
            .datasets
            .values()
            .filter(|d| d.workspace_id == workspace_id && !d.is_deleting())
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        docs.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(docs)
    }

    async fn find_dataset_ids(&self, after: Option<&str>, limit: i64) -> Result<Vec<String>> {
        self.check()?;
        let state = self.lock()?;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(state
            .datasets
            .values()
            .filter(|d| !d.is_deleting())
            .filter(|d| after.map_or(true, |a| d.id.as_str() > a))
            .take(limit)
            .map(|d| d.id.clone())
            .collect())
    }

    async fn find_dataset_by_blob(&self, blob_id: &str) -> Result<Option<DatasetDocument>> {
        self.check()?;
        Ok(self
            .lock()?
            .datasets
            .values()
            .find(|d| d.blob_id.as_deref() == Some(blob_id))
            .cloned())
    }

    async fn mark_dataset_deleting(&self, id: &str, at_ms: i64) -> Result<bool> {
        self.check()?;
        let mut state = self.lock()?;
        match state.datasets.get_mut(id) {
            Some(doc) if doc.deleting_since.is_none() => {
                doc.deleting_since = Some(at_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_dataset(&self, id: &str) -> Result<bool> {
        self.check()?;
        Ok(self.lock()?.datasets.remove(id).is_some())
    }

    async fn find_stale_deletions(&self, cutoff_ms: i64) -> Result<Vec<DatasetDocument>> {
        self.check()?;
        Ok(self
            .lock()?
            .datasets
            .values()
            .filter(|d| d.deleting_since.map_or(false, |t| t <= cutoff_ms))
            .cloned()
            .collect())
    }

    async fn upsert_blob(&self, doc: BlobDocument) -> Result<()> {
        self.check()?;
        self.lock()?.blobs.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn find_blob(&self, id: &str) -> Result<Option<BlobDocument>> {
        self.check()?;
        Ok(self.lock()?.blobs.get(id).cloned())
    }

    async fn delete_blob(&self, id: &str) -> Result<bool> {
        self.check()?;
        Ok(self.lock()?.blobs.remove(id).is_some())
    }

    async fn mark_blob_deleting(&self, id: &str, at_ms: i64) -> Result<bool> {
        self.check()?;
        let mut state = self.lock()?;
        match state.blobs.get_mut(id) {
            Some(doc) if doc.deleting_since.is_none() => {
                doc.deleting_since = Some(at_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_blob_deleting(&self, id: &str) -> Result<bool> {
        self.check()?;
        let mut state = self.lock()?;
        Ok(state
            .blobs
            .get_mut(id)
            .and_then(|doc| doc.deleting_since.take())
            .is_some())
    }

    async fn find_stale_blob_deletions(&self, cutoff_ms: i64) -> Result<Vec<BlobDocument>> {
        self.check()?;
        Ok(self
            .lock()?
            .blobs
            .values()
            .filter(|b| b.deleting_since.map_or(false, |t| t <= cutoff_ms))
            .cloned()
            .collect())
    }

    async fn upload_file(&self, _filename: &str, bytes: Bytes) -> Result<String> {
        self.check()?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let file = self.chunk(bytes, Utc::now().timestamp_millis());
        self.lock()?.files.insert(id.clone(), file);
        Ok(id)
    }

    async fn download_file(&self, file_id: &str) -> Result<Option<Bytes>> {
        self.check()?;
        let state = self.lock()?;
        Ok(state.files.get(file_id).map(|file| {
            let mut out = BytesMut::with_capacity(file.length);
            for chunk in &file.chunks {
                out.extend_from_slice(chunk);
            }
            out.freeze()
        }))
    }

    async fn delete_file(&self, file_id: &str) -> Result<bool> {
        self.check()?;
        Ok(self.lock()?.files.remove(file_id).is_some())
    }

    async fn find_files(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .lock()?
            .files
            .iter()
            .filter(|(_, f)| f.uploaded_at_ms <= cutoff_ms)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn referenced_file_ids(&self) -> Result<HashSet<String>> {
        self.check()?;
        Ok(self
            .lock()?
            .blobs
            .values()
            .filter_map(|b| b.file_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_is_chunked_and_reassembled() {
        let driver = MemoryDocumentDriver::new(4);
        let id = driver
            .upload_file("f", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(driver.chunk_count(&id), Some(3));
        let back = driver.download_file(&id).await.unwrap().unwrap();
        assert_eq!(&back[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_outage_and_transient_failures() {
        let driver = MemoryDocumentDriver::new(8);
        driver.set_available(false);
        assert!(matches!(
            driver.ping().await,
            Err(StoreError::BackendUnavailable(_))
        ));
        driver.set_available(true);

        driver.fail_next(2);
        assert!(driver.ping().await.is_err());
        assert!(driver.ping().await.is_err());
        assert!(driver.ping().await.is_ok());
    }
}
