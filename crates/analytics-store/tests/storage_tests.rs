//! Adapter behaviour that must be identical on both backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use analytics_store::config::{BlobConfig, RuntimeConfig};
use analytics_store::document::MemoryDocumentDriver;
use analytics_store::relational::MemoryRelationalDriver;
use analytics_store::{
    BlobId, BlobInput, DatasetDraft, DatasetId, DocumentAdapter, RelationalAdapter,
    StorageAdapter, StoreError, WorkspaceId,
};
use bytes::Bytes;
use common::*;

#[tokio::test]
async fn test_hello_round_trip() {
    for store in both_backends(64).await {
        let id = store
            .put_blob(Bytes::from_static(b"hello"), BlobInput::new("text/plain", "hello.txt"))
            .await
            .unwrap();
        let blob = store.get_blob(&id).await.unwrap();
        assert_eq!(blob.bytes, Bytes::from_static(b"hello"), "{}", store.location());
        assert_eq!(blob.metadata.byte_length, 5);
        assert_eq!(store.head_blob(&id).await.unwrap().byte_length, 5);
    }
}

#[tokio::test]
async fn test_threshold_parity() {
    let threshold = 4096;
    for store in both_backends(threshold).await {
        for (i, len) in [0, 1, threshold - 1, threshold, threshold + 1, threshold * 8]
            .into_iter()
            .enumerate()
        {
            let payload = random_bytes(len, i as u64);
            let id = store
                .put_blob(payload.clone(), BlobInput::new("application/octet-stream", "p.bin"))
                .await
                .unwrap();
            let blob = store.get_blob(&id).await.unwrap();
            assert_eq!(blob.bytes, payload, "{} bytes on {}", len, store.location());
            assert_eq!(blob.metadata.byte_length, len as u64);
        }
    }
}

#[tokio::test]
async fn test_compressible_payload_round_trips() {
    let text = "region,amount\nnorth,10\n".repeat(20_000);
    for store in both_backends(1024).await {
        let id = store
            .put_blob(Bytes::from(text.clone()), BlobInput::new("text/csv", "sales.csv"))
            .await
            .unwrap();
        let head = store.head_blob(&id).await.unwrap();
        assert!(head.compressed);
        assert!(head.stored_length < head.byte_length);
        assert_eq!(store.get_blob(&id).await.unwrap().bytes, text.as_bytes());
    }
}

#[tokio::test]
async fn test_cascade_delete() {
    for store in both_backends(256).await {
        let id = seed_dataset(&store, "cascade", random_bytes(10_000, 7)).await;
        let blob_id = store.get_dataset(&id).await.unwrap().blob_id.unwrap();

        store.delete_dataset(&id).await.unwrap();

        assert!(store.get_dataset(&id).await.unwrap_err().is_not_found());
        assert!(matches!(
            store.get_blob(&blob_id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(!store.blob_exists(&blob_id).await.unwrap());
    }
}

#[tokio::test]
async fn test_delete_missing_is_not_found() {
    for store in both_backends(256).await {
        assert!(matches!(
            store.delete_dataset(&DatasetId::new("missing")).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_blob(&BlobId::new("missing")).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}

#[tokio::test]
async fn test_list_is_scoped_newest_first_and_limited() {
    for store in both_backends(256).await {
        for i in 0..4 {
            let created = chrono::Utc::now() - chrono::Duration::minutes(10 - i);
            store
                .put_dataset(DatasetDraft::new(format!("d{}", i), "ws-a").with_created_at(created))
                .await
                .unwrap();
        }
        store.put_dataset(DatasetDraft::new("other", "ws-b")).await.unwrap();

        let listed = store
            .list_datasets(&WorkspaceId::new("ws-a"), 3)
            .await
            .unwrap();
        let names: Vec<_> = listed.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["d3", "d2", "d1"], "{}", store.location());

        assert!(matches!(
            store.list_datasets(&WorkspaceId::new("ws-a"), 0).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(store
            .list_datasets(&WorkspaceId::new("nobody"), 10)
            .await
            .unwrap()
            .is_empty());
    }
}

#[tokio::test]
async fn test_id_enumeration_is_ordered_and_paged() {
    for store in both_backends(256).await {
        for name in ["c", "a", "e", "b", "d"] {
            store
                .put_dataset(DatasetDraft::new(name, "ws-1").with_id(DatasetId::new(name)))
                .await
                .unwrap();
        }
        let first = store.list_dataset_ids(None, 2).await.unwrap();
        assert_eq!(first, [DatasetId::new("a"), DatasetId::new("b")]);
        let rest = store.list_dataset_ids(first.last(), 10).await.unwrap();
        assert_eq!(rest, [DatasetId::new("c"), DatasetId::new("d"), DatasetId::new("e")]);
    }
}

#[tokio::test]
async fn test_validation_rejected_on_both() {
    for store in both_backends(256).await {
        assert!(matches!(
            store.put_dataset(DatasetDraft::new("", "ws-1")).await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            store
                .put_dataset(DatasetDraft::new("x", "ws-1").with_blob(BlobId::new("ghost")))
                .await,
            Err(StoreError::Validation(_))
        ));
    }
}

#[tokio::test]
async fn test_large_payload_round_trips() {
    let payload = random_bytes(5 * 1024 * 1024, 42);
    for store in both_backends(256 * 1024).await {
        let id = store
            .put_blob(payload.clone(), BlobInput::new("application/x-parquet", "frame.parquet"))
            .await
            .unwrap();
        assert_eq!(store.get_blob(&id).await.unwrap().bytes, payload);
    }
}

#[tokio::test]
async fn test_repointed_dataset_leaves_old_blob_for_caller_to_delete() {
    for store in both_backends(1024).await {
        let old = store
            .put_blob(random_bytes(4096, 1), BlobInput::new("application/octet-stream", "v1.bin"))
            .await
            .unwrap();
        let ds = store
            .put_dataset(DatasetDraft::new("versioned", "ws-1").with_blob(old.clone()))
            .await
            .unwrap();

        let new = store
            .put_blob(random_bytes(4096, 2), BlobInput::new("application/octet-stream", "v2.bin"))
            .await
            .unwrap();
        let mut draft = store.get_dataset(&ds).await.unwrap().to_draft();
        draft.blob_id = Some(new.clone());
        store.put_dataset(draft).await.unwrap();

        // The current blob is protected, the superseded one is not.
        assert!(matches!(
            store.delete_blob(&new).await,
            Err(StoreError::Validation(_))
        ));
        store.delete_blob(&old).await.unwrap();
        assert!(!store.blob_exists(&old).await.unwrap());

        let current = store.get_dataset(&ds).await.unwrap();
        assert_eq!(current.blob_id, Some(new.clone()));
        assert!(store.get_blob(&new).await.is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callers_on_distinct_ids_proceed_independently() {
    for store in both_backends(1024).await {
        let work = (0..16u64).map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let payload = random_bytes(512 + (i as usize) * 300, i);
                let blob = store
                    .put_blob(payload.clone(), BlobInput::new("application/octet-stream", "c.bin"))
                    .await?;
                let ds = store
                    .put_dataset(DatasetDraft::new(format!("c{}", i), "ws-conc").with_blob(blob))
                    .await?;
                let read = store.get_dataset(&ds).await?;
                let bytes = store.get_blob(&read.blob_id.unwrap()).await?.bytes;
                assert_eq!(bytes, payload);
                Ok::<_, StoreError>(ds)
            })
        });
        let ids: Vec<DatasetId> = futures::future::join_all(work)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let listed = store.list_datasets(&"ws-conc".into(), 100).await.unwrap();
        assert_eq!(listed.len(), ids.len(), "{}", store.location());
    }
}

fn single_session_runtime() -> RuntimeConfig {
    RuntimeConfig {
        pool_wait_timeout_ms: 50,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        ..RuntimeConfig::default()
    }
}

async fn assert_second_caller_times_out(store: Arc<dyn StorageAdapter>) {
    let busy = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.health_check().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    let err = store.health_check().await.unwrap_err();
    assert!(matches!(err, StoreError::BackendUnavailable(_)), "{}", err);
    assert!(err.to_string().contains("pool exhausted"));
    assert!(started.elapsed() < Duration::from_millis(400));

    busy.await.unwrap().unwrap();
    // The slot is free again.
    store.health_check().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_pool_fails_promptly_on_document_store() {
    let driver = Arc::new(MemoryDocumentDriver::new(64));
    let adapter = DocumentAdapter::new(
        driver.clone(),
        &BlobConfig::default(),
        &single_session_runtime(),
        1,
        "document:memory/single",
    );
    driver.set_ping_latency(Duration::from_millis(500));
    let store: Arc<dyn StorageAdapter> = Arc::new(adapter);
    assert_second_caller_times_out(store.clone()).await;
}

#[tokio::test]
async fn test_exhausted_pool_fails_promptly_on_relational_store() {
    let driver = Arc::new(MemoryRelationalDriver::new());
    let adapter = RelationalAdapter::new(
        driver.clone(),
        &BlobConfig::default(),
        &single_session_runtime(),
        1,
        "relational:memory/single",
    );
    driver.set_ping_latency(Duration::from_millis(500));
    let store: Arc<dyn StorageAdapter> = Arc::new(adapter);
    assert_second_caller_times_out(store.clone()).await;
}
