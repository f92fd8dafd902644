//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use analytics_store::config::{BackendConfig, DocumentConfig, RelationalConfig};
use analytics_store::{
    Backend, BlobInput, Column, ColumnType, DatasetDraft, DatasetId, StorageAdapter, StorageConfig,
};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub fn document_config(name: &str, threshold: usize) -> StorageConfig {
    let mut config = StorageConfig::new(BackendConfig::Document(DocumentConfig::ephemeral(name)));
    config.blob.inline_threshold_bytes = threshold;
    config
}

pub fn relational_config(name: &str, threshold: usize) -> StorageConfig {
    let mut config =
        StorageConfig::new(BackendConfig::Relational(RelationalConfig::ephemeral(name)));
    config.blob.inline_threshold_bytes = threshold;
    config
}

pub async fn connect(config: &StorageConfig) -> Arc<dyn StorageAdapter> {
    Backend::connect(config).await.unwrap().into_shared()
}

/// Both backends with the same threshold.
pub async fn both_backends(threshold: usize) -> Vec<Arc<dyn StorageAdapter>> {
    vec![
        connect(&document_config("parity", threshold)).await,
        connect(&relational_config("parity", threshold)).await,
    ]
}

/// Incompressible payload of `len` bytes.
pub fn random_bytes(len: usize, seed: u64) -> Bytes {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    Bytes::from(buf)
}

/// Store a blob and a dataset pointing at it.
pub async fn seed_dataset(
    store: &Arc<dyn StorageAdapter>,
    name: &str,
    payload: Bytes,
) -> DatasetId {
    let blob = store
        .put_blob(payload, BlobInput::new("application/octet-stream", format!("{}.bin", name)))
        .await
        .unwrap();
    store
        .put_dataset(
            DatasetDraft::new(name, "ws-1")
                .with_row_count(10)
                .with_columns(vec![
                    Column::new("id", ColumnType::Integer),
                    Column::new("label", ColumnType::Text),
                ])
                .with_blob(blob),
        )
        .await
        .unwrap()
}
