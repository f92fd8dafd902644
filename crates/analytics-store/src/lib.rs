//! # analytics-store
//!
//! Backend-neutral storage for dataset records and the binary payloads
//! (uploaded files, serialized frames) that back them.
//!
//! Two interchangeable backends sit behind one [`StorageAdapter`] interface:
//!
//! - **Document**: MongoDB collections, with payloads above the inline
//!   threshold chunked into GridFS
//! - **Relational**: PostgreSQL tables, with payloads above the threshold
//!   offloaded to large objects
//!
//! The backend is chosen once per process from configuration
//! ([`Backend::connect`]). [`MigrationEngine`] copies every dataset and blob
//! between two backends with per-record verification and a resumable ledger.
//!
//! ## Example
//!
//! ```rust,no_run
//! use analytics_store::{Backend, BlobInput, DatasetDraft, StorageAdapter, StorageConfig};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> analytics_store::Result<()> {
//!     let config = StorageConfig::load("storage.yaml")?;
//!     let store = Backend::connect(&config).await?;
//!
//!     let blob = store
//!         .put_blob(Bytes::from_static(b"a,b\n1,2\n"), BlobInput::new("text/csv", "ab.csv"))
//!         .await?;
//!     let id = store
//!         .put_dataset(DatasetDraft::new("ab.csv", "ws-1").with_row_count(1).with_blob(blob))
//!         .await?;
//!     println!("stored dataset {}", id);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod codec;
pub mod config;
pub mod core;
pub mod document;
pub mod error;
pub mod migrate;
pub mod relational;
pub mod selector;

// Re-exports for convenient access
pub use adapter::StorageAdapter;
pub use codec::{BlobCodec, StoragePath};
pub use config::{BackendConfig, BackendKind, MigrationConfig, StorageConfig};
pub use core::{
    Blob, BlobId, BlobInput, BlobMetadata, Column, ColumnType, Dataset, DatasetDraft, DatasetId,
    WorkspaceId,
};
pub use document::{DocumentAdapter, ReconcileReport};
pub use error::{Result, StoreError};
pub use migrate::{MigrationEngine, MigrationLedger, MigrationReport, RunStatus};
pub use relational::RelationalAdapter;
pub use selector::Backend;
