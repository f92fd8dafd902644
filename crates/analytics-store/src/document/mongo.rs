//! MongoDB driver: `datasets` and `blobs` collections plus a GridFS bucket for
//! large payloads.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson};
use bytes::Bytes;
use futures::io::Cursor;
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, GridFsErrorKind, WriteFailure};
use mongodb::gridfs::GridFsBucket;
use mongodb::options::{
    ClientOptions, FindOptions, GridFsBucketOptions, GridFsUploadOptions, IndexOptions,
    ReplaceOptions,
};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info};

use super::driver::{BlobDocument, DatasetDocument, DocumentDriver};
use crate::config::DocumentConfig;
use crate::error::{Result, StoreError};

const DATASETS: &str = "datasets";
const BLOBS: &str = "blobs";
const DUPLICATE_KEY: i32 = 11000;

/// Server codes that indicate a failover or shutdown rather than a bad request.
const TRANSIENT_CODES: &[i32] = &[6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436];

pub struct MongoDriver {
    db: Database,
    bucket: GridFsBucket,
    chunk_size: u32,
}

impl MongoDriver {
    /// Create a client for the configured deployment. Connections are opened
    /// lazily; call `ping` to verify reachability.
    pub async fn connect(config: &DocumentConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| StoreError::Config(format!("document.uri: {}", e)))?;

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        options.app_name = Some("analytics-store".to_string());
        options.max_pool_size = Some(config.get_pool_size() as u32);
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);

        let client = Client::with_options(options).map_err(map_mongo_error)?;
        let db = client.database(&config.database);

        let bucket_options = GridFsBucketOptions::builder()
            .bucket_name(config.bucket.clone())
            .chunk_size_bytes(config.chunk_size_bytes)
            .build();
        let bucket = db.gridfs_bucket(bucket_options);

        info!(
            "MongoDB client ready: database={} bucket={} pool={}",
            config.database,
            config.bucket,
            config.get_pool_size()
        );

        Ok(Self {
            db,
            bucket,
            chunk_size: config.chunk_size_bytes,
        })
    }

    fn datasets(&self) -> Collection<DatasetDocument> {
        self.db.collection(DATASETS)
    }

    fn blobs(&self) -> Collection<BlobDocument> {
        self.db.collection(BLOBS)
    }
}

#[async_trait]
impl DocumentDriver for MongoDriver {
    async fn ping(&self) -> Result<()> {
        self.db
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let owner = IndexModel::builder()
            .keys(doc! { "blob_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("blob_owner_unique".to_string())
                    .unique(true)
                    .partial_filter_expression(doc! { "blob_id": { "$type": "string" } })
                    .build(),
            )
            .build();
        let listing = IndexModel::builder()
            .keys(doc! { "workspace_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("workspace_created".to_string())
                    .build(),
            )
            .build();

        self.datasets()
            .create_indexes([owner, listing], None)
            .await
            .map_err(map_mongo_error)?;
        debug!("MongoDB indexes ensured");
        Ok(())
    }

    async fn upsert_dataset(&self, doc: DatasetDocument) -> Result<()> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.datasets()
            .replace_one(doc! { "_id": doc.id.as_str() }, &doc, options)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn find_dataset(&self, id: &str) -> Result<Option<DatasetDocument>> {
        self.datasets()
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(map_mongo_error)
    }

    async fn find_datasets(&self, workspace_id: &str, limit: i64) -> Result<Vec<DatasetDocument>> {
        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1, "_id": 1 })
            .limit(limit)
            .build();
        let filter = doc! {
            "workspace_id": workspace_id,
            "deleting_since": { "$exists": false },
        };
        let cursor = self
            .datasets()
            .find(filter, options)
            .await
            .map_err(map_mongo_error)?;
        cursor.try_collect().await.map_err(map_mongo_error)
    }

    async fn find_dataset_ids(&self, after: Option<&str>, limit: i64) -> Result<Vec<String>> {
        let mut filter = doc! { "deleting_since": { "$exists": false } };
        if let Some(after) = after {
            filter.insert("_id", doc! { "$gt": after });
        }
        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .limit(limit)
            .projection(doc! { "_id": 1 })
            .build();

        let mut cursor = self
            .db
            .collection::<bson::Document>(DATASETS)
            .find(filter, options)
            .await
            .map_err(map_mongo_error)?;

        let mut ids = Vec::new();
        while let Some(row) = cursor.try_next().await.map_err(map_mongo_error)? {
            match row.get_str("_id") {
                Ok(id) => ids.push(id.to_string()),
                Err(e) => {
                    return Err(StoreError::Integrity(format!(
                        "dataset with non-string _id: {}",
                        e
                    )))
                }
            }
        }
        Ok(ids)
    }

    async fn find_dataset_by_blob(&self, blob_id: &str) -> Result<Option<DatasetDocument>> {
        self.datasets()
            .find_one(doc! { "blob_id": blob_id }, None)
            .await
            .map_err(map_mongo_error)
    }

    async fn mark_dataset_deleting(&self, id: &str, at_ms: i64) -> Result<bool> {
        let result = self
            .datasets()
            .update_one(
                doc! { "_id": id, "deleting_since": { "$exists": false } },
                doc! { "$set": { "deleting_since": at_ms } },
                None,
            )
            .await
            .map_err(map_mongo_error)?;
        Ok(result.modified_count == 1)
    }

    async fn delete_dataset(&self, id: &str) -> Result<bool> {
        let result = self
            .datasets()
            .delete_one(doc! { "_id": id }, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(result.deleted_count == 1)
    }

    async fn find_stale_deletions(&self, cutoff_ms: i64) -> Result<Vec<DatasetDocument>> {
        let cursor = self
            .datasets()
            .find(doc! { "deleting_since": { "$lte": cutoff_ms } }, None)
            .await
            .map_err(map_mongo_error)?;
        cursor.try_collect().await.map_err(map_mongo_error)
    }

    async fn upsert_blob(&self, doc: BlobDocument) -> Result<()> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.blobs()
            .replace_one(doc! { "_id": doc.id.as_str() }, &doc, options)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn find_blob(&self, id: &str) -> Result<Option<BlobDocument>> {
        self.blobs()
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(map_mongo_error)
    }

    async fn delete_blob(&self, id: &str) -> Result<bool> {
        let result = self
            .blobs()
            .delete_one(doc! { "_id": id }, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(result.deleted_count == 1)
    }

    async fn mark_blob_deleting(&self, id: &str, at_ms: i64) -> Result<bool> {
        let result = self
            .blobs()
            .update_one(
                doc! { "_id": id, "deleting_since": { "$exists": false } },
                doc! { "$set": { "deleting_since": at_ms } },
                None,
            )
            .await
            .map_err(map_mongo_error)?;
        Ok(result.modified_count == 1)
    }

    async fn clear_blob_deleting(&self, id: &str) -> Result<bool> {
        let result = self
            .blobs()
            .update_one(
                doc! { "_id": id, "deleting_since": { "$exists": true } },
                doc! { "$unset": { "deleting_since": "" } },
                None,
            )
            .await
            .map_err(map_mongo_error)?;
        Ok(result.modified_count == 1)
    }

    async fn find_stale_blob_deletions(&self, cutoff_ms: i64) -> Result<Vec<BlobDocument>> {
        let cursor = self
            .blobs()
            .find(doc! { "deleting_since": { "$lte": cutoff_ms } }, None)
            .await
            .map_err(map_mongo_error)?;
        cursor.try_collect().await.map_err(map_mongo_error)
    }

    async fn upload_file(&self, filename: &str, bytes: Bytes) -> Result<String> {
        let options = GridFsUploadOptions::builder()
            .chunk_size_bytes(self.chunk_size)
            .build();
        let len = bytes.len();
        let id = self
            .bucket
            .upload_from_futures_0_3_reader(filename, Cursor::new(bytes), options)
            .await
            .map_err(map_mongo_error)?;
        debug!("GridFS upload {} ({} bytes)", id, len);
        Ok(id.to_hex())
    }

    async fn download_file(&self, file_id: &str) -> Result<Option<Bytes>> {
        let oid = parse_file_id(file_id)?;
        let mut sink = Cursor::new(Vec::new());
        match self
            .bucket
            .download_to_futures_0_3_writer(Bson::ObjectId(oid), &mut sink)
            .await
        {
            Ok(()) => Ok(Some(Bytes::from(sink.into_inner()))),
            Err(e) if is_file_not_found(&e) => Ok(None),
            Err(e) => Err(map_mongo_error(e)),
        }
    }

    async fn delete_file(&self, file_id: &str) -> Result<bool> {
        let oid = parse_file_id(file_id)?;
        match self.bucket.delete(Bson::ObjectId(oid)).await {
            Ok(()) => Ok(true),
            Err(e) if is_file_not_found(&e) => Ok(false),
            Err(e) => Err(map_mongo_error(e)),
        }
    }

    async fn find_files(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        let filter = doc! { "uploadDate": { "$lte": bson::DateTime::from_millis(cutoff_ms) } };
        let cursor = self
            .bucket
            .find(filter, None)
            .await
            .map_err(map_mongo_error)?;
        let files: Vec<_> = cursor.try_collect().await.map_err(map_mongo_error)?;
        Ok(files
            .into_iter()
            .filter_map(|f| match f.id {
                Bson::ObjectId(oid) => Some(oid.to_hex()),
                _ => None,
            })
            .collect())
    }

    async fn referenced_file_ids(&self) -> Result<HashSet<String>> {
        let values = self
            .blobs()
            .distinct("file_id", doc! { "file_id": { "$type": "string" } }, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(values
            .into_iter()
            .filter_map(|v| match v {
                Bson::String(s) => Some(s),
                _ => None,
            })
            .collect())
    }
}

fn parse_file_id(file_id: &str) -> Result<ObjectId> {
    ObjectId::parse_str(file_id)
        .map_err(|e| StoreError::Integrity(format!("invalid large-object id '{}': {}", file_id, e)))
}

fn is_file_not_found(e: &mongodb::error::Error) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::GridFs {
            0: GridFsErrorKind::FileNotFound { .. },
            ..
        }
    )
}

/// Translate a driver error into the storage taxonomy.
pub(crate) fn map_mongo_error(e: mongodb::error::Error) -> StoreError {
    if e.contains_label("TransientTransactionError") || e.contains_label("RetryableWriteError") {
        return StoreError::BackendUnavailable(e.to_string());
    }

    match e.kind.as_ref() {
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => StoreError::BackendUnavailable(e.to_string()),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY => {
            StoreError::Validation(format!("duplicate key: {}", we.message))
        }
        ErrorKind::Command(ce) if ce.code == DUPLICATE_KEY => {
            StoreError::Validation(format!("duplicate key: {}", ce.message))
        }
        ErrorKind::Command(ce) if TRANSIENT_CODES.contains(&ce.code) => {
            StoreError::BackendUnavailable(e.to_string())
        }
        ErrorKind::Authentication { .. } | ErrorKind::InvalidArgument { .. } => {
            StoreError::Config(e.to_string())
        }
        _ => StoreError::backend("mongodb", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let mut config = DocumentConfig::ephemeral("analytics");
        config.ephemeral = false;
        config.uri = "mongodb://127.0.0.1:1/?directConnection=true".to_string();
        config.connect_timeout_ms = 200;

        let driver = MongoDriver::connect(&config).await.unwrap();
        let err = driver.ping().await.unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_malformed_uri_is_config_error() {
        let mut config = DocumentConfig::ephemeral("analytics");
        config.ephemeral = false;
        config.uri = "mongodb://".to_string();
        assert!(matches!(
            MongoDriver::connect(&config).await,
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_io_error_is_not_a_missing_file() {
        let e = mongodb::error::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(!is_file_not_found(&e));
        assert!(matches!(map_mongo_error(e), StoreError::BackendUnavailable(_)));
    }

    #[test]
    fn test_invalid_file_id_is_integrity_error() {
        assert!(matches!(
            parse_file_id("not-an-object-id"),
            Err(StoreError::Integrity(_))
        ));
    }
}
