//! PostgreSQL driver.
//!
//! Uses deadpool-postgres for pooling. Payloads above the inline threshold
//! are written with `lo_from_bytea` and read back with `lo_get`, so large
//! objects never leave the transaction that created them half-written.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config as PgConfig, NoTls, Row};
use tracing::{debug, info, warn};

use super::driver::{BlobPayload, RelationalDriver};
use super::tls::{SslMode, TlsBuilder};
use crate::codec::StoragePath;
use crate::config::RelationalConfig;
use crate::core::{BlobId, BlobMetadata, Column, Dataset, DatasetId, WorkspaceId};
use crate::error::{Result, StoreError};

const BACKEND: &str = "postgres";

const DATASET_COLUMNS: &str = "id, name, workspace_id, row_count, columns, blob_id, created_at";
const BLOB_COLUMNS: &str =
    "id, content_type, filename, byte_length, stored_length, checksum, compressed, hints, created_at";

/// Quote a PostgreSQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualify(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Translate a driver error into the storage taxonomy.
pub(crate) fn map_pg_error(err: tokio_postgres::Error) -> StoreError {
    if err.is_closed() {
        return StoreError::BackendUnavailable(format!("connection closed: {}", err));
    }
    let Some(code) = err.code() else {
        // I/O, TLS and protocol failures carry no SQLSTATE.
        return StoreError::BackendUnavailable(err.to_string());
    };
    let message = err
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| err.to_string());

    let class = &code.code()[..2];
    if class == "08"
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
        || *code == SqlState::T_R_SERIALIZATION_FAILURE
        || *code == SqlState::T_R_DEADLOCK_DETECTED
        || *code == SqlState::TOO_MANY_CONNECTIONS
    {
        StoreError::BackendUnavailable(message)
    } else if class == "23" {
        StoreError::Validation(message)
    } else {
        StoreError::backend(BACKEND, format!("{} (SQLSTATE {})", message, code.code()))
    }
}

fn map_pool_error(err: PoolError) -> StoreError {
    match err {
        PoolError::Backend(e) => map_pg_error(e),
        PoolError::Timeout(kind) => {
            StoreError::BackendUnavailable(format!("PostgreSQL pool timeout ({:?})", kind))
        }
        PoolError::Closed => StoreError::BackendUnavailable("PostgreSQL pool closed".into()),
        other => StoreError::backend(BACKEND, other.to_string()),
    }
}

pub struct PostgresDriver {
    pool: Pool,
    schema: String,
    datasets: String,
    blobs: String,
    payloads: String,
}

impl PostgresDriver {
    /// Build the pool and check that a connection can be opened.
    pub async fn connect(config: &RelationalConfig) -> Result<Self> {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("analytics-store");
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(connect_timeout);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = match TlsBuilder::new(SslMode::parse(&config.ssl_mode)?).build()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, NoTls, mgr_config)
            }
        };

        let pool = Pool::builder(manager)
            .max_size(config.get_pool_size())
            .runtime(Runtime::Tokio1)
            .create_timeout(Some(connect_timeout))
            .build()
            .map_err(|e| StoreError::Config(format!("building PostgreSQL pool: {}", e)))?;

        let client = pool.get().await.map_err(map_pool_error)?;
        client.simple_query("SELECT 1").await.map_err(map_pg_error)?;
        drop(client);

        info!(
            "Connected to PostgreSQL: {}:{}/{} (schema {})",
            config.host, config.port, config.database, config.schema
        );

        Ok(Self {
            pool,
            datasets: qualify(&config.schema, "datasets"),
            blobs: qualify(&config.schema, "blobs"),
            payloads: qualify(&config.schema, "blob_payloads"),
            schema: config.schema.clone(),
        })
    }

    async fn client(&self) -> Result<Object> {
        self.pool.get().await.map_err(map_pool_error)
    }

    fn schema_ddl(&self) -> String {
        let index = quote_ident("datasets_workspace_created_idx");
        format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {schema};
CREATE TABLE IF NOT EXISTS {blobs} (
    id TEXT PRIMARY KEY,
    content_type TEXT NOT NULL,
    filename TEXT NOT NULL,
    byte_length BIGINT NOT NULL,
    stored_length BIGINT NOT NULL,
    checksum TEXT,
    compressed BOOLEAN NOT NULL DEFAULT FALSE,
    hints JSONB NOT NULL DEFAULT '{{}}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS {payloads} (
    blob_id TEXT PRIMARY KEY REFERENCES {blobs}(id) ON DELETE CASCADE,
    inline_data BYTEA,
    large_object OID,
    CHECK ((inline_data IS NULL) <> (large_object IS NULL))
);
CREATE TABLE IF NOT EXISTS {datasets} (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    row_count BIGINT NOT NULL CHECK (row_count >= 0),
    columns JSONB NOT NULL,
    blob_id TEXT UNIQUE REFERENCES {blobs}(id) ON DELETE RESTRICT,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS {index} ON {datasets} (workspace_id, created_at DESC);
"#,
            schema = quote_ident(&self.schema),
            blobs = self.blobs,
            payloads = self.payloads,
            datasets = self.datasets,
            index = index,
        )
    }
}

fn dataset_from_row(row: &Row) -> Result<Dataset> {
    let columns: serde_json::Value = row.get("columns");
    let columns: Vec<Column> = serde_json::from_value(columns)?;
    let row_count: i64 = row.get("row_count");
    Ok(Dataset {
        id: DatasetId::new(row.get::<_, String>("id")),
        name: row.get("name"),
        workspace_id: WorkspaceId::new(row.get::<_, String>("workspace_id")),
        row_count: u64::try_from(row_count).unwrap_or_default(),
        columns,
        blob_id: row.get::<_, Option<String>>("blob_id").map(BlobId::new),
        created_at: row.get("created_at"),
    })
}

fn blob_from_row(row: &Row) -> Result<BlobMetadata> {
    let hints: serde_json::Value = row.get("hints");
    let byte_length: i64 = row.get("byte_length");
    let stored_length: i64 = row.get("stored_length");
    Ok(BlobMetadata {
        id: BlobId::new(row.get::<_, String>("id")),
        content_type: row.get("content_type"),
        filename: row.get("filename"),
        byte_length: u64::try_from(byte_length).unwrap_or_default(),
        stored_length: u64::try_from(stored_length).unwrap_or_default(),
        checksum: row.get("checksum"),
        compressed: row.get("compressed"),
        hints: serde_json::from_value(hints)?,
        created_at: row.get("created_at"),
    })
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::Validation(format!("{} {} exceeds the supported range", what, value)))
}

#[async_trait]
impl RelationalDriver for PostgresDriver {
    async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await.map_err(map_pg_error)?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(&self.schema_ddl())
            .await
            .map_err(map_pg_error)?;
        debug!("Ensured storage tables in schema '{}'", self.schema);
        Ok(())
    }

    async fn upsert_dataset(&self, dataset: &Dataset) -> Result<()> {
        let client = self.client().await?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET \
                 name = EXCLUDED.name, \
                 workspace_id = EXCLUDED.workspace_id, \
                 row_count = EXCLUDED.row_count, \
                 columns = EXCLUDED.columns, \
                 blob_id = EXCLUDED.blob_id, \
                 created_at = EXCLUDED.created_at",
            self.datasets, DATASET_COLUMNS
        );
        let columns = serde_json::to_value(&dataset.columns)?;
        let row_count = to_i64(dataset.row_count, "row_count")?;
        let blob_id = dataset.blob_id.as_ref().map(|b| b.as_str());
        client
            .execute(
                &sql,
                &[
                    &dataset.id.as_str(),
                    &dataset.name,
                    &dataset.workspace_id.as_str(),
                    &row_count,
                    &columns,
                    &blob_id,
                    &dataset.created_at,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn find_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        let client = self.client().await?;
        let sql = format!("SELECT {} FROM {} WHERE id = $1", DATASET_COLUMNS, self.datasets);
        client
            .query_opt(&sql, &[&id])
            .await
            .map_err(map_pg_error)?
            .as_ref()
            .map(dataset_from_row)
            .transpose()
    }

    async fn find_datasets(&self, workspace_id: &str, limit: i64) -> Result<Vec<Dataset>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT {} FROM {} WHERE workspace_id = $1 ORDER BY created_at DESC, id LIMIT $2",
            DATASET_COLUMNS, self.datasets
        );
        client
            .query(&sql, &[&workspace_id, &limit])
            .await
            .map_err(map_pg_error)?
            .iter()
            .map(dataset_from_row)
            .collect()
    }

    async fn find_dataset_ids(&self, after: Option<&str>, limit: i64) -> Result<Vec<String>> {
        let client = self.client().await?;
        // COLLATE "C" keeps ordering bytewise, matching the document store.
        let sql = format!(
            "SELECT id FROM {} WHERE ($1::text IS NULL OR id > $1 COLLATE \"C\") \
             ORDER BY id COLLATE \"C\" LIMIT $2",
            self.datasets
        );
        let rows = client
            .query(&sql, &[&after, &limit])
            .await
            .map_err(map_pg_error)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn find_dataset_by_blob(&self, blob_id: &str) -> Result<Option<String>> {
        let client = self.client().await?;
        let sql = format!("SELECT id FROM {} WHERE blob_id = $1", self.datasets);
        Ok(client
            .query_opt(&sql, &[&blob_id])
            .await
            .map_err(map_pg_error)?
            .map(|r| r.get(0)))
    }

    async fn delete_dataset_cascade(&self, id: &str) -> Result<bool> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;

        let deleted = tx
            .query_opt(
                &format!("DELETE FROM {} WHERE id = $1 RETURNING blob_id", self.datasets),
                &[&id],
            )
            .await
            .map_err(map_pg_error)?;
        let Some(row) = deleted else {
            return Ok(false);
        };

        if let Some(blob_id) = row.get::<_, Option<String>>(0) {
            tx.execute(
                &format!(
                    "SELECT lo_unlink(large_object) FROM {} \
                     WHERE blob_id = $1 AND large_object IS NOT NULL",
                    self.payloads
                ),
                &[&blob_id],
            )
            .await
            .map_err(map_pg_error)?;
            tx.execute(&format!("DELETE FROM {} WHERE id = $1", self.blobs), &[&blob_id])
                .await
                .map_err(map_pg_error)?;
        }

        tx.commit().await.map_err(map_pg_error)?;
        Ok(true)
    }

    async fn insert_blob(&self, metadata: &BlobMetadata, payload: BlobPayload) -> Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;

        let hints = serde_json::to_value(&metadata.hints)?;
        let byte_length = to_i64(metadata.byte_length, "byte_length")?;
        let stored_length = to_i64(metadata.stored_length, "stored_length")?;
        tx.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                self.blobs, BLOB_COLUMNS
            ),
            &[
                &metadata.id.as_str(),
                &metadata.content_type,
                &metadata.filename,
                &byte_length,
                &stored_length,
                &metadata.checksum,
                &metadata.compressed,
                &hints,
                &metadata.created_at,
            ],
        )
        .await
        .map_err(map_pg_error)?;

        let bytes: &[u8] = &payload.bytes;
        let sql = match payload.path {
            StoragePath::Inline => format!(
                "INSERT INTO {} (blob_id, inline_data) VALUES ($1, $2)",
                self.payloads
            ),
            StoragePath::LargeObject => format!(
                "INSERT INTO {} (blob_id, large_object) VALUES ($1, lo_from_bytea(0, $2))",
                self.payloads
            ),
        };
        tx.execute(&sql, &[&metadata.id.as_str(), &bytes])
            .await
            .map_err(map_pg_error)?;

        tx.commit().await.map_err(map_pg_error)?;
        Ok(())
    }

    async fn find_blob(&self, id: &str) -> Result<Option<BlobMetadata>> {
        let client = self.client().await?;
        let sql = format!("SELECT {} FROM {} WHERE id = $1", BLOB_COLUMNS, self.blobs);
        client
            .query_opt(&sql, &[&id])
            .await
            .map_err(map_pg_error)?
            .as_ref()
            .map(blob_from_row)
            .transpose()
    }

    async fn read_payload(&self, id: &str) -> Result<Option<Bytes>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT p.inline_data, p.large_object, \
                    CASE WHEN p.large_object IS NOT NULL \
                         AND EXISTS (SELECT 1 FROM pg_largeobject_metadata m WHERE m.oid = p.large_object) \
                    THEN lo_get(p.large_object) END AS large_data \
             FROM {} b LEFT JOIN {} p ON p.blob_id = b.id WHERE b.id = $1",
            self.blobs, self.payloads
        );
        let Some(row) = client.query_opt(&sql, &[&id]).await.map_err(map_pg_error)? else {
            return Ok(None);
        };

        let inline: Option<Vec<u8>> = row.get("inline_data");
        let oid: Option<u32> = row.get("large_object");
        let large: Option<Vec<u8>> = row.get("large_data");
        match (inline, oid, large) {
            (Some(data), _, _) => Ok(Some(Bytes::from(data))),
            (None, Some(_), Some(data)) => Ok(Some(Bytes::from(data))),
            (None, Some(oid), None) => Err(StoreError::Integrity(format!(
                "blob {} references missing large object {}",
                id, oid
            ))),
            (None, None, _) => Err(StoreError::Integrity(format!("blob {} has no payload row", id))),
        }
    }

    async fn delete_blob(&self, id: &str) -> Result<bool> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;

        // lo_unlink is transactional: a restricted delete below rolls it back.
        tx.execute(
            &format!(
                "SELECT lo_unlink(large_object) FROM {} \
                 WHERE blob_id = $1 AND large_object IS NOT NULL",
                self.payloads
            ),
            &[&id],
        )
        .await
        .map_err(map_pg_error)?;

        let deleted = tx
            .execute(&format!("DELETE FROM {} WHERE id = $1", self.blobs), &[&id])
            .await;
        let deleted = match deleted {
            Err(e) if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) => {
                return Err(StoreError::Validation(format!(
                    "blob {} is still referenced by a dataset",
                    id
                )));
            }
            other => other.map_err(map_pg_error)?,
        };
        if deleted == 0 {
            return Ok(false);
        }

        tx.commit().await.map_err(map_pg_error)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("public"), "\"public\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualify("s", "datasets"), "\"s\".\"datasets\"");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let config = RelationalConfig {
            host: "127.0.0.1".into(),
            port: 1,
            database: "analytics".into(),
            user: "app".into(),
            password: "secret".into(),
            ssl_mode: "disable".into(),
            connect_timeout_ms: 500,
            pool_size: Some(1),
            ephemeral: false,
            ..RelationalConfig::ephemeral("analytics")
        };
        match PostgresDriver::connect(&config).await {
            Err(StoreError::BackendUnavailable(_)) => {}
            Err(other) => panic!("expected BackendUnavailable, got {:?}", other),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
