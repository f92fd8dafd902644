//! Dataset records.
//!
//! Column lists and row counts are computed once at ingestion. The storage
//! layer never recomputes them; changing them means writing a new draft.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::{BlobId, DatasetId, WorkspaceId};
use crate::error::{Result, StoreError};

/// Inferred type of a dataset column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
    Datetime,
    Categorical,
    Unknown,
}

/// A column description: name plus inferred type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, type_tag: ColumnType) -> Self {
        Self {
            name: name.into(),
            type_tag,
        }
    }
}

/// A stored dataset record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub workspace_id: WorkspaceId,
    pub row_count: u64,
    pub columns: Vec<Column>,
    pub blob_id: Option<BlobId>,
    pub created_at: DateTime<Utc>,
}

/// Input to `put_dataset`. Identifier and creation time are optional and
/// filled in by the adapter when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDraft {
    #[serde(default)]
    pub id: Option<DatasetId>,
    pub name: String,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub blob_id: Option<BlobId>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl DatasetDraft {
    pub fn new(name: impl Into<String>, workspace_id: impl Into<WorkspaceId>) -> Self {
        Self {
            id: None,
            name: name.into(),
            workspace_id: workspace_id.into(),
            row_count: 0,
            columns: Vec::new(),
            blob_id: None,
            created_at: None,
        }
    }

    pub fn with_id(mut self, id: DatasetId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = row_count;
        self
    }

    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_blob(mut self, blob_id: BlobId) -> Self {
        self.blob_id = Some(blob_id);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Check required fields. Blob existence and ownership are checked by the
    /// adapter because they need the store.
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.id {
            if id.as_str().trim().is_empty() {
                return Err(StoreError::Validation("dataset id must not be blank".into()));
            }
        }
        if self.name.trim().is_empty() {
            return Err(StoreError::Validation("dataset name is required".into()));
        }
        if self.workspace_id.as_str().trim().is_empty() {
            return Err(StoreError::Validation("workspace id is required".into()));
        }
        if i64::try_from(self.row_count).is_err() {
            return Err(StoreError::Validation(format!(
                "row count {} is out of range",
                self.row_count
            )));
        }

        let mut seen = HashSet::with_capacity(self.columns.len());
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(StoreError::Validation("column names must not be empty".into()));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(StoreError::Validation(format!(
                    "duplicate column name '{}'",
                    column.name
                )));
            }
        }
        if let Some(blob_id) = &self.blob_id {
            if blob_id.as_str().trim().is_empty() {
                return Err(StoreError::Validation("blob id must not be blank".into()));
            }
        }
        Ok(())
    }

    /// Resolve into a full record. `existing_created_at` is the stored value
    /// when this write replaces a record.
    pub fn into_dataset(self, existing_created_at: Option<DateTime<Utc>>) -> Dataset {
        // Millisecond precision is what every backend can hold.
        let created_at = self
            .created_at
            .or(existing_created_at)
            .unwrap_or_else(Utc::now)
            .trunc_subsecs(3);

        Dataset {
            id: self.id.unwrap_or_else(DatasetId::generate),
            name: self.name,
            workspace_id: self.workspace_id,
            row_count: self.row_count,
            columns: self.columns,
            blob_id: self.blob_id,
            created_at,
        }
    }
}

impl Dataset {
    /// Draft that rewrites this record as-is, keeping id and creation time.
    pub fn to_draft(&self) -> DatasetDraft {
        DatasetDraft {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            workspace_id: self.workspace_id.clone(),
            row_count: self.row_count,
            columns: self.columns.clone(),
            blob_id: self.blob_id.clone(),
            created_at: Some(self.created_at),
        }
    }

    /// SHA256 over the descriptive fields. Identifiers are left out because
    /// blob ids differ between backends.
    pub fn content_fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "name": self.name,
            "workspace_id": self.workspace_id,
            "row_count": self.row_count,
            "columns": self.columns,
            "created_at_ms": self.created_at.timestamp_millis(),
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
