//! Migration ledger: per-record copy/verify status, persisted for resume.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::error::{Result, StoreError};

type HmacSha256 = Hmac<Sha256>;

/// Which kind of record a ledger entry tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Dataset,
    Blob,
}

impl EntityKind {
    fn prefix(&self) -> &'static str {
        match self {
            EntityKind::Dataset => "dataset",
            EntityKind::Blob => "blob",
        }
    }
}

/// Per-record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Copied,
    Verified,
    Failed,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Copied => "copied",
            RecordStatus::Verified => "verified",
            RecordStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Overall status of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub kind: EntityKind,
    pub source_id: String,
    pub status: RecordStatus,
    /// Dataset fingerprint or blob SHA256 on the source side.
    #[serde(default)]
    pub source_checksum: Option<String>,
    #[serde(default)]
    pub destination_checksum: Option<String>,
    /// Identifier the record has on the destination.
    #[serde(default)]
    pub destination_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub copied: usize,
    pub verified: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Ledger for one source/destination pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationLedger {
    /// Identifies the backend pair; also the HMAC key.
    pub pair_key: String,

    pub created_at: DateTime<Utc>,

    /// Keyed by `<kind>:<source id>`.
    pub entries: BTreeMap<String, LedgerEntry>,

    pub runs: Vec<RunRecord>,

    /// HMAC-SHA256 over the ledger without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

fn entry_key(kind: EntityKind, source_id: &str) -> String {
    format!("{}:{}", kind.prefix(), source_id)
}

impl MigrationLedger {
    pub fn new(pair_key: impl Into<String>) -> Self {
        Self {
            pair_key: pair_key.into(),
            created_at: Utc::now(),
            entries: BTreeMap::new(),
            runs: Vec::new(),
            hmac: None,
        }
    }

    /// Load the ledger at `path`, or start a fresh one when the file does not exist.
    pub fn open(path: &Path, pair_key: &str) -> Result<Self> {
        if !path.exists() {
            debug!("No ledger at {}, starting a new one", path.display());
            return Ok(Self::new(pair_key));
        }
        let ledger = Self::load(path)?;
        if ledger.pair_key != pair_key {
            return Err(StoreError::LedgerMismatch);
        }
        Ok(ledger)
    }

    /// Load and check the integrity tag.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let ledger: Self = serde_json::from_str(&content)?;

        let Some(stored) = &ledger.hmac else {
            return Err(StoreError::Integrity(format!(
                "ledger {} carries no integrity tag",
                path.display()
            )));
        };
        if *stored != ledger.compute_hmac()? {
            return Err(StoreError::Integrity(format!(
                "ledger {} failed its integrity check (edited outside the migration engine?)",
                path.display()
            )));
        }
        Ok(ledger)
    }

    /// Atomic write: temp file, then rename.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.hmac = Some(self.compute_hmac()?);
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)?;

        let mut mac = HmacSha256::new_from_slice(self.pair_key.as_bytes())
            .map_err(|e| StoreError::Integrity(format!("ledger HMAC key: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn entry(&self, kind: EntityKind, source_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(&entry_key(kind, source_id))
    }

    /// Existing entry or a new `pending` one.
    pub fn entry_mut(&mut self, kind: EntityKind, source_id: &str) -> &mut LedgerEntry {
        self.entries
            .entry(entry_key(kind, source_id))
            .or_insert_with(|| LedgerEntry {
                kind,
                source_id: source_id.to_string(),
                status: RecordStatus::Pending,
                source_checksum: None,
                destination_checksum: None,
                destination_id: None,
                error: None,
                attempts: 0,
                updated_at: Utc::now(),
            })
    }

    pub fn status(&self, kind: EntityKind, source_id: &str) -> Option<RecordStatus> {
        self.entry(kind, source_id).map(|e| e.status)
    }

    /// Count of entries of `kind` in `status`.
    pub fn count(&self, kind: EntityKind, status: RecordStatus) -> usize {
        self.entries
            .values()
            .filter(|e| e.kind == kind && e.status == status)
            .count()
    }
}

impl LedgerEntry {
    pub fn mark_copied(&mut self, destination_id: impl Into<String>, source_checksum: String) {
        self.status = RecordStatus::Copied;
        self.destination_id = Some(destination_id.into());
        self.source_checksum = Some(source_checksum);
        self.destination_checksum = None;
        self.error = None;
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_verified(&mut self, destination_checksum: String) {
        self.status = RecordStatus::Verified;
        self.destination_checksum = Some(destination_checksum);
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RecordStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }
}
