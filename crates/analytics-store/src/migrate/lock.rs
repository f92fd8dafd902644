//! Single-flight guard for migration runs.
//!
//! One run per backend pair: an in-process registry catches concurrent runs
//! inside the same process, and a lock file next to the ledger catches runs
//! from other processes.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing::warn;

use crate::error::{Result, StoreError};

fn active_runs() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct RunGuard {
    pair_key: String,
    lock_path: Option<PathBuf>,
}

impl RunGuard {
    pub fn acquire(pair_key: &str, ledger_path: Option<&Path>, run_id: &str) -> Result<Self> {
        {
            let mut active = active_runs()
                .lock()
                .map_err(|_| StoreError::MigrationInProgress("run registry poisoned".into()))?;
            if !active.insert(pair_key.to_string()) {
                return Err(StoreError::MigrationInProgress(format!(
                    "a run for this backend pair is already active in this process ({})",
                    pair_key
                )));
            }
        }

        // From here on, dropping the guard releases the registry slot.
        let mut guard = Self {
            pair_key: pair_key.to_string(),
            lock_path: None,
        };

        if let Some(ledger) = ledger_path {
            let lock_path = lock_path_for(ledger);
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    guard.lock_path = Some(lock_path);
                    writeln!(file, "pid={} run_id={}", std::process::id(), run_id)?;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(StoreError::MigrationInProgress(format!(
                        "lock file {} exists; remove it if no run is active",
                        lock_path.display()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(guard)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.lock_path {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Could not remove migration lock {}: {}", path.display(), e);
            }
        }
        if let Ok(mut active) = active_runs().lock() {
            active.remove(&self.pair_key);
        }
    }
}

pub fn lock_path_for(ledger: &Path) -> PathBuf {
    let mut name = ledger
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    ledger.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_guard_in_process_refused() {
        let first = RunGuard::acquire("lock-test-a", None, "r1").unwrap();
        assert!(matches!(
            RunGuard::acquire("lock-test-a", None, "r2"),
            Err(StoreError::MigrationInProgress(_))
        ));
        drop(first);
        assert!(RunGuard::acquire("lock-test-a", None, "r3").is_ok());
    }

    #[test]
    fn test_foreign_lock_file_refused() {
        let dir = TempDir::new().unwrap();
        let ledger = dir.path().join("ledger.json");
        std::fs::write(lock_path_for(&ledger), "pid=1").unwrap();

        assert!(matches!(
            RunGuard::acquire("lock-test-b", Some(&ledger), "r1"),
            Err(StoreError::MigrationInProgress(_))
        ));
        // The failed attempt released its registry slot.
        std::fs::remove_file(lock_path_for(&ledger)).unwrap();
        let guard = RunGuard::acquire("lock-test-b", Some(&ledger), "r2").unwrap();
        assert!(lock_path_for(&ledger).exists());
        drop(guard);
        assert!(!lock_path_for(&ledger).exists());
    }

    #[test]
    fn test_lock_path_sits_next_to_ledger() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/m/ledger.json")),
            PathBuf::from("/tmp/m/ledger.json.lock")
        );
    }
}
