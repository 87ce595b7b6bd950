//! Whole-file store backups with BLAKE3 digests.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult, Severity};
use crate::identifier::DocumentType;
use crate::storage::SqliteStore;

/// A verified copy of a store file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHandle {
    /// Store the copy was taken from.
    pub document_type: DocumentType,
    /// Original store path.
    pub source: PathBuf,
    /// Backup file path.
    pub path: PathBuf,
    /// When the copy was taken.
    pub created_at: DateTime<Utc>,
    /// Size of the copy.
    pub size_bytes: u64,
    /// BLAKE3 digest of the copy, hex encoded.
    pub digest: String,
}

/// Hex BLAKE3 digest of a file.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn file_digest(path: &Path) -> LedgerResult<String> {
    let mut file = File::open(path).map_err(|e| LedgerError::io(format!("opening {}", path.display()), e))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).map_err(|e| LedgerError::io(format!("hashing {}", path.display()), e))?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn backup_path(store: &Path, backup_dir: &Path, at: DateTime<Utc>) -> PathBuf {
    let stem = store
        .file_stem()
        .map_or_else(|| "store".to_string(), |s| s.to_string_lossy().into_owned());
    let stamp = at.format("%Y%m%d_%H%M%S");
    let mut candidate = backup_dir.join(format!("{stem}_backup_{stamp}.db"));
    let mut n = 1;
    while candidate.exists() {
        candidate = backup_dir.join(format!("{stem}_backup_{stamp}_{n}.db"));
        n += 1;
    }
    candidate
}

/// Copies the store file into `backup_dir` as `<stem>_backup_<timestamp>.db`
/// and verifies the copy against the source digest.
///
/// Returns `None` when the store file does not exist yet: there is nothing
/// to lose.
///
/// # Errors
/// Returns an error if the copy fails or does not match the source.
pub fn create_backup(store: &SqliteStore, backup_dir: &Path) -> LedgerResult<Option<BackupHandle>> {
    if !store.exists() {
        tracing::warn!(store = %store.path().display(), "store file missing, nothing to back up");
        return Ok(None);
    }
    fs::create_dir_all(backup_dir).map_err(|e| LedgerError::io(format!("creating {}", backup_dir.display()), e))?;

    let created_at = Utc::now();
    let path = backup_path(store.path(), backup_dir, created_at);
    let size_bytes = fs::copy(store.path(), &path)
        .map_err(|e| LedgerError::io(format!("copying {} to {}", store.path().display(), path.display()), e))?;

    let source_digest = file_digest(store.path())?;
    let digest = file_digest(&path)?;
    if digest != source_digest {
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(backup = %path.display(), error = %e, "could not remove unverified backup");
        }
        return Err(LedgerError::io(
            format!("verifying backup {}", path.display()),
            io::Error::new(io::ErrorKind::InvalidData, "backup digest does not match the store"),
        ));
    }

    tracing::info!(store = %store.path().display(), backup = %path.display(), size_bytes, "backup created");
    Ok(Some(BackupHandle {
        document_type: store.document_type(),
        source: store.path().to_path_buf(),
        path,
        created_at,
        size_bytes,
        digest,
    }))
}

/// Copies a backup over `target` after checking its digest.
///
/// # Errors
/// `DataIntegrityIssue` if the backup no longer matches its digest; `Io`
/// if the copy fails.
pub fn restore_backup(handle: &BackupHandle, target: &Path) -> LedgerResult<()> {
    let actual = file_digest(&handle.path)?;
    if actual != handle.digest {
        return Err(LedgerError::DataIntegrityIssue {
            check: "backup_digest".to_string(),
            message: format!("{} changed since it was taken", handle.path.display()),
            affected_records: 0,
            severity: Severity::High,
        });
    }

    let staging = target.with_extension("restore.tmp");
    fs::copy(&handle.path, &staging).map_err(|e| LedgerError::io(format!("staging {}", staging.display()), e))?;
    fs::rename(&staging, target).map_err(|e| LedgerError::io(format!("replacing {}", target.display()), e))?;

    tracing::warn!(target = %target.display(), backup = %handle.path.display(), "store restored from backup");
    Ok(())
}
