//! Audit trails: the migration log and the duplicate-attempt log.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::DocumentRecord;
use crate::error::{LedgerError, LedgerResult};
use crate::identifier::DocumentType;
use crate::user::UserId;

fn lock_err(context: &'static str) -> LedgerError {
    LedgerError::ConcurrentWriteConflict {
        operation: "poisoned lock".to_string(),
        resource: context.to_string(),
    }
}

/// Outcome recorded for a migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step began.
    Started,
    /// Step finished and changed something.
    Success,
    /// Step found nothing to do.
    AlreadyCurrent,
    /// Step was skipped.
    Skipped,
    /// Step failed.
    Failed,
}

/// One entry of the migration log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationLogEntry {
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// Operation name, e.g. `backup` or `add_unique_constraint`.
    pub operation: String,
    /// Outcome.
    pub status: StepStatus,
    /// Operation-specific details.
    pub details: Value,
}

impl MigrationLogEntry {
    /// Entry stamped with the current time.
    #[must_use]
    pub fn new(operation: impl Into<String>, status: StepStatus, details: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            status,
            details,
        }
    }
}

/// Append-only migration log kept as a single JSON array on disk.
///
/// Appends rewrite the file through a temporary sibling and a rename, so a
/// crash mid-write leaves the previous array intact.
#[derive(Debug)]
pub struct MigrationLog {
    path: PathBuf,
    guard: Mutex<()>,
}

impl MigrationLog {
    /// Log stored at `path`; the file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry written so far. A missing file reads as empty.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn entries(&self) -> LedgerResult<Vec<MigrationLogEntry>> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(LedgerError::io(format!("reading {}", self.path.display()), e)),
        }
    }

    /// Appends one entry.
    ///
    /// A log that no longer parses is moved aside to `<name>.corrupt-<ts>`
    /// and a fresh array started, so history is never silently discarded.
    ///
    /// # Errors
    /// Returns an error if the log cannot be written.
    pub fn append(&self, entry: MigrationLogEntry) -> LedgerResult<()> {
        let _held = self.guard.lock().map_err(|_| lock_err("migration log"))?;

        let mut entries = match self.entries() {
            Ok(entries) => entries,
            Err(LedgerError::Serialization(e)) => {
                let aside = self.path.with_extension(format!("corrupt-{}", Utc::now().format("%Y%m%d%H%M%S")));
                tracing::error!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "migration log unreadable, starting a new one"
                );
                fs::rename(&self.path, &aside)
                    .map_err(|e| LedgerError::io(format!("moving aside {}", self.path.display()), e))?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        tracing::info!(operation = %entry.operation, status = ?entry.status, "migration log");
        entries.push(entry);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LedgerError::io(format!("creating {}", parent.display()), e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let encoded = serde_json::to_vec_pretty(&entries)?;
        fs::write(&tmp, encoded).map_err(|e| LedgerError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.path).map_err(|e| LedgerError::io(format!("replacing {}", self.path.display()), e))?;
        Ok(())
    }

    /// Convenience wrapper around [`append`](Self::append).
    ///
    /// # Errors
    /// Same as [`append`](Self::append).
    pub fn record(&self, operation: &str, status: StepStatus, details: Value) -> LedgerResult<()> {
        self.append(MigrationLogEntry::new(operation, status, details))
    }
}

/// Snapshot of the record a rejected document collided with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingSnapshot {
    /// Existing document row.
    pub document_id: i64,
    /// Existing fields row.
    pub field_id: i64,
    /// Owner of the existing record.
    pub user_id: Option<UserId>,
    /// Name on the existing record.
    pub name: Option<String>,
    /// Source path of the existing record.
    pub source_path: Option<String>,
    /// When it was stored.
    pub created_at: DateTime<Utc>,
}

impl From<&DocumentRecord> for ExistingSnapshot {
    fn from(record: &DocumentRecord) -> Self {
        Self {
            document_id: record.document_id,
            field_id: record.field_id,
            user_id: record.user_id,
            name: record.fields.name.clone(),
            source_path: record.source_path.clone(),
            created_at: record.created_at,
        }
    }
}

/// A rejected duplicate ingestion attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateAttempt {
    /// When the attempt was rejected.
    pub timestamp: DateTime<Utc>,
    /// Store the attempt targeted.
    pub document_type: DocumentType,
    /// Canonical identifier of the attempt.
    pub attempted_identifier: String,
    /// Name on the attempted document.
    pub attempted_name: Option<String>,
    /// Source file of the attempted document.
    pub source_path: Option<String>,
    /// The record it collided with.
    pub existing: ExistingSnapshot,
}

/// Destination for duplicate-attempt entries.
pub trait AuditSink: Send + Sync {
    /// Records an attempt. Must not drop it silently.
    ///
    /// # Errors
    /// Returns an error if the entry could not be persisted.
    fn record(&self, attempt: &DuplicateAttempt) -> LedgerResult<()>;

    /// Every attempt recorded so far, oldest first.
    ///
    /// # Errors
    /// Returns an error if the sink cannot be read.
    fn attempts(&self) -> LedgerResult<Vec<DuplicateAttempt>>;
}

/// In-process audit sink.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<DuplicateAttempt>>,
}

impl MemoryAuditSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, attempt: &DuplicateAttempt) -> LedgerResult<()> {
        self.entries
            .lock()
            .map_err(|_| lock_err("memory audit sink"))?
            .push(attempt.clone());
        Ok(())
    }

    fn attempts(&self) -> LedgerResult<Vec<DuplicateAttempt>> {
        Ok(self.entries.lock().map_err(|_| lock_err("memory audit sink"))?.clone())
    }
}

/// Append-only JSON-lines audit sink.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonlAuditSink {
    /// Sink writing to `path`; the file is created on first record.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, attempt: &DuplicateAttempt) -> LedgerResult<()> {
        let _held = self.guard.lock().map_err(|_| lock_err("jsonl audit sink"))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LedgerError::io(format!("creating {}", parent.display()), e))?;
        }
        let mut line = serde_json::to_vec(attempt)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LedgerError::io(format!("opening {}", self.path.display()), e))?;
        file.write_all(&line)
            .and_then(|()| file.sync_data())
            .map_err(|e| LedgerError::io(format!("appending to {}", self.path.display()), e))?;
        Ok(())
    }

    fn attempts(&self) -> LedgerResult<Vec<DuplicateAttempt>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LedgerError::io(format!("opening {}", self.path.display()), e)),
        };
        let mut attempts = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| LedgerError::io(format!("reading {}", self.path.display()), e))?;
            if line.trim().is_empty() {
                continue;
            }
            attempts.push(serde_json::from_str(&line)?);
        }
        Ok(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn attempt() -> DuplicateAttempt {
        DuplicateAttempt {
            timestamp: Utc::now(),
            document_type: DocumentType::Aadhaar,
            attempted_identifier: "123456789012".to_string(),
            attempted_name: Some("John Doe".to_string()),
            source_path: Some("upload.png".to_string()),
            existing: ExistingSnapshot {
                document_id: 1,
                field_id: 1,
                user_id: Some(UserId::new()),
                name: Some("John Doe".to_string()),
                source_path: None,
                created_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_migration_log_appends() {
        let dir = tempdir().unwrap();
        let log = MigrationLog::new(dir.path().join("migration_log.json"));
        assert!(log.entries().unwrap().is_empty());

        log.record("backup", StepStatus::Success, json!({"store": "a.db"})).unwrap();
        log.record("verify", StepStatus::AlreadyCurrent, json!({})).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, "backup");
        assert_eq!(entries[1].status, StepStatus::AlreadyCurrent);

        let raw: Value = serde_json::from_slice(&fs::read(log.path()).unwrap()).unwrap();
        assert!(raw.is_array());
    }

    #[test]
    fn test_migration_log_moves_corrupt_file_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("migration_log.json");
        fs::write(&path, b"{not json").unwrap();

        let log = MigrationLog::new(&path);
        log.record("setup", StepStatus::Started, json!({})).unwrap();
        assert_eq!(log.entries().unwrap().len(), 1);

        let moved = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(moved);
    }

    #[test]
    fn test_jsonl_sink_roundtrip() {
        let dir = tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit").join("attempts.jsonl"));
        assert!(sink.attempts().unwrap().is_empty());

        sink.record(&attempt()).unwrap();
        sink.record(&attempt()).unwrap();
        let attempts = sink.attempts().unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempted_identifier, "123456789012");
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemoryAuditSink::new();
        sink.record(&attempt()).unwrap();
        assert_eq!(sink.attempts().unwrap().len(), 1);
    }
}
