//! SQLite-backed document stores.
//!
//! Each document type lives in its own SQLite file. Nothing holds a
//! connection open between operations: every call opens a short-lived
//! connection with the configured busy timeout, so the stores can be shared
//! freely across threads and processes.

pub mod documents;
pub mod ledger;
mod lock;
pub mod sqlite;

pub use lock::MaintenanceLock;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::identifier::DocumentType;

/// Handle to one document-type store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteStore {
    document_type: DocumentType,
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Creates a handle; nothing is opened until [`connect`](Self::connect).
    #[must_use]
    pub fn new(document_type: DocumentType, path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            document_type,
            path: path.into(),
            busy_timeout,
        }
    }

    /// Document type held by this store.
    #[must_use]
    pub const fn document_type(&self) -> DocumentType {
        self.document_type
    }

    /// Store file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the store file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Opens a read-write connection, creating the file if needed.
    ///
    /// # Errors
    /// Returns an error if the parent directory cannot be created or SQLite
    /// refuses the file.
    pub fn connect(&self) -> LedgerResult<Connection> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::io(format!("creating {}", parent.display()), e))?;
        }
        let conn = Connection::open(&self.path)?;
        self.configure(&conn)?;
        Ok(conn)
    }

    /// Opens a read-only connection. Returns `None` when the store file
    /// does not exist, so reads never create an empty store.
    ///
    /// # Errors
    /// Returns an error if SQLite refuses the file.
    pub fn connect_read_only(&self) -> LedgerResult<Option<Connection>> {
        if !self.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(Some(conn))
    }

    fn configure(&self, conn: &Connection) -> LedgerResult<()> {
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    /// Creates the extraction-side tables if they are missing.
    ///
    /// # Errors
    /// Propagates connection and SQLite failures.
    pub fn ensure_document_tables(&self) -> LedgerResult<()> {
        let conn = self.connect()?;
        documents::create_tables(&conn, self.document_type)
    }
}

/// The pair of stores the ledger governs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stores {
    aadhaar: SqliteStore,
    pan: SqliteStore,
}

impl Stores {
    /// Store handles for the paths in `config`.
    #[must_use]
    pub fn from_config(config: &LedgerConfig) -> Self {
        let timeout = config.busy_timeout();
        Self {
            aadhaar: SqliteStore::new(DocumentType::Aadhaar, &config.aadhaar_store, timeout),
            pan: SqliteStore::new(DocumentType::Pan, &config.pan_store, timeout),
        }
    }

    /// Store for a document type.
    #[must_use]
    pub const fn get(&self, document_type: DocumentType) -> &SqliteStore {
        match document_type {
            DocumentType::Aadhaar => &self.aadhaar,
            DocumentType::Pan => &self.pan,
        }
    }

    /// Both stores, Aadhaar first.
    pub fn iter(&self) -> impl Iterator<Item = &SqliteStore> {
        [&self.aadhaar, &self.pan].into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_only_connect_does_not_create_file() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(DocumentType::Pan, dir.path().join("pan.db"), Duration::from_millis(100));
        assert!(store.connect_read_only().unwrap().is_none());
        assert!(!store.exists());

        store.ensure_document_tables().unwrap();
        assert!(store.exists());
        let conn = store.connect_read_only().unwrap().unwrap();
        assert!(documents::has_tables(&conn, DocumentType::Pan).unwrap());
    }

    #[test]
    fn test_connect_creates_parent_dir() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(
            DocumentType::Aadhaar,
            dir.path().join("nested").join("aadhaar.db"),
            Duration::from_millis(100),
        );
        store.connect().unwrap();
        assert!(store.exists());
    }

    #[test]
    fn test_stores_order() {
        let config = LedgerConfig::default();
        let stores = Stores::from_config(&config);
        let kinds: Vec<_> = stores.iter().map(SqliteStore::document_type).collect();
        assert_eq!(kinds, DocumentType::ALL);
        assert_eq!(stores.get(DocumentType::Pan).path(), config.pan_store.as_path());
    }
}
