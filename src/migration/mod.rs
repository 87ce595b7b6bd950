//! Additive, verified schema migration.
//!
//! Every structural change follows the same discipline: back up the
//! store, apply the change inside a transaction, verify the result, and
//! append the outcome to the migration log. Steps are idempotent, so a
//! migration can be re-run safely; a store that already verifies is left
//! untouched and no backup is taken.
//!
//! Rollback is manual: [`SchemaMigrator::restore_backup`] copies a recorded
//! backup back over the store.

mod backup;

pub use backup::{file_digest, BackupHandle};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::audit::{MigrationLog, StepStatus};
use crate::document::FIELDS_TABLE;
use crate::error::{LedgerError, LedgerResult};
use crate::identifier::DocumentType;
use crate::storage::{documents, ledger, sqlite, SqliteStore};

/// A column to add to an existing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// SQL type and constraints, e.g. `TEXT`.
    pub definition: String,
}

impl ColumnSpec {
    /// Column `name` with `definition`.
    #[must_use]
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
        }
    }
}

/// Outcome of [`SchemaMigrator::add_unique_constraint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "index")]
pub enum ConstraintOutcome {
    /// The index was created.
    Created(String),
    /// The index already existed.
    AlreadyPresent(String),
}

impl ConstraintOutcome {
    /// Index name.
    #[must_use]
    pub fn index(&self) -> &str {
        match self {
            Self::Created(name) | Self::AlreadyPresent(name) => name,
        }
    }
}

/// Schema state of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVerification {
    /// Store checked.
    pub document_type: DocumentType,
    /// Store file.
    pub store: PathBuf,
    /// Whether the file exists at all.
    pub store_exists: bool,
    /// `users` table present.
    pub users_table: bool,
    /// `user_documents` table present.
    pub user_documents_table: bool,
    /// Unique index on `users.canonical_identifier` present.
    pub users_identifier_index: bool,
    /// Documents table carries `user_id`.
    pub documents_user_id: bool,
    /// Fields table carries `user_id`.
    pub fields_user_id: bool,
    /// Unique index on the fields table's identifier column present.
    pub identifier_unique_index: bool,
    /// `PRAGMA user_version`.
    pub schema_version: i64,
}

impl SchemaVerification {
    /// Ledger tables, links and version are all in place.
    #[must_use]
    pub const fn is_governed(&self) -> bool {
        self.users_table
            && self.user_documents_table
            && self.users_identifier_index
            && self.documents_user_id
            && self.fields_user_id
            && self.schema_version >= ledger::SCHEMA_VERSION
    }

    /// Governed and the identifier constraint is applied.
    #[must_use]
    pub const fn is_constrained(&self) -> bool {
        self.is_governed() && self.identifier_unique_index
    }

    /// Names of the checks that failed.
    #[must_use]
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.users_table, "users_table"),
            (self.user_documents_table, "user_documents_table"),
            (self.users_identifier_index, "users_identifier_index"),
            (self.documents_user_id, "documents_user_id"),
            (self.fields_user_id, "fields_user_id"),
            (self.identifier_unique_index, "identifier_unique_index"),
            (self.schema_version >= ledger::SCHEMA_VERSION, "schema_version"),
        ]
        .into_iter()
        .filter_map(|(ok, name)| (!ok).then_some(name))
        .collect()
    }
}

/// Result of migrating one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMigration {
    /// Store migrated.
    pub document_type: DocumentType,
    /// `Success` or `AlreadyCurrent`.
    pub status: StepStatus,
    /// Backup taken for this migration (or supplied by the caller).
    pub backup: Option<BackupHandle>,
    /// Tables and indexes created.
    pub created_objects: Vec<String>,
    /// Columns added, as `table.column`.
    pub added_columns: Vec<String>,
    /// Stored identifiers rewritten to canonical form.
    pub identifiers_normalized: usize,
    /// State after the migration.
    pub verification: SchemaVerification,
}

/// Applies and verifies ledger schema changes.
#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    backup_dir: PathBuf,
    log: Arc<MigrationLog>,
}

impl SchemaMigrator {
    /// Migrator writing backups to `backup_dir` and entries to `log`.
    #[must_use]
    pub fn new(backup_dir: impl Into<PathBuf>, log: Arc<MigrationLog>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            log,
        }
    }

    /// The migration log.
    #[must_use]
    pub fn log(&self) -> &MigrationLog {
        &self.log
    }

    /// Backup directory.
    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Takes a verified whole-file backup of `store`.
    ///
    /// # Errors
    /// `MigrationStepFailure` if the copy fails or cannot be verified.
    pub fn create_backup(&self, store: &SqliteStore) -> LedgerResult<Option<BackupHandle>> {
        match backup::create_backup(store, &self.backup_dir) {
            Ok(Some(handle)) => {
                self.log.record(
                    "backup",
                    StepStatus::Success,
                    json!({
                        "store": store.path(),
                        "backup": handle.path,
                        "size_bytes": handle.size_bytes,
                        "digest": handle.digest,
                    }),
                )?;
                Ok(Some(handle))
            }
            Ok(None) => {
                self.log.record(
                    "backup",
                    StepStatus::Skipped,
                    json!({ "store": store.path(), "reason": "store file does not exist" }),
                )?;
                Ok(None)
            }
            Err(e) => {
                self.log_failure("backup", store, &e);
                Err(step_failure("backup", store, None, &e))
            }
        }
    }

    /// Restores `store` from `handle`. Operator-invoked only.
    ///
    /// # Errors
    /// Fails if the backup does not match its digest or cannot be copied.
    pub fn restore_backup(&self, handle: &BackupHandle, store: &SqliteStore) -> LedgerResult<()> {
        backup::restore_backup(handle, store.path())?;
        self.log.record(
            "restore_backup",
            StepStatus::Success,
            json!({ "store": store.path(), "backup": handle.path }),
        )
    }

    /// Creates `users`, its unique identifier index and `user_documents`
    /// where missing. Returns what was created.
    ///
    /// # Errors
    /// `MigrationStepFailure` if the DDL fails; the store is left unchanged.
    pub fn ensure_identity_tables(&self, store: &SqliteStore) -> LedgerResult<Vec<String>> {
        let result = (|| {
            let mut conn = store.connect()?;
            let tx = conn.transaction()?;
            let created = ledger::create_tables(&tx)?;
            tx.commit()?;
            Ok::<_, LedgerError>(created)
        })();
        match result {
            Ok(created) => {
                let status = if created.is_empty() { StepStatus::AlreadyCurrent } else { StepStatus::Success };
                self.log.record(
                    "ensure_identity_tables",
                    status,
                    json!({ "store": store.path(), "created": created }),
                )?;
                Ok(created)
            }
            Err(e) => {
                self.log_failure("ensure_identity_tables", store, &e);
                Err(step_failure("ensure_identity_tables", store, None, &e))
            }
        }
    }

    /// Adds the missing `columns` to `table` in one transaction. Returns the
    /// names of the columns actually added.
    ///
    /// # Errors
    /// `MigrationStepFailure` if the table is missing or the DDL fails.
    pub fn add_columns(&self, store: &SqliteStore, table: &str, columns: &[ColumnSpec]) -> LedgerResult<Vec<String>> {
        let result = (|| {
            let mut conn = store.connect()?;
            let tx = conn.transaction()?;
            let added = add_columns_in(&tx, table, columns)?;
            tx.commit()?;
            Ok::<_, LedgerError>(added)
        })();
        match result {
            Ok(added) => {
                let status = if added.is_empty() { StepStatus::AlreadyCurrent } else { StepStatus::Success };
                self.log.record(
                    "add_columns",
                    status,
                    json!({ "store": store.path(), "table": table, "added": added }),
                )?;
                Ok(added)
            }
            Err(e) => {
                self.log_failure("add_columns", store, &e);
                Err(step_failure("add_columns", store, None, &e))
            }
        }
    }

    /// Creates the unique index `idx_<table>_<field>_unique` over non-empty
    /// values of `table.field`.
    ///
    /// Never deletes data: if duplicate values exist the constraint is not
    /// applied and the operator is told to run the duplicate scan and
    /// cleanup first. On a store's identifier column, values are compared
    /// by canonical form, and stored values not yet in canonical form also
    /// block the constraint, since the index itself compares them raw.
    ///
    /// # Errors
    /// `SchemaConstraintViolation` if duplicates or non-canonical values
    /// exist, or the index cannot be built.
    #[instrument(skip(self, store), fields(store = %store.path().display()))]
    pub fn add_unique_constraint(&self, store: &SqliteStore, table: &str, field: &str) -> LedgerResult<ConstraintOutcome> {
        let index = sqlite::unique_index_name(table, field);
        let conn = store.connect()?;

        if sqlite::index_exists(&conn, &index)? {
            self.log.record(
                "add_unique_constraint",
                StepStatus::AlreadyCurrent,
                json!({ "store": store.path(), "index": index }),
            )?;
            return Ok(ConstraintOutcome::AlreadyPresent(index));
        }

        let table_q = sqlite::quote_ident(table);
        let field_q = sqlite::quote_ident(field);
        let dt = store.document_type();
        let normalizer = (table == FIELDS_TABLE && field == dt.identifier_column()).then_some(dt);
        let values = audit_values(&conn, &table_q, &field_q, normalizer)?;

        let refusal = if values.duplicated > 0 {
            Some(format!(
                "{} value(s) of {table}.{field} occur more than once; \
                 run the duplicate scan and cleanup before applying this constraint",
                values.duplicated
            ))
        } else if values.non_canonical > 0 {
            Some(format!(
                "{} value(s) of {table}.{field} are not in canonical form; \
                 run cleanup to normalize them before applying this constraint",
                values.non_canonical
            ))
        } else {
            None
        };
        if let Some(reason) = refusal {
            let err = LedgerError::SchemaConstraintViolation {
                constraint: index.clone(),
                table: table.to_string(),
                column: Some(field.to_string()),
                reason,
            };
            self.log_failure("add_unique_constraint", store, &err);
            return Err(err);
        }

        let created = conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX {} ON {table_q}({field_q}) WHERE {field_q} IS NOT NULL AND {field_q} != '';",
            sqlite::quote_ident(&index)
        ));
        if let Err(e) = created {
            let err = sqlite::classify_constraint_error(e, table);
            self.log_failure("add_unique_constraint", store, &err);
            return Err(err);
        }

        self.log.record(
            "add_unique_constraint",
            StepStatus::Success,
            json!({ "store": store.path(), "table": table, "field": field, "index": index }),
        )?;
        tracing::info!(%index, "unique constraint applied");
        Ok(ConstraintOutcome::Created(index))
    }

    /// Reports which ledger objects exist in `store`. Read-only.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn verify(&self, store: &SqliteStore) -> LedgerResult<SchemaVerification> {
        let dt = store.document_type();
        let mut verification = SchemaVerification {
            document_type: dt,
            store: store.path().to_path_buf(),
            store_exists: store.exists(),
            users_table: false,
            user_documents_table: false,
            users_identifier_index: false,
            documents_user_id: false,
            fields_user_id: false,
            identifier_unique_index: false,
            schema_version: 0,
        };
        let Some(conn) = store.connect_read_only()? else {
            return Ok(verification);
        };

        verification.users_table = sqlite::table_exists(&conn, ledger::USERS_TABLE)?;
        verification.user_documents_table = sqlite::table_exists(&conn, ledger::USER_DOCUMENTS_TABLE)?;
        verification.users_identifier_index = sqlite::index_exists(&conn, ledger::USERS_IDENTIFIER_INDEX)?;
        verification.documents_user_id = sqlite::has_column(&conn, dt.documents_table(), "user_id")?;
        verification.fields_user_id = sqlite::has_column(&conn, FIELDS_TABLE, "user_id")?;
        verification.identifier_unique_index =
            sqlite::index_exists(&conn, &sqlite::unique_index_name(FIELDS_TABLE, dt.identifier_column()))?;
        verification.schema_version = sqlite::user_version(&conn)?;
        Ok(verification)
    }

    /// Brings one store to the current ledger schema.
    ///
    /// A store that already verifies is left alone. Otherwise `backup` is
    /// used as the rollback point, or a fresh backup is taken when `None`.
    /// Stored identifiers are rewritten to canonical form in the same
    /// transaction.
    /// The identifier constraint is not part of this step; see
    /// [`add_unique_constraint`](Self::add_unique_constraint).
    ///
    /// # Errors
    /// `MigrationStepFailure` naming the backup, if any.
    #[instrument(skip(self, store, backup), fields(store = %store.path().display()))]
    pub fn migrate_store(&self, store: &SqliteStore, backup: Option<BackupHandle>) -> LedgerResult<StoreMigration> {
        let before = self.verify(store)?;
        if before.is_governed() {
            self.log.record(
                "migrate_store",
                StepStatus::AlreadyCurrent,
                json!({ "store": store.path(), "schema_version": before.schema_version }),
            )?;
            return Ok(StoreMigration {
                document_type: store.document_type(),
                status: StepStatus::AlreadyCurrent,
                backup,
                created_objects: Vec::new(),
                added_columns: Vec::new(),
                identifiers_normalized: 0,
                verification: before,
            });
        }

        let backup = match backup {
            Some(handle) => Some(handle),
            None => self.create_backup(store)?,
        };
        self.log.record(
            "migrate_store",
            StepStatus::Started,
            json!({ "store": store.path(), "missing": before.missing(), "backup": backup.as_ref().map(|b| &b.path) }),
        )?;

        let applied = (|| {
            let dt = store.document_type();
            let mut conn = store.connect()?;
            let tx = conn.transaction()?;
            documents::create_tables(&tx, dt)?;
            let created = ledger::create_tables(&tx)?;
            let user_col = [ColumnSpec::new("user_id", "TEXT")];
            let mut added: Vec<String> = add_columns_in(&tx, dt.documents_table(), &user_col)?
                .into_iter()
                .map(|c| format!("{}.{c}", dt.documents_table()))
                .collect();
            added.extend(
                add_columns_in(&tx, FIELDS_TABLE, &user_col)?
                    .into_iter()
                    .map(|c| format!("{FIELDS_TABLE}.{c}")),
            );
            tx.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{FIELDS_TABLE}_user_id ON {FIELDS_TABLE}(user_id);"
            ))?;
            let normalized = documents::canonicalize_identifiers(&tx, dt)?;
            sqlite::set_user_version(&tx, ledger::SCHEMA_VERSION)?;
            tx.commit()?;
            Ok::<_, LedgerError>((created, added, normalized))
        })();

        let (created_objects, added_columns, identifiers_normalized) = match applied {
            Ok(done) => done,
            Err(e) => {
                self.log_failure("migrate_store", store, &e);
                return Err(step_failure("migrate_store", store, backup.as_ref(), &e));
            }
        };

        let after = self.verify(store)?;
        if !after.is_governed() {
            let err = LedgerError::DataIntegrityIssue {
                check: "post_migration_verify".to_string(),
                message: format!("still missing after migration: {:?}", after.missing()),
                affected_records: 0,
                severity: crate::error::Severity::High,
            };
            self.log_failure("verify", store, &err);
            return Err(step_failure("verify", store, backup.as_ref(), &err));
        }

        self.log.record(
            "migrate_store",
            StepStatus::Success,
            json!({
                "store": store.path(),
                "created": created_objects,
                "added_columns": added_columns,
                "identifiers_normalized": identifiers_normalized,
                "schema_version": after.schema_version,
            }),
        )?;
        Ok(StoreMigration {
            document_type: store.document_type(),
            status: StepStatus::Success,
            backup,
            created_objects,
            added_columns,
            identifiers_normalized,
            verification: after,
        })
    }

    fn log_failure(&self, operation: &str, store: &SqliteStore, err: &LedgerError) {
        tracing::error!(operation, store = %store.path().display(), error = %err, "migration step failed");
        if let Err(log_err) = self.log.record(
            operation,
            StepStatus::Failed,
            json!({ "store": store.path(), "error": err.to_string(), "code": err.code() }),
        ) {
            tracing::error!(error = %log_err, "could not append to migration log");
        }
    }
}

fn add_columns_in(conn: &rusqlite::Connection, table: &str, columns: &[ColumnSpec]) -> LedgerResult<Vec<String>> {
    let existing = sqlite::column_names(conn, table)?;
    if existing.is_empty() {
        return Err(LedgerError::SchemaConstraintViolation {
            constraint: "table_exists".to_string(),
            table: table.to_string(),
            column: None,
            reason: format!("table {table} does not exist"),
        });
    }

    let mut added = Vec::new();
    for column in columns {
        if existing.iter().any(|c| c == &column.name) {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {};",
            sqlite::quote_ident(table),
            sqlite::quote_ident(&column.name),
            column.definition
        ))?;
        added.push(column.name.clone());
    }
    Ok(added)
}

#[derive(Debug, Default)]
struct ValueAudit {
    /// Distinct keys held by more than one row.
    duplicated: usize,
    /// Rows whose stored value differs from its canonical form.
    non_canonical: usize,
}

/// Counts duplicate and non-canonical values of `table.field`. With a
/// document type, values are compared by their canonical form; values
/// that normalize to nothing are compared as stored.
fn audit_values(
    conn: &rusqlite::Connection,
    table_q: &str,
    field_q: &str,
    normalizer: Option<DocumentType>,
) -> LedgerResult<ValueAudit> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {field_q} FROM {table_q} WHERE {field_q} IS NOT NULL AND {field_q} != ''"
    ))?;
    let values = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut audit = ValueAudit::default();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for value in values {
        let key = match normalizer.map(|dt| dt.normalize(&value)) {
            Some(canonical) if !canonical.is_empty() => {
                if canonical != value {
                    audit.non_canonical += 1;
                }
                canonical
            }
            _ => value,
        };
        *seen.entry(key).or_default() += 1;
    }
    audit.duplicated = seen.values().filter(|n| **n > 1).count();
    Ok(audit)
}

fn step_failure(step: &str, store: &SqliteStore, backup: Option<&BackupHandle>, err: &LedgerError) -> LedgerError {
    LedgerError::MigrationStepFailure {
        step: step.to_string(),
        store: store.path().to_path_buf(),
        rollback_available: backup.is_some(),
        backup_path: backup.map(|b| b.path.clone()),
        reason: err.to_string(),
    }
}
