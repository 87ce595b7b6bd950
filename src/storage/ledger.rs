//! Identity ledger tables: `users` and the `user_documents` cross-reference.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::document::{format_timestamp, parse_timestamp};
use crate::error::LedgerResult;
use crate::identifier::DocumentType;
use crate::storage::sqlite;
use crate::user::{LogicalUser, UserId};

/// Ledger table.
pub const USERS_TABLE: &str = "users";
/// Document cross-reference table.
pub const USER_DOCUMENTS_TABLE: &str = "user_documents";
/// Unique index on `users.canonical_identifier`.
pub const USERS_IDENTIFIER_INDEX: &str = "idx_users_canonical_identifier_unique";
/// Ledger schema version stamped into `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Creates the ledger tables and index if missing. Returns the names of
/// the objects that were actually created.
///
/// # Errors
/// Propagates SQLite failures.
pub fn create_tables(conn: &Connection) -> LedgerResult<Vec<String>> {
    let mut created = Vec::new();

    if !sqlite::table_exists(conn, USERS_TABLE)? {
        conn.execute_batch(&format!(
            "CREATE TABLE {USERS_TABLE} (
                user_id TEXT PRIMARY KEY,
                canonical_identifier TEXT,
                display_name TEXT NOT NULL,
                document_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );"
        ))?;
        created.push(USERS_TABLE.to_string());
    }

    if !sqlite::index_exists(conn, USERS_IDENTIFIER_INDEX)? {
        conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX {USERS_IDENTIFIER_INDEX} ON {USERS_TABLE}(canonical_identifier);"
        ))?;
        created.push(USERS_IDENTIFIER_INDEX.to_string());
    }

    if !sqlite::table_exists(conn, USER_DOCUMENTS_TABLE)? {
        conn.execute_batch(&format!(
            "CREATE TABLE {USER_DOCUMENTS_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL REFERENCES {USERS_TABLE}(user_id),
                document_type TEXT NOT NULL,
                document_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, document_type, document_id)
            );
            CREATE INDEX IF NOT EXISTS idx_user_documents_user ON {USER_DOCUMENTS_TABLE}(user_id);"
        ))?;
        created.push(USER_DOCUMENTS_TABLE.to_string());
    }

    Ok(created)
}

/// Returns true if the ledger table exists.
///
/// # Errors
/// Propagates SQLite failures.
pub fn has_tables(conn: &Connection) -> LedgerResult<bool> {
    Ok(sqlite::table_exists(conn, USERS_TABLE)?)
}

/// Inserts a user row.
///
/// Returns the raw SQLite error so callers can tell an identifier
/// conflict from a primary-key collision.
///
/// # Errors
/// Any SQLite failure, including unique violations.
pub fn insert_user(conn: &Connection, user: &LogicalUser) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {USERS_TABLE}
                (user_id, canonical_identifier, display_name, document_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        params![
            user.user_id.to_string(),
            user.canonical_identifier,
            user.display_name,
            user.document_count,
            format_timestamp(user.created_at),
            format_timestamp(user.updated_at),
        ],
    )?;
    Ok(())
}

const SELECT_USER: &str =
    "SELECT user_id, canonical_identifier, display_name, document_count, created_at, updated_at FROM users";

fn map_user(row: &Row<'_>) -> rusqlite::Result<LogicalUser> {
    let raw_id: String = row.get(0)?;
    let user_id = raw_id.parse::<UserId>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(LogicalUser {
        user_id,
        canonical_identifier: row.get(1)?,
        display_name: row.get(2)?,
        document_count: row.get(3)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

/// Looks a user up by canonical identifier.
///
/// # Errors
/// Propagates SQLite failures.
pub fn find_by_identifier(conn: &Connection, canonical: &str) -> LedgerResult<Option<LogicalUser>> {
    let user = conn
        .query_row(&format!("{SELECT_USER} WHERE canonical_identifier = ?1"), [canonical], map_user)
        .optional()?;
    Ok(user)
}

/// Looks a user up by id.
///
/// # Errors
/// Propagates SQLite failures.
pub fn find_by_id(conn: &Connection, user_id: UserId) -> LedgerResult<Option<LogicalUser>> {
    let user = conn
        .query_row(&format!("{SELECT_USER} WHERE user_id = ?1"), [user_id.to_string()], map_user)
        .optional()?;
    Ok(user)
}

/// Atomically bumps a user's document count. Returns false if the user is
/// not in this store.
///
/// # Errors
/// Propagates SQLite failures.
pub fn increment_document_count(conn: &Connection, user_id: UserId, at: DateTime<Utc>) -> LedgerResult<bool> {
    let changed = conn.execute(
        &format!(
            "UPDATE {USERS_TABLE} SET document_count = document_count + 1, updated_at = ?1 WHERE user_id = ?2"
        ),
        params![format_timestamp(at), user_id.to_string()],
    )?;
    Ok(changed > 0)
}

/// Takes one off a user's document count, never below zero. Returns false
/// if the user is not in this store.
///
/// # Errors
/// Propagates SQLite failures.
pub fn decrement_document_count(conn: &Connection, user_id: UserId, at: DateTime<Utc>) -> LedgerResult<bool> {
    let changed = conn.execute(
        &format!(
            "UPDATE {USERS_TABLE} SET document_count = MAX(document_count - 1, 0), updated_at = ?1 WHERE user_id = ?2"
        ),
        params![format_timestamp(at), user_id.to_string()],
    )?;
    Ok(changed > 0)
}

/// Deletes a user with no counted and no linked documents. Returns true
/// if the row was deleted.
///
/// # Errors
/// Propagates SQLite failures.
pub fn delete_unreferenced_user(conn: &Connection, user_id: UserId) -> LedgerResult<bool> {
    let removed = conn.execute(
        &format!(
            "DELETE FROM {USERS_TABLE} WHERE user_id = ?1 AND document_count = 0
               AND NOT EXISTS (SELECT 1 FROM {USER_DOCUMENTS_TABLE} WHERE user_id = ?1)"
        ),
        [user_id.to_string()],
    )?;
    Ok(removed > 0)
}

/// Deletes a user row no document in this store is linked to, whatever
/// its count. Returns true if the row was deleted.
///
/// # Errors
/// Propagates SQLite failures.
pub fn delete_unlinked_user(conn: &Connection, user_id: UserId) -> LedgerResult<bool> {
    let removed = conn.execute(
        &format!(
            "DELETE FROM {USERS_TABLE} WHERE user_id = ?1
               AND NOT EXISTS (SELECT 1 FROM {USER_DOCUMENTS_TABLE} WHERE user_id = ?1)"
        ),
        [user_id.to_string()],
    )?;
    Ok(removed > 0)
}

/// Records that `document_id` belongs to `user_id`. Idempotent.
///
/// # Errors
/// Propagates SQLite failures (including a foreign-key failure when the
/// user is absent from this store).
pub fn link_document(
    conn: &Connection,
    user_id: UserId,
    document_type: DocumentType,
    document_id: i64,
) -> LedgerResult<()> {
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {USER_DOCUMENTS_TABLE} (user_id, document_type, document_id, created_at)
             VALUES (?1, ?2, ?3, ?4)"
        ),
        params![user_id.to_string(), document_type.as_str(), document_id, format_timestamp(Utc::now())],
    )?;
    Ok(())
}

/// Drops every link to a document.
///
/// # Errors
/// Propagates SQLite failures.
pub fn unlink_document(conn: &Connection, document_type: DocumentType, document_id: i64) -> LedgerResult<usize> {
    let removed = conn.execute(
        &format!("DELETE FROM {USER_DOCUMENTS_TABLE} WHERE document_type = ?1 AND document_id = ?2"),
        params![document_type.as_str(), document_id],
    )?;
    Ok(removed)
}

/// Documents linked to a user in this store.
///
/// # Errors
/// Propagates SQLite failures.
pub fn linked_documents(conn: &Connection, user_id: UserId) -> LedgerResult<Vec<(DocumentType, i64)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT document_type, document_id FROM {USER_DOCUMENTS_TABLE} WHERE user_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt
        .query_map([user_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter_map(|(kind, id)| kind.parse::<DocumentType>().ok().map(|dt| (dt, id)))
        .collect())
}

/// Every user in this store.
///
/// # Errors
/// Propagates SQLite failures.
pub fn all_users(conn: &Connection) -> LedgerResult<Vec<LogicalUser>> {
    let mut stmt = conn.prepare(&format!("{SELECT_USER} ORDER BY created_at"))?;
    let users = stmt.query_map([], map_user)?.collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}
