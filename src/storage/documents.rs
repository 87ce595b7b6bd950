//! Document and extracted-field tables.
//!
//! These tables belong to the extraction side; the ledger reads them,
//! links them to users, and removes duplicate rows during cleanup. The
//! `user_id` columns only exist once a store has been migrated, so every
//! query checks for them instead of assuming.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::document::{format_timestamp, parse_timestamp, DocumentRecord, ExtractedFields, NewDocument, FIELDS_TABLE};
use crate::error::LedgerResult;
use crate::identifier::DocumentType;
use crate::storage::sqlite;
use crate::user::UserId;

/// Creates the extraction-side tables if missing.
///
/// This is the layout stores have before any ledger migration: no
/// `user_id` columns, no unique constraint on the identifier.
///
/// # Errors
/// Propagates SQLite failures.
pub fn create_tables(conn: &Connection, document_type: DocumentType) -> LedgerResult<()> {
    let docs = document_type.documents_table();
    let id_col = document_type.identifier_column();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {docs} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT,
            document_type TEXT NOT NULL DEFAULT '{kind}',
            extraction_confidence REAL,
            raw_text TEXT,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS {FIELDS_TABLE} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL REFERENCES {docs}(id),
            name TEXT,
            dob TEXT,
            gender TEXT,
            address TEXT,
            fathers_name TEXT,
            {id_col} TEXT,
            created_at TEXT NOT NULL
        );",
        kind = document_type.as_str(),
    ))?;
    Ok(())
}

/// Returns true if both extraction-side tables exist.
///
/// # Errors
/// Propagates SQLite failures.
pub fn has_tables(conn: &Connection, document_type: DocumentType) -> LedgerResult<bool> {
    Ok(sqlite::table_exists(conn, document_type.documents_table())?
        && sqlite::table_exists(conn, FIELDS_TABLE)?)
}

fn fields_have_user_id(conn: &Connection) -> LedgerResult<bool> {
    Ok(sqlite::has_column(conn, FIELDS_TABLE, "user_id")?)
}

/// Inserts a document row and its fields row. Returns `(document_id, field_id)`.
///
/// The identifier is written exactly as given; callers on the governed
/// ingestion path pass the canonical form.
///
/// # Errors
/// Propagates SQLite failures, including unique-index violations on the
/// identifier column of a governed store.
pub fn insert(conn: &Connection, doc: &NewDocument) -> LedgerResult<(i64, i64)> {
    let dt = doc.document_type;
    let docs = dt.documents_table();
    let id_col = dt.identifier_column();
    let created_at = format_timestamp(doc.created_at.unwrap_or_else(Utc::now));
    let user_id = doc.user_id.map(|u| u.to_string());

    let docs_have_user = sqlite::has_column(conn, docs, "user_id")?;
    if docs_have_user {
        conn.execute(
            &format!(
                "INSERT INTO {docs} (file_path, document_type, extraction_confidence, raw_text, created_at, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![doc.source_path, dt.as_str(), doc.confidence, doc.raw_text, created_at, user_id],
        )?;
    } else {
        conn.execute(
            &format!(
                "INSERT INTO {docs} (file_path, document_type, extraction_confidence, raw_text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![doc.source_path, dt.as_str(), doc.confidence, doc.raw_text, created_at],
        )?;
    }
    let document_id = conn.last_insert_rowid();

    let f = &doc.fields;
    if fields_have_user_id(conn)? {
        conn.execute(
            &format!(
                "INSERT INTO {FIELDS_TABLE}
                    (document_id, name, dob, gender, address, fathers_name, {id_col}, created_at, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![document_id, f.name, f.dob, f.gender, f.address, f.fathers_name, f.identifier, created_at, user_id],
        )?;
    } else {
        conn.execute(
            &format!(
                "INSERT INTO {FIELDS_TABLE}
                    (document_id, name, dob, gender, address, fathers_name, {id_col}, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![document_id, f.name, f.dob, f.gender, f.address, f.fathers_name, f.identifier, created_at],
        )?;
    }
    let field_id = conn.last_insert_rowid();

    Ok((document_id, field_id))
}

fn select_sql(conn: &Connection, document_type: DocumentType) -> LedgerResult<String> {
    let docs = document_type.documents_table();
    let id_col = document_type.identifier_column();
    let user_expr = if fields_have_user_id(conn)? { "f.user_id" } else { "NULL" };
    Ok(format!(
        "SELECT f.id, f.document_id, f.{id_col}, f.name, f.dob, f.gender, f.address, f.fathers_name,
                d.extraction_confidence, {user_expr}, d.file_path, f.created_at
         FROM {FIELDS_TABLE} f
         JOIN {docs} d ON d.id = f.document_id"
    ))
}

fn map_record(document_type: DocumentType, row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let identifier: Option<String> = row.get(2)?;
    let identifier = identifier.unwrap_or_default();
    let user_id: Option<String> = row.get(9)?;
    let created_at: String = row.get(11)?;
    let field_id: i64 = row.get(0)?;

    let user_id = user_id.and_then(|raw| match raw.parse::<UserId>() {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(field_id, raw, "ignoring unparseable user_id");
            None
        }
    });

    Ok(DocumentRecord {
        field_id,
        document_id: row.get(1)?,
        document_type,
        canonical_identifier: document_type.normalize(&identifier),
        fields: ExtractedFields {
            name: row.get(3)?,
            dob: row.get(4)?,
            gender: row.get(5)?,
            address: row.get(6)?,
            fathers_name: row.get(7)?,
            identifier: (!identifier.is_empty()).then(|| identifier.clone()),
        },
        identifier,
        confidence: row.get::<_, Option<f64>>(8)?.unwrap_or(0.0),
        user_id,
        source_path: row.get(10)?,
        created_at: parse_timestamp(&created_at),
    })
}

/// Loads every record in the store, oldest first.
///
/// # Errors
/// Propagates SQLite failures.
pub fn load_all(conn: &Connection, document_type: DocumentType) -> LedgerResult<Vec<DocumentRecord>> {
    let sql = format!("{} ORDER BY f.created_at ASC, f.id ASC", select_sql(conn, document_type)?);
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([], |row| map_record(document_type, row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Oldest record whose stored identifier normalizes to `canonical`.
///
/// Canonical values are found through the identifier index. Rows written
/// in a raw form (`1234 5678 9012`) are matched by normalizing the stored
/// values that are not already canonical.
///
/// # Errors
/// Propagates SQLite failures.
pub fn find_by_identifier(
    conn: &Connection,
    document_type: DocumentType,
    canonical: &str,
) -> LedgerResult<Option<DocumentRecord>> {
    let select = select_sql(conn, document_type)?;
    let id_col = document_type.identifier_column();

    let exact = conn
        .query_row(
            &format!("{select} WHERE f.{id_col} = ?1 ORDER BY f.created_at ASC, f.id ASC LIMIT 1"),
            [canonical],
            |row| map_record(document_type, row),
        )
        .optional()?;

    let mut stmt = conn.prepare(&format!("{select} WHERE f.{id_col} GLOB ?1"))?;
    let variants = stmt
        .query_map([document_type.non_canonical_pattern()], |row| map_record(document_type, row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(exact
        .into_iter()
        .chain(variants.into_iter().filter(|r| r.canonical_identifier == canonical))
        .min_by_key(|r| (r.created_at, r.field_id)))
}

/// Rewrites every stored identifier that is not in canonical form.
/// Values that normalize to nothing are left as they are. Returns the
/// number of rows rewritten.
///
/// # Errors
/// Propagates SQLite failures, including unique-index violations when a
/// canonical value is already taken.
pub fn canonicalize_identifiers(conn: &Connection, document_type: DocumentType) -> LedgerResult<usize> {
    let id_col = document_type.identifier_column();
    let raw: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(&format!("SELECT id, {id_col} FROM {FIELDS_TABLE} WHERE {id_col} GLOB ?1"))?;
        let rows = stmt
            .query_map([document_type.non_canonical_pattern()], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut rewritten = 0;
    for (field_id, value) in raw {
        let canonical = document_type.normalize(&value);
        if canonical.is_empty() {
            continue;
        }
        rewrite_identifier(conn, document_type, field_id, &canonical)?;
        rewritten += 1;
    }
    Ok(rewritten)
}

/// Deletes one fields row, and its document row once no fields remain.
/// Returns true if the document row was removed too.
///
/// # Errors
/// Propagates SQLite failures.
pub fn delete_record(conn: &Connection, document_type: DocumentType, record: &DocumentRecord) -> LedgerResult<bool> {
    conn.execute(&format!("DELETE FROM {FIELDS_TABLE} WHERE id = ?1"), [record.field_id])?;

    let remaining: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {FIELDS_TABLE} WHERE document_id = ?1"),
        [record.document_id],
        |row| row.get(0),
    )?;
    if remaining > 0 {
        return Ok(false);
    }

    if sqlite::table_exists(conn, crate::storage::ledger::USER_DOCUMENTS_TABLE)? {
        crate::storage::ledger::unlink_document(conn, document_type, record.document_id)?;
    }
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", document_type.documents_table()),
        [record.document_id],
    )?;
    Ok(true)
}

/// Points a record's fields and document rows at `user_id`.
///
/// # Errors
/// Propagates SQLite failures; fails if the store has not been migrated.
pub fn assign_user(
    conn: &Connection,
    document_type: DocumentType,
    record: &DocumentRecord,
    user_id: UserId,
) -> LedgerResult<()> {
    let user = user_id.to_string();
    conn.execute(
        &format!("UPDATE {FIELDS_TABLE} SET user_id = ?1 WHERE id = ?2"),
        params![user, record.field_id],
    )?;
    conn.execute(
        &format!("UPDATE {} SET user_id = ?1 WHERE id = ?2", document_type.documents_table()),
        params![user, record.document_id],
    )?;
    Ok(())
}

/// Rewrites a record's stored identifier.
///
/// # Errors
/// Propagates SQLite failures.
pub fn rewrite_identifier(
    conn: &Connection,
    document_type: DocumentType,
    field_id: i64,
    canonical: &str,
) -> LedgerResult<()> {
    conn.execute(
        &format!("UPDATE {FIELDS_TABLE} SET {} = ?1 WHERE id = ?2", document_type.identifier_column()),
        params![canonical, field_id],
    )?;
    Ok(())
}

/// `(total, with_user_id)` fields-row counts.
///
/// # Errors
/// Propagates SQLite failures.
pub fn coverage_counts(conn: &Connection) -> LedgerResult<(u64, u64)> {
    let total: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {FIELDS_TABLE}"), [], |row| row.get(0))?;
    let with_user: i64 = if fields_have_user_id(conn)? {
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {FIELDS_TABLE} WHERE user_id IS NOT NULL AND user_id != ''"),
            [],
            |row| row.get(0),
        )?
    } else {
        0
    };
    Ok((u64::try_from(total).unwrap_or(0), u64::try_from(with_user).unwrap_or(0)))
}
