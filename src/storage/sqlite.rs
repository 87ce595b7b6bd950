//! Small SQLite helpers shared by the document, ledger and migration code.

use rusqlite::{ffi, Connection, OptionalExtension};

use crate::error::LedgerError;

/// Quotes an identifier for interpolation into DDL.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Name of the unique index guarding `table.field`.
#[must_use]
pub fn unique_index_name(table: &str, field: &str) -> String {
    let field: String = field
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("idx_{table}_{field}_unique")
}

/// Returns true if a table named `name` exists.
///
/// # Errors
/// Propagates SQLite failures.
pub fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    object_exists(conn, "table", name)
}

/// Returns true if an index named `name` exists.
///
/// # Errors
/// Propagates SQLite failures.
pub fn index_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    object_exists(conn, "index", name)
}

fn object_exists(conn: &Connection, kind: &str, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2",
        [kind, name],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

/// Column names of `table`, in declaration order. Empty if the table is missing.
///
/// # Errors
/// Propagates SQLite failures.
pub fn column_names(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Returns true if `table` has a column named `column`.
///
/// # Errors
/// Propagates SQLite failures.
pub fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    Ok(column_names(conn, table)?.iter().any(|c| c == column))
}

/// Reads `PRAGMA user_version`.
///
/// # Errors
/// Propagates SQLite failures.
pub fn user_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Writes `PRAGMA user_version`.
///
/// # Errors
/// Propagates SQLite failures.
pub fn set_user_version(conn: &Connection, version: i64) -> rusqlite::Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
}

fn extended_code(err: &rusqlite::Error) -> Option<i32> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            Some(e.extended_code)
        }
        _ => None,
    }
}

/// True for UNIQUE and PRIMARY KEY violations.
#[must_use]
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        extended_code(err),
        Some(ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

/// True when the violation message names `target` (e.g. `users.user_id`).
#[must_use]
pub fn violation_mentions(err: &rusqlite::Error, target: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message.contains(target),
        _ => false,
    }
}

/// Maps a SQLite constraint failure to a typed violation; anything else is
/// passed through as a storage error.
#[must_use]
pub fn classify_constraint_error(err: rusqlite::Error, table: &str) -> LedgerError {
    let constraint = match extended_code(&err) {
        Some(ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY) => "UNIQUE",
        Some(ffi::SQLITE_CONSTRAINT_FOREIGNKEY) => "FOREIGN KEY",
        Some(ffi::SQLITE_CONSTRAINT_NOTNULL) => "NOT NULL",
        Some(_) => "CHECK",
        None => return LedgerError::Storage(err),
    };
    let reason = match &err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message.clone(),
        other => other.to_string(),
    };
    let column = reason
        .rsplit_once('.')
        .map(|(_, col)| col.trim().to_string())
        .filter(|col| !col.is_empty() && !col.contains(' '));
    LedgerError::SchemaConstraintViolation {
        constraint: constraint.to_string(),
        table: table.to_string(),
        column,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, code TEXT NOT NULL);
             CREATE UNIQUE INDEX idx_t_code_unique ON t(code);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_introspection() {
        let conn = conn();
        assert!(table_exists(&conn, "t").unwrap());
        assert!(!table_exists(&conn, "missing").unwrap());
        assert!(index_exists(&conn, "idx_t_code_unique").unwrap());
        assert_eq!(column_names(&conn, "t").unwrap(), vec!["id", "code"]);
        assert!(column_names(&conn, "missing").unwrap().is_empty());
        assert!(has_column(&conn, "t", "code").unwrap());
    }

    #[test]
    fn test_unique_index_name() {
        assert_eq!(
            unique_index_name("extracted_fields", "Aadhaar Number"),
            "idx_extracted_fields_aadhaar_number_unique"
        );
    }

    #[test]
    fn test_classify_unique_violation() {
        let conn = conn();
        conn.execute("INSERT INTO t (code) VALUES ('a')", []).unwrap();
        let err = conn.execute("INSERT INTO t (code) VALUES ('a')", []).unwrap_err();
        assert!(is_unique_violation(&err));
        assert!(violation_mentions(&err, "t.code"));

        let typed = classify_constraint_error(err, "t");
        assert_eq!(typed.kind(), ErrorKind::SchemaConstraintViolation);
        match typed {
            LedgerError::SchemaConstraintViolation { constraint, column, .. } => {
                assert_eq!(constraint, "UNIQUE");
                assert_eq!(column.as_deref(), Some("code"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_not_null() {
        let conn = conn();
        let err = conn.execute("INSERT INTO t (code) VALUES (NULL)", []).unwrap_err();
        assert!(!is_unique_violation(&err));
        match classify_constraint_error(err, "t") {
            LedgerError::SchemaConstraintViolation { constraint, .. } => assert_eq!(constraint, "NOT NULL"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_user_version() {
        let conn = conn();
        assert_eq!(user_version(&conn).unwrap(), 0);
        set_user_version(&conn, 1).unwrap();
        assert_eq!(user_version(&conn).unwrap(), 1);
    }
}
