//! Error taxonomy for the identity ledger.
//!
//! Every failure is strongly typed so callers can match on the condition
//! (a duplicate, a missing identity, a failed migration step) rather than
//! on message text. Each error also knows how to describe itself to an
//! operator: a stable machine code, structured details and a suggested
//! next action.

use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::document::DocumentRecord;
use crate::identifier::DocumentType;
use crate::user::UserId;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Identifier already exists in the store.
    DuplicateIdentifier,
    /// A store-level constraint was violated.
    SchemaConstraintViolation,
    /// A migration step failed.
    MigrationStepFailure,
    /// Requested identity does not exist.
    IdentityNotFound,
    /// Required fields missing or malformed.
    InvalidDocumentFields,
    /// No unique user id could be produced.
    IdentifierGenerationFailure,
    /// Post-migration integrity finding.
    DataIntegrityIssue,
    /// Lost a write race that could not be resolved.
    ConcurrentWriteConflict,
    /// Underlying SQLite failure.
    Storage,
    /// Filesystem failure.
    Io,
    /// JSON encoding or decoding failure.
    Serialization,
    /// Invalid configuration.
    Config,
}

/// Severity attached to integrity findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational.
    Low,
    /// Needs attention soon.
    Medium,
    /// Needs attention now.
    High,
}

/// Top-level error type for the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The identifier is already stored.
    #[error("{document_type} number {identifier} already exists (document {existing_document_id})")]
    DuplicateIdentifier {
        /// Store the document was offered to.
        document_type: DocumentType,
        /// Canonical identifier.
        identifier: String,
        /// Owner of the existing record, if it has been linked.
        existing_user_id: Option<UserId>,
        /// Document row of the existing record.
        existing_document_id: i64,
        /// The existing record.
        existing: Box<DocumentRecord>,
    },

    /// A schema constraint could not be applied or was violated.
    #[error("constraint {constraint} violated on {table}: {reason}")]
    SchemaConstraintViolation {
        /// Constraint or index name.
        constraint: String,
        /// Table concerned.
        table: String,
        /// Column concerned, if any.
        column: Option<String>,
        /// What blocked it.
        reason: String,
    },

    /// A migration step failed; the store may need restoring.
    #[error("migration step '{step}' failed for {}: {reason}", .store.display())]
    MigrationStepFailure {
        /// Step name, as written to the migration log.
        step: String,
        /// Store file.
        store: PathBuf,
        /// Whether a backup exists to restore from.
        rollback_available: bool,
        /// That backup.
        backup_path: Option<PathBuf>,
        /// Underlying failure.
        reason: String,
    },

    /// No user matches the lookup.
    #[error("no user found for {lookup} {value}")]
    IdentityNotFound {
        /// Lookup key kind (`user_id`, `identifier`).
        lookup: &'static str,
        /// Value looked up.
        value: String,
    },

    /// The offered fields cannot be stored.
    #[error("invalid {document_type} document fields: {reason}")]
    InvalidDocumentFields {
        /// Store the document was offered to.
        document_type: DocumentType,
        /// What is wrong.
        reason: String,
        /// Required fields that were absent.
        missing_fields: Vec<String>,
    },

    /// Every generated user id collided.
    #[error("could not generate a unique user id after {attempts} attempts: {reason}")]
    IdentifierGenerationFailure {
        /// Ids tried.
        attempts: u32,
        /// Why the last attempt failed.
        reason: String,
    },

    /// Stored data breaks a ledger invariant.
    #[error("data integrity issue ({check}): {message}")]
    DataIntegrityIssue {
        /// Name of the failed check.
        check: String,
        /// Description.
        message: String,
        /// Records involved.
        affected_records: u64,
        /// How urgent it is.
        severity: Severity,
    },

    /// Another writer or maintenance run got there first.
    #[error("concurrent write conflict during {operation} on {resource}")]
    ConcurrentWriteConflict {
        /// Operation that lost.
        operation: String,
        /// Contended resource.
        resource: String,
    },

    /// SQLite failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// File-system failure.
    #[error("i/o error while {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Description.
        message: String,
    },
}

impl LedgerError {
    /// Wraps an I/O error with what was being attempted.
    #[must_use]
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Builds the duplicate error for an existing record.
    #[must_use]
    pub fn duplicate(existing: DocumentRecord) -> Self {
        Self::DuplicateIdentifier {
            document_type: existing.document_type,
            identifier: existing.canonical_identifier.clone(),
            existing_user_id: existing.user_id,
            existing_document_id: existing.document_id,
            existing: Box::new(existing),
        }
    }

    /// Machine-readable category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateIdentifier { .. } => ErrorKind::DuplicateIdentifier,
            Self::SchemaConstraintViolation { .. } => ErrorKind::SchemaConstraintViolation,
            Self::MigrationStepFailure { .. } => ErrorKind::MigrationStepFailure,
            Self::IdentityNotFound { .. } => ErrorKind::IdentityNotFound,
            Self::InvalidDocumentFields { .. } => ErrorKind::InvalidDocumentFields,
            Self::IdentifierGenerationFailure { .. } => ErrorKind::IdentifierGenerationFailure,
            Self::DataIntegrityIssue { .. } => ErrorKind::DataIntegrityIssue,
            Self::ConcurrentWriteConflict { .. } => ErrorKind::ConcurrentWriteConflict,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Io { .. } => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    /// Stable error code for API consumers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::DuplicateIdentifier { document_type, .. } => match document_type {
                DocumentType::Aadhaar => "DUPLICATE_AADHAAR",
                DocumentType::Pan => "DUPLICATE_PAN",
            },
            Self::SchemaConstraintViolation { .. } => "DB_CONSTRAINT_ERROR",
            Self::MigrationStepFailure { .. } => "MIGRATION_ERROR",
            Self::IdentityNotFound { .. } => "USER_NOT_FOUND",
            Self::InvalidDocumentFields { .. } => "INVALID_DOCUMENT_DATA",
            Self::IdentifierGenerationFailure { .. } => "USER_ID_GENERATION_ERROR",
            Self::DataIntegrityIssue { .. } => "DATA_INTEGRITY_ERROR",
            Self::ConcurrentWriteConflict { .. } => "CONCURRENCY_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
        }
    }

    /// What an operator or client should do next.
    #[must_use]
    pub const fn suggested_action(&self) -> &'static str {
        match self {
            Self::DuplicateIdentifier { .. } => {
                "This document is already registered. Use the existing record or link the upload to the existing user."
            }
            Self::SchemaConstraintViolation { .. } => {
                "Run the duplicate scan and cleanup before retrying, then re-apply the constraint."
            }
            Self::MigrationStepFailure { .. } => {
                "Inspect the migration log; restore from the recorded backup if the store is unusable."
            }
            Self::IdentityNotFound { .. } => "Verify the user id or identifier and retry.",
            Self::InvalidDocumentFields { .. } => {
                "Check the document image quality and re-run extraction."
            }
            Self::IdentifierGenerationFailure { .. } => "Retry the operation.",
            Self::DataIntegrityIssue { .. } => {
                "Review the integrity report and resolve the listed records manually."
            }
            Self::ConcurrentWriteConflict { .. } => "Retry the operation.",
            Self::Storage(_) => "Check that the store file is reachable and not locked, then retry.",
            Self::Io { .. } => "Check file permissions and free disk space.",
            Self::Serialization(_) => "Inspect the offending log or report file.",
            Self::Config { .. } => "Fix the configuration and restart.",
        }
    }

    /// Structured details for reports and rejection responses.
    #[must_use]
    pub fn details(&self) -> Value {
        match self {
            Self::DuplicateIdentifier {
                document_type,
                identifier,
                existing_user_id,
                existing_document_id,
                existing,
            } => json!({
                "document_type": document_type,
                "identifier": identifier,
                "existing_user_id": existing_user_id,
                "existing_document_id": existing_document_id,
                "existing_field_id": existing.field_id,
                "existing_name": existing.fields.name,
                "existing_source_path": existing.source_path,
                "existing_created_at": existing.created_at,
            }),
            Self::SchemaConstraintViolation {
                constraint,
                table,
                column,
                reason,
            } => json!({
                "constraint": constraint,
                "table": table,
                "column": column,
                "reason": reason,
            }),
            Self::MigrationStepFailure {
                step,
                store,
                rollback_available,
                backup_path,
                reason,
            } => json!({
                "step": step,
                "store": store,
                "rollback_available": rollback_available,
                "backup_path": backup_path,
                "reason": reason,
            }),
            Self::IdentityNotFound { lookup, value } => json!({
                "lookup": lookup,
                "value": value,
            }),
            Self::InvalidDocumentFields {
                document_type,
                reason,
                missing_fields,
            } => json!({
                "document_type": document_type,
                "reason": reason,
                "missing_fields": missing_fields,
            }),
            Self::IdentifierGenerationFailure { attempts, reason } => json!({
                "attempts": attempts,
                "reason": reason,
            }),
            Self::DataIntegrityIssue {
                check,
                message,
                affected_records,
                severity,
            } => json!({
                "check": check,
                "message": message,
                "affected_records": affected_records,
                "severity": severity,
            }),
            Self::ConcurrentWriteConflict {
                operation,
                resource,
            } => json!({
                "operation": operation,
                "resource": resource,
            }),
            Self::Io { context, source } => json!({
                "context": context,
                "source": source.to_string(),
            }),
            Self::Storage(_) | Self::Serialization(_) | Self::Config { .. } => {
                json!({ "message": self.to_string() })
            }
        }
    }

    /// True for errors the ingestion boundary turns into a rejection
    /// instead of propagating.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::DuplicateIdentifier { .. }
                | Self::InvalidDocumentFields { .. }
                | Self::IdentityNotFound { .. }
        )
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrentWriteConflict { .. } | Self::IdentifierGenerationFailure { .. } => {
                true
            }
            Self::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// A rejected ingestion: the typed error plus when it happened.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Rejection {
    /// Underlying typed error.
    pub error: LedgerError,
    /// Rejection time.
    pub rejected_at: DateTime<Utc>,
}

impl Rejection {
    /// Wraps an error, stamping the current time.
    #[must_use]
    pub fn new(error: LedgerError) -> Self {
        Self {
            error,
            rejected_at: Utc::now(),
        }
    }

    /// Error category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Renders the structured response sent back to the caller.
    #[must_use]
    pub fn response(&self) -> RejectionResponse {
        RejectionResponse {
            success: false,
            error: RejectionBody {
                kind: self.error.kind(),
                code: self.error.code().to_string(),
                message: self.error.to_string(),
                timestamp: self.rejected_at,
                suggested_action: self.error.suggested_action().to_string(),
            },
            details: self.error.details(),
        }
    }
}

impl From<LedgerError> for Rejection {
    fn from(error: LedgerError) -> Self {
        Self::new(error)
    }
}

/// Serializable rejection payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionResponse {
    /// Always `false`.
    pub success: bool,
    /// Error summary.
    pub error: RejectionBody,
    /// Error-specific details.
    pub details: Value,
}

/// Error summary inside a [`RejectionResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionBody {
    /// Category.
    pub kind: ErrorKind,
    /// Stable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// When the rejection happened.
    pub timestamp: DateTime<Utc>,
    /// Next step for the caller.
    pub suggested_action: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ExtractedFields;

    fn existing_record(document_type: DocumentType) -> DocumentRecord {
        DocumentRecord {
            field_id: 7,
            document_id: 3,
            document_type,
            identifier: "123456789012".to_string(),
            canonical_identifier: "123456789012".to_string(),
            fields: ExtractedFields::new("John Doe", "123456789012"),
            confidence: 0.9,
            user_id: Some(UserId::new()),
            source_path: Some("scan.png".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_error_codes() {
        let err = LedgerError::duplicate(existing_record(DocumentType::Aadhaar));
        assert_eq!(err.code(), "DUPLICATE_AADHAAR");
        assert_eq!(err.kind(), ErrorKind::DuplicateIdentifier);
        assert!(err.is_rejection());
        assert!(!err.is_retryable());

        let err = LedgerError::duplicate(existing_record(DocumentType::Pan));
        assert_eq!(err.code(), "DUPLICATE_PAN");
    }

    #[test]
    fn test_duplicate_details_carry_existing_ids() {
        let record = existing_record(DocumentType::Aadhaar);
        let user = record.user_id;
        let err = LedgerError::duplicate(record);
        let details = err.details();
        assert_eq!(details["existing_document_id"], 3);
        assert_eq!(details["existing_user_id"], json!(user));
        assert!(format!("{err}").contains("123456789012"));
    }

    #[test]
    fn test_constraint_violation_message() {
        let err = LedgerError::SchemaConstraintViolation {
            constraint: "idx_extracted_fields_aadhaar_number_unique".to_string(),
            table: "extracted_fields".to_string(),
            column: Some("aadhaar_number".to_string()),
            reason: "2 duplicate values".to_string(),
        };
        assert_eq!(err.code(), "DB_CONSTRAINT_ERROR");
        assert!(err.suggested_action().contains("duplicate scan"));
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_retryable_conditions() {
        let err = LedgerError::ConcurrentWriteConflict {
            operation: "create_user".to_string(),
            resource: "users".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!LedgerError::config("bad").is_retryable());
    }

    #[test]
    fn test_rejection_response_shape() {
        let rejection = Rejection::from(LedgerError::InvalidDocumentFields {
            document_type: DocumentType::Pan,
            reason: "missing name".to_string(),
            missing_fields: vec!["name".to_string()],
        });
        let response = rejection.response();
        assert!(!response.success);
        assert_eq!(response.error.code, "INVALID_DOCUMENT_DATA");
        assert_eq!(response.details["missing_fields"][0], "name");

        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["error"]["kind"], "invalid_document_fields");
    }
}
