//! The ingestion boundary.
//!
//! Extraction hands over a field dictionary; this module validates it,
//! refuses duplicates, resolves the owning user and stores the document.
//! Every expected failure comes back as a [`Rejection`], never a panic.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::directory::{SyncOutcome, UserDirectory};
use crate::document::{ExtractedFields, NewDocument, FIELDS_TABLE};
use crate::error::{LedgerError, LedgerResult, Rejection};
use crate::guard::{DuplicateGuard, Uniqueness};
use crate::identifier::{DocumentType, Identifier};
use crate::storage::{documents, ledger, sqlite, SqliteStore, Stores};
use crate::user::UserId;

/// A document offered for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Target store.
    pub document_type: DocumentType,
    /// Extracted fields, identifier not yet normalized.
    pub fields: ExtractedFields,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f64,
    /// Source file path.
    #[serde(default)]
    pub source_path: Option<String>,
    /// Raw OCR text.
    #[serde(default)]
    pub raw_text: Option<String>,
    /// Explicit owner, for linking a document to a user created from
    /// another document type.
    #[serde(default)]
    pub link_user: Option<UserId>,
}

impl IngestRequest {
    /// Request with no source path, raw text or link hint.
    #[must_use]
    pub fn new(document_type: DocumentType, fields: ExtractedFields, confidence: f64) -> Self {
        Self {
            document_type,
            fields,
            confidence,
            source_path: None,
            raw_text: None,
            link_user: None,
        }
    }

    /// Sets the source path.
    #[must_use]
    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Links the document to an existing user.
    #[must_use]
    pub const fn linked_to(mut self, user_id: UserId) -> Self {
        self.link_user = Some(user_id);
        self
    }
}

/// What an accepted ingestion stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Owning user.
    pub user_id: UserId,
    /// Store written.
    pub document_type: DocumentType,
    /// New document row.
    pub document_id: i64,
    /// New fields row.
    pub field_id: i64,
    /// Identifier as stored.
    pub canonical_identifier: String,
}

/// Validates, de-duplicates and stores documents.
#[derive(Debug, Clone)]
pub struct Ingestor {
    stores: Stores,
    directory: Arc<UserDirectory>,
    guard: Arc<DuplicateGuard>,
}

impl Ingestor {
    /// Ingestor writing to `stores`.
    #[must_use]
    pub fn new(stores: Stores, directory: Arc<UserDirectory>, guard: Arc<DuplicateGuard>) -> Self {
        Self {
            stores,
            directory,
            guard,
        }
    }

    /// Accepts or rejects one document.
    ///
    /// # Errors
    /// A [`Rejection`] carrying the typed cause: a duplicate, invalid
    /// fields, an unknown link target, or an infrastructure failure.
    #[instrument(skip_all, fields(store = %request.document_type))]
    pub fn ingest(&self, request: IngestRequest) -> Result<IngestReceipt, Rejection> {
        self.try_ingest(&request).map_err(|err| {
            if err.is_rejection() {
                tracing::warn!(code = err.code(), error = %err, "document rejected");
            } else {
                tracing::error!(code = err.code(), error = %err, "ingestion failed");
            }
            Rejection::new(err)
        })
    }

    fn try_ingest(&self, request: &IngestRequest) -> LedgerResult<IngestReceipt> {
        let dt = request.document_type;
        let (identifier, name) = validate(request)?;
        let store = self.stores.get(dt);
        require_linked_layout(store)?;

        if let Uniqueness::Duplicate(existing) = self.guard.validate_uniqueness(dt, &request.fields)? {
            return Err(self.guard.reject_duplicate(dt, &request.fields, request.source_path.as_deref(), *existing)?);
        }

        let attribution = match request.link_user {
            Some(user_id) => {
                if self.directory.lookup_by_id(user_id)?.is_none() {
                    return Err(LedgerError::IdentityNotFound {
                        lookup: "user_id",
                        value: user_id.to_string(),
                    });
                }
                self.directory.attribute_to(user_id)?
            }
            None => self.directory.attribute(&identifier, &name, dt)?,
        };

        let stored = self.store_document(request, &identifier, attribution.user_id);
        if let Err(err) = &stored {
            // A document that was not stored must not be counted.
            if let Err(e) = self.directory.withdraw(&attribution) {
                tracing::error!(user_id = %attribution.user_id, error = %e, cause = %err, "could not withdraw document count");
            }
        }
        stored
    }

    fn store_document(
        &self,
        request: &IngestRequest,
        identifier: &Identifier,
        user_id: UserId,
    ) -> LedgerResult<IngestReceipt> {
        let dt = request.document_type;
        let mut conn = self.stores.get(dt).connect()?;
        let replicated = ledger::find_by_id(&conn, user_id)?.is_none()
            && matches!(self.directory.sync_across_stores(user_id)?, SyncOutcome::Copied(_));

        let mut fields = request.fields.clone();
        fields.identifier = Some(identifier.as_str().to_string());
        let doc = NewDocument {
            document_type: dt,
            fields,
            confidence: request.confidence,
            source_path: request.source_path.clone(),
            raw_text: request.raw_text.clone(),
            user_id: Some(user_id),
            created_at: None,
        };

        let stored = (|| {
            let tx = conn.transaction()?;
            let (document_id, field_id) = documents::insert(&tx, &doc)?;
            ledger::link_document(&tx, user_id, dt, document_id)?;
            tx.commit()?;
            Ok::<_, LedgerError>((document_id, field_id))
        })();

        let (document_id, field_id) = match stored {
            Ok(ids) => ids,
            Err(err) => {
                if replicated {
                    if let Err(e) = self.directory.drop_unlinked_replica(user_id, dt) {
                        tracing::warn!(%user_id, error = %e, "could not remove replica copied for a failed write");
                    }
                }
                return Err(match err {
                    LedgerError::Storage(e) if sqlite::is_unique_violation(&e) => {
                        self.lost_insert_race(request, identifier, e)?
                    }
                    other => other,
                });
            }
        };

        tracing::info!(%user_id, document_id, field_id, identifier = %identifier, "document ingested");
        Ok(IngestReceipt {
            user_id,
            document_type: dt,
            document_id,
            field_id,
            canonical_identifier: identifier.as_str().to_string(),
        })
    }

    /// A concurrent ingestion stored the same identifier between the guard
    /// check and the insert.
    fn lost_insert_race(
        &self,
        request: &IngestRequest,
        identifier: &Identifier,
        cause: rusqlite::Error,
    ) -> LedgerResult<LedgerError> {
        match self.guard.check_exists(identifier)? {
            Some(existing) => self.guard.reject_duplicate(
                request.document_type,
                &request.fields,
                request.source_path.as_deref(),
                existing,
            ),
            None => Ok(sqlite::classify_constraint_error(cause, FIELDS_TABLE)),
        }
    }
}

fn validate(request: &IngestRequest) -> LedgerResult<(Identifier, String)> {
    let dt = request.document_type;
    let mut missing = Vec::new();
    let name = request.fields.name_trimmed();
    let raw = request.fields.identifier_trimmed();
    if raw.is_none() {
        missing.push(dt.identifier_column().to_string());
    }
    if name.is_none() {
        missing.push("name".to_string());
    }
    if !missing.is_empty() {
        return Err(LedgerError::InvalidDocumentFields {
            document_type: dt,
            reason: format!("missing required fields: {}", missing.join(", ")),
            missing_fields: missing,
        });
    }

    if !request.confidence.is_finite() || !(0.0..=1.0).contains(&request.confidence) {
        return Err(LedgerError::InvalidDocumentFields {
            document_type: dt,
            reason: format!("confidence {} is outside [0, 1]", request.confidence),
            missing_fields: Vec::new(),
        });
    }

    let identifier = Identifier::new(dt, raw.unwrap_or_default());
    if identifier.is_empty() {
        return Err(LedgerError::InvalidDocumentFields {
            document_type: dt,
            reason: format!("{} number contains no usable characters", dt.label()),
            missing_fields: Vec::new(),
        });
    }
    Ok((identifier, name.unwrap_or_default().to_string()))
}

fn require_linked_layout(store: &SqliteStore) -> LedgerResult<()> {
    let linked = match store.connect_read_only()? {
        Some(conn) => has_linked_layout(&conn, store.document_type())?,
        None => false,
    };
    if linked {
        return Ok(());
    }
    Err(LedgerError::MigrationStepFailure {
        step: "migrate_store".to_string(),
        store: store.path().to_path_buf(),
        rollback_available: false,
        backup_path: None,
        reason: "store has not been migrated; run setup first".to_string(),
    })
}

fn has_linked_layout(conn: &Connection, document_type: DocumentType) -> LedgerResult<bool> {
    Ok(ledger::has_tables(conn)?
        && sqlite::has_column(conn, document_type.documents_table(), "user_id")?
        && sqlite::has_column(conn, FIELDS_TABLE, "user_id")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_name_and_identifier() {
        let request = IngestRequest::new(DocumentType::Aadhaar, ExtractedFields::default(), 0.9);
        match validate(&request).unwrap_err() {
            LedgerError::InvalidDocumentFields { missing_fields, .. } => {
                assert_eq!(missing_fields, vec!["aadhaar_number", "name"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_bad_confidence() {
        let fields = ExtractedFields::new("Asha", "123456789012");
        for confidence in [-0.1, 1.5, f64::NAN] {
            let request = IngestRequest::new(DocumentType::Aadhaar, fields.clone(), confidence);
            assert!(validate(&request).is_err());
        }
    }

    #[test]
    fn test_validate_rejects_unusable_identifier() {
        let request = IngestRequest::new(DocumentType::Pan, ExtractedFields::new("Ravi", "--- ---"), 0.9);
        assert!(validate(&request).is_err());
    }

    #[test]
    fn test_validate_normalizes() {
        let request = IngestRequest::new(DocumentType::Pan, ExtractedFields::new(" Ravi ", "abcde-1234-f"), 0.9);
        let (identifier, name) = validate(&request).unwrap();
        assert_eq!(identifier.as_str(), "ABCDE1234F");
        assert_eq!(name, "Ravi");
    }
}
