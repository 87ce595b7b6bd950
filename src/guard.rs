//! Pre-insert duplicate checks and rejection auditing.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::audit::{AuditSink, DuplicateAttempt, ExistingSnapshot};
use crate::document::{DocumentRecord, ExtractedFields};
use crate::error::{LedgerError, LedgerResult};
use crate::identifier::{DocumentType, Identifier};
use crate::storage::{documents, Stores};

/// Outcome of a uniqueness check.
#[derive(Debug, Clone, PartialEq)]
pub enum Uniqueness {
    /// No stored record carries this identifier.
    Unique,
    /// A record already carries it.
    Duplicate(Box<DocumentRecord>),
}

impl Uniqueness {
    /// True for [`Uniqueness::Unique`].
    #[must_use]
    pub const fn is_unique(&self) -> bool {
        matches!(self, Self::Unique)
    }

    /// The existing record, if any.
    #[must_use]
    pub fn existing(&self) -> Option<&DocumentRecord> {
        match self {
            Self::Unique => None,
            Self::Duplicate(record) => Some(record),
        }
    }

    /// `(is_unique, existing)` pair.
    #[must_use]
    pub fn into_parts(self) -> (bool, Option<DocumentRecord>) {
        match self {
            Self::Unique => (true, None),
            Self::Duplicate(record) => (false, Some(*record)),
        }
    }
}

/// Identifier quality for one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMetrics {
    /// Stored records.
    pub total_records: u64,
    /// Distinct non-empty canonical identifiers.
    pub unique_identifiers: u64,
    /// Records beyond the first for each identifier.
    pub duplicate_records: u64,
    /// Records whose canonical identifier has the expected shape.
    pub valid_format_records: u64,
    /// `duplicate_records / total_records`, as a percentage.
    pub duplicate_percentage: f64,
}

/// Identifier quality across both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// When the metrics were computed.
    pub generated_at: DateTime<Utc>,
    /// Per-store metrics.
    pub per_type: BTreeMap<DocumentType, TypeMetrics>,
}

/// Checks incoming documents against what is already stored.
pub struct DuplicateGuard {
    stores: Stores,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for DuplicateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateGuard").field("stores", &self.stores).finish_non_exhaustive()
    }
}

impl DuplicateGuard {
    /// Guard over `stores`, recording rejections to `audit`.
    #[must_use]
    pub fn new(stores: Stores, audit: Arc<dyn AuditSink>) -> Self {
        Self { stores, audit }
    }

    /// Audit sink receiving duplicate attempts.
    #[must_use]
    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Oldest stored record carrying `identifier`, in its type's store.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn check_exists(&self, identifier: &Identifier) -> LedgerResult<Option<DocumentRecord>> {
        if identifier.is_empty() {
            return Ok(None);
        }
        let dt = identifier.document_type();
        let Some(conn) = self.stores.get(dt).connect_read_only()? else {
            return Ok(None);
        };
        if !documents::has_tables(&conn, dt)? {
            return Ok(None);
        }
        documents::find_by_identifier(&conn, dt, identifier.as_str())
    }

    /// Decides whether `fields` may be inserted into `document_type`'s store.
    ///
    /// Fields without an identifier are reported unique; rejecting them is
    /// field validation's job.
    ///
    /// # Errors
    /// Propagates store failures.
    #[instrument(skip_all, fields(store = %document_type))]
    pub fn validate_uniqueness(&self, document_type: DocumentType, fields: &ExtractedFields) -> LedgerResult<Uniqueness> {
        let Some(raw) = fields.identifier_trimmed() else {
            return Ok(Uniqueness::Unique);
        };
        let identifier = Identifier::new(document_type, raw);
        Ok(match self.check_exists(&identifier)? {
            Some(existing) => Uniqueness::Duplicate(Box::new(existing)),
            None => Uniqueness::Unique,
        })
    }

    /// Audits a duplicate attempt and builds the typed error for it.
    ///
    /// # Errors
    /// Returns the audit failure if the attempt could not be recorded; the
    /// attempt is still logged through `tracing` in that case.
    pub fn reject_duplicate(
        &self,
        document_type: DocumentType,
        fields: &ExtractedFields,
        source_path: Option<&str>,
        existing: DocumentRecord,
    ) -> LedgerResult<LedgerError> {
        let attempt = DuplicateAttempt {
            timestamp: Utc::now(),
            document_type,
            attempted_identifier: existing.canonical_identifier.clone(),
            attempted_name: fields.name.clone(),
            source_path: source_path.map(str::to_string),
            existing: ExistingSnapshot::from(&existing),
        };

        tracing::warn!(
            store = %document_type,
            identifier = %attempt.attempted_identifier,
            existing_document_id = existing.document_id,
            existing_user_id = ?existing.user_id,
            "duplicate document rejected"
        );

        if let Err(e) = self.audit.record(&attempt) {
            tracing::error!(error = %e, identifier = %attempt.attempted_identifier, "could not audit duplicate attempt");
            return Err(e);
        }
        Ok(LedgerError::duplicate(existing))
    }

    /// Identifier quality per store.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn get_quality_metrics(&self) -> LedgerResult<QualityMetrics> {
        let mut per_type = BTreeMap::new();
        for store in self.stores.iter() {
            let dt = store.document_type();
            let records = match store.connect_read_only()? {
                Some(conn) if documents::has_tables(&conn, dt)? => documents::load_all(&conn, dt)?,
                _ => Vec::new(),
            };
            per_type.insert(dt, type_metrics(dt, &records));
        }
        Ok(QualityMetrics {
            generated_at: Utc::now(),
            per_type,
        })
    }
}

fn type_metrics(document_type: DocumentType, records: &[DocumentRecord]) -> TypeMetrics {
    let total = records.len() as u64;
    let keyed: Vec<&str> = records
        .iter()
        .map(|r| r.canonical_identifier.as_str())
        .filter(|c| !c.is_empty())
        .collect();
    let unique = keyed.iter().collect::<HashSet<_>>().len() as u64;
    let duplicates = keyed.len() as u64 - unique;
    let valid = keyed.iter().filter(|c| document_type.is_well_formed(c)).count() as u64;

    #[allow(clippy::cast_precision_loss)]
    let duplicate_percentage = if total == 0 {
        0.0
    } else {
        (duplicates as f64 / total as f64 * 10_000.0).round() / 100.0
    };

    TypeMetrics {
        total_records: total,
        unique_identifiers: unique,
        duplicate_records: duplicates,
        valid_format_records: valid,
        duplicate_percentage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::LedgerConfig;
    use crate::document::NewDocument;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn seeded(dir: &std::path::Path, identifiers: &[&str]) -> (DuplicateGuard, Arc<MemoryAuditSink>) {
        let stores = Stores::from_config(&LedgerConfig::in_dir(dir));
        let store = stores.get(DocumentType::Aadhaar);
        store.ensure_document_tables().unwrap();
        let conn = store.connect().unwrap();
        for id in identifiers {
            let doc = NewDocument::new(DocumentType::Aadhaar, ExtractedFields::new("Asha", *id), 0.9);
            documents::insert(&conn, &doc).unwrap();
        }
        let audit = Arc::new(MemoryAuditSink::new());
        (DuplicateGuard::new(stores, audit.clone()), audit)
    }

    #[test]
    fn test_validate_uniqueness() {
        let dir = tempdir().unwrap();
        let (guard, _) = seeded(dir.path(), &["123456789012"]);

        let dup = guard
            .validate_uniqueness(DocumentType::Aadhaar, &ExtractedFields::new("Asha", "1234 5678 9012"))
            .unwrap();
        let (unique, existing) = dup.into_parts();
        assert!(!unique);
        assert_eq!(existing.unwrap().canonical_identifier, "123456789012");

        let fresh = guard
            .validate_uniqueness(DocumentType::Aadhaar, &ExtractedFields::new("Asha", "999988887777"))
            .unwrap();
        assert!(fresh.is_unique());
        assert!(fresh.existing().is_none());
    }

    #[test]
    fn test_missing_store_is_unique() {
        let dir = tempdir().unwrap();
        let (guard, _) = seeded(dir.path(), &[]);
        let result = guard
            .validate_uniqueness(DocumentType::Pan, &ExtractedFields::new("Ravi", "ABCDE1234F"))
            .unwrap();
        assert!(result.is_unique());
    }

    #[test]
    fn test_reject_duplicate_is_audited() {
        let dir = tempdir().unwrap();
        let (guard, audit) = seeded(dir.path(), &["123456789012"]);
        let fields = ExtractedFields::new("Asha R", "123456789012");
        let existing = guard
            .check_exists(&Identifier::aadhaar("123456789012"))
            .unwrap()
            .unwrap();

        let err = guard
            .reject_duplicate(DocumentType::Aadhaar, &fields, Some("b.png"), existing)
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::DuplicateIdentifier);

        let attempts = audit.attempts().unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempted_name.as_deref(), Some("Asha R"));
        assert_eq!(attempts[0].source_path.as_deref(), Some("b.png"));
    }

    #[test]
    fn test_quality_metrics() {
        let dir = tempdir().unwrap();
        let (guard, _) = seeded(dir.path(), &["123456789012", "1234 5678 9012", "12345", ""]);
        let metrics = guard.get_quality_metrics().unwrap();
        let aadhaar = &metrics.per_type[&DocumentType::Aadhaar];
        assert_eq!(aadhaar.total_records, 4);
        assert_eq!(aadhaar.unique_identifiers, 2);
        assert_eq!(aadhaar.duplicate_records, 1);
        assert_eq!(aadhaar.valid_format_records, 2);
        assert!((aadhaar.duplicate_percentage - 25.0).abs() < f64::EPSILON);

        assert_eq!(metrics.per_type[&DocumentType::Pan].total_records, 0);
    }
}
