//! Document-side records produced by the extraction collaborator.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifier::DocumentType;
use crate::user::UserId;

/// Table holding one row of extracted fields per document, in both stores.
pub const FIELDS_TABLE: &str = "extracted_fields";

/// Field dictionary handed over by extraction.
///
/// Every value is optional: extraction may miss any field, and the
/// duplicate scanner reports records with missing required fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    /// Holder's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Date of birth, as printed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
    /// Gender (Aadhaar only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Address (Aadhaar only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Father's name (PAN only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fathers_name: Option<String>,
    /// Identifier as extracted, not yet normalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

impl ExtractedFields {
    /// Fields carrying just a name and an identifier.
    #[must_use]
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            identifier: Some(identifier.into()),
            ..Self::default()
        }
    }

    /// Sets the date of birth.
    #[must_use]
    pub fn with_dob(mut self, dob: impl Into<String>) -> Self {
        self.dob = Some(dob.into());
        self
    }

    /// Trimmed name, `None` when absent or blank.
    #[must_use]
    pub fn name_trimmed(&self) -> Option<&str> {
        non_blank(self.name.as_deref())
    }

    /// Trimmed raw identifier, `None` when absent or blank.
    #[must_use]
    pub fn identifier_trimmed(&self) -> Option<&str> {
        non_blank(self.identifier.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// A stored document together with its extracted fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Row id in the fields table.
    pub field_id: i64,
    /// Row id in the documents table.
    pub document_id: i64,
    /// Store this record lives in.
    pub document_type: DocumentType,
    /// Identifier exactly as stored.
    pub identifier: String,
    /// Canonical form of `identifier`.
    pub canonical_identifier: String,
    /// Extracted fields.
    pub fields: ExtractedFields,
    /// Extraction confidence in `[0, 1]`; missing values read as `0`.
    pub confidence: f64,
    /// Owning logical user, once assigned.
    pub user_id: Option<UserId>,
    /// Path of the source file, when known.
    pub source_path: Option<String>,
    /// When the record was stored.
    pub created_at: DateTime<Utc>,
}

/// A document about to be written to a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    /// Target store.
    pub document_type: DocumentType,
    /// Extracted fields; the identifier is written as given.
    pub fields: ExtractedFields,
    /// Extraction confidence.
    pub confidence: f64,
    /// Source file path.
    pub source_path: Option<String>,
    /// Raw OCR text.
    pub raw_text: Option<String>,
    /// Owning user, when already resolved.
    pub user_id: Option<UserId>,
    /// Creation time; `None` means now.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewDocument {
    /// A document with the given fields and confidence and nothing else.
    #[must_use]
    pub fn new(document_type: DocumentType, fields: ExtractedFields, confidence: f64) -> Self {
        Self {
            document_type,
            fields,
            confidence,
            source_path: None,
            raw_text: None,
            user_id: None,
            created_at: None,
        }
    }

    /// Sets the source path.
    #[must_use]
    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Sets the owning user.
    #[must_use]
    pub const fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Formats a timestamp the way every table stores it.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

/// Parses stored timestamps.
///
/// Accepts RFC 3339 and SQLite's `CURRENT_TIMESTAMP` layout (with or
/// without fractional seconds). Unparseable values map to the Unix epoch so
/// they sort as oldest.
#[must_use]
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return at.with_timezone(&Utc);
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return naive.and_utc();
        }
    }
    tracing::warn!(raw, "unparseable timestamp, treating as epoch");
    DateTime::<Utc>::default()
}
