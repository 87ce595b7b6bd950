//! Identifier normalization and document-type metadata.
//!
//! Government ID numbers arrive from extraction in many shapes
//! (`1234 5678 9012`, `1234-5678-9012`, `abcde1234f`). Every comparison,
//! lookup and unique constraint in the ledger works on the canonical form
//! produced here, so the same person's number always compares equal.
//!
//! Normalization never fails. A value whose canonical form has the wrong
//! shape is still returned (and a warning logged) so that callers and the
//! duplicate scanner can report it as a data-quality issue instead of
//! silently dropping it.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Canonical length of an Aadhaar number.
pub const AADHAAR_LENGTH: usize = 12;

/// Canonical length of a PAN.
pub const PAN_LENGTH: usize = 10;

static PAN_SHAPE: OnceLock<Option<Regex>> = OnceLock::new();

fn pan_shape() -> Option<&'static Regex> {
    PAN_SHAPE
        .get_or_init(|| Regex::new(r"^[A-Z]{5}[0-9]{4}[A-Z]$").ok())
        .as_ref()
}

/// The two identity-document families the ledger governs.
///
/// Each type lives in its own store; the type decides table names,
/// the identifier column and the normalization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    /// Aadhaar card (12-digit number, optionally masked with `X`).
    Aadhaar,
    /// Permanent Account Number card.
    Pan,
}

impl DocumentType {
    /// Both document types, in store scan order.
    pub const ALL: [Self; 2] = [Self::Aadhaar, Self::Pan];

    /// Lower-case machine name (`aadhaar`, `pan`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aadhaar => "aadhaar",
            Self::Pan => "pan",
        }
    }

    /// Human-facing label (`Aadhaar`, `PAN`).
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Aadhaar => "Aadhaar",
            Self::Pan => "PAN",
        }
    }

    /// Name of the per-document table in this type's store.
    #[must_use]
    pub const fn documents_table(self) -> &'static str {
        match self {
            Self::Aadhaar => "aadhaar_documents",
            Self::Pan => "pan_documents",
        }
    }

    /// Column of the fields table holding the identifier.
    #[must_use]
    pub const fn identifier_column(self) -> &'static str {
        match self {
            Self::Aadhaar => "aadhaar_number",
            Self::Pan => "pan_number",
        }
    }

    /// The other document type.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Aadhaar => Self::Pan,
            Self::Pan => Self::Aadhaar,
        }
    }

    /// Normalizes a raw identifier with this type's rules.
    #[must_use]
    pub fn normalize(self, raw: &str) -> String {
        match self {
            Self::Aadhaar => normalize_aadhaar(raw),
            Self::Pan => normalize_pan(raw),
        }
    }

    /// SQLite `GLOB` pattern matching stored values that contain a
    /// character the canonical form would drop or change.
    #[must_use]
    pub const fn non_canonical_pattern(self) -> &'static str {
        match self {
            Self::Aadhaar => "*[^0-9X]*",
            Self::Pan => "*[^0-9A-Z]*",
        }
    }

    /// Returns true if `canonical` has the shape of this type's identifier.
    #[must_use]
    pub fn is_well_formed(self, canonical: &str) -> bool {
        match self {
            Self::Aadhaar => is_valid_aadhaar(canonical),
            Self::Pan => is_valid_pan(canonical),
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aadhaar" => Ok(Self::Aadhaar),
            "pan" => Ok(Self::Pan),
            other => Err(format!("unknown document type: {other}")),
        }
    }
}

/// Canonical Aadhaar form: upper-cased, only ASCII digits and the mask
/// character `X` retained.
///
/// # Examples
///
/// ```
/// use idledger::identifier::normalize_aadhaar;
///
/// assert_eq!(normalize_aadhaar("1234 5678 9012"), "123456789012");
/// assert_eq!(normalize_aadhaar("xxxx-xxxx-9012"), "XXXXXXXX9012");
/// ```
#[must_use]
pub fn normalize_aadhaar(raw: &str) -> String {
    let canonical: String = raw
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_digit() || *c == 'X')
        .collect();

    if !canonical.is_empty() && canonical.len() != AADHAAR_LENGTH {
        tracing::warn!(
            raw,
            canonical = %canonical,
            length = canonical.len(),
            "Aadhaar number has unexpected length"
        );
    }
    canonical
}

/// Canonical PAN form: upper-cased, only ASCII alphanumerics retained.
///
/// # Examples
///
/// ```
/// use idledger::identifier::normalize_pan;
///
/// assert_eq!(normalize_pan("abcde-1234-f"), "ABCDE1234F");
/// ```
#[must_use]
pub fn normalize_pan(raw: &str) -> String {
    let canonical: String = raw
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(char::is_ascii_alphanumeric)
        .collect();

    if !canonical.is_empty() && !is_valid_pan(&canonical) {
        tracing::warn!(
            raw,
            canonical = %canonical,
            "PAN does not match the AAAAA9999A shape"
        );
    }
    canonical
}

/// Twelve characters, each a digit or the mask `X`.
#[must_use]
pub fn is_valid_aadhaar(canonical: &str) -> bool {
    canonical.len() == AADHAAR_LENGTH
        && canonical.bytes().all(|b| b.is_ascii_digit() || b == b'X')
}

/// Five letters, four digits, one letter.
#[must_use]
pub fn is_valid_pan(canonical: &str) -> bool {
    canonical.len() == PAN_LENGTH && pan_shape().is_some_and(|re| re.is_match(canonical))
}

/// A canonical identifier tagged with its document type.
///
/// The only way to build one is through normalization, so two
/// `Identifier`s compare equal exactly when they name the same document
/// number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    document_type: DocumentType,
    value: String,
}

impl Identifier {
    /// Normalizes `raw` according to `document_type`.
    #[must_use]
    pub fn new(document_type: DocumentType, raw: &str) -> Self {
        Self {
            document_type,
            value: document_type.normalize(raw),
        }
    }

    /// Shorthand for an Aadhaar identifier.
    #[must_use]
    pub fn aadhaar(raw: &str) -> Self {
        Self::new(DocumentType::Aadhaar, raw)
    }

    /// Shorthand for a PAN identifier.
    #[must_use]
    pub fn pan(raw: &str) -> Self {
        Self::new(DocumentType::Pan, raw)
    }

    /// Document type this identifier belongs to.
    #[must_use]
    pub const fn document_type(&self) -> DocumentType {
        self.document_type
    }

    /// Canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// True when normalization left nothing behind.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// True when the canonical form has the expected shape.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.document_type.is_well_formed(&self.value)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}
