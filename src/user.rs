//! Logical users: the ledger's identity anchor.
//!
//! A logical user unifies every document that belongs to one person.
//! Its id is assigned once and never changes; documents point at it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique, stable logical-user identifier.
///
/// # Examples
///
/// ```
/// use idledger::UserId;
///
/// let id = UserId::new();
/// assert!(!id.is_nil());
/// assert_eq!(id.to_string().parse::<UserId>().unwrap(), id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random user id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns true if this is the nil UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<UserId> for Uuid {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// One row of the identity ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalUser {
    /// Stable id.
    pub user_id: UserId,
    /// Canonical identifier that created this user, if any.
    ///
    /// Unique within a store when present.
    pub canonical_identifier: Option<String>,
    /// Name as first seen on a document.
    pub display_name: String,
    /// Number of documents linked to this user in its home store.
    pub document_count: u32,
    /// When the user was first created.
    pub created_at: DateTime<Utc>,
    /// Last time the row changed.
    pub updated_at: DateTime<Utc>,
}

impl LogicalUser {
    /// Builds a fresh user with a document count of one.
    #[must_use]
    pub fn new(canonical_identifier: Option<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: UserId::new(),
            canonical_identifier: canonical_identifier.filter(|c| !c.is_empty()),
            display_name: display_name.into(),
            document_count: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// True if this user owns more than one document.
    #[must_use]
    pub const fn has_multiple_documents(&self) -> bool {
        self.document_count > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_roundtrip_text() {
        let id = UserId::new();
        let parsed: UserId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<UserId>().is_err());
    }

    #[test]
    fn test_new_user_drops_empty_identifier() {
        let user = LogicalUser::new(Some(String::new()), "Asha");
        assert!(user.canonical_identifier.is_none());
        assert_eq!(user.document_count, 1);
        assert!(!user.has_multiple_documents());
    }
}
