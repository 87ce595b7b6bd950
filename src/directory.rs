//! The user directory: one stable logical user per canonical identifier.
//!
//! Users are replicated, not merged, across the two stores. A user's
//! "home" copy is the first store (Aadhaar, then PAN) that holds it; document
//! counts are maintained there.
//!
//! De-duplication is enforced by the unique index on
//! `users.canonical_identifier`: creation inserts first and, on conflict,
//! re-reads the winner. The in-process cache only saves lookups and is
//! invalidated whenever a backing row is written.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{LedgerError, LedgerResult, Severity};
use crate::identifier::{DocumentType, Identifier};
use crate::storage::{ledger, sqlite, SqliteStore, Stores};
use crate::user::{LogicalUser, UserId};

fn lock_err(context: &'static str) -> LedgerError {
    LedgerError::ConcurrentWriteConflict {
        operation: "poisoned lock".to_string(),
        resource: context.to_string(),
    }
}

/// Result of [`UserDirectory::sync_across_stores`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "target")]
pub enum SyncOutcome {
    /// The user was copied into this store.
    Copied(DocumentType),
    /// Both stores already held the user.
    AlreadyPresent,
}

/// Where a document was counted against a user, so that a failed write
/// can take the count back with [`UserDirectory::withdraw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    /// Owning user.
    pub user_id: UserId,
    /// Store whose copy of the user carries the count.
    pub counted_in: DocumentType,
    /// The user row was created for this document.
    pub created: bool,
}

/// Ledger-wide counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStatistics {
    /// Distinct user ids across both stores.
    pub total_users: usize,
    /// Ledger rows per store (replicas counted in each).
    pub per_store: BTreeMap<DocumentType, usize>,
    /// Distinct users owning more than one document in any store.
    pub users_with_multiple_documents: usize,
}

/// Identity directory over both stores.
#[derive(Debug)]
pub struct UserDirectory {
    stores: Stores,
    cache: Mutex<HashMap<String, LogicalUser>>,
    max_id_attempts: u32,
}

impl UserDirectory {
    /// Directory over `stores`, retrying id generation up to `max_id_attempts` times.
    #[must_use]
    pub fn new(stores: Stores, max_id_attempts: u32) -> Self {
        Self {
            stores,
            cache: Mutex::new(HashMap::new()),
            max_id_attempts: max_id_attempts.max(1),
        }
    }

    /// Returns the user for `identifier`, creating one in `preferred_store`
    /// if none exists. Either way the user's document count goes up by one.
    ///
    /// Concurrent callers racing on the same new identifier against the same
    /// store converge on a single id. An empty identifier cannot be
    /// de-duplicated and always creates a new user.
    ///
    /// # Errors
    /// - `IdentifierGenerationFailure` if no unused id could be generated
    /// - `ConcurrentWriteConflict` if a conflicting row vanished before it could be re-read
    /// - `MigrationStepFailure` if the target store has no ledger tables
    pub fn get_or_create(
        &self,
        identifier: &Identifier,
        name: &str,
        preferred_store: DocumentType,
    ) -> LedgerResult<UserId> {
        Ok(self.attribute(identifier, name, preferred_store)?.user_id)
    }

    /// [`get_or_create`](Self::get_or_create), returning where the document
    /// was counted.
    ///
    /// # Errors
    /// As for [`get_or_create`](Self::get_or_create).
    #[instrument(skip_all, fields(identifier = %identifier, store = %preferred_store))]
    pub fn attribute(
        &self,
        identifier: &Identifier,
        name: &str,
        preferred_store: DocumentType,
    ) -> LedgerResult<Attribution> {
        if identifier.is_empty() {
            tracing::warn!("empty identifier, creating an unkeyed user");
            return self.create(None, name, preferred_store);
        }

        if let Some(user) = self.lookup_by_identifier(identifier)? {
            tracing::debug!(user_id = %user.user_id, "existing user");
            return self.attribute_to(user.user_id);
        }

        self.create(Some(identifier.as_str()), name, preferred_store)
    }

    fn create(&self, canonical: Option<&str>, name: &str, preferred_store: DocumentType) -> LedgerResult<Attribution> {
        let store = self.stores.get(preferred_store);
        let conn = store.connect()?;
        require_ledger(&conn, store)?;

        for attempt in 1..=self.max_id_attempts {
            let user = LogicalUser::new(canonical.map(str::to_string), name.trim());
            match ledger::insert_user(&conn, &user) {
                Ok(()) => {
                    self.invalidate(user.user_id)?;
                    tracing::info!(user_id = %user.user_id, store = %preferred_store, "created user");
                    return Ok(Attribution {
                        user_id: user.user_id,
                        counted_in: preferred_store,
                        created: true,
                    });
                }
                Err(e) if sqlite::is_unique_violation(&e) && sqlite::violation_mentions(&e, "canonical_identifier") => {
                    let Some(canonical) = canonical else {
                        return Err(e.into());
                    };
                    return self.adopt_existing(&conn, canonical, preferred_store);
                }
                Err(e) if sqlite::is_unique_violation(&e) => {
                    tracing::warn!(attempt, user_id = %user.user_id, "user id collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LedgerError::IdentifierGenerationFailure {
            attempts: self.max_id_attempts,
            reason: "every generated user id was already taken".to_string(),
        })
    }

    /// Another writer created the user first; count this document against it.
    fn adopt_existing(&self, conn: &Connection, canonical: &str, store: DocumentType) -> LedgerResult<Attribution> {
        let Some(existing) = ledger::find_by_identifier(conn, canonical)? else {
            return Err(LedgerError::ConcurrentWriteConflict {
                operation: "create_user".to_string(),
                resource: format!("{store} users/{canonical}"),
            });
        };
        ledger::increment_document_count(conn, existing.user_id, Utc::now())?;
        self.invalidate(existing.user_id)?;
        tracing::info!(user_id = %existing.user_id, "lost creation race, using existing user");
        Ok(Attribution {
            user_id: existing.user_id,
            counted_in: store,
            created: false,
        })
    }

    /// Adds one to the document count of an existing user's home copy.
    ///
    /// # Errors
    /// `IdentityNotFound` if no store holds the user.
    pub fn record_document(&self, user_id: UserId) -> LedgerResult<()> {
        self.attribute_to(user_id).map(|_| ())
    }

    /// [`record_document`](Self::record_document), returning where the
    /// document was counted.
    ///
    /// # Errors
    /// `IdentityNotFound` if no store holds the user.
    pub fn attribute_to(&self, user_id: UserId) -> LedgerResult<Attribution> {
        for store in self.stores.iter() {
            if !store.exists() {
                continue;
            }
            let conn = store.connect()?;
            if !ledger::has_tables(&conn)? {
                continue;
            }
            if ledger::increment_document_count(&conn, user_id, Utc::now())? {
                self.invalidate(user_id)?;
                return Ok(Attribution {
                    user_id,
                    counted_in: store.document_type(),
                    created: false,
                });
            }
        }
        Err(LedgerError::IdentityNotFound {
            lookup: "user_id",
            value: user_id.to_string(),
        })
    }

    /// Takes back an [`Attribution`] whose document was never stored: the
    /// count goes down by one, and a user created for the document is
    /// removed again unless another document has since been counted or
    /// linked against it.
    ///
    /// # Errors
    /// Propagates store failures.
    #[instrument(skip(self))]
    pub fn withdraw(&self, attribution: &Attribution) -> LedgerResult<()> {
        let conn = self.stores.get(attribution.counted_in).connect()?;
        ledger::decrement_document_count(&conn, attribution.user_id, Utc::now())?;
        if attribution.created && ledger::delete_unreferenced_user(&conn, attribution.user_id)? {
            tracing::info!(user_id = %attribution.user_id, "removed user created for a failed write");
        }
        self.invalidate(attribution.user_id)
    }

    /// Removes a replica of `user_id` from `store` if no document there is
    /// linked to it. Returns true if the row was removed.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn drop_unlinked_replica(&self, user_id: UserId, store: DocumentType) -> LedgerResult<bool> {
        let conn = self.stores.get(store).connect()?;
        let removed = ledger::delete_unlinked_user(&conn, user_id)?;
        self.invalidate(user_id)?;
        Ok(removed)
    }

    /// Finds a user by canonical identifier, cache first.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn lookup_by_identifier(&self, identifier: &Identifier) -> LedgerResult<Option<LogicalUser>> {
        if identifier.is_empty() {
            return Ok(None);
        }
        if let Some(user) = self.cache.lock().map_err(|_| lock_err("directory cache"))?.get(identifier.as_str()) {
            return Ok(Some(user.clone()));
        }

        for store in self.stores.iter() {
            let Some(conn) = store.connect_read_only()? else {
                continue;
            };
            if !ledger::has_tables(&conn)? {
                continue;
            }
            if let Some(user) = ledger::find_by_identifier(&conn, identifier.as_str())? {
                self.remember(&user)?;
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    /// Finds a user by id, cache first.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn lookup_by_id(&self, user_id: UserId) -> LedgerResult<Option<LogicalUser>> {
        {
            let cache = self.cache.lock().map_err(|_| lock_err("directory cache"))?;
            if let Some(user) = cache.values().find(|u| u.user_id == user_id) {
                return Ok(Some(user.clone()));
            }
        }
        Ok(self.locate(user_id)?.map(|(_, user)| {
            if let Err(e) = self.remember(&user) {
                tracing::warn!(%user_id, error = %e, "could not cache user");
            }
            user
        }))
    }

    /// Home store and row for a user, bypassing the cache.
    fn locate(&self, user_id: UserId) -> LedgerResult<Option<(DocumentType, LogicalUser)>> {
        for store in self.stores.iter() {
            let Some(conn) = store.connect_read_only()? else {
                continue;
            };
            if !ledger::has_tables(&conn)? {
                continue;
            }
            if let Some(user) = ledger::find_by_id(&conn, user_id)? {
                return Ok(Some((store.document_type(), user)));
            }
        }
        Ok(None)
    }

    /// Copies a user into the store that does not yet hold it.
    ///
    /// Never overwrites: if the user is already in both stores nothing is
    /// written.
    ///
    /// # Errors
    /// - `IdentityNotFound` if neither store holds the user
    /// - `DataIntegrityIssue` if the target store maps the same identifier
    ///   to a different user
    #[instrument(skip(self))]
    pub fn sync_across_stores(&self, user_id: UserId) -> LedgerResult<SyncOutcome> {
        let Some((home, user)) = self.locate(user_id)? else {
            return Err(LedgerError::IdentityNotFound {
                lookup: "user_id",
                value: user_id.to_string(),
            });
        };

        let target = self.stores.get(home.other());
        let conn = target.connect()?;
        require_ledger(&conn, target)?;

        if ledger::find_by_id(&conn, user_id)?.is_some() {
            return Ok(SyncOutcome::AlreadyPresent);
        }

        match ledger::insert_user(&conn, &user) {
            Ok(()) => {
                tracing::info!(%user_id, from = %home, to = %target.document_type(), "replicated user");
                Ok(SyncOutcome::Copied(target.document_type()))
            }
            Err(e) if sqlite::is_unique_violation(&e) && sqlite::violation_mentions(&e, "canonical_identifier") => {
                Err(LedgerError::DataIntegrityIssue {
                    check: "replica_identifier_conflict".to_string(),
                    message: format!(
                        "{} store maps identifier {} to a different user than {user_id}",
                        target.document_type(),
                        user.canonical_identifier.as_deref().unwrap_or_default()
                    ),
                    affected_records: 1,
                    severity: Severity::High,
                })
            }
            Err(e) if sqlite::is_unique_violation(&e) => Ok(SyncOutcome::AlreadyPresent),
            Err(e) => Err(e.into()),
        }
    }

    /// Counts across both stores.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn get_statistics(&self) -> LedgerResult<DirectoryStatistics> {
        let mut all = BTreeSet::new();
        let mut multi = BTreeSet::new();
        let mut per_store = BTreeMap::new();

        for store in self.stores.iter() {
            let users = match store.connect_read_only()? {
                Some(conn) if ledger::has_tables(&conn)? => ledger::all_users(&conn)?,
                _ => Vec::new(),
            };
            per_store.insert(store.document_type(), users.len());
            for user in users {
                if user.has_multiple_documents() {
                    multi.insert(user.user_id);
                }
                all.insert(user.user_id);
            }
        }

        Ok(DirectoryStatistics {
            total_users: all.len(),
            per_store,
            users_with_multiple_documents: multi.len(),
        })
    }

    /// Drops every cached entry.
    ///
    /// # Errors
    /// Fails only if the cache lock is poisoned.
    pub fn clear_cache(&self) -> LedgerResult<()> {
        self.cache.lock().map_err(|_| lock_err("directory cache"))?.clear();
        Ok(())
    }

    fn remember(&self, user: &LogicalUser) -> LedgerResult<()> {
        if let Some(key) = &user.canonical_identifier {
            self.cache
                .lock()
                .map_err(|_| lock_err("directory cache"))?
                .insert(key.clone(), user.clone());
        }
        Ok(())
    }

    fn invalidate(&self, user_id: UserId) -> LedgerResult<()> {
        self.cache
            .lock()
            .map_err(|_| lock_err("directory cache"))?
            .retain(|_, u| u.user_id != user_id);
        Ok(())
    }
}

fn require_ledger(conn: &Connection, store: &SqliteStore) -> LedgerResult<()> {
    if ledger::has_tables(conn)? {
        return Ok(());
    }
    Err(LedgerError::MigrationStepFailure {
        step: "identity_tables".to_string(),
        store: store.path().to_path_buf(),
        rollback_available: false,
        backup_path: None,
        reason: "ledger tables are missing; run setup first".to_string(),
    })
}
