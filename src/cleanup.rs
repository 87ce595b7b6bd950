//! Orchestrated duplicate cleanup and identity migration.
//!
//! A run walks a fixed sequence of stages:
//!
//! ```text
//! Init -> Backup -> SchemaMigration -> DuplicateCleanup -> IdentityMigration
//!      -> ConstraintApplication -> IntegrityVerification -> Done
//! ```
//!
//! Each stage works store by store. A store that fails a stage is excluded
//! from the stages that depend on it; the other store carries on. Only a
//! failed backup stops the run outright, since nothing may change without
//! a rollback point. A dry run plans the duplicate cleanup and stops there
//! without touching anything on disk.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::audit::StepStatus;
use crate::directory::UserDirectory;
use crate::document::FIELDS_TABLE;
use crate::error::{ErrorKind, LedgerError, LedgerResult, Severity};
use crate::identifier::{DocumentType, Identifier};
use crate::migration::{BackupHandle, ConstraintOutcome, SchemaMigrator, StoreMigration};
use crate::scanner::{self, DuplicateScanner, GroupResolution, ResolutionKind};
use crate::storage::{documents, ledger, sqlite, MaintenanceLock, SqliteStore, Stores};

/// Stages of a cleanup run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Nothing has run yet.
    Init,
    /// Whole-file backups of every existing store.
    Backup,
    /// Ledger tables and `user_id` columns.
    SchemaMigration,
    /// Removal of auto-resolvable duplicates.
    DuplicateCleanup,
    /// Identifier normalization and user assignment.
    IdentityMigration,
    /// Unique index on the identifier column.
    ConstraintApplication,
    /// Read-only checks of the result.
    IntegrityVerification,
    /// Run finished.
    Done,
}

impl Stage {
    /// Snake-case stage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Backup => "backup",
            Self::SchemaMigration => "schema_migration",
            Self::DuplicateCleanup => "duplicate_cleanup",
            Self::IdentityMigration => "identity_migration",
            Self::ConstraintApplication => "constraint_application",
            Self::IntegrityVerification => "integrity_verification",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// Every stage succeeded and nothing needs attention.
    CompletedSuccessfully,
    /// No stage failed, but there are findings or groups awaiting review.
    CompletedWithWarnings,
    /// At least one stage failed for at least one store.
    CompletedWithErrors,
    /// The run stopped before changing anything.
    Failed,
}

/// Knobs for a cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOptions {
    /// Plan only: no backups, no lock, no writes of any kind to the stores.
    pub dry_run: bool,
    /// Skip identity migration.
    pub cleanup_only: bool,
    /// Write `migration_report_<timestamp>.json` to the report directory.
    pub save_report: bool,
}

impl CleanupOptions {
    /// Options for a dry run.
    #[must_use]
    pub const fn dry_run() -> Self {
        Self {
            dry_run: true,
            cleanup_only: false,
            save_report: false,
        }
    }

    /// Sets `cleanup_only`.
    #[must_use]
    pub const fn with_cleanup_only(mut self, cleanup_only: bool) -> Self {
        self.cleanup_only = cleanup_only;
        self
    }

    /// Sets `save_report`.
    #[must_use]
    pub const fn with_save_report(mut self, save_report: bool) -> Self {
        self.save_report = save_report;
        self
    }
}

/// Timing and outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage.
    pub stage: Stage,
    /// `Success`, `Failed` or `Skipped`.
    pub status: StepStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Why a stage was skipped or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Stage that failed.
    pub stage: Stage,
    /// Store involved, if any.
    pub document_type: Option<DocumentType>,
    /// Stable error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

impl StepError {
    fn new(stage: Stage, document_type: Option<DocumentType>, err: &LedgerError) -> Self {
        Self {
            stage,
            document_type,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// What happened to one auto-resolved group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCleanup {
    /// Shared identifier.
    pub canonical_identifier: String,
    /// Classification.
    pub kind: ResolutionKind,
    /// Records in the group.
    pub group_size: usize,
    /// Surviving fields row.
    pub kept: Option<i64>,
    /// Deleted (or, in a dry run, to-be-deleted) fields rows.
    pub removed: Vec<i64>,
    /// Document rows deleted along with their last fields row.
    pub documents_removed: usize,
    /// False in a dry run or when the group's transaction failed.
    pub applied: bool,
}

impl GroupCleanup {
    fn planned(resolution: &GroupResolution) -> Self {
        Self {
            canonical_identifier: resolution.canonical_identifier.clone(),
            kind: resolution.kind,
            group_size: usize::from(resolution.keep.is_some()) + resolution.remove.len(),
            kept: resolution.keep.as_ref().map(|r| r.field_id),
            removed: resolution.remove.iter().map(|r| r.field_id).collect(),
            documents_removed: 0,
            applied: false,
        }
    }
}

/// A group left for an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualReviewItem {
    /// Shared identifier.
    pub canonical_identifier: String,
    /// Fields rows in the group.
    pub field_ids: Vec<i64>,
    /// Why it could not be resolved automatically.
    pub reason: String,
}

/// Duplicate cleanup for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCleanup {
    /// Store.
    pub document_type: DocumentType,
    /// Groups found by the scan.
    pub groups_found: usize,
    /// Survivors of auto-resolved groups.
    pub records_kept: usize,
    /// Fields rows removed (planned, in a dry run).
    pub records_removed: usize,
    /// Document rows removed.
    pub documents_removed: usize,
    /// Auto-resolved groups.
    pub resolved: Vec<GroupCleanup>,
    /// Groups awaiting manual review.
    pub manual_review: Vec<ManualReviewItem>,
}

/// Identity migration for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySummary {
    /// Store.
    pub document_type: DocumentType,
    /// Identifiers rewritten to canonical form.
    pub identifiers_normalized: usize,
    /// Rewrites refused by the unique index.
    pub normalization_conflicts: usize,
    /// Records given a user.
    pub records_linked: usize,
    /// Distinct users those records were given.
    pub users_assigned: usize,
    /// Records that already had a user.
    pub already_linked: usize,
    /// Records without an identifier or a name.
    pub skipped: usize,
    /// Records in duplicate groups still awaiting manual review.
    pub awaiting_review: usize,
}

/// Constraint application for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintResult {
    /// Store.
    pub document_type: DocumentType,
    /// Index created or found.
    pub outcome: Option<ConstraintOutcome>,
    /// Why the constraint is still pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_reason: Option<String>,
}

/// Post-run measurements for one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreIntegrity {
    /// Store.
    pub document_type: DocumentType,
    /// Fields rows.
    pub total_records: u64,
    /// Fields rows with a `user_id`.
    pub records_with_user: u64,
    /// `records_with_user / total_records`, as a percentage.
    pub coverage_percent: f64,
    /// Duplicate groups still present.
    pub remaining_duplicate_groups: usize,
    /// Records in those groups.
    pub remaining_duplicate_records: usize,
}

/// An integrity problem found after the run. Never corrected automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityFinding {
    /// Store.
    pub document_type: DocumentType,
    /// Check that failed.
    pub check: String,
    /// Description.
    pub message: String,
    /// Records involved.
    pub affected_records: u64,
    /// How urgent.
    pub severity: Severity,
}

impl IntegrityFinding {
    /// The finding as a [`LedgerError::DataIntegrityIssue`].
    #[must_use]
    pub fn to_error(&self) -> LedgerError {
        LedgerError::DataIntegrityIssue {
            check: format!("{}:{}", self.document_type, self.check),
            message: self.message.clone(),
            affected_records: self.affected_records,
            severity: self.severity,
        }
    }
}

/// Everything a cleanup run did, planned or found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: Option<DateTime<Utc>>,
    /// Options the run used.
    pub options: CleanupOptions,
    /// Last stage reached.
    pub final_stage: Stage,
    /// Overall outcome.
    pub status: FinalStatus,
    /// Per-stage records.
    pub stages: Vec<StageRecord>,
    /// Backups taken.
    pub backups: Vec<BackupHandle>,
    /// Schema migrations.
    pub schema: Vec<StoreMigration>,
    /// Duplicate cleanup per store.
    pub duplicates: Vec<StoreCleanup>,
    /// Identity migration per store.
    pub identity: Vec<IdentitySummary>,
    /// Constraint application per store.
    pub constraints: Vec<ConstraintResult>,
    /// Post-run measurements.
    pub integrity: Vec<StoreIntegrity>,
    /// Integrity problems.
    pub findings: Vec<IntegrityFinding>,
    /// Things an operator should look at.
    pub warnings: Vec<String>,
    /// Failures.
    pub errors: Vec<StepError>,
}

impl CleanupReport {
    fn new(options: CleanupOptions) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            options,
            final_stage: Stage::Init,
            status: FinalStatus::CompletedSuccessfully,
            stages: Vec::new(),
            backups: Vec::new(),
            schema: Vec::new(),
            duplicates: Vec::new(),
            identity: Vec::new(),
            constraints: Vec::new(),
            integrity: Vec::new(),
            findings: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Fields rows removed across stores.
    #[must_use]
    pub fn records_removed(&self) -> usize {
        self.duplicates.iter().map(|d| d.records_removed).sum()
    }

    /// Groups awaiting manual review across stores.
    #[must_use]
    pub fn manual_review_groups(&self) -> usize {
        self.duplicates.iter().map(|d| d.manual_review.len()).sum()
    }

    /// Record for `stage`, if it ran or was skipped.
    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Findings as typed errors.
    #[must_use]
    pub fn integrity_issues(&self) -> Vec<LedgerError> {
        self.findings.iter().map(IntegrityFinding::to_error).collect()
    }

    fn compute_status(&self) -> FinalStatus {
        if self.stage(Stage::Backup).is_some_and(|s| s.status == StepStatus::Failed) {
            FinalStatus::Failed
        } else if !self.errors.is_empty() {
            FinalStatus::CompletedWithErrors
        } else if !self.warnings.is_empty() || !self.findings.is_empty() {
            FinalStatus::CompletedWithWarnings
        } else {
            FinalStatus::CompletedSuccessfully
        }
    }

    /// Writes `migration_report_<timestamp>.json` into `dir`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, dir: &Path) -> LedgerResult<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| LedgerError::io(format!("creating {}", dir.display()), e))?;
        let stamp = self.started_at.format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("migration_report_{stamp}.json"));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)
            .map_err(|e| LedgerError::io(format!("writing {}", path.display()), e))?;
        tracing::info!(path = %path.display(), "cleanup report written");
        Ok(path)
    }
}

/// Runs the cleanup stages against both stores.
#[derive(Debug, Clone)]
pub struct CleanupOrchestrator {
    stores: Stores,
    migrator: SchemaMigrator,
    directory: Arc<UserDirectory>,
    scanner: DuplicateScanner,
    report_dir: PathBuf,
}

impl CleanupOrchestrator {
    /// Orchestrator over `stores`; reports go to `report_dir`.
    #[must_use]
    pub fn new(
        stores: Stores,
        migrator: SchemaMigrator,
        directory: Arc<UserDirectory>,
        scanner: DuplicateScanner,
        report_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stores,
            migrator,
            directory,
            scanner,
            report_dir: report_dir.into(),
        }
    }

    /// Executes a run.
    ///
    /// Stage failures are recorded in the report rather than returned.
    ///
    /// # Errors
    /// - `ConcurrentWriteConflict` if another run holds the maintenance lock
    /// - `Io` if the lock or the requested report cannot be written
    #[instrument(skip(self), fields(dry_run = options.dry_run))]
    pub fn run(&self, options: CleanupOptions) -> LedgerResult<CleanupReport> {
        let mut report = CleanupReport::new(options);
        let present: Vec<&SqliteStore> = self.stores.iter().filter(|s| s.exists()).collect();
        for store in self.stores.iter().filter(|s| !s.exists()) {
            report
                .warnings
                .push(format!("{} store {} does not exist; skipped", store.document_type(), store.path().display()));
        }

        if options.dry_run {
            tracing::info!("dry run: planning duplicate cleanup only");
            skip(&mut report, Stage::Backup, "dry run");
            skip(&mut report, Stage::SchemaMigration, "dry run");
            self.clean_duplicates(&mut report, &present, false);
            return self.finish(report, Stage::DuplicateCleanup);
        }

        let _lock = MaintenanceLock::acquire(self.migrator.backup_dir())?;
        self.log("cleanup", StepStatus::Started, json!({ "options": options }));

        let Some(backups) = self.backup(&mut report, &present) else {
            return self.finish(report, Stage::Backup);
        };
        let migrated = self.migrate_schema(&mut report, &present, &backups);
        let cleaned = self.clean_duplicates(&mut report, &present, true);

        if options.cleanup_only {
            skip(&mut report, Stage::IdentityMigration, "cleanup only");
        } else {
            let ready: Vec<&SqliteStore> = present
                .iter()
                .copied()
                .filter(|s| migrated.contains(&s.document_type()))
                .collect();
            self.migrate_identities(&mut report, &ready);
        }

        let constrainable: Vec<&SqliteStore> = present
            .iter()
            .copied()
            .filter(|s| cleaned.contains(&s.document_type()))
            .collect();
        self.apply_constraints(&mut report, &constrainable);
        self.verify_integrity(&mut report, &present);
        self.finish(report, Stage::Done)
    }

    fn finish(&self, mut report: CleanupReport, final_stage: Stage) -> LedgerResult<CleanupReport> {
        report.final_stage = final_stage;
        report.status = report.compute_status();
        report.finished_at = Some(Utc::now());
        tracing::info!(
            status = ?report.status,
            stage = %final_stage,
            removed = report.records_removed(),
            manual_review = report.manual_review_groups(),
            errors = report.errors.len(),
            "cleanup finished"
        );

        if !report.options.dry_run {
            let status = match report.status {
                FinalStatus::Failed | FinalStatus::CompletedWithErrors => StepStatus::Failed,
                _ => StepStatus::Success,
            };
            self.log("cleanup", status, json!({ "status": report.status, "final_stage": final_stage }));
        }
        if report.options.save_report {
            report.save(&self.report_dir)?;
        }
        Ok(report)
    }

    fn log(&self, operation: &str, status: StepStatus, details: serde_json::Value) {
        if let Err(e) = self.migrator.log().record(operation, status, details) {
            tracing::error!(error = %e, operation, "could not append to migration log");
        }
    }

    /// Backs up every existing store. `None` if any backup failed.
    fn backup(&self, report: &mut CleanupReport, stores: &[&SqliteStore]) -> Option<Vec<Option<BackupHandle>>> {
        let started_at = Utc::now();
        let mut handles = Vec::with_capacity(stores.len());
        for store in stores {
            match self.migrator.create_backup(store) {
                Ok(handle) => {
                    report.backups.extend(handle.clone());
                    handles.push(handle);
                }
                Err(e) => {
                    report.errors.push(StepError::new(Stage::Backup, Some(store.document_type()), &e));
                    record(report, Stage::Backup, started_at, StepStatus::Failed, Some(e.to_string()));
                    tracing::error!(error = %e, "backup failed, aborting before any change");
                    return None;
                }
            }
        }
        record(report, Stage::Backup, started_at, StepStatus::Success, None);
        Some(handles)
    }

    fn migrate_schema(
        &self,
        report: &mut CleanupReport,
        stores: &[&SqliteStore],
        backups: &[Option<BackupHandle>],
    ) -> BTreeSet<DocumentType> {
        let started_at = Utc::now();
        let mut ok = BTreeSet::new();
        for (store, backup) in stores.iter().zip(backups) {
            match self.migrator.migrate_store(store, backup.clone()) {
                Ok(migration) => {
                    ok.insert(store.document_type());
                    report.schema.push(migration);
                }
                Err(e) => report
                    .errors
                    .push(StepError::new(Stage::SchemaMigration, Some(store.document_type()), &e)),
            }
        }
        finish_stage(report, Stage::SchemaMigration, started_at, stores.len(), ok.len());
        ok
    }

    /// Scans, plans and (unless `apply` is false) removes duplicates.
    /// Returns the stores that finished without error.
    fn clean_duplicates(&self, report: &mut CleanupReport, stores: &[&SqliteStore], apply: bool) -> BTreeSet<DocumentType> {
        let started_at = Utc::now();
        let mut ok = BTreeSet::new();
        for store in stores {
            let dt = store.document_type();
            match self.clean_store(report, store, apply) {
                Ok(true) => {
                    ok.insert(dt);
                }
                Ok(false) => {}
                Err(e) => report.errors.push(StepError::new(Stage::DuplicateCleanup, Some(dt), &e)),
            }
        }
        finish_stage(report, Stage::DuplicateCleanup, started_at, stores.len(), ok.len());
        ok
    }

    #[instrument(skip(self, report, store), fields(store = %store.document_type()))]
    fn clean_store(&self, report: &mut CleanupReport, store: &SqliteStore, apply: bool) -> LedgerResult<bool> {
        let dt = store.document_type();
        let groups = self.scanner.scan(store)?;
        let plan = scanner::plan(&groups);
        let mut conn = if apply { Some(store.connect()?) } else { None };

        let mut summary = StoreCleanup {
            document_type: dt,
            groups_found: groups.len(),
            records_kept: 0,
            records_removed: 0,
            documents_removed: 0,
            resolved: Vec::new(),
            manual_review: Vec::new(),
        };
        let mut clean = true;

        for resolution in &plan.resolutions {
            if !resolution.is_automatic() {
                report.warnings.push(format!(
                    "{dt} number {} needs manual review: {}",
                    resolution.canonical_identifier, resolution.reason
                ));
                summary.manual_review.push(ManualReviewItem {
                    canonical_identifier: resolution.canonical_identifier.clone(),
                    field_ids: resolution.manual_review.iter().map(|r| r.field_id).collect(),
                    reason: resolution.reason.clone(),
                });
                continue;
            }

            let mut outcome = GroupCleanup::planned(resolution);
            if let Some(conn) = conn.as_mut() {
                match remove_group(conn, dt, resolution) {
                    Ok(documents_removed) => {
                        outcome.applied = true;
                        outcome.documents_removed = documents_removed;
                    }
                    Err(e) => {
                        tracing::error!(identifier = %resolution.canonical_identifier, error = %e, "group cleanup rolled back");
                        report.errors.push(StepError::new(Stage::DuplicateCleanup, Some(dt), &e));
                        clean = false;
                        summary.resolved.push(outcome);
                        continue;
                    }
                }
            }
            summary.records_kept += usize::from(outcome.kept.is_some());
            summary.records_removed += outcome.removed.len();
            summary.documents_removed += outcome.documents_removed;
            summary.resolved.push(outcome);
        }

        tracing::info!(
            groups = summary.groups_found,
            removed = summary.records_removed,
            manual_review = summary.manual_review.len(),
            applied = apply,
            "duplicate cleanup"
        );
        report.duplicates.push(summary);
        Ok(clean)
    }

    fn migrate_identities(&self, report: &mut CleanupReport, stores: &[&SqliteStore]) {
        let started_at = Utc::now();
        if stores.is_empty() {
            skip(report, Stage::IdentityMigration, "no migrated store");
            return;
        }
        let mut ok = 0;
        for store in stores {
            match self.link_store(store) {
                Ok(summary) => {
                    if summary.skipped > 0 {
                        report.warnings.push(format!(
                            "{} {} record(s) lack an identifier or a name and were not linked",
                            summary.skipped,
                            store.document_type()
                        ));
                    }
                    report.identity.push(summary);
                    ok += 1;
                }
                Err(e) => report
                    .errors
                    .push(StepError::new(Stage::IdentityMigration, Some(store.document_type()), &e)),
            }
        }
        finish_stage(report, Stage::IdentityMigration, started_at, stores.len(), ok);
    }

    /// Canonicalizes identifiers and gives every linkable record a user.
    #[instrument(skip(self, store), fields(store = %store.document_type()))]
    fn link_store(&self, store: &SqliteStore) -> LedgerResult<IdentitySummary> {
        let dt = store.document_type();
        let mut conn = store.connect()?;
        let records = documents::load_all(&conn, dt)?;
        let mut summary = IdentitySummary {
            document_type: dt,
            identifiers_normalized: 0,
            normalization_conflicts: 0,
            records_linked: 0,
            users_assigned: 0,
            already_linked: 0,
            skipped: 0,
            awaiting_review: 0,
        };

        for record in &records {
            if record.canonical_identifier.is_empty() || record.identifier == record.canonical_identifier {
                continue;
            }
            match documents::rewrite_identifier(&conn, dt, record.field_id, &record.canonical_identifier) {
                Ok(()) => summary.identifiers_normalized += 1,
                Err(LedgerError::Storage(e)) if sqlite::is_unique_violation(&e) => {
                    tracing::warn!(field_id = record.field_id, "canonical identifier already taken, left as is");
                    summary.normalization_conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        // Identifiers still shared after cleanup belong to groups awaiting review.
        let mut shared: HashMap<&str, usize> = HashMap::new();
        for record in records.iter().filter(|r| !r.canonical_identifier.is_empty()) {
            *shared.entry(record.canonical_identifier.as_str()).or_default() += 1;
        }

        let mut users = HashSet::new();
        for record in &records {
            if record.user_id.is_some() {
                summary.already_linked += 1;
                continue;
            }
            if shared.get(record.canonical_identifier.as_str()).is_some_and(|n| *n > 1) {
                summary.awaiting_review += 1;
                continue;
            }
            let name = record.fields.name_trimmed();
            let (Some(name), false) = (name, record.canonical_identifier.is_empty()) else {
                summary.skipped += 1;
                continue;
            };

            let identifier = Identifier::new(dt, &record.canonical_identifier);
            let attribution = self.directory.attribute(&identifier, name, dt)?;
            let user_id = attribution.user_id;
            let linked = (|| {
                if ledger::find_by_id(&conn, user_id)?.is_none() {
                    self.directory.sync_across_stores(user_id)?;
                }
                let tx = conn.transaction()?;
                documents::assign_user(&tx, dt, record, user_id)?;
                ledger::link_document(&tx, user_id, dt, record.document_id)?;
                tx.commit()?;
                Ok::<_, LedgerError>(())
            })();
            if let Err(err) = linked {
                if let Err(e) = self.directory.withdraw(&attribution) {
                    tracing::error!(%user_id, error = %e, "could not withdraw document count");
                }
                return Err(err);
            }

            summary.records_linked += 1;
            users.insert(user_id);
        }
        summary.users_assigned = users.len();

        tracing::info!(
            linked = summary.records_linked,
            users = summary.users_assigned,
            normalized = summary.identifiers_normalized,
            skipped = summary.skipped,
            "identity migration"
        );
        Ok(summary)
    }

    fn apply_constraints(&self, report: &mut CleanupReport, stores: &[&SqliteStore]) {
        let started_at = Utc::now();
        if stores.is_empty() {
            skip(report, Stage::ConstraintApplication, "duplicate cleanup did not complete");
            return;
        }
        let mut ok = 0;
        for store in stores {
            let dt = store.document_type();
            match self
                .migrator
                .add_unique_constraint(store, FIELDS_TABLE, dt.identifier_column())
            {
                Ok(outcome) => {
                    report.constraints.push(ConstraintResult {
                        document_type: dt,
                        outcome: Some(outcome),
                        pending_reason: None,
                    });
                    ok += 1;
                }
                // Duplicates awaiting review keep the constraint pending; that
                // is expected, not a failure.
                Err(e) if e.kind() == ErrorKind::SchemaConstraintViolation && has_manual_review(report, dt) => {
                    report.warnings.push(format!("{dt} identifier constraint pending manual review"));
                    report.constraints.push(ConstraintResult {
                        document_type: dt,
                        outcome: None,
                        pending_reason: Some(e.to_string()),
                    });
                    ok += 1;
                }
                Err(e) => {
                    report.constraints.push(ConstraintResult {
                        document_type: dt,
                        outcome: None,
                        pending_reason: Some(e.to_string()),
                    });
                    report
                        .errors
                        .push(StepError::new(Stage::ConstraintApplication, Some(dt), &e));
                }
            }
        }
        finish_stage(report, Stage::ConstraintApplication, started_at, stores.len(), ok);
    }

    fn verify_integrity(&self, report: &mut CleanupReport, stores: &[&SqliteStore]) {
        let started_at = Utc::now();
        let expect_links = !report.options.cleanup_only;
        let mut ok = 0;
        for store in stores {
            match self.measure(store) {
                Ok(integrity) => {
                    report.findings.extend(findings_for(&integrity, expect_links));
                    report.integrity.push(integrity);
                    ok += 1;
                }
                Err(e) => report
                    .errors
                    .push(StepError::new(Stage::IntegrityVerification, Some(store.document_type()), &e)),
            }
        }
        for finding in &report.findings {
            tracing::warn!(store = %finding.document_type, check = %finding.check, severity = ?finding.severity, "{}", finding.message);
        }
        finish_stage(report, Stage::IntegrityVerification, started_at, stores.len(), ok);
    }

    fn measure(&self, store: &SqliteStore) -> LedgerResult<StoreIntegrity> {
        let dt = store.document_type();
        let groups = self.scanner.scan(store)?;
        let (total, with_user) = match store.connect_read_only()? {
            Some(conn) if documents::has_tables(&conn, dt)? => documents::coverage_counts(&conn)?,
            _ => (0, 0),
        };
        #[allow(clippy::cast_precision_loss)]
        let coverage_percent = if total == 0 {
            100.0
        } else {
            (with_user as f64 / total as f64 * 10_000.0).round() / 100.0
        };
        Ok(StoreIntegrity {
            document_type: dt,
            total_records: total,
            records_with_user: with_user,
            coverage_percent,
            remaining_duplicate_groups: groups.len(),
            remaining_duplicate_records: groups.iter().map(scanner::DuplicateGroup::size).sum(),
        })
    }
}

/// Deletes a group's non-survivors in one transaction. Returns the number
/// of document rows removed.
fn remove_group(conn: &mut Connection, document_type: DocumentType, resolution: &GroupResolution) -> LedgerResult<usize> {
    let tx = conn.transaction()?;
    let mut documents_removed = 0;
    for record in &resolution.remove {
        if documents::delete_record(&tx, document_type, record)? {
            documents_removed += 1;
        }
    }

    // Keep the group's owner if only a removed record carried it.
    if let Some(keep) = resolution.keep.as_ref().filter(|k| k.user_id.is_none()) {
        if let Some(user_id) = resolution.remove.iter().find_map(|r| r.user_id) {
            documents::assign_user(&tx, document_type, keep, user_id)?;
            ledger::link_document(&tx, user_id, document_type, keep.document_id)?;
        }
    }
    tx.commit()?;
    Ok(documents_removed)
}

fn findings_for(integrity: &StoreIntegrity, expect_links: bool) -> Vec<IntegrityFinding> {
    let dt = integrity.document_type;
    let mut findings = Vec::new();
    if integrity.remaining_duplicate_groups > 0 {
        findings.push(IntegrityFinding {
            document_type: dt,
            check: "remaining_duplicates".to_string(),
            message: format!(
                "{} duplicate group(s) remain across {} record(s)",
                integrity.remaining_duplicate_groups, integrity.remaining_duplicate_records
            ),
            affected_records: integrity.remaining_duplicate_records as u64,
            severity: Severity::Medium,
        });
    }
    let unlinked = integrity.total_records - integrity.records_with_user;
    if expect_links && unlinked > 0 {
        findings.push(IntegrityFinding {
            document_type: dt,
            check: "user_id_coverage".to_string(),
            message: format!("{unlinked} record(s) have no user ({:.2}% coverage)", integrity.coverage_percent),
            affected_records: unlinked,
            severity: if integrity.coverage_percent < 50.0 { Severity::High } else { Severity::Low },
        });
    }
    findings
}

fn has_manual_review(report: &CleanupReport, document_type: DocumentType) -> bool {
    report
        .duplicates
        .iter()
        .any(|d| d.document_type == document_type && !d.manual_review.is_empty())
}

fn record(report: &mut CleanupReport, stage: Stage, started_at: DateTime<Utc>, status: StepStatus, detail: Option<String>) {
    tracing::info!(%stage, ?status, "stage finished");
    report.final_stage = stage;
    report.stages.push(StageRecord {
        stage,
        status,
        started_at,
        finished_at: Utc::now(),
        detail,
    });
}

fn skip(report: &mut CleanupReport, stage: Stage, reason: &str) {
    let now = Utc::now();
    record(report, stage, now, StepStatus::Skipped, Some(reason.to_string()));
}

fn finish_stage(report: &mut CleanupReport, stage: Stage, started_at: DateTime<Utc>, attempted: usize, succeeded: usize) {
    if succeeded == attempted {
        record(report, stage, started_at, StepStatus::Success, None);
    } else {
        let detail = format!("{} of {attempted} store(s) failed", attempted - succeeded);
        record(report, stage, started_at, StepStatus::Failed, Some(detail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MigrationLog;
    use crate::config::LedgerConfig;
    use crate::document::{ExtractedFields, NewDocument};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        config: LedgerConfig,
        stores: Stores,
        orchestrator: CleanupOrchestrator,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = LedgerConfig::in_dir(dir.path());
        let stores = Stores::from_config(&config);
        let log = Arc::new(MigrationLog::new(&config.migration_log));
        let migrator = SchemaMigrator::new(&config.backup_dir, log);
        let directory = Arc::new(UserDirectory::new(stores.clone(), 3));
        let orchestrator = CleanupOrchestrator::new(
            stores.clone(),
            migrator,
            directory,
            DuplicateScanner::default(),
            &config.report_dir,
        );
        Fixture {
            _dir: dir,
            config,
            stores,
            orchestrator,
        }
    }

    fn seed(stores: &Stores, rows: &[(&str, &str, &str, f64)]) {
        let store = stores.get(DocumentType::Aadhaar);
        store.ensure_document_tables().unwrap();
        let conn = store.connect().unwrap();
        for (name, id, dob, confidence) in rows {
            let doc = NewDocument::new(DocumentType::Aadhaar, ExtractedFields::new(*name, *id).with_dob(*dob), *confidence);
            documents::insert(&conn, &doc).unwrap();
        }
    }

    fn count(stores: &Stores) -> usize {
        let conn = stores.get(DocumentType::Aadhaar).connect().unwrap();
        documents::load_all(&conn, DocumentType::Aadhaar).unwrap().len()
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let f = fixture();
        seed(
            &f.stores,
            &[
                ("X", "123456789012", "1/1/2000", 0.9),
                ("X", "1234 5678 9012", "1/1/2000", 0.8),
                ("Asha", "111122223333", "", 0.9),
                ("Ravi", "111122223333", "", 0.9),
            ],
        );

        let report = f.orchestrator.run(CleanupOptions::dry_run()).unwrap();
        assert_eq!(report.final_stage, Stage::DuplicateCleanup);
        assert_eq!(report.records_removed(), 1);
        assert_eq!(report.manual_review_groups(), 1);
        assert_eq!(report.status, FinalStatus::CompletedWithWarnings);
        assert!(report.backups.is_empty());

        assert_eq!(count(&f.stores), 4);
        assert!(!f.config.backup_dir.exists());
        assert!(!f.config.migration_log.exists());
        assert!(!f.stores.get(DocumentType::Pan).exists());

        for group in &report.duplicates[0].resolved {
            assert!(!group.applied);
            assert_eq!(usize::from(group.kept.is_some()) + group.removed.len(), group.group_size);
        }
    }

    #[test]
    fn test_full_run_removes_and_links() {
        let f = fixture();
        seed(
            &f.stores,
            &[
                ("X", "123456789012", "1/1/2000", 0.9),
                ("X", "123456789012", "1/1/2000", 0.9),
                ("Ravi", "9999 8888 7777", "", 0.7),
            ],
        );
        f.stores.get(DocumentType::Pan).ensure_document_tables().unwrap();

        let report = f.orchestrator.run(CleanupOptions::default()).unwrap();
        assert_eq!(report.status, FinalStatus::CompletedSuccessfully, "{:?}", report.errors);
        assert_eq!(report.final_stage, Stage::Done);
        assert_eq!(report.backups.len(), 2);
        assert_eq!(report.records_removed(), 1);
        assert_eq!(count(&f.stores), 2);

        let identity = &report.identity[0];
        assert_eq!(identity.records_linked, 2);
        assert_eq!(identity.users_assigned, 2);
        // The raw number was canonicalized by the schema migration.
        assert_eq!(report.schema[0].identifiers_normalized, 1);
        assert_eq!(identity.identifiers_normalized, 0);

        let integrity = &report.integrity[0];
        assert_eq!(integrity.remaining_duplicate_groups, 0);
        assert!((integrity.coverage_percent - 100.0).abs() < f64::EPSILON);
        assert!(matches!(report.constraints[0].outcome, Some(ConstraintOutcome::Created(_))));

        // A second run finds nothing to do.
        let again = f.orchestrator.run(CleanupOptions::default()).unwrap();
        assert_eq!(again.records_removed(), 0);
        assert_eq!(again.identity[0].records_linked, 0);
        assert_eq!(again.identity[0].already_linked, 2);
    }

    #[test]
    fn test_manual_review_groups_are_untouched() {
        let f = fixture();
        seed(&f.stores, &[("Asha", "111122223333", "", 0.9), ("Ravi", "111122223333", "", 0.9)]);

        let report = f
            .orchestrator
            .run(CleanupOptions::default().with_cleanup_only(true))
            .unwrap();
        assert_eq!(count(&f.stores), 2);
        assert_eq!(report.manual_review_groups(), 1);
        assert_eq!(report.stage(Stage::IdentityMigration).unwrap().status, StepStatus::Skipped);
        assert!(report.constraints[0].outcome.is_none());
        assert_eq!(report.status, FinalStatus::CompletedWithWarnings);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.integrity_issues()[0].kind(), ErrorKind::DataIntegrityIssue);
    }

    #[test]
    fn test_lock_conflict_is_an_error() {
        let f = fixture();
        seed(&f.stores, &[("X", "123456789012", "", 0.9)]);
        let _held = MaintenanceLock::acquire(&f.config.backup_dir).unwrap();
        let err = f.orchestrator.run(CleanupOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentWriteConflict);
    }

    #[test]
    fn test_report_is_saved() {
        let f = fixture();
        seed(&f.stores, &[("X", "123456789012", "", 0.9)]);
        let report = f
            .orchestrator
            .run(CleanupOptions::dry_run().with_save_report(true))
            .unwrap();
        let saved: Vec<_> = std::fs::read_dir(&f.config.report_dir).unwrap().collect();
        assert_eq!(saved.len(), 1);
        let name = saved[0].as_ref().unwrap().file_name().to_string_lossy().into_owned();
        assert!(name.starts_with("migration_report_"));
        assert_eq!(report.status, FinalStatus::CompletedWithWarnings);
    }
}
