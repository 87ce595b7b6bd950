//! The `Ledger` facade: one handle over both stores and every component.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::audit::{AuditSink, JsonlAuditSink, MemoryAuditSink, MigrationLog};
use crate::cleanup::{CleanupOptions, CleanupOrchestrator, CleanupReport, ConstraintResult};
use crate::config::LedgerConfig;
use crate::directory::{DirectoryStatistics, UserDirectory};
use crate::document::FIELDS_TABLE;
use crate::error::{ErrorKind, LedgerResult, Rejection};
use crate::guard::{DuplicateGuard, QualityMetrics};
use crate::ingest::{IngestReceipt, IngestRequest, Ingestor};
use crate::migration::{SchemaMigrator, StoreMigration};
use crate::scanner::{DuplicateScanner, ScanReport};
use crate::storage::{MaintenanceLock, Stores};

/// Which files [`Ledger::scan_duplicates`] writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanExport {
    /// Full JSON report.
    pub json: bool,
    /// One CSV row per group.
    pub csv: bool,
}

impl ScanExport {
    /// Write nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self { json: false, csv: false }
    }

    /// Write both formats.
    #[must_use]
    pub const fn all() -> Self {
        Self { json: true, csv: true }
    }
}

/// A scan and the files it was exported to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// The scan.
    pub report: ScanReport,
    /// Files written.
    pub exported: Vec<PathBuf>,
}

/// Result of [`Ledger::setup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupReport {
    /// Per-store schema migration.
    pub migrations: Vec<StoreMigration>,
    /// Identifier constraints, applied or pending.
    pub constraints: Vec<ConstraintResult>,
}

impl SetupReport {
    /// Stores whose identifier constraint could not be applied yet.
    #[must_use]
    pub fn pending_constraints(&self) -> Vec<&ConstraintResult> {
        self.constraints.iter().filter(|c| c.outcome.is_none()).collect()
    }
}

/// Identity ledger over the Aadhaar and PAN stores.
pub struct Ledger {
    config: LedgerConfig,
    stores: Stores,
    directory: Arc<UserDirectory>,
    guard: Arc<DuplicateGuard>,
    ingestor: Ingestor,
    migrator: SchemaMigrator,
    scanner: DuplicateScanner,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Ledger {
    /// Opens a ledger, auditing duplicate attempts to the configured log or
    /// to memory when none is configured.
    ///
    /// Nothing is created on disk until a write happens.
    ///
    /// # Errors
    /// `Config` if the configuration does not validate.
    pub fn open(config: LedgerConfig) -> LedgerResult<Self> {
        let audit: Arc<dyn AuditSink> = match &config.audit_log {
            Some(path) => Arc::new(JsonlAuditSink::new(path)),
            None => Arc::new(MemoryAuditSink::new()),
        };
        Self::with_audit(config, audit)
    }

    /// Opens a ledger with an explicit audit sink.
    ///
    /// # Errors
    /// `Config` if the configuration does not validate.
    pub fn with_audit(config: LedgerConfig, audit: Arc<dyn AuditSink>) -> LedgerResult<Self> {
        let config = config.validate()?;
        let stores = Stores::from_config(&config);
        let directory = Arc::new(UserDirectory::new(stores.clone(), config.max_id_attempts));
        let guard = Arc::new(DuplicateGuard::new(stores.clone(), audit));
        let ingestor = Ingestor::new(stores.clone(), Arc::clone(&directory), Arc::clone(&guard));
        let migrator = SchemaMigrator::new(&config.backup_dir, Arc::new(MigrationLog::new(&config.migration_log)));
        let scanner = DuplicateScanner::new(config.severity);

        Ok(Self {
            config,
            stores,
            directory,
            guard,
            ingestor,
            migrator,
            scanner,
        })
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Both stores.
    #[must_use]
    pub const fn stores(&self) -> &Stores {
        &self.stores
    }

    /// The user directory.
    #[must_use]
    pub fn directory(&self) -> &UserDirectory {
        &self.directory
    }

    /// The duplicate guard.
    #[must_use]
    pub fn guard(&self) -> &DuplicateGuard {
        &self.guard
    }

    /// The schema migrator.
    #[must_use]
    pub const fn migrator(&self) -> &SchemaMigrator {
        &self.migrator
    }

    /// Accepts or rejects one document. See [`Ingestor::ingest`].
    ///
    /// # Errors
    /// A [`Rejection`] describing why the document was not stored.
    pub fn ingest(&self, request: IngestRequest) -> Result<IngestReceipt, Rejection> {
        self.ingestor.ingest(request)
    }

    /// Brings both stores to the ledger schema and applies the identifier
    /// constraints where the data allows it. Safe to run repeatedly.
    ///
    /// A constraint blocked by existing duplicates is reported as pending,
    /// not as an error.
    ///
    /// # Errors
    /// - `ConcurrentWriteConflict` if a maintenance run holds the lock
    /// - `MigrationStepFailure` if a store cannot be migrated
    #[instrument(skip(self))]
    pub fn setup(&self) -> LedgerResult<SetupReport> {
        let _lock = MaintenanceLock::acquire(self.migrator.backup_dir())?;
        let mut report = SetupReport {
            migrations: Vec::new(),
            constraints: Vec::new(),
        };

        for store in self.stores.iter() {
            report.migrations.push(self.migrator.migrate_store(store, None)?);

            let dt = store.document_type();
            let constraint = match self
                .migrator
                .add_unique_constraint(store, FIELDS_TABLE, dt.identifier_column())
            {
                Ok(outcome) => ConstraintResult {
                    document_type: dt,
                    outcome: Some(outcome),
                    pending_reason: None,
                },
                Err(e) if e.kind() == ErrorKind::SchemaConstraintViolation => {
                    tracing::warn!(store = %dt, error = %e, "identifier constraint pending");
                    ConstraintResult {
                        document_type: dt,
                        outcome: None,
                        pending_reason: Some(e.to_string()),
                    }
                }
                Err(e) => return Err(e),
            };
            report.constraints.push(constraint);
        }

        self.directory.clear_cache()?;
        tracing::info!(pending = report.pending_constraints().len(), "setup complete");
        Ok(report)
    }

    /// Scans both stores for duplicates and quality problems, exporting the
    /// report to the report directory as requested.
    ///
    /// # Errors
    /// Propagates store and file failures.
    pub fn scan_duplicates(&self, export: ScanExport) -> LedgerResult<ScanOutcome> {
        let report = self.scanner.full_scan(&self.stores)?;
        let mut exported = Vec::new();
        if export.json {
            exported.push(report.save_json(&self.config.report_dir)?);
        }
        if export.csv {
            exported.push(report.save_csv(&self.config.report_dir)?);
        }
        tracing::info!(groups = report.total_groups(), severity = ?report.summary.severity, "duplicate scan complete");
        Ok(ScanOutcome { report, exported })
    }

    /// Runs the cleanup pipeline. See [`CleanupOrchestrator::run`].
    ///
    /// # Errors
    /// `ConcurrentWriteConflict` if another maintenance run is active;
    /// `Io` if the report cannot be written.
    pub fn cleanup(&self, options: CleanupOptions) -> LedgerResult<CleanupReport> {
        let orchestrator = CleanupOrchestrator::new(
            self.stores.clone(),
            self.migrator.clone(),
            Arc::clone(&self.directory),
            self.scanner,
            &self.config.report_dir,
        );
        let report = orchestrator.run(options);
        // Cleanup rewrites ledger rows behind the cache.
        self.directory.clear_cache()?;
        report
    }

    /// Identifier quality per store.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn quality_metrics(&self) -> LedgerResult<QualityMetrics> {
        self.guard.get_quality_metrics()
    }

    /// User counts across stores.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn statistics(&self) -> LedgerResult<DirectoryStatistics> {
        self.directory.get_statistics()
    }
}
