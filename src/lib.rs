//! # idledger - Identity resolution for scanned identity documents
//!
//! idledger sits behind a document-extraction pipeline and keeps one stable
//! logical user per person across two SQLite stores, one for Aadhaar cards
//! and one for PAN cards. It refuses duplicate documents at ingestion time,
//! finds and cleans up the duplicates that already exist, and migrates the
//! stores to a schema that enforces uniqueness, with a verified backup
//! before every structural change.
//!
//! ## Core Concepts
//!
//! - **Canonical identifier**: the normalized form of an Aadhaar or PAN number
//! - **Logical user**: the ledger entity that owns every document of one person
//! - **Duplicate group**: stored records sharing one canonical identifier
//! - **Survivor**: the record kept when a group is resolved
//!
//! ## Usage
//!
//! ```rust,no_run
//! use idledger::{DocumentType, ExtractedFields, IngestRequest, Ledger, LedgerConfig};
//!
//! let ledger = Ledger::open(LedgerConfig::in_dir("/var/lib/idledger"))?;
//! ledger.setup()?;
//!
//! let fields = ExtractedFields::new("John Doe", "1234 5678 9012").with_dob("01/01/1990");
//! match ledger.ingest(IngestRequest::new(DocumentType::Aadhaar, fields, 0.93)) {
//!     Ok(receipt) => println!("stored for {}", receipt.user_id),
//!     Err(rejection) => println!("{}", serde_json::to_string(&rejection.response())?),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod document;
pub mod error;
pub mod identifier;
pub mod user;

// Storage and audit trail
pub mod audit;
pub mod storage;

// Identity resolution
pub mod directory;
pub mod guard;
pub mod ingest;

// Maintenance
pub mod cleanup;
pub mod migration;
pub mod scanner;

pub mod ledger;

// Re-export primary types at crate root for convenience
pub use audit::{AuditSink, DuplicateAttempt, JsonlAuditSink, MemoryAuditSink, MigrationLog, StepStatus};
pub use cleanup::{CleanupOptions, CleanupOrchestrator, CleanupReport, FinalStatus, Stage};
pub use config::{ConfigError, LedgerConfig, SeverityThresholds};
pub use directory::{DirectoryStatistics, SyncOutcome, UserDirectory};
pub use document::{DocumentRecord, ExtractedFields, NewDocument};
pub use error::{ErrorKind, LedgerError, LedgerResult, Rejection, RejectionResponse, Severity};
pub use guard::{DuplicateGuard, QualityMetrics, Uniqueness};
pub use identifier::{DocumentType, Identifier};
pub use ingest::{IngestReceipt, IngestRequest, Ingestor};
pub use ledger::{Ledger, ScanExport, ScanOutcome, SetupReport};
pub use migration::{BackupHandle, ConstraintOutcome, SchemaMigrator, SchemaVerification};
pub use scanner::{CleanupPlan, DuplicateGroup, DuplicateScanner, ResolutionKind, ScanReport};
pub use user::{LogicalUser, UserId};
