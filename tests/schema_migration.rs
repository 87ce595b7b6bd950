//! Schema migration tests.
//!
//! These tests verify that migrating a populated legacy store:
//! - takes a verified backup before changing anything
//! - keeps every existing row
//! - is recorded in the migration log
//! - can be rolled back by restoring the backup
//! - compares identifiers by canonical form when applying the constraint

use idledger::migration::file_digest;
use idledger::storage::documents;
use idledger::{
    CleanupOptions, DocumentType, ExtractedFields, FinalStatus, Ledger, LedgerConfig, NewDocument, StepStatus,
};
use tempfile::tempdir;

/// Migrating a legacy store backs it up, preserves its rows and verifies.
#[test]
fn test_setup_migrates_legacy_store() {
    let dir = tempdir().unwrap();
    let ledger = Ledger::open(LedgerConfig::in_dir(dir.path())).unwrap();
    let store = ledger.stores().get(DocumentType::Aadhaar);
    store.ensure_document_tables().unwrap();
    {
        let conn = store.connect().unwrap();
        for (name, number) in [("Asha", "1234 5678 9012"), ("Ravi", "2345 6789 0123")] {
            let doc = NewDocument::new(DocumentType::Aadhaar, ExtractedFields::new(name, number), 0.8);
            documents::insert(&conn, &doc).unwrap();
        }
    }
    let before = ledger.migrator().verify(store).unwrap();
    assert!(before.store_exists);
    assert!(!before.is_governed());
    assert!(before.missing().contains(&"users_table"));

    let report = ledger.setup().unwrap();
    let aadhaar = &report.migrations[0];
    assert_eq!(aadhaar.status, StepStatus::Success);
    let backup = aadhaar.backup.as_ref().expect("populated store is backed up");
    assert!(backup.path.exists());
    assert!(backup
        .path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("aadhaar_documents_backup_"));

    // The PAN store did not exist, so there was nothing to back up.
    assert!(report.migrations[1].backup.is_none());

    let after = ledger.migrator().verify(store).unwrap();
    assert!(after.is_constrained(), "missing: {:?}", after.missing());
    assert!(after.users_table && after.users_identifier_index);

    let conn = store.connect().unwrap();
    assert_eq!(documents::load_all(&conn, DocumentType::Aadhaar).unwrap().len(), 2);

    let log = ledger.migrator().log().entries().unwrap();
    assert!(log.iter().any(|e| e.operation == "backup" && e.status == StepStatus::Success));
    assert!(log.iter().any(|e| e.operation == "migrate_store" && e.status == StepStatus::Success));
    assert!(log
        .iter()
        .any(|e| e.operation == "add_unique_constraint" && e.status == StepStatus::Success));
}

/// Restoring the backup returns the store to its pre-migration bytes.
#[test]
fn test_restore_backup_rolls_back() {
    let dir = tempdir().unwrap();
    let ledger = Ledger::open(LedgerConfig::in_dir(dir.path())).unwrap();
    let store = ledger.stores().get(DocumentType::Pan);
    store.ensure_document_tables().unwrap();
    let original = file_digest(store.path()).unwrap();

    let report = ledger.setup().unwrap();
    let backup = report.migrations[1].backup.clone().unwrap();
    assert_eq!(backup.digest, original);
    assert_ne!(file_digest(store.path()).unwrap(), original);

    ledger.migrator().restore_backup(&backup, store).unwrap();
    assert_eq!(file_digest(store.path()).unwrap(), original);
    assert!(!ledger.migrator().verify(store).unwrap().is_governed());
}

/// Two spellings of one number keep the constraint pending until cleanup
/// collapses them.
#[test]
fn test_raw_variants_keep_constraint_pending() {
    let dir = tempdir().unwrap();
    let ledger = Ledger::open(LedgerConfig::in_dir(dir.path())).unwrap();
    let store = ledger.stores().get(DocumentType::Aadhaar);
    store.ensure_document_tables().unwrap();
    {
        let conn = store.connect().unwrap();
        for number in ["1234 5678 9012", "1234-5678-9012"] {
            let fields = ExtractedFields::new("Asha Rao", number).with_dob("01/01/1990");
            documents::insert(&conn, &NewDocument::new(DocumentType::Aadhaar, fields, 0.8)).unwrap();
        }
    }

    let report = ledger.setup().unwrap();
    assert_eq!(report.migrations[0].identifiers_normalized, 2);
    let pending = report.pending_constraints();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].document_type, DocumentType::Aadhaar);
    assert!(!ledger.migrator().verify(store).unwrap().identifier_unique_index);

    let cleanup = ledger.cleanup(CleanupOptions::default()).unwrap();
    assert_eq!(cleanup.status, FinalStatus::CompletedSuccessfully, "{:?}", cleanup.errors);
    assert_eq!(cleanup.records_removed(), 1);
    assert!(ledger.migrator().verify(store).unwrap().is_constrained());
}
