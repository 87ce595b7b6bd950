//! Cleanup pipeline tests against legacy stores.
//!
//! Stores start in the layout the extraction side writes before any
//! ledger migration: no `user_id` columns and duplicate identifiers. The
//! tests check that:
//! - a dry run plans without touching anything
//! - a real run removes trivial duplicates, links every record and applies
//!   the identifier constraint
//! - conflicting groups are left alone

use idledger::storage::documents;
use idledger::{
    CleanupOptions, DocumentType, ErrorKind, ExtractedFields, FinalStatus, IngestRequest, Ledger, LedgerConfig,
    NewDocument, ResolutionKind, ScanExport, Stage, StepStatus,
};
use tempfile::{tempdir, TempDir};

struct Row<'a> {
    document_type: DocumentType,
    name: &'a str,
    number: &'a str,
    dob: &'a str,
    confidence: f64,
}

fn legacy_ledger(rows: &[Row<'_>]) -> (TempDir, Ledger) {
    let dir = tempdir().unwrap();
    let ledger = Ledger::open(LedgerConfig::in_dir(dir.path())).unwrap();
    for store in ledger.stores().iter() {
        store.ensure_document_tables().unwrap();
    }
    for row in rows {
        let conn = ledger.stores().get(row.document_type).connect().unwrap();
        let fields = ExtractedFields::new(row.name, row.number).with_dob(row.dob);
        documents::insert(&conn, &NewDocument::new(row.document_type, fields, row.confidence)).unwrap();
    }
    (dir, ledger)
}

fn records(ledger: &Ledger, document_type: DocumentType) -> Vec<idledger::DocumentRecord> {
    let conn = ledger.stores().get(document_type).connect().unwrap();
    documents::load_all(&conn, document_type).unwrap()
}

fn row<'a>(document_type: DocumentType, name: &'a str, number: &'a str, dob: &'a str, confidence: f64) -> Row<'a> {
    Row {
        document_type,
        name,
        number,
        dob,
        confidence,
    }
}

/// Two identical records form one trivial group; cleanup keeps one.
#[test]
fn test_identical_records_are_collapsed() {
    let (dir, ledger) = legacy_ledger(&[
        row(DocumentType::Aadhaar, "X", "123456789012", "1/1/2000", 0.9),
        row(DocumentType::Aadhaar, "X", "123456789012", "1/1/2000", 0.9),
    ]);

    let scan = ledger.scan_duplicates(ScanExport::none()).unwrap();
    let groups = &scan.report.stores[0].groups;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].size(), 2);
    assert!(groups[0].analysis.same_name && groups[0].analysis.same_dob);

    let preview = ledger.cleanup(CleanupOptions::dry_run()).unwrap();
    assert_eq!(preview.records_removed(), 1);
    assert_eq!(preview.duplicates[0].resolved[0].kind, ResolutionKind::TrivialDuplicate);
    assert_eq!(records(&ledger, DocumentType::Aadhaar).len(), 2);
    assert!(!dir.path().join("database_backups").exists());

    let report = ledger.cleanup(CleanupOptions::default()).unwrap();
    assert_eq!(report.status, FinalStatus::CompletedSuccessfully, "{:?}", report.errors);
    assert_eq!(report.final_stage, Stage::Done);
    assert_eq!(report.records_removed(), 1);

    let remaining = records(&ledger, DocumentType::Aadhaar);
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].user_id.is_some());
    assert!(ledger
        .migrator()
        .verify(ledger.stores().get(DocumentType::Aadhaar))
        .unwrap()
        .is_constrained());
}

/// After cleanup the store is governed: the same number is refused at
/// ingestion and attributed to the migrated owner.
#[test]
fn test_cleaned_store_refuses_duplicates() {
    let (_dir, ledger) = legacy_ledger(&[
        row(DocumentType::Pan, "Ravi Kumar", "abcde1234f", "", 0.7),
        row(DocumentType::Pan, "RAVI KUMAR", "ABCDE1234F", "", 0.95),
    ]);

    let report = ledger.cleanup(CleanupOptions::default().with_save_report(true)).unwrap();
    assert_eq!(report.records_removed(), 1);
    let survivor = &records(&ledger, DocumentType::Pan)[0];
    assert!((survivor.confidence - 0.95).abs() < f64::EPSILON);
    let owner = survivor.user_id.unwrap();

    let rejection = ledger
        .ingest(IngestRequest::new(DocumentType::Pan, ExtractedFields::new("Ravi", "ABCDE 1234 F"), 0.9))
        .unwrap_err();
    assert_eq!(rejection.kind(), ErrorKind::DuplicateIdentifier);
    assert_eq!(rejection.response().details["existing_user_id"], owner.to_string());

    let saved = std::fs::read_dir(&ledger.config().report_dir).unwrap().count();
    assert_eq!(saved, 1);
}

/// Records with different names under one number need a human.
#[test]
fn test_conflicting_group_is_left_for_review() {
    let (_dir, ledger) = legacy_ledger(&[
        row(DocumentType::Aadhaar, "Asha", "111122223333", "1/1/1990", 0.9),
        row(DocumentType::Aadhaar, "Ravi", "1111 2222 3333", "2/2/1985", 0.9),
        row(DocumentType::Aadhaar, "Meera", "444455556666", "", 0.9),
    ]);

    let report = ledger.cleanup(CleanupOptions::default()).unwrap();
    assert_eq!(report.records_removed(), 0);
    assert_eq!(report.manual_review_groups(), 1);
    assert_eq!(records(&ledger, DocumentType::Aadhaar).len(), 3);
    assert_eq!(report.status, FinalStatus::CompletedWithWarnings);

    // The constraint stays pending until the group is resolved.
    let aadhaar = report
        .constraints
        .iter()
        .find(|c| c.document_type == DocumentType::Aadhaar)
        .unwrap();
    assert!(aadhaar.outcome.is_none());
    assert!(report.findings.iter().any(|f| f.check == "remaining_duplicates"));
    assert_eq!(report.stage(Stage::ConstraintApplication).unwrap().status, StepStatus::Success);
}

/// Records without a name cannot be linked and are reported.
#[test]
fn test_unlinkable_records_are_counted() {
    let (_dir, ledger) = legacy_ledger(&[
        row(DocumentType::Aadhaar, "", "222233334444", "", 0.5),
        row(DocumentType::Aadhaar, "Kiran", "555566667777", "", 0.5),
    ]);

    let report = ledger.cleanup(CleanupOptions::default()).unwrap();
    let aadhaar = report
        .identity
        .iter()
        .find(|i| i.document_type == DocumentType::Aadhaar)
        .unwrap();
    assert_eq!(aadhaar.skipped, 1);
    assert_eq!(aadhaar.records_linked, 1);
    assert!(report.findings.iter().any(|f| f.check == "user_id_coverage"));
}
