//! End-to-end ingestion tests.
//!
//! These tests drive the public `Ledger` surface the way an extraction
//! pipeline would:
//! - accepted documents get a stable user
//! - repeated identifiers are rejected with the existing owner
//! - explicit links attach a second document type to the same user
//! - numbers stored in a raw form before setup still count as taken
//! - a document that fails to store leaves no user or count behind

use idledger::storage::{documents, ledger as user_rows};
use idledger::{
    AuditSink, DocumentType, ErrorKind, ExtractedFields, IngestRequest, Ledger, LedgerConfig, LedgerError, NewDocument,
    UserId,
};
use tempfile::{tempdir, TempDir};

fn ledger() -> (TempDir, Ledger) {
    let dir = tempdir().unwrap();
    let ledger = Ledger::open(LedgerConfig::in_dir(dir.path())).unwrap();
    ledger.setup().unwrap();
    (dir, ledger)
}

fn aadhaar(name: &str, number: &str) -> IngestRequest {
    IngestRequest::new(DocumentType::Aadhaar, ExtractedFields::new(name, number), 0.92)
}

/// A first document creates a user; the same number again is refused and
/// the refusal names that user.
#[test]
fn test_ingest_then_reject_duplicate() {
    let (_dir, ledger) = ledger();

    let receipt = ledger
        .ingest(aadhaar("John Doe", "1234 5678 9012").with_source_path("scan_001.png"))
        .unwrap();
    assert_eq!(receipt.canonical_identifier, "123456789012");
    let user = ledger.directory().lookup_by_id(receipt.user_id).unwrap().unwrap();
    assert_eq!(user.document_count, 1);
    assert_eq!(user.display_name, "John Doe");

    let rejection = ledger
        .ingest(aadhaar("John Doe", "123456789012").with_source_path("scan_002.png"))
        .unwrap_err();
    assert_eq!(rejection.kind(), ErrorKind::DuplicateIdentifier);
    match &rejection.error {
        LedgerError::DuplicateIdentifier {
            existing_user_id,
            existing_document_id,
            ..
        } => {
            assert_eq!(*existing_user_id, Some(receipt.user_id));
            assert_eq!(*existing_document_id, receipt.document_id);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let response = rejection.response();
    assert!(!response.success);
    assert_eq!(response.error.code, "DUPLICATE_AADHAAR");
    assert_eq!(response.details["existing_source_path"], "scan_001.png");

    let attempts = ledger.guard().audit().attempts().unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].source_path.as_deref(), Some("scan_002.png"));

    // The rejected document did not bump the count.
    let user = ledger.directory().lookup_by_id(receipt.user_id).unwrap().unwrap();
    assert_eq!(user.document_count, 1);
}

/// A PAN card linked to an Aadhaar holder joins the same user.
#[test]
fn test_linked_pan_joins_existing_user() {
    let (_dir, ledger) = ledger();
    let first = ledger.ingest(aadhaar("Asha Rao", "2345 6789 0123")).unwrap();

    let pan = IngestRequest::new(DocumentType::Pan, ExtractedFields::new("ASHA RAO", "abcde1234f"), 0.88)
        .linked_to(first.user_id);
    let second = ledger.ingest(pan).unwrap();
    assert_eq!(second.user_id, first.user_id);
    assert_eq!(second.canonical_identifier, "ABCDE1234F");

    let stats = ledger.statistics().unwrap();
    assert_eq!(stats.total_users, 1);
    assert_eq!(stats.per_store[&DocumentType::Aadhaar], 1);
    assert_eq!(stats.per_store[&DocumentType::Pan], 1);
    assert_eq!(stats.users_with_multiple_documents, 1);

    // The PAN number is now taken too.
    let again = IngestRequest::new(DocumentType::Pan, ExtractedFields::new("Asha", "ABCDE-1234-F"), 0.9);
    let rejection = ledger.ingest(again).unwrap_err();
    assert_eq!(rejection.response().error.code, "DUPLICATE_PAN");
}

/// Without a link hint a PAN card gets its own user.
#[test]
fn test_unlinked_pan_gets_its_own_user() {
    let (_dir, ledger) = ledger();
    let aadhaar_receipt = ledger.ingest(aadhaar("Ravi", "345678901234")).unwrap();
    let pan = IngestRequest::new(DocumentType::Pan, ExtractedFields::new("Ravi", "PQRST6789K"), 0.9);
    let pan_receipt = ledger.ingest(pan).unwrap();
    assert_ne!(pan_receipt.user_id, aadhaar_receipt.user_id);
    assert_eq!(ledger.statistics().unwrap().total_users, 2);
}

/// Missing fields and unknown link targets are refused.
#[test]
fn test_invalid_requests_are_rejected() {
    let (_dir, ledger) = ledger();

    let rejection = ledger
        .ingest(IngestRequest::new(DocumentType::Aadhaar, ExtractedFields::default(), 0.9))
        .unwrap_err();
    assert_eq!(rejection.kind(), ErrorKind::InvalidDocumentFields);
    assert_eq!(rejection.response().details["missing_fields"][1], "name");

    let rejection = ledger
        .ingest(aadhaar("Meera", "456789012345").linked_to(UserId::new()))
        .unwrap_err();
    assert_eq!(rejection.kind(), ErrorKind::IdentityNotFound);
    assert_eq!(ledger.statistics().unwrap().total_users, 0);
}

/// Ingestion needs a migrated store and never creates one itself.
#[test]
fn test_ingest_requires_setup() {
    let dir = tempdir().unwrap();
    let ledger = Ledger::open(LedgerConfig::in_dir(dir.path())).unwrap();

    let rejection = ledger.ingest(aadhaar("John Doe", "1234 5678 9012")).unwrap_err();
    assert_eq!(rejection.kind(), ErrorKind::MigrationStepFailure);
    assert!(!ledger.stores().get(DocumentType::Aadhaar).exists());
}

fn refuse_inserts(ledger: &Ledger, document_type: DocumentType) {
    let conn = ledger.stores().get(document_type).connect().unwrap();
    conn.execute_batch(
        "CREATE TRIGGER refuse_fields BEFORE INSERT ON extracted_fields
         BEGIN SELECT RAISE(ABORT, 'extracted_fields is read-only'); END;",
    )
    .unwrap();
}

fn stored_records(ledger: &Ledger, document_type: DocumentType) -> usize {
    let conn = ledger.stores().get(document_type).connect().unwrap();
    documents::load_all(&conn, document_type).unwrap().len()
}

/// A number stored with separators before the ledger existed is
/// canonicalized by setup and then refuses its plain form.
#[test]
fn test_legacy_raw_identifier_blocks_duplicate() {
    let dir = tempdir().unwrap();
    let ledger = Ledger::open(LedgerConfig::in_dir(dir.path())).unwrap();
    let store = ledger.stores().get(DocumentType::Aadhaar);
    store.ensure_document_tables().unwrap();
    {
        let conn = store.connect().unwrap();
        let legacy = NewDocument::new(DocumentType::Aadhaar, ExtractedFields::new("John Doe", "1234 5678 9012"), 0.8);
        documents::insert(&conn, &legacy).unwrap();
    }

    let setup = ledger.setup().unwrap();
    assert_eq!(setup.migrations[0].identifiers_normalized, 1);
    assert!(setup.pending_constraints().is_empty());

    let rejection = ledger.ingest(aadhaar("Other", "123456789012")).unwrap_err();
    assert_eq!(rejection.kind(), ErrorKind::DuplicateIdentifier);
    assert_eq!(stored_records(&ledger, DocumentType::Aadhaar), 1);
}

/// A raw number written straight into a governed store is still matched
/// by its canonical form.
#[test]
fn test_raw_identifier_written_after_setup_is_matched() {
    let (_dir, ledger) = ledger();
    {
        let conn = ledger.stores().get(DocumentType::Pan).connect().unwrap();
        let raw = NewDocument::new(DocumentType::Pan, ExtractedFields::new("Ravi", "abcde-1234-f"), 0.7);
        documents::insert(&conn, &raw).unwrap();
    }

    let request = IngestRequest::new(DocumentType::Pan, ExtractedFields::new("Ravi", "ABCDE1234F"), 0.9);
    let rejection = ledger.ingest(request).unwrap_err();
    assert_eq!(rejection.kind(), ErrorKind::DuplicateIdentifier);
    assert_eq!(stored_records(&ledger, DocumentType::Pan), 1);
}

/// When the document insert fails, the user created for it is removed
/// again.
#[test]
fn test_failed_insert_leaves_no_user() {
    let (_dir, ledger) = ledger();
    refuse_inserts(&ledger, DocumentType::Aadhaar);

    assert!(ledger.ingest(aadhaar("John Doe", "1234 5678 9012")).is_err());

    let conn = ledger.stores().get(DocumentType::Aadhaar).connect().unwrap();
    assert!(user_rows::all_users(&conn).unwrap().is_empty());
    assert_eq!(ledger.statistics().unwrap().total_users, 0);
    assert_eq!(stored_records(&ledger, DocumentType::Aadhaar), 0);
}

/// A failed linked insert restores the owner's count and drops the replica
/// copied into the target store.
#[test]
fn test_failed_linked_insert_restores_count() {
    let (_dir, ledger) = ledger();
    let first = ledger.ingest(aadhaar("Asha Rao", "2345 6789 0123")).unwrap();
    refuse_inserts(&ledger, DocumentType::Pan);

    let pan = IngestRequest::new(DocumentType::Pan, ExtractedFields::new("Asha Rao", "ABCDE1234F"), 0.9)
        .linked_to(first.user_id);
    assert!(ledger.ingest(pan).is_err());

    let user = ledger.directory().lookup_by_id(first.user_id).unwrap().unwrap();
    assert_eq!(user.document_count, 1);
    let stats = ledger.statistics().unwrap();
    assert_eq!(stats.per_store[&DocumentType::Pan], 0);
    assert_eq!(stats.total_users, 1);
}
