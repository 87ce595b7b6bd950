//! Concurrency tests for user creation.
//!
//! Several writers, each with its own directory (as separate processes
//! would have), race to create the user for one new identifier. The unique
//! index on the ledger must leave exactly one user behind.

use std::sync::{Arc, Barrier};
use std::thread;

use idledger::storage::ledger;
use idledger::{DocumentType, Identifier, Ledger, LedgerConfig, UserDirectory, UserId};
use tempfile::tempdir;

const WRITERS: usize = 8;

/// Racing creators on the same store converge on a single user id, and
/// every call is counted.
#[test]
fn test_racing_creators_share_one_user() {
    let dir = tempdir().unwrap();
    let ledger = Ledger::open(LedgerConfig::in_dir(dir.path())).unwrap();
    ledger.setup().unwrap();

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let stores = ledger.stores().clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let directory = UserDirectory::new(stores, 3);
                barrier.wait();
                directory
                    .get_or_create(&Identifier::aadhaar("1234 5678 9012"), "John Doe", DocumentType::Aadhaar)
                    .unwrap()
            })
        })
        .collect();

    let ids: Vec<UserId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.iter().all(|id| *id == ids[0]), "writers disagreed: {ids:?}");

    let conn = ledger.stores().get(DocumentType::Aadhaar).connect().unwrap();
    let users = ledger::all_users(&conn).unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].document_count, WRITERS as u32);
}

/// Sequential calls return the same id and count up.
#[test]
fn test_get_or_create_counts_documents() {
    let dir = tempdir().unwrap();
    let ledger = Ledger::open(LedgerConfig::in_dir(dir.path())).unwrap();
    ledger.setup().unwrap();
    let directory = ledger.directory();
    let identifier = Identifier::aadhaar("123456789012");

    let first = directory.get_or_create(&identifier, "John Doe", DocumentType::Aadhaar).unwrap();
    assert_eq!(directory.lookup_by_identifier(&identifier).unwrap().unwrap().document_count, 1);

    let second = directory.get_or_create(&identifier, "John Doe", DocumentType::Aadhaar).unwrap();
    assert_eq!(first, second);
    assert_eq!(directory.lookup_by_identifier(&identifier).unwrap().unwrap().document_count, 2);
}
