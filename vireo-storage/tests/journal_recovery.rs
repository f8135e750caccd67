//! Crash recovery from a journal cut at every possible byte boundary.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use vireo_core::{DestinationDescriptor, StorageSyncMethod};
use vireo_storage::block::files::StoreFiles;
use vireo_storage::journal::{decode_record, DecodeOutcome, JournalDirectory, JournalRecord, JOURNAL_HEADER_SIZE};
use vireo_storage::BlockStore;

const PAYLOADS: [&[u8]; 3] = [
    b"alpha",
    b"a payload spanning more than one block of sixty four bytes, padded until it needs two blocks",
    b"gamma",
];

fn descriptor(folder: &Path) -> DestinationDescriptor {
    let mut d = DestinationDescriptor::new("recover", folder);
    d.block_size = 64;
    d.initial_block_count = 16;
    d.sync_method = StorageSyncMethod::None;
    d
}

/// End offsets (file coordinates) of every commit marker in `journal`.
fn commit_ends(journal: &[u8]) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut offset = JOURNAL_HEADER_SIZE as usize;
    while let DecodeOutcome::Record(record, used) = decode_record(1, &journal[offset..]) {
        offset += used;
        if matches!(record, JournalRecord::Commit { .. }) {
            ends.push(offset);
        }
    }
    ends
}

struct CrashImage {
    table: Vec<u8>,
    data: Vec<u8>,
    journal: Vec<u8>,
}

/// Run two committed transactions and one uncommitted write, then abandon
/// the store. Returns the store files as they were before any journal
/// record was applied, plus the journal.
fn crash_image() -> CrashImage {
    let dir = TempDir::new().unwrap();
    let d = descriptor(dir.path());
    let store = BlockStore::open(d.clone()).unwrap();
    let table = fs::read(StoreFiles::table_path(&d)).unwrap();
    let data = fs::read(StoreFiles::data_path(&d)).unwrap();

    store.store(PAYLOADS[0]).unwrap();
    store.commit_changes().unwrap();
    store.store(PAYLOADS[1]).unwrap();
    store.commit_changes().unwrap();
    store.store(PAYLOADS[2]).unwrap();
    store.flush().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = store.journal_stats().unwrap();
        if stats.commits >= 2 && stats.unflushed_bytes == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "journal did not settle");
        thread::sleep(Duration::from_millis(5));
    }

    let journal = fs::read(JournalDirectory::new(dir.path(), "recover").file_path(1)).unwrap();
    std::mem::forget(store);
    CrashImage { table, data, journal }
}

#[test]
fn test_recovers_exactly_the_committed_prefix() {
    let image = crash_image();
    let ends = commit_ends(&image.journal);
    assert_eq!(ends.len(), 2);

    for cut in 0..=image.journal.len() {
        let dir = TempDir::new().unwrap();
        let d = descriptor(dir.path());
        fs::write(StoreFiles::table_path(&d), &image.table).unwrap();
        fs::write(StoreFiles::data_path(&d), &image.data).unwrap();
        fs::write(JournalDirectory::new(dir.path(), "recover").file_path(1), &image.journal[..cut]).unwrap();

        let store = BlockStore::open(d).unwrap_or_else(|e| panic!("reopen after cut at {cut} failed: {e}"));
        store.check_integrity().unwrap();

        let committed = ends.iter().filter(|&&end| end <= cut).count();
        let contents: Vec<Vec<u8>> =
            store.handles().unwrap().into_iter().map(|h| store.retrieve(h).unwrap().to_vec()).collect();
        let expected: Vec<Vec<u8>> = PAYLOADS[..committed].iter().map(|p| p.to_vec()).collect();
        assert_eq!(contents, expected, "cut at byte {cut}");

        let report = store.recovery_report().unwrap();
        assert_eq!(report.commits, committed);
        store.close().unwrap();
    }
}

#[test]
fn test_recovery_is_idempotent() {
    let image = crash_image();
    let dir = TempDir::new().unwrap();
    let d = descriptor(dir.path());
    fs::write(StoreFiles::table_path(&d), &image.table).unwrap();
    fs::write(StoreFiles::data_path(&d), &image.data).unwrap();
    let journal_path = JournalDirectory::new(dir.path(), "recover").file_path(1);
    fs::write(&journal_path, &image.journal).unwrap();

    let first = BlockStore::open(d.clone()).unwrap();
    assert_eq!(first.size(), 2);
    assert!(first.recovery_report().unwrap().records_discarded > 0);
    first.close().unwrap();
    drop(first);

    // Replaying the same journal over already-recovered files changes nothing.
    fs::write(&journal_path, &image.journal).unwrap();
    let second = BlockStore::open(d).unwrap();
    assert_eq!(second.size(), 2);
    assert_eq!(&second.retrieve(second.first().unwrap()).unwrap()[..], PAYLOADS[0]);
}
