use std::fs;
use std::path::Path;

use tempfile::TempDir;
use trivdb::{Error, OpenMode, Tdb, TdbFlags};

const HDR_DATA_END: usize = 40;
const HDR_RECOVERY: usize = 56;

fn open(path: &Path) -> Tdb {
    Tdb::open(path, TdbFlags::DEFAULT, OpenMode::default()).unwrap()
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

/// Leave `path` with a prepared but uncommitted transaction that adds a big
/// record, and return a copy of the file as it looks at that moment: what a
/// crash between prepare and commit leaves behind.
fn crash_after_prepare(path: &Path) -> Vec<u8> {
    let db = open(path);
    db.store(b"stable", b"before").unwrap();
    db.store(b"bloe", b"2").unwrap();

    db.transaction_start().unwrap();
    db.store(b"bloe", b"1").unwrap();
    db.store(b"big", &vec![0xEE; 20_000]).unwrap();
    db.transaction_prepare_commit().unwrap();
    let image = fs::read(path).unwrap();
    db.transaction_cancel().unwrap();
    image
}

#[test]
fn test_prepared_journal_is_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal.tdb");
    let image = crash_after_prepare(&path);
    assert_ne!(read_u64(&image, HDR_RECOVERY), 0);

    // Cancel cleaned up after itself
    let bytes = fs::read(&path).unwrap();
    assert_eq!(read_u64(&bytes, HDR_RECOVERY), 0);
    assert_eq!(bytes.len() as u64, read_u64(&bytes, HDR_DATA_END));
}

#[test]
fn test_crash_between_prepare_and_commit_rolls_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.tdb");
    let mut image = crash_after_prepare(&path);

    // Half-applied commit: the header already claims the grown data area
    let torn_end = read_u64(&image, HDR_DATA_END) + 4096;
    image[HDR_DATA_END..HDR_DATA_END + 8].copy_from_slice(&torn_end.to_le_bytes());

    let copy = dir.path().join("copy.tdb");
    fs::write(&copy, &image).unwrap();

    let db = open(&copy);
    assert_eq!(db.get(b"bloe").unwrap(), b"2");
    assert_eq!(db.get(b"stable").unwrap(), b"before");
    assert!(db.get(b"big").unwrap_err().is_not_found());
    assert_eq!(db.len().unwrap(), 2);
    db.check().unwrap();

    let bytes = fs::read(&copy).unwrap();
    assert_eq!(read_u64(&bytes, HDR_RECOVERY), 0);
}

#[test]
fn test_recovery_on_lock_by_attached_handle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.tdb");
    let image = crash_after_prepare(&path);

    // A handle attached before the crash notices on its next access
    let copy = dir.path().join("copy.tdb");
    fs::copy(&path, &copy).unwrap();
    let db = open(&copy);
    fs::write(&copy, &image).unwrap();

    assert_eq!(db.get(b"bloe").unwrap(), b"2");
    db.check().unwrap();
    db.store(b"bloe", b"3").unwrap();
    assert_eq!(db.get(b"bloe").unwrap(), b"3");
}

#[test]
fn test_read_only_handle_refuses_to_recover() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.tdb");
    let image = crash_after_prepare(&path);
    let copy = dir.path().join("copy.tdb");
    fs::write(&copy, &image).unwrap();

    let err = Tdb::open(&copy, TdbFlags::DEFAULT, OpenMode::READ_ONLY).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    // A writer repairs it, after which readers are fine
    open(&copy).close().unwrap();
    let db = Tdb::open(&copy, TdbFlags::DEFAULT, OpenMode::READ_ONLY).unwrap();
    assert_eq!(db.get(b"bloe").unwrap(), b"2");
}

#[test]
fn test_committed_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("durable.tdb");
    {
        let db = open(&path);
        db.transaction_start().unwrap();
        for i in 0..50u32 {
            db.store(&i.to_le_bytes(), &[i as u8; 300]).unwrap();
        }
        db.transaction_prepare_commit().unwrap();
        db.transaction_commit().unwrap();
    }

    let db = open(&path);
    assert_eq!(db.len().unwrap(), 50);
    assert_eq!(db.get(&49u32.to_le_bytes()).unwrap(), vec![49u8; 300]);
    db.check().unwrap();
}

#[test]
fn test_stray_tail_is_trimmed_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tail.tdb");
    open(&path).store(b"k", b"v").unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let end = bytes.len();
    bytes.extend_from_slice(&[0xAA; 1000]);
    fs::write(&path, &bytes).unwrap();

    let db = open(&path);
    assert_eq!(db.get(b"k").unwrap(), b"v");
    assert_eq!(fs::metadata(&path).unwrap().len(), end as u64);
}
