mod common;

use common::{create_log, log_path, payload, read_all, segment_files, write_synced};
use reclog::{Config, Error, Log, SyncMode};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

fn append_bytes(path: &Path, bytes: &[u8]) {
    let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
}

fn last_records_file(dir: &Path) -> std::path::PathBuf {
    segment_files(dir, ".records").pop().unwrap()
}

/// Copy a live log directory, lock file included, as a crash would leave it.
fn snapshot_dir(from: &Path, to: &Path) {
    fs::create_dir(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

/// A crash mid-write leaves half a frame at the end of the newest segment.
/// Reopening cuts it off and appends continue from the last whole record.
#[test]
fn test_torn_tail_is_truncated_on_reopen() {
    let dir = tempdir().unwrap();
    let log = create_log(&dir, Config::default());
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..5);
    writer.close().unwrap();
    log.close().unwrap();

    let records = last_records_file(&log_path(&dir));
    append_bytes(&records, &[0, 0, 0, 40, 1, 2, 3]);

    let log = Log::open(log_path(&dir)).unwrap();
    assert_eq!(log.stat().end_position, 5);
    assert_eq!(fs::metadata(&records).unwrap().len(), 5 * 24);

    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 5..6);
    let mut reader = log.reader().open().unwrap();
    assert_eq!(read_all(&mut reader), (0..6).map(payload).collect::<Vec<_>>());
}

/// Some filesystems extend a file with zeroes before the data lands.
#[test]
fn test_zero_filled_tail_is_truncated_on_reopen() {
    let dir = tempdir().unwrap();
    let log = create_log(&dir, Config::default());
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..5);
    writer.close().unwrap();
    log.close().unwrap();

    append_bytes(&last_records_file(&log_path(&dir)), &[0u8; 100]);

    let log = Log::open(log_path(&dir)).unwrap();
    assert_eq!(log.stat().end_position, 5);
    let mut reader = log.reader().open().unwrap();
    assert_eq!(read_all(&mut reader).len(), 5);
}

/// Everything synced before a crash survives it.
#[test]
fn test_synced_records_survive_crash() {
    let dir = tempdir().unwrap();
    let config = Config {
        segment_max_count: Some(4),
        ..Config::default()
    };
    let log = create_log(&dir, config);
    let mut writer = log.writer().sync_mode(SyncMode::Manual).open().unwrap();
    write_synced(&mut writer, 0..10);
    writer.write(&payload(10)).unwrap();

    let crashed = dir.path().join("crashed");
    snapshot_dir(&log_path(&dir), &crashed);

    let err = Log::open(&crashed).unwrap_err();
    assert!(matches!(err, Error::Orphaned), "got {err:?}");

    let log = Log::open(&crashed).unwrap();
    assert_eq!(log.stat().end_position, 10);
    let mut reader = log.reader().open().unwrap();
    assert_eq!(read_all(&mut reader), (0..10).map(payload).collect::<Vec<_>>());
}

#[test]
fn test_scan_of_clean_log() {
    let dir = tempdir().unwrap();
    let config = Config {
        segment_max_count: Some(10),
        index_after_size: 64,
        ..Config::default()
    };
    let log = create_log(&dir, config);
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..35);
    writer.close().unwrap();

    let err = Log::scan(log_path(&dir)).unwrap_err();
    assert!(matches!(err, Error::Locked), "got {err:?}");
    log.close().unwrap();

    let report = Log::scan(log_path(&dir)).unwrap();
    assert_eq!(report.segments, 4);
    assert_eq!(report.records, 35);
    assert!(report.is_clean(), "{report:?}");
    assert!(!log_path(&dir).join("lock").exists());
}

#[test]
fn test_scan_repairs_torn_tail_and_stale_lock() {
    let dir = tempdir().unwrap();
    let log = create_log(&dir, Config::default());
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..5);
    writer.close().unwrap();
    log.close().unwrap();

    append_bytes(&last_records_file(&log_path(&dir)), &[0, 0, 0, 40, 1, 2, 3]);
    fs::write(log_path(&dir).join("lock"), b"").unwrap();

    let report = Log::scan(log_path(&dir)).unwrap();
    assert_eq!(report.records, 5);
    assert_eq!(report.truncated_bytes, 7);

    // The stale lock is gone, so the log opens straight away.
    let log = Log::open(log_path(&dir)).unwrap();
    assert_eq!(log.stat().end_position, 5);
}

#[test]
fn test_scan_drops_bad_index_entries() {
    let dir = tempdir().unwrap();
    let config = Config {
        index_after_size: 64,
        ..Config::default()
    };
    let log = create_log(&dir, config);
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..20);
    writer.close().unwrap();
    log.close().unwrap();

    let index = segment_files(&log_path(&dir), ".index").pop().unwrap();
    let good_len = fs::metadata(&index).unwrap().len();
    assert!(good_len > 0);

    // An entry pointing into the middle of a frame.
    let mut bogus = Vec::new();
    bogus.extend_from_slice(&19u64.to_be_bytes());
    bogus.extend_from_slice(&13u64.to_be_bytes());
    bogus.extend_from_slice(&0i64.to_be_bytes());
    append_bytes(&index, &bogus);

    let report = Log::scan(log_path(&dir)).unwrap();
    assert_eq!(report.rewritten_indexes, 1);
    assert_eq!(fs::metadata(&index).unwrap().len(), good_len);
    assert!(Log::scan(log_path(&dir)).unwrap().is_clean());
}

#[test]
fn test_scan_refuses_damaged_sealed_segment() {
    let dir = tempdir().unwrap();
    let config = Config {
        segment_max_count: Some(5),
        ..Config::default()
    };
    let log = create_log(&dir, config);
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..12);
    writer.close().unwrap();
    log.close().unwrap();

    // The last frame of the first segment: nothing intact follows it there.
    let first = segment_files(&log_path(&dir), ".records").remove(0);
    let mut bytes = fs::read(&first).unwrap();
    bytes[4 * 24 + 12] ^= 0xff;
    fs::write(&first, &bytes).unwrap();

    let err = Log::scan(log_path(&dir)).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)), "got {err:?}");
}

#[test]
fn test_scan_leaves_damaged_record_with_intact_successors() {
    let dir = tempdir().unwrap();
    let config = Config {
        segment_max_count: Some(5),
        ..Config::default()
    };
    let log = create_log(&dir, config);
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..12);
    writer.close().unwrap();
    log.close().unwrap();

    let files = segment_files(&log_path(&dir), ".records");
    for (file, at) in [(&files[0], 24 + 12), (&files[2], 12)] {
        let mut bytes = fs::read(file).unwrap();
        bytes[at] ^= 0xff;
        fs::write(file, &bytes).unwrap();
    }
    let last_len = fs::metadata(&files[2]).unwrap().len();

    let report = Log::scan(log_path(&dir)).unwrap();
    assert_eq!(report.records, 10);
    assert_eq!(report.corrupt_records, 2);
    assert_eq!(report.truncated_bytes, 0);
    assert!(!report.is_clean());
    assert_eq!(fs::metadata(&files[2]).unwrap().len(), last_len);
}

#[test]
fn test_scan_of_missing_log() {
    let dir = tempdir().unwrap();
    let err = Log::scan(log_path(&dir)).unwrap_err();
    assert!(matches!(err, Error::NotExist), "got {err:?}");
}
