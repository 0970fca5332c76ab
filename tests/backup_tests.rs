mod common;

use common::{create_log, log_path, payload, read_all, write_synced};
use flate2::read::GzDecoder;
use reclog::{Config, Error, Log, LogInfo, SyncMode};
use tempfile::tempdir;

fn entry_names(archive: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(GzDecoder::new(archive));
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

fn restore_and_read(archive: &[u8], dir: &tempfile::TempDir, name: &str) -> (LogInfo, Vec<Vec<u8>>) {
    let path = dir.path().join(name);
    Log::restore(&path, archive).unwrap();
    let log = Log::open(&path).unwrap();
    let mut reader = log.reader().open().unwrap();
    (log.stat(), read_all(&mut reader))
}

#[test]
fn test_backup_restore_round_trip() {
    let dir = tempdir().unwrap();
    let config = Config {
        segment_max_count: Some(10),
        index_after_size: 64,
        ..Config::default()
    };
    let log = create_log(&dir, config);
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..35);

    let mut archive = Vec::new();
    log.backup(&mut archive).unwrap();

    let names = entry_names(&archive);
    assert_eq!(names[0], "config");
    assert_eq!(names.len(), 1 + 2 * 4);

    let (info, records) = restore_and_read(&archive, &dir, "restored");
    assert_eq!(info, log.stat());
    assert_eq!(records, (0..35).map(payload).collect::<Vec<_>>());
}

#[test]
fn test_backup_of_live_log_stops_at_durable_end() {
    let dir = tempdir().unwrap();
    let config = Config {
        index_after_size: 64,
        ..Config::default()
    };
    let log = create_log(&dir, config);
    let mut writer = log.writer().sync_mode(SyncMode::Manual).open().unwrap();
    write_synced(&mut writer, 0..20);
    for i in 20..25 {
        writer.write(&payload(i)).unwrap();
    }
    writer.flush().unwrap();

    let mut archive = Vec::new();
    log.backup(&mut archive).unwrap();
    writer.sync().unwrap();

    let path = dir.path().join("restored");
    Log::restore(&path, archive.as_slice()).unwrap();
    let restored = Log::open(&path).unwrap();
    assert_eq!(restored.stat().end_position, 20);

    let mut restored_writer = restored.writer().open().unwrap();
    assert_eq!(restored_writer.tell(), (20, 20 * 24));
    write_synced(&mut restored_writer, 20..22);

    let mut reader = restored.reader().open().unwrap();
    assert_eq!(read_all(&mut reader), (0..22).map(payload).collect::<Vec<_>>());
}

#[test]
fn test_backup_keeps_retention_start() {
    let dir = tempdir().unwrap();
    let config = Config {
        segment_max_count: Some(10),
        log_max_count: Some(25),
        ..Config::default()
    };
    let log = create_log(&dir, config);
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..60);

    let mut archive = Vec::new();
    log.backup(&mut archive).unwrap();

    let (info, records) = restore_and_read(&archive, &dir, "restored");
    assert_eq!(info, log.stat());
    assert_eq!(info.start_position, 40);
    assert_eq!(records, (40..60).map(payload).collect::<Vec<_>>());
}

#[test]
fn test_backup_of_empty_log() {
    let dir = tempdir().unwrap();
    let log = create_log(&dir, Config::default());

    let mut archive = Vec::new();
    log.backup(&mut archive).unwrap();

    let (info, records) = restore_and_read(&archive, &dir, "restored");
    assert_eq!(info, log.stat());
    assert!(records.is_empty());
}

#[test]
fn test_restore_of_restore_is_identical() {
    let dir = tempdir().unwrap();
    let config = Config {
        segment_max_count: Some(7),
        ..Config::default()
    };
    let log = create_log(&dir, config);
    let mut writer = log.writer().open().unwrap();
    write_synced(&mut writer, 0..30);

    let mut first = Vec::new();
    log.backup(&mut first).unwrap();
    let path = dir.path().join("first");
    Log::restore(&path, first.as_slice()).unwrap();

    let mut second = Vec::new();
    {
        let restored = Log::open(&path).unwrap();
        restored.backup(&mut second).unwrap();
    }

    assert_eq!(entry_names(&first), entry_names(&second));
    let (info_a, records_a) = restore_and_read(&first, &dir, "a");
    let (info_b, records_b) = restore_and_read(&second, &dir, "b");
    assert_eq!(info_a, info_b);
    assert_eq!(records_a, records_b);
}

#[test]
fn test_restore_into_existing_directory_fails() {
    let dir = tempdir().unwrap();
    let log = create_log(&dir, Config::default());
    let mut archive = Vec::new();
    log.backup(&mut archive).unwrap();

    let err = Log::restore(log_path(&dir), archive.as_slice()).unwrap_err();
    assert!(matches!(err, Error::AlreadyExists), "got {err:?}");
}

#[test]
fn test_restore_of_garbage_leaves_nothing_behind() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("restored");

    assert!(Log::restore(&path, &b"not an archive"[..]).is_err());
    assert!(!path.exists());
}

#[test]
fn test_restore_rejects_foreign_entries() {
    let dir = tempdir().unwrap();

    let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
    ));
    let data = b"#!/bin/sh";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o755);
    builder
        .append_data(&mut header, "hooks/run.sh", &data[..])
        .unwrap();
    let archive = builder.into_inner().unwrap().finish().unwrap();

    let path = dir.path().join("restored");
    let err = Log::restore(&path, archive.as_slice()).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)), "got {err:?}");
    assert!(!path.exists());
}
