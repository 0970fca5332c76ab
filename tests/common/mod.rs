#![allow(dead_code)]

use reclog::{Clock, Config, Log, LogReader, LogWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// A clock the test moves by hand.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Arc<Self> {
        Arc::new(ManualClock(AtomicI64::new(now)))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn log_path(dir: &TempDir) -> PathBuf {
    dir.path().join("log")
}

pub fn create_log(dir: &TempDir, config: Config) -> Log {
    Log::create(log_path(dir), config).unwrap()
}

pub fn payload(i: u64) -> Vec<u8> {
    format!("record-{i:05}").into_bytes()
}

/// Write records `range` and make them durable.
pub fn write_synced(writer: &mut LogWriter, range: std::ops::Range<u64>) {
    for i in range {
        writer.write(&payload(i)).unwrap();
    }
    writer.flush().unwrap();
    writer.sync().unwrap();
}

/// Read everything up to the end of durable data.
pub fn read_all(reader: &mut LogReader) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    loop {
        match reader.read(&mut record) {
            Ok(_) => records.push(record.clone()),
            Err(reclog::Error::EndOfStream) => return records,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
}

pub fn segment_files(path: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().ends_with(suffix))
        .collect();
    files.sort();
    files
}

pub fn segment_count(path: &Path) -> usize {
    segment_files(path, ".records").len()
}
