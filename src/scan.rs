//! Offline integrity check and repair.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flock::{Flock, LockError};
use crate::index::{self, IndexEntry, ENTRY_SIZE};
use crate::log::{CONFIG_FILENAME, LOCK_FILENAME, Log};
use crate::segment::{list_segments, ReadOutcome, SegmentDescriptor, SegmentReader};
use log::{info, warn};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// What [`Log::scan`] found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Segments examined.
    pub segments: usize,
    /// Intact records found.
    pub records: u64,
    /// Damaged records left in place because intact ones follow them.
    /// Readers report each as [`Error::CorruptRecord`] and move past it.
    pub corrupt_records: u64,
    /// Bytes cut from a torn or corrupt tail of the newest segment.
    pub truncated_bytes: u64,
    /// Index files rewritten because they held entries that did not point at
    /// a record boundary.
    pub rewritten_indexes: usize,
}

impl ScanReport {
    /// True when no damage was found.
    pub fn is_clean(&self) -> bool {
        self.corrupt_records == 0 && self.truncated_bytes == 0 && self.rewritten_indexes == 0
    }
}

/// Result of walking one segment's frames.
struct SegmentScan {
    records: u64,
    end_position: u64,
    end_offset: u64,
    /// Index entries that sit on a record boundary.
    valid_entries: Vec<IndexEntry>,
    index_entries: usize,
}

impl Log {
    /// Verify every frame and index entry of a closed log, repairing what
    /// can be repaired.
    ///
    /// A damaged record followed by intact ones is only counted. A damaged
    /// tail (a torn frame, or bad frames with nothing intact after them) is
    /// truncated in the newest segment and reported as [`Error::Corrupt`] in
    /// a sealed one, as is a gap between segments. Index entries that do not
    /// point at a record boundary are dropped. A stale lock left by a crash
    /// is cleared.
    pub fn scan(path: impl AsRef<Path>) -> Result<ScanReport> {
        let path = path.as_ref();
        let config = Config::load(&path.join(CONFIG_FILENAME))?;

        let mut lock = Flock::new(path.join(LOCK_FILENAME));
        match lock.acquire() {
            Ok(()) => {}
            Err(LockError::Orphaned) => {
                warn!("reclog: clearing stale lock on {}", path.display());
                lock.clear()?;
                acquire(&mut lock)?;
            }
            Err(e) => return Err(lock_error(e)),
        }

        let segments = list_segments(path)?;
        let mut report = ScanReport {
            segments: segments.len(),
            ..ScanReport::default()
        };

        for (i, desc) in segments.iter().enumerate() {
            let successor = segments.get(i + 1);
            let scan = scan_segment(path, desc, &config, successor.is_none(), &mut report)?;
            report.records += scan.records;

            if let Some(next) = successor
                && (scan.end_position, scan.end_offset) != (next.base_position, next.base_offset)
            {
                return Err(Error::Corrupt(format!(
                    "segment {} ends at position {} offset {}, but {} starts at position {} offset {}",
                    desc.name,
                    scan.end_position,
                    scan.end_offset,
                    next.name,
                    next.base_position,
                    next.base_offset
                )));
            }

            if scan.valid_entries.len() != scan.index_entries {
                rewrite_index(path, desc, &scan.valid_entries)?;
                report.rewritten_indexes += 1;
            }
        }

        lock.release()?;
        info!(
            "reclog: scanned {}: {} segments, {} records, {} bytes truncated, {} indexes rewritten",
            path.display(),
            report.segments,
            report.records,
            report.truncated_bytes,
            report.rewritten_indexes
        );
        Ok(report)
    }
}

fn acquire(lock: &mut Flock) -> Result<()> {
    lock.acquire().map_err(lock_error)
}

fn lock_error(e: LockError) -> Error {
    match e {
        LockError::Locked => Error::Locked,
        LockError::Orphaned => Error::Orphaned,
        LockError::Io(e) => e.into(),
    }
}

fn scan_segment(
    dir: &Path,
    desc: &SegmentDescriptor,
    config: &Config,
    is_last: bool,
    report: &mut ScanReport,
) -> Result<SegmentScan> {
    let entries = match std::fs::File::open(dir.join(desc.index_file())) {
        Ok(mut file) => index::read_entries(&mut file)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let index_entries = entries.len();
    let mut pending = entries.into_iter().peekable();
    let mut valid_entries = Vec::new();

    let mut reader = SegmentReader::open(dir, desc.clone(), 0, config.max_record_size as usize)?;
    let mut scratch = Vec::new();
    let mut records = 0;
    // Start of the damaged run not yet followed by an intact frame, and the
    // number of frames in it.
    let mut damaged: Option<((u64, u64), u64)> = None;
    let mut torn = false;

    loop {
        let (position, offset) = reader.tell();
        while let Some(entry) = pending.next_if(|e| e.position <= position) {
            if entry.position == position && entry.offset == offset {
                valid_entries.push(entry);
            }
        }

        match reader.read(&mut scratch)? {
            ReadOutcome::Record(_) => {
                records += 1;
                if let Some((_, run)) = damaged.take() {
                    report.corrupt_records += run;
                }
            }
            ReadOutcome::Corrupt(_) => {
                damaged.get_or_insert(((position, offset), 0)).1 += 1;
            }
            ReadOutcome::NeedFill => {
                if reader.fill(u64::MAX)? == 0 {
                    torn = !reader.is_drained();
                    break;
                }
            }
            ReadOutcome::EndOfSegment => break,
        }
    }

    let damage = match damaged {
        Some((start, _)) => Some((start, "corrupt record")),
        None if torn => Some((reader.tell(), "torn record")),
        None => None,
    };
    let (end_position, end_offset) = damage.map_or_else(|| reader.tell(), |(end, _)| end);
    valid_entries.retain(|e| e.offset <= end_offset);

    if let Some((_, what)) = damage {
        if !is_last {
            return Err(Error::Corrupt(format!(
                "{what} at position {end_position} in sealed segment {}",
                desc.name
            )));
        }

        let records_path = dir.join(desc.records_file());
        let file = OpenOptions::new().write(true).open(&records_path)?;
        let file_len = file.metadata()?.len();
        let valid_len = end_offset - desc.base_offset;
        warn!(
            "reclog: {what} at position {end_position} in {}, truncating {} bytes",
            desc.name,
            file_len - valid_len
        );
        file.set_len(valid_len)?;
        file.sync_all()?;
        report.truncated_bytes += file_len - valid_len;
    }

    Ok(SegmentScan {
        records,
        end_position,
        end_offset,
        valid_entries,
        index_entries,
    })
}

fn rewrite_index(dir: &Path, desc: &SegmentDescriptor, entries: &[IndexEntry]) -> Result<()> {
    warn!(
        "reclog: rewriting index of {} with {} entries",
        desc.name,
        entries.len()
    );
    let mut buf = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for entry in entries {
        entry.encode(&mut buf);
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dir.join(desc.index_file()))?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}
