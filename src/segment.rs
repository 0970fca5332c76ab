//! On-disk segments: naming, inventory, and buffered frame I/O.
//!
//! A segment is a `.records` file of concatenated frames plus a sparse
//! `.index` file. Its base position, base offset and creation timestamp are
//! encoded in the file name, so the inventory is rebuilt from a directory
//! listing alone.

use crate::config::Config;
use crate::index::{self, IndexEntry, ENTRY_SIZE};
use crate::record::{self, Frame};
use log::warn;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub(crate) const RECORDS_SUFFIX: &str = ".records";
pub(crate) const INDEX_SUFFIX: &str = ".index";
const SEGMENT_PREFIX: &str = "segment-";

/// Identity of a segment, parsed from its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentDescriptor {
    pub name: String,
    pub base_position: u64,
    pub base_offset: u64,
    pub base_timestamp: i64,
}

impl SegmentDescriptor {
    pub fn new(base_position: u64, base_offset: u64, base_timestamp: i64) -> Self {
        SegmentDescriptor {
            name: segment_name(base_position, base_offset, base_timestamp),
            base_position,
            base_offset,
            base_timestamp,
        }
    }

    pub fn records_file(&self) -> String {
        format!("{}{RECORDS_SUFFIX}", self.name)
    }

    pub fn index_file(&self) -> String {
        format!("{}{INDEX_SUFFIX}", self.name)
    }
}

pub(crate) fn segment_name(position: u64, offset: u64, timestamp: i64) -> String {
    format!("{SEGMENT_PREFIX}{position:020}-{offset:020}-{timestamp:020}")
}

pub(crate) fn parse_segment_name(name: &str) -> Option<SegmentDescriptor> {
    let rest = name.strip_prefix(SEGMENT_PREFIX)?;
    let mut parts = rest.splitn(3, '-');
    let base_position = parts.next()?.parse().ok()?;
    let base_offset = parts.next()?.parse().ok()?;
    let base_timestamp = parts.next()?.parse().ok()?;
    Some(SegmentDescriptor {
        name: name.to_string(),
        base_position,
        base_offset,
        base_timestamp,
    })
}

/// List the segments in `dir`, ordered by base position.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<SegmentDescriptor>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(RECORDS_SUFFIX) else {
            continue;
        };
        if let Some(desc) = parse_segment_name(stem) {
            segments.push(desc);
        }
    }
    segments.sort_by_key(|d| d.base_position);
    Ok(segments)
}

/// Remove both files of a segment. Returns false if it was already gone.
pub(crate) fn delete_segment(dir: &Path, desc: &SegmentDescriptor) -> io::Result<bool> {
    let existed = remove_if_exists(&dir.join(desc.records_file()))?;
    remove_if_exists(&dir.join(desc.index_file()))?;
    Ok(existed)
}

/// Fsync both files of a segment. A segment deleted in the meantime is
/// skipped.
pub(crate) fn sync_segment(dir: &Path, desc_name: &str) -> io::Result<()> {
    for suffix in [RECORDS_SUFFIX, INDEX_SUFFIX] {
        let path = dir.join(format!("{desc_name}{suffix}"));
        match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file.sync_all()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub(crate) fn sync_directory(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Outcome of [`SegmentWriter::append`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Append {
    Written(usize),
    /// The write buffer has no room; flush and retry.
    BufferFull,
    /// The segment reached one of its limits; seal it and roll.
    SegmentFull,
}

/// Appender for the current segment.
///
/// Frames accumulate in an in-memory buffer and reach the records file only
/// on [`flush`](Self::flush). Index entries are buffered the same way and
/// written after the records they point into.
pub(crate) struct SegmentWriter {
    desc: SegmentDescriptor,
    records: File,
    index: File,
    buffer: Vec<u8>,
    buffer_size: usize,
    index_buffer: Vec<u8>,
    config: Config,
    position: u64,
    offset: u64,
    count: u64,
    size: u64,
    unindexed: u64,
}

impl SegmentWriter {
    /// Create the files of a brand-new segment.
    pub fn create(
        dir: &Path,
        desc: SegmentDescriptor,
        config: Config,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let records = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(dir.join(desc.records_file()))?;
        let index = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(dir.join(desc.index_file()))?;

        Ok(SegmentWriter {
            position: desc.base_position,
            offset: desc.base_offset,
            desc,
            records,
            index,
            buffer: Vec::with_capacity(write_buffer_size(&config, buffer_size)),
            buffer_size: write_buffer_size(&config, buffer_size),
            index_buffer: Vec::new(),
            config,
            count: 0,
            size: 0,
            unindexed: 0,
        })
    }

    /// Reopen an existing segment for appending.
    ///
    /// The tail is scanned from the last usable index entry. A damaged frame
    /// followed by intact ones stays in place for readers to skip. What is
    /// cut off is the trailing run that holds no intact frame: a torn last
    /// frame, damaged frames up to the end of the file, and index entries
    /// pointing past the surviving data.
    pub fn open(
        dir: &Path,
        desc: SegmentDescriptor,
        config: Config,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let records = OpenOptions::new()
            .read(true)
            .append(true)
            .open(dir.join(desc.records_file()))?;
        let mut index = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(dir.join(desc.index_file()))?;

        let file_len = records.metadata()?.len();
        let entries = index::read_entries(&mut index)?;
        let mut usable: Vec<IndexEntry> = entries
            .into_iter()
            .take_while(|e| {
                e.position >= desc.base_position
                    && e.offset >= desc.base_offset
                    && e.offset - desc.base_offset <= file_len
            })
            .collect();

        let mut reader = SegmentReader::from_file(
            desc.clone(),
            records.try_clone()?,
            buffer_size,
            config.max_record_size as usize,
        );
        reader.seek_to_entry(index::floor(&usable, u64::MAX))?;
        let mut scratch = Vec::new();
        // Start of the damaged run not yet followed by an intact frame.
        let mut damaged = None;
        loop {
            let before = reader.tell();
            match reader.read(&mut scratch)? {
                ReadOutcome::Record(_) => damaged = None,
                ReadOutcome::Corrupt(_) => {
                    damaged.get_or_insert(before);
                }
                ReadOutcome::NeedFill => {
                    if reader.fill(u64::MAX)? == 0 {
                        break;
                    }
                }
                ReadOutcome::EndOfSegment => break,
            }
        }
        let (position, offset) = damaged.unwrap_or_else(|| reader.tell());
        let valid_len = offset - desc.base_offset;

        if valid_len < file_len {
            warn!(
                "segment {}: truncating {} bytes of torn tail",
                desc.name,
                file_len - valid_len
            );
            records.set_len(valid_len)?;
        }

        usable.retain(|e| e.offset <= offset && e.position <= position);
        let index_len = (usable.len() * ENTRY_SIZE) as u64;
        if index.metadata()?.len() != index_len {
            index.set_len(index_len)?;
        }

        let last_indexed = usable.last().map_or(desc.base_offset, |e| e.offset);
        let buffer_size = write_buffer_size(&config, buffer_size);

        Ok(SegmentWriter {
            count: position - desc.base_position,
            size: valid_len,
            unindexed: offset - last_indexed,
            position,
            offset,
            desc,
            records,
            index,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            index_buffer: Vec::new(),
            config,
        })
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.desc
    }

    /// Log-wide `(position, offset)` after the last appended record,
    /// buffered ones included.
    pub fn tell(&self) -> (u64, u64) {
        (self.position, self.offset)
    }

    /// Number of records in the segment, buffered ones included.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn append(&mut self, payload: &[u8], now: i64) -> Append {
        let len = record::encoded_len(payload.len());

        if self.count > 0 && self.is_full(len as u64, now) {
            return Append::SegmentFull;
        }
        if self.buffer.len() + len > self.buffer_size {
            return Append::BufferFull;
        }

        if self.count > 0 && self.unindexed >= self.config.index_after_size {
            IndexEntry {
                position: self.position,
                offset: self.offset,
                timestamp: now,
            }
            .encode(&mut self.index_buffer);
            self.unindexed = 0;
        }

        record::encode(&mut self.buffer, payload);
        self.position += 1;
        self.offset += len as u64;
        self.count += 1;
        self.size += len as u64;
        self.unindexed += len as u64;
        Append::Written(len)
    }

    fn is_full(&self, len: u64, now: i64) -> bool {
        if let Some(max) = self.config.segment_max_count
            && self.count >= max
        {
            return true;
        }
        if let Some(max) = self.config.segment_max_size
            && self.size + len > max
        {
            return true;
        }
        if let Some(max) = self.config.segment_max_age
            && now.saturating_sub(self.desc.base_timestamp) >= max as i64
        {
            return true;
        }
        false
    }

    /// Hand buffered frames and index entries to the OS. No fsync.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.records.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        if !self.index_buffer.is_empty() {
            self.index.write_all(&self.index_buffer)?;
            self.index_buffer.clear();
        }
        Ok(())
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn close(mut self) -> io::Result<SegmentDescriptor> {
        self.flush()?;
        Ok(self.desc)
    }
}

/// The write buffer must hold at least one maximum-size frame, otherwise a
/// large record could never be written.
fn write_buffer_size(config: &Config, requested: usize) -> usize {
    requested.max(record::encoded_len(config.max_record_size as usize))
}

/// Outcome of [`SegmentReader::read`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Record(usize),
    /// A damaged frame of this size was skipped.
    Corrupt(usize),
    /// The buffer holds no complete frame; fill it.
    NeedFill,
    /// The cursor reached the known end of this segment.
    EndOfSegment,
}

/// Buffered frame reader over one records file.
pub(crate) struct SegmentReader {
    desc: SegmentDescriptor,
    file: File,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    file_pos: u64,
    position: u64,
    offset: u64,
    end_offset: Option<u64>,
    max_payload: usize,
}

impl SegmentReader {
    pub fn open(
        dir: &Path,
        desc: SegmentDescriptor,
        buffer_size: usize,
        max_payload: usize,
    ) -> io::Result<Self> {
        let file = File::open(dir.join(desc.records_file()))?;
        Ok(Self::from_file(desc, file, buffer_size, max_payload))
    }

    fn from_file(
        desc: SegmentDescriptor,
        file: File,
        buffer_size: usize,
        max_payload: usize,
    ) -> Self {
        let capacity = buffer_size.max(record::encoded_len(max_payload));
        SegmentReader {
            position: desc.base_position,
            offset: desc.base_offset,
            desc,
            file,
            buf: vec![0; capacity],
            start: 0,
            end: 0,
            file_pos: 0,
            end_offset: None,
            max_payload,
        }
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.desc
    }

    pub fn tell(&self) -> (u64, u64) {
        (self.position, self.offset)
    }

    /// Declare the log offset at which this segment ends (the base offset of
    /// its successor).
    pub fn set_end(&mut self, end_offset: u64) {
        self.end_offset = Some(end_offset);
    }

    /// True when every byte pulled from the file has been decoded.
    pub fn is_drained(&self) -> bool {
        self.start == self.end
    }

    pub fn read(&mut self, out: &mut Vec<u8>) -> io::Result<ReadOutcome> {
        match record::decode(&self.buf[self.start..self.end], self.max_payload) {
            Frame::Complete { payload, len } => {
                out.clear();
                out.extend_from_slice(payload);
                self.start += len;
                self.advance(len);
                Ok(ReadOutcome::Record(len))
            }
            Frame::Corrupt { len } => {
                self.skip(len)?;
                self.advance(len);
                Ok(ReadOutcome::Corrupt(len))
            }
            Frame::Incomplete => {
                if self.is_drained() && self.end_offset == Some(self.offset) {
                    Ok(ReadOutcome::EndOfSegment)
                } else {
                    Ok(ReadOutcome::NeedFill)
                }
            }
        }
    }

    fn advance(&mut self, len: usize) {
        self.position += 1;
        self.offset += len as u64;
    }

    fn skip(&mut self, len: usize) -> io::Result<()> {
        let buffered = self.end - self.start;
        if len <= buffered {
            self.start += len;
            return Ok(());
        }
        let remaining = (len - buffered) as u64;
        self.start = 0;
        self.end = 0;
        self.file.seek(SeekFrom::Current(remaining as i64))?;
        self.file_pos += remaining;
        Ok(())
    }

    /// Pull more bytes from the file, never past segment-local byte `limit`.
    /// Returns the number of bytes read; zero means nothing more is
    /// available right now.
    pub fn fill(&mut self, limit: u64) -> io::Result<usize> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        let room = (self.buf.len() - self.end) as u64;
        let want = room.min(limit.saturating_sub(self.file_pos)) as usize;
        if want == 0 {
            return Ok(0);
        }

        let n = loop {
            match self.file.read(&mut self.buf[self.end..self.end + want]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.end += n;
        self.file_pos += n as u64;
        Ok(n)
    }

    /// Reposition at an index entry (or the segment base when `None`),
    /// discarding buffered bytes.
    fn seek_to_entry(&mut self, entry: Option<IndexEntry>) -> io::Result<()> {
        let (position, offset) = match entry {
            Some(e) => (e.position, e.offset),
            None => (self.desc.base_position, self.desc.base_offset),
        };
        let local = offset - self.desc.base_offset;
        self.file.seek(SeekFrom::Start(local))?;
        self.file_pos = local;
        self.start = 0;
        self.end = 0;
        self.position = position;
        self.offset = offset;
        Ok(())
    }

    /// Move the cursor to `target`, using the sparse index to skip ahead and
    /// decoding forward from there. `limit` is the segment-local byte bound
    /// for reads. Returns false if the segment ends before `target`.
    pub fn seek_position(&mut self, dir: &Path, target: u64, limit: u64) -> io::Result<bool> {
        let entries = match File::open(dir.join(self.desc.index_file())) {
            Ok(mut file) => index::read_entries(&mut file)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let entry = index::floor(&entries, target)
            .filter(|e| e.offset >= self.desc.base_offset && e.position >= self.desc.base_position);
        self.seek_to_entry(entry)?;

        let mut scratch = Vec::new();
        while self.position < target {
            match self.read(&mut scratch)? {
                ReadOutcome::Record(_) | ReadOutcome::Corrupt(_) => {}
                ReadOutcome::NeedFill => {
                    if self.fill(limit)? == 0 {
                        return Ok(false);
                    }
                }
                ReadOutcome::EndOfSegment => return Ok(false),
            }
        }
        Ok(true)
    }
}
