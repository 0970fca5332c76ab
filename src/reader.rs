//! Sequential readers over a log.

use crate::error::{Error, Result};
use crate::log::{IoMode, LogInfo, LogInner, Whence};
use crate::segment::{list_segments, ReadOutcome, SegmentDescriptor, SegmentReader};
use crate::subscription::Subscription;
use log::debug;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Builder returned by [`Log::reader`](crate::Log::reader).
pub struct LogReaderBuilder {
    log: Arc<LogInner>,
    buffer_size: usize,
    follow: bool,
    io_mode: IoMode,
}

impl LogReaderBuilder {
    pub(crate) fn new(log: Arc<LogInner>) -> Self {
        LogReaderBuilder {
            log,
            buffer_size: DEFAULT_BUFFER_SIZE,
            follow: false,
            io_mode: IoMode::Auto,
        }
    }

    /// Size of the read buffer. Raised to hold at least one maximum-size
    /// record.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Block at the end of durable data instead of returning
    /// [`Error::EndOfStream`].
    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn io_mode(mut self, mode: IoMode) -> Self {
        self.io_mode = mode;
        self
    }

    /// Open a reader positioned at the oldest retained record.
    pub fn open(self) -> Result<LogReader> {
        let subscription = self.log.subscribe();
        let info = match subscription.try_recv()? {
            Some(info) => info,
            None => self.log.stat(),
        };

        Ok(LogReader {
            max_payload: self.log.config.max_record_size as usize,
            log: self.log,
            buffer_size: self.buffer_size,
            follow: self.follow,
            io_mode: self.io_mode,
            segments: Vec::new(),
            current: None,
            segment: None,
            position: info.start_position,
            offset: info.start_offset,
            pending_fill: false,
            subscription,
            info,
            deadline: None,
            closed: false,
        })
    }
}

/// Closes a [`LogReader`] from another thread, waking it if it is blocked
/// waiting for data.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    subscription: Subscription,
}

impl CloseHandle {
    pub fn close(&self) {
        self.subscription.close();
    }
}

/// Reads records in position order.
///
/// A reader never returns data past the durable end published by the
/// writer. In follow mode it blocks there until more data is synced, the
/// deadline passes, or the reader is closed.
pub struct LogReader {
    log: Arc<LogInner>,
    buffer_size: usize,
    max_payload: usize,
    follow: bool,
    io_mode: IoMode,
    segments: Vec<SegmentDescriptor>,
    current: Option<usize>,
    segment: Option<SegmentReader>,
    position: u64,
    offset: u64,
    pending_fill: bool,
    subscription: Subscription,
    info: LogInfo,
    deadline: Option<Instant>,
    closed: bool,
}

impl LogReader {
    fn ensure_open(&self) -> Result<()> {
        if self.closed || self.subscription.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Read the next record into `out`, replacing its contents. Returns the
    /// encoded size of the record.
    ///
    /// # Errors
    ///
    /// - [`Error::EndOfStream`]: no more durable data (non-follow readers).
    /// - [`Error::Timeout`]: the deadline passed while following.
    /// - [`Error::MustFill`]: [`IoMode::Manual`] and the buffer is empty.
    /// - [`Error::CorruptRecord`]: the record failed its checksum; the
    ///   reader has moved past it.
    /// - [`Error::OutOfRange`]: the cursor fell behind retention.
    pub fn read(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        self.ensure_open()?;

        loop {
            if self.pending_fill {
                if self.io_mode == IoMode::Manual {
                    return Err(Error::MustFill);
                }
                self.fill()?;
            }

            if self.segment.is_none() && !self.open_next_segment()? {
                self.pending_fill = true;
                continue;
            }
            let Some(segment) = self.segment.as_mut() else {
                continue;
            };

            match segment.read(out)? {
                ReadOutcome::Record(len) => {
                    self.position += 1;
                    self.offset += len as u64;
                    return Ok(len);
                }
                ReadOutcome::Corrupt(len) => {
                    let position = self.position;
                    self.position += 1;
                    self.offset += len as u64;
                    debug!("reclog: skipped corrupt record at position {position}");
                    return Err(Error::CorruptRecord {
                        position,
                        size: len,
                    });
                }
                ReadOutcome::NeedFill => self.pending_fill = true,
                ReadOutcome::EndOfSegment => {
                    debug!(
                        "reclog: reader finished segment {}",
                        segment.descriptor().name
                    );
                    self.segment = None;
                }
            }
        }
    }

    /// Wait until durable data exists past the cursor, then pull it into the
    /// buffer.
    pub fn fill(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.wait_for_data()?;

        if let Some(segment) = self.segment.as_mut() {
            let base = segment.descriptor().base_offset;
            let limit = self.info.end_offset.saturating_sub(base);
            let n = segment.fill(limit)?;
            if n == 0 {
                if !segment.is_drained() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "segment {} ends inside a record",
                            segment.descriptor().name
                        ),
                    )
                    .into());
                }
                // Durable data lies beyond this segment: it has been sealed
                // at the cursor.
                segment.set_end(self.offset);
            }
        }

        self.pending_fill = false;
        Ok(())
    }

    fn refresh_info(&mut self) -> Result<()> {
        if let Some(info) = self.subscription.try_recv()? {
            self.info = info;
        }
        Ok(())
    }

    fn wait_for_data(&mut self) -> Result<()> {
        self.refresh_info()?;
        while self.position >= self.info.end_position {
            if !self.follow {
                return Err(Error::EndOfStream);
            }
            self.info = self.subscription.recv(self.deadline)?;
        }
        Ok(())
    }

    /// Open the segment starting at the cursor. Returns false when it does
    /// not exist yet.
    fn open_next_segment(&mut self) -> Result<bool> {
        let next = self.current.map_or(0, |i| i + 1);
        let index = match self.segments.get(next) {
            Some(desc) if desc.base_position == self.position => Some(next),
            _ => {
                self.segments = list_segments(&self.log.path)?;
                self.current = None;
                match self.segments.first() {
                    None => return Ok(false),
                    Some(first) if self.position < first.base_position => {
                        return Err(Error::OutOfRange);
                    }
                    Some(_) => {}
                }
                self.segments
                    .iter()
                    .position(|d| d.base_position == self.position)
            }
        };

        let Some(index) = index else {
            if self.position < self.info.end_position {
                return Err(Error::OutOfRange);
            }
            return Ok(false);
        };
        let segment = self.open_segment(index)?;
        debug!(
            "reclog: reader entered segment {}",
            segment.descriptor().name
        );
        self.segment = Some(segment);
        self.current = Some(index);
        Ok(true)
    }

    fn open_segment(&self, index: usize) -> Result<SegmentReader> {
        let desc = self.segments[index].clone();
        let mut segment =
            match SegmentReader::open(&self.log.path, desc, self.buffer_size, self.max_payload) {
                Ok(segment) => segment,
                // Retention removed it since the listing.
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::OutOfRange),
                Err(e) => return Err(e.into()),
            };
        if let Some(successor) = self.segments.get(index + 1) {
            segment.set_end(successor.base_offset);
        }
        Ok(segment)
    }

    /// Move the cursor to `offset` records relative to `whence`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if the target lies outside the retained,
    /// durable range `[start_position, end_position]`.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<()> {
        self.ensure_open()?;
        self.refresh_info()?;

        let reference = match whence {
            Whence::Origin => 0,
            Whence::Start => self.info.start_position,
            Whence::Current => self.position,
            Whence::End => self.info.end_position,
        };
        let target = reference
            .checked_add_signed(offset)
            .ok_or(Error::OutOfRange)?;
        if target < self.info.start_position || target > self.info.end_position {
            return Err(Error::OutOfRange);
        }

        self.seek_position(target)
    }

    fn seek_position(&mut self, target: u64) -> Result<()> {
        self.segments = list_segments(&self.log.path)?;
        self.current = None;
        self.segment = None;

        let index = self
            .segments
            .partition_point(|d| d.base_position <= target)
            .checked_sub(1)
            .ok_or(Error::OutOfRange)?;
        let mut segment = self.open_segment(index)?;

        let limit = self
            .info
            .end_offset
            .saturating_sub(segment.descriptor().base_offset);
        if !segment.seek_position(&self.log.path, target, limit)? {
            return Err(Error::OutOfRange);
        }

        (self.position, self.offset) = segment.tell();
        self.segment = Some(segment);
        self.current = Some(index);
        self.pending_fill = false;
        debug!("reclog: reader seeked to position {target}");
        Ok(())
    }

    /// `(position, offset)` of the next record to be read.
    pub fn tell(&self) -> (u64, u64) {
        (self.position, self.offset)
    }

    /// Bound follow-mode waits. `None` waits indefinitely.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// A handle that closes this reader from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            subscription: self.subscription.clone(),
        }
    }

    /// Stop reading and unsubscribe. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.segment = None;
        self.log.unsubscribe(&self.subscription);
        self.subscription.close();
        Ok(())
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for LogReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogReader")
            .field("path", &self.log.path)
            .field("follow", &self.follow)
            .field("io_mode", &self.io_mode)
            .field("position", &self.position)
            .field("offset", &self.offset)
            .field("closed", &self.closed)
            .finish()
    }
}
