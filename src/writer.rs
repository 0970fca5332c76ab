//! The single appender of a log.
//!
//! Appends go into the current segment's buffer; `flush` hands them to the
//! OS, applies retention and schedules a sync. Two background threads
//! support the writer: a syncer that fsyncs dirty files and publishes the new
//! durable end, and an expirer that applies the age-based retention limit
//! once per second.

use crate::error::{Error, Result};
use crate::log::{IoMode, LogInfo, LogInner, SyncMode};
use crate::segment::{
    delete_segment, list_segments, sync_directory, sync_segment, Append, SegmentDescriptor,
    SegmentWriter,
};
use log::{debug, error};
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::mpsc::{self, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const EXPIRE_INTERVAL: Duration = Duration::from_secs(1);

/// Once this many sealed segments are waiting for fsync, `flush` syncs on
/// the caller's thread instead of queueing a sync.
const MAX_DIRTY_SEGMENTS: usize = 50;

/// Longest path through the write state machine: full buffer, flush, full
/// segment, flush, then roll and append.
const MAX_WRITE_STEPS: usize = 5;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Called with errors raised by the background syncer or expirer.
pub type ErrorHandler = Box<dyn Fn(Error) + Send + Sync>;

/// Called with the new durable end position after every sync.
pub type SyncHandler = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
pub(crate) struct WriterOptions {
    pub buffer_size: usize,
    pub sync_mode: SyncMode,
    pub io_mode: IoMode,
    pub on_error: Option<ErrorHandler>,
    pub on_sync: Option<SyncHandler>,
}

/// Builder returned by [`Log::writer`](crate::Log::writer).
pub struct LogWriterBuilder {
    log: Arc<LogInner>,
    options: WriterOptions,
}

impl LogWriterBuilder {
    pub(crate) fn new(log: Arc<LogInner>) -> Self {
        LogWriterBuilder {
            log,
            options: WriterOptions {
                buffer_size: DEFAULT_BUFFER_SIZE,
                ..WriterOptions::default()
            },
        }
    }

    /// Size of the write buffer. Raised to hold at least one maximum-size
    /// record.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.options.buffer_size = size;
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.options.sync_mode = mode;
        self
    }

    pub fn io_mode(mut self, mode: IoMode) -> Self {
        self.options.io_mode = mode;
        self
    }

    /// Receive background failures instead of having them end the writer.
    pub fn on_error(mut self, handler: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.options.on_error = Some(Box::new(handler));
        self
    }

    /// Observe every durable end position the writer publishes.
    pub fn on_sync(mut self, handler: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.options.on_sync = Some(Box::new(handler));
        self
    }

    /// Open the writer.
    ///
    /// # Errors
    ///
    /// [`Error::WriterAlreadyOpen`] if another writer on this log is still
    /// open.
    pub fn open(self) -> Result<LogWriter> {
        LogWriter::open(self.log, self.options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Ready,
    /// The buffer must reach the OS before the next append; roll afterwards
    /// if the segment is full too.
    PendingFlush { then_roll: bool },
    PendingRoll,
}

struct Inventory {
    segments: Vec<SegmentDescriptor>,
    info: LogInfo,
}

/// Files changed since the last sync, and the progress a sync will publish.
#[derive(Default)]
struct Dirty {
    current: Option<String>,
    current_dirty: bool,
    directory_dirty: bool,
    sealed: Vec<String>,
    flushed_position: u64,
    flushed_offset: u64,
}

/// Writer state reachable from the background threads.
struct Shared {
    log: Arc<LogInner>,
    sync_mode: SyncMode,
    inventory: Mutex<Inventory>,
    dirty: Mutex<Dirty>,
    on_error: Option<ErrorHandler>,
    on_sync: Option<SyncHandler>,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn check(&self) -> Result<()> {
        match &*self.failure.lock() {
            Some(reason) => Err(Error::WriterFailed(reason.clone())),
            None => Ok(()),
        }
    }

    /// Route a background failure. Returns false when the task must stop.
    fn report(&self, task: &str, err: Error) -> bool {
        if let Some(handler) = &self.on_error {
            handler(err);
            return true;
        }
        error!(
            "reclog: {} failed for {}: {}",
            task,
            self.log.path.display(),
            err
        );
        *self.failure.lock() = Some(format!("{task}: {err}"));
        false
    }

    fn tracks_dirty(&self) -> bool {
        self.sync_mode != SyncMode::Unsafe
    }

    /// fsync everything flushed so far and publish the durable end.
    fn sync(&self) -> Result<()> {
        if !self.tracks_dirty() {
            return Ok(());
        }
        let _guard = self.log.sync_lock.lock();

        let dirty = {
            let mut dirty = self.dirty.lock();
            let snapshot = Dirty {
                current: dirty.current.clone(),
                current_dirty: dirty.current_dirty,
                directory_dirty: dirty.directory_dirty,
                sealed: mem::take(&mut dirty.sealed),
                flushed_position: dirty.flushed_position,
                flushed_offset: dirty.flushed_offset,
            };
            dirty.current_dirty = false;
            dirty.directory_dirty = false;
            snapshot
        };

        let path = &self.log.path;
        for name in &dirty.sealed {
            sync_segment(path, name)?;
        }
        if dirty.directory_dirty {
            sync_directory(path)?;
        }
        if dirty.current_dirty
            && let Some(name) = &dirty.current
        {
            sync_segment(path, name)?;
        }

        self.publish_end(dirty.flushed_position, dirty.flushed_offset);
        debug!(
            "reclog: synced {} up to position {}",
            path.display(),
            dirty.flushed_position
        );
        Ok(())
    }

    fn publish_end(&self, position: u64, offset: u64) {
        let info = {
            let mut inventory = self.inventory.lock();
            if position < inventory.info.end_position {
                return;
            }
            inventory.info.end_position = position;
            inventory.info.end_offset = offset;
            inventory.info
        };
        self.log.notify(info);
        if let Some(handler) = &self.on_sync {
            handler(position);
        }
    }

    /// Delete the oldest sealed segments for which `expired` holds, stopping
    /// at the first one that does not. The newest segment is never deleted.
    fn expire(&self, expired: impl Fn(&SegmentDescriptor) -> bool) -> Result<()> {
        let mut inventory = self.inventory.lock();
        let sealed = inventory.segments.len().saturating_sub(1);
        let count = inventory.segments[..sealed]
            .iter()
            .take_while(|d| expired(d))
            .count();
        if count == 0 {
            return Ok(());
        }

        for desc in &inventory.segments[..count] {
            delete_segment(&self.log.path, desc)?;
            debug!("reclog: expired segment {}", desc.name);
        }
        inventory.segments.drain(..count);
        if self.tracks_dirty() {
            self.dirty.lock().directory_dirty = true;
        }

        let first = inventory.segments[0].clone();
        inventory.info.start_position = first.base_position;
        inventory.info.start_offset = first.base_offset;
        inventory.info.start_timestamp = first.base_timestamp;
        let info = inventory.info;
        drop(inventory);

        self.log.notify(info);
        Ok(())
    }

    fn enforce_max_count(&self, position: u64) -> Result<()> {
        match self.log.config.log_max_count {
            Some(max) => {
                let cutoff = position.saturating_sub(max);
                self.expire(|d| d.base_position < cutoff)
            }
            None => Ok(()),
        }
    }

    fn enforce_max_size(&self, offset: u64) -> Result<()> {
        match self.log.config.log_max_size {
            Some(max) => {
                let cutoff = offset.saturating_sub(max);
                self.expire(|d| d.base_offset < cutoff)
            }
            None => Ok(()),
        }
    }

    fn enforce_max_age(&self) -> Result<()> {
        match self.log.config.log_max_age {
            Some(max) => {
                let cutoff = self.log.clock.now().saturating_sub(max as i64);
                self.expire(|d| d.base_timestamp < cutoff)
            }
            None => Ok(()),
        }
    }
}

/// Appends records to a [`Log`](crate::Log).
///
/// Only one writer may be open per log. Dropping the writer closes it.
pub struct LogWriter {
    shared: Arc<Shared>,
    io_mode: IoMode,
    buffer_size: usize,
    segment: Option<SegmentWriter>,
    state: WriteState,
    position: u64,
    offset: u64,
    sync_requests: Option<SyncSender<()>>,
    syncer: Option<JoinHandle<()>>,
    stop_expirer: Option<Sender<()>>,
    expirer: Option<JoinHandle<()>>,
    closed: bool,
}

impl LogWriter {
    pub(crate) fn open(log: Arc<LogInner>, options: WriterOptions) -> Result<Self> {
        log.claim_writer()?;
        match Self::start(Arc::clone(&log), options) {
            Ok(writer) => Ok(writer),
            Err(e) => {
                log.release_writer();
                Err(e)
            }
        }
    }

    fn start(log: Arc<LogInner>, options: WriterOptions) -> Result<Self> {
        let mut segments = list_segments(&log.path)?;
        let segment = match segments.last() {
            Some(last) => {
                SegmentWriter::open(&log.path, last.clone(), log.config, options.buffer_size)?
            }
            None => {
                let desc = SegmentDescriptor::new(0, 0, log.clock.now());
                let segment =
                    SegmentWriter::create(&log.path, desc.clone(), log.config, options.buffer_size)?;
                sync_directory(&log.path)?;
                segments.push(desc);
                segment
            }
        };

        let (position, offset) = segment.tell();
        let first = &segments[0];
        let info = LogInfo {
            start_position: first.base_position,
            start_offset: first.base_offset,
            start_timestamp: first.base_timestamp,
            end_position: position,
            end_offset: offset,
        };
        debug!(
            "reclog: writer opened on {} at position {} ({} segments)",
            log.path.display(),
            position,
            segments.len()
        );

        let shared = Arc::new(Shared {
            sync_mode: options.sync_mode,
            inventory: Mutex::new(Inventory { segments, info }),
            dirty: Mutex::new(Dirty {
                current: Some(segment.descriptor().name.clone()),
                flushed_position: position,
                flushed_offset: offset,
                ..Dirty::default()
            }),
            on_error: options.on_error,
            on_sync: options.on_sync,
            failure: Mutex::new(None),
            log,
        });
        shared.log.notify(info);

        let (sync_requests, syncer) = spawn_syncer(Arc::clone(&shared))?;
        let (stop_expirer, expirer) = spawn_expirer(Arc::clone(&shared))?;

        Ok(LogWriter {
            shared,
            io_mode: options.io_mode,
            buffer_size: options.buffer_size,
            segment: Some(segment),
            state: WriteState::Ready,
            position,
            offset,
            sync_requests: Some(sync_requests),
            syncer: Some(syncer),
            stop_expirer: Some(stop_expirer),
            expirer: Some(expirer),
            closed: false,
        })
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.shared.check()
    }

    /// Append one record and return its encoded size.
    ///
    /// The record is buffered; it becomes visible to readers once flushed
    /// and (outside [`SyncMode::Unsafe`]) synced.
    ///
    /// # Errors
    ///
    /// [`Error::RecordTooLarge`] if the payload exceeds `max_record_size`,
    /// and [`Error::MustFlush`] in [`IoMode::Manual`] when the buffer or
    /// segment is full.
    pub fn write(&mut self, payload: &[u8]) -> Result<usize> {
        self.ensure_usable()?;

        let max = self.shared.log.config.max_record_size as usize;
        if payload.len() > max {
            return Err(Error::RecordTooLarge {
                size: payload.len(),
                max,
            });
        }

        // An emptied buffer and a fresh segment always take a record within
        // `max_record_size`, so the last step appends.
        for _ in 0..MAX_WRITE_STEPS {
            match self.state {
                WriteState::PendingFlush { .. } => {
                    if self.io_mode == IoMode::Manual {
                        return Err(Error::MustFlush);
                    }
                    self.flush()?;
                    continue;
                }
                WriteState::PendingRoll => {
                    self.roll()?;
                    self.state = WriteState::Ready;
                }
                WriteState::Ready => {}
            }

            let now = self.shared.log.clock.now();
            let segment = self.segment.as_mut().ok_or(Error::Closed)?;
            match segment.append(payload, now) {
                Append::Written(len) => {
                    self.position += 1;
                    self.offset += len as u64;
                    return Ok(len);
                }
                Append::BufferFull => {
                    self.state = WriteState::PendingFlush { then_roll: false };
                }
                Append::SegmentFull => {
                    self.state = WriteState::PendingFlush { then_roll: true };
                }
            }
        }

        Err(Error::WriterFailed(format!(
            "record of {} bytes not appended after {MAX_WRITE_STEPS} steps",
            payload.len()
        )))
    }

    /// Hand buffered records to the OS, apply retention and schedule a sync
    /// according to the sync mode.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let segment = self.segment.as_mut().ok_or(Error::Closed)?;
        segment.flush()?;

        self.state = match self.state {
            WriteState::PendingFlush { then_roll: true } | WriteState::PendingRoll => {
                WriteState::PendingRoll
            }
            _ => WriteState::Ready,
        };

        self.shared.enforce_max_count(self.position)?;
        self.shared.enforce_max_size(self.offset)?;
        self.shared.enforce_max_age()?;

        if !self.shared.tracks_dirty() {
            self.shared.publish_end(self.position, self.offset);
            return Ok(());
        }

        let force = {
            let mut dirty = self.shared.dirty.lock();
            dirty.current_dirty = true;
            dirty.flushed_position = self.position;
            dirty.flushed_offset = self.offset;
            dirty.sealed.len() >= MAX_DIRTY_SEGMENTS
        };
        self.request_sync(force)
    }

    fn request_sync(&self, force: bool) -> Result<()> {
        let Some(requests) = &self.sync_requests else {
            return Err(Error::Closed);
        };
        if force {
            debug!("reclog: too many unsynced segments, syncing inline");
            return self.shared.sync();
        }
        if self.shared.sync_mode == SyncMode::Auto {
            match requests.try_send(()) {
                // A queued request will pick up this flush too.
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => return Err(self.background_gone()),
            }
        }
        Ok(())
    }

    fn background_gone(&self) -> Error {
        match self.shared.check() {
            Err(e) => e,
            Ok(()) => Error::WriterFailed("background syncer stopped".to_string()),
        }
    }

    /// fsync flushed data and publish the new durable end. Required in
    /// [`SyncMode::Manual`]; a no-op in [`SyncMode::Unsafe`].
    pub fn sync(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.shared.sync()
    }

    /// `(position, offset)` the next record will get.
    pub fn tell(&self) -> (u64, u64) {
        (self.position, self.offset)
    }

    /// Seal the current segment and start a new one at the current end.
    fn roll(&mut self) -> Result<()> {
        self.close_segment(false)?;

        let path = &self.shared.log.path;
        let desc = SegmentDescriptor::new(self.position, self.offset, self.shared.log.clock.now());
        let mut inventory = self.shared.inventory.lock();
        let segment = SegmentWriter::create(
            path,
            desc.clone(),
            self.shared.log.config,
            self.buffer_size,
        )?;
        debug!("reclog: rolled {} to segment {}", path.display(), desc.name);

        let mut dirty = self.shared.dirty.lock();
        dirty.current = Some(desc.name.clone());
        dirty.current_dirty = false;
        dirty.directory_dirty = true;
        drop(dirty);

        inventory.segments.push(desc);
        self.segment = Some(segment);
        Ok(())
    }

    /// Close the current segment. With `drop_empty`, an empty segment is
    /// removed unless it is the only one left (it anchors the log's start).
    fn close_segment(&mut self, drop_empty: bool) -> Result<()> {
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        let empty = segment.count() == 0;
        let desc = segment.close()?;

        let mut inventory = self.shared.inventory.lock();
        let remove = drop_empty && empty && inventory.segments.len() > 1;
        if remove {
            delete_segment(&self.shared.log.path, &desc)?;
            inventory.segments.retain(|d| d.name != desc.name);
            debug!("reclog: removed empty segment {}", desc.name);
        }

        let mut dirty = self.shared.dirty.lock();
        if self.shared.tracks_dirty() {
            if remove {
                dirty.directory_dirty = true;
            } else if dirty.current_dirty {
                dirty.sealed.push(desc.name.clone());
            }
        }
        dirty.current = None;
        dirty.current_dirty = false;
        Ok(())
    }

    /// Flush anything buffered, stop the background threads, close the
    /// current segment and, in [`SyncMode::Auto`], sync one last time.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        let buffered = self.segment.as_ref().is_some_and(|s| s.has_buffered());
        let mut result = if buffered { self.flush() } else { Ok(()) };
        self.closed = true;

        drop(self.stop_expirer.take());
        if let Some(expirer) = self.expirer.take() {
            let _ = expirer.join();
        }
        drop(self.sync_requests.take());
        if let Some(syncer) = self.syncer.take() {
            let _ = syncer.join();
        }

        if let Err(e) = self.close_segment(true) {
            result = result.and(Err(e));
        }
        if result.is_ok() && self.shared.sync_mode == SyncMode::Auto && self.shared.check().is_ok() {
            result = self.shared.sync();
        }

        self.shared.log.release_writer();
        debug!("reclog: writer closed on {}", self.shared.log.path.display());
        result
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWriter")
            .field("path", &self.shared.log.path)
            .field("sync_mode", &self.shared.sync_mode)
            .field("io_mode", &self.io_mode)
            .field("position", &self.position)
            .field("offset", &self.offset)
            .field("closed", &self.closed)
            .finish()
    }
}

fn spawn_syncer(shared: Arc<Shared>) -> Result<(SyncSender<()>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::sync_channel::<()>(1);
    let handle = thread::Builder::new()
        .name("reclog-syncer".to_string())
        .spawn(move || {
            for () in rx {
                if let Err(e) = shared.sync()
                    && !shared.report("sync", e)
                {
                    break;
                }
            }
        })?;
    Ok((tx, handle))
}

fn spawn_expirer(shared: Arc<Shared>) -> Result<(Sender<()>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name("reclog-expirer".to_string())
        .spawn(move || {
            loop {
                match rx.recv_timeout(EXPIRE_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = shared.enforce_max_age()
                            && !shared.report("expire", e)
                        {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
    Ok((tx, handle))
}
