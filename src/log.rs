use crate::clock::{default_clock, Clock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flock::{Flock, LockError};
use crate::reader::LogReaderBuilder;
use crate::segment::sync_directory;
use crate::subscription::Subscription;
use crate::writer::{LogWriter, LogWriterBuilder, WriterOptions};
use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) const CONFIG_FILENAME: &str = "config";
pub(crate) const LOCK_FILENAME: &str = "lock";

/// Snapshot of the retained and durable range of a log.
///
/// `start_*` describe the oldest retained record (the base of the oldest
/// segment); `end_*` describe the point up to which records are durable and
/// visible to readers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInfo {
    pub start_position: u64,
    pub start_offset: u64,
    pub start_timestamp: i64,
    pub end_position: u64,
    pub end_offset: u64,
}

impl LogInfo {
    /// Number of retained, visible records.
    pub fn record_count(&self) -> u64 {
        self.end_position.saturating_sub(self.start_position)
    }

    /// Number of retained, visible bytes.
    pub fn byte_size(&self) -> u64 {
        self.end_offset.saturating_sub(self.start_offset)
    }
}

/// When buffered writes become durable and visible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// The caller invokes [`LogWriter::sync`] itself.
    Manual,
    /// Every flush queues a coalesced background sync.
    #[default]
    Auto,
    /// Readers see data as soon as it is flushed to the OS, without fsync.
    Unsafe,
}

/// Whether reader/writer calls may block to refill or drain buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Flush and fill transparently.
    #[default]
    Auto,
    /// Return [`Error::MustFlush`] / [`Error::MustFill`] instead.
    Manual,
}

/// Reference point for [`LogReader::seek`](crate::LogReader::seek).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Whence {
    /// Position 0.
    Origin,
    /// The oldest retained position.
    Start,
    /// The reader cursor.
    Current,
    /// The newest durable position.
    End,
}

macro_rules! string_enum {
    ($ty:ty, $err:path, { $($variant:path => $name:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($variant => $name,)+
                };
                f.write_str(name)
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok($variant),)+
                    other => Err($err(other.to_string())),
                }
            }
        }
    };
}

fn unknown_sync_mode(name: String) -> Error {
    Error::InvalidConfig(format!("unknown sync mode {name:?}"))
}

fn unknown_io_mode(name: String) -> Error {
    Error::InvalidConfig(format!("unknown io mode {name:?}"))
}

string_enum!(SyncMode, unknown_sync_mode, {
    SyncMode::Manual => "manual",
    SyncMode::Auto => "auto",
    SyncMode::Unsafe => "unsafe",
});

string_enum!(IoMode, unknown_io_mode, {
    IoMode::Auto => "auto",
    IoMode::Manual => "manual",
});

string_enum!(Whence, Error::InvalidWhence, {
    Whence::Origin => "origin",
    Whence::Start => "start",
    Whence::Current => "current",
    Whence::End => "end",
});

/// Serializes fsync calls across logs sharing a filesystem.
///
/// Each log gets its own lock by default. Pass one clone to every log built
/// from the same [`LogBuilder`] chain to make their syncs take turns.
#[derive(Clone, Default)]
pub struct SyncLock(Arc<Mutex<()>>);

impl SyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock()
    }
}

impl fmt::Debug for SyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SyncLock")
    }
}

#[derive(Debug, Default)]
struct Notifier {
    info: LogInfo,
    subscribers: Vec<Subscription>,
}

/// State shared by a [`Log`] and every writer and reader created from it.
pub(crate) struct LogInner {
    pub path: PathBuf,
    pub config: Config,
    pub sync_lock: SyncLock,
    pub clock: Arc<dyn Clock>,
    notifier: Mutex<Notifier>,
    writer_open: AtomicBool,
    lock_file: Mutex<Flock>,
}

impl LogInner {
    /// Record `info` as current and push it to every subscriber.
    pub fn notify(&self, info: LogInfo) {
        let mut notifier = self.notifier.lock();
        notifier.info = info;
        for subscriber in &notifier.subscribers {
            subscriber.mailbox().publish(info);
        }
    }

    pub fn stat(&self) -> LogInfo {
        self.notifier.lock().info
    }

    pub fn subscribe(&self) -> Subscription {
        let subscription = Subscription::new();
        let mut notifier = self.notifier.lock();
        subscription.mailbox().publish(notifier.info);
        notifier.subscribers.push(subscription.clone());
        subscription
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut notifier = self.notifier.lock();
        notifier
            .subscribers
            .retain(|s| s.id() != subscription.id());
    }

    pub fn claim_writer(&self) -> Result<()> {
        self.writer_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::WriterAlreadyOpen)
    }

    pub fn release_writer(&self) {
        self.writer_open.store(false, Ordering::Release);
    }

    fn writer_open(&self) -> bool {
        self.writer_open.load(Ordering::Acquire)
    }

    fn holds_lock(&self) -> bool {
        self.lock_file.lock().is_held()
    }

    fn release_lock(&self) -> io::Result<()> {
        self.lock_file.lock().release()
    }
}

/// A handle on one log directory.
///
/// Holds the directory lock for as long as it is open. At most one
/// [`LogWriter`] and any number of [`LogReader`](crate::LogReader)s can be
/// created from it; they keep the shared state alive on their own and may
/// move to other threads. An open writer also keeps the directory lock: if
/// the handle is dropped first, the lock is released once the writer is
/// gone.
///
/// # Examples
///
/// ```
/// use reclog::{Config, Log};
///
/// let dir = tempfile::tempdir()?;
/// let log = Log::create(dir.path().join("events"), Config::default())?;
///
/// let mut writer = log.writer().open()?;
/// writer.write(b"hello")?;
/// writer.flush()?;
/// writer.sync()?;
///
/// let mut reader = log.reader().open()?;
/// let mut record = Vec::new();
/// reader.read(&mut record)?;
/// assert_eq!(record, b"hello");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Log {
    inner: Arc<LogInner>,
}

/// Builder for [`Log`] carrying the runtime (non-persisted) options.
pub struct LogBuilder {
    path: PathBuf,
    sync_lock: SyncLock,
    clock: Option<Arc<dyn Clock>>,
}

impl LogBuilder {
    /// Share a sync lock with other logs.
    pub fn sync_lock(mut self, sync_lock: SyncLock) -> Self {
        self.sync_lock = sync_lock;
        self
    }

    /// Use `clock` instead of the process-wide coarse clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Create a new log directory and persist `config` durably.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if the directory exists, and
    /// [`Error::InvalidConfig`] if `config` fails validation.
    pub fn create(self, config: Config) -> Result<Log> {
        config.validate()?;

        match fs::create_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists);
            }
            Err(e) => return Err(e.into()),
        }
        sync_directory(&parent_dir(&self.path))?;

        config.dump(&self.path.join(CONFIG_FILENAME))?;
        sync_directory(&self.path)?;

        info!("reclog: created log {}", self.path.display());
        self.init(config)
    }

    /// Open an existing log directory.
    ///
    /// # Errors
    ///
    /// [`Error::NotExist`], [`Error::UnknownVersion`],
    /// [`Error::ConfigCorrupt`], [`Error::Locked`], or [`Error::Orphaned`]
    /// (the stale lock is cleared first, so a second attempt succeeds).
    pub fn open(self) -> Result<Log> {
        let config = Config::load(&self.path.join(CONFIG_FILENAME))?;
        info!("reclog: opening log {}", self.path.display());
        self.init(config)
    }

    fn init(self, config: Config) -> Result<Log> {
        let mut lock_file = Flock::new(self.path.join(LOCK_FILENAME));
        match lock_file.acquire() {
            Ok(()) => {}
            Err(LockError::Locked) => return Err(Error::Locked),
            Err(LockError::Orphaned) => {
                warn!(
                    "reclog: log {} was not closed cleanly, clearing stale lock",
                    self.path.display()
                );
                lock_file.clear()?;
                return Err(Error::Orphaned);
            }
            Err(LockError::Io(e)) => return Err(e.into()),
        }

        let clock = match self.clock {
            Some(clock) => clock,
            None => default_clock()?,
        };
        let inner = Arc::new(LogInner {
            path: self.path,
            config,
            sync_lock: self.sync_lock,
            clock,
            notifier: Mutex::new(Notifier::default()),
            writer_open: AtomicBool::new(false),
            lock_file: Mutex::new(lock_file),
        });

        // Opening and closing a writer scans the tail segment and publishes
        // the initial LogInfo.
        let options = WriterOptions {
            sync_mode: SyncMode::Manual,
            io_mode: IoMode::Auto,
            ..WriterOptions::default()
        };
        let mut writer = LogWriter::open(Arc::clone(&inner), options)?;
        writer.close()?;

        Ok(Log { inner })
    }
}

impl Log {
    /// Start building a log handle for `path`.
    pub fn builder(path: impl AsRef<Path>) -> LogBuilder {
        LogBuilder {
            path: path.as_ref().to_path_buf(),
            sync_lock: SyncLock::default(),
            clock: None,
        }
    }

    /// Create a log with default runtime options.
    pub fn create(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        Log::builder(path).create(config)
    }

    /// Open a log with default runtime options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Log::builder(path).open()
    }

    /// Remove a log directory and everything in it.
    ///
    /// Refuses with [`Error::Locked`] while another handle has it open.
    pub fn delete(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.join(CONFIG_FILENAME).exists() {
            return Err(Error::NotExist);
        }

        let mut lock_file = Flock::new(path.join(LOCK_FILENAME));
        match lock_file.acquire() {
            Ok(()) | Err(LockError::Orphaned) => {}
            Err(LockError::Locked) => return Err(Error::Locked),
            Err(LockError::Io(e)) => return Err(e.into()),
        }

        fs::remove_dir_all(path)?;
        sync_directory(&parent_dir(path))?;
        drop(lock_file);

        info!("reclog: deleted log {}", path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The last published [`LogInfo`]. Never blocks on I/O.
    pub fn stat(&self) -> LogInfo {
        self.inner.stat()
    }

    /// Register a mailbox for [`LogInfo`] updates. The current state is
    /// delivered immediately.
    pub fn subscribe(&self) -> Subscription {
        self.inner.subscribe()
    }

    /// Stop delivering updates to `subscription`.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.unsubscribe(subscription)
    }

    /// Configure and open the writer for this log.
    pub fn writer(&self) -> LogWriterBuilder {
        LogWriterBuilder::new(Arc::clone(&self.inner))
    }

    /// Configure and open a reader positioned at the oldest retained record.
    pub fn reader(&self) -> LogReaderBuilder {
        LogReaderBuilder::new(Arc::clone(&self.inner))
    }

    /// Release the directory lock. Data is kept.
    ///
    /// # Errors
    ///
    /// [`Error::WriterAlreadyOpen`] while a writer from this handle is still
    /// open. The lock then stays held until that writer is dropped.
    pub fn close(self) -> Result<()> {
        if self.inner.writer_open() {
            return Err(Error::WriterAlreadyOpen);
        }
        self.inner.release_lock()?;
        Ok(())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if !self.inner.writer_open() {
            let _ = self.inner.release_lock();
        }
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("path", &self.inner.path)
            .field("config", &self.inner.config)
            .field("info", &self.inner.stat())
            .field("locked", &self.inner.holds_lock())
            .finish()
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
