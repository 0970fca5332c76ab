//! Error and Result types for log operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for log operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for log operations.
///
/// Variants fall in a few families: integrity problems surfaced by
/// [`Log::create`](crate::Log::create) and [`Log::open`](crate::Log::open),
/// concurrency conflicts, expected bounds conditions such as
/// [`Error::EndOfStream`], and the manual-mode backpressure signals
/// [`Error::MustFlush`] and [`Error::MustFill`]. Anything else coming from the
/// filesystem is passed through as [`Error::Io`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The log directory already exists.
    #[error("log already exists")]
    AlreadyExists,

    /// The log directory (or its config file) does not exist.
    #[error("log does not exist")]
    NotExist,

    /// The config file carries a version tag this crate does not know.
    #[error("unknown config version: {0}")]
    UnknownVersion(u32),

    /// The config file has the wrong size or a checksum mismatch.
    #[error("config corrupt")]
    ConfigCorrupt,

    /// A config value was rejected before anything touched the disk.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Another live process holds the directory lock.
    #[error("log is locked by another process")]
    Locked,

    /// A lock file was left behind by a holder that did not shut down
    /// cleanly. The stale lock has already been cleared; the caller decides
    /// whether to run [`Log::scan`](crate::Log::scan) before reopening.
    #[error("log lock orphaned by an unclean shutdown")]
    Orphaned,

    /// A writer is already open on this log.
    #[error("a writer is already open on this log")]
    WriterAlreadyOpen,

    /// A seek target (or a reader cursor) lies outside the retained range.
    #[error("position out of range")]
    OutOfRange,

    /// A whence string did not name a known reference point.
    #[error("invalid whence: {0:?}")]
    InvalidWhence(String),

    /// A non-follow reader reached the end of durable data.
    #[error("end of stream")]
    EndOfStream,

    /// Manual-mode writer: the buffer must be flushed before writing more.
    #[error("must flush")]
    MustFlush,

    /// Manual-mode reader: the buffer must be filled before reading more.
    #[error("must fill")]
    MustFill,

    /// A follow-mode wait ran past the reader deadline.
    #[error("read deadline exceeded")]
    Timeout,

    /// The reader or writer was closed.
    #[error("closed")]
    Closed,

    /// A record is larger than the configured maximum record size.
    #[error("record of {size} bytes exceeds maximum of {max} bytes")]
    RecordTooLarge {
        /// Payload size of the rejected record.
        size: usize,
        /// Configured `max_record_size`.
        max: usize,
    },

    /// A record failed its checksum. The reader has already skipped past it,
    /// so the next read continues with the following position.
    #[error("corrupt record at position {position} ({size} bytes)")]
    CorruptRecord {
        /// Position of the damaged record.
        position: u64,
        /// Encoded frame size that was skipped.
        size: usize,
    },

    /// A recovery scan found damage it cannot repair.
    #[error("log corrupt: {0}")]
    Corrupt(String),

    /// A background task failed and the writer can no longer be used.
    #[error("writer unusable after background failure: {0}")]
    WriterFailed(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns true for the manual-mode control signals
    /// ([`Error::MustFlush`], [`Error::MustFill`]).
    ///
    /// These are part of the buffering protocol and should be handled by
    /// calling `flush` / `fill`, not reported.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::MustFlush | Error::MustFill)
    }

    /// Returns true for expected bounds conditions a reader branches on.
    pub fn is_end_of_data(&self) -> bool {
        matches!(self, Error::EndOfStream | Error::Timeout)
    }
}
