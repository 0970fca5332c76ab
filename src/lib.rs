//! A durable, segmented, append-only record log.
//!
//! A [`Log`] is a directory of segments. One [`LogWriter`] appends
//! length-prefixed, checksummed records; any number of [`LogReader`]s read
//! them back in position order, optionally following the writer as new data
//! becomes durable. Retention, online backup and crash recovery are built in.

mod backup;
mod clock;
mod config;
mod error;
mod flock;
mod index;
mod log;
mod reader;
mod record;
mod scan;
mod segment;
mod subscription;
mod writer;

pub use clock::{default_clock, Clock, CoarseClock};
pub use config::Config;
pub use error::{Error, Result};
pub use crate::log::{IoMode, Log, LogBuilder, LogInfo, SyncLock, SyncMode, Whence};
pub use reader::{CloseHandle, LogReader, LogReaderBuilder};
pub use scan::ScanReport;
pub use subscription::Subscription;
pub use writer::{ErrorHandler, LogWriter, LogWriterBuilder, SyncHandler};
