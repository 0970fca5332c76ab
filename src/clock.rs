//! Coarse wall clock used for segment timestamps and age-based retention.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time in unix seconds.
///
/// Only retention and segment naming consult the clock; record ordering
/// never depends on it, so a coarse or injected clock is fine.
pub trait Clock: Send + Sync {
    /// Current time as unix seconds.
    fn now(&self) -> i64;
}

/// A clock refreshed by a background thread at a fixed resolution.
///
/// Reading it is a single atomic load, which keeps the write path free of
/// `SystemTime::now` calls.
pub struct CoarseClock {
    timestamp: Arc<AtomicI64>,
    stop: Option<Sender<()>>,
    updater: Option<JoinHandle<()>>,
}

impl CoarseClock {
    /// Start a clock that refreshes every `resolution`.
    ///
    /// Fails if the updater thread cannot be spawned.
    pub fn new(resolution: Duration) -> io::Result<Self> {
        let timestamp = Arc::new(AtomicI64::new(unix_now()));
        let (stop, stopped) = mpsc::channel::<()>();

        let shared = Arc::clone(&timestamp);
        let updater = thread::Builder::new()
            .name("reclog-clock".into())
            .spawn(move || loop {
                match stopped.recv_timeout(resolution) {
                    Err(RecvTimeoutError::Timeout) => shared.store(unix_now(), Ordering::Relaxed),
                    _ => return,
                }
            })?;

        Ok(CoarseClock {
            timestamp,
            stop: Some(stop),
            updater: Some(updater),
        })
    }
}

impl Clock for CoarseClock {
    fn now(&self) -> i64 {
        self.timestamp.load(Ordering::Relaxed)
    }
}

impl Drop for CoarseClock {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel and ends the loop.
        self.stop.take();
        if let Some(updater) = self.updater.take() {
            let _ = updater.join();
        }
    }
}

impl std::fmt::Debug for CoarseClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoarseClock")
            .field("now", &self.now())
            .finish()
    }
}

/// The process-wide one-second clock shared by every log that was not given
/// its own. Started on first use.
pub fn default_clock() -> io::Result<Arc<dyn Clock>> {
    static DEFAULT: OnceLock<Arc<CoarseClock>> = OnceLock::new();
    let clock = match DEFAULT.get() {
        Some(clock) => clock,
        None => {
            let started = Arc::new(CoarseClock::new(Duration::from_secs(1))?);
            // A racing caller may have won; its clock is kept and ours stops.
            DEFAULT.get_or_init(|| started)
        }
    };
    Ok(Arc::clone(clock) as Arc<dyn Clock>)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
