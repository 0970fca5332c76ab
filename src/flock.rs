//! Advisory lock file guarding a log directory against a second process.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Outcome of a lock attempt that did not yield the lock.
#[derive(Debug)]
pub(crate) enum LockError {
    /// A live holder owns the lock.
    Locked,
    /// The lock file exists but nobody holds it: the previous holder died
    /// without releasing.
    Orphaned,
    Io(io::Error),
}

impl From<io::Error> for LockError {
    fn from(e: io::Error) -> Self {
        LockError::Io(e)
    }
}

/// An exclusive `flock` over a lock file.
///
/// The lock file only exists while someone holds it; a clean release removes
/// it. Finding the file present but unlocked therefore means the last holder
/// crashed.
#[derive(Debug)]
pub(crate) struct Flock {
    path: PathBuf,
    file: Option<File>,
}

impl Flock {
    pub(crate) fn new(path: impl AsRef<Path>) -> Self {
        Flock {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    /// Try to take the lock without blocking.
    pub(crate) fn acquire(&mut self) -> Result<(), LockError> {
        match File::open(&self.path) {
            Ok(existing) => {
                if existing.try_lock_exclusive().is_err() {
                    return Err(LockError::Locked);
                }
                // We got the lock on a file nobody held. Closing the handle
                // drops it again.
                drop(existing);
                return Err(LockError::Orphaned);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::Io(e)),
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        if file.try_lock_exclusive().is_err() {
            // Lost a race with another opener since the existence check.
            return Err(LockError::Locked);
        }

        self.file = Some(file);
        Ok(())
    }

    /// Release the lock and remove the lock file.
    pub(crate) fn release(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            drop(file);
            self.clear()?;
        }
        Ok(())
    }

    /// Remove the lock file. Idempotent.
    pub(crate) fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for Flock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
