use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use anyhow::Result;
use fs4::fs_std::FileExt;
use tracing::debug;

const INSTANCE_LOCK_FILE: &str = "daemon.lock";

/// Exclusive claim on an application directory, held by the daemon for its whole lifetime.
/// Other processes use it to tell whether a daemon owns the data.
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

/// Maps the try-lock result to `Ok(false)` when another process holds the lock.
trait Contention {
    fn acquired(self) -> io::Result<bool>;
}

impl Contention for io::Result<()> {
    fn acquired(self) -> io::Result<bool> {
        match self {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Contention for io::Result<bool> {
    fn acquired(self) -> io::Result<bool> {
        match self {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            other => other,
        }
    }
}

impl InstanceLock {
    /// Takes the lock, or returns `None` when another process holds it.
    pub fn try_acquire(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(INSTANCE_LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if !FileExt::try_lock_exclusive(&file).acquired()? {
            debug!("{path:?} is held by another process");
            return Ok(None);
        }
        debug!("Acquired {path:?}");
        Ok(Some(Self { _file: file, path }))
    }

    /// True when some other process holds the lock right now.
    pub fn is_held(dir: &Path) -> Result<bool> {
        Ok(Self::try_acquire(dir)?.is_none())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
