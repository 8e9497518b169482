/// Exclusive ownership of a cache directory
///
/// Two launchers sharing one index would race on slot allocation, so the
/// cache takes a non-blocking `flock` on `<cache>/.lock` for its lifetime.
use crate::config::types::{LauncherError, Result};
use log::{debug, warn};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".lock";

pub struct CacheLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for CacheLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLock").field("path", &self.path).finish()
    }
}

impl CacheLock {
    pub fn acquire(cache_dir: &Path) -> Result<Self> {
        let path = cache_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => {
                return Err(LauncherError::CacheBusy(cache_dir.to_path_buf()))
            }
            Err((_, errno)) => {
                return Err(LauncherError::Io(std::io::Error::from(errno)));
            }
        };

        // Owner pid is informational only.
        if let Err(e) = locked
            .set_len(0)
            .and_then(|_| locked.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|_| writeln!(locked, "{}", std::process::id()))
        {
            warn!("Could not record owner in {}: {}", path.display(), e);
        }

        debug!("Acquired cache lock {}", path.display());
        Ok(Self { _file: locked, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
