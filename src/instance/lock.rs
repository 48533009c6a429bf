// SPDX-License-Identifier: GPL-2.0-or-later

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use tracing::warn;

use crate::error::{Error, Result};

/// Exclusive advisory lock on an instance directory. Held for the whole
/// session; released on drop, which covers every exit path.
#[derive(Debug)]
pub struct InstanceLock {
    dir: PathBuf,
    file: File,
}

impl InstanceLock {
    /// Open the directory itself and take a non-blocking exclusive flock.
    /// Contention is immediate and fatal for the session.
    pub fn acquire(dir: impl AsRef<Path>) -> Result<InstanceLock> {
        let dir = dir.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_DIRECTORY)
            .open(&dir)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(InstanceLock { dir, file }),
            Err(Errno::EWOULDBLOCK) => Err(Error::LockBusy { dir }),
            Err(err) => Err(Error::Io(err.into())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!("failed to unlock instance dir {}: {err}", self.dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_fails_immediately() {
        let tmp = tempfile::tempdir().unwrap();

        let first = InstanceLock::acquire(tmp.path()).unwrap();
        assert!(matches!(
            InstanceLock::acquire(tmp.path()),
            Err(Error::LockBusy { .. })
        ));

        drop(first);
        let reacquired = InstanceLock::acquire(tmp.path()).unwrap();
        assert_eq!(reacquired.dir(), tmp.path());
    }
}
