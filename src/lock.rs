//! Advisory lock on an index directory.
//!
//! `preprocess` holds an exclusive flock() on `<out_dir>/vidseek.lock` for
//! the whole build so two builders never write generations into the same
//! directory. Searches only read published manifests and do not lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the index directory
pub const LOCK_FILE_NAME: &str = "vidseek.lock";

/// A held file lock that releases on drop
pub struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    /// Attempt to acquire an exclusive lock on the index directory.
    /// Fails with `WouldBlock` if another process holds it.
    pub fn try_acquire(dir: &Path) -> io::Result<Self> {
        let file = Self::open(dir)?;
        Self::try_lock_exclusive(&file)?;
        Ok(FileLock { file })
    }

    /// Acquire an exclusive lock, blocking until available.
    pub fn acquire_blocking(dir: &Path) -> io::Result<Self> {
        let file = Self::open(dir)?;
        Self::lock_exclusive(&file)?;
        Ok(FileLock { file })
    }

    fn open(dir: &Path) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE_NAME))
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "index directory is locked by another preprocess run",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // no locking outside unix
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}
