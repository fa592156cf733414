//! Advisory whole-file lock for writable opens.
//!
//! Unix `flock(2)` with `LOCK_EX | LOCK_NB`: a second writable open of the
//! same database fails immediately instead of blocking. The lock is tied to
//! the open file description and released on drop.

use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Takes an exclusive advisory lock on `file`, consuming it as the lock
    /// anchor. Fails when another process (or another open of the same
    /// database in this process) already holds it.
    pub fn acquire(file: File) -> io::Result<Self> {
        Self::try_lock(&file)?;
        Ok(Self { file })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn unlock(&self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }

    #[cfg(not(unix))]
    fn unlock(&self) {}
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
