//! # Locked File
//!
//! Owns an open file handle and the advisory locking around it. All reads
//! and writes are positioned (`pread`/`pwrite` style), so the handle carries
//! no cursor state and methods take `&self`.
//!
//! ## Locking
//!
//! Two layers cooperate:
//!
//! 1. The in-process [`LockTable`] reference-counts holders per byte
//!    position, so threads sharing this handle coalesce and block each other
//!    correctly.
//! 2. On the 0→1 / 1→0 transitions, a one-byte OS advisory lock
//!    (`fcntl(F_SETLKW)`) is taken or released, which is what coordinates
//!    separate processes. On non-Unix targets only the in-process layer is
//!    active.
//!
//! Lock holders receive RAII guards; dropping a guard releases the hold and
//! wakes waiters. The store locks position 0 to serialize appends; the index
//! locks field-header offsets to serialize per-field work.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use eyre::{Result, WrapErr};

use super::lock_table::LockTable;
use crate::error::JifyError;

#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
    locks: LockTable,
}

impl LockedFile {
    /// Opens an existing file read-write. A missing file is `NotFound`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Ok(Self {
                file,
                path,
                locks: LockTable::new(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(JifyError::NotFound(path.display().to_string()).into())
            }
            Err(err) => Err(err).wrap_err_with(|| format!("failed to open '{}'", path.display())),
        }
    }

    /// Creates a new file exclusively. An existing file is `AlreadyExists`.
    pub fn create_new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => Ok(Self {
                file,
                path,
                locks: LockTable::new(),
            }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(JifyError::AlreadyExists(path.display().to_string()).into())
            }
            Err(err) => Err(err).wrap_err_with(|| format!("failed to create '{}'", path.display())),
        }
    }

    /// Removes a file from disk. A missing file is `NotFound`.
    pub fn remove<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(JifyError::NotFound(path.display().to_string()).into())
            }
            Err(err) => Err(err).wrap_err_with(|| format!("failed to remove '{}'", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?
            .len())
    }

    pub fn modified(&self) -> Result<SystemTime> {
        self.file
            .metadata()
            .and_then(|meta| meta.modified())
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))
    }

    /// Reads at `position` until `buf` is full or EOF; returns bytes read.
    pub fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let count = self
                .pread(&mut buf[filled..], position + filled as u64)
                .wrap_err_with(|| format!("failed to read '{}'", self.path.display()))?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        Ok(filled)
    }

    /// Writes the whole buffer at `position`, extending the file as needed.
    pub fn write_at(&self, buf: &[u8], position: u64) -> Result<()> {
        self.pwrite_all(buf, position)
            .wrap_err_with(|| format!("failed to write '{}'", self.path.display()))
    }

    /// Appends text at the current end of file; returns its start offset.
    pub fn append(&self, text: &str) -> Result<u64> {
        let position = self.len()?;
        self.write_at(text.as_bytes(), position)?;
        Ok(position)
    }

    pub fn truncate(&self, position: u64) -> Result<()> {
        self.file
            .set_len(position)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.path.display()))
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    /// Blocks until a shared hold on the byte at `position` is granted.
    pub fn lock_shared(&self, position: u64) -> Result<SharedLock<'_>> {
        if self.locks.acquire_shared(position) {
            if let Err(err) = self.os_lock(position, false) {
                self.locks.release_shared(position);
                return Err(err);
            }
        }
        Ok(SharedLock {
            file: self,
            position,
        })
    }

    /// Blocks until an exclusive hold on the byte at `position` is granted.
    pub fn lock_exclusive(&self, position: u64) -> Result<ExclusiveLock<'_>> {
        self.locks.acquire_exclusive(position);
        if let Err(err) = self.os_lock(position, true) {
            self.locks.release_exclusive(position);
            return Err(err);
        }
        Ok(ExclusiveLock {
            file: self,
            position,
        })
    }

    #[cfg(unix)]
    fn pread(&self, buf: &mut [u8], position: u64) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, position)
    }

    #[cfg(unix)]
    fn pwrite_all(&self, buf: &[u8], position: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, position)
    }

    #[cfg(windows)]
    fn pread(&self, buf: &mut [u8], position: u64) -> std::io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, position)
    }

    #[cfg(windows)]
    fn pwrite_all(&self, buf: &[u8], position: u64) -> std::io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut written = 0;
        while written < buf.len() {
            let count = self.file.seek_write(&buf[written..], position + written as u64)?;
            if count == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            written += count;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn os_lock(&self, position: u64, exclusive: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let mut request: libc::flock = unsafe { std::mem::zeroed() };
        request.l_type = if exclusive {
            libc::F_WRLCK as libc::c_short
        } else {
            libc::F_RDLCK as libc::c_short
        };
        request.l_whence = libc::SEEK_SET as libc::c_short;
        request.l_start = position as libc::off_t;
        request.l_len = 1;

        loop {
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLKW, &request) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err)
                    .wrap_err_with(|| format!("failed to lock '{}'", self.path.display()));
            }
        }
    }

    #[cfg(unix)]
    fn os_unlock(&self, position: u64) {
        use std::os::unix::io::AsRawFd;

        let mut request: libc::flock = unsafe { std::mem::zeroed() };
        request.l_type = libc::F_UNLCK as libc::c_short;
        request.l_whence = libc::SEEK_SET as libc::c_short;
        request.l_start = position as libc::off_t;
        request.l_len = 1;

        // failure to unlock is unrecoverable from a Drop; the lock dies with
        // the file descriptor anyway
        unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &request) };
    }

    #[cfg(not(unix))]
    fn os_lock(&self, _position: u64, _exclusive: bool) -> Result<()> {
        Ok(())
    }

    #[cfg(not(unix))]
    fn os_unlock(&self, _position: u64) {}
}

/// Shared hold on one byte position; released on drop.
#[derive(Debug)]
pub struct SharedLock<'a> {
    file: &'a LockedFile,
    position: u64,
}

impl Drop for SharedLock<'_> {
    fn drop(&mut self) {
        if self.file.locks.release_shared(self.position) {
            self.file.os_unlock(self.position);
        }
    }
}

/// Exclusive hold on one byte position; released on drop.
#[derive(Debug)]
pub struct ExclusiveLock<'a> {
    file: &'a LockedFile,
    position: u64,
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        if self.file.locks.release_exclusive(self.position) {
            self.file.os_unlock(self.position);
        }
    }
}
