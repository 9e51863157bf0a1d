//! Byte-addressed backing devices and advisory range locks.

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, fcntl};
use sfs_error::{Result, SfsError};
use sfs_types::ByteOffset;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Half-open byte range `[start, start + len)` on the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    #[must_use]
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics) that
/// can also place advisory locks on byte ranges.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Lock `range`. With `wait == false` returns `Ok(false)` instead of
    /// blocking when a conflicting lock is held elsewhere.
    fn lock_range(&self, range: ByteRange, kind: LockKind, wait: bool) -> Result<bool>;

    fn unlock_range(&self, range: ByteRange) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. Locks are open-file-description locks
/// (`F_OFD_SETLK`), so two devices opened on the same path exclude each other
/// even inside one process.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| SfsError::HostAccess {
                path: path.display().to_string(),
                source,
            })?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "opened backing file");
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create a new sparse backing file of `len` bytes. Fails with
    /// `FileAlreadyExists` if `path` exists.
    pub fn create_new(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                ErrorKind::AlreadyExists => SfsError::FileAlreadyExists,
                _ => SfsError::HostAccess {
                    path: path.display().to_string(),
                    source,
                },
            })?;
        if let Err(source) = file.set_len(len) {
            drop(file);
            if let Err(cleanup) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %cleanup, "failed to remove unsized backing file");
            }
            return Err(SfsError::HostAccess {
                path: path.display().to_string(),
                source,
            });
        }
        debug!(path = %path.display(), len, "created backing file");
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    fn check_bounds(&self, offset: ByteOffset, len: usize, op: &str) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(len)
                    .map_err(|_| SfsError::Format(format!("{op} length overflows u64")))?,
            )
            .ok_or_else(|| SfsError::Format(format!("{op} range overflows u64")))?;
        if end.0 > self.len {
            return Err(SfsError::Format(format!(
                "{op} out of bounds: offset={offset} len={len} file_len={}",
                self.len
            )));
        }
        Ok(())
    }

    fn fcntl_lock(&self, range: ByteRange, l_type: libc::c_int, wait: bool) -> Result<bool> {
        let l_start = libc::off_t::try_from(range.start)
            .map_err(|_| SfsError::Format(format!("lock offset {} overflows off_t", range.start)))?;
        let l_len = libc::off_t::try_from(range.len)
            .map_err(|_| SfsError::Format(format!("lock length {} overflows off_t", range.len)))?;
        #[allow(clippy::cast_possible_truncation, clippy::unnecessary_cast)]
        let request = libc::flock {
            l_type: l_type as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start,
            l_len,
            // Must be zero for open-file-description locks.
            l_pid: 0,
        };
        let fd = self.file.as_raw_fd();
        loop {
            let arg = if wait {
                FcntlArg::F_OFD_SETLKW(&request)
            } else {
                FcntlArg::F_OFD_SETLK(&request)
            };
            match fcntl(fd, arg) {
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN | Errno::EACCES) if !wait => return Ok(false),
                Err(errno) => return Err(SfsError::Io(errno.into())),
            }
        }
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len(), "read")?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        self.check_bounds(offset, buf.len(), "write")?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn lock_range(&self, range: ByteRange, kind: LockKind, wait: bool) -> Result<bool> {
        let l_type = match kind {
            LockKind::Shared => libc::F_RDLCK,
            LockKind::Exclusive => libc::F_WRLCK,
        };
        let acquired = self.fcntl_lock(range, l_type.into(), wait)?;
        trace!(start = range.start, len = range.len, ?kind, wait, acquired, "lock_range");
        Ok(acquired)
    }

    fn unlock_range(&self, range: ByteRange) -> Result<()> {
        self.fcntl_lock(range, libc::F_UNLCK.into(), false)?;
        trace!(start = range.start, len = range.len, "unlock_range");
        Ok(())
    }
}
