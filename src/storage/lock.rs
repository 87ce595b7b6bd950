//! Exclusive lock held for the duration of a maintenance run.
//!
//! Two cleanup runs against the same stores would race on deletes and
//! backups, so a run takes a non-blocking exclusive lock on a file in the
//! backup directory first. The lock is released when the guard is dropped.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{LedgerError, LedgerResult};

const LOCK_FILE: &str = ".maintenance.lock";

/// Guard for an exclusive maintenance lock.
#[derive(Debug)]
pub struct MaintenanceLock {
    _file: File,
    path: PathBuf,
}

impl MaintenanceLock {
    /// Takes the lock in `dir`, creating the directory if needed.
    ///
    /// # Errors
    /// `ConcurrentWriteConflict` if another run holds the lock; `Io` if the
    /// lock file cannot be created.
    pub fn acquire(dir: &Path) -> LedgerResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| LedgerError::io(format!("creating {}", dir.display()), e))?;
        let lock_path = dir.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| LedgerError::io(format!("opening {}", lock_path.display()), e))?;

        match Self::try_lock(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(LedgerError::ConcurrentWriteConflict {
                    operation: "maintenance".to_string(),
                    resource: lock_path.display().to_string(),
                });
            }
            Err(e) => return Err(LedgerError::io(format!("locking {}", lock_path.display()), e)),
        }

        // Holder info for operators; the lock itself is the flock.
        let holder = file
            .set_len(0)
            .and_then(|()| writeln!(file, "pid={} since={}", std::process::id(), Utc::now().to_rfc3339()));
        if let Err(e) = holder {
            tracing::warn!(path = %lock_path.display(), error = %e, "could not record lock holder");
        }

        tracing::debug!(path = %lock_path.display(), "maintenance lock acquired");
        Ok(Self {
            _file: file,
            path: lock_path,
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let errno = IoError::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(IoError::new(ErrorKind::WouldBlock, "maintenance already running"));
            }
            return Err(errno);
        }

        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };

        if result == 0 {
            let err = IoError::last_os_error();
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("maintenance already running: {err}"),
            ));
        }

        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}
