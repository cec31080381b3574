use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheFsError>;

/// Failures an overlay operation can report back to the driver.
#[derive(Debug, Error)]
pub enum CacheFsError {
    /// Missing from both trees, or masked by a tombstone.
    #[error("no such file or directory")]
    NotFound,

    #[error("operation not permitted")]
    PermissionDenied,

    /// The source tree could not answer (statfs on an unreachable source).
    #[error("operation not supported by the source tree")]
    NotSupported,

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("errno {0}")]
    Errno(i32),
}

impl CacheFsError {
    /// Positive POSIX errno for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            CacheFsError::NotFound => libc::ENOENT,
            CacheFsError::PermissionDenied => libc::EPERM,
            CacheFsError::NotSupported => libc::ENOSYS,
            CacheFsError::BadHandle(_) => libc::EBADF,
            CacheFsError::Io(e) => match e.raw_os_error() {
                Some(code) => code,
                None if e.kind() == io::ErrorKind::NotFound => libc::ENOENT,
                None if e.kind() == io::ErrorKind::PermissionDenied => libc::EACCES,
                None => libc::EIO,
            },
            CacheFsError::Errno(code) => *code,
        }
    }

    /// Collapses "does not exist" I/O errors into [`CacheFsError::NotFound`].
    pub fn from_lookup(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            CacheFsError::NotFound
        } else {
            CacheFsError::Io(e)
        }
    }
}

impl From<nix::errno::Errno> for CacheFsError {
    fn from(e: nix::errno::Errno) -> Self {
        CacheFsError::Errno(e as i32)
    }
}

impl From<CacheFsError> for rfuse3::Errno {
    fn from(e: CacheFsError) -> Self {
        e.errno().into()
    }
}
