//! Error kinds reported by filesystem backends
//!
//! Every kind maps to exactly one errno value that is sent back to the
//! kernel in the reply header. [`Status::NotImplemented`] is reserved for
//! capability methods a backend did not override.

use std::io;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    #[error("no such file or directory")]
    NotFound,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("i/o failure")]
    Io,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file name too long")]
    NameTooLong,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("stale file handle")]
    Stale,
    #[error("bad file handle")]
    BadHandle,
    #[error("interrupted")]
    Interrupted,
    #[error("protocol error")]
    Protocol,
    /// Any errno without a dedicated kind
    #[error("errno {0}")]
    Errno(i32),
}

impl Status {
    /// The positive errno value for this status
    pub fn errno(self) -> i32 {
        match self {
            Status::NotFound => libc::ENOENT,
            Status::NotImplemented => libc::ENOSYS,
            Status::Io => libc::EIO,
            Status::PermissionDenied => libc::EACCES,
            Status::NotPermitted => libc::EPERM,
            Status::NotADirectory => libc::ENOTDIR,
            Status::IsADirectory => libc::EISDIR,
            Status::InvalidArgument => libc::EINVAL,
            Status::NameTooLong => libc::ENAMETOOLONG,
            Status::ReadOnly => libc::EROFS,
            Status::Stale => libc::ESTALE,
            Status::BadHandle => libc::EBADF,
            Status::Interrupted => libc::EINTR,
            Status::Protocol => libc::EPROTO,
            Status::Errno(errno) => errno,
        }
    }

    /// Map an errno value back to its kind
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => Status::NotFound,
            libc::ENOSYS => Status::NotImplemented,
            libc::EIO => Status::Io,
            libc::EACCES => Status::PermissionDenied,
            libc::EPERM => Status::NotPermitted,
            libc::ENOTDIR => Status::NotADirectory,
            libc::EISDIR => Status::IsADirectory,
            libc::EINVAL => Status::InvalidArgument,
            libc::ENAMETOOLONG => Status::NameTooLong,
            libc::EROFS => Status::ReadOnly,
            libc::ESTALE => Status::Stale,
            libc::EBADF => Status::BadHandle,
            libc::EINTR => Status::Interrupted,
            libc::EPROTO => Status::Protocol,
            other => Status::Errno(other),
        }
    }
}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Status::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::NotFound => Status::NotFound,
            io::ErrorKind::PermissionDenied => Status::PermissionDenied,
            io::ErrorKind::InvalidInput => Status::InvalidArgument,
            io::ErrorKind::Interrupted => Status::Interrupted,
            io::ErrorKind::Unsupported => Status::NotImplemented,
            _ => Status::Io,
        }
    }
}
