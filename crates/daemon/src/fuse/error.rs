//! Error types for request dispatch

use common::protocol::DecodeError;
use common::Status;

/// A request named an id that is not in the identity tables
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unknown inode {0}")]
    UnknownInode(u64),
    #[error("unknown file handle {0}")]
    UnknownHandle(u64),
    /// A file handle used for a directory operation or the other way around
    #[error("file handle {0} has the wrong kind for this operation")]
    HandleKind(u64),
    /// The handle was opened on a different inode than the request names
    #[error("file handle {fh} belongs to inode {owner}, not {requested}")]
    HandleInode { fh: u64, owner: u64, requested: u64 },
}

impl IdentityError {
    pub fn errno(&self) -> i32 {
        match self {
            IdentityError::UnknownInode(_) => libc::ENOENT,
            IdentityError::UnknownHandle(_)
            | IdentityError::HandleKind(_)
            | IdentityError::HandleInode { .. } => libc::EBADF,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("malformed request: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("filesystem error: {0}")]
    Capability(#[from] Status),
    #[error("request received before init")]
    NotInitialized,
    #[error("init received twice")]
    AlreadyInitialized,
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// The errno sent to the kernel for this failure
    pub fn errno(&self) -> i32 {
        match self {
            DispatchError::Decode(_)
            | DispatchError::AlreadyInitialized
            | DispatchError::UnsupportedVersion { .. } => libc::EPROTO,
            DispatchError::Identity(err) => err.errno(),
            DispatchError::Capability(status) => status.errno(),
            DispatchError::NotInitialized | DispatchError::Internal(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_per_kind() {
        assert_eq!(
            DispatchError::from(DecodeError::MissingNul).errno(),
            libc::EPROTO
        );
        assert_eq!(
            DispatchError::from(IdentityError::UnknownInode(5)).errno(),
            libc::ENOENT
        );
        assert_eq!(
            DispatchError::from(IdentityError::UnknownHandle(5)).errno(),
            libc::EBADF
        );
        assert_eq!(
            DispatchError::from(Status::NotImplemented).errno(),
            libc::ENOSYS
        );
        assert_eq!(
            DispatchError::from(Status::PermissionDenied).errno(),
            libc::EACCES
        );
        assert_eq!(DispatchError::NotInitialized.errno(), libc::EIO);
        assert_eq!(
            DispatchError::Internal("refcount".to_string()).errno(),
            libc::EIO
        );
    }
}
