//! File attributes and filesystem statistics
//!
//! These are the backend-facing shapes; the wire layout lives in
//! [`crate::protocol::reply`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Kind of filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    NamedPipe,
    CharDevice,
    Directory,
    BlockDevice,
    RegularFile,
    Symlink,
    Socket,
}

impl FileType {
    /// The `S_IFMT` bits for this kind
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::NamedPipe => libc::S_IFIFO as u32,
            FileType::CharDevice => libc::S_IFCHR as u32,
            FileType::Directory => libc::S_IFDIR as u32,
            FileType::BlockDevice => libc::S_IFBLK as u32,
            FileType::RegularFile => libc::S_IFREG as u32,
            FileType::Symlink => libc::S_IFLNK as u32,
            FileType::Socket => libc::S_IFSOCK as u32,
        }
    }

    /// The `d_type` value used in directory entries
    pub fn dirent_type(self) -> u32 {
        (self.mode_bits() >> 12) & 0o17
    }
}

/// Attributes of a filesystem object
///
/// `ino` is filled in by the dispatcher with the kernel-visible id; a backend
/// may leave it at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileType,
    /// Permission bits (without the file type)
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl FileAttr {
    /// Attributes for a plain object of the given kind and size, timestamped now
    pub fn new(kind: FileType, size: u64) -> Self {
        let now = SystemTime::now();
        let (perm, nlink) = match kind {
            FileType::Directory => (0o755, 2),
            _ => (0o644, 1),
        };
        Self {
            ino: 0,
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            kind,
            perm,
            nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }

    /// Full `st_mode` value (type bits plus permissions)
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | u32::from(self.perm & 0o7777)
    }
}

/// Split a timestamp into whole seconds and nanoseconds since the epoch.
///
/// Times before the epoch are clamped to zero.
pub(crate) fn epoch_parts(time: SystemTime) -> (u64, u32) {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    (since.as_secs(), since.subsec_nanos())
}

/// Filesystem statistics as reported by `statfs`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}
