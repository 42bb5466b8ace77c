//! Shared building blocks for the rawfs filesystem bridge.
//!
//! This crate holds everything that does not depend on a running session:
//!
//! - [`protocol`]: the kernel channel wire codec (request decoding, reply encoding)
//! - [`status`]: the error kinds a backend can report and their errno codes
//! - [`attr`]: file attributes and filesystem statistics
//! - [`filesystem`]: the capability contract a backend implements, plus the
//!   directory entry writer and an in-memory reference backend

pub mod attr;
pub mod filesystem;
pub mod protocol;
pub mod status;

pub use attr::{FileAttr, FileType, StatFs};
pub use filesystem::{
    ConnInfo, DefaultFileSystem, DirEntry, DirEntryWriter, Entry, MemoryFileSystem,
    MemorySession, RawFileSystem,
};
pub use status::Status;
