//! The capability contract a filesystem backend implements
//!
//! A backend implements [`RawFileSystem`] and overrides only the operations
//! it supports. Every request operation it leaves alone answers
//! [`Status::NotImplemented`]; the lifecycle hooks (`init`, `destroy`,
//! `forget`) default to doing nothing and the release hooks default to
//! dropping the session.
//!
//! Methods receive backend node references and sessions the backend itself
//! produced, never the kernel-visible ids. Identity bookkeeping belongs to
//! the dispatcher.

use std::ffi::OsStr;
use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use bytes::Bytes;

use crate::attr::{FileAttr, StatFs};
use crate::status::Status;

mod default;
mod dir_writer;
pub mod memory;

pub use default::DefaultFileSystem;
pub use dir_writer::{DirEntry, DirEntryWriter, DIRENT_HEADER_LEN};
pub use memory::{MemoryFileSystem, MemorySession};

/// Connection parameters negotiated during init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    pub proto_major: u32,
    pub proto_minor: u32,
    pub max_readahead: u32,
    pub max_write: u32,
    /// Capability flags offered by the kernel
    pub capable: u32,
}

/// Result of resolving a name in a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<N> {
    pub node: N,
    pub attr: FileAttr,
}

#[async_trait]
pub trait RawFileSystem: Send + Sync + 'static {
    /// Backend reference to a filesystem object.
    ///
    /// Two lookups of the same object must yield equal nodes; the dispatcher
    /// relies on this to keep kernel-visible ids stable.
    type Node: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// State of one open file or directory
    type Session: Send + 'static;

    /// The node mounted as the root directory
    fn root(&self) -> Self::Node;

    /// Called once before any other operation
    async fn init(&self, _conn: &ConnInfo) {}

    /// Called once after the channel has drained
    async fn destroy(&self) {}

    /// Called when the kernel no longer references `node`
    fn forget(&self, _node: &Self::Node) {}

    async fn statfs(&self, _node: &Self::Node) -> Result<StatFs, Status> {
        Err(Status::NotImplemented)
    }

    async fn lookup(
        &self,
        _parent: &Self::Node,
        _name: &OsStr,
    ) -> Result<Entry<Self::Node>, Status> {
        Err(Status::NotImplemented)
    }

    async fn getattr(&self, _node: &Self::Node) -> Result<FileAttr, Status> {
        Err(Status::NotImplemented)
    }

    async fn open(&self, _node: &Self::Node, _flags: u32) -> Result<Self::Session, Status> {
        Err(Status::NotImplemented)
    }

    /// Read up to `size` bytes at `offset`.
    ///
    /// Returning fewer bytes than requested signals end of data.
    async fn read(
        &self,
        _node: &Self::Node,
        _session: &mut Self::Session,
        _offset: u64,
        _size: u32,
    ) -> Result<Bytes, Status> {
        Err(Status::NotImplemented)
    }

    async fn release(
        &self,
        _node: &Self::Node,
        _session: Self::Session,
        _flags: u32,
    ) -> Result<(), Status> {
        Ok(())
    }

    async fn opendir(&self, _node: &Self::Node, _flags: u32) -> Result<Self::Session, Status> {
        Err(Status::NotImplemented)
    }

    /// Add entries starting after the cursor `offset` until the writer is
    /// full or the directory is exhausted.
    ///
    /// Each entry carries the cursor that resumes right after it.
    async fn readdir(
        &self,
        _node: &Self::Node,
        _session: &mut Self::Session,
        _offset: u64,
        _writer: &mut DirEntryWriter,
    ) -> Result<(), Status> {
        Err(Status::NotImplemented)
    }

    async fn releasedir(
        &self,
        _node: &Self::Node,
        _session: Self::Session,
        _flags: u32,
    ) -> Result<(), Status> {
        Ok(())
    }
}
