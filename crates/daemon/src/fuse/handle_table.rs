//! Open file and directory handles
//!
//! Each successful open or opendir registers the backend's session under a
//! fresh handle number. Sessions sit behind an async mutex so that reads on
//! the same handle are serialized even when the kernel issues them
//! concurrently. Release takes the session out, which makes any request
//! still queued on the mutex see a closed handle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Shared, lockable slot holding a backend session until release
pub type SessionSlot<S> = Arc<Mutex<Option<S>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Directory,
}

#[derive(Debug)]
pub struct HandleEntry<S> {
    /// Inode the handle was opened on
    pub ino: u64,
    pub kind: HandleKind,
    /// Flags passed to open
    pub flags: u32,
    pub session: SessionSlot<S>,
}

impl<S> Clone for HandleEntry<S> {
    fn clone(&self) -> Self {
        Self {
            ino: self.ino,
            kind: self.kind,
            flags: self.flags,
            session: self.session.clone(),
        }
    }
}

#[derive(Debug)]
pub struct HandleTable<S> {
    entries: HashMap<u64, HandleEntry<S>>,
    /// Handle numbers are never reused
    next_handle: u64,
}

impl<S> Default for HandleTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> HandleTable<S> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Store a session and return its handle number
    pub fn register(&mut self, ino: u64, kind: HandleKind, flags: u32, session: S) -> u64 {
        let fh = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(
            fh,
            HandleEntry {
                ino,
                kind,
                flags,
                session: Arc::new(Mutex::new(Some(session))),
            },
        );
        fh
    }

    /// Get a handle if it is open
    pub fn get(&self, fh: u64) -> Option<HandleEntry<S>> {
        self.entries.get(&fh).cloned()
    }

    /// Remove a handle, returning its entry
    pub fn release(&mut self, fh: u64) -> Option<HandleEntry<S>> {
        self.entries.remove(&fh)
    }

    /// Number of open handles on an inode
    pub fn open_on(&self, ino: u64) -> usize {
        self.entries.values().filter(|entry| entry.ino == ino).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S> HandleEntry<S> {
    /// Take the session out of the slot, waiting for any in-flight user.
    pub async fn take_session(&self) -> Option<S> {
        self.session.lock().await.take()
    }
}
