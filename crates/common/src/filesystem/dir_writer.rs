//! Size-bounded sink for directory entries
//!
//! Entries are packed in the kernel's dirent layout as they are added:
//!
//! ```text
//! ino u64 | off u64 | namelen u32 | type u32 | name | zero padding to 8 bytes
//! ```

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::attr::FileType;

/// Size of the fixed part of one packed entry
pub const DIRENT_HEADER_LEN: usize = 24;

/// One directory entry offered to a [`DirEntryWriter`]
#[derive(Debug, Clone, Copy)]
pub struct DirEntry<'a> {
    /// Inode number reported in `d_ino`
    pub ino: u64,
    /// Cursor that resumes the listing right after this entry
    pub offset: u64,
    pub kind: FileType,
    pub name: &'a OsStr,
}

impl DirEntry<'_> {
    /// Bytes this entry occupies once packed
    pub fn packed_len(&self) -> usize {
        (DIRENT_HEADER_LEN + self.name.len()).next_multiple_of(8)
    }
}

/// Accumulates packed entries up to a byte budget.
///
/// Once an entry does not fit, [`DirEntryWriter::try_add`] returns false and
/// the caller stops. Entries already added are never retracted.
#[derive(Debug)]
pub struct DirEntryWriter {
    buf: BytesMut,
    budget: usize,
    entries: usize,
}

impl DirEntryWriter {
    pub fn new(budget: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(budget.min(64 * 1024)),
            budget,
            entries: 0,
        }
    }

    /// Append `entry` if it fits in the remaining budget.
    pub fn try_add(&mut self, entry: DirEntry<'_>) -> bool {
        let packed = entry.packed_len();
        if packed > self.remaining() {
            return false;
        }

        let name = entry.name.as_bytes();
        self.buf.put_u64_le(entry.ino);
        self.buf.put_u64_le(entry.offset);
        self.buf.put_u32_le(name.len() as u32);
        self.buf.put_u32_le(entry.kind.dirent_type());
        self.buf.put_slice(name);
        self.buf.put_bytes(0, packed - DIRENT_HEADER_LEN - name.len());
        self.entries += 1;
        true
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes still available under the budget
    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.buf.len())
    }

    /// Number of entries written so far
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}
