//! Reply encoding

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};

use super::{require, DecodeError, OUT_HEADER_LEN};
use crate::attr::{epoch_parts, FileAttr, StatFs};

/// Size of the encoded `fuse_attr` struct
pub const ATTR_LEN: usize = 88;
/// Size of the encoded `fuse_entry_out` struct
pub const ENTRY_OUT_LEN: usize = 40 + ATTR_LEN;
/// Size of the encoded `fuse_attr_out` struct
pub const ATTR_OUT_LEN: usize = 16 + ATTR_LEN;
/// Size of the encoded `fuse_open_out` struct
pub const OPEN_OUT_LEN: usize = 16;
/// Size of the encoded `fuse_kstatfs` struct
pub const STATFS_OUT_LEN: usize = 80;
/// Size of the encoded `fuse_init_out` struct for protocol 7.19
pub const INIT_OUT_LEN: usize = 24;
/// Largest errno the kernel accepts in a reply header
pub const MAX_ERRNO: i32 = 511;

/// Answer to a successful lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: Duration,
    pub attr_valid: Duration,
    pub attr: FileAttr,
}

/// Answer to a successful getattr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrOut {
    pub attr_valid: Duration,
    pub attr: FileAttr,
}

/// Answer to a successful open or opendir
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
}

/// Answer to the init handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
}

/// A reply body, ready to be framed with the request's tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Success with no payload
    Empty,
    /// Failure with a positive errno value
    Error(i32),
    Init(InitOut),
    Entry(EntryOut),
    Attr(AttrOut),
    Open(OpenOut),
    StatFs(StatFs),
    /// Raw payload (file data or packed directory entries)
    Data(Bytes),
}

impl Reply {
    /// Frame this reply for the request tagged `unique`.
    pub fn encode(&self, unique: u64) -> Vec<u8> {
        let mut body = Vec::new();
        let error = match self {
            Reply::Empty => 0,
            Reply::Error(errno) => -checked_errno(*errno),
            Reply::Init(init) => {
                put_init(&mut body, init);
                0
            }
            Reply::Entry(entry) => {
                put_entry(&mut body, entry);
                0
            }
            Reply::Attr(attr) => {
                put_attr_out(&mut body, attr);
                0
            }
            Reply::Open(open) => {
                body.put_u64_le(open.fh);
                body.put_u32_le(open.open_flags);
                body.put_u32_le(0);
                0
            }
            Reply::StatFs(stat) => {
                put_statfs(&mut body, stat);
                0
            }
            Reply::Data(data) => {
                body.extend_from_slice(data);
                0
            }
        };

        let mut frame = Vec::with_capacity(OUT_HEADER_LEN + body.len());
        frame.put_u32_le((OUT_HEADER_LEN + body.len()) as u32);
        frame.put_i32_le(error);
        frame.put_u64_le(unique);
        frame.extend_from_slice(&body);
        frame
    }
}

/// Errno values outside `1..=MAX_ERRNO` would turn a failure into success
/// or get the reply rejected by the kernel, so they are sent as EIO.
fn checked_errno(errno: i32) -> i32 {
    if (1..=MAX_ERRNO).contains(&errno) {
        errno
    } else {
        tracing::error!(errno, "invalid errno in reply, sending EIO");
        libc::EIO
    }
}

/// The fixed header at the start of every reply frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub len: u32,
    /// Zero on success, otherwise a negated errno
    pub error: i32,
    pub unique: u64,
}

impl ReplyHeader {
    pub fn parse(frame: &[u8]) -> Result<Self, DecodeError> {
        require(frame, OUT_HEADER_LEN)?;
        let mut buf = frame;
        Ok(Self {
            len: buf.get_u32_le(),
            error: buf.get_i32_le(),
            unique: buf.get_u64_le(),
        })
    }
}

fn put_duration(out: &mut Vec<u8>, d: Duration) -> u32 {
    out.put_u64_le(d.as_secs());
    d.subsec_nanos()
}

fn put_entry(out: &mut Vec<u8>, entry: &EntryOut) {
    out.put_u64_le(entry.nodeid);
    out.put_u64_le(entry.generation);
    let entry_nsec = put_duration(out, entry.entry_valid);
    let attr_nsec = put_duration(out, entry.attr_valid);
    out.put_u32_le(entry_nsec);
    out.put_u32_le(attr_nsec);
    put_attr(out, &entry.attr);
}

fn put_attr_out(out: &mut Vec<u8>, attr: &AttrOut) {
    let nsec = put_duration(out, attr.attr_valid);
    out.put_u32_le(nsec);
    out.put_u32_le(0);
    put_attr(out, &attr.attr);
}

fn put_attr(out: &mut Vec<u8>, attr: &FileAttr) {
    let (atime, atime_nsec) = epoch_parts(attr.atime);
    let (mtime, mtime_nsec) = epoch_parts(attr.mtime);
    let (ctime, ctime_nsec) = epoch_parts(attr.ctime);
    out.put_u64_le(attr.ino);
    out.put_u64_le(attr.size);
    out.put_u64_le(attr.blocks);
    out.put_u64_le(atime);
    out.put_u64_le(mtime);
    out.put_u64_le(ctime);
    out.put_u32_le(atime_nsec);
    out.put_u32_le(mtime_nsec);
    out.put_u32_le(ctime_nsec);
    out.put_u32_le(attr.mode());
    out.put_u32_le(attr.nlink);
    out.put_u32_le(attr.uid);
    out.put_u32_le(attr.gid);
    out.put_u32_le(attr.rdev);
    out.put_u32_le(attr.blksize);
    out.put_u32_le(0);
}

fn put_statfs(out: &mut Vec<u8>, stat: &StatFs) {
    out.put_u64_le(stat.blocks);
    out.put_u64_le(stat.bfree);
    out.put_u64_le(stat.bavail);
    out.put_u64_le(stat.files);
    out.put_u64_le(stat.ffree);
    out.put_u32_le(stat.bsize);
    out.put_u32_le(stat.namelen);
    out.put_u32_le(stat.frsize);
    out.put_u32_le(0);
    out.put_bytes(0, 6 * 4);
}

fn put_init(out: &mut Vec<u8>, init: &InitOut) {
    out.put_u32_le(init.major);
    out.put_u32_le(init.minor);
    out.put_u32_le(init.max_readahead);
    out.put_u32_le(init.flags);
    out.put_u16_le(init.max_background);
    out.put_u16_le(init.congestion_threshold);
    out.put_u32_le(init.max_write);
}
