//! Request decoding

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;

use bytes::Buf;

use super::{require, DecodeError, Opcode, FUSE_GETATTR_FH, IN_HEADER_LEN};

/// The fixed header at the start of every request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub len: u32,
    pub opcode: u32,
    /// Tag echoed on the reply so the kernel can match it
    pub unique: u64,
    /// Target inode (the parent directory for lookups)
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl RequestHeader {
    /// Parse only the header of a frame.
    ///
    /// This succeeds whenever 40 bytes are available, which lets a caller
    /// answer a malformed request with an error that echoes its tag.
    pub fn parse(frame: &[u8]) -> Result<Self, DecodeError> {
        require(frame, IN_HEADER_LEN)?;
        let mut buf = frame;
        let header = Self {
            len: buf.get_u32_le(),
            opcode: buf.get_u32_le(),
            unique: buf.get_u64_le(),
            nodeid: buf.get_u64_le(),
            uid: buf.get_u32_le(),
            gid: buf.get_u32_le(),
            pid: buf.get_u32_le(),
        };
        Ok(header)
    }
}

/// One entry of a batched forget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForgetOne {
    pub nodeid: u64,
    pub nlookup: u64,
}

/// Operation-specific payload of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Init {
        major: u32,
        minor: u32,
        max_readahead: u32,
        flags: u32,
    },
    Destroy,
    /// Resolve `name` inside the directory `header.nodeid`
    Lookup { name: OsString },
    Forget { nlookup: u64 },
    BatchForget { nodes: Vec<ForgetOne> },
    GetAttr { fh: Option<u64> },
    StatFs,
    Open { flags: u32 },
    Read {
        fh: u64,
        offset: u64,
        size: u32,
        flags: u32,
    },
    Release {
        fh: u64,
        flags: u32,
        release_flags: u32,
        lock_owner: u64,
    },
    OpenDir { flags: u32 },
    ReadDir { fh: u64, offset: u64, size: u32 },
    ReleaseDir { fh: u64, flags: u32 },
    /// Kernel asks to interrupt the request tagged `unique`
    Interrupt { unique: u64 },
    /// An opcode of the ABI this bridge does not dispatch
    Unsupported(Opcode),
}

/// A fully decoded request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: RequestHeader,
    pub operation: Operation,
}

impl Request {
    /// Decode a complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let header = RequestHeader::parse(frame)?;
        if header.len as usize != frame.len() {
            return Err(DecodeError::LengthMismatch {
                declared: header.len as usize,
                actual: frame.len(),
            });
        }
        let opcode = Opcode::try_from(header.opcode).map_err(DecodeError::UnknownOpcode)?;
        let operation = decode_operation(opcode, &frame[IN_HEADER_LEN..])?;
        Ok(Self { header, operation })
    }

    /// Tag to echo on the reply
    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Target inode of the request
    pub fn nodeid(&self) -> u64 {
        self.header.nodeid
    }
}

fn decode_operation(opcode: Opcode, body: &[u8]) -> Result<Operation, DecodeError> {
    let mut buf = body;
    let operation = match opcode {
        Opcode::Init => {
            require(buf, 16)?;
            Operation::Init {
                major: buf.get_u32_le(),
                minor: buf.get_u32_le(),
                max_readahead: buf.get_u32_le(),
                flags: buf.get_u32_le(),
            }
        }
        Opcode::Destroy => Operation::Destroy,
        Opcode::Lookup => Operation::Lookup {
            name: decode_name(buf)?,
        },
        Opcode::Forget => {
            require(buf, 8)?;
            Operation::Forget {
                nlookup: buf.get_u64_le(),
            }
        }
        Opcode::BatchForget => {
            require(buf, 8)?;
            let count = buf.get_u32_le() as usize;
            let _dummy = buf.get_u32_le();
            require(buf, count.saturating_mul(16))?;
            let nodes = (0..count)
                .map(|_| ForgetOne {
                    nodeid: buf.get_u64_le(),
                    nlookup: buf.get_u64_le(),
                })
                .collect();
            Operation::BatchForget { nodes }
        }
        Opcode::GetAttr => {
            // Protocol minors below 9 send no getattr_in at all
            if buf.is_empty() {
                Operation::GetAttr { fh: None }
            } else {
                require(buf, 16)?;
                let getattr_flags = buf.get_u32_le();
                let _dummy = buf.get_u32_le();
                let fh = buf.get_u64_le();
                Operation::GetAttr {
                    fh: (getattr_flags & FUSE_GETATTR_FH != 0).then_some(fh),
                }
            }
        }
        Opcode::StatFs => Operation::StatFs,
        Opcode::Open | Opcode::OpenDir => {
            require(buf, 4)?;
            let flags = buf.get_u32_le();
            if opcode == Opcode::Open {
                Operation::Open { flags }
            } else {
                Operation::OpenDir { flags }
            }
        }
        Opcode::Read | Opcode::ReadDir => {
            // fh, offset, size, read_flags; later minors append lock_owner and flags
            require(buf, 24)?;
            let fh = buf.get_u64_le();
            let offset = buf.get_u64_le();
            let size = buf.get_u32_le();
            let _read_flags = buf.get_u32_le();
            let flags = if buf.remaining() >= 16 {
                let _lock_owner = buf.get_u64_le();
                buf.get_u32_le()
            } else {
                0
            };
            if opcode == Opcode::Read {
                Operation::Read {
                    fh,
                    offset,
                    size,
                    flags,
                }
            } else {
                Operation::ReadDir { fh, offset, size }
            }
        }
        Opcode::Release | Opcode::ReleaseDir => {
            require(buf, 16)?;
            let fh = buf.get_u64_le();
            let flags = buf.get_u32_le();
            let release_flags = buf.get_u32_le();
            let lock_owner = if buf.remaining() >= 8 {
                buf.get_u64_le()
            } else {
                0
            };
            if opcode == Opcode::Release {
                Operation::Release {
                    fh,
                    flags,
                    release_flags,
                    lock_owner,
                }
            } else {
                Operation::ReleaseDir { fh, flags }
            }
        }
        Opcode::Interrupt => {
            require(buf, 8)?;
            Operation::Interrupt {
                unique: buf.get_u64_le(),
            }
        }
        other => Operation::Unsupported(other),
    };
    Ok(operation)
}

fn decode_name(body: &[u8]) -> Result<OsString, DecodeError> {
    let end = body
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingNul)?;
    Ok(std::ffi::OsStr::from_bytes(&body[..end]).to_os_string())
}
