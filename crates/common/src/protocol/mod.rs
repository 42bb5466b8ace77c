//! Kernel channel wire protocol
//!
//! Frames on the channel follow the FUSE device ABI. Every request starts
//! with a 40 byte in-header and every reply with a 16 byte out-header, all
//! fields little-endian:
//!
//! ```text
//! in-header:  len u32 | opcode u32 | unique u64 | nodeid u64
//!             uid u32 | gid u32 | pid u32 | pad u32
//! out-header: len u32 | error i32  | unique u64
//! ```
//!
//! Decoding and encoding are pure transforms over byte slices; nothing here
//! touches the channel.

mod request;
pub mod reply;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use reply::{AttrOut, EntryOut, InitOut, OpenOut, Reply, ReplyHeader};
pub use request::{ForgetOne, Operation, Request, RequestHeader};

/// Protocol major version spoken by this bridge
pub const KERNEL_VERSION: u32 = 7;
/// Highest protocol minor version spoken by this bridge
pub const KERNEL_MINOR_VERSION: u32 = 19;

/// Size of the request header
pub const IN_HEADER_LEN: usize = 40;
/// Size of the reply header
pub const OUT_HEADER_LEN: usize = 16;

/// `getattr_flags` bit: the `fh` field is valid
pub const FUSE_GETATTR_FH: u32 = 1 << 0;

/// Declares the opcode table once and derives the conversions from it.
macro_rules! opcodes {
    ($($name:ident = $value:literal),* $(,)?) => {
        /// Every opcode in the FUSE device ABI
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl TryFrom<u32> for Opcode {
            type Error = u32;

            fn try_from(value: u32) -> Result<Self, u32> {
                match value {
                    $($value => Ok(Opcode::$name),)*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    Lookup = 1,
    Forget = 2,
    GetAttr = 3,
    SetAttr = 4,
    ReadLink = 5,
    Symlink = 6,
    MkNod = 8,
    MkDir = 9,
    Unlink = 10,
    RmDir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    StatFs = 17,
    Release = 18,
    Fsync = 20,
    SetXattr = 21,
    GetXattr = 22,
    ListXattr = 23,
    RemoveXattr = 24,
    Flush = 25,
    Init = 26,
    OpenDir = 27,
    ReadDir = 28,
    ReleaseDir = 29,
    FsyncDir = 30,
    GetLk = 31,
    SetLk = 32,
    SetLkW = 33,
    Access = 34,
    Create = 35,
    Interrupt = 36,
    Bmap = 37,
    Destroy = 38,
    Ioctl = 39,
    Poll = 40,
    NotifyReply = 41,
    BatchForget = 42,
    Fallocate = 43,
    ReadDirPlus = 44,
    Rename2 = 45,
    Lseek = 46,
    CopyFileRange = 47,
}

impl Opcode {
    /// Whether the kernel expects a reply frame for this opcode
    pub fn expects_reply(self) -> bool {
        !matches!(
            self,
            Opcode::Forget | Opcode::BatchForget | Opcode::Interrupt | Opcode::NotifyReply
        )
    }
}

/// Structurally invalid channel input
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the fixed layout requires
    #[error("truncated frame: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    /// The header's length field disagrees with the frame size
    #[error("length mismatch: header declares {declared} bytes, frame has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    /// Opcode number outside the ABI
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    /// A name argument without its terminating NUL
    #[error("name is not NUL-terminated")]
    MissingNul,
}

/// Fail with [`DecodeError::Truncated`] unless `bytes` holds at least `needed` bytes.
pub(crate) fn require(bytes: &[u8], needed: usize) -> Result<(), DecodeError> {
    if bytes.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}
