//! FUSE kernel bridge
//!
//! Serves a [`RawFileSystem`](common::RawFileSystem) backend over a kernel
//! channel.
//!
//! # Architecture
//!
//! - `Session`: reads frames, schedules requests and owns the reply writer
//! - `Dispatcher`: validates requests, calls the backend, builds replies
//! - `InodeTable`: inode id ↔ backend node mapping with lookup counts
//! - `HandleTable`: open file and directory sessions by handle number
//! - `Channel`: frame transport, either a device descriptor or a byte stream

mod channel;
mod dispatcher;
mod error;
mod handle_table;
mod inode_table;
mod session;

pub use channel::{
    Channel, ChannelError, DeviceChannel, DeviceReader, DeviceWriter, FrameReader, FrameWriter,
    StreamChannel, StreamReader, StreamWriter, DEFAULT_MAX_FRAME_LEN,
};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, IdentityError};
pub use handle_table::{HandleEntry, HandleKind, HandleTable};
pub use inode_table::{Forgotten, InodeTable, Registered};
pub use session::{Session, SessionError, SessionSummary};
