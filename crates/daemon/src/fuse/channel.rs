//! Kernel channel transports
//!
//! A channel carries whole request frames in and whole reply frames out.
//! Two transports are provided:
//!
//! - [`DeviceChannel`]: an already-open FUSE device descriptor, where each
//!   read returns exactly one request and each write submits one reply
//! - [`StreamChannel`]: any byte stream, with frames delimited by the
//!   length field at the start of every header (used by tests and by
//!   bridges that tunnel the protocol over a socket)

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Largest frame a stream channel accepts by default
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;

/// Room for headers on top of `max_write` when sizing the device buffer
const DEVICE_BUFFER_OVERHEAD: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame length {0} is smaller than its own length field")]
    FrameTooShort(usize),
    #[error("channel closed in the middle of a frame")]
    Truncated,
    /// The kernel no longer waits for this reply (the request was
    /// interrupted or the caller went away)
    #[error("reply target no longer exists")]
    ReplyAborted,
}

/// Receiving side of a channel
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Next request frame, `None` once the peer has closed the channel.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError>;
}

/// Sending side of a channel
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ChannelError>;
}

/// A bidirectional kernel channel
pub trait Channel: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    /// Split into halves that can be driven from separate tasks
    fn split(self) -> (Self::Reader, Self::Writer);
}

// ========================================
// Stream transport
// ========================================

#[derive(Debug)]
pub struct StreamChannel<S> {
    stream: S,
    max_frame_len: usize,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl<S> Channel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = StreamReader<S>;
    type Writer = StreamWriter<S>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = tokio::io::split(self.stream);
        (
            StreamReader {
                inner: read,
                max_frame_len: self.max_frame_len,
            },
            StreamWriter { inner: write },
        )
    }
}

pub struct StreamReader<S> {
    inner: ReadHalf<S>,
    max_frame_len: usize,
}

#[async_trait]
impl<S> FrameReader for StreamReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut prefix = [0u8; 4];
        match self.inner.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let len = u32::from_le_bytes(prefix) as usize;
        if len < prefix.len() {
            return Err(ChannelError::FrameTooShort(len));
        }
        if len > self.max_frame_len {
            return Err(ChannelError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let mut frame = vec![0u8; len];
        frame[..4].copy_from_slice(&prefix);
        match self.inner.read_exact(&mut frame[4..]).await {
            Ok(_) => Ok(Some(frame)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ChannelError::Truncated)
            }
            Err(err) => Err(err.into()),
        }
    }
}

pub struct StreamWriter<S> {
    inner: WriteHalf<S>,
}

#[async_trait]
impl<S> FrameWriter for StreamWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

// ========================================
// Device transport
// ========================================

/// An open FUSE device descriptor handed over by whoever mounted the
/// filesystem.
///
/// Device reads block until the kernel queues a request, so each read and
/// write runs on the blocking pool.
#[derive(Debug)]
pub struct DeviceChannel {
    device: Arc<File>,
    buffer_len: usize,
}

impl DeviceChannel {
    /// Wrap a device descriptor. The read buffer must fit the largest write
    /// the kernel may send, so it is sized from the negotiated `max_write`.
    pub fn new(fd: OwnedFd, max_write: u32) -> Self {
        Self {
            device: Arc::new(File::from(fd)),
            buffer_len: max_write as usize + DEVICE_BUFFER_OVERHEAD,
        }
    }
}

impl Channel for DeviceChannel {
    type Reader = DeviceReader;
    type Writer = DeviceWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            DeviceReader {
                device: self.device.clone(),
                buffer: vec![0u8; self.buffer_len],
            },
            DeviceWriter {
                device: self.device,
            },
        )
    }
}

pub struct DeviceReader {
    device: Arc<File>,
    buffer: Vec<u8>,
}

#[async_trait]
impl FrameReader for DeviceReader {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        loop {
            let device = self.device.clone();
            let mut buffer = std::mem::take(&mut self.buffer);
            let (buffer, result) = tokio::task::spawn_blocking(move || {
                let result = (&*device).read(&mut buffer);
                (buffer, result)
            })
            .await
            .map_err(|err| ChannelError::Io(io::Error::other(err)))?;

            let frame = match result {
                Ok(0) => None,
                Ok(n) => Some(buffer[..n].to_vec()),
                Err(err) => match err.raw_os_error() {
                    // Request interrupted before we read it; try again
                    Some(libc::ENOENT) | Some(libc::EINTR) | Some(libc::EAGAIN) => {
                        self.buffer = buffer;
                        continue;
                    }
                    // Filesystem unmounted
                    Some(libc::ENODEV) => None,
                    _ => return Err(err.into()),
                },
            };
            self.buffer = buffer;
            return Ok(frame);
        }
    }
}

pub struct DeviceWriter {
    device: Arc<File>,
}

#[async_trait]
impl FrameWriter for DeviceWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        let device = self.device.clone();
        let frame = frame.to_vec();
        let result =
            tokio::task::spawn_blocking(move || (&*device).write(&frame).map(|n| (n, frame.len())))
                .await
                .map_err(|err| ChannelError::Io(io::Error::other(err)))?;

        match result {
            Ok((written, len)) if written == len => Ok(()),
            Ok((written, len)) => Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to device: {written} of {len} bytes"),
            ))),
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Err(ChannelError::ReplyAborted),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut frame = ((body.len() + 4) as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    #[tokio::test]
    async fn test_stream_frames_round_trip() {
        let (kernel, daemon) = tokio::io::duplex(1024);
        let (mut reader, _writer) = StreamChannel::new(daemon).split();
        let (_kernel_reader, mut kernel_writer) = StreamChannel::new(kernel).split();

        kernel_writer.write_frame(&frame(b"first")).await.unwrap();
        kernel_writer.write_frame(&frame(b"second")).await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), Some(frame(b"first")));
        assert_eq!(reader.read_frame().await.unwrap(), Some(frame(b"second")));
    }

    #[tokio::test]
    async fn test_stream_eof_between_frames_is_close() {
        let (kernel, daemon) = tokio::io::duplex(64);
        let (mut reader, _writer) = StreamChannel::new(daemon).split();
        drop(kernel);
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stream_eof_inside_frame_is_error() {
        let (mut kernel, daemon) = tokio::io::duplex(64);
        let (mut reader, _writer) = StreamChannel::new(daemon).split();
        kernel.write_all(&100u32.to_le_bytes()).await.unwrap();
        kernel.write_all(b"partial").await.unwrap();
        drop(kernel);
        assert!(matches!(
            reader.read_frame().await,
            Err(ChannelError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_stream_rejects_oversized_frames() {
        let (mut kernel, daemon) = tokio::io::duplex(64);
        let (mut reader, _writer) = StreamChannel::new(daemon).with_max_frame_len(16).split();
        kernel.write_all(&17u32.to_le_bytes()).await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(ChannelError::FrameTooLarge { len: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_stream_rejects_impossible_length() {
        let (mut kernel, daemon) = tokio::io::duplex(64);
        let (mut reader, _writer) = StreamChannel::new(daemon).split();
        kernel.write_all(&2u32.to_le_bytes()).await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(ChannelError::FrameTooShort(2))
        ));
    }

    #[tokio::test]
    async fn test_device_channel_over_pipe() {
        // A pipe behaves like the device for whole-message reads and writes
        let (read_end, write_end) = pipe();
        let (_, mut writer) = DeviceChannel::new(write_end, 4096).split();
        let (mut reader, _) = DeviceChannel::new(read_end, 4096).split();

        writer.write_frame(&frame(b"request")).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), Some(frame(b"request")));

        drop(writer);
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        use std::os::fd::FromRawFd;

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }
}
