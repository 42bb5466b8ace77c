//! Shared helpers for playing the kernel side of a session
#![allow(dead_code)]

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use common::protocol::testkit::{encode_request, init_request};
use common::protocol::{Operation, ReplyHeader, OUT_HEADER_LEN};
use common::RawFileSystem;
use rawfs_daemon::fuse::{Channel, SessionError, SessionSummary, StreamChannel};
use rawfs_daemon::{Dispatcher, DispatcherConfig, Session};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Dispatcher with a completed init handshake
pub async fn initialized<F: RawFileSystem>(fs: F) -> Dispatcher<F> {
    initialized_with(fs, DispatcherConfig::default()).await
}

pub async fn initialized_with<F: RawFileSystem>(
    fs: F,
    config: DispatcherConfig,
) -> Dispatcher<F> {
    let dispatcher = Dispatcher::new(Arc::new(fs), config);
    dispatcher
        .init(7, 19, 128 * 1024, 0)
        .await
        .expect("init failed");
    dispatcher
}

pub fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

pub fn u64_at(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

/// One decoded directory entry from a readdir payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    pub offset: u64,
    pub kind: u32,
    pub name: String,
}

pub fn parse_dirents(mut bytes: &[u8]) -> Vec<Dirent> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        let namelen = u32_at(bytes, 16) as usize;
        entries.push(Dirent {
            ino: u64_at(bytes, 0),
            offset: u64_at(bytes, 8),
            kind: u32_at(bytes, 20),
            name: String::from_utf8(bytes[24..24 + namelen].to_vec()).unwrap(),
        });
        let packed = (24 + namelen + 7) & !7;
        bytes = &bytes[packed..];
    }
    entries
}

/// The kernel end of a stream channel
pub struct Kernel {
    stream: DuplexStream,
}

pub struct Served<F: RawFileSystem> {
    pub kernel: Kernel,
    pub dispatcher: Arc<Dispatcher<F>>,
    pub session: JoinHandle<Result<SessionSummary, SessionError>>,
}

/// Start a session over an in-memory stream
pub fn serve<F: RawFileSystem>(fs: Arc<F>, config: DispatcherConfig) -> Served<F> {
    serve_with(fs, config, |channel| channel)
}

/// Start a session over an in-memory stream wrapped by `wrap`
pub fn serve_with<F, C>(
    fs: Arc<F>,
    config: DispatcherConfig,
    wrap: impl FnOnce(StreamChannel<DuplexStream>) -> C,
) -> Served<F>
where
    F: RawFileSystem,
    C: Channel,
{
    let (kernel, daemon) = tokio::io::duplex(256 * 1024);
    let dispatcher = Arc::new(Dispatcher::new(fs, config));
    let channel = wrap(StreamChannel::new(daemon));
    let session = tokio::spawn(Session::new(dispatcher.clone(), channel).run());
    Served {
        kernel: Kernel { stream: kernel },
        dispatcher,
        session,
    }
}

impl Kernel {
    pub async fn send(&mut self, frame: &[u8]) {
        self.stream.write_all(frame).await.unwrap();
    }

    pub async fn send_op(&mut self, unique: u64, nodeid: u64, operation: &Operation) {
        self.send(&encode_request(unique, nodeid, operation)).await;
    }

    /// Next reply frame, split into header and body
    pub async fn recv(&mut self) -> (ReplyHeader, Vec<u8>) {
        let mut prefix = [0u8; 4];
        self.stream.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_le_bytes(prefix) as usize;
        let mut frame = vec![0u8; len];
        frame[..4].copy_from_slice(&prefix);
        self.stream.read_exact(&mut frame[4..]).await.unwrap();
        let header = ReplyHeader::parse(&frame).unwrap();
        (header, frame[OUT_HEADER_LEN..].to_vec())
    }

    /// Send a request and wait for its reply
    pub async fn call(
        &mut self,
        unique: u64,
        nodeid: u64,
        operation: &Operation,
    ) -> (ReplyHeader, Vec<u8>) {
        self.send_op(unique, nodeid, operation).await;
        let (header, body) = self.recv().await;
        assert_eq!(header.unique, unique);
        (header, body)
    }

    pub async fn init(&mut self) {
        self.send(&init_request(1)).await;
        let (header, _) = self.recv().await;
        assert_eq!(header.error, 0);
    }

    pub fn into_stream(self) -> DuplexStream {
        self.stream
    }
}
