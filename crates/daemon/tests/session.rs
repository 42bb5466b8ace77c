//! End-to-end sessions over an in-memory stream channel

mod support;

use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{Barrier, Semaphore};

use common::protocol::testkit::{encode_raw, init_request};
use common::protocol::{Opcode, Operation, ReplyHeader};
use common::{Entry, FileAttr, FileType, MemoryFileSystem, RawFileSystem, Status};
use rawfs_daemon::fuse::{
    Channel, ChannelError, FrameWriter, StreamChannel, StreamReader, StreamWriter,
};
use rawfs_daemon::DispatcherConfig;

use support::{init_tracing, parse_dirents, serve, serve_with, u32_at, u64_at};

const ROOT: u64 = 1;

fn sample() -> Arc<MemoryFileSystem> {
    let fs = MemoryFileSystem::new();
    fs.insert_file("hello.txt", "hello world");
    fs.insert_file("docs/a.md", "# a");
    Arc::new(fs)
}

fn lookup(name: &str) -> Operation {
    Operation::Lookup {
        name: OsString::from(name),
    }
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    init_tracing();
    let fs = sample();
    let mut served = serve(fs.clone(), DispatcherConfig::default());
    let kernel = &mut served.kernel;

    kernel.send(&init_request(1)).await;
    let (header, body) = kernel.recv().await;
    assert_eq!((header.unique, header.error), (1, 0));
    assert_eq!((u32_at(&body, 0), u32_at(&body, 4)), (7, 19));

    let (header, body) = kernel.call(2, ROOT, &lookup("hello.txt")).await;
    assert_eq!(header.error, 0);
    let ino = u64_at(&body, 0);

    let (header, body) = kernel.call(3, ino, &Operation::Open { flags: 0 }).await;
    assert_eq!(header.error, 0);
    let fh = u64_at(&body, 0);

    let read = Operation::Read {
        fh,
        offset: 6,
        size: 64,
        flags: 0,
    };
    let (header, body) = kernel.call(4, ino, &read).await;
    assert_eq!(header.error, 0);
    assert_eq!(body, b"world");

    let release = Operation::Release {
        fh,
        flags: 0,
        release_flags: 0,
        lock_owner: 0,
    };
    let (header, body) = kernel.call(5, ino, &release).await;
    assert_eq!(header.error, 0);
    assert!(body.is_empty());

    kernel.send_op(6, ino, &Operation::Forget { nlookup: 1 }).await;

    let (header, _) = kernel.call(7, 0, &Operation::Destroy).await;
    assert_eq!(header.error, 0);

    let summary = served.session.await.unwrap().unwrap();
    assert!(summary.destroyed);
    assert_eq!(summary.requests, 7);
    assert_eq!(summary.replies, 6);
    assert_eq!(fs.init_count(), 1);
    assert_eq!(fs.destroy_count(), 1);
    assert_eq!(fs.forgotten(), 1);
    assert_eq!(served.dispatcher.live_inodes(), 1);
}

#[tokio::test]
async fn test_directory_listing_over_channel() {
    let mut served = serve(sample(), DispatcherConfig::default());
    let kernel = &mut served.kernel;
    kernel.init().await;

    let (_, body) = kernel.call(2, ROOT, &Operation::OpenDir { flags: 0 }).await;
    let fh = u64_at(&body, 0);

    let readdir = Operation::ReadDir {
        fh,
        offset: 0,
        size: 4096,
    };
    let (header, body) = kernel.call(3, ROOT, &readdir).await;
    assert_eq!(header.error, 0);
    let names: Vec<_> = parse_dirents(&body).into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec![".", "..", "docs", "hello.txt"]);

    let (header, _) = kernel
        .call(4, ROOT, &Operation::ReleaseDir { fh, flags: 0 })
        .await;
    assert_eq!(header.error, 0);

    let (header, _) = kernel.call(5, ROOT, &readdir).await;
    assert_eq!(header.error, -libc::EBADF);
}

#[tokio::test]
async fn test_request_before_init_gets_eio() {
    let mut served = serve(sample(), DispatcherConfig::default());
    let kernel = &mut served.kernel;

    let (header, _) = kernel.call(9, ROOT, &Operation::StatFs).await;
    assert_eq!(header.error, -libc::EIO);

    kernel.init().await;
    let (header, _) = kernel.call(10, ROOT, &Operation::StatFs).await;
    assert_eq!(header.error, 0);

    let again = Operation::Init {
        major: 7,
        minor: 19,
        max_readahead: 0,
        flags: 0,
    };
    let (header, _) = kernel.call(11, 0, &again).await;
    assert_eq!(header.error, -libc::EPROTO);
}

#[tokio::test]
async fn test_malformed_frames_do_not_stop_the_session() {
    let mut served = serve(sample(), DispatcherConfig::default());
    let kernel = &mut served.kernel;
    kernel.init().await;

    // Frame too short for a header: dropped without a reply
    let mut short = 20u32.to_le_bytes().to_vec();
    short.extend_from_slice(&[0; 16]);
    kernel.send(&short).await;

    // Lookup without a terminated name: protocol error for that request
    kernel
        .send(&encode_raw(Opcode::Lookup as u32, 12, ROOT, b"hello.txt"))
        .await;
    let (header, _) = kernel.recv().await;
    assert_eq!((header.unique, header.error), (12, -libc::EPROTO));

    // Unsupported operation
    kernel
        .send(&encode_raw(Opcode::Unlink as u32, 13, ROOT, b"hello.txt\0"))
        .await;
    let (header, _) = kernel.recv().await;
    assert_eq!((header.unique, header.error), (13, -libc::ENOSYS));

    let (header, _) = kernel.call(14, ROOT, &lookup("hello.txt")).await;
    assert_eq!(header.error, 0);
}

#[tokio::test]
async fn test_channel_close_still_destroys() {
    let fs = sample();
    let mut served = serve(fs.clone(), DispatcherConfig::default());
    served.kernel.init().await;
    drop(served.kernel);

    let summary = served.session.await.unwrap().unwrap();
    assert!(!summary.destroyed);
    assert_eq!(fs.destroy_count(), 1);
}

/// Every lookup waits until the barrier is full
struct Rendezvous {
    barrier: Barrier,
}

#[async_trait]
impl RawFileSystem for Rendezvous {
    type Node = u64;
    type Session = ();

    fn root(&self) -> u64 {
        1
    }

    async fn lookup(&self, _parent: &u64, name: &OsStr) -> Result<Entry<u64>, Status> {
        self.barrier.wait().await;
        Ok(Entry {
            node: name.len() as u64 + 100,
            attr: FileAttr::new(FileType::RegularFile, 0),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_run_concurrently() {
    let fs = Arc::new(Rendezvous {
        barrier: Barrier::new(3),
    });
    let mut served = serve(fs, DispatcherConfig::default());
    let kernel = &mut served.kernel;
    kernel.init().await;

    kernel.send_op(2, ROOT, &lookup("a")).await;
    kernel.send_op(3, ROOT, &lookup("bb")).await;
    kernel.send_op(4, ROOT, &lookup("ccc")).await;

    let mut uniques = Vec::new();
    for _ in 0..3 {
        let (header, _) = tokio::time::timeout(Duration::from_secs(5), kernel.recv())
            .await
            .expect("lookups were serialized");
        assert_eq!(header.error, 0);
        uniques.push(header.unique);
    }
    uniques.sort_unstable();
    assert_eq!(uniques, vec![2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_background_bounds_concurrency() {
    // Three lookups that each need the other two in flight can never finish
    // with only two slots
    let fs = Arc::new(Rendezvous {
        barrier: Barrier::new(3),
    });
    let config = DispatcherConfig {
        max_background: 2,
        ..DispatcherConfig::default()
    };
    let mut served = serve(fs, config);
    let kernel = &mut served.kernel;
    kernel.init().await;

    kernel.send_op(2, ROOT, &lookup("a")).await;
    kernel.send_op(3, ROOT, &lookup("bb")).await;
    kernel.send_op(4, ROOT, &lookup("ccc")).await;

    let waited = tokio::time::timeout(Duration::from_millis(300), kernel.recv()).await;
    assert!(waited.is_err());
}

/// Panics on every getattr
struct Panicky {
    calls: AtomicUsize,
}

#[async_trait]
impl RawFileSystem for Panicky {
    type Node = u64;
    type Session = ();

    fn root(&self) -> u64 {
        1
    }

    async fn getattr(&self, _node: &u64) -> Result<FileAttr, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("backend bug");
    }

    async fn statfs(&self, _node: &u64) -> Result<common::StatFs, Status> {
        Ok(common::StatFs::default())
    }
}

#[tokio::test]
async fn test_backend_panic_becomes_eio() {
    let fs = Arc::new(Panicky {
        calls: AtomicUsize::new(0),
    });
    let mut served = serve(fs.clone(), DispatcherConfig::default());
    let kernel = &mut served.kernel;
    kernel.init().await;

    let (header, _) = kernel.call(2, ROOT, &Operation::GetAttr { fh: None }).await;
    assert_eq!(header.error, -libc::EIO);
    assert_eq!(fs.calls.load(Ordering::SeqCst), 1);

    // The pin taken by the panicked request was released
    let (header, _) = kernel.call(3, ROOT, &Operation::StatFs).await;
    assert_eq!(header.error, 0);
    assert_eq!(served.dispatcher.live_inodes(), 1);
}

/// Lookups wait for the test to open the gate
struct Gated {
    gate: Semaphore,
    forgets: AtomicUsize,
}

#[async_trait]
impl RawFileSystem for Gated {
    type Node = u64;
    type Session = ();

    fn root(&self) -> u64 {
        1
    }

    fn forget(&self, _node: &u64) {
        self.forgets.fetch_add(1, Ordering::SeqCst);
    }

    async fn lookup(&self, _parent: &u64, _name: &OsStr) -> Result<Entry<u64>, Status> {
        let _permit = self.gate.acquire().await.map_err(|_| Status::Io)?;
        Ok(Entry {
            node: 2,
            attr: FileAttr::new(FileType::RegularFile, 0),
        })
    }
}

#[tokio::test]
async fn test_undelivered_lookup_is_rolled_back() {
    let fs = Arc::new(Gated {
        gate: Semaphore::new(0),
        forgets: AtomicUsize::new(0),
    });
    let mut served = serve(fs.clone(), DispatcherConfig::default());
    served.kernel.init().await;
    served.kernel.send_op(2, ROOT, &lookup("f")).await;

    // The kernel goes away before the lookup completes
    drop(served.kernel);
    fs.gate.add_permits(1);

    let result = served.session.await.unwrap();
    assert!(result.is_err());
    assert_eq!(served.dispatcher.inode_of(&2), None);
    assert_eq!(served.dispatcher.live_inodes(), 1);
    assert_eq!(fs.forgets.load(Ordering::SeqCst), 1);
}

/// Stream channel whose writer reports some replies as abandoned by the
/// kernel, the way the device does for interrupted requests
struct Aborting {
    inner: StreamChannel<DuplexStream>,
    uniques: Vec<u64>,
}

struct AbortingWriter {
    inner: StreamWriter<DuplexStream>,
    uniques: Vec<u64>,
}

impl Channel for Aborting {
    type Reader = StreamReader<DuplexStream>;
    type Writer = AbortingWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (reader, writer) = self.inner.split();
        let writer = AbortingWriter {
            inner: writer,
            uniques: self.uniques,
        };
        (reader, writer)
    }
}

#[async_trait]
impl FrameWriter for AbortingWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        let header =
            ReplyHeader::parse(frame).map_err(|_| ChannelError::FrameTooShort(frame.len()))?;
        if self.uniques.contains(&header.unique) {
            return Err(ChannelError::ReplyAborted);
        }
        self.inner.write_frame(frame).await
    }
}

#[tokio::test]
async fn test_aborted_open_replies_release_their_handles() {
    init_tracing();
    let fs = sample();
    let mut served = serve_with(fs.clone(), DispatcherConfig::default(), |inner| Aborting {
        inner,
        uniques: vec![3, 4],
    });
    let kernel = &mut served.kernel;
    kernel.init().await;

    let (header, body) = kernel.call(2, ROOT, &lookup("hello.txt")).await;
    assert_eq!(header.error, 0);
    let ino = u64_at(&body, 0);

    kernel.send_op(3, ino, &Operation::Open { flags: 0 }).await;
    kernel.send_op(4, ROOT, &Operation::OpenDir { flags: 0 }).await;
    let (header, _) = kernel.call(5, 0, &Operation::Destroy).await;
    assert_eq!(header.error, 0);

    let summary = served.session.await.unwrap().unwrap();
    assert!(summary.destroyed);
    assert_eq!(served.dispatcher.open_handles(), 0);
    assert_eq!(fs.open_sessions(), 0);
    assert_eq!(served.dispatcher.lookup_count(ino), Some(1));

    // Only the kernel's own lookup reference keeps the file alive now
    served.dispatcher.forget(ino, 1);
    assert_eq!(served.dispatcher.live_inodes(), 1);
    assert_eq!(fs.forgotten(), 1);
}
