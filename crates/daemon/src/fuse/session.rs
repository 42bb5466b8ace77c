//! Session loop
//!
//! Reads request frames from a channel and feeds them to the dispatcher.
//! Lifecycle and bookkeeping requests (init, forget, interrupt, destroy) are
//! handled inline in arrival order; everything else runs as a spawned task,
//! up to `max_background` at a time. Replies funnel through a queue to a
//! single writer task, so frames are never interleaved on the channel.
//!
//! A successful reply that cannot be delivered is rolled back, since the
//! kernel never learned what it handed out: a lookup with a forget of one,
//! an open or opendir with a release of the new handle.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use common::filesystem::RawFileSystem;
use common::protocol::{Operation, Reply, Request, RequestHeader};

use super::channel::{Channel, ChannelError, FrameReader, FrameWriter};
use super::dispatcher::Dispatcher;
use super::handle_table::HandleKind;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Counters reported when a session ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub requests: u64,
    pub replies: u64,
    /// The session ended on a destroy request rather than channel close
    pub destroyed: bool,
}

/// A reply waiting for the writer
struct Outgoing {
    frame: Vec<u8>,
    /// Undo applied if the reply never reaches the kernel
    rollback: Option<Rollback>,
}

/// Identity handed out by a successful reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rollback {
    /// Lookup reference on an inode
    Forget(u64),
    /// Freshly opened handle
    Release { ino: u64, fh: u64, kind: HandleKind },
}

impl Rollback {
    /// What to undo if `reply` to a request of the given shape is lost
    fn for_reply(grant: Option<Grant>, nodeid: u64, reply: &Reply) -> Option<Self> {
        match (grant?, reply) {
            (Grant::Entry, Reply::Entry(entry)) => Some(Rollback::Forget(entry.nodeid)),
            (Grant::Handle(kind), Reply::Open(open)) => Some(Rollback::Release {
                ino: nodeid,
                fh: open.fh,
                kind,
            }),
            _ => None,
        }
    }
}

/// Requests whose success hands an identity to the kernel
#[derive(Debug, Clone, Copy)]
enum Grant {
    Entry,
    Handle(HandleKind),
}

fn grant_of(operation: &Operation) -> Option<Grant> {
    match operation {
        Operation::Lookup { .. } => Some(Grant::Entry),
        Operation::Open { .. } => Some(Grant::Handle(HandleKind::File)),
        Operation::OpenDir { .. } => Some(Grant::Handle(HandleKind::Directory)),
        _ => None,
    }
}

pub struct Session<F: RawFileSystem, C: Channel> {
    dispatcher: Arc<Dispatcher<F>>,
    channel: C,
}

impl<F: RawFileSystem, C: Channel> Session<F, C> {
    pub fn new(dispatcher: Arc<Dispatcher<F>>, channel: C) -> Self {
        Self {
            dispatcher,
            channel,
        }
    }

    /// Serve the channel until destroy, channel close or a fatal channel
    /// error. In-flight requests are always drained and the backend's
    /// destroy hook always runs before this returns.
    pub async fn run(self) -> Result<SessionSummary, SessionError> {
        let dispatcher = self.dispatcher;
        let (mut reader, writer) = self.channel.split();

        let (tx, rx) = flume::unbounded::<Outgoing>();
        let writer_failed = Arc::new(Notify::new());
        let writer_task = tokio::spawn(write_replies(
            writer,
            rx,
            dispatcher.clone(),
            writer_failed.clone(),
        ));

        let limit = Arc::new(Semaphore::new(
            dispatcher.config().max_background.max(1) as usize
        ));
        let mut tasks = JoinSet::new();
        let mut summary = SessionSummary::default();
        let mut destroy_unique = None;

        let outcome: Result<(), ChannelError> = loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let frame = tokio::select! {
                frame = reader.read_frame() => frame,
                _ = writer_failed.notified() => {
                    tracing::error!("reply writer failed, stopping session");
                    break Ok(());
                }
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("channel closed");
                    break Ok(());
                }
                Err(err) => break Err(err),
            };
            summary.requests += 1;

            let header = match RequestHeader::parse(&frame) {
                Ok(header) => header,
                Err(err) => {
                    tracing::warn!(len = frame.len(), "dropping unreadable frame: {}", err);
                    continue;
                }
            };
            let request = match Request::decode(&frame) {
                Ok(request) => request,
                Err(err) => {
                    if let Some(reply) = dispatcher.reject(&header, err.into()) {
                        deliver(&dispatcher, &tx, reply.encode(header.unique), None).await;
                    }
                    continue;
                }
            };

            match request.operation {
                Operation::Destroy => {
                    destroy_unique = Some(header.unique);
                    break Ok(());
                }
                Operation::Init { .. }
                | Operation::Forget { .. }
                | Operation::BatchForget { .. }
                | Operation::Interrupt { .. } => {
                    if let Some(reply) = dispatcher.handle(request).await {
                        deliver(&dispatcher, &tx, reply.encode(header.unique), None).await;
                    }
                    continue;
                }
                _ => {}
            }

            let permit = match limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break Ok(()),
            };
            let dispatcher = dispatcher.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let unique = request.unique();
                let nodeid = request.nodeid();
                let grant = grant_of(&request.operation);

                let reply = match AssertUnwindSafe(dispatcher.handle(request))
                    .catch_unwind()
                    .await
                {
                    Ok(reply) => reply,
                    Err(_) => {
                        tracing::error!(unique, "request handler panicked");
                        Some(Reply::Error(libc::EIO))
                    }
                };

                if let Some(reply) = reply {
                    let rollback = Rollback::for_reply(grant, nodeid, &reply);
                    deliver(&dispatcher, &tx, reply.encode(unique), rollback).await;
                }
            });
        };

        // Teardown: drain requests and the reply queue, destroy once, then
        // acknowledge destroy
        if !tasks.is_empty() {
            tracing::debug!(in_flight = tasks.len(), "draining in-flight requests");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        drop(tx);
        let flushed = match writer_task.await {
            Ok(flushed) => Some(flushed),
            Err(err) => {
                tracing::error!("reply writer task failed: {}", err);
                None
            }
        };

        dispatcher.destroy().await;
        summary.destroyed = destroy_unique.is_some();

        let written = match flushed {
            Some((mut writer, Ok(written))) => match destroy_unique {
                Some(unique) => match writer.write_frame(&Reply::Empty.encode(unique)).await {
                    Ok(()) => Ok(written + 1),
                    Err(ChannelError::ReplyAborted) => Ok(written),
                    Err(err) => Err(err),
                },
                None => Ok(written),
            },
            Some((_, Err(err))) => Err(err),
            None => Ok(0),
        };
        outcome?;
        summary.replies = written?;

        tracing::info!(
            requests = summary.requests,
            replies = summary.replies,
            destroyed = summary.destroyed,
            "session finished"
        );
        Ok(summary)
    }
}

/// Queue a reply, rolling it back if the writer is gone.
async fn deliver<F: RawFileSystem>(
    dispatcher: &Dispatcher<F>,
    tx: &flume::Sender<Outgoing>,
    frame: Vec<u8>,
    rollback: Option<Rollback>,
) {
    if let Err(flume::SendError(outgoing)) = tx.send(Outgoing { frame, rollback }) {
        undo(dispatcher, outgoing.rollback).await;
    }
}

/// Write queued replies until every sender is gone, then hand the writer
/// back.
///
/// After a fatal write error the queue is still drained so that pending
/// replies get rolled back; the first error is returned at the end.
async fn write_replies<W: FrameWriter, F: RawFileSystem>(
    mut writer: W,
    rx: flume::Receiver<Outgoing>,
    dispatcher: Arc<Dispatcher<F>>,
    failed: Arc<Notify>,
) -> (W, Result<u64, ChannelError>) {
    let mut written = 0;
    let mut fatal = None;

    while let Ok(outgoing) = rx.recv_async().await {
        if fatal.is_some() {
            undo(&dispatcher, outgoing.rollback).await;
            continue;
        }
        match writer.write_frame(&outgoing.frame).await {
            Ok(()) => written += 1,
            Err(ChannelError::ReplyAborted) => {
                tracing::debug!("kernel dropped the request before its reply");
                undo(&dispatcher, outgoing.rollback).await;
            }
            Err(err) => {
                tracing::error!("failed to write reply: {}", err);
                undo(&dispatcher, outgoing.rollback).await;
                fatal = Some(err);
                failed.notify_one();
            }
        }
    }

    let result = match fatal {
        Some(err) => Err(err),
        None => Ok(written),
    };
    (writer, result)
}

async fn undo<F: RawFileSystem>(dispatcher: &Dispatcher<F>, rollback: Option<Rollback>) {
    match rollback {
        Some(Rollback::Forget(ino)) => {
            tracing::debug!(ino, "rolling back undelivered lookup");
            dispatcher.forget(ino, 1);
        }
        Some(Rollback::Release { ino, fh, kind }) => {
            tracing::debug!(ino, fh, ?kind, "releasing undelivered handle");
            let result = match kind {
                HandleKind::File => dispatcher.release(ino, fh, 0).await,
                HandleKind::Directory => dispatcher.releasedir(ino, fh, 0).await,
            };
            if let Err(err) = result {
                tracing::warn!(ino, fh, "release of undelivered handle failed: {}", err);
            }
        }
        None => {}
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::error!("request task failed: {}", err);
    }
}
