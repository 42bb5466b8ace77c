//! Request dispatcher
//!
//! Validates each decoded request against the identity tables, calls the
//! matching backend method, updates the tables and translates the outcome
//! into a reply.
//!
//! Table locks are only held for the bookkeeping itself, never across a
//! backend call: a request pins the inodes it works on, releases the lock,
//! awaits the backend and re-locks only to record the result.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use common::filesystem::{ConnInfo, DirEntryWriter, RawFileSystem};
use common::protocol::{
    AttrOut, EntryOut, ForgetOne, InitOut, OpenOut, Opcode, Operation, Reply, Request,
    RequestHeader, KERNEL_MINOR_VERSION, KERNEL_VERSION,
};
use common::{FileAttr, StatFs, Status};

use super::error::{DispatchError, IdentityError};
use super::handle_table::{HandleEntry, HandleKind, HandleTable};
use super::inode_table::InodeTable;
use crate::config::DispatcherConfig;

/// An inode pinned for the lifetime of this guard
struct Pinned<'a, F: RawFileSystem> {
    dispatcher: &'a Dispatcher<F>,
    ino: u64,
    node: F::Node,
}

impl<F: RawFileSystem> Drop for Pinned<'_, F> {
    fn drop(&mut self) {
        self.dispatcher.unpin(self.ino);
    }
}

pub struct Dispatcher<F: RawFileSystem> {
    fs: Arc<F>,
    inodes: RwLock<InodeTable<F::Node>>,
    handles: RwLock<HandleTable<F::Session>>,
    config: DispatcherConfig,
    initialized: AtomicBool,
    destroyed: AtomicBool,
}

impl<F: RawFileSystem> std::fmt::Debug for Dispatcher<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("live_inodes", &self.live_inodes())
            .field("open_handles", &self.open_handles())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl<F: RawFileSystem> Dispatcher<F> {
    pub fn new(fs: Arc<F>, config: DispatcherConfig) -> Self {
        let root = fs.root();
        Self {
            fs,
            inodes: RwLock::new(InodeTable::new(root)),
            handles: RwLock::new(HandleTable::new()),
            config,
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn filesystem(&self) -> &Arc<F> {
        &self.fs
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Kernel references held on an inode, `None` if it is not live
    pub fn lookup_count(&self, ino: u64) -> Option<u64> {
        self.inodes.read().lookup_count(ino)
    }

    pub fn generation(&self, ino: u64) -> Option<u64> {
        self.inodes.read().generation(ino)
    }

    /// The inode currently assigned to a backend node
    pub fn inode_of(&self, node: &F::Node) -> Option<u64> {
        self.inodes.read().inode_of(node)
    }

    pub fn live_inodes(&self) -> usize {
        self.inodes.read().len()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.read().len()
    }

    // ========================================
    // Frame and request entry points
    // ========================================

    /// Decode a frame, dispatch it and encode the reply.
    ///
    /// Returns `None` for one-way requests and for frames too short to carry
    /// a tag to reply to.
    pub async fn dispatch(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let header = match RequestHeader::parse(frame) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(len = frame.len(), "dropping unreadable frame: {}", err);
                return None;
            }
        };
        match Request::decode(frame) {
            Ok(request) => self
                .handle(request)
                .await
                .map(|reply| reply.encode(header.unique)),
            Err(err) => self
                .reject(&header, err.into())
                .map(|reply| reply.encode(header.unique)),
        }
    }

    /// Answer for a frame whose header parsed but whose body did not
    pub fn reject(&self, header: &RequestHeader, err: DispatchError) -> Option<Reply> {
        tracing::warn!(
            unique = header.unique,
            opcode = header.opcode,
            "rejecting malformed request: {}",
            err
        );
        let one_way = Opcode::try_from(header.opcode)
            .map(|opcode| !opcode.expects_reply())
            .unwrap_or(false);
        (!one_way).then(|| Reply::Error(err.errno()))
    }

    /// Dispatch a decoded request. Returns `None` for one-way requests.
    pub async fn handle(&self, request: Request) -> Option<Reply> {
        let Request { header, operation } = request;
        let ino = header.nodeid;
        tracing::debug!(
            unique = header.unique,
            nodeid = ino,
            op = ?operation,
            "dispatching request"
        );

        if !self.is_initialized() && !matches!(operation, Operation::Init { .. }) {
            tracing::warn!(unique = header.unique, "request before init");
            return match operation {
                Operation::Forget { .. }
                | Operation::BatchForget { .. }
                | Operation::Interrupt { .. } => None,
                _ => Some(Reply::Error(DispatchError::NotInitialized.errno())),
            };
        }

        let result = match operation {
            Operation::Init {
                major,
                minor,
                max_readahead,
                flags,
            } => self
                .init(major, minor, max_readahead, flags)
                .await
                .map(Reply::Init),
            Operation::Destroy => {
                self.destroy().await;
                Ok(Reply::Empty)
            }
            Operation::Lookup { name } => self.lookup(ino, &name).await.map(Reply::Entry),
            Operation::Forget { nlookup } => {
                self.forget(ino, nlookup);
                return None;
            }
            Operation::BatchForget { nodes } => {
                self.batch_forget(&nodes);
                return None;
            }
            Operation::GetAttr { .. } => self.getattr(ino).await.map(Reply::Attr),
            Operation::StatFs => self.statfs(ino).await.map(Reply::StatFs),
            Operation::Open { flags } => self.open(ino, flags).await.map(Reply::Open),
            Operation::Read {
                fh, offset, size, ..
            } => self.read(ino, fh, offset, size).await.map(Reply::Data),
            Operation::Release { fh, flags, .. } => {
                self.release(ino, fh, flags).await.map(|()| Reply::Empty)
            }
            Operation::OpenDir { flags } => self.opendir(ino, flags).await.map(Reply::Open),
            Operation::ReadDir { fh, offset, size } => {
                self.readdir(ino, fh, offset, size).await.map(Reply::Data)
            }
            Operation::ReleaseDir { fh, flags } => {
                self.releasedir(ino, fh, flags).await.map(|()| Reply::Empty)
            }
            Operation::Interrupt { unique } => {
                // Backend calls are not cancellable; the request completes normally
                tracing::debug!(target_unique = unique, "interrupt ignored");
                return None;
            }
            Operation::Unsupported(opcode) => {
                if !opcode.expects_reply() {
                    return None;
                }
                Err(Status::NotImplemented.into())
            }
        };

        Some(match result {
            Ok(reply) => reply,
            Err(err) => {
                log_failure(header.unique, ino, &err);
                Reply::Error(err.errno())
            }
        })
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Negotiate the protocol and run the backend's init hook.
    pub async fn init(
        &self,
        major: u32,
        minor: u32,
        max_readahead: u32,
        flags: u32,
    ) -> Result<InitOut, DispatchError> {
        if major != KERNEL_VERSION {
            return Err(DispatchError::UnsupportedVersion { major, minor });
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyInitialized);
        }

        let minor = minor.min(KERNEL_MINOR_VERSION);
        let max_readahead = max_readahead.min(self.config.max_readahead);
        let conn = ConnInfo {
            proto_major: KERNEL_VERSION,
            proto_minor: minor,
            max_readahead,
            max_write: self.config.max_write,
            capable: flags,
        };
        self.fs.init(&conn).await;
        tracing::info!(major, minor, max_readahead, "session initialized");

        Ok(InitOut {
            major: KERNEL_VERSION,
            minor,
            max_readahead,
            flags: 0,
            max_background: self.config.max_background,
            congestion_threshold: self.config.congestion_threshold,
            max_write: self.config.max_write,
        })
    }

    /// Run the backend's destroy hook. Returns false if it already ran.
    pub async fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.fs.destroy().await;
        tracing::info!(
            live_inodes = self.live_inodes(),
            open_handles = self.open_handles(),
            "session destroyed"
        );
        true
    }

    // ========================================
    // Inode operations
    // ========================================

    pub async fn lookup(&self, parent: u64, name: &OsStr) -> Result<EntryOut, DispatchError> {
        let parent = self.pin(parent)?;
        let entry = self.fs.lookup(&parent.node, name).await?;
        let registered = self.inodes.write().register(entry.node);
        drop(parent);

        Ok(EntryOut {
            nodeid: registered.ino,
            generation: registered.generation,
            entry_valid: self.config.entry_timeout(),
            attr_valid: self.config.attr_timeout(),
            attr: self.present(entry.attr, registered.ino),
        })
    }

    /// Drop kernel references. Never calls into the backend except for the
    /// teardown hook of an evicted node.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        let result = self.inodes.write().forget(ino, nlookup);
        match result {
            Ok(forgotten) => {
                if let Some(node) = forgotten.evicted {
                    tracing::debug!(ino, "inode evicted");
                    self.fs.forget(&node);
                }
            }
            Err(err) => tracing::warn!(ino, nlookup, "forget ignored: {}", err),
        }
    }

    pub fn batch_forget(&self, nodes: &[ForgetOne]) {
        for node in nodes {
            self.forget(node.nodeid, node.nlookup);
        }
    }

    pub async fn getattr(&self, ino: u64) -> Result<AttrOut, DispatchError> {
        let pinned = self.pin(ino)?;
        let attr = self.fs.getattr(&pinned.node).await?;
        Ok(AttrOut {
            attr_valid: self.config.attr_timeout(),
            attr: self.present(attr, ino),
        })
    }

    pub async fn statfs(&self, ino: u64) -> Result<StatFs, DispatchError> {
        let pinned = self.pin(ino)?;
        Ok(self.fs.statfs(&pinned.node).await?)
    }

    // ========================================
    // Handle operations
    // ========================================

    pub async fn open(&self, ino: u64, flags: u32) -> Result<OpenOut, DispatchError> {
        let pinned = self.pin(ino)?;
        let session = self.fs.open(&pinned.node, flags).await?;
        let fh = self.register_handle(&pinned, HandleKind::File, flags, session)?;
        Ok(OpenOut { fh, open_flags: 0 })
    }

    pub async fn opendir(&self, ino: u64, flags: u32) -> Result<OpenOut, DispatchError> {
        let pinned = self.pin(ino)?;
        let session = self.fs.opendir(&pinned.node, flags).await?;
        let fh = self.register_handle(&pinned, HandleKind::Directory, flags, session)?;
        Ok(OpenOut { fh, open_flags: 0 })
    }

    /// Read from an open file. A short result means end of data.
    pub async fn read(
        &self,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, DispatchError> {
        let handle = self.open_handle(ino, fh, HandleKind::File)?;
        let pinned = self.pin(handle.ino)?;

        let mut slot = handle.session.lock().await;
        let session = slot.as_mut().ok_or(IdentityError::UnknownHandle(fh))?;
        let mut data = self.fs.read(&pinned.node, session, offset, size).await?;

        if data.len() > size as usize {
            tracing::warn!(
                ino,
                fh,
                size,
                returned = data.len(),
                "backend returned more data than requested, truncating"
            );
            data.truncate(size as usize);
        }
        Ok(data)
    }

    /// Read directory entries after the cursor `offset`, packed into at most
    /// `size` bytes.
    pub async fn readdir(
        &self,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, DispatchError> {
        let handle = self.open_handle(ino, fh, HandleKind::Directory)?;
        let pinned = self.pin(handle.ino)?;

        let mut slot = handle.session.lock().await;
        let session = slot.as_mut().ok_or(IdentityError::UnknownHandle(fh))?;
        let mut writer = DirEntryWriter::new(size as usize);
        self.fs
            .readdir(&pinned.node, session, offset, &mut writer)
            .await?;

        tracing::trace!(ino, fh, offset, entries = writer.entries(), "readdir");
        Ok(writer.into_bytes())
    }

    pub async fn release(&self, ino: u64, fh: u64, flags: u32) -> Result<(), DispatchError> {
        self.close_handle(ino, fh, HandleKind::File, flags).await
    }

    pub async fn releasedir(&self, ino: u64, fh: u64, flags: u32) -> Result<(), DispatchError> {
        self.close_handle(ino, fh, HandleKind::Directory, flags)
            .await
    }

    // ========================================
    // Table helpers
    // ========================================

    fn pin(&self, ino: u64) -> Result<Pinned<'_, F>, IdentityError> {
        let node = self.inodes.write().pin(ino)?;
        Ok(Pinned {
            dispatcher: self,
            ino,
            node,
        })
    }

    fn unpin(&self, ino: u64) {
        let evicted = self.inodes.write().unpin(ino);
        if let Some(node) = evicted {
            tracing::debug!(ino, "inode evicted after last pin");
            self.fs.forget(&node);
        }
    }

    /// Store a new session; the handle keeps its inode pinned until release.
    fn register_handle(
        &self,
        pinned: &Pinned<'_, F>,
        kind: HandleKind,
        flags: u32,
        session: F::Session,
    ) -> Result<u64, DispatchError> {
        // The caller's pin keeps the entry live, so this cannot fail
        self.inodes.write().pin(pinned.ino).map_err(|err| {
            tracing::error!(ino = pinned.ino, "pinned inode vanished: {}", err);
            DispatchError::Internal(err.to_string())
        })?;
        let fh = self
            .handles
            .write()
            .register(pinned.ino, kind, flags, session);
        tracing::debug!(ino = pinned.ino, fh, ?kind, "handle opened");
        Ok(fh)
    }

    fn open_handle(
        &self,
        ino: u64,
        fh: u64,
        kind: HandleKind,
    ) -> Result<HandleEntry<F::Session>, IdentityError> {
        let handle = self
            .handles
            .read()
            .get(fh)
            .ok_or(IdentityError::UnknownHandle(fh))?;
        check_handle(&handle, ino, fh, kind)?;
        Ok(handle)
    }

    async fn close_handle(
        &self,
        ino: u64,
        fh: u64,
        kind: HandleKind,
        flags: u32,
    ) -> Result<(), DispatchError> {
        let entry = {
            let mut handles = self.handles.write();
            let handle = handles.get(fh).ok_or(IdentityError::UnknownHandle(fh))?;
            check_handle(&handle, ino, fh, kind)?;
            handles.release(fh)
        };
        let Some(entry) = entry else {
            return Err(IdentityError::UnknownHandle(fh).into());
        };

        // Adopt the pin taken at open so it is dropped however this ends
        let node = self.inodes.read().get(entry.ino).cloned();
        let Some(node) = node else {
            tracing::error!(ino = entry.ino, fh, "open handle on an evicted inode");
            return Err(DispatchError::Internal(format!(
                "handle {fh} outlived inode {}",
                entry.ino
            )));
        };
        let handle_pin = Pinned {
            dispatcher: self,
            ino: entry.ino,
            node,
        };

        let Some(session) = entry.take_session().await else {
            return Ok(());
        };
        let result = match kind {
            HandleKind::File => self.fs.release(&handle_pin.node, session, flags).await,
            HandleKind::Directory => self.fs.releasedir(&handle_pin.node, session, flags).await,
        };
        tracing::debug!(ino = entry.ino, fh, "handle released");
        Ok(result?)
    }

    /// Attributes as the kernel sees them
    fn present(&self, mut attr: FileAttr, ino: u64) -> FileAttr {
        attr.ino = ino;
        if let Some(uid) = self.config.uid {
            attr.uid = uid;
        }
        if let Some(gid) = self.config.gid {
            attr.gid = gid;
        }
        attr
    }
}

fn check_handle<S>(
    handle: &HandleEntry<S>,
    ino: u64,
    fh: u64,
    kind: HandleKind,
) -> Result<(), IdentityError> {
    if handle.kind != kind {
        return Err(IdentityError::HandleKind(fh));
    }
    if handle.ino != ino {
        return Err(IdentityError::HandleInode {
            fh,
            owner: handle.ino,
            requested: ino,
        });
    }
    Ok(())
}

fn log_failure(unique: u64, ino: u64, err: &DispatchError) {
    match err {
        DispatchError::Capability(status) => {
            tracing::debug!(unique, ino, "filesystem returned {}", status)
        }
        DispatchError::Identity(_) | DispatchError::Decode(_) => {
            tracing::warn!(unique, ino, "{}", err)
        }
        DispatchError::Internal(_) => tracing::error!(unique, ino, "{}", err),
        _ => tracing::warn!(unique, ino, "{}", err),
    }
}
