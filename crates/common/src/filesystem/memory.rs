//! In-memory read-only filesystem
//!
//! A complete reference backend: a tree of directories and files held in
//! memory. It backs the `rawfs` binary (loaded from a local directory) and
//! the dispatcher tests.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{ConnInfo, DirEntry, DirEntryWriter, Entry, RawFileSystem};
use crate::attr::{FileAttr, FileType, StatFs};
use crate::status::Status;

/// Longest name a lookup accepts
const MAX_NAME_LEN: usize = 255;

#[derive(Debug)]
enum Content {
    File(Bytes),
    Dir(BTreeMap<OsString, u64>),
}

#[derive(Debug)]
struct MemoryNode {
    parent: u64,
    attr: FileAttr,
    content: Content,
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<u64, MemoryNode>,
    next_node: u64,
}

/// One entry of a directory listing captured at opendir
#[derive(Debug, Clone)]
pub struct Listing {
    name: OsString,
    node: u64,
    kind: FileType,
}

/// Open state for [`MemoryFileSystem`]
#[derive(Debug)]
pub enum MemorySession {
    File,
    /// Directories snapshot their listing so paging stays stable
    Dir(Vec<Listing>),
}

/// Lifecycle counters, mostly for tests
#[derive(Debug, Default)]
struct Counters {
    inits: AtomicUsize,
    destroys: AtomicUsize,
    forgets: AtomicUsize,
    open_sessions: AtomicUsize,
}

#[derive(Debug)]
pub struct MemoryFileSystem {
    tree: RwLock<Tree>,
    counters: Counters,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    /// Node reference of the root directory
    pub const ROOT_NODE: u64 = 1;

    /// Create an empty filesystem holding only the root directory
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            Self::ROOT_NODE,
            MemoryNode {
                parent: Self::ROOT_NODE,
                attr: FileAttr::new(FileType::Directory, 0),
                content: Content::Dir(BTreeMap::new()),
            },
        );
        Self {
            tree: RwLock::new(Tree {
                nodes,
                next_node: Self::ROOT_NODE + 1,
            }),
            counters: Counters::default(),
        }
    }

    /// Load a snapshot of a local directory tree.
    ///
    /// Regular files are read fully; anything that is neither a file nor a
    /// directory is skipped.
    pub fn from_directory(root: &Path) -> io::Result<Self> {
        let fs = Self::new();
        fs.load_dir(root, Self::ROOT_NODE)?;
        Ok(fs)
    }

    fn load_dir(&self, dir: &Path, node: u64) -> io::Result<()> {
        for dir_entry in std::fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let metadata = dir_entry.metadata()?;
            let name = dir_entry.file_name();
            let perm = (metadata.permissions().mode() & 0o7777) as u16;
            let mtime = metadata.modified().ok();

            let child = if metadata.is_dir() {
                let child = self.insert_child(node, &name, Content::Dir(BTreeMap::new()));
                self.load_dir(&dir_entry.path(), child)?;
                child
            } else if metadata.is_file() {
                let data = std::fs::read(dir_entry.path())?;
                self.insert_child(node, &name, Content::File(Bytes::from(data)))
            } else {
                tracing::debug!(path = %dir_entry.path().display(), "skipping special file");
                continue;
            };

            let mut tree = self.tree.write();
            if let Some(entry) = tree.nodes.get_mut(&child) {
                entry.attr.perm = perm;
                if let Some(mtime) = mtime {
                    entry.attr.mtime = mtime;
                    entry.attr.ctime = mtime;
                }
            }
        }
        Ok(())
    }

    /// Create a directory (and any missing parents) and return its node
    pub fn mkdir_all(&self, path: &str) -> u64 {
        let mut node = Self::ROOT_NODE;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let existing = self.child_of(node, OsStr::new(part));
            node = match existing {
                Some(child) => child,
                None => self.insert_child(node, OsStr::new(part), Content::Dir(BTreeMap::new())),
            };
        }
        node
    }

    /// Create or replace a file (creating parent directories) and return its node.
    ///
    /// Replacing a file keeps its node; replacing a directory drops the
    /// whole subtree.
    pub fn insert_file(&self, path: &str, content: impl Into<Bytes>) -> u64 {
        let (parent, name) = match path.trim_end_matches('/').rsplit_once('/') {
            Some((parent, name)) => (self.mkdir_all(parent), OsStr::new(name)),
            None => (Self::ROOT_NODE, OsStr::new(path)),
        };
        let data = content.into();

        if let Some(existing) = self.child_of(parent, name) {
            let mut tree = self.tree.write();
            if let Some(node) = tree.nodes.get_mut(&existing) {
                if let Content::File(old) = &mut node.content {
                    node.attr = FileAttr::new(FileType::RegularFile, data.len() as u64);
                    *old = data;
                    return existing;
                }
            }
            Self::remove_subtree(&mut tree, existing);
        }
        self.insert_child(parent, name, Content::File(data))
    }

    fn remove_subtree(tree: &mut Tree, node: u64) {
        let mut pending = vec![node];
        while let Some(node) = pending.pop() {
            if let Some(MemoryNode {
                content: Content::Dir(children),
                ..
            }) = tree.nodes.remove(&node)
            {
                pending.extend(children.into_values());
            }
        }
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Option<u64> {
        let tree = self.tree.read();
        match &tree.nodes.get(&parent)?.content {
            Content::Dir(children) => children.get(name).copied(),
            Content::File(_) => None,
        }
    }

    fn insert_child(&self, parent: u64, name: &OsStr, content: Content) -> u64 {
        let mut tree = self.tree.write();
        let node = tree.next_node;
        tree.next_node += 1;

        let attr = match &content {
            Content::File(data) => FileAttr::new(FileType::RegularFile, data.len() as u64),
            Content::Dir(_) => FileAttr::new(FileType::Directory, 0),
        };
        tree.nodes.insert(
            node,
            MemoryNode {
                parent,
                attr,
                content,
            },
        );
        if let Some(MemoryNode {
            content: Content::Dir(children),
            ..
        }) = tree.nodes.get_mut(&parent)
        {
            children.insert(name.to_os_string(), node);
        }
        node
    }

    /// Number of nodes, the root included
    pub fn node_count(&self) -> usize {
        self.tree.read().nodes.len()
    }

    /// How many times the teardown hook ran
    pub fn forgotten(&self) -> usize {
        self.counters.forgets.load(Ordering::SeqCst)
    }

    pub fn init_count(&self) -> usize {
        self.counters.inits.load(Ordering::SeqCst)
    }

    pub fn destroy_count(&self) -> usize {
        self.counters.destroys.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet released
    pub fn open_sessions(&self) -> usize {
        self.counters.open_sessions.load(Ordering::SeqCst)
    }

    fn attr_of(tree: &Tree, node: u64) -> Result<FileAttr, Status> {
        tree.nodes
            .get(&node)
            .map(|n| n.attr)
            .ok_or(Status::NotFound)
    }
}

#[async_trait]
impl RawFileSystem for MemoryFileSystem {
    type Node = u64;
    type Session = MemorySession;

    fn root(&self) -> u64 {
        Self::ROOT_NODE
    }

    async fn init(&self, conn: &ConnInfo) {
        tracing::debug!(
            major = conn.proto_major,
            minor = conn.proto_minor,
            "memory filesystem initialized"
        );
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
    }

    async fn destroy(&self) {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
    }

    fn forget(&self, _node: &u64) {
        self.counters.forgets.fetch_add(1, Ordering::SeqCst);
    }

    async fn statfs(&self, _node: &u64) -> Result<StatFs, Status> {
        let tree = self.tree.read();
        let bytes: u64 = tree
            .nodes
            .values()
            .map(|n| match &n.content {
                Content::File(data) => data.len() as u64,
                Content::Dir(_) => 0,
            })
            .sum();
        Ok(StatFs {
            blocks: bytes.div_ceil(4096),
            bfree: 0,
            bavail: 0,
            files: tree.nodes.len() as u64,
            ffree: 0,
            bsize: 4096,
            namelen: MAX_NAME_LEN as u32,
            frsize: 4096,
        })
    }

    async fn lookup(&self, parent: &u64, name: &OsStr) -> Result<Entry<u64>, Status> {
        if name.len() > MAX_NAME_LEN {
            return Err(Status::NameTooLong);
        }
        let tree = self.tree.read();
        let dir = tree.nodes.get(parent).ok_or(Status::NotFound)?;
        let Content::Dir(children) = &dir.content else {
            return Err(Status::NotADirectory);
        };
        let node = *children.get(name).ok_or(Status::NotFound)?;
        Ok(Entry {
            node,
            attr: Self::attr_of(&tree, node)?,
        })
    }

    async fn getattr(&self, node: &u64) -> Result<FileAttr, Status> {
        Self::attr_of(&self.tree.read(), *node)
    }

    async fn open(&self, node: &u64, flags: u32) -> Result<MemorySession, Status> {
        let accmode = flags & libc::O_ACCMODE as u32;
        if accmode != libc::O_RDONLY as u32 {
            return Err(Status::ReadOnly);
        }
        let tree = self.tree.read();
        match &tree.nodes.get(node).ok_or(Status::NotFound)?.content {
            Content::File(_) => {
                self.counters.open_sessions.fetch_add(1, Ordering::SeqCst);
                Ok(MemorySession::File)
            }
            Content::Dir(_) => Err(Status::IsADirectory),
        }
    }

    async fn read(
        &self,
        node: &u64,
        session: &mut MemorySession,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, Status> {
        if !matches!(session, MemorySession::File) {
            return Err(Status::BadHandle);
        }
        let tree = self.tree.read();
        let Content::File(data) = &tree.nodes.get(node).ok_or(Status::NotFound)?.content else {
            return Err(Status::IsADirectory);
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn release(
        &self,
        _node: &u64,
        _session: MemorySession,
        _flags: u32,
    ) -> Result<(), Status> {
        self.counters.open_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn opendir(&self, node: &u64, _flags: u32) -> Result<MemorySession, Status> {
        let tree = self.tree.read();
        let dir = tree.nodes.get(node).ok_or(Status::NotFound)?;
        let Content::Dir(children) = &dir.content else {
            return Err(Status::NotADirectory);
        };

        let mut listing = vec![
            Listing {
                name: OsString::from("."),
                node: *node,
                kind: FileType::Directory,
            },
            Listing {
                name: OsString::from(".."),
                node: dir.parent,
                kind: FileType::Directory,
            },
        ];
        for (name, child) in children {
            let kind = Self::attr_of(&tree, *child)?.kind;
            listing.push(Listing {
                name: name.clone(),
                node: *child,
                kind,
            });
        }

        self.counters.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession::Dir(listing))
    }

    async fn readdir(
        &self,
        _node: &u64,
        session: &mut MemorySession,
        offset: u64,
        writer: &mut DirEntryWriter,
    ) -> Result<(), Status> {
        let MemorySession::Dir(listing) = session else {
            return Err(Status::NotADirectory);
        };
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        for (index, item) in listing.iter().enumerate().skip(skip) {
            let added = writer.try_add(DirEntry {
                ino: item.node,
                offset: index as u64 + 1,
                kind: item.kind,
                name: &item.name,
            });
            if !added {
                break;
            }
        }
        Ok(())
    }

    async fn releasedir(
        &self,
        _node: &u64,
        _session: MemorySession,
        _flags: u32,
    ) -> Result<(), Status> {
        self.counters.open_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
