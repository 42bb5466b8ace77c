//! Inode id ↔ backend node mapping with lookup reference counts
//!
//! The kernel identifies filesystem objects by 64-bit inode numbers. This
//! table hands those numbers out for backend nodes and tracks how many
//! references the kernel holds on each (one per successful lookup, released
//! by forget). Ids are recycled arena-style: a freed id comes back with its
//! generation bumped so the kernel can tell the two objects apart.
//!
//! Besides lookup references an entry can be pinned by in-flight requests
//! and open handles. An entry is evicted only when both counts are zero.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use super::error::IdentityError;

#[derive(Debug)]
struct InodeEntry<N> {
    node: N,
    /// References held by the kernel
    lookups: u64,
    /// References held by in-flight requests and open handles
    pins: u64,
    generation: u64,
}

/// Id and generation handed to the kernel for a registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    pub ino: u64,
    pub generation: u64,
}

/// Result of applying a forget
#[derive(Debug)]
pub struct Forgotten<N> {
    /// Lookup references left on the entry
    pub remaining: u64,
    /// The node, if the forget evicted its entry
    pub evicted: Option<N>,
    /// The kernel forgot more references than it held
    pub underflow: bool,
}

#[derive(Debug)]
pub struct InodeTable<N> {
    entries: HashMap<u64, InodeEntry<N>>,
    /// Node to inode mapping for live entries
    inode_of: HashMap<N, u64>,
    /// Evicted ids with the generation their next use gets
    free: Vec<(u64, u64)>,
    /// Next never-used inode number (1 is reserved for root)
    next_inode: u64,
}

impl<N> InodeTable<N>
where
    N: Clone + Eq + Hash + Debug,
{
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    /// Create a new inode table with root pre-registered
    pub fn new(root: N) -> Self {
        let mut table = Self {
            entries: HashMap::new(),
            inode_of: HashMap::new(),
            free: Vec::new(),
            next_inode: Self::ROOT_INODE + 1,
        };

        table.inode_of.insert(root.clone(), Self::ROOT_INODE);
        table.entries.insert(
            Self::ROOT_INODE,
            InodeEntry {
                node: root,
                lookups: 1,
                pins: 0,
                generation: 0,
            },
        );

        table
    }

    /// Register a resolution of `node`.
    ///
    /// A node that already has a live entry keeps its id and gains one
    /// reference; otherwise a fresh or recycled id is assigned with one
    /// reference.
    pub fn register(&mut self, node: N) -> Registered {
        if let Some(&ino) = self.inode_of.get(&node) {
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.lookups += 1;
                return Registered {
                    ino,
                    generation: entry.generation,
                };
            }
        }

        let (ino, generation) = match self.free.pop() {
            Some(recycled) => recycled,
            None => {
                let ino = self.next_inode;
                self.next_inode += 1;
                (ino, 0)
            }
        };
        self.inode_of.insert(node.clone(), ino);
        self.entries.insert(
            ino,
            InodeEntry {
                node,
                lookups: 1,
                pins: 0,
                generation,
            },
        );
        Registered { ino, generation }
    }

    /// Get the backend node for an inode if it is live
    pub fn get(&self, ino: u64) -> Option<&N> {
        self.entries.get(&ino).map(|entry| &entry.node)
    }

    /// Get the inode currently assigned to a node
    pub fn inode_of(&self, node: &N) -> Option<u64> {
        self.inode_of.get(node).copied()
    }

    pub fn generation(&self, ino: u64) -> Option<u64> {
        self.entries.get(&ino).map(|entry| entry.generation)
    }

    /// Kernel references held on an inode
    pub fn lookup_count(&self, ino: u64) -> Option<u64> {
        self.entries.get(&ino).map(|entry| entry.lookups)
    }

    /// Pin an inode for the duration of a request or an open handle.
    pub fn pin(&mut self, ino: u64) -> Result<N, IdentityError> {
        let entry = self
            .entries
            .get_mut(&ino)
            .ok_or(IdentityError::UnknownInode(ino))?;
        entry.pins += 1;
        Ok(entry.node.clone())
    }

    /// Drop a pin taken with [`InodeTable::pin`].
    ///
    /// Returns the node if this evicted the entry.
    pub fn unpin(&mut self, ino: u64) -> Option<N> {
        let entry = self.entries.get_mut(&ino)?;
        if entry.pins == 0 {
            tracing::error!(ino, "unpin without a matching pin");
            return None;
        }
        entry.pins -= 1;
        self.evict_if_unreferenced(ino)
    }

    /// Drop `nlookup` kernel references from an inode.
    ///
    /// Forgetting more references than are held is a protocol violation by
    /// the peer: it is logged, the count is clamped to zero and the result
    /// reports the underflow.
    pub fn forget(&mut self, ino: u64, nlookup: u64) -> Result<Forgotten<N>, IdentityError> {
        let entry = self
            .entries
            .get_mut(&ino)
            .ok_or(IdentityError::UnknownInode(ino))?;

        let underflow = nlookup > entry.lookups;
        if underflow {
            tracing::error!(
                ino,
                nlookup,
                held = entry.lookups,
                "forget exceeds lookup count, clamping to zero"
            );
        }
        entry.lookups = entry.lookups.saturating_sub(nlookup);
        let remaining = entry.lookups;

        Ok(Forgotten {
            remaining,
            evicted: self.evict_if_unreferenced(ino),
            underflow,
        })
    }

    /// Number of live entries, root included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_unreferenced(&mut self, ino: u64) -> Option<N> {
        if ino == Self::ROOT_INODE {
            return None;
        }
        let entry = self.entries.get(&ino)?;
        if entry.lookups > 0 || entry.pins > 0 {
            return None;
        }

        let entry = self.entries.remove(&ino)?;
        self.inode_of.remove(&entry.node);
        self.free.push((ino, entry.generation + 1));
        Some(entry.node)
    }
}
