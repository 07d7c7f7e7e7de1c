// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    error::{Error, Result},
    shm::{arena::Arena, ShmPtr, ShmRegion},
};

/// Maximum keys per node (order-4 B-tree).
pub const MAX_KEYS: usize = 3;

/// Maximum children per internal node.
pub const MAX_CHILDREN: usize = 4;

/// Serialized node size. Nodes are allocated 8-aligned and never span
/// chunks, so they can be read and written in one piece.
pub const NODE_BYTES: usize = 48;

const V2_NONE: u8 = 0xFF;

/// A pending child override: valid for readers at or above `txid`,
/// invisible below it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct V2 {
    /// Child slot being overridden.
    pub slot: usize,

    /// Replacement child.
    pub child: ShmPtr,

    /// Transaction id at which the override became valid.
    pub txid: u64,
}

/// A decoded tree node.
///
/// A node carries at most one v2 override; a second modification must
/// copy the node instead.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Node {
    /// Leaf nodes have no children.
    pub leaf: bool,

    /// Number of populated key slots (1..=3).
    pub nkey: usize,

    /// Entry handles.
    pub entries: [ShmPtr; MAX_KEYS],

    /// Child handles (`nkey + 1` populated on internal nodes).
    pub children: [ShmPtr; MAX_CHILDREN],

    /// Pending override, if any.
    pub v2: Option<V2>,
}

impl Node {
    /// A fresh leaf with a single entry.
    #[must_use]
    pub fn leaf_with(entry: ShmPtr) -> Self {
        Self {
            leaf: true,
            nkey: 1,
            entries: [entry, ShmPtr::NULL, ShmPtr::NULL],
            ..Self::default()
        }
    }

    /// The child pointer at `slot` as seen by a reader at `txid`.
    #[must_use]
    pub fn child_at(&self, slot: usize, txid: u64) -> ShmPtr {
        if let Some(v2) = self.v2 {
            if v2.slot == slot && v2.txid <= txid {
                return v2.child;
            }
        }
        self.children.get(slot).copied().unwrap_or(ShmPtr::NULL)
    }

    /// A copy with any override visible at `txid` folded into the base
    /// child array and the override slot cleared.
    #[must_use]
    pub fn materialized(&self, txid: u64) -> Self {
        let mut node = self.clone();
        if let Some(v2) = node.v2.take() {
            if v2.txid <= txid {
                if let Some(child) = node.children.get_mut(v2.slot) {
                    *child = v2.child;
                }
            }
        }
        node
    }

    /// Reads the node at `ptr`.
    pub fn read(shm: &ShmRegion, ptr: ShmPtr) -> Result<Self> {
        let mut buf = [0u8; NODE_BYTES];
        shm.read_bytes(ptr.chunk(), ptr.offset(), &mut buf)?;

        let leaf = buf[0] & 1 != 0;
        let nkey = buf[1] as usize;
        if nkey == 0 || nkey > MAX_KEYS {
            return Err(Error::Corrupt("tree node key count out of range"));
        }

        let word = |i: usize| -> ShmPtr {
            #[allow(clippy::indexing_slicing)]
            ShmPtr::from_raw(u32::from_be_bytes([
                buf[i],
                buf[i + 1],
                buf[i + 2],
                buf[i + 3],
            ]))
        };

        let entries = [word(4), word(8), word(12)];
        let children = [word(16), word(20), word(24), word(28)];

        let v2 = if buf[32] == V2_NONE {
            None
        } else {
            #[allow(clippy::indexing_slicing)]
            let txid = u64::from_be_bytes([
                buf[40], buf[41], buf[42], buf[43], buf[44], buf[45], buf[46], buf[47],
            ]);
            Some(V2 {
                slot: buf[32] as usize,
                child: word(36),
                txid,
            })
        };

        Ok(Self {
            leaf,
            nkey,
            entries,
            children,
            v2,
        })
    }

    fn encode(&self) -> [u8; NODE_BYTES] {
        let mut buf = [0u8; NODE_BYTES];
        buf[0] = u8::from(self.leaf);

        #[allow(clippy::cast_possible_truncation)]
        {
            buf[1] = self.nkey as u8;
        }

        let mut put = |i: usize, ptr: ShmPtr| {
            #[allow(clippy::indexing_slicing)]
            buf[i..i + 4].copy_from_slice(&ptr.raw().to_be_bytes());
        };

        for (n, entry) in self.entries.iter().enumerate() {
            put(4 + n * 4, *entry);
        }
        for (n, child) in self.children.iter().enumerate() {
            put(16 + n * 4, *child);
        }

        match self.v2 {
            None => buf[32] = V2_NONE,
            Some(v2) => {
                #[allow(clippy::cast_possible_truncation)]
                {
                    buf[32] = v2.slot as u8;
                }
                #[allow(clippy::indexing_slicing)]
                buf[36..40].copy_from_slice(&v2.child.raw().to_be_bytes());
                #[allow(clippy::indexing_slicing)]
                buf[40..48].copy_from_slice(&v2.txid.to_be_bytes());
            }
        }

        buf
    }

    /// Allocates the node in the arena. The override slot is written
    /// empty; overrides are stamped in place later.
    pub fn write(&self, arena: &mut Arena<'_>) -> Result<ShmPtr> {
        debug_assert!(self.v2.is_none(), "fresh nodes carry no override");

        let (ptr, _contiguous) = arena.alloc(NODE_BYTES, true)?;
        arena
            .shm()
            .write_bytes(ptr.chunk(), ptr.offset(), &self.encode())?;
        Ok(ptr)
    }
}

/// Stamps a v2 override onto the node at `ptr`, in place.
///
/// The caller must have verified the node carries no override yet and
/// must record `ptr` on the rollback log.
pub fn stamp_v2(shm: &ShmRegion, ptr: ShmPtr, v2: V2) -> Result<()> {
    let mut buf = [0u8; 16];

    #[allow(clippy::cast_possible_truncation)]
    {
        buf[0] = v2.slot as u8;
    }
    buf[4..8].copy_from_slice(&v2.child.raw().to_be_bytes());
    buf[8..16].copy_from_slice(&v2.txid.to_be_bytes());

    shm.write_bytes(ptr.chunk(), ptr.offset() + 32, &buf)
}

/// Clears the v2 override of the node at `ptr`, in place.
pub fn clear_v2(shm: &ShmRegion, ptr: ShmPtr) -> Result<()> {
    let mut buf = [0u8; 16];
    buf[0] = V2_NONE;
    shm.write_bytes(ptr.chunk(), ptr.offset() + 32, &buf)
}
