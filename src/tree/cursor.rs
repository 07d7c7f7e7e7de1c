// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    entry::{key_cmp, read_entry, read_entry_flags, EntryFlags, TreeEntry},
    node::Node,
};
use crate::{
    error::Result,
    shm::{header::TreeRoot, ShmPtr, ShmRegion},
};
use std::cmp::Ordering;

/// In-order cursor over one tree version.
///
/// The cursor resolves v2 overrides against its transaction id, so a
/// cursor over an old header keeps seeing the old children while the
/// writer stamps new ones.
#[derive(Clone)]
pub struct TreeCursor {
    shm: ShmRegion,
    root: TreeRoot,
    txid: u64,

    /// Ancestors of the current node: (node ptr, decoded node, child
    /// index taken during descent).
    stack: Vec<(ShmPtr, Node, usize)>,

    /// Current position: (node ptr, decoded node, key cell).
    current: Option<(ShmPtr, Node, usize)>,
}

impl TreeCursor {
    /// Creates an unpositioned cursor.
    #[must_use]
    pub fn new(shm: ShmRegion, root: TreeRoot, txid: u64) -> Self {
        Self {
            shm,
            root,
            txid,
            stack: Vec::new(),
            current: None,
        }
    }

    /// Returns `true` while the cursor points at an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Invalidates the cursor.
    pub fn invalidate(&mut self) {
        self.stack.clear();
        self.current = None;
    }

    fn entry_ptr(&self) -> Option<ShmPtr> {
        let (_, node, cell) = self.current.as_ref()?;
        node.entries.get(*cell).copied()
    }

    /// The entry under the cursor.
    pub fn entry(&self) -> Result<TreeEntry> {
        let ptr = self
            .entry_ptr()
            .ok_or(crate::Error::Misuse("cursor is not positioned"))?;
        read_entry(&self.shm, ptr)
    }

    /// Only the flags of the entry under the cursor.
    pub fn flags(&self) -> Result<EntryFlags> {
        let ptr = self
            .entry_ptr()
            .ok_or(crate::Error::Misuse("cursor is not positioned"))?;
        read_entry_flags(&self.shm, ptr)
    }

    /// Moves to the smallest entry.
    pub fn first(&mut self) -> Result<()> {
        self.invalidate();
        if self.root.root.is_null() {
            return Ok(());
        }
        self.descend_edge(self.root.root, false)
    }

    /// Moves to the largest entry.
    pub fn last(&mut self) -> Result<()> {
        self.invalidate();
        if self.root.root.is_null() {
            return Ok(());
        }
        self.descend_edge(self.root.root, true)
    }

    /// Descends to the leftmost (or rightmost) entry under `ptr`.
    fn descend_edge(&mut self, mut ptr: ShmPtr, rightmost: bool) -> Result<()> {
        loop {
            let node = Node::read(&self.shm, ptr)?;
            if node.leaf {
                let cell = if rightmost { node.nkey - 1 } else { 0 };
                self.current = Some((ptr, node, cell));
                return Ok(());
            }
            let slot = if rightmost { node.nkey } else { 0 };
            let child = node.child_at(slot, self.txid);
            self.stack.push((ptr, node, slot));
            ptr = child;
        }
    }

    /// Advances to the next entry in key order.
    pub fn next(&mut self) -> Result<()> {
        let Some((ptr, node, cell)) = self.current.take() else {
            return Ok(());
        };

        if !node.leaf {
            // Next is the leftmost entry of the child after this key
            let child = node.child_at(cell + 1, self.txid);
            self.stack.push((ptr, node, cell + 1));
            return self.descend_edge(child, false);
        }

        if cell + 1 < node.nkey {
            self.current = Some((ptr, node, cell + 1));
            return Ok(());
        }

        // Climb until an ancestor still has a key to the right of the
        // child we came from
        while let Some((a_ptr, a_node, taken)) = self.stack.pop() {
            if taken < a_node.nkey {
                self.current = Some((a_ptr, a_node, taken));
                return Ok(());
            }
        }
        Ok(())
    }

    /// Steps back to the previous entry in key order.
    pub fn prev(&mut self) -> Result<()> {
        let Some((ptr, node, cell)) = self.current.take() else {
            return Ok(());
        };

        if !node.leaf {
            let child = node.child_at(cell, self.txid);
            self.stack.push((ptr, node, cell));
            return self.descend_edge(child, true);
        }

        if cell > 0 {
            self.current = Some((ptr, node, cell - 1));
            return Ok(());
        }

        while let Some((a_ptr, a_node, taken)) = self.stack.pop() {
            if taken > 0 {
                self.current = Some((a_ptr, a_node, taken - 1));
                return Ok(());
            }
        }
        Ok(())
    }

    /// Seeks to `key`.
    ///
    /// Returns `Some(Equal)` on an exact match, `Some(Greater)` when the
    /// cursor ended up on the smallest entry above the key,
    /// `Some(Less)` when only entries below it exist, and `None` for an
    /// empty tree.
    pub fn seek(&mut self, topic: u8, key: &[u8]) -> Result<Option<Ordering>> {
        self.invalidate();
        if self.root.root.is_null() {
            return Ok(None);
        }

        let mut ptr = self.root.root;
        loop {
            let node = Node::read(&self.shm, ptr)?;

            let mut idx = node.nkey;
            for slot in 0..node.nkey {
                let entry = read_entry(&self.shm, node.entries[slot])?;
                match key_cmp(entry.topic(), &entry.key, topic, key) {
                    Ordering::Equal => {
                        self.current = Some((ptr, node, slot));
                        return Ok(Some(Ordering::Equal));
                    }
                    Ordering::Greater => {
                        idx = slot;
                        break;
                    }
                    Ordering::Less => {}
                }
            }

            if node.leaf {
                if idx < node.nkey {
                    self.current = Some((ptr, node, idx));
                    return Ok(Some(Ordering::Greater));
                }

                // All leaf keys are below the target: the successor, if
                // any, lives in an ancestor
                for depth in (0..self.stack.len()).rev() {
                    #[allow(clippy::indexing_slicing)]
                    let (_, a_node, taken) = &self.stack[depth];
                    if *taken < a_node.nkey {
                        self.stack.truncate(depth + 1);

                        #[allow(clippy::expect_used)]
                        let (a_ptr, a_node, taken) =
                            self.stack.pop().expect("depth is in range");

                        self.current = Some((a_ptr, a_node, taken));
                        return Ok(Some(Ordering::Greater));
                    }
                }

                // No successor anywhere: settle on the largest entry
                self.stack.clear();
                self.last()?;
                return Ok(Some(Ordering::Less));
            }

            let child = node.child_at(idx, self.txid);
            self.stack.push((ptr, node, idx));
            ptr = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        shm::{arena::Arena, header::TreeHeader},
        tree::TreeWriter,
    };
    use test_log::test;

    fn build_tree(keys: &[&[u8]]) -> (ShmRegion, TreeHeader) {
        let shm = ShmRegion::new();
        let mut hdr = TreeHeader::default();
        Arena::format(&shm, &mut hdr).unwrap();

        let mut rollback = Vec::new();
        let mut writer = TreeWriter::new(&shm, &mut hdr, &mut rollback, u32::MAX);
        for key in keys {
            writer
                .insert(EntryFlags::INSERT, key, Some(*key))
                .unwrap();
        }
        (shm, hdr)
    }

    #[test]
    fn iterate_forward_and_back() -> crate::Result<()> {
        let keys: Vec<Vec<u8>> = (0..50u32).map(|i| format!("k{i:04}").into_bytes()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let (shm, hdr) = build_tree(&refs);

        let mut csr = TreeCursor::new(shm, hdr.root, u64::MAX);

        csr.first()?;
        let mut seen = Vec::new();
        while csr.valid() {
            seen.push(csr.entry()?.key.to_vec());
            csr.next()?;
        }
        assert_eq!(keys, seen);

        csr.last()?;
        let mut seen_rev = Vec::new();
        while csr.valid() {
            seen_rev.push(csr.entry()?.key.to_vec());
            csr.prev()?;
        }
        seen_rev.reverse();
        assert_eq!(keys, seen_rev);

        Ok(())
    }

    #[test]
    fn seek_semantics() -> crate::Result<()> {
        let (shm, hdr) = build_tree(&[b"b", b"d", b"f"]);
        let mut csr = TreeCursor::new(shm, hdr.root, u64::MAX);

        assert_eq!(Some(Ordering::Equal), csr.seek(0, b"d")?);
        assert_eq!(b"d", &*csr.entry()?.key);

        assert_eq!(Some(Ordering::Greater), csr.seek(0, b"c")?);
        assert_eq!(b"d", &*csr.entry()?.key);

        assert_eq!(Some(Ordering::Greater), csr.seek(0, b"a")?);
        assert_eq!(b"b", &*csr.entry()?.key);

        assert_eq!(Some(Ordering::Less), csr.seek(0, b"z")?);
        assert_eq!(b"f", &*csr.entry()?.key);

        Ok(())
    }

    #[test]
    fn seek_then_walk() -> crate::Result<()> {
        let keys: Vec<Vec<u8>> = (0..200u32).map(|i| format!("{i:05}").into_bytes()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let (shm, hdr) = build_tree(&refs);

        let mut csr = TreeCursor::new(shm, hdr.root, u64::MAX);
        csr.seek(0, b"00100")?;

        for expect in 100..200u32 {
            assert!(csr.valid());
            assert_eq!(format!("{expect:05}").as_bytes(), &*csr.entry()?.key);
            csr.next()?;
        }
        assert!(!csr.valid());

        Ok(())
    }

    #[test]
    fn empty_tree() -> crate::Result<()> {
        let shm = ShmRegion::new();
        let hdr = TreeHeader::default();
        let mut csr = TreeCursor::new(shm, hdr.root, u64::MAX);

        csr.first()?;
        assert!(!csr.valid());
        assert_eq!(None, csr.seek(0, b"x")?);

        Ok(())
    }
}
