// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The shared in-memory B-tree.
//!
//! An order-4 B-tree whose nodes and entries live in the shared-memory
//! arena. A single writer mutates it copy-on-write: the first
//! modification of a node stamps a "v2" child override carrying the
//! write transaction's id, the second copies the node. Readers resolve
//! overrides against the transaction id of the header copy they
//! loaded, so they keep a consistent view without blocking the writer.
//!
//! Range deletes are represented in-tree: a `START_DELETE` boundary
//! opens a covered interval just after its key, an `END_DELETE`
//! boundary closes it just before its key, and a live key inside a
//! cover carries both bits alongside `INSERT`.

pub mod cursor;
pub mod entry;
pub mod node;

use self::{
    cursor::TreeCursor,
    entry::{key_cmp, read_entry, write_entry, EntryFlags, TreeEntry},
    node::{clear_v2, stamp_v2, Node, MAX_KEYS, V2},
};
use crate::{
    error::{Error, Result},
    shm::{
        arena::{rebuild_ring, Arena},
        header::{TreeHeader, TreeRoot},
        ShmPtr, ShmRegion,
    },
};
use std::cmp::Ordering;

/// A rollback point: everything past it can be undone.
#[derive(Clone)]
pub struct TreeMark {
    /// Length of the v2 rollback log at mark time.
    pub log_len: usize,

    /// Header state at mark time.
    pub hdr: TreeHeader,
}

/// Undoes all tree work since `mark`: clears v2 stamps added after it
/// and restores the header (root, height, allocation cursor, log
/// state) wholesale.
pub fn rollback_to(
    shm: &ShmRegion,
    hdr: &mut TreeHeader,
    rollback: &mut Vec<ShmPtr>,
    mark: &TreeMark,
) -> Result<()> {
    for ptr in rollback.drain(mark.log_len..) {
        clear_v2(shm, ptr)?;
    }
    *hdr = mark.hdr.clone();
    Ok(())
}

/// Writer-side handle over the tree. Constructed per write transaction
/// while the WRITER lock is held.
pub struct TreeWriter<'a> {
    shm: &'a ShmRegion,
    hdr: &'a mut TreeHeader,
    rollback: &'a mut Vec<ShmPtr>,
    recycle_floor: u32,
    txid: u64,
}

struct SeekPos {
    /// Ancestors: (ptr, node, child slot taken).
    path: Vec<(ShmPtr, Node, usize)>,
    ptr: ShmPtr,
    node: Node,
    /// Key cell (exact) or insertion point (miss).
    idx: usize,
    exact: bool,
}

impl<'a> TreeWriter<'a> {
    /// Creates a writer for the in-flight transaction.
    pub fn new(
        shm: &'a ShmRegion,
        hdr: &'a mut TreeHeader,
        rollback: &'a mut Vec<ShmPtr>,
        recycle_floor: u32,
    ) -> Self {
        let txid = hdr.root.txid + 1;
        Self {
            shm,
            hdr,
            rollback,
            recycle_floor,
            txid,
        }
    }

    /// A cursor over the writer's own uncommitted view.
    #[must_use]
    pub fn read_cursor(&self) -> TreeCursor {
        TreeCursor::new(self.shm.clone(), self.hdr.root, u64::MAX)
    }

    /// Captures a rollback point.
    #[must_use]
    pub fn mark(&self) -> TreeMark {
        TreeMark {
            log_len: self.rollback.len(),
            hdr: self.hdr.clone(),
        }
    }

    fn read_node(&self, ptr: ShmPtr) -> Result<Node> {
        Ok(Node::read(self.shm, ptr)?.materialized(u64::MAX))
    }

    fn write_node(&mut self, mut node: Node) -> Result<ShmPtr> {
        node.v2 = None;
        let mut arena = Arena::new(self.shm, self.hdr, self.recycle_floor);
        node.write(&mut arena)
    }

    fn write_new_entry(
        &mut self,
        flags: EntryFlags,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<ShmPtr> {
        let mut arena = Arena::new(self.shm, self.hdr, self.recycle_floor);
        write_entry(&mut arena, flags, key, value)
    }

    fn entry_cmp(&self, entry_ptr: ShmPtr, topic: u8, key: &[u8]) -> Result<Ordering> {
        let entry = read_entry(self.shm, entry_ptr)?;
        Ok(key_cmp(entry.topic(), &entry.key, topic, key))
    }

    /// Locates `key`, recording the descent path.
    #[allow(clippy::indexing_slicing)]
    fn seek(&self, topic: u8, key: &[u8]) -> Result<Option<SeekPos>> {
        if self.hdr.root.root.is_null() {
            return Ok(None);
        }

        let mut path = Vec::new();
        let mut ptr = self.hdr.root.root;

        loop {
            let node = Node::read(self.shm, ptr)?;

            let mut idx = node.nkey;
            let mut exact = false;
            for slot in 0..node.nkey {
                match self.entry_cmp(node.entries[slot], topic, key)? {
                    Ordering::Equal => {
                        idx = slot;
                        exact = true;
                        break;
                    }
                    Ordering::Greater => {
                        idx = slot;
                        break;
                    }
                    Ordering::Less => {}
                }
            }

            if exact || node.leaf {
                return Ok(Some(SeekPos {
                    path,
                    ptr,
                    node,
                    idx,
                    exact,
                }));
            }

            let child = node.child_at(idx, u64::MAX);
            path.push((ptr, node, idx));
            ptr = child;
        }
    }

    /// Re-links `new_child` into the ancestors of a rewritten node:
    /// the deepest unstamped ancestor takes a v2 override, stamped
    /// ancestors are copied, and a root change publishes through the
    /// header.
    #[allow(clippy::indexing_slicing)]
    fn update_child(
        &mut self,
        path: &[(ShmPtr, Node, usize)],
        mut new_child: ShmPtr,
    ) -> Result<()> {
        for (ptr, _stale, slot) in path.iter().rev() {
            let fresh = Node::read(self.shm, *ptr)?;

            if fresh.v2.is_none() {
                stamp_v2(
                    self.shm,
                    *ptr,
                    V2 {
                        slot: *slot,
                        child: new_child,
                        txid: self.txid,
                    },
                )?;
                self.rollback.push(*ptr);
                return Ok(());
            }

            let mut copy = fresh.materialized(u64::MAX);
            copy.children[*slot] = new_child;
            new_child = self.write_node(copy)?;
        }

        self.hdr.root.root = new_child;
        Ok(())
    }

    /// Replaces the entry under an exact-match position.
    #[allow(clippy::indexing_slicing)]
    fn replace_entry(&mut self, pos: &SeekPos, new_entry: ShmPtr) -> Result<()> {
        let mut node = pos.node.materialized(u64::MAX);
        node.entries[pos.idx] = new_entry;
        let ptr = self.write_node(node)?;
        self.update_child(&pos.path, ptr)
    }

    /// Inserts an entry at a miss position, splitting on the way up.
    #[allow(clippy::indexing_slicing)]
    fn insert_at(&mut self, pos: SeekPos, entry: ShmPtr) -> Result<()> {
        debug_assert!(!pos.exact && pos.node.leaf);

        let leaf = &pos.node;

        if leaf.nkey < MAX_KEYS {
            let mut new = leaf.clone();
            new.v2 = None;
            for slot in (pos.idx..new.nkey).rev() {
                new.entries[slot + 1] = new.entries[slot];
            }
            new.entries[pos.idx] = entry;
            new.nkey += 1;

            let ptr = self.write_node(new)?;
            return self.update_child(&pos.path, ptr);
        }

        // Leaf split: 3 existing keys plus the new one
        let mut all = [ShmPtr::NULL; MAX_KEYS + 1];
        let mut n = 0;
        for slot in 0..leaf.nkey {
            if slot == pos.idx {
                all[n] = entry;
                n += 1;
            }
            all[n] = leaf.entries[slot];
            n += 1;
        }
        if pos.idx == leaf.nkey {
            all[n] = entry;
        }

        let left = Node {
            leaf: true,
            nkey: 2,
            entries: [all[0], all[1], ShmPtr::NULL],
            ..Node::default()
        };
        let right = Node {
            leaf: true,
            nkey: 1,
            entries: [all[3], ShmPtr::NULL, ShmPtr::NULL],
            ..Node::default()
        };

        let left_ptr = self.write_node(left)?;
        let right_ptr = self.write_node(right)?;
        self.insert_into_parent(pos.path, all[2], left_ptr, right_ptr)
    }

    #[allow(clippy::indexing_slicing)]
    fn insert_into_parent(
        &mut self,
        mut path: Vec<(ShmPtr, Node, usize)>,
        mut promote: ShmPtr,
        mut left: ShmPtr,
        mut right: ShmPtr,
    ) -> Result<()> {
        loop {
            let Some((ptr, _stale, slot)) = path.pop() else {
                // Grow a new root
                let root = Node {
                    leaf: false,
                    nkey: 1,
                    entries: [promote, ShmPtr::NULL, ShmPtr::NULL],
                    children: [left, right, ShmPtr::NULL, ShmPtr::NULL],
                    v2: None,
                };
                self.hdr.root.root = self.write_node(root)?;
                self.hdr.root.height += 1;
                return Ok(());
            };

            let node = Node::read(self.shm, ptr)?.materialized(u64::MAX);

            if node.nkey < MAX_KEYS {
                let mut new = node;
                for i in (slot..new.nkey).rev() {
                    new.entries[i + 1] = new.entries[i];
                }
                for i in (slot + 1..=new.nkey).rev() {
                    new.children[i + 1] = new.children[i];
                }
                new.entries[slot] = promote;
                new.children[slot] = left;
                new.children[slot + 1] = right;
                new.nkey += 1;

                let new_ptr = self.write_node(new)?;
                return self.update_child(&path, new_ptr);
            }

            // Internal split: 4 keys, 5 children
            let mut entries4 = [ShmPtr::NULL; MAX_KEYS + 1];
            let mut children5 = [ShmPtr::NULL; MAX_KEYS + 2];

            let mut n = 0;
            for i in 0..node.nkey {
                if i == slot {
                    entries4[n] = promote;
                    n += 1;
                }
                entries4[n] = node.entries[i];
                n += 1;
            }
            if slot == node.nkey {
                entries4[n] = promote;
            }

            let mut n = 0;
            for i in 0..=node.nkey {
                if i == slot {
                    children5[n] = left;
                    n += 1;
                    children5[n] = right;
                    n += 1;
                } else {
                    children5[n] = node.children[i];
                    n += 1;
                }
            }

            let new_left = Node {
                leaf: false,
                nkey: 2,
                entries: [entries4[0], entries4[1], ShmPtr::NULL],
                children: [children5[0], children5[1], children5[2], ShmPtr::NULL],
                v2: None,
            };
            let new_right = Node {
                leaf: false,
                nkey: 1,
                entries: [entries4[3], ShmPtr::NULL, ShmPtr::NULL],
                children: [children5[3], children5[4], ShmPtr::NULL, ShmPtr::NULL],
                v2: None,
            };

            promote = entries4[2];
            left = self.write_node(new_left)?;
            right = self.write_node(new_right)?;
        }
    }

    fn pred_flags(&self, topic: u8, key: &[u8]) -> Result<Option<EntryFlags>> {
        let mut c = self.read_cursor();
        match c.seek(topic, key)? {
            None => return Ok(None),
            Some(Ordering::Less) => {}
            Some(_) => c.prev()?,
        }
        if c.valid() {
            Ok(Some(c.flags()?))
        } else {
            Ok(None)
        }
    }

    fn succ_flags(&self, topic: u8, key: &[u8]) -> Result<Option<EntryFlags>> {
        let mut c = self.read_cursor();
        match c.seek(topic, key)? {
            None => return Ok(None),
            Some(Ordering::Greater) => {}
            Some(Ordering::Equal) => c.next()?,
            Some(Ordering::Less) => c.invalidate(),
        }
        if c.valid() {
            Ok(Some(c.flags()?))
        } else {
            Ok(None)
        }
    }

    /// Inserts an entry, applying the range-delete coalescing rules.
    pub fn insert(
        &mut self,
        flags: EntryFlags,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        let topic = flags.topic();
        let sd = EntryFlags::START_DELETE;
        let ed = EntryFlags::END_DELETE;

        if flags.is_boundary_only() {
            let pos = self.seek(topic, key)?;

            if let Some(pos) = pos.as_ref().filter(|p| p.exact) {
                #[allow(clippy::indexing_slicing)]
                let existing = read_entry(self.shm, pos.node.entries[pos.idx])?;
                if existing.flags.contains(flags) {
                    return Ok(());
                }
                let merged = existing.flags | flags;
                let new_entry = self.write_new_entry(
                    merged,
                    &existing.key,
                    existing.value.as_deref(),
                )?;
                let pos = self.seek(topic, key)?.ok_or(Error::Corrupt("tree vanished"))?;
                return self.replace_entry(&pos, new_entry);
            }

            // A start boundary is redundant when the preceding entry
            // already opens a cover; an end boundary when the following
            // entry already closes one
            if flags.contains(sd)
                && self
                    .pred_flags(topic, key)?
                    .is_some_and(|f| f.contains(sd))
            {
                return Ok(());
            }
            if flags.contains(ed)
                && self
                    .succ_flags(topic, key)?
                    .is_some_and(|f| f.contains(ed))
            {
                return Ok(());
            }

            return self.plain_insert(flags, key, None);
        }

        // Content entry: INSERT or POINT_DELETE
        let pos = self.seek(topic, key)?;

        if let Some(pos) = pos.filter(|p| p.exact) {
            // Preserve the cover bits of the entry being replaced
            #[allow(clippy::indexing_slicing)]
            let existing = read_entry(self.shm, pos.node.entries[pos.idx])?;
            let keep = EntryFlags::from_bits(existing.flags.bits() & (sd.bits() | ed.bits()));
            let new_entry = self.write_new_entry(flags | keep, key, value)?;
            return self.replace_entry(&pos, new_entry);
        }

        // A fresh key inside an open cover inherits both bits so it
        // survives merges while the cover still shadows older data
        let covered = self
            .pred_flags(topic, key)?
            .is_some_and(|f| f.contains(sd))
            && self
                .succ_flags(topic, key)?
                .is_some_and(|f| f.contains(ed));

        let flags = if covered { flags | sd | ed } else { flags };
        self.plain_insert(flags, key, value)
    }

    /// Inserts without any coalescing. The key must not be present.
    fn plain_insert(
        &mut self,
        flags: EntryFlags,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        let entry = self.write_new_entry(flags, key, value)?;

        match self.seek(flags.topic(), key)? {
            None => {
                let leaf = Node::leaf_with(entry);
                self.hdr.root.root = self.write_node(leaf)?;
                self.hdr.root.height = 1;
                Ok(())
            }
            Some(pos) => {
                debug_assert!(!pos.exact);
                self.insert_at(pos, entry)
            }
        }
    }

    /// Largest (or smallest) entry in the subtree under `ptr`.
    #[allow(clippy::indexing_slicing)]
    fn edge_entry(&self, mut ptr: ShmPtr, rightmost: bool) -> Result<(ShmPtr, TreeEntry)> {
        loop {
            let node = self.read_node(ptr)?;
            if node.leaf {
                let cell = if rightmost { node.nkey - 1 } else { 0 };
                let entry_ptr = node.entries[cell];
                return Ok((entry_ptr, read_entry(self.shm, entry_ptr)?));
            }
            ptr = node.children[if rightmost { node.nkey } else { 0 }];
        }
    }

    fn merge_around(left: &Node, sep: ShmPtr, right: &Node) -> Node {
        debug_assert_eq!(1, left.nkey);
        debug_assert_eq!(1, right.nkey);

        Node {
            leaf: left.leaf,
            nkey: 3,
            entries: [left.entries[0], sep, right.entries[0]],
            children: [
                left.children[0],
                left.children[1],
                right.children[0],
                right.children[1],
            ],
            v2: None,
        }
    }

    /// Removes the entry with `key`, rebalancing with the classic
    /// borrow-or-merge discipline. All touched nodes are rewritten so
    /// readers on older headers keep their view.
    pub fn delete_key(&mut self, topic: u8, key: &[u8]) -> Result<bool> {
        if self.hdr.root.root.is_null() {
            return Ok(false);
        }

        let root = self.hdr.root.root;
        let (new_root, found) = self.delete_rec(root, topic, key, true)?;

        match new_root {
            None => {
                self.hdr.root.root = ShmPtr::NULL;
                self.hdr.root.height = 0;
            }
            Some(ptr) => {
                if ptr != root {
                    self.hdr.root.root = ptr;
                    self.hdr.root.height = self.measure_height(ptr)?;
                }
            }
        }
        Ok(found)
    }

    fn measure_height(&self, mut ptr: ShmPtr) -> Result<u32> {
        let mut height = 0;
        loop {
            height += 1;
            let node = self.read_node(ptr)?;
            if node.leaf {
                return Ok(height);
            }
            #[allow(clippy::indexing_slicing)]
            {
                ptr = node.children[0];
            }
        }
    }

    #[allow(clippy::indexing_slicing)]
    fn remove_leaf_slot(node: &Node, idx: usize) -> Node {
        let mut new = node.clone();
        for slot in idx..new.nkey - 1 {
            new.entries[slot] = new.entries[slot + 1];
        }
        new.entries[new.nkey - 1] = ShmPtr::NULL;
        new.nkey -= 1;
        new.v2 = None;
        new
    }

    #[allow(clippy::indexing_slicing, clippy::too_many_lines)]
    fn delete_rec(
        &mut self,
        ptr: ShmPtr,
        topic: u8,
        key: &[u8],
        is_root: bool,
    ) -> Result<(Option<ShmPtr>, bool)> {
        let node = self.read_node(ptr)?;

        let mut idx = node.nkey;
        let mut exact = false;
        for slot in 0..node.nkey {
            match self.entry_cmp(node.entries[slot], topic, key)? {
                Ordering::Equal => {
                    idx = slot;
                    exact = true;
                    break;
                }
                Ordering::Greater => {
                    idx = slot;
                    break;
                }
                Ordering::Less => {}
            }
        }

        if node.leaf {
            if !exact {
                return Ok((Some(ptr), false));
            }
            if node.nkey == 1 {
                debug_assert!(is_root, "interior leaves are kept at >= 2 keys");
                return Ok((None, true));
            }
            let new = Self::remove_leaf_slot(&node, idx);
            return Ok((Some(self.write_node(new)?), true));
        }

        if exact {
            let left_ptr = node.children[idx];
            let right_ptr = node.children[idx + 1];
            let left = self.read_node(left_ptr)?;
            let right = self.read_node(right_ptr)?;

            if left.nkey >= 2 {
                // Replace with the in-order predecessor, then delete it
                // from the left subtree
                let (pred_ptr, pred) = self.edge_entry(left_ptr, true)?;
                let (new_left, found) =
                    self.delete_rec(left_ptr, pred.topic(), &pred.key, false)?;
                debug_assert!(found);

                let mut new = node;
                new.entries[idx] = pred_ptr;
                new.children[idx] = new_left.ok_or(Error::Corrupt("subtree vanished"))?;
                new.v2 = None;
                return Ok((Some(self.write_node(new)?), true));
            }

            if right.nkey >= 2 {
                let (succ_ptr, succ) = self.edge_entry(right_ptr, false)?;
                let (new_right, found) =
                    self.delete_rec(right_ptr, succ.topic(), &succ.key, false)?;
                debug_assert!(found);

                let mut new = node;
                new.entries[idx] = succ_ptr;
                new.children[idx + 1] = new_right.ok_or(Error::Corrupt("subtree vanished"))?;
                new.v2 = None;
                return Ok((Some(self.write_node(new)?), true));
            }

            // Both neighbors minimal: merge them around the separator
            // and push the delete down into the merged node
            let merged = Self::merge_around(&left, node.entries[idx], &right);
            let merged_ptr = self.write_node(merged)?;

            if node.nkey == 1 {
                debug_assert!(is_root, "interior nodes are kept at >= 2 keys");
                return self.delete_rec(merged_ptr, topic, key, true);
            }

            let mut new = node;
            for slot in idx..new.nkey - 1 {
                new.entries[slot] = new.entries[slot + 1];
            }
            new.entries[new.nkey - 1] = ShmPtr::NULL;
            for slot in idx + 1..new.nkey {
                new.children[slot] = new.children[slot + 1];
            }
            new.children[new.nkey] = ShmPtr::NULL;
            new.nkey -= 1;
            new.children[idx] = merged_ptr;
            new.v2 = None;

            let (new_child, found) = self.delete_rec(merged_ptr, topic, key, false)?;
            new.children[idx] = new_child.ok_or(Error::Corrupt("subtree vanished"))?;
            return Ok((Some(self.write_node(new)?), found));
        }

        // Miss at an internal node: descend into children[idx], first
        // making sure the child can lose a key
        let child_ptr = node.children[idx];
        let child = self.read_node(child_ptr)?;

        if child.nkey >= 2 {
            let (new_child, found) = self.delete_rec(child_ptr, topic, key, false)?;
            if !found {
                return Ok((Some(ptr), false));
            }
            let mut new = node;
            new.children[idx] = new_child.ok_or(Error::Corrupt("subtree vanished"))?;
            new.v2 = None;
            return Ok((Some(self.write_node(new)?), true));
        }

        // Borrow from a sibling with spare keys
        if idx > 0 {
            let s_ptr = node.children[idx - 1];
            let sibling = self.read_node(s_ptr)?;
            if sibling.nkey >= 2 {
                let fixed = Node {
                    leaf: child.leaf,
                    nkey: 2,
                    entries: [node.entries[idx - 1], child.entries[0], ShmPtr::NULL],
                    children: [
                        sibling.children[sibling.nkey],
                        child.children[0],
                        child.children[1],
                        ShmPtr::NULL,
                    ],
                    v2: None,
                };
                let fixed_ptr = self.write_node(fixed)?;

                let mut new_sibling = sibling.clone();
                new_sibling.v2 = None;
                new_sibling.entries[new_sibling.nkey - 1] = ShmPtr::NULL;
                new_sibling.children[new_sibling.nkey] = ShmPtr::NULL;
                new_sibling.nkey -= 1;

                let mut new = node;
                new.entries[idx - 1] = sibling.entries[sibling.nkey - 1];
                new.children[idx - 1] = self.write_node(new_sibling)?;
                new.v2 = None;

                let (new_child, found) = self.delete_rec(fixed_ptr, topic, key, false)?;
                new.children[idx] = new_child.ok_or(Error::Corrupt("subtree vanished"))?;
                return Ok((Some(self.write_node(new)?), found));
            }
        }

        if idx < node.nkey {
            let s_ptr = node.children[idx + 1];
            let sibling = self.read_node(s_ptr)?;
            if sibling.nkey >= 2 {
                let fixed = Node {
                    leaf: child.leaf,
                    nkey: 2,
                    entries: [child.entries[0], node.entries[idx], ShmPtr::NULL],
                    children: [
                        child.children[0],
                        child.children[1],
                        sibling.children[0],
                        ShmPtr::NULL,
                    ],
                    v2: None,
                };
                let fixed_ptr = self.write_node(fixed)?;

                let mut new_sibling = sibling.clone();
                new_sibling.v2 = None;
                for slot in 0..new_sibling.nkey - 1 {
                    new_sibling.entries[slot] = new_sibling.entries[slot + 1];
                }
                new_sibling.entries[new_sibling.nkey - 1] = ShmPtr::NULL;
                for slot in 0..new_sibling.nkey {
                    new_sibling.children[slot] = new_sibling.children[slot + 1];
                }
                new_sibling.children[new_sibling.nkey] = ShmPtr::NULL;
                new_sibling.nkey -= 1;

                let mut new = node;
                new.entries[idx] = sibling.entries[0];
                new.children[idx + 1] = self.write_node(new_sibling)?;
                new.v2 = None;

                let (new_child, found) = self.delete_rec(fixed_ptr, topic, key, false)?;
                new.children[idx] = new_child.ok_or(Error::Corrupt("subtree vanished"))?;
                return Ok((Some(self.write_node(new)?), found));
            }
        }

        // No sibling can spare a key: merge
        let (sep, child_slot) = if idx > 0 {
            (idx - 1, idx)
        } else {
            (idx, idx + 1)
        };

        let left = self.read_node(node.children[sep])?;
        let right = self.read_node(node.children[sep + 1])?;
        let merged = Self::merge_around(&left, node.entries[sep], &right);
        let merged_ptr = self.write_node(merged)?;

        if node.nkey == 1 {
            debug_assert!(is_root, "interior nodes are kept at >= 2 keys");
            return self.delete_rec(merged_ptr, topic, key, true);
        }

        let mut new = node;
        for slot in sep..new.nkey - 1 {
            new.entries[slot] = new.entries[slot + 1];
        }
        new.entries[new.nkey - 1] = ShmPtr::NULL;
        for slot in child_slot..new.nkey {
            new.children[slot] = new.children[slot + 1];
        }
        new.children[new.nkey] = ShmPtr::NULL;
        new.nkey -= 1;
        new.children[sep] = merged_ptr;
        new.v2 = None;

        let (new_child, found) = self.delete_rec(merged_ptr, topic, key, false)?;
        new.children[sep] = new_child.ok_or(Error::Corrupt("subtree vanished"))?;
        Ok((Some(self.write_node(new)?), found))
    }

    /// Deletes every key strictly inside `(lo, hi)`, then plants the
    /// cover boundaries, subject to the coalescing rules.
    pub fn delete_range(&mut self, topic: u8, lo: &[u8], hi: &[u8]) -> Result<()> {
        if key_cmp(topic, lo, topic, hi) != Ordering::Less {
            return Ok(());
        }

        loop {
            let mut c = self.read_cursor();
            match c.seek(topic, lo)? {
                None => break,
                Some(Ordering::Equal) => c.next()?,
                Some(Ordering::Greater) => {}
                Some(Ordering::Less) => c.invalidate(),
            }
            if !c.valid() {
                break;
            }

            let entry = c.entry()?;
            if entry.topic() != topic
                || key_cmp(entry.topic(), &entry.key, topic, hi) != Ordering::Less
            {
                break;
            }

            // Interior entries (live keys, point deletes and stale
            // boundaries alike) are swallowed by the new cover
            let found = self.delete_key(topic, &entry.key)?;
            debug_assert!(found);
        }

        let mut start = EntryFlags::START_DELETE;
        let mut end = EntryFlags::END_DELETE;
        if topic != 0 {
            start = start | EntryFlags::SYSTEMKEY;
            end = end | EntryFlags::SYSTEMKEY;
        }

        self.insert(start, lo, None)?;
        self.insert(end, hi, None)
    }

    /// Moves the live tree aside for flushing and starts a fresh one.
    pub fn make_old(&mut self) -> Result<()> {
        if !self.hdr.old_root.is_empty() {
            return Err(Error::Misuse("an old tree is already pending"));
        }

        let (_, write_chunk_id) = self.shm.chunk_links(self.hdr.write.chunk())?;

        self.hdr.old_root = self.hdr.root;
        self.hdr.root = TreeRoot {
            root: ShmPtr::NULL,
            height: 0,
            txid: self.hdr.root.txid,
            byte_count: 0,
        };
        self.hdr.old_shmid = write_chunk_id;
        Ok(())
    }
}

/// Drops the flushed old tree and releases its chunks for recycling.
pub fn discard_old(hdr: &mut TreeHeader) {
    hdr.old_root = TreeRoot::default();
    if hdr.old_shmid != 0 {
        hdr.used_shmid = hdr.old_shmid;
        hdr.old_shmid = 0;
    }
}

/// Post-mortem repair after a writer died mid-transaction: clears v2
/// stamps newer than the verified header and rebuilds the chunk ring
/// from sequence ids.
pub fn repair(shm: &ShmRegion, hdr: &mut TreeHeader) -> Result<()> {
    fn scrub(shm: &ShmRegion, ptr: ShmPtr, max_txid: u64) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let node = Node::read(shm, ptr)?;

        if let Some(v2) = node.v2 {
            if v2.txid > max_txid {
                clear_v2(shm, ptr)?;
            } else if !node.leaf {
                scrub(shm, v2.child, max_txid)?;
            }
        }

        if !node.leaf {
            for slot in 0..=node.nkey {
                #[allow(clippy::indexing_slicing)]
                scrub(shm, node.children[slot], max_txid)?;
            }
        }
        Ok(())
    }

    let max_txid = hdr.root.txid;
    scrub(shm, hdr.root.root, max_txid)?;
    scrub(shm, hdr.old_root.root, max_txid)?;

    if hdr.chunk_count > 2 {
        let (first, _last) = rebuild_ring(shm, hdr)?;
        hdr.first_chunk = first;
    }
    Ok(())
}
