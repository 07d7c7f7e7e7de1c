// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cursor over one on-disk sorted run.
//!
//! Advancing skips separator B-tree pages and zero-cell continuation
//! pages; block boundaries are crossed through the block chain
//! pointers, honoring the snapshot's redirect table. Seeks descend the
//! per-segment B-tree when the run has one and fall back to a forward
//! scan from the first page otherwise.

use super::{BtreeKey, Cell, PageView};
use crate::{
    error::{Error, Result},
    fs::FileSystem,
    slice::Slice,
    snapshot::{Segment, Snapshot},
    tree::entry::{key_cmp, EntryFlags},
};
use std::{cmp::Ordering, sync::Arc};

/// Seek flavors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekBias {
    /// Exact match or invalid.
    Eq,

    /// Largest entry at or below the key.
    Le,

    /// Like `Le`, but the result may be a deleted or boundary entry;
    /// it is only guaranteed to be at or above any live entry at or
    /// below the key. Used for fast key allocation.
    LeFast,

    /// Smallest entry at or above the key.
    Ge,
}

/// Cursor state over one segment.
#[derive(Clone)]
pub struct SegCursor {
    fs: FileSystem,
    snapshot: Arc<Snapshot>,
    seg: Segment,
    view: Option<PageView>,
    cell: usize,
    current: Option<Cell>,
}

impl SegCursor {
    /// Creates an unpositioned cursor.
    #[must_use]
    pub fn new(fs: FileSystem, snapshot: Arc<Snapshot>, seg: Segment) -> Self {
        Self {
            fs,
            snapshot,
            seg,
            view: None,
            cell: 0,
            current: None,
        }
    }

    /// The segment this cursor reads.
    #[must_use]
    pub fn segment(&self) -> &Segment {
        &self.seg
    }

    /// Returns `true` while positioned on an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Drops the position.
    pub fn invalidate(&mut self) {
        self.view = None;
        self.current = None;
        self.cell = 0;
    }

    /// Current position as `(page id, cell)`.
    #[must_use]
    pub fn position(&self) -> Option<(u64, u32)> {
        #[allow(clippy::cast_possible_truncation)]
        self.view
            .as_ref()
            .map(|view| (view.id(), self.cell as u32))
    }

    /// Flags of the current entry.
    #[must_use]
    pub fn flags(&self) -> EntryFlags {
        self.current.as_ref().map(|c| c.flags).unwrap_or_default()
    }

    /// Key of the current entry.
    #[must_use]
    pub fn key(&self) -> Option<&Slice> {
        self.current.as_ref().map(|c| &c.key)
    }

    /// Value of the current entry.
    #[must_use]
    pub fn value(&self) -> Option<&Slice> {
        self.current.as_ref().and_then(|c| c.value.as_ref())
    }

    /// Forward pointer of the current entry.
    #[must_use]
    pub fn fwd(&self) -> u64 {
        self.current.as_ref().map_or(0, |c| c.fwd)
    }

    /// The whole current cell.
    #[must_use]
    pub fn cell(&self) -> Option<&Cell> {
        self.current.as_ref()
    }

    // --- page navigation ----------------------------------------------

    /// Reads the page at logical id `id`, applying block redirects.
    pub fn read_view(&self, id: u64) -> Result<PageView> {
        let physical = self.snapshot.redirect_page(&self.fs, id);
        let page = self.fs.read_page(physical)?;
        Ok(PageView::new(&self.fs, page))
    }

    /// Logical id of the page after `id` within the segment.
    fn page_next_id(&self, id: u64) -> Result<Option<u64>> {
        if id == self.seg.last {
            return Ok(None);
        }

        if self.fs.compressed() {
            let physical = self.snapshot.redirect_page(&self.fs, id);
            let (_page, next, _padding) = self.fs.read_compressed_record(physical)?;
            return Ok(Some(next));
        }

        let block = self.fs.block_of_page(id);
        if id == self.fs.last_page_of_block(block) {
            let physical_block = self.snapshot.redirect_block(block);
            let next_block = self.fs.next_block(physical_block)?;
            if next_block == 0 {
                return Ok(None);
            }
            Ok(Some(self.fs.first_data_page(next_block)))
        } else {
            Ok(Some(id + 1))
        }
    }

    /// Logical id of the page before `id` within the segment.
    fn page_prev_id(&self, id: u64) -> Result<Option<u64>> {
        if id == self.seg.first {
            return Ok(None);
        }

        if self.fs.compressed() {
            let first = self.snapshot.redirect_page(&self.fs, self.seg.first);
            let physical = self.snapshot.redirect_page(&self.fs, id);
            return self.fs.compressed_prev(physical, first);
        }

        let block = self.fs.block_of_page(id);
        if id == self.fs.first_data_page(block) {
            let physical_block = self.snapshot.redirect_block(block);
            let prev_block = self.fs.prev_block(physical_block)?;
            if prev_block == 0 {
                return Ok(None);
            }
            Ok(Some(self.fs.last_page_of_block(prev_block)))
        } else {
            Ok(Some(id - 1))
        }
    }

    /// Reads the cell, following continuation pages for oversized
    /// records.
    fn read_cell(&self, view: &PageView, i: usize) -> Result<Cell> {
        let mut r = SpanReader {
            csr: self,
            view: view.clone(),
            pos: view.cell_start(i)?,
        };

        let flags = EntryFlags::from_bits(r.byte()?);
        let fwd = r.varint()?;
        let klen = r.varint()? as usize;
        let key = Slice::from(r.bytes(klen)?);

        let value = if flags.is_insert() {
            let vlen = r.varint()? as usize;
            Some(Slice::from(r.bytes(vlen)?))
        } else {
            None
        };

        Ok(Cell {
            flags,
            fwd,
            key,
            value,
        })
    }

    fn load(&mut self, view: PageView, cell: usize) -> Result<()> {
        self.current = Some(self.read_cell(&view, cell)?);
        self.view = Some(view);
        self.cell = cell;
        Ok(())
    }

    /// Moves forward from `id` (inclusive) to the next page carrying
    /// cells.
    fn first_data_view_from(&self, mut id: u64) -> Result<Option<PageView>> {
        loop {
            let view = self.read_view(id)?;
            if !view.is_btree() && view.ncell() > 0 {
                return Ok(Some(view));
            }
            match self.page_next_id(id)? {
                Some(next) => id = next,
                None => return Ok(None),
            }
        }
    }

    /// Moves backward from `id` (inclusive) to the previous page
    /// carrying cells.
    fn last_data_view_from(&self, mut id: u64) -> Result<Option<PageView>> {
        loop {
            let view = self.read_view(id)?;
            if !view.is_btree() && view.ncell() > 0 {
                return Ok(Some(view));
            }
            match self.page_prev_id(id)? {
                Some(prev) => id = prev,
                None => return Ok(None),
            }
        }
    }

    /// Every page id of the segment, in chain order (including
    /// separator B-tree and continuation pages).
    pub fn pages(&self) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        if self.seg.is_empty() {
            return Ok(out);
        }

        let mut id = self.seg.first;
        loop {
            out.push(id);
            match self.page_next_id(id)? {
                Some(next) => id = next,
                None => break,
            }
        }
        Ok(out)
    }

    /// Reads the `(topic, key)` of an arbitrary cell, used to
    /// materialize split keys from merge descriptors.
    pub fn key_at(&self, page: u64, cell: u32) -> Result<(u8, Slice)> {
        let view = self.read_view(page)?;
        let cell = self.read_cell(&view, cell as usize)?;
        Ok((cell.flags.topic(), cell.key))
    }

    /// Positions directly at `(page, cell)`, as persisted in a merge
    /// descriptor.
    pub fn goto(&mut self, page: u64, cell: u32) -> Result<()> {
        self.invalidate();
        let view = self.read_view(page)?;
        if (cell as usize) < view.ncell() {
            self.load(view, cell as usize)?;
        }
        Ok(())
    }

    /// Positions at the first entry of the segment.
    pub fn first(&mut self) -> Result<()> {
        self.invalidate();
        if self.seg.is_empty() {
            return Ok(());
        }
        if let Some(view) = self.first_data_view_from(self.seg.first)? {
            self.load(view, 0)?;
        }
        Ok(())
    }

    /// Positions at the last entry of the segment.
    pub fn last(&mut self) -> Result<()> {
        self.invalidate();
        if self.seg.is_empty() {
            return Ok(());
        }
        if let Some(view) = self.last_data_view_from(self.seg.last)? {
            let cell = view.ncell() - 1;
            self.load(view, cell)?;
        }
        Ok(())
    }

    /// Advances to the next entry.
    pub fn next(&mut self) -> Result<()> {
        let Some(view) = self.view.take() else {
            return Ok(());
        };
        self.current = None;

        if self.cell + 1 < view.ncell() {
            let cell = self.cell + 1;
            return self.load(view, cell);
        }

        match self.page_next_id(view.id())? {
            None => Ok(()),
            Some(next) => {
                if let Some(view) = self.first_data_view_from(next)? {
                    self.load(view, 0)?;
                }
                Ok(())
            }
        }
    }

    /// Steps back to the previous entry.
    pub fn prev(&mut self) -> Result<()> {
        let Some(view) = self.view.take() else {
            return Ok(());
        };
        self.current = None;

        if self.cell > 0 {
            let cell = self.cell - 1;
            return self.load(view, cell);
        }

        match self.page_prev_id(view.id())? {
            None => Ok(()),
            Some(prev) => {
                if let Some(view) = self.last_data_view_from(prev)? {
                    let cell = view.ncell() - 1;
                    self.load(view, cell)?;
                }
                Ok(())
            }
        }
    }

    /// Resolves a separator key, loading indirect references.
    pub fn btree_key(&self, key: &BtreeKey) -> Result<Slice> {
        match key {
            BtreeKey::Inline(key) => Ok(key.clone()),
            BtreeKey::Indirect { page, cell } => {
                let view = self.read_view(*page)?;
                Ok(self.read_cell(&view, *cell as usize)?.key)
            }
        }
    }

    /// Descends the per-segment B-tree to the data page that may hold
    /// `key`.
    fn descend(&self, topic: u8, key: &[u8]) -> Result<u64> {
        let mut pg = self.seg.root;

        loop {
            let view = self.read_view(pg)?;
            if !view.is_btree() {
                return Ok(pg);
            }

            // Rightmost separator <= key wins; the footer base pointer
            // is the leftmost child
            let mut child = view.base_ptr();
            let mut lo = 0usize;
            let mut hi = view.ncell();
            while lo < hi {
                let mid = (lo + hi) / 2;
                let cell = view.btree_cell(mid)?;
                let sep = self.btree_key(&cell.key)?;
                match key_cmp(cell.flags.topic(), &sep, topic, key) {
                    Ordering::Greater => hi = mid,
                    _ => {
                        child = cell.child;
                        lo = mid + 1;
                    }
                }
            }

            pg = child;
        }
    }

    /// Positions at the smallest entry >= `key`, scanning forward from
    /// `start` (handles pages the separator layer does not cover).
    fn scan_ge(&mut self, start: u64, topic: u8, key: &[u8]) -> Result<()> {
        let mut id = start;
        loop {
            let Some(view) = self.first_data_view_from(id)? else {
                return Ok(());
            };

            // Binary search inside the page
            let mut lo = 0usize;
            let mut hi = view.ncell();
            while lo < hi {
                let mid = (lo + hi) / 2;
                let cell = self.read_cell(&view, mid)?;
                match key_cmp(cell.flags.topic(), &cell.key, topic, key) {
                    Ordering::Less => lo = mid + 1,
                    _ => hi = mid,
                }
            }

            if lo < view.ncell() {
                return self.load(view, lo);
            }

            match self.page_next_id(view.id())? {
                None => return Ok(()),
                Some(next) => id = next,
            }
        }
    }

    /// Seeks with the given bias.
    pub fn seek(&mut self, topic: u8, key: &[u8], bias: SeekBias) -> Result<()> {
        self.invalidate();
        if self.seg.is_empty() {
            return Ok(());
        }

        let start = if self.seg.root != 0 {
            self.descend(topic, key)?
        } else {
            self.seg.first
        };

        self.scan_ge(start, topic, key)?;

        let exact = self
            .current
            .as_ref()
            .is_some_and(|c| key_cmp(c.flags.topic(), &c.key, topic, key) == Ordering::Equal);

        match bias {
            SeekBias::Ge => Ok(()),
            SeekBias::Eq => {
                if !exact {
                    self.invalidate();
                }
                Ok(())
            }
            SeekBias::Le | SeekBias::LeFast => {
                if exact {
                    return Ok(());
                }
                if self.valid() {
                    // Positioned just above the key: one step back
                    self.prev()
                } else {
                    // Everything is below the key
                    self.last()
                }
            }
        }
    }
}

/// Streams a cell's bytes across continuation pages.
struct SpanReader<'a> {
    csr: &'a SegCursor,
    view: PageView,
    pos: usize,
}

impl SpanReader<'_> {
    fn byte(&mut self) -> Result<u8> {
        loop {
            let content = self.view.content();
            if let Some(&b) = content.get(self.pos) {
                self.pos += 1;
                return Ok(b);
            }

            let next = self
                .csr
                .page_next_id(self.view.id())?
                .ok_or(Error::Corrupt("cell continues past the segment"))?;
            self.view = self.csr.read_view(next)?;
            self.pos = 0;
        }
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::Corrupt("varint overflow in spanning cell"));
            }
        }
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let content = self.view.content();
            let avail = content.len().saturating_sub(self.pos);
            if avail == 0 {
                self.byte().map(|b| out.push(b))?;
                continue;
            }
            let take = avail.min(n - out.len());

            #[allow(clippy::indexing_slicing)]
            out.extend_from_slice(&content[self.pos..self.pos + take]);
            self.pos += take;
        }
        Ok(out)
    }
}
