// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The merge worker: drains a multi-cursor into a new on-disk segment.
//!
//! Pages are emitted in stream order, chained across freshly allocated
//! blocks. As data pages complete, their first keys feed a separator
//! B-tree built bottom-up alongside the data; a key wasting more than
//! a quarter of a page is promoted as an indirect reference instead,
//! and continuation pages of oversized records are flagged so seeks
//! know the separator layer does not cover them.
//!
//! New segments start at one of the snapshot's append points when a
//! partially used block is available, preferring points outside the
//! blocks being consumed, and fall back to allocating a block from the
//! free list (or the end of the file).

use crate::{
    error::{Error, Result},
    fs::{FileSystem, PGFTR_BTREE, PGFTR_SKIP_NEXT, PGFTR_SKIP_THIS},
    multi_cursor::{MergedEntry, MultiCursor},
    segment::{encode_btree_cell, encode_cell, BtreeKey, PageBuilder},
    slice::Slice,
    snapshot::{FreelistEntry, MergeInput, Segment, Snapshot},
    tree::entry::EntryFlags,
};

/// Keys above this fraction of a page are promoted indirectly.
const INDIRECT_KEY_DIVISOR: usize = 4;

struct OutPage {
    builder: PageBuilder,
    /// Pre-allocated page number (uncompressed mode only).
    id: Option<u64>,
    /// Separator under which this page registers with the hierarchy.
    sep: Option<SepKey>,
}

#[derive(Clone)]
struct SepKey {
    topic: u8,
    key: BtreeKey,
}

#[derive(Default)]
struct HierLevel {
    /// First child of this level, before any separator.
    leftmost: Option<u64>,

    builder: Option<PageBuilder>,

    /// Pre-allocated page number of the open builder (uncompressed).
    builder_id: Option<u64>,

    /// Separator under which the open builder page registers upward.
    builder_sep: Option<SepKey>,
}

/// What a finished (or paused) merge leaves behind.
pub struct MergeOutcome {
    /// The working snapshot, with allocation bookkeeping applied.
    pub snap: Snapshot,

    /// The output run built so far.
    pub segment: Segment,

    /// Resume state when the merge paused before draining its inputs.
    pub paused: Option<PausedMerge>,

    /// Bytes of key/value payload written.
    pub bytes_written: u64,
}

/// Resume positions of a paused merge.
pub struct PausedMerge {
    /// Per-input (page, cell) positions.
    pub inputs: Vec<MergeInput>,

    /// Position holding the first unmerged key.
    pub split: MergeInput,

    /// Next output write position.
    pub output: u64,
}

/// Builds one output segment from a multi-cursor.
pub struct MergeWorker {
    fs: FileSystem,
    mc: MultiCursor,
    snap: Snapshot,

    /// Oldest snapshot id still pinned by any reader; freed blocks
    /// below it may be reused.
    safe_id: u64,

    /// Output feeds the oldest level: deletes annihilate.
    oldest: bool,

    /// Blocks to avoid when picking an append point.
    avoid_blocks: Vec<u32>,

    seg: Segment,
    out: Option<OutPage>,

    /// Next write position: page number (uncompressed) or byte offset
    /// (compressed).
    next_pos: u64,

    hier: Vec<HierLevel>,
    bytes_written: u64,
    done: bool,
}

impl MergeWorker {
    /// Prepares a worker writing into `snap`.
    pub fn new(
        fs: FileSystem,
        mc: MultiCursor,
        snap: Snapshot,
        safe_id: u64,
        oldest: bool,
        avoid_blocks: Vec<u32>,
        resume_output: Option<u64>,
    ) -> Result<Self> {
        let mut worker = Self {
            fs,
            mc,
            snap,
            safe_id,
            oldest,
            avoid_blocks,
            seg: Segment::default(),
            out: None,
            next_pos: 0,
            hier: Vec::new(),
            bytes_written: 0,
            done: false,
        };

        let resuming = matches!(resume_output, Some(output) if output != 0);
        worker.next_pos = match resume_output {
            Some(output) if output != 0 => output,
            _ => worker.pick_start()?,
        };

        if resuming {
            // Input cursors were already positioned from the merge
            // descriptor
            worker.mc.init_current()?;
        } else {
            worker.mc.first()?;
        }
        Ok(worker)
    }

    /// Bytes of payload written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Returns `true` once every input is drained.
    #[must_use]
    pub fn done(&self) -> bool {
        self.done
    }

    // --- block allocation ----------------------------------------------

    fn allocate_block(&mut self) -> Result<u32> {
        let safe_id = self.safe_id;

        // Entries with a negative id were never part of a published
        // snapshot and may be reused immediately
        #[allow(clippy::cast_sign_loss)]
        if let Some(pos) = self
            .snap
            .freelist
            .iter()
            .position(|e| e.id < 0 || (e.id as u64) < safe_id)
        {
            let entry = self.snap.freelist.remove(pos);
            log::trace!("merge: reusing free block {}", entry.block);
            return Ok(entry.block);
        }

        self.snap.block_count += 1;
        log::trace!("merge: extending file to block {}", self.snap.block_count);
        Ok(self.snap.block_count)
    }

    fn block_first_pos(&self, block: u32) -> u64 {
        if self.fs.compressed() {
            self.fs.payload_start(block)
        } else {
            self.fs.first_data_page(block)
        }
    }

    fn pos_block(&self, pos: u64) -> u32 {
        if self.fs.compressed() {
            self.fs.block_of_offset(pos)
        } else {
            self.fs.block_of_page(pos)
        }
    }

    /// Chooses where the new segment starts: an append point outside
    /// the input blocks if one exists, otherwise a fresh block.
    fn pick_start(&mut self) -> Result<u64> {
        for i in 0..self.snap.append_points.len() {
            #[allow(clippy::indexing_slicing)]
            let point = self.snap.append_points[i];
            if point == 0 {
                continue;
            }
            if self.avoid_blocks.contains(&self.pos_block(point)) {
                continue;
            }

            #[allow(clippy::indexing_slicing)]
            {
                self.snap.append_points[i] = 0;
            }
            return Ok(point);
        }

        // A virgin database writes into block 1, right after the meta
        // region
        let virgin = self.snap.block_count == 1
            && self
                .snap
                .levels
                .iter()
                .all(|l| l.lhs.is_empty() && l.rhs.is_empty());
        if virgin {
            return Ok(self.block_first_pos(1));
        }

        let block = self.allocate_block()?;
        Ok(self.block_first_pos(block))
    }

    /// Records the tail of the finished segment as a future append
    /// point.
    fn record_append_point(&mut self) {
        let pos = self.next_pos;
        if pos == 0 {
            return;
        }
        if let Some(slot) = self.snap.append_points.iter().position(|&p| p == 0) {
            #[allow(clippy::indexing_slicing)]
            {
                self.snap.append_points[slot] = pos;
            }
        }
    }

    /// Advances `next_pos` past one page, chaining a new block when the
    /// current one is exhausted (uncompressed mode).
    fn bump_page(&mut self) -> Result<u64> {
        debug_assert!(!self.fs.compressed());

        let id = self.next_pos;
        let block = self.fs.block_of_page(id);

        if id == self.fs.last_page_of_block(block) {
            let next = self.allocate_block()?;
            self.fs.set_next_block(block, next)?;
            self.fs.set_prev_block(next, block)?;
            self.next_pos = self.fs.first_data_page(next);
        } else {
            self.next_pos = id + 1;
        }
        Ok(id)
    }

    fn new_builder(&mut self, flags: u16) -> Result<(PageBuilder, Option<u64>)> {
        if self.fs.compressed() {
            let ps = self.fs.page_size();
            Ok((PageBuilder::new(ps, 0, ps, flags), None))
        } else {
            let id = self.bump_page()?;
            let (off, len) = self.fs.data_range(id);
            Ok((PageBuilder::new(self.fs.page_size(), off, len, flags), Some(id)))
        }
    }

    /// Writes a finished page image, returning its final id.
    fn write_image(&mut self, id: Option<u64>, image: &[u8]) -> Result<u64> {
        if self.fs.compressed() {
            let fs = self.fs.clone();
            let start = self.next_pos;

            // The append callback cannot borrow the snapshot, so blocks
            // are pre-allocated for the worst case (a record spans at
            // most its own size in blocks) and unused ones returned
            let worst = image.len() / self.fs.block_size() + 2;
            let mut next_blocks: Vec<u32> = Vec::with_capacity(worst);
            for _ in 0..worst {
                let block = self.allocate_block()?;
                next_blocks.push(block);
            }
            let mut queue = next_blocks.clone().into_iter();
            let mut used = 0usize;

            let (id, end) = fs.append_compressed_page(start, image, &mut || {
                used += 1;
                queue.next().ok_or(Error::Full)
            })?;

            // Return unused pre-allocations, newest first so the file
            // end shrinks back
            for &block in next_blocks.get(used..).unwrap_or(&[]).iter().rev() {
                if block == self.snap.block_count {
                    self.snap.block_count -= 1;
                } else {
                    self.snap.freelist.push(FreelistEntry { block, id: -1 });
                }
            }

            self.next_pos = end;
            Ok(id)
        } else {
            let id = id.ok_or(Error::Other("page id missing"))?;
            self.fs.write_page(id, image)?;
            Ok(id)
        }
    }

    fn bump_segment(&mut self, id: u64) {
        if self.seg.first == 0 {
            self.seg.first = id;
        }
        self.seg.last = self.seg.last.max(id);
        self.seg.size += 1;
    }

    // --- separator hierarchy -------------------------------------------

    fn sep_for(&self, topic: u8, key: &Slice, page: u64) -> SepKey {
        if key.len() > self.fs.page_size() / INDIRECT_KEY_DIVISOR {
            SepKey {
                topic,
                key: BtreeKey::Indirect { page, cell: 0 },
            }
        } else {
            SepKey {
                topic,
                key: BtreeKey::Inline(key.clone()),
            }
        }
    }

    /// Registers a finished page with hierarchy level `level`.
    fn register(&mut self, level: usize, sep: Option<SepKey>, page: u64) -> Result<()> {
        while self.hier.len() <= level {
            self.hier.push(HierLevel::default());
        }

        let Some(sep) = sep else {
            #[allow(clippy::indexing_slicing)]
            {
                self.hier[level].leftmost = Some(page);
            }
            return Ok(());
        };

        let flags = if sep.topic == 0 {
            EntryFlags::SEPARATOR
        } else {
            EntryFlags::SEPARATOR | EntryFlags::SYSTEMKEY
        };
        let cell = encode_btree_cell(flags, page, &sep.key);

        #[allow(clippy::indexing_slicing)]
        let needs_new = self.hier[level].builder.is_none();

        if needs_new {
            let (mut builder, id) = self.new_builder(PGFTR_BTREE)?;

            #[allow(clippy::indexing_slicing)]
            let state = &mut self.hier[level];
            let leftmost = state
                .leftmost
                .ok_or(Error::Other("hierarchy skipped a page"))?;
            builder.set_base_ptr(leftmost);
            state.builder = Some(builder);
            state.builder_id = id;
            state.builder_sep = None;
        }

        #[allow(clippy::indexing_slicing)]
        let pushed = self.hier[level]
            .builder
            .as_mut()
            .is_some_and(|b| b.push_cell(&cell));
        if pushed {
            return Ok(());
        }

        // The open page is full: write it, register it one level up,
        // and start a fresh page whose leftmost child absorbs this
        // separator
        #[allow(clippy::indexing_slicing)]
        let (builder, id, finished_sep) = {
            let state = &mut self.hier[level];
            (
                state.builder.take().ok_or(Error::Other("hierarchy builder missing"))?,
                state.builder_id.take(),
                state.builder_sep.take(),
            )
        };

        let image = builder.finish();
        let written = self.write_image(id, &image)?;
        self.bump_segment(written);
        self.register(level + 1, finished_sep, written)?;

        let (mut builder, id) = self.new_builder(PGFTR_BTREE)?;
        builder.set_base_ptr(page);

        #[allow(clippy::indexing_slicing)]
        let state = &mut self.hier[level];
        state.builder = Some(builder);
        state.builder_id = id;
        state.builder_sep = Some(sep);
        state.leftmost = Some(page);
        Ok(())
    }

    /// Flushes the hierarchy bottom-up and returns the B-tree root (0
    /// when the segment has a single data page and no separators).
    fn finish_hierarchy(&mut self) -> Result<u64> {
        let mut level = 0;
        while level < self.hier.len() {
            #[allow(clippy::indexing_slicing)]
            let open = {
                let state = &mut self.hier[level];
                state
                    .builder
                    .take()
                    .map(|b| (b, state.builder_id.take(), state.builder_sep.take()))
            };

            if let Some((builder, id, sep)) = open {
                let image = builder.finish();
                let written = self.write_image(id, &image)?;
                self.bump_segment(written);
                self.register(level + 1, sep, written)?;
            }
            level += 1;
        }

        let root = match self.hier.last() {
            Some(top) if self.hier.len() > 1 => top.leftmost.unwrap_or(0),
            _ => 0,
        };
        Ok(root)
    }

    // --- output stream -------------------------------------------------

    fn start_data_page(&mut self, first_key: Option<(u8, Slice)>) -> Result<()> {
        let (builder, id) = self.new_builder(0)?;

        let sep = match first_key {
            // The first page of the segment is never promoted
            None => None,
            Some((topic, key)) => {
                let page_hint = id.unwrap_or(0);
                Some(self.sep_for(topic, &key, page_hint))
            }
        };

        self.out = Some(OutPage { builder, id, sep });
        Ok(())
    }

    /// Finishes the open data page, writes it and feeds the hierarchy.
    fn flush_data_page(&mut self) -> Result<Option<u64>> {
        let Some(out) = self.out.take() else {
            return Ok(None);
        };
        if out.builder.ncell() == 0 {
            return Ok(None);
        }

        let sep = out.sep.clone();
        let image = out.builder.finish();
        let written = self.write_image(out.id, &image)?;
        self.bump_segment(written);

        // Indirect separators reference the page they describe, which
        // in compressed mode is only known after the append
        let sep = sep.map(|mut sep| {
            if let BtreeKey::Indirect { page, .. } = &mut sep.key {
                *page = written;
            }
            sep
        });

        self.register(0, sep, written)?;
        Ok(Some(written))
    }

    /// Appends one record to the output.
    fn push_output(&mut self, entry: &MergedEntry) -> Result<()> {
        let cell = encode_cell(
            entry.flags,
            entry.fwd,
            &entry.key,
            entry.value.as_deref(),
        );
        self.bytes_written += cell.len() as u64;

        if self.out.is_none() {
            self.start_data_page(None)?;
        }

        #[allow(clippy::expect_used)]
        let fits = self
            .out
            .as_mut()
            .expect("output page was just created")
            .builder
            .push_cell(&cell);
        if fits {
            return Ok(());
        }

        let had_cells = self.out.as_ref().is_some_and(|o| o.builder.ncell() > 0);
        if had_cells {
            self.flush_data_page()?;
            self.start_data_page(Some((entry.topic, entry.key.clone())))?;

            #[allow(clippy::expect_used)]
            let fits = self
                .out
                .as_mut()
                .expect("output page was just created")
                .builder
                .push_cell(&cell);
            if fits {
                return Ok(());
            }
        }

        // Oversized record: fill this page and spill the rest onto
        // zero-cell continuation pages
        #[allow(clippy::expect_used)]
        let consumed = self
            .out
            .as_mut()
            .expect("output page exists")
            .builder
            .push_cell_start(&cell);

        if let Some(out) = self.out.as_mut() {
            out.builder.set_flags(out.builder.flags() | PGFTR_SKIP_NEXT);
        }
        self.flush_data_page()?;

        let mut rest = cell.get(consumed..).unwrap_or(&[]);
        while !rest.is_empty() {
            let (mut builder, id) = self.new_builder(PGFTR_SKIP_THIS)?;
            let n = builder.push_fragment(rest);
            rest = rest.get(n..).unwrap_or(&[]);
            if !rest.is_empty() {
                builder.set_flags(builder.flags() | PGFTR_SKIP_NEXT);
            }

            let image = builder.finish();
            let written = self.write_image(id, &image)?;
            self.bump_segment(written);
        }

        // The next data page resumes normal service
        self.out = None;
        Ok(())
    }

    /// Decides whether the coalesced entry survives into the output.
    fn output_filter(&self, entry: &MergedEntry) -> Option<MergedEntry> {
        let mut entry = entry.clone();

        if self.oldest {
            // Nothing below this level: deletes annihilate
            if !entry.flags.is_insert() || entry.covered {
                return None;
            }
            entry.flags = entry
                .flags
                .without(EntryFlags::START_DELETE | EntryFlags::END_DELETE | EntryFlags::POINT_DELETE);
            return Some(entry);
        }

        // A newer cover kills the payload but the boundary bits of the
        // position survive
        if entry.covered {
            entry.flags = entry
                .flags
                .without(EntryFlags::INSERT | EntryFlags::POINT_DELETE);
            entry.value = None;
        }

        // A point-delete fully enclosed in a cover is redundant
        let suppressed = EntryFlags::START_DELETE
            | EntryFlags::END_DELETE
            | EntryFlags::POINT_DELETE;
        if entry.flags.without(EntryFlags::SYSTEMKEY) == suppressed {
            return None;
        }

        // Nothing left to say about this key
        if entry.flags.is_boundary_only()
            && !entry
                .flags
                .intersects(EntryFlags::START_DELETE | EntryFlags::END_DELETE)
        {
            return None;
        }

        Some(entry)
    }

    /// Writes one record and advances. Returns `true` when the inputs
    /// are drained.
    pub fn step(&mut self) -> Result<bool> {
        if !self.mc.valid() {
            self.done = true;
            return Ok(true);
        }

        if let Some(merged) = self.mc.merged() {
            if let Some(entry) = self.output_filter(&merged) {
                self.push_output(&entry)?;
            }
        }

        self.mc.next()?;
        if !self.mc.valid() {
            self.done = true;
        }
        Ok(self.done)
    }

    /// Finalizes the output segment.
    ///
    /// On a clean finish the hierarchy is flushed and the B-tree root
    /// recorded; on a pause the open hierarchy pages are written as
    /// blanks and the segment is left without a separator tree, and
    /// the caller persists the returned resume positions. Compressed
    /// databases pad the tail to a sector boundary so future appends
    /// touch only fresh sectors.
    pub fn shutdown(mut self) -> Result<MergeOutcome> {
        self.flush_data_page()?;

        let paused = if self.done {
            self.seg.root = self.finish_hierarchy()?;
            None
        } else {
            // Blank out pre-allocated hierarchy slots; the resumed
            // merge rebuilds no separator tree
            let levels = std::mem::take(&mut self.hier);
            for state in levels {
                if let (Some(_builder), Some(id)) = (state.builder, state.builder_id) {
                    let (off, len) = self.fs.data_range(id);
                    let blank = PageBuilder::new(self.fs.page_size(), off, len, 0);
                    self.write_image(Some(id), &blank.finish())?;
                }
            }
            self.seg.root = 0;

            let split = self
                .mc
                .winner_seg_position()
                .map(|(page, cell)| MergeInput { page, cell })
                .unwrap_or_default();

            let inputs = self
                .mc
                .seg_positions()
                .into_iter()
                .map(|(page, cell)| MergeInput { page, cell })
                .collect();

            Some(PausedMerge {
                inputs,
                split,
                output: self.next_pos,
            })
        };

        // Sector padding keeps later appends off the just-written tail
        if self.fs.compressed() && self.done {
            let sector = self.fs.sector_size() as u64;
            let tail = self.next_pos % sector;
            if tail != 0 {
                let mut gap = (sector - tail) as usize;
                if gap < 6 {
                    gap += sector as usize;
                }
                let pos = self.next_pos;
                let fs = self.fs.clone();
                let mut blocks = Vec::new();
                for _ in 0..2 {
                    blocks.push(self.allocate_block()?);
                }
                let mut used = 0usize;
                let mut queue = blocks.clone().into_iter();
                self.next_pos = fs.append_compressed_padding(pos, gap, &mut || {
                    used += 1;
                    queue.next().ok_or(Error::Full)
                })?;
                for &block in blocks.get(used..).unwrap_or(&[]).iter().rev() {
                    if block == self.snap.block_count {
                        self.snap.block_count -= 1;
                    } else {
                        self.snap.freelist.push(FreelistEntry { block, id: -1 });
                    }
                }
            }
        }

        if self.done {
            self.record_append_point();
        }

        log::debug!(
            "merge: segment {}..{} ({} pages, root {}, {} bytes){}",
            self.seg.first,
            self.seg.last,
            self.seg.size,
            self.seg.root,
            self.bytes_written,
            if paused.is_some() { " [paused]" } else { "" },
        );

        Ok(MergeOutcome {
            snap: self.snap,
            segment: self.seg,
            paused,
            bytes_written: self.bytes_written,
        })
    }
}

/// Every block of a segment, in chain order.
pub fn segment_blocks(fs: &FileSystem, snap: &Snapshot, seg: &Segment) -> Result<Vec<u32>> {
    if seg.is_empty() {
        return Ok(Vec::new());
    }

    let (first, last) = if fs.compressed() {
        (fs.block_of_offset(seg.first), fs.block_of_offset(seg.last))
    } else {
        (fs.block_of_page(seg.first), fs.block_of_page(seg.last))
    };

    let mut out = Vec::new();
    let mut block = first;
    loop {
        out.push(block);
        if block == last {
            return Ok(out);
        }
        block = fs.next_block(snap.redirect_block(block))?;
        if block == 0 {
            return Ok(out);
        }
    }
}

/// Frees the blocks of consumed input segments, skipping blocks shared
/// with neighbors at either edge.
pub fn free_segment_blocks(
    fs: &FileSystem,
    snap: &mut Snapshot,
    seg: &Segment,
) -> Result<()> {
    if seg.is_empty() {
        return Ok(());
    }

    let (first_block, last_block) = if fs.compressed() {
        (fs.block_of_offset(seg.first), fs.block_of_offset(seg.last))
    } else {
        (fs.block_of_page(seg.first), fs.block_of_page(seg.last))
    };

    // A segment that starts mid-block shares that block with an older
    // neighbor; one that ends mid-block shares with whatever appended
    // after it
    let skip_first = if fs.compressed() {
        seg.first != fs.payload_start(first_block)
    } else {
        seg.first != fs.first_data_page(first_block)
    };

    let mut block = first_block;
    loop {
        let next = if block == last_block {
            0
        } else {
            fs.next_block(snap.redirect_block(block))?
        };

        let shares_tail = block == last_block;
        let skip = (block == first_block && skip_first) || shares_tail;

        if !skip {
            #[allow(clippy::cast_possible_wrap)]
            snap.freelist.push(FreelistEntry {
                block,
                id: snap.id as i64,
            });
        }

        if next == 0 {
            break;
        }
        block = next;
    }

    Ok(())
}

/// Moves the highest occupied block of a single-segment database into
/// a lower free block, recording the move in the redirect table. This
/// is what eventually lets the file shrink.
///
/// The target block must have been free before every pinned snapshot
/// (`safe_id`), since readers of those snapshots address it without
/// the redirect.
pub fn block_move(fs: &FileSystem, snap: &mut Snapshot, safe_id: u64) -> Result<bool> {
    if fs.compressed() {
        // Compressed records straddle blocks; tail moves are limited
        // to uncompressed databases
        return Ok(false);
    }
    if snap.redirects.len() >= crate::snapshot::MAX_REDIRECTS {
        return Ok(false);
    }

    let top = snap.block_count;

    #[allow(clippy::cast_sign_loss)]
    let Some(pos) = snap
        .freelist
        .iter()
        .position(|e| e.block < top && e.id >= 0 && (e.id as u64) < safe_id)
    else {
        return Ok(false);
    };

    #[allow(clippy::indexing_slicing)]
    let target = snap.freelist[pos].block;

    // Copy the block wholesale
    let ps = fs.page_size();
    let mut buf = vec![0u8; ps];
    let src_first = (u64::from(top) - 1) * fs.pages_per_block() + 1;
    let dst_first = (u64::from(target) - 1) * fs.pages_per_block() + 1;
    for i in 0..fs.pages_per_block() {
        let page = fs.read_page(src_first + i)?;
        buf.copy_from_slice(&page.data);
        fs.write_page(dst_first + i, &buf)?;
    }

    snap.freelist.remove(pos);
    snap.redirects.push((top, target));
    snap.block_count -= 1;
    fs.purge_cache();

    log::debug!("block-move: {top} -> {target}");
    Ok(true)
}
