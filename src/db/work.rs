// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Flush, merge work, checkpointing and recovery.
//!
//! The worker (holding the WORKER lock) turns the old in-memory tree
//! into a new level-0 segment and folds levels together; the
//! checkpointer (holding the CHECKPOINTER lock) makes the published
//! snapshot durable in one of the two meta pages. Recovery rebuilds
//! the live tree from the log on the first connection.

use super::{Database, DbInner};
use crate::{
    checkpoint,
    error::{Error, Result},
    lock::{LockKind, LockSlot},
    log_file::reader as log_reader,
    merge::{self, MergeWorker},
    multi_cursor::{
        decode_freelist_key, CompSource, FreelistProducer, MultiCursor, SegBounds, LEVELS_KEY,
    },
    registry::SharedDb,
    segment::cursor::{SegCursor, SeekBias},
    shm::{
        arena::Arena,
        header::{self, TreeHeader},
    },
    snapshot::{
        decode_levels_from, encode_levels_into, FreelistEntry, Level, MergeState, Snapshot,
    },
    tree::{self, cursor::TreeCursor, entry::EntryFlags, TreeWriter},
};
use byteorder::{BigEndian, WriteBytesExt as _};
use std::sync::Arc;

/// Flag bit on the last serialized level: more levels follow in the
/// system LEVELS record.
pub const LEVEL_OVERFLOW_FLAG: u16 = 0x0001;

/// Reads the published snapshot out of shared memory.
pub(crate) fn read_shm_snapshot(shared: &SharedDb) -> Result<Snapshot> {
    let (blob1, blob2) = header::snapshot_blobs(&shared.shm)?;
    Snapshot::decode(&blob1).or_else(|_| Snapshot::decode(&blob2))
}

/// Publishes a snapshot to shared memory, flipping the log-offset
/// toggle. Returns the levels that did not fit the blob (normally
/// empty).
pub(crate) fn publish_shm_snapshot(
    shared: &SharedDb,
    snap: &mut Snapshot,
) -> Result<Vec<Level>> {
    snap.log_offset_toggle = !snap.log_offset_toggle;

    match snap.encode(usize::MAX) {
        Ok(blob) => {
            header::publish_snapshot_blob(&shared.shm, &blob)?;
            Ok(Vec::new())
        }
        Err(Error::Full) => {
            // Keep the newest levels in the blob and flag the cut
            let mut keep = snap.levels.len();
            loop {
                keep = keep
                    .checked_sub(1)
                    .ok_or(Error::Full)?;

                let mut clipped = snap.clone();
                clipped.levels.truncate(keep);
                if let Some(last) = clipped.levels.last_mut() {
                    last.flags |= LEVEL_OVERFLOW_FLAG;
                }

                if let Ok(blob) = clipped.encode(usize::MAX) {
                    header::publish_snapshot_blob(&shared.shm, &blob)?;
                    let overflow = snap.levels.split_off(keep);
                    if let Some(last) = snap.levels.last_mut() {
                        last.flags |= LEVEL_OVERFLOW_FLAG;
                    }
                    snap.levels.extend(overflow.iter().cloned());
                    return Ok(overflow);
                }
            }
        }
        Err(e) => Err(e),
    }
}

/// Serializes overflowing levels for the system LEVELS record.
#[allow(clippy::expect_used, clippy::cast_possible_truncation)]
pub(crate) fn encode_levels_record(levels: &[Level]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(levels.len() as u32)
        .expect("vec write");
    encode_levels_into(&mut buf, levels);
    buf
}

impl DbInner {
    /// Builds the merge components over one consistent view: the live
    /// tree, the old tree, then every level's segments with their
    /// split-key bounds.
    pub(crate) fn build_sources(
        &self,
        hdr: &TreeHeader,
        snapshot: &Arc<Snapshot>,
        txid: u64,
    ) -> Result<Vec<CompSource>> {
        self.fs.sync_redirects(&snapshot.redirects);

        let mut sources = Vec::new();

        if !hdr.root.is_empty() {
            sources.push(CompSource::Tree(TreeCursor::new(
                self.shared.shm.clone(),
                hdr.root,
                txid,
            )));
        }
        if !hdr.old_root.is_empty() {
            sources.push(CompSource::Tree(TreeCursor::new(
                self.shared.shm.clone(),
                hdr.old_root,
                txid,
            )));
        }

        for level in &snapshot.levels {
            let split = level
                .merge
                .as_ref()
                .filter(|m| m.split.page != 0)
                .map(|m| {
                    let probe = SegCursor::new(
                        self.fs.clone(),
                        snapshot.clone(),
                        level.rhs.first().copied().unwrap_or(level.lhs),
                    );
                    probe.key_at(m.split.page, m.split.cell)
                })
                .transpose()?;

            if !level.lhs.is_empty() {
                let csr = SegCursor::new(self.fs.clone(), snapshot.clone(), level.lhs);
                sources.push(CompSource::Seg(Box::new(SegBounds::new(
                    csr,
                    split.clone(),
                    None,
                ))));
            }
            for seg in &level.rhs {
                let csr = SegCursor::new(self.fs.clone(), snapshot.clone(), *seg);
                sources.push(CompSource::Seg(Box::new(SegBounds::new(
                    csr,
                    None,
                    split.clone(),
                ))));
            }
        }

        Ok(sources)
    }

    /// Appends levels stored in the system LEVELS record, when the
    /// blob was cut short.
    pub(crate) fn load_levels_overflow(
        &self,
        hdr: &TreeHeader,
        snap: &mut Snapshot,
    ) -> Result<()> {
        let flagged = snap
            .levels
            .last()
            .is_some_and(|l| l.flags & LEVEL_OVERFLOW_FLAG != 0);
        if !flagged {
            return Ok(());
        }

        let view = Arc::new(snap.clone());
        let sources = self.build_sources(hdr, &view, u64::MAX)?;
        let mut mc = MultiCursor::new(sources, false);
        mc.seek(1, LEVELS_KEY, SeekBias::Eq)?;

        let Some(merged) = mc.merged().filter(|m| m.flags.is_insert()) else {
            return Err(Error::Corrupt("overflow levels record is missing"));
        };
        let value = merged.value.ok_or(Error::Corrupt("LEVELS record empty"))?;

        let mut r: &[u8] = &value;
        let count = {
            use byteorder::ReadBytesExt as _;
            r.read_u32::<BigEndian>().map_err(Error::Io)? as usize
        };
        let extra = decode_levels_from(&mut r, count)?;

        if let Some(last) = snap.levels.last_mut() {
            last.flags &= !LEVEL_OVERFLOW_FLAG;
        }
        snap.levels.extend(extra);
        Ok(())
    }

    /// Folds spilled free-list records from the LSM back into the
    /// in-memory list (runs at first-connection open).
    pub(crate) fn reconcile_freelist(
        &self,
        hdr: &TreeHeader,
        snap: &mut Snapshot,
    ) -> Result<()> {
        if snap.freelist.len() < self.opts.max_freelist as usize {
            return Ok(());
        }

        let view = Arc::new(snap.clone());
        let sources = self.build_sources(hdr, &view, u64::MAX)?;
        let mut mc = MultiCursor::new(sources, false);
        mc.seek(1, b"F", SeekBias::Ge)?;

        while mc.valid() {
            let Some(merged) = mc.merged() else { break };
            if merged.topic != 1 {
                break;
            }
            let Some(block) = decode_freelist_key(&merged.key) else {
                break;
            };

            if merged.flags.is_insert() && !merged.covered {
                let known = snap.freelist.iter().any(|e| e.block == block);
                if !known {
                    let id = merged
                        .value
                        .as_ref()
                        .filter(|v| v.len() == 8)
                        .map_or(-1, |v| {
                            let mut bytes = [0u8; 8];
                            bytes.copy_from_slice(v);

                            #[allow(clippy::cast_possible_wrap)]
                            {
                                u64::from_be_bytes(bytes) as i64
                            }
                        });
                    snap.freelist.push(FreelistEntry { block, id });
                }
            }
            mc.next()?;
        }
        Ok(())
    }
}

impl Database {
    /// First-connection recovery: format shared memory, replay the
    /// log into a fresh tree, publish header and snapshot.
    pub(crate) fn recover(&self, snapshot: Snapshot, meta_slot: Option<usize>) -> Result<()> {
        let shm = &self.inner.shared.shm;

        let mut hdr = TreeHeader::default();
        Arena::format(shm, &mut hdr)?;
        hdr.log.regions = [
            (0, 0),
            (0, 0),
            (snapshot.log_offset, snapshot.log_offset),
        ];
        hdr.log.cksum = snapshot.log_cksum;

        // Replay committed transactions into the tree
        let log_path = {
            let mut name = self.inner.path.as_os_str().to_os_string();
            name.push(super::LOG_SUFFIX);
            std::path::PathBuf::from(name)
        };
        if self.inner.opts.use_log && self.inner.env.exists(&log_path) {
            let log_file = self.inner.env.open_file(&log_path, false, true)?;
            let scanned =
                log_reader::scan(&log_file, snapshot.log_offset, snapshot.log_cksum)?;

            if scanned.commits > 0 {
                log::info!(
                    "recovery: replaying {} operations from {} commits",
                    scanned.ops_until_commit,
                    scanned.commits,
                );

                let mut rollback = Vec::new();
                let mut writer = TreeWriter::new(shm, &mut hdr, &mut rollback, u32::MAX);
                log_reader::replay(
                    &log_file,
                    snapshot.log_offset,
                    snapshot.log_cksum,
                    scanned.ops_until_commit,
                    |record| match record {
                        log_reader::LogRecord::Write { key, value } => {
                            writer.insert(EntryFlags::INSERT, &key, Some(&value))
                        }
                        log_reader::LogRecord::Delete { key } => {
                            writer.insert(EntryFlags::POINT_DELETE, &key, None)
                        }
                        log_reader::LogRecord::DeleteRange { lo, hi } => {
                            writer.delete_range(0, &lo, &hi)
                        }
                        log_reader::LogRecord::Commit => Ok(()),
                    },
                )?;
            }

            // Rebuild the region table from the ranges the scan
            // actually visited, so a wrapped log keeps its layout
            let mut segments = scanned.segments;
            if segments.is_empty() {
                segments.push((snapshot.log_offset, scanned.end_offset));
            }
            while segments.len() > 3 {
                // Malformed but navigable: fold the oldest ranges
                let (start, _) = segments.remove(0);
                if let Some(first) = segments.first_mut() {
                    first.0 = first.0.min(start);
                }
            }
            hdr.log.regions = match *segments.as_slice() {
                [r2] => [(0, 0), (0, 0), r2],
                [r0, r2] => [r0, (0, 0), r2],
                [r0, r1, r2] => [r0, r1, r2],
                _ => [(0, 0), (0, 0), (scanned.end_offset, scanned.end_offset)],
            };
            hdr.log.regions[2].1 = scanned.end_offset;
            hdr.log.cksum = scanned.end_cksum;
        }

        hdr.root.txid = 1;
        hdr.publish(shm)?;

        let mut snap = snapshot;
        self.inner.load_levels_overflow(&hdr, &mut snap)?;
        self.inner.reconcile_freelist(&hdr, &mut snap)?;

        publish_shm_snapshot(&self.inner.shared, &mut snap)?;

        #[allow(clippy::cast_possible_truncation)]
        header::set_meta_page_in_use(shm, meta_slot.map_or(0, |s| s as u8 + 1))?;
        header::set_checkpoint_info(shm, snap.id, snap.log_offset)?;
        Ok(())
    }

    fn assert_no_txn(&self) -> Result<()> {
        if self.inner.state().txn_depth > 0 {
            return Err(Error::Misuse(
                "work/flush/checkpoint require no open transaction",
            ));
        }
        Ok(())
    }

    /// The oldest snapshot id that must stay intact: pinned readers
    /// and the last durable checkpoint both hold blocks alive.
    fn safe_reuse_id(&self, current: u64) -> Result<u64> {
        let readers = self.inner.snapshot_floor(current)?;
        let (ckpt_id, _) = header::checkpoint_info(&self.inner.shared.shm)?;
        Ok(readers.min(ckpt_id + 1))
    }

    /// Flushes the in-memory tree into a fresh level-0 segment.
    pub fn flush(&self) -> Result<()> {
        self.assert_no_txn()?;

        self.inner.lock(LockSlot::Worker, LockKind::Exclusive)?;
        let result = self.flush_locked();
        self.inner.unlock(LockSlot::Worker);
        result.map(|_| ())
    }

    /// Phase 1 of a flush: under WRITER, set the live tree aside (and
    /// spill overflow metadata into it first so the flush carries it
    /// to disk).
    fn make_old_locked(&self) -> Result<bool> {
        self.inner.lock_retry(LockSlot::Writer, LockKind::Exclusive)?;

        let outcome = (|| {
            let mut hdr = self.inner.load_header_repairing()?;

            if !hdr.old_root.is_empty() {
                return Ok(true);
            }
            if hdr.root.is_empty() {
                return Ok(false);
            }

            header::set_writer_flag(&self.inner.shared.shm, true)?;
            let mut rollback = Vec::new();

            // If the snapshot with one more level cannot fit the blob,
            // persist the tail levels through this very flush
            let mut snap = read_shm_snapshot(&self.inner.shared)?;
            self.inner.load_levels_overflow(&hdr, &mut snap)?;

            let mut projection = snap.clone();
            projection.levels.insert(0, Level::default());
            if projection.encode(usize::MAX).is_err() {
                // Keep the newest levels inline; everything beyond
                // rides the LEVELS record
                let keep = projection.levels.len() / 2;
                let overflow: Vec<Level> = snap.levels.split_off(keep.max(1));
                let record = encode_levels_record(&overflow);

                let mut writer =
                    TreeWriter::new(&self.inner.shared.shm, &mut hdr, &mut rollback, u32::MAX);
                writer.insert(
                    EntryFlags::INSERT | EntryFlags::SYSTEMKEY,
                    LEVELS_KEY,
                    Some(&record),
                )?;
                log::debug!("flush: spilled {} levels into the LSM", overflow.len());
            }

            let mut writer =
                TreeWriter::new(&self.inner.shared.shm, &mut hdr, &mut rollback, u32::MAX);
            writer.make_old()?;
            hdr.old_log_offset = hdr.log.regions[2].1;
            hdr.old_log_cksum = hdr.log.cksum;

            hdr.publish(&self.inner.shared.shm)?;
            header::set_writer_flag(&self.inner.shared.shm, false)?;
            Ok(true)
        })();

        if outcome.is_err() {
            let _ = header::set_writer_flag(&self.inner.shared.shm, false);
        }
        self.inner.unlock(LockSlot::Writer);
        outcome
    }

    fn flush_locked(&self) -> Result<u64> {
        if !self.make_old_locked()? {
            return Ok(0);
        }

        let hdr = TreeHeader::load(&self.inner.shared.shm)?;
        if hdr.old_root.is_empty() {
            return Ok(0);
        }

        let mut snap = read_shm_snapshot(&self.inner.shared)?;
        self.inner.load_levels_overflow(&hdr, &mut snap)?;

        // Spill excess free-list bookkeeping into the new segment
        let max_freelist = self.inner.opts.max_freelist as usize;
        let spill: Vec<FreelistEntry> = if snap.freelist.len() > max_freelist {
            snap.freelist.split_off(max_freelist)
        } else {
            Vec::new()
        };

        let mut sources = vec![CompSource::Tree(TreeCursor::new(
            self.inner.shared.shm.clone(),
            hdr.old_root,
            u64::MAX,
        ))];
        if !spill.is_empty() {
            sources.push(CompSource::Freelist(FreelistProducer::new(&spill)));
        }

        let oldest = snap.levels.is_empty();
        let mc = MultiCursor::new(sources, false);
        let safe_id = self.safe_reuse_id(snap.id)?;

        let mut worker =
            MergeWorker::new(self.inner.fs.clone(), mc, snap, safe_id, oldest, Vec::new(), None)?;
        while !worker.step()? {}
        let outcome = worker.shutdown()?;

        let mut snap = outcome.snap;
        if outcome.segment.is_empty() {
            log::debug!("flush: old tree was empty");
        } else {
            snap.levels.insert(
                0,
                Level {
                    age: 0,
                    flags: 0,
                    lhs: outcome.segment,
                    rhs: Vec::new(),
                    merge: None,
                },
            );
        }
        snap.id += 1;
        snap.log_offset = hdr.old_log_offset;
        snap.log_cksum = hdr.old_log_cksum;
        snap.page_writes = self.inner.fs.page_writes();

        // The first flush pins the database's compression scheme
        if snap.compression_id == 0 {
            snap.compression_id = self.inner.fs.compression_id();
        }

        publish_shm_snapshot(&self.inner.shared, &mut snap)?;

        // Phase 3: drop the flushed tree
        self.inner.lock_retry(LockSlot::Writer, LockKind::Exclusive)?;
        let outcome3 = (|| {
            let mut hdr = TreeHeader::load(&self.inner.shared.shm)?;
            tree::discard_old(&mut hdr);
            hdr.publish(&self.inner.shared.shm)
        })();
        self.inner.unlock(LockSlot::Writer);
        outcome3?;

        log::debug!("flush: complete ({} bytes)", outcome.bytes_written);

        self.note_work(outcome.bytes_written);
        Ok(outcome.bytes_written)
    }

    fn note_work(&self, bytes: u64) {
        let mut state = self.inner.state();
        state.work_kib_since_ckpt += bytes / 1024;
    }

    /// Performs up to `nkb` KiB of flush/merge work, folding at least
    /// `nmerge` levels per merge. Returns the KiB actually written.
    pub fn work(&self, nmerge: usize, nkb: usize) -> Result<u64> {
        self.assert_no_txn()?;
        let nmerge = nmerge.max(2);

        self.inner.lock(LockSlot::Worker, LockKind::Exclusive)?;
        let result = self.work_locked(nmerge, nkb);
        self.inner.unlock(LockSlot::Worker);

        let written = result?;
        if self.should_autocheckpoint() {
            let _ = self.checkpoint();
        }
        Ok(written / 1024)
    }

    fn work_locked(&self, nmerge: usize, nkb: usize) -> Result<u64> {
        let mut total: u64 = 0;
        let budget = (nkb as u64) * 1024;

        // A pending old tree is always the most urgent work
        let hdr = TreeHeader::load(&self.inner.shared.shm)?;
        if !hdr.old_root.is_empty() {
            total += self.flush_locked()?;
        }

        while total < budget.max(1) {
            let wrote = self.one_merge_pass(nmerge, budget.saturating_sub(total))?;
            if wrote == 0 {
                break;
            }
            total += wrote;
        }

        self.note_work(total);
        Ok(total)
    }

    /// Starts or continues one merge. Returns bytes written (0 when no
    /// work remained).
    #[allow(clippy::too_many_lines)]
    fn one_merge_pass(&self, nmerge: usize, byte_budget: u64) -> Result<u64> {
        let hdr = TreeHeader::load(&self.inner.shared.shm)?;
        let mut snap = read_shm_snapshot(&self.inner.shared)?;
        self.inner.load_levels_overflow(&hdr, &mut snap)?;

        // Continue a paused merge first
        let resume_idx = snap.levels.iter().position(|l| !l.rhs.is_empty());

        let (level_idx, fresh) = match resume_idx {
            Some(idx) => (idx, false),
            None => {
                if snap.levels.len() < nmerge {
                    return Ok(0);
                }
                // Fold the oldest levels together
                let idx = snap.levels.len() - nmerge;
                let inputs: Vec<Level> = snap.levels.split_off(idx);
                let age = inputs.iter().map(|l| l.age).max().unwrap_or(0) + 1;
                snap.levels.push(Level {
                    age,
                    flags: 0,
                    lhs: crate::snapshot::Segment::default(),
                    rhs: inputs.iter().map(|l| l.lhs).collect(),
                    merge: Some(MergeState::default()),
                });
                (idx, true)
            }
        };

        let read_snap = Arc::new(snap.clone());

        #[allow(clippy::indexing_slicing)]
        let level = snap.levels[level_idx].clone();
        let merge_state = level.merge.clone().unwrap_or_default();

        // Input cursors over the RHS runs, newest first; a fresh output
        // prefers append points outside any input block
        let mut sources = Vec::new();
        let mut avoid = Vec::new();
        for (i, seg) in level.rhs.iter().enumerate() {
            avoid.extend(merge::segment_blocks(&self.inner.fs, &read_snap, seg)?);

            let mut csr = SegCursor::new(self.inner.fs.clone(), read_snap.clone(), *seg);
            if !fresh {
                if let Some(input) = merge_state.inputs.get(i) {
                    if input.page != 0 {
                        csr.goto(input.page, input.cell)?;
                    }
                } else {
                    csr.first()?;
                }
            }
            sources.push(CompSource::Seg(Box::new(SegBounds::new(csr, None, None))));
        }

        let oldest = level_idx == snap.levels.len() - 1;
        let mc = MultiCursor::new(sources, false);
        let safe_id = self.safe_reuse_id(snap.id)?;

        let resume_output = (!fresh).then_some(merge_state.output);
        let mut worker = MergeWorker::new(
            self.inner.fs.clone(),
            mc,
            snap,
            safe_id,
            oldest,
            avoid,
            resume_output,
        )?;

        // The resumed output continues the partially built LHS
        loop {
            if worker.step()? {
                break;
            }
            if byte_budget > 0 && worker.bytes_written() >= byte_budget {
                break;
            }
        }

        let done = worker.done();
        let outcome = worker.shutdown()?;
        let mut snap = outcome.snap;

        let mut segment = outcome.segment;
        #[allow(clippy::indexing_slicing)]
        let consumed_inputs = {
            let level = &mut snap.levels[level_idx];

            // Stitch a resumed output onto the existing partial LHS
            if !fresh && !level.lhs.is_empty() && !segment.is_empty() {
                segment.first = level.lhs.first;
                segment.size += level.lhs.size;
                segment.root = 0;
            } else if segment.is_empty() {
                segment = level.lhs;
            }
            level.lhs = segment;

            if done {
                level.merge = None;
                log::debug!("work: merge into level {level_idx} complete");
                std::mem::take(&mut level.rhs)
            } else {
                if let Some(paused) = outcome.paused {
                    level.merge = Some(MergeState {
                        inputs: paused.inputs,
                        skip: 0,
                        split: paused.split,
                        output: paused.output,
                    });
                    log::debug!("work: merge into level {level_idx} paused");
                }
                Vec::new()
            }
        };

        for seg in &consumed_inputs {
            merge::free_segment_blocks(&self.inner.fs, &mut snap, seg)?;
        }

        // A merge whose every record annihilated leaves nothing behind
        snap.levels
            .retain(|l| !(l.lhs.is_empty() && l.rhs.is_empty()));

        // Opportunistic tail compaction once a single run remains
        if done && snap.levels.len() == 1 {
            merge::block_move(&self.inner.fs, &mut snap, safe_id)?;
        }

        snap.id += 1;
        snap.page_writes = self.inner.fs.page_writes();
        publish_shm_snapshot(&self.inner.shared, &mut snap)?;

        Ok(outcome.bytes_written.max(1))
    }

    fn should_autocheckpoint(&self) -> bool {
        let threshold = u64::from(self.inner.opts.autocheckpoint_kib);
        threshold > 0 && self.inner.state().work_kib_since_ckpt >= threshold
    }

    /// Background hook run after commits when AUTOWORK is on.
    pub(crate) fn auto_work(&self) {
        // Another connection already doing work is good enough
        if self.inner.shared.locks.is_held(
            self.inner.conn,
            LockSlot::Worker,
            LockKind::Exclusive,
        ) {
            return;
        }

        let needs_flush = TreeHeader::load(&self.inner.shared.shm)
            .map(|hdr| !hdr.old_root.is_empty())
            .unwrap_or(false);

        if !needs_flush {
            let merge_due = read_shm_snapshot(&self.inner.shared)
                .map(|s| s.levels.len() >= self.inner.opts.automerge as usize
                    || s.levels.iter().any(|l| !l.rhs.is_empty()))
                .unwrap_or(false);
            if !merge_due {
                return;
            }
        }

        match self.work(self.inner.opts.automerge as usize, 512) {
            Ok(_) | Err(Error::Busy) => {}
            Err(e) => log::warn!("autowork failed: {e}"),
        }
    }

    /// Writes the published snapshot durably into a meta page.
    /// Returns the KiB captured by the checkpoint.
    pub fn checkpoint(&self) -> Result<u64> {
        self.assert_no_txn()?;

        self.inner
            .lock(LockSlot::Checkpointer, LockKind::Exclusive)?;
        let result = self.checkpoint_locked();
        self.inner.unlock(LockSlot::Checkpointer);
        result
    }

    fn checkpoint_locked(&self) -> Result<u64> {
        let shm = &self.inner.shared.shm;

        let (blob1, blob2) = header::snapshot_blobs(shm)?;
        let (blob, snap) = match Snapshot::decode(&blob1) {
            Ok(snap) => (blob1, snap),
            Err(_) => {
                let snap = Snapshot::decode(&blob2)?;
                (blob2, snap)
            }
        };

        let (ckpt_id, _) = header::checkpoint_info(shm)?;
        if snap.id == ckpt_id {
            return Ok(0);
        }

        // Data first, then the meta page: that ordering is the
        // checkpoint's atomicity
        self.inner.fs.sync()?;
        if let Some(log_file) = &self.inner.log_file {
            log_file.sync()?;
        }

        let in_use = header::meta_page_in_use(shm)?;
        let slot = if in_use == 1 { 1 } else { 0 };
        checkpoint::write_checkpoint(&self.inner.fs.file(), slot, &blob)?;

        #[allow(clippy::cast_possible_truncation)]
        header::set_meta_page_in_use(shm, slot as u8 + 1)?;
        header::set_checkpoint_info(shm, snap.id, snap.log_offset)?;

        {
            let mut state = self.inner.state();
            state.work_kib_since_ckpt = 0;
        }

        log::debug!(
            "checkpoint: snapshot {} at log offset {}",
            snap.id,
            snap.log_offset
        );
        Ok((blob.len() as u64).div_ceil(1024))
    }

    /// KiB of work not yet captured by a checkpoint (approximate).
    pub(crate) fn checkpoint_backlog_kib(&self) -> u64 {
        self.inner.state().work_kib_since_ckpt
    }

    /// Last-connection shutdown: checkpoint and drop reclaimed tail
    /// blocks so the file can shrink.
    pub(crate) fn final_checkpoint_on_close(inner: &DbInner) -> Result<()> {
        let db = Database {
            inner: Arc::new(DbInnerProxy::clone_fields(inner)),
        };

        // Flush pending tree data so the checkpoint captures it
        let _ = db.flush();
        let _ = db.checkpoint();

        // Trim free tail blocks
        let mut snap = read_shm_snapshot(&inner.shared)?;
        let mut trimmed = false;
        loop {
            let top = snap.block_count;
            let Some(pos) = snap.freelist.iter().position(|e| e.block == top) else {
                break;
            };
            snap.freelist.remove(pos);
            snap.block_count -= 1;
            trimmed = true;
        }

        if trimmed {
            inner
                .fs
                .truncate(u64::from(snap.block_count) * inner.fs.block_size() as u64)?;
            snap.id += 1;
            publish_shm_snapshot(&inner.shared, &mut snap)?;
            let _ = db.checkpoint();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::config::Options,
        env::MemEnv,
        segment::{btree, cursor::SegCursor},
        Database,
    };
    use std::{path::Path, sync::Arc};
    use test_log::test;

    /// Separator B-trees must yield a strictly increasing subsequence
    /// of the segment's keys, each paired with the page holding that
    /// key.
    #[test]
    #[allow(clippy::indexing_slicing, clippy::unwrap_used)]
    fn separators_cover_the_segment_in_order() -> crate::Result<()> {
        let env: Arc<dyn crate::Env> = Arc::new(MemEnv::new());
        let db = Database::open_with_env(
            env,
            Path::new("/worktest/sep.lsm"),
            Options::default().autowork(false),
        )?;

        let value = vec![7u8; 100];
        for i in 0..3000u32 {
            db.insert(format!("{i:07}").as_bytes(), &value)?;
        }
        db.flush()?;

        let snap = Arc::new(read_shm_snapshot(&db.inner.shared)?);
        let seg = snap.levels[0].lhs;
        assert_ne!(0, seg.root, "a ~90 page segment must carry a B-tree");

        let csr = SegCursor::new(db.inner.fs.clone(), snap.clone(), seg);
        let seps = btree::separators(&csr)?;
        assert!(!seps.is_empty());

        let mut prev: Option<crate::Slice> = None;
        for sep in &seps {
            if let Some(prev) = &prev {
                assert!(**prev < *sep.key, "separators out of order");
            }

            // A separator over a data page names that page's first key
            let child = csr.read_view(sep.child)?;
            if !child.is_btree() {
                let (_topic, first) = csr.key_at(sep.child, 0)?;
                assert_eq!(first, sep.key);
            }

            prev = Some(sep.key.clone());
        }
        Ok(())
    }

    /// The free-block invariant: every block is either the meta block,
    /// inside a live segment, or on the free list.
    #[test]
    #[allow(clippy::unwrap_used)]
    fn block_accounting_stays_closed() -> crate::Result<()> {
        let env: Arc<dyn crate::Env> = Arc::new(MemEnv::new());
        let db = Database::open_with_env(
            env,
            Path::new("/worktest/blocks.lsm"),
            Options::default().autowork(false).block_size_kib(64),
        )?;

        let value = vec![1u8; 400];
        for wave in 0..3u32 {
            for i in 0..400u32 {
                db.insert(format!("w{wave}-{i:05}").as_bytes(), &value)?;
            }
            db.flush()?;
        }
        db.work(2, 100_000)?;

        let snap = read_shm_snapshot(&db.inner.shared)?;

        let mut seen: Vec<u32> = vec![1]; // meta block
        for level in &snap.levels {
            for seg in std::iter::once(&level.lhs).chain(level.rhs.iter()) {
                if seg.is_empty() {
                    continue;
                }
                let csr = SegCursor::new(db.inner.fs.clone(), Arc::new(snap.clone()), *seg);
                for page in csr.pages()? {
                    seen.push(db.inner.fs.block_of_page(page));
                }
            }
        }
        for entry in &snap.freelist {
            seen.push(entry.block);
        }

        // Blocks holding a recorded append point are reserved for the
        // next segment rather than free
        for &point in &snap.append_points {
            if point != 0 {
                seen.push(db.inner.fs.block_of_page(point));
            }
        }

        seen.sort_unstable();
        seen.dedup();

        // Every block up to the count is accounted for
        for block in 1..=snap.block_count {
            assert!(
                seen.contains(&block),
                "block {block} of {} is unaccounted",
                snap.block_count
            );
        }
        Ok(())
    }
}

/// Drop-time helper: a shallow clone of the inner handles so the close
/// path can reuse the normal flush/checkpoint code.
struct DbInnerProxy;

impl DbInnerProxy {
    fn clone_fields(inner: &DbInner) -> DbInner {
        DbInner {
            env: inner.env.clone(),
            path: inner.path.clone(),
            shared: inner.shared.clone(),
            conn: inner.conn,
            fs: inner.fs.clone(),
            db_file: inner.db_file.clone(),
            log_file: inner.log_file.clone(),
            opts: inner.opts.clone(),
            state: std::sync::Mutex::new(super::ConnState {
                txn_depth: 0,
                marks: Vec::new(),
                hdr: None,
                rollback: Vec::new(),
                log: None,
                recycle_floor: u32::MAX,
                work_kib_since_ckpt: 0,
            }),
            nwrite: std::sync::atomic::AtomicU64::new(0),
            nread: std::sync::atomic::AtomicU64::new(0),
            proxy: true,
            skip_close_checkpoint: std::sync::atomic::AtomicBool::new(false),
        }
    }
}
