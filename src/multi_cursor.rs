// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! K-way merge over the in-memory trees, the free-list producer and
//! the segment cursors of every level.
//!
//! Components sit in a fixed order, newest source first; a tournament
//! array elects the component holding the smallest (or, reversed,
//! largest) key. Equal keys go to the newer component. A bare
//! `START_DELETE` boundary ranks just above its key and a bare
//! `END_DELETE` just below it, so open cover boundaries never collide
//! with live keys.
//!
//! Range-delete coverage is positional: while iterating forward, a key
//! is covered by a newer component exactly when that component's
//! current entry (which sits above the key) carries `END_DELETE`;
//! reversed, when the newer component's entry below it carries
//! `START_DELETE`.

use crate::{
    error::Result,
    segment::cursor::{SegCursor, SeekBias},
    slice::Slice,
    snapshot::FreelistEntry,
    tree::{
        cursor::TreeCursor,
        entry::{key_cmp, EntryFlags},
    },
};
use std::cmp::Ordering;

/// A materialized component position.
#[derive(Clone, Debug)]
pub struct CompEntry {
    /// Key topic (0 user, 1 system).
    pub topic: u8,

    /// Key bytes.
    pub key: Slice,

    /// Entry flags.
    pub flags: EntryFlags,

    /// Value, when the entry carries one.
    pub value: Option<Slice>,

    /// Forward pointer into the next older level (segments only).
    pub fwd: u64,
}

impl CompEntry {
    fn rank_cmp(&self, other: &Self) -> Ordering {
        key_cmp(self.topic, &self.key, other.topic, &other.key)
            .then_with(|| self.flags.epsilon().cmp(&other.flags.epsilon()))
    }

    fn same_key(&self, topic: u8, key: &[u8]) -> bool {
        key_cmp(self.topic, &self.key, topic, key) == Ordering::Equal
    }
}

/// Serializes the system free-list key for `block`.
#[must_use]
pub fn freelist_key(block: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(b'F');
    key.extend_from_slice(&block.to_be_bytes());
    key
}

/// Decodes a system free-list key.
#[must_use]
pub fn decode_freelist_key(key: &[u8]) -> Option<u32> {
    if key.len() == 5 && key.first() == Some(&b'F') {
        let mut block = [0u8; 4];
        block.copy_from_slice(key.get(1..5)?);
        Some(u32::from_be_bytes(block))
    } else {
        None
    }
}

/// The system key holding overflowing snapshot levels.
pub const LEVELS_KEY: &[u8] = b"LEVELS";

/// Yields the in-memory free-list as system entries during a flush, so
/// excess free-block bookkeeping lands in the LSM itself.
pub struct FreelistProducer {
    entries: Vec<(Slice, Slice, EntryFlags)>,
    pos: Option<usize>,
}

impl FreelistProducer {
    /// Builds a producer over the given free-list delta. Entries with
    /// a real id serialize it as the value; `-1` ids (and deletions
    /// passed as `None`-valued pairs) serialize empty.
    #[must_use]
    pub fn new(freelist: &[FreelistEntry]) -> Self {
        let mut entries: Vec<(Slice, Slice, EntryFlags)> = freelist
            .iter()
            .map(|entry| {
                let key = Slice::from(freelist_key(entry.block));
                let value = if entry.id < 0 {
                    Slice::empty()
                } else {
                    #[allow(clippy::cast_sign_loss)]
                    Slice::from((entry.id as u64).to_be_bytes())
                };
                (key, value, EntryFlags::INSERT | EntryFlags::SYSTEMKEY)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        Self { entries, pos: None }
    }

    fn entry_at(&self, i: usize) -> Option<CompEntry> {
        self.entries.get(i).map(|(key, value, flags)| CompEntry {
            topic: 1,
            key: key.clone(),
            flags: *flags,
            value: Some(value.clone()),
            fwd: 0,
        })
    }
}

/// One component of the merge.
pub enum CompSource {
    /// A cursor over an in-memory tree version.
    Tree(TreeCursor),

    /// The in-memory free-list, serialized as system entries.
    Freelist(FreelistProducer),

    /// A cursor over one on-disk run.
    Seg(Box<SegBounds>),
}

/// A segment cursor plus the key bounds a composite level imposes.
pub struct SegBounds {
    /// The underlying cursor.
    pub csr: SegCursor,

    /// Exclusive upper bound (LHS of a composite level stops at the
    /// split key).
    pub max: Option<(u8, Slice)>,

    /// Inclusive lower bound (RHS segments start at the split key).
    pub min: Option<(u8, Slice)>,

    /// While reversing off the RHS, a pseudo start-delete materializes
    /// at the split key so covers cross the split cleanly.
    pseudo_pending: bool,

    /// Set once the pseudo boundary has been yielded and consumed.
    pseudo_done: bool,
}

impl SegBounds {
    /// Wraps a cursor with optional split-key bounds.
    #[must_use]
    pub fn new(csr: SegCursor, max: Option<(u8, Slice)>, min: Option<(u8, Slice)>) -> Self {
        Self {
            csr,
            max,
            min,
            pseudo_pending: false,
            pseudo_done: false,
        }
    }
}

struct Comp {
    src: CompSource,
    cur: Option<CompEntry>,
}

impl Comp {
    fn refresh_from_tree(csr: &TreeCursor) -> Result<Option<CompEntry>> {
        if !csr.valid() {
            return Ok(None);
        }
        let entry = csr.entry()?;
        Ok(Some(CompEntry {
            topic: entry.topic(),
            key: entry.key.clone(),
            flags: entry.flags,
            value: entry.value,
            fwd: 0,
        }))
    }

    fn refresh_from_seg(bounds: &mut SegBounds, reverse: bool) -> Option<CompEntry> {
        let pseudo = |bounds: &SegBounds| {
            let (topic, key) = bounds.min.clone()?;
            Some(CompEntry {
                topic,
                key,
                flags: EntryFlags::START_DELETE,
                value: None,
                fwd: 0,
            })
        };

        if bounds.pseudo_pending {
            return pseudo(bounds);
        }

        let arm_pseudo = reverse && bounds.min.is_some() && !bounds.pseudo_done;

        if !bounds.csr.valid() {
            if arm_pseudo {
                bounds.pseudo_pending = true;
                return pseudo(bounds);
            }
            return None;
        }

        let flags = bounds.csr.flags();
        let key = bounds.csr.key()?.clone();
        let topic = flags.topic();

        // LHS of a composite level ends (exclusive) at the split key
        if let Some((max_topic, max_key)) = &bounds.max {
            if key_cmp(topic, &key, *max_topic, max_key) != Ordering::Less {
                return None;
            }
        }

        // RHS segments start (inclusive) at the split key
        if let Some((min_topic, min_key)) = &bounds.min {
            if key_cmp(topic, &key, *min_topic, min_key) == Ordering::Less {
                if arm_pseudo {
                    bounds.pseudo_pending = true;
                    return pseudo(bounds);
                }
                return None;
            }
        }

        Some(CompEntry {
            topic,
            key,
            flags,
            value: bounds.csr.value().cloned(),
            fwd: bounds.csr.fwd(),
        })
    }

    fn refresh(&mut self, reverse: bool) -> Result<()> {
        self.cur = match &mut self.src {
            CompSource::Tree(csr) => Self::refresh_from_tree(csr)?,
            CompSource::Freelist(producer) => {
                producer.pos.and_then(|pos| producer.entry_at(pos))
            }
            CompSource::Seg(bounds) => Self::refresh_from_seg(bounds, reverse),
        };
        Ok(())
    }

    fn first(&mut self) -> Result<()> {
        match &mut self.src {
            CompSource::Tree(csr) => csr.first()?,
            CompSource::Freelist(producer) => {
                producer.pos = if producer.entries.is_empty() {
                    None
                } else {
                    Some(0)
                };
            }
            CompSource::Seg(bounds) => {
                bounds.pseudo_pending = false;
                bounds.pseudo_done = true;
                match bounds.min.clone() {
                    Some((topic, key)) => bounds.csr.seek(topic, &key, SeekBias::Ge)?,
                    None => bounds.csr.first()?,
                }
            }
        }
        self.refresh(false)
    }

    fn last(&mut self) -> Result<()> {
        match &mut self.src {
            CompSource::Tree(csr) => csr.last()?,
            CompSource::Freelist(producer) => {
                producer.pos = producer.entries.len().checked_sub(1);
            }
            CompSource::Seg(bounds) => {
                bounds.pseudo_pending = false;
                bounds.pseudo_done = false;
                match bounds.max.clone() {
                    Some((topic, key)) => {
                        // Largest entry strictly below the bound
                        bounds.csr.seek(topic, &key, SeekBias::Le)?;
                        if bounds
                            .csr
                            .key()
                            .is_some_and(|k| key_cmp(bounds.csr.flags().topic(), k, topic, &key) == Ordering::Equal)
                        {
                            bounds.csr.prev()?;
                        }
                    }
                    None => bounds.csr.last()?,
                }
            }
        }
        self.refresh(true)
    }

    fn seek_ge(&mut self, topic: u8, key: &[u8]) -> Result<()> {
        match &mut self.src {
            CompSource::Tree(csr) => match csr.seek(topic, key)? {
                Some(Ordering::Less) | None => csr.invalidate(),
                _ => {}
            },
            CompSource::Freelist(producer) => {
                // Free-list entries are all system topic, sorting after
                // every user key
                producer.pos = if topic == 0 {
                    (!producer.entries.is_empty()).then_some(0)
                } else {
                    producer.entries.iter().position(|(k, _, _)| **k >= *key)
                };
            }
            CompSource::Seg(bounds) => {
                bounds.pseudo_pending = false;
                bounds.pseudo_done = true;
                let mut from_topic = topic;
                let mut from_key = Slice::from(key);
                if let Some((min_topic, min_key)) = &bounds.min {
                    if key_cmp(topic, key, *min_topic, min_key) == Ordering::Less {
                        from_topic = *min_topic;
                        from_key = min_key.clone();
                    }
                }
                bounds.csr.seek(from_topic, &from_key, SeekBias::Ge)?;
            }
        }
        self.refresh(false)
    }

    fn seek_le(&mut self, topic: u8, key: &[u8]) -> Result<()> {
        match &mut self.src {
            CompSource::Tree(csr) => match csr.seek(topic, key)? {
                Some(Ordering::Greater) => csr.prev()?,
                None => csr.invalidate(),
                _ => {}
            },
            CompSource::Freelist(producer) => {
                producer.pos = producer
                    .entries
                    .iter()
                    .rposition(|(k, _, _)| **k <= *key);
                if topic == 0 {
                    producer.pos = None;
                }
            }
            CompSource::Seg(bounds) => {
                bounds.pseudo_pending = false;
                bounds.pseudo_done = false;
                let mut to_topic = topic;
                let mut to_key = Slice::from(key);
                let mut clip_exact = false;
                if let Some((max_topic, max_key)) = &bounds.max {
                    if key_cmp(topic, key, *max_topic, max_key) != Ordering::Less {
                        to_topic = *max_topic;
                        to_key = max_key.clone();
                        clip_exact = true;
                    }
                }
                bounds.csr.seek(to_topic, &to_key, SeekBias::Le)?;
                if clip_exact
                    && bounds.csr.key().is_some_and(|k| {
                        key_cmp(bounds.csr.flags().topic(), k, to_topic, &to_key)
                            == Ordering::Equal
                    })
                {
                    bounds.csr.prev()?;
                }
            }
        }
        self.refresh(true)
    }

    fn advance(&mut self, reverse: bool) -> Result<()> {
        match &mut self.src {
            CompSource::Tree(csr) => {
                if reverse {
                    csr.prev()?;
                } else {
                    csr.next()?;
                }
            }
            CompSource::Freelist(producer) => {
                producer.pos = match producer.pos {
                    None => None,
                    Some(pos) => {
                        if reverse {
                            pos.checked_sub(1)
                        } else {
                            let next = pos + 1;
                            (next < producer.entries.len()).then_some(next)
                        }
                    }
                };
            }
            CompSource::Seg(bounds) => {
                if bounds.pseudo_pending {
                    // The pseudo boundary is the last thing the RHS
                    // yields while reversing
                    bounds.pseudo_pending = false;
                    bounds.pseudo_done = true;
                    bounds.csr.invalidate();
                } else if reverse {
                    bounds.csr.prev()?;
                } else {
                    bounds.csr.next()?;
                }
            }
        }
        self.refresh(reverse)
    }
}

/// The coalesced entry at the multi-cursor's position.
#[derive(Clone, Debug)]
pub struct MergedEntry {
    /// Topic bit.
    pub topic: u8,

    /// Key bytes.
    pub key: Slice,

    /// Effective flags after coalescing.
    pub flags: EntryFlags,

    /// Newest payload at the key.
    pub value: Option<Slice>,

    /// Forward pointer carried from the oldest segment input.
    pub fwd: u64,

    /// Whether a strictly newer cover shadows this key.
    pub covered: bool,
}

impl MergedEntry {
    /// Returns `true` when a user cursor should yield this entry.
    #[must_use]
    pub fn user_visible(&self) -> bool {
        self.flags.is_insert() && !self.covered
    }
}

/// The K-way merge cursor.
pub struct MultiCursor {
    comps: Vec<Comp>,

    /// Tournament array; `tree[1]` holds the winning component index.
    tree: Vec<Option<usize>>,

    reverse: bool,

    /// Skip entries a user must not see (deleted, boundary, system).
    user_mode: bool,
}

impl MultiCursor {
    /// Builds a multi-cursor over components in newest-to-oldest order.
    #[must_use]
    pub fn new(sources: Vec<CompSource>, user_mode: bool) -> Self {
        let comps: Vec<Comp> = sources
            .into_iter()
            .map(|src| Comp { src, cur: None })
            .collect();

        let leaves = comps.len().next_power_of_two().max(1);
        Self {
            comps,
            tree: vec![None; leaves * 2],
            reverse: false,
            user_mode,
        }
    }

    /// Current direction.
    #[must_use]
    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    fn better(&self, a: Option<usize>, b: Option<usize>) -> Option<usize> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(a), Some(b)) => {
                #[allow(clippy::indexing_slicing)]
                let (ea, eb) = (&self.comps[a].cur, &self.comps[b].cur);
                match (ea, eb) {
                    (None, _) => Some(b),
                    (_, None) => Some(a),
                    (Some(ea), Some(eb)) => {
                        let ord = ea.rank_cmp(eb);
                        let a_wins = match ord {
                            Ordering::Less => !self.reverse,
                            Ordering::Greater => self.reverse,
                            // The newer (lower-index) component wins ties
                            Ordering::Equal => a < b,
                        };
                        Some(if a_wins { a } else { b })
                    }
                }
            }
        }
    }

    /// Recomputes the tournament bottom-up.
    fn build_tree(&mut self) {
        let leaves = self.tree.len() / 2;
        for i in 0..leaves {
            let comp = (i < self.comps.len()
                && self.comps.get(i).is_some_and(|c| c.cur.is_some()))
            .then_some(i);

            #[allow(clippy::indexing_slicing)]
            {
                self.tree[leaves + i] = comp;
            }
        }
        for i in (1..leaves).rev() {
            #[allow(clippy::indexing_slicing)]
            {
                self.tree[i] = self.better(self.tree[2 * i], self.tree[2 * i + 1]);
            }
        }
    }

    fn winner(&self) -> Option<usize> {
        self.tree.get(1).copied().flatten()
    }

    /// Returns `true` while positioned on an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.winner().is_some()
    }

    /// Coalesces the components at the winning key.
    #[must_use]
    #[allow(clippy::indexing_slicing)]
    pub fn merged(&self) -> Option<MergedEntry> {
        let win = self.winner()?;
        let win_entry = self.comps[win].cur.as_ref()?;
        let (topic, key) = (win_entry.topic, win_entry.key.clone());

        let mut boundary = EntryFlags::default();
        let mut content: Option<(usize, EntryFlags, Option<Slice>)> = None;
        let mut fwd = 0;

        for (i, comp) in self.comps.iter().enumerate() {
            let Some(entry) = &comp.cur else { continue };
            if !entry.same_key(topic, &key) {
                continue;
            }

            boundary = boundary
                | EntryFlags::from_bits(
                    entry.flags.bits()
                        & (EntryFlags::START_DELETE.bits() | EntryFlags::END_DELETE.bits()),
                );

            if content.is_none()
                && entry
                    .flags
                    .intersects(EntryFlags::INSERT | EntryFlags::POINT_DELETE)
            {
                content = Some((i, entry.flags, entry.value.clone()));
            }

            if entry.fwd != 0 {
                fwd = entry.fwd;
            }
        }

        let content_idx = content.as_ref().map_or(usize::MAX, |(i, _, _)| *i);

        // A cover from a component strictly newer than the payload
        // source shadows it
        let cover_bit = if self.reverse {
            EntryFlags::START_DELETE
        } else {
            EntryFlags::END_DELETE
        };
        let covered = self.comps.iter().enumerate().any(|(i, comp)| {
            i < content_idx
                && comp.cur.as_ref().is_some_and(|entry| {
                    !entry.same_key(topic, &key) && entry.flags.contains(cover_bit)
                })
        });

        let content_bits = content.as_ref().map_or(EntryFlags::default(), |(_, f, _)| {
            EntryFlags::from_bits(
                f.bits() & (EntryFlags::INSERT.bits() | EntryFlags::POINT_DELETE.bits()),
            )
        });

        let mut flags = content_bits | boundary;
        if topic != 0 {
            flags = flags | EntryFlags::SYSTEMKEY;
        }

        Some(MergedEntry {
            topic,
            key,
            flags,
            value: content.and_then(|(_, _, v)| v),
            fwd,
            covered,
        })
    }

    /// Skips positions a user cursor must not yield.
    fn settle(&mut self) -> Result<()> {
        if !self.user_mode {
            return Ok(());
        }
        loop {
            let Some(merged) = self.merged() else {
                return Ok(());
            };
            if merged.topic == 0 && merged.user_visible() {
                return Ok(());
            }
            self.step()?;
        }
    }

    /// Advances every component sitting at the current key.
    fn step(&mut self) -> Result<()> {
        let Some(win) = self.winner() else {
            return Ok(());
        };

        #[allow(clippy::indexing_slicing)]
        let Some(entry) = self.comps[win].cur.clone() else {
            return Ok(());
        };

        let reverse = self.reverse;
        for comp in &mut self.comps {
            let at_key = comp
                .cur
                .as_ref()
                .is_some_and(|e| e.same_key(entry.topic, &entry.key));
            if at_key {
                comp.advance(reverse)?;
            }
        }
        self.build_tree();
        Ok(())
    }

    /// Builds the tournament over the components' existing positions
    /// (used when resuming a paused merge).
    pub fn init_current(&mut self) -> Result<()> {
        self.reverse = false;
        for comp in &mut self.comps {
            comp.refresh(false)?;
        }
        self.build_tree();
        Ok(())
    }

    /// Positions at the smallest entry.
    pub fn first(&mut self) -> Result<()> {
        self.reverse = false;
        for comp in &mut self.comps {
            comp.first()?;
        }
        self.build_tree();
        self.settle()
    }

    /// Positions at the largest entry.
    pub fn last(&mut self) -> Result<()> {
        self.reverse = true;
        for comp in &mut self.comps {
            comp.last()?;
        }
        self.build_tree();
        self.settle()
    }

    /// Advances in the current direction (forward).
    pub fn next(&mut self) -> Result<()> {
        debug_assert!(!self.reverse);
        self.step()?;
        self.settle()
    }

    /// Steps back (reverse direction).
    pub fn prev(&mut self) -> Result<()> {
        debug_assert!(self.reverse);
        self.step()?;
        self.settle()
    }

    /// Seeks to `key` with the given bias, settling visibility.
    pub fn seek(&mut self, topic: u8, key: &[u8], bias: SeekBias) -> Result<()> {
        match bias {
            SeekBias::Ge | SeekBias::Eq => {
                self.reverse = false;
                for comp in &mut self.comps {
                    comp.seek_ge(topic, key)?;
                }
                self.build_tree();
                self.settle()?;

                if bias == SeekBias::Eq {
                    let exact = self
                        .merged()
                        .is_some_and(|m| m.same_key_with(topic, key));
                    if !exact {
                        self.invalidate();
                    }
                }
                Ok(())
            }
            SeekBias::Le | SeekBias::LeFast => {
                self.reverse = true;
                for comp in &mut self.comps {
                    comp.seek_le(topic, key)?;
                }
                self.build_tree();
                if bias == SeekBias::Le {
                    self.settle()?;
                }
                Ok(())
            }
        }
    }

    /// Drops the position entirely.
    pub fn invalidate(&mut self) {
        for comp in &mut self.comps {
            comp.cur = None;
        }
        self.build_tree();
    }

    /// Current `(page, cell)` of every segment component, in component
    /// order. Invalid cursors report `(0, 0)`.
    #[must_use]
    pub fn seg_positions(&self) -> Vec<(u64, u32)> {
        self.comps
            .iter()
            .filter_map(|comp| match &comp.src {
                CompSource::Seg(bounds) => {
                    Some(bounds.csr.position().unwrap_or((0, 0)))
                }
                _ => None,
            })
            .collect()
    }

    /// Position of the winning component when it is a segment cursor.
    #[must_use]
    pub fn winner_seg_position(&self) -> Option<(u64, u32)> {
        let win = self.winner()?;
        match &self.comps.get(win)?.src {
            CompSource::Seg(bounds) => bounds.csr.position(),
            _ => None,
        }
    }
}

impl MergedEntry {
    fn same_key_with(&self, topic: u8, key: &[u8]) -> bool {
        key_cmp(self.topic, &self.key, topic, key) == Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{arena::Arena, header::TreeHeader, ShmRegion};
    use crate::tree::TreeWriter;
    use test_log::test;

    fn tree_with(entries: &[(&[u8], Option<&[u8]>, EntryFlags)]) -> (ShmRegion, TreeHeader) {
        let shm = ShmRegion::new();
        let mut hdr = TreeHeader::default();
        Arena::format(&shm, &mut hdr).unwrap();
        let mut rollback = Vec::new();
        let mut writer = TreeWriter::new(&shm, &mut hdr, &mut rollback, u32::MAX);
        for (key, value, flags) in entries {
            writer.insert(*flags, key, *value).unwrap();
        }
        (shm, hdr)
    }

    fn collect_user(mc: &mut MultiCursor) -> Vec<(Vec<u8>, Vec<u8>)> {
        mc.first().unwrap();
        let mut out = Vec::new();
        while mc.valid() {
            let merged = mc.merged().unwrap();
            out.push((
                merged.key.to_vec(),
                merged.value.clone().unwrap_or_default().to_vec(),
            ));
            mc.next().unwrap();
        }
        out
    }

    #[test]
    fn newer_tree_shadows_older() {
        let (shm_new, hdr_new) = tree_with(&[(b"k", Some(b"new"), EntryFlags::INSERT)]);
        let (shm_old, hdr_old) = tree_with(&[
            (b"k", Some(b"old"), EntryFlags::INSERT),
            (b"only-old", Some(b"1"), EntryFlags::INSERT),
        ]);

        let mut mc = MultiCursor::new(
            vec![
                CompSource::Tree(TreeCursor::new(shm_new, hdr_new.root, u64::MAX)),
                CompSource::Tree(TreeCursor::new(shm_old, hdr_old.root, u64::MAX)),
            ],
            true,
        );

        let items = collect_user(&mut mc);
        assert_eq!(
            vec![
                (b"k".to_vec(), b"new".to_vec()),
                (b"only-old".to_vec(), b"1".to_vec()),
            ],
            items
        );
    }

    #[test]
    fn point_delete_hides_older_insert() {
        let (shm_new, hdr_new) =
            tree_with(&[(b"gone", None, EntryFlags::POINT_DELETE)]);
        let (shm_old, hdr_old) = tree_with(&[
            (b"gone", Some(b"x"), EntryFlags::INSERT),
            (b"kept", Some(b"y"), EntryFlags::INSERT),
        ]);

        let mut mc = MultiCursor::new(
            vec![
                CompSource::Tree(TreeCursor::new(shm_new, hdr_new.root, u64::MAX)),
                CompSource::Tree(TreeCursor::new(shm_old, hdr_old.root, u64::MAX)),
            ],
            true,
        );

        let items = collect_user(&mut mc);
        assert_eq!(vec![(b"kept".to_vec(), b"y".to_vec())], items);
    }

    #[test]
    fn range_delete_covers_older_component() {
        // Newer tree: cover (b, e); older tree has b..f
        let (shm_new, hdr_new) = {
            let shm = ShmRegion::new();
            let mut hdr = TreeHeader::default();
            Arena::format(&shm, &mut hdr).unwrap();
            let mut rollback = Vec::new();
            let mut w = TreeWriter::new(&shm, &mut hdr, &mut rollback, u32::MAX);
            w.delete_range(0, b"b", b"e").unwrap();
            (shm, hdr)
        };
        let (shm_old, hdr_old) = tree_with(&[
            (b"a", Some(b"1"), EntryFlags::INSERT),
            (b"b", Some(b"2"), EntryFlags::INSERT),
            (b"c", Some(b"3"), EntryFlags::INSERT),
            (b"d", Some(b"4"), EntryFlags::INSERT),
            (b"e", Some(b"5"), EntryFlags::INSERT),
            (b"f", Some(b"6"), EntryFlags::INSERT),
        ]);

        let mut mc = MultiCursor::new(
            vec![
                CompSource::Tree(TreeCursor::new(shm_new, hdr_new.root, u64::MAX)),
                CompSource::Tree(TreeCursor::new(shm_old, hdr_old.root, u64::MAX)),
            ],
            true,
        );

        let items = collect_user(&mut mc);
        let keys: Vec<Vec<u8>> = items.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            vec![b"a".to_vec(), b"b".to_vec(), b"e".to_vec(), b"f".to_vec()],
            keys
        );
    }

    #[test]
    fn reverse_iteration_sees_covers() {
        let (shm_new, hdr_new) = {
            let shm = ShmRegion::new();
            let mut hdr = TreeHeader::default();
            Arena::format(&shm, &mut hdr).unwrap();
            let mut rollback = Vec::new();
            let mut w = TreeWriter::new(&shm, &mut hdr, &mut rollback, u32::MAX);
            w.delete_range(0, b"b", b"e").unwrap();
            (shm, hdr)
        };
        let (shm_old, hdr_old) = tree_with(&[
            (b"a", Some(b"1"), EntryFlags::INSERT),
            (b"c", Some(b"3"), EntryFlags::INSERT),
            (b"f", Some(b"6"), EntryFlags::INSERT),
        ]);

        let mut mc = MultiCursor::new(
            vec![
                CompSource::Tree(TreeCursor::new(shm_new, hdr_new.root, u64::MAX)),
                CompSource::Tree(TreeCursor::new(shm_old, hdr_old.root, u64::MAX)),
            ],
            true,
        );

        mc.last().unwrap();
        let mut keys = Vec::new();
        while mc.valid() {
            keys.push(mc.merged().unwrap().key.to_vec());
            mc.prev().unwrap();
        }
        assert_eq!(vec![b"f".to_vec(), b"a".to_vec()], keys);
    }

    #[test]
    fn insert_inside_cover_survives() {
        // Older: cover (a, z). Newer: insert m (carrying cover marks)
        let (shm_new, hdr_new) = tree_with(&[(
            b"m",
            Some(b"live"),
            EntryFlags::INSERT | EntryFlags::START_DELETE | EntryFlags::END_DELETE,
        )]);
        let (shm_old, hdr_old) = {
            let shm = ShmRegion::new();
            let mut hdr = TreeHeader::default();
            Arena::format(&shm, &mut hdr).unwrap();
            let mut rollback = Vec::new();
            let mut w = TreeWriter::new(&shm, &mut hdr, &mut rollback, u32::MAX);
            w.insert(EntryFlags::INSERT, b"m", Some(b"dead")).unwrap();
            w.insert(EntryFlags::INSERT, b"q", Some(b"dead")).unwrap();
            w.delete_range(0, b"a", b"z").unwrap();
            (shm, hdr)
        };

        let mut mc = MultiCursor::new(
            vec![
                CompSource::Tree(TreeCursor::new(shm_new, hdr_new.root, u64::MAX)),
                CompSource::Tree(TreeCursor::new(shm_old, hdr_old.root, u64::MAX)),
            ],
            true,
        );

        let items = collect_user(&mut mc);
        assert_eq!(vec![(b"m".to_vec(), b"live".to_vec())], items);
    }

    #[test]
    fn seek_biases() {
        let (shm, hdr) = tree_with(&[
            (b"b", Some(b"1"), EntryFlags::INSERT),
            (b"d", Some(b"2"), EntryFlags::INSERT),
        ]);

        let mut mc = MultiCursor::new(
            vec![CompSource::Tree(TreeCursor::new(shm, hdr.root, u64::MAX))],
            true,
        );

        mc.seek(0, b"c", SeekBias::Ge).unwrap();
        assert_eq!(b"d".to_vec(), mc.merged().unwrap().key.to_vec());

        mc.seek(0, b"c", SeekBias::Le).unwrap();
        assert_eq!(b"b".to_vec(), mc.merged().unwrap().key.to_vec());

        mc.seek(0, b"c", SeekBias::Eq).unwrap();
        assert!(!mc.valid());

        mc.seek(0, b"d", SeekBias::Eq).unwrap();
        assert_eq!(b"d".to_vec(), mc.merged().unwrap().key.to_vec());
    }

    #[test]
    fn freelist_producer_yields_system_entries() {
        let producer = FreelistProducer::new(&[
            FreelistEntry { block: 9, id: 44 },
            FreelistEntry { block: 3, id: -1 },
        ]);

        let mut mc = MultiCursor::new(vec![CompSource::Freelist(producer)], false);
        mc.first().unwrap();

        let merged = mc.merged().unwrap();
        assert_eq!(1, merged.topic);
        assert_eq!(Some(3), decode_freelist_key(&merged.key));
        assert!(merged.value.as_ref().is_some_and(Slice::is_empty));

        mc.next().unwrap();
        let merged = mc.merged().unwrap();
        assert_eq!(Some(9), decode_freelist_key(&merged.key));
        assert_eq!(
            44u64.to_be_bytes().to_vec(),
            merged.value.unwrap().to_vec()
        );

        mc.next().unwrap();
        assert!(!mc.valid());
    }
}
