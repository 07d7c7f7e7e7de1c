// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! User-facing cursors.
//!
//! A cursor pins one consistent view: the tree header it loaded, the
//! snapshot published at that moment, and a reader slot that keeps the
//! shared-memory chunks and disk blocks it references from being
//! recycled. A cursor opened inside a write transaction sees the
//! transaction's own uncommitted writes instead.

use super::{work, DbInner};
use crate::{
    error::{Error, Result},
    multi_cursor::MultiCursor,
    segment::cursor::SeekBias,
    shm::header::TreeHeader,
    slice::Slice,
    snapshot::Snapshot,
};
use std::{
    cmp::Ordering,
    sync::{atomic::Ordering as AtomicOrdering, Arc},
};

/// Seek flavors of [`Cursor::seek`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekMode {
    /// Exact match, or the cursor becomes invalid.
    Eq,

    /// The largest key at or below the target.
    Le,

    /// Like [`SeekMode::Le`], but the engine may stop at a key that is
    /// possibly deleted, as long as it is at or above every live key
    /// at or below the target. Cheaper; used for key allocation.
    LeFast,

    /// The smallest key at or above the target.
    Ge,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Direction {
    Forward,
    Backward,
}

/// An ordered cursor over a consistent view of the database.
pub struct Cursor {
    db: Arc<DbInner>,
    mc: MultiCursor,
    reader_slot: Option<usize>,

    #[allow(dead_code)]
    snapshot: Arc<Snapshot>,

    dir: Option<Direction>,
}

impl Cursor {
    pub(crate) fn open(db: Arc<DbInner>) -> Result<Self> {
        // Inside a write transaction the cursor reads the uncommitted
        // tree; otherwise it pins the committed view
        let (hdr, txid, own_txn) = {
            let state = db.state();
            if state.txn_depth > 0 {
                let hdr = state
                    .hdr
                    .clone()
                    .ok_or(Error::Misuse("transaction state missing"))?;
                (hdr, u64::MAX, true)
            } else {
                drop(state);
                let hdr = TreeHeader::load(&db.shared.shm)?;
                let txid = hdr.root.txid;
                (hdr, txid, false)
            }
        };

        let mut snap = work::read_shm_snapshot(&db.shared)?;
        db.load_levels_overflow(&hdr, &mut snap)?;
        let snapshot = Arc::new(snap);

        let reader_slot = if own_txn {
            None
        } else {
            Some(db.claim_reader_slot(snapshot.id, hdr.used_shmid)?)
        };

        let sources = match db.build_sources(&hdr, &snapshot, txid) {
            Ok(sources) => sources,
            Err(e) => {
                if let Some(slot) = reader_slot {
                    db.release_reader_slot(slot);
                }
                return Err(e);
            }
        };

        Ok(Self {
            db,
            mc: MultiCursor::new(sources, true),
            reader_slot,
            snapshot,
            dir: None,
        })
    }

    fn note_read(&self) {
        if self.mc.valid() {
            self.db.nread.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    /// Returns `true` while the cursor points at a live entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.mc.valid()
    }

    /// Moves to the smallest key.
    pub fn first(&mut self) -> Result<()> {
        self.mc.first()?;
        self.dir = Some(Direction::Forward);
        self.note_read();
        Ok(())
    }

    /// Moves to the largest key.
    pub fn last(&mut self) -> Result<()> {
        self.mc.last()?;
        self.dir = Some(Direction::Backward);
        self.note_read();
        Ok(())
    }

    /// Seeks to `key`.
    pub fn seek(&mut self, key: impl AsRef<[u8]>, mode: SeekMode) -> Result<()> {
        let bias = match mode {
            SeekMode::Eq => SeekBias::Eq,
            SeekMode::Le => SeekBias::Le,
            SeekMode::LeFast => SeekBias::LeFast,
            SeekMode::Ge => SeekBias::Ge,
        };

        self.mc.seek(0, key.as_ref(), bias)?;
        self.dir = Some(match mode {
            SeekMode::Le | SeekMode::LeFast => Direction::Backward,
            SeekMode::Eq | SeekMode::Ge => Direction::Forward,
        });
        self.note_read();
        Ok(())
    }

    /// Advances to the next key in ascending order.
    ///
    /// Only valid after a forward positioning (`first`, `seek(Ge)`,
    /// `seek(Eq)`).
    pub fn next(&mut self) -> Result<()> {
        if self.dir != Some(Direction::Forward) {
            return Err(Error::Misuse(
                "cursor was last positioned for backward iteration",
            ));
        }
        self.mc.next()?;
        self.note_read();
        Ok(())
    }

    /// Steps to the previous key in descending order.
    ///
    /// Only valid after a backward positioning (`last`, `seek(Le)`).
    pub fn prev(&mut self) -> Result<()> {
        if self.dir != Some(Direction::Backward) {
            return Err(Error::Misuse(
                "cursor was last positioned for forward iteration",
            ));
        }
        self.mc.prev()?;
        self.note_read();
        Ok(())
    }

    /// The key under the cursor.
    pub fn key(&self) -> Result<Slice> {
        self.mc
            .merged()
            .map(|m| m.key)
            .ok_or(Error::Misuse("cursor is not positioned"))
    }

    /// The value under the cursor.
    pub fn value(&self) -> Result<Slice> {
        self.mc
            .merged()
            .and_then(|m| m.value)
            .ok_or(Error::Misuse("cursor is not positioned"))
    }

    /// Compares the cursor's current key against `key`.
    pub fn cmp(&self, key: impl AsRef<[u8]>) -> Result<Ordering> {
        let current = self.key()?;
        Ok((*current).cmp(key.as_ref()))
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(slot) = self.reader_slot.take() {
            self.db.release_reader_slot(slot);
        }
    }
}

/// Consuming iteration: yields `(key, value)` pairs in ascending order
/// from the cursor's current position.
impl Iterator for Cursor {
    type Item = Result<(Slice, Slice)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dir.is_none() {
            if let Err(e) = self.first() {
                return Some(Err(e));
            }
        }
        if !self.valid() {
            return None;
        }

        let pair = self.key().and_then(|k| self.value().map(|v| (k, v)));
        match pair {
            Err(e) => Some(Err(e)),
            Ok(pair) => match Cursor::next(self) {
                Err(e) => Some(Err(e)),
                Ok(()) => Some(Ok(pair)),
            },
        }
    }
}
