// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The lock table shared by all connections to one database.
//!
//! Every slot can be held SHARED by any number of connections or
//! EXCLUSIVE by one. Acquisition never blocks; contention surfaces as
//! [`crate::Error::Busy`] and the caller decides whether to retry.

use crate::error::{Error, Result};
use std::sync::Mutex;

/// Number of READER slots.
pub const NUM_READERS: usize = 6;

/// Number of RW-CLIENT slots.
pub const NUM_RW_CLIENTS: usize = 16;

const NUM_SLOTS: usize = 7 + NUM_READERS + NUM_RW_CLIENTS;

/// A named slot in the lock table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockSlot {
    /// Serializes connect and disconnect.
    Dms1,

    /// Held SHARED by every read-write connection.
    Dms2,

    /// Held SHARED by every read-only connection.
    Dms3,

    /// Owned by the single active writer.
    Writer,

    /// Owned by the connection running flush/merge work.
    Worker,

    /// Owned by the connection writing a meta-page.
    Checkpointer,

    /// Held by read-only connections reading without live shared memory.
    RoTrans,

    /// One of the reader registration slots (0..6).
    Reader(usize),

    /// One of the live-client proof slots (0..16).
    RwClient(usize),
}

impl LockSlot {
    fn index(self) -> usize {
        match self {
            Self::Dms1 => 0,
            Self::Dms2 => 1,
            Self::Dms3 => 2,
            Self::Writer => 3,
            Self::Worker => 4,
            Self::Checkpointer => 5,
            Self::RoTrans => 6,
            Self::Reader(i) => {
                debug_assert!(i < NUM_READERS);
                7 + i
            }
            Self::RwClient(i) => {
                debug_assert!(i < NUM_RW_CLIENTS);
                7 + NUM_READERS + i
            }
        }
    }
}

/// SHARED or EXCLUSIVE.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockKind {
    /// Compatible with other shared holders.
    Shared,

    /// Requires sole ownership of the slot.
    Exclusive,
}

#[derive(Default, Clone)]
struct SlotState {
    exclusive: Option<u32>,
    shared: Vec<u32>,
}

/// The in-process lock table for one database.
pub struct LockTable {
    slots: Mutex<Vec<SlotState>>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)]
impl LockTable {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(vec![SlotState::default(); NUM_SLOTS]),
        }
    }

    /// Attempts to take `slot` for connection `conn`.
    ///
    /// SHARED acquisitions are counted, so every acquisition needs a
    /// matching [`Self::unlock`]; EXCLUSIVE on a slot the connection
    /// already holds shared is an upgrade attempt.
    pub fn lock(&self, conn: u32, slot: LockSlot, kind: LockKind) -> Result<()> {
        let mut slots = self.slots.lock().expect("lock poisoned");

        #[allow(clippy::indexing_slicing)]
        let state = &mut slots[slot.index()];

        match kind {
            LockKind::Shared => {
                if state.exclusive.is_some_and(|holder| holder != conn) {
                    return Err(Error::Busy);
                }
                state.shared.push(conn);
                Ok(())
            }
            LockKind::Exclusive => {
                if state.exclusive.is_some_and(|holder| holder != conn) {
                    return Err(Error::Busy);
                }
                if state.shared.iter().any(|&holder| holder != conn) {
                    return Err(Error::Busy);
                }
                state.exclusive = Some(conn);
                Ok(())
            }
        }
    }

    /// Releases one shared acquisition (or the exclusive hold) of
    /// `conn` on `slot`.
    pub fn unlock(&self, conn: u32, slot: LockSlot) {
        let mut slots = self.slots.lock().expect("lock poisoned");

        #[allow(clippy::indexing_slicing)]
        let state = &mut slots[slot.index()];

        if state.exclusive == Some(conn) {
            state.exclusive = None;
        }
        if let Some(pos) = state.shared.iter().position(|&holder| holder == conn) {
            state.shared.remove(pos);
        }
    }

    /// Releases everything `conn` holds. Used when a connection closes.
    pub fn unlock_all(&self, conn: u32) {
        let mut slots = self.slots.lock().expect("lock poisoned");
        for state in slots.iter_mut() {
            if state.exclusive == Some(conn) {
                state.exclusive = None;
            }
            state.shared.retain(|&holder| holder != conn);
        }
    }

    /// Returns `true` if anyone (other than `conn`) holds the slot in a
    /// way that conflicts with the given kind.
    pub fn is_held(&self, conn: u32, slot: LockSlot, kind: LockKind) -> bool {
        let slots = self.slots.lock().expect("lock poisoned");

        #[allow(clippy::indexing_slicing)]
        let state = &slots[slot.index()];

        match kind {
            LockKind::Shared => state.exclusive.is_some_and(|holder| holder != conn),
            LockKind::Exclusive => {
                state.exclusive.is_some_and(|holder| holder != conn)
                    || state.shared.iter().any(|&holder| holder != conn)
            }
        }
    }

    /// Returns `true` if `conn` itself holds the slot.
    pub fn holds(&self, conn: u32, slot: LockSlot) -> bool {
        let slots = self.slots.lock().expect("lock poisoned");

        #[allow(clippy::indexing_slicing)]
        let state = &slots[slot.index()];

        state.exclusive == Some(conn) || state.shared.contains(&conn)
    }

    /// The connections currently holding `slot` SHARED.
    pub fn shared_holders(&self, slot: LockSlot) -> Vec<u32> {
        let slots = self.slots.lock().expect("lock poisoned");

        #[allow(clippy::indexing_slicing)]
        slots[slot.index()].shared.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn shared_then_exclusive_conflicts() {
        let table = LockTable::new();

        table.lock(1, LockSlot::Writer, LockKind::Shared).unwrap();
        assert!(matches!(
            table.lock(2, LockSlot::Writer, LockKind::Exclusive),
            Err(Error::Busy)
        ));

        table.unlock(1, LockSlot::Writer);
        table.lock(2, LockSlot::Writer, LockKind::Exclusive).unwrap();

        assert!(matches!(
            table.lock(1, LockSlot::Writer, LockKind::Shared),
            Err(Error::Busy)
        ));
    }

    #[test]
    fn shared_is_compatible_with_shared() {
        let table = LockTable::new();

        table.lock(1, LockSlot::Dms2, LockKind::Shared).unwrap();
        table.lock(2, LockSlot::Dms2, LockKind::Shared).unwrap();
        table.lock(3, LockSlot::Dms2, LockKind::Shared).unwrap();

        assert_eq!(vec![1, 2, 3], table.shared_holders(LockSlot::Dms2));
    }

    #[test]
    fn upgrade_own_shared_to_exclusive() {
        let table = LockTable::new();

        table.lock(1, LockSlot::Worker, LockKind::Shared).unwrap();
        table.lock(1, LockSlot::Worker, LockKind::Exclusive).unwrap();

        assert!(matches!(
            table.lock(2, LockSlot::Worker, LockKind::Shared),
            Err(Error::Busy)
        ));
    }

    #[test]
    fn unlock_all_releases_every_slot() {
        let table = LockTable::new();

        table.lock(1, LockSlot::Dms2, LockKind::Shared).unwrap();
        table.lock(1, LockSlot::Writer, LockKind::Exclusive).unwrap();
        table.lock(1, LockSlot::Reader(3), LockKind::Shared).unwrap();

        table.unlock_all(1);

        table.lock(2, LockSlot::Writer, LockKind::Exclusive).unwrap();
        table.lock(2, LockSlot::Reader(3), LockKind::Exclusive).unwrap();
    }

    #[test]
    fn reader_and_rw_client_slots_are_distinct() {
        let table = LockTable::new();

        for i in 0..NUM_READERS {
            table
                .lock(1, LockSlot::Reader(i), LockKind::Exclusive)
                .unwrap();
        }
        for i in 0..NUM_RW_CLIENTS {
            table
                .lock(2, LockSlot::RwClient(i), LockKind::Exclusive)
                .unwrap();
        }
    }
}
