// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Process-wide registry of open databases.
//!
//! All handles in one process that name the same database share one
//! [`SharedDb`] - the shared-memory region and the lock table - keyed
//! by the canonical absolute path. This is what lets connections on
//! different threads behave exactly like separate clients without any
//! file locking between them.

use crate::{lock::LockTable, shm::ShmRegion};
use rustc_hash::FxHashMap;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock},
};

/// State shared by every in-process connection to one database.
pub struct SharedDb {
    /// The shared-memory region (chunk 0 is the shared header).
    pub shm: ShmRegion,

    /// The lock table.
    pub locks: LockTable,

    /// Serializes reader-slot claims, which need a read-check-write
    /// sequence on chunk 0.
    pub reader_slots: Mutex<()>,
}

struct Entry {
    shared: Arc<SharedDb>,
    refs: usize,
    next_conn: u32,
}

type Registry = Mutex<FxHashMap<PathBuf, Entry>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Normalizes a path for use as a registry key. Falls back to the
/// given path when it does not (yet) exist on the real filesystem,
/// which is the common case for in-memory environments.
#[must_use]
pub fn canonical_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Joins (or creates) the shared state for `path`. Returns the shared
/// handle and a connection id unique within it.
#[allow(clippy::expect_used)]
pub fn attach(path: &Path) -> (Arc<SharedDb>, u32) {
    let key = canonical_key(path);
    let mut map = registry().lock().expect("lock poisoned");

    let entry = map.entry(key).or_insert_with(|| Entry {
        shared: Arc::new(SharedDb {
            shm: ShmRegion::new(),
            locks: LockTable::new(),
            reader_slots: Mutex::new(()),
        }),
        refs: 0,
        next_conn: 1,
    });

    entry.refs += 1;
    let conn = entry.next_conn;
    entry.next_conn += 1;
    (entry.shared.clone(), conn)
}

/// Leaves the shared state. Returns `true` when this was the last
/// in-process connection (the entry is removed and the shared memory
/// dropped).
#[allow(clippy::expect_used)]
pub fn detach(path: &Path) -> bool {
    let key = canonical_key(path);
    let mut map = registry().lock().expect("lock poisoned");

    let Some(entry) = map.get_mut(&key) else {
        return true;
    };

    entry.refs -= 1;
    if entry.refs == 0 {
        map.remove(&key);
        true
    } else {
        false
    }
}

/// Number of in-process connections currently attached to `path`.
#[allow(clippy::expect_used)]
#[must_use]
pub fn ref_count(path: &Path) -> usize {
    let key = canonical_key(path);
    registry()
        .lock()
        .expect("lock poisoned")
        .get(&key)
        .map_or(0, |entry| entry.refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn attach_shares_state() {
        let path = Path::new("/registry-test/shared-db-a");

        let (a, conn_a) = attach(path);
        let (b, conn_b) = attach(path);

        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(conn_a, conn_b);
        assert_eq!(2, ref_count(path));

        assert!(!detach(path));
        assert!(detach(path));
        assert_eq!(0, ref_count(path));
    }

    #[test]
    fn different_paths_are_isolated() {
        let (a, _) = attach(Path::new("/registry-test/db-b"));
        let (b, _) = attach(Path::new("/registry-test/db-c"));

        assert!(!Arc::ptr_eq(&a, &b));

        detach(Path::new("/registry-test/db-b"));
        detach(Path::new("/registry-test/db-c"));
    }
}
