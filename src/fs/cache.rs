// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::PageRef;
use rustc_hash::FxHashMap;

/// Page cache: a hash table over page ids with LRU eviction among
/// unreferenced pages.
///
/// A page is pinned while anyone outside the cache holds its `Arc`;
/// pinned pages are never evicted, so the cache can temporarily exceed
/// its capacity under heavy cursor fan-out.
pub struct PageCache {
    map: FxHashMap<u64, Entry>,
    capacity: usize,
    tick: u64,
}

struct Entry {
    page: PageRef,
    last_use: u64,
}

/// Cache capacity target in bytes.
const CACHE_TARGET_BYTES: usize = 2 * 1024 * 1024;

impl PageCache {
    /// Creates a cache sized for the given page size.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            map: FxHashMap::default(),
            capacity: (CACHE_TARGET_BYTES / page_size.max(1)).max(16),
            tick: 0,
        }
    }

    /// Number of cached pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Looks up a page, refreshing its LRU position.
    pub fn get(&mut self, id: u64) -> Option<PageRef> {
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(&id).map(|entry| {
            entry.last_use = tick;
            entry.page.clone()
        })
    }

    /// Inserts a page, evicting the least recently used unpinned page
    /// when full.
    pub fn insert(&mut self, page: PageRef) {
        if self.map.len() >= self.capacity {
            self.evict_one();
        }
        self.tick += 1;
        self.map.insert(
            page.id,
            Entry {
                page,
                last_use: self.tick,
            },
        );
    }

    /// Drops a page (used when a page is rewritten).
    pub fn remove(&mut self, id: u64) {
        self.map.remove(&id);
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    fn evict_one(&mut self) {
        let victim = self
            .map
            .iter()
            .filter(|(_, entry)| std::sync::Arc::strong_count(&entry.page) == 1)
            .min_by_key(|(_, entry)| entry.last_use)
            .map(|(id, _)| *id);

        if let Some(id) = victim {
            self.map.remove(&id);
        }
    }
}
