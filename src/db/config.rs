// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    compress::{CompressionFactory, Compressor},
    error::{Error, Result},
};
use std::sync::Arc;

/// Durability level.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SafetyLevel {
    /// Never sync; a power failure may corrupt the database.
    Off,

    /// Sync at checkpoints; a crash loses at most recent transactions.
    #[default]
    Normal,

    /// Sync the log on every commit and pad commits to sector
    /// boundaries.
    Full,
}

impl TryFrom<u8> for SafetyLevel {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            0 => Ok(Self::Off),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Full),
            _ => Err(()),
        }
    }
}

/// Connection options. Geometry options only apply when the database
/// file is created; an existing database keeps the geometry it was
/// created with.
#[derive(Clone)]
pub struct Options {
    /// KiB of in-memory tree data before the tree is set aside for
    /// flushing. Default 1024.
    pub autoflush_kib: u32,

    /// Page size in bytes, a power of two in `256..=65536`.
    /// Default 4096. Set only before the database is created.
    pub page_size: u32,

    /// Block size in KiB, a power of two in `64..=65536`.
    /// Default 1024. Set only before the database is created.
    pub block_size_kib: u32,

    /// Durability level. Default [`SafetyLevel::Normal`].
    pub safety: SafetyLevel,

    /// Run flush/merge work automatically after commits. Default true.
    pub autowork: bool,

    /// Memory-map budget: 0 = off, 1 = map the whole file, otherwise a
    /// cap in KiB. Defaults to 1 on 64-bit targets and 32768 KiB on
    /// 32-bit ones.
    pub mmap: u64,

    /// Keep a write-ahead log. Default true.
    pub use_log: bool,

    /// Minimum number of levels folded by one merge. Default 4,
    /// minimum 2.
    pub automerge: u32,

    /// Free-list entries kept in the checkpoint before spilling into
    /// the LSM (a testing knob). Default 24.
    pub max_freelist: u32,

    /// Take an advisory lock on the database file so foreign processes
    /// are coordinated. Default true.
    pub multiple_processes: bool,

    /// KiB of work between automatic checkpoints. Default 2048.
    pub autocheckpoint_kib: u32,

    /// Compression hooks. Must match the database's persisted scheme.
    pub compression: Option<Arc<dyn Compressor>>,

    /// Invoked when the persisted compression id does not match, to
    /// let the caller install the right scheme before the open fails.
    pub compression_factory: Option<Arc<CompressionFactory>>,

    /// Open read-only. Default false.
    pub readonly: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            autoflush_kib: 1024,
            page_size: 4096,
            block_size_kib: 1024,
            safety: SafetyLevel::Normal,
            autowork: true,
            mmap: if cfg!(target_pointer_width = "64") {
                1
            } else {
                32 * 1024
            },
            use_log: true,
            automerge: 4,
            max_freelist: 24,
            multiple_processes: true,
            autocheckpoint_kib: 2048,
            compression: None,
            compression_factory: None,
            readonly: false,
        }
    }
}

impl Options {
    /// Sets the autoflush threshold in KiB.
    #[must_use]
    pub fn autoflush_kib(mut self, kib: u32) -> Self {
        self.autoflush_kib = kib;
        self
    }

    /// Sets the page size (only effective at creation).
    #[must_use]
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the block size in KiB (only effective at creation).
    #[must_use]
    pub fn block_size_kib(mut self, kib: u32) -> Self {
        self.block_size_kib = kib;
        self
    }

    /// Sets the durability level.
    #[must_use]
    pub fn safety(mut self, safety: SafetyLevel) -> Self {
        self.safety = safety;
        self
    }

    /// Enables or disables automatic background work.
    #[must_use]
    pub fn autowork(mut self, yes: bool) -> Self {
        self.autowork = yes;
        self
    }

    /// Sets the mmap budget.
    #[must_use]
    pub fn mmap(mut self, mode: u64) -> Self {
        self.mmap = mode;
        self
    }

    /// Enables or disables the write-ahead log.
    #[must_use]
    pub fn use_log(mut self, yes: bool) -> Self {
        self.use_log = yes;
        self
    }

    /// Sets the merge fan-in.
    #[must_use]
    pub fn automerge(mut self, levels: u32) -> Self {
        self.automerge = levels;
        self
    }

    /// Sets the in-checkpoint free-list ceiling.
    #[must_use]
    pub fn max_freelist(mut self, entries: u32) -> Self {
        self.max_freelist = entries;
        self
    }

    /// Enables or disables the cross-process gate lock.
    #[must_use]
    pub fn multiple_processes(mut self, yes: bool) -> Self {
        self.multiple_processes = yes;
        self
    }

    /// Sets the automatic checkpoint threshold in KiB.
    #[must_use]
    pub fn autocheckpoint_kib(mut self, kib: u32) -> Self {
        self.autocheckpoint_kib = kib;
        self
    }

    /// Installs compression hooks.
    #[must_use]
    pub fn compression(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compression = Some(compressor);
        self
    }

    /// Installs a compression factory consulted on id mismatch.
    #[must_use]
    pub fn compression_factory(mut self, factory: Arc<CompressionFactory>) -> Self {
        self.compression_factory = Some(factory);
        self
    }

    /// Opens the database read-only.
    #[must_use]
    pub fn readonly(mut self, yes: bool) -> Self {
        self.readonly = yes;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(256..=65536).contains(&self.page_size) {
            return Err(Error::Misuse("page size must be a power of two in 256..=65536"));
        }
        if !self.block_size_kib.is_power_of_two() || !(64..=65536).contains(&self.block_size_kib) {
            return Err(Error::Misuse(
                "block size must be a power of two in 64..=65536 KiB",
            ));
        }
        if u64::from(self.block_size_kib) * 1024 < u64::from(self.page_size) {
            return Err(Error::Misuse("block size must not be below the page size"));
        }
        if self.automerge < 2 {
            return Err(Error::Misuse("automerge fan-in must be at least 2"));
        }
        Ok(())
    }

    /// The mmap byte cap, `None` when mapping is off.
    pub(crate) fn mmap_limit(&self) -> Option<u64> {
        match self.mmap {
            0 => None,
            1 => Some(u64::MAX),
            kib => Some(kib * 1024),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn defaults_validate() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn bad_geometry_is_rejected() {
        assert!(Options::default().page_size(1000).validate().is_err());
        assert!(Options::default().page_size(128).validate().is_err());
        assert!(Options::default().block_size_kib(48).validate().is_err());
        assert!(Options::default().automerge(1).validate().is_err());

        // 256-byte pages with 64 KiB blocks are fine
        Options::default()
            .page_size(256)
            .block_size_kib(64)
            .validate()
            .unwrap();
    }
}
