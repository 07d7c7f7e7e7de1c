// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Capability layer between the engine and the operating system.
//!
//! Everything the engine needs from its host - files, advisory locks,
//! memory maps, sleeping - goes through the [`Env`] trait, injected at
//! construction. Production uses [`StdEnv`]; tests use [`MemEnv`], which
//! keeps all "files" in process memory and can simulate crashes by
//! dropping unsynced writes.

mod mem;
mod std_env;

pub use mem::MemEnv;
pub use std_env::StdEnv;

use crate::error::Result;
use std::{path::Path, sync::Arc, time::Duration};

/// A read-only view over a file prefix, produced by [`EnvFile::map`].
pub trait MapView: Send + Sync {
    /// The mapped bytes.
    fn bytes(&self) -> &[u8];
}

/// An open file handle.
///
/// All positioned I/O takes `&self`; implementations are internally
/// synchronized.
pub trait EnvFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; reads past end-of-file return fewer bytes (possibly 0).
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes all of `data` at `offset`, extending the file if needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Durably persists previously written data.
    fn sync(&self) -> Result<()>;

    /// Truncates (or extends, zero-filled) the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;

    /// Returns `true` if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Size of a durable sector on the underlying device.
    fn sector_size(&self) -> usize {
        512
    }

    /// Takes the cross-process gate lock, shared or exclusive.
    ///
    /// Returns `Err(Busy)` when another process holds a conflicting lock.
    fn gate_lock(&self, exclusive: bool) -> Result<()>;

    /// Releases the cross-process gate lock.
    fn gate_unlock(&self) -> Result<()>;

    /// Maps the first `len` bytes of the file, if the environment
    /// supports mapping. `None` means the caller must fall back to
    /// `read_at`.
    fn map(&self, len: u64) -> Result<Option<Arc<dyn MapView>>>;
}

/// The capability bundle injected into every [`crate::Database`].
pub trait Env: Send + Sync {
    /// Opens (or creates) a file.
    fn open_file(&self, path: &Path, create: bool, readonly: bool) -> Result<Arc<dyn EnvFile>>;

    /// Removes a file. Missing files are not an error.
    fn unlink(&self, path: &Path) -> Result<()>;

    /// Returns `true` if a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Suspends the calling thread.
    fn sleep(&self, duration: Duration);
}
