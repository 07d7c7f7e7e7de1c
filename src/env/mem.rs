// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Env, EnvFile, MapView};
use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

/// An in-memory environment for tests.
///
/// "Files" are byte vectors living in a shared table, so several handles
/// opened through the same `MemEnv` see the same data. Each file keeps a
/// durable copy alongside its live copy; [`MemEnv::crash`] rolls every
/// file back to its last-synced state, which is how the recovery tests
/// simulate a process kill.
pub struct MemEnv {
    files: Arc<Mutex<FxHashMap<PathBuf, Arc<MemFileData>>>>,
    sector_size: usize,
}

struct MemFileData {
    live: Mutex<Vec<u8>>,
    synced: Mutex<Vec<u8>>,
    gate: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    shared: usize,
    exclusive: bool,
}

struct MemFile {
    data: Arc<MemFileData>,
    sector_size: usize,
}

impl Default for MemEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEnv {
    /// Creates an empty in-memory environment with 512-byte sectors.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(FxHashMap::default())),
            sector_size: 512,
        }
    }

    /// Creates an environment reporting the given sector size.
    #[must_use]
    pub fn with_sector_size(sector_size: usize) -> Self {
        Self {
            files: Arc::new(Mutex::new(FxHashMap::default())),
            sector_size,
        }
    }

    /// Returns a handle sharing this environment's file table.
    #[must_use]
    pub fn share(&self) -> Self {
        Self {
            files: self.files.clone(),
            sector_size: self.sector_size,
        }
    }

    /// Discards every byte written since the last `sync` on each file,
    /// simulating an abrupt process kill.
    #[allow(clippy::expect_used)]
    pub fn crash(&self) {
        let files = self.files.lock().expect("lock poisoned");
        for data in files.values() {
            let synced = data.synced.lock().expect("lock poisoned").clone();
            *data.live.lock().expect("lock poisoned") = synced;
            *data.gate.lock().expect("lock poisoned") = GateState::default();
        }
    }
}

#[allow(clippy::expect_used)]
impl EnvFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let live = self.data.live.lock().expect("lock poisoned");
        let offset = usize::try_from(offset).map_err(|_| Error::Full)?;

        if offset >= live.len() {
            return Ok(0);
        }

        let n = buf.len().min(live.len() - offset);

        #[allow(clippy::indexing_slicing)]
        buf[..n].copy_from_slice(&live[offset..offset + n]);

        Ok(n)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut live = self.data.live.lock().expect("lock poisoned");
        let offset = usize::try_from(offset).map_err(|_| Error::Full)?;
        let end = offset + data.len();

        if live.len() < end {
            live.resize(end, 0);
        }

        #[allow(clippy::indexing_slicing)]
        live[offset..end].copy_from_slice(data);

        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let live = self.data.live.lock().expect("lock poisoned").clone();
        *self.data.synced.lock().expect("lock poisoned") = live;
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut live = self.data.live.lock().expect("lock poisoned");
        let len = usize::try_from(len).map_err(|_| Error::Full)?;
        live.resize(len, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.live.lock().expect("lock poisoned").len() as u64)
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn gate_lock(&self, exclusive: bool) -> Result<()> {
        let mut gate = self.data.gate.lock().expect("lock poisoned");

        if exclusive {
            if gate.exclusive || gate.shared > 0 {
                return Err(Error::Busy);
            }
            gate.exclusive = true;
        } else {
            if gate.exclusive {
                return Err(Error::Busy);
            }
            gate.shared += 1;
        }

        Ok(())
    }

    fn gate_unlock(&self) -> Result<()> {
        let mut gate = self.data.gate.lock().expect("lock poisoned");

        if gate.exclusive {
            gate.exclusive = false;
        } else {
            gate.shared = gate.shared.saturating_sub(1);
        }

        Ok(())
    }

    fn map(&self, _len: u64) -> Result<Option<Arc<dyn MapView>>> {
        // In-memory files have no useful mapping; callers fall back to read_at
        Ok(None)
    }
}

#[allow(clippy::expect_used)]
impl Env for MemEnv {
    fn open_file(&self, path: &Path, create: bool, _readonly: bool) -> Result<Arc<dyn EnvFile>> {
        let mut files = self.files.lock().expect("lock poisoned");

        let data = if let Some(data) = files.get(path) {
            data.clone()
        } else {
            if !create {
                return Err(Error::IoNotFound(std::io::Error::from(
                    std::io::ErrorKind::NotFound,
                )));
            }

            let data = Arc::new(MemFileData {
                live: Mutex::new(Vec::new()),
                synced: Mutex::new(Vec::new()),
                gate: Mutex::new(GateState::default()),
            });
            files.insert(path.to_path_buf(), data.clone());
            data
        };

        Ok(Arc::new(MemFile {
            data,
            sector_size: self.sector_size,
        }))
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        self.files.lock().expect("lock poisoned").remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("lock poisoned").contains_key(path)
    }

    fn sleep(&self, _duration: Duration) {
        // Tests never want real sleeps; lock retries just spin
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn mem_env_crash_discards_unsynced() -> crate::Result<()> {
        let env = MemEnv::new();
        let file = env.open_file(Path::new("x"), true, false)?;

        file.write_at(0, b"durable")?;
        file.sync()?;
        file.write_at(0, b"volatile")?;

        env.crash();

        let file = env.open_file(Path::new("x"), false, false)?;
        let mut buf = [0u8; 7];
        assert_eq!(7, file.read_at(0, &mut buf)?);
        assert_eq!(b"durable", &buf);

        Ok(())
    }

    #[test]
    fn mem_env_gate_conflicts() -> crate::Result<()> {
        let env = MemEnv::new();
        let a = env.open_file(Path::new("x"), true, false)?;
        let b = env.open_file(Path::new("x"), false, false)?;

        a.gate_lock(false)?;
        assert!(matches!(b.gate_lock(true), Err(Error::Busy)));
        b.gate_lock(false)?;

        a.gate_unlock()?;
        b.gate_unlock()?;
        b.gate_lock(true)?;

        Ok(())
    }
}
