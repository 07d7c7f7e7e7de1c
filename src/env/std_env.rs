// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(unsafe_code)]

use super::{Env, EnvFile, MapView};
use crate::error::{Error, Result};
use fs2::FileExt as _;
use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::Arc,
    time::Duration,
};

/// The default environment: `std::fs` files, `fs2` advisory locks and
/// `memmap2` read maps.
#[derive(Default)]
pub struct StdEnv;

struct StdFile {
    inner: File,
}

struct StdMap {
    mmap: memmap2::Mmap,
}

impl MapView for StdMap {
    fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt as _;

    let mut total = 0;
    while total < buf.len() {
        #[allow(clippy::indexing_slicing)]
        let n = file.read_at(&mut buf[total..], offset + total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt as _;

    let mut total = 0;
    while total < buf.len() {
        #[allow(clippy::indexing_slicing)]
        let n = file.seek_read(&mut buf[total..], offset + total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt as _;

    let mut total = 0;
    while total < data.len() {
        #[allow(clippy::indexing_slicing)]
        let n = file.seek_write(&data[total..], offset + total as u64)?;
        total += n;
    }
    Ok(())
}

impl EnvFile for StdFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(read_at(&self.inner, offset, buf)?)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        Ok(write_at(&self.inner, offset, data)?)
    }

    fn sync(&self) -> Result<()> {
        Ok(self.inner.sync_all()?)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.inner.set_len(len)?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn gate_lock(&self, exclusive: bool) -> Result<()> {
        let outcome = if exclusive {
            self.inner.try_lock_exclusive()
        } else {
            fs2::FileExt::try_lock_shared(&self.inner)
        };

        outcome.map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                Error::Busy
            } else {
                Error::Io(e)
            }
        })
    }

    fn gate_unlock(&self) -> Result<()> {
        Ok(self.inner.unlock()?)
    }

    fn map(&self, len: u64) -> Result<Option<Arc<dyn MapView>>> {
        if len == 0 {
            return Ok(None);
        }

        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .len(usize::try_from(len).map_err(|_| Error::Full)?)
                .map(&self.inner)?
        };

        Ok(Some(Arc::new(StdMap { mmap })))
    }
}

impl Env for StdEnv {
    fn open_file(&self, path: &Path, create: bool, readonly: bool) -> Result<Arc<dyn EnvFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(create && !readonly)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::IoNotFound(e)
                } else {
                    Error::CantOpen
                }
            })?;

        Ok(Arc::new(StdFile { inner: file }))
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
