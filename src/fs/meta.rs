// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{env::EnvFile, error::Result};
use std::sync::Arc;

/// Size of one meta page. Fixed regardless of the database page size.
pub const META_PAGE_SIZE: usize = 4096;

/// Bytes reserved at the head of the file for the two meta pages.
pub const META_REGION: u64 = 2 * META_PAGE_SIZE as u64;

/// Reads meta page `slot` (0 or 1). Short files read back as zeros.
pub fn read_meta(file: &Arc<dyn EnvFile>, slot: usize) -> Result<Vec<u8>> {
    debug_assert!(slot < 2);

    let mut buf = vec![0u8; META_PAGE_SIZE];
    let offset = (slot * META_PAGE_SIZE) as u64;

    // A fresh database may be shorter than the meta region; missing
    // bytes stay zero and fail the snapshot checksum downstream
    let _n = file.read_at(offset, &mut buf)?;
    Ok(buf)
}

/// Writes meta page `slot`, zero-padding to the full page.
pub fn write_meta(file: &Arc<dyn EnvFile>, slot: usize, data: &[u8]) -> Result<()> {
    debug_assert!(slot < 2);
    debug_assert!(data.len() <= META_PAGE_SIZE);

    let mut buf = vec![0u8; META_PAGE_SIZE];

    #[allow(clippy::indexing_slicing)]
    buf[..data.len()].copy_from_slice(data);

    file.write_at((slot * META_PAGE_SIZE) as u64, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env as _, MemEnv};
    use std::path::Path;
    use test_log::test;

    #[test]
    fn meta_pages_are_independent() -> crate::Result<()> {
        let env = MemEnv::new();
        let file = env.open_file(Path::new("db"), true, false)?;

        write_meta(&file, 0, b"first")?;
        write_meta(&file, 1, b"second")?;

        assert_eq!(b"first", &read_meta(&file, 0)?[..5]);
        assert_eq!(b"second", &read_meta(&file, 1)?[..6]);
        Ok(())
    }

    #[test]
    fn short_file_reads_zeros() -> crate::Result<()> {
        let env = MemEnv::new();
        let file = env.open_file(Path::new("db"), true, false)?;

        let meta = read_meta(&file, 1)?;
        assert!(meta.iter().all(|&b| b == 0));
        Ok(())
    }
}
