// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Meta-page checkpointing.
//!
//! The two 4 KiB meta pages at the head of the file are written
//! alternately; recovery picks whichever holds the verifying snapshot
//! with the larger id, so a torn checkpoint write can never take the
//! database backwards.

use crate::{
    env::EnvFile,
    error::Result,
    fs::meta::{read_meta, write_meta},
    snapshot::Snapshot,
};
use std::sync::Arc;

/// Reads both meta pages and returns the newest verifying snapshot and
/// the slot it came from. `None` means the database is effectively
/// empty.
pub fn read_newest(file: &Arc<dyn EnvFile>) -> Result<Option<(Snapshot, usize)>> {
    let mut best: Option<(Snapshot, usize)> = None;

    for slot in 0..2 {
        let blob = read_meta(file, slot)?;
        if let Ok(snapshot) = Snapshot::decode(&blob) {
            let newer = best
                .as_ref()
                .is_none_or(|(existing, _)| snapshot.id > existing.id);
            if newer {
                best = Some((snapshot, slot));
            }
        }
    }

    Ok(best)
}

/// Writes `blob` to meta slot `slot` and syncs it down.
///
/// The caller must already have synced the data pages the snapshot
/// references; the order (data, then meta) is what makes the
/// checkpoint atomic.
pub fn write_checkpoint(file: &Arc<dyn EnvFile>, slot: usize, blob: &[u8]) -> Result<()> {
    log::debug!("checkpoint: writing meta page {slot} ({} bytes)", blob.len());
    write_meta(file, slot, blob)?;
    file.sync()
}
