// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Iteration over a segment's separator B-tree.
//!
//! Used by structure dumps and the self-check that every separator is
//! a strictly increasing subsequence of the segment's keys, each
//! paired with the page holding that key.

use super::cursor::SegCursor;
use crate::{error::Result, slice::Slice};

/// A separator paired with the page it leads to.
#[derive(Clone, Debug)]
pub struct SeparatorEntry {
    /// The separator key.
    pub key: Slice,

    /// Topic of the key.
    pub topic: u8,

    /// Page whose first covered key is `key`.
    pub child: u64,
}

/// Collects every separator of the segment's B-tree in key order,
/// resolving indirect references.
///
/// Returns an empty list for segments without a B-tree root.
pub fn separators(csr: &SegCursor) -> Result<Vec<SeparatorEntry>> {
    let root = csr.segment().root;
    if root == 0 {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    walk(csr, root, &mut out)?;
    Ok(out)
}

fn walk(csr: &SegCursor, page: u64, out: &mut Vec<SeparatorEntry>) -> Result<()> {
    let view = csr.read_view(page)?;
    if !view.is_btree() {
        return Ok(());
    }

    // In-order: leftmost child, then (separator, child) pairs
    walk(csr, view.base_ptr(), out)?;

    for i in 0..view.ncell() {
        let cell = view.btree_cell(i)?;
        let key = csr.btree_key(&cell.key)?;
        out.push(SeparatorEntry {
            key,
            topic: cell.flags.topic(),
            child: cell.child,
        });
        walk(csr, cell.child, out)?;
    }
    Ok(())
}
