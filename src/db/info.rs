// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::snapshot::FreelistEntry;

/// Introspection requests, each carrying its typed parameters.
#[derive(Clone, Debug)]
pub enum Info {
    /// Number of keys written through this connection.
    NWrite,

    /// Number of keys read through this connection.
    NRead,

    /// A textual description of the level/segment structure.
    DbStructure,

    /// The block layout of the segment starting at the given page.
    ArrayStructure {
        /// First page of the segment.
        first_page: u64,
    },

    /// Every page id of the segment starting at the given page.
    ArrayPages {
        /// First page of the segment.
        first_page: u64,
    },

    /// The three log regions and the current append offset.
    LogStructure,

    /// Printable dump of one page's cells.
    PageAsciiDump {
        /// Page id.
        page: u64,
    },

    /// Hex dump of one page's cells.
    PageHexDump {
        /// Page id.
        page: u64,
    },

    /// The current free-block list.
    Freelist,

    /// KiB of work accumulated since the last checkpoint.
    CheckpointSize,

    /// Bytes held by the old and live in-memory trees.
    TreeSize,

    /// The compression scheme id persisted in the newest snapshot.
    CompressionId,
}

/// Typed responses to [`Info`] requests.
#[derive(Clone, Debug, PartialEq)]
pub enum InfoValue {
    /// A simple counter.
    Count(u64),

    /// A human-readable description.
    Text(String),

    /// A list of page ids.
    Pages(Vec<u64>),

    /// The free-block list.
    Freelist(Vec<FreelistEntry>),

    /// Old-tree and live-tree byte counts.
    TreeSize {
        /// Bytes referenced by the tree pending flush.
        old: u64,
        /// Bytes referenced by the live tree.
        live: u64,
    },

    /// A size in KiB.
    KiB(u64),

    /// A numeric id.
    Id(u32),
}
