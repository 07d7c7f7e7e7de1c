// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, ordered key-value storage engine built on a log-structured
//! merge tree.
//!
//! ##### About
//!
//! This crate exports a [`Database`] handle over a single database file.
//! Writes land in a shared in-memory B-tree and a write-ahead log; the tree
//! is periodically flushed into immutable on-disk sorted runs ("segments")
//! which are merged into deeper levels by [`Database::work`]. Readers open
//! consistent snapshots and never block the writer.
//!
//! Keys and values are arbitrary byte strings. Point lookups, ordered
//! iteration (forward and backward), point deletes and range deletes are
//! supported, as are nested transactions.
//!
//! Multiple handles on the same path within one process share their
//! in-memory state through a process-wide registry, so writers, workers and
//! checkpointers on different threads coordinate exactly like separate
//! connections.
//!
//! # Example usage
//!
//! ```
//! use lsm_engine::{Database, Options};
//! #
//! # let dir = tempfile::tempdir()?;
//! # let path = dir.path().join("db.lsm");
//!
//! let db = Database::open(&path, Options::default())?;
//!
//! db.insert(b"my_key", b"my_value")?;
//!
//! let item = db.get(b"my_key")?;
//! assert_eq!(Some(b"my_value".as_slice().into()), item);
//!
//! // Ordered iteration over a cursor
//! let mut cursor = db.cursor()?;
//! cursor.first()?;
//! while cursor.valid() {
//!     let _key = cursor.key()?;
//!     let _value = cursor.value()?;
//!     cursor.next()?;
//! }
//!
//! // Ranged deletes are first-class
//! db.delete_range(b"a", b"z")?;
//!
//! // Flush the in-memory tree into a new segment, then fold
//! // segments together and persist a checkpoint
//! db.flush()?;
//! db.work(2, 512)?;
//! db.checkpoint()?;
//! #
//! # Ok::<(), lsm_engine::Error>(())
//! ```

#![deny(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod checkpoint;
mod checksum;
mod coding;

#[doc(hidden)]
pub mod compress;

mod db;

#[doc(hidden)]
pub mod env;

mod error;

#[doc(hidden)]
pub mod fs;

mod lock;

#[doc(hidden)]
pub mod log_file;

#[doc(hidden)]
pub mod merge;

#[doc(hidden)]
pub mod multi_cursor;

mod registry;

#[doc(hidden)]
pub mod segment;

#[doc(hidden)]
pub mod shm;

mod slice;

#[doc(hidden)]
pub mod snapshot;

#[doc(hidden)]
pub mod tree;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (Slice, Slice);

#[doc(hidden)]
pub use {
    checksum::PairChecksum,
    shm::ShmPtr,
    snapshot::{Level, Segment, Snapshot},
    tree::entry::EntryFlags,
};

pub use {
    coding::{DecodeError, EncodeError},
    compress::{CompressionId, Compressor},
    db::{
        config::{Options, SafetyLevel},
        cursor::{Cursor, SeekMode},
        info::{Info, InfoValue},
        Database,
    },
    env::Env,
    error::{Error, Result},
    slice::Slice,
};
