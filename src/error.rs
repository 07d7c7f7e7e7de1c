// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// A file that is required to exist could not be found
    IoNotFound(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A lock required by the operation is held by another connection
    Busy,

    /// An engine-imposed resource ceiling was hit
    NoMem,

    /// Write attempted through a read-only connection
    ReadOnly,

    /// On-disk or shared-memory state failed a checksum or invariant check
    Corrupt(&'static str),

    /// The database file cannot grow any further
    Full,

    /// The database file could not be opened
    CantOpen,

    /// Another connection left shared state in a shape this version
    /// does not understand
    Protocol,

    /// API contract violated by the caller
    Misuse(&'static str),

    /// The database was written with a different compression scheme
    /// than the one configured on this connection
    Mismatch {
        /// Compression id found in the database header
        db: u32,
        /// Compression id of the configured hooks
        configured: u32,
    },

    /// Decompression failed
    Decompress(u32),

    /// Unspecified internal error
    Other(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LsmError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::NotFound {
            Self::IoNotFound(value)
        } else {
            Self::Io(value)
        }
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;
