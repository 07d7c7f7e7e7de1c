// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Pluggable page compression.
//!
//! A database is either uncompressed (id 1) or bound to one compression
//! scheme for its whole life. The id is persisted in every checkpoint; a
//! connection whose configured hooks do not match is given one chance to
//! install matching hooks through its registered factory before
//! [`crate::Error::Mismatch`] is surfaced.

use crate::error::{Error, Result};
use std::sync::Arc;

/// Numeric id of a compression scheme.
///
/// `0` means "empty database, scheme not yet decided", `1` means
/// "no compression". Values above `1` identify user schemes.
pub type CompressionId = u32;

/// Id stored by databases that have never been checkpointed.
pub const COMPRESSION_EMPTY: CompressionId = 0;

/// Id of the identity (no-op) scheme.
pub const COMPRESSION_NONE: CompressionId = 1;

/// Id of the built-in LZ4 scheme.
#[cfg(feature = "lz4")]
pub const COMPRESSION_LZ4: CompressionId = 10241;

/// A compression scheme: bound/compress/uncompress plus a stable id.
pub trait Compressor: Send + Sync {
    /// Stable numeric id, persisted in checkpoints.
    fn id(&self) -> CompressionId;

    /// Upper bound on the compressed size of `n` input bytes.
    fn bound(&self, n: usize) -> usize;

    /// Compresses `src` into `dst`, returning the number of bytes written.
    ///
    /// `dst` is at least `bound(src.len())` bytes.
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Decompresses `src` into `dst`, which is exactly the original size.
    fn uncompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// Invoked when a database's compression id does not match the configured
/// scheme, so the caller can install matching hooks before the open fails.
pub type CompressionFactory = dyn Fn(CompressionId) -> Option<Arc<dyn Compressor>> + Send + Sync;

/// The identity scheme (id 1).
#[derive(Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn id(&self) -> CompressionId {
        COMPRESSION_NONE
    }

    fn bound(&self, n: usize) -> usize {
        n
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        dst.get_mut(..src.len())
            .ok_or(Error::Other("compress bound violated"))?
            .copy_from_slice(src);
        Ok(src.len())
    }

    fn uncompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        if src.len() != dst.len() {
            return Err(Error::Decompress(COMPRESSION_NONE));
        }
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// LZ4 block compression.
#[cfg(feature = "lz4")]
#[derive(Default)]
pub struct Lz4Compression;

#[cfg(feature = "lz4")]
impl Compressor for Lz4Compression {
    fn id(&self) -> CompressionId {
        COMPRESSION_LZ4
    }

    fn bound(&self, n: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(n)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        lz4_flex::block::compress_into(src, dst)
            .map_err(|_| Error::Other("lz4 compress failed"))
    }

    fn uncompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let n = lz4_flex::block::decompress_into(src, dst)
            .map_err(|_| Error::Decompress(COMPRESSION_LZ4))?;

        if n == dst.len() {
            Ok(())
        } else {
            Err(Error::Decompress(COMPRESSION_LZ4))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn identity_round_trip() -> crate::Result<()> {
        let c = NoCompression;
        let src = b"some page bytes";

        let mut dst = vec![0; c.bound(src.len())];
        let n = c.compress(src, &mut dst)?;
        assert_eq!(src.len(), n);

        let mut out = vec![0; src.len()];
        c.uncompress(&dst[..n], &mut out)?;
        assert_eq!(src.as_slice(), &*out);

        Ok(())
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn lz4_round_trip() -> crate::Result<()> {
        let c = Lz4Compression;
        let src = vec![42u8; 4096];

        let mut dst = vec![0; c.bound(src.len())];
        let n = c.compress(&src, &mut dst)?;
        assert!(n < src.len());

        let mut out = vec![0; src.len()];
        c.uncompress(&dst[..n], &mut out)?;
        assert_eq!(src, out);

        Ok(())
    }
}
