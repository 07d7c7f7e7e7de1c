// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The shared-memory region backing the in-memory tree.
//!
//! The region is a growable set of fixed-size chunks. Chunk 0 is the
//! shared header (dual tree headers, dual snapshot blobs, the writer
//! flag and the reader slots); chunks 1.. hold tree nodes and entry
//! data, linked into a ring ordered by monotonically increasing
//! sequence ids so the oldest chunk can be recycled once no reader
//! needs it.

pub mod arena;
pub mod header;

use crate::error::{Error, Result};
use std::sync::{Arc, RwLock};

/// Size of one shared-memory chunk.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Bytes reserved at the start of every data chunk for
/// `{next_chunk: u32, sequence_id: u32}`.
pub const CHUNK_HDR: usize = 8;

/// First usable payload offset within a data chunk.
pub const CHUNK_PAYLOAD_START: usize = CHUNK_HDR;

const OFFSET_BITS: u32 = 15;
const OFFSET_MASK: u32 = (1 << OFFSET_BITS) - 1;

/// A tagged handle into the shared-memory region:
/// 17 bits of chunk index, 15 bits of within-chunk offset.
///
/// The all-zero value is the null handle (chunk 0 holds no tree data).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ShmPtr(u32);

impl ShmPtr {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Builds a handle from chunk index and offset.
    #[must_use]
    pub fn new(chunk: u32, offset: usize) -> Self {
        debug_assert!(chunk < (1 << 17));
        debug_assert!(offset < CHUNK_SIZE);

        #[allow(clippy::cast_possible_truncation)]
        Self((chunk << OFFSET_BITS) | (offset as u32 & OFFSET_MASK))
    }

    /// The chunk index.
    #[must_use]
    pub fn chunk(self) -> u32 {
        self.0 >> OFFSET_BITS
    }

    /// The byte offset within the chunk.
    #[must_use]
    pub fn offset(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }

    /// Returns `true` for the null handle.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw 32-bit representation.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuilds a handle from its raw representation.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

type Chunk = Arc<RwLock<Box<[u8]>>>;

/// Handle on the chunk set of one database. Cheap to clone; all clones
/// see the same chunks.
#[derive(Clone)]
pub struct ShmRegion {
    chunks: Arc<RwLock<Vec<Chunk>>>,
}

impl Default for ShmRegion {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)]
impl ShmRegion {
    /// Creates a region holding only the (zeroed) header chunk.
    #[must_use]
    pub fn new() -> Self {
        let chunk0: Chunk = Arc::new(RwLock::new(vec![0; CHUNK_SIZE].into_boxed_slice()));
        Self {
            chunks: Arc::new(RwLock::new(vec![chunk0])),
        }
    }

    /// Number of chunks currently mapped.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().expect("lock poisoned").len()
    }

    /// Grows the region so that `index` is mapped.
    pub fn ensure_chunk(&self, index: usize) {
        let mut chunks = self.chunks.write().expect("lock poisoned");
        while chunks.len() <= index {
            chunks.push(Arc::new(RwLock::new(
                vec![0; CHUNK_SIZE].into_boxed_slice(),
            )));
        }
    }

    fn chunk(&self, index: usize) -> Result<Chunk> {
        self.chunks
            .read()
            .expect("lock poisoned")
            .get(index)
            .cloned()
            .ok_or(Error::Protocol)
    }

    /// Copies `buf.len()` bytes out of one chunk.
    pub fn read_bytes(&self, chunk: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let chunk = self.chunk(chunk as usize)?;
        let data = chunk.read().expect("lock poisoned");

        let src = data
            .get(offset..offset + buf.len())
            .ok_or(Error::Corrupt("shm read out of chunk bounds"))?;

        buf.copy_from_slice(src);
        Ok(())
    }

    /// Copies `data` into one chunk.
    pub fn write_bytes(&self, chunk: u32, offset: usize, data: &[u8]) -> Result<()> {
        let chunk = self.chunk(chunk as usize)?;
        let mut dst = chunk.write().expect("lock poisoned");

        dst.get_mut(offset..offset + data.len())
            .ok_or(Error::Corrupt("shm write out of chunk bounds"))?
            .copy_from_slice(data);

        Ok(())
    }

    /// Reads a big-endian u32 from a chunk.
    pub fn read_u32(&self, chunk: u32, offset: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(chunk, offset, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Writes a big-endian u32 into a chunk.
    pub fn write_u32(&self, chunk: u32, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(chunk, offset, &value.to_be_bytes())
    }

    /// Reads a big-endian u64 from a chunk.
    pub fn read_u64(&self, chunk: u32, offset: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(chunk, offset, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Writes a big-endian u64 into a chunk.
    pub fn write_u64(&self, chunk: u32, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(chunk, offset, &value.to_be_bytes())
    }

    /// Reads the `{next, id}` header of a data chunk.
    pub fn chunk_links(&self, chunk: u32) -> Result<(u32, u32)> {
        let next = self.read_u32(chunk, 0)?;
        let id = self.read_u32(chunk, 4)?;
        Ok((next, id))
    }

    /// Writes the `{next, id}` header of a data chunk.
    pub fn set_chunk_links(&self, chunk: u32, next: u32, id: u32) -> Result<()> {
        self.write_u32(chunk, 0, next)?;
        self.write_u32(chunk, 4, id)
    }

    /// Full memory barrier, issued between writing `hdr2` and `hdr1`.
    pub fn barrier() {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Streams bytes out of the region starting at `ptr`, following the
/// chunk ring across chunk boundaries.
pub struct ChunkReader {
    shm: ShmRegion,
    chunk: u32,
    offset: usize,
}

impl ChunkReader {
    /// Positions a reader at `ptr`.
    #[must_use]
    pub fn new(shm: ShmRegion, ptr: ShmPtr) -> Self {
        Self {
            shm,
            chunk: ptr.chunk(),
            offset: ptr.offset(),
        }
    }

    fn hop(&mut self) -> Result<()> {
        let (next, _id) = self.shm.chunk_links(self.chunk)?;
        if next == 0 {
            return Err(Error::Corrupt("entry data runs off the chunk ring"));
        }
        self.chunk = next;
        self.offset = CHUNK_PAYLOAD_START;
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            if self.offset >= CHUNK_SIZE {
                self.hop()?;
            }
            let n = (buf.len() - done).min(CHUNK_SIZE - self.offset);

            #[allow(clippy::indexing_slicing)]
            self.shm
                .read_bytes(self.chunk, self.offset, &mut buf[done..done + n])?;

            self.offset += n;
            done += n;
        }
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(&mut b)?;
        Ok(b[0])
    }

    /// Reads an unsigned LEB128 varint.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::Corrupt("varint overflow in shm entry"));
            }
        }
    }
}

/// Streams bytes into the region starting at `ptr`, following the chunk
/// ring. The chunks must have been reserved by the arena beforehand.
pub struct ChunkWriter {
    shm: ShmRegion,
    chunk: u32,
    offset: usize,
}

impl ChunkWriter {
    /// Positions a writer at `ptr`.
    #[must_use]
    pub fn new(shm: ShmRegion, ptr: ShmPtr) -> Self {
        Self {
            shm,
            chunk: ptr.chunk(),
            offset: ptr.offset(),
        }
    }

    fn hop(&mut self) -> Result<()> {
        let (next, _id) = self.shm.chunk_links(self.chunk)?;
        if next == 0 {
            return Err(Error::Corrupt("entry data runs off the chunk ring"));
        }
        self.chunk = next;
        self.offset = CHUNK_PAYLOAD_START;
        Ok(())
    }

    /// Writes all of `data`.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            if self.offset >= CHUNK_SIZE {
                self.hop()?;
            }
            let n = (data.len() - done).min(CHUNK_SIZE - self.offset);

            #[allow(clippy::indexing_slicing)]
            self.shm
                .write_bytes(self.chunk, self.offset, &data[done..done + n])?;

            self.offset += n;
            done += n;
        }
        Ok(())
    }

    /// Writes an unsigned LEB128 varint, returning its encoded length.
    pub fn write_varint(&mut self, mut value: u64) -> Result<usize> {
        let mut buf = [0u8; 10];
        let mut n = 0;
        loop {
            #[allow(clippy::indexing_slicing)]
            {
                buf[n] = (value & 0x7F) as u8;
            }
            value >>= 7;
            if value != 0 {
                #[allow(clippy::indexing_slicing)]
                {
                    buf[n] |= 0x80;
                }
                n += 1;
            } else {
                n += 1;
                break;
            }
        }

        #[allow(clippy::indexing_slicing)]
        self.write(&buf[..n])?;
        Ok(n)
    }
}

/// Encoded length of a varint.
#[must_use]
pub fn varint_len(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn shm_ptr_round_trip() {
        let ptr = ShmPtr::new(1234, 567);
        assert_eq!(1234, ptr.chunk());
        assert_eq!(567, ptr.offset());
        assert!(!ptr.is_null());
        assert_eq!(ptr, ShmPtr::from_raw(ptr.raw()));
    }

    #[test]
    fn null_ptr() {
        assert!(ShmPtr::NULL.is_null());
        assert_eq!(0, ShmPtr::NULL.chunk());
        assert_eq!(0, ShmPtr::NULL.offset());
    }

    #[test]
    fn chunk_reader_spans_chunks() -> crate::Result<()> {
        let shm = ShmRegion::new();
        shm.ensure_chunk(2);
        shm.set_chunk_links(1, 2, 1)?;
        shm.set_chunk_links(2, 0, 2)?;

        // Write 16 bytes straddling the chunk 1 -> chunk 2 boundary
        let start = CHUNK_SIZE - 6;
        let mut w = ChunkWriter::new(shm.clone(), ShmPtr::new(1, start));
        w.write(b"0123456789abcdef")?;

        let mut r = ChunkReader::new(shm, ShmPtr::new(1, start));
        let mut buf = [0u8; 16];
        r.read(&mut buf)?;
        assert_eq!(b"0123456789abcdef", &buf);

        Ok(())
    }

    #[test]
    fn varint_round_trip_across_boundary() -> crate::Result<()> {
        let shm = ShmRegion::new();
        shm.ensure_chunk(2);
        shm.set_chunk_links(1, 2, 1)?;
        shm.set_chunk_links(2, 0, 2)?;

        let start = CHUNK_SIZE - 1;
        let mut w = ChunkWriter::new(shm.clone(), ShmPtr::new(1, start));
        w.write_varint(3_000_000_000)?;

        let mut r = ChunkReader::new(shm, ShmPtr::new(1, start));
        assert_eq!(3_000_000_000, r.read_varint()?);
        assert_eq!(varint_len(3_000_000_000), 5);

        Ok(())
    }
}
