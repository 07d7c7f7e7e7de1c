// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bump allocator over the chunk ring.
//!
//! Only the writer allocates. Aligned allocations never span a chunk
//! boundary; unaligned (bulk key/value) allocations may, in which case
//! the caller records a "spans chunks" bit so readers know to follow
//! the ring.

use super::{ChunkWriter, ShmPtr, ShmRegion, CHUNK_HDR, CHUNK_PAYLOAD_START, CHUNK_SIZE};
use crate::{
    error::{Error, Result},
    shm::header::TreeHeader,
};

/// Largest single aligned allocation.
pub const MAX_ALIGNED_ALLOC: usize = CHUNK_SIZE - CHUNK_HDR;

/// Writer-side allocator handle.
///
/// `recycle_floor` is the lowest shm sequence id still needed by any
/// registered reader; chunks with ids below both it and the header's
/// `used_shmid` are eligible for reuse.
pub struct Arena<'a> {
    shm: &'a ShmRegion,
    hdr: &'a mut TreeHeader,
    recycle_floor: u32,
}

impl<'a> Arena<'a> {
    /// Creates an allocator for the current write transaction.
    pub fn new(shm: &'a ShmRegion, hdr: &'a mut TreeHeader, recycle_floor: u32) -> Self {
        Self {
            shm,
            hdr,
            recycle_floor,
        }
    }

    /// Initializes an empty tree header over a fresh region.
    pub fn format(shm: &ShmRegion, hdr: &mut TreeHeader) -> Result<()> {
        shm.ensure_chunk(1);
        shm.set_chunk_links(1, 0, 1)?;

        hdr.first_chunk = 1;
        hdr.chunk_count = 2;
        hdr.write = ShmPtr::new(1, CHUNK_PAYLOAD_START);
        hdr.next_shmid = 2;
        hdr.used_shmid = 1;
        hdr.old_shmid = 0;
        Ok(())
    }

    /// The sequence id of the chunk currently being written.
    pub fn write_chunk_id(&self) -> Result<u32> {
        let (_next, id) = self.shm.chunk_links(self.hdr.write.chunk())?;
        Ok(id)
    }

    fn advance_chunk(&mut self) -> Result<u32> {
        let current = self.hdr.write.chunk();

        let oldest = self.hdr.first_chunk;
        let (oldest_next, oldest_id) = self.shm.chunk_links(oldest)?;

        let floor = self.recycle_floor.min(self.hdr.used_shmid);

        let next = if oldest_id < floor && oldest != current && oldest_next != 0 {
            // Recycle the oldest ring member
            self.hdr.first_chunk = oldest_next;
            oldest
        } else {
            // Map a fresh chunk (or re-adopt one left over from a
            // rolled-back transaction)
            let index = self.hdr.chunk_count;
            if u64::from(index) >= 1 << 17 {
                return Err(Error::NoMem);
            }
            self.shm.ensure_chunk(index as usize);
            self.hdr.chunk_count += 1;
            index
        };

        let id = self.hdr.next_shmid;
        self.hdr.next_shmid += 1;
        self.shm.set_chunk_links(next, 0, id)?;
        self.shm.set_chunk_links(
            current,
            next,
            self.shm.chunk_links(current)?.1,
        )?;

        self.hdr.write = ShmPtr::new(next, CHUNK_PAYLOAD_START);
        Ok(next)
    }

    /// Allocates `n` bytes.
    ///
    /// With `align8`, the result is 8-aligned and guaranteed contiguous
    /// (`n` must not exceed [`MAX_ALIGNED_ALLOC`]). Without it, the
    /// allocation may span chunks; the returned flag is `true` when the
    /// range is contiguous within one chunk.
    pub fn alloc(&mut self, n: usize, align8: bool) -> Result<(ShmPtr, bool)> {
        if align8 {
            debug_assert!(n <= MAX_ALIGNED_ALLOC);

            let aligned = (self.hdr.write.offset() + 7) & !7;
            if aligned + n > CHUNK_SIZE {
                self.advance_chunk()?;
            } else {
                self.hdr.write = ShmPtr::new(self.hdr.write.chunk(), aligned);
            }

            let ptr = self.hdr.write;
            self.hdr.write = ShmPtr::new(ptr.chunk(), ptr.offset() + n);
            self.hdr.root.byte_count += n as u64;
            return Ok((ptr, true));
        }

        if self.hdr.write.offset() >= CHUNK_SIZE {
            self.advance_chunk()?;
        }

        let ptr = self.hdr.write;
        let mut contiguous = true;
        let mut left = n;

        loop {
            let avail = CHUNK_SIZE - self.hdr.write.offset();
            if left <= avail {
                self.hdr.write =
                    ShmPtr::new(self.hdr.write.chunk(), self.hdr.write.offset() + left);
                break;
            }
            left -= avail;
            self.advance_chunk()?;
            contiguous = false;
        }

        self.hdr.root.byte_count += n as u64;
        Ok((ptr, contiguous))
    }

    /// Allocates and fills `n` bytes from `data`.
    pub fn alloc_bytes(&mut self, data: &[u8]) -> Result<(ShmPtr, bool)> {
        let (ptr, contiguous) = self.alloc(data.len(), false)?;
        let mut w = ChunkWriter::new(self.shm.clone(), ptr);
        w.write(data)?;
        Ok((ptr, contiguous))
    }

    /// The region this arena allocates from.
    pub fn shm(&self) -> &ShmRegion {
        self.shm
    }

    /// The header this arena updates.
    pub fn header(&mut self) -> &mut TreeHeader {
        self.hdr
    }
}

/// Rebuilds the chunk ring after a writer died mid-transaction: sorts
/// all data chunks by sequence id and relinks them in order.
pub fn rebuild_ring(shm: &ShmRegion, hdr: &TreeHeader) -> Result<(u32, u32)> {
    let mut chunks: Vec<(u32, u32)> = Vec::new();
    for index in 1..hdr.chunk_count {
        let (_next, id) = shm.chunk_links(index)?;
        chunks.push((id, index));
    }
    chunks.sort_unstable();

    for pair in chunks.windows(2) {
        #[allow(clippy::indexing_slicing)]
        let ((_, from), (_, to)) = (pair[0], pair[1]);
        let (_, id) = shm.chunk_links(from)?;
        shm.set_chunk_links(from, to, id)?;
    }

    let first = chunks.first().copied().ok_or(Error::Protocol)?;
    let last = chunks.last().copied().ok_or(Error::Protocol)?;
    let (_, last_id) = shm.chunk_links(last.1)?;
    shm.set_chunk_links(last.1, 0, last_id)?;

    Ok((first.1, last.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ChunkReader;
    use test_log::test;

    fn fresh() -> (ShmRegion, TreeHeader) {
        let shm = ShmRegion::new();
        let mut hdr = TreeHeader::default();
        Arena::format(&shm, &mut hdr).unwrap();
        (shm, hdr)
    }

    #[test]
    fn aligned_allocations_are_contiguous_and_aligned() -> crate::Result<()> {
        let (shm, mut hdr) = fresh();
        let mut arena = Arena::new(&shm, &mut hdr, u32::MAX);

        for _ in 0..100 {
            let (ptr, contiguous) = arena.alloc(48, true)?;
            assert!(contiguous);
            assert_eq!(0, ptr.offset() % 8);
            assert!(ptr.offset() + 48 <= CHUNK_SIZE);
        }
        Ok(())
    }

    #[test]
    fn large_unaligned_allocation_spans_chunks() -> crate::Result<()> {
        let (shm, mut hdr) = fresh();
        let mut arena = Arena::new(&shm, &mut hdr, u32::MAX);

        let data: Vec<u8> = (0..CHUNK_SIZE + 1000).map(|i| (i % 251) as u8).collect();
        let (ptr, contiguous) = arena.alloc_bytes(&data)?;
        assert!(!contiguous);

        let mut r = ChunkReader::new(shm.clone(), ptr);
        let mut out = vec![0u8; data.len()];
        r.read(&mut out)?;
        assert_eq!(data, out);

        assert!(hdr.chunk_count >= 3);
        Ok(())
    }

    #[test]
    fn chunk_ids_increase_monotonically() -> crate::Result<()> {
        let (shm, mut hdr) = fresh();
        let mut arena = Arena::new(&shm, &mut hdr, u32::MAX);

        for _ in 0..10 {
            arena.alloc(MAX_ALIGNED_ALLOC, true)?;
        }

        let mut index = hdr.first_chunk;
        let mut prev_id = 0;
        while index != 0 {
            let (next, id) = shm.chunk_links(index)?;
            assert!(id > prev_id);
            prev_id = id;
            index = next;
        }
        assert_eq!(hdr.next_shmid, prev_id + 1);
        Ok(())
    }

    #[test]
    fn recycling_respects_floor() -> crate::Result<()> {
        let (shm, mut hdr) = fresh();

        // Fill a few chunks while nothing may be recycled
        {
            let mut arena = Arena::new(&shm, &mut hdr, 0);
            for _ in 0..5 {
                arena.alloc(MAX_ALIGNED_ALLOC, true)?;
            }
        }
        let mapped_before = hdr.chunk_count;

        // Declare everything before the current chunk garbage
        hdr.used_shmid = hdr.next_shmid;
        {
            let mut arena = Arena::new(&shm, &mut hdr, u32::MAX);
            for _ in 0..3 {
                arena.alloc(MAX_ALIGNED_ALLOC, true)?;
            }
        }

        // Ring recycled in place of growing
        assert!(hdr.chunk_count <= mapped_before + 1);
        Ok(())
    }

    #[test]
    fn rebuild_ring_orders_by_id() -> crate::Result<()> {
        let (shm, mut hdr) = fresh();
        {
            let mut arena = Arena::new(&shm, &mut hdr, u32::MAX);
            for _ in 0..4 {
                arena.alloc(MAX_ALIGNED_ALLOC, true)?;
            }
        }

        // Scramble the links
        for index in 1..hdr.chunk_count {
            let (_, id) = shm.chunk_links(index)?;
            shm.set_chunk_links(index, 1, id)?;
        }

        let (first, _last) = rebuild_ring(&shm, &hdr)?;

        let mut index = first;
        let mut prev_id = 0;
        let mut seen = 0;
        while index != 0 {
            let (next, id) = shm.chunk_links(index)?;
            assert!(id > prev_id);
            prev_id = id;
            index = next;
            seen += 1;
        }
        assert_eq!(hdr.chunk_count - 1, seen);
        Ok(())
    }
}
