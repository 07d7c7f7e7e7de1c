// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Chunk 0: the shared header.
//!
//! Layout (offsets in bytes):
//!
//! ```text
//!     0 ..  256   tree header copy 1
//!   256 ..  512   tree header copy 2
//!   512           writer-active flag
//!   513           meta page in use (0 undecided, 1 or 2)
//!   520 ..  528   last checkpointed snapshot id
//!   528 ..  536   last checkpointed log offset
//!   576 ..  672   reader slots, 6 x {snapshot id: u64, shm id: u32, pad}
//!  1024 .. 5120   snapshot blob copy 1
//!  5120 .. 9216   snapshot blob copy 2
//! ```
//!
//! Writers update copy 2 first, issue a barrier, then copy 1; readers
//! try copy 1 and fall back to copy 2, so a torn write is never
//! observed by both.

use super::{ShmPtr, ShmRegion};
use crate::{
    checksum::PairChecksum,
    error::{Error, Result},
};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};

const HDR1_OFF: usize = 0;
const HDR2_OFF: usize = 256;
const WRITER_FLAG_OFF: usize = 512;
const META_PAGE_OFF: usize = 513;
const CKPT_ID_OFF: usize = 520;
const CKPT_LOG_OFF: usize = 528;
const READER_SLOTS_OFF: usize = 576;
const READER_SLOT_BYTES: usize = 16;
const SNAP1_OFF: usize = 1024;
const SNAP2_OFF: usize = 5120;

/// Maximum serialized snapshot blob size (shared with the meta pages).
pub const SNAPSHOT_BLOB_SIZE: usize = 4096;

/// Number of reader registration slots.
pub const NUM_READER_SLOTS: usize = crate::lock::NUM_READERS;

/// One version of the in-memory tree: root handle plus bookkeeping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeRoot {
    /// Root node handle, null for an empty tree.
    pub root: ShmPtr,

    /// Height of the tree (0 when empty).
    pub height: u32,

    /// Transaction id this version was committed at.
    pub txid: u64,

    /// Approximate bytes of arena data referenced by this version.
    pub byte_count: u64,
}

impl TreeRoot {
    /// Returns `true` if this version holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }
}

/// Snapshot of the log region layout carried in the tree header.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LogState {
    /// The three regions, `[R0, R1, R2]`; bytes append to R2.
    pub regions: [(u64, u64); 3],

    /// Running checksum state at the current append offset.
    pub cksum: (u32, u32),
}

/// The mutable core of the shared header, kept in two checksummed
/// copies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TreeHeader {
    /// The live tree.
    pub root: TreeRoot,

    /// The tree being flushed, if a flush is pending.
    pub old_root: TreeRoot,

    /// Sequence id of the chunk holding the boundary between old-tree
    /// and live-tree data.
    pub old_shmid: u32,

    /// Index of the oldest chunk still carrying live data.
    pub first_chunk: u32,

    /// Total chunks ever mapped (including chunk 0).
    pub chunk_count: u32,

    /// Current allocation cursor.
    pub write: ShmPtr,

    /// Sequence id the next appended/recycled chunk receives.
    pub next_shmid: u32,

    /// Sequence id of the oldest chunk referenced by the live or old
    /// tree; everything older is garbage once readers move past it.
    pub used_shmid: u32,

    /// Log region layout and running checksum.
    pub log: LogState,

    /// Log offset at the moment the old tree was set aside; a flush of
    /// that tree may checkpoint the log only up to here.
    pub old_log_offset: u64,

    /// Checksum state at `old_log_offset`.
    pub old_log_cksum: (u32, u32),

    /// Application cookie.
    pub user_version: u32,
}

/// Serialized size of a tree header including its two checksum words.
pub const TREE_HDR_BYTES: usize = 156;

impl TreeHeader {
    /// Serializes the header, appending the two checksum words.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TREE_HDR_BYTES);

        for root in [&self.root, &self.old_root] {
            buf.write_u32::<BigEndian>(root.root.raw()).expect("vec write");
            buf.write_u32::<BigEndian>(root.height).expect("vec write");
            buf.write_u64::<BigEndian>(root.txid).expect("vec write");
            buf.write_u64::<BigEndian>(root.byte_count).expect("vec write");
        }

        buf.write_u32::<BigEndian>(self.old_shmid).expect("vec write");
        buf.write_u32::<BigEndian>(self.first_chunk).expect("vec write");
        buf.write_u32::<BigEndian>(self.chunk_count).expect("vec write");
        buf.write_u32::<BigEndian>(self.write.raw()).expect("vec write");
        buf.write_u32::<BigEndian>(self.next_shmid).expect("vec write");
        buf.write_u32::<BigEndian>(self.used_shmid).expect("vec write");

        for (start, end) in self.log.regions {
            buf.write_u64::<BigEndian>(start).expect("vec write");
            buf.write_u64::<BigEndian>(end).expect("vec write");
        }
        buf.write_u32::<BigEndian>(self.log.cksum.0).expect("vec write");
        buf.write_u32::<BigEndian>(self.log.cksum.1).expect("vec write");

        buf.write_u64::<BigEndian>(self.old_log_offset).expect("vec write");
        buf.write_u32::<BigEndian>(self.old_log_cksum.0).expect("vec write");
        buf.write_u32::<BigEndian>(self.old_log_cksum.1).expect("vec write");

        buf.write_u32::<BigEndian>(self.user_version).expect("vec write");

        let (s0, s1) = PairChecksum::of(&buf);
        buf.write_u32::<BigEndian>(s0).expect("vec write");
        buf.write_u32::<BigEndian>(s1).expect("vec write");

        debug_assert_eq!(TREE_HDR_BYTES, buf.len());
        buf
    }

    /// Deserializes and checksum-verifies one header copy.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TREE_HDR_BYTES {
            return Err(Error::Corrupt("tree header truncated"));
        }

        #[allow(clippy::indexing_slicing)]
        let (body, cksum_bytes) = buf[..TREE_HDR_BYTES].split_at(TREE_HDR_BYTES - 8);

        let mut r = cksum_bytes;
        let want = (
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
        );
        if PairChecksum::of(body) != want {
            return Err(Error::Corrupt("tree header checksum mismatch"));
        }

        let mut r = body;
        let mut read_root = |r: &mut &[u8]| -> Result<TreeRoot> {
            Ok(TreeRoot {
                root: ShmPtr::from_raw(r.read_u32::<BigEndian>().map_err(Error::Io)?),
                height: r.read_u32::<BigEndian>().map_err(Error::Io)?,
                txid: r.read_u64::<BigEndian>().map_err(Error::Io)?,
                byte_count: r.read_u64::<BigEndian>().map_err(Error::Io)?,
            })
        };

        let root = read_root(&mut r)?;
        let old_root = read_root(&mut r)?;

        let old_shmid = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let first_chunk = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let chunk_count = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let write = ShmPtr::from_raw(r.read_u32::<BigEndian>().map_err(Error::Io)?);
        let next_shmid = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let used_shmid = r.read_u32::<BigEndian>().map_err(Error::Io)?;

        let mut regions = [(0u64, 0u64); 3];
        for region in &mut regions {
            region.0 = r.read_u64::<BigEndian>().map_err(Error::Io)?;
            region.1 = r.read_u64::<BigEndian>().map_err(Error::Io)?;
        }
        let cksum = (
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
        );

        let old_log_offset = r.read_u64::<BigEndian>().map_err(Error::Io)?;
        let old_log_cksum = (
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
        );

        let user_version = r.read_u32::<BigEndian>().map_err(Error::Io)?;

        Ok(Self {
            root,
            old_root,
            old_shmid,
            first_chunk,
            chunk_count,
            write,
            next_shmid,
            used_shmid,
            log: LogState { regions, cksum },
            old_log_offset,
            old_log_cksum,
            user_version,
        })
    }

    /// Loads the header from shared memory: copy 1 first, then copy 2.
    pub fn load(shm: &ShmRegion) -> Result<Self> {
        let mut buf = vec![0u8; TREE_HDR_BYTES];

        shm.read_bytes(0, HDR1_OFF, &mut buf)?;
        if let Ok(hdr) = Self::decode(&buf) {
            return Ok(hdr);
        }

        shm.read_bytes(0, HDR2_OFF, &mut buf)?;
        Self::decode(&buf)
    }

    /// Publishes the header: copy 2, barrier, copy 1.
    pub fn publish(&self, shm: &ShmRegion) -> Result<()> {
        let buf = self.encode();
        shm.write_bytes(0, HDR2_OFF, &buf)?;
        ShmRegion::barrier();
        shm.write_bytes(0, HDR1_OFF, &buf)
    }
}

/// Reads the writer-active flag.
pub fn writer_flag(shm: &ShmRegion) -> Result<bool> {
    let mut b = [0u8; 1];
    shm.read_bytes(0, WRITER_FLAG_OFF, &mut b)?;
    Ok(b[0] != 0)
}

/// Sets or clears the writer-active flag.
pub fn set_writer_flag(shm: &ShmRegion, active: bool) -> Result<()> {
    shm.write_bytes(0, WRITER_FLAG_OFF, &[u8::from(active)])
}

/// Reads which meta page holds the newest checkpoint (0 = undecided).
pub fn meta_page_in_use(shm: &ShmRegion) -> Result<u8> {
    let mut b = [0u8; 1];
    shm.read_bytes(0, META_PAGE_OFF, &mut b)?;
    Ok(b[0])
}

/// Records which meta page holds the newest checkpoint.
pub fn set_meta_page_in_use(shm: &ShmRegion, page: u8) -> Result<()> {
    shm.write_bytes(0, META_PAGE_OFF, &[page])
}

/// Reads `(snapshot id, log offset)` of the last durable checkpoint.
pub fn checkpoint_info(shm: &ShmRegion) -> Result<(u64, u64)> {
    Ok((shm.read_u64(0, CKPT_ID_OFF)?, shm.read_u64(0, CKPT_LOG_OFF)?))
}

/// Records the last durable checkpoint.
pub fn set_checkpoint_info(shm: &ShmRegion, snapshot_id: u64, log_offset: u64) -> Result<()> {
    shm.write_u64(0, CKPT_ID_OFF, snapshot_id)?;
    shm.write_u64(0, CKPT_LOG_OFF, log_offset)
}

/// Reads reader slot `i`: `(snapshot id, shm sequence id)`, or `None`
/// if the slot is vacant.
pub fn reader_slot(shm: &ShmRegion, i: usize) -> Result<Option<(u64, u32)>> {
    debug_assert!(i < NUM_READER_SLOTS);

    let off = READER_SLOTS_OFF + i * READER_SLOT_BYTES;
    let snapshot_id = shm.read_u64(0, off)?;
    let shm_id = shm.read_u32(0, off + 8)?;

    if snapshot_id == 0 {
        Ok(None)
    } else {
        Ok(Some((snapshot_id, shm_id)))
    }
}

/// Writes reader slot `i`.
pub fn set_reader_slot(
    shm: &ShmRegion,
    i: usize,
    value: Option<(u64, u32)>,
) -> Result<()> {
    debug_assert!(i < NUM_READER_SLOTS);

    let off = READER_SLOTS_OFF + i * READER_SLOT_BYTES;
    let (snapshot_id, shm_id) = value.unwrap_or((0, 0));
    shm.write_u64(0, off, snapshot_id)?;
    shm.write_u32(0, off + 8, shm_id)
}

/// Reads a snapshot blob: copy 1 first, then copy 2. The caller
/// verifies the embedded checksum and id.
pub fn snapshot_blobs(shm: &ShmRegion) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut blob1 = vec![0u8; SNAPSHOT_BLOB_SIZE];
    let mut blob2 = vec![0u8; SNAPSHOT_BLOB_SIZE];
    shm.read_bytes(0, SNAP1_OFF, &mut blob1)?;
    shm.read_bytes(0, SNAP2_OFF, &mut blob2)?;
    Ok((blob1, blob2))
}

/// Publishes a snapshot blob: copy 2, barrier, copy 1.
pub fn publish_snapshot_blob(shm: &ShmRegion, blob: &[u8]) -> Result<()> {
    if blob.len() > SNAPSHOT_BLOB_SIZE {
        return Err(Error::NoMem);
    }

    let mut padded = vec![0u8; SNAPSHOT_BLOB_SIZE];

    #[allow(clippy::indexing_slicing)]
    padded[..blob.len()].copy_from_slice(blob);

    shm.write_bytes(0, SNAP2_OFF, &padded)?;
    ShmRegion::barrier();
    shm.write_bytes(0, SNAP1_OFF, &padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample_header() -> TreeHeader {
        TreeHeader {
            root: TreeRoot {
                root: ShmPtr::new(1, 128),
                height: 3,
                txid: 42,
                byte_count: 9000,
            },
            old_root: TreeRoot::default(),
            old_shmid: 0,
            first_chunk: 1,
            chunk_count: 4,
            write: ShmPtr::new(3, 500),
            next_shmid: 4,
            used_shmid: 1,
            log: LogState {
                regions: [(0, 0), (0, 0), (0, 777)],
                cksum: (123, 456),
            },
            old_log_offset: 512,
            old_log_cksum: (9, 10),
            user_version: 7,
        }
    }

    #[test]
    fn header_round_trip() -> crate::Result<()> {
        let hdr = sample_header();
        let buf = hdr.encode();
        assert_eq!(TREE_HDR_BYTES, buf.len());
        assert_eq!(hdr, TreeHeader::decode(&buf)?);
        Ok(())
    }

    #[test]
    fn header_detects_corruption() {
        let hdr = sample_header();
        let mut buf = hdr.encode();
        buf[10] ^= 0xFF;
        assert!(TreeHeader::decode(&buf).is_err());
    }

    #[test]
    fn publish_and_load() -> crate::Result<()> {
        let shm = ShmRegion::new();
        let hdr = sample_header();
        hdr.publish(&shm)?;
        assert_eq!(hdr, TreeHeader::load(&shm)?);
        Ok(())
    }

    #[test]
    fn load_falls_back_to_copy_2() -> crate::Result<()> {
        let shm = ShmRegion::new();
        let hdr = sample_header();
        hdr.publish(&shm)?;

        // Tear copy 1
        shm.write_bytes(0, 0, &[0xAB; 16])?;
        assert_eq!(hdr, TreeHeader::load(&shm)?);
        Ok(())
    }

    #[test]
    fn reader_slots_round_trip() -> crate::Result<()> {
        let shm = ShmRegion::new();

        assert_eq!(None, reader_slot(&shm, 0)?);
        set_reader_slot(&shm, 0, Some((55, 9)))?;
        set_reader_slot(&shm, 5, Some((66, 2)))?;

        assert_eq!(Some((55, 9)), reader_slot(&shm, 0)?);
        assert_eq!(Some((66, 2)), reader_slot(&shm, 5)?);

        set_reader_slot(&shm, 0, None)?;
        assert_eq!(None, reader_slot(&shm, 0)?);
        Ok(())
    }
}
