// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Snapshots: the logical description of the on-disk database.
//!
//! A snapshot names every level (and the merge in progress into it, if
//! any), the append points, the free-block list and the block
//! redirects, plus the log offset it was taken at. Serialized as an
//! array of big-endian 32-bit words it must fit one 4 KiB meta page;
//! when the level list overflows, the tail levels are stored in the
//! LSM itself under a system key and the blob keeps only the top.

use crate::{
    checksum::PairChecksum,
    error::{Error, Result},
    fs::{FileSystem, META_PAGE_SIZE},
};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};

/// Hard ceiling on the serialized snapshot: 1024 words.
pub const SNAPSHOT_MAX_WORDS: usize = META_PAGE_SIZE / 4;

/// Maximum entries in the block-redirect table.
pub const MAX_REDIRECTS: usize = 16;

/// An immutable sorted run on disk.
///
/// Pages are identified by page number (uncompressed) or byte offset
/// (compressed); `root` is the separator B-tree root, 0 if none.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    /// First page of the run.
    pub first: u64,

    /// Last page of the run.
    pub last: u64,

    /// Root page of the per-segment B-tree (0 = none).
    pub root: u64,

    /// Size in pages.
    pub size: u64,
}

impl Segment {
    /// Returns `true` for the all-zero placeholder.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first == 0
    }
}

/// Cursor position inside a segment: (page id, cell index).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MergeInput {
    /// Page id.
    pub page: u64,

    /// Cell within the page.
    pub cell: u32,
}

/// State of a merge in progress, persisted so a later worker pass can
/// resume where the last one paused.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergeState {
    /// Per-input resume positions, in component order.
    pub inputs: Vec<MergeInput>,

    /// Inputs already fully consumed and gobbled.
    pub skip: u32,

    /// Where the composite level splits between LHS and RHS keys.
    pub split: MergeInput,

    /// Current end of the output run.
    pub output: u64,
}

/// One level of the LSM: a left-hand segment plus the right-hand
/// segments currently being merged into it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Level {
    /// Generation counter, incremented by merges.
    pub age: u16,

    /// Reserved flag bits.
    pub flags: u16,

    /// The level's own run.
    pub lhs: Segment,

    /// Runs being merged into this level (empty once the merge
    /// finishes).
    pub rhs: Vec<Segment>,

    /// Merge bookkeeping; present exactly when `rhs` is non-empty.
    pub merge: Option<MergeState>,
}

/// A freed block and the snapshot at which it was freed (-1 when the
/// entry is a bare insert).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FreelistEntry {
    /// Block number.
    pub block: u32,

    /// Snapshot id at which the block became free.
    pub id: i64,
}

/// A consistent description of the entire on-disk database.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Monotonically increasing snapshot id.
    pub id: u64,

    /// Compression scheme id (0 = empty database, 1 = none).
    pub compression_id: u32,

    /// Levels, newest first.
    pub levels: Vec<Level>,

    /// Log offset this snapshot captures.
    pub log_offset: u64,

    /// Flipped on every serialization so the stored field always
    /// changes, even when the log is disabled.
    pub log_offset_toggle: bool,

    /// Log checksum state at `log_offset`.
    pub log_cksum: (u32, u32),

    /// Block redirects (from, to), at most [`MAX_REDIRECTS`].
    pub redirects: Vec<(u32, u32)>,

    /// Total blocks in the file.
    pub block_count: u32,

    /// Positions where a new segment may start writing.
    pub append_points: [u64; 4],

    /// Free blocks.
    pub freelist: Vec<FreelistEntry>,

    /// Cumulative page writes.
    pub page_writes: u64,

    /// Page size the database was created with.
    pub page_size: u32,

    /// Block size the database was created with.
    pub block_size: u32,
}

impl Snapshot {
    /// The snapshot of a fresh, empty database.
    #[must_use]
    pub fn initial(page_size: u32, block_size: u32) -> Self {
        Self {
            id: 1,
            compression_id: 0,
            levels: Vec::new(),
            log_offset: 0,
            log_offset_toggle: false,
            log_cksum: (0, 0),
            redirects: Vec::new(),
            block_count: 1,
            append_points: [0; 4],
            freelist: Vec::new(),
            page_writes: 0,
            page_size,
            block_size,
        }
    }

    /// Applies the redirect table to a block number.
    #[must_use]
    pub fn redirect_block(&self, block: u32) -> u32 {
        for &(from, to) in &self.redirects {
            if from == block {
                return to;
            }
        }
        block
    }

    /// Applies the redirect table to a page id.
    #[must_use]
    pub fn redirect_page(&self, fs: &FileSystem, id: u64) -> u64 {
        let block = if fs.compressed() {
            fs.block_of_offset(id)
        } else {
            fs.block_of_page(id)
        };

        let target = self.redirect_block(block);
        if target == block {
            return id;
        }

        let delta = i64::from(target) - i64::from(block);
        if fs.compressed() {
            id.wrapping_add_signed(delta * fs.block_size() as i64)
        } else {
            id.wrapping_add_signed(delta * fs.pages_per_block() as i64)
        }
    }

    /// Serializes the snapshot, truncating the level list to
    /// `level_limit` levels. Fails with [`Error::Full`] when even the
    /// truncated form exceeds the word ceiling.
    #[allow(clippy::expect_used, clippy::cast_possible_truncation)]
    pub fn encode(&self, level_limit: usize) -> Result<Vec<u8>> {
        let levels = &self.levels[..self.levels.len().min(level_limit)];

        let mut buf: Vec<u8> = Vec::new();
        let w32 = |buf: &mut Vec<u8>, v: u32| buf.write_u32::<BigEndian>(v).expect("vec write");
        let w64 = |buf: &mut Vec<u8>, v: u64| {
            buf.write_u32::<BigEndian>((v >> 32) as u32)
                .expect("vec write");
            buf.write_u32::<BigEndian>(v as u32).expect("vec write");
        };

        // Header
        w64(&mut buf, self.id);
        w32(&mut buf, 0); // total word count, patched below
        w32(&mut buf, self.compression_id);
        w32(&mut buf, self.block_count);
        w32(&mut buf, self.block_size);
        w32(&mut buf, levels.len() as u32);
        w32(&mut buf, self.page_size);
        w32(&mut buf, self.page_writes as u32);

        // Log pointer: shifted left one, low bit toggling every write
        let shifted = (self.log_offset << 1) | u64::from(self.log_offset_toggle);
        w64(&mut buf, shifted);
        w32(&mut buf, self.log_cksum.0);
        w32(&mut buf, self.log_cksum.1);

        for point in self.append_points {
            w64(&mut buf, point);
        }

        encode_levels_into(&mut buf, levels);

        w32(&mut buf, self.redirects.len() as u32);
        for &(from, to) in &self.redirects {
            w32(&mut buf, from);
            w32(&mut buf, to);
        }

        w32(&mut buf, self.freelist.len() as u32);
        for entry in &self.freelist {
            w32(&mut buf, entry.block);
            w64(&mut buf, entry.id as u64);
        }

        // Patch the word count (body plus the two checksum words)
        let total_words = buf.len() / 4 + 2;
        if total_words > SNAPSHOT_MAX_WORDS {
            return Err(Error::Full);
        }
        buf[8..12].copy_from_slice(&(total_words as u32).to_be_bytes());

        let (s0, s1) = PairChecksum::of(&buf);
        w32(&mut buf, s0);
        w32(&mut buf, s1);

        Ok(buf)
    }

    /// Deserializes and verifies a snapshot blob.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(Error::Corrupt("snapshot blob truncated"));
        }

        #[allow(clippy::indexing_slicing)]
        let total_words = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if total_words < 6 || total_words > SNAPSHOT_MAX_WORDS || total_words * 4 > buf.len() {
            return Err(Error::Corrupt("snapshot word count out of range"));
        }

        #[allow(clippy::indexing_slicing)]
        let (body, cksum_bytes) = buf[..total_words * 4].split_at(total_words * 4 - 8);

        let mut r = cksum_bytes;
        let want = (
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
        );
        if PairChecksum::of(body) != want {
            return Err(Error::Corrupt("snapshot checksum mismatch"));
        }

        let mut r = body;
        let r64 = |r: &mut &[u8]| -> Result<u64> {
            let hi = r.read_u32::<BigEndian>().map_err(Error::Io)?;
            let lo = r.read_u32::<BigEndian>().map_err(Error::Io)?;
            Ok((u64::from(hi) << 32) | u64::from(lo))
        };

        let id = r64(&mut r)?;
        let _total = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let compression_id = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let block_count = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let block_size = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let level_count = r.read_u32::<BigEndian>().map_err(Error::Io)? as usize;
        let page_size = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let page_writes = u64::from(r.read_u32::<BigEndian>().map_err(Error::Io)?);

        let shifted = r64(&mut r)?;
        let log_offset = shifted >> 1;
        let log_offset_toggle = shifted & 1 != 0;
        let log_cksum = (
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
            r.read_u32::<BigEndian>().map_err(Error::Io)?,
        );

        let mut append_points = [0u64; 4];
        for point in &mut append_points {
            *point = r64(&mut r)?;
        }

        let levels = decode_levels_from(&mut r, level_count)?;

        let redirect_count = r.read_u32::<BigEndian>().map_err(Error::Io)? as usize;
        if redirect_count > MAX_REDIRECTS {
            return Err(Error::Corrupt("snapshot redirect table too large"));
        }
        let mut redirects = Vec::with_capacity(redirect_count);
        for _ in 0..redirect_count {
            let from = r.read_u32::<BigEndian>().map_err(Error::Io)?;
            let to = r.read_u32::<BigEndian>().map_err(Error::Io)?;
            redirects.push((from, to));
        }

        let freelist_count = r.read_u32::<BigEndian>().map_err(Error::Io)? as usize;
        let mut freelist = Vec::with_capacity(freelist_count.min(1024));
        for _ in 0..freelist_count {
            let block = r.read_u32::<BigEndian>().map_err(Error::Io)?;

            #[allow(clippy::cast_possible_wrap)]
            let id = r64(&mut r)? as i64;
            freelist.push(FreelistEntry { block, id });
        }

        Ok(Self {
            id,
            compression_id,
            levels,
            log_offset,
            log_offset_toggle,
            log_cksum,
            redirects,
            block_count,
            append_points,
            freelist,
            page_writes,
            page_size,
            block_size,
        })
    }
}

/// Serializes a run of levels (used both inside the checkpoint blob
/// and for the system LEVELS overflow record).
#[allow(clippy::expect_used, clippy::cast_possible_truncation)]
pub fn encode_levels_into(buf: &mut Vec<u8>, levels: &[Level]) {
    let w32 = |buf: &mut Vec<u8>, v: u32| buf.write_u32::<BigEndian>(v).expect("vec write");
    let w64 = |buf: &mut Vec<u8>, v: u64| {
        buf.write_u32::<BigEndian>((v >> 32) as u32)
            .expect("vec write");
        buf.write_u32::<BigEndian>(v as u32).expect("vec write");
    };
    let wseg = |buf: &mut Vec<u8>, seg: &Segment| {
        w64(buf, seg.first);
        w64(buf, seg.last);
        w64(buf, seg.root);
        w64(buf, seg.size);
    };

    for level in levels {
        w32(buf, (u32::from(level.age) << 16) | u32::from(level.flags));
        w32(buf, level.rhs.len() as u32);
        wseg(buf, &level.lhs);
        for seg in &level.rhs {
            wseg(buf, seg);
        }

        if !level.rhs.is_empty() {
            let merge = level.merge.clone().unwrap_or_default();
            w32(buf, merge.inputs.len() as u32);
            w32(buf, merge.skip);
            for input in &merge.inputs {
                w64(buf, input.page);
                w32(buf, input.cell);
            }
            w64(buf, merge.split.page);
            w32(buf, merge.split.cell);
            w64(buf, merge.output);
        }
    }
}

/// Deserializes `count` levels.
pub fn decode_levels_from(r: &mut &[u8], count: usize) -> Result<Vec<Level>> {
    let r64 = |r: &mut &[u8]| -> Result<u64> {
        let hi = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let lo = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        Ok((u64::from(hi) << 32) | u64::from(lo))
    };
    let rseg = |r: &mut &[u8]| -> Result<Segment> {
        Ok(Segment {
            first: r64(r)?,
            last: r64(r)?,
            root: r64(r)?,
            size: r64(r)?,
        })
    };

    let mut levels = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let age_flags = r.read_u32::<BigEndian>().map_err(Error::Io)?;
        let rhs_count = r.read_u32::<BigEndian>().map_err(Error::Io)? as usize;

        let lhs = rseg(r)?;
        let mut rhs = Vec::with_capacity(rhs_count.min(64));
        for _ in 0..rhs_count {
            rhs.push(rseg(r)?);
        }

        let merge = if rhs_count > 0 {
            let input_count = r.read_u32::<BigEndian>().map_err(Error::Io)? as usize;
            let skip = r.read_u32::<BigEndian>().map_err(Error::Io)?;

            let mut inputs = Vec::with_capacity(input_count.min(64));
            for _ in 0..input_count {
                let page = r64(r)?;
                let cell = r.read_u32::<BigEndian>().map_err(Error::Io)?;
                inputs.push(MergeInput { page, cell });
            }

            let split = MergeInput {
                page: r64(r)?,
                cell: r.read_u32::<BigEndian>().map_err(Error::Io)?,
            };
            let output = r64(r)?;

            Some(MergeState {
                inputs,
                skip,
                split,
                output,
            })
        } else {
            None
        };

        #[allow(clippy::cast_possible_truncation)]
        levels.push(Level {
            age: (age_flags >> 16) as u16,
            flags: age_flags as u16,
            lhs,
            rhs,
            merge,
        });
    }

    Ok(levels)
}
