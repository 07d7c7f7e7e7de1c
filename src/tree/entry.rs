// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    error::Result,
    shm::{arena::Arena, ChunkReader, ChunkWriter, ShmPtr, ShmRegion},
    slice::Slice,
};

/// Per-entry flag bits.
///
/// `START_DELETE` and `END_DELETE` bound range deletes; an entry carrying
/// both alongside `INSERT` is a live key sitting inside a covered range.
/// `INSERT` and `POINT_DELETE` are mutually exclusive.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// Opens a range delete immediately after this key.
    pub const START_DELETE: Self = Self(0x01);

    /// Closes a range delete immediately before this key.
    pub const END_DELETE: Self = Self(0x02);

    /// The key is deleted (shadowing older versions).
    pub const POINT_DELETE: Self = Self(0x04);

    /// The key carries a live value.
    pub const INSERT: Self = Self(0x08);

    /// The entry guides searches but is not a user record.
    pub const SEPARATOR: Self = Self(0x10);

    /// The entry belongs to the engine's own key space.
    pub const SYSTEMKEY: Self = Self(0x20);

    const MASK: u8 = 0x3F;

    /// Builds flags from raw bits.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    /// Raw bits.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if all bits of `other` are set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if any bit of `other` is set.
    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Set union.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Removes the bits of `other`.
    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The topic is the primary sort key: user keys order before
    /// system keys.
    #[must_use]
    pub fn topic(self) -> u8 {
        u8::from(self.contains(Self::SYSTEMKEY))
    }

    /// Entry content is a live value.
    #[must_use]
    pub fn is_insert(self) -> bool {
        self.contains(Self::INSERT)
    }

    /// Entry content is a point delete.
    #[must_use]
    pub fn is_point_delete(self) -> bool {
        self.contains(Self::POINT_DELETE)
    }

    /// Entry is only a range-delete boundary or separator, with no
    /// live or deleted payload of its own.
    #[must_use]
    pub fn is_boundary_only(self) -> bool {
        !self.intersects(Self::INSERT.union(Self::POINT_DELETE))
    }

    /// Ordering nudge for equal keys: a bare `START_DELETE` boundary
    /// logically sits just after its key, a bare `END_DELETE` boundary
    /// just before it.
    #[must_use]
    pub fn epsilon(self) -> i8 {
        if !self.is_boundary_only() {
            return 0;
        }
        let start = self.contains(Self::START_DELETE);
        let end = self.contains(Self::END_DELETE);
        match (start, end) {
            (true, false) => 1,
            (false, true) => -1,
            _ => 0,
        }
    }
}

impl std::ops::BitOr for EntryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Compares two keys by topic first, then bytes.
#[must_use]
pub fn key_cmp(topic_a: u8, key_a: &[u8], topic_b: u8, key_b: &[u8]) -> std::cmp::Ordering {
    topic_a.cmp(&topic_b).then_with(|| key_a.cmp(key_b))
}

/// A decoded tree entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeEntry {
    /// Flag bits.
    pub flags: EntryFlags,

    /// Key bytes (without the topic, which lives in the flags).
    pub key: Slice,

    /// Value bytes; `None` unless `INSERT` is set.
    pub value: Option<Slice>,
}

impl TreeEntry {
    /// Topic of this entry's key.
    #[must_use]
    pub fn topic(&self) -> u8 {
        self.flags.topic()
    }
}

// Entry header byte: flag bits in the low 6, bit 6 = data spans chunks,
// bit 7 = a value length field follows the key length.
const HDR_SPANS: u8 = 0x40;
const HDR_HAS_VALUE: u8 = 0x80;

/// Appends an entry to the arena, returning its handle.
pub fn write_entry(
    arena: &mut Arena<'_>,
    flags: EntryFlags,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<ShmPtr> {
    use crate::shm::varint_len;

    let has_value = value.is_some();
    let klen = key.len() as u64;
    let vlen = value.map_or(0, <[u8]>::len) as u64;

    let mut total = 1 + varint_len(klen) + key.len();
    if has_value {
        total += varint_len(vlen) + vlen as usize;
    }

    let (ptr, contiguous) = arena.alloc(total, false)?;

    let mut hdr = flags.bits();
    if !contiguous {
        hdr |= HDR_SPANS;
    }
    if has_value {
        hdr |= HDR_HAS_VALUE;
    }

    let mut w = ChunkWriter::new(arena.shm().clone(), ptr);
    w.write(&[hdr])?;
    w.write_varint(klen)?;
    if let Some(value) = value {
        w.write_varint(vlen)?;
        w.write(key)?;
        w.write(value)?;
    } else {
        w.write(key)?;
    }

    Ok(ptr)
}

/// Reads the entry at `ptr`.
pub fn read_entry(shm: &ShmRegion, ptr: ShmPtr) -> Result<TreeEntry> {
    let mut r = ChunkReader::new(shm.clone(), ptr);

    let hdr = r.read_u8()?;
    let flags = EntryFlags::from_bits(hdr);
    let has_value = hdr & HDR_HAS_VALUE != 0;

    let klen = r.read_varint()? as usize;
    let vlen = if has_value {
        Some(r.read_varint()? as usize)
    } else {
        None
    };

    let mut key = vec![0u8; klen];
    r.read(&mut key)?;

    let value = match vlen {
        Some(vlen) => {
            let mut value = vec![0u8; vlen];
            r.read(&mut value)?;
            Some(Slice::from(value))
        }
        None => None,
    };

    Ok(TreeEntry {
        flags,
        key: Slice::from(key),
        value,
    })
}

/// Reads only the flags byte of the entry at `ptr`.
pub fn read_entry_flags(shm: &ShmRegion, ptr: ShmPtr) -> Result<EntryFlags> {
    let mut r = ChunkReader::new(shm.clone(), ptr);
    Ok(EntryFlags::from_bits(r.read_u8()?))
}
