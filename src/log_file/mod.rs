// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The write-ahead log.
//!
//! An append-only byte stream living in a single file, logically split
//! into three regions `R0 | R1 | R2` so the file can be reused in
//! place: bytes always append to R2; once everything before R2 is
//! checkpointed, a `JUMP` record sends the tail back to offset 0, and
//! when the new tail would collide with the old bytes another `JUMP`
//! hops over them. Recovery never needs the region table - the stream
//! is self-navigating through its `JUMP` records.
//!
//! A running pair checksum covers every byte of the stream except the
//! stored checksum words themselves; a checksummed record (`COMMIT` or
//! a `*_CKSUM` op) appears at least every 32 KiB, and recovery stops at
//! the first one that does not verify.

pub mod reader;

use crate::{
    checksum::PairChecksum,
    db::config::SafetyLevel,
    env::EnvFile,
    error::Result,
    shm::header::LogState,
};
use std::sync::Arc;
use varint_rs::VarintWriter as _;

/// End-of-stream marker.
pub const REC_EOF: u8 = 0x00;

/// One byte of padding.
pub const REC_PAD1: u8 = 0x01;

/// Variable-length padding: varint length, then that many bytes.
pub const REC_PAD2: u8 = 0x02;

/// Transaction commit, followed by the 8-byte stream checksum.
pub const REC_COMMIT: u8 = 0x03;

/// Redirect: the stream continues at the varint absolute offset.
pub const REC_JUMP: u8 = 0x04;

/// Key/value write: varint key length, varint value length, key, value.
pub const REC_WRITE: u8 = 0x06;

/// `WRITE` preceded by an 8-byte stream checksum.
pub const REC_WRITE_CKSUM: u8 = 0x07;

/// Point delete: varint key length, key.
pub const REC_DELETE: u8 = 0x08;

/// `DELETE` preceded by an 8-byte stream checksum.
pub const REC_DELETE_CKSUM: u8 = 0x09;

/// Range delete: two varint key lengths, then both keys.
pub const REC_DRANGE: u8 = 0x0A;

/// `DRANGE` preceded by an 8-byte stream checksum.
pub const REC_DRANGE_CKSUM: u8 = 0x0B;

/// A checksummed record must appear at least this often.
pub const CKSUM_INTERVAL: usize = 32 * 1024;

/// R2 may wrap back to offset 0 once it has grown past this.
pub const WRAP_LOW_WATER: u64 = 128 * 1024;

// Reserved headroom so the JUMP record emitted right before a wrap
// never collides with the bytes it is jumping over.
const JUMP_HEADROOM: u64 = 32;

/// Appends records to the log on behalf of the single writer.
pub struct LogWriter {
    file: Arc<dyn EnvFile>,
    state: LogState,
    cksum: PairChecksum,
    /// Bytes buffered since the last flush, pending at `state.regions[2].1`.
    buf: Vec<u8>,
    bytes_since_cksum: usize,
}

impl LogWriter {
    /// Resumes appending at the position described by `state`.
    #[must_use]
    pub fn new(file: Arc<dyn EnvFile>, state: LogState) -> Self {
        let cksum = PairChecksum::with_state(state.cksum.0, state.cksum.1);
        Self {
            file,
            state,
            cksum,
            buf: Vec::new(),
            bytes_since_cksum: 0,
        }
    }

    /// The current append offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.state.regions[2].1
    }

    /// The region layout and checksum to persist in the tree header.
    #[must_use]
    pub fn state(&self) -> LogState {
        let mut state = self.state;
        state.cksum = self.cksum.state();
        state
    }

    fn push(&mut self, bytes: &[u8]) {
        self.cksum.update(bytes);
        self.buf.extend_from_slice(bytes);
        self.state.regions[2].1 += bytes.len() as u64;
        self.bytes_since_cksum += bytes.len();
    }

    /// Appends the 8 stored checksum bytes (excluded from the stream
    /// checksum themselves).
    fn push_cksum(&mut self) {
        let (s0, s1) = self.cksum.seal();
        self.buf.extend_from_slice(&s0.to_le_bytes());
        self.buf.extend_from_slice(&s1.to_le_bytes());
        self.state.regions[2].1 += 8;
        self.bytes_since_cksum = 0;
    }

    #[allow(clippy::expect_used)]
    fn encode_body(parts: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.write_u64_varint(part.len() as u64)
                .expect("vec write");
        }
        for part in parts {
            body.extend_from_slice(part);
        }
        body
    }

    fn append_op(&mut self, plain: u8, cksummed: u8, body: &[u8]) {
        if self.bytes_since_cksum + body.len() + 1 > CKSUM_INTERVAL {
            self.push(&[cksummed]);
            self.push_cksum();
        } else {
            self.push(&[plain]);
        }
        self.push(body);
    }

    /// Logs a key write.
    pub fn log_write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.wrap_if_needed((1 + 20 + key.len() + value.len()) as u64)?;
        let body = Self::encode_body(&[key, value]);
        self.append_op(REC_WRITE, REC_WRITE_CKSUM, &body);
        Ok(())
    }

    /// Logs a point delete.
    pub fn log_delete(&mut self, key: &[u8]) -> Result<()> {
        self.wrap_if_needed((1 + 10 + key.len()) as u64)?;
        let body = Self::encode_body(&[key]);
        self.append_op(REC_DELETE, REC_DELETE_CKSUM, &body);
        Ok(())
    }

    /// Logs a range delete.
    pub fn log_delete_range(&mut self, lo: &[u8], hi: &[u8]) -> Result<()> {
        self.wrap_if_needed((1 + 20 + lo.len() + hi.len()) as u64)?;
        let body = Self::encode_body(&[lo, hi]);
        self.append_op(REC_DRANGE, REC_DRANGE_CKSUM, &body);
        Ok(())
    }

    /// Appends a `COMMIT`, pads to a sector boundary in FULL safety,
    /// flushes, and syncs according to the safety level.
    pub fn commit(&mut self, safety: SafetyLevel) -> Result<()> {
        self.push(&[REC_COMMIT]);
        self.push_cksum();

        if safety == SafetyLevel::Full {
            let sector = self.file.sector_size().max(1) as u64;
            let tail = self.state.regions[2].1 % sector;
            if tail != 0 {
                self.pad((sector - tail) as usize);
            }
        }

        self.flush()?;

        if safety == SafetyLevel::Full {
            self.file.sync()?;
        }
        Ok(())
    }

    /// Padding records re-align the checksum stream: the state seals
    /// after each one, and the reader does the same, so a recovery
    /// seeded at a sector boundary agrees with a reader scanning
    /// through it.
    #[allow(clippy::expect_used)]
    fn pad(&mut self, n: usize) {
        debug_assert!(n > 0);
        if n == 1 {
            self.push(&[REC_PAD1]);
            self.cksum.seal();
            return;
        }

        // Find the payload length whose varint encoding makes the
        // record exactly n bytes
        let mut payload_len = n - 2;
        while 1 + crate::shm::varint_len(payload_len as u64) + payload_len > n {
            payload_len -= 1;
        }

        let mut record = vec![REC_PAD2];
        record
            .write_u64_varint(payload_len as u64)
            .expect("vec write");
        record.resize(record.len() + payload_len, 0);

        // An off-by-one gap from the varint width is filled with PAD1s
        let gap = n - record.len();
        self.push(&record);
        self.cksum.seal();
        for _ in 0..gap {
            self.push(&[REC_PAD1]);
            self.cksum.seal();
        }
    }

    /// Writes buffered bytes to the file.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let start = self.state.regions[2].1 - self.buf.len() as u64;
        self.file.write_at(start, &self.buf)?;
        self.buf.clear();
        Ok(())
    }

    /// Durably persists the log file.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync()
    }

    /// Shrinks the region table given the offset known to be captured
    /// by the newest durable checkpoint.
    pub fn trim(&mut self, synced: u64) {
        let [r0, r1, r2] = &mut self.state.regions;

        if synced >= r2.0 && synced <= r2.1 {
            *r0 = (0, 0);
            *r1 = (0, 0);
            r2.0 = synced;
        } else if synced >= r1.0 && synced <= r1.1 {
            *r0 = (0, 0);
            r1.0 = synced;
        } else if synced >= r0.0 && synced <= r0.1 {
            r0.0 = synced;
        }

        if r0.0 == r0.1 {
            *r0 = (0, 0);
        }
        if r1.0 == r1.1 {
            *r1 = (0, 0);
        }
    }

    /// Emits a `JUMP` to `target` and repositions the tail there.
    fn jump(&mut self, target: u64) -> Result<()> {
        #[allow(clippy::expect_used)]
        let mut body = Vec::new();
        {
            use std::io::Write as _;
            body.write_all(&[REC_JUMP]).expect("vec write");
            body.write_u64_varint(target).expect("vec write");
        }
        self.push(&body);

        // Everything written so far lands at the old tail
        self.flush()?;
        self.state.regions[2].1 = target;
        Ok(())
    }

    /// Applies the wrap rules before appending `upcoming` bytes.
    fn wrap_if_needed(&mut self, upcoming: u64) -> Result<()> {
        let [r0, r1, r2] = self.state.regions;

        let r0_empty = r0 == (0, 0);
        let r1_empty = r1 == (0, 0);

        // Wrap the tail back to the start of the file once the prefix
        // is fully checkpointed and the log has grown enough
        if r0_empty && r1_empty && r2.1 > WRAP_LOW_WATER && r2.0 > 0 {
            log::trace!("log: wrapping tail to offset 0 (tail was {})", r2.1);
            self.jump(0)?;
            self.state.regions[0] = (r2.0, r2.1 + JUMP_HEADROOM);
            self.state.regions[2] = (0, 0);
            return Ok(());
        }

        // The wrapped tail must not collide with the old bytes ahead
        // of it
        if !r0_empty && r2.1 < r0.0 && r2.1 + upcoming + JUMP_HEADROOM >= r0.0 {
            let target = r0.1;
            log::trace!("log: tail reached old region, hopping to {target}");
            self.jump(target)?;
            self.state.regions[1] = (r2.0, r2.1);
            self.state.regions[2] = (target, target);
        }

        Ok(())
    }
}
