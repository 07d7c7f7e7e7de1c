// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    REC_COMMIT, REC_DELETE, REC_DELETE_CKSUM, REC_DRANGE, REC_DRANGE_CKSUM, REC_EOF, REC_JUMP,
    REC_PAD1, REC_PAD2, REC_WRITE, REC_WRITE_CKSUM,
};
use crate::{checksum::PairChecksum, env::EnvFile, error::Result};
use std::sync::Arc;

/// A decoded log record.
#[derive(Debug, Eq, PartialEq)]
pub enum LogRecord {
    /// Key write.
    Write {
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },

    /// Point delete.
    Delete {
        /// Key bytes.
        key: Vec<u8>,
    },

    /// Range delete with exclusive bounds.
    DeleteRange {
        /// Lower bound.
        lo: Vec<u8>,
        /// Upper bound.
        hi: Vec<u8>,
    },

    /// Transaction boundary (its checksum verified).
    Commit,
}

/// Streams records out of the log, following `JUMP`s and verifying
/// checksums. Any anomaly - a record that does not verify, an unknown
/// opcode, a truncated tail - ends the stream.
pub struct LogReader {
    file: Arc<dyn EnvFile>,
    offset: u64,
    cksum: PairChecksum,
    done: bool,

    /// Disjoint file ranges visited before each `JUMP`, in stream
    /// order; the open range starts at `seg_start`.
    segments: Vec<(u64, u64)>,
    seg_start: u64,
}

impl LogReader {
    /// Starts reading at `start`, with the checksum seeded as it was at
    /// that offset.
    #[must_use]
    pub fn new(file: Arc<dyn EnvFile>, start: u64, seed: (u32, u32)) -> Self {
        Self {
            file,
            offset: start,
            cksum: PairChecksum::with_state(seed.0, seed.1),
            done: false,
            segments: Vec::new(),
            seg_start: start,
        }
    }

    /// The file ranges visited so far, including the open one. This is
    /// how recovery reconstructs the region table of a wrapped log.
    #[must_use]
    pub fn segments(&self) -> Vec<(u64, u64)> {
        let mut out = self.segments.clone();
        out.push((self.seg_start, self.offset));
        out
    }

    /// The offset just past the last byte consumed.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Current running checksum state.
    #[must_use]
    pub fn cksum_state(&self) -> (u32, u32) {
        self.cksum.state()
    }

    /// Reads bytes without feeding the stream checksum.
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<bool> {
        let n = self.file.read_at(self.offset, buf)?;
        if n < buf.len() {
            return Ok(false);
        }
        self.offset += buf.len() as u64;
        Ok(true)
    }

    /// Reads bytes and feeds them to the stream checksum.
    fn read(&mut self, buf: &mut [u8]) -> Result<bool> {
        if !self.read_raw(buf)? {
            return Ok(false);
        }
        self.cksum.update(buf);
        Ok(true)
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        if self.read(&mut b)? {
            Ok(Some(b[0]))
        } else {
            Ok(None)
        }
    }

    fn read_varint(&mut self) -> Result<Option<u64>> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let Some(byte) = self.read_byte()? else {
                return Ok(None);
            };
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(Some(value));
            }
            shift += 7;
            if shift > 63 {
                return Ok(None);
            }
        }
    }

    fn read_len_prefixed(&mut self, len: u64) -> Result<Option<Vec<u8>>> {
        if len > u64::from(u32::MAX) {
            return Ok(None);
        }
        let mut buf = vec![0u8; len as usize];
        if self.read(&mut buf)? {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    /// Seals the running checksum and compares it against the stored
    /// words at the cursor.
    fn verify_cksum(&mut self) -> Result<bool> {
        let want = self.cksum.seal();

        let mut stored = [0u8; 8];
        if !self.read_raw(&mut stored)? {
            return Ok(false);
        }

        #[allow(clippy::indexing_slicing)]
        let got = (
            u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]),
            u32::from_le_bytes([stored[4], stored[5], stored[6], stored[7]]),
        );

        Ok(want == got)
    }

    /// The next record, or `None` when the stream ends.
    #[allow(clippy::too_many_lines)]
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if self.done {
            return Ok(None);
        }

        loop {
            let Some(op) = self.read_byte()? else {
                self.done = true;
                return Ok(None);
            };

            match op {
                // Padding records re-align the checksum stream (the
                // writer seals after each one too)
                REC_PAD1 => {
                    self.cksum.seal();
                }

                REC_PAD2 => {
                    let Some(len) = self.read_varint()? else {
                        self.done = true;
                        return Ok(None);
                    };
                    if self.read_len_prefixed(len)?.is_none() {
                        self.done = true;
                        return Ok(None);
                    }
                    self.cksum.seal();
                }

                REC_JUMP => {
                    let Some(target) = self.read_varint()? else {
                        self.done = true;
                        return Ok(None);
                    };
                    self.segments.push((self.seg_start, self.offset));
                    self.offset = target;
                    self.seg_start = target;
                }

                REC_COMMIT => {
                    if !self.verify_cksum()? {
                        self.done = true;
                        return Ok(None);
                    }
                    return Ok(Some(LogRecord::Commit));
                }

                REC_WRITE | REC_WRITE_CKSUM => {
                    if op == REC_WRITE_CKSUM && !self.verify_cksum()? {
                        self.done = true;
                        return Ok(None);
                    }
                    let (Some(klen), Some(vlen)) = (self.read_varint()?, self.read_varint()?)
                    else {
                        self.done = true;
                        return Ok(None);
                    };
                    let (Some(key), Some(value)) = (
                        self.read_len_prefixed(klen)?,
                        self.read_len_prefixed(vlen)?,
                    ) else {
                        self.done = true;
                        return Ok(None);
                    };
                    return Ok(Some(LogRecord::Write { key, value }));
                }

                REC_DELETE | REC_DELETE_CKSUM => {
                    if op == REC_DELETE_CKSUM && !self.verify_cksum()? {
                        self.done = true;
                        return Ok(None);
                    }
                    let Some(klen) = self.read_varint()? else {
                        self.done = true;
                        return Ok(None);
                    };
                    let Some(key) = self.read_len_prefixed(klen)? else {
                        self.done = true;
                        return Ok(None);
                    };
                    return Ok(Some(LogRecord::Delete { key }));
                }

                REC_DRANGE | REC_DRANGE_CKSUM => {
                    if op == REC_DRANGE_CKSUM && !self.verify_cksum()? {
                        self.done = true;
                        return Ok(None);
                    }
                    let (Some(len_lo), Some(len_hi)) =
                        (self.read_varint()?, self.read_varint()?)
                    else {
                        self.done = true;
                        return Ok(None);
                    };
                    let (Some(lo), Some(hi)) = (
                        self.read_len_prefixed(len_lo)?,
                        self.read_len_prefixed(len_hi)?,
                    ) else {
                        self.done = true;
                        return Ok(None);
                    };
                    return Ok(Some(LogRecord::DeleteRange { lo, hi }));
                }

                // REC_EOF and anything unknown end the stream
                _ => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }
}

/// Outcome of the first recovery pass.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ScanResult {
    /// Operation records up to and including the last valid commit.
    pub ops_until_commit: usize,

    /// Stream offset just past the last valid commit.
    pub end_offset: u64,

    /// Checksum state at `end_offset`, for resuming the writer.
    pub end_cksum: (u32, u32),

    /// File ranges of the valid stream in order, for rebuilding the
    /// region table.
    pub segments: Vec<(u64, u64)>,

    /// Number of valid commits observed.
    pub commits: usize,
}

/// First pass: counts commits and finds the replay boundary.
pub fn scan(file: &Arc<dyn EnvFile>, start: u64, seed: (u32, u32)) -> Result<ScanResult> {
    let mut reader = LogReader::new(file.clone(), start, seed);
    let mut result = ScanResult {
        end_offset: start,
        end_cksum: seed,
        ..ScanResult::default()
    };

    let mut ops = 0;
    while let Some(record) = reader.next_record()? {
        if record == LogRecord::Commit {
            result.ops_until_commit = ops;
            result.end_offset = reader.offset();
            result.end_cksum = reader.cksum_state();
            result.segments = reader.segments();
            result.commits += 1;
        } else {
            ops += 1;
        }
    }

    if result.commits == 0 {
        result.segments = vec![(start, start)];
    }

    Ok(result)
}

/// Second pass: hands the first `ops_until_commit` operation records to
/// `apply`.
pub fn replay<F>(
    file: &Arc<dyn EnvFile>,
    start: u64,
    seed: (u32, u32),
    ops_until_commit: usize,
    mut apply: F,
) -> Result<()>
where
    F: FnMut(LogRecord) -> Result<()>,
{
    let mut reader = LogReader::new(file.clone(), start, seed);

    let mut applied = 0;
    while applied < ops_until_commit {
        match reader.next_record()? {
            None => break,
            Some(LogRecord::Commit) => {}
            Some(record) => {
                apply(record)?;
                applied += 1;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::config::SafetyLevel,
        env::{Env as _, MemEnv},
        log_file::LogWriter,
        shm::header::LogState,
    };
    use std::path::Path;
    use test_log::test;

    fn file(env: &MemEnv) -> Arc<dyn EnvFile> {
        env.open_file(Path::new("log"), true, false).unwrap()
    }

    #[test]
    fn round_trip_through_writer() -> crate::Result<()> {
        let env = MemEnv::new();
        let mut w = LogWriter::new(file(&env), LogState::default());

        w.log_write(b"a", b"1")?;
        w.log_delete(b"b")?;
        w.log_delete_range(b"c", b"f")?;
        w.commit(SafetyLevel::Normal)?;

        let mut r = LogReader::new(file(&env), 0, (0, 0));
        assert_eq!(
            Some(LogRecord::Write {
                key: b"a".to_vec(),
                value: b"1".to_vec()
            }),
            r.next_record()?
        );
        assert_eq!(Some(LogRecord::Delete { key: b"b".to_vec() }), r.next_record()?);
        assert_eq!(
            Some(LogRecord::DeleteRange {
                lo: b"c".to_vec(),
                hi: b"f".to_vec()
            }),
            r.next_record()?
        );
        assert_eq!(Some(LogRecord::Commit), r.next_record()?);
        assert_eq!(None, r.next_record()?);
        Ok(())
    }

    #[test]
    fn scan_stops_at_torn_commit() -> crate::Result<()> {
        let env = MemEnv::new();
        let mut w = LogWriter::new(file(&env), LogState::default());

        w.log_write(b"good", b"1")?;
        w.commit(SafetyLevel::Normal)?;
        let good_end = w.offset();

        w.log_write(b"torn", b"2")?;
        w.commit(SafetyLevel::Normal)?;

        // Corrupt one byte of the second transaction
        let f = file(&env);
        f.write_at(good_end + 2, &[0xEE])?;

        let result = scan(&f, 0, (0, 0))?;
        assert_eq!(1, result.commits);
        assert_eq!(1, result.ops_until_commit);
        assert_eq!(good_end, result.end_offset);
        Ok(())
    }

    #[test]
    fn replay_applies_only_committed_ops() -> crate::Result<()> {
        let env = MemEnv::new();
        let mut w = LogWriter::new(file(&env), LogState::default());

        w.log_write(b"a", b"1")?;
        w.log_write(b"b", b"2")?;
        w.commit(SafetyLevel::Normal)?;

        // Uncommitted tail
        w.log_write(b"c", b"3")?;
        w.flush()?;

        let f = file(&env);
        let scanned = scan(&f, 0, (0, 0))?;
        assert_eq!(2, scanned.ops_until_commit);

        let mut seen = Vec::new();
        replay(&f, 0, (0, 0), scanned.ops_until_commit, |record| {
            seen.push(record);
            Ok(())
        })?;

        assert_eq!(2, seen.len());
        Ok(())
    }

    #[test]
    fn reader_follows_jump_records() -> crate::Result<()> {
        use varint_rs::VarintWriter as _;

        let env = MemEnv::new();
        let f = file(&env);

        // Hand-build: WRITE at 0, then JUMP to 1000, then COMMIT there
        let mut cksum = crate::checksum::PairChecksum::default();
        let mut head = Vec::new();
        head.push(crate::log_file::REC_WRITE);
        head.write_u64_varint(1).unwrap();
        head.write_u64_varint(1).unwrap();
        head.extend_from_slice(b"kv");
        head.push(crate::log_file::REC_JUMP);
        head.write_u64_varint(1000).unwrap();
        cksum.update(&head);

        let mut tail = Vec::new();
        tail.push(crate::log_file::REC_COMMIT);
        cksum.update(&tail);
        let (s0, s1) = cksum.seal();
        tail.extend_from_slice(&s0.to_le_bytes());
        tail.extend_from_slice(&s1.to_le_bytes());

        f.write_at(0, &head)?;
        f.write_at(1000, &tail)?;

        let result = scan(&f, 0, (0, 0))?;
        assert_eq!(1, result.commits);
        assert_eq!(1, result.ops_until_commit);
        assert!(result.end_offset > 1000);
        Ok(())
    }
}
