// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Running pair checksum used by the log, the tree headers and the
/// checkpoint blob.
///
/// Input bytes are consumed as little-endian `u32` words, two at a time:
///
/// ```text
/// s0 += x[i]     + s1
/// s1 += x[i + 1] + s0
/// ```
///
/// A trailing partial word pair is zero-padded to 8 bytes when folded.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PairChecksum {
    s0: u32,
    s1: u32,
    /// Bytes fed since the last full 8-byte group, at most 7.
    pending: [u8; 8],
    n_pending: usize,
}

impl PairChecksum {
    /// Creates a checksum seeded with the given state.
    #[must_use]
    pub fn with_state(s0: u32, s1: u32) -> Self {
        Self {
            s0,
            s1,
            pending: [0; 8],
            n_pending: 0,
        }
    }

    /// Returns the current (s0, s1) state without folding pending bytes.
    #[must_use]
    pub fn state(&self) -> (u32, u32) {
        (self.s0, self.s1)
    }

    fn fold_group(&mut self, group: &[u8]) {
        debug_assert_eq!(8, group.len());

        #[allow(clippy::indexing_slicing)]
        let x0 = u32::from_le_bytes([group[0], group[1], group[2], group[3]]);

        #[allow(clippy::indexing_slicing)]
        let x1 = u32::from_le_bytes([group[4], group[5], group[6], group[7]]);

        self.s0 = self.s0.wrapping_add(x0).wrapping_add(self.s1);
        self.s1 = self.s1.wrapping_add(x1).wrapping_add(self.s0);
    }

    /// Feeds bytes into the running checksum.
    pub fn update(&mut self, mut data: &[u8]) {
        if self.n_pending > 0 {
            let take = (8 - self.n_pending).min(data.len());

            #[allow(clippy::indexing_slicing)]
            self.pending[self.n_pending..self.n_pending + take].copy_from_slice(&data[..take]);

            self.n_pending += take;

            #[allow(clippy::indexing_slicing)]
            {
                data = &data[take..];
            }

            if self.n_pending < 8 {
                return;
            }

            let group = self.pending;
            self.fold_group(&group);
            self.pending = [0; 8];
            self.n_pending = 0;
        }

        let mut chunks = data.chunks_exact(8);
        for group in &mut chunks {
            self.fold_group(group);
        }

        let rest = chunks.remainder();
        if !rest.is_empty() {
            #[allow(clippy::indexing_slicing)]
            self.pending[..rest.len()].copy_from_slice(rest);
            self.n_pending = rest.len();
        }
    }

    /// Folds any pending tail bytes (zero-padded to 8) into the state and
    /// returns the resulting (s0, s1).
    ///
    /// After sealing, the alignment restarts; subsequent `update` calls
    /// begin a fresh word group, mirroring what a reader that verified the
    /// sealed value does.
    pub fn seal(&mut self) -> (u32, u32) {
        if self.n_pending > 0 {
            let group = self.pending;
            self.fold_group(&group);
            self.pending = [0; 8];
            self.n_pending = 0;
        }
        (self.s0, self.s1)
    }

    /// One-shot checksum of a byte slice.
    #[must_use]
    pub fn of(data: &[u8]) -> (u32, u32) {
        let mut cksum = Self::default();
        cksum.update(data);
        cksum.seal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn checksum_deterministic() {
        let a = PairChecksum::of(b"hello world, this is sixteen");
        let b = PairChecksum::of(b"hello world, this is sixteen");
        assert_eq!(a, b);
    }

    #[test]
    fn checksum_order_sensitive() {
        let a = PairChecksum::of(b"abcdefgh12345678");
        let b = PairChecksum::of(b"12345678abcdefgh");
        assert_ne!(a, b);
    }

    #[test]
    fn checksum_split_feeding_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";

        let one_shot = PairChecksum::of(data);

        let mut split = PairChecksum::default();
        split.update(&data[..5]);
        split.update(&data[5..11]);
        split.update(&data[11..]);

        assert_eq!(one_shot, split.seal());
    }

    #[test]
    fn checksum_tail_padding() {
        // A sealed 5-byte input equals the same input padded to 8 with zeros
        let mut short = PairChecksum::default();
        short.update(b"abcde");

        let mut padded = PairChecksum::default();
        padded.update(b"abcde\0\0\0");

        assert_eq!(short.seal(), padded.seal());
    }

    #[test]
    fn checksum_seeded_state_continues() {
        let mut a = PairChecksum::default();
        a.update(b"first-part");
        let (s0, s1) = a.seal();

        let mut b = PairChecksum::with_state(s0, s1);
        b.update(b"second-part");

        let mut c = PairChecksum::with_state(s0, s1);
        c.update(b"second-part");

        assert_eq!(b.seal(), c.seal());
    }
}
