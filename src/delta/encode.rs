//! Sliding-window delta encoder.
//!
//! Walks the result buffer with a 16-byte fingerprint window. On each index
//! hit the candidate bases are tried by byte-equality, extending the best
//! match forward and backward; backward extension shortens the pending
//! insert region, which is why it wins ties. Matches shorter than one block
//! are not worth a copy instruction and are skipped. Uncovered regions
//! become inserts split into 127-byte chunks.
//!
//! The encoder can be bounded: `encode_limited` abandons encoding once the
//! output would exceed the caller's ceiling, which the pack writer uses to
//! discard deltas that would be bigger than the deflated whole object.

use crate::raw::varint::write_leb128;

use super::index::{hash_block, roll, DeltaIndex, BLOCK_SIZE};

/// Longest copy a single instruction may emit.
const MAX_COPY: usize = 0x10000;
/// Longest insert a single instruction may carry.
const MAX_INSERT: usize = 0x7f;

/// Stateless convenience wrapper: index `src` and encode `dst` against it.
///
/// Callers producing several deltas from one base should build a
/// [`DeltaIndex`] once and reuse a [`DeltaEncoder`].
#[must_use]
pub fn encode_delta(src: &[u8], dst: &[u8]) -> Vec<u8> {
    let index = DeltaIndex::new(src);
    let mut out = Vec::with_capacity(64);
    let encoder = DeltaEncoder::new(&index);
    let fit = encoder.encode_limited(dst, &mut out, usize::MAX);
    debug_assert!(fit, "unlimited encode cannot overflow");
    out
}

/// Encoder bound to a [`DeltaIndex`].
pub struct DeltaEncoder<'a, 'src> {
    index: &'a DeltaIndex<'src>,
}

impl<'a, 'src> DeltaEncoder<'a, 'src> {
    /// Binds an encoder to a prepared index.
    #[must_use]
    pub fn new(index: &'a DeltaIndex<'src>) -> Self {
        Self { index }
    }

    /// Encodes `dst` into `out`, appending nothing if the stream would
    /// exceed `limit` bytes. Returns false on abandonment; `out` is
    /// truncated back to its original length in that case.
    pub fn encode_limited(&self, dst: &[u8], out: &mut Vec<u8>, limit: usize) -> bool {
        let start_len = out.len();
        let src = self.index.source();

        write_leb128(src.len() as u64, out);
        write_leb128(dst.len() as u64, out);
        if over(out, start_len, limit) {
            out.truncate(start_len);
            return false;
        }

        let mut insert_from = 0usize; // start of the pending literal region
        let mut pos = 0usize;
        let mut hash = 0u32;
        let mut hash_valid = false;

        while pos + BLOCK_SIZE <= dst.len() {
            if !hash_valid {
                hash = hash_block(&dst[pos..]);
                hash_valid = true;
            }

            let best = self.best_match(dst, pos, insert_from, hash);
            match best {
                Some((src_off, dst_off, len)) if len >= BLOCK_SIZE => {
                    emit_insert(&dst[insert_from..dst_off], out);
                    emit_copy(src_off, len, out);
                    pos = dst_off + len;
                    insert_from = pos;
                    hash_valid = false;
                }
                _ => {
                    if pos + BLOCK_SIZE < dst.len() {
                        hash = roll(hash, dst[pos], dst[pos + BLOCK_SIZE]);
                    }
                    pos += 1;
                }
            }

            if over(out, start_len, limit) {
                out.truncate(start_len);
                return false;
            }
        }

        emit_insert(&dst[insert_from..], out);
        if over(out, start_len, limit) {
            out.truncate(start_len);
            return false;
        }
        true
    }

    /// Tries every candidate base block for `hash`, returning the best
    /// `(src_offset, dst_offset, length)` after forward and backward
    /// extension. Backward extension is bounded by the pending insert
    /// region start.
    fn best_match(
        &self,
        dst: &[u8],
        pos: usize,
        insert_from: usize,
        hash: u32,
    ) -> Option<(usize, usize, usize)> {
        let src = self.index.source();
        let mut best: Option<(usize, usize, usize)> = None;

        self.index.for_each_candidate(hash, |cand| {
            // Forward byte-equality from the block start.
            let max_fwd = (src.len() - cand).min(dst.len() - pos);
            let mut fwd = 0usize;
            while fwd < max_fwd && src[cand + fwd] == dst[pos + fwd] {
                fwd += 1;
            }
            if fwd < BLOCK_SIZE {
                return;
            }

            // Backward into the pending insert region.
            let max_back = cand.min(pos - insert_from);
            let mut back = 0usize;
            while back < max_back && src[cand - back - 1] == dst[pos - back - 1] {
                back += 1;
            }

            let total = back + fwd;
            // Longer wins; equal length prefers more backward extension,
            // which shortens the preceding insert.
            let better = match best {
                None => true,
                Some((_, best_dst, best_len)) => {
                    total > best_len || (total == best_len && pos - back < best_dst)
                }
            };
            if better {
                best = Some((cand - back, pos - back, total));
            }
        });

        best
    }
}

fn over(out: &[u8], start_len: usize, limit: usize) -> bool {
    out.len() - start_len > limit
}

fn emit_insert(mut literal: &[u8], out: &mut Vec<u8>) {
    while !literal.is_empty() {
        let take = literal.len().min(MAX_INSERT);
        out.push(take as u8);
        out.extend_from_slice(&literal[..take]);
        literal = &literal[take..];
    }
}

fn emit_copy(mut offset: usize, mut len: usize, out: &mut Vec<u8>) {
    debug_assert!(offset + len <= u32::MAX as usize, "copy offset exceeds format");
    while len > 0 {
        let take = len.min(MAX_COPY);
        let cmd_at = out.len();
        out.push(0x80);

        let mut cmd = 0x80u8;
        for (bit, shift) in [(0x01u8, 0u32), (0x02, 8), (0x04, 16), (0x08, 24)] {
            let byte = ((offset >> shift) & 0xff) as u8;
            if byte != 0 {
                cmd |= bit;
                out.push(byte);
            }
        }
        // A size of 0x10000 is the implicit encoding: no size bytes.
        if take != MAX_COPY {
            for (bit, shift) in [(0x10u8, 0u32), (0x20, 8)] {
                let byte = ((take >> shift) & 0xff) as u8;
                if byte != 0 {
                    cmd |= bit;
                    out.push(byte);
                }
            }
        }
        out[cmd_at] = cmd;

        offset += take;
        len -= take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::apply::apply_delta;

    fn round_trip(src: &[u8], dst: &[u8]) -> Vec<u8> {
        let delta = encode_delta(src, dst);
        let mut out = Vec::new();
        apply_delta(src, &delta, &mut out, dst.len().max(1)).unwrap();
        assert_eq!(out, dst, "delta did not reproduce the result buffer");
        delta
    }

    #[test]
    fn identical_buffers_compress_to_one_copy_run() {
        let src = vec![0xa7u8; 8192];
        let delta = round_trip(&src, &src);
        // Header plus one copy instruction per 64 KiB (here: one).
        assert!(delta.len() <= 12, "delta too large: {}", delta.len());
    }

    #[test]
    fn small_edit_stays_small() {
        let src = vec![b'a'; 4096];
        let mut dst = src.clone();
        dst[2048..2056].copy_from_slice(b"ZZZZZZZZ");
        let delta = round_trip(&src, &dst);
        assert!(delta.len() <= 40, "delta too large: {}", delta.len());
    }

    #[test]
    fn disjoint_content_becomes_inserts() {
        let src = vec![b'x'; 512];
        let dst: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
        let delta = round_trip(&src, &dst);
        // Worst case bound: result + per-127-byte insert opcodes + header.
        let bound = dst.len() + dst.len().div_ceil(127) + 2 + 3;
        assert!(delta.len() <= bound);
    }

    #[test]
    fn empty_result() {
        let delta = round_trip(b"some base", b"");
        assert_eq!(delta.len(), 2);
    }

    #[test]
    fn empty_source() {
        round_trip(b"", b"fresh content longer than a block....");
    }

    #[test]
    fn copy_spanning_more_than_64k() {
        let src: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let delta = round_trip(&src, &src);
        // 200_000 bytes need four copy instructions.
        assert!(delta.len() <= 4 * 8 + 8);
    }

    #[test]
    fn backward_extension_joins_matches() {
        // dst re-uses src content at an unaligned position; backward
        // extension must absorb the bytes before the aligned block hit.
        let mut src = Vec::new();
        for i in 0..64u8 {
            src.extend_from_slice(&[i; 8]);
        }
        let mut dst = b"prefix!".to_vec();
        dst.extend_from_slice(&src[3..400]);
        round_trip(&src, &dst);
    }

    #[test]
    fn limited_encode_abandons_and_restores_output() {
        let src = vec![b'x'; 64];
        let dst: Vec<u8> = (0..4096u32).map(|i| (i % 249) as u8).collect();
        let index = DeltaIndex::new(&src);
        let encoder = DeltaEncoder::new(&index);

        let mut out = b"keep".to_vec();
        let fit = encoder.encode_limited(&dst, &mut out, 64);
        assert!(!fit);
        assert_eq!(out, b"keep");
    }

    #[test]
    fn encoder_bound_holds_for_random_pairs() {
        // Worst case all-literal bound from the format definition.
        let src: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        let dst: Vec<u8> = (0..1500u32).map(|i| (i * 13 % 256) as u8).collect();
        let delta = round_trip(&src, &dst);
        let bound = dst.len() + 2 + 2 + dst.len().div_ceil(127);
        assert!(delta.len() <= bound);
    }
}
