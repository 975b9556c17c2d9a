//! Pack index readers for the v1 and v2 on-disk formats.
//!
//! # Layout (v2)
//! ```text
//! +----------------+
//! | Magic (4B)     |  0xff 't' 'O' 'c'
//! | Version (4B)   |  Big-endian 2
//! +----------------+
//! | Fanout (1024B) |  256 * u32 BE cumulative counts
//! +----------------+
//! | OID Table      |  N * oid_len bytes (sorted)
//! +----------------+
//! | CRC Table      |  N * 4 bytes
//! +----------------+
//! | Offset Table   |  N * 4 bytes (MSB=1 -> large offset)
//! +----------------+
//! | Large Offsets  |  M * 8 bytes (optional)
//! +----------------+
//! | Pack Checksum  |  oid_len bytes
//! | Idx Checksum   |  oid_len bytes
//! +----------------+
//! ```
//!
//! # Layout (v1)
//! Fanout, then N records of `(u32 BE offset, oid)` sorted by oid, then the
//! two checksums. v1 has no magic; it is detected by the absence of the v2
//! magic (as `fanout[0]` the magic would be an impossible object count).
//!
//! # Invariants
//! - All table ranges are validated to lie within the file.
//! - `object_count == fanout[255]` and fanout is non-decreasing.
//! - OIDs are strictly ascending (validated lazily by lookups, eagerly by
//!   [`PackIndex::verify_order`]).
//! - The index trailer checksum is verified at open.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;
use sha1::{Digest, Sha1};

use crate::object::id::{AbbrevId, ObjectFormat, ObjectId};

/// Pack index magic bytes for the v2 format.
pub(crate) const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
/// Fanout table size in bytes.
pub(crate) const FANOUT_SIZE: usize = 256 * 4;
/// Header size of a v2 index (magic + version).
pub(crate) const V2_HEADER_SIZE: usize = 8;
/// MSB flag marking a large-offset indirection in the v2 offset table.
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;
/// Maximum index file size (2 GiB, conservative).
const MAX_IDX_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Index format version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdxVersion {
    /// Legacy fanout + (offset, oid) records.
    V1,
    /// Magic-prefixed format with CRCs and 64-bit offset support.
    V2,
}

/// Errors from pack index parsing and lookups.
#[derive(Debug)]
#[non_exhaustive]
pub enum IdxError {
    /// Index file is corrupt or malformed.
    Corrupt { detail: &'static str },
    /// Index version is not supported.
    UnsupportedVersion { version: u32 },
    /// Index file exceeds the size limit.
    TooLarge { size: u64, max: u64 },
    /// Large offset indirection out of bounds.
    LargeOffsetOutOfBounds { index: u32, count: u32 },
    /// Trailer checksum does not match the file contents.
    ChecksumMismatch,
    /// I/O error while opening or mapping.
    Io(io::Error),
}

impl IdxError {
    #[inline]
    pub(crate) const fn corrupt(detail: &'static str) -> Self {
        Self::Corrupt { detail }
    }
}

impl fmt::Display for IdxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt pack index: {detail}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported pack index version: {version}")
            }
            Self::TooLarge { size, max } => {
                write!(f, "pack index too large: {size} bytes (max: {max})")
            }
            Self::LargeOffsetOutOfBounds { index, count } => {
                write!(f, "large offset index out of bounds: {index} >= {count}")
            }
            Self::ChecksumMismatch => write!(f, "pack index checksum mismatch"),
            Self::Io(err) => write!(f, "pack index I/O error: {err}"),
        }
    }
}

impl std::error::Error for IdxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

enum IdxData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl IdxData {
    #[inline]
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Owned(vec) => vec,
        }
    }
}

/// An opened pack index (v1 or v2).
///
/// Lookups are fanout-bucketed binary search: O(1) bucket selection plus
/// O(log bucket) probes.
pub struct PackIndex {
    data: IdxData,
    version: IdxVersion,
    format: ObjectFormat,
    object_count: u32,
    fanout_start: usize,
    oid_table: usize,
    crc_table: usize,
    offset_table: usize,
    large_offsets: usize,
    large_offset_count: u32,
}

impl fmt::Debug for PackIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackIndex")
            .field("version", &self.version)
            .field("object_count", &self.object_count)
            .finish_non_exhaustive()
    }
}

impl PackIndex {
    /// Opens and memory-maps an index file, verifying its trailer.
    pub fn open(path: &Path, format: ObjectFormat) -> Result<Self, IdxError> {
        let file = File::open(path).map_err(IdxError::Io)?;
        // The mapped file is a published, immutable pack index; writers
        // never modify one in place, they rename fresh files into place.
        let map = unsafe { Mmap::map(&file) }.map_err(IdxError::Io)?;
        Self::parse(IdxData::Mapped(map), format)
    }

    /// Parses an index from an in-memory buffer, verifying its trailer.
    pub fn from_bytes(bytes: Vec<u8>, format: ObjectFormat) -> Result<Self, IdxError> {
        Self::parse(IdxData::Owned(bytes), format)
    }

    fn parse(data: IdxData, format: ObjectFormat) -> Result<Self, IdxError> {
        let bytes = data.bytes();
        if bytes.len() as u64 > MAX_IDX_SIZE {
            return Err(IdxError::TooLarge {
                size: bytes.len() as u64,
                max: MAX_IDX_SIZE,
            });
        }
        let oid_len = format.oid_len() as usize;
        let checksums = oid_len.max(20) + 20; // pack checksum + idx SHA-1 trailer

        let (version, fanout_start) = if bytes.len() >= 4 && bytes[0..4] == IDX_MAGIC {
            if bytes.len() < V2_HEADER_SIZE {
                return Err(IdxError::corrupt("file too small"));
            }
            let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            if version != 2 {
                return Err(IdxError::UnsupportedVersion { version });
            }
            (IdxVersion::V2, V2_HEADER_SIZE)
        } else {
            (IdxVersion::V1, 0)
        };

        if bytes.len() < fanout_start + FANOUT_SIZE + checksums {
            return Err(IdxError::corrupt("file too small"));
        }

        let object_count = validate_fanout(&bytes[fanout_start..fanout_start + FANOUT_SIZE])?;
        let n = object_count as usize;
        let tables_start = fanout_start + FANOUT_SIZE;

        let mut index = Self {
            version,
            format,
            object_count,
            fanout_start,
            oid_table: 0,
            crc_table: 0,
            offset_table: 0,
            large_offsets: 0,
            large_offset_count: 0,
            data,
        };
        let bytes = index.data.bytes();

        match version {
            IdxVersion::V1 => {
                // Records are (u32 offset, oid) pairs; tables are interleaved.
                let record = 4 + oid_len;
                let expect = tables_start + n * record + 2 * 20;
                if bytes.len() != expect {
                    return Err(IdxError::corrupt("v1 record area size mismatch"));
                }
                index.offset_table = tables_start;
                index.oid_table = tables_start; // offset computed per record
            }
            IdxVersion::V2 => {
                let oid_table = tables_start;
                let crc_table = oid_table + n * oid_len;
                let offset_table = crc_table + n * 4;
                let large_offsets = offset_table + n * 4;
                let trailer_start = bytes
                    .len()
                    .checked_sub(2 * 20)
                    .ok_or(IdxError::corrupt("file too small"))?;
                if large_offsets > trailer_start {
                    return Err(IdxError::corrupt("v2 tables exceed file"));
                }
                let large_len = trailer_start - large_offsets;
                if large_len % 8 != 0 {
                    return Err(IdxError::corrupt("large offset table not 8-byte records"));
                }
                index.oid_table = oid_table;
                index.crc_table = crc_table;
                index.offset_table = offset_table;
                index.large_offsets = large_offsets;
                index.large_offset_count = (large_len / 8) as u32;
            }
        }

        index.verify_trailer()?;
        Ok(index)
    }

    /// Verifies the index SHA-1 trailer over the preceding bytes.
    fn verify_trailer(&self) -> Result<(), IdxError> {
        let bytes = self.data.bytes();
        let body_end = bytes.len() - 20;
        let mut hasher = Sha1::new();
        hasher.update(&bytes[..body_end]);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != bytes[body_end..] {
            return Err(IdxError::ChecksumMismatch);
        }
        Ok(())
    }

    /// Number of objects indexed.
    #[inline]
    #[must_use]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// Index format version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> IdxVersion {
        self.version
    }

    /// Object id format.
    #[inline]
    #[must_use]
    pub fn format(&self) -> ObjectFormat {
        self.format
    }

    /// The pack checksum recorded in the trailer area.
    #[must_use]
    pub fn pack_checksum(&self) -> &[u8] {
        let bytes = self.data.bytes();
        &bytes[bytes.len() - 40..bytes.len() - 20]
    }

    #[inline]
    fn fanout(&self, first_byte: u8) -> u32 {
        let off = self.fanout_start + first_byte as usize * 4;
        let bytes = self.data.bytes();
        u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
    }

    /// OID bytes of the object at sorted position `idx`.
    #[must_use]
    pub fn oid_at(&self, idx: u32) -> &[u8] {
        debug_assert!(idx < self.object_count, "oid index out of bounds");
        let oid_len = self.format.oid_len() as usize;
        let bytes = self.data.bytes();
        match self.version {
            IdxVersion::V1 => {
                let record = 4 + oid_len;
                let start = self.oid_table + idx as usize * record + 4;
                &bytes[start..start + oid_len]
            }
            IdxVersion::V2 => {
                let start = self.oid_table + idx as usize * oid_len;
                &bytes[start..start + oid_len]
            }
        }
    }

    /// CRC-32 of the entry at position `idx` (v2 only).
    #[must_use]
    pub fn crc_at(&self, idx: u32) -> Option<u32> {
        debug_assert!(idx < self.object_count, "crc index out of bounds");
        match self.version {
            IdxVersion::V1 => None,
            IdxVersion::V2 => {
                let off = self.crc_table + idx as usize * 4;
                let bytes = self.data.bytes();
                Some(u32::from_be_bytes([
                    bytes[off],
                    bytes[off + 1],
                    bytes[off + 2],
                    bytes[off + 3],
                ]))
            }
        }
    }

    /// Pack offset of the object at position `idx`.
    pub fn offset_at(&self, idx: u32) -> Result<u64, IdxError> {
        debug_assert!(idx < self.object_count, "offset index out of bounds");
        let bytes = self.data.bytes();
        match self.version {
            IdxVersion::V1 => {
                let record = 4 + self.format.oid_len() as usize;
                let off = self.offset_table + idx as usize * record;
                Ok(u32::from_be_bytes([
                    bytes[off],
                    bytes[off + 1],
                    bytes[off + 2],
                    bytes[off + 3],
                ]) as u64)
            }
            IdxVersion::V2 => {
                let off = self.offset_table + idx as usize * 4;
                let raw = u32::from_be_bytes([
                    bytes[off],
                    bytes[off + 1],
                    bytes[off + 2],
                    bytes[off + 3],
                ]);
                if raw & LARGE_OFFSET_FLAG != 0 {
                    self.resolve_large_offset(raw & !LARGE_OFFSET_FLAG)
                } else {
                    Ok(raw as u64)
                }
            }
        }
    }

    fn resolve_large_offset(&self, idx: u32) -> Result<u64, IdxError> {
        if idx >= self.large_offset_count {
            return Err(IdxError::LargeOffsetOutOfBounds {
                index: idx,
                count: self.large_offset_count,
            });
        }
        let off = self.large_offsets + idx as usize * 8;
        let bytes = self.data.bytes();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[off..off + 8]);
        Ok(u64::from_be_bytes(raw))
    }

    /// Finds the sorted position of `id`, if present.
    #[must_use]
    pub fn find(&self, id: &ObjectId) -> Option<u32> {
        let first = id.first_byte();
        let hi = self.fanout(first);
        let lo = if first == 0 { 0 } else { self.fanout(first - 1) };

        let target = id.as_slice();
        let (mut lo, mut hi) = (lo, hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_at(mid).cmp(target) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// True when `id` is present.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.find(id).is_some()
    }

    /// Appends up to `limit` ids matching the abbreviated prefix to `out`.
    ///
    /// Returns the number of matches appended (saturating at `limit`).
    pub fn resolve_prefix(&self, prefix: &AbbrevId, out: &mut Vec<ObjectId>, limit: usize) -> usize {
        if limit == 0 {
            return 0;
        }
        let first = prefix.first_byte();
        let hi = self.fanout(first);
        let mut lo = if first == 0 { 0 } else { self.fanout(first - 1) };

        // Binary search to the first candidate >= prefix, then scan.
        let mut hi_b = hi;
        while lo < hi_b {
            let mid = lo + (hi_b - lo) / 2;
            if prefix_cmp_less(self.oid_at(mid), prefix) {
                lo = mid + 1;
            } else {
                hi_b = mid;
            }
        }

        let mut added = 0usize;
        let mut idx = lo;
        while idx < hi && added < limit {
            let oid = self.oid_at(idx);
            if !prefix.matches_raw(oid) {
                break;
            }
            if let Some(id) = ObjectId::try_from_raw(oid) {
                out.push(id);
                added += 1;
            }
            idx += 1;
        }
        added
    }

    /// Verifies strict ascending OID order across the whole table.
    pub fn verify_order(&self) -> Result<(), IdxError> {
        for idx in 1..self.object_count {
            if self.oid_at(idx - 1) >= self.oid_at(idx) {
                return Err(IdxError::corrupt("oid table not strictly ascending"));
            }
        }
        Ok(())
    }

    /// Iterates `(oid bytes, position)` pairs in sorted order.
    pub fn iter_oids(&self) -> impl Iterator<Item = (&[u8], u32)> + '_ {
        (0..self.object_count).map(move |idx| (self.oid_at(idx), idx))
    }
}

/// True when `oid` sorts strictly before every id carrying `prefix`.
///
/// The prefix is zero-padded for comparison, so it is the smallest value
/// in its match range.
fn prefix_cmp_less(oid: &[u8], prefix: &AbbrevId) -> bool {
    let raw = prefix.raw_prefix();
    let head = &oid[..raw.len().min(oid.len())];
    head < raw && !prefix.matches_raw(oid)
}

fn validate_fanout(fanout: &[u8]) -> Result<u32, IdxError> {
    debug_assert!(fanout.len() == FANOUT_SIZE);
    let mut prev = 0u32;
    for i in 0..256 {
        let off = i * 4;
        let val = u32::from_be_bytes([
            fanout[off],
            fanout[off + 1],
            fanout[off + 2],
            fanout[off + 3],
        ]);
        if val < prev {
            return Err(IdxError::corrupt("fanout not monotonic"));
        }
        prev = val;
    }
    Ok(prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::idx_write::{write_index_v1, write_index_v2, IndexEntry};

    fn entry(fill: u8, offset: u64) -> IndexEntry {
        IndexEntry {
            id: ObjectId::sha1([fill; 20]),
            offset,
            crc: u32::from(fill),
        }
    }

    fn build_v2(entries: &[IndexEntry]) -> PackIndex {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        let bytes = write_index_v2(&sorted, &[0xee; 20]);
        PackIndex::from_bytes(bytes, ObjectFormat::Sha1).unwrap()
    }

    #[test]
    fn v2_lookup_and_offsets() {
        let idx = build_v2(&[entry(0x11, 100), entry(0x22, 200), entry(0x33, 300)]);
        assert_eq!(idx.version(), IdxVersion::V2);
        assert_eq!(idx.object_count(), 3);

        let id = ObjectId::sha1([0x22; 20]);
        let pos = idx.find(&id).unwrap();
        assert_eq!(idx.offset_at(pos).unwrap(), 200);
        assert_eq!(idx.crc_at(pos), Some(0x22));
        assert!(!idx.contains(&ObjectId::sha1([0x44; 20])));
    }

    #[test]
    fn v2_large_offsets() {
        let big = 0x1_0000_0000u64;
        let idx = build_v2(&[entry(0x10, 12), entry(0x20, big), entry(0x30, big + 8)]);
        let pos = idx.find(&ObjectId::sha1([0x20; 20])).unwrap();
        assert_eq!(idx.offset_at(pos).unwrap(), big);
        let pos = idx.find(&ObjectId::sha1([0x30; 20])).unwrap();
        assert_eq!(idx.offset_at(pos).unwrap(), big + 8);
    }

    #[test]
    fn v1_lookup() {
        let mut entries = vec![entry(0x11, 100), entry(0xa0, 555)];
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let bytes = write_index_v1(&entries, &[0xee; 20]);
        let idx = PackIndex::from_bytes(bytes, ObjectFormat::Sha1).unwrap();
        assert_eq!(idx.version(), IdxVersion::V1);
        assert_eq!(idx.object_count(), 2);

        let pos = idx.find(&ObjectId::sha1([0xa0; 20])).unwrap();
        assert_eq!(idx.offset_at(pos).unwrap(), 555);
        assert_eq!(idx.crc_at(pos), None);
    }

    #[test]
    fn trailer_corruption_detected() {
        let mut sorted = vec![entry(0x11, 100)];
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        let mut bytes = write_index_v2(&sorted, &[0xee; 20]);
        let len = bytes.len();
        bytes[len / 2] ^= 0xff;
        assert!(matches!(
            PackIndex::from_bytes(bytes, ObjectFormat::Sha1),
            Err(IdxError::ChecksumMismatch) | Err(IdxError::Corrupt { .. })
        ));
    }

    #[test]
    fn resolve_prefix_returns_all_matches() {
        let mut id_a = [0x55u8; 20];
        id_a[19] = 1;
        let mut id_b = [0x55u8; 20];
        id_b[19] = 2;
        let entries = vec![
            IndexEntry {
                id: ObjectId::sha1(id_a),
                offset: 1,
                crc: 0,
            },
            IndexEntry {
                id: ObjectId::sha1(id_b),
                offset: 2,
                crc: 0,
            },
            entry(0x66, 3),
        ];
        let idx = build_v2(&entries);

        let prefix = AbbrevId::from_hex(b"5555").unwrap();
        let mut out = Vec::new();
        let n = idx.resolve_prefix(&prefix, &mut out, 8);
        assert_eq!(n, 2);

        let mut out = Vec::new();
        let n = idx.resolve_prefix(&prefix, &mut out, 1);
        assert_eq!(n, 1);
    }

    #[test]
    fn verify_order_accepts_sorted() {
        let idx = build_v2(&[entry(0x01, 1), entry(0x02, 2)]);
        idx.verify_order().unwrap();
    }

    #[test]
    fn fanout_is_count_at_255() {
        let idx = build_v2(&[entry(0x01, 1), entry(0xff, 2)]);
        assert_eq!(idx.fanout(0xff), 2);
        assert_eq!(idx.fanout(0x00), 0);
        assert_eq!(idx.fanout(0x01), 1);
    }
}
