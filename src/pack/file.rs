//! Memory-mapped pack file access.
//!
//! A [`PackFile`] validates the `"PACK"` header at open, excludes the
//! trailing checksum from the data region so it can never be misparsed as
//! object bytes, and parses entry headers on demand. The full-file trailer
//! verification is separate ([`PackFile::verify_trailer`]) because readers
//! defer it to first whole-pack use.
//!
//! # Invariants
//! - The mapped file is immutable for the life of the handle; stores never
//!   modify a published pack in place.
//! - `data_end` excludes the trailing checksum.
//! - Entry headers are bounded by `MAX_HEADER_BYTES` against corrupt
//!   continuation bits.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use sha1::{Digest, Sha1};

use crate::object::id::{ObjectFormat, ObjectId};
use crate::raw::varint::{self, VarintError};

use super::{OFS_DELTA, PACK_HEADER_SIZE, REF_DELTA};

/// Safety bound for a single entry header (type/size varint + base ref).
const MAX_HEADER_BYTES: usize = 64;

/// Errors from pack file parsing.
#[derive(Debug)]
#[non_exhaustive]
pub enum PackFileError {
    /// File smaller than header + trailer.
    TooSmall,
    /// Missing `"PACK"` signature.
    BadSignature,
    /// Version other than 2 or 3.
    UnsupportedVersion { version: u32 },
    /// Offset does not point at an entry.
    OffsetOutOfRange { offset: u64 },
    /// Entry header exceeded the safety bound or its varint overflowed.
    HeaderTooLong,
    /// Entry data ends past the data region.
    Truncated,
    /// Unknown object type code.
    BadTypeCode { code: u8 },
    /// OFS_DELTA base distance reaches before the pack start.
    OfsUnderflow,
    /// Trailer checksum does not match pack contents.
    ChecksumMismatch,
    /// I/O error while opening or mapping.
    Io(io::Error),
}

impl fmt::Display for PackFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "pack too small"),
            Self::BadSignature => write!(f, "bad pack signature"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported pack version {version}")
            }
            Self::OffsetOutOfRange { offset } => write!(f, "pack offset {offset} out of range"),
            Self::HeaderTooLong => write!(f, "pack entry header exceeded safety bound"),
            Self::Truncated => write!(f, "truncated pack data"),
            Self::BadTypeCode { code } => write!(f, "bad pack object type {code}"),
            Self::OfsUnderflow => write!(f, "OFS_DELTA base before pack start"),
            Self::ChecksumMismatch => write!(f, "pack checksum mismatch"),
            Self::Io(err) => write!(f, "pack I/O error: {err}"),
        }
    }
}

impl std::error::Error for PackFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<VarintError> for PackFileError {
    fn from(err: VarintError) -> Self {
        match err {
            VarintError::Truncated => Self::Truncated,
            VarintError::Overflow => Self::HeaderTooLong,
        }
    }
}

/// Parsed pack entry kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Whole object of the given pack type code (1..=4).
    Whole { type_code: u8 },
    /// Delta whose base lives earlier in the same pack.
    OfsDelta { base_offset: u64 },
    /// Delta whose base is named by id.
    RefDelta { base_id: ObjectId },
}

/// Entry header parsed from a pack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    /// Uncompressed payload size (for deltas: the delta stream size).
    pub size: u64,
    /// Offset where the zlib stream begins.
    pub data_start: usize,
    /// Entry kind.
    pub kind: EntryKind,
}

enum PackData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl PackData {
    #[inline]
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Owned(vec) => vec,
        }
    }
}

/// An opened pack file.
pub struct PackFile {
    path: Option<PathBuf>,
    data: PackData,
    object_count: u32,
    oid_len: usize,
    data_end: usize,
}

impl fmt::Debug for PackFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackFile")
            .field("path", &self.path)
            .field("object_count", &self.object_count)
            .finish_non_exhaustive()
    }
}

impl PackFile {
    /// Opens and memory-maps a pack, validating its header.
    pub fn open(path: &Path, format: ObjectFormat) -> Result<Self, PackFileError> {
        let file = File::open(path).map_err(PackFileError::Io)?;
        // Published packs are immutable; replacement happens by rename.
        let map = unsafe { Mmap::map(&file) }.map_err(PackFileError::Io)?;
        let mut pack = Self::parse(PackData::Mapped(map), format)?;
        pack.path = Some(path.to_owned());
        Ok(pack)
    }

    /// Wraps an in-memory pack buffer, validating its header.
    pub fn from_bytes(bytes: Vec<u8>, format: ObjectFormat) -> Result<Self, PackFileError> {
        Self::parse(PackData::Owned(bytes), format)
    }

    fn parse(data: PackData, format: ObjectFormat) -> Result<Self, PackFileError> {
        let oid_len = format.oid_len() as usize;
        let bytes = data.bytes();
        if bytes.len() < PACK_HEADER_SIZE + 20 {
            return Err(PackFileError::TooSmall);
        }
        if &bytes[0..4] != b"PACK" {
            return Err(PackFileError::BadSignature);
        }
        let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != 2 && version != 3 {
            return Err(PackFileError::UnsupportedVersion { version });
        }
        let object_count = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let data_end = bytes.len() - 20;

        Ok(Self {
            path: None,
            data,
            object_count,
            oid_len,
            data_end,
        })
    }

    /// Declared object count from the header.
    #[inline]
    #[must_use]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// Path the pack was opened from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The trailing checksum bytes.
    #[must_use]
    pub fn trailer(&self) -> &[u8] {
        &self.data.bytes()[self.data_end..]
    }

    /// Verifies the SHA-1 trailer over the full pack body.
    ///
    /// O(pack size); readers call this once at open or defer it to the
    /// first whole-pack operation.
    pub fn verify_trailer(&self) -> Result<(), PackFileError> {
        let bytes = self.data.bytes();
        let mut hasher = Sha1::new();
        hasher.update(&bytes[..self.data_end]);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != bytes[self.data_end..self.data_end + 20] {
            return Err(PackFileError::ChecksumMismatch);
        }
        Ok(())
    }

    /// Parses the entry header at `offset`.
    ///
    /// For delta entries `data_start` points past the base reference, at
    /// the first byte of the zlib stream.
    pub fn entry_header_at(&self, offset: u64) -> Result<EntryHeader, PackFileError> {
        let bytes = self.data.bytes();
        let mut pos = offset as usize;
        if pos < PACK_HEADER_SIZE || pos >= self.data_end {
            return Err(PackFileError::OffsetOutOfRange { offset });
        }

        let (type_code, size) =
            varint::read_entry_header(&bytes[..self.data_end], &mut pos, MAX_HEADER_BYTES)?;

        let kind = match type_code {
            1..=4 => EntryKind::Whole { type_code },
            OFS_DELTA => {
                let distance = varint::read_ofs_distance(&bytes[..self.data_end], &mut pos)?;
                if distance == 0 || distance > offset {
                    return Err(PackFileError::OfsUnderflow);
                }
                EntryKind::OfsDelta {
                    base_offset: offset - distance,
                }
            }
            REF_DELTA => {
                let end = pos + self.oid_len;
                if end > self.data_end {
                    return Err(PackFileError::Truncated);
                }
                let base_id = ObjectId::try_from_raw(&bytes[pos..end])
                    .ok_or(PackFileError::Truncated)?;
                pos = end;
                EntryKind::RefDelta { base_id }
            }
            code => return Err(PackFileError::BadTypeCode { code }),
        };

        Ok(EntryHeader {
            size,
            data_start: pos,
            kind,
        })
    }

    /// Raw bytes from `start` to the end of the data region (trailer
    /// excluded), as zlib input for an entry.
    #[inline]
    #[must_use]
    pub fn zlib_input(&self, start: usize) -> &[u8] {
        debug_assert!(start <= self.data_end, "zlib input start out of range");
        &self.data.bytes()[start..self.data_end]
    }

    /// The entry region: everything between the header and the trailer.
    ///
    /// Cached-pack concatenation copies this verbatim; offset deltas stay
    /// valid because relative distances are preserved.
    #[inline]
    #[must_use]
    pub fn entry_region(&self) -> &[u8] {
        &self.data.bytes()[PACK_HEADER_SIZE..self.data_end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::varint::{write_entry_header, write_ofs_distance};
    use crate::raw::zlib::deflate;

    fn trailer_for(body: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(body);
        hasher.finalize().into()
    }

    fn minimal_pack(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"PACK");
        out.extend_from_slice(&2u32.to_be_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for entry in entries {
            out.extend_from_slice(entry);
        }
        let sum = trailer_for(&out);
        out.extend_from_slice(&sum);
        out
    }

    fn blob_entry(payload: &[u8]) -> Vec<u8> {
        let mut entry = Vec::new();
        write_entry_header(3, payload.len() as u64, &mut entry);
        entry.extend_from_slice(&deflate(payload).unwrap());
        entry
    }

    #[test]
    fn parse_and_verify_minimal_pack() {
        let pack = minimal_pack(&[blob_entry(b"abc")]);
        let file = PackFile::from_bytes(pack, ObjectFormat::Sha1).unwrap();
        assert_eq!(file.object_count(), 1);
        file.verify_trailer().unwrap();

        let header = file.entry_header_at(12).unwrap();
        assert_eq!(header.size, 3);
        assert_eq!(header.kind, EntryKind::Whole { type_code: 3 });

        let mut out = Vec::with_capacity(3);
        crate::raw::zlib::inflate_exact(file.zlib_input(header.data_start), &mut out, 3).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn corrupt_trailer_detected() {
        let mut pack = minimal_pack(&[blob_entry(b"abc")]);
        let len = pack.len();
        pack[len - 1] ^= 0x01;
        let file = PackFile::from_bytes(pack, ObjectFormat::Sha1).unwrap();
        assert!(matches!(
            file.verify_trailer(),
            Err(PackFileError::ChecksumMismatch)
        ));
    }

    #[test]
    fn ofs_delta_header() {
        let base = blob_entry(b"base content....");
        let mut delta_entry = Vec::new();
        let delta_stream = b"\x10\x10\x90\x10"; // not applied here
        write_entry_header(OFS_DELTA, delta_stream.len() as u64, &mut delta_entry);
        write_ofs_distance(base.len() as u64, &mut delta_entry);
        delta_entry.extend_from_slice(&deflate(delta_stream).unwrap());

        let pack = minimal_pack(&[base.clone(), delta_entry]);
        let file = PackFile::from_bytes(pack, ObjectFormat::Sha1).unwrap();

        let delta_offset = 12 + base.len() as u64;
        let header = file.entry_header_at(delta_offset).unwrap();
        assert_eq!(header.kind, EntryKind::OfsDelta { base_offset: 12 });
    }

    #[test]
    fn ref_delta_header() {
        let base_id = ObjectId::sha1([0x77; 20]);
        let mut entry = Vec::new();
        write_entry_header(REF_DELTA, 4, &mut entry);
        entry.extend_from_slice(base_id.as_slice());
        entry.extend_from_slice(&deflate(b"\x03\x03zzz").unwrap());

        let pack = minimal_pack(&[entry]);
        let file = PackFile::from_bytes(pack, ObjectFormat::Sha1).unwrap();
        let header = file.entry_header_at(12).unwrap();
        assert_eq!(header.kind, EntryKind::RefDelta { base_id });
    }

    #[test]
    fn rejects_bad_signature() {
        let mut pack = minimal_pack(&[blob_entry(b"x")]);
        pack[0] = b'K';
        assert!(matches!(
            PackFile::from_bytes(pack, ObjectFormat::Sha1),
            Err(PackFileError::BadSignature)
        ));
    }

    #[test]
    fn rejects_out_of_range_offset() {
        let pack = minimal_pack(&[blob_entry(b"x")]);
        let len = pack.len() as u64;
        let file = PackFile::from_bytes(pack, ObjectFormat::Sha1).unwrap();
        assert!(matches!(
            file.entry_header_at(3),
            Err(PackFileError::OffsetOutOfRange { .. })
        ));
        assert!(matches!(
            file.entry_header_at(len),
            Err(PackFileError::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn ofs_underflow_rejected() {
        let mut entry = Vec::new();
        write_entry_header(OFS_DELTA, 4, &mut entry);
        write_ofs_distance(500, &mut entry); // reaches before the header
        entry.extend_from_slice(&deflate(b"abcd").unwrap());
        let pack = minimal_pack(&[entry]);
        let file = PackFile::from_bytes(pack, ObjectFormat::Sha1).unwrap();
        assert!(matches!(
            file.entry_header_at(12),
            Err(PackFileError::OfsUnderflow)
        ));
    }
}
