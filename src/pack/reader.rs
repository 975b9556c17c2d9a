//! Random-access object inflation from a pack + index pair.
//!
//! Resolving an object walks its delta chain to the base, then re-applies
//! deltas forward. Chains are bounded by a configurable depth, and offset
//! cycles (possible through corrupt REF_DELTA links) are detected rather
//! than looped. The session's [`DeltaBaseCache`] short-circuits chains
//! whose base was inflated recently.
//!
//! # Invariants
//! - The index trailer is verified at open; the pack trailer is verified
//!   at open ([`PackReader::open_pair`]) or by an explicit call.
//! - Every index offset must land inside the pack's data region; offsets
//!   are re-validated as entries are parsed.

use std::fmt;
use std::path::Path;

use crate::delta::apply::{apply_delta, delta_header_sizes, DeltaApplyError};
use crate::object::id::{AbbrevId, ObjectFormat, ObjectId};
use crate::object::kind::ObjectKind;
use crate::raw::zlib::{inflate_exact, InflateError};

use super::cache::DeltaBaseCache;
use super::file::{EntryHeader, EntryKind, PackFile, PackFileError};
use super::idx::{IdxError, PackIndex};

/// Limits for pack object resolution.
#[derive(Clone, Copy, Debug)]
pub struct PackReadLimits {
    /// Hard cap on any inflated object or delta stream.
    pub max_object_bytes: usize,
    /// Maximum delta edges from an entry down to its whole base.
    pub max_delta_depth: u32,
}

impl Default for PackReadLimits {
    fn default() -> Self {
        Self {
            max_object_bytes: 512 * 1024 * 1024,
            max_delta_depth: 64,
        }
    }
}

/// Errors from pack object resolution.
#[derive(Debug)]
#[non_exhaustive]
pub enum PackReadError {
    /// Object id not present in this pack.
    NotFound { id: ObjectId },
    /// Pack structure is corrupt.
    Pack(PackFileError),
    /// Index structure is corrupt.
    Idx(IdxError),
    /// zlib stream is corrupt or over limit.
    Inflate(InflateError),
    /// Delta stream is corrupt.
    Delta(DeltaApplyError),
    /// REF_DELTA base id missing from the pack.
    MissingBase { base_id: ObjectId },
    /// Delta chain revisited an offset.
    DeltaBaseCycle { offset: u64 },
    /// Delta chain exceeded the configured depth.
    DeltaDepthExceeded { max_depth: u32 },
    /// Object or delta larger than the configured cap.
    ObjectTooLarge { size: u64, max: usize },
}

impl fmt::Display for PackReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "object {id} not in pack"),
            Self::Pack(err) => write!(f, "{err}"),
            Self::Idx(err) => write!(f, "{err}"),
            Self::Inflate(err) => write!(f, "{err}"),
            Self::Delta(err) => write!(f, "{err}"),
            Self::MissingBase { base_id } => write!(f, "delta base {base_id} not in pack"),
            Self::DeltaBaseCycle { offset } => {
                write!(f, "delta base cycle through offset {offset}")
            }
            Self::DeltaDepthExceeded { max_depth } => {
                write!(f, "delta chain deeper than {max_depth}")
            }
            Self::ObjectTooLarge { size, max } => {
                write!(f, "object of {size} bytes exceeds cap {max}")
            }
        }
    }
}

impl std::error::Error for PackReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pack(err) => Some(err),
            Self::Idx(err) => Some(err),
            Self::Inflate(err) => Some(err),
            Self::Delta(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PackFileError> for PackReadError {
    fn from(err: PackFileError) -> Self {
        Self::Pack(err)
    }
}

impl From<IdxError> for PackReadError {
    fn from(err: IdxError) -> Self {
        Self::Idx(err)
    }
}

impl From<InflateError> for PackReadError {
    fn from(err: InflateError) -> Self {
        Self::Inflate(err)
    }
}

impl From<DeltaApplyError> for PackReadError {
    fn from(err: DeltaApplyError) -> Self {
        Self::Delta(err)
    }
}

/// A pack + index pair with random-access object resolution.
pub struct PackReader {
    file: PackFile,
    index: PackIndex,
    limits: PackReadLimits,
    /// Session-local cache key distinguishing this pack from its siblings.
    token: u32,
}

impl fmt::Debug for PackReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackReader")
            .field("objects", &self.index.object_count())
            .finish_non_exhaustive()
    }
}

impl PackReader {
    /// Opens a `pack-<hex>.pack` / `.idx` pair, verifying both trailers
    /// and that the index's recorded pack checksum matches the pack.
    pub fn open_pair(
        pack_path: &Path,
        idx_path: &Path,
        format: ObjectFormat,
        limits: PackReadLimits,
        token: u32,
    ) -> Result<Self, PackReadError> {
        let index = PackIndex::open(idx_path, format)?;
        let file = PackFile::open(pack_path, format)?;
        file.verify_trailer()?;
        if index.pack_checksum() != file.trailer() {
            return Err(PackReadError::Idx(IdxError::Corrupt {
                detail: "index does not belong to this pack",
            }));
        }
        Ok(Self {
            file,
            index,
            limits,
            token,
        })
    }

    /// Wraps already-parsed components (used by tests and the inbound
    /// pack indexer immediately after writing a pair).
    pub fn from_parts(
        file: PackFile,
        index: PackIndex,
        limits: PackReadLimits,
        token: u32,
    ) -> Self {
        Self {
            file,
            index,
            limits,
            token,
        }
    }

    /// Number of objects in this pack.
    #[must_use]
    pub fn object_count(&self) -> u32 {
        self.index.object_count()
    }

    /// The pack's index.
    #[must_use]
    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// True when `id` is present.
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains(id)
    }

    /// Pack offset for `id`, if present.
    #[must_use]
    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        let pos = self.index.find(id)?;
        self.index.offset_at(pos).ok()
    }

    /// Appends prefix matches to `out`, up to `limit`.
    pub fn resolve_prefix(&self, prefix: &AbbrevId, out: &mut Vec<ObjectId>, limit: usize) -> usize {
        self.index.resolve_prefix(prefix, out, limit)
    }

    /// Inflates the object with id `id`.
    pub fn read(
        &self,
        id: &ObjectId,
        cache: &mut DeltaBaseCache,
    ) -> Result<(ObjectKind, Vec<u8>), PackReadError> {
        let offset = self
            .find_offset(id)
            .ok_or(PackReadError::NotFound { id: *id })?;
        self.read_at(offset, cache)
    }

    /// Inflates the object whose entry header begins at `offset`.
    ///
    /// Delta chains are followed by offset (OFS_DELTA) or through the index
    /// (REF_DELTA); the result is the fully reconstructed object.
    pub fn read_at(
        &self,
        offset: u64,
        cache: &mut DeltaBaseCache,
    ) -> Result<(ObjectKind, Vec<u8>), PackReadError> {
        // Walk down to the whole base, stacking delta streams.
        let mut deltas: Vec<Vec<u8>> = Vec::new();
        let mut visited: Vec<u64> = Vec::new();
        let mut cursor = offset;

        let (base_kind, mut content) = loop {
            if let Some((kind, bytes)) = cache.get(self.token, cursor) {
                break (kind, bytes.to_vec());
            }
            if visited.contains(&cursor) {
                return Err(PackReadError::DeltaBaseCycle { offset: cursor });
            }
            if visited.len() as u32 > self.limits.max_delta_depth {
                return Err(PackReadError::DeltaDepthExceeded {
                    max_depth: self.limits.max_delta_depth,
                });
            }
            visited.push(cursor);

            let header = self.file.entry_header_at(cursor)?;
            self.check_size(header.size)?;

            match header.kind {
                EntryKind::Whole { type_code } => {
                    let kind = ObjectKind::from_pack_code(type_code)
                        .ok_or(PackReadError::Pack(PackFileError::BadTypeCode {
                            code: type_code,
                        }))?;
                    let bytes = self.inflate_entry(&header)?;
                    break (kind, bytes);
                }
                EntryKind::OfsDelta { base_offset } => {
                    deltas.push(self.inflate_entry(&header)?);
                    cursor = base_offset;
                }
                EntryKind::RefDelta { base_id } => {
                    deltas.push(self.inflate_entry(&header)?);
                    cursor = self
                        .find_offset(&base_id)
                        .ok_or(PackReadError::MissingBase { base_id })?;
                }
            }
        };

        // Re-apply deltas from the base outward, caching intermediates.
        let mut depth_offsets = visited;
        // The offset stack parallels the delta stack plus the base entry.
        depth_offsets.truncate(deltas.len() + 1);

        let mut out = Vec::new();
        while let Some(delta) = deltas.pop() {
            let (_, result_size) = delta_header_sizes(&delta)?;
            self.check_size(result_size)?;
            apply_delta(&content, &delta, &mut out, self.limits.max_object_bytes)?;
            std::mem::swap(&mut content, &mut out);

            if let Some(&at) = depth_offsets.get(deltas.len()) {
                cache.put(self.token, at, base_kind, content.clone());
            }
        }

        Ok((base_kind, content))
    }

    /// Kind and inflated size of the object at `offset`, without
    /// materializing delta results (the result size is read from the
    /// delta header).
    pub fn stat_at(&self, offset: u64) -> Result<(ObjectKind, u64), PackReadError> {
        let mut cursor = offset;
        let mut hops = 0u32;
        let mut result_size: Option<u64> = None;

        loop {
            if hops > self.limits.max_delta_depth {
                return Err(PackReadError::DeltaDepthExceeded {
                    max_depth: self.limits.max_delta_depth,
                });
            }
            let header = self.file.entry_header_at(cursor)?;
            match header.kind {
                EntryKind::Whole { type_code } => {
                    let kind = ObjectKind::from_pack_code(type_code)
                        .ok_or(PackReadError::Pack(PackFileError::BadTypeCode {
                            code: type_code,
                        }))?;
                    return Ok((kind, result_size.unwrap_or(header.size)));
                }
                EntryKind::OfsDelta { base_offset } => {
                    if result_size.is_none() {
                        result_size = Some(self.delta_result_size(&header)?);
                    }
                    cursor = base_offset;
                }
                EntryKind::RefDelta { base_id } => {
                    if result_size.is_none() {
                        result_size = Some(self.delta_result_size(&header)?);
                    }
                    cursor = self
                        .find_offset(&base_id)
                        .ok_or(PackReadError::MissingBase { base_id })?;
                }
            }
            hops += 1;
        }
    }

    fn delta_result_size(&self, header: &EntryHeader) -> Result<u64, PackReadError> {
        let delta = self.inflate_entry(header)?;
        let (_, result) = delta_header_sizes(&delta)?;
        Ok(result)
    }

    fn inflate_entry(&self, header: &EntryHeader) -> Result<Vec<u8>, PackReadError> {
        let size = header.size as usize;
        let mut out = Vec::with_capacity(size);
        inflate_exact(self.file.zlib_input(header.data_start), &mut out, size)?;
        Ok(out)
    }

    fn check_size(&self, size: u64) -> Result<(), PackReadError> {
        if size > self.limits.max_object_bytes as u64 {
            return Err(PackReadError::ObjectTooLarge {
                size,
                max: self.limits.max_object_bytes,
            });
        }
        Ok(())
    }
}
