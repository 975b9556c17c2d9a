//! Inbound pack indexing: parse a received pack stream, resolve every
//! delta, complete thin packs, and install the `.pack`/`.idx` pair.
//!
//! The stream is buffered whole (bounded by [`ParserConfig`]), the trailer
//! is verified against the received bytes, and each entry's CRC-32 is
//! computed over its on-disk form for the index. REF_DELTA bases absent
//! from the pack are fetched from the local store through a caller-provided
//! lookup and appended to the pack ("fixing" the thin pack), after which
//! the trailer is recomputed; the installed pack is always self-contained.
//!
//! Installation is atomic for readers: `pack-<hex>.pack.tmp` and
//! `pack-<hex>.idx.tmp` are fully written and synced, then the index is
//! renamed into place, then the pack. A reader scanning between the two
//! renames sees an index without its pack and skips it.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::delta::apply::{apply_delta, DeltaApplyError};
use crate::monitor::ProgressMonitor;
use crate::object::id::{ObjectFormat, ObjectId};
use crate::object::kind::ObjectKind;
use crate::raw::hashing::{crc32, hash_object};
use crate::raw::varint::{self, VarintError};
use crate::raw::zlib::{deflate, inflate_limited, InflateError};

use super::idx_write::{write_index_v2, IndexEntry};
use super::reader::PackReadLimits;
use super::{OFS_DELTA, PACK_HEADER_SIZE, REF_DELTA};

/// Bound for one entry's header bytes.
const MAX_HEADER_BYTES: usize = 64;

/// Limits and options for inbound pack parsing.
#[derive(Clone, Copy, Debug)]
pub struct ParserConfig {
    /// Hard cap on the buffered pack stream.
    pub max_pack_bytes: u64,
    /// Object size and delta depth caps during resolution.
    pub limits: PackReadLimits,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_pack_bytes: 4 * 1024 * 1024 * 1024,
            limits: PackReadLimits::default(),
        }
    }
}

/// Counters reported after a parse.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParserStats {
    /// Objects declared by the pack header.
    pub object_count: u32,
    /// Entries stored as deltas.
    pub delta_count: u32,
    /// Local bases appended to complete a thin pack.
    pub thin_bases_added: u32,
    /// Final pack size, trailer included.
    pub pack_bytes: u64,
}

/// Errors from inbound pack parsing.
#[derive(Debug)]
#[non_exhaustive]
pub enum ParseError {
    /// Header is malformed or the version is unsupported.
    BadHeader { detail: &'static str },
    /// Stream bytes violate the pack format.
    Corrupt { detail: String },
    /// The received trailer does not hash the received bytes.
    TrailerMismatch,
    /// A REF_DELTA base is neither in the pack nor available locally.
    MissingBase { base_id: ObjectId },
    /// Delta chain exceeded the configured depth.
    DeltaDepthExceeded { max_depth: u32 },
    /// Stream exceeds the configured size cap.
    TooLarge { max: u64 },
    /// Cancellation observed between chunks.
    Cancelled,
    /// Underlying stream failure.
    Io(io::Error),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadHeader { detail } => write!(f, "bad pack header: {detail}"),
            Self::Corrupt { detail } => write!(f, "corrupt pack stream: {detail}"),
            Self::TrailerMismatch => write!(f, "pack trailer checksum mismatch"),
            Self::MissingBase { base_id } => {
                write!(f, "thin pack base {base_id} not available locally")
            }
            Self::DeltaDepthExceeded { max_depth } => {
                write!(f, "delta chain deeper than {max_depth}")
            }
            Self::TooLarge { max } => write!(f, "pack stream exceeds {max} bytes"),
            Self::Cancelled => write!(f, "pack receive cancelled"),
            Self::Io(err) => write!(f, "pack stream I/O error: {err}"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ParseError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<VarintError> for ParseError {
    fn from(err: VarintError) -> Self {
        Self::Corrupt {
            detail: err.to_string(),
        }
    }
}

impl From<InflateError> for ParseError {
    fn from(err: InflateError) -> Self {
        Self::Corrupt {
            detail: err.to_string(),
        }
    }
}

impl From<DeltaApplyError> for ParseError {
    fn from(err: DeltaApplyError) -> Self {
        Self::Corrupt {
            detail: err.to_string(),
        }
    }
}

/// Provider of delta bases that live outside the received pack.
///
/// Returning `None` makes the parse fail with [`ParseError::MissingBase`];
/// a receiver that forbids thin packs passes a provider that always does.
pub trait ExternalBases {
    /// Looks up a base object by id.
    fn base(&mut self, id: &ObjectId) -> Option<(ObjectKind, Vec<u8>)>;
}

impl<F: FnMut(&ObjectId) -> Option<(ObjectKind, Vec<u8>)>> ExternalBases for F {
    fn base(&mut self, id: &ObjectId) -> Option<(ObjectKind, Vec<u8>)> {
        self(id)
    }
}

/// Refuses every external base; rejects thin packs outright.
pub struct NoExternalBases;

impl ExternalBases for NoExternalBases {
    fn base(&mut self, _id: &ObjectId) -> Option<(ObjectKind, Vec<u8>)> {
        None
    }
}

#[derive(Clone, Debug)]
enum EntryBase {
    None,
    Offset(u64),
    Id(ObjectId),
}

/// Incrementally buffered pack stream.
///
/// Keeps every byte read so far (the pack is re-sliced during delta
/// resolution) and refills in bounded chunks, so the reader never runs
/// past the trailer by more than one chunk of lookahead.
struct PackStream<'a> {
    input: &'a mut dyn Read,
    bytes: Vec<u8>,
    max: u64,
    eof: bool,
}

impl<'a> PackStream<'a> {
    const CHUNK: usize = 64 * 1024;

    fn new(input: &'a mut dyn Read, max: u64) -> Self {
        Self {
            input,
            bytes: Vec::with_capacity(Self::CHUNK),
            max,
            eof: false,
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.bytes
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Reads one more chunk; hitting EOF while a caller still needs
    /// bytes is a truncated pack.
    fn refill(&mut self) -> Result<(), ParseError> {
        if self.eof {
            return Err(ParseError::Corrupt {
                detail: "truncated pack stream".to_owned(),
            });
        }
        let mut chunk = [0u8; Self::CHUNK];
        loop {
            match self.input.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Err(ParseError::Corrupt {
                        detail: "truncated pack stream".to_owned(),
                    });
                }
                Ok(n) => {
                    if (self.bytes.len() + n) as u64 > self.max {
                        return Err(ParseError::TooLarge { max: self.max });
                    }
                    self.bytes.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Ensures at least `n` bytes are buffered.
    fn require(&mut self, n: usize) -> Result<(), ParseError> {
        while self.bytes.len() < n {
            self.refill()?;
        }
        Ok(())
    }
}

/// True for scan errors that mean "the entry runs past the buffered
/// prefix", distinguishing them from genuine corruption.
fn is_need_more(err: &ParseError) -> bool {
    match err {
        ParseError::Corrupt { detail } => {
            detail == "varint truncated"
                || detail == "truncated zlib input"
                || detail == "truncated REF_DELTA base id"
        }
        _ => false,
    }
}

/// Working state of delta resolution across sweeps.
struct Resolution {
    resolved: Vec<Option<(ObjectKind, Vec<u8>)>>,
    ids: Vec<Option<ObjectId>>,
    id_map: ahash::AHashMap<ObjectId, usize>,
    appended: Vec<(ObjectId, ObjectKind, Vec<u8>)>,
}

#[derive(Clone, Debug)]
struct RawEntry {
    offset: u64,
    type_code: u8,
    base: EntryBase,
    payload_start: usize,
    payload_end: usize,
    entry_end: usize,
    inflated_size: u64,
}

/// A fully parsed, resolved, thin-completed pack ready to install.
pub struct ParsedPack {
    bytes: Vec<u8>,
    entries: Vec<IndexEntry>,
    trailer: [u8; 20],
    stats: ParserStats,
    format: ObjectFormat,
    /// Ids of every object the pack contains, for connectivity checking.
    contained: Vec<(ObjectId, ObjectKind)>,
}

impl ParsedPack {
    /// Final pack bytes (trailer included).
    #[must_use]
    pub fn pack_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parse counters.
    #[must_use]
    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// The pack's trailing checksum, which also names the installed pair.
    #[must_use]
    pub fn trailer(&self) -> [u8; 20] {
        self.trailer
    }

    /// Every `(id, kind)` stored in the pack.
    #[must_use]
    pub fn contained_objects(&self) -> &[(ObjectId, ObjectKind)] {
        &self.contained
    }

    /// Serialized v2 index for this pack.
    #[must_use]
    pub fn index_bytes(&self) -> Vec<u8> {
        write_index_v2(&self.entries, &self.trailer)
    }

    /// Installs `pack-<hex>.idx` then `pack-<hex>.pack` under `pack_dir`.
    ///
    /// Returns the base name (`pack-<hex>`).
    pub fn install_into(&self, pack_dir: &Path) -> Result<String, ParseError> {
        fs::create_dir_all(pack_dir)?;
        let name = format!("pack-{}", crate::raw::hex::encode(&self.trailer));
        let pack_tmp = pack_dir.join(format!("{name}.pack.tmp"));
        let idx_tmp = pack_dir.join(format!("{name}.idx.tmp"));

        let result = (|| -> io::Result<()> {
            let mut pack_file = fs::File::create(&pack_tmp)?;
            pack_file.write_all(&self.bytes)?;
            pack_file.sync_all()?;

            let mut idx_file = fs::File::create(&idx_tmp)?;
            idx_file.write_all(&self.index_bytes())?;
            idx_file.sync_all()?;

            fs::rename(&idx_tmp, pack_dir.join(format!("{name}.idx")))?;
            fs::rename(&pack_tmp, pack_dir.join(format!("{name}.pack")))?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&pack_tmp);
            let _ = fs::remove_file(&idx_tmp);
        }
        result?;
        Ok(name)
    }

    /// Object id format the pack was parsed under.
    #[must_use]
    pub fn format(&self) -> ObjectFormat {
        self.format
    }
}

/// Inbound pack parser.
#[derive(Clone, Copy, Debug, Default)]
pub struct PackParser {
    config: ParserConfig,
}

impl PackParser {
    /// Parser with explicit limits.
    #[must_use]
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    /// Consumes exactly one pack from the stream and resolves it.
    ///
    /// The stream is read no further than the pack trailer (plus at most
    /// one refill chunk of lookahead), so a bidirectional connection
    /// stays usable after the pack: receive-pack reads the pack and then
    /// answers on the same socket.
    pub fn parse<M: ProgressMonitor>(
        &self,
        input: &mut dyn Read,
        format: ObjectFormat,
        external: &mut dyn ExternalBases,
        monitor: &mut M,
    ) -> Result<ParsedPack, ParseError> {
        // Header first: the object count bounds the scan.
        let mut stream = PackStream::new(input, self.config.max_pack_bytes);
        stream.require(PACK_HEADER_SIZE)?;
        {
            let bytes = stream.buffered();
            if &bytes[0..4] != b"PACK" {
                return Err(ParseError::BadHeader {
                    detail: "missing PACK signature",
                });
            }
            let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            if version != 2 && version != 3 {
                return Err(ParseError::BadHeader {
                    detail: "unsupported version",
                });
            }
        }
        let header = stream.buffered();
        let object_count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        // Pass 1: locate every entry and its compressed extent, pulling
        // more bytes whenever an entry runs off the buffered prefix.
        monitor.begin_task("Indexing objects", Some(object_count as u64));
        let mut raw_entries = Vec::with_capacity(object_count as usize);
        let mut scratch = Vec::new();
        let mut pos = PACK_HEADER_SIZE;
        let mut delta_count = 0u32;
        for _ in 0..object_count {
            if monitor.is_cancelled() {
                return Err(ParseError::Cancelled);
            }
            let entry = loop {
                let mut attempt = pos;
                let outcome = self.scan_entry(stream.buffered(), &mut attempt, format, &mut scratch);
                match outcome {
                    Ok(entry) => {
                        pos = attempt;
                        break entry;
                    }
                    Err(err) if is_need_more(&err) => stream.refill()?,
                    Err(err) => return Err(err),
                }
            };
            if !matches!(entry.base, EntryBase::None) {
                delta_count += 1;
            }
            raw_entries.push(entry);
            monitor.update(1);
        }
        stream.require(pos + 20)?;
        monitor.end_task();

        let mut bytes = stream.into_bytes();
        bytes.truncate(pos + 20);
        let body_end = pos;

        // Verify the received trailer before trusting resolution.
        {
            use sha1::{Digest, Sha1};
            let mut hasher = Sha1::new();
            hasher.update(&bytes[..body_end]);
            let digest: [u8; 20] = hasher.finalize().into();
            if digest != bytes[body_end..] {
                return Err(ParseError::TrailerMismatch);
            }
        }

        self.resolve(bytes, object_count, raw_entries, delta_count, format, external, monitor)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve<M: ProgressMonitor>(
        &self,
        mut bytes: Vec<u8>,
        object_count: u32,
        raw_entries: Vec<RawEntry>,
        delta_count: u32,
        format: ObjectFormat,
        external: &mut dyn ExternalBases,
        monitor: &mut M,
    ) -> Result<ParsedPack, ParseError> {
        let body_end = bytes.len() - 20;

        // Pass 2: resolve contents and ids. Offset chains resolve in one
        // sweep; REF_DELTA bases inside the pack become resolvable as
        // their targets' ids appear, so sweeps repeat to a fixpoint.
        // Only then are unresolved REF_DELTA bases treated as thin.
        monitor.begin_task("Resolving deltas", Some(delta_count as u64));
        let mut state = Resolution {
            resolved: vec![None; raw_entries.len()],
            ids: vec![None; raw_entries.len()],
            id_map: ahash::AHashMap::new(),
            appended: Vec::new(),
        };

        let mut allow_external = false;
        loop {
            let mut progress = false;
            let mut pending = false;
            for idx in 0..raw_entries.len() {
                if monitor.is_cancelled() {
                    return Err(ParseError::Cancelled);
                }
                if state.resolved[idx].is_some() {
                    continue;
                }
                if self.resolve_entry(
                    idx,
                    &bytes[..body_end],
                    &raw_entries,
                    &mut state,
                    external,
                    allow_external,
                    format,
                )? {
                    progress = true;
                    monitor.update(1);
                } else {
                    pending = true;
                }
            }
            if !pending {
                break;
            }
            if !progress {
                if allow_external {
                    // resolve_entry reports the missing base itself.
                    return Err(ParseError::Corrupt {
                        detail: "unresolvable delta entries".to_owned(),
                    });
                }
                allow_external = true;
            }
        }
        let Resolution {
            resolved,
            ids,
            appended,
            ..
        } = state;
        monitor.end_task();

        // Thin completion: append missing bases as whole entries, then
        // recompute the trailer over the grown body.
        let thin_bases_added = appended.len() as u32;
        let mut entries: Vec<IndexEntry> = Vec::with_capacity(raw_entries.len() + appended.len());
        for (idx, raw) in raw_entries.iter().enumerate() {
            entries.push(IndexEntry {
                id: ids[idx].expect("resolved id"),
                offset: raw.offset,
                crc: crc32(&bytes[raw.offset as usize..raw.entry_end]),
            });
        }

        bytes.truncate(body_end);
        let total_count = object_count as u64 + appended.len() as u64;
        bytes[8..12].copy_from_slice(&(total_count as u32).to_be_bytes());
        for (id, kind, content) in &appended {
            let offset = bytes.len() as u64;
            let mut header = Vec::with_capacity(16);
            varint::write_entry_header(kind.pack_code(), content.len() as u64, &mut header);
            bytes.extend_from_slice(&header);
            bytes.extend_from_slice(&deflate(content)?);
            entries.push(IndexEntry {
                id: *id,
                offset,
                crc: crc32(&bytes[offset as usize..]),
            });
        }

        let trailer: [u8; 20] = {
            use sha1::{Digest, Sha1};
            let mut hasher = Sha1::new();
            hasher.update(&bytes);
            hasher.finalize().into()
        };
        bytes.extend_from_slice(&trailer);

        // Index entries must be unique and sorted by id; duplicate
        // objects keep their first (lowest-offset) copy.
        entries.sort_by(|a, b| a.id.cmp(&b.id).then(a.offset.cmp(&b.offset)));
        entries.dedup_by(|a, b| a.id == b.id);

        let mut contained: Vec<(ObjectId, ObjectKind)> = Vec::with_capacity(entries.len());
        for idx in 0..raw_entries.len() {
            let (kind, _) = resolved[idx].as_ref().expect("resolved entry");
            contained.push((ids[idx].expect("resolved id"), *kind));
        }
        for (id, kind, _) in &appended {
            contained.push((*id, *kind));
        }

        let stats = ParserStats {
            object_count: total_count as u32,
            delta_count,
            thin_bases_added,
            pack_bytes: bytes.len() as u64,
        };
        Ok(ParsedPack {
            bytes,
            entries,
            trailer,
            stats,
            format,
            contained,
        })
    }

    fn scan_entry(
        &self,
        body: &[u8],
        pos: &mut usize,
        format: ObjectFormat,
        scratch: &mut Vec<u8>,
    ) -> Result<RawEntry, ParseError> {
        let offset = *pos as u64;
        let (type_code, inflated_size) = varint::read_entry_header(body, pos, MAX_HEADER_BYTES)?;
        if inflated_size > self.config.limits.max_object_bytes as u64 {
            return Err(ParseError::Corrupt {
                detail: format!("entry of {inflated_size} bytes exceeds object cap"),
            });
        }

        let base = match type_code {
            1..=4 => EntryBase::None,
            OFS_DELTA => {
                let distance = varint::read_ofs_distance(body, pos)?;
                if distance == 0 || distance > offset {
                    return Err(ParseError::Corrupt {
                        detail: "OFS_DELTA distance out of range".to_owned(),
                    });
                }
                EntryBase::Offset(offset - distance)
            }
            REF_DELTA => {
                let oid_len = format.oid_len() as usize;
                if *pos + oid_len > body.len() {
                    return Err(ParseError::Corrupt {
                        detail: "truncated REF_DELTA base id".to_owned(),
                    });
                }
                let base_id = ObjectId::from_raw(&body[*pos..*pos + oid_len]);
                *pos += oid_len;
                EntryBase::Id(base_id)
            }
            code => {
                return Err(ParseError::Corrupt {
                    detail: format!("bad object type {code}"),
                })
            }
        };

        let payload_start = *pos;
        scratch.clear();
        scratch.reserve(inflated_size as usize);
        let consumed = inflate_limited(&body[payload_start..], scratch, inflated_size as usize)?;
        if scratch.len() as u64 != inflated_size {
            return Err(ParseError::Corrupt {
                detail: "entry shorter than its declared size".to_owned(),
            });
        }
        *pos = payload_start + consumed;

        Ok(RawEntry {
            offset,
            type_code,
            base,
            payload_start,
            payload_end: payload_start + consumed,
            entry_end: payload_start + consumed,
            inflated_size,
        })
    }

    /// Resolves entry `idx` along its base chain.
    ///
    /// Returns `false` (without resolving) when the entry is a REF_DELTA
    /// whose in-pack base has not produced an id yet and `allow_external`
    /// is off; the caller retries it in a later sweep.
    #[allow(clippy::too_many_arguments)]
    fn resolve_entry(
        &self,
        idx: usize,
        body: &[u8],
        raw_entries: &[RawEntry],
        state: &mut Resolution,
        external: &mut dyn ExternalBases,
        allow_external: bool,
        format: ObjectFormat,
    ) -> Result<bool, ParseError> {
        // Walk down the chain collecting unresolved links.
        let mut chain = vec![idx];
        let mut base: (ObjectKind, Vec<u8>);
        loop {
            let current = *chain.last().expect("chain non-empty");
            if chain.len() as u32 > self.config.limits.max_delta_depth {
                return Err(ParseError::DeltaDepthExceeded {
                    max_depth: self.config.limits.max_delta_depth,
                });
            }
            let raw = &raw_entries[current];
            match &raw.base {
                EntryBase::None => {
                    let kind = ObjectKind::from_pack_code(raw.type_code)
                        .expect("validated type code");
                    base = (kind, self.inflate_raw(body, raw)?);
                    chain.pop();
                    // Whole entries resolve in place.
                    self.commit_resolution(current, base.clone(), state, format);
                    break;
                }
                EntryBase::Offset(base_offset) => {
                    let base_idx = raw_entries
                        .binary_search_by(|probe| probe.offset.cmp(base_offset))
                        .map_err(|_| ParseError::Corrupt {
                            detail: "OFS_DELTA base does not start an entry".to_owned(),
                        })?;
                    if let Some(done) = &state.resolved[base_idx] {
                        base = done.clone();
                        break;
                    }
                    if chain.contains(&base_idx) {
                        return Err(ParseError::Corrupt {
                            detail: "delta base cycle".to_owned(),
                        });
                    }
                    chain.push(base_idx);
                }
                EntryBase::Id(base_id) => {
                    if let Some(&base_idx) = state.id_map.get(base_id) {
                        if let Some(done) = &state.resolved[base_idx] {
                            base = done.clone();
                            break;
                        }
                    }
                    if !allow_external {
                        // Base may still surface from an in-pack entry.
                        return Ok(false);
                    }
                    match external.base(base_id) {
                        Some(found) => {
                            if !state.appended.iter().any(|(id, _, _)| id == base_id) {
                                state.appended.push((*base_id, found.0, found.1.clone()));
                            }
                            base = found;
                            break;
                        }
                        None => {
                            return Err(ParseError::MissingBase { base_id: *base_id });
                        }
                    }
                }
            }
        }

        // Apply deltas from the innermost unresolved link outward.
        while let Some(current) = chain.pop() {
            let raw = &raw_entries[current];
            let delta = self.inflate_raw(body, raw)?;
            let mut out = Vec::new();
            apply_delta(&base.1, &delta, &mut out, self.config.limits.max_object_bytes)?;
            base = (base.0, out);
            self.commit_resolution(current, base.clone(), state, format);
        }
        Ok(true)
    }

    fn commit_resolution(
        &self,
        idx: usize,
        content: (ObjectKind, Vec<u8>),
        state: &mut Resolution,
        format: ObjectFormat,
    ) {
        debug_assert_eq!(format, ObjectFormat::Sha1, "sha1 packs only");
        let id = hash_object(content.0, &content.1);
        state.ids[idx] = Some(id);
        state.id_map.insert(id, idx);
        state.resolved[idx] = Some(content);
    }

    fn inflate_raw(&self, body: &[u8], raw: &RawEntry) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::with_capacity(raw.inflated_size as usize);
        inflate_limited(
            &body[raw.payload_start..raw.payload_end],
            &mut out,
            raw.inflated_size as usize,
        )?;
        Ok(out)
    }
}
