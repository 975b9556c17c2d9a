//! Commit-graph file reader, used for generation numbers.
//!
//! The commit-graph (`objects/info/commit-graph`) is a chunk-table
//! container: a 8-byte header, a chunk directory of `(id, offset)`
//! entries, then the chunks. The walker only needs OIDF (fanout), OIDL
//! (sorted ids), and CDAT (per-commit data, which carries the generation
//! number). Parents are re-read from the object store rather than from
//! the graph, so a stale graph cannot corrupt a walk, only weaken its
//! ordering.
//!
//! # CDAT record
//! ```text
//! <tree oid> <parent1 u32> <parent2 u32> <u64: generation << 34 | time>
//! ```
//! Parent value `0x7000_0000` means "none"; the `0x8000_0000` bit in
//! parent2 points into the EDGE chunk (unused here).

use std::fmt;
use std::fs;
use std::path::Path;

use crate::object::id::{ObjectFormat, ObjectId};

/// Commit-graph magic bytes.
const GRAPH_MAGIC: [u8; 4] = *b"CGPH";
/// Supported file version.
const GRAPH_VERSION: u8 = 1;
/// Header size (magic + version + hash version + chunk count + base count).
const GRAPH_HEADER_SIZE: usize = 8;
/// Chunk directory entry size (4 id + 8 offset).
const CHUNK_ENTRY_SIZE: usize = 12;
/// OID fanout chunk.
const CHUNK_OIDF: [u8; 4] = *b"OIDF";
/// OID list chunk.
const CHUNK_OIDL: [u8; 4] = *b"OIDL";
/// Commit data chunk.
const CHUNK_CDAT: [u8; 4] = *b"CDAT";
/// Fanout size in bytes.
const FANOUT_SIZE: usize = 256 * 4;

/// Errors from commit-graph parsing.
#[derive(Debug)]
#[non_exhaustive]
pub enum GraphError {
    /// File is malformed.
    Corrupt { detail: &'static str },
    /// Unsupported version byte.
    UnsupportedVersion { version: u8 },
    /// Hash version disagrees with the repository format.
    HashMismatch { hash_version: u8 },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt commit-graph: {detail}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported commit-graph version {version}")
            }
            Self::HashMismatch { hash_version } => {
                write!(f, "commit-graph hash version {hash_version} does not match repo")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// An in-memory commit-graph file.
pub struct CommitGraphFile {
    data: Vec<u8>,
    format: ObjectFormat,
    commit_count: u32,
    oidf: usize,
    oidl: usize,
    cdat: usize,
}

impl fmt::Debug for CommitGraphFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitGraphFile")
            .field("commits", &self.commit_count)
            .finish_non_exhaustive()
    }
}

impl CommitGraphFile {
    /// Loads `objects/info/commit-graph` if present and well-formed.
    ///
    /// Returns `Ok(None)` when the file does not exist; the walker then
    /// runs without generation numbers.
    pub fn open(info_dir: &Path, format: ObjectFormat) -> Result<Option<Self>, GraphError> {
        let path = info_dir.join("commit-graph");
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(_) => return Ok(None),
        };
        Self::parse(data, format).map(Some)
    }

    /// Parses a commit-graph buffer.
    pub fn parse(data: Vec<u8>, format: ObjectFormat) -> Result<Self, GraphError> {
        let corrupt = |detail| GraphError::Corrupt { detail };
        if data.len() < GRAPH_HEADER_SIZE + CHUNK_ENTRY_SIZE {
            return Err(corrupt("file too small"));
        }
        if data[0..4] != GRAPH_MAGIC {
            return Err(corrupt("invalid magic"));
        }
        if data[4] != GRAPH_VERSION {
            return Err(GraphError::UnsupportedVersion { version: data[4] });
        }
        let hash_version = data[5];
        let expected_hash = match format {
            ObjectFormat::Sha1 => 1,
            ObjectFormat::Sha256 => 2,
        };
        if hash_version != expected_hash {
            return Err(GraphError::HashMismatch { hash_version });
        }
        let chunk_count = data[6] as usize;

        // Chunk directory: `chunk_count` entries plus a terminating label.
        let dir_end = GRAPH_HEADER_SIZE + (chunk_count + 1) * CHUNK_ENTRY_SIZE;
        if data.len() < dir_end {
            return Err(corrupt("chunk table exceeds file"));
        }

        let mut oidf = None;
        let mut oidl = None;
        let mut cdat = None;
        for i in 0..chunk_count {
            let at = GRAPH_HEADER_SIZE + i * CHUNK_ENTRY_SIZE;
            let id: [u8; 4] = data[at..at + 4].try_into().expect("4-byte chunk id");
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[at + 4..at + 12]);
            let offset = u64::from_be_bytes(raw) as usize;
            if offset > data.len() {
                return Err(corrupt("chunk offset exceeds file"));
            }
            match id {
                CHUNK_OIDF => oidf = Some(offset),
                CHUNK_OIDL => oidl = Some(offset),
                CHUNK_CDAT => cdat = Some(offset),
                _ => {}
            }
        }

        let oidf = oidf.ok_or(corrupt("missing OIDF chunk"))?;
        let oidl = oidl.ok_or(corrupt("missing OIDL chunk"))?;
        let cdat = cdat.ok_or(corrupt("missing CDAT chunk"))?;
        if data.len() < oidf + FANOUT_SIZE {
            return Err(corrupt("fanout exceeds file"));
        }

        let commit_count = u32::from_be_bytes([
            data[oidf + 255 * 4],
            data[oidf + 255 * 4 + 1],
            data[oidf + 255 * 4 + 2],
            data[oidf + 255 * 4 + 3],
        ]);
        let oid_len = format.oid_len() as usize;
        if data.len() < oidl + commit_count as usize * oid_len {
            return Err(corrupt("oid list exceeds file"));
        }
        let record = Self::cdat_record_len(format);
        if data.len() < cdat + commit_count as usize * record {
            return Err(corrupt("commit data exceeds file"));
        }

        Ok(Self {
            data,
            format,
            commit_count,
            oidf,
            oidl,
            cdat,
        })
    }

    const fn cdat_record_len(format: ObjectFormat) -> usize {
        format.oid_len() as usize + 4 + 4 + 8
    }

    /// Number of commits in the graph.
    #[must_use]
    pub fn commit_count(&self) -> u32 {
        self.commit_count
    }

    fn fanout(&self, first_byte: u8) -> u32 {
        let at = self.oidf + first_byte as usize * 4;
        u32::from_be_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }

    fn oid_at(&self, pos: u32) -> &[u8] {
        let oid_len = self.format.oid_len() as usize;
        let at = self.oidl + pos as usize * oid_len;
        &self.data[at..at + oid_len]
    }

    fn position(&self, id: &ObjectId) -> Option<u32> {
        let first = id.first_byte();
        let mut hi = self.fanout(first);
        let mut lo = if first == 0 { 0 } else { self.fanout(first - 1) };
        let target = id.as_slice();
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

    /// Generation number for `id`, or `None` when the commit is not in
    /// the graph (graphs may trail the object store).
    #[must_use]
    pub fn generation(&self, id: &ObjectId) -> Option<u32> {
        let pos = self.position(id)?;
        let record = Self::cdat_record_len(self.format);
        let at = self.cdat + pos as usize * record + self.format.oid_len() as usize + 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[at..at + 8]);
        let packed = u64::from_be_bytes(raw);
        Some((packed >> 34) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal single-chunk-set commit-graph for SHA-1.
    fn build_graph(commits: &[([u8; 20], u32, i64)]) -> Vec<u8> {
        let mut sorted = commits.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let n = sorted.len();
        let chunk_count = 3u8;

        let dir_end = GRAPH_HEADER_SIZE + (chunk_count as usize + 1) * CHUNK_ENTRY_SIZE;
        let oidf_at = dir_end;
        let oidl_at = oidf_at + FANOUT_SIZE;
        let cdat_at = oidl_at + n * 20;
        let end = cdat_at + n * (20 + 16);

        let mut out = Vec::new();
        out.extend_from_slice(&GRAPH_MAGIC);
        out.push(GRAPH_VERSION);
        out.push(1); // SHA-1
        out.push(chunk_count);
        out.push(0); // base graphs

        for (id, offset) in [
            (CHUNK_OIDF, oidf_at),
            (CHUNK_OIDL, oidl_at),
            (CHUNK_CDAT, cdat_at),
            ([0u8; 4], end),
        ] {
            out.extend_from_slice(&id);
            out.extend_from_slice(&(offset as u64).to_be_bytes());
        }

        let mut counts = [0u32; 256];
        for (oid, _, _) in &sorted {
            counts[oid[0] as usize] += 1;
        }
        let mut running = 0u32;
        for count in counts {
            running += count;
            out.extend_from_slice(&running.to_be_bytes());
        }
        for (oid, _, _) in &sorted {
            out.extend_from_slice(oid);
        }
        for (_, generation, time) in &sorted {
            out.extend_from_slice(&[0u8; 20]); // tree oid
            out.extend_from_slice(&0x7000_0000u32.to_be_bytes());
            out.extend_from_slice(&0x7000_0000u32.to_be_bytes());
            let packed = ((*generation as u64) << 34) | (*time as u64 & 0x3_ffff_ffff);
            out.extend_from_slice(&packed.to_be_bytes());
        }
        out
    }

    #[test]
    fn generation_lookup() {
        let a = [0x11u8; 20];
        let b = [0xddu8; 20];
        let graph = build_graph(&[(a, 3, 1000), (b, 7, 2000)]);
        let parsed = CommitGraphFile::parse(graph, ObjectFormat::Sha1).unwrap();
        assert_eq!(parsed.commit_count(), 2);
        assert_eq!(parsed.generation(&ObjectId::sha1(a)), Some(3));
        assert_eq!(parsed.generation(&ObjectId::sha1(b)), Some(7));
        assert_eq!(parsed.generation(&ObjectId::sha1([0x22; 20])), None);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(CommitGraphFile::open(dir.path(), ObjectFormat::Sha1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let graph = vec![0u8; 64];
        assert!(CommitGraphFile::parse(graph, ObjectFormat::Sha1).is_err());
    }
}
