//! Pack writer: enumerate objects between `want` and `have` sets, search
//! for deltas over a sliding window, and stream the pack with its
//! trailing checksum.
//!
//! # Object selection and ordering
//! Commits come first in walk order, then annotated tags, then trees and
//! blobs sorted by path so successive versions of one file sit next to
//! each other inside the delta window.
//!
//! # Delta policy
//! Each tree/blob is compared against up to `delta_window` recent objects
//! of the same kind. A delta is kept only when it is smaller than
//! `delta_ratio` of the object's full size and its chain stays under
//! `max_delta_depth`. Bases already in the pack are referenced by
//! negative offset (`ofs-delta`) when enabled; thin packs may reference
//! boundary objects the receiver is known to have, by id. With `thin`
//! off such bases are never chosen.
//!
//! A writer instance is single-call: `write` consumes the enumeration
//! state and a second call would silently repeat work against stale
//! offsets.

use std::fmt;
use std::io::{self, Write};

use ahash::{AHashMap, AHashSet};

use crate::delta::encode::DeltaEncoder;
use crate::delta::index::DeltaIndex;
use crate::monitor::ProgressMonitor;
use crate::object::id::ObjectId;
use crate::object::kind::ObjectKind;
use crate::object::tag::Tag;
use crate::odb::traits::ObjectReader;
use crate::odb::OdbError;
use crate::raw::hashing::HashingWriter;
use crate::raw::varint;
use crate::raw::zlib::deflate;
use crate::revwalk::flags::CommitFlags;
use crate::revwalk::walk::{RevWalk, WalkError};
use crate::treewalk::walk::{TreeWalk, TreeWalkError};

use super::file::PackFile;
use super::{OFS_DELTA, REF_DELTA};

/// Pack writer tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct WriterConfig {
    /// Delta search window (candidates per object).
    pub delta_window: usize,
    /// Longest delta chain the writer will create.
    pub max_delta_depth: u32,
    /// A delta is kept when `delta_len * 100 < full_len * delta_ratio_pct`.
    pub delta_ratio_pct: u32,
    /// Permit delta bases outside the pack (receiver-side completion).
    pub thin: bool,
    /// Encode in-pack bases as negative offsets instead of ids.
    pub use_ofs_delta: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            delta_window: 10,
            max_delta_depth: 50,
            delta_ratio_pct: 90,
            thin: false,
            use_ofs_delta: true,
        }
    }
}

/// Counters reported after a write.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriterStats {
    /// Objects emitted.
    pub objects: u32,
    /// Of those, delta entries.
    pub deltas: u32,
    /// Of those, deltas whose base lives outside the pack.
    pub thin_deltas: u32,
    /// Total bytes written, trailer included.
    pub bytes: u64,
}

/// Errors from pack writing.
#[derive(Debug)]
#[non_exhaustive]
pub enum WriteError {
    /// Caller supplied no wants.
    NoWants,
    /// Revision walk failed.
    Walk(WalkError),
    /// Tree enumeration failed.
    Tree(TreeWalkError),
    /// Object store failure.
    Odb(OdbError),
    /// Cancellation observed between objects.
    Cancelled,
    /// Output stream failure.
    Io(io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWants => write!(f, "nothing to pack: empty want list"),
            Self::Walk(err) => write!(f, "{err}"),
            Self::Tree(err) => write!(f, "{err}"),
            Self::Odb(err) => write!(f, "{err}"),
            Self::Cancelled => write!(f, "pack write cancelled"),
            Self::Io(err) => write!(f, "pack output error: {err}"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<WalkError> for WriteError {
    fn from(err: WalkError) -> Self {
        Self::Walk(err)
    }
}

impl From<TreeWalkError> for WriteError {
    fn from(err: TreeWalkError) -> Self {
        Self::Tree(err)
    }
}

impl From<OdbError> for WriteError {
    fn from(err: OdbError) -> Self {
        Self::Odb(err)
    }
}

impl From<io::Error> for WriteError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Boundary objects keyed by path, for thin-delta base lookup.
type ThinBases = AHashMap<Vec<u8>, (ObjectId, ObjectKind, Vec<u8>)>;

/// One object queued for emission.
struct PlannedObject {
    id: ObjectId,
    kind: ObjectKind,
    /// Path for delta grouping; empty for commits and tags.
    path: Vec<u8>,
}

/// A recently emitted (or boundary) object kept as a delta candidate.
struct WindowSlot {
    id: ObjectId,
    kind: ObjectKind,
    path: Vec<u8>,
    content: Vec<u8>,
    /// Offset in this pack; `None` for thin (boundary) candidates.
    offset: Option<u64>,
    depth: u32,
}

/// Single-use pack writer.
pub struct PackWriter {
    config: WriterConfig,
}

impl PackWriter {
    /// Writer with explicit configuration.
    #[must_use]
    pub fn new(config: WriterConfig) -> Self {
        Self { config }
    }

    /// Enumerates, deltifies, and streams a pack for `wants` minus
    /// `haves` into `out`.
    ///
    /// Commits in `shallow` have their parent links hidden from the
    /// enumeration, truncating history at the client's shallow fringe.
    pub fn write<R: ObjectReader, W: Write, M: ProgressMonitor>(
        self,
        reader: &mut R,
        wants: &[ObjectId],
        haves: &[ObjectId],
        shallow: &[ObjectId],
        out: &mut W,
        monitor: &mut M,
    ) -> Result<WriterStats, WriteError> {
        if wants.is_empty() {
            return Err(WriteError::NoWants);
        }

        let (plan, boundary) = self.enumerate(reader, wants, haves, shallow, monitor)?;
        self.emit(reader, plan, boundary, out, monitor)
    }

    /// Concatenates cached packs whole: a fresh header with the summed
    /// object count, each pack's entry region verbatim, a fresh trailer.
    ///
    /// Offset deltas stay valid because each body is copied contiguously;
    /// the caller must ensure no pack ref-deltas against another's
    /// objects unless the receiver completes thin packs.
    pub fn write_cached<W: Write>(
        self,
        packs: &[&PackFile],
        out: &mut W,
    ) -> Result<WriterStats, WriteError> {
        let total: u64 = packs.iter().map(|pack| pack.object_count() as u64).sum();
        let mut hashing = HashingWriter::new(out);
        hashing.write_all(b"PACK")?;
        hashing.write_all(&2u32.to_be_bytes())?;
        hashing.write_all(&(total as u32).to_be_bytes())?;
        for pack in packs {
            hashing.write_all(pack.entry_region())?;
        }
        let bytes = hashing.bytes_written() + 20;
        let (out, digest) = hashing.finish();
        out.write_all(&digest)?;
        Ok(WriterStats {
            objects: total as u32,
            deltas: 0,
            thin_deltas: 0,
            bytes,
        })
    }

    /// Builds the emission plan: commits, tags, then path-sorted trees
    /// and blobs; returns boundary objects (keyed by path) usable as
    /// thin-delta bases.
    fn enumerate<R: ObjectReader, M: ProgressMonitor>(
        &self,
        reader: &mut R,
        wants: &[ObjectId],
        haves: &[ObjectId],
        shallow: &[ObjectId],
        monitor: &mut M,
    ) -> Result<(Vec<PlannedObject>, ThinBases), WriteError> {
        monitor.begin_task("Counting objects", None);

        let mut commit_wants = Vec::new();
        let mut tags: Vec<PlannedObject> = Vec::new();
        let mut direct: Vec<PlannedObject> = Vec::new();
        let mut seen: AHashSet<ObjectId> = AHashSet::new();

        for want in wants {
            let data = reader.read(want)?;
            match data.kind {
                ObjectKind::Commit => commit_wants.push(*want),
                ObjectKind::Tag => {
                    if seen.insert(*want) {
                        tags.push(PlannedObject {
                            id: *want,
                            kind: ObjectKind::Tag,
                            path: Vec::new(),
                        });
                    }
                    // Follow the tag chain down to its terminal object.
                    let mut tag_data = data;
                    loop {
                        let tag = Tag::parse(&tag_data.bytes, want.format()).map_err(|err| {
                            WriteError::Odb(OdbError::corrupt(err.to_string()))
                        })?;
                        match tag.target_kind {
                            ObjectKind::Commit => {
                                commit_wants.push(tag.object);
                                break;
                            }
                            ObjectKind::Tag => {
                                if seen.insert(tag.object) {
                                    tags.push(PlannedObject {
                                        id: tag.object,
                                        kind: ObjectKind::Tag,
                                        path: Vec::new(),
                                    });
                                }
                                tag_data = reader.read(&tag.object)?;
                            }
                            ObjectKind::Tree | ObjectKind::Blob => {
                                if seen.insert(tag.object) {
                                    direct.push(PlannedObject {
                                        id: tag.object,
                                        kind: tag.target_kind,
                                        path: Vec::new(),
                                    });
                                }
                                break;
                            }
                        }
                    }
                }
                ObjectKind::Tree | ObjectKind::Blob => {
                    if seen.insert(*want) {
                        direct.push(PlannedObject {
                            id: *want,
                            kind: data.kind,
                            path: Vec::new(),
                        });
                    }
                }
            }
        }

        // Commit closure: wants minus haves, boundary surfaced.
        let mut commits: Vec<PlannedObject> = Vec::new();
        let mut interesting_trees: Vec<ObjectId> = Vec::new();
        let mut boundary_trees: Vec<ObjectId> = Vec::new();
        {
            let mut walk = RevWalk::new(reader);
            walk.set_boundary(true);
            for id in shallow {
                walk.mark_shallow(*id);
            }
            for want in &commit_wants {
                walk.mark_start(*want)?;
            }
            for have in haves {
                // A have the local store lacks cannot prune; skip it.
                match walk.mark_uninteresting(*have) {
                    Ok(()) => {}
                    Err(WalkError::Missing { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            while let Some(commit) = walk.next()? {
                if monitor.is_cancelled() {
                    return Err(WriteError::Cancelled);
                }
                if commit.flags.contains(CommitFlags::BOUNDARY) {
                    boundary_trees.push(commit.tree);
                } else if seen.insert(commit.id) {
                    commits.push(PlannedObject {
                        id: commit.id,
                        kind: ObjectKind::Commit,
                        path: Vec::new(),
                    });
                    interesting_trees.push(commit.tree);
                }
            }
        }

        // Objects reachable from boundary commits exist on the receiving
        // side; exclude them, and keep them around as thin bases.
        let mut excluded: AHashSet<ObjectId> = AHashSet::new();
        let mut boundary: ThinBases = AHashMap::new();
        for tree in boundary_trees {
            if excluded.insert(tree) {
                collect_boundary(reader, tree, &mut excluded, &mut boundary, self.config.thin)?;
            }
        }

        // Trees and blobs introduced by the interesting commits.
        let mut trees_blobs: Vec<PlannedObject> = Vec::new();
        for root in interesting_trees {
            if excluded.contains(&root) || !seen.insert(root) {
                continue;
            }
            trees_blobs.push(PlannedObject {
                id: root,
                kind: ObjectKind::Tree,
                path: Vec::new(),
            });
            let mut walk = TreeWalk::new(reader, &[Some(root)])?;
            loop {
                let Some(row) = walk.next()? else { break };
                let Some(entry) = row.entries[0].clone() else {
                    continue;
                };
                if entry.mode == crate::object::tree::EntryMode::Gitlink {
                    continue; // submodule commits live elsewhere
                }
                let kind = if entry.mode.is_tree() {
                    ObjectKind::Tree
                } else {
                    ObjectKind::Blob
                };
                if excluded.contains(&entry.id) || !seen.insert(entry.id) {
                    continue;
                }
                trees_blobs.push(PlannedObject {
                    id: entry.id,
                    kind,
                    path: row.path.clone(),
                });
                if entry.mode.is_tree() {
                    walk.enter_subtree()?;
                }
            }
        }

        // Same-path objects adjacent so successive versions of one file
        // fall inside the same delta window.
        trees_blobs.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then_with(|| a.kind.pack_code().cmp(&b.kind.pack_code()))
        });

        let mut plan = commits;
        plan.extend(tags);
        plan.extend(direct);
        plan.extend(trees_blobs);
        monitor.end_task();
        Ok((plan, boundary))
    }

    fn emit<R: ObjectReader, W: Write, M: ProgressMonitor>(
        &self,
        reader: &mut R,
        plan: Vec<PlannedObject>,
        boundary: ThinBases,
        out: &mut W,
        monitor: &mut M,
    ) -> Result<WriterStats, WriteError> {
        let mut stats = WriterStats::default();
        monitor.begin_task("Writing objects", Some(plan.len() as u64));

        let mut hashing = HashingWriter::new(out);
        hashing.write_all(b"PACK")?;
        hashing.write_all(&2u32.to_be_bytes())?;
        hashing.write_all(&(plan.len() as u32).to_be_bytes())?;

        let mut window: Vec<WindowSlot> = Vec::new();

        for planned in plan {
            if monitor.is_cancelled() {
                return Err(WriteError::Cancelled);
            }
            let data = reader.read(&planned.id)?;
            let offset = hashing.bytes_written();

            // The receiver's same-path version of this object, if known,
            // joins the window as a never-emitted thin candidate.
            if self.config.thin && !planned.path.is_empty() {
                if let Some((base_id, base_kind, base_bytes)) = boundary.get(&planned.path) {
                    if *base_kind == planned.kind
                        && !window.iter().any(|slot| slot.id == *base_id)
                    {
                        push_window(
                            &mut window,
                            WindowSlot {
                                id: *base_id,
                                kind: *base_kind,
                                path: planned.path.clone(),
                                content: base_bytes.clone(),
                                offset: None,
                                depth: 0,
                            },
                            self.config.delta_window,
                        );
                    }
                }
            }

            let deltified = if matches!(planned.kind, ObjectKind::Tree | ObjectKind::Blob) {
                self.try_delta(&planned, &data.bytes, &window)
            } else {
                None
            };

            let mut entry = Vec::with_capacity(64);
            let depth = match deltified {
                Some((slot_idx, delta_bytes)) => {
                    let slot = &window[slot_idx];
                    stats.deltas += 1;
                    match slot.offset {
                        Some(base_offset) if self.config.use_ofs_delta => {
                            varint::write_entry_header(
                                OFS_DELTA,
                                delta_bytes.len() as u64,
                                &mut entry,
                            );
                            varint::write_ofs_distance(offset - base_offset, &mut entry);
                        }
                        _ => {
                            if slot.offset.is_none() {
                                stats.thin_deltas += 1;
                            }
                            varint::write_entry_header(
                                REF_DELTA,
                                delta_bytes.len() as u64,
                                &mut entry,
                            );
                            entry.extend_from_slice(slot.id.as_slice());
                        }
                    }
                    entry.extend_from_slice(&deflate(&delta_bytes)?);
                    slot.depth + 1
                }
                None => {
                    varint::write_entry_header(
                        planned.kind.pack_code(),
                        data.bytes.len() as u64,
                        &mut entry,
                    );
                    entry.extend_from_slice(&deflate(&data.bytes)?);
                    0
                }
            };
            hashing.write_all(&entry)?;
            stats.objects += 1;
            monitor.update(1);

            if matches!(planned.kind, ObjectKind::Tree | ObjectKind::Blob) {
                push_window(
                    &mut window,
                    WindowSlot {
                        id: planned.id,
                        kind: planned.kind,
                        path: planned.path,
                        content: data.bytes,
                        offset: Some(offset),
                        depth,
                    },
                    self.config.delta_window,
                );
            }
        }

        stats.bytes = hashing.bytes_written() + 20;
        let (out, digest) = hashing.finish();
        out.write_all(&digest)?;
        out.flush()?;
        monitor.end_task();
        Ok(stats)
    }

    /// Searches the window for the best acceptable delta base.
    ///
    /// Returns the winning slot index and the encoded delta.
    fn try_delta(
        &self,
        planned: &PlannedObject,
        content: &[u8],
        window: &[WindowSlot],
    ) -> Option<(usize, Vec<u8>)> {
        let ceiling = (content.len() as u64 * self.config.delta_ratio_pct as u64 / 100) as usize;
        if ceiling == 0 {
            return None;
        }

        let mut best: Option<(usize, Vec<u8>)> = None;
        for (slot_idx, slot) in window.iter().enumerate().rev() {
            if slot.kind != planned.kind {
                continue;
            }
            if slot.depth + 1 > self.config.max_delta_depth {
                continue;
            }
            if slot.offset.is_none() && !self.config.thin {
                continue;
            }
            // Same-path candidates first-class; others still tried, the
            // ratio test discards hopeless pairings cheaply via the
            // encoder's output cap.
            let limit = match &best {
                Some((_, delta)) => delta.len().saturating_sub(1),
                None => ceiling.saturating_sub(1),
            };
            if limit == 0 {
                break;
            }
            let index = DeltaIndex::new(&slot.content);
            let encoder = DeltaEncoder::new(&index);
            let mut delta = Vec::new();
            if encoder.encode_limited(content, &mut delta, limit) {
                best = Some((slot_idx, delta));
            }
        }
        best
    }
}

fn push_window(window: &mut Vec<WindowSlot>, slot: WindowSlot, capacity: usize) {
    window.push(slot);
    if window.len() > capacity {
        window.remove(0);
    }
}

/// Recursively collects boundary tree objects into the excluded set,
/// keeping path-keyed contents for thin-base use when `keep_contents` is
/// on.
fn collect_boundary<R: ObjectReader>(
    reader: &mut R,
    root: ObjectId,
    excluded: &mut AHashSet<ObjectId>,
    boundary: &mut ThinBases,
    keep_contents: bool,
) -> Result<(), WriteError> {
    // Boundary trees may predate a shallow cutoff and be absent.
    if matches!(reader.contains(&root), Ok(false)) {
        return Ok(());
    }

    // Phase 1: walk the tree, recording paths; phase 2 reads contents
    // once the walk (and its borrow of the reader) is done.
    let mut found: Vec<(Vec<u8>, ObjectId, ObjectKind)> = Vec::new();
    {
        let mut walk = TreeWalk::new(reader, &[Some(root)])?;
        walk.set_recursive(true);
        loop {
            let row = match walk.next() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(TreeWalkError::Missing { .. }) => break,
                Err(err) => return Err(err.into()),
            };
            let Some(entry) = row.entries[0].clone() else {
                continue;
            };
            if entry.mode == crate::object::tree::EntryMode::Gitlink {
                continue;
            }
            if !excluded.insert(entry.id) {
                continue;
            }
            if keep_contents {
                let kind = if entry.mode.is_tree() {
                    ObjectKind::Tree
                } else {
                    ObjectKind::Blob
                };
                found.push((row.path, entry.id, kind));
            }
        }
    }
    for (path, id, kind) in found {
        if let Ok(data) = reader.read(&id) {
            boundary.insert(path, (id, kind, data.bytes));
        }
    }
    Ok(())
}
