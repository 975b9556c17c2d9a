//! The revision walker: mark-and-sweep commit enumeration in commit-time
//! order with uninteresting/boundary propagation and shallow handling.
//!
//! Commits live in a slot arena (id-to-slot map plus a node vector); flags
//! are bytes in the arena, never on parsed objects, so a walker reset is
//! cheap and walks cannot leak flag state into each other.
//!
//! # Algorithm
//! `next` pops the newest pending commit, expands its parents once, and
//! propagates `UNINTERESTING` into every ancestor it reaches before those
//! ancestors can surface. The walk terminates when no interesting commit
//! remains pending, which yields exactly the reachable-but-not-uninteresting
//! set that pack writing and fetch negotiation consume.
//!
//! Shallow commits (from `.git/shallow` or the wire) have their parent
//! links hidden: history is truncated there on purpose.

use ahash::{AHashMap, AHashSet};

use crate::object::commit::{parse_for_walk, CommitParseError};
use crate::object::id::ObjectId;
use crate::object::kind::ObjectKind;
use crate::odb::traits::ObjectReader;
use crate::odb::OdbError;

use super::flags::CommitFlags;
use super::graph::CommitGraphFile;
use super::queue::DateQueue;

/// Errors from revision walking.
#[derive(Debug)]
#[non_exhaustive]
pub enum WalkError {
    /// A commit referenced by the walk is absent.
    Missing { id: ObjectId },
    /// Object exists but is not a commit.
    NotACommit { id: ObjectId },
    /// Commit payload failed to parse.
    Parse { id: ObjectId, source: CommitParseError },
    /// Object store failure.
    Odb(OdbError),
}

impl std::fmt::Display for WalkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing { id } => write!(f, "commit {id} missing"),
            Self::NotACommit { id } => write!(f, "object {id} is not a commit"),
            Self::Parse { id, source } => write!(f, "commit {id}: {source}"),
            Self::Odb(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WalkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse { source, .. } => Some(source),
            Self::Odb(err) => Some(err),
            _ => None,
        }
    }
}

impl From<OdbError> for WalkError {
    fn from(err: OdbError) -> Self {
        match err {
            OdbError::Missing { id } => Self::Missing { id },
            other => Self::Odb(other),
        }
    }
}

/// A commit surfaced by the walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkCommit {
    /// Commit id.
    pub id: ObjectId,
    /// Root tree id.
    pub tree: ObjectId,
    /// Parent ids (empty when shallow-truncated or root).
    pub parents: Vec<ObjectId>,
    /// Committer timestamp.
    pub commit_time: i64,
    /// Flags at emission; `BOUNDARY` marks uninteresting fringe commits
    /// surfaced when boundary mode is on.
    pub flags: CommitFlags,
}

struct Node {
    id: ObjectId,
    tree: ObjectId,
    parents: Vec<u32>,
    commit_time: i64,
    generation: u32,
    flags: CommitFlags,
    parsed: bool,
}

/// Commit graph walker over an object-reader session.
pub struct RevWalk<'a, R: ObjectReader> {
    reader: &'a mut R,
    slots: AHashMap<ObjectId, u32>,
    nodes: Vec<Node>,
    queue: DateQueue,
    /// Pending commits that are not (yet) uninteresting.
    interesting_pending: usize,
    shallow: AHashSet<ObjectId>,
    graph: Option<CommitGraphFile>,
    boundary: bool,
}

impl<'a, R: ObjectReader> RevWalk<'a, R> {
    /// Walker over `reader`.
    pub fn new(reader: &'a mut R) -> Self {
        Self {
            reader,
            slots: AHashMap::new(),
            nodes: Vec::new(),
            queue: DateQueue::new(),
            interesting_pending: 0,
            shallow: AHashSet::new(),
            graph: None,
            boundary: false,
        }
    }

    /// Attaches a commit-graph for generation-aware ordering.
    #[must_use]
    pub fn with_commit_graph(mut self, graph: Option<CommitGraphFile>) -> Self {
        self.graph = graph;
        self
    }

    /// Emits uninteresting fringe commits flagged `BOUNDARY` instead of
    /// suppressing them.
    pub fn set_boundary(&mut self, enabled: bool) {
        self.boundary = enabled;
    }

    /// Hides the parent links of `id` (shallow clone line).
    pub fn mark_shallow(&mut self, id: ObjectId) {
        self.shallow.insert(id);
    }

    /// Adds a start point ("want").
    pub fn mark_start(&mut self, id: ObjectId) -> Result<(), WalkError> {
        let slot = self.lookup_or_parse(id)?;
        let node = &mut self.nodes[slot as usize];
        node.flags |= CommitFlags::ADDED;
        if !node.flags.contains(CommitFlags::SEEN) {
            node.flags |= CommitFlags::SEEN;
            self.push_queue(slot);
        }
        Ok(())
    }

    /// Adds an uninteresting root ("have"); its whole ancestry is
    /// excluded from emission.
    pub fn mark_uninteresting(&mut self, id: ObjectId) -> Result<(), WalkError> {
        let slot = self.lookup_or_parse(id)?;
        let node = &mut self.nodes[slot as usize];
        let was_uninteresting = node.flags.contains(CommitFlags::UNINTERESTING);
        node.flags |= CommitFlags::UNINTERESTING;
        if !node.flags.contains(CommitFlags::SEEN) {
            node.flags |= CommitFlags::SEEN;
            self.push_queue_uninteresting(slot);
        } else if !was_uninteresting {
            // Already pending as interesting; it will now pop as
            // uninteresting instead.
            self.interesting_pending = self.interesting_pending.saturating_sub(1);
        }
        Ok(())
    }

    /// Walk flags currently recorded for `id`, if it entered the walk.
    #[must_use]
    pub fn flags_of(&self, id: &ObjectId) -> Option<CommitFlags> {
        self.slots
            .get(id)
            .map(|&slot| self.nodes[slot as usize].flags)
    }

    /// Pops the next commit.
    ///
    /// Interesting commits come out in commit-time order. With boundary
    /// mode on, uninteresting parents of emitted commits surface too,
    /// flagged `BOUNDARY`.
    pub fn next(&mut self) -> Result<Option<WalkCommit>, WalkError> {
        loop {
            if self.interesting_pending == 0 && !self.boundary {
                // Everything still pending is uninteresting ancestry.
                self.queue.clear();
                return Ok(None);
            }
            let Some(slot) = self.queue.pop() else {
                return Ok(None);
            };

            let uninteresting = {
                let node = &self.nodes[slot as usize];
                node.flags.contains(CommitFlags::UNINTERESTING)
            };
            if !uninteresting {
                self.interesting_pending -= 1;
            }

            self.expand_parents(slot)?;

            let node = &self.nodes[slot as usize];
            if uninteresting {
                if self.boundary && node.flags.contains(CommitFlags::BOUNDARY) {
                    return Ok(Some(self.emit(slot)));
                }
                continue;
            }
            return Ok(Some(self.emit(slot)));
        }
    }

    fn emit(&self, slot: u32) -> WalkCommit {
        let node = &self.nodes[slot as usize];
        WalkCommit {
            id: node.id,
            tree: node.tree,
            parents: node
                .parents
                .iter()
                .map(|&p| self.nodes[p as usize].id)
                .collect(),
            commit_time: node.commit_time,
            flags: node.flags,
        }
    }

    fn expand_parents(&mut self, slot: u32) -> Result<(), WalkError> {
        let (parents, uninteresting) = {
            let node = &self.nodes[slot as usize];
            (
                node.parents.clone(),
                node.flags.contains(CommitFlags::UNINTERESTING),
            )
        };

        for parent_slot in parents {
            self.ensure_parsed(parent_slot)?;
            let parent = &mut self.nodes[parent_slot as usize];
            let parent_was_uninteresting = parent.flags.contains(CommitFlags::UNINTERESTING);

            if uninteresting {
                parent.flags |= CommitFlags::UNINTERESTING;
            } else if parent_was_uninteresting {
                // Interesting child meeting excluded history: the fringe.
                parent.flags |= CommitFlags::BOUNDARY;
            }

            let parent = &mut self.nodes[parent_slot as usize];
            if !parent.flags.contains(CommitFlags::SEEN) {
                parent.flags |= CommitFlags::SEEN;
                if parent.flags.contains(CommitFlags::UNINTERESTING) {
                    self.push_queue_uninteresting(parent_slot);
                } else {
                    self.push_queue(parent_slot);
                }
            } else if uninteresting && !parent_was_uninteresting {
                // Newly poisoned while pending or already expanded:
                // repropagate through it so the whole ancestry is marked.
                self.interesting_pending = self.interesting_pending.saturating_sub(1);
                self.push_queue_uninteresting(parent_slot);
            }
        }
        Ok(())
    }

    fn push_queue(&mut self, slot: u32) {
        let node = &self.nodes[slot as usize];
        self.interesting_pending += 1;
        self.queue.push(slot, node.commit_time, node.generation);
    }

    fn push_queue_uninteresting(&mut self, slot: u32) {
        let node = &self.nodes[slot as usize];
        self.queue.push(slot, node.commit_time, node.generation);
    }

    fn lookup_or_parse(&mut self, id: ObjectId) -> Result<u32, WalkError> {
        if let Some(&slot) = self.slots.get(&id) {
            self.ensure_parsed(slot)?;
            return Ok(slot);
        }
        let slot = self.alloc(id);
        self.ensure_parsed(slot)?;
        Ok(slot)
    }

    fn alloc(&mut self, id: ObjectId) -> u32 {
        let slot = self.nodes.len() as u32;
        self.nodes.push(Node {
            id,
            tree: ObjectId::ZERO,
            parents: Vec::new(),
            commit_time: 0,
            generation: 0,
            flags: CommitFlags::EMPTY,
            parsed: false,
        });
        self.slots.insert(id, slot);
        slot
    }

    fn ensure_parsed(&mut self, slot: u32) -> Result<(), WalkError> {
        if self.nodes[slot as usize].parsed {
            return Ok(());
        }
        let id = self.nodes[slot as usize].id;
        let data = self.reader.read(&id)?;
        if data.kind != ObjectKind::Commit {
            return Err(WalkError::NotACommit { id });
        }
        let (tree, parent_ids, commit_time) = parse_for_walk(&data.bytes, id.format())
            .map_err(|source| WalkError::Parse { id, source })?;

        let hide_parents = self.shallow.contains(&id);
        let mut parents = Vec::with_capacity(parent_ids.len());
        if !hide_parents {
            for parent_id in parent_ids {
                let parent_slot = match self.slots.get(&parent_id) {
                    Some(&slot) => slot,
                    None => self.alloc(parent_id),
                };
                parents.push(parent_slot);
            }
        }

        let generation = self
            .graph
            .as_ref()
            .and_then(|graph| graph.generation(&id))
            .unwrap_or(0);

        let node = &mut self.nodes[slot as usize];
        node.tree = tree;
        node.parents = parents;
        node.commit_time = commit_time;
        node.generation = generation;
        node.parsed = true;
        Ok(())
    }
}
