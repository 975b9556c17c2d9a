//! K-way merge over sorted tree iterators.
//!
//! Walks any number of trees in parallel, yielding one row per path with
//! the matching entry (or absence) from each input tree. Rows come out in
//! canonical tree order. Subtrees are entered when the caller asks for it
//! (or automatically in recursive mode), so consumers can prune whole
//! directories they do not care about.
//!
//! # D/F conflicts
//! In name-conflict mode a *file* named `a` in one tree pairs with a
//! *directory* named `a` in another, which plain directory-suffix order
//! would keep apart. Diff and merge need to see both sides of such a
//! conflict together; pack enumeration uses the same pairing to place a
//! replaced file next to its replacing subtree.

use std::cmp::Ordering;

use crate::object::id::ObjectId;
use crate::object::kind::ObjectKind;
use crate::object::tree::{EntryMode, TreeEntry, TreeIter, TreeParseError};
use crate::odb::traits::ObjectReader;
use crate::odb::OdbError;

/// Errors from tree walking.
#[derive(Debug)]
#[non_exhaustive]
pub enum TreeWalkError {
    /// A referenced tree is absent.
    Missing { id: ObjectId },
    /// A referenced object is not a tree.
    NotATree { id: ObjectId },
    /// Tree payload is malformed.
    Parse(TreeParseError),
    /// Object store failure.
    Odb(OdbError),
}

impl std::fmt::Display for TreeWalkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing { id } => write!(f, "tree {id} missing"),
            Self::NotATree { id } => write!(f, "object {id} is not a tree"),
            Self::Parse(err) => write!(f, "{err}"),
            Self::Odb(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for TreeWalkError {}

impl From<OdbError> for TreeWalkError {
    fn from(err: OdbError) -> Self {
        match err {
            OdbError::Missing { id } => Self::Missing { id },
            OdbError::TypeMismatch { id, .. } => Self::NotATree { id },
            other => Self::Odb(other),
        }
    }
}

impl From<TreeParseError> for TreeWalkError {
    fn from(err: TreeParseError) -> Self {
        Self::Parse(err)
    }
}

/// An entry matched at the current path in one input tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedEntry {
    /// Entry mode.
    pub mode: EntryMode,
    /// Target id.
    pub id: ObjectId,
}

/// One row of the merged walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkRow {
    /// Full slash-separated path from the walk roots.
    pub path: Vec<u8>,
    /// Per-input-tree entry, `None` where the tree lacks this name.
    pub entries: Vec<Option<MatchedEntry>>,
}

impl WalkRow {
    /// True when any matched entry is a subtree.
    #[must_use]
    pub fn has_subtree(&self) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|entry| entry.mode.is_tree())
    }

    /// True when file and directory entries share this name (D/F conflict).
    #[must_use]
    pub fn is_df_conflict(&self) -> bool {
        let mut saw_tree = false;
        let mut saw_nontree = false;
        for entry in self.entries.iter().flatten() {
            if entry.mode.is_tree() {
                saw_tree = true;
            } else {
                saw_nontree = true;
            }
        }
        saw_tree && saw_nontree
    }
}

#[derive(Clone, Debug)]
struct OwnedEntry {
    mode: EntryMode,
    name: Vec<u8>,
    id: ObjectId,
}

struct Frame {
    prefix: Vec<u8>,
    cursors: Vec<Vec<OwnedEntry>>,
    positions: Vec<usize>,
}

/// Merged walk over up to k trees.
pub struct TreeWalk<'r, R: ObjectReader> {
    reader: &'r mut R,
    stack: Vec<Frame>,
    name_conflict: bool,
    recursive: bool,
    /// Pending subtree ids to enter when the last row is descended.
    pending_subtrees: Option<(Vec<u8>, Vec<Option<ObjectId>>)>,
}

impl<'r, R: ObjectReader> TreeWalk<'r, R> {
    /// Starts a walk over `roots`; `None` roots are empty trees.
    pub fn new(reader: &'r mut R, roots: &[Option<ObjectId>]) -> Result<Self, TreeWalkError> {
        let mut walk = Self {
            reader,
            stack: Vec::new(),
            name_conflict: false,
            recursive: false,
            pending_subtrees: None,
        };
        let frame = walk.load_frame(Vec::new(), roots)?;
        walk.stack.push(frame);
        Ok(walk)
    }

    /// Pairs file and directory entries of equal name (D/F conflicts).
    pub fn set_name_conflict(&mut self, enabled: bool) {
        self.name_conflict = enabled;
    }

    /// Automatically descends into every matched subtree.
    pub fn set_recursive(&mut self, enabled: bool) {
        self.recursive = enabled;
    }

    fn load_frame(
        &mut self,
        prefix: Vec<u8>,
        roots: &[Option<ObjectId>],
    ) -> Result<Frame, TreeWalkError> {
        let mut cursors = Vec::with_capacity(roots.len());
        for root in roots {
            match root {
                None => cursors.push(Vec::new()),
                Some(id) => {
                    let data = self.reader.read_kind(id, ObjectKind::Tree)?;
                    let mut entries = Vec::new();
                    for entry in TreeIter::new(&data.bytes, id.format()) {
                        let TreeEntry { mode, name, id } = entry?;
                        entries.push(OwnedEntry {
                            mode,
                            name: name.to_vec(),
                            id,
                        });
                    }
                    cursors.push(entries);
                }
            }
        }
        let positions = vec![0; cursors.len()];
        Ok(Frame {
            prefix,
            cursors,
            positions,
        })
    }

    /// Enters the subtrees matched by the most recent row.
    ///
    /// Trees that matched a non-tree entry (or nothing) contribute empty
    /// iterators below this path.
    pub fn enter_subtree(&mut self) -> Result<(), TreeWalkError> {
        let Some((prefix, subtree_ids)) = self.pending_subtrees.take() else {
            return Ok(());
        };
        let frame = self.load_frame(prefix, &subtree_ids)?;
        self.stack.push(frame);
        Ok(())
    }

    /// Produces the next row in canonical order.
    pub fn next(&mut self) -> Result<Option<WalkRow>, TreeWalkError> {
        self.pending_subtrees = None;
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };

            // Minimum head across cursors under the active comparator.
            let mut min: Option<(usize, bool)> = None;
            for (tree_idx, entries) in frame.cursors.iter().enumerate() {
                let Some(head) = entries.get(frame.positions[tree_idx]) else {
                    continue;
                };
                match min {
                    None => min = Some((tree_idx, head.mode.is_tree())),
                    Some((best_idx, best_is_tree)) => {
                        let best = &frame.cursors[best_idx][frame.positions[best_idx]];
                        let order = compare_names(
                            &head.name,
                            head.mode.is_tree(),
                            &best.name,
                            best_is_tree,
                            self.name_conflict,
                        );
                        if order == Ordering::Less {
                            min = Some((tree_idx, head.mode.is_tree()));
                        }
                    }
                }
            }

            let Some((min_idx, min_is_tree)) = min else {
                self.stack.pop();
                continue;
            };

            let min_name = frame.cursors[min_idx][frame.positions[min_idx]].name.clone();
            let mut entries: Vec<Option<MatchedEntry>> = Vec::with_capacity(frame.cursors.len());
            let mut subtree_ids: Vec<Option<ObjectId>> = Vec::with_capacity(frame.cursors.len());
            for (tree_idx, cursor) in frame.cursors.iter().enumerate() {
                let head = cursor.get(frame.positions[tree_idx]);
                let matched = head.is_some_and(|head| {
                    compare_names(
                        &head.name,
                        head.mode.is_tree(),
                        &min_name,
                        min_is_tree,
                        self.name_conflict,
                    ) == Ordering::Equal
                });
                if matched {
                    let head = cursor[frame.positions[tree_idx]].clone();
                    frame.positions[tree_idx] += 1;
                    subtree_ids.push(head.mode.is_tree().then_some(head.id));
                    entries.push(Some(MatchedEntry {
                        mode: head.mode,
                        id: head.id,
                    }));
                } else {
                    subtree_ids.push(None);
                    entries.push(None);
                }
            }

            let mut path = frame.prefix.clone();
            if !path.is_empty() {
                path.push(b'/');
            }
            path.extend_from_slice(&min_name);

            let row = WalkRow { path, entries };
            if row.has_subtree() {
                self.pending_subtrees = Some((row.path.clone(), subtree_ids));
                if self.recursive {
                    self.enter_subtree()?;
                }
            }
            return Ok(Some(row));
        }
    }
}

/// Entry-name order; with `name_conflict`, file and tree of equal raw
/// name compare equal so they surface in one row.
fn compare_names(
    a: &[u8],
    a_is_tree: bool,
    b: &[u8],
    b_is_tree: bool,
    name_conflict: bool,
) -> Ordering {
    if name_conflict && a == b {
        return Ordering::Equal;
    }
    TreeEntry::compare_names(a, a_is_tree, b, b_is_tree)
}
