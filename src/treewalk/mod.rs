//! Ordered multi-tree traversal.

pub mod walk;

pub use walk::{MatchedEntry, TreeWalk, TreeWalkError, WalkRow};
