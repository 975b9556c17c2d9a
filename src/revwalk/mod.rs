//! Commit graph traversal: flags, the commit-time priority queue, the
//! commit-graph file reader (generation numbers), and the walker itself.

pub mod flags;
pub mod graph;
pub mod queue;
pub mod walk;

pub use flags::CommitFlags;
pub use graph::CommitGraphFile;
pub use walk::{RevWalk, WalkCommit, WalkError};
