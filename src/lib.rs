//! Git-compatible object storage and smart-transfer protocol engine.
//!
//! This crate is a clean-room implementation of the storage and wire core of
//! a Git client: bit-compatible with Git's on-disk formats (loose objects,
//! packs, pack indexes, refs, reflogs, bundles) and its smart protocols
//! (pkt-line framing, fetch v0/v1 and v2, push).
//!
//! High-level flow (fetch):
//! 1) `transport` opens a bidirectional byte stream to a peer.
//! 2) `wire` frames it as pkt-lines; `protocol` negotiates wants/haves,
//!    feeding `have` candidates from `revwalk`.
//! 3) The peer's pack stream lands in `pack::parser`, which resolves
//!    deltas, completes thin packs, and indexes the pack into `odb`.
//! 4) `refs` publishes the updated ref state under its lock protocol.
//!
//! Push runs the same stages in reverse, with `pack::writer` producing the
//! outbound pack from a `revwalk`-driven object enumeration.
//!
//! Sessions (readers, inserters, protocol connections) are single-threaded;
//! the [`odb::ObjectDatabase`] and [`refs::RefStore`] coordinating them are
//! safe to share across independent sessions. Blocking happens only at file
//! and stream boundaries; long operations poll a [`monitor::ProgressMonitor`]
//! which carries the cancellation flag.

pub mod bundle;
pub mod delta;
pub mod env;
pub mod monitor;
pub mod object;
pub mod odb;
pub mod pack;
pub mod protocol;
pub mod raw;
pub mod refs;
pub mod repo;
pub mod revwalk;
pub mod transport;
pub mod treewalk;
pub mod wire;

pub use object::id::{AbbrevId, ObjectFormat, ObjectId};
pub use object::kind::ObjectKind;
pub use odb::store::ObjectDatabase;
pub use refs::store::RefStore;
pub use repo::Repository;
