//! Session traits over object stores.
//!
//! The abstract store is split into a reader trait and an inserter trait;
//! concrete stores implement one or both. Sessions are single-threaded and
//! not shareable; independent sessions over the same database may run
//! concurrently.

use crate::object::id::{AbbrevId, ObjectId};
use crate::object::kind::ObjectKind;

use super::OdbError;

/// A fully inflated object.
#[derive(Clone, Debug)]
pub struct ObjectData {
    /// Actual stored kind.
    pub kind: ObjectKind,
    /// Payload bytes (no loose header).
    pub bytes: Vec<u8>,
}

impl ObjectData {
    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Read session over an object store.
pub trait ObjectReader {
    /// True when `id` exists in this store (or its alternates).
    fn contains(&mut self, id: &ObjectId) -> Result<bool, OdbError>;

    /// Reads an object, failing with [`OdbError::Missing`] when absent.
    fn read(&mut self, id: &ObjectId) -> Result<ObjectData, OdbError>;

    /// Reads an object, requiring it to be of `kind`.
    fn read_kind(&mut self, id: &ObjectId, kind: ObjectKind) -> Result<ObjectData, OdbError> {
        let data = self.read(id)?;
        if data.kind != kind {
            return Err(OdbError::TypeMismatch {
                id: *id,
                expected: match kind {
                    ObjectKind::Commit => "commit",
                    ObjectKind::Tree => "tree",
                    ObjectKind::Blob => "blob",
                    ObjectKind::Tag => "tag",
                },
            });
        }
        Ok(data)
    }

    /// Collects up to `limit` ids matching an abbreviated prefix.
    fn resolve_prefix(
        &mut self,
        prefix: &AbbrevId,
        limit: usize,
    ) -> Result<Vec<ObjectId>, OdbError>;
}

/// Write session over an object store.
///
/// Inserts are write-once: inserting a payload whose id already exists is
/// indistinguishable from a no-op.
pub trait ObjectInserter {
    /// Stores a payload, returning its id.
    fn insert(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId, OdbError>;

    /// Makes completed inserts durable (fsync of files created so far).
    fn flush(&mut self) -> Result<(), OdbError>;
}
