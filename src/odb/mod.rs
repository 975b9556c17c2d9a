//! The content-addressed object database: loose store, packed store,
//! alternates, and the insertion paths.
//!
//! A database hands out single-threaded sessions: [`traits::ObjectReader`]
//! for lookups and [`traits::ObjectInserter`] for writes. The database
//! itself is safe to share across sessions; the published pack list is a
//! copy-on-write snapshot, so readers never observe a half-installed pack.

pub mod loose;
pub mod store;
pub mod traits;

use std::fmt;
use std::io;

use crate::object::id::ObjectId;
use crate::pack::file::PackFileError;
use crate::pack::idx::IdxError;
use crate::pack::reader::PackReadError;
use crate::raw::zlib::InflateError;

pub use store::{ObjectDatabase, OdbReader};
pub use traits::{ObjectData, ObjectInserter, ObjectReader};

/// Errors from object database operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum OdbError {
    /// Referenced object does not exist.
    Missing { id: ObjectId },
    /// Object exists but with a different type than required.
    TypeMismatch {
        id: ObjectId,
        expected: &'static str,
    },
    /// On-disk data violates a format invariant.
    Corrupt { detail: String },
    /// Underlying I/O failure.
    Io(io::Error),
}

impl OdbError {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for OdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { id } => write!(f, "object {id} missing"),
            Self::TypeMismatch { id, expected } => {
                write!(f, "object {id} is not a {expected}")
            }
            Self::Corrupt { detail } => write!(f, "corrupt object store: {detail}"),
            Self::Io(err) => write!(f, "object store I/O error: {err}"),
        }
    }
}

impl std::error::Error for OdbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for OdbError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<InflateError> for OdbError {
    fn from(err: InflateError) -> Self {
        Self::corrupt(err.to_string())
    }
}

impl From<PackFileError> for OdbError {
    fn from(err: PackFileError) -> Self {
        Self::corrupt(err.to_string())
    }
}

impl From<IdxError> for OdbError {
    fn from(err: IdxError) -> Self {
        Self::corrupt(err.to_string())
    }
}

impl From<PackReadError> for OdbError {
    fn from(err: PackReadError) -> Self {
        match err {
            PackReadError::NotFound { id } | PackReadError::MissingBase { base_id: id } => {
                Self::Missing { id }
            }
            other => Self::corrupt(other.to_string()),
        }
    }
}
