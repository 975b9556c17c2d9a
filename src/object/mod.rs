//! The typed, immutable Git object model.
//!
//! Objects are parsed from and serialized to the canonical payloads that the
//! object id is computed over; parsing never normalizes, so a parse/serialize
//! round trip is byte-identical and id-stable.

pub mod commit;
pub mod id;
pub mod ident;
pub mod kind;
pub mod tag;
pub mod tree;

pub use commit::Commit;
pub use id::{AbbrevId, ObjectFormat, ObjectId};
pub use ident::PersonIdent;
pub use kind::ObjectKind;
pub use tag::Tag;
pub use tree::{EntryMode, TreeEntry};
