//! The pack object engine: index and pack file readers, random-access
//! object inflation, inbound pack indexing, and the pack writer.
//!
//! A stored pack is always a `pack-<hex>.pack` / `pack-<hex>.idx` pair;
//! readers mmap both and never mutate them. Inbound packs stream through
//! [`parser::PackParser`], which resolves deltas, completes thin packs, and
//! installs the pair atomically (index first). Outbound packs stream from
//! [`writer::PackWriter`].

pub mod cache;
pub mod file;
pub mod idx;
pub mod idx_write;
pub mod parser;
pub mod reader;
pub mod writer;

pub use cache::DeltaBaseCache;
pub use file::PackFile;
pub use idx::{IdxVersion, PackIndex};
pub use parser::{PackParser, ParserConfig, ParserStats};
pub use reader::PackReader;
pub use writer::{PackWriter, WriterConfig, WriterStats};

/// Size of the `"PACK"` + version + count pack header.
pub const PACK_HEADER_SIZE: usize = 12;

/// Pack entry type code for OFS_DELTA.
pub const OFS_DELTA: u8 = 6;
/// Pack entry type code for REF_DELTA.
pub const REF_DELTA: u8 = 7;
