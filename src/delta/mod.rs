//! The delta codec: compact instruction streams transforming one byte
//! buffer into another, and their application.
//!
//! The stream format (shared by OFS_DELTA and REF_DELTA pack entries) is a
//! pair of varint lengths followed by copy/insert instructions; see
//! [`apply`] for the decoder and [`encode`] for the sliding-window encoder
//! built on [`DeltaIndex`].

pub mod apply;
pub mod encode;
pub mod index;

pub use apply::{apply_delta, apply_delta_into, delta_header_sizes, DeltaApplyError};
pub use encode::{encode_delta, DeltaEncoder};
pub use index::DeltaIndex;
