//! The pkt-line framed wire protocol and its sideband multiplexing.

pub mod pktline;
pub mod sideband;

pub use pktline::{Frame, PktReader, PktWriter, WireError, MAX_PAYLOAD};
pub use sideband::{SidebandReader, SidebandWriter, CH_DATA, CH_ERROR, CH_PROGRESS};
