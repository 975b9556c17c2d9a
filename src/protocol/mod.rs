//! The smart-transfer protocol engine: capability negotiation, ref
//! advertisement, the fetch state machines (v0/v1 and v2), push, and the
//! server side of both.
//!
//! The v0/v1 and v2 protocols are distinct state machines that share only
//! pkt-line framing; nothing here abstracts over the two.

pub mod advert;
pub mod caps;
pub mod fetch;
pub mod fetch_v2;
pub mod negotiate;
pub mod push;
pub mod receive;
pub mod shallow;
pub mod upload;

use std::fmt;
use std::io;

use crate::odb::OdbError;
use crate::pack::parser::ParseError;
use crate::pack::writer::WriteError;
use crate::refs::RefError;
use crate::revwalk::walk::WalkError;
use crate::wire::pktline::WireError;

/// Errors from protocol sessions.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Framing failure underneath the protocol.
    Wire(WireError),
    /// A frame arrived that the current state cannot accept.
    UnexpectedFrame { detail: String },
    /// The peer lacks a capability this operation requires.
    MissingCapability { name: &'static str },
    /// The peer sent an `ERR` line or fatal sideband message.
    Remote { message: String },
    /// Inbound pack failed to parse or index.
    Pack(ParseError),
    /// Outbound pack failed to build.
    PackWrite(WriteError),
    /// Object store failure.
    Odb(OdbError),
    /// Ref storage failure.
    Ref(RefError),
    /// Revision walk failure.
    Walk(WalkError),
    /// Caller error (empty want list, duplicate ref, ...).
    InvalidArgument { detail: String },
    /// Cancellation observed between frames.
    Cancelled,
    /// Raw stream failure outside framing.
    Io(io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(err) => write!(f, "{err}"),
            Self::UnexpectedFrame { detail } => write!(f, "unexpected frame: {detail}"),
            Self::MissingCapability { name } => {
                write!(f, "peer does not support required capability {name}")
            }
            Self::Remote { message } => write!(f, "remote error: {message}"),
            Self::Pack(err) => write!(f, "{err}"),
            Self::PackWrite(err) => write!(f, "{err}"),
            Self::Odb(err) => write!(f, "{err}"),
            Self::Ref(err) => write!(f, "{err}"),
            Self::Walk(err) => write!(f, "{err}"),
            Self::InvalidArgument { detail } => write!(f, "invalid argument: {detail}"),
            Self::Cancelled => write!(f, "protocol session cancelled"),
            Self::Io(err) => write!(f, "stream error: {err}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wire(err) => Some(err),
            Self::Pack(err) => Some(err),
            Self::PackWrite(err) => Some(err),
            Self::Odb(err) => Some(err),
            Self::Ref(err) => Some(err),
            Self::Walk(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<WireError> for ProtocolError {
    fn from(err: WireError) -> Self {
        Self::Wire(err)
    }
}

impl From<ParseError> for ProtocolError {
    fn from(err: ParseError) -> Self {
        Self::Pack(err)
    }
}

impl From<WriteError> for ProtocolError {
    fn from(err: WriteError) -> Self {
        Self::PackWrite(err)
    }
}

impl From<OdbError> for ProtocolError {
    fn from(err: OdbError) -> Self {
        Self::Odb(err)
    }
}

impl From<RefError> for ProtocolError {
    fn from(err: RefError) -> Self {
        Self::Ref(err)
    }
}

impl From<WalkError> for ProtocolError {
    fn from(err: WalkError) -> Self {
        Self::Walk(err)
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
