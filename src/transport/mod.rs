//! Transport dispatch: URI parsing, the scheme registry, connection
//! traits, credentials, and the in-process `file://` transport.
//!
//! A transport's only job is to supply a bidirectional byte stream to the
//! remote `upload-pack` or `receive-pack`; the protocol engine is
//! carrier-agnostic. Network carriers (ssh, git, http) are registered
//! with their URI shapes and default ports but open through external
//! machinery; the local transport is fully in-process and doubles as the
//! reference implementation for tests.

pub mod credentials;
pub mod hook;
pub mod local;
pub mod pipe;
pub mod registry;
pub mod uri;

use std::fmt;
use std::io::{self, Read, Write};

pub use local::LocalTransport;
pub use registry::{TransportRegistry, TransportScheme};
pub use uri::Uri;

/// Errors from transport setup and teardown.
#[derive(Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// URI could not be parsed.
    BadUri { detail: String },
    /// No registered transport handles the scheme.
    UnsupportedScheme { scheme: String },
    /// The scheme is known but this build carries no carrier for it.
    NoCarrier { scheme: String },
    /// Peer denied credentials; the original message allows reprompting.
    Auth { message: String },
    /// Connect or I/O deadline exceeded.
    Timeout { seconds: u32 },
    /// Target repository missing or unreadable.
    NotARepository { detail: String },
    /// Underlying stream or process failure.
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadUri { detail } => write!(f, "bad remote URI: {detail}"),
            Self::UnsupportedScheme { scheme } => write!(f, "unsupported scheme: {scheme}"),
            Self::NoCarrier { scheme } => {
                write!(f, "no transport carrier built in for {scheme}")
            }
            Self::Auth { message } => write!(f, "authentication failed: {message}"),
            Self::Timeout { seconds } => write!(f, "transport timeout after {seconds}s"),
            Self::NotARepository { detail } => write!(f, "not a repository: {detail}"),
            Self::Io(err) => write!(f, "transport I/O error: {err}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// A connected bidirectional byte stream to a remote service.
pub struct BidiStream {
    /// Bytes from the remote.
    pub input: Box<dyn Read + Send>,
    /// Bytes to the remote.
    pub output: Box<dyn Write + Send>,
}

/// An opened transport with the three lifecycle points.
pub trait Transport {
    /// Connects to the remote's `upload-pack` (fetch direction).
    fn open_fetch(&mut self) -> Result<BidiStream, TransportError>;

    /// Connects to the remote's `receive-pack` (push direction).
    fn open_push(&mut self) -> Result<BidiStream, TransportError>;

    /// Releases resources; further opens fail.
    fn close(&mut self);
}
