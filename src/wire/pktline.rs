//! pkt-line framing.
//!
//! Every frame is a 4-digit ASCII hex length (covering the 4 digits
//! themselves) followed by the payload. Lengths 0-3 are reserved control
//! frames:
//!
//! - `0000` flush-pkt: end of a message section.
//! - `0001` delim-pkt: argument separator (protocol v2).
//! - `0002` response-end-pkt: end of a stateless response (protocol v2).
//!
//! The largest payload is 65516 bytes (65520 minus the length prefix).
//! Reads yield sum-typed [`Frame`] values; protocol state machines match
//! on them rather than sniffing byte prefixes.

use std::fmt;
use std::io::{self, Read, Write};

/// Maximum bytes in one frame's payload.
pub const MAX_PAYLOAD: usize = 65516;

/// Length prefix size.
const PREFIX: usize = 4;

/// Errors from pkt-line framing.
#[derive(Debug)]
#[non_exhaustive]
pub enum WireError {
    /// Length prefix was not 4 hex digits.
    BadLength { digits: [u8; 4] },
    /// Length 3 or a length smaller than its own prefix.
    ReservedLength { length: u16 },
    /// Payload larger than [`MAX_PAYLOAD`].
    Oversized { length: usize },
    /// Stream ended mid-frame.
    TruncatedFrame,
    /// Stream ended cleanly where a frame was required.
    UnexpectedEof,
    /// Underlying stream failure.
    Io(io::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLength { digits } => {
                write!(f, "bad pkt-line length {:?}", String::from_utf8_lossy(digits))
            }
            Self::ReservedLength { length } => write!(f, "reserved pkt-line length {length}"),
            Self::Oversized { length } => write!(f, "pkt-line payload of {length} bytes"),
            Self::TruncatedFrame => write!(f, "truncated pkt-line frame"),
            Self::UnexpectedEof => write!(f, "unexpected end of pkt-line stream"),
            Self::Io(err) => write!(f, "pkt-line I/O error: {err}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// One wire frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Data frame with payload.
    Data(Vec<u8>),
    /// `0000`.
    Flush,
    /// `0001`.
    Delim,
    /// `0002`.
    ResponseEnd,
}

impl Frame {
    /// Payload bytes for data frames.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Payload as text with a trailing newline stripped, the usual shape
    /// of command and capability lines.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        let data = self.data()?;
        let line = std::str::from_utf8(data).ok()?;
        Some(line.strip_suffix('\n').unwrap_or(line))
    }
}

/// Reader half of a pkt-line stream.
pub struct PktReader<R> {
    inner: R,
}

impl<R: Read> PktReader<R> {
    /// Wraps a byte stream.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads one frame; `None` at a clean stream end.
    pub fn read(&mut self) -> Result<Option<Frame>, WireError> {
        let mut digits = [0u8; PREFIX];
        match read_exact_or_eof(&mut self.inner, &mut digits)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => return Err(WireError::TruncatedFrame),
            ReadOutcome::Full => {}
        }

        let mut length: u16 = 0;
        for &digit in &digits {
            let value = match digit {
                b'0'..=b'9' => digit - b'0',
                b'a'..=b'f' => digit - b'a' + 10,
                b'A'..=b'F' => digit - b'A' + 10,
                _ => return Err(WireError::BadLength { digits }),
            };
            length = (length << 4) | value as u16;
        }

        match length {
            0 => return Ok(Some(Frame::Flush)),
            1 => return Ok(Some(Frame::Delim)),
            2 => return Ok(Some(Frame::ResponseEnd)),
            3 => return Err(WireError::ReservedLength { length }),
            _ => {}
        }
        let payload_len = length as usize - PREFIX;
        if length as usize <= PREFIX {
            return Err(WireError::ReservedLength { length });
        }
        if payload_len > MAX_PAYLOAD {
            return Err(WireError::Oversized {
                length: payload_len,
            });
        }

        let mut payload = vec![0u8; payload_len];
        self.inner
            .read_exact(&mut payload)
            .map_err(|err| match err.kind() {
                io::ErrorKind::UnexpectedEof => WireError::TruncatedFrame,
                _ => WireError::Io(err),
            })?;
        Ok(Some(Frame::Data(payload)))
    }

    /// Reads a frame, treating stream end as a protocol violation.
    pub fn read_required(&mut self) -> Result<Frame, WireError> {
        self.read()?.ok_or(WireError::UnexpectedEof)
    }

    /// Collects frames until a flush (or stream end); the flush itself
    /// is consumed and not returned.
    pub fn read_until_flush(&mut self) -> Result<Vec<Frame>, WireError> {
        let mut frames = Vec::new();
        loop {
            match self.read()? {
                None | Some(Frame::Flush) => return Ok(frames),
                Some(frame) => frames.push(frame),
            }
        }
    }

    /// The underlying stream (for handing off to a pack parser).
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Unwraps the reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writer half of a pkt-line stream.
pub struct PktWriter<W> {
    inner: W,
}

impl<W: Write> PktWriter<W> {
    /// Wraps a byte stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one data frame.
    pub fn write_data(&mut self, payload: &[u8]) -> Result<(), WireError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::Oversized {
                length: payload.len(),
            });
        }
        let length = payload.len() + PREFIX;
        let mut prefix = [0u8; PREFIX];
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        for (i, slot) in prefix.iter_mut().enumerate() {
            *slot = DIGITS[(length >> (12 - 4 * i)) & 0xf];
        }
        self.inner.write_all(&prefix)?;
        self.inner.write_all(payload)?;
        Ok(())
    }

    /// Writes a text line, appending the conventional trailing newline.
    pub fn write_text(&mut self, line: &str) -> Result<(), WireError> {
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
        self.write_data(&payload)
    }

    /// Writes `0000`.
    pub fn flush_pkt(&mut self) -> Result<(), WireError> {
        self.inner.write_all(b"0000")?;
        Ok(())
    }

    /// Writes `0001`.
    pub fn delim_pkt(&mut self) -> Result<(), WireError> {
        self.inner.write_all(b"0001")?;
        Ok(())
    }

    /// Writes `0002`.
    pub fn response_end_pkt(&mut self) -> Result<(), WireError> {
        self.inner.write_all(b"0002")?;
        Ok(())
    }

    /// Flushes the underlying stream.
    pub fn flush_io(&mut self) -> Result<(), WireError> {
        self.inner.flush()?;
        Ok(())
    }

    /// The underlying stream (for streaming a pack after negotiation).
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwraps the writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, WireError> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(ReadOutcome::Full)
}
