//! Bounded zlib inflate and deflate framing.
//!
//! Loose objects and pack entries are zlib streams whose uncompressed size
//! is known (or capped) in advance. Every inflate helper here enforces a
//! hard output bound so corrupt or hostile input cannot trigger unbounded
//! allocation. Inflate state and the staging buffer are per-thread scratch,
//! so the hot path allocates only into the caller's output vector.
//!
//! The scratch state is not re-entrant on the same thread; callers must not
//! invoke inflate helpers recursively from within an `inflate_stream`
//! callback.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, Write};

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

/// Internal inflate staging buffer size.
const INFLATE_BUF_SIZE: usize = 64 * 1024;

thread_local! {
    static INFLATE_DECOMPRESS: RefCell<Decompress> = RefCell::new(Decompress::new(true));
    static INFLATE_BUF: RefCell<[u8; INFLATE_BUF_SIZE]> =
        const { RefCell::new([0u8; INFLATE_BUF_SIZE]) };
}

fn with_inflate_scratch<F, R>(f: F) -> R
where
    F: FnOnce(&mut Decompress, &mut [u8]) -> R,
{
    INFLATE_DECOMPRESS.with(|de| {
        INFLATE_BUF.with(|buf| {
            let mut de = de.borrow_mut();
            de.reset(true);
            let mut buf = buf.borrow_mut();
            f(&mut de, &mut *buf)
        })
    })
}

/// Inflate error taxonomy.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum InflateError {
    /// Output would exceed the caller's cap.
    LimitExceeded,
    /// Stream ended before producing the expected bytes.
    TruncatedInput,
    /// Decoder made no progress on non-empty input.
    Stalled,
    /// zlib backend reported corrupt data.
    Backend,
}

impl fmt::Display for InflateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LimitExceeded => write!(f, "inflate limit exceeded"),
            Self::TruncatedInput => write!(f, "truncated zlib input"),
            Self::Stalled => write!(f, "inflate stalled"),
            Self::Backend => write!(f, "inflate backend error"),
        }
    }
}

impl std::error::Error for InflateError {}

/// Inflates a zlib stream with a hard output cap.
///
/// Returns the number of input bytes consumed from `input`. The output
/// buffer is cleared before writing. On error, `out` may contain a partial
/// prefix; callers should discard it.
///
/// The stream need not end exactly at `input.len()`; callers use the
/// returned count to advance within a pack.
pub fn inflate_limited(
    input: &[u8],
    out: &mut Vec<u8>,
    max_out: usize,
) -> Result<usize, InflateError> {
    out.clear();

    with_inflate_scratch(|de, buf| {
        let mut in_pos: usize = 0;

        loop {
            let before_in = de.total_in() as usize;
            let before_out = de.total_out() as usize;

            let status = de
                .decompress(&input[in_pos..], buf, FlushDecompress::None)
                .map_err(|_| InflateError::Backend)?;

            let consumed = de.total_in() as usize - before_in;
            let produced = de.total_out() as usize - before_out;
            in_pos += consumed;

            if produced != 0 {
                if out.len() + produced > max_out {
                    return Err(InflateError::LimitExceeded);
                }
                out.extend_from_slice(&buf[..produced]);
            }

            match status {
                Status::StreamEnd => return Ok(in_pos),
                Status::Ok => {
                    if consumed == 0 && produced == 0 {
                        if in_pos >= input.len() {
                            return Err(InflateError::TruncatedInput);
                        }
                        return Err(InflateError::Stalled);
                    }
                }
                Status::BufError => {
                    if in_pos >= input.len() {
                        return Err(InflateError::TruncatedInput);
                    }
                }
            }
        }
    })
}

/// Inflates a zlib stream expecting exactly `expected` output bytes.
///
/// Returns the number of input bytes consumed from `input`.
pub fn inflate_exact(
    input: &[u8],
    out: &mut Vec<u8>,
    expected: usize,
) -> Result<usize, InflateError> {
    let consumed = inflate_limited(input, out, expected)?;
    if out.len() != expected {
        return Err(InflateError::TruncatedInput);
    }
    Ok(consumed)
}

/// Inflates a zlib stream into a caller-provided sink with an exact size.
///
/// The sink sees contiguous output chunks of unspecified size; total output
/// must equal `expected`. Returns the number of input bytes consumed.
pub fn inflate_stream(
    input: &[u8],
    expected: usize,
    mut on_chunk: impl FnMut(&[u8]) -> Result<(), InflateError>,
) -> Result<usize, InflateError> {
    with_inflate_scratch(|de, buf| {
        let mut in_pos: usize = 0;
        let mut out_total: usize = 0;

        loop {
            let before_in = de.total_in() as usize;
            let before_out = de.total_out() as usize;

            let status = de
                .decompress(&input[in_pos..], buf, FlushDecompress::None)
                .map_err(|_| InflateError::Backend)?;

            let consumed = de.total_in() as usize - before_in;
            let produced = de.total_out() as usize - before_out;
            in_pos += consumed;

            if produced != 0 {
                let end = out_total
                    .checked_add(produced)
                    .ok_or(InflateError::LimitExceeded)?;
                if end > expected {
                    return Err(InflateError::LimitExceeded);
                }
                on_chunk(&buf[..produced])?;
                out_total = end;
            }

            match status {
                Status::StreamEnd => {
                    if out_total != expected {
                        return Err(InflateError::TruncatedInput);
                    }
                    return Ok(in_pos);
                }
                Status::Ok => {
                    if consumed == 0 && produced == 0 {
                        if in_pos >= input.len() {
                            return Err(InflateError::TruncatedInput);
                        }
                        return Err(InflateError::Stalled);
                    }
                }
                Status::BufError => {
                    if in_pos >= input.len() {
                        return Err(InflateError::TruncatedInput);
                    }
                }
            }
        }
    })
}

/// Deflates `input` into a fresh buffer at the default compression level.
pub fn deflate(input: &[u8]) -> io::Result<Vec<u8>> {
    deflate_at(input, Compression::default())
}

/// Deflates `input` at an explicit compression level.
pub fn deflate_at(input: &[u8], level: Compression) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len() / 2 + 16), level);
    encoder.write_all(input)?;
    encoder.finish()
}

/// A [`Write`] adapter that deflates everything written through it.
///
/// Used by the loose-object and pack writers so payload bytes are hashed
/// and compressed in one pass.
pub struct DeflateSink<W: Write> {
    encoder: ZlibEncoder<W>,
}

impl<W: Write> DeflateSink<W> {
    /// Wraps `inner` at the default compression level.
    pub fn new(inner: W) -> Self {
        Self {
            encoder: ZlibEncoder::new(inner, Compression::default()),
        }
    }

    /// Finishes the zlib stream and returns the inner writer.
    pub fn finish(self) -> io::Result<W> {
        self.encoder.finish()
    }
}

impl<W: Write> Write for DeflateSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}
