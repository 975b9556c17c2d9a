//! Content hashing for object ids, pack trailers, and index CRCs.
//!
//! Object ids are the SHA-1 of the canonical serialization
//! `"<type> <size>\0<payload>"`. Pack and index files end with a SHA-1 over
//! all preceding bytes. Pack index v2 additionally stores a CRC-32 of each
//! entry's on-disk (compressed) bytes.

use std::io::{self, Write};

use sha1::{Digest, Sha1};

use crate::object::id::ObjectId;
use crate::object::kind::ObjectKind;

/// Computes the object id for a payload of the given kind.
#[must_use]
pub fn hash_object(kind: ObjectKind, payload: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(kind.name_bytes());
    hasher.update(b" ");
    hasher.update(payload.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(payload);
    ObjectId::sha1(hasher.finalize().into())
}

/// Incremental SHA-1 for streamed content (pack trailers, large objects).
#[derive(Default)]
pub struct Sha1Sum {
    hasher: Sha1,
}

impl Sha1Sum {
    /// Fresh hasher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hasher pre-seeded with an object header for `kind` and `size`.
    #[must_use]
    pub fn for_object(kind: ObjectKind, size: u64) -> Self {
        let mut sum = Self::new();
        sum.update(kind.name_bytes());
        sum.update(b" ");
        sum.update(size.to_string().as_bytes());
        sum.update(b"\0");
        sum
    }

    /// Feeds `data` into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalizes into an object id.
    #[must_use]
    pub fn finish(self) -> ObjectId {
        ObjectId::sha1(self.hasher.finalize().into())
    }
}

/// A [`Write`] adapter that hashes everything written through it.
///
/// The pack writer threads one of these around its output so the trailing
/// checksum covers exactly the bytes emitted.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha1,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wraps `inner`, hashing from the current position.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            written: 0,
        }
    }

    /// Total bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Digest of the bytes written so far, without consuming the writer.
    #[must_use]
    pub fn clone_digest(&self) -> [u8; 20] {
        self.hasher.clone().finalize().into()
    }

    /// Finalizes, returning the inner writer and the digest.
    pub fn finish(self) -> (W, [u8; 20]) {
        (self.inner, self.hasher.finalize().into())
    }

    /// Borrows the inner writer without hashing.
    ///
    /// Used to append the trailer, which the digest must not cover.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// CRC-32 of a byte slice (pack index v2 per-entry checksum).
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
