//! The `packed-refs` file: one-line-per-ref consolidation of many refs.
//!
//! ```text
//! # pack-refs with: peeled fully-peeled sorted
//! <hex-id> <refname>
//! ^<hex-peeled-id>
//! ```
//!
//! A `^` line records the peeled target of the annotated tag named by the
//! preceding ref line. Entries are kept sorted by name; the writer always
//! emits the `peeled fully-peeled sorted` header, matching modern Git.

use std::fmt;

use memchr::memchr;

use crate::object::id::ObjectId;

use super::RefError;

/// Header the writer emits.
const HEADER: &str = "# pack-refs with: peeled fully-peeled sorted\n";

/// One entry of a packed-refs file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedRef {
    /// Full ref name.
    pub name: String,
    /// Ref value.
    pub id: ObjectId,
    /// Peeled target when the ref is an annotated tag.
    pub peeled: Option<ObjectId>,
}

impl fmt::Display for PackedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.name)?;
        if let Some(peeled) = &self.peeled {
            write!(f, "\n^{peeled}")?;
        }
        Ok(())
    }
}

/// Parses a packed-refs file body.
///
/// Unknown header lines (`#` prefix) are skipped; a `^` line with no
/// preceding ref entry is corrupt.
pub fn parse(text: &[u8]) -> Result<Vec<PackedRef>, RefError> {
    let mut refs: Vec<PackedRef> = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let line_end = memchr(b'\n', rest).unwrap_or(rest.len());
        let line = &rest[..line_end];
        rest = &rest[(line_end + 1).min(rest.len())..];

        if line.is_empty() || line[0] == b'#' {
            continue;
        }
        if line[0] == b'^' {
            let peeled = ObjectId::from_hex(&line[1..]).map_err(|_| RefError::Corrupt {
                detail: "bad peeled id in packed-refs".to_owned(),
            })?;
            let last = refs.last_mut().ok_or_else(|| RefError::Corrupt {
                detail: "peel line without preceding ref".to_owned(),
            })?;
            last.peeled = Some(peeled);
            continue;
        }

        let space = memchr(b' ', line).ok_or_else(|| RefError::Corrupt {
            detail: "packed-refs line missing separator".to_owned(),
        })?;
        let id = ObjectId::from_hex(&line[..space]).map_err(|_| RefError::Corrupt {
            detail: "bad id in packed-refs".to_owned(),
        })?;
        let name = std::str::from_utf8(&line[space + 1..])
            .map_err(|_| RefError::Corrupt {
                detail: "non-UTF-8 ref name in packed-refs".to_owned(),
            })?
            .to_owned();
        refs.push(PackedRef {
            name,
            id,
            peeled: None,
        });
    }
    Ok(refs)
}

/// Serializes entries (sorted by name) with the standard header.
#[must_use]
pub fn serialize(refs: &[PackedRef]) -> Vec<u8> {
    let mut sorted: Vec<&PackedRef> = refs.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = Vec::with_capacity(HEADER.len() + refs.len() * 64);
    out.extend_from_slice(HEADER.as_bytes());
    for entry in sorted {
        out.extend_from_slice(entry.id.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(entry.name.as_bytes());
        out.push(b'\n');
        if let Some(peeled) = &entry.peeled {
            out.push(b'^');
            out.extend_from_slice(peeled.to_string().as_bytes());
            out.push(b'\n');
        }
    }
    out
}

/// Binary search for `name` in a sorted entry list.
#[must_use]
pub fn find<'a>(refs: &'a [PackedRef], name: &str) -> Option<&'a PackedRef> {
    refs.binary_search_by(|entry| entry.name.as_str().cmp(name))
        .ok()
        .map(|idx| &refs[idx])
}
