//! Parser and serializer for commit objects.
//!
//! # Commit Object Format
//! ```text
//! tree <hex-oid>\n
//! parent <hex-oid>\n     (zero or more, in order)
//! author <ident>\n
//! committer <ident>\n
//! [encoding <name>\n]
//! [gpgsig <sig first line>\n( <continuation>\n)*]
//! \n
//! <message>
//! ```
//!
//! Parsing keeps every field needed to re-serialize the object byte-exactly:
//! unknown header lines are preserved verbatim so ids survive a parse/write
//! round trip even for commits with extension headers.

use std::fmt;

use memchr::memchr;

use super::id::{ObjectFormat, ObjectId};
use super::ident::{IdentError, PersonIdent};

/// Errors from commit parsing.
#[derive(Debug)]
#[non_exhaustive]
pub enum CommitParseError {
    /// Commit data is corrupt or malformed.
    Corrupt { detail: &'static str },
    /// Too many parent commits.
    TooManyParents { count: usize, max: usize },
    /// An id field failed to parse.
    BadId { detail: &'static str },
    /// Author or committer line failed to parse.
    BadIdent(IdentError),
}

impl CommitParseError {
    #[inline]
    pub(crate) const fn corrupt(detail: &'static str) -> Self {
        Self::Corrupt { detail }
    }
}

impl fmt::Display for CommitParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt commit: {detail}"),
            Self::TooManyParents { count, max } => {
                write!(f, "too many parents: {count} (max: {max})")
            }
            Self::BadId { detail } => write!(f, "corrupt commit id field: {detail}"),
            Self::BadIdent(err) => write!(f, "corrupt commit identity: {err}"),
        }
    }
}

impl std::error::Error for CommitParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BadIdent(err) => Some(err),
            _ => None,
        }
    }
}

impl From<IdentError> for CommitParseError {
    fn from(err: IdentError) -> Self {
        Self::BadIdent(err)
    }
}

/// Upper bound on parents; octopus merges in real history stay far below.
const MAX_PARENTS: usize = 1024;

/// A parsed commit.
#[derive(Clone, Debug)]
pub struct Commit {
    /// Root tree id.
    pub tree: ObjectId,
    /// Parent ids, in header order (empty for root commits).
    pub parents: Vec<ObjectId>,
    /// Author identity.
    pub author: PersonIdent,
    /// Committer identity; its timestamp drives revision-walk ordering.
    pub committer: PersonIdent,
    /// Optional `encoding` header value.
    pub encoding: Option<String>,
    /// Optional `gpgsig` header payload with embedded newlines.
    pub gpgsig: Option<Vec<u8>>,
    /// Headers this parser does not interpret, kept verbatim
    /// (`(name, value-with-continuations)`).
    pub extra_headers: Vec<(Vec<u8>, Vec<u8>)>,
    /// Message bytes after the blank separator line.
    pub message: Vec<u8>,
}

impl Commit {
    /// Parses a commit payload (no `"commit <len>\0"` prefix).
    pub fn parse(payload: &[u8], format: ObjectFormat) -> Result<Self, CommitParseError> {
        let hex_len = format.hex_len() as usize;
        let mut lines = HeaderLines { rest: payload };

        let tree_line = lines
            .next_header()
            .ok_or_else(|| CommitParseError::corrupt("missing tree header"))?;
        let tree = match tree_line {
            (b"tree", value) => parse_id(value, hex_len, "tree")?,
            _ => return Err(CommitParseError::corrupt("first header is not tree")),
        };

        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut encoding = None;
        let mut gpgsig = None;
        let mut extra_headers = Vec::new();

        while let Some((name, value)) = lines.next_header() {
            match name {
                b"parent" => {
                    if parents.len() >= MAX_PARENTS {
                        return Err(CommitParseError::TooManyParents {
                            count: parents.len() + 1,
                            max: MAX_PARENTS,
                        });
                    }
                    parents.push(parse_id(value, hex_len, "parent")?);
                }
                b"author" => author = Some(PersonIdent::parse(value)?),
                b"committer" => committer = Some(PersonIdent::parse(value)?),
                b"encoding" => {
                    encoding = Some(String::from_utf8_lossy(value).into_owned());
                }
                b"gpgsig" => gpgsig = Some(unfold(value)),
                _ => extra_headers.push((name.to_vec(), unfold(value))),
            }
        }

        Ok(Self {
            tree,
            parents,
            author: author.ok_or_else(|| CommitParseError::corrupt("missing author"))?,
            committer: committer.ok_or_else(|| CommitParseError::corrupt("missing committer"))?,
            encoding,
            gpgsig,
            extra_headers,
            message: lines.rest.to_vec(),
        })
    }

    /// Serializes the canonical payload this commit hashes over.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.message.len());
        out.extend_from_slice(b"tree ");
        self.tree.write_hex(&mut out);
        out.push(b'\n');
        for parent in &self.parents {
            out.extend_from_slice(b"parent ");
            parent.write_hex(&mut out);
            out.push(b'\n');
        }
        out.extend_from_slice(b"author ");
        self.author.write_to(&mut out);
        out.push(b'\n');
        out.extend_from_slice(b"committer ");
        self.committer.write_to(&mut out);
        out.push(b'\n');
        if let Some(encoding) = &self.encoding {
            out.extend_from_slice(b"encoding ");
            out.extend_from_slice(encoding.as_bytes());
            out.push(b'\n');
        }
        if let Some(sig) = &self.gpgsig {
            write_folded(b"gpgsig", sig, &mut out);
        }
        for (name, value) in &self.extra_headers {
            write_folded(name, value, &mut out);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }
}

/// Extracts only the committer timestamp and parent ids, for the revision
/// walker's hot path. Stops scanning at the committer line.
pub fn parse_for_walk(
    payload: &[u8],
    format: ObjectFormat,
) -> Result<(ObjectId, Vec<ObjectId>, i64), CommitParseError> {
    let hex_len = format.hex_len() as usize;
    let mut lines = HeaderLines { rest: payload };

    let tree = match lines.next_header() {
        Some((b"tree", value)) => parse_id(value, hex_len, "tree")?,
        _ => return Err(CommitParseError::corrupt("first header is not tree")),
    };

    let mut parents = Vec::new();
    while let Some((name, value)) = lines.next_header() {
        match name {
            b"parent" => {
                if parents.len() >= MAX_PARENTS {
                    return Err(CommitParseError::TooManyParents {
                        count: parents.len() + 1,
                        max: MAX_PARENTS,
                    });
                }
                parents.push(parse_id(value, hex_len, "parent")?);
            }
            b"committer" => {
                let ident = PersonIdent::parse(value)?;
                return Ok((tree, parents, ident.when));
            }
            _ => {}
        }
    }
    Err(CommitParseError::corrupt("missing committer"))
}

fn parse_id(value: &[u8], hex_len: usize, field: &'static str) -> Result<ObjectId, CommitParseError> {
    if value.len() != hex_len {
        return Err(CommitParseError::BadId { detail: field });
    }
    ObjectId::from_hex(value).map_err(|_| CommitParseError::BadId { detail: field })
}

/// Splits the header section into `(name, value)` pairs, folding
/// space-indented continuation lines into the preceding value.
struct HeaderLines<'a> {
    rest: &'a [u8],
}

impl<'a> HeaderLines<'a> {
    fn next_header(&mut self) -> Option<(&'a [u8], &'a [u8])> {
        if self.rest.first() == Some(&b'\n') {
            // Blank separator: what follows is the message.
            self.rest = &self.rest[1..];
            return None;
        }
        if self.rest.is_empty() {
            return None;
        }

        let line_end = memchr(b'\n', self.rest).unwrap_or(self.rest.len());
        let line = &self.rest[..line_end];
        let mut consumed = (line_end + 1).min(self.rest.len());

        // Fold continuation lines (leading space) into this header's value.
        let mut value_end = line_end;
        while self.rest.get(consumed) == Some(&b' ') {
            let cont_end = memchr(b'\n', &self.rest[consumed..])
                .map(|n| consumed + n)
                .unwrap_or(self.rest.len());
            value_end = cont_end;
            consumed = (cont_end + 1).min(self.rest.len());
        }

        let space = memchr(b' ', line)?;
        let name = &line[..space];
        let value = &self.rest[space + 1..value_end];
        self.rest = &self.rest[consumed..];
        Some((name, value))
    }
}

/// Strips the leading space continuation markers from a folded header
/// value, inverse of [`write_folded`].
fn unfold(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' && raw.get(i + 1) == Some(&b' ') {
            out.push(b'\n');
            i += 2;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    out
}

fn write_folded(name: &[u8], value: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(name);
    out.push(b' ');
    // Continuation lines are re-folded with the leading-space convention.
    let mut first = true;
    for line in value.split(|&b| b == b'\n') {
        if !first {
            out.push(b'\n');
            out.push(b' ');
        }
        out.extend_from_slice(line);
        first = false;
    }
    out.push(b'\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
          parent ce013625030ba8dba906f756967f9e9ca394464a\n\
          author A U Thor <a@example.com> 1700000000 +0200\n\
          committer C O Mitter <c@example.com> 1700000100 +0000\n\
          \n\
          subject line\n\nbody\n"
            .to_vec()
    }

    #[test]
    fn parse_extracts_fields() {
        let commit = Commit::parse(&sample(), ObjectFormat::Sha1).unwrap();
        assert_eq!(
            commit.tree.to_string(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
        assert_eq!(commit.parents.len(), 1);
        assert_eq!(commit.author.name, "A U Thor");
        assert_eq!(commit.committer.when, 1700000100);
        assert_eq!(commit.message, b"subject line\n\nbody\n");
    }

    #[test]
    fn payload_round_trip_is_byte_exact() {
        let payload = sample();
        let commit = Commit::parse(&payload, ObjectFormat::Sha1).unwrap();
        assert_eq!(commit.to_payload(), payload);
    }

    #[test]
    fn gpgsig_continuation_lines_survive() {
        let payload = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
              author A <a@e> 1 +0000\n\
              committer A <a@e> 1 +0000\n\
              gpgsig -----BEGIN PGP SIGNATURE-----\n \n line2\n -----END PGP SIGNATURE-----\n\
              \n\
              msg\n"
            .to_vec();
        let commit = Commit::parse(&payload, ObjectFormat::Sha1).unwrap();
        let sig = commit.gpgsig.as_ref().unwrap();
        assert!(sig.starts_with(b"-----BEGIN PGP SIGNATURE-----"));
        assert!(sig.ends_with(b"-----END PGP SIGNATURE-----"));
        assert_eq!(commit.to_payload(), payload);
    }

    #[test]
    fn unknown_headers_preserved() {
        let payload = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
              author A <a@e> 1 +0000\n\
              committer A <a@e> 1 +0000\n\
              mergetag something opaque\n\
              \n\
              m\n"
            .to_vec();
        let commit = Commit::parse(&payload, ObjectFormat::Sha1).unwrap();
        assert_eq!(commit.extra_headers.len(), 1);
        assert_eq!(commit.extra_headers[0].0, b"mergetag");
        assert_eq!(commit.to_payload(), payload);
    }

    #[test]
    fn root_commit_has_no_parents() {
        let payload = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
              author A <a@e> 1 +0000\n\
              committer A <a@e> 1 +0000\n\
              \n\
              root\n"
            .to_vec();
        let commit = Commit::parse(&payload, ObjectFormat::Sha1).unwrap();
        assert!(commit.parents.is_empty());
    }

    #[test]
    fn parse_for_walk_stops_at_committer() {
        let (tree, parents, when) = parse_for_walk(&sample(), ObjectFormat::Sha1).unwrap();
        assert_eq!(
            tree.to_string(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
        assert_eq!(parents.len(), 1);
        assert_eq!(when, 1700000100);
    }

    #[test]
    fn rejects_missing_tree() {
        let payload = b"author A <a@e> 1 +0000\ncommitter A <a@e> 1 +0000\n\nm\n";
        assert!(Commit::parse(payload, ObjectFormat::Sha1).is_err());
    }

    #[test]
    fn rejects_truncated_parent() {
        let payload = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\nparent ce01\n";
        assert!(Commit::parse(payload, ObjectFormat::Sha1).is_err());
    }
}
