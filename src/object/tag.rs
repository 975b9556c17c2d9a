//! Annotated tag objects.
//!
//! ```text
//! object <hex-oid>\n
//! type <kind>\n
//! tag <name>\n
//! [tagger <ident>\n]
//! \n
//! <message>
//! ```
//!
//! `tagger` is optional: tags created by ancient Git lack it. The referenced
//! object's actual type must match the `type` header; that cross-check lives
//! with the caller, which has database access.

use std::fmt;

use memchr::memchr;

use super::id::{ObjectFormat, ObjectId};
use super::ident::PersonIdent;
use super::kind::ObjectKind;

/// Errors from tag parsing.
#[derive(Debug)]
#[non_exhaustive]
pub enum TagParseError {
    /// Tag data is corrupt or malformed.
    Corrupt { detail: &'static str },
}

impl fmt::Display for TagParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt tag: {detail}"),
        }
    }
}

impl std::error::Error for TagParseError {}

/// A parsed annotated tag.
#[derive(Clone, Debug)]
pub struct Tag {
    /// Tagged object id.
    pub object: ObjectId,
    /// Declared kind of the tagged object.
    pub target_kind: ObjectKind,
    /// Tag name (the short name, not the ref).
    pub name: String,
    /// Optional tagger identity.
    pub tagger: Option<PersonIdent>,
    /// Message bytes after the blank separator.
    pub message: Vec<u8>,
}

impl Tag {
    /// Parses a tag payload (no `"tag <len>\0"` prefix).
    pub fn parse(payload: &[u8], format: ObjectFormat) -> Result<Self, TagParseError> {
        let corrupt = |detail| TagParseError::Corrupt { detail };
        let mut rest = payload;

        let object_line = take_header(&mut rest, b"object").ok_or(corrupt("missing object"))?;
        if object_line.len() != format.hex_len() as usize {
            return Err(corrupt("bad object id length"));
        }
        let object = ObjectId::from_hex(object_line).map_err(|_| corrupt("bad object id"))?;

        let type_line = take_header(&mut rest, b"type").ok_or(corrupt("missing type"))?;
        let target_kind = ObjectKind::from_name(type_line).ok_or(corrupt("unknown type"))?;

        let tag_line = take_header(&mut rest, b"tag").ok_or(corrupt("missing tag name"))?;
        let name = String::from_utf8_lossy(tag_line).into_owned();

        let tagger = match take_header(&mut rest, b"tagger") {
            Some(line) => Some(PersonIdent::parse(line).map_err(|_| corrupt("bad tagger"))?),
            None => None,
        };

        let message = match rest.first() {
            Some(b'\n') => rest[1..].to_vec(),
            None => Vec::new(),
            Some(_) => return Err(corrupt("missing blank separator")),
        };

        Ok(Self {
            object,
            target_kind,
            name,
            tagger,
            message,
        })
    }

    /// Serializes the canonical payload this tag hashes over.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.message.len());
        out.extend_from_slice(b"object ");
        self.object.write_hex(&mut out);
        out.extend_from_slice(b"\ntype ");
        out.extend_from_slice(self.target_kind.name_bytes());
        out.extend_from_slice(b"\ntag ");
        out.extend_from_slice(self.name.as_bytes());
        out.push(b'\n');
        if let Some(tagger) = &self.tagger {
            out.extend_from_slice(b"tagger ");
            tagger.write_to(&mut out);
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }
}

/// Consumes `name SP value \n` from the front of `rest` if the header name
/// matches, returning the value.
fn take_header<'a>(rest: &mut &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let line_end = memchr(b'\n', rest)?;
    let line = &rest[..line_end];
    let value = line.strip_prefix(name)?.strip_prefix(b" ")?;
    *rest = &rest[line_end + 1..];
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"object ce013625030ba8dba906f756967f9e9ca394464a\n\
          type commit\n\
          tag v1.0\n\
          tagger T Agger <t@example.com> 1600000000 +0100\n\
          \n\
          release one\n"
            .to_vec()
    }

    #[test]
    fn parse_extracts_fields() {
        let tag = Tag::parse(&sample(), ObjectFormat::Sha1).unwrap();
        assert_eq!(tag.name, "v1.0");
        assert_eq!(tag.target_kind, ObjectKind::Commit);
        assert_eq!(tag.tagger.as_ref().unwrap().tz_minutes, 60);
        assert_eq!(tag.message, b"release one\n");
    }

    #[test]
    fn payload_round_trip_is_byte_exact() {
        let payload = sample();
        let tag = Tag::parse(&payload, ObjectFormat::Sha1).unwrap();
        assert_eq!(tag.to_payload(), payload);
    }

    #[test]
    fn tagger_is_optional() {
        let payload = b"object ce013625030ba8dba906f756967f9e9ca394464a\n\
              type blob\n\
              tag old-style\n\
              \n\
              m\n"
            .to_vec();
        let tag = Tag::parse(&payload, ObjectFormat::Sha1).unwrap();
        assert!(tag.tagger.is_none());
        assert_eq!(tag.to_payload(), payload);
    }

    #[test]
    fn rejects_header_order_violation() {
        let payload = b"type commit\nobject ce013625030ba8dba906f756967f9e9ca394464a\n\n";
        assert!(Tag::parse(payload, ObjectFormat::Sha1).is_err());
    }

    #[test]
    fn rejects_unknown_target_type() {
        let payload =
            b"object ce013625030ba8dba906f756967f9e9ca394464a\ntype blobby\ntag x\n\n";
        assert!(Tag::parse(&payload[..], ObjectFormat::Sha1).is_err());
    }
}
