//! Bundle files: a serialized pack with a prelude of refs and
//! prerequisites.
//!
//! ```text
//! # v2 git bundle\n
//! -<hex-id> [comment]\n        zero or more prerequisites
//! <hex-id> <refname>\n         one or more refs
//! \n
//! <pack bytes>
//! ```
//!
//! v3 differs only by `# v3 git bundle` and `@key=value` capability
//! lines (`@object-format=sha1`) before the prerequisites. A bundle is a
//! fetchable remote in a file: prerequisites are the "haves" the bundle
//! assumes, refs are what it advertises, and the pack carries everything
//! in between.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};

use crate::monitor::ProgressMonitor;
use crate::object::id::{ObjectFormat, ObjectId};
use crate::odb::traits::ObjectReader;
use crate::pack::parser::{NoExternalBases, PackParser, ParsedPack, ParserConfig};
use crate::pack::writer::{PackWriter, WriteError, WriterConfig};

/// Errors from bundle reading and writing.
#[derive(Debug)]
#[non_exhaustive]
pub enum BundleError {
    /// Prelude violates the format.
    Corrupt { detail: String },
    /// The same ref name appears twice.
    DuplicateRef { name: String },
    /// A bundle must carry at least one ref.
    NoRefs,
    /// Pack payload failed to parse.
    Pack(crate::pack::parser::ParseError),
    /// Pack payload failed to build.
    PackWrite(WriteError),
    /// Stream failure.
    Io(io::Error),
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt bundle: {detail}"),
            Self::DuplicateRef { name } => write!(f, "duplicate bundle ref {name}"),
            Self::NoRefs => write!(f, "bundle carries no refs"),
            Self::Pack(err) => write!(f, "{err}"),
            Self::PackWrite(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "bundle I/O error: {err}"),
        }
    }
}

impl std::error::Error for BundleError {}

impl From<io::Error> for BundleError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<crate::pack::parser::ParseError> for BundleError {
    fn from(err: crate::pack::parser::ParseError) -> Self {
        Self::Pack(err)
    }
}

impl From<WriteError> for BundleError {
    fn from(err: WriteError) -> Self {
        Self::PackWrite(err)
    }
}

/// A bundle's prelude.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleHeader {
    /// 2 or 3.
    pub version: u8,
    /// Objects the bundle assumes present, with optional comments.
    pub prerequisites: Vec<(ObjectId, Option<String>)>,
    /// Advertised refs.
    pub refs: Vec<(String, ObjectId)>,
}

/// Writes a bundle: prelude, then a pack of everything reachable from
/// `refs` minus `assume`.
pub fn write_bundle<S, W, M>(
    reader: &mut S,
    refs: &[(String, ObjectId)],
    assume: &[ObjectId],
    out: &mut W,
    monitor: &mut M,
) -> Result<(), BundleError>
where
    S: ObjectReader,
    W: Write,
    M: ProgressMonitor,
{
    if refs.is_empty() {
        return Err(BundleError::NoRefs);
    }
    for (index, (name, _)) in refs.iter().enumerate() {
        if refs[..index].iter().any(|(other, _)| other == name) {
            return Err(BundleError::DuplicateRef { name: name.clone() });
        }
    }

    out.write_all(b"# v2 git bundle\n")?;
    for id in assume {
        out.write_all(format!("-{id}\n").as_bytes())?;
    }
    for (name, id) in refs {
        out.write_all(format!("{id} {name}\n").as_bytes())?;
    }
    out.write_all(b"\n")?;

    let wants: Vec<ObjectId> = refs.iter().map(|(_, id)| *id).collect();
    let writer = PackWriter::new(WriterConfig::default());
    writer.write(reader, &wants, assume, &[], out, monitor)?;
    Ok(())
}

/// Reads a bundle prelude, leaving the stream at the pack bytes.
pub fn read_header<R: BufRead>(input: &mut R) -> Result<BundleHeader, BundleError> {
    let corrupt = |detail: &str| BundleError::Corrupt {
        detail: detail.to_owned(),
    };

    let mut line = String::new();
    input.read_line(&mut line)?;
    let version = match line.trim_end() {
        "# v2 git bundle" => 2,
        "# v3 git bundle" => 3,
        _ => return Err(corrupt("bad signature line")),
    };

    let mut header = BundleHeader {
        version,
        ..BundleHeader::default()
    };
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Err(corrupt("prelude ends without blank line"));
        }
        let text = line.trim_end_matches('\n');
        if text.is_empty() {
            break;
        }
        if let Some(rest) = text.strip_prefix('@') {
            // v3 capability line; only sha1 is supported here.
            if version != 3 {
                return Err(corrupt("capability line in v2 bundle"));
            }
            if rest != "object-format=sha1" {
                return Err(BundleError::Corrupt {
                    detail: format!("unsupported bundle capability {rest}"),
                });
            }
            continue;
        }
        if let Some(rest) = text.strip_prefix('-') {
            let (hex, comment) = match rest.split_once(' ') {
                Some((hex, comment)) => (hex, Some(comment.to_owned())),
                None => (rest, None),
            };
            let id = ObjectId::from_hex(hex.as_bytes())
                .map_err(|_| corrupt("bad prerequisite id"))?;
            header.prerequisites.push((id, comment));
            continue;
        }
        let (hex, name) = text
            .split_once(' ')
            .ok_or_else(|| corrupt("ref line missing name"))?;
        let id = ObjectId::from_hex(hex.as_bytes()).map_err(|_| corrupt("bad ref id"))?;
        if header.refs.iter().any(|(other, _)| other == name) {
            return Err(BundleError::DuplicateRef {
                name: name.to_owned(),
            });
        }
        header.refs.push((name.to_owned(), id));
    }

    if header.refs.is_empty() {
        return Err(BundleError::NoRefs);
    }
    Ok(header)
}

/// Reads a whole bundle: prelude plus parsed pack.
///
/// The caller checks `header.prerequisites` against its database before
/// installing the pack, and points its refs at `header.refs` after.
pub fn read_bundle<R: Read, M: ProgressMonitor>(
    input: R,
    monitor: &mut M,
) -> Result<(BundleHeader, ParsedPack), BundleError> {
    let mut buffered = BufReader::new(input);
    let header = read_header(&mut buffered)?;

    let parser = PackParser::new(ParserConfig::default());
    let parsed = parser.parse(
        &mut buffered,
        ObjectFormat::Sha1,
        &mut NoExternalBases,
        monitor,
    )?;
    Ok((header, parsed))
}
