//! Tree object parsing, serialization, and the canonical entry order.
//!
//! # Tree Object Format
//!
//! A tree payload is a sequence of entries:
//! ```text
//! <mode> SP <name> NUL <raw-oid>
//! ```
//! - `<mode>`: ASCII octal, no leading zero for trees (`40000`)
//! - `<name>`: non-empty, no `/`, no NUL
//! - `<raw-oid>`: 20 or 32 raw bytes
//!
//! Entries are strictly sorted as if names of subtrees carried an implicit
//! trailing `/`; `a.txt` sorts before `a/` sorts before `a0`. Serialization
//! enforces the order; parsing can optionally verify it.
//!
//! The iterator is fused: after an error, subsequent `next()` calls return
//! `None`, so partially parsed state cannot leak garbage entries.

use std::cmp::Ordering;
use std::fmt;

use memchr::memchr;

use super::id::{ObjectFormat, ObjectId};

/// Errors from tree parsing and building.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TreeParseError {
    /// Entry is malformed.
    Corrupt { detail: &'static str },
    /// Payload ended inside an entry.
    Truncated,
    /// Entries are not in canonical order.
    OutOfOrder,
}

impl fmt::Display for TreeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt tree: {detail}"),
            Self::Truncated => write!(f, "truncated tree entry"),
            Self::OutOfOrder => write!(f, "tree entries out of order"),
        }
    }
}

impl std::error::Error for TreeParseError {}

/// File mode of a tree entry.
///
/// The high bits encode the object type; historical tools wrote
/// non-canonical blob modes (100664 and friends), which parse as
/// [`EntryMode::Regular`] but re-serialize canonically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryMode {
    /// Subtree (040000).
    Tree,
    /// Regular file (100644).
    Regular,
    /// Executable file (100755).
    Executable,
    /// Symbolic link (120000).
    Symlink,
    /// Gitlink / submodule commit (160000).
    Gitlink,
}

impl EntryMode {
    /// Canonical octal rendering (no leading zero, matching Git).
    #[must_use]
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Tree => b"40000",
            Self::Regular => b"100644",
            Self::Executable => b"100755",
            Self::Symlink => b"120000",
            Self::Gitlink => b"160000",
        }
    }

    /// Classifies a raw octal mode value.
    #[must_use]
    pub const fn from_octal(mode: u32) -> Option<Self> {
        match mode & 0o170000 {
            0o040000 => Some(Self::Tree),
            0o100000 => {
                if mode & 0o111 != 0 {
                    Some(Self::Executable)
                } else {
                    Some(Self::Regular)
                }
            }
            0o120000 => Some(Self::Symlink),
            0o160000 => Some(Self::Gitlink),
            _ => None,
        }
    }

    /// True for subtree entries.
    #[inline]
    #[must_use]
    pub const fn is_tree(self) -> bool {
        matches!(self, Self::Tree)
    }

    /// True for entries whose target is a blob.
    #[inline]
    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(self, Self::Regular | Self::Executable | Self::Symlink)
    }
}

/// A parsed tree entry (zero-copy reference into the tree payload).
#[derive(Clone, Copy, Debug)]
pub struct TreeEntry<'a> {
    /// Entry mode.
    pub mode: EntryMode,
    /// Entry name without any path prefix.
    pub name: &'a [u8],
    /// Target object id.
    pub id: ObjectId,
}

impl TreeEntry<'_> {
    /// Compares two names under the directory-suffix rule.
    ///
    /// A subtree name is compared as if it ended with `/`.
    #[must_use]
    pub fn compare_names(a: &[u8], a_is_tree: bool, b: &[u8], b_is_tree: bool) -> Ordering {
        let common = a.len().min(b.len());
        match a[..common].cmp(&b[..common]) {
            Ordering::Equal => {}
            other => return other,
        }
        let a_next = a.get(common).copied().or(if a_is_tree { Some(b'/') } else { None });
        let b_next = b.get(common).copied().or(if b_is_tree { Some(b'/') } else { None });
        match (a_next, b_next) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        }
    }

    fn order_after(&self, prev: &TreeEntry<'_>) -> bool {
        Self::compare_names(
            prev.name,
            prev.mode.is_tree(),
            self.name,
            self.mode.is_tree(),
        ) == Ordering::Less
    }
}

/// Iterator over entries of a complete tree payload.
pub struct TreeIter<'a> {
    rest: &'a [u8],
    oid_len: usize,
    check_order: bool,
    prev: Option<(Vec<u8>, bool)>,
    failed: bool,
}

impl<'a> TreeIter<'a> {
    /// Iterates entries without order verification.
    #[must_use]
    pub fn new(payload: &'a [u8], format: ObjectFormat) -> Self {
        Self {
            rest: payload,
            oid_len: format.oid_len() as usize,
            check_order: false,
            prev: None,
            failed: false,
        }
    }

    /// Iterates entries, verifying canonical order as it goes.
    #[must_use]
    pub fn new_checked(payload: &'a [u8], format: ObjectFormat) -> Self {
        let mut iter = Self::new(payload, format);
        iter.check_order = true;
        iter
    }

    fn parse_one(&mut self) -> Result<TreeEntry<'a>, TreeParseError> {
        let space = memchr(b' ', self.rest).ok_or(TreeParseError::Truncated)?;
        let mode_raw = &self.rest[..space];
        if mode_raw.is_empty() || mode_raw.len() > 7 {
            return Err(TreeParseError::Corrupt {
                detail: "bad mode length",
            });
        }
        let mut mode: u32 = 0;
        for &digit in mode_raw {
            if !(b'0'..=b'7').contains(&digit) {
                return Err(TreeParseError::Corrupt {
                    detail: "non-octal mode digit",
                });
            }
            mode = (mode << 3) | (digit - b'0') as u32;
        }
        let mode = EntryMode::from_octal(mode).ok_or(TreeParseError::Corrupt {
            detail: "unknown mode type bits",
        })?;

        let after_mode = &self.rest[space + 1..];
        let nul = memchr(b'\0', after_mode).ok_or(TreeParseError::Truncated)?;
        let name = &after_mode[..nul];
        if name.is_empty() {
            return Err(TreeParseError::Corrupt {
                detail: "empty entry name",
            });
        }
        if memchr(b'/', name).is_some() {
            return Err(TreeParseError::Corrupt {
                detail: "slash in entry name",
            });
        }

        let oid_start = nul + 1;
        let oid_end = oid_start + self.oid_len;
        if after_mode.len() < oid_end {
            return Err(TreeParseError::Truncated);
        }
        let id = ObjectId::try_from_raw(&after_mode[oid_start..oid_end])
            .ok_or(TreeParseError::Truncated)?;

        self.rest = &after_mode[oid_end..];
        Ok(TreeEntry { mode, name, id })
    }
}

impl<'a> Iterator for TreeIter<'a> {
    type Item = Result<TreeEntry<'a>, TreeParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        match self.parse_one() {
            Ok(entry) => {
                if self.check_order {
                    if let Some((prev_name, prev_is_tree)) = &self.prev {
                        let prev = TreeEntry {
                            mode: if *prev_is_tree {
                                EntryMode::Tree
                            } else {
                                EntryMode::Regular
                            },
                            name: prev_name,
                            id: ObjectId::ZERO,
                        };
                        if !entry.order_after(&prev) {
                            self.failed = true;
                            return Some(Err(TreeParseError::OutOfOrder));
                        }
                    }
                    self.prev = Some((entry.name.to_vec(), entry.mode.is_tree()));
                }
                Some(Ok(entry))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Builds tree payloads, enforcing canonical entry order.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    entries: Vec<(EntryMode, Vec<u8>, ObjectId)>,
}

impl TreeBuilder {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry; order of calls is irrelevant.
    pub fn insert(&mut self, mode: EntryMode, name: &[u8], id: ObjectId) {
        self.entries.push((mode, name.to_vec(), id));
    }

    /// Serializes the canonical payload.
    ///
    /// # Errors
    /// `Corrupt` for empty names or names containing `/` or NUL.
    pub fn build(mut self) -> Result<Vec<u8>, TreeParseError> {
        for (_, name, _) in &self.entries {
            if name.is_empty() {
                return Err(TreeParseError::Corrupt {
                    detail: "empty entry name",
                });
            }
            if name.iter().any(|&b| b == b'/' || b == b'\0') {
                return Err(TreeParseError::Corrupt {
                    detail: "illegal byte in entry name",
                });
            }
        }
        self.entries.sort_by(|(am, an, _), (bm, bn, _)| {
            TreeEntry::compare_names(an, am.is_tree(), bn, bm.is_tree())
        });

        let mut out = Vec::new();
        for (mode, name, id) in &self.entries {
            out.extend_from_slice(mode.as_bytes());
            out.push(b' ');
            out.extend_from_slice(name);
            out.push(b'\0');
            out.extend_from_slice(id.as_slice());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_id(fill: u8) -> ObjectId {
        ObjectId::sha1([fill; 20])
    }

    #[test]
    fn build_then_parse_round_trips() {
        let mut builder = TreeBuilder::new();
        builder.insert(EntryMode::Regular, b"README", blob_id(1));
        builder.insert(EntryMode::Tree, b"src", blob_id(2));
        builder.insert(EntryMode::Executable, b"run.sh", blob_id(3));
        let payload = builder.build().unwrap();

        let entries: Vec<_> = TreeIter::new_checked(&payload, ObjectFormat::Sha1)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, b"README");
        assert_eq!(entries[1].name, b"run.sh");
        assert_eq!(entries[2].name, b"src");
    }

    #[test]
    fn directory_suffix_order() {
        // "a.txt" < "a/" (tree named "a") < "a0": '.' (0x2e) < '/' (0x2f) < '0' (0x30).
        let mut builder = TreeBuilder::new();
        builder.insert(EntryMode::Regular, b"a0", blob_id(1));
        builder.insert(EntryMode::Tree, b"a", blob_id(2));
        builder.insert(EntryMode::Regular, b"a.txt", blob_id(3));
        let payload = builder.build().unwrap();

        let names: Vec<_> = TreeIter::new(&payload, ObjectFormat::Sha1)
            .map(|e| e.unwrap().name.to_vec())
            .collect();
        assert_eq!(names, vec![b"a.txt".to_vec(), b"a".to_vec(), b"a0".to_vec()]);
    }

    #[test]
    fn checked_iter_rejects_unordered_payload() {
        let mut payload = Vec::new();
        for name in [b"zz", b"aa"] {
            payload.extend_from_slice(b"100644 ");
            payload.extend_from_slice(name);
            payload.push(0);
            payload.extend_from_slice(&[7u8; 20]);
        }
        let result: Result<Vec<_>, _> =
            TreeIter::new_checked(&payload, ObjectFormat::Sha1).collect();
        assert_eq!(result.unwrap_err(), TreeParseError::OutOfOrder);
    }

    #[test]
    fn non_canonical_blob_mode_parses() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"100664 old\0");
        payload.extend_from_slice(&[9u8; 20]);
        let entries: Vec<_> = TreeIter::new(&payload, ObjectFormat::Sha1)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries[0].mode, EntryMode::Regular);
    }

    #[test]
    fn iterator_is_fused_after_error() {
        let mut iter = TreeIter::new(b"100644 x", ObjectFormat::Sha1);
        assert!(matches!(iter.next(), Some(Err(TreeParseError::Truncated))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn truncated_oid_detected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"100644 f\0");
        payload.extend_from_slice(&[1u8; 10]);
        let result: Result<Vec<_>, _> = TreeIter::new(&payload, ObjectFormat::Sha1).collect();
        assert_eq!(result.unwrap_err(), TreeParseError::Truncated);
    }

    #[test]
    fn builder_rejects_slash() {
        let mut builder = TreeBuilder::new();
        builder.insert(EntryMode::Regular, b"a/b", blob_id(1));
        assert!(builder.build().is_err());
    }
}
