//! Reflog read and append.
//!
//! Each ref's log lives at `logs/<refname>`, append-only, one entry per
//! line:
//! ```text
//! <old-id> <new-id> <name> <<email>> <epoch> <tz>\t<message>\n
//! ```
//! The message has newlines flattened to spaces at append time, so one
//! line is always one entry.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memchr::memchr;

use crate::object::id::ObjectId;
use crate::object::ident::PersonIdent;

use super::RefError;

/// One reflog entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReflogEntry {
    /// Value before the update (zero id for creation).
    pub old_id: ObjectId,
    /// Value after the update (zero id for deletion).
    pub new_id: ObjectId,
    /// Who performed the update, with timestamp.
    pub who: PersonIdent,
    /// Free-form message (single line).
    pub message: String,
}

/// Reader and appender over `logs/` for one repository.
#[derive(Clone, Debug)]
pub struct Reflog {
    logs_dir: PathBuf,
}

impl Reflog {
    /// Reflog rooted at a repository's `logs/` directory.
    #[must_use]
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            logs_dir: logs_dir.to_owned(),
        }
    }

    fn path_for(&self, refname: &str) -> PathBuf {
        self.logs_dir.join(refname)
    }

    /// Appends an entry, creating the log file and parents on demand.
    pub fn append(&self, refname: &str, entry: &ReflogEntry) -> Result<(), RefError> {
        let path = self.path_for(refname);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut line = Vec::with_capacity(128);
        line.extend_from_slice(entry.old_id.to_string().as_bytes());
        line.push(b' ');
        line.extend_from_slice(entry.new_id.to_string().as_bytes());
        line.push(b' ');
        entry.who.write_to(&mut line);
        line.push(b'\t');
        for byte in entry.message.bytes() {
            line.push(if byte == b'\n' { b' ' } else { byte });
        }
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    /// Reads every entry, oldest first. A missing log is an empty log.
    pub fn read(&self, refname: &str) -> Result<Vec<ReflogEntry>, RefError> {
        let path = self.path_for(refname);
        let text = match fs::read(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        let mut rest = text.as_slice();
        while !rest.is_empty() {
            let line_end = memchr(b'\n', rest).unwrap_or(rest.len());
            let line = &rest[..line_end];
            rest = &rest[(line_end + 1).min(rest.len())..];
            if line.is_empty() {
                continue;
            }
            entries.push(parse_line(line)?);
        }
        Ok(entries)
    }

    /// Up to `max` entries, most recent first.
    ///
    /// This is the shape log consumers want: "the last n updates of this
    /// ref". A missing log yields an empty list; `max` of zero too.
    pub fn reverse(&self, refname: &str, max: usize) -> Result<Vec<ReflogEntry>, RefError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut entries = self.read(refname)?;
        entries.reverse();
        entries.truncate(max);
        Ok(entries)
    }

    /// The most recent entry, if any.
    pub fn last(&self, refname: &str) -> Result<Option<ReflogEntry>, RefError> {
        Ok(self.reverse(refname, 1)?.pop())
    }

    /// Removes a ref's log (used when the ref itself is deleted).
    pub fn remove(&self, refname: &str) -> Result<(), RefError> {
        match fs::remove_file(self.path_for(refname)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn parse_line(line: &[u8]) -> Result<ReflogEntry, RefError> {
    let corrupt = |detail: &str| RefError::Corrupt {
        detail: detail.to_owned(),
    };

    let hex_len = 40;
    if line.len() < hex_len * 2 + 2 {
        return Err(corrupt("reflog line too short"));
    }
    let old_id = ObjectId::from_hex(&line[..hex_len])
        .map_err(|_| corrupt("bad old id in reflog"))?;
    if line[hex_len] != b' ' {
        return Err(corrupt("reflog missing separator"));
    }
    let new_id = ObjectId::from_hex(&line[hex_len + 1..hex_len * 2 + 1])
        .map_err(|_| corrupt("bad new id in reflog"))?;
    if line[hex_len * 2 + 1] != b' ' {
        return Err(corrupt("reflog missing separator"));
    }

    let rest = &line[hex_len * 2 + 2..];
    let (ident_bytes, message) = match memchr(b'\t', rest) {
        Some(tab) => (&rest[..tab], &rest[tab + 1..]),
        None => (rest, &[][..]),
    };
    let who = PersonIdent::parse(ident_bytes).map_err(|_| corrupt("bad identity in reflog"))?;

    Ok(ReflogEntry {
        old_id,
        new_id,
        who,
        message: String::from_utf8_lossy(message).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(old: u8, new: u8, message: &str) -> ReflogEntry {
        ReflogEntry {
            old_id: if old == 0 {
                ObjectId::ZERO
            } else {
                ObjectId::sha1([old; 20])
            },
            new_id: ObjectId::sha1([new; 20]),
            who: PersonIdent::new("Ref Writer", "w@example.com", 1_700_000_000, 120),
            message: message.to_owned(),
        }
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let reflog = Reflog::new(&dir.path().join("logs"));

        let first = entry(0, 0x11, "branch: Created from HEAD");
        let second = entry(0x11, 0x22, "commit: work");
        reflog.append("refs/heads/main", &first).unwrap();
        reflog.append("refs/heads/main", &second).unwrap();

        let entries = reflog.read("refs/heads/main").unwrap();
        assert_eq!(entries, vec![first, second.clone()]);
        assert_eq!(reflog.last("refs/heads/main").unwrap(), Some(second));
    }

    #[test]
    fn reverse_is_capped_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let reflog = Reflog::new(&dir.path().join("logs"));
        for i in 1..=5u8 {
            reflog
                .append("refs/heads/main", &entry(i - 1, i, &format!("step {i}")))
                .unwrap();
        }

        let recent = reflog.reverse("refs/heads/main", 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].new_id, ObjectId::sha1([5; 20]));
        assert_eq!(recent[1].new_id, ObjectId::sha1([4; 20]));
        assert_eq!(recent[2].new_id, ObjectId::sha1([3; 20]));

        // A cap beyond the log length returns everything.
        assert_eq!(
            reflog.reverse("refs/heads/main", 100).unwrap().len(),
            5
        );
        assert!(reflog.reverse("refs/heads/main", 0).unwrap().is_empty());
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let reflog = Reflog::new(&dir.path().join("logs"));
        assert!(reflog.read("refs/heads/none").unwrap().is_empty());
        assert!(reflog.reverse("refs/heads/none", 4).unwrap().is_empty());
        assert_eq!(reflog.last("refs/heads/none").unwrap(), None);
    }

    #[test]
    fn newlines_in_message_are_flattened() {
        let dir = TempDir::new().unwrap();
        let reflog = Reflog::new(&dir.path().join("logs"));
        reflog
            .append("HEAD", &entry(0, 1, "multi\nline\nmessage"))
            .unwrap();
        let entries = reflog.read("HEAD").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "multi line message");
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let reflog = Reflog::new(&dir.path().join("logs"));
        reflog.append("HEAD", &entry(0, 1, "x")).unwrap();
        reflog.remove("HEAD").unwrap();
        reflog.remove("HEAD").unwrap();
        assert!(reflog.read("HEAD").unwrap().is_empty());
    }
}
