//! Loose object storage: `objects/<xx>/<38 hex>` files holding one
//! zlib-deflated `"<type> <len>\0<payload>"` each.
//!
//! Writes deflate and hash in one pass into a temp file inside the target
//! fan-out directory, then finalize with `rename`. Two concurrent writers
//! of the same id are safe: content addressing makes their bytes
//! identical, and the loser of the rename race just removes its temp file.
//! No failure path leaves a temp file behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::object::id::{AbbrevId, ObjectId};
use crate::object::kind::ObjectKind;
use crate::raw::hex;
use crate::raw::zlib::{inflate_limited, DeflateSink};

use super::traits::ObjectData;
use super::OdbError;

/// Safety allowance for a loose header (`"commit 18446744073709551615\0"`).
const HEADER_MAX_BYTES: usize = 32;

/// Default cap for a loose object payload.
const MAX_LOOSE_BYTES: usize = 512 * 1024 * 1024;

/// The loose half of an object store, rooted at an `objects/` directory.
#[derive(Clone, Debug)]
pub struct LooseStore {
    objects_dir: PathBuf,
}

impl LooseStore {
    /// Store over `objects_dir` (which may not exist yet for inserts).
    #[must_use]
    pub fn new(objects_dir: &Path) -> Self {
        Self {
            objects_dir: objects_dir.to_owned(),
        }
    }

    /// Path of the loose file for `id`.
    #[must_use]
    pub fn path_for(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_string();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    /// True when a loose file for `id` exists.
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.path_for(id).is_file()
    }

    /// Reads and validates a loose object.
    pub fn read(&self, id: &ObjectId) -> Result<ObjectData, OdbError> {
        let path = self.path_for(id);
        let mut raw = Vec::new();
        match File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut raw)?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(OdbError::Missing { id: *id });
            }
            Err(err) => return Err(err.into()),
        }

        let mut inflated = Vec::new();
        inflate_limited(&raw, &mut inflated, MAX_LOOSE_BYTES + HEADER_MAX_BYTES)?;

        let (kind, payload_start, declared) = parse_header(&inflated)
            .ok_or_else(|| OdbError::corrupt(format!("bad loose header in {}", path.display())))?;
        let payload = &inflated[payload_start..];
        if payload.len() as u64 != declared {
            return Err(OdbError::corrupt(format!(
                "loose {id} declares {declared} bytes, holds {}",
                payload.len()
            )));
        }

        Ok(ObjectData {
            kind,
            bytes: payload.to_vec(),
        })
    }

    /// Reads only the header of a loose object.
    pub fn stat(&self, id: &ObjectId) -> Result<(ObjectKind, u64), OdbError> {
        // Loose objects are small; reading whole is simpler than a
        // bounded partial inflate and the result is discarded anyway.
        let data = self.read(id)?;
        Ok((data.kind, data.bytes.len() as u64))
    }

    /// Writes a payload, returning its id.
    ///
    /// The digest is computed while deflating; the temp file is renamed to
    /// its content address on success and removed on any failure.
    pub fn insert(&self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId, OdbError> {
        let mut hasher = Sha1::new();
        hasher.update(kind.name_bytes());
        hasher.update(b" ");
        hasher.update(payload.len().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(payload);
        let id = ObjectId::sha1(hasher.finalize().into());

        let final_path = self.path_for(&id);
        if final_path.is_file() {
            // Content addressing: overwrite is indistinguishable from no-op.
            return Ok(id);
        }
        let fan_dir = final_path.parent().expect("loose path has fan-out parent");
        fs::create_dir_all(fan_dir)?;

        // Unique per process and per call, so same-id writers in one
        // process cannot collide on the temp name either.
        static TMP_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = TMP_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let tmp_path = fan_dir.join(format!("tmp_obj_{}_{seq}", std::process::id()));
        let result = self.write_temp(&tmp_path, kind, payload, &id);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result?;

        match fs::rename(&tmp_path, &final_path) {
            Ok(()) => Ok(id),
            Err(_) if final_path.is_file() => {
                // Lost the race to an identical writer.
                let _ = fs::remove_file(&tmp_path);
                Ok(id)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path);
                Err(err.into())
            }
        }
    }

    fn write_temp(
        &self,
        tmp_path: &Path,
        kind: ObjectKind,
        payload: &[u8],
        id: &ObjectId,
    ) -> Result<(), OdbError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut sink = DeflateSink::new(file);
        sink.write_all(kind.name_bytes())?;
        sink.write_all(b" ")?;
        sink.write_all(payload.len().to_string().as_bytes())?;
        sink.write_all(b"\0")?;
        sink.write_all(payload)?;
        let file = sink.finish()?;
        file.sync_all()?;
        debug_assert_eq!(
            *id,
            crate::raw::hashing::hash_object(kind, payload),
            "streamed digest must match"
        );
        Ok(())
    }

    /// Appends loose ids matching the prefix, scanning one fan-out dir.
    pub fn resolve_prefix(
        &self,
        prefix: &AbbrevId,
        out: &mut Vec<ObjectId>,
        limit: usize,
    ) -> Result<usize, OdbError> {
        if limit == 0 {
            return Ok(0);
        }
        let fan = format!("{:02x}", prefix.first_byte());
        let dir = self.objects_dir.join(fan);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut added = 0usize;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(tail) = name.to_str() else { continue };
            if tail.len() != 38 && tail.len() != 62 {
                continue;
            }
            let mut hex_id = format!("{:02x}", prefix.first_byte());
            hex_id.push_str(tail);
            let mut raw = vec![0u8; hex_id.len() / 2];
            if hex::decode(hex_id.as_bytes(), &mut raw).is_err() {
                continue;
            }
            if let Some(id) = ObjectId::try_from_raw(&raw) {
                if prefix.matches(&id) && !out.contains(&id) {
                    out.push(id);
                    added += 1;
                    if added >= limit {
                        break;
                    }
                }
            }
        }
        Ok(added)
    }
}

/// Parses `"<type> <len>\0"`, returning kind, payload start, declared size.
fn parse_header(inflated: &[u8]) -> Option<(ObjectKind, usize, u64)> {
    let head = &inflated[..inflated.len().min(HEADER_MAX_BYTES)];
    let space = memchr::memchr(b' ', head)?;
    let nul = memchr::memchr(b'\0', head)?;
    if nul <= space {
        return None;
    }
    let kind = ObjectKind::from_name(&head[..space])?;
    let size_text = std::str::from_utf8(&head[space + 1..nul]).ok()?;
    if size_text.is_empty() || !size_text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let declared: u64 = size_text.parse().ok()?;
    Some((kind, nul + 1, declared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LooseStore) {
        let dir = TempDir::new().unwrap();
        let store = LooseStore::new(&dir.path().join("objects"));
        (dir, store)
    }

    #[test]
    fn blob_round_trip_with_known_id() {
        let (_dir, store) = store();
        let id = store.insert(ObjectKind::Blob, b"hello\n").unwrap();
        assert_eq!(id.to_string(), "ce013625030ba8dba906f756967f9e9ca394464a");

        assert!(store.contains(&id));
        let data = store.read(&id).unwrap();
        assert_eq!(data.kind, ObjectKind::Blob);
        assert_eq!(data.bytes, b"hello\n");
    }

    #[test]
    fn missing_object_reported() {
        let (_dir, store) = store();
        let id = ObjectId::sha1([0xaa; 20]);
        assert!(!store.contains(&id));
        assert!(matches!(
            store.read(&id),
            Err(OdbError::Missing { .. })
        ));
    }

    #[test]
    fn double_insert_is_noop() {
        let (_dir, store) = store();
        let first = store.insert(ObjectKind::Blob, b"same").unwrap();
        let second = store.insert(ObjectKind::Blob, b"same").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.read(&first).unwrap().bytes, b"same");
    }

    #[test]
    fn corrupt_loose_file_detected() {
        let (_dir, store) = store();
        let id = store.insert(ObjectKind::Blob, b"payload").unwrap();
        let path = store.path_for(&id);
        fs::write(&path, b"not zlib at all").unwrap();
        assert!(matches!(store.read(&id), Err(OdbError::Corrupt { .. })));
    }

    #[test]
    fn size_mismatch_detected() {
        let (_dir, store) = store();
        let id = ObjectId::sha1([0x11; 20]);
        let path = store.path_for(&id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        // Header claims 10 bytes, body holds 3.
        let bogus = crate::raw::zlib::deflate(b"blob 10\0abc").unwrap();
        fs::write(&path, bogus).unwrap();
        assert!(matches!(store.read(&id), Err(OdbError::Corrupt { .. })));
    }

    #[test]
    fn no_temp_files_after_inserts() {
        let (_dir, store) = store();
        store.insert(ObjectKind::Blob, b"a").unwrap();
        store.insert(ObjectKind::Tree, b"").unwrap();
        for fan in fs::read_dir(&store.objects_dir).unwrap() {
            for file in fs::read_dir(fan.unwrap().path()).unwrap() {
                let name = file.unwrap().file_name();
                assert!(
                    !name.to_string_lossy().starts_with("tmp_obj_"),
                    "temp file left behind: {name:?}"
                );
            }
        }
    }

    #[test]
    fn resolve_prefix_finds_loose_ids() {
        let (_dir, store) = store();
        let id = store.insert(ObjectKind::Blob, b"hello\n").unwrap();
        let prefix = AbbrevId::from_hex(b"ce0136").unwrap();
        let mut out = Vec::new();
        let n = store.resolve_prefix(&prefix, &mut out, 4).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out, vec![id]);
    }
}
