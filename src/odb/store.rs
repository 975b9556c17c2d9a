//! The object database: loose store + pack list + alternates.
//!
//! Lookup order is loose first, then packs newest-first, then alternates
//! (recursively, with cycle detection on canonical paths). The pack list
//! is a copy-on-write snapshot behind a mutex: installers build a new
//! list and swap the `Arc`, so an in-flight reader keeps its consistent
//! view until it drops it.
//!
//! Pack installation is atomic from any reader's perspective: the index
//! file is renamed into `objects/pack/` before the pack file, and the
//! list is rescanned only after both exist.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::object::id::{AbbrevId, ObjectFormat, ObjectId};
use crate::object::kind::ObjectKind;
use crate::pack::cache::DeltaBaseCache;
use crate::pack::reader::{PackReadError, PackReadLimits, PackReader};

use super::loose::LooseStore;
use super::traits::{ObjectData, ObjectInserter, ObjectReader};
use super::OdbError;

/// Shared, immutable snapshot of the opened packs.
type PackList = Arc<Vec<Arc<PackReader>>>;

/// A content-addressed object database rooted at an `objects/` directory.
pub struct ObjectDatabase {
    objects_dir: PathBuf,
    format: ObjectFormat,
    loose: LooseStore,
    packs: Mutex<PackList>,
    alternates: Vec<Arc<ObjectDatabase>>,
    limits: PackReadLimits,
}

impl std::fmt::Debug for ObjectDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDatabase")
            .field("objects_dir", &self.objects_dir)
            .finish_non_exhaustive()
    }
}

impl ObjectDatabase {
    /// Opens the database at `objects_dir`, scanning packs and following
    /// `info/alternates` recursively (cycles are dropped silently, as a
    /// self-referential alternate adds nothing).
    pub fn open(objects_dir: &Path, format: ObjectFormat) -> Result<Self, OdbError> {
        let mut seen = Vec::new();
        Self::open_guarded(objects_dir, format, &mut seen)
    }

    fn open_guarded(
        objects_dir: &Path,
        format: ObjectFormat,
        seen: &mut Vec<PathBuf>,
    ) -> Result<Self, OdbError> {
        let canonical = objects_dir
            .canonicalize()
            .unwrap_or_else(|_| objects_dir.to_owned());
        seen.push(canonical.clone());

        let mut alternates = Vec::new();
        let alt_file = objects_dir.join("info").join("alternates");
        if let Ok(text) = fs::read_to_string(&alt_file) {
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let alt_path = if Path::new(line).is_absolute() {
                    PathBuf::from(line)
                } else {
                    objects_dir.join(line)
                };
                let alt_canonical = alt_path
                    .canonicalize()
                    .unwrap_or_else(|_| alt_path.clone());
                if seen.contains(&alt_canonical) {
                    continue;
                }
                alternates.push(Arc::new(Self::open_guarded(&alt_path, format, seen)?));
            }
        }

        let db = Self {
            objects_dir: objects_dir.to_owned(),
            format,
            loose: LooseStore::new(objects_dir),
            packs: Mutex::new(Arc::new(Vec::new())),
            alternates,
            limits: PackReadLimits::default(),
        };
        db.rescan_packs()?;
        Ok(db)
    }

    /// The `objects/` directory this database is rooted at.
    #[must_use]
    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// The `objects/pack/` directory.
    #[must_use]
    pub fn pack_dir(&self) -> PathBuf {
        self.objects_dir.join("pack")
    }

    /// Object id format.
    #[must_use]
    pub fn format(&self) -> ObjectFormat {
        self.format
    }

    /// The loose half of the store.
    #[must_use]
    pub fn loose(&self) -> &LooseStore {
        &self.loose
    }

    /// Rescans `objects/pack/` and publishes a fresh pack-list snapshot.
    ///
    /// Only `pack-*.idx` files with a sibling `.pack` are opened; a pack
    /// that fails to open is skipped (it may still be mid-install).
    pub fn rescan_packs(&self) -> Result<(), OdbError> {
        let mut list: Vec<Arc<PackReader>> = Vec::new();
        let pack_dir = self.pack_dir();
        let entries = match fs::read_dir(&pack_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                *self.packs.lock().expect("pack list lock") = Arc::new(list);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut token = 0u32;
        let mut names: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with("pack-") && name.ends_with(".idx") {
                names.push(path);
            }
        }
        // Newest packs first: recently fetched objects are the hot set.
        names.sort();
        names.reverse();

        for idx_path in names {
            let pack_path = idx_path.with_extension("pack");
            if !pack_path.is_file() {
                continue;
            }
            match PackReader::open_pair(&pack_path, &idx_path, self.format, self.limits, token) {
                Ok(reader) => {
                    list.push(Arc::new(reader));
                    token += 1;
                }
                Err(PackReadError::Pack(_) | PackReadError::Idx(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }

        *self.packs.lock().expect("pack list lock") = Arc::new(list);
        Ok(())
    }

    /// Current pack-list snapshot.
    #[must_use]
    pub fn pack_snapshot(&self) -> PackList {
        Arc::clone(&self.packs.lock().expect("pack list lock"))
    }

    /// Starts a read session.
    #[must_use]
    pub fn reader(&self) -> OdbReader<'_> {
        OdbReader {
            db: self,
            packs: self.pack_snapshot(),
            cache: DeltaBaseCache::default(),
        }
    }
}

/// A single-threaded read session holding a pack-list snapshot and a
/// delta-base cache. Dropping the session releases both.
pub struct OdbReader<'a> {
    db: &'a ObjectDatabase,
    packs: PackList,
    cache: DeltaBaseCache,
}

impl OdbReader<'_> {
    /// Refreshes this session's pack snapshot (after an install).
    pub fn refresh(&mut self) {
        self.packs = self.db.pack_snapshot();
    }

    fn read_local(&mut self, id: &ObjectId) -> Result<Option<ObjectData>, OdbError> {
        if self.db.loose.contains(id) {
            return Ok(Some(self.db.loose.read(id)?));
        }
        let packs = Arc::clone(&self.packs);
        for pack in packs.iter() {
            if pack.contains(id) {
                let (kind, bytes) = pack.read(id, &mut self.cache)?;
                return Ok(Some(ObjectData { kind, bytes }));
            }
        }
        Ok(None)
    }

    fn contains_local(&self, id: &ObjectId) -> bool {
        self.db.loose.contains(id) || self.packs.iter().any(|pack| pack.contains(id))
    }
}

impl ObjectReader for OdbReader<'_> {
    fn contains(&mut self, id: &ObjectId) -> Result<bool, OdbError> {
        if self.contains_local(id) {
            return Ok(true);
        }
        for alt in &self.db.alternates {
            if alt.reader().contains(id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn read(&mut self, id: &ObjectId) -> Result<ObjectData, OdbError> {
        if let Some(data) = self.read_local(id)? {
            return Ok(data);
        }
        for alt in &self.db.alternates {
            match alt.reader().read(id) {
                Ok(data) => return Ok(data),
                Err(OdbError::Missing { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(OdbError::Missing { id: *id })
    }

    fn resolve_prefix(
        &mut self,
        prefix: &AbbrevId,
        limit: usize,
    ) -> Result<Vec<ObjectId>, OdbError> {
        let mut out = Vec::new();
        self.db.loose.resolve_prefix(prefix, &mut out, limit)?;
        for pack in self.packs.iter() {
            if out.len() >= limit {
                break;
            }
            let mut found = Vec::new();
            pack.resolve_prefix(prefix, &mut found, limit - out.len());
            for id in found {
                if !out.contains(&id) && out.len() < limit {
                    out.push(id);
                }
            }
        }
        for alt in &self.db.alternates {
            if out.len() >= limit {
                break;
            }
            for id in alt.reader().resolve_prefix(prefix, limit - out.len())? {
                if !out.contains(&id) && out.len() < limit {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }
}

/// Write session inserting loose objects.
pub struct OdbInserter<'a> {
    db: &'a ObjectDatabase,
}

impl ObjectDatabase {
    /// Starts a write session.
    #[must_use]
    pub fn inserter(&self) -> OdbInserter<'_> {
        OdbInserter { db: self }
    }
}

impl ObjectInserter for OdbInserter<'_> {
    fn insert(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId, OdbError> {
        self.db.loose.insert(kind, payload)
    }

    fn flush(&mut self) -> Result<(), OdbError> {
        // Loose inserts sync before rename; nothing further is pending.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_db() -> (TempDir, ObjectDatabase) {
        let dir = TempDir::new().unwrap();
        let objects = dir.path().join("objects");
        fs::create_dir_all(&objects).unwrap();
        let db = ObjectDatabase::open(&objects, ObjectFormat::Sha1).unwrap();
        (dir, db)
    }

    #[test]
    fn loose_insert_then_read() {
        let (_dir, db) = fresh_db();
        let id = db.inserter().insert(ObjectKind::Blob, b"hello\n").unwrap();
        let mut reader = db.reader();
        assert!(reader.contains(&id).unwrap());
        let data = reader.read(&id).unwrap();
        assert_eq!(data.kind, ObjectKind::Blob);
        assert_eq!(data.bytes, b"hello\n");
    }

    #[test]
    fn type_hint_validated() {
        let (_dir, db) = fresh_db();
        let id = db.inserter().insert(ObjectKind::Blob, b"x").unwrap();
        let mut reader = db.reader();
        assert!(matches!(
            reader.read_kind(&id, ObjectKind::Commit),
            Err(OdbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn alternates_are_consulted() {
        let alt_dir = TempDir::new().unwrap();
        let alt_objects = alt_dir.path().join("objects");
        fs::create_dir_all(&alt_objects).unwrap();
        let alt_db = ObjectDatabase::open(&alt_objects, ObjectFormat::Sha1).unwrap();
        let id = alt_db.inserter().insert(ObjectKind::Blob, b"shared").unwrap();

        let main_dir = TempDir::new().unwrap();
        let main_objects = main_dir.path().join("objects");
        fs::create_dir_all(main_objects.join("info")).unwrap();
        fs::write(
            main_objects.join("info").join("alternates"),
            format!("{}\n", alt_objects.display()),
        )
        .unwrap();

        let db = ObjectDatabase::open(&main_objects, ObjectFormat::Sha1).unwrap();
        let mut reader = db.reader();
        assert!(reader.contains(&id).unwrap());
        assert_eq!(reader.read(&id).unwrap().bytes, b"shared");
    }

    #[test]
    fn alternate_cycles_are_tolerated() {
        let dir = TempDir::new().unwrap();
        let objects = dir.path().join("objects");
        fs::create_dir_all(objects.join("info")).unwrap();
        // Self-referential alternate.
        fs::write(
            objects.join("info").join("alternates"),
            format!("{}\n", objects.display()),
        )
        .unwrap();
        let db = ObjectDatabase::open(&objects, ObjectFormat::Sha1).unwrap();
        let mut reader = db.reader();
        assert!(!reader.contains(&ObjectId::sha1([9; 20])).unwrap());
    }

    #[test]
    fn missing_object_propagates() {
        let (_dir, db) = fresh_db();
        let mut reader = db.reader();
        assert!(matches!(
            reader.read(&ObjectId::sha1([0x42; 20])),
            Err(OdbError::Missing { .. })
        ));
    }
}
