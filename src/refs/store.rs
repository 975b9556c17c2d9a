//! The ref store: reads, symbolic resolution, the locked update protocol,
//! batch transactions, and packed-refs compaction.
//!
//! # Update protocol
//! 1. Acquire `<ref>.lock` (bounded retry/backoff).
//! 2. Re-read the current value; compare against the caller's expected
//!    old id. Mismatch is `RejectedStale`.
//! 3. Write the new value into the lock, fsync, rename over the target;
//!    append the reflog entry.
//! 4. Any other outcome unlinks the lock.
//!
//! Reads prefer loose over packed (storage `LoosePacked` when both
//! exist). Deleting a ref that also exists packed rewrites `packed-refs`
//! under its own lock, so readers always see a complete file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::object::id::ObjectId;
use crate::object::ident::PersonIdent;

use super::lock::{LockError, LockFile};
use super::name as refname;
use super::packed::{self, PackedRef};
use super::reflog::{Reflog, ReflogEntry};
use super::update::{RefCommand, UpdateStatus};
use super::{Ref, RefError, RefStorage, RefTarget};

/// Symbolic chains longer than this are cyclic or hostile.
const MAX_SYMREF_DEPTH: usize = 5;

/// Result of resolving a name through symbolic refs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    /// Terminal ref name after following symrefs.
    pub name: String,
    /// Terminal value; `None` for an unborn branch (dangling symref).
    pub id: Option<ObjectId>,
}

/// Ref storage for one repository, rooted at its `.git` directory.
#[derive(Clone, Debug)]
pub struct RefStore {
    git_dir: PathBuf,
    reflog: Reflog,
}

impl RefStore {
    /// Store over `git_dir`.
    #[must_use]
    pub fn new(git_dir: &Path) -> Self {
        Self {
            git_dir: git_dir.to_owned(),
            reflog: Reflog::new(&git_dir.join("logs")),
        }
    }

    /// The repository directory.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Reflog access for this repository.
    #[must_use]
    pub fn reflog(&self) -> &Reflog {
        &self.reflog
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.git_dir.join(name)
    }

    fn packed_path(&self) -> PathBuf {
        self.git_dir.join("packed-refs")
    }

    fn read_packed(&self) -> Result<Vec<PackedRef>, RefError> {
        match fs::read(self.packed_path()) {
            Ok(text) => packed::parse(&text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn read_loose(&self, name: &str) -> Result<Option<RefTarget>, RefError> {
        let text = match fs::read(self.path_for(name)) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let line = text.strip_suffix(b"\n").unwrap_or(&text);
        if let Some(target) = line.strip_prefix(b"ref: ") {
            let target = std::str::from_utf8(target).map_err(|_| RefError::Corrupt {
                detail: format!("non-UTF-8 symref target in {name}"),
            })?;
            return Ok(Some(RefTarget::Symbolic(target.trim().to_owned())));
        }
        let id = ObjectId::from_hex(line.trim_ascii()).map_err(|_| RefError::Corrupt {
            detail: format!("bad id in loose ref {name}"),
        })?;
        Ok(Some(RefTarget::Id(id)))
    }

    /// Reads one ref without following symbolic targets.
    pub fn read(&self, name: &str) -> Result<Option<Ref>, RefError> {
        let loose = self.read_loose(name)?;
        let packed_entry = {
            let packed = self.read_packed()?;
            packed::find(&packed, name).cloned()
        };

        match (loose, packed_entry) {
            (Some(target), Some(_)) => Ok(Some(Ref {
                name: name.to_owned(),
                target,
                storage: RefStorage::LoosePacked,
            })),
            (Some(target), None) => Ok(Some(Ref {
                name: name.to_owned(),
                target,
                storage: RefStorage::Loose,
            })),
            (None, Some(entry)) => Ok(Some(Ref {
                name: name.to_owned(),
                target: match entry.peeled {
                    Some(peeled) => RefTarget::Peeled {
                        id: entry.id,
                        peeled,
                    },
                    None => RefTarget::Id(entry.id),
                },
                storage: RefStorage::Packed,
            })),
            (None, None) => Ok(None),
        }
    }

    /// Resolves `name` through symbolic refs to a terminal value.
    ///
    /// Returns `None` when the name does not exist at all. An existing
    /// symref whose target is absent resolves to an unborn branch
    /// (`id: None`), the state of `HEAD` in a fresh repository.
    pub fn resolve(&self, name: &str) -> Result<Option<Resolved>, RefError> {
        let mut current = name.to_owned();
        for _ in 0..=MAX_SYMREF_DEPTH {
            match self.read(&current)? {
                Some(found) => match found.target {
                    RefTarget::Id(id) | RefTarget::Peeled { id, .. } => {
                        return Ok(Some(Resolved {
                            name: current,
                            id: Some(id),
                        }));
                    }
                    RefTarget::Symbolic(next) => current = next,
                },
                None => {
                    if current == name {
                        return Ok(None);
                    }
                    // Dangling symref: unborn branch.
                    return Ok(Some(Resolved {
                        name: current,
                        id: None,
                    }));
                }
            }
        }
        Err(RefError::SymrefDepthExceeded {
            name: name.to_owned(),
        })
    }

    /// The ref a dangling/terminal resolution reports for display, with
    /// storage [`RefStorage::New`] when unborn.
    pub fn head(&self) -> Result<Option<Ref>, RefError> {
        let Some(resolved) = self.resolve("HEAD")? else {
            return Ok(None);
        };
        Ok(Some(match resolved.id {
            Some(id) => Ref {
                name: resolved.name,
                target: RefTarget::Id(id),
                storage: RefStorage::Loose,
            },
            None => Ref {
                name: resolved.name,
                target: RefTarget::Symbolic(String::new()),
                storage: RefStorage::New,
            },
        }))
    }

    /// Lists refs under `prefix` (e.g. `refs/`), sorted by name.
    /// Loose values shadow packed ones.
    pub fn list(&self, prefix: &str) -> Result<Vec<Ref>, RefError> {
        let mut names = Vec::new();
        collect_loose_names(&self.git_dir, &self.path_for(prefix), prefix, &mut names)?;

        let packed = self.read_packed()?;
        let mut refs: Vec<Ref> = Vec::new();
        for entry in &packed {
            if entry.name.starts_with(prefix) && !names.contains(&entry.name) {
                refs.push(Ref {
                    name: entry.name.clone(),
                    target: match entry.peeled {
                        Some(peeled) => RefTarget::Peeled {
                            id: entry.id,
                            peeled,
                        },
                        None => RefTarget::Id(entry.id),
                    },
                    storage: RefStorage::Packed,
                });
            }
        }
        for name in names {
            if let Some(found) = self.read(&name)? {
                refs.push(found);
            }
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    /// Writes a symbolic ref (`HEAD` -> `refs/heads/main`).
    pub fn write_symbolic(&self, name: &str, target: &str) -> Result<(), RefError> {
        if !refname::is_valid(target) {
            return Err(RefError::InvalidName {
                name: target.to_owned(),
            });
        }
        let mut lock = match LockFile::acquire(&self.path_for(name)) {
            Ok(lock) => lock,
            Err(LockError::Contended) => {
                return Err(RefError::LockConflict {
                    name: name.to_owned(),
                })
            }
            Err(LockError::Io(err)) => return Err(err.into()),
        };
        lock.write_content(format!("ref: {target}\n").as_bytes())?;
        lock.commit()?;
        Ok(())
    }

    /// Applies one update under the ref lock protocol.
    pub fn update(&self, command: &RefCommand, who: &PersonIdent) -> UpdateStatus {
        let mut statuses = self.batch(std::slice::from_ref(command), who, false);
        statuses.pop().unwrap_or(UpdateStatus::IoFailure {
            detail: "empty batch".to_owned(),
        })
    }

    /// Applies a batch of updates.
    ///
    /// Non-atomic: commands run in order; earlier successes stay applied
    /// when later ones fail, and each command reports its own status.
    ///
    /// Atomic: every lock is acquired and every expected old value
    /// verified before anything is written; one failure rolls back all
    /// locks and no ref changes.
    pub fn batch(
        &self,
        commands: &[RefCommand],
        who: &PersonIdent,
        atomic: bool,
    ) -> Vec<UpdateStatus> {
        if atomic {
            self.batch_atomic(commands, who)
        } else {
            commands
                .iter()
                .map(|command| self.apply_one(command, who))
                .collect()
        }
    }

    fn apply_one(&self, command: &RefCommand, who: &PersonIdent) -> UpdateStatus {
        if !refname::is_valid(&command.name) {
            return UpdateStatus::RejectedBadName;
        }
        let lock = match LockFile::acquire(&self.path_for(&command.name)) {
            Ok(lock) => lock,
            Err(LockError::Contended) => return UpdateStatus::LockFailure,
            Err(LockError::Io(err)) => {
                return UpdateStatus::IoFailure {
                    detail: err.to_string(),
                }
            }
        };
        match self.verify_expected(command) {
            Ok(()) => {}
            Err(status) => {
                lock.rollback();
                return status;
            }
        }
        self.commit_locked(command, who, lock)
    }

    fn batch_atomic(&self, commands: &[RefCommand], who: &PersonIdent) -> Vec<UpdateStatus> {
        // Lock in name order so concurrent atomic batches cannot deadlock.
        let mut order: Vec<usize> = (0..commands.len()).collect();
        order.sort_by(|&a, &b| commands[a].name.cmp(&commands[b].name));

        let mut locks: Vec<Option<LockFile>> = (0..commands.len()).map(|_| None).collect();
        let mut failure: Option<(usize, UpdateStatus)> = None;

        for &idx in &order {
            let command = &commands[idx];
            if !refname::is_valid(&command.name) {
                failure = Some((idx, UpdateStatus::RejectedBadName));
                break;
            }
            match LockFile::acquire(&self.path_for(&command.name)) {
                Ok(lock) => locks[idx] = Some(lock),
                Err(LockError::Contended) => {
                    failure = Some((idx, UpdateStatus::LockFailure));
                    break;
                }
                Err(LockError::Io(err)) => {
                    failure = Some((
                        idx,
                        UpdateStatus::IoFailure {
                            detail: err.to_string(),
                        },
                    ));
                    break;
                }
            }
            if let Err(status) = self.verify_expected(command) {
                failure = Some((idx, status));
                break;
            }
        }

        if let Some((failed_idx, status)) = failure {
            for lock in locks.into_iter().flatten() {
                lock.rollback();
            }
            return (0..commands.len())
                .map(|idx| {
                    if idx == failed_idx {
                        status.clone()
                    } else {
                        UpdateStatus::RejectedByHook {
                            reason: "transaction aborted".to_owned(),
                        }
                    }
                })
                .collect();
        }

        let mut statuses = vec![UpdateStatus::Ok; commands.len()];
        for (idx, lock) in locks.into_iter().enumerate() {
            let lock = lock.expect("all locks acquired");
            statuses[idx] = self.commit_locked(&commands[idx], who, lock);
        }
        statuses
    }

    /// Compares the ref's current value against the command's expectation.
    fn verify_expected(&self, command: &RefCommand) -> Result<(), UpdateStatus> {
        let actual = match self.current_id(&command.name) {
            Ok(actual) => actual,
            Err(err) => {
                return Err(UpdateStatus::IoFailure {
                    detail: err.to_string(),
                })
            }
        };
        let matches = match (&actual, command.expected_old.is_zero()) {
            (None, true) => true,
            (Some(actual_id), false) => *actual_id == command.expected_old,
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(UpdateStatus::RejectedStale { actual })
        }
    }

    fn current_id(&self, name: &str) -> Result<Option<ObjectId>, RefError> {
        match self.read(name)? {
            None => Ok(None),
            Some(found) => match found.target {
                RefTarget::Id(id) | RefTarget::Peeled { id, .. } => Ok(Some(id)),
                RefTarget::Symbolic(_) => Ok(None),
            },
        }
    }

    fn commit_locked(
        &self,
        command: &RefCommand,
        who: &PersonIdent,
        mut lock: LockFile,
    ) -> UpdateStatus {
        let old_id = match self.current_id(&command.name) {
            Ok(id) => id.unwrap_or(ObjectId::ZERO),
            Err(err) => {
                lock.rollback();
                return UpdateStatus::IoFailure {
                    detail: err.to_string(),
                };
            }
        };

        if command.is_delete() {
            if let Err(err) = self.delete_locked(&command.name) {
                lock.rollback();
                return UpdateStatus::IoFailure {
                    detail: err.to_string(),
                };
            }
            lock.rollback();
            let _ = self.reflog.remove(&command.name);
            return UpdateStatus::Ok;
        }

        let content = format!("{}\n", command.new_id);
        if let Err(err) = lock.write_content(content.as_bytes()) {
            lock.rollback();
            return UpdateStatus::IoFailure {
                detail: err.to_string(),
            };
        }
        if let Err(err) = lock.commit() {
            return UpdateStatus::IoFailure {
                detail: err.to_string(),
            };
        }

        let _ = self.reflog.append(
            &command.name,
            &ReflogEntry {
                old_id,
                new_id: command.new_id,
                who: who.clone(),
                message: command.message.clone(),
            },
        );
        UpdateStatus::Ok
    }

    /// Removes the loose file and, when present, the packed entry.
    fn delete_locked(&self, name: &str) -> Result<(), RefError> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let packed = self.read_packed()?;
        if packed::find(&packed, name).is_some() {
            let remaining: Vec<PackedRef> = packed
                .into_iter()
                .filter(|entry| entry.name != name)
                .collect();
            self.rewrite_packed(&remaining)?;
        }
        Ok(())
    }

    /// Merges all loose refs under `refs/` into `packed-refs`, then
    /// removes the loose files.
    pub fn pack_refs(&self) -> Result<(), RefError> {
        let loose = self.list("refs/")?;
        let mut packed = self.read_packed()?;

        let mut packed_names: Vec<String> = Vec::new();
        for found in &loose {
            let Some(id) = found.target.id() else {
                continue; // symbolic refs stay loose
            };
            if matches!(found.storage, RefStorage::Loose | RefStorage::LoosePacked) {
                packed.retain(|entry| entry.name != found.name);
                packed.push(PackedRef {
                    name: found.name.clone(),
                    id,
                    peeled: match found.target {
                        RefTarget::Peeled { peeled, .. } => Some(peeled),
                        _ => None,
                    },
                });
                packed_names.push(found.name.clone());
            }
        }
        self.rewrite_packed(&packed)?;

        for name in packed_names {
            match fs::remove_file(self.path_for(&name)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn rewrite_packed(&self, refs: &[PackedRef]) -> Result<(), RefError> {
        let mut lock = match LockFile::acquire(&self.packed_path()) {
            Ok(lock) => lock,
            Err(LockError::Contended) => {
                return Err(RefError::LockConflict {
                    name: "packed-refs".to_owned(),
                })
            }
            Err(LockError::Io(err)) => return Err(err.into()),
        };
        lock.write_content(&packed::serialize(refs))?;
        lock.commit()?;
        Ok(())
    }
}

fn collect_loose_names(
    git_dir: &Path,
    dir: &Path,
    prefix: &str,
    out: &mut Vec<String>,
) -> Result<(), RefError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".lock") {
            continue;
        }
        if path.is_dir() {
            collect_loose_names(git_dir, &path, prefix, out)?;
        } else if let Ok(relative) = path.strip_prefix(git_dir) {
            if let Some(text) = relative.to_str() {
                let normalized = text.replace('\\', "/");
                if normalized.starts_with(prefix) {
                    out.push(normalized);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn who() -> PersonIdent {
        PersonIdent::new("T", "t@example.com", 1_700_000_000, 0)
    }

    fn id(fill: u8) -> ObjectId {
        ObjectId::sha1([fill; 20])
    }

    fn store() -> (TempDir, RefStore) {
        let dir = TempDir::new().unwrap();
        let store = RefStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn create_update_and_read() {
        let (_dir, store) = store();
        let status = store.update(
            &RefCommand::new("refs/heads/main", ObjectId::ZERO, id(0x11), "created"),
            &who(),
        );
        assert_eq!(status, UpdateStatus::Ok);

        let found = store.read("refs/heads/main").unwrap().unwrap();
        assert_eq!(found.target, RefTarget::Id(id(0x11)));
        assert_eq!(found.storage, RefStorage::Loose);

        // Reflog recorded the transition from zero.
        let log = store.reflog().read("refs/heads/main").unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].old_id.is_zero());
        assert_eq!(log[0].new_id, id(0x11));
    }

    #[test]
    fn stale_expected_value_rejected() {
        let (_dir, store) = store();
        store.update(
            &RefCommand::new("refs/heads/main", ObjectId::ZERO, id(0x11), "c"),
            &who(),
        );
        let status = store.update(
            &RefCommand::new("refs/heads/main", id(0x22), id(0x33), "bad"),
            &who(),
        );
        assert!(matches!(status, UpdateStatus::RejectedStale { .. }));
        // Value unchanged after rejection.
        assert_eq!(
            store.read("refs/heads/main").unwrap().unwrap().target,
            RefTarget::Id(id(0x11))
        );
    }

    #[test]
    fn loose_wins_over_packed_until_deleted() {
        let (dir, store) = store();
        // Packed says Z, loose says Y.
        fs::write(
            dir.path().join("packed-refs"),
            format!("{} refs/heads/x\n", id(0x5a)),
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("refs/heads")).unwrap();
        fs::write(
            dir.path().join("refs/heads/x"),
            format!("{}\n", id(0x59)),
        )
        .unwrap();

        let found = store.read("refs/heads/x").unwrap().unwrap();
        assert_eq!(found.target, RefTarget::Id(id(0x59)));
        assert_eq!(found.storage, RefStorage::LoosePacked);

        fs::remove_file(dir.path().join("refs/heads/x")).unwrap();
        let found = store.read("refs/heads/x").unwrap().unwrap();
        assert_eq!(found.target, RefTarget::Id(id(0x5a)));
        assert_eq!(found.storage, RefStorage::Packed);
    }

    #[test]
    fn delete_of_packed_only_ref_rewrites_packed_refs() {
        let (dir, store) = store();
        fs::write(
            dir.path().join("packed-refs"),
            format!("{} refs/heads/gone\n{} refs/heads/kept\n", id(1), id(2)),
        )
        .unwrap();

        let status = store.update(
            &RefCommand::new("refs/heads/gone", id(1), ObjectId::ZERO, "delete"),
            &who(),
        );
        assert_eq!(status, UpdateStatus::Ok);
        assert!(store.read("refs/heads/gone").unwrap().is_none());
        assert!(store.read("refs/heads/kept").unwrap().is_some());
    }

    #[test]
    fn symbolic_resolution_and_unborn_head() {
        let (_dir, store) = store();
        store.write_symbolic("HEAD", "refs/heads/main").unwrap();

        // Unborn: HEAD exists, its target does not.
        let resolved = store.resolve("HEAD").unwrap().unwrap();
        assert_eq!(resolved.name, "refs/heads/main");
        assert_eq!(resolved.id, None);
        assert_eq!(store.head().unwrap().unwrap().storage, RefStorage::New);

        store.update(
            &RefCommand::new("refs/heads/main", ObjectId::ZERO, id(7), "c"),
            &who(),
        );
        let resolved = store.resolve("HEAD").unwrap().unwrap();
        assert_eq!(resolved.id, Some(id(7)));
    }

    #[test]
    fn atomic_batch_rolls_back_on_failure() {
        let (_dir, store) = store();
        store.update(
            &RefCommand::new("refs/heads/a", ObjectId::ZERO, id(1), "c"),
            &who(),
        );

        let commands = vec![
            RefCommand::new("refs/heads/a", id(1), id(2), "ok part"),
            // Wrong expectation: b does not exist with value 9.
            RefCommand::new("refs/heads/b", id(9), id(3), "bad part"),
        ];
        let statuses = store.batch(&commands, &who(), true);
        assert!(matches!(statuses[1], UpdateStatus::RejectedStale { .. }));
        assert!(!statuses[0].is_ok());
        // Nothing moved.
        assert_eq!(
            store.read("refs/heads/a").unwrap().unwrap().target,
            RefTarget::Id(id(1))
        );
        assert!(store.read("refs/heads/b").unwrap().is_none());
    }

    #[test]
    fn non_atomic_batch_keeps_earlier_successes() {
        let (_dir, store) = store();
        let commands = vec![
            RefCommand::new("refs/heads/a", ObjectId::ZERO, id(1), "c"),
            RefCommand::new("refs/heads/b", id(9), id(3), "bad"),
        ];
        let statuses = store.batch(&commands, &who(), false);
        assert!(statuses[0].is_ok());
        assert!(!statuses[1].is_ok());
        assert!(store.read("refs/heads/a").unwrap().is_some());
    }

    #[test]
    fn pack_refs_moves_loose_into_packed() {
        let (dir, store) = store();
        store.update(
            &RefCommand::new("refs/heads/main", ObjectId::ZERO, id(1), "c"),
            &who(),
        );
        store.update(
            &RefCommand::new("refs/tags/v1", ObjectId::ZERO, id(2), "t"),
            &who(),
        );
        store.pack_refs().unwrap();

        assert!(!dir.path().join("refs/heads/main").exists());
        let found = store.read("refs/heads/main").unwrap().unwrap();
        assert_eq!(found.storage, RefStorage::Packed);
        assert_eq!(found.target, RefTarget::Id(id(1)));
        assert_eq!(store.list("refs/").unwrap().len(), 2);
    }

    #[test]
    fn list_merges_loose_and_packed_sorted() {
        let (dir, store) = store();
        fs::write(
            dir.path().join("packed-refs"),
            format!("{} refs/heads/packed-only\n", id(9)),
        )
        .unwrap();
        store.update(
            &RefCommand::new("refs/heads/loose-only", ObjectId::ZERO, id(1), "c"),
            &who(),
        );
        let refs = store.list("refs/").unwrap();
        let names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["refs/heads/loose-only", "refs/heads/packed-only"]);
    }

    #[test]
    fn invalid_name_rejected() {
        let (_dir, store) = store();
        let status = store.update(
            &RefCommand::new("refs/heads/bad..name", ObjectId::ZERO, id(1), "c"),
            &who(),
        );
        assert_eq!(status, UpdateStatus::RejectedBadName);
    }
}
