//! Loose object storage against the canonical on-disk format.

mod common;

use gitwire::odb::traits::{ObjectInserter, ObjectReader};
use gitwire::repo::Repository;
use gitwire::{AbbrevId, ObjectId, ObjectKind};
use tempfile::TempDir;

#[test]
fn blob_round_trip_has_canonical_id() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();

    let id = repo
        .odb()
        .inserter()
        .insert(ObjectKind::Blob, b"hello\n")
        .unwrap();
    assert_eq!(id.to_string(), "ce013625030ba8dba906f756967f9e9ca394464a");

    // The loose file lands at objects/ce/0136...
    let loose = repo
        .odb()
        .objects_dir()
        .join("ce")
        .join("013625030ba8dba906f756967f9e9ca394464a");
    assert!(loose.is_file());

    let data = repo.odb().reader().read(&id).unwrap();
    assert_eq!(data.kind, ObjectKind::Blob);
    assert_eq!(data.bytes, b"hello\n");
}

#[test]
fn all_object_kinds_round_trip() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();
    let chain = common::commit_chain(&repo, 3);

    let mut reader = repo.odb().reader();
    for id in &chain {
        let data = reader.read(id).unwrap();
        assert_eq!(data.kind, ObjectKind::Commit);
    }
}

#[test]
fn concurrent_same_id_inserts_agree() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut inserter = repo.odb().inserter();
                for round in 0..16u32 {
                    let payload = format!("shared payload {}", round % 4);
                    inserter
                        .insert(ObjectKind::Blob, payload.as_bytes())
                        .unwrap();
                }
            });
        }
    });

    let mut reader = repo.odb().reader();
    for round in 0..4u32 {
        let payload = format!("shared payload {round}");
        let id = gitwire::raw::hashing::hash_object(ObjectKind::Blob, payload.as_bytes());
        assert_eq!(reader.read(&id).unwrap().bytes, payload.as_bytes());
    }
}

#[test]
fn abbreviated_ids_resolve() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();
    let id = repo
        .odb()
        .inserter()
        .insert(ObjectKind::Blob, b"hello\n")
        .unwrap();

    let prefix = AbbrevId::from_hex(&id.to_string().as_bytes()[..8]).unwrap();
    let found = repo.odb().reader().resolve_prefix(&prefix, 4).unwrap();
    assert_eq!(found, vec![id]);
}

#[test]
fn missing_objects_are_distinguishable() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();
    let mut reader = repo.odb().reader();
    let absent = ObjectId::sha1([0x99; 20]);
    assert!(!reader.contains(&absent).unwrap());
    assert!(matches!(
        reader.read(&absent),
        Err(gitwire::odb::OdbError::Missing { .. })
    ));
}
