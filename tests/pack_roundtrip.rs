//! Pack writer and inbound parser against the binary pack format.

mod common;

use gitwire::monitor::NullMonitor;
use gitwire::odb::traits::{ObjectInserter, ObjectReader};
use gitwire::pack::parser::{NoExternalBases, PackParser, ParserConfig};
use gitwire::pack::writer::{PackWriter, WriterConfig};
use gitwire::repo::Repository;
use gitwire::{ObjectKind, ObjectId};
use tempfile::TempDir;

fn write_pack(repo: &Repository, wants: &[ObjectId], haves: &[ObjectId]) -> Vec<u8> {
    let mut session = repo.odb().reader();
    let mut out = Vec::new();
    PackWriter::new(WriterConfig::default())
        .write(
            &mut session,
            wants,
            haves,
            &[],
            &mut out,
            &mut NullMonitor,
        )
        .unwrap();
    out
}

#[test]
fn single_blob_pack_matches_format() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();
    let blob = repo
        .odb()
        .inserter()
        .insert(ObjectKind::Blob, b"abc")
        .unwrap();

    let pack = write_pack(&repo, &[blob], &[]);

    // Header: "PACK", version 2, one object.
    assert_eq!(&pack[0..4], b"PACK");
    assert_eq!(&pack[4..8], &[0, 0, 0, 2]);
    assert_eq!(&pack[8..12], &[0, 0, 0, 1]);
    assert!(pack.len() <= 50, "pack too large: {} bytes", pack.len());

    // Trailer hashes the preceding bytes.
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(&pack[..pack.len() - 20]);
    let digest: [u8; 20] = hasher.finalize().into();
    assert_eq!(&pack[pack.len() - 20..], &digest);

    // Indexing it and reading back returns the payload.
    let parser = PackParser::new(ParserConfig::default());
    let parsed = parser
        .parse(
            &mut pack.as_slice(),
            Default::default(),
            &mut NoExternalBases,
            &mut NullMonitor,
        )
        .unwrap();
    assert_eq!(parsed.stats().object_count, 1);
    assert_eq!(parsed.contained_objects()[0].0, blob);
}

#[test]
fn reachability_closure_round_trips_through_pack() {
    let source_dir = TempDir::new().unwrap();
    let source = Repository::init(source_dir.path(), true).unwrap();
    let chain = common::commit_chain(&source, 5);
    let tip = *chain.last().unwrap();

    let pack = write_pack(&source, &[tip], &[]);

    // Install into a fresh repository and verify every object arrived.
    let target_dir = TempDir::new().unwrap();
    let target = Repository::init(target_dir.path(), true).unwrap();
    let parser = PackParser::new(ParserConfig::default());
    let parsed = parser
        .parse(
            &mut pack.as_slice(),
            Default::default(),
            &mut NoExternalBases,
            &mut NullMonitor,
        )
        .unwrap();
    // 5 commits, 5 distinct trees, 5 distinct blobs.
    assert_eq!(parsed.stats().object_count, 15);
    parsed.install_into(&target.odb().pack_dir()).unwrap();
    target.odb().rescan_packs().unwrap();

    let mut source_session = source.odb().reader();
    let mut target_session = target.odb().reader();
    for id in parsed.contained_objects().iter().map(|(id, _)| id) {
        let original = source_session.read(id).unwrap();
        let unpacked = target_session.read(id).unwrap();
        assert_eq!(original.kind, unpacked.kind);
        assert_eq!(original.bytes, unpacked.bytes);
    }
}

#[test]
fn incremental_pack_excludes_have_side() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();
    let chain = common::commit_chain(&repo, 6);

    let pack = write_pack(&repo, &[chain[5]], &[chain[3]]);
    let parser = PackParser::new(ParserConfig::default());
    let parsed = parser
        .parse(
            &mut pack.as_slice(),
            Default::default(),
            &mut NoExternalBases,
            &mut NullMonitor,
        )
        .unwrap();

    // Two new commits with their trees and blobs; nothing below c3.
    assert_eq!(parsed.stats().object_count, 6);
    let contained: Vec<ObjectId> = parsed.contained_objects().iter().map(|(id, _)| *id).collect();
    assert!(contained.contains(&chain[5]));
    assert!(contained.contains(&chain[4]));
    assert!(!contained.contains(&chain[3]));
}

#[test]
fn deltified_pack_reconstructs_exactly() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();

    // Large, similar blobs so the writer's window finds deltas.
    let mut parents = Vec::new();
    let mut last = None;
    for i in 0..4 {
        let mut content = vec![b'x'; 8192];
        content[i * 100] = b'0' + i as u8;
        let id = common::commit_files(
            &repo,
            &parents,
            &[("big.bin", &content)],
            1_700_000_000 + i as i64,
            &format!("rev {i}"),
        );
        parents = vec![id];
        last = Some(id);
    }

    let pack = write_pack(&repo, &[last.unwrap()], &[]);
    let parser = PackParser::new(ParserConfig::default());
    let parsed = parser
        .parse(
            &mut pack.as_slice(),
            Default::default(),
            &mut NoExternalBases,
            &mut NullMonitor,
        )
        .unwrap();
    assert!(
        parsed.stats().delta_count > 0,
        "expected the window to produce deltas"
    );

    // Every delta resolves back to the original payload.
    let mut session = repo.odb().reader();
    for (id, _) in parsed.contained_objects() {
        assert!(session.contains(id).unwrap());
    }

    // Four 8 KiB near-identical blobs must compress far below raw size.
    assert!(
        pack.len() < 3 * 8192,
        "deltas ineffective: {} bytes",
        pack.len()
    );
}

#[test]
fn pack_survives_reread_through_reader() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();
    let chain = common::commit_chain(&repo, 3);

    let pack = write_pack(&repo, &[chain[2]], &[]);
    let parser = PackParser::new(ParserConfig::default());
    let parsed = parser
        .parse(
            &mut pack.as_slice(),
            Default::default(),
            &mut NoExternalBases,
            &mut NullMonitor,
        )
        .unwrap();
    parsed.install_into(&repo.odb().pack_dir()).unwrap();
    repo.odb().rescan_packs().unwrap();

    // Loose copies removed: reads must now come from the pack.
    for (id, _) in parsed.contained_objects() {
        let path = repo.odb().loose().path_for(id);
        if path.exists() {
            std::fs::remove_file(path).unwrap();
        }
    }
    let mut session = repo.odb().reader();
    for (id, kind) in parsed.contained_objects() {
        let data = session.read(id).unwrap();
        assert_eq!(data.kind, *kind);
    }
}

#[test]
fn corrupt_trailer_rejected() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), true).unwrap();
    let blob = repo
        .odb()
        .inserter()
        .insert(ObjectKind::Blob, b"abc")
        .unwrap();
    let mut pack = write_pack(&repo, &[blob], &[]);
    let len = pack.len();
    pack[len - 1] ^= 0xff;

    let parser = PackParser::new(ParserConfig::default());
    assert!(matches!(
        parser.parse(
            &mut pack.as_slice(),
            Default::default(),
            &mut NoExternalBases,
            &mut NullMonitor,
        ),
        Err(gitwire::pack::parser::ParseError::TrailerMismatch)
    ));
}
