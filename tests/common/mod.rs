//! Shared helpers for integration tests: build commits, trees, and refs
//! in throwaway repositories.
#![allow(dead_code)] // each test binary uses a different subset

use gitwire::object::commit::Commit;
use gitwire::object::ident::PersonIdent;
use gitwire::object::tree::{EntryMode, TreeBuilder};
use gitwire::odb::traits::ObjectInserter;
use gitwire::refs::update::RefCommand;
use gitwire::repo::Repository;
use gitwire::{ObjectId, ObjectKind};

pub fn ident(when: i64) -> PersonIdent {
    PersonIdent::new("Test Author", "test@example.com", when, 0)
}

/// Writes one commit whose tree holds the given flat file list.
///
/// Identical inputs produce identical ids, so two repositories built
/// with the same calls share history byte-for-byte.
pub fn commit_files(
    repo: &Repository,
    parents: &[ObjectId],
    files: &[(&str, &[u8])],
    when: i64,
    message: &str,
) -> ObjectId {
    let mut inserter = repo.odb().inserter();

    let mut tree = TreeBuilder::new();
    for (name, content) in files {
        let blob = inserter.insert(ObjectKind::Blob, content).unwrap();
        tree.insert(EntryMode::Regular, name.as_bytes(), blob);
    }
    let tree_payload = tree.build().unwrap();
    let tree_id = inserter.insert(ObjectKind::Tree, &tree_payload).unwrap();

    let commit = Commit {
        tree: tree_id,
        parents: parents.to_vec(),
        author: ident(when),
        committer: ident(when),
        encoding: None,
        gpgsig: None,
        extra_headers: Vec::new(),
        message: format!("{message}\n").into_bytes(),
    };
    inserter
        .insert(ObjectKind::Commit, &commit.to_payload())
        .unwrap()
}

/// Builds a linear chain of `n` commits, each touching `file.txt`.
pub fn commit_chain(repo: &Repository, n: usize) -> Vec<ObjectId> {
    let mut ids: Vec<ObjectId> = Vec::new();
    for i in 0..n {
        let parents: Vec<ObjectId> = ids.last().copied().into_iter().collect();
        let content = format!("contents at revision {i}\n");
        let id = commit_files(
            repo,
            &parents,
            &[("file.txt", content.as_bytes())],
            1_700_000_000 + i as i64 * 60,
            &format!("commit {i}"),
        );
        ids.push(id);
    }
    ids
}

/// Points `name` at `new`, expecting `old` (zero id when creating).
pub fn set_ref(repo: &Repository, name: &str, old: ObjectId, new: ObjectId) {
    let status = repo
        .refs()
        .update(&RefCommand::new(name, old, new, "test"), &ident(0));
    assert!(status.is_ok(), "ref update failed: {status:?}");
}
