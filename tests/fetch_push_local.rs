//! End-to-end fetch and push over the in-process local transport: the
//! full stack from pkt-line framing through negotiation, pack streaming,
//! inbound indexing, and ref updates.

mod common;

use gitwire::monitor::NullMonitor;
use gitwire::odb::traits::ObjectReader;
use gitwire::pack::parser::{PackParser, ParserConfig};
use gitwire::protocol::advert::Advertisement;
use gitwire::protocol::fetch::{fetch_v0, FetchOptions};
use gitwire::protocol::push::{push_v0, PushCommand, PushOptions};
use gitwire::repo::Repository;
use gitwire::transport::{LocalTransport, Transport};
use gitwire::wire::pktline::{PktReader, PktWriter};
use gitwire::{ObjectId, ObjectKind};
use tempfile::TempDir;

/// Fetches `want_ref` from `remote_path` into `local`, returning the
/// new tip and the ids the server acknowledged as common.
fn fetch_into(
    local: &Repository,
    remote_path: &std::path::Path,
    want_ref: &str,
) -> (ObjectId, Vec<ObjectId>, u32) {
    let mut transport = LocalTransport::new(remote_path);
    let stream = transport.open_fetch().unwrap();
    let mut pkt_in = PktReader::new(stream.input);
    let mut pkt_out = PktWriter::new(stream.output);

    let advert = Advertisement::read(&mut pkt_in).unwrap();
    let want = advert.find(want_ref).expect("remote advertises the ref");

    let tips: Vec<ObjectId> = local
        .refs()
        .list("refs/")
        .unwrap()
        .iter()
        .filter_map(|found| found.target.id())
        .collect();

    let mut session = local.odb().reader();
    let mut monitor = NullMonitor;
    let mut unpacked = 0u32;
    let result = fetch_v0(
        &mut pkt_in,
        &mut pkt_out,
        &advert,
        &[want],
        &mut session,
        &tips,
        &FetchOptions::default(),
        &mut monitor,
        |pack_stream| {
            let parser = PackParser::new(ParserConfig::default());
            let mut bases = |id: &ObjectId| {
                local
                    .odb()
                    .reader()
                    .read(id)
                    .ok()
                    .map(|data| (data.kind, data.bytes))
            };
            let mut inner_monitor = NullMonitor;
            let parsed = parser
                .parse(
                    pack_stream,
                    Default::default(),
                    &mut bases,
                    &mut inner_monitor,
                )
                .map_err(gitwire::protocol::ProtocolError::Pack)?;
            unpacked = parsed.stats().object_count;
            parsed
                .install_into(&local.odb().pack_dir())
                .map_err(gitwire::protocol::ProtocolError::Pack)?;
            local
                .odb()
                .rescan_packs()
                .map_err(gitwire::protocol::ProtocolError::Odb)?;
            Ok(())
        },
    )
    .unwrap();
    transport.close();
    (want, result.common, unpacked)
}

#[test]
fn fetch_negotiation_sends_minimal_pack() {
    // Local has c0..=c9; remote has the same history plus c10, c11.
    let local_dir = TempDir::new().unwrap();
    let local = Repository::init(local_dir.path(), true).unwrap();
    let local_chain = common::commit_chain(&local, 10);
    common::set_ref(
        &local,
        "refs/heads/main",
        ObjectId::ZERO,
        local_chain[9],
    );

    let remote_dir = TempDir::new().unwrap();
    let remote = Repository::init(remote_dir.path(), true).unwrap();
    let remote_chain = common::commit_chain(&remote, 12);
    assert_eq!(
        local_chain[9], remote_chain[9],
        "deterministic helpers must agree on history"
    );
    common::set_ref(
        &remote,
        "refs/heads/main",
        ObjectId::ZERO,
        remote_chain[11],
    );

    let (tip, common_ids, unpacked) =
        fetch_into(&local, remote_dir.path(), "refs/heads/main");
    assert_eq!(tip, remote_chain[11]);

    // Negotiation found the shared tip.
    assert!(
        common_ids.contains(&remote_chain[9]),
        "common set {common_ids:?} should contain c9"
    );

    // Pack carried exactly the two new commits with their trees/blobs.
    assert_eq!(unpacked, 6);

    // Everything is readable locally now.
    let mut session = local.odb().reader();
    for id in [remote_chain[10], remote_chain[11]] {
        assert_eq!(session.read(&id).unwrap().kind, ObjectKind::Commit);
    }
}

#[test]
fn fetch_into_empty_repository() {
    let remote_dir = TempDir::new().unwrap();
    let remote = Repository::init(remote_dir.path(), true).unwrap();
    let chain = common::commit_chain(&remote, 4);
    common::set_ref(&remote, "refs/heads/main", ObjectId::ZERO, chain[3]);

    let local_dir = TempDir::new().unwrap();
    let local = Repository::init(local_dir.path(), true).unwrap();

    let (tip, common_ids, unpacked) =
        fetch_into(&local, remote_dir.path(), "refs/heads/main");
    assert_eq!(tip, chain[3]);
    assert!(common_ids.is_empty());
    assert_eq!(unpacked, 12); // 4 commits + 4 trees + 4 blobs

    let mut session = local.odb().reader();
    assert!(session.contains(&chain[0]).unwrap());
}

#[test]
fn push_creates_and_advances_remote_ref() {
    let local_dir = TempDir::new().unwrap();
    let local = Repository::init(local_dir.path(), true).unwrap();
    let chain = common::commit_chain(&local, 3);
    common::set_ref(&local, "refs/heads/main", ObjectId::ZERO, chain[2]);

    let remote_dir = TempDir::new().unwrap();
    let remote = Repository::init(remote_dir.path(), true).unwrap();

    // First push: create the remote ref.
    let mut transport = LocalTransport::new(remote_dir.path());
    let stream = transport.open_push().unwrap();
    let mut pkt_in = PktReader::new(stream.input);
    let mut pkt_out = PktWriter::new(stream.output);
    let mut session = local.odb().reader();
    let outcome = push_v0(
        &mut pkt_in,
        &mut pkt_out,
        &mut session,
        &[PushCommand {
            old: ObjectId::ZERO,
            new: chain[2],
            name: "refs/heads/main".to_owned(),
        }],
        &PushOptions::default(),
        &mut NullMonitor,
    )
    .unwrap();
    drop(pkt_out);
    transport.close();
    assert!(outcome.all_ok(), "outcome: {outcome:?}");

    let found = remote.refs().read("refs/heads/main").unwrap().unwrap();
    assert_eq!(found.target.id(), Some(chain[2]));
    let mut remote_session = remote.odb().reader();
    assert!(remote_session.contains(&chain[0]).unwrap());

    // Second push: fast-forward with the incremental pack.
    let more = common::commit_files(
        &local,
        &[chain[2]],
        &[("file.txt", b"revision 3\n")],
        1_800_000_000,
        "commit 3",
    );
    common::set_ref(&local, "refs/heads/main", chain[2], more);

    let mut transport = LocalTransport::new(remote_dir.path());
    let stream = transport.open_push().unwrap();
    let mut pkt_in = PktReader::new(stream.input);
    let mut pkt_out = PktWriter::new(stream.output);
    let mut session = local.odb().reader();
    let outcome = push_v0(
        &mut pkt_in,
        &mut pkt_out,
        &mut session,
        &[PushCommand {
            old: chain[2],
            new: more,
            name: "refs/heads/main".to_owned(),
        }],
        &PushOptions::default(),
        &mut NullMonitor,
    )
    .unwrap();
    drop(pkt_out);
    transport.close();
    assert!(outcome.all_ok());
    assert_eq!(
        remote.refs().read("refs/heads/main").unwrap().unwrap().target.id(),
        Some(more)
    );
}

#[test]
fn push_with_stale_expectation_is_rejected_per_ref() {
    let local_dir = TempDir::new().unwrap();
    let local = Repository::init(local_dir.path(), true).unwrap();
    let chain = common::commit_chain(&local, 2);

    let remote_dir = TempDir::new().unwrap();
    let remote = Repository::init(remote_dir.path(), true).unwrap();
    let remote_chain = common::commit_chain(&remote, 2);
    common::set_ref(&remote, "refs/heads/main", ObjectId::ZERO, remote_chain[1]);

    // Claim the remote is at c0 when it is at c1.
    let mut transport = LocalTransport::new(remote_dir.path());
    let stream = transport.open_push().unwrap();
    let mut pkt_in = PktReader::new(stream.input);
    let mut pkt_out = PktWriter::new(stream.output);
    let mut session = local.odb().reader();
    let outcome = push_v0(
        &mut pkt_in,
        &mut pkt_out,
        &mut session,
        &[PushCommand {
            old: chain[0],
            new: chain[1],
            name: "refs/heads/main".to_owned(),
        }],
        &PushOptions::default(),
        &mut NullMonitor,
    )
    .unwrap();
    drop(pkt_out);
    transport.close();

    assert!(outcome.unpack_ok);
    assert!(!outcome.all_ok());
    assert!(outcome.ref_status[0].1.is_err());
    // The remote ref did not move.
    assert_eq!(
        remote.refs().read("refs/heads/main").unwrap().unwrap().target.id(),
        Some(remote_chain[1])
    );
}

#[test]
fn ls_remote_style_disconnect_is_clean() {
    let remote_dir = TempDir::new().unwrap();
    let remote = Repository::init(remote_dir.path(), true).unwrap();
    let chain = common::commit_chain(&remote, 2);
    common::set_ref(&remote, "refs/heads/main", ObjectId::ZERO, chain[1]);

    let mut transport = LocalTransport::new(remote_dir.path());
    let stream = transport.open_fetch().unwrap();
    let mut pkt_in = PktReader::new(stream.input);
    let advert = Advertisement::read(&mut pkt_in).unwrap();
    assert_eq!(advert.find("refs/heads/main"), Some(chain[1]));

    // Dropping the streams (no wants) must leave the server happy.
    drop(pkt_in);
    drop(stream.output);
    transport.close();
}
