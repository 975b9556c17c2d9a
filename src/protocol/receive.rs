//! Server side of push (`receive-pack`).
//!
//! Advertises current refs, reads the command list, indexes the incoming
//! pack (completing thin packs from the local store), verifies
//! connectivity, applies the ref transaction, and reports per-ref status.
//!
//! # Connectivity check
//! Every non-zero new id must exist after the pack lands, and everything
//! reachable from the new tips (stopping at history reachable from the
//! pre-push refs) must be present. A pack that references an object
//! neither it nor the pre-push repository contains is rejected before
//! any ref moves.

use std::io::{Read, Write};

use ahash::AHashSet;

use crate::monitor::ProgressMonitor;
use crate::object::id::ObjectId;
use crate::object::ident::PersonIdent;
use crate::object::kind::ObjectKind;
use crate::object::tag::Tag;
use crate::odb::store::ObjectDatabase;
use crate::odb::traits::{ObjectData, ObjectReader};
use crate::pack::parser::{PackParser, ParserConfig};
use crate::refs::store::RefStore;
use crate::refs::update::{RefCommand, UpdateStatus};
use crate::revwalk::flags::CommitFlags;
use crate::revwalk::walk::RevWalk;
use crate::treewalk::walk::{TreeWalk, TreeWalkError};
use crate::wire::pktline::{Frame, PktReader, PktWriter};
use crate::wire::sideband::SidebandWriter;

use super::advert::Advertisement;
use super::caps::{names, CapabilitySet, AGENT_STRING};
use super::ProtocolError;

/// A hook deciding whether a ref command is allowed.
///
/// Returning `Err(reason)` rejects that command (`ng <name> <reason>`);
/// under `atomic` one rejection aborts the whole transaction.
pub trait RefFilter {
    /// Judges one command.
    fn allow(&mut self, command: &RefCommand) -> Result<(), String>;
}

/// Filter that allows everything.
pub struct AllowAll;

impl RefFilter for AllowAll {
    fn allow(&mut self, _command: &RefCommand) -> Result<(), String> {
        Ok(())
    }
}

fn server_caps() -> CapabilitySet {
    let mut caps = CapabilitySet::new();
    caps.add(names::REPORT_STATUS);
    caps.add(names::DELETE_REFS);
    caps.add(names::ATOMIC);
    caps.add(names::OFS_DELTA);
    caps.add(names::SIDE_BAND_64K);
    caps.set(names::OBJECT_FORMAT, "sha1");
    caps.set(names::AGENT, AGENT_STRING);
    caps
}

/// Serves one receive-pack conversation.
pub fn serve_receive_pack<R, W, M, F>(
    pkt_in: &mut PktReader<R>,
    pkt_out: &mut PktWriter<W>,
    db: &ObjectDatabase,
    refs: &RefStore,
    who: &PersonIdent,
    filter: &mut F,
    monitor: &mut M,
) -> Result<(), ProtocolError>
where
    R: Read,
    W: Write,
    M: ProgressMonitor,
    F: RefFilter,
{
    // Advertise the current ref state.
    let current = refs.list("refs/")?;
    let advertised: Vec<(String, ObjectId)> = current
        .iter()
        .filter_map(|found| found.target.id().map(|id| (found.name.clone(), id)))
        .collect();
    Advertisement::write(pkt_out, &advertised, &[], &server_caps())?;
    pkt_out.flush_io()?;

    // Command list; capabilities after NUL on the first line.
    let mut commands: Vec<RefCommand> = Vec::new();
    let mut client_caps = CapabilitySet::new();
    loop {
        let frame = match pkt_in.read()? {
            None => return Ok(()), // client hung up (ls-remote against receive-pack)
            Some(frame) => frame,
        };
        let payload = match &frame {
            Frame::Flush => break,
            Frame::Data(payload) => payload,
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    detail: format!("{other:?} in command section"),
                })
            }
        };
        let (line, caps_text) = match payload.iter().position(|&b| b == 0) {
            Some(nul) if commands.is_empty() => (&payload[..nul], Some(&payload[nul + 1..])),
            Some(nul) => (&payload[..nul], None),
            None => (&payload[..], None),
        };
        if let Some(caps_text) = caps_text {
            let text = String::from_utf8_lossy(caps_text);
            client_caps = CapabilitySet::parse(text.trim_end());
        }
        commands.push(parse_command(line)?);
    }
    if commands.is_empty() {
        return Ok(());
    }

    // The pack, when any command introduces objects.
    let needs_pack = commands.iter().any(|command| !command.new_id.is_zero());
    let mut unpack_error: Option<String> = None;
    if needs_pack {
        let parser = PackParser::new(ParserConfig::default());
        let mut session = db.reader();
        let mut lookup = |id: &ObjectId| -> Option<(ObjectKind, Vec<u8>)> {
            session
                .read(id)
                .ok()
                .map(|data: ObjectData| (data.kind, data.bytes))
        };
        match parser.parse(pkt_in.inner_mut(), db.format(), &mut lookup, monitor) {
            Ok(parsed) => {
                parsed
                    .install_into(&db.pack_dir())
                    .map_err(ProtocolError::Pack)?;
                db.rescan_packs()?;
            }
            Err(err) => unpack_error = Some(err.to_string()),
        }
    }

    // Connectivity: every new tip and its ancestry must close over the
    // pre-push ref set plus the new pack.
    if unpack_error.is_none() {
        let old_tips: Vec<ObjectId> = advertised.iter().map(|(_, id)| *id).collect();
        let new_tips: Vec<ObjectId> = commands
            .iter()
            .filter(|command| !command.new_id.is_zero())
            .map(|command| command.new_id)
            .collect();
        let mut session = db.reader();
        if let Err(err) = check_connectivity(&mut session, &new_tips, &old_tips) {
            unpack_error = Some(err);
        }
    }

    // Apply the transaction unless unpacking failed.
    let statuses: Vec<UpdateStatus> = if unpack_error.is_some() {
        vec![
            UpdateStatus::RejectedByHook {
                reason: "unpacker error".to_owned()
            };
            commands.len()
        ]
    } else {
        // The ref filter (pre-receive policy) runs before any update.
        let mut filtered: Vec<Option<String>> = Vec::with_capacity(commands.len());
        for command in &commands {
            filtered.push(filter.allow(command).err());
        }
        let atomic = client_caps.contains(names::ATOMIC);
        if atomic && filtered.iter().any(|rejection| rejection.is_some()) {
            commands
                .iter()
                .zip(&filtered)
                .map(|(_, rejection)| match rejection {
                    Some(reason) => UpdateStatus::RejectedByHook {
                        reason: reason.clone(),
                    },
                    None => UpdateStatus::RejectedByHook {
                        reason: "transaction aborted".to_owned(),
                    },
                })
                .collect()
        } else {
            let mut statuses = Vec::with_capacity(commands.len());
            let allowed: Vec<RefCommand> = commands
                .iter()
                .zip(&filtered)
                .filter(|(_, rejection)| rejection.is_none())
                .map(|(command, _)| command.clone())
                .collect();
            let mut applied = refs.batch(&allowed, who, atomic).into_iter();
            for rejection in &filtered {
                match rejection {
                    Some(reason) => statuses.push(UpdateStatus::RejectedByHook {
                        reason: reason.clone(),
                    }),
                    None => statuses.push(applied.next().unwrap_or(UpdateStatus::IoFailure {
                        detail: "missing status".to_owned(),
                    })),
                }
            }
            statuses
        }
    };

    // report-status, sideband-wrapped when the client negotiated it.
    if client_caps.contains(names::REPORT_STATUS) {
        let mut report = PktWriter::new(Vec::new());
        match &unpack_error {
            None => report.write_text("unpack ok")?,
            Some(error) => report.write_text(&format!("unpack {error}"))?,
        }
        for (command, status) in commands.iter().zip(&statuses) {
            match status.reject_reason() {
                None => report.write_text(&format!("ok {}", command.name))?,
                Some(reason) => {
                    report.write_text(&format!("ng {} {reason}", command.name))?
                }
            }
        }
        report.flush_pkt()?;
        let report_bytes = report.into_inner();

        if client_caps.contains(names::SIDE_BAND_64K) {
            {
                let mut mux = SidebandWriter::new_64k(pkt_out);
                mux.write_pack(&report_bytes)?;
            }
            pkt_out.flush_pkt()?;
        } else {
            pkt_out.inner_mut().write_all(&report_bytes)?;
        }
        pkt_out.flush_io()?;
    }
    Ok(())
}

fn parse_command(line: &[u8]) -> Result<RefCommand, ProtocolError> {
    let bad = |detail: &str| ProtocolError::UnexpectedFrame {
        detail: detail.to_owned(),
    };
    let text = std::str::from_utf8(line).map_err(|_| bad("non-UTF-8 command line"))?;
    let text = text.strip_suffix('\n').unwrap_or(text);
    let mut parts = text.splitn(3, ' ');
    let old = parts.next().ok_or_else(|| bad("short command line"))?;
    let new = parts.next().ok_or_else(|| bad("short command line"))?;
    let name = parts.next().ok_or_else(|| bad("short command line"))?;

    Ok(RefCommand {
        name: name.to_owned(),
        expected_old: ObjectId::from_hex(old.as_bytes())
            .map_err(|_| bad("bad old id in command"))?,
        new_id: ObjectId::from_hex(new.as_bytes()).map_err(|_| bad("bad new id in command"))?,
        message: "push".to_owned(),
    })
}

/// Verifies the pre-push refs plus the received pack close over
/// reachability from every new tip. Tag tips are peeled (chasing
/// tag-of-tag chains), so a pushed tag whose target is absent fails
/// here too. Returns a human-readable reason on failure (it lands in
/// `unpack <reason>`).
fn check_connectivity<S: ObjectReader>(
    reader: &mut S,
    new_tips: &[ObjectId],
    old_tips: &[ObjectId],
) -> Result<(), String> {
    // Classify every tip, peeling annotated tags down to their terminal
    // object. Each link of a chain is read, so a missing tip or a
    // missing tag target both surface as errors. Chains are finite:
    // content addressing rules out a tag reaching itself.
    let mut commit_tips: Vec<ObjectId> = Vec::new();
    let mut trees: Vec<ObjectId> = Vec::new();
    for tip in new_tips {
        let mut cursor = *tip;
        loop {
            let data = match reader.read(&cursor) {
                Ok(data) => data,
                Err(err) => return Err(err.to_string()),
            };
            match data.kind {
                ObjectKind::Commit => {
                    commit_tips.push(cursor);
                    break;
                }
                ObjectKind::Tree => {
                    trees.push(cursor);
                    break;
                }
                // The read above already proved the blob exists.
                ObjectKind::Blob => break,
                ObjectKind::Tag => {
                    let tag = Tag::parse(&data.bytes, cursor.format())
                        .map_err(|err| format!("corrupt tag {cursor}: {err}"))?;
                    cursor = tag.object;
                }
            }
        }
    }

    let mut excluded_roots: Vec<ObjectId> = Vec::new();
    {
        let mut walk = RevWalk::new(reader);
        walk.set_boundary(true);
        for tip in &commit_tips {
            if let Err(err) = walk.mark_start(*tip) {
                return Err(err.to_string());
            }
        }
        for tip in old_tips {
            // Old tips may be tags or missing after pruning; best effort.
            let _ = walk.mark_uninteresting(*tip);
        }
        loop {
            match walk.next() {
                Ok(Some(commit)) => {
                    if commit.flags.contains(CommitFlags::BOUNDARY) {
                        excluded_roots.push(commit.tree);
                    } else {
                        trees.push(commit.tree);
                    }
                }
                Ok(None) => break,
                Err(err) => return Err(err.to_string()),
            }
        }
    }

    // Objects below boundary trees are covered by the pre-push refs.
    let mut excluded: AHashSet<ObjectId> = AHashSet::new();
    for root in excluded_roots {
        if !excluded.insert(root) {
            continue;
        }
        let Ok(mut walk) = TreeWalk::new(reader, &[Some(root)]) else {
            continue;
        };
        walk.set_recursive(true);
        loop {
            match walk.next() {
                Ok(Some(row)) => {
                    for entry in row.entries.into_iter().flatten() {
                        excluded.insert(entry.id);
                    }
                }
                Ok(None) | Err(TreeWalkError::Missing { .. }) => break,
                Err(err) => return Err(err.to_string()),
            }
        }
    }

    let mut seen: AHashSet<ObjectId> = AHashSet::new();
    for root in trees {
        if excluded.contains(&root) || !seen.insert(root) {
            continue;
        }
        // Walk first (missing trees surface as walk errors), then check
        // the collected blob ids once the walk releases the reader.
        let mut blobs: Vec<ObjectId> = Vec::new();
        {
            let mut walk = match TreeWalk::new(reader, &[Some(root)]) {
                Ok(walk) => walk,
                Err(err) => return Err(format!("broken tree {root}: {err}")),
            };
            loop {
                match walk.next() {
                    Ok(Some(row)) => {
                        let Some(entry) = row.entries[0].clone() else {
                            continue;
                        };
                        if entry.mode == crate::object::tree::EntryMode::Gitlink {
                            continue;
                        }
                        if excluded.contains(&entry.id) || !seen.insert(entry.id) {
                            continue;
                        }
                        if entry.mode.is_tree() {
                            walk.enter_subtree().map_err(|err| err.to_string())?;
                        } else {
                            blobs.push(entry.id);
                        }
                    }
                    Ok(None) => break,
                    Err(TreeWalkError::Missing { id }) => {
                        return Err(format!("missing tree {id}"));
                    }
                    Err(err) => return Err(err.to_string()),
                }
            }
        }
        for blob in blobs {
            match reader.contains(&blob) {
                Ok(true) => {}
                Ok(false) => return Err(format!("missing blob {blob}")),
                Err(err) => return Err(err.to_string()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::commit::Commit;
    use crate::object::id::AbbrevId;
    use crate::odb::OdbError;
    use crate::raw::hashing::hash_object;
    use ahash::AHashMap;

    #[derive(Default)]
    struct MemReader {
        objects: AHashMap<ObjectId, (ObjectKind, Vec<u8>)>,
    }

    impl MemReader {
        fn put(&mut self, kind: ObjectKind, payload: Vec<u8>) -> ObjectId {
            let id = hash_object(kind, &payload);
            self.objects.insert(id, (kind, payload));
            id
        }
    }

    impl ObjectReader for MemReader {
        fn contains(&mut self, id: &ObjectId) -> Result<bool, OdbError> {
            Ok(self.objects.contains_key(id))
        }

        fn read(&mut self, id: &ObjectId) -> Result<ObjectData, OdbError> {
            match self.objects.get(id) {
                Some((kind, bytes)) => Ok(ObjectData {
                    kind: *kind,
                    bytes: bytes.clone(),
                }),
                None => Err(OdbError::Missing { id: *id }),
            }
        }

        fn resolve_prefix(
            &mut self,
            _prefix: &AbbrevId,
            _limit: usize,
        ) -> Result<Vec<ObjectId>, OdbError> {
            Ok(Vec::new())
        }
    }

    fn commit_on_empty_tree(reader: &mut MemReader) -> ObjectId {
        let tree = reader.put(ObjectKind::Tree, Vec::new());
        let who = PersonIdent::new("c", "c@e", 1, 0);
        let commit = Commit {
            tree,
            parents: Vec::new(),
            author: who.clone(),
            committer: who,
            encoding: None,
            gpgsig: None,
            extra_headers: Vec::new(),
            message: b"root\n".to_vec(),
        };
        reader.put(ObjectKind::Commit, commit.to_payload())
    }

    fn tag_of(reader: &mut MemReader, target: ObjectId, kind: ObjectKind) -> ObjectId {
        let tag = crate::object::tag::Tag {
            object: target,
            target_kind: kind,
            name: "v1".to_owned(),
            tagger: None,
            message: b"t\n".to_vec(),
        };
        reader.put(ObjectKind::Tag, tag.to_payload())
    }

    #[test]
    fn tag_tip_with_present_target_passes() {
        let mut reader = MemReader::default();
        let commit = commit_on_empty_tree(&mut reader);
        let tag = tag_of(&mut reader, commit, ObjectKind::Commit);
        check_connectivity(&mut reader, &[tag], &[]).unwrap();
    }

    #[test]
    fn tag_tip_with_missing_target_fails() {
        let mut reader = MemReader::default();
        let missing = ObjectId::sha1([0x44; 20]);
        let tag = tag_of(&mut reader, missing, ObjectKind::Commit);
        let err = check_connectivity(&mut reader, &[tag], &[]).unwrap_err();
        assert!(err.contains("missing"), "unexpected reason: {err}");
    }

    #[test]
    fn nested_tag_chain_is_peeled() {
        let mut reader = MemReader::default();
        let commit = commit_on_empty_tree(&mut reader);
        let inner = tag_of(&mut reader, commit, ObjectKind::Commit);
        let outer = tag_of(&mut reader, inner, ObjectKind::Tag);
        check_connectivity(&mut reader, &[outer], &[]).unwrap();

        // The same chain with its commit removed must fail.
        reader.objects.remove(&commit);
        let err = check_connectivity(&mut reader, &[outer], &[]).unwrap_err();
        assert!(err.contains("missing"), "unexpected reason: {err}");
    }

    #[test]
    fn missing_tip_itself_fails() {
        let mut reader = MemReader::default();
        let err = check_connectivity(&mut reader, &[ObjectId::sha1([9; 20])], &[])
            .unwrap_err();
        assert!(err.contains("missing"));
    }
}
