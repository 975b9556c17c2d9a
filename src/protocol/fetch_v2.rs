//! Protocol v2 (stateless request/response) client machinery.
//!
//! v2 replaces the advertisement with explicit commands. A request is:
//! `command=<name>` plus capability lines, a delim-pkt, argument lines,
//! and a flush. The `fetch` response is a sequence of named sections
//! (`acknowledgments`, `shallow-info`, `wanted-refs`, `packfile-uris`,
//! `packfile`), each introduced by its header line and separated by
//! delim-pkts; the response ends with a flush (or response-end over
//! stateless HTTP).
//!
//! This is a distinct machine from v0/v1 sharing only pkt-line framing;
//! the server announces v2 via `version 2` when `GIT_PROTOCOL` carried
//! `version=2`.

use std::io::{Read, Write};

use crate::monitor::ProgressMonitor;
use crate::object::id::ObjectId;
use crate::wire::pktline::{Frame, PktReader, PktWriter};
use crate::wire::sideband::SidebandReader;

use super::caps::AGENT_STRING;
use super::shallow::{DepthSpec, ShallowUpdate};
use super::ProtocolError;

/// One ref from an `ls-refs` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefRecord {
    /// Ref value.
    pub id: ObjectId,
    /// Full ref name.
    pub name: String,
    /// `symref-target:` attribute when requested and applicable.
    pub symref_target: Option<String>,
    /// `peeled:` attribute for annotated tags when peeling requested.
    pub peeled: Option<ObjectId>,
}

/// Arguments for an `ls-refs` command.
#[derive(Clone, Debug, Default)]
pub struct LsRefsArgs {
    /// Restrict output to refs under these prefixes.
    pub prefixes: Vec<String>,
    /// Ask for symref targets.
    pub symrefs: bool,
    /// Ask for peeled tag values.
    pub peel: bool,
}

/// Sends an `ls-refs` request.
pub fn send_ls_refs<W: Write>(
    pkt: &mut PktWriter<W>,
    args: &LsRefsArgs,
    session_id: Option<&str>,
) -> Result<(), ProtocolError> {
    pkt.write_text("command=ls-refs")?;
    write_caps(pkt, session_id)?;
    pkt.delim_pkt()?;
    if args.symrefs {
        pkt.write_text("symrefs")?;
    }
    if args.peel {
        pkt.write_text("peel")?;
    }
    for prefix in &args.prefixes {
        pkt.write_text(&format!("ref-prefix {prefix}"))?;
    }
    pkt.flush_pkt()?;
    pkt.flush_io()?;
    Ok(())
}

/// Parses an `ls-refs` response up to its flush.
pub fn read_ls_refs<R: Read>(pkt: &mut PktReader<R>) -> Result<Vec<RefRecord>, ProtocolError> {
    let mut records = Vec::new();
    loop {
        match pkt.read_required()? {
            Frame::Flush | Frame::ResponseEnd => return Ok(records),
            Frame::Data(payload) => records.push(parse_ref_record(&payload)?),
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    detail: format!("{other:?} in ls-refs response"),
                })
            }
        }
    }
}

fn parse_ref_record(payload: &[u8]) -> Result<RefRecord, ProtocolError> {
    let bad = |detail: String| ProtocolError::UnexpectedFrame { detail };
    let text = std::str::from_utf8(payload)
        .map_err(|_| bad("non-UTF-8 ref record".to_owned()))?;
    let text = text.strip_suffix('\n').unwrap_or(text);
    let mut words = text.split(' ');
    let hex = words.next().ok_or_else(|| bad("empty record".to_owned()))?;
    let name = words
        .next()
        .ok_or_else(|| bad(format!("record missing name: {text}")))?;

    let mut record = RefRecord {
        id: ObjectId::from_hex(hex.as_bytes())
            .map_err(|_| bad(format!("bad id in record: {text}")))?,
        name: name.to_owned(),
        symref_target: None,
        peeled: None,
    };
    for attr in words {
        if let Some(target) = attr.strip_prefix("symref-target:") {
            record.symref_target = Some(target.to_owned());
        } else if let Some(hex) = attr.strip_prefix("peeled:") {
            record.peeled = Some(
                ObjectId::from_hex(hex.as_bytes())
                    .map_err(|_| bad(format!("bad peeled id: {text}")))?,
            );
        }
    }
    Ok(record)
}

/// Arguments for a v2 `fetch` command.
#[derive(Clone, Debug, Default)]
pub struct FetchArgs {
    /// Object ids to fetch.
    pub wants: Vec<ObjectId>,
    /// Ref names to fetch (`want-ref`), resolved server-side.
    pub want_refs: Vec<String>,
    /// Local commit ids offered as common candidates.
    pub haves: Vec<ObjectId>,
    /// Whether negotiation is complete (`done`).
    pub done: bool,
    /// Keep the connection open until the client sends done.
    pub wait_for_done: bool,
    /// Request a thin pack.
    pub thin: bool,
    /// Request offset deltas.
    pub ofs_delta: bool,
    /// Suppress progress.
    pub no_progress: bool,
    /// Include pointing tags.
    pub include_tag: bool,
    /// History truncation.
    pub depth: Option<DepthSpec>,
    /// Commits already shallow locally.
    pub client_shallow: Vec<ObjectId>,
    /// Object filter spec.
    pub filter: Option<String>,
    /// Sideband-wrap every response section.
    pub sideband_all: bool,
    /// Accept `packfile-uris` offloading with these accepted protocols.
    pub packfile_uris_protocols: Vec<String>,
    /// Server options passed through verbatim.
    pub server_options: Vec<String>,
}

/// Sends a v2 `fetch` request.
pub fn send_fetch<W: Write>(
    pkt: &mut PktWriter<W>,
    args: &FetchArgs,
    session_id: Option<&str>,
) -> Result<(), ProtocolError> {
    if args.wants.is_empty() && args.want_refs.is_empty() {
        return Err(ProtocolError::InvalidArgument {
            detail: "fetch with neither want nor want-ref".to_owned(),
        });
    }
    pkt.write_text("command=fetch")?;
    write_caps(pkt, session_id)?;
    for option in &args.server_options {
        pkt.write_text(&format!("server-option={option}"))?;
    }
    pkt.delim_pkt()?;

    if args.thin {
        pkt.write_text("thin-pack")?;
    }
    if args.ofs_delta {
        pkt.write_text("ofs-delta")?;
    }
    if args.no_progress {
        pkt.write_text("no-progress")?;
    }
    if args.include_tag {
        pkt.write_text("include-tag")?;
    }
    if args.sideband_all {
        pkt.write_text("sideband-all")?;
    }
    if args.wait_for_done {
        pkt.write_text("wait-for-done")?;
    }
    for want in &args.wants {
        pkt.write_text(&format!("want {want}"))?;
    }
    for name in &args.want_refs {
        pkt.write_text(&format!("want-ref {name}"))?;
    }
    for shallow in &args.client_shallow {
        pkt.write_text(&format!("shallow {shallow}"))?;
    }
    if let Some(depth) = &args.depth {
        pkt.write_text(&depth.to_line())?;
    }
    if let Some(filter) = &args.filter {
        pkt.write_text(&format!("filter {filter}"))?;
    }
    if !args.packfile_uris_protocols.is_empty() {
        pkt.write_text(&format!(
            "packfile-uris {}",
            args.packfile_uris_protocols.join(",")
        ))?;
    }
    for have in &args.haves {
        pkt.write_text(&format!("have {have}"))?;
    }
    if args.done {
        pkt.write_text("done")?;
    }
    pkt.flush_pkt()?;
    pkt.flush_io()?;
    Ok(())
}

fn write_caps<W: Write>(
    pkt: &mut PktWriter<W>,
    session_id: Option<&str>,
) -> Result<(), ProtocolError> {
    pkt.write_text(&format!("agent={AGENT_STRING}"))?;
    pkt.write_text("object-format=sha1")?;
    if let Some(session_id) = session_id {
        pkt.write_text(&format!("session-id={session_id}"))?;
    }
    Ok(())
}

/// Acknowledgment state from a v2 `acknowledgments` section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct V2Acks {
    /// Ids the server acknowledged.
    pub acked: Vec<ObjectId>,
    /// Server signalled it can produce the pack (`ready`).
    pub ready: bool,
    /// Server had nothing to acknowledge.
    pub nak: bool,
}

/// Parsed non-pack sections of a v2 fetch response.
#[derive(Clone, Debug, Default)]
pub struct V2FetchResponse {
    /// `acknowledgments` section, absent once negotiation is done.
    pub acks: Option<V2Acks>,
    /// `shallow-info` section.
    pub shallow: ShallowUpdate,
    /// `wanted-refs` section: resolved `want-ref` names.
    pub wanted_refs: Vec<(String, ObjectId)>,
    /// `packfile-uris` section: `<uri>` lines the client may download.
    pub packfile_uris: Vec<String>,
    /// Whether a `packfile` section follows (stream positioned at it).
    pub has_packfile: bool,
}

/// Reads v2 fetch response sections up to the `packfile` header.
///
/// When `has_packfile` is set, the caller consumes the pack through
/// [`read_packfile`] next; otherwise the response is complete (a
/// negotiation round that is not yet `ready`).
pub fn read_fetch_sections<R: Read>(
    pkt: &mut PktReader<R>,
) -> Result<V2FetchResponse, ProtocolError> {
    let mut response = V2FetchResponse::default();

    loop {
        let frame = match pkt.read()? {
            None => return Ok(response),
            Some(frame) => frame,
        };
        let section = match &frame {
            Frame::Flush | Frame::ResponseEnd => return Ok(response),
            Frame::Data(payload) => text_of(payload)?.to_owned(),
            Frame::Delim => continue,
        };

        match section.as_str() {
            "acknowledgments" => {
                let mut acks = V2Acks::default();
                let ended = read_section_lines(pkt, |line| {
                    if line == "NAK" {
                        acks.nak = true;
                    } else if line == "ready" {
                        acks.ready = true;
                    } else if let Some(hex) = line.strip_prefix("ACK ") {
                        let id = ObjectId::from_hex(hex.as_bytes()).map_err(|_| {
                            ProtocolError::UnexpectedFrame {
                                detail: format!("bad ack: {line}"),
                            }
                        })?;
                        acks.acked.push(id);
                    } else {
                        return Err(ProtocolError::UnexpectedFrame {
                            detail: format!("{line} in acknowledgments"),
                        });
                    }
                    Ok(())
                })?;
                response.acks = Some(acks);
                if ended {
                    return Ok(response);
                }
            }
            "shallow-info" => {
                let mut update = ShallowUpdate::default();
                let ended = read_section_lines(pkt, |line| {
                    if !update.apply_line(line)? {
                        return Err(ProtocolError::UnexpectedFrame {
                            detail: format!("{line} in shallow-info"),
                        });
                    }
                    Ok(())
                })?;
                response.shallow = update;
                if ended {
                    return Ok(response);
                }
            }
            "wanted-refs" => {
                let ended = read_section_lines(pkt, |line| {
                    let (hex, name) =
                        line.split_once(' ')
                            .ok_or_else(|| ProtocolError::UnexpectedFrame {
                                detail: format!("{line} in wanted-refs"),
                            })?;
                    let id = ObjectId::from_hex(hex.as_bytes()).map_err(|_| {
                        ProtocolError::UnexpectedFrame {
                            detail: format!("bad id in wanted-refs: {line}"),
                        }
                    })?;
                    response.wanted_refs.push((name.to_owned(), id));
                    Ok(())
                })?;
                if ended {
                    return Ok(response);
                }
            }
            "packfile-uris" => {
                let ended = read_section_lines(pkt, |line| {
                    response.packfile_uris.push(line.to_owned());
                    Ok(())
                })?;
                if ended {
                    return Ok(response);
                }
            }
            "packfile" => {
                response.has_packfile = true;
                return Ok(response);
            }
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    detail: format!("unknown v2 section {other}"),
                })
            }
        }
    }
}

/// Consumes the `packfile` section: sideband frames up to the final
/// flush, handed to `on_pack` as a byte stream.
pub fn read_packfile<R, M, F>(
    pkt: &mut PktReader<R>,
    monitor: &mut M,
    on_pack: F,
) -> Result<(), ProtocolError>
where
    R: Read,
    M: ProgressMonitor,
    F: FnOnce(&mut dyn Read) -> Result<(), ProtocolError>,
{
    let mut demux = SidebandReader::new(pkt, monitor);
    on_pack(&mut demux)
}

/// Reads one section's lines until a delim (more sections follow,
/// returns `false`) or flush/response-end (response over, `true`).
fn read_section_lines<R: Read>(
    pkt: &mut PktReader<R>,
    mut on_line: impl FnMut(&str) -> Result<(), ProtocolError>,
) -> Result<bool, ProtocolError> {
    loop {
        match pkt.read_required()? {
            Frame::Delim => return Ok(false),
            Frame::Flush | Frame::ResponseEnd => return Ok(true),
            Frame::Data(payload) => on_line(text_of(&payload)?)?,
        }
    }
}

fn text_of(payload: &[u8]) -> Result<&str, ProtocolError> {
    let line = std::str::from_utf8(payload).map_err(|_| ProtocolError::UnexpectedFrame {
        detail: "non-UTF-8 v2 line".to_owned(),
    })?;
    Ok(line.strip_suffix('\n').unwrap_or(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn id_of(fill: u8) -> ObjectId {
        ObjectId::sha1([fill; 20])
    }

    #[test]
    fn ls_refs_round_trip_shapes() {
        let mut pkt = PktWriter::new(Vec::new());
        send_ls_refs(
            &mut pkt,
            &LsRefsArgs {
                prefixes: vec!["refs/heads/".to_owned()],
                symrefs: true,
                peel: true,
            },
            Some("abc123"),
        )
        .unwrap();

        let bytes = pkt.into_inner();
        let mut reader = PktReader::new(Cursor::new(bytes));
        let mut lines = Vec::new();
        loop {
            match reader.read().unwrap() {
                None | Some(Frame::Flush) => break,
                Some(Frame::Delim) => lines.push("--".to_owned()),
                Some(frame) => lines.push(frame.as_text().unwrap().to_owned()),

            }
        }
        assert_eq!(lines[0], "command=ls-refs");
        assert!(lines.contains(&"session-id=abc123".to_owned()));
        assert!(lines.contains(&"--".to_owned()));
        assert!(lines.contains(&"ref-prefix refs/heads/".to_owned()));
    }

    #[test]
    fn ls_refs_response_parses_attributes() {
        let mut pkt = PktWriter::new(Vec::new());
        pkt.write_text(&format!(
            "{} HEAD symref-target:refs/heads/main",
            id_of(1)
        ))
        .unwrap();
        pkt.write_text(&format!("{} refs/tags/v1 peeled:{}", id_of(2), id_of(3)))
            .unwrap();
        pkt.flush_pkt().unwrap();

        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        let records = read_ls_refs(&mut reader).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].symref_target.as_deref(),
            Some("refs/heads/main")
        );
        assert_eq!(records[1].peeled, Some(id_of(3)));
    }

    #[test]
    fn fetch_request_requires_wants() {
        let mut pkt = PktWriter::new(Vec::new());
        assert!(matches!(
            send_fetch(&mut pkt, &FetchArgs::default(), None),
            Err(ProtocolError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn acknowledgments_section_parses() {
        let mut pkt = PktWriter::new(Vec::new());
        pkt.write_text("acknowledgments").unwrap();
        pkt.write_text(&format!("ACK {}", id_of(5))).unwrap();
        pkt.write_text("ready").unwrap();
        pkt.delim_pkt().unwrap();
        pkt.write_text("packfile").unwrap();
        // (pack frames would follow)
        pkt.flush_pkt().unwrap();

        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        let response = read_fetch_sections(&mut reader).unwrap();
        let acks = response.acks.unwrap();
        assert_eq!(acks.acked, vec![id_of(5)]);
        assert!(acks.ready);
        assert!(response.has_packfile);
    }

    #[test]
    fn nak_only_round_has_no_packfile() {
        let mut pkt = PktWriter::new(Vec::new());
        pkt.write_text("acknowledgments").unwrap();
        pkt.write_text("NAK").unwrap();
        pkt.flush_pkt().unwrap();

        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        let response = read_fetch_sections(&mut reader).unwrap();
        assert!(response.acks.unwrap().nak);
        assert!(!response.has_packfile);
    }

    #[test]
    fn shallow_info_and_wanted_refs_parse() {
        let mut pkt = PktWriter::new(Vec::new());
        pkt.write_text("shallow-info").unwrap();
        pkt.write_text(&format!("shallow {}", id_of(7))).unwrap();
        pkt.delim_pkt().unwrap();
        pkt.write_text("wanted-refs").unwrap();
        pkt.write_text(&format!("{} refs/heads/main", id_of(8)))
            .unwrap();
        pkt.delim_pkt().unwrap();
        pkt.write_text("packfile").unwrap();
        pkt.flush_pkt().unwrap();

        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        let response = read_fetch_sections(&mut reader).unwrap();
        assert_eq!(response.shallow.shallow, vec![id_of(7)]);
        assert_eq!(
            response.wanted_refs,
            vec![("refs/heads/main".to_owned(), id_of(8))]
        );
        assert!(response.has_packfile);
    }

    #[test]
    fn unknown_section_rejected() {
        let mut pkt = PktWriter::new(Vec::new());
        pkt.write_text("mystery-section").unwrap();
        pkt.flush_pkt().unwrap();
        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        assert!(read_fetch_sections(&mut reader).is_err());
    }
}
