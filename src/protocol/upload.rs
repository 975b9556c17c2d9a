//! Server side of v0/v1 fetch (`upload-pack`).
//!
//! Advertises refs, reads wants (the first carries the client's chosen
//! capabilities), answers deepen requests with shallow advisories, runs
//! the ack rounds, and streams the pack. The ack dialect is
//! `multi_ack_detailed`: every newly-common have is acknowledged with
//! `ACK <id> common`; once any common exists the round also carries
//! `ACK <id> ready`; a round that produced neither ends with `NAK`.

use std::io::{Read, Write};

use ahash::AHashSet;

use crate::monitor::ProgressMonitor;
use crate::object::id::ObjectId;
use crate::object::kind::ObjectKind;
use crate::odb::traits::ObjectReader;
use crate::pack::writer::{PackWriter, WriterConfig};
use crate::wire::pktline::{Frame, PktReader, PktWriter};
use crate::wire::sideband::{SidebandPackSink, SidebandWriter};

use super::advert::Advertisement;
use super::caps::{names, CapabilitySet, AGENT_STRING};
use super::ProtocolError;

/// Capabilities this server implementation offers.
fn server_caps() -> CapabilitySet {
    let mut caps = CapabilitySet::new();
    caps.add(names::MULTI_ACK_DETAILED);
    caps.add(names::SIDE_BAND_64K);
    caps.add(names::SIDE_BAND);
    caps.add(names::THIN_PACK);
    caps.add(names::OFS_DELTA);
    caps.add(names::SHALLOW);
    caps.add(names::NO_PROGRESS);
    caps.add(names::ALLOW_TIP_SHA1_IN_WANT);
    caps.set(names::OBJECT_FORMAT, "sha1");
    caps.set(names::AGENT, AGENT_STRING);
    caps
}

/// Serves one v0 fetch conversation over an established byte stream.
///
/// `refs`/`peeled` are the advertisement (already resolved by the
/// caller); `reader` is a local object-read session.
pub fn serve_upload_pack<R, W, S, M>(
    pkt_in: &mut PktReader<R>,
    pkt_out: &mut PktWriter<W>,
    refs: &[(String, ObjectId)],
    peeled: &[(String, ObjectId)],
    reader: &mut S,
    monitor: &mut M,
) -> Result<(), ProtocolError>
where
    R: Read,
    W: Write,
    S: ObjectReader,
    M: ProgressMonitor,
{
    Advertisement::write(pkt_out, refs, peeled, &server_caps())?;
    pkt_out.flush_io()?;

    // Wants, client shallow lines, and an optional deepen request.
    let mut wants: Vec<ObjectId> = Vec::new();
    let mut client_caps = CapabilitySet::new();
    let mut client_shallow: Vec<ObjectId> = Vec::new();
    let mut deepen: Option<u32> = None;
    loop {
        let frame = match pkt_in.read()? {
            None => return Ok(()), // client hung up after the advert (ls-remote)
            Some(frame) => frame,
        };
        let line = match &frame {
            Frame::Flush => break,
            Frame::Data(payload) => text_of(payload)?,
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    detail: format!("{other:?} in want section"),
                })
            }
        };
        if let Some(rest) = line.strip_prefix("want ") {
            // Only the first want line carries capabilities.
            let (hex, caps_text) = match rest.split_once(' ') {
                Some((hex, caps_text)) if wants.is_empty() => (hex, Some(caps_text)),
                Some((hex, _)) => (hex, None),
                None => (rest, None),
            };
            if let Some(caps_text) = caps_text {
                client_caps = CapabilitySet::parse(caps_text);
            }
            wants.push(parse_id(hex, line)?);
        } else if let Some(rest) = line.strip_prefix("shallow ") {
            client_shallow.push(parse_id(rest, line)?);
        } else if let Some(rest) = line.strip_prefix("deepen ") {
            deepen = Some(rest.parse().map_err(|_| ProtocolError::UnexpectedFrame {
                detail: format!("bad deepen: {line}"),
            })?);
        } else {
            return Err(ProtocolError::UnexpectedFrame {
                detail: format!("{line} in want section"),
            });
        }
    }
    if wants.is_empty() {
        return Ok(());
    }

    // Deepen: compute the new shallow fringe and advise the client.
    let mut pack_shallow: Vec<ObjectId> = Vec::new();
    if let Some(depth) = deepen {
        let fringe = shallow_fringe(reader, &wants, depth)?;
        for id in &fringe {
            pkt_out.write_text(&format!("shallow {id}"))?;
        }
        for id in &client_shallow {
            if !fringe.contains(id) {
                pkt_out.write_text(&format!("unshallow {id}"))?;
            }
        }
        pkt_out.flush_pkt()?;
        pkt_out.flush_io()?;
        pack_shallow = fringe;
    } else {
        pack_shallow.extend(client_shallow.iter().copied());
    }

    // Ack rounds until the client says done.
    let mut common: Vec<ObjectId> = Vec::new();
    let mut sent_ready = false;
    'rounds: loop {
        let mut round_acked = false;
        loop {
            if monitor.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            let frame = pkt_in.read_required()?;
            let line = match &frame {
                Frame::Flush => break,
                Frame::Data(payload) => text_of(payload)?,
                other => {
                    return Err(ProtocolError::UnexpectedFrame {
                        detail: format!("{other:?} during negotiation"),
                    })
                }
            };
            if line == "done" {
                break 'rounds;
            }
            let Some(rest) = line.strip_prefix("have ") else {
                return Err(ProtocolError::UnexpectedFrame {
                    detail: format!("{line} during negotiation"),
                });
            };
            let id = parse_id(rest, line)?;
            if reader.contains(&id)? && !common.contains(&id) {
                common.push(id);
                pkt_out.write_text(&format!("ACK {id} common"))?;
                round_acked = true;
            }
        }
        // End of round (flush): ready once any common exists, else NAK.
        if round_acked && !sent_ready {
            let last = common.last().expect("non-empty after ack");
            pkt_out.write_text(&format!("ACK {last} ready"))?;
            sent_ready = true;
        } else if !round_acked {
            pkt_out.write_text("NAK")?;
        }
        pkt_out.flush_io()?;
    }

    // Final ack precedes the pack.
    match common.last() {
        Some(best) => pkt_out.write_text(&format!("ACK {best}"))?,
        None => pkt_out.write_text("NAK")?,
    }
    pkt_out.flush_io()?;

    // The pack itself.
    let config = WriterConfig {
        thin: client_caps.contains(names::THIN_PACK),
        use_ofs_delta: client_caps.contains(names::OFS_DELTA),
        ..WriterConfig::default()
    };
    let writer = PackWriter::new(config);
    if client_caps.contains(names::SIDE_BAND_64K) || client_caps.contains(names::SIDE_BAND) {
        {
            let mut mux = if client_caps.contains(names::SIDE_BAND_64K) {
                SidebandWriter::new_64k(pkt_out)
            } else {
                SidebandWriter::new_small(pkt_out)
            };
            let mut sink = SidebandPackSink::new(&mut mux);
            writer.write(reader, &wants, &common, &pack_shallow, &mut sink, monitor)?;
        }
        pkt_out.flush_pkt()?;
    } else {
        writer.write(
            reader,
            &wants,
            &common,
            &pack_shallow,
            pkt_out.inner_mut(),
            monitor,
        )?;
    }
    pkt_out.flush_io()?;
    Ok(())
}

/// Commits exactly `depth` levels down from the wants whose parents
/// would be cut off: the new shallow fringe.
fn shallow_fringe<S: ObjectReader>(
    reader: &mut S,
    wants: &[ObjectId],
    depth: u32,
) -> Result<Vec<ObjectId>, ProtocolError> {
    use crate::object::commit::parse_for_walk;

    let mut fringe = Vec::new();
    let mut frontier: Vec<ObjectId> = wants.to_vec();
    let mut seen: AHashSet<ObjectId> = frontier.iter().copied().collect();

    for level in 1..=depth {
        let mut next = Vec::new();
        for id in &frontier {
            let data = reader.read(id)?;
            if data.kind != ObjectKind::Commit {
                continue;
            }
            let (_, parents, _) = parse_for_walk(&data.bytes, id.format()).map_err(|err| {
                ProtocolError::UnexpectedFrame {
                    detail: format!("corrupt commit {id}: {err}"),
                }
            })?;
            if level == depth {
                if !parents.is_empty() {
                    fringe.push(*id);
                }
            } else {
                for parent in parents {
                    if seen.insert(parent) {
                        next.push(parent);
                    }
                }
            }
        }
        frontier = next;
    }
    Ok(fringe)
}

fn parse_id(hex: &str, line: &str) -> Result<ObjectId, ProtocolError> {
    ObjectId::from_hex(hex.trim().as_bytes()).map_err(|_| ProtocolError::UnexpectedFrame {
        detail: format!("bad id in: {line}"),
    })
}

fn text_of(payload: &[u8]) -> Result<&str, ProtocolError> {
    let line = std::str::from_utf8(payload).map_err(|_| ProtocolError::UnexpectedFrame {
        detail: "non-UTF-8 request line".to_owned(),
    })?;
    Ok(line.strip_suffix('\n').unwrap_or(line))
}
