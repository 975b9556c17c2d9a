//! Client side of v0/v1 fetch: want/have negotiation and pack receive.
//!
//! State machine:
//!
//! | State       | Input                  | Action -> next            |
//! |-------------|------------------------|---------------------------|
//! | `Init`      | advertisement (caller) | emit wants -> `Negotiate` |
//! | `Negotiate` | `ACK <id> common`      | record, keep reading      |
//! | `Negotiate` | `ACK <id> ready`       | send `done` -> `Receive`  |
//! | `Negotiate` | `NAK`                  | next have round or `done` |
//! | `Receive`   | pack stream ends       | -> `Done`                 |
//! | any         | `ERR` / fatal sideband | -> `Failed`               |
//!
//! Have rounds come from [`super::negotiate::Negotiator`]; the pack is
//! handed to the caller as a raw byte stream (sideband-demuxed when the
//! capability was negotiated) so the inbound pack indexer owns parsing.

use std::io::{Read, Write};

use crate::monitor::ProgressMonitor;
use crate::object::id::ObjectId;
use crate::odb::traits::ObjectReader;
use crate::wire::pktline::{Frame, PktReader, PktWriter};
use crate::wire::sideband::SidebandReader;

use super::advert::Advertisement;
use super::caps::{names, CapabilitySet, AGENT_STRING};
use super::negotiate::Negotiator;
use super::shallow::{DepthSpec, ShallowUpdate};
use super::ProtocolError;

/// Fetch request options.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Ask for a thin pack (deltas against objects we already have).
    pub thin: bool,
    /// Ask the server to include annotated tags pointing into the pack.
    pub include_tag: bool,
    /// Suppress server progress chatter.
    pub no_progress: bool,
    /// History truncation request.
    pub depth: Option<DepthSpec>,
    /// Commits this client already holds shallow.
    pub client_shallow: Vec<ObjectId>,
    /// Object filter spec (`blob:none`, ...).
    pub filter: Option<String>,
}

/// Result of a completed fetch negotiation.
#[derive(Clone, Debug, Default)]
pub struct FetchResult {
    /// Ids the server acknowledged as common.
    pub common: Vec<ObjectId>,
    /// Shallow fringe changes announced by the server.
    pub shallow: ShallowUpdate,
    /// Capabilities both sides agreed on.
    pub caps: CapabilitySet,
}

/// Runs a v0/v1 fetch over an established connection.
///
/// The caller has already read `advert` (it needs it to choose `wants`).
/// `tips` are the local ref tips used to generate `have`s. The received
/// pack stream is passed to `on_pack`; an empty `wants` list is the
/// caller's error.
#[allow(clippy::too_many_arguments)]
pub fn fetch_v0<R, W, S, M, F>(
    pkt_in: &mut PktReader<R>,
    pkt_out: &mut PktWriter<W>,
    advert: &Advertisement,
    wants: &[ObjectId],
    local: &mut S,
    tips: &[ObjectId],
    options: &FetchOptions,
    monitor: &mut M,
    on_pack: F,
) -> Result<FetchResult, ProtocolError>
where
    R: Read,
    W: Write,
    S: ObjectReader,
    M: ProgressMonitor,
    F: FnOnce(&mut dyn Read) -> Result<(), ProtocolError>,
{
    if wants.is_empty() {
        return Err(ProtocolError::InvalidArgument {
            detail: "empty want list".to_owned(),
        });
    }
    let caps = select_caps(advert, options)?;
    validate_wants(advert, wants)?;

    // Init -> Negotiate: emit wants (capabilities ride the first line).
    for (index, want) in wants.iter().enumerate() {
        if index == 0 {
            pkt_out.write_text(&format!("want {want} {caps}"))?;
        } else {
            pkt_out.write_text(&format!("want {want}"))?;
        }
    }
    for shallow in &options.client_shallow {
        pkt_out.write_text(&format!("shallow {shallow}"))?;
    }
    if let Some(depth) = &options.depth {
        pkt_out.write_text(&depth.to_line())?;
    }
    pkt_out.flush_pkt()?;
    pkt_out.flush_io()?;

    let mut result = FetchResult {
        caps: caps.clone(),
        ..FetchResult::default()
    };

    // A deepen request is answered with shallow advisories before acks.
    if options.depth.is_some() {
        loop {
            match pkt_in.read_required()? {
                Frame::Flush => break,
                Frame::Data(payload) => {
                    let line = text_of(&payload)?;
                    if !result.shallow.apply_line(line)? {
                        return Err(ProtocolError::UnexpectedFrame {
                            detail: format!("{line} inside shallow section"),
                        });
                    }
                }
                other => {
                    return Err(ProtocolError::UnexpectedFrame {
                        detail: format!("{other:?} inside shallow section"),
                    })
                }
            }
        }
    }

    // Negotiate: have rounds against ACK/NAK responses.
    let mut negotiator = Negotiator::new(local, tips)?;
    let mut ready = false;
    loop {
        if monitor.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        let round = negotiator.next_round()?;
        if round.is_empty() {
            break;
        }
        for have in &round {
            pkt_out.write_text(&format!("have {have}"))?;
        }
        pkt_out.flush_pkt()?;
        pkt_out.flush_io()?;

        // Read the server's round response, up to NAK or ready.
        loop {
            let frame = pkt_in.read_required()?;
            let line = match &frame {
                Frame::Data(payload) => text_of(payload)?,
                other => {
                    return Err(ProtocolError::UnexpectedFrame {
                        detail: format!("{other:?} during negotiation"),
                    })
                }
            };
            match parse_ack(line)? {
                Ack::Nak => break,
                Ack::Common(id) => negotiator.record_common(id),
                Ack::Ready(id) => {
                    negotiator.record_common(id);
                    ready = true;
                    break;
                }
                Ack::Final(id) => {
                    // Plain ACK mid-negotiation: single-ack server that
                    // found common; it will send the pack after done.
                    negotiator.record_common(id);
                    ready = true;
                    break;
                }
            }
        }
        if ready || negotiator.exhausted() {
            break;
        }
    }

    // Negotiate -> Receive.
    pkt_out.write_text("done")?;
    pkt_out.flush_io()?;

    // Final ACK (best common) or NAK precedes the pack.
    match pkt_in.read_required()? {
        Frame::Data(payload) => match parse_ack(text_of(&payload)?)? {
            Ack::Final(id) | Ack::Common(id) | Ack::Ready(id) => negotiator.record_common(id),
            Ack::Nak => {}
        },
        other => {
            return Err(ProtocolError::UnexpectedFrame {
                detail: format!("{other:?} where final ACK/NAK expected"),
            })
        }
    }
    result.common = negotiator.common().copied().collect();

    // Receive: the pack, sideband-wrapped when negotiated.
    if caps.contains(names::SIDE_BAND_64K) || caps.contains(names::SIDE_BAND) {
        let mut demux = SidebandReader::new(pkt_in, monitor);
        on_pack(&mut demux)?;
    } else {
        on_pack(pkt_in.inner_mut())?;
    }
    Ok(result)
}

/// Intersects what we want with what the server offers.
fn select_caps(
    advert: &Advertisement,
    options: &FetchOptions,
) -> Result<CapabilitySet, ProtocolError> {
    let server = &advert.caps;
    let mut caps = CapabilitySet::new();
    for name in [
        names::MULTI_ACK_DETAILED,
        names::OFS_DELTA,
    ] {
        if server.contains(name) {
            caps.add(name);
        }
    }
    if server.contains(names::SIDE_BAND_64K) {
        caps.add(names::SIDE_BAND_64K);
    } else if server.contains(names::SIDE_BAND) {
        caps.add(names::SIDE_BAND);
    }
    if options.thin && server.contains(names::THIN_PACK) {
        caps.add(names::THIN_PACK);
    }
    if options.include_tag && server.contains(names::INCLUDE_TAG) {
        caps.add(names::INCLUDE_TAG);
    }
    if options.no_progress && server.contains(names::NO_PROGRESS) {
        caps.add(names::NO_PROGRESS);
    }
    if let Some(depth) = &options.depth {
        let needed = depth.required_capability();
        if !server.contains(needed) {
            return Err(ProtocolError::MissingCapability { name: needed });
        }
        caps.add(names::SHALLOW);
        if needed != names::SHALLOW {
            caps.add(needed);
        }
    }
    if let Some(filter) = &options.filter {
        if !server.contains(names::FILTER) {
            return Err(ProtocolError::MissingCapability {
                name: names::FILTER,
            });
        }
        caps.set(names::FILTER, filter);
    }
    caps.set(names::AGENT, AGENT_STRING);
    Ok(caps)
}

fn validate_wants(advert: &Advertisement, wants: &[ObjectId]) -> Result<(), ProtocolError> {
    let loose_ok = advert.caps.contains(names::ALLOW_TIP_SHA1_IN_WANT)
        || advert.caps.contains(names::ALLOW_REACHABLE_SHA1_IN_WANT);
    for want in wants {
        if !advert.advertises(want) && !loose_ok {
            return Err(ProtocolError::InvalidArgument {
                detail: format!("want {want} is not advertised"),
            });
        }
    }
    Ok(())
}

fn text_of(payload: &[u8]) -> Result<&str, ProtocolError> {
    let line = std::str::from_utf8(payload).map_err(|_| ProtocolError::UnexpectedFrame {
        detail: "non-UTF-8 negotiation line".to_owned(),
    })?;
    Ok(line.strip_suffix('\n').unwrap_or(line))
}

/// Parsed ACK/NAK line.
enum Ack {
    Nak,
    Common(ObjectId),
    Ready(ObjectId),
    Final(ObjectId),
}

fn parse_ack(line: &str) -> Result<Ack, ProtocolError> {
    if line == "NAK" {
        return Ok(Ack::Nak);
    }
    if let Some(message) = line.strip_prefix("ERR ") {
        return Err(ProtocolError::Remote {
            message: message.to_owned(),
        });
    }
    let rest = line
        .strip_prefix("ACK ")
        .ok_or_else(|| ProtocolError::UnexpectedFrame {
            detail: format!("{line} where ACK/NAK expected"),
        })?;
    let (hex, status) = match rest.split_once(' ') {
        Some((hex, status)) => (hex, Some(status)),
        None => (rest, None),
    };
    let id = ObjectId::from_hex(hex.as_bytes()).map_err(|_| ProtocolError::UnexpectedFrame {
        detail: format!("bad id in: {line}"),
    })?;
    match status {
        None => Ok(Ack::Final(id)),
        Some("common") | Some("continue") => Ok(Ack::Common(id)),
        Some("ready") => Ok(Ack::Ready(id)),
        Some(other) => Err(ProtocolError::UnexpectedFrame {
            detail: format!("unknown ACK status {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_lines_parse() {
        let hex = "ce013625030ba8dba906f756967f9e9ca394464a";
        assert!(matches!(parse_ack("NAK").unwrap(), Ack::Nak));
        assert!(matches!(
            parse_ack(&format!("ACK {hex} common")).unwrap(),
            Ack::Common(_)
        ));
        assert!(matches!(
            parse_ack(&format!("ACK {hex} continue")).unwrap(),
            Ack::Common(_)
        ));
        assert!(matches!(
            parse_ack(&format!("ACK {hex} ready")).unwrap(),
            Ack::Ready(_)
        ));
        assert!(matches!(
            parse_ack(&format!("ACK {hex}")).unwrap(),
            Ack::Final(_)
        ));
        assert!(parse_ack("BLAH").is_err());
        assert!(matches!(
            parse_ack("ERR no access"),
            Err(ProtocolError::Remote { .. })
        ));
    }

    #[test]
    fn caps_require_server_support() {
        let mut advert = Advertisement::default();
        advert.caps = CapabilitySet::parse("multi_ack_detailed thin-pack side-band-64k");

        let options = FetchOptions {
            thin: true,
            depth: Some(DepthSpec::Commits(1)),
            ..FetchOptions::default()
        };
        // Depth needs `shallow`, which the server lacks.
        assert!(matches!(
            select_caps(&advert, &options),
            Err(ProtocolError::MissingCapability { name: "shallow" })
        ));

        let options = FetchOptions {
            thin: true,
            ..FetchOptions::default()
        };
        let caps = select_caps(&advert, &options).unwrap();
        assert!(caps.contains(names::THIN_PACK));
        assert!(caps.contains(names::SIDE_BAND_64K));
        assert!(!caps.contains(names::OFS_DELTA));
    }

    #[test]
    fn unadvertised_want_rejected() {
        let mut advert = Advertisement::default();
        advert
            .refs
            .push(("refs/heads/main".to_owned(), ObjectId::sha1([1; 20])));
        assert!(validate_wants(&advert, &[ObjectId::sha1([2; 20])]).is_err());
        assert!(validate_wants(&advert, &[ObjectId::sha1([1; 20])]).is_ok());

        advert.caps = CapabilitySet::parse("allow-reachable-sha1-in-want");
        assert!(validate_wants(&advert, &[ObjectId::sha1([2; 20])]).is_ok());
    }
}
