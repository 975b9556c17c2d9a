//! Client side of push (`send-pack`).
//!
//! The client sends `<old-id> <new-id> <refname>` commands (capabilities
//! after a NUL on the first), a flush, then a pack containing everything
//! reachable from the new ids that the server does not already have.
//! With `report-status` the server answers with `unpack ok|<error>` and
//! one `ok <ref>` / `ng <ref> <reason>` per command, sideband-wrapped
//! when negotiated.

use std::io::{Read, Write};

use crate::monitor::ProgressMonitor;
use crate::object::id::ObjectId;
use crate::odb::traits::ObjectReader;
use crate::pack::writer::{PackWriter, WriterConfig};
use crate::wire::pktline::{Frame, PktReader, PktWriter};
use crate::wire::sideband::SidebandReader;

use super::advert::Advertisement;
use super::caps::{names, CapabilitySet, AGENT_STRING};
use super::ProtocolError;

/// One ref change the client requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushCommand {
    /// Value the client believes the server holds (zero id: create).
    pub old: ObjectId,
    /// Requested value (zero id: delete).
    pub new: ObjectId,
    /// Full ref name.
    pub name: String,
}

impl PushCommand {
    /// The wire form of this command.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.old, self.new, self.name)
    }
}

/// Push options.
#[derive(Clone, Debug, Default)]
pub struct PushOptions {
    /// All-or-nothing ref updates on the server.
    pub atomic: bool,
    /// Produce a thin pack against the server's advertised tips.
    pub thin: bool,
}

/// Parsed `report-status` response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Whether the server indexed the pack (`unpack ok`).
    pub unpack_ok: bool,
    /// Unpack failure detail when not ok.
    pub unpack_error: Option<String>,
    /// Per-ref results, `(name, Err(reason) on ng)`.
    pub ref_status: Vec<(String, Result<(), String>)>,
}

impl PushOutcome {
    /// True when the pack unpacked and every ref updated.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.unpack_ok && self.ref_status.iter().all(|(_, status)| status.is_ok())
    }
}

/// Runs one push conversation over an established connection.
pub fn push_v0<R, W, S, M>(
    pkt_in: &mut PktReader<R>,
    pkt_out: &mut PktWriter<W>,
    reader: &mut S,
    commands: &[PushCommand],
    options: &PushOptions,
    monitor: &mut M,
) -> Result<PushOutcome, ProtocolError>
where
    R: Read,
    W: Write,
    S: ObjectReader,
    M: ProgressMonitor,
{
    if commands.is_empty() {
        return Err(ProtocolError::InvalidArgument {
            detail: "empty push command list".to_owned(),
        });
    }

    let advert = Advertisement::read(pkt_in)?;
    let server = &advert.caps;
    if !server.contains(names::REPORT_STATUS) {
        return Err(ProtocolError::MissingCapability {
            name: names::REPORT_STATUS,
        });
    }
    if options.atomic && !server.contains(names::ATOMIC) {
        return Err(ProtocolError::MissingCapability {
            name: names::ATOMIC,
        });
    }
    if commands.iter().any(|command| command.new.is_zero())
        && !server.contains(names::DELETE_REFS)
    {
        return Err(ProtocolError::MissingCapability {
            name: names::DELETE_REFS,
        });
    }

    let mut caps = CapabilitySet::new();
    caps.add(names::REPORT_STATUS);
    if options.atomic {
        caps.add(names::ATOMIC);
    }
    if server.contains(names::SIDE_BAND_64K) {
        caps.add(names::SIDE_BAND_64K);
    }
    if server.contains(names::OFS_DELTA) {
        caps.add(names::OFS_DELTA);
    }
    caps.set(names::AGENT, AGENT_STRING);

    for (index, command) in commands.iter().enumerate() {
        if index == 0 {
            pkt_out.write_data(format!("{}\0{caps}\n", command.to_line()).as_bytes())?;
        } else {
            pkt_out.write_text(&command.to_line())?;
        }
    }
    pkt_out.flush_pkt()?;

    // Deletions-only pushes carry no pack.
    let wants: Vec<ObjectId> = commands
        .iter()
        .filter(|command| !command.new.is_zero())
        .map(|command| command.new)
        .collect();
    if !wants.is_empty() {
        let haves: Vec<ObjectId> = advert.refs.iter().map(|(_, id)| *id).collect();
        let config = WriterConfig {
            thin: options.thin,
            use_ofs_delta: caps.contains(names::OFS_DELTA),
            ..WriterConfig::default()
        };
        PackWriter::new(config).write(
            reader,
            &wants,
            &haves,
            &[],
            pkt_out.inner_mut(),
            monitor,
        )?;
    }
    pkt_out.flush_io()?;

    // report-status, possibly wrapped in sideband frames.
    if caps.contains(names::SIDE_BAND_64K) {
        let mut demux = SidebandReader::new(pkt_in, monitor);
        let mut inner = PktReader::new(&mut demux);
        read_report(&mut inner)
    } else {
        read_report(pkt_in)
    }
}

fn read_report<R: Read>(pkt: &mut PktReader<R>) -> Result<PushOutcome, ProtocolError> {
    let mut outcome = PushOutcome::default();
    let mut saw_unpack = false;
    loop {
        let frame = match pkt.read()? {
            None => break,
            Some(frame) => frame,
        };
        let line = match &frame {
            Frame::Flush => break,
            Frame::Data(payload) => {
                let line =
                    std::str::from_utf8(payload).map_err(|_| ProtocolError::UnexpectedFrame {
                        detail: "non-UTF-8 report line".to_owned(),
                    })?;
                line.strip_suffix('\n').unwrap_or(line)
            }
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    detail: format!("{other:?} inside report-status"),
                })
            }
        };
        if let Some(rest) = line.strip_prefix("unpack ") {
            saw_unpack = true;
            if rest == "ok" {
                outcome.unpack_ok = true;
            } else {
                outcome.unpack_error = Some(rest.to_owned());
            }
        } else if let Some(rest) = line.strip_prefix("ok ") {
            outcome.ref_status.push((rest.to_owned(), Ok(())));
        } else if let Some(rest) = line.strip_prefix("ng ") {
            let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
            outcome
                .ref_status
                .push((name.to_owned(), Err(reason.to_owned())));
        } else {
            return Err(ProtocolError::UnexpectedFrame {
                detail: format!("{line} inside report-status"),
            });
        }
    }
    if !saw_unpack {
        return Err(ProtocolError::UnexpectedFrame {
            detail: "report-status missing unpack line".to_owned(),
        });
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn report_parses_ok_and_ng() {
        let mut pkt = PktWriter::new(Vec::new());
        pkt.write_text("unpack ok").unwrap();
        pkt.write_text("ok refs/heads/main").unwrap();
        pkt.write_text("ng refs/heads/locked failed to lock").unwrap();
        pkt.flush_pkt().unwrap();

        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        let outcome = read_report(&mut reader).unwrap();
        assert!(outcome.unpack_ok);
        assert!(!outcome.all_ok());
        assert_eq!(outcome.ref_status[0].0, "refs/heads/main");
        assert!(outcome.ref_status[0].1.is_ok());
        assert_eq!(
            outcome.ref_status[1],
            (
                "refs/heads/locked".to_owned(),
                Err("failed to lock".to_owned())
            )
        );
    }

    #[test]
    fn report_requires_unpack_line() {
        let mut pkt = PktWriter::new(Vec::new());
        pkt.write_text("ok refs/heads/main").unwrap();
        pkt.flush_pkt().unwrap();
        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        assert!(read_report(&mut reader).is_err());
    }

    #[test]
    fn unpack_error_captured() {
        let mut pkt = PktWriter::new(Vec::new());
        pkt.write_text("unpack index-pack failed").unwrap();
        pkt.flush_pkt().unwrap();
        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        let outcome = read_report(&mut reader).unwrap();
        assert!(!outcome.unpack_ok);
        assert_eq!(outcome.unpack_error.as_deref(), Some("index-pack failed"));
    }
}
