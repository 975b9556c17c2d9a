//! v0 ref advertisement: the first thing a server sends.
//!
//! ```text
//! <id> <refname>\0<capability list>\n
//! <id> <refname>\n
//! <id> <refname>^{}\n            (peeled annotated tag)
//! 0000
//! ```
//!
//! An empty repository advertises the zero id against the pseudo-ref
//! `capabilities^{}` so the capability list still travels.

use crate::object::id::ObjectId;
use crate::wire::pktline::{Frame, PktReader, PktWriter};

use super::caps::CapabilitySet;
use super::ProtocolError;

/// Pseudo-ref used when there is nothing to advertise.
const CAPS_PSEUDO_REF: &str = "capabilities^{}";

/// A parsed v0 advertisement.
#[derive(Clone, Debug, Default)]
pub struct Advertisement {
    /// Advertised refs in server order, `(name, id)`.
    pub refs: Vec<(String, ObjectId)>,
    /// Peeled values for annotated tags, `(name, peeled-id)`.
    pub peeled: Vec<(String, ObjectId)>,
    /// Server capability list from the first line.
    pub caps: CapabilitySet,
}

impl Advertisement {
    /// Looks up an advertised ref by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<ObjectId> {
        self.refs
            .iter()
            .find(|(ref_name, _)| ref_name == name)
            .map(|(_, id)| *id)
    }

    /// True when `id` is one of the advertised tips (peeled included).
    #[must_use]
    pub fn advertises(&self, id: &ObjectId) -> bool {
        self.refs.iter().any(|(_, tip)| tip == id)
            || self.peeled.iter().any(|(_, peeled)| peeled == id)
    }

    /// Reads an advertisement from the wire, up to its flush.
    pub fn read<R: std::io::Read>(pkt: &mut PktReader<R>) -> Result<Self, ProtocolError> {
        let mut advert = Self::default();
        let mut first = true;
        loop {
            match pkt.read_required()? {
                Frame::Flush => return Ok(advert),
                Frame::Data(payload) => {
                    let (line, caps_text) = if first {
                        match payload.iter().position(|&b| b == 0) {
                            Some(nul) => (&payload[..nul], Some(&payload[nul + 1..])),
                            None => (&payload[..], None),
                        }
                    } else {
                        (&payload[..], None)
                    };
                    if first {
                        if let Some(caps_text) = caps_text {
                            let text = String::from_utf8_lossy(caps_text);
                            advert.caps = CapabilitySet::parse(text.trim_end());
                        }
                        first = false;
                    }

                    let line = strip_newline(line);
                    if let Some(message) = line.strip_prefix(b"ERR ") {
                        return Err(ProtocolError::Remote {
                            message: String::from_utf8_lossy(message).into_owned(),
                        });
                    }
                    parse_ref_line(line, &mut advert)?;
                }
                other => {
                    return Err(ProtocolError::UnexpectedFrame {
                        detail: format!("{other:?} inside advertisement"),
                    })
                }
            }
        }
    }

    /// Writes an advertisement for `refs` (already resolved, in order),
    /// ending with a flush.
    pub fn write<W: std::io::Write>(
        pkt: &mut PktWriter<W>,
        refs: &[(String, ObjectId)],
        peeled: &[(String, ObjectId)],
        caps: &CapabilitySet,
    ) -> Result<(), ProtocolError> {
        if refs.is_empty() {
            pkt.write_data(
                format!("{} {CAPS_PSEUDO_REF}\0{caps}\n", ObjectId::ZERO).as_bytes(),
            )?;
        } else {
            for (index, (name, id)) in refs.iter().enumerate() {
                if index == 0 {
                    pkt.write_data(format!("{id} {name}\0{caps}\n").as_bytes())?;
                } else {
                    pkt.write_text(&format!("{id} {name}"))?;
                }
                if let Some((_, peeled_id)) =
                    peeled.iter().find(|(peeled_name, _)| peeled_name == name)
                {
                    pkt.write_text(&format!("{peeled_id} {name}^{{}}"))?;
                }
            }
        }
        pkt.flush_pkt()?;
        Ok(())
    }
}

fn strip_newline(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\n").unwrap_or(line)
}

fn parse_ref_line(line: &[u8], advert: &mut Advertisement) -> Result<(), ProtocolError> {
    let bad = |detail: &str| ProtocolError::UnexpectedFrame {
        detail: detail.to_owned(),
    };
    let space = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| bad("advertisement line missing separator"))?;
    let id = ObjectId::from_hex(&line[..space])
        .map_err(|_| bad("advertisement line with bad id"))?;
    let name = std::str::from_utf8(&line[space + 1..])
        .map_err(|_| bad("advertisement name not UTF-8"))?;

    if name == CAPS_PSEUDO_REF {
        return Ok(()); // empty-repo placeholder
    }
    if let Some(base) = name.strip_suffix("^{}") {
        advert.peeled.push((base.to_owned(), id));
    } else {
        advert.refs.push((name.to_owned(), id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn id(fill: u8) -> ObjectId {
        ObjectId::sha1([fill; 20])
    }

    #[test]
    fn write_then_read_round_trips() {
        let refs = vec![
            ("HEAD".to_owned(), id(1)),
            ("refs/heads/main".to_owned(), id(1)),
            ("refs/tags/v1".to_owned(), id(2)),
        ];
        let peeled = vec![("refs/tags/v1".to_owned(), id(3))];
        let mut caps = CapabilitySet::new();
        caps.add("multi_ack_detailed");
        caps.set("agent", "gitwire/test");

        let mut pkt = PktWriter::new(Vec::new());
        Advertisement::write(&mut pkt, &refs, &peeled, &caps).unwrap();

        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        let advert = Advertisement::read(&mut reader).unwrap();
        assert_eq!(advert.refs, refs);
        assert_eq!(advert.peeled, peeled);
        assert!(advert.caps.contains("multi_ack_detailed"));
        assert_eq!(advert.find("refs/heads/main"), Some(id(1)));
        assert!(advert.advertises(&id(3)));
    }

    #[test]
    fn empty_repo_advertisement() {
        let mut caps = CapabilitySet::new();
        caps.add("report-status");

        let mut pkt = PktWriter::new(Vec::new());
        Advertisement::write(&mut pkt, &[], &[], &caps).unwrap();

        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        let advert = Advertisement::read(&mut reader).unwrap();
        assert!(advert.refs.is_empty());
        assert!(advert.caps.contains("report-status"));
    }

    #[test]
    fn err_line_surfaces_as_remote_error() {
        let mut pkt = PktWriter::new(Vec::new());
        pkt.write_text("ERR access denied").unwrap();
        pkt.flush_pkt().unwrap();

        let mut reader = PktReader::new(Cursor::new(pkt.into_inner()));
        let err = Advertisement::read(&mut reader).unwrap_err();
        assert!(matches!(err, ProtocolError::Remote { message } if message == "access denied"));
    }
}
