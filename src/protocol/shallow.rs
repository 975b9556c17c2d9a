//! Shallow/deepen lines shared by the fetch state machines.
//!
//! A client truncating history sends one of `deepen <n>`,
//! `deepen-since <epoch>`, or `deepen-not <ref>`, plus `shallow <id>`
//! lines for commits it already holds shallow. The server answers with
//! `shallow <id>` / `unshallow <id>` advisories describing the new
//! fringe before the pack arrives.

use crate::object::id::ObjectId;

use super::ProtocolError;

/// How deep the client wants history truncated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DepthSpec {
    /// `deepen <n>`: n commits from each want tip.
    Commits(u32),
    /// `deepen-since <epoch>`: commits newer than the cutoff.
    Since(i64),
    /// `deepen-not <ref>`: exclude history reachable from a remote ref.
    Not(String),
}

impl DepthSpec {
    /// The request line for this spec.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Commits(n) => format!("deepen {n}"),
            Self::Since(epoch) => format!("deepen-since {epoch}"),
            Self::Not(name) => format!("deepen-not {name}"),
        }
    }

    /// The capability a server must advertise for this spec.
    #[must_use]
    pub fn required_capability(&self) -> &'static str {
        match self {
            Self::Commits(_) => super::caps::names::SHALLOW,
            Self::Since(_) => super::caps::names::DEEPEN_SINCE,
            Self::Not(_) => super::caps::names::DEEPEN_NOT,
        }
    }
}

/// Server advisories about the shallow fringe after a deepen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShallowUpdate {
    /// Commits that are now shallow (parents hidden).
    pub shallow: Vec<ObjectId>,
    /// Commits whose full history is now present.
    pub unshallow: Vec<ObjectId>,
}

impl ShallowUpdate {
    /// Applies one advisory line; returns false when the line is not a
    /// shallow advisory (the caller handles it in its own state).
    pub fn apply_line(&mut self, line: &str) -> Result<bool, ProtocolError> {
        let bad = |detail: String| ProtocolError::UnexpectedFrame { detail };
        if let Some(rest) = line.strip_prefix("shallow ") {
            let id = ObjectId::from_hex(rest.as_bytes())
                .map_err(|_| bad(format!("bad shallow line: {line}")))?;
            self.shallow.push(id);
            return Ok(true);
        }
        if let Some(rest) = line.strip_prefix("unshallow ") {
            let id = ObjectId::from_hex(rest.as_bytes())
                .map_err(|_| bad(format!("bad unshallow line: {line}")))?;
            self.unshallow.push(id);
            return Ok(true);
        }
        Ok(false)
    }
}
