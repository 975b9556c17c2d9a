//! Capability sets.
//!
//! Capabilities travel as a space-separated list: bare words
//! (`thin-pack`) or `key=value` pairs (`agent=gitwire/0.1`). The set
//! preserves nothing about order; rendering sorts for determinism.

use std::collections::BTreeMap;
use std::fmt;

/// Well-known capability names.
pub mod names {
    pub const MULTI_ACK: &str = "multi_ack";
    pub const MULTI_ACK_DETAILED: &str = "multi_ack_detailed";
    pub const SIDE_BAND: &str = "side-band";
    pub const SIDE_BAND_64K: &str = "side-band-64k";
    pub const OFS_DELTA: &str = "ofs-delta";
    pub const THIN_PACK: &str = "thin-pack";
    pub const NO_PROGRESS: &str = "no-progress";
    pub const INCLUDE_TAG: &str = "include-tag";
    pub const ALLOW_TIP_SHA1_IN_WANT: &str = "allow-tip-sha1-in-want";
    pub const ALLOW_REACHABLE_SHA1_IN_WANT: &str = "allow-reachable-sha1-in-want";
    pub const SHALLOW: &str = "shallow";
    pub const DEEPEN_SINCE: &str = "deepen-since";
    pub const DEEPEN_NOT: &str = "deepen-not";
    pub const DEEPEN_RELATIVE: &str = "deepen-relative";
    pub const FILTER: &str = "filter";
    pub const OBJECT_FORMAT: &str = "object-format";
    pub const AGENT: &str = "agent";
    pub const SESSION_ID: &str = "session-id";
    pub const REPORT_STATUS: &str = "report-status";
    pub const DELETE_REFS: &str = "delete-refs";
    pub const ATOMIC: &str = "atomic";
    pub const PUSH_OPTIONS: &str = "push-options";
    pub const QUIET: &str = "quiet";
    pub const WAIT_FOR_DONE: &str = "wait-for-done";
    pub const SIDEBAND_ALL: &str = "sideband-all";
    pub const PACKFILE_URIS: &str = "packfile-uris";
}

/// Agent string this library advertises.
pub const AGENT_STRING: &str = concat!("gitwire/", env!("CARGO_PKG_VERSION"));

/// A parsed capability list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    entries: BTreeMap<String, Option<String>>,
}

impl CapabilitySet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a space-separated capability list.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut set = Self::new();
        for word in text.split(' ').filter(|word| !word.is_empty()) {
            match word.split_once('=') {
                Some((key, value)) => set.set(key, value),
                None => set.add(word),
            }
        }
        set
    }

    /// Adds a bare capability.
    pub fn add(&mut self, name: &str) {
        self.entries.insert(name.to_owned(), None);
    }

    /// Adds a valued capability.
    pub fn set(&mut self, name: &str, value: &str) {
        self.entries.insert(name.to_owned(), Some(value.to_owned()));
    }

    /// True when `name` is present (with or without a value).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The value of `name=` if present with a value.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.entries.get(name).and_then(|value| value.as_deref())
    }

    /// True when the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps `name` only when the peer also advertises it; returns
    /// whether it survived.
    pub fn retain_if_peer(&mut self, name: &str, peer: &CapabilitySet) -> bool {
        if peer.contains(name) {
            true
        } else {
            self.entries.remove(name);
            false
        }
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.entries {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match value {
                Some(value) => write!(f, "{name}={value}")?,
                None => f.write_str(name)?,
            }
        }
        Ok(())
    }
}
