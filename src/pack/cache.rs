//! Session-owned cache of inflated delta bases.
//!
//! Delta chains revisit their bases in strict recency order, so a plain
//! LRU keyed by `(pack token, offset)` captures nearly all reuse. The
//! cache belongs to a reader session, never to the shared pack list, so it
//! needs no synchronization and its memory is released with the session.
//!
//! Oversize payloads are not cached; a single huge object would otherwise
//! evict the entire working set.

use std::collections::VecDeque;

use ahash::AHashMap;

use crate::object::kind::ObjectKind;

/// Default cache budget (16 MiB), matching typical delta-base reuse windows.
pub const DEFAULT_CAPACITY_BYTES: usize = 16 * 1024 * 1024;

/// Largest single entry worth caching (1/4 of the budget).
const MAX_ENTRY_FRACTION: usize = 4;

type Key = (u32, u64);

struct Entry {
    kind: ObjectKind,
    bytes: Vec<u8>,
    seq: u64,
}

/// LRU cache of inflated objects keyed by `(pack token, pack offset)`.
pub struct DeltaBaseCache {
    capacity: usize,
    used: usize,
    next_seq: u64,
    map: AHashMap<Key, Entry>,
    recency: VecDeque<(Key, u64)>,
}

impl Default for DeltaBaseCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_BYTES)
    }
}

impl DeltaBaseCache {
    /// Cache with an explicit byte budget.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            next_seq: 0,
            map: AHashMap::new(),
            recency: VecDeque::new(),
        }
    }

    /// Looks up a cached object, refreshing its recency.
    pub fn get(&mut self, pack: u32, offset: u64) -> Option<(ObjectKind, &[u8])> {
        let key = (pack, offset);
        let seq = self.next_seq;
        let entry = self.map.get_mut(&key)?;
        entry.seq = seq;
        self.next_seq += 1;
        self.recency.push_back((key, seq));
        Some((entry.kind, entry.bytes.as_slice()))
    }

    /// Inserts an inflated object, evicting least-recently-used entries
    /// to stay inside the byte budget. Oversize payloads are ignored.
    pub fn put(&mut self, pack: u32, offset: u64, kind: ObjectKind, bytes: Vec<u8>) {
        if bytes.len() > self.capacity / MAX_ENTRY_FRACTION {
            return;
        }
        let key = (pack, offset);
        if let Some(old) = self.map.remove(&key) {
            self.used -= old.bytes.len();
        }

        self.used += bytes.len();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.map.insert(key, Entry { kind, bytes, seq });
        self.recency.push_back((key, seq));

        while self.used > self.capacity {
            let Some((victim, victim_seq)) = self.recency.pop_front() else {
                break;
            };
            // Stale recency records (superseded by a later touch) are skipped.
            let evict = matches!(self.map.get(&victim), Some(entry) if entry.seq == victim_seq);
            if evict {
                if let Some(entry) = self.map.remove(&victim) {
                    self.used -= entry.bytes.len();
                }
            }
        }
    }

    /// Bytes currently held.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Drops every entry, keeping the allocation budget.
    pub fn clear(&mut self) {
        self.map.clear();
        self.recency.clear();
        self.used = 0;
    }
}
