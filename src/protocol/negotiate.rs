//! Have-candidate selection for fetch negotiation.
//!
//! The negotiator feeds `have` lines from the local commit graph in
//! commit-time order (newest first), the order most likely to hit the
//! server's history early. Rounds double from [`INITIAL_ROUND`] up to
//! [`ROUND_CAP`]; after [`MAX_HAVES`] total the client gives up finding
//! more common history and sends `done`.

use ahash::AHashSet;

use crate::object::id::ObjectId;
use crate::odb::traits::ObjectReader;
use crate::revwalk::walk::{RevWalk, WalkError};

/// First round size.
pub const INITIAL_ROUND: usize = 32;
/// Largest round size.
pub const ROUND_CAP: usize = 256;
/// Total haves before the client cuts over to `done`.
pub const MAX_HAVES: usize = 256;

/// Iterator over have candidates with doubling round sizes.
pub struct Negotiator<'a, R: ObjectReader> {
    walk: RevWalk<'a, R>,
    round: usize,
    sent: usize,
    common: AHashSet<ObjectId>,
}

impl<'a, R: ObjectReader> Negotiator<'a, R> {
    /// Negotiator walking back from the local ref tips.
    pub fn new(reader: &'a mut R, tips: &[ObjectId]) -> Result<Self, WalkError> {
        let mut walk = RevWalk::new(reader);
        for tip in tips {
            match walk.mark_start(*tip) {
                Ok(()) => {}
                // A tip pointing at a missing or non-commit object still
                // lets the rest negotiate.
                Err(WalkError::Missing { .. } | WalkError::NotACommit { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(Self {
            walk,
            round: INITIAL_ROUND,
            sent: 0,
            common: AHashSet::new(),
        })
    }

    /// The next round of have candidates; empty when exhausted.
    pub fn next_round(&mut self) -> Result<Vec<ObjectId>, WalkError> {
        let mut batch = Vec::with_capacity(self.round);
        while batch.len() < self.round {
            if self.sent + batch.len() >= MAX_HAVES {
                break;
            }
            match self.walk.next()? {
                Some(commit) => batch.push(commit.id),
                None => break,
            }
        }
        self.sent += batch.len();
        self.round = (self.round * 2).min(ROUND_CAP);
        Ok(batch)
    }

    /// Records a server `ACK <id> common`.
    pub fn record_common(&mut self, id: ObjectId) {
        self.common.insert(id);
    }

    /// Ids the server acknowledged as common.
    #[must_use]
    pub fn common(&self) -> impl Iterator<Item = &ObjectId> {
        self.common.iter()
    }

    /// True once the client should stop offering haves.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.sent >= MAX_HAVES
    }

    /// Total haves offered so far.
    #[must_use]
    pub fn sent(&self) -> usize {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::commit::Commit;
    use crate::object::id::AbbrevId;
    use crate::object::ident::PersonIdent;
    use crate::object::kind::ObjectKind;
    use crate::odb::traits::ObjectData;
    use crate::odb::OdbError;
    use crate::raw::hashing::hash_object;
    use ahash::AHashMap;

    #[derive(Default)]
    struct MemReader {
        objects: AHashMap<ObjectId, Vec<u8>>,
    }

    impl ObjectReader for MemReader {
        fn contains(&mut self, id: &ObjectId) -> Result<bool, OdbError> {
            Ok(self.objects.contains_key(id))
        }

        fn read(&mut self, id: &ObjectId) -> Result<ObjectData, OdbError> {
            match self.objects.get(id) {
                Some(bytes) => Ok(ObjectData {
                    kind: ObjectKind::Commit,
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

    fn chain(reader: &mut MemReader, n: usize) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = Vec::new();
        for i in 0..n {
            let commit = Commit {
                tree: ObjectId::sha1([0xcc; 20]),
                parents: ids.last().copied().into_iter().collect(),
                author: PersonIdent::new("n", "n@e", 1000 + i as i64, 0),
                committer: PersonIdent::new("n", "n@e", 1000 + i as i64, 0),
                encoding: None,
                gpgsig: None,
                extra_headers: Vec::new(),
                message: vec![b'm'],
            };
            let payload = commit.to_payload();
            let id = hash_object(ObjectKind::Commit, &payload);
            reader.objects.insert(id, payload);
            ids.push(id);
        }
        ids
    }

    #[test]
    fn rounds_double_until_cap() {
        let mut reader = MemReader::default();
        let ids = chain(&mut reader, 300);
        let mut negotiator = Negotiator::new(&mut reader, &[*ids.last().unwrap()]).unwrap();

        let first = negotiator.next_round().unwrap();
        assert_eq!(first.len(), 32);
        // Newest first.
        assert_eq!(first[0], ids[299]);

        let second = negotiator.next_round().unwrap();
        assert_eq!(second.len(), 64);

        let third = negotiator.next_round().unwrap();
        // 32 + 64 sent; capped at MAX_HAVES total.
        assert_eq!(third.len(), MAX_HAVES - 96);
        assert!(negotiator.exhausted());
        assert!(negotiator.next_round().unwrap().is_empty());
    }

    #[test]
    fn short_history_exhausts_naturally() {
        let mut reader = MemReader::default();
        let ids = chain(&mut reader, 5);
        let mut negotiator = Negotiator::new(&mut reader, &[*ids.last().unwrap()]).unwrap();
        let round = negotiator.next_round().unwrap();
        assert_eq!(round.len(), 5);
        assert!(negotiator.next_round().unwrap().is_empty());
        assert!(!negotiator.exhausted());
    }

    #[test]
    fn missing_tips_are_skipped() {
        let mut reader = MemReader::default();
        let negotiator = Negotiator::new(&mut reader, &[ObjectId::sha1([1; 20])]);
        assert!(negotiator.unwrap().common.is_empty());
    }
}
