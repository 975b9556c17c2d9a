//! Pack index writers for the v1 and v2 on-disk formats.
//!
//! Entries must be supplied sorted by id; both writers compute the index
//! SHA-1 trailer and embed the pack checksum so readers can pair the files.
//! v1 cannot represent offsets of 2 GiB or more; the inbound pack indexer
//! picks v2 whenever any offset needs the large-offset table (and defaults
//! to v2 regardless, matching modern Git).

use sha1::{Digest, Sha1};

use crate::object::id::ObjectId;

use super::idx::{FANOUT_SIZE, IDX_MAGIC};

/// Flag bit marking an entry whose real offset lives in the 64-bit table.
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// One object's index record.
#[derive(Clone, Copy, Debug)]
pub struct IndexEntry {
    /// Object id.
    pub id: ObjectId,
    /// Byte offset of the entry header within the pack.
    pub offset: u64,
    /// CRC-32 of the entry's on-disk bytes (header + compressed payload).
    pub crc: u32,
}

/// Largest offset a v1 index (or a v2 small-offset slot) can hold.
pub const SMALL_OFFSET_MAX: u64 = 0x7fff_ffff;

fn fanout_table(entries: &[IndexEntry]) -> [u8; FANOUT_SIZE] {
    let mut counts = [0u32; 256];
    for entry in entries {
        counts[entry.id.first_byte() as usize] += 1;
    }
    let mut table = [0u8; FANOUT_SIZE];
    let mut running = 0u32;
    for (i, count) in counts.iter().enumerate() {
        running += count;
        table[i * 4..i * 4 + 4].copy_from_slice(&running.to_be_bytes());
    }
    table
}

fn debug_assert_sorted(entries: &[IndexEntry]) {
    debug_assert!(
        entries.windows(2).all(|w| w[0].id < w[1].id),
        "index entries must be sorted by id, strictly ascending"
    );
}

/// Serializes a v2 index for `entries` (sorted by id).
#[must_use]
pub fn write_index_v2(entries: &[IndexEntry], pack_checksum: &[u8; 20]) -> Vec<u8> {
    debug_assert_sorted(entries);

    let mut out = Vec::with_capacity(8 + FANOUT_SIZE + entries.len() * 28 + 40);
    out.extend_from_slice(&IDX_MAGIC);
    out.extend_from_slice(&2u32.to_be_bytes());
    out.extend_from_slice(&fanout_table(entries));

    for entry in entries {
        out.extend_from_slice(entry.id.as_slice());
    }
    for entry in entries {
        out.extend_from_slice(&entry.crc.to_be_bytes());
    }

    let mut large = Vec::new();
    for entry in entries {
        if entry.offset > SMALL_OFFSET_MAX {
            let slot = (large.len() / 8) as u32;
            out.extend_from_slice(&(LARGE_OFFSET_FLAG | slot).to_be_bytes());
            large.extend_from_slice(&entry.offset.to_be_bytes());
        } else {
            out.extend_from_slice(&(entry.offset as u32).to_be_bytes());
        }
    }
    out.extend_from_slice(&large);

    out.extend_from_slice(pack_checksum);
    append_trailer(&mut out);
    out
}

/// Serializes a v1 index for `entries` (sorted by id).
///
/// # Panics
/// Panics in debug builds if any offset exceeds [`SMALL_OFFSET_MAX`];
/// callers must select v2 for such packs.
#[must_use]
pub fn write_index_v1(entries: &[IndexEntry], pack_checksum: &[u8; 20]) -> Vec<u8> {
    debug_assert_sorted(entries);
    debug_assert!(
        entries.iter().all(|e| e.offset <= SMALL_OFFSET_MAX),
        "v1 index cannot hold large offsets"
    );

    let mut out = Vec::with_capacity(FANOUT_SIZE + entries.len() * 24 + 40);
    out.extend_from_slice(&fanout_table(entries));
    for entry in entries {
        out.extend_from_slice(&(entry.offset as u32).to_be_bytes());
        out.extend_from_slice(entry.id.as_slice());
    }
    out.extend_from_slice(pack_checksum);
    append_trailer(&mut out);
    out
}

fn append_trailer(out: &mut Vec<u8>) {
    let mut hasher = Sha1::new();
    hasher.update(&out[..]);
    let digest: [u8; 20] = hasher.finalize().into();
    out.extend_from_slice(&digest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::id::ObjectFormat;
    use crate::pack::idx::PackIndex;

    #[test]
    fn v2_round_trips_through_reader() {
        let entries = vec![
            IndexEntry {
                id: ObjectId::sha1([0x01; 20]),
                offset: 12,
                crc: 0xdead_beef,
            },
            IndexEntry {
                id: ObjectId::sha1([0x80; 20]),
                offset: 99,
                crc: 7,
            },
        ];
        let pack_sum = [0x42u8; 20];
        let bytes = write_index_v2(&entries, &pack_sum);
        let idx = PackIndex::from_bytes(bytes, ObjectFormat::Sha1).unwrap();

        assert_eq!(idx.object_count(), 2);
        assert_eq!(idx.pack_checksum(), &pack_sum);
        for entry in &entries {
            let pos = idx.find(&entry.id).unwrap();
            assert_eq!(idx.offset_at(pos).unwrap(), entry.offset);
            assert_eq!(idx.crc_at(pos), Some(entry.crc));
        }
    }

    #[test]
    fn v1_round_trips_through_reader() {
        let entries = vec![IndexEntry {
            id: ObjectId::sha1([0x33; 20]),
            offset: 4000,
            crc: 0,
        }];
        let bytes = write_index_v1(&entries, &[0u8; 20]);
        let idx = PackIndex::from_bytes(bytes, ObjectFormat::Sha1).unwrap();
        let pos = idx.find(&entries[0].id).unwrap();
        assert_eq!(idx.offset_at(pos).unwrap(), 4000);
    }

    #[test]
    fn v2_mixed_offset_sizes() {
        let entries = vec![
            IndexEntry {
                id: ObjectId::sha1([0x01; 20]),
                offset: 5,
                crc: 0,
            },
            IndexEntry {
                id: ObjectId::sha1([0x02; 20]),
                offset: SMALL_OFFSET_MAX + 10,
                crc: 0,
            },
            IndexEntry {
                id: ObjectId::sha1([0x03; 20]),
                offset: SMALL_OFFSET_MAX,
                crc: 0,
            },
        ];
        let bytes = write_index_v2(&entries, &[0u8; 20]);
        let idx = PackIndex::from_bytes(bytes, ObjectFormat::Sha1).unwrap();
        for entry in &entries {
            let pos = idx.find(&entry.id).unwrap();
            assert_eq!(idx.offset_at(pos).unwrap(), entry.offset);
        }
    }
}
