//! Sliding-window fingerprint index over a delta source buffer.
//!
//! The index fingerprints every 16-byte block of the source with a 32-bit
//! Rabin polynomial hash and stores `(hash, offset)` pairs in an open-address
//! table whose entries for the same slot are packed adjacently, so a probe
//! walks one contiguous run and stops when the slot changes. Chains are
//! truncated at [`MAX_CHAIN_LENGTH`] while building, which bounds encode
//! time at `O(|src| + |dst|)` regardless of how repetitive the source is.
//!
//! # Hash function
//! The byte tables `T` and `U` are the fixed constants of the pack
//! format's block fingerprint, carried verbatim so blocks hash exactly as
//! upstream Git hashes them and the packs this encoder emits stay
//! bit-identical. The accumulator stays below 2^31: `T[i]` carries bit 31
//! exactly when `i` is odd, so every fold clears the top bit and the next
//! `hash >> 23` index is always in range. A block hash bootstraps from a
//! big-endian decode of the first four bytes plus one `T[hash >> 31]`
//! correction, followed by twelve table steps; the one-step roll cancels
//! the outgoing byte through `U` before shifting the incoming byte in.
//! Both tables are GF(2)-linear (`T[a ^ b] == T[a] ^ T[b]`), which is what
//! makes the rolled hash agree with a fresh block hash; the tests pin
//! that law and the table contents.

/// Fingerprint window size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Maximum number of same-slot entries retained while indexing.
pub const MAX_CHAIN_LENGTH: usize = 64;

static T: [u32; 256] = [
    0x0000_0000, 0xd4c6_b32d, 0x7d4b_d577, 0xa98d_665a,
    0x2e51_19c3, 0xfa97_aaee, 0x531a_ccb4, 0x87dc_7f99,
    0x5ca2_3386, 0x8864_80ab, 0x21e9_e6f1, 0xf52f_55dc,
    0x72f3_2a45, 0xa635_9968, 0x0fb8_ff32, 0xdb7e_4c1f,
    0x6d82_d421, 0xb944_670c, 0x10c9_0156, 0xc40f_b27b,
    0x43d3_cde2, 0x9715_7ecf, 0x3e98_1895, 0xea5e_abb8,
    0x3120_e7a7, 0xe5e6_548a, 0x4c6b_32d0, 0x98ad_81fd,
    0x1f71_fe64, 0xcbb7_4d49, 0x623a_2b13, 0xb6fc_983e,
    0x0fc3_1b6f, 0xdb05_a842, 0x7288_ce18, 0xa64e_7d35,
    0x2192_02ac, 0xf554_b181, 0x5cd9_d7db, 0x881f_64f6,
    0x5361_28e9, 0x87a7_9bc4, 0x2e2a_fd9e, 0xfaec_4eb3,
    0x7d30_312a, 0xa9f6_8207, 0x007b_e45d, 0xd4bd_5770,
    0x6241_cf4e, 0xb687_7c63, 0x1f0a_1a39, 0xcbcc_a914,
    0x4c10_d68d, 0x98d6_65a0, 0x315b_03fa, 0xe59d_b0d7,
    0x3ee3_fcc8, 0xea25_4fe5, 0x43a8_29bf, 0x976e_9a92,
    0x10b2_e50b, 0xc474_5626, 0x6df9_307c, 0xb93f_8351,
    0x1f86_36de, 0xcb40_85f3, 0x62cd_e3a9, 0xb60b_5084,
    0x31d7_2f1d, 0xe511_9c30, 0x4c9c_fa6a, 0x985a_4947,
    0x4324_0558, 0x97e2_b675, 0x3e6f_d02f, 0xeaa9_6302,
    0x6d75_1c9b, 0xb9b3_afb6, 0x103e_c9ec, 0xc4f8_7ac1,
    0x7204_e2ff, 0xa6c2_51d2, 0x0f4f_3788, 0xdb89_84a5,
    0x5c55_fb3c, 0x8893_4811, 0x211e_2e4b, 0xf5d8_9d66,
    0x2ea6_d179, 0xfa60_6254, 0x53ed_040e, 0x872b_b723,
    0x00f7_c8ba, 0xd431_7b97, 0x7dbc_1dcd, 0xa97a_aee0,
    0x1045_2db1, 0xc483_9e9c, 0x6d0e_f8c6, 0xb9c8_4beb,
    0x3e14_3472, 0xead2_875f, 0x435f_e105, 0x9799_5228,
    0x4ce7_1e37, 0x9821_ad1a, 0x31ac_cb40, 0xe56a_786d,
    0x62b6_07f4, 0xb670_b4d9, 0x1ffd_d283, 0xcb3b_61ae,
    0x7dc7_f990, 0xa901_4abd, 0x008c_2ce7, 0xd44a_9fca,
    0x5396_e053, 0x8750_537e, 0x2edd_3524, 0xfa1b_8609,
    0x2165_ca16, 0xf5a3_793b, 0x5c2e_1f61, 0x88e8_ac4c,
    0x0f34_d3d5, 0xdbf2_60f8, 0x727f_06a2, 0xa6b9_b58f,
    0x3f0c_6dbc, 0xebca_de91, 0x4247_b8cb, 0x9681_0be6,
    0x115d_747f, 0xc59b_c752, 0x6c16_a108, 0xb8d0_1225,
    0x63ae_5e3a, 0xb768_ed17, 0x1ee5_8b4d, 0xca23_3860,
    0x4dff_47f9, 0x9939_f4d4, 0x30b4_928e, 0xe472_21a3,
    0x528e_b99d, 0x8648_0ab0, 0x2fc5_6cea, 0xfb03_dfc7,
    0x7cdf_a05e, 0xa819_1373, 0x0194_7529, 0xd552_c604,
    0x0e2c_8a1b, 0xdaea_3936, 0x7367_5f6c, 0xa7a1_ec41,
    0x207d_93d8, 0xf4bb_20f5, 0x5d36_46af, 0x89f0_f582,
    0x30cf_76d3, 0xe409_c5fe, 0x4d84_a3a4, 0x9942_1089,
    0x1e9e_6f10, 0xca58_dc3d, 0x63d5_ba67, 0xb713_094a,
    0x6c6d_4555, 0xb8ab_f678, 0x1126_9022, 0xc5e0_230f,
    0x423c_5c96, 0x96fa_efbb, 0x3f77_89e1, 0xebb1_3acc,
    0x5d4d_a2f2, 0x898b_11df, 0x2006_7785, 0xf4c0_c4a8,
    0x731c_bb31, 0xa7da_081c, 0x0e57_6e46, 0xda91_dd6b,
    0x01ef_9174, 0xd529_2259, 0x7ca4_4403, 0xa862_f72e,
    0x2fbe_88b7, 0xfb78_3b9a, 0x52f5_5dc0, 0x8633_eeed,
    0x208a_5b62, 0xf44c_e84f, 0x5dc1_8e15, 0x8907_3d38,
    0x0edb_42a1, 0xda1d_f18c, 0x7390_97d6, 0xa756_24fb,
    0x7c28_68e4, 0xa8ee_dbc9, 0x0163_bd93, 0xd5a5_0ebe,
    0x5279_7127, 0x86bf_c20a, 0x2f32_a450, 0xfbf4_177d,
    0x4d08_8f43, 0x99ce_3c6e, 0x3043_5a34, 0xe485_e919,
    0x6359_9680, 0xb79f_25ad, 0x1e12_43f7, 0xcad4_f0da,
    0x11aa_bcc5, 0xc56c_0fe8, 0x6ce1_69b2, 0xb827_da9f,
    0x3ffb_a506, 0xeb3d_162b, 0x42b0_7071, 0x9676_c35c,
    0x2f49_400d, 0xfb8f_f320, 0x5202_957a, 0x86c4_2657,
    0x0118_59ce, 0xd5de_eae3, 0x7c53_8cb9, 0xa895_3f94,
    0x73eb_738b, 0xa72d_c0a6, 0x0ea0_a6fc, 0xda66_15d1,
    0x5dba_6a48, 0x897c_d965, 0x20f1_bf3f, 0xf437_0c12,
    0x42cb_942c, 0x960d_2701, 0x3f80_415b, 0xeb46_f276,
    0x6c9a_8def, 0xb85c_3ec2, 0x11d1_5898, 0xc517_ebb5,
    0x1e69_a7aa, 0xcaaf_1487, 0x6322_72dd, 0xb7e4_c1f0,
    0x3038_be69, 0xe4fe_0d44, 0x4d73_6b1e, 0x99b5_d833,
];

static U: [u32; 256] = [
    0x0000_0000, 0x12c6_e90f, 0x258d_d21e, 0x374b_3b11,
    0x4b1b_a43c, 0x59dd_4d33, 0x6e96_7622, 0x7c50_9f2d,
    0x42f1_fb55, 0x5037_125a, 0x677c_294b, 0x75ba_c044,
    0x09ea_5f69, 0x1b2c_b666, 0x2c67_8d77, 0x3ea1_6478,
    0x5125_4587, 0x43e3_ac88, 0x74a8_9799, 0x666e_7e96,
    0x1a3e_e1bb, 0x08f8_08b4, 0x3fb3_33a5, 0x2d75_daaa,
    0x13d4_bed2, 0x0112_57dd, 0x3659_6ccc, 0x249f_85c3,
    0x58cf_1aee, 0x4a09_f3e1, 0x7d42_c8f0, 0x6f84_21ff,
    0x768c_3823, 0x644a_d12c, 0x5301_ea3d, 0x41c7_0332,
    0x3d97_9c1f, 0x2f51_7510, 0x181a_4e01, 0x0adc_a70e,
    0x347d_c376, 0x26bb_2a79, 0x11f0_1168, 0x0336_f867,
    0x7f66_674a, 0x6da0_8e45, 0x5aeb_b554, 0x482d_5c5b,
    0x27a9_7da4, 0x356f_94ab, 0x0224_afba, 0x10e2_46b5,
    0x6cb2_d998, 0x7e74_3097, 0x493f_0b86, 0x5bf9_e289,
    0x6558_86f1, 0x779e_6ffe, 0x40d5_54ef, 0x5213_bde0,
    0x2e43_22cd, 0x3c85_cbc2, 0x0bce_f0d3, 0x1908_19dc,
    0x39de_c36b, 0x2b18_2a64, 0x1c53_1175, 0x0e95_f87a,
    0x72c5_6757, 0x6003_8e58, 0x5748_b549, 0x458e_5c46,
    0x7b2f_383e, 0x69e9_d131, 0x5ea2_ea20, 0x4c64_032f,
    0x3034_9c02, 0x22f2_750d, 0x15b9_4e1c, 0x077f_a713,
    0x68fb_86ec, 0x7a3d_6fe3, 0x4d76_54f2, 0x5fb0_bdfd,
    0x23e0_22d0, 0x3126_cbdf, 0x066d_f0ce, 0x14ab_19c1,
    0x2a0a_7db9, 0x38cc_94b6, 0x0f87_afa7, 0x1d41_46a8,
    0x6111_d985, 0x73d7_308a, 0x449c_0b9b, 0x565a_e294,
    0x4f52_fb48, 0x5d94_1247, 0x6adf_2956, 0x7819_c059,
    0x0449_5f74, 0x168f_b67b, 0x21c4_8d6a, 0x3302_6465,
    0x0da3_001d, 0x1f65_e912, 0x282e_d203, 0x3ae8_3b0c,
    0x46b8_a421, 0x547e_4d2e, 0x6335_763f, 0x71f3_9f30,
    0x1e77_becf, 0x0cb1_57c0, 0x3bfa_6cd1, 0x293c_85de,
    0x556c_1af3, 0x47aa_f3fc, 0x70e1_c8ed, 0x6227_21e2,
    0x5c86_459a, 0x4e40_ac95, 0x790b_9784, 0x6bcd_7e8b,
    0x179d_e1a6, 0x055b_08a9, 0x3210_33b8, 0x20d6_dab7,
    0x73bd_86d6, 0x617b_6fd9, 0x5630_54c8, 0x44f6_bdc7,
    0x38a6_22ea, 0x2a60_cbe5, 0x1d2b_f0f4, 0x0fed_19fb,
    0x314c_7d83, 0x238a_948c, 0x14c1_af9d, 0x0607_4692,
    0x7a57_d9bf, 0x6891_30b0, 0x5fda_0ba1, 0x4d1c_e2ae,
    0x2298_c351, 0x305e_2a5e, 0x0715_114f, 0x15d3_f840,
    0x6983_676d, 0x7b45_8e62, 0x4c0e_b573, 0x5ec8_5c7c,
    0x6069_3804, 0x72af_d10b, 0x45e4_ea1a, 0x5722_0315,
    0x2b72_9c38, 0x39b4_7537, 0x0eff_4e26, 0x1c39_a729,
    0x0531_bef5, 0x17f7_57fa, 0x20bc_6ceb, 0x327a_85e4,
    0x4e2a_1ac9, 0x5cec_f3c6, 0x6ba7_c8d7, 0x7961_21d8,
    0x47c0_45a0, 0x5506_acaf, 0x624d_97be, 0x708b_7eb1,
    0x0cdb_e19c, 0x1e1d_0893, 0x2956_3382, 0x3b90_da8d,
    0x5414_fb72, 0x46d2_127d, 0x7199_296c, 0x635f_c063,
    0x1f0f_5f4e, 0x0dc9_b641, 0x3a82_8d50, 0x2844_645f,
    0x16e5_0027, 0x0423_e928, 0x3368_d239, 0x21ae_3b36,
    0x5dfe_a41b, 0x4f38_4d14, 0x7873_7605, 0x6ab5_9f0a,
    0x4a63_45bd, 0x58a5_acb2, 0x6fee_97a3, 0x7d28_7eac,
    0x0178_e181, 0x13be_088e, 0x24f5_339f, 0x3633_da90,
    0x0892_bee8, 0x1a54_57e7, 0x2d1f_6cf6, 0x3fd9_85f9,
    0x4389_1ad4, 0x514f_f3db, 0x6604_c8ca, 0x74c2_21c5,
    0x1b46_003a, 0x0980_e935, 0x3ecb_d224, 0x2c0d_3b2b,
    0x505d_a406, 0x429b_4d09, 0x75d0_7618, 0x6716_9f17,
    0x59b7_fb6f, 0x4b71_1260, 0x7c3a_2971, 0x6efc_c07e,
    0x12ac_5f53, 0x006a_b65c, 0x3721_8d4d, 0x25e7_6442,
    0x3cef_7d9e, 0x2e29_9491, 0x1962_af80, 0x0ba4_468f,
    0x77f4_d9a2, 0x6532_30ad, 0x5279_0bbc, 0x40bf_e2b3,
    0x7e1e_86cb, 0x6cd8_6fc4, 0x5b93_54d5, 0x4955_bdda,
    0x3505_22f7, 0x27c3_cbf8, 0x1088_f0e9, 0x024e_19e6,
    0x6dca_3819, 0x7f0c_d116, 0x4847_ea07, 0x5a81_0308,
    0x26d1_9c25, 0x3417_752a, 0x035c_4e3b, 0x119a_a734,
    0x2f3b_c34c, 0x3dfd_2a43, 0x0ab6_1152, 0x1870_f85d,
    0x6420_6770, 0x76e6_8e7f, 0x41ad_b56e, 0x536b_5c61,
];

/// Appends one byte to a fingerprint accumulator.
#[inline]
fn push(hash: u32, byte: u8) -> u32 {
    ((hash << 8) | byte as u32) ^ T[(hash >> 23) as usize]
}

/// Fingerprints a full 16-byte block.
#[inline]
pub(crate) fn hash_block(block: &[u8]) -> u32 {
    debug_assert!(block.len() >= BLOCK_SIZE);
    // The first four steps collapse into a big-endian decode plus one
    // correction that brings the accumulator below 2^31.
    let mut hash = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    hash ^= T[(hash >> 31) as usize];
    hash = push(hash, block[4]);
    hash = push(hash, block[5]);
    hash = push(hash, block[6]);
    hash = push(hash, block[7]);
    hash = push(hash, block[8]);
    hash = push(hash, block[9]);
    hash = push(hash, block[10]);
    hash = push(hash, block[11]);
    hash = push(hash, block[12]);
    hash = push(hash, block[13]);
    hash = push(hash, block[14]);
    hash = push(hash, block[15]);
    hash
}

/// Advances a window fingerprint by one byte.
#[inline]
pub(crate) fn roll(hash: u32, removed: u8, added: u8) -> u32 {
    push(hash ^ U[removed as usize], added)
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    hash: u32,
    offset: u32,
}

/// Fingerprint index over a source buffer.
///
/// # Invariants
/// - `buckets.len()` is a power of two.
/// - `bounds[s]..bounds[s+1]` delimits slot `s`'s entries in `entries`.
/// - Every stored offset is block-aligned and `offset + 16 <= src.len()`.
#[derive(Debug)]
pub struct DeltaIndex<'a> {
    src: &'a [u8],
    mask: u32,
    bounds: Vec<u32>,
    entries: Vec<Entry>,
}

impl<'a> DeltaIndex<'a> {
    /// Indexes `src`. Sources shorter than one block produce an empty
    /// index; encoding against them degenerates to inserts.
    #[must_use]
    pub fn new(src: &'a [u8]) -> Self {
        let blocks = src.len() / BLOCK_SIZE;
        let buckets = table_size(blocks);
        let mask = (buckets - 1) as u32;

        // Pass 1: count per-slot entries, capping each chain.
        let mut counts = vec![0u32; buckets];
        let mut hashes = Vec::with_capacity(blocks);
        for block_idx in 0..blocks {
            let offset = block_idx * BLOCK_SIZE;
            let hash = hash_block(&src[offset..]);
            hashes.push(hash);
            let slot = (hash & mask) as usize;
            if (counts[slot] as usize) < MAX_CHAIN_LENGTH {
                counts[slot] += 1;
            }
        }

        // Pass 2: prefix sums delimit slots; place entries grouped by slot,
        // keeping the earliest offsets when a chain overflows so matches
        // bias toward short back-references.
        let mut bounds = vec![0u32; buckets + 1];
        for slot in 0..buckets {
            bounds[slot + 1] = bounds[slot] + counts[slot];
        }
        let mut cursor = bounds[..buckets].to_vec();
        let mut entries = vec![
            Entry { hash: 0, offset: 0 };
            bounds[buckets] as usize
        ];
        for (block_idx, &hash) in hashes.iter().enumerate() {
            let slot = (hash & mask) as usize;
            if cursor[slot] < bounds[slot + 1] {
                entries[cursor[slot] as usize] = Entry {
                    hash,
                    offset: (block_idx * BLOCK_SIZE) as u32,
                };
                cursor[slot] += 1;
            }
        }

        Self {
            src,
            mask,
            bounds,
            entries,
        }
    }

    /// The indexed source buffer.
    #[inline]
    #[must_use]
    pub fn source(&self) -> &'a [u8] {
        self.src
    }

    /// Calls `visit` with each candidate source offset whose block hash
    /// equals `hash`, earliest offsets first. Returns after at most
    /// [`MAX_CHAIN_LENGTH`] candidates.
    #[inline]
    pub(crate) fn for_each_candidate(&self, hash: u32, mut visit: impl FnMut(usize)) {
        let slot = (hash & self.mask) as usize;
        let start = self.bounds[slot] as usize;
        let end = self.bounds[slot + 1] as usize;
        for entry in &self.entries[start..end] {
            if entry.hash == hash {
                visit(entry.offset as usize);
            }
        }
    }
}

/// Power-of-two table size with load factor <= 1/2, minimum 16 slots.
fn table_size(blocks: usize) -> usize {
    let wanted = blocks.saturating_mul(2).max(16);
    wanted.next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_matches_fresh_hash() {
        let data: Vec<u8> = (0u16..200).map(|i| (i * 31 % 251) as u8).collect();
        let mut hash = hash_block(&data[..BLOCK_SIZE]);
        for start in 1..(data.len() - BLOCK_SIZE) {
            hash = roll(hash, data[start - 1], data[start + BLOCK_SIZE - 1]);
            assert_eq!(
                hash,
                hash_block(&data[start..start + BLOCK_SIZE]),
                "roll diverged at window {start}"
            );
        }
    }

    #[test]
    fn table_constants_are_consistent() {
        // First, second, and last entries of each table, pinned against
        // the pack format's fixed fingerprint constants.
        assert_eq!(T[0], 0);
        assert_eq!(T[1], 0xd4c6_b32d);
        assert_eq!(T[255], 0x99b5_d833);
        assert_eq!(U[0], 0);
        assert_eq!(U[1], 0x12c6_e90f);
        assert_eq!(U[255], 0x536b_5c61);
        // Tables are linear over GF(2), which is what makes the rolled
        // hash agree with a fresh block hash.
        assert_eq!(T[3], T[1] ^ T[2]);
        assert_eq!(U[3], U[1] ^ U[2]);
        // T carries bit 31 exactly on odd indexes, keeping the
        // accumulator below 2^31 and every table index in range.
        for (i, value) in T.iter().enumerate() {
            assert_eq!(value >> 31, (i & 1) as u32, "T[{i}] top bit");
        }
        for value in U.iter() {
            assert_eq!(value >> 31, 0, "U entries must keep bit 31 clear");
        }
    }

    #[test]
    fn candidates_find_every_equal_block() {
        let mut src = Vec::new();
        for _ in 0..8 {
            src.extend_from_slice(b"0123456789abcdef");
        }
        let index = DeltaIndex::new(&src);
        let hash = hash_block(b"0123456789abcdef");

        let mut offsets = Vec::new();
        index.for_each_candidate(hash, |off| offsets.push(off));
        assert_eq!(offsets, vec![0, 16, 32, 48, 64, 80, 96, 112]);
    }

    #[test]
    fn chains_are_capped() {
        let src = vec![0u8; BLOCK_SIZE * (MAX_CHAIN_LENGTH + 40)];
        let index = DeltaIndex::new(&src);
        let hash = hash_block(&src[..BLOCK_SIZE]);

        let mut count = 0usize;
        index.for_each_candidate(hash, |_| count += 1);
        assert_eq!(count, MAX_CHAIN_LENGTH);
    }

    #[test]
    fn tiny_source_yields_empty_index() {
        let index = DeltaIndex::new(b"short");
        let mut count = 0usize;
        index.for_each_candidate(hash_block(b"0123456789abcdef"), |_| count += 1);
        assert_eq!(count, 0);
    }
}
