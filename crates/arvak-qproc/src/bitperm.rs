//! Bit permutation tables for controlled-gate index enumeration.
//!
//! A controlled gate only touches indices whose control bits are all set. With
//! `c` control lanes and one target lane there are `2^(n - c - 1)` such index
//! pairs. Rather than scanning all `2^n` indices and testing bits, the kernel
//! counts through a *compressed* index over the remaining free bits and
//! scatters it into a global offset one byte at a time through these tables.

/// Lookup tables scattering a compressed index into the free bit positions.
#[derive(Debug, Clone)]
pub struct BitPermTable {
    tables: Vec<[u64; 256]>,
    fixed_mask: u64,
    n_lanes: u32,
    n_free_bits: u32,
}

impl BitPermTable {
    /// Build tables for a register of `n_lanes` lanes where `fixed_bits` are
    /// excluded from enumeration.
    pub fn new(fixed_bits: &[u32], n_lanes: u32) -> Self {
        let fixed_mask = fixed_bits.iter().fold(0u64, |mask, &bit| mask | (1 << bit));
        let free: Vec<u32> = (0..n_lanes)
            .filter(|bit| fixed_mask & (1 << bit) == 0)
            .collect();
        let n_bytes = free.len().div_ceil(8).max(1);

        let mut tables = vec![[0u64; 256]; n_bytes];
        for (byte_idx, table) in tables.iter_mut().enumerate() {
            for (fragment, entry) in table.iter_mut().enumerate() {
                *entry = (0..8)
                    .filter(|bit| (fragment >> bit) & 1 == 1)
                    .filter_map(|bit| free.get(byte_idx * 8 + bit))
                    .fold(0u64, |offset, &pos| offset | (1 << pos));
            }
        }

        Self {
            tables,
            fixed_mask,
            n_lanes,
            n_free_bits: free.len() as u32,
        }
    }

    /// Scatter a compressed index into a global offset with every fixed bit
    /// cleared.
    #[inline]
    pub fn permute(&self, idx: u64) -> u64 {
        self.tables
            .iter()
            .enumerate()
            .fold(0u64, |offset, (byte_idx, table)| {
                offset | table[((idx >> (8 * byte_idx)) & 0xff) as usize]
            })
    }

    /// Mask of the excluded bit positions.
    pub fn fixed_mask(&self) -> u64 {
        self.fixed_mask
    }

    /// Lane count the tables were built for.
    pub fn n_lanes(&self) -> u32 {
        self.n_lanes
    }

    /// Number of compressed indices, `2^(free bits)`.
    pub fn n_indices(&self) -> u64 {
        1 << self.n_free_bits
    }
}
