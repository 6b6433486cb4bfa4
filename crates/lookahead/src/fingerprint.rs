//! Rolling FNV-1a hashing for prefixes and call-tree summaries (spec.md
//! §4.8): a 32-bit hash absorbing each prefix PC, plus a second 32-bit hash
//! absorbing subordinate calls' prefix/summary hashes, so a session's
//! identity is cheap to update incrementally as new instructions or child
//! calls are appended.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// A running FNV-1a accumulator. Starts at the FNV offset basis; absorbing
/// the same byte sequence in the same order always reaches the same value,
/// which is what makes `CurrentPathID`/cache-key reuse sound across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RollingHash(u32);

impl Default for RollingHash {
    fn default() -> Self {
        RollingHash(FNV_OFFSET_BASIS)
    }
}

impl RollingHash {
    pub fn new() -> Self {
        RollingHash::default()
    }

    fn absorb_byte(&mut self, b: u8) {
        self.0 ^= b as u32;
        self.0 = self.0.wrapping_mul(FNV_PRIME);
    }

    fn absorb_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.absorb_byte(b);
        }
    }

    /// Mixes a program counter in as a little-endian `u64`.
    pub fn absorb_pc(&mut self, pc: usize) {
        self.absorb_bytes(&(pc as u64).to_le_bytes());
    }

    /// Mixes another hash value in as a little-endian `u32`, used to fold a
    /// subordinate call's prefix/summary hash into this call's summary.
    pub fn absorb_hash(&mut self, h: RollingHash) {
        self.absorb_bytes(&h.0.to_le_bytes());
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_offset_basis() {
        assert_eq!(RollingHash::new().value(), FNV_OFFSET_BASIS);
    }

    #[test]
    fn absorbing_same_pcs_in_order_is_deterministic() {
        let mut a = RollingHash::new();
        let mut b = RollingHash::new();
        for pc in [0usize, 2, 4, 9] {
            a.absorb_pc(pc);
            b.absorb_pc(pc);
        }
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn order_matters() {
        let mut a = RollingHash::new();
        a.absorb_pc(1);
        a.absorb_pc(2);
        let mut b = RollingHash::new();
        b.absorb_pc(2);
        b.absorb_pc(1);
        assert_ne!(a.value(), b.value());
    }

    #[test]
    fn absorb_hash_folds_subordinate_identity_in() {
        let mut sub = RollingHash::new();
        sub.absorb_pc(7);

        let mut parent_a = RollingHash::new();
        parent_a.absorb_pc(1);
        parent_a.absorb_hash(sub);

        let mut parent_b = RollingHash::new();
        parent_b.absorb_pc(1);
        assert_ne!(parent_a.value(), parent_b.value());
    }
}
