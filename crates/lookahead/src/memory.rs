//! The abstract memory: either `⊤` or a word-aligned byte buffer where each
//! byte is concrete or the top-byte sentinel.

use crate::errors::StepError;

/// Arbitrary in-domain byte used as the top-byte sentinel (spec.md §3).
pub const TOP_BYTE: u8 = 101;

pub fn is_top_byte(b: u8) -> bool {
    b == TOP_BYTE
}

/// Rounds a byte count up to the next multiple of the VM word size (32).
pub fn to_word_size(bytes: usize) -> usize {
    bytes.div_ceil(32) * 32
}

/// A read or write payload: either concrete bytes or "top" at byte
/// granularity (a buffer that degrades to top as soon as one cell is top,
/// per spec.md §3 — top does not propagate sub-byte inside a buffer that
/// happens to contain the sentinel value concretely).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbsBytes {
    Top,
    Concrete(Vec<u8>),
}

impl AbsBytes {
    pub fn top() -> Self {
        AbsBytes::Top
    }

    pub fn concrete(bytes: Vec<u8>) -> Self {
        AbsBytes::Concrete(bytes)
    }

    pub fn is_top(&self) -> bool {
        matches!(self, AbsBytes::Top)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbsMem {
    Top,
    Bytes(Vec<u8>),
}

impl AbsMem {
    pub fn empty() -> Self {
        AbsMem::Bytes(Vec::new())
    }

    pub fn top() -> Self {
        AbsMem::Top
    }

    pub fn is_top(&self) -> bool {
        matches!(self, AbsMem::Top)
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            AbsMem::Top => None,
            AbsMem::Bytes(b) => Some(b.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, AbsMem::Bytes(b) if b.is_empty())
    }

    /// Enlarges a non-top memory to at least `n` bytes, word-aligned, zero
    /// filling the new tail. A no-op on top memory, and never shrinks.
    pub fn resize(&mut self, n: usize) {
        if let AbsMem::Bytes(buf) = self {
            let target = to_word_size(n);
            if target > buf.len() {
                buf.resize(target, 0);
            }
        }
    }

    /// Reads `size` bytes starting at `off`. Returns top-bytes if memory is
    /// top, or if any byte in range is the top-byte sentinel.
    pub fn get(&self, off: usize, size: usize) -> AbsBytes {
        match self {
            AbsMem::Top => AbsBytes::top(),
            AbsMem::Bytes(buf) => {
                let end = off.saturating_add(size);
                if size == 0 {
                    return AbsBytes::concrete(Vec::new());
                }
                if end > buf.len() {
                    return AbsBytes::top();
                }
                let slice = &buf[off..end];
                if slice.iter().any(|&b| is_top_byte(b)) {
                    AbsBytes::top()
                } else {
                    AbsBytes::concrete(slice.to_vec())
                }
            }
        }
    }

    /// Writes `value` at `[off, off+size)` into a non-top memory (the
    /// caller is responsible for having resized first). If `value` is
    /// top-bytes, the range is filled with the top-byte sentinel.
    pub fn set(&mut self, off: usize, size: usize, value: &AbsBytes) -> Result<(), StepError> {
        match self {
            AbsMem::Top => Ok(()),
            AbsMem::Bytes(buf) => {
                let end = off.saturating_add(size);
                if end > buf.len() {
                    return Err(StepError::MemoryOverflow);
                }
                match value {
                    AbsBytes::Top => {
                        for b in &mut buf[off..end] {
                            *b = TOP_BYTE;
                        }
                    }
                    AbsBytes::Concrete(bytes) => {
                        if bytes.len() != size {
                            return Err(StepError::MemoryOverflow);
                        }
                        buf[off..end].copy_from_slice(bytes);
                    }
                }
                Ok(())
            }
        }
    }

    pub fn clone_deep(&self) -> Self {
        self.clone()
    }

    /// If lengths differ or either side is top, the join is top; otherwise
    /// byte-wise join (two equal concrete bytes join to themselves,
    /// anything else joins to the top-byte sentinel).
    pub fn join_mems(&self, other: &AbsMem) -> AbsMem {
        match (self, other) {
            (AbsMem::Bytes(a), AbsMem::Bytes(b)) if a.len() == b.len() => {
                let joined = a
                    .iter()
                    .zip(b.iter())
                    .map(|(&x, &y)| if x == y { x } else { TOP_BYTE })
                    .collect();
                AbsMem::Bytes(joined)
            }
            _ => AbsMem::Top,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_is_word_aligned_and_zero_filled() {
        let mut m = AbsMem::empty();
        m.resize(1);
        assert_eq!(m.len(), Some(32));
        m.resize(33);
        assert_eq!(m.len(), Some(64));
    }

    #[test]
    fn resize_never_shrinks() {
        let mut m = AbsMem::empty();
        m.resize(64);
        m.resize(1);
        assert_eq!(m.len(), Some(64));
    }

    #[test]
    fn get_out_of_range_is_top() {
        let m = AbsMem::empty();
        assert!(m.get(0, 32).is_top());
    }

    #[test]
    fn set_then_get_roundtrips_concrete_bytes() {
        let mut m = AbsMem::empty();
        m.resize(32);
        let payload = vec![7u8; 32];
        m.set(0, 32, &AbsBytes::concrete(payload.clone())).unwrap();
        assert_eq!(m.get(0, 32), AbsBytes::concrete(payload));
    }

    #[test]
    fn set_top_bytes_fills_sentinel() {
        let mut m = AbsMem::empty();
        m.resize(32);
        m.set(0, 32, &AbsBytes::top()).unwrap();
        assert!(m.get(0, 32).is_top());
    }

    #[test]
    fn join_mems_top_is_absorbing() {
        let m = AbsMem::empty();
        assert!(AbsMem::top().join_mems(&m).is_top());
        assert!(m.join_mems(&AbsMem::top()).is_top());
    }

    #[test]
    fn join_mems_differing_lengths_is_top() {
        let mut a = AbsMem::empty();
        a.resize(32);
        let mut b = AbsMem::empty();
        b.resize(64);
        assert!(a.join_mems(&b).is_top());
    }

    #[test]
    fn join_mems_byte_wise() {
        let mut a = AbsMem::empty();
        a.resize(32);
        let mut b = AbsMem::empty();
        b.resize(32);
        a.set(0, 1, &AbsBytes::concrete(vec![9])).unwrap();
        b.set(0, 1, &AbsBytes::concrete(vec![9])).unwrap();
        b.set(1, 1, &AbsBytes::concrete(vec![2])).unwrap();
        let joined = a.join_mems(&b);
        match joined {
            AbsMem::Bytes(buf) => {
                assert_eq!(buf[0], 9);
                assert_eq!(buf[1], TOP_BYTE);
            }
            AbsMem::Top => panic!("expected concrete join"),
        }
    }
}
