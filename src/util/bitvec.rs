//! Bit vector
//!
//! One bit per page, used by the integrity checker to record which pages
//! have been reached. Indices are page numbers; bit 0 is unused.

#[derive(Clone, Debug, Default)]
pub struct BitVec {
    bits: Vec<u8>,
    len: usize,
}

impl BitVec {
    pub fn new(len: usize) -> Self {
        let byte_len = (len + 7) / 8;
        Self {
            bits: vec![0; byte_len],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        let byte = self.bits[idx / 8];
        let mask = 1u8 << (idx % 8);
        (byte & mask) != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.len {
            return;
        }
        let byte_idx = idx / 8;
        let mask = 1u8 << (idx % 8);
        if value {
            self.bits[byte_idx] |= mask;
        } else {
            self.bits[byte_idx] &= !mask;
        }
    }

    /// Set a bit and report whether it was already set.
    /// Out-of-range indices report `None`.
    pub fn test_and_set(&mut self, idx: usize) -> Option<bool> {
        if idx >= self.len {
            return None;
        }
        let was = self.get(idx);
        self.set(idx, true);
        Some(was)
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut bv = BitVec::new(20);
        assert!(!bv.get(3));
        bv.set(3, true);
        bv.set(17, true);
        assert!(bv.get(3));
        assert!(bv.get(17));
        assert_eq!(bv.count_ones(), 2);
        bv.set(3, false);
        assert!(!bv.get(3));
    }

    #[test]
    fn test_test_and_set() {
        let mut bv = BitVec::new(10);
        assert_eq!(bv.test_and_set(4), Some(false));
        assert_eq!(bv.test_and_set(4), Some(true));
        assert_eq!(bv.test_and_set(10), None);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut bv = BitVec::new(8);
        bv.set(100, true);
        assert!(!bv.get(100));
        assert_eq!(bv.len(), 8);
    }
}
