//! Fixed-length bit masks.
//!
//! Used for vote presence masks, block-part masks, and the peer round-state
//! summaries exchanged by the syncer. The mask length is fixed at creation
//! (number of validators or number of parts).

use {
    rand::Rng,
    serde::{Deserialize, Serialize},
};

/// A fixed-length array of bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitArray {
    len: usize,
    words: Vec<u64>,
}

impl BitArray {
    /// Create a mask of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            words: vec![0u64; len.div_ceil(64)],
        }
    }

    /// Number of bits in the mask.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mask has zero bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the bit at `idx`, or `false` if out of range.
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    /// Set the bit at `idx`. Out-of-range indices are ignored.
    pub fn set(&mut self, idx: usize) {
        if idx < self.len {
            self.words[idx / 64] |= 1u64 << (idx % 64);
        }
    }

    /// Clear the bit at `idx`.
    pub fn unset(&mut self, idx: usize) {
        if idx < self.len {
            self.words[idx / 64] &= !(1u64 << (idx % 64));
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True if every bit is set.
    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    /// Invert every bit in place.
    pub fn flip(&mut self) {
        for w in &mut self.words {
            *w = !*w;
        }
        self.clear_tail();
    }

    /// Bitwise AND with `other` in place. Masks of different lengths are
    /// combined over the shorter prefix.
    pub fn and_assign(&mut self, other: &BitArray) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
        self.clear_tail();
    }

    /// Bitwise OR with `other` in place.
    pub fn or_assign(&mut self, other: &BitArray) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w |= other.words.get(i).copied().unwrap_or(0);
        }
        self.clear_tail();
    }

    /// Pick a uniformly random set bit, or `None` if all bits are clear.
    pub fn pick_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let mut nth = rng.random_range(0..count);
        for idx in 0..self.len {
            if self.get(idx) {
                if nth == 0 {
                    return Some(idx);
                }
                nth -= 1;
            }
        }
        None
    }

    /// Indices of all set bits in ascending order.
    pub fn set_indices(&self) -> Vec<usize> {
        (0..self.len).filter(|&i| self.get(i)).collect()
    }

    // Bits past `len` in the last word must stay clear so that `count`
    // and equality behave.
    fn clear_tail(&mut self) {
        let tail = self.len % 64;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

impl std::fmt::Display for BitArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for idx in 0..self.len {
            write!(f, "{}", if self.get(idx) { '1' } else { '0' })?;
        }
        Ok(())
    }
}
