//! Lease bitmap over the one-byte datagram index space.

use ecbus_core::constants::DATAGRAM_INDEX_COUNT;

const WORDS: usize = DATAGRAM_INDEX_COUNT / 64;

/// Tracks which of the 256 datagram indices are in flight.
///
/// Leasing scans at most five bitmap words. The scan starts right after the
/// most recently leased index, so a just-released index is handed out again
/// only once the rest of the space has been used.
#[derive(Debug, Clone)]
pub struct IndexAllocator {
    used: [u64; WORDS],
    hint: u8,
    in_use: usize,
}

impl IndexAllocator {
    /// Creates an allocator with a random starting point.
    pub fn new() -> Self {
        Self::with_start(rand::random())
    }

    /// Creates an allocator whose first lease is `start` (or the next free
    /// index after it).
    pub fn with_start(start: u8) -> Self {
        Self { used: [0; WORDS], hint: start, in_use: 0 }
    }

    /// Leases a free index, `None` if all 256 are out.
    pub fn lease(&mut self) -> Option<u8> {
        if self.in_use == DATAGRAM_INDEX_COUNT {
            return None;
        }
        let start = usize::from(self.hint);
        let shift = start % 64;
        for step in 0..=WORDS {
            let word = (start / 64 + step) % WORDS;
            let mut free = !self.used[word];
            if step == 0 {
                free &= !0u64 << shift;
            } else if step == WORDS {
                // wrapped back to the first word: only bits below the start
                free &= !(!0u64 << shift);
            }
            if free != 0 {
                let bit = free.trailing_zeros() as usize;
                self.used[word] |= 1 << bit;
                self.in_use += 1;
                let index = (word * 64 + bit) as u8;
                self.hint = index.wrapping_add(1);
                return Some(index);
            }
        }
        None
    }

    /// Releases `index`. Returns false if it was not leased.
    pub fn release(&mut self, index: u8) -> bool {
        let (word, bit) = Self::position(index);
        if self.used[word] & bit == 0 {
            return false;
        }
        self.used[word] &= !bit;
        self.in_use -= 1;
        true
    }

    /// Returns true if `index` is currently leased.
    pub fn is_leased(&self, index: u8) -> bool {
        let (word, bit) = Self::position(index);
        self.used[word] & bit != 0
    }

    /// Number of leased indices.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of free indices.
    pub fn available(&self) -> usize {
        DATAGRAM_INDEX_COUNT - self.in_use
    }

    /// Every leased index in ascending order.
    pub fn leased(&self) -> impl Iterator<Item = u8> + '_ {
        (0..DATAGRAM_INDEX_COUNT).map(|i| i as u8).filter(move |&index| self.is_leased(index))
    }

    fn position(index: u8) -> (usize, u64) {
        let index = usize::from(index);
        (index / 64, 1u64 << (index % 64))
    }
}

impl Default for IndexAllocator {
    fn default() -> Self {
        Self::new()
    }
}
