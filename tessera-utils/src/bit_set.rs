//! Fixed size bit sets.

/// A simple bit set implementation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitSet(pub Box<[u64]>);

impl BitSet {
    /// Creates a bit set able to hold `bits` bits, all cleared.
    #[must_use]
    pub fn with_len(bits: usize) -> Self {
        Self(vec![0; bits.div_ceil(64)].into_boxed_slice())
    }

    /// Sets the bit at the given index.
    pub fn set(&mut self, index: usize, value: bool) {
        let u64_index = index / 64;
        let bit_index = index % 64;

        if u64_index >= self.0.len() {
            return;
        }

        if value {
            self.0[u64_index] |= 1u64 << bit_index;
        } else {
            self.0[u64_index] &= !(1u64 << bit_index);
        }
    }

    /// Returns the bit at the given index. Out of range bits read as unset.
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        self.0
            .get(index / 64)
            .is_some_and(|word| word & (1u64 << (index % 64)) != 0)
    }

    /// Returns true if no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|word| *word == 0)
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        self.0.iter_mut().for_each(|word| *word = 0);
    }

    /// Iterates the indices of all set bits in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(word_index, &word)| {
            (0..64usize)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| word_index * 64 + bit)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::BitSet;

    #[test]
    fn set_get_and_iterate() {
        let mut bits = BitSet::with_len(70);
        bits.set(3, true);
        bits.set(65, true);
        bits.set(200, true); // ignored, out of range

        assert!(bits.get(3));
        assert!(bits.get(65));
        assert!(!bits.get(4));
        assert_eq!(bits.ones().collect::<Vec<_>>(), vec![3, 65]);

        bits.set(3, false);
        assert_eq!(bits.ones().collect::<Vec<_>>(), vec![65]);
        bits.clear();
        assert!(bits.is_empty());
    }
}
