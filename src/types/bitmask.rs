/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fixed-length bit sets recording which signers an aggregate signature covers.

use std::fmt::{self, Debug, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

const WORD_BITS: usize = u64::BITS as usize;

/// Set of signer indices covered by an aggregate signature.
///
/// ## Indexing
///
/// Index `i` refers to the `i`-th replica in a [`Session`](crate::handel::session::Session)'s
/// [ordering](crate::handel::session::Session::ordered_ids), which is the same on every correct replica
/// for a given hash. A `Bitmask` is therefore only meaningful together with the session it was built for.
///
/// ## Well-formedness
///
/// Bitmasks received from the network may have been crafted arbitrarily. [`is_well_formed`](Self::is_well_formed)
/// checks that the inner words agree with the declared length and that no bit beyond that length is set.
/// All other methods assume well-formed operands.
#[derive(Clone, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Bitmask {
    len: u32,
    words: Vec<u64>,
}

impl Bitmask {
    /// Create a `Bitmask` of `len` bits, none of them set.
    ///
    /// # Panics
    ///
    /// Panics if `len` does not fit in a `u32`.
    pub fn new(len: usize) -> Self {
        let Ok(declared_len) = u32::try_from(len) else {
            panic!("bitmask length {} exceeds u32::MAX", len)
        };
        Self {
            len: declared_len,
            words: vec![0; len.div_ceil(WORD_BITS)],
        }
    }

    /// Create a `Bitmask` of `len` bits in which only `index` is set.
    pub fn singleton(len: usize, index: usize) -> Self {
        let mut bitmask = Self::new(len);
        bitmask.set(index);
        bitmask
    }

    /// Create a `Bitmask` of `len` bits in which exactly the indices yielded by `indices` are set.
    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut bitmask = Self::new(len);
        for index in indices {
            bitmask.set(index);
        }
        bitmask
    }

    /// Get the number of bits (set or not) in this `Bitmask`.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Check whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Set the bit at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is `>=` [`len`](Self::len).
    pub fn set(&mut self, index: usize) {
        assert!(index < self.len(), "bitmask index out of bounds");
        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
    }

    /// Check whether the bit at `index` is set. Out of bounds indices are never set.
    pub fn get(&self, index: usize) -> bool {
        index < self.len() && self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    /// Count the bits that are set.
    pub fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Count the bits that are set in `self` but not in `other`.
    pub fn count_new(&self, other: &Bitmask) -> usize {
        self.words
            .iter()
            .enumerate()
            .map(|(i, word)| (word & !other.word(i)).count_ones() as usize)
            .sum()
    }

    /// Get the union of `self` and `other`.
    pub fn union(&self, other: &Bitmask) -> Bitmask {
        let len = self.len.max(other.len);
        let words = (0..self.words.len().max(other.words.len()))
            .map(|i| self.word(i) | other.word(i))
            .collect();
        Bitmask { len, words }
    }

    /// Check whether `self` and `other` have at least one set bit in common.
    pub fn intersects(&self, other: &Bitmask) -> bool {
        self.words
            .iter()
            .enumerate()
            .any(|(i, word)| word & other.word(i) != 0)
    }

    /// Check whether every bit set in `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &Bitmask) -> bool {
        self.count_new(other) == 0
    }

    /// Check whether every bit set in `self` lies in the closed index range `[min, max]`.
    pub fn is_within(&self, min: usize, max: usize) -> bool {
        self.iter().all(|index| min <= index && index <= max)
    }

    /// Check that the inner representation agrees with the declared length.
    pub fn is_well_formed(&self) -> bool {
        if self.words.len() != self.len().div_ceil(WORD_BITS) {
            return false;
        }
        let trailing_bits = self.len() % WORD_BITS;
        match self.words.last() {
            Some(last) if trailing_bits != 0 => last >> trailing_bits == 0,
            _ => true,
        }
    }

    /// Iterate through the indices of the set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| i * WORD_BITS + bit)
        })
    }

    fn word(&self, i: usize) -> u64 {
        self.words.get(i).copied().unwrap_or(0)
    }
}

impl Debug for Bitmask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[test]
fn bitmask_set_operations_test() {
    let a = Bitmask::from_indices(70, [0, 3, 64, 69]);
    let b = Bitmask::from_indices(70, [3, 5]);

    assert_eq!(a.count(), 4);
    assert!(a.get(69) && !a.get(70));
    assert_eq!(a.count_new(&b), 3);
    assert_eq!(b.count_new(&a), 1);
    assert!(a.intersects(&b));
    assert_eq!(a.union(&b).iter().collect::<Vec<_>>(), vec![0, 3, 5, 64, 69]);
    assert!(Bitmask::singleton(70, 3).is_subset_of(&b));
    assert!(!b.is_within(4, 10));
    assert!(a.is_well_formed());
}

#[test]
fn bitmask_rejects_bits_beyond_length_test() {
    let crafted = Bitmask {
        len: 4,
        words: vec![0b10001],
    };
    assert!(!crafted.is_well_formed());

    let truncated = Bitmask {
        len: 65,
        words: vec![1],
    };
    assert!(!truncated.is_well_formed());
}

#[cfg(target_pointer_width = "64")]
#[test]
#[should_panic(expected = "exceeds u32::MAX")]
fn bitmask_refuses_length_beyond_u32_test() {
    Bitmask::new(u32::MAX as usize + 1);
}
