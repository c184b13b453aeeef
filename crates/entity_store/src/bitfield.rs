//! Bit sets over component def ids.
//!
//! A [`BitField`] records which component defs an entity carries (or which
//! defs a query asks for). Def ids are 1-based; bit `n` stands for def `n`.
//!
//! Two membership tests are provided:
//!
//! - [`BitField::and`]: ALL: every bit of the mask is set in the subject.
//! - [`BitField::aand`]: ANY: at least one bit of the mask is set in the subject.
//!
//! [`BitField::all`] builds a sentinel that matches every subject.

use std::fmt;
use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};

use crate::component_def::ComponentDefId;

const WORD_BITS: u32 = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitField {
    words: Vec<u64>,
    all: bool,
}

impl BitField {
    /// An empty bit set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: Vec::new(),
            all: false,
        }
    }

    /// The match-all sentinel.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            words: Vec::new(),
            all: true,
        }
    }

    /// Build a bit set with the given def ids switched on.
    #[must_use]
    pub fn from_values<I: IntoIterator<Item = ComponentDefId>>(values: I) -> Self {
        let mut bf = Self::new();
        for value in values {
            bf.set(value, true);
        }
        bf
    }

    #[must_use]
    pub const fn is_all(&self) -> bool {
        self.all
    }

    /// Returns `true` when no bit is set and this is not the match-all sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.all && self.words.iter().all(|w| *w == 0)
    }

    pub fn set(&mut self, index: ComponentDefId, on: bool) {
        let word = (index / WORD_BITS) as usize;
        let bit = 1u64 << (index % WORD_BITS);
        if word >= self.words.len() {
            if !on {
                return;
            }
            self.words.resize(word + 1, 0);
        }
        if on {
            self.words[word] |= bit;
        } else {
            self.words[word] &= !bit;
            self.trim();
        }
    }

    // Trailing zero words are dropped so equal sets compare equal.
    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    #[must_use]
    pub fn get(&self, index: ComponentDefId) -> bool {
        let word = (index / WORD_BITS) as usize;
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << (index % WORD_BITS)) != 0)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// The set def ids in ascending order.
    #[must_use]
    pub fn to_values(&self) -> Vec<ComponentDefId> {
        self.iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = ComponentDefId> + '_ {
        self.words.iter().enumerate().flat_map(|(w, bits)| {
            (0..WORD_BITS).filter_map(move |b| {
                if bits & (1u64 << b) != 0 {
                    Some(w as u32 * WORD_BITS + b)
                } else {
                    None
                }
            })
        })
    }

    /// ALL: true if every bit set in `mask` is also set in `subject`.
    ///
    /// The match-all sentinel always passes; an empty mask passes vacuously.
    #[must_use]
    pub fn and(mask: &BitField, subject: &BitField) -> bool {
        if mask.all {
            return true;
        }
        mask.words.iter().enumerate().all(|(i, m)| {
            let s = subject.words.get(i).copied().unwrap_or(0);
            m & s == *m
        })
    }

    /// ANY: true if at least one bit set in `mask` is also set in `subject`.
    ///
    /// The match-all sentinel passes any non-empty subject.
    #[must_use]
    pub fn aand(mask: &BitField, subject: &BitField) -> bool {
        if mask.all {
            return !subject.is_empty();
        }
        mask.words
            .iter()
            .zip(subject.words.iter())
            .any(|(m, s)| m & s != 0)
    }

    /// Bits set in `self` but not in `other`.
    #[must_use]
    pub fn difference(&self, other: &BitField) -> BitField {
        let words = self
            .words
            .iter()
            .enumerate()
            .map(|(i, w)| w & !other.words.get(i).copied().unwrap_or(0))
            .collect();
        let mut bf = BitField { words, all: false };
        bf.trim();
        bf
    }
}

impl BitOr for &BitField {
    type Output = BitField;

    fn bitor(self, rhs: &BitField) -> BitField {
        let len = self.words.len().max(rhs.words.len());
        let words = (0..len)
            .map(|i| self.words.get(i).copied().unwrap_or(0) | rhs.words.get(i).copied().unwrap_or(0))
            .collect();
        BitField {
            words,
            all: self.all || rhs.all,
        }
    }
}

impl BitAnd for &BitField {
    type Output = BitField;

    fn bitand(self, rhs: &BitField) -> BitField {
        match (self.all, rhs.all) {
            (true, true) => BitField::all(),
            (true, false) => rhs.clone(),
            (false, true) => self.clone(),
            (false, false) => {
                let words = self
                    .words
                    .iter()
                    .zip(rhs.words.iter())
                    .map(|(a, b)| a & b)
                    .collect();
                let mut bf = BitField { words, all: false };
                bf.trim();
                bf
            }
        }
    }
}

impl FromIterator<ComponentDefId> for BitField {
    fn from_iter<I: IntoIterator<Item = ComponentDefId>>(iter: I) -> Self {
        Self::from_values(iter)
    }
}

impl fmt::Display for BitField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all {
            return write!(f, "BitField(all)");
        }
        write!(f, "BitField({:?})", self.to_values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_and_count() {
        let mut bf = BitField::new();
        assert!(bf.is_empty());
        bf.set(1, true);
        bf.set(70, true);
        assert!(bf.get(1));
        assert!(bf.get(70));
        assert!(!bf.get(2));
        assert_eq!(bf.count(), 2);
        assert_eq!(bf.to_values(), vec![1, 70]);

        bf.set(70, false);
        assert_eq!(bf.to_values(), vec![1]);
        // clearing a bit beyond the allocated words is a no-op
        bf.set(500, false);
        assert_eq!(bf.count(), 1);
    }

    #[test]
    fn test_all_semantics() {
        let subject = BitField::from_values([1, 2, 3]);
        assert!(BitField::and(&BitField::from_values([1, 3]), &subject));
        assert!(!BitField::and(&BitField::from_values([1, 4]), &subject));
        assert!(BitField::and(&BitField::from_values([1, 100]), &BitField::from_values([1, 100])));
        assert!(!BitField::and(&BitField::from_values([100]), &subject));
    }

    #[test]
    fn test_any_semantics() {
        let subject = BitField::from_values([2, 65]);
        assert!(BitField::aand(&BitField::from_values([1, 65]), &subject));
        assert!(!BitField::aand(&BitField::from_values([1, 3]), &subject));
        assert!(!BitField::aand(&BitField::new(), &subject));
    }

    #[test]
    fn test_match_all_sentinel() {
        let all = BitField::all();
        assert!(all.is_all());
        assert!(!all.is_empty());
        assert!(BitField::and(&all, &BitField::new()));
        assert!(BitField::aand(&all, &BitField::from_values([9])));
        assert!(!BitField::aand(&all, &BitField::new()));
    }

    #[test]
    fn test_union_intersection_difference() {
        let a = BitField::from_values([1, 2, 3]);
        let b = BitField::from_values([3, 4]);
        assert_eq!((&a | &b).to_values(), vec![1, 2, 3, 4]);
        assert_eq!((&a & &b).to_values(), vec![3]);
        assert_eq!(a.difference(&b).to_values(), vec![1, 2]);
        assert_eq!((&BitField::all() & &b), b);
    }

    #[test]
    fn test_display() {
        assert_eq!(BitField::from_values([2, 5]).to_string(), "BitField([2, 5])");
        assert_eq!(BitField::all().to_string(), "BitField(all)");
    }
}
