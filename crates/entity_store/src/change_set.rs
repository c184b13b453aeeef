//! Per-batch change tracking.
//!
//! A [`ChangeSet`] classifies values into three disjoint sets: `added`,
//! `updated` and `removed`. Transitions follow the batch lifecycle:
//!
//! - add after remove ⇒ updated (the value existed before the batch)
//! - update after add ⇒ still added
//! - remove ⇒ removed, clearing any added or updated mark
//! - merge ⇒ union, then anything removed *and* added or updated becomes updated

use std::collections::BTreeSet;
use std::ops::{BitOr, BitOrAssign};

/// Selects which classes [`ChangeSet::changes`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeSetOp(u8);

impl ChangeSetOp {
    pub const NONE: Self = Self(0);
    pub const ADD: Self = Self(1);
    pub const UPDATE: Self = Self(2);
    pub const REMOVE: Self = Self(4);
    pub const ALL: Self = Self(7);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for ChangeSetOp {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeSetOp {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet<T: Ord> {
    pub added: BTreeSet<T>,
    pub updated: BTreeSet<T>,
    pub removed: BTreeSet<T>,
}

impl<T: Ord> Default for ChangeSet<T> {
    fn default() -> Self {
        Self {
            added: BTreeSet::new(),
            updated: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Clone> ChangeSet<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: T) {
        if self.removed.remove(&value) {
            self.updated.insert(value);
        } else if !self.updated.contains(&value) {
            self.added.insert(value);
        }
    }

    pub fn update(&mut self, value: T) {
        if self.added.contains(&value) {
            return;
        }
        self.removed.remove(&value);
        self.updated.insert(value);
    }

    pub fn remove(&mut self, value: T) {
        self.added.remove(&value);
        self.updated.remove(&value);
        self.removed.insert(value);
    }

    /// Unions `other` into `self`, then demotes `removed ∩ (added ∪ updated)`
    /// to updated.
    pub fn merge(&mut self, other: &ChangeSet<T>) {
        self.added.extend(other.added.iter().cloned());
        self.updated.extend(other.updated.iter().cloned());
        self.removed.extend(other.removed.iter().cloned());

        let conflicted: Vec<T> = self
            .removed
            .iter()
            .filter(|v| self.added.contains(*v) || self.updated.contains(*v))
            .cloned()
            .collect();
        for value in conflicted {
            self.removed.remove(&value);
            self.added.remove(&value);
            self.updated.insert(value);
        }
    }

    /// Which class, if any, the value is in.
    #[must_use]
    pub fn find(&self, value: &T) -> ChangeSetOp {
        if self.added.contains(value) {
            ChangeSetOp::ADD
        } else if self.updated.contains(value) {
            ChangeSetOp::UPDATE
        } else if self.removed.contains(value) {
            ChangeSetOp::REMOVE
        } else {
            ChangeSetOp::NONE
        }
    }

    /// Values in the selected classes, in ascending order.
    #[must_use]
    pub fn changes(&self, ops: ChangeSetOp) -> Vec<T> {
        let mut out = BTreeSet::new();
        if ops.contains(ChangeSetOp::ADD) {
            out.extend(self.added.iter().cloned());
        }
        if ops.contains(ChangeSetOp::UPDATE) {
            out.extend(self.updated.iter().cloned());
        }
        if ops.contains(ChangeSetOp::REMOVE) {
            out.extend(self.removed.iter().cloned());
        }
        out.into_iter().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn clear(&mut self) {
        self.added.clear();
        self.updated.clear();
        self.removed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_remove_is_removed() {
        let mut cs = ChangeSet::new();
        cs.add(1);
        cs.remove(1);
        assert_eq!(cs.find(&1), ChangeSetOp::REMOVE);
        assert!(cs.added.is_empty());
    }

    #[test]
    fn test_remove_then_add_is_updated() {
        let mut cs = ChangeSet::new();
        cs.remove(1);
        cs.add(1);
        assert_eq!(cs.find(&1), ChangeSetOp::UPDATE);
        assert!(cs.removed.is_empty());
    }

    #[test]
    fn test_update_then_remove_is_removed() {
        let mut cs = ChangeSet::new();
        cs.update(1);
        cs.remove(1);
        assert_eq!(cs.find(&1), ChangeSetOp::REMOVE);
        assert!(cs.updated.is_empty());
    }

    #[test]
    fn test_remove_then_update_is_updated() {
        let mut cs = ChangeSet::new();
        cs.remove(1);
        cs.update(1);
        assert_eq!(cs.find(&1), ChangeSetOp::UPDATE);
    }

    #[test]
    fn test_update_on_added_stays_added() {
        let mut cs = ChangeSet::new();
        cs.add(1);
        cs.update(1);
        assert_eq!(cs.find(&1), ChangeSetOp::ADD);
        assert!(cs.updated.is_empty());
    }

    #[test]
    fn test_add_on_updated_stays_updated() {
        let mut cs = ChangeSet::new();
        cs.update(1);
        cs.add(1);
        assert_eq!(cs.find(&1), ChangeSetOp::UPDATE);
        assert!(cs.added.is_empty());
    }

    #[test]
    fn test_merge_demotes_conflicts_to_updated() {
        let mut a = ChangeSet::new();
        a.add(1);
        a.remove(2);
        a.update(3);
        let mut b = ChangeSet::new();
        b.remove(1);
        b.add(2);
        b.add(4);
        a.merge(&b);
        assert_eq!(a.changes(ChangeSetOp::UPDATE), vec![1, 2, 3]);
        assert_eq!(a.changes(ChangeSetOp::ADD), vec![4]);
        assert!(a.removed.is_empty());
    }

    #[test]
    fn test_changes_by_op() {
        let mut cs = ChangeSet::new();
        cs.add(3);
        cs.update(2);
        cs.remove(1);
        assert_eq!(cs.changes(ChangeSetOp::ADD | ChangeSetOp::UPDATE), vec![2, 3]);
        assert_eq!(cs.changes(ChangeSetOp::ALL), vec![1, 2, 3]);
        assert!(cs.changes(ChangeSetOp::NONE).is_empty());
        cs.clear();
        assert!(cs.is_empty());
    }
}
