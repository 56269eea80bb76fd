use std::{
    cmp,
    collections::{
        btree_map, BTreeMap,
        Bound::{Excluded, Included},
    },
    ops::Range,
};

/// A set of u64 values stored as disjoint, non-adjacent half-open ranges
///
/// Used for received packet numbers awaiting acknowledgement and for acknowledged stream
/// offsets, both of which arrive mostly in long runs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, x: u64) -> bool {
        self.pred(x).map_or(false, |(_, end)| end > x)
    }

    /// Returns `false` iff `x` was already present
    pub fn insert_one(&mut self, x: u64) -> bool {
        self.insert(x..x + 1)
    }

    /// Returns `false` iff every element of `x` was already present
    pub fn insert(&mut self, mut x: Range<u64>) -> bool {
        if x.is_empty() {
            return false;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end >= x.end {
                return false;
            }
            if end >= x.start {
                self.0.remove(&start);
                x.start = start;
            }
        }
        // Absorb every successor that overlaps or touches
        while let Some((next_start, next_end)) = self.succ(x.start) {
            if next_start > x.end {
                break;
            }
            self.0.remove(&next_start);
            x.end = cmp::max(next_end, x.end);
        }
        self.0.insert(x.start, x.end);
        true
    }

    /// Returns `true` iff anything was removed
    pub fn remove(&mut self, x: Range<u64>) -> bool {
        if x.is_empty() {
            return false;
        }
        let mut removed = false;
        if let Some((start, end)) = self.pred(x.start) {
            if end > x.start {
                removed = true;
                self.0.remove(&start);
                if start < x.start {
                    self.0.insert(start, x.start);
                }
                if end > x.end {
                    self.0.insert(x.end, end);
                    return true;
                }
            }
        }
        while let Some((start, end)) = self.succ(x.start) {
            if start >= x.end {
                break;
            }
            removed = true;
            self.0.remove(&start);
            if end > x.end {
                self.0.insert(x.end, end);
                break;
            }
        }
        removed
    }

    pub fn subtract(&mut self, other: &Self) {
        for range in other {
            self.remove(range);
        }
    }

    /// Closest range beginning at or before `x`
    fn pred(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((Included(0), Included(x)))
            .next_back()
            .map(|(&s, &e)| (s, e))
    }

    /// Closest range beginning after `x`
    fn succ(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((Excluded(x), Included(u64::MAX)))
            .next()
            .map(|(&s, &e)| (s, e))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn min(&self) -> Option<u64> {
        self.0.keys().next().copied()
    }

    pub fn max(&self) -> Option<u64> {
        self.0.values().next_back().map(|&end| end - 1)
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter(self.0.iter())
    }

    pub fn peek_min(&self) -> Option<Range<u64>> {
        self.0.iter().next().map(|(&s, &e)| s..e)
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let range = self.peek_min()?;
        self.0.remove(&range.start);
        Some(range)
    }
}

pub struct Iter<'a>(btree_map::Iter<'a, u64, u64>);

impl Iterator for Iter<'_> {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Range<u64>> {
        self.0.next().map(|(&s, &e)| s..e)
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        self.0.next_back().map(|(&s, &e)| s..e)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = Range<u64>;
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adjacent() {
        let mut set = RangeSet::new();
        assert!(set.insert_one(2));
        assert!(set.insert_one(4));
        assert_eq!(set.len(), 2);
        assert!(set.insert_one(3));
        assert_eq!(set.len(), 1);
        assert_eq!(set.peek_min(), Some(2..5));
        assert!(!set.insert_one(3));
    }

    #[test]
    fn insert_bridges_many() {
        let mut set = RangeSet::new();
        set.insert(0..2);
        set.insert(4..6);
        set.insert(8..10);
        assert!(set.insert(1..9));
        assert_eq!(set.iter().collect::<Vec<_>>(), [0..10]);
        assert!(!set.insert(3..7));
    }

    #[test]
    fn remove_splits() {
        let mut set = RangeSet::new();
        set.insert(0..10);
        assert!(set.remove(3..5));
        assert_eq!(set.iter().collect::<Vec<_>>(), [0..3, 5..10]);
        assert!(!set.remove(3..5));
        assert!(set.remove(2..6));
        assert_eq!(set.iter().collect::<Vec<_>>(), [0..2, 6..10]);
    }

    #[test]
    fn remove_spanning() {
        let mut set = RangeSet::new();
        set.insert(0..2);
        set.insert(4..6);
        set.insert(8..10);
        assert!(set.remove(1..9));
        assert_eq!(set.iter().collect::<Vec<_>>(), [0..1, 9..10]);
    }

    #[test]
    fn min_max_contains() {
        let mut set = RangeSet::new();
        assert_eq!(set.min(), None);
        set.insert(5..7);
        set.insert(10..11);
        assert_eq!(set.min(), Some(5));
        assert_eq!(set.max(), Some(10));
        assert!(set.contains(6));
        assert!(!set.contains(7));
        assert_eq!(set.pop_min(), Some(5..7));
        assert_eq!(set.min(), Some(10));
    }

    #[test]
    fn subtract() {
        let mut a = RangeSet::new();
        a.insert(0..10);
        let mut b = RangeSet::new();
        b.insert(2..3);
        b.insert(7..12);
        a.subtract(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), [0..2, 3..7]);
    }
}
