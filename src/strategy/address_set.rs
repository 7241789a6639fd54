//! Index-stable set of block indices
//!
//! Keeps the members in a dense vector plus a position map so that membership,
//! insertion, removal and a uniform random draw are all O(1).

use rand::Rng;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct BlockAddressSet {
    items: Vec<usize>,
    positions: HashMap<usize, usize>,
}

impl BlockAddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding every index in `0..count`
    pub fn with_range(count: usize) -> Self {
        let items: Vec<usize> = (0..count).collect();
        let positions = items.iter().map(|&item| (item, item)).collect();
        Self { items, positions }
    }

    /// Insert `item`; returns false if it was already present
    pub fn insert(&mut self, item: usize) -> bool {
        if self.positions.contains_key(&item) {
            return false;
        }
        self.positions.insert(item, self.items.len());
        self.items.push(item);
        true
    }

    /// Remove `item` by swapping it with the last element; returns false if absent
    pub fn remove(&mut self, item: usize) -> bool {
        let Some(position) = self.positions.remove(&item) else {
            return false;
        };
        self.items.swap_remove(position);
        if let Some(&moved) = self.items.get(position) {
            self.positions.insert(moved, position);
        }
        true
    }

    pub fn contains(&self, item: usize) -> bool {
        self.positions.contains_key(&item)
    }

    /// Uniformly random member, without removing it
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.items[rng.gen_range(0..self.items.len())])
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_range() {
        let set = BlockAddressSet::with_range(4);
        assert_eq!(set.len(), 4);
        assert!((0..4).all(|i| set.contains(i)));
        assert!(!set.contains(4));
    }

    #[test]
    fn test_remove_keeps_positions_consistent() {
        let mut set = BlockAddressSet::with_range(5);
        assert!(set.remove(1));
        assert!(!set.remove(1));
        assert!(set.remove(4));
        assert!(set.remove(0));
        assert_eq!(set.len(), 2);
        assert!(set.contains(2));
        assert!(set.contains(3));
        assert!(set.remove(3));
        assert!(set.remove(2));
        assert!(set.is_empty());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut set = BlockAddressSet::new();
        assert!(set.insert(7));
        assert!(!set.insert(7));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_random_only_returns_members() {
        let mut set = BlockAddressSet::with_range(10);
        for i in (0..10).step_by(2) {
            set.remove(i);
        }
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let pick = set.random(&mut rng).unwrap();
            assert_eq!(pick % 2, 1);
        }
        assert_eq!(BlockAddressSet::new().random(&mut rng), None);
    }
}
