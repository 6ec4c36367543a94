// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! A small bijective map.
//!
//! Holds a forward and an inverse `HashMap` that are updated together, so a
//! lookup in either direction is O(1) and the two directions can never
//! disagree.

use std::collections::HashMap;
use std::hash::Hash;

/// Which side of a pair rejected an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone)]
pub struct BiMap<L, R> {
    forward: HashMap<L, R>,
    inverse: HashMap<R, L>,
}

impl<L, R> Default for BiMap<L, R> {
    fn default() -> Self {
        Self {
            forward: HashMap::new(),
            inverse: HashMap::new(),
        }
    }
}

impl<L, R> BiMap<L, R>
where
    L: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair. Never overwrites: if either key is already present the
    /// map is left unchanged and the occupied side is returned.
    pub fn insert(&mut self, left: L, right: R) -> Result<(), Side> {
        if self.forward.contains_key(&left) {
            return Err(Side::Left);
        }
        if self.inverse.contains_key(&right) {
            return Err(Side::Right);
        }
        self.forward.insert(left.clone(), right.clone());
        self.inverse.insert(right, left);
        Ok(())
    }

    pub fn get_by_left(&self, left: &L) -> Option<&R> {
        self.forward.get(left)
    }

    pub fn get_by_right(&self, right: &R) -> Option<&L> {
        self.inverse.get(right)
    }

    pub fn contains_left(&self, left: &L) -> bool {
        self.forward.contains_key(left)
    }

    pub fn contains_right(&self, right: &R) -> bool {
        self.inverse.contains_key(right)
    }

    pub fn remove_by_left(&mut self, left: &L) -> Option<R> {
        let right = self.forward.remove(left)?;
        self.inverse.remove(&right);
        Some(right)
    }

    pub fn remove_by_right(&mut self, right: &R) -> Option<L> {
        let left = self.inverse.remove(right)?;
        self.forward.remove(&left);
        Some(left)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&L, &R)> {
        self.forward.iter()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.inverse.clear();
    }
}
