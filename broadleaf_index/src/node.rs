// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Quad-branching tree nodes with atomically widened child boxes.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use glam::Vec3;

use crate::allocator::INVALID_INDEX;
use crate::types::BoundingBox;

/// Branching factor of the tree, and bucket size of a leaf.
pub const NUM_CHILDREN: usize = 4;

/// A bounding box stored as six `f32` bit patterns.
///
/// Readers may observe a box mid-widen; every intermediate state is at least as large
/// as the box before the widen started, so it is always a conservative bound.
#[derive(Default)]
pub(crate) struct AtomicBounds {
    min: [AtomicU32; 3],
    max: [AtomicU32; 3],
}

impl AtomicBounds {
    pub(crate) fn load(&self) -> BoundingBox {
        let ld = |a: &AtomicU32| f32::from_bits(a.load(Ordering::SeqCst));
        BoundingBox::new(
            Vec3::new(ld(&self.min[0]), ld(&self.min[1]), ld(&self.min[2])),
            Vec3::new(ld(&self.max[0]), ld(&self.max[1]), ld(&self.max[2])),
        )
    }

    /// Overwrite the box. Only valid while no other thread may widen it, or when
    /// shrinking a slot that is being detached.
    pub(crate) fn store(&self, b: &BoundingBox) {
        for axis in 0..3 {
            self.min[axis].store(b.min[axis].to_bits(), Ordering::SeqCst);
            self.max[axis].store(b.max[axis].to_bits(), Ordering::SeqCst);
        }
    }

    /// Replace the box while readers may be traversing it.
    ///
    /// The box first grows to the union of the old and new boxes, then shrinks one scalar
    /// at a time, so every intermediate state contains `b`.
    pub(crate) fn move_to(&self, b: &BoundingBox) {
        self.widen(b);
        for axis in 0..3 {
            self.min[axis].store(b.min[axis].to_bits(), Ordering::SeqCst);
            self.max[axis].store(b.max[axis].to_bits(), Ordering::SeqCst);
        }
    }

    pub(crate) fn reset(&self) {
        self.store(&BoundingBox::EMPTY);
    }

    /// Grow the box to enclose `b` with one CAS loop per scalar.
    pub(crate) fn widen(&self, b: &BoundingBox) {
        for axis in 0..3 {
            let lo = b.min[axis];
            let _ = self.min[axis].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                (lo < f32::from_bits(bits)).then_some(lo.to_bits())
            });
            let hi = b.max[axis];
            let _ = self.max[axis].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                (hi > f32::from_bits(bits)).then_some(hi.to_bits())
            });
        }
    }
}

/// A tree node.
///
/// Each of the four child slots has its own box. In an interior node a child slot holds
/// a node index; in a leaf it holds a raw body id. Empty slots hold [`INVALID_INDEX`]
/// and [`BoundingBox::EMPTY`].
pub struct Node {
    pub(crate) child_bounds: [AtomicBounds; NUM_CHILDREN],
    pub(crate) children: [AtomicU32; NUM_CHILDREN],
    pub(crate) parent: AtomicU32,
    pub(crate) is_leaf: AtomicBool,
}

impl Default for Node {
    fn default() -> Self {
        let node = Self {
            child_bounds: Default::default(),
            children: [const { AtomicU32::new(INVALID_INDEX) }; NUM_CHILDREN],
            parent: AtomicU32::new(INVALID_INDEX),
            is_leaf: AtomicBool::new(true),
        };
        node.reset(true);
        node
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("is_leaf", &self.is_leaf())
            .field("children", &self.child_ids())
            .field("bounds", &self.bounds())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Clear a freshly acquired node.
    pub(crate) fn reset(&self, is_leaf: bool) {
        for (slot, bounds) in self.children.iter().zip(&self.child_bounds) {
            slot.store(INVALID_INDEX, Ordering::SeqCst);
            bounds.reset();
        }
        self.parent.store(INVALID_INDEX, Ordering::SeqCst);
        self.is_leaf.store(is_leaf, Ordering::SeqCst);
    }

    /// Whether the child slots hold body ids.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.is_leaf.load(Ordering::SeqCst)
    }

    /// Raw child slot values.
    pub fn child_ids(&self) -> [u32; NUM_CHILDREN] {
        core::array::from_fn(|i| self.children[i].load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn child(&self, slot: usize) -> u32 {
        self.children[slot].load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn child_box(&self, slot: usize) -> BoundingBox {
        self.child_bounds[slot].load()
    }

    #[inline]
    pub(crate) fn parent(&self) -> u32 {
        self.parent.load(Ordering::SeqCst)
    }

    /// Union of all child boxes.
    pub fn bounds(&self) -> BoundingBox {
        self.child_bounds
            .iter()
            .fold(BoundingBox::EMPTY, |acc, b| acc.union(&b.load()))
    }

    /// Slot currently holding `value`, if any.
    pub(crate) fn find_child(&self, value: u32) -> Option<usize> {
        (0..NUM_CHILDREN).find(|&i| self.child(i) == value)
    }

    /// Number of non-empty child slots.
    pub(crate) fn child_count(&self) -> usize {
        (0..NUM_CHILDREN)
            .filter(|&i| self.child(i) != INVALID_INDEX)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn bb(min: [f32; 3], max: [f32; 3]) -> BoundingBox {
        BoundingBox::new(Vec3::from(min), Vec3::from(max))
    }

    #[test]
    fn widen_from_empty_is_exact() {
        let a = AtomicBounds::default();
        a.reset();
        let b = bb([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]);
        a.widen(&b);
        assert_eq!(a.load(), b);
        a.widen(&b);
        assert_eq!(a.load(), b, "widen is idempotent");
    }

    #[test]
    fn widen_never_shrinks() {
        let a = AtomicBounds::default();
        a.store(&bb([0.0; 3], [10.0; 3]));
        a.widen(&bb([2.0; 3], [3.0; 3]));
        assert_eq!(a.load(), bb([0.0; 3], [10.0; 3]));
        a.widen(&bb([-1.0, 5.0, 5.0], [5.0, 5.0, 12.0]));
        assert_eq!(a.load(), bb([-1.0, 0.0, 0.0], [10.0, 10.0, 12.0]));
    }

    #[test]
    fn move_to_lands_on_the_new_box() {
        let a = AtomicBounds::default();
        a.store(&bb([0.0; 3], [1.0; 3]));
        let far = bb([5.0, -3.0, 0.5], [6.0, -2.0, 0.75]);
        a.move_to(&far);
        assert_eq!(a.load(), far);
        // Shrinking inside the old box works too.
        let inner = bb([5.25, -2.5, 0.5], [5.5, -2.25, 0.5]);
        a.move_to(&inner);
        assert_eq!(a.load(), inner);
    }

    #[test]
    fn moving_box_is_never_seen_without_its_target() {
        let a = AtomicBounds::default();
        let target = bb([0.0; 3], [1.0; 3]);
        a.store(&target);
        let elsewhere: Vec<_> = (1..200_u8)
            .map(|i| bb([f32::from(i); 3], [f32::from(i) + 1.0; 3]))
            .collect();
        thread::scope(|s| {
            s.spawn(|| {
                for b in &elsewhere {
                    // Grow around both, then settle back on the target.
                    a.widen(b);
                    a.move_to(&target);
                }
            });
            for _ in 0..2_000 {
                assert!(a.load().contains(&target));
            }
        });
    }

    #[test]
    fn concurrent_widens_converge_to_union() {
        let a = AtomicBounds::default();
        a.reset();
        thread::scope(|s| {
            for t in 0..8_u8 {
                let a = &a;
                s.spawn(move || {
                    for i in 0..500_u16 {
                        let v = f32::from(t) * 1000.0 + f32::from(i);
                        a.widen(&bb([-v, 0.0, 0.0], [v, 1.0, 1.0]));
                    }
                });
            }
        });
        assert_eq!(a.load(), bb([-7499.0, 0.0, 0.0], [7499.0, 1.0, 1.0]));
    }

    #[test]
    fn new_node_is_empty_leaf() {
        let n = Node::default();
        assert!(n.is_leaf());
        assert_eq!(n.child_count(), 0);
        assert!(n.bounds().is_empty());
        assert_eq!(n.parent(), INVALID_INDEX);
    }
}
