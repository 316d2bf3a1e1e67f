// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Top-down construction of a tight tree from a set of bodies.

use std::cmp::Ordering;

use crate::allocator::{FreeList, INVALID_INDEX, NodeHandle, ReleaseBatch};
use crate::error::{BroadPhaseError, Result};
use crate::node::{NUM_CHILDREN, Node};
use crate::tracking::BodyLocation;
use crate::types::{BodyId, BoundingBox};

/// Output of [`build`]: a tree that is not yet reachable from any root.
#[derive(Debug)]
pub(crate) struct BuiltTree {
    /// Root node, or [`INVALID_INDEX`] for an empty body set.
    pub(crate) root: u32,
    /// Exact bounds of the whole tree.
    pub(crate) bounds: BoundingBox,
    /// Where every body ended up.
    pub(crate) locations: Vec<(BodyId, BodyLocation)>,
}

struct Builder<'a> {
    nodes: &'a FreeList<Node>,
    acquired: Vec<NodeHandle>,
    locations: Vec<(BodyId, BodyLocation)>,
}

/// Build a tree over `bodies`, reordering the slice in the process.
///
/// Every child box in the result is the exact union of what lies below it. If the allocator
/// runs out, the nodes acquired so far are released in one batch.
pub(crate) fn build(
    nodes: &FreeList<Node>,
    bodies: &mut [(BodyId, BoundingBox)],
) -> Result<BuiltTree> {
    if bodies.is_empty() {
        return Ok(BuiltTree {
            root: INVALID_INDEX,
            bounds: BoundingBox::EMPTY,
            locations: Vec::new(),
        });
    }
    let mut builder = Builder {
        nodes,
        acquired: Vec::with_capacity(bodies.len() / 2 + 1),
        locations: Vec::with_capacity(bodies.len()),
    };
    match builder.node(bodies, INVALID_INDEX) {
        Ok((root, bounds)) => Ok(BuiltTree {
            root,
            bounds,
            locations: builder.locations,
        }),
        Err(e) => {
            release_all(nodes, builder.acquired);
            Err(e)
        }
    }
}

/// Return a set of unpublished nodes to the allocator.
pub(crate) fn release_all(nodes: &FreeList<Node>, handles: impl IntoIterator<Item = NodeHandle>) {
    let mut batch = ReleaseBatch::new();
    for h in handles {
        nodes.add_to_batch(&mut batch, h);
    }
    nodes.release_batch(batch);
}

impl Builder<'_> {
    fn acquire(&mut self, is_leaf: bool, parent: u32) -> Result<u32> {
        let handle = self
            .nodes
            .acquire()
            .ok_or(BroadPhaseError::CapacityExhausted {
                capacity: self.nodes.capacity(),
            })?;
        self.acquired.push(handle);
        let node = self.nodes.slot(handle.index());
        node.reset(is_leaf);
        node.parent
            .store(parent, std::sync::atomic::Ordering::SeqCst);
        Ok(handle.index())
    }

    fn node(&mut self, bodies: &mut [(BodyId, BoundingBox)], parent: u32) -> Result<(u32, BoundingBox)> {
        if bodies.len() <= NUM_CHILDREN {
            let index = self.acquire(true, parent)?;
            let leaf = self.nodes.slot(index);
            let mut bounds = BoundingBox::EMPTY;
            for (slot, (id, b)) in bodies.iter().enumerate() {
                leaf.children[slot].store(id.raw(), std::sync::atomic::Ordering::SeqCst);
                leaf.child_bounds[slot].store(b);
                bounds.encapsulate(b);
                self.locations.push((*id, BodyLocation::new(index, slot)));
            }
            return Ok((index, bounds));
        }

        let index = self.acquire(false, parent)?;
        let mut groups: [&mut [(BodyId, BoundingBox)]; NUM_CHILDREN] = Default::default();
        let count = split(bodies, &mut groups);
        let mut bounds = BoundingBox::EMPTY;
        for (slot, group) in groups.into_iter().take(count).enumerate() {
            let (child, child_bounds) = self.node(group, index)?;
            let node = self.nodes.slot(index);
            node.children[slot].store(child, std::sync::atomic::Ordering::SeqCst);
            node.child_bounds[slot].store(&child_bounds);
            bounds.encapsulate(&child_bounds);
        }
        Ok((index, bounds))
    }
}

/// Split point for `n` bodies: about half, rounded up to fill whole leaves.
fn split_point(n: usize) -> usize {
    (n / 2).next_multiple_of(NUM_CHILDREN).min(n - 1)
}

/// Partition `bodies` along the largest axis of their centers.
fn halve(bodies: &mut [(BodyId, BoundingBox)]) -> (&mut [(BodyId, BoundingBox)], &mut [(BodyId, BoundingBox)]) {
    let centers = BoundingBox::from_points(bodies.iter().map(|(_, b)| b.center()));
    let axis = centers.largest_axis();
    let mid = split_point(bodies.len());
    bodies.select_nth_unstable_by(mid, |a, b| {
        a.1.center()[axis]
            .partial_cmp(&b.1.center()[axis])
            .unwrap_or(Ordering::Equal)
    });
    bodies.split_at_mut(mid)
}

/// Split more than one leaf worth of bodies into two to four groups.
fn split<'a>(
    bodies: &'a mut [(BodyId, BoundingBox)],
    out: &mut [&'a mut [(BodyId, BoundingBox)]; NUM_CHILDREN],
) -> usize {
    let (left, right) = halve(bodies);
    let mut count = 0;
    for half in [left, right] {
        if half.len() > NUM_CHILDREN {
            let (a, b) = halve(half);
            out[count] = a;
            out[count + 1] = b;
            count += 2;
        } else {
            out[count] = half;
            count += 1;
        }
    }
    count
}
