// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The concurrent quad tree over one broadphase layer.
//!
//! ## Concurrency model
//!
//! Insertion, removal and box updates run lock-free from any number of threads. Structural
//! changes only ever *add* nodes to the published generation:
//!
//! - a body is appended to a free leaf slot with a CAS on the slot,
//! - a full leaf `L` is paired with a new sibling under a fresh interior node `I`, which
//!   is published by claiming `L.parent` and then swapping `I` into the parent slot,
//! - ancestor boxes are widened with per-scalar CAS loops and never shrink.
//!
//! A rebuild ([`QuadTree::update_prepare`] / [`QuadTree::update_finalize`]) builds a
//! disjoint tree and publishes it with a single store of the root word, which pairs the
//! root index with an epoch. Readers pin the epoch they start in; the superseded generation
//! is only returned to the allocator by [`QuadTree::discard_old_tree`] once no reader is
//! pinned to it.
//!
//! Rebuilds must not overlap body mutations on the same tree. [`crate::BroadPhaseQuadTree`]
//! enforces this with its modification lock.

use core::fmt;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use glam::Vec3;
use smallvec::SmallVec;
use tracing::{debug, instrument, trace, warn};

use crate::allocator::{FreeList, INVALID_INDEX, NodeHandle, ReleaseBatch};
use crate::body::{BodyManager, BodyView};
use crate::build::{self, BuiltTree};
use crate::collector::{BroadPhaseCastResult, CollisionCollector};
use crate::error::{BroadPhaseError, Result};
use crate::filter::{DefaultObjectLayerFilter, ObjectLayerFilter, ObjectLayerPairFilter};
use crate::layer::BroadPhaseLayer;
use crate::node::{NUM_CHILDREN, Node};
use crate::query::{
    AABoxCast, AABoxQuery, BoxCastQuery, OrientedBox, OrientedBoxQuery, PointQuery, QueryShape,
    RayCast, RayInvDirection, RayQuery, SphereQuery,
};
use crate::tracking::{BodyLocation, TrackingTable};
use crate::types::{BodyId, BodyPair, BoundingBox};

/// The node arena shared by all trees of a broadphase.
pub type NodeAllocator = FreeList<Node>;

static NEXT_TREE_ID: AtomicU32 = AtomicU32::new(0);

#[inline(always)]
const fn root_word(node: u32, epoch: u32) -> u64 {
    ((epoch as u64) << 32) | node as u64
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "Unpacking the two 32-bit halves of the root word."
)]
#[inline(always)]
const fn split_root_word(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// Dense set of body indices, used to tell active bodies apart during pair finding.
#[derive(Clone, Debug, Default)]
pub struct ActiveBodySet {
    bits: Vec<u64>,
}

impl ActiveBodySet {
    /// Set containing `ids`.
    pub fn new(max_bodies: usize, ids: &[BodyId]) -> Self {
        let mut bits = vec![0_u64; max_bodies.div_ceil(64)];
        for id in ids {
            let i = id.index() as usize;
            if let Some(word) = bits.get_mut(i / 64) {
                *word |= 1 << (i % 64);
            }
        }
        Self { bits }
    }

    /// Whether `id` is in the set.
    #[inline]
    pub fn contains(&self, id: BodyId) -> bool {
        let i = id.index() as usize;
        self.bits
            .get(i / 64)
            .is_some_and(|word| word & (1 << (i % 64)) != 0)
    }
}

/// Token returned by [`QuadTree::update_prepare`].
#[derive(Debug)]
#[must_use = "a prepared rebuild holds nodes until finalized"]
pub struct TreeUpdateState {
    tree_id: u32,
    base_epoch: u32,
    root: u32,
    locations: Vec<(BodyId, BodyLocation)>,
}

impl TreeUpdateState {
    /// Number of bodies in the rebuilt tree.
    pub fn body_count(&self) -> usize {
        self.locations.len()
    }
}

/// Token returned by [`QuadTree::add_bodies_prepare`].
#[derive(Debug)]
#[must_use = "prepared bodies must be finalized or aborted"]
pub struct TreeAddState {
    tree_id: u32,
    root: u32,
    bounds: BoundingBox,
    bodies: Vec<BodyView>,
}

impl TreeAddState {
    /// Bodies carried by this state.
    pub fn bodies(&self) -> &[BodyView] {
        &self.bodies
    }
}

/// A superseded generation waiting for its readers to drain.
#[derive(Debug)]
struct PendingTree {
    epoch: u32,
    batch: ReleaseBatch,
}

/// Keeps the epoch a traversal started in alive.
struct Pin<'a> {
    readers: &'a AtomicU32,
    root: u32,
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Second child of a node created by [`QuadTree::replace_with_pair`].
#[derive(Copy, Clone)]
enum NewChild {
    Body(BodyId, BoundingBox),
    Subtree(u32, BoundingBox),
}

enum PairOutcome {
    Done,
    Retry,
}

/// A concurrent quad tree of bodies.
pub struct QuadTree {
    name: String,
    id: u32,
    layer: BroadPhaseLayer,
    nodes: Arc<NodeAllocator>,
    tracking: Arc<TrackingTable>,
    /// Packed `(root node, epoch)`.
    root: AtomicU64,
    /// Traversals in flight per epoch parity.
    readers: [AtomicU32; 2],
    pending: Mutex<Option<PendingTree>>,
    dirty: AtomicBool,
    body_count: AtomicUsize,
}

impl fmt::Debug for QuadTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (root, epoch) = split_root_word(self.root.load(Ordering::SeqCst));
        f.debug_struct("QuadTree")
            .field("name", &self.name)
            .field("layer", &self.layer)
            .field("root", &root)
            .field("epoch", &epoch)
            .field("bodies", &self.body_count())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

impl QuadTree {
    /// Create an empty tree for `layer`.
    pub fn new(
        name: impl Into<String>,
        layer: BroadPhaseLayer,
        nodes: Arc<NodeAllocator>,
        tracking: Arc<TrackingTable>,
    ) -> Self {
        Self {
            name: name.into(),
            id: NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed),
            layer,
            nodes,
            tracking,
            root: AtomicU64::new(root_word(INVALID_INDEX, 0)),
            readers: [AtomicU32::new(0), AtomicU32::new(0)],
            pending: Mutex::new(None),
            dirty: AtomicBool::new(false),
            body_count: AtomicUsize::new(0),
        }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the tree.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Broadphase layer this tree holds.
    pub fn layer(&self) -> BroadPhaseLayer {
        self.layer
    }

    /// Whether any body is inserted.
    pub fn has_bodies(&self) -> bool {
        self.body_count() > 0
    }

    /// Number of inserted bodies.
    pub fn body_count(&self) -> usize {
        self.body_count.load(Ordering::SeqCst)
    }

    /// Whether the tree changed since the last rebuild.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Whether a rebuild may start: the previous generation has been discarded.
    pub fn can_be_updated(&self) -> bool {
        self.lock_pending().is_none()
    }

    /// Handle of the current root node, if any.
    pub fn root_handle(&self) -> Option<NodeHandle> {
        let (root, _) = split_root_word(self.root.load(Ordering::SeqCst));
        (root != INVALID_INDEX).then(|| self.nodes.handle_at(root))
    }

    /// Current epoch; bumped by every rebuild.
    pub fn epoch(&self) -> u32 {
        split_root_word(self.root.load(Ordering::SeqCst)).1
    }

    /// Bounds of everything in the tree. May be looser than the bodies until the next rebuild.
    pub fn bounds(&self) -> BoundingBox {
        let pin = self.pin();
        if pin.root == INVALID_INDEX {
            BoundingBox::EMPTY
        } else {
            self.nodes.slot(pin.root).bounds()
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingTree>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pin(&self) -> Pin<'_> {
        loop {
            let (_, epoch) = split_root_word(self.root.load(Ordering::SeqCst));
            let readers = &self.readers[(epoch & 1) as usize];
            readers.fetch_add(1, Ordering::SeqCst);
            let (root, current) = split_root_word(self.root.load(Ordering::SeqCst));
            if current == epoch {
                return Pin { readers, root };
            }
            readers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn acquire(&self, is_leaf: bool) -> Result<NodeHandle> {
        let handle = self.nodes.acquire().ok_or_else(|| {
            warn!(tree = %self.name, capacity = self.nodes.capacity(), "node allocator exhausted");
            BroadPhaseError::CapacityExhausted {
                capacity: self.nodes.capacity(),
            }
        })?;
        self.nodes.slot(handle.index()).reset(is_leaf);
        Ok(handle)
    }

    #[inline]
    fn node(&self, index: u32) -> &Node {
        self.nodes.slot(index)
    }

    /// Widen the boxes that enclose `child` on the way up to the root.
    fn widen_parents(&self, mut child: u32, bounds: &BoundingBox) {
        loop {
            let parent = self.node(child).parent();
            if parent == INVALID_INDEX {
                return;
            }
            match self.node(parent).find_child(child) {
                Some(slot) => {
                    self.node(parent).child_bounds[slot].widen(bounds);
                    child = parent;
                }
                // `child` was claimed by a new parent that is not linked in yet.
                None => hint::spin_loop(),
            }
        }
    }

    /// Cost of adding `bounds` to `current`: growth of the box, then its size.
    fn enlargement(current: &BoundingBox, bounds: &BoundingBox) -> (f32, f32) {
        let area = current.surface_area();
        (current.union(bounds).surface_area() - area, area)
    }

    /// Best interior child for `bounds`, and the first empty slot.
    fn choose_child(&self, node: &Node, bounds: &BoundingBox) -> (Option<(usize, u32)>, Option<usize>) {
        let mut best: Option<(usize, u32, (f32, f32))> = None;
        let mut empty = None;
        for slot in 0..NUM_CHILDREN {
            let child = node.child(slot);
            if child == INVALID_INDEX {
                empty = empty.or(Some(slot));
                continue;
            }
            let cost = Self::enlargement(&node.child_box(slot), bounds);
            if best.is_none_or(|(_, _, c)| cost < c) {
                best = Some((slot, child, cost));
            }
        }
        (best.map(|(slot, child, _)| (slot, child)), empty)
    }

    /// Put `id` into the published tree. Tracking layers must already be set.
    fn insert_body(&self, id: BodyId, bounds: &BoundingBox) -> Result<()> {
        'restart: loop {
            let (root, epoch) = split_root_word(self.root.load(Ordering::SeqCst));
            if root == INVALID_INDEX {
                let leaf = self.acquire(true)?;
                self.fill_new_leaf(leaf.index(), INVALID_INDEX, id, bounds);
                if self
                    .root
                    .compare_exchange(
                        root_word(INVALID_INDEX, epoch),
                        root_word(leaf.index(), epoch),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    self.body_count.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                self.nodes.release(leaf);
                continue 'restart;
            }

            let mut index = root;
            loop {
                let node = self.node(index);
                if node.is_leaf() {
                    if self.try_append(index, id, bounds) {
                        self.body_count.fetch_add(1, Ordering::SeqCst);
                        return Ok(());
                    }
                    match self.replace_with_pair(index, NewChild::Body(id, *bounds))? {
                        PairOutcome::Done => {
                            self.body_count.fetch_add(1, Ordering::SeqCst);
                            return Ok(());
                        }
                        PairOutcome::Retry => continue 'restart,
                    }
                }

                let (best, empty) = self.choose_child(node, bounds);
                let full_leaf = best.is_some_and(|(_, child)| {
                    let c = self.node(child);
                    c.is_leaf() && c.child_count() == NUM_CHILDREN
                });
                match (best, empty) {
                    (Some(_), Some(slot)) if full_leaf => {
                        if self.attach_new_leaf(index, slot, id, bounds)? {
                            self.body_count.fetch_add(1, Ordering::SeqCst);
                            return Ok(());
                        }
                    }
                    (None, Some(slot)) => {
                        if self.attach_new_leaf(index, slot, id, bounds)? {
                            self.body_count.fetch_add(1, Ordering::SeqCst);
                            return Ok(());
                        }
                    }
                    (Some((_, child)), _) => index = child,
                    (None, None) => continue 'restart,
                }
            }
        }
    }

    fn fill_new_leaf(&self, leaf: u32, parent: u32, id: BodyId, bounds: &BoundingBox) {
        let node = self.node(leaf);
        node.parent.store(parent, Ordering::SeqCst);
        node.children[0].store(id.raw(), Ordering::SeqCst);
        node.child_bounds[0].store(bounds);
        self.tracking.set_location(id, BodyLocation::new(leaf, 0));
    }

    /// Append into a free slot of `leaf`. Returns `false` when the leaf is full.
    fn try_append(&self, leaf: u32, id: BodyId, bounds: &BoundingBox) -> bool {
        let node = self.node(leaf);
        for slot in 0..NUM_CHILDREN {
            if node.children[slot]
                .compare_exchange(INVALID_INDEX, id.raw(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.tracking.set_location(id, BodyLocation::new(leaf, slot));
                node.child_bounds[slot].widen(bounds);
                self.widen_parents(leaf, bounds);
                return true;
            }
        }
        false
    }

    /// Hang a new single-body leaf into the empty `slot` of interior node `index`.
    fn attach_new_leaf(&self, index: u32, slot: usize, id: BodyId, bounds: &BoundingBox) -> Result<bool> {
        let leaf = self.acquire(true)?;
        self.fill_new_leaf(leaf.index(), index, id, bounds);
        let node = self.node(index);
        if node.children[slot]
            .compare_exchange(INVALID_INDEX, leaf.index(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.nodes.release(leaf);
            return Ok(false);
        }
        node.child_bounds[slot].widen(bounds);
        self.widen_parents(index, bounds);
        Ok(true)
    }

    /// Replace `existing` by a new interior node holding `existing` and `new`.
    fn replace_with_pair(&self, existing: u32, new: NewChild) -> Result<PairOutcome> {
        let interior = self.acquire(false)?;
        let (new_index, new_bounds, new_leaf) = match new {
            NewChild::Body(id, bounds) => match self.acquire(true) {
                Ok(leaf) => {
                    self.fill_new_leaf(leaf.index(), interior.index(), id, &bounds);
                    (leaf.index(), bounds, Some(leaf))
                }
                Err(e) => {
                    self.nodes.release(interior);
                    return Err(e);
                }
            },
            NewChild::Subtree(root, bounds) => {
                self.node(root).parent.store(interior.index(), Ordering::SeqCst);
                (root, bounds, None)
            }
        };

        let old = self.node(existing);
        let parent = old.parent();
        let pair = self.node(interior.index());
        pair.parent.store(parent, Ordering::SeqCst);
        pair.children[0].store(existing, Ordering::SeqCst);
        pair.child_bounds[0].store(&old.bounds());
        pair.children[1].store(new_index, Ordering::SeqCst);
        pair.child_bounds[1].store(&new_bounds);

        // Claim `existing`; only the claimer may swap it out of its parent slot.
        if old
            .parent
            .compare_exchange(parent, interior.index(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.nodes.release(interior);
            if let Some(leaf) = new_leaf {
                self.nodes.release(leaf);
            }
            return Ok(PairOutcome::Retry);
        }

        if parent == INVALID_INDEX {
            let mut word = self.root.load(Ordering::SeqCst);
            loop {
                let (root, epoch) = split_root_word(word);
                debug_assert_eq!(root, existing, "claimed root was replaced");
                match self.root.compare_exchange(
                    word,
                    root_word(interior.index(), epoch),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(actual) => word = actual,
                }
            }
        } else {
            let p = self.node(parent);
            let slot = p.find_child(existing);
            debug_assert!(slot.is_some(), "claimed node missing from its parent");
            if let Some(slot) = slot {
                p.children[slot].store(interior.index(), Ordering::SeqCst);
            }
        }

        // Bodies appended to `existing` before the claim may be missing from the snapshot.
        let pair_bounds = old.bounds().union(&new_bounds);
        pair.child_bounds[0].widen(&old.bounds());
        self.widen_parents(interior.index(), &pair_bounds);
        Ok(PairOutcome::Done)
    }

    /// Unlink `id` from its leaf slot without touching its layers.
    fn detach(&self, id: BodyId) -> bool {
        let location = self.tracking.location(id);
        if !location.is_valid() {
            debug_assert!(false, "{id:?} is not in tree {}", self.name);
            return false;
        }
        let leaf = self.node(location.node());
        // A stale id resolves to the location of the slot's new occupant.
        if leaf.child(location.slot()) != id.raw() {
            debug_assert!(false, "tracking for {id:?} is stale");
            return false;
        }
        // The box goes first: once the slot is free an append may claim it and widen it.
        leaf.child_bounds[location.slot()].reset();
        if leaf.children[location.slot()]
            .compare_exchange(id.raw(), INVALID_INDEX, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug_assert!(false, "{id:?} left its slot while being removed");
            return false;
        }
        self.tracking.set_location(id, BodyLocation::INVALID);
        self.body_count.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Remove bodies. Stale ids are ignored (and assert in debug builds).
    ///
    /// Nodes are never freed here; emptied leaves stay until the next rebuild.
    pub fn remove_bodies(&self, ids: &[BodyId]) {
        for &id in ids {
            if self.detach(id) {
                self.tracking.clear(id);
            }
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// React to new body boxes.
    ///
    /// A body whose new box still fits inside the box its parent keeps for its leaf only
    /// has its own slot updated. Otherwise it is removed and inserted again.
    pub fn notify_bodies_aabb_changed(&self, bodies: &[BodyView]) -> Result<()> {
        for body in bodies {
            let location = self.tracking.location(body.id);
            if !location.is_valid() {
                debug_assert!(false, "{:?} is not in tree {}", body.id, self.name);
                continue;
            }
            let leaf = self.node(location.node());
            if leaf.child(location.slot()) != body.id.raw() {
                debug_assert!(false, "tracking for {:?} is stale", body.id);
                continue;
            }
            let current = leaf.child_box(location.slot());
            if current == body.bounds {
                continue;
            }
            self.dirty.store(true, Ordering::SeqCst);

            let parent = leaf.parent();
            let fits = parent == INVALID_INDEX
                || self
                    .node(parent)
                    .find_child(location.node())
                    .is_some_and(|slot| self.node(parent).child_box(slot).contains(&body.bounds));
            if fits {
                leaf.child_bounds[location.slot()].move_to(&body.bounds);
                // Covers a concurrent split that snapshotted the leaf before the store.
                self.widen_parents(location.node(), &body.bounds);
            } else if self.detach(body.id) {
                if let Err(e) = self.insert_body(body.id, &body.bounds) {
                    self.tracking.clear(body.id);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Build a subtree for `bodies` without publishing it.
    ///
    /// Tracking locations of the bodies point into the subtree afterwards.
    pub fn add_bodies_prepare(&self, bodies: &[BodyView]) -> Result<TreeAddState> {
        let mut entries: Vec<_> = bodies.iter().map(|b| (b.id, b.bounds)).collect();
        let BuiltTree {
            root,
            bounds,
            locations,
        } = build::build(&self.nodes, &mut entries)?;
        for (id, location) in locations {
            self.tracking.set_location(id, location);
        }
        Ok(TreeAddState {
            tree_id: self.id,
            root,
            bounds,
            bodies: bodies.to_vec(),
        })
    }

    /// Publish bodies prepared by [`QuadTree::add_bodies_prepare`].
    ///
    /// If the allocator runs out while placing them, the bodies not yet placed are left
    /// untracked and the error is returned. A prepared subtree that cannot be attached is
    /// released as a whole.
    pub fn add_bodies_finalize(&self, state: TreeAddState) -> Result<()> {
        debug_assert_eq!(state.tree_id, self.id, "add state belongs to another tree");
        for body in &state.bodies {
            self.tracking.set_layers(body.id, self.layer, body.object_layer);
        }
        if state.root == INVALID_INDEX {
            return Ok(());
        }
        self.dirty.store(true, Ordering::SeqCst);

        if self.node(state.root).is_leaf() {
            // Few bodies: fill existing buckets instead of attaching a sparse leaf.
            self.nodes.release(self.nodes.handle_at(state.root));
            for (i, body) in state.bodies.iter().enumerate() {
                if let Err(e) = self.insert_body(body.id, &body.bounds) {
                    for rest in &state.bodies[i..] {
                        self.tracking.clear(rest.id);
                    }
                    return Err(e);
                }
            }
            return Ok(());
        }

        if let Err(e) = self.attach_subtree(state.root, &state.bounds) {
            self.add_bodies_abort(state);
            return Err(e);
        }
        self.body_count
            .fetch_add(state.bodies.len(), Ordering::SeqCst);
        Ok(())
    }

    fn attach_subtree(&self, subtree: u32, bounds: &BoundingBox) -> Result<()> {
        'restart: loop {
            let (root, epoch) = split_root_word(self.root.load(Ordering::SeqCst));
            if root == INVALID_INDEX {
                self.node(subtree).parent.store(INVALID_INDEX, Ordering::SeqCst);
                if self
                    .root
                    .compare_exchange(
                        root_word(INVALID_INDEX, epoch),
                        root_word(subtree, epoch),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    return Ok(());
                }
                continue 'restart;
            }

            let mut index = root;
            loop {
                let node = self.node(index);
                if node.is_leaf() {
                    match self.replace_with_pair(index, NewChild::Subtree(subtree, *bounds))? {
                        PairOutcome::Done => return Ok(()),
                        PairOutcome::Retry => continue 'restart,
                    }
                }
                let (best, empty) = self.choose_child(node, bounds);
                if let Some(slot) = empty {
                    self.node(subtree).parent.store(index, Ordering::SeqCst);
                    if node.children[slot]
                        .compare_exchange(INVALID_INDEX, subtree, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        node.child_bounds[slot].widen(bounds);
                        self.widen_parents(index, bounds);
                        return Ok(());
                    }
                    continue;
                }
                match best {
                    Some((_, child)) => index = child,
                    None => continue 'restart,
                }
            }
        }
    }

    /// Drop bodies prepared by [`QuadTree::add_bodies_prepare`] without publishing them.
    pub fn add_bodies_abort(&self, state: TreeAddState) {
        debug_assert_eq!(state.tree_id, self.id, "add state belongs to another tree");
        for body in &state.bodies {
            self.tracking.clear(body.id);
        }
        let mut handles = Vec::new();
        self.collect_nodes(state.root, |index| handles.push(self.nodes.handle_at(index)));
        build::release_all(&self.nodes, handles);
    }

    /// Visit every node of the subtree at `root`.
    fn collect_nodes(&self, root: u32, mut f: impl FnMut(u32)) {
        if root == INVALID_INDEX {
            return;
        }
        let mut stack: SmallVec<[u32; 64]> = SmallVec::new();
        stack.push(root);
        while let Some(index) = stack.pop() {
            f(index);
            let node = self.node(index);
            if !node.is_leaf() {
                stack.extend(
                    node.child_ids()
                        .into_iter()
                        .filter(|&c| c != INVALID_INDEX),
                );
            }
        }
    }

    /// Build a tight replacement for the current tree from the bodies it holds.
    ///
    /// Box values come from `bodies`; a body the manager no longer knows keeps the box
    /// stored in its leaf. The live tree is not modified.
    #[instrument(skip_all, fields(tree = %self.name))]
    pub fn update_prepare(&self, bodies: &dyn BodyManager) -> Result<TreeUpdateState> {
        let pin = self.pin();
        let mut entries = Vec::with_capacity(self.body_count());
        self.collect_nodes(pin.root, |index| {
            let node = self.node(index);
            if !node.is_leaf() {
                return;
            }
            for slot in 0..NUM_CHILDREN {
                let raw = node.child(slot);
                if raw == INVALID_INDEX {
                    continue;
                }
                let id = BodyId::from_raw(raw);
                let bounds = bodies
                    .body(id)
                    .map_or_else(|| node.child_box(slot), |view| view.bounds);
                entries.push((id, bounds));
            }
        });
        let (_, base_epoch) = split_root_word(self.root.load(Ordering::SeqCst));
        drop(pin);

        let built = build::build(&self.nodes, &mut entries).inspect_err(|e| {
            warn!(error = %e, bodies = entries.len(), "rebuild skipped");
        })?;
        debug!(bodies = built.locations.len(), "rebuild prepared");
        Ok(TreeUpdateState {
            tree_id: self.id,
            base_epoch,
            root: built.root,
            locations: built.locations,
        })
    }

    /// Publish a rebuilt tree and queue the old generation for reclamation.
    #[instrument(skip_all, fields(tree = %self.name))]
    pub fn update_finalize(&self, state: TreeUpdateState) {
        debug_assert_eq!(state.tree_id, self.id, "update state belongs to another tree");
        let mut pending = self.lock_pending();
        debug_assert!(pending.is_none(), "previous generation was not discarded");

        let (old_root, epoch) = split_root_word(self.root.load(Ordering::SeqCst));
        debug_assert_eq!(epoch, state.base_epoch, "tree changed epoch since prepare");
        self.root
            .store(root_word(state.root, epoch.wrapping_add(1)), Ordering::SeqCst);
        for (id, location) in &state.locations {
            self.tracking.set_location(*id, *location);
        }

        let mut batch = ReleaseBatch::new();
        self.collect_nodes(old_root, |index| {
            self.nodes.add_to_batch(&mut batch, self.nodes.handle_at(index));
        });
        debug!(retired = batch.len(), epoch, "rebuild published");
        if !batch.is_empty() {
            *pending = Some(PendingTree { epoch, batch });
        }
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// Free the superseded generation if no traversal still uses it.
    ///
    /// Returns `true` when nothing is pending afterwards.
    pub fn discard_old_tree(&self) -> bool {
        let mut pending = self.lock_pending();
        let Some(old) = pending.take() else {
            return true;
        };
        let readers = self.readers[(old.epoch & 1) as usize].load(Ordering::SeqCst);
        if readers != 0 {
            trace!(tree = %self.name, epoch = old.epoch, readers, "old tree still in use");
            *pending = Some(old);
            return false;
        }
        debug!(tree = %self.name, epoch = old.epoch, nodes = old.batch.len(), "old tree discarded");
        self.nodes.release_batch(old.batch);
        true
    }

    /// Visit bodies accepted by `shape`, nearest first for casts.
    fn walk<Q, C, F>(
        &self,
        shape: &Q,
        object_filter: &dyn ObjectLayerFilter,
        collector: &mut C,
        mut report: F,
    ) where
        Q: QueryShape,
        C: CollisionCollector + ?Sized,
        F: FnMut(&mut C, BodyId, f32),
    {
        let pin = self.pin();
        if pin.root == INVALID_INDEX || collector.should_early_out() {
            return;
        }
        let mut stack: SmallVec<[(u32, f32); 64]> = SmallVec::new();
        stack.push((pin.root, -f32::MAX));
        while let Some((index, key)) = stack.pop() {
            if key >= collector.early_out_fraction() {
                continue;
            }
            let node = self.node(index);
            let ids = node.child_ids();
            let keys: [Option<f32>; NUM_CHILDREN] = core::array::from_fn(|slot| {
                if ids[slot] == INVALID_INDEX {
                    None
                } else {
                    shape.test(&node.child_box(slot))
                }
            });

            if node.is_leaf() {
                for slot in 0..NUM_CHILDREN {
                    let Some(key) = keys[slot] else { continue };
                    // The slot may have been reused after its box was read.
                    if node.child(slot) != ids[slot] || key >= collector.early_out_fraction() {
                        continue;
                    }
                    let id = BodyId::from_raw(ids[slot]);
                    if !object_filter.should_collide(self.tracking.object_layer(id)) {
                        continue;
                    }
                    report(collector, id, key);
                    if collector.should_early_out() {
                        return;
                    }
                }
            } else {
                let mut next: SmallVec<[(u32, f32); NUM_CHILDREN]> = ids
                    .into_iter()
                    .zip(keys)
                    .filter_map(|(child, key)| key.map(|k| (child, k)))
                    .collect();
                // Furthest first so the nearest child is popped next.
                next.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
                stack.extend(next);
            }
        }
    }

    /// Run a query, feeding body snapshots to collectors that want them.
    pub(crate) fn query<Q, C>(
        &self,
        shape: &Q,
        object_filter: &dyn ObjectLayerFilter,
        bodies: Option<&dyn BodyManager>,
        collector: &mut C,
    ) where
        Q: QueryShape,
        C: CollisionCollector<Hit = Q::Hit> + ?Sized,
    {
        self.walk(shape, object_filter, collector, |c, id, key| {
            if c.wants_body() {
                let Some(view) = bodies.and_then(|b| b.body(id)) else {
                    return;
                };
                c.on_body(&view);
            }
            c.add_hit(shape.hit(id, key));
        });
    }

    /// Bodies whose box is crossed by `ray`.
    pub fn cast_ray<C>(&self, ray: &RayCast, collector: &mut C, object_filter: &dyn ObjectLayerFilter)
    where
        C: CollisionCollector<Hit = BroadPhaseCastResult> + ?Sized,
    {
        let shape = RayQuery(RayInvDirection::new(ray.origin, ray.direction));
        self.query(&shape, object_filter, None, collector);
    }

    /// Bodies whose box is touched by `cast` on its way.
    pub fn cast_aabox<C>(&self, cast: &AABoxCast, collector: &mut C, object_filter: &dyn ObjectLayerFilter)
    where
        C: CollisionCollector<Hit = BroadPhaseCastResult> + ?Sized,
    {
        self.query(&BoxCastQuery::new(cast), object_filter, None, collector);
    }

    /// Bodies whose box overlaps `bounds`.
    pub fn collide_aabox<C>(&self, bounds: &BoundingBox, collector: &mut C, object_filter: &dyn ObjectLayerFilter)
    where
        C: CollisionCollector<Hit = BodyId> + ?Sized,
    {
        self.query(&AABoxQuery(*bounds), object_filter, None, collector);
    }

    /// Bodies whose box overlaps a sphere.
    pub fn collide_sphere<C>(
        &self,
        center: Vec3,
        radius: f32,
        collector: &mut C,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized,
    {
        let shape = SphereQuery {
            center,
            radius_sq: radius * radius,
        };
        self.query(&shape, object_filter, None, collector);
    }

    /// Bodies whose box contains `point`.
    pub fn collide_point<C>(&self, point: Vec3, collector: &mut C, object_filter: &dyn ObjectLayerFilter)
    where
        C: CollisionCollector<Hit = BodyId> + ?Sized,
    {
        self.query(&PointQuery(point), object_filter, None, collector);
    }

    /// Bodies whose box overlaps an oriented box.
    pub fn collide_oriented_box<C>(
        &self,
        obb: &OrientedBox,
        collector: &mut C,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized,
    {
        self.query(&OrientedBoxQuery::new(obb), object_filter, None, collector);
    }

    /// Report every pair of an active body and an overlapping body of this tree.
    ///
    /// `active` bodies may live in any tree. A pair of two active bodies is reported only
    /// from the one with the smaller id, so each unordered pair appears once.
    pub fn find_colliding_pairs<C>(
        &self,
        active: &[BodyView],
        active_set: &ActiveBodySet,
        speculative_margin: f32,
        pair_filter: &dyn ObjectLayerPairFilter,
        collector: &mut C,
    ) where
        C: CollisionCollector<Hit = BodyPair> + ?Sized,
    {
        let margin = Vec3::splat(speculative_margin);
        for body in active {
            let filter = DefaultObjectLayerFilter::new(pair_filter, body.object_layer);
            let shape = AABoxQuery(body.bounds.expanded(margin));
            self.walk(&shape, &filter, collector, |c, other, _| {
                if other == body.id || (other < body.id && active_set.contains(other)) {
                    return;
                }
                c.add_hit(BodyPair::canonical(body.id, other));
            });
            if collector.should_early_out() {
                return;
            }
        }
    }

    /// Check the enclosing-box invariant and leaf/tracking agreement. With `tight`, also
    /// require every box to equal the exact union below it.
    #[cfg(test)]
    pub(crate) fn validate(&self, tight: bool) -> usize {
        let pin = self.pin();
        if pin.root == INVALID_INDEX {
            return 0;
        }
        let mut bodies = 0;
        self.validate_node(pin.root, tight, &mut bodies);
        bodies
    }

    #[cfg(test)]
    fn validate_node(&self, index: u32, tight: bool, bodies: &mut usize) -> BoundingBox {
        let node = self.node(index);
        let mut bounds = BoundingBox::EMPTY;
        for slot in 0..NUM_CHILDREN {
            let child = node.child(slot);
            if child == INVALID_INDEX {
                continue;
            }
            let stored = node.child_box(slot);
            let exact = if node.is_leaf() {
                let id = BodyId::from_raw(child);
                assert_eq!(
                    self.tracking.location(id),
                    BodyLocation::new(index, slot),
                    "tracking out of sync for {id:?}"
                );
                *bodies += 1;
                stored
            } else {
                assert_eq!(self.node(child).parent(), index, "broken parent link");
                self.validate_node(child, tight, bodies)
            };
            assert!(stored.contains(&exact), "box {stored:?} does not enclose {exact:?}");
            if tight && !node.is_leaf() {
                assert_eq!(stored, exact, "box is not tight");
            }
            bounds.encapsulate(&exact);
        }
        bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{AnyHitCollector, BodyHitCollector, CastHitCollector, CollideShapeTraits, PairCollector};
    use crate::filter::{AcceptAll, ObjectLayerPairFilterTable, SpecifiedObjectLayerFilter};
    use crate::layer::ObjectLayer;
    use crate::util::{TestBodies, unit_at};
    use std::thread;

    fn tree(capacity: usize) -> QuadTree {
        QuadTree::new(
            "test",
            BroadPhaseLayer::new(0),
            Arc::new(NodeAllocator::new(capacity)),
            Arc::new(TrackingTable::new(1024)),
        )
    }

    fn add(tree: &QuadTree, views: &[BodyView]) {
        let state = tree.add_bodies_prepare(views).unwrap();
        tree.add_bodies_finalize(state).unwrap();
    }

    fn rebuild(tree: &QuadTree, bodies: &TestBodies) {
        let state = tree.update_prepare(bodies).unwrap();
        tree.update_finalize(state);
        assert!(tree.discard_old_tree(), "no readers are active");
    }

    fn overlapping(tree: &QuadTree, bounds: &BoundingBox) -> Vec<u32> {
        let mut c = BodyHitCollector::new();
        tree.collide_aabox(bounds, &mut c, &AcceptAll);
        let mut ids: Vec<_> = c.hits.iter().map(|id| id.index()).collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn stale_ids_leave_the_slot_occupant_alone() {
        let bodies = TestBodies::default();
        let t = tree(64);
        let a = bodies.set(0, unit_at(0.0, 0.0, 0.0));
        let b = bodies.set(1, unit_at(4.0, 0.0, 0.0));
        add(&t, &[a, b]);

        // Same slot index as `a`, older sequence.
        let stale = BodyId::new(0, 7);
        t.remove_bodies(&[stale]);
        assert_eq!(overlapping(&t, &a.bounds), vec![0]);
        assert_eq!(t.body_count(), 2);
        assert!(t.tracking.location(a.id).is_valid());

        let moved = BodyView {
            id: stale,
            bounds: unit_at(20.0, 0.0, 0.0),
            ..a
        };
        t.notify_bodies_aabb_changed(&[moved]).unwrap();
        assert_eq!(overlapping(&t, &a.bounds), vec![0]);
        assert!(overlapping(&t, &moved.bounds).is_empty());
        t.validate(false);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "is stale")]
    fn stale_remove_asserts_in_debug_builds() {
        let bodies = TestBodies::default();
        let t = tree(64);
        add(&t, &[bodies.set(0, unit_at(0.0, 0.0, 0.0))]);
        t.remove_bodies(&[BodyId::new(0, 7)]);
    }

    #[test]
    fn failed_subtree_attach_releases_the_subtree() {
        let bodies = TestBodies::default();
        let t = tree(4);
        let placed: Vec<_> = (0..4_u32).map(|i| bodies.set(i, unit_at(i as f32 * 2.0, 0.0, 0.0))).collect();
        add(&t, &placed);
        assert_eq!(t.nodes.used(), 1);

        // Five bodies build into an interior node and two leaves; pairing it with the root
        // leaf needs one more node.
        let batch: Vec<_> = (4..9_u32).map(|i| bodies.set(i, unit_at(i as f32 * 2.0, 5.0, 0.0))).collect();
        let state = t.add_bodies_prepare(&batch).unwrap();
        assert_eq!(t.nodes.used(), 4);
        assert!(matches!(
            t.add_bodies_finalize(state),
            Err(BroadPhaseError::CapacityExhausted { capacity: 4 })
        ));

        assert_eq!(t.nodes.used(), 1);
        assert_eq!(t.body_count(), 4);
        assert_eq!(t.tracking.tracked_count(), 4);
        for v in &batch {
            assert!(!t.tracking.location(v.id).is_valid());
            assert!(!t.tracking.is_inserted(v.id));
        }
        let everything = BoundingBox::new(Vec3::splat(-100.0), Vec3::splat(100.0));
        assert_eq!(overlapping(&t, &everything), vec![0, 1, 2, 3]);

        // The same batch fits once the allocator has room.
        let t = tree(8);
        add(&t, &placed);
        add(&t, &batch);
        assert_eq!(t.body_count(), 9);
        assert_eq!(t.validate(false), 9);
    }

    #[test]
    fn ray_hits_then_misses_after_move() {
        let bodies = TestBodies::default();
        let t = tree(64);
        let a = bodies.set(0, BoundingBox::new(Vec3::ZERO, Vec3::ONE));
        let b = bodies.set(1, BoundingBox::new(Vec3::splat(5.0), Vec3::splat(6.0)));
        add(&t, &[a, b]);

        let ray = RayCast::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 0.0).normalize() * 2.0);
        let mut hits = CastHitCollector::new();
        t.cast_ray(&ray, &mut hits, &AcceptAll);
        assert_eq!(hits.hits.len(), 1);
        assert_eq!(hits.hits[0].body_id, a.id);

        let moved = bodies.set(0, BoundingBox::new(Vec3::splat(10.0), Vec3::splat(11.0)));
        t.notify_bodies_aabb_changed(&[moved]).unwrap();
        let mut hits = CastHitCollector::new();
        t.cast_ray(&ray, &mut hits, &AcceptAll);
        assert!(hits.hits.is_empty());

        rebuild(&t, &bodies);
        assert_eq!(t.bounds(), moved.bounds.union(&b.bounds));
        t.validate(true);
    }

    #[test]
    fn incremental_inserts_keep_boxes_enclosing() {
        let bodies = TestBodies::default();
        let t = tree(256);
        for i in 0..60_u32 {
            let v = bodies.set(i, unit_at((i % 10) as f32 * 2.0, (i / 10) as f32 * 2.0, 0.0));
            add(&t, &[v]);
        }
        assert_eq!(t.validate(false), 60);
        assert_eq!(t.body_count(), 60);
        let query = BoundingBox::new(Vec3::new(4.5, 0.5, 0.0), Vec3::new(6.5, 2.5, 1.0));
        assert_eq!(overlapping(&t, &query), vec![2, 3, 12, 13]);
    }

    #[test]
    fn rebuild_is_tight_and_defers_reclamation() {
        let bodies = TestBodies::default();
        let nodes = Arc::new(NodeAllocator::new(256));
        let t = QuadTree::new("t", BroadPhaseLayer::new(0), nodes.clone(), Arc::new(TrackingTable::new(1024)));
        let views: Vec<_> = (0..40_u32)
            .map(|i| bodies.set(i, unit_at(i as f32 * 1.5, 0.0, 0.0)))
            .collect();
        for v in &views {
            add(&t, std::slice::from_ref(v));
        }
        // Move bodies far inside their slack so incremental boxes get loose.
        for i in 0..40_u32 {
            let v = bodies.set(i, unit_at(i as f32 * 1.5, 3.0, 0.0));
            t.notify_bodies_aabb_changed(&[v]).unwrap();
        }
        assert!(t.is_dirty());
        let before = nodes.used();

        let state = t.update_prepare(&bodies).unwrap();
        assert_eq!(state.body_count(), 40);
        // Still querying the old tree while the new one is only prepared.
        assert_eq!(overlapping(&t, &unit_at(0.0, 3.0, 0.0)), vec![0]);
        {
            let reader = t.pin();
            t.update_finalize(state);
            assert!(!t.can_be_updated());
            assert!(!t.discard_old_tree(), "reader of the old epoch is still pinned");
            drop(reader);
        }
        assert!(t.discard_old_tree());
        assert!(t.can_be_updated());
        assert!(!t.is_dirty());
        assert!(nodes.used() < before);
        assert_eq!(t.validate(true), 40);
        assert_eq!(t.epoch(), 1);
    }

    #[test]
    fn notify_with_same_box_is_a_no_op() {
        let bodies = TestBodies::default();
        let nodes = Arc::new(NodeAllocator::new(64));
        let tracking = Arc::new(TrackingTable::new(1024));
        let t = QuadTree::new("t", BroadPhaseLayer::new(0), nodes.clone(), tracking.clone());
        let views: Vec<_> = (0..9_u32).map(|i| bodies.set(i, unit_at(i as f32, 0.0, 0.0))).collect();
        add(&t, &views);
        rebuild(&t, &bodies);

        let used = nodes.used();
        let locations: Vec<_> = views.iter().map(|v| tracking.location(v.id)).collect();
        t.notify_bodies_aabb_changed(&views).unwrap();
        assert_eq!(nodes.used(), used);
        assert!(!t.is_dirty());
        let after: Vec<_> = views.iter().map(|v| tracking.location(v.id)).collect();
        assert_eq!(locations, after);
    }

    #[test]
    fn small_add_batch_reuses_buckets_without_leaking() {
        let bodies = TestBodies::default();
        let nodes = Arc::new(NodeAllocator::new(64));
        let tracking = Arc::new(TrackingTable::new(1024));
        let t = QuadTree::new("t", BroadPhaseLayer::new(0), nodes.clone(), tracking.clone());
        let full: Vec<_> = (0..4_u32).map(|i| bodies.set(i, unit_at(i as f32, 0.0, 0.0))).collect();
        add(&t, &full);
        let pre_nodes = nodes.used();
        let pre_tracked = tracking.tracked_count();

        let batch: Vec<_> = (4..7_u32)
            .map(|i| bodies.set(i, unit_at(100.0 + i as f32, 0.0, 0.0)))
            .collect();
        let state = t.add_bodies_prepare(&batch).unwrap();
        t.add_bodies_finalize(state).unwrap();
        t.remove_bodies(&[batch[1].id]);

        assert_eq!(tracking.tracked_count(), pre_tracked + 2);
        assert_eq!(nodes.used(), pre_nodes + 2);
        t.validate(false);
    }

    #[test]
    fn large_add_batch_attaches_subtree() {
        let bodies = TestBodies::default();
        let t = tree(128);
        let first: Vec<_> = (0..20_u32).map(|i| bodies.set(i, unit_at(i as f32, 0.0, 0.0))).collect();
        add(&t, &first);
        let second: Vec<_> = (20..45_u32)
            .map(|i| bodies.set(i, unit_at(i as f32, 5.0, 0.0)))
            .collect();
        add(&t, &second);
        assert_eq!(t.validate(false), 45);
        assert_eq!(t.body_count(), 45);
        assert_eq!(overlapping(&t, &unit_at(30.0, 5.0, 0.0)), vec![29, 30, 31]);
    }

    #[test]
    fn abort_releases_everything() {
        let bodies = TestBodies::default();
        let nodes = Arc::new(NodeAllocator::new(64));
        let tracking = Arc::new(TrackingTable::new(1024));
        let t = QuadTree::new("t", BroadPhaseLayer::new(0), nodes.clone(), tracking.clone());
        let views: Vec<_> = (0..30_u32).map(|i| bodies.set(i, unit_at(i as f32, 0.0, 0.0))).collect();
        let state = t.add_bodies_prepare(&views).unwrap();
        assert!(nodes.used() > 0);
        t.add_bodies_abort(state);
        assert_eq!(nodes.used(), 0);
        assert_eq!(tracking.tracked_count(), 0);
        assert!(!tracking.location(views[3].id).is_valid());
        assert!(!t.has_bodies());
    }

    #[test]
    fn insert_remove_all_then_rebuild_is_empty() {
        let bodies = TestBodies::default();
        let nodes = Arc::new(NodeAllocator::new(128));
        let t = QuadTree::new("t", BroadPhaseLayer::new(0), nodes.clone(), Arc::new(TrackingTable::new(1024)));
        let views: Vec<_> = (0..25_u32).map(|i| bodies.set(i, unit_at(i as f32, 0.0, 0.0))).collect();
        for v in &views {
            add(&t, std::slice::from_ref(v));
        }
        let ids: Vec<_> = views.iter().map(|v| v.id).collect();
        t.remove_bodies(&ids);
        assert!(!t.has_bodies());
        assert!(overlapping(&t, &BoundingBox::new(Vec3::splat(-100.0), Vec3::splat(100.0))).is_empty());

        rebuild(&t, &bodies);
        assert!(t.bounds().is_empty());
        assert!(t.root_handle().is_none());
        assert_eq!(nodes.used(), 0);
    }

    #[test]
    fn exhausted_rebuild_keeps_live_tree() {
        let bodies = TestBodies::default();
        let nodes = Arc::new(NodeAllocator::new(14));
        let t = QuadTree::new("t", BroadPhaseLayer::new(0), nodes.clone(), Arc::new(TrackingTable::new(1024)));
        for i in 0..24_u32 {
            let v = bodies.set(i, unit_at(i as f32 * 2.0, 0.0, 0.0));
            add(&t, &[v]);
        }
        let used = nodes.used();
        assert!(used + 7 > nodes.capacity(), "test needs a nearly full allocator");
        let err = t.update_prepare(&bodies).unwrap_err();
        assert!(matches!(err, BroadPhaseError::CapacityExhausted { .. }));
        assert_eq!(nodes.used(), used);
        assert_eq!(t.validate(false), 24);
        assert_eq!(overlapping(&t, &unit_at(10.0, 0.0, 0.0)), vec![5]);
    }

    #[test]
    fn object_layer_filter_applies_per_body() {
        let bodies = TestBodies::default();
        let t = tree(64);
        let a = bodies.set_layer(0, unit_at(0.0, 0.0, 0.0), ObjectLayer::new(1));
        let b = bodies.set_layer(1, unit_at(0.5, 0.0, 0.0), ObjectLayer::new(2));
        add(&t, &[a, b]);
        let mut c = BodyHitCollector::new();
        t.collide_point(Vec3::new(1.0, 0.5, 0.5), &mut c, &SpecifiedObjectLayerFilter(ObjectLayer::new(2)));
        assert_eq!(c.hits, vec![b.id]);
    }

    #[test]
    fn any_hit_stops_traversal() {
        let bodies = TestBodies::default();
        let t = tree(64);
        let views: Vec<_> = (0..12_u32).map(|i| bodies.set(i, unit_at(0.0, 0.0, i as f32 * 0.1))).collect();
        add(&t, &views);
        let mut c: AnyHitCollector<BodyId, CollideShapeTraits> = AnyHitCollector::new();
        t.collide_sphere(Vec3::splat(0.5), 0.1, &mut c, &AcceptAll);
        assert!(c.had_hit());
    }

    #[test]
    fn pairs_are_reported_once() {
        let bodies = TestBodies::default();
        let t = tree(64);
        let a = bodies.set_layer(0, unit_at(0.0, 0.0, 0.0), ObjectLayer::new(0));
        let b = bodies.set_layer(1, unit_at(0.5, 0.0, 0.0), ObjectLayer::new(0));
        let s = bodies.set_layer(2, unit_at(0.0, 0.9, 0.0), ObjectLayer::new(1));
        let far = bodies.set_layer(3, unit_at(10.0, 0.0, 0.0), ObjectLayer::new(0));
        add(&t, &[a, b, s, far]);

        let mut pairs = ObjectLayerPairFilterTable::new(2);
        pairs
            .enable_collision(ObjectLayer::new(0), ObjectLayer::new(0))
            .enable_collision(ObjectLayer::new(0), ObjectLayer::new(1));
        let active = [a, b, far];
        let ids: Vec<_> = active.iter().map(|v| v.id).collect();
        let set = ActiveBodySet::new(16, &ids);
        let mut c = PairCollector::new();
        t.find_colliding_pairs(&active, &set, 0.0, &pairs, &mut c);
        c.hits.sort();
        assert_eq!(
            c.hits,
            vec![
                BodyPair::canonical(a.id, b.id),
                BodyPair::canonical(a.id, s.id),
                BodyPair::canonical(b.id, s.id),
            ]
        );

        // A margin pulls in the far body.
        let mut c = PairCollector::new();
        t.find_colliding_pairs(&[far], &ActiveBodySet::new(16, &[far.id]), 9.0, &pairs, &mut c);
        c.hits.sort();
        assert_eq!(c.hits.len(), 3);
    }

    #[test]
    fn concurrent_inserts_build_a_valid_tree() {
        let bodies = TestBodies::default();
        let t = tree(2048);
        for i in 0..800_u32 {
            bodies.set(i, unit_at((i % 40) as f32 * 1.5, (i / 40) as f32 * 1.5, 0.0));
        }
        thread::scope(|s| {
            for w in 0..4_u32 {
                let (t, bodies) = (&t, &bodies);
                s.spawn(move || {
                    for i in (w..800).step_by(4) {
                        let state = t.add_bodies_prepare(&[bodies.view(i)]).unwrap();
                        t.add_bodies_finalize(state).unwrap();
                    }
                });
            }
        });
        assert_eq!(t.validate(false), 800);
        let all = overlapping(&t, &BoundingBox::new(Vec3::splat(-1.0), Vec3::splat(100.0)));
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn concurrent_widening_never_hides_bodies_from_rays() {
        let bodies = TestBodies::default();
        // Every reinsertion may allocate; nothing is reclaimed without a rebuild.
        let t = tree(16_384);
        // A row of static targets along the ray, and movers elsewhere.
        let targets: Vec<_> = (0..16_u32).map(|i| bodies.set(i, unit_at(i as f32 * 4.0, 0.0, 0.0))).collect();
        add(&t, &targets);
        let movers: Vec<_> = (16..200_u32)
            .map(|i| bodies.set(i, unit_at((i % 16) as f32 * 4.0, 10.0 + (i / 16) as f32, 0.0)))
            .collect();
        add(&t, &movers);

        let ray = RayCast::new(Vec3::new(-1.0, 0.5, 0.5), Vec3::new(70.0, 0.0, 0.0));
        thread::scope(|s| {
            for w in 0..3_u32 {
                let (t, bodies) = (&t, &bodies);
                s.spawn(move || {
                    for step in 0..20_u32 {
                        for i in ((16 + w)..200).step_by(3) {
                            let y = 10.0 + ((i + step) % 13) as f32 * 3.0;
                            let v = bodies.set(i, unit_at((i % 16) as f32 * 4.0 + step as f32 * 0.1, y, 0.0));
                            t.notify_bodies_aabb_changed(&[v]).unwrap();
                        }
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    let mut hits = CastHitCollector::new();
                    t.cast_ray(&ray, &mut hits, &AcceptAll);
                    let mut found: Vec<_> = hits
                        .hits
                        .iter()
                        .map(|h| h.body_id.index())
                        .filter(|&i| i < 16)
                        .collect();
                    found.sort_unstable();
                    assert_eq!(found, (0..16).collect::<Vec<_>>());
                }
            });
        });
        assert_eq!(t.validate(false), 200);
    }
}
