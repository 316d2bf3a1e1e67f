// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Layered quad tree broadphase: one [`QuadTree`] per broadphase layer.

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use glam::Vec3;
use smallvec::SmallVec;
use tracing::{debug, instrument, warn};

use crate::backend::{BroadPhase, BroadPhaseQuery, ModificationGate, ModificationLock};
use crate::body::{BodyManager, BodyView};
use crate::collector::{BroadPhaseCastResult, CollisionCollector, PairCollector};
use crate::config::BroadPhaseConfig;
use crate::error::{BroadPhaseError, Result};
use crate::filter::{
    BroadPhaseLayerFilter, ObjectLayerFilter, ObjectLayerPairFilter, ObjectVsBroadPhaseLayerFilter,
};
use crate::layer::{BroadPhaseLayer, BroadPhaseLayerInterface};
use crate::query::{
    AABoxCast, AABoxQuery, BoxCastQuery, OrientedBox, OrientedBoxQuery, PointQuery, QueryShape,
    RayCast, RayInvDirection, RayQuery, SphereQuery,
};
use crate::tracking::TrackingTable;
use crate::tree::{ActiveBodySet, NodeAllocator, QuadTree, TreeAddState, TreeUpdateState};
use crate::types::{BodyId, BodyPair, BoundingBox};

/// Per-layer work lists; most worlds have a handful of broadphase layers.
type LayerGroups<T> = SmallVec<[Vec<T>; 4]>;

/// Prepared insertion returned by [`BroadPhaseQuadTree`].
#[derive(Debug)]
#[must_use = "prepared bodies must be finalized or aborted"]
pub struct QuadTreeAddState {
    layers: SmallVec<[(BroadPhaseLayer, TreeAddState); 4]>,
}

/// Prepared rebuild of one layer returned by [`BroadPhaseQuadTree`].
#[derive(Debug)]
#[must_use = "a prepared rebuild holds nodes until finalized"]
pub struct QuadTreeUpdateState {
    layer: BroadPhaseLayer,
    tree: TreeUpdateState,
}

impl QuadTreeUpdateState {
    /// Layer being rebuilt.
    pub fn layer(&self) -> BroadPhaseLayer {
        self.layer
    }
}

/// Broadphase made of one concurrent quad tree per broadphase layer.
///
/// All trees share one node allocator and one tracking table.
pub struct BroadPhaseQuadTree<B, L> {
    bodies: Arc<B>,
    layers: L,
    config: BroadPhaseConfig,
    nodes: Arc<NodeAllocator>,
    tracking: Arc<TrackingTable>,
    trees: Vec<QuadTree>,
    gate: ModificationGate,
    next_update: AtomicUsize,
}

impl<B, L> fmt::Debug for BroadPhaseQuadTree<B, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadPhaseQuadTree")
            .field("config", &self.config)
            .field("nodes", &self.nodes)
            .field("trees", &self.trees)
            .finish_non_exhaustive()
    }
}

impl<B: BodyManager, L: BroadPhaseLayerInterface> BroadPhaseQuadTree<B, L> {
    /// Create an empty broadphase with a tree per layer of `layers`.
    pub fn new(bodies: Arc<B>, layers: L, config: BroadPhaseConfig) -> Self {
        let nodes = Arc::new(NodeAllocator::new(config.node_capacity()));
        let tracking = Arc::new(TrackingTable::new(config.max_bodies));
        let trees = (0..layers.num_broad_phase_layers())
            .map(|i| {
                #[allow(
                    clippy::cast_possible_truncation,
                    reason = "Broadphase layers are 8-bit by definition."
                )]
                let layer = BroadPhaseLayer::new(i as u8);
                QuadTree::new(
                    layers.broad_phase_layer_name(layer),
                    layer,
                    nodes.clone(),
                    tracking.clone(),
                )
            })
            .collect();
        debug!(
            layers = layers.num_broad_phase_layers(),
            nodes = nodes.capacity(),
            max_bodies = config.max_bodies,
            "broadphase created"
        );
        Self {
            bodies,
            layers,
            config,
            nodes,
            tracking,
            trees,
            gate: ModificationGate::default(),
            next_update: AtomicUsize::new(0),
        }
    }

    /// The body manager.
    pub fn bodies(&self) -> &Arc<B> {
        &self.bodies
    }

    /// Construction parameters.
    pub fn config(&self) -> &BroadPhaseConfig {
        &self.config
    }

    /// The shared node arena.
    pub fn node_allocator(&self) -> &NodeAllocator {
        &self.nodes
    }

    /// Number of bodies currently inserted in any layer.
    pub fn tracked_body_count(&self) -> usize {
        self.tracking.tracked_count()
    }

    /// Whether `id` is inserted.
    pub fn contains(&self, id: BodyId) -> bool {
        self.tracking.is_inserted(id)
    }

    /// Tree for a broadphase layer.
    pub fn tree(&self, layer: BroadPhaseLayer) -> Option<&QuadTree> {
        self.trees.get(layer.index())
    }

    fn check_capacity(&self, id: BodyId) -> Result<()> {
        if id.index() as usize >= self.config.max_bodies {
            return Err(BroadPhaseError::TooManyBodies {
                index: id.index(),
                max: self.config.max_bodies,
            });
        }
        Ok(())
    }

    /// Snapshot of a body a mutation refers to.
    fn view(&self, id: BodyId) -> Option<BodyView> {
        let view = self.bodies.body(id);
        debug_assert!(view.is_some(), "{id:?} does not name a live body");
        view
    }

    fn groups<T>(&self) -> LayerGroups<T> {
        (0..self.trees.len()).map(|_| Vec::new()).collect()
    }

    /// Group ids of inserted bodies by the layer they are tracked in.
    fn group_inserted(&self, ids: &[BodyId]) -> LayerGroups<BodyId> {
        let mut groups = self.groups();
        for &id in ids {
            let layer = self.tracking.broad_phase_layer(id);
            match groups.get_mut(layer.index()) {
                Some(group) => group.push(id),
                None => debug_assert!(false, "{id:?} is not in the broadphase"),
            }
        }
        groups
    }

    fn notify_aabb(&self, ids: &[BodyId]) -> Result<()> {
        let mut groups = self.groups();
        for (layer, group) in self.group_inserted(ids).into_iter().enumerate() {
            groups[layer].extend(group.into_iter().filter_map(|id| self.view(id)));
        }
        for (tree, views) in self.trees.iter().zip(&groups) {
            if !views.is_empty() {
                tree.notify_bodies_aabb_changed(views)?;
            }
        }
        Ok(())
    }

    fn abort(&self, state: QuadTreeAddState) {
        for (layer, tree_state) in state.layers {
            self.trees[layer.index()].add_bodies_abort(tree_state);
        }
    }

    fn query_trees<Q, C>(
        &self,
        shape: &Q,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
        collector: &mut C,
    ) where
        Q: QueryShape,
        C: CollisionCollector<Hit = Q::Hit> + ?Sized,
    {
        let bodies: &dyn BodyManager = &*self.bodies;
        for tree in &self.trees {
            if !tree.has_bodies() || !broad_phase_filter.should_collide(tree.layer()) {
                continue;
            }
            tree.query(shape, object_filter, Some(bodies), collector);
            if collector.should_early_out() {
                return;
            }
        }
    }

    fn find_pairs_in_trees<C>(
        &self,
        active: &[BodyView],
        active_set: &ActiveBodySet,
        speculative_margin: f32,
        object_vs_broad_phase_filter: &dyn ObjectVsBroadPhaseLayerFilter,
        pair_filter: &dyn ObjectLayerPairFilter,
        collector: &mut C,
    ) where
        C: CollisionCollector<Hit = BodyPair> + ?Sized,
    {
        let mut subset = Vec::with_capacity(active.len());
        for tree in &self.trees {
            if !tree.has_bodies() {
                continue;
            }
            subset.clear();
            subset.extend(
                active
                    .iter()
                    .filter(|v| object_vs_broad_phase_filter.should_collide(v.object_layer, tree.layer())),
            );
            if subset.is_empty() {
                continue;
            }
            tree.find_colliding_pairs(&subset, active_set, speculative_margin, pair_filter, collector);
            if collector.should_early_out() {
                return;
            }
        }
    }
}

impl<B: BodyManager, L: BroadPhaseLayerInterface> BroadPhaseQuery for BroadPhaseQuadTree<B, L> {
    fn cast_ray<C>(
        &self,
        ray: &RayCast,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BroadPhaseCastResult> + ?Sized,
    {
        let shape = RayQuery(RayInvDirection::new(ray.origin, ray.direction));
        self.query_trees(&shape, broad_phase_filter, object_filter, collector);
    }

    fn collide_aabox<C>(
        &self,
        bounds: &BoundingBox,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized,
    {
        self.query_trees(&AABoxQuery(*bounds), broad_phase_filter, object_filter, collector);
    }

    fn collide_sphere<C>(
        &self,
        center: Vec3,
        radius: f32,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized,
    {
        let shape = SphereQuery {
            center,
            radius_sq: radius * radius,
        };
        self.query_trees(&shape, broad_phase_filter, object_filter, collector);
    }

    fn collide_point<C>(
        &self,
        point: Vec3,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized,
    {
        self.query_trees(&PointQuery(point), broad_phase_filter, object_filter, collector);
    }

    fn collide_oriented_box<C>(
        &self,
        obb: &OrientedBox,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized,
    {
        self.query_trees(&OrientedBoxQuery::new(obb), broad_phase_filter, object_filter, collector);
    }

    fn cast_aabox<C>(
        &self,
        cast: &AABoxCast,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BroadPhaseCastResult> + ?Sized,
    {
        self.query_trees(&BoxCastQuery::new(cast), broad_phase_filter, object_filter, collector);
    }

    fn bounds(&self) -> BoundingBox {
        self.trees
            .iter()
            .fold(BoundingBox::EMPTY, |acc, tree| acc.union(&tree.bounds()))
    }
}

impl<B: BodyManager, L: BroadPhaseLayerInterface> BroadPhase for BroadPhaseQuadTree<B, L> {
    type AddState = QuadTreeAddState;
    type UpdateState = QuadTreeUpdateState;

    #[instrument(skip_all)]
    fn optimize(&self) -> Result<()> {
        let _lock = self.lock_modifications();
        for tree in &self.trees {
            if !tree.discard_old_tree() {
                warn!(tree = tree.name(), "previous generation still in use, not optimizing");
                continue;
            }
            if !tree.is_dirty() {
                continue;
            }
            let state = tree.update_prepare(&*self.bodies)?;
            tree.update_finalize(state);
            tree.discard_old_tree();
        }
        Ok(())
    }

    fn frame_sync(&self) {
        for tree in &self.trees {
            tree.discard_old_tree();
        }
    }

    fn lock_modifications(&self) -> ModificationLock<'_> {
        self.gate.lock()
    }

    fn update_prepare(&self, _lock: &ModificationLock<'_>) -> Result<Option<QuadTreeUpdateState>> {
        let count = self.trees.len();
        let start = self.next_update.load(Ordering::Relaxed);
        for offset in 0..count {
            let index = (start + offset) % count;
            let tree = &self.trees[index];
            if !tree.is_dirty() || !tree.can_be_updated() {
                continue;
            }
            self.next_update.store((index + 1) % count, Ordering::Relaxed);
            let state = tree.update_prepare(&*self.bodies)?;
            return Ok(Some(QuadTreeUpdateState {
                layer: tree.layer(),
                tree: state,
            }));
        }
        Ok(None)
    }

    fn update_finalize(&self, _lock: &ModificationLock<'_>, state: QuadTreeUpdateState) {
        self.trees[state.layer.index()].update_finalize(state.tree);
    }

    fn add_bodies_prepare(&self, ids: &[BodyId]) -> Result<QuadTreeAddState> {
        let mut groups = self.groups();
        for &id in ids {
            self.check_capacity(id)?;
            let Some(view) = self.view(id) else { continue };
            debug_assert!(!self.tracking.is_inserted(id), "{id:?} is already in the broadphase");
            let layer = self.layers.broad_phase_layer(view.object_layer);
            let Some(group) = groups.get_mut(layer.index()) else {
                return Err(BroadPhaseError::InvalidLayer(view.object_layer.value()));
            };
            group.push(view);
        }

        let mut state = QuadTreeAddState {
            layers: SmallVec::new(),
        };
        for (tree, group) in self.trees.iter().zip(&groups) {
            if group.is_empty() {
                continue;
            }
            match tree.add_bodies_prepare(group) {
                Ok(tree_state) => state.layers.push((tree.layer(), tree_state)),
                Err(e) => {
                    self.abort(state);
                    return Err(e);
                }
            }
        }
        Ok(state)
    }

    fn add_bodies_finalize(&self, state: QuadTreeAddState) -> Result<()> {
        let _gate = self.gate.enter();
        let mut layers = state.layers.into_iter();
        while let Some((layer, tree_state)) = layers.next() {
            if let Err(e) = self.trees[layer.index()].add_bodies_finalize(tree_state) {
                for (layer, rest) in layers {
                    self.trees[layer.index()].add_bodies_abort(rest);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn add_bodies_abort(&self, state: QuadTreeAddState) {
        self.abort(state);
    }

    fn remove_bodies(&self, ids: &[BodyId]) {
        let _gate = self.gate.enter();
        for (tree, group) in self.trees.iter().zip(self.group_inserted(ids)) {
            if !group.is_empty() {
                tree.remove_bodies(&group);
            }
        }
    }

    fn notify_bodies_aabb_changed(&self, ids: &[BodyId]) -> Result<()> {
        let _gate = self.gate.enter();
        self.notify_aabb(ids)
    }

    fn notify_bodies_aabb_changed_locked(&self, _lock: &ModificationLock<'_>, ids: &[BodyId]) -> Result<()> {
        self.notify_aabb(ids)
    }

    fn notify_bodies_layer_changed(&self, ids: &[BodyId]) -> Result<()> {
        let _gate = self.gate.enter();
        let mut leaving: LayerGroups<BodyId> = self.groups();
        let mut arriving: LayerGroups<BodyView> = self.groups();
        for &id in ids {
            let current = self.tracking.broad_phase_layer(id);
            if current.index() >= self.trees.len() {
                debug_assert!(false, "{id:?} is not in the broadphase");
                continue;
            }
            let Some(view) = self.view(id) else { continue };
            let target = self.layers.broad_phase_layer(view.object_layer);
            if target.index() >= self.trees.len() {
                return Err(BroadPhaseError::InvalidLayer(view.object_layer.value()));
            }
            if target == current {
                self.tracking.set_object_layer(id, view.object_layer);
            } else {
                leaving[current.index()].push(id);
                arriving[target.index()].push(view);
            }
        }

        for (tree, group) in self.trees.iter().zip(&leaving) {
            if !group.is_empty() {
                tree.remove_bodies(group);
            }
        }
        for (tree, group) in self.trees.iter().zip(&arriving) {
            if group.is_empty() {
                continue;
            }
            debug!(tree = tree.name(), bodies = group.len(), "bodies moved between layers");
            let state = tree.add_bodies_prepare(group)?;
            tree.add_bodies_finalize(state)?;
        }
        Ok(())
    }

    fn find_colliding_pairs<C>(
        &self,
        active: &[BodyId],
        speculative_margin: f32,
        object_vs_broad_phase_filter: &dyn ObjectVsBroadPhaseLayerFilter,
        pair_filter: &dyn ObjectLayerPairFilter,
        collector: &mut C,
    ) where
        C: CollisionCollector<Hit = BodyPair> + ?Sized,
    {
        let mut views: Vec<BodyView> = active
            .iter()
            .filter(|&&id| self.tracking.is_inserted(id))
            .filter_map(|&id| self.bodies.body(id))
            .collect();
        let active_set = ActiveBodySet::new(self.config.max_bodies, active);

        if !self.config.deterministic {
            self.find_pairs_in_trees(
                &views,
                &active_set,
                speculative_margin,
                object_vs_broad_phase_filter,
                pair_filter,
                collector,
            );
            return;
        }

        views.sort_unstable_by_key(|v| v.id);
        let mut pairs = PairCollector::new();
        self.find_pairs_in_trees(
            &views,
            &active_set,
            speculative_margin,
            object_vs_broad_phase_filter,
            pair_filter,
            &mut pairs,
        );
        pairs.hits.sort_unstable();
        for pair in pairs.hits {
            collector.add_hit(pair);
            if collector.should_early_out() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{
        AnyHitCollector, BodyHitCollector, CastHitCollector, ClosestHitCollector, CollectorTraits,
        CollideShapeTraits, EarlyOut,
    };
    use crate::filter::{
        AcceptAll, ObjectLayerPairFilterTable, ObjectVsBroadPhaseLayerFilterTable,
        SpecifiedBroadPhaseLayerFilter,
    };
    use crate::layer::{BroadPhaseLayerInterfaceTable, ObjectLayer};
    use crate::util::{TestBodies, unit_at};

    const STATIC: ObjectLayer = ObjectLayer::new(0);
    const MOVING: ObjectLayer = ObjectLayer::new(1);
    const BP_STATIC: BroadPhaseLayer = BroadPhaseLayer::new(0);
    const BP_MOVING: BroadPhaseLayer = BroadPhaseLayer::new(1);

    type TestBroadPhase = BroadPhaseQuadTree<TestBodies, BroadPhaseLayerInterfaceTable>;

    fn layers() -> BroadPhaseLayerInterfaceTable {
        let mut t = BroadPhaseLayerInterfaceTable::new(2, 2);
        t.map(STATIC, BP_STATIC)
            .map(MOVING, BP_MOVING)
            .set_name(BP_STATIC, "static")
            .set_name(BP_MOVING, "moving");
        t
    }

    fn pair_filter() -> ObjectLayerPairFilterTable {
        let mut f = ObjectLayerPairFilterTable::new(2);
        f.enable_collision(MOVING, STATIC).enable_collision(MOVING, MOVING);
        f
    }

    fn broad_phase(config: BroadPhaseConfig) -> TestBroadPhase {
        BroadPhaseQuadTree::new(Arc::new(TestBodies::default()), layers(), config)
    }

    fn add(bp: &TestBroadPhase, ids: &[BodyId]) {
        let state = bp.add_bodies_prepare(ids).unwrap();
        bp.add_bodies_finalize(state).unwrap();
    }

    fn overlapping(bp: &TestBroadPhase, bounds: &BoundingBox, filter: &dyn BroadPhaseLayerFilter) -> Vec<u32> {
        let mut c = BodyHitCollector::new();
        bp.collide_aabox(bounds, &mut c, filter, &AcceptAll);
        let mut ids: Vec<_> = c.hits.iter().map(|id| id.index()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn ray_scenario_with_optimize() {
        let bp = broad_phase(BroadPhaseConfig::new(64));
        let a = bp.bodies().set(0, BoundingBox::new(Vec3::ZERO, Vec3::ONE));
        let b = bp.bodies().set(1, BoundingBox::new(Vec3::splat(5.0), Vec3::splat(6.0)));
        add(&bp, &[a.id, b.id]);

        let ray = RayCast::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 0.0).normalize() * 2.0);
        let mut hits = CastHitCollector::new();
        bp.cast_ray(&ray, &mut hits, &AcceptAll, &AcceptAll);
        assert_eq!(hits.hits.len(), 1);
        assert_eq!(hits.hits[0].body_id, a.id);

        let moved = bp.bodies().set(0, BoundingBox::new(Vec3::splat(10.0), Vec3::splat(11.0)));
        bp.notify_bodies_aabb_changed(&[a.id]).unwrap();
        let mut hits = CastHitCollector::new();
        bp.cast_ray(&ray, &mut hits, &AcceptAll, &AcceptAll);
        assert!(!hits.had_hit());

        bp.optimize().unwrap();
        assert_eq!(bp.bounds(), moved.bounds.union(&b.bounds));
    }

    #[test]
    fn add_then_remove_one_leaks_nothing() {
        let bp = broad_phase(BroadPhaseConfig::new(64));
        let first: Vec<_> = (0..4_u32)
            .map(|i| bp.bodies().set(i, unit_at(i as f32, 0.0, 0.0)).id)
            .collect();
        add(&bp, &first);
        let pre_nodes = bp.node_allocator().used();
        let pre_tracked = bp.tracked_body_count();

        let batch: Vec<_> = (4..7_u32)
            .map(|i| bp.bodies().set(i, unit_at(50.0 + i as f32, 0.0, 0.0)).id)
            .collect();
        add(&bp, &batch);
        bp.remove_bodies(&batch[..1]);

        assert_eq!(bp.tracked_body_count(), pre_tracked + 2);
        assert_eq!(bp.node_allocator().used(), pre_nodes + 2);
    }

    #[test]
    fn remove_everything_then_optimize_returns_all_nodes() {
        let bp = broad_phase(BroadPhaseConfig::new(256));
        let ids: Vec<_> = (0..100_u32)
            .map(|i| {
                let layer = if i % 3 == 0 { STATIC } else { MOVING };
                bp.bodies()
                    .set_layer(i, unit_at((i % 10) as f32 * 2.0, (i / 10) as f32 * 2.0, 0.0), layer)
                    .id
            })
            .collect();
        for chunk in ids.chunks(7) {
            add(&bp, chunk);
        }
        assert_eq!(bp.tracked_body_count(), 100);
        bp.optimize().unwrap();
        assert!(bp.node_allocator().used() > 0);

        bp.remove_bodies(&ids);
        assert_eq!(bp.tracked_body_count(), 0);
        bp.optimize().unwrap();
        bp.frame_sync();
        assert_eq!(bp.node_allocator().used(), 0);
        assert!(bp.bounds().is_empty());
    }

    #[test]
    fn broad_phase_filter_selects_layers() {
        let bp = broad_phase(BroadPhaseConfig::new(64));
        let s = bp.bodies().set_layer(0, unit_at(0.0, 0.0, 0.0), STATIC);
        let m = bp.bodies().set_layer(1, unit_at(0.5, 0.0, 0.0), MOVING);
        add(&bp, &[s.id, m.id]);
        let all = unit_at(0.25, 0.0, 0.0);
        assert_eq!(overlapping(&bp, &all, &AcceptAll), vec![0, 1]);
        assert_eq!(overlapping(&bp, &all, &SpecifiedBroadPhaseLayerFilter(BP_MOVING)), vec![1]);
        assert_eq!(bp.tree(BP_STATIC).unwrap().name(), "static");
    }

    #[test]
    fn early_out_stops_across_layers() {
        let bp = broad_phase(BroadPhaseConfig::new(64));
        let s = bp.bodies().set_layer(0, unit_at(0.0, 0.0, 0.0), STATIC);
        let m = bp.bodies().set_layer(1, unit_at(0.0, 0.0, 0.0), MOVING);
        add(&bp, &[s.id, m.id]);
        let mut c: AnyHitCollector<BodyId, CollideShapeTraits> = AnyHitCollector::new();
        bp.collide_point(Vec3::splat(0.5), &mut c, &AcceptAll, &AcceptAll);
        assert_eq!(c.hit, Some(s.id));

        let ray = RayCast::new(Vec3::new(-5.0, 0.5, 0.5), Vec3::new(10.0, 0.0, 0.0));
        let mut closest: ClosestHitCollector<BroadPhaseCastResult, crate::collector::CastRayTraits> =
            ClosestHitCollector::new();
        bp.cast_ray(&ray, &mut closest, &AcceptAll, &AcceptAll);
        assert_eq!(closest.hit.map(|h| h.fraction), Some(0.5));
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn stale_ids_do_not_touch_reused_slots() {
        let bp = broad_phase(BroadPhaseConfig::new(64));
        let a = bp.bodies().set_layer(0, unit_at(0.0, 0.0, 0.0), MOVING);
        let b = bp.bodies().set_layer(1, unit_at(4.0, 0.0, 0.0), MOVING);
        add(&bp, &[a.id, b.id]);

        let stale = BodyId::new(0, 7);
        bp.remove_bodies(&[stale]);
        bp.notify_bodies_aabb_changed(&[stale]).unwrap();
        assert_eq!(overlapping(&bp, &a.bounds, &AcceptAll), vec![0]);
        assert_eq!(bp.tracked_body_count(), 2);
        assert_eq!(bp.tree(BP_MOVING).unwrap().body_count(), 2);
    }

    #[test]
    fn exhausted_add_leaves_tracking_consistent() {
        let bp = broad_phase(BroadPhaseConfig::new(64).with_max_nodes(4));
        let placed: Vec<_> = (0..4_u32)
            .map(|i| bp.bodies().set_layer(i, unit_at(i as f32 * 2.0, 0.0, 0.0), STATIC).id)
            .collect();
        add(&bp, &placed);
        let batch: Vec<_> = (4..9_u32)
            .map(|i| bp.bodies().set_layer(i, unit_at(i as f32 * 2.0, 5.0, 0.0), STATIC).id)
            .collect();
        let state = bp.add_bodies_prepare(&batch).unwrap();
        assert!(bp.add_bodies_finalize(state).is_err());

        assert_eq!(bp.tracked_body_count(), 4);
        assert_eq!(bp.node_allocator().used(), 1);
        assert_eq!(bp.tree(BP_STATIC).unwrap().body_count(), 4);
        let everything = BoundingBox::new(Vec3::splat(-100.0), Vec3::splat(100.0));
        assert_eq!(overlapping(&bp, &everything, &AcceptAll), vec![0, 1, 2, 3]);
    }

    #[test]
    fn layer_change_moves_body_between_trees() {
        let bp = broad_phase(BroadPhaseConfig::new(64));
        let v = bp.bodies().set_layer(3, unit_at(0.0, 0.0, 0.0), STATIC);
        add(&bp, &[v.id]);
        assert!(bp.tree(BP_STATIC).unwrap().has_bodies());

        bp.bodies().set_layer(3, v.bounds, MOVING);
        bp.notify_bodies_layer_changed(&[v.id]).unwrap();
        assert!(!bp.tree(BP_STATIC).unwrap().has_bodies());
        assert!(bp.tree(BP_MOVING).unwrap().has_bodies());
        assert_eq!(bp.tracked_body_count(), 1);
        assert_eq!(overlapping(&bp, &v.bounds, &SpecifiedBroadPhaseLayerFilter(BP_MOVING)), vec![3]);
    }

    #[test]
    fn invalid_input_is_reported() {
        let bp = broad_phase(BroadPhaseConfig::new(8));
        bp.bodies().set(9, unit_at(0.0, 0.0, 0.0));
        let err = bp.add_bodies_prepare(&[BodyId::new(9, 0)]).unwrap_err();
        assert_eq!(err, BroadPhaseError::TooManyBodies { index: 9, max: 8 });

        bp.bodies().set_layer(1, unit_at(0.0, 0.0, 0.0), ObjectLayer::new(7));
        let err = bp.add_bodies_prepare(&[BodyId::new(1, 0)]).unwrap_err();
        assert_eq!(err, BroadPhaseError::InvalidLayer(7));
        assert_eq!(bp.node_allocator().used(), 0);
    }

    #[test]
    fn abort_leaves_nothing_behind() {
        let bp = broad_phase(BroadPhaseConfig::new(64));
        let ids: Vec<_> = (0..20_u32)
            .map(|i| {
                let layer = if i % 2 == 0 { STATIC } else { MOVING };
                bp.bodies().set_layer(i, unit_at(i as f32, 0.0, 0.0), layer).id
            })
            .collect();
        let state = bp.add_bodies_prepare(&ids).unwrap();
        bp.add_bodies_abort(state);
        assert_eq!(bp.node_allocator().used(), 0);
        assert_eq!(bp.tracked_body_count(), 0);
        assert!(bp.bounds().is_empty());
    }

    #[test]
    fn rebuild_protocol_round_robins_dirty_layers() {
        let bp = broad_phase(BroadPhaseConfig::new(64));
        let s = bp.bodies().set_layer(0, unit_at(0.0, 0.0, 0.0), STATIC);
        let m = bp.bodies().set_layer(1, unit_at(5.0, 0.0, 0.0), MOVING);
        add(&bp, &[s.id, m.id]);

        let lock = bp.lock_modifications();
        let first = bp.update_prepare(&lock).unwrap().unwrap();
        assert_eq!(first.layer(), BP_STATIC);
        bp.update_finalize(&lock, first);
        let second = bp.update_prepare(&lock).unwrap().unwrap();
        assert_eq!(second.layer(), BP_MOVING);
        bp.update_finalize(&lock, second);
        // Both layers wait for a frame sync before they can be rebuilt again.
        assert!(bp.update_prepare(&lock).unwrap().is_none());
        drop(lock);

        bp.frame_sync();
        assert!(bp.tree(BP_STATIC).unwrap().can_be_updated());
        let moved_to = unit_at(6.0, 0.0, 0.0);
        bp.bodies().set_layer(1, moved_to, MOVING);
        bp.notify_bodies_aabb_changed(&[m.id]).unwrap();
        let lock = bp.lock_modifications();
        bp.notify_bodies_aabb_changed_locked(&lock, &[m.id]).unwrap();
        let next = bp.update_prepare(&lock).unwrap().unwrap();
        assert_eq!(next.layer(), BP_MOVING);
        bp.update_finalize(&lock, next);
        drop(lock);
        assert_eq!(bp.bounds(), s.bounds.union(&moved_to));
    }

    #[test]
    fn pairs_come_out_once_and_sorted_when_deterministic() {
        let bp = broad_phase(BroadPhaseConfig::new(64).with_deterministic(true));
        let ground = bp.bodies().set_layer(0, BoundingBox::new(Vec3::new(-10.0, -1.0, -10.0), Vec3::new(10.0, 0.0, 10.0)), STATIC);
        let wall = bp.bodies().set_layer(1, BoundingBox::new(Vec3::new(-10.0, 0.0, -10.0), Vec3::new(10.0, 5.0, -9.0)), STATIC);
        let movers: Vec<_> = (2..6_u32)
            .map(|i| bp.bodies().set_layer(i, unit_at(i as f32 * 0.5, 0.0, 0.0), MOVING))
            .collect();
        let mut ids = vec![ground.id, wall.id];
        ids.extend(movers.iter().map(|v| v.id));
        add(&bp, &ids);

        let active: Vec<_> = movers.iter().rev().map(|v| v.id).collect();
        let filter = ObjectVsBroadPhaseLayerFilterTable::new(&layers(), &pair_filter(), 2);
        let mut pairs = PairCollector::new();
        bp.find_colliding_pairs(&active, 0.0, &filter, &pair_filter(), &mut pairs);

        let mut expected = Vec::new();
        for (i, m) in movers.iter().enumerate() {
            expected.push(BodyPair::canonical(ground.id, m.id));
            // Movers are 0.5 apart with unit size: each overlaps the next two.
            for other in movers.iter().skip(i + 1).take(2) {
                expected.push(BodyPair::canonical(m.id, other.id));
            }
        }
        expected.sort_unstable();
        assert_eq!(pairs.hits, expected);
    }

    /// Records the body snapshots it is handed.
    #[derive(Default)]
    struct SnapshotCollector {
        seen: Vec<BodyView>,
        early_out: EarlyOut<CollideShapeTraits>,
    }

    impl CollisionCollector for SnapshotCollector {
        type Hit = BodyId;
        type Traits = CollideShapeTraits;

        fn add_hit(&mut self, hit: BodyId) {
            assert_eq!(self.seen.last().map(|v| v.id), Some(hit), "snapshot precedes hit");
        }

        fn wants_body(&self) -> bool {
            true
        }

        fn on_body(&mut self, body: &BodyView) {
            self.seen.push(*body);
        }

        fn reset(&mut self) {
            self.seen.clear();
            self.early_out.reset();
        }

        fn early_out_fraction(&self) -> f32 {
            self.early_out.get()
        }

        fn update_early_out_fraction(&mut self, fraction: f32) {
            self.early_out.update(fraction);
        }

        fn force_early_out(&mut self) {
            self.early_out.force();
        }
    }

    #[test]
    fn collectors_can_snapshot_bodies() {
        let bp = broad_phase(BroadPhaseConfig::new(64));
        let v = bp.bodies().set_layer(2, unit_at(0.0, 0.0, 0.0), MOVING);
        add(&bp, &[v.id]);
        let mut c = SnapshotCollector::default();
        assert_eq!(c.early_out_fraction(), CollideShapeTraits::INITIAL_EARLY_OUT_FRACTION);
        bp.collide_sphere(Vec3::splat(0.5), 0.1, &mut c, &AcceptAll, &AcceptAll);
        assert_eq!(c.seen, vec![v]);
    }
}
