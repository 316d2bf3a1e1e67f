// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Linear-scan broadphase.
//!
//! Every query tests every inserted body against its current bounds from the body manager.
//! Slow, but simple enough to serve as a reference for the tree based broadphase.

use core::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use glam::Vec3;

use crate::backend::{BroadPhase, BroadPhaseQuery, ModificationGate, ModificationLock};
use crate::body::BodyManager;
use crate::collector::{BroadPhaseCastResult, CollisionCollector, PairCollector};
use crate::config::BroadPhaseConfig;
use crate::error::{BroadPhaseError, Result};
use crate::filter::{
    BroadPhaseLayerFilter, ObjectLayerFilter, ObjectLayerPairFilter, ObjectVsBroadPhaseLayerFilter,
};
use crate::layer::{BroadPhaseLayer, BroadPhaseLayerInterface, ObjectLayer};
use crate::query::{
    AABoxCast, AABoxQuery, BoxCastQuery, OrientedBox, OrientedBoxQuery, PointQuery, QueryShape,
    RayCast, RayInvDirection, RayQuery, SphereQuery,
};
use crate::tracking::TrackingTable;
use crate::types::{BodyId, BodyPair, BoundingBox};

/// Bodies validated by [`BroadPhaseBruteForce::add_bodies_prepare`].
#[derive(Debug)]
#[must_use = "prepared bodies must be finalized or aborted"]
pub struct BruteForceAddState {
    bodies: Vec<(BodyId, BroadPhaseLayer, ObjectLayer)>,
}

/// A broadphase without any acceleration structure.
pub struct BroadPhaseBruteForce<B, L> {
    bodies: Arc<B>,
    layers: L,
    config: BroadPhaseConfig,
    tracking: TrackingTable,
    /// Inserted bodies, sorted.
    inserted: RwLock<Vec<BodyId>>,
    gate: ModificationGate,
}

impl<B, L> fmt::Debug for BroadPhaseBruteForce<B, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadPhaseBruteForce")
            .field("config", &self.config)
            .field("inserted", &self.inserted)
            .finish_non_exhaustive()
    }
}

impl<B: BodyManager, L: BroadPhaseLayerInterface> BroadPhaseBruteForce<B, L> {
    /// Create an empty broadphase.
    pub fn new(bodies: Arc<B>, layers: L, config: BroadPhaseConfig) -> Self {
        Self {
            bodies,
            tracking: TrackingTable::new(config.max_bodies),
            layers,
            config,
            inserted: RwLock::new(Vec::new()),
            gate: ModificationGate::default(),
        }
    }

    /// The body manager.
    pub fn bodies(&self) -> &Arc<B> {
        &self.bodies
    }

    /// Number of inserted bodies.
    pub fn tracked_body_count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<BodyId>> {
        self.inserted.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<BodyId>> {
        self.inserted.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn query<Q, C>(
        &self,
        shape: &Q,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
        collector: &mut C,
    ) where
        Q: QueryShape,
        C: CollisionCollector<Hit = Q::Hit> + ?Sized,
    {
        for &id in self.read().iter() {
            if !broad_phase_filter.should_collide(self.tracking.broad_phase_layer(id))
                || !object_filter.should_collide(self.tracking.object_layer(id))
            {
                continue;
            }
            let Some(view) = self.bodies.body(id) else {
                continue;
            };
            let Some(key) = shape.test(&view.bounds) else {
                continue;
            };
            if key >= collector.early_out_fraction() {
                continue;
            }
            if collector.wants_body() {
                collector.on_body(&view);
            }
            collector.add_hit(shape.hit(id, key));
            if collector.should_early_out() {
                return;
            }
        }
    }
}

impl<B: BodyManager, L: BroadPhaseLayerInterface> BroadPhaseQuery for BroadPhaseBruteForce<B, L> {
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
        self.query(&shape, broad_phase_filter, object_filter, collector);
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
        self.query(&AABoxQuery(*bounds), broad_phase_filter, object_filter, collector);
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
        self.query(&shape, broad_phase_filter, object_filter, collector);
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
        self.query(&PointQuery(point), broad_phase_filter, object_filter, collector);
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
        self.query(&OrientedBoxQuery::new(obb), broad_phase_filter, object_filter, collector);
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
        self.query(&BoxCastQuery::new(cast), broad_phase_filter, object_filter, collector);
    }

    fn bounds(&self) -> BoundingBox {
        self.read()
            .iter()
            .filter_map(|&id| self.bodies.body(id))
            .fold(BoundingBox::EMPTY, |acc, view| acc.union(&view.bounds))
    }
}

impl<B: BodyManager, L: BroadPhaseLayerInterface> BroadPhase for BroadPhaseBruteForce<B, L> {
    type AddState = BruteForceAddState;
    type UpdateState = ();

    fn optimize(&self) -> Result<()> {
        Ok(())
    }

    fn frame_sync(&self) {}

    fn lock_modifications(&self) -> ModificationLock<'_> {
        self.gate.lock()
    }

    fn update_prepare(&self, _lock: &ModificationLock<'_>) -> Result<Option<()>> {
        Ok(None)
    }

    fn update_finalize(&self, _lock: &ModificationLock<'_>, _state: ()) {}

    fn add_bodies_prepare(&self, ids: &[BodyId]) -> Result<BruteForceAddState> {
        let mut bodies = Vec::with_capacity(ids.len());
        for &id in ids {
            if id.index() as usize >= self.config.max_bodies {
                return Err(BroadPhaseError::TooManyBodies {
                    index: id.index(),
                    max: self.config.max_bodies,
                });
            }
            let Some(view) = self.bodies.body(id) else {
                debug_assert!(false, "{id:?} does not name a live body");
                continue;
            };
            let layer = self.layers.broad_phase_layer(view.object_layer);
            if layer.index() >= self.layers.num_broad_phase_layers() {
                return Err(BroadPhaseError::InvalidLayer(view.object_layer.value()));
            }
            bodies.push((id, layer, view.object_layer));
        }
        Ok(BruteForceAddState { bodies })
    }

    fn add_bodies_finalize(&self, state: BruteForceAddState) -> Result<()> {
        let _gate = self.gate.enter();
        let mut inserted = self.write();
        for (id, layer, object_layer) in state.bodies {
            if let Err(at) = inserted.binary_search(&id) {
                inserted.insert(at, id);
                self.tracking.set_layers(id, layer, object_layer);
            } else {
                debug_assert!(false, "{id:?} is already in the broadphase");
            }
        }
        Ok(())
    }

    fn add_bodies_abort(&self, _state: BruteForceAddState) {}

    fn remove_bodies(&self, ids: &[BodyId]) {
        let _gate = self.gate.enter();
        let mut inserted = self.write();
        for id in ids {
            if let Ok(at) = inserted.binary_search(id) {
                inserted.remove(at);
                self.tracking.clear(*id);
            } else {
                debug_assert!(false, "{id:?} is not in the broadphase");
            }
        }
    }

    fn notify_bodies_aabb_changed(&self, ids: &[BodyId]) -> Result<()> {
        let _gate = self.gate.enter();
        for &id in ids {
            debug_assert!(self.tracking.is_inserted(id), "{id:?} is not in the broadphase");
        }
        Ok(())
    }

    fn notify_bodies_aabb_changed_locked(&self, _lock: &ModificationLock<'_>, _ids: &[BodyId]) -> Result<()> {
        Ok(())
    }

    fn notify_bodies_layer_changed(&self, ids: &[BodyId]) -> Result<()> {
        let _gate = self.gate.enter();
        for &id in ids {
            let Some(view) = self.bodies.body(id) else {
                debug_assert!(false, "{id:?} does not name a live body");
                continue;
            };
            let layer = self.layers.broad_phase_layer(view.object_layer);
            if layer.index() >= self.layers.num_broad_phase_layers() {
                return Err(BroadPhaseError::InvalidLayer(view.object_layer.value()));
            }
            self.tracking.set_layers(id, layer, view.object_layer);
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
        let mut active_ids = active.to_vec();
        active_ids.sort_unstable();
        let inserted = self.read();
        let margin = Vec3::splat(speculative_margin);

        let mut pairs = PairCollector::new();
        for &a in &active_ids {
            if !self.tracking.is_inserted(a) {
                continue;
            }
            let Some(view) = self.bodies.body(a) else {
                continue;
            };
            let bounds = view.bounds.expanded(margin);
            for &b in inserted.iter() {
                if b == a || (b < a && active_ids.binary_search(&b).is_ok()) {
                    continue;
                }
                let other_layer = self.tracking.object_layer(b);
                if !object_vs_broad_phase_filter
                    .should_collide(view.object_layer, self.tracking.broad_phase_layer(b))
                    || !pair_filter.should_collide(view.object_layer, other_layer)
                {
                    continue;
                }
                if self
                    .bodies
                    .body(b)
                    .is_some_and(|other| bounds.overlaps(&other.bounds))
                {
                    pairs.hits.push(BodyPair::canonical(a, b));
                }
            }
        }
        if self.config.deterministic {
            pairs.hits.sort_unstable();
        }
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
    use crate::collector::{BodyHitCollector, CastHitCollector};
    use crate::filter::{AcceptAll, ObjectLayerPairFilterTable, ObjectVsBroadPhaseLayerFilterTable};
    use crate::layer::BroadPhaseLayerInterfaceTable;
    use crate::util::{TestBodies, unit_at};

    fn layers() -> BroadPhaseLayerInterfaceTable {
        let mut t = BroadPhaseLayerInterfaceTable::new(1, 1);
        t.map(ObjectLayer::new(0), BroadPhaseLayer::new(0));
        t
    }

    #[test]
    fn queries_read_live_bounds() {
        let bp = BroadPhaseBruteForce::new(Arc::new(TestBodies::default()), layers(), BroadPhaseConfig::new(16));
        let a = bp.bodies().set(0, unit_at(0.0, 0.0, 0.0));
        let b = bp.bodies().set(1, unit_at(4.0, 0.0, 0.0));
        let state = bp.add_bodies_prepare(&[b.id, a.id]).unwrap();
        bp.add_bodies_finalize(state).unwrap();
        assert_eq!(bp.tracked_body_count(), 2);

        let ray = RayCast::new(Vec3::new(-1.0, 0.5, 0.5), Vec3::new(10.0, 0.0, 0.0));
        let mut hits = CastHitCollector::new();
        bp.cast_ray(&ray, &mut hits, &AcceptAll, &AcceptAll);
        hits.sort();
        let order: Vec<_> = hits.hits.iter().map(|h| h.body_id).collect();
        assert_eq!(order, vec![a.id, b.id]);

        bp.bodies().set(1, unit_at(4.0, 3.0, 0.0));
        bp.notify_bodies_aabb_changed(&[b.id]).unwrap();
        let mut hits = BodyHitCollector::new();
        bp.collide_aabox(&unit_at(4.0, 0.0, 0.0), &mut hits, &AcceptAll, &AcceptAll);
        assert!(hits.hits.is_empty());

        bp.remove_bodies(&[a.id]);
        assert_eq!(bp.bounds(), unit_at(4.0, 3.0, 0.0));
    }

    #[test]
    fn pairs_between_active_bodies_are_reported_once() {
        let bp = BroadPhaseBruteForce::new(
            Arc::new(TestBodies::default()),
            layers(),
            BroadPhaseConfig::new(16).with_deterministic(true),
        );
        let ids: Vec<_> = (0..3_u32)
            .map(|i| bp.bodies().set(i, unit_at(i as f32 * 0.5, 0.0, 0.0)).id)
            .collect();
        let state = bp.add_bodies_prepare(&ids).unwrap();
        bp.add_bodies_finalize(state).unwrap();

        let mut pair_filter = ObjectLayerPairFilterTable::new(1);
        pair_filter.enable_collision(ObjectLayer::new(0), ObjectLayer::new(0));
        let filter = ObjectVsBroadPhaseLayerFilterTable::new(&layers(), &pair_filter, 1);
        let mut pairs = PairCollector::new();
        bp.find_colliding_pairs(&[ids[2], ids[0]], 0.0, &filter, &pair_filter, &mut pairs);
        assert_eq!(
            pairs.hits,
            vec![
                BodyPair::canonical(ids[0], ids[1]),
                BodyPair::canonical(ids[0], ids[2]),
                BodyPair::canonical(ids[1], ids[2]),
            ]
        );
    }
}
