// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Traits shared by broadphase implementations.

use core::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use glam::Vec3;

use crate::collector::{BroadPhaseCastResult, CollisionCollector};
use crate::error::Result;
use crate::filter::{
    BroadPhaseLayerFilter, ObjectLayerFilter, ObjectLayerPairFilter, ObjectVsBroadPhaseLayerFilter,
};
use crate::query::{AABoxCast, OrientedBox, RayCast};
use crate::types::{BodyId, BodyPair, BoundingBox};

/// Proof that body modifications are locked out.
///
/// Obtained from [`BroadPhase::lock_modifications`]; modifications are allowed again when it
/// is dropped.
pub struct ModificationLock<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl fmt::Debug for ModificationLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModificationLock").finish_non_exhaustive()
    }
}

/// Reader/writer gate between body mutations and the rebuild handoff.
#[derive(Debug, Default)]
pub(crate) struct ModificationGate(RwLock<()>);

impl ModificationGate {
    pub(crate) fn lock(&self) -> ModificationLock<'_> {
        ModificationLock {
            _guard: self.0.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Shared access for a mutation. Mutating while the gate is locked is a protocol error.
    pub(crate) fn enter(&self) -> RwLockReadGuard<'_, ()> {
        match self.0.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug_assert!(false, "body mutation while modifications are locked");
                self.0.read().unwrap_or_else(PoisonError::into_inner)
            }
        }
    }
}

/// Read-only queries against a broadphase.
///
/// Queries may run concurrently with each other and with body mutations. Each one checks
/// the broadphase layer filter per layer and the object layer filter per body, and stops as
/// soon as the collector asks for an early out.
pub trait BroadPhaseQuery {
    /// Bodies whose box is crossed by `ray`. Hits carry the entry fraction along the ray.
    fn cast_ray<C>(
        &self,
        ray: &RayCast,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BroadPhaseCastResult> + ?Sized;

    /// Bodies whose box overlaps `bounds`.
    fn collide_aabox<C>(
        &self,
        bounds: &BoundingBox,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized;

    /// Bodies whose box overlaps the sphere at `center`.
    fn collide_sphere<C>(
        &self,
        center: Vec3,
        radius: f32,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized;

    /// Bodies whose box contains `point`.
    fn collide_point<C>(
        &self,
        point: Vec3,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized;

    /// Bodies whose box overlaps an oriented box.
    fn collide_oriented_box<C>(
        &self,
        obb: &OrientedBox,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BodyId> + ?Sized;

    /// Bodies whose box is touched by a moving box.
    fn cast_aabox<C>(
        &self,
        cast: &AABoxCast,
        collector: &mut C,
        broad_phase_filter: &dyn BroadPhaseLayerFilter,
        object_filter: &dyn ObjectLayerFilter,
    ) where
        C: CollisionCollector<Hit = BroadPhaseCastResult> + ?Sized;

    /// Bounds of every body in the broadphase. May be looser than the bodies between rebuilds.
    fn bounds(&self) -> BoundingBox;
}

/// A mutable broadphase.
///
/// Body state (bounds and layers) comes from the body manager the broadphase was created
/// with; mutations only name body ids. Ids that do not name a live body, or name a body in
/// the wrong state, trigger a debug assertion and are otherwise skipped.
///
/// ## Step protocol
///
/// 1. [`BroadPhase::frame_sync`] once per step, before any mutation.
/// 2. Mutations, from any number of threads.
/// 3. Optionally a rebuild: [`BroadPhase::lock_modifications`], then
///    [`BroadPhase::update_prepare`] (queries may run meanwhile), then
///    [`BroadPhase::update_finalize`], then drop the lock.
pub trait BroadPhase: BroadPhaseQuery + Send + Sync {
    /// Token between [`BroadPhase::add_bodies_prepare`] and its finalize or abort.
    type AddState: Send;
    /// Token between [`BroadPhase::update_prepare`] and [`BroadPhase::update_finalize`].
    type UpdateState: Send;

    /// Rebuild everything now.
    fn optimize(&self) -> Result<()>;

    /// Quiescence checkpoint: reclaim generations replaced by earlier rebuilds.
    fn frame_sync(&self);

    /// Lock out body mutations until the returned guard is dropped.
    fn lock_modifications(&self) -> ModificationLock<'_>;

    /// Build a tighter tree off to the side. Returns `None` when nothing needs a rebuild.
    fn update_prepare(&self, lock: &ModificationLock<'_>) -> Result<Option<Self::UpdateState>>;

    /// Publish the tree built by [`BroadPhase::update_prepare`].
    fn update_finalize(&self, lock: &ModificationLock<'_>, state: Self::UpdateState);

    /// Prepare insertion of bodies. The broadphase is not modified.
    fn add_bodies_prepare(&self, ids: &[BodyId]) -> Result<Self::AddState>;

    /// Make prepared bodies visible to queries.
    fn add_bodies_finalize(&self, state: Self::AddState) -> Result<()>;

    /// Release prepared bodies without adding them.
    fn add_bodies_abort(&self, state: Self::AddState);

    /// Remove bodies.
    fn remove_bodies(&self, ids: &[BodyId]);

    /// Pick up new bounds of bodies.
    fn notify_bodies_aabb_changed(&self, ids: &[BodyId]) -> Result<()>;

    /// Same as [`BroadPhase::notify_bodies_aabb_changed`] for a caller that already holds
    /// the modification lock.
    fn notify_bodies_aabb_changed_locked(
        &self,
        lock: &ModificationLock<'_>,
        ids: &[BodyId],
    ) -> Result<()>;

    /// Pick up new object layers of bodies.
    fn notify_bodies_layer_changed(&self, ids: &[BodyId]) -> Result<()>;

    /// Report every pair of an active body and an overlapping body once.
    ///
    /// Boxes of active bodies are grown by `speculative_margin` first. Pairs are canonical
    /// (smaller id first).
    fn find_colliding_pairs<C>(
        &self,
        active: &[BodyId],
        speculative_margin: f32,
        object_vs_broad_phase_filter: &dyn ObjectVsBroadPhaseLayerFilter,
        pair_filter: &dyn ObjectLayerPairFilter,
        collector: &mut C,
    ) where
        C: CollisionCollector<Hit = BodyPair> + ?Sized;
}
