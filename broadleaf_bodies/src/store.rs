// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Slot storage for bodies with generational ids.

use core::fmt;
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use glam::Vec3;
use thiserror::Error;

use broadleaf_index::{BodyId, BodyManager, BodyView, BoundingBox, ObjectLayer};

/// Errors reported by [`BodyStore`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BodyStoreError {
    /// Every slot is in use.
    #[error("body store is full ({capacity} bodies)")]
    Full {
        /// Capacity of the store.
        capacity: usize,
    },
    /// The id does not name a live body.
    #[error("{0:?} is not a live body")]
    Stale(BodyId),
}

/// Result type of fallible store operations.
pub type Result<T, E = BodyStoreError> = core::result::Result<T, E>;

/// Initial state of a body.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BodyDesc {
    /// World space bounds.
    pub bounds: BoundingBox,
    /// Object layer.
    pub object_layer: ObjectLayer,
    /// Whether the body starts awake.
    pub is_active: bool,
}

impl BodyDesc {
    /// An active body on `object_layer`.
    pub fn new(bounds: BoundingBox, object_layer: ObjectLayer) -> Self {
        Self {
            bounds,
            object_layer,
            is_active: true,
        }
    }

    /// Set whether the body starts awake.
    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }
}

#[derive(Default)]
struct Slot {
    /// Last sequence handed out (persists across frees).
    sequence: u8,
    body: Option<BodyDesc>,
}

/// A fixed-capacity, thread-safe [`BodyManager`].
///
/// Every slot has its own lock, so a body can be edited while others are read by the
/// broadphase. Freed slots are reused with a bumped sequence number, which turns any id
/// still held for the old body stale.
pub struct BodyStore {
    slots: Box<[RwLock<Slot>]>,
    free: Mutex<Vec<u32>>,
}

impl fmt::Debug for BodyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStore")
            .field("capacity", &self.slots.len())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl BodyStore {
    /// An empty store for at most `capacity` bodies.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(BodyId::MAX_INDEX as usize + 1);
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Capacity is clamped to the body index range."
        )]
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots: (0..capacity).map(|_| RwLock::default()).collect(),
            free: Mutex::new(free),
        }
    }

    /// Maximum number of bodies.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live bodies.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no body is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, index: u32) -> Option<RwLockReadGuard<'_, Slot>> {
        self.slots
            .get(index as usize)
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self, index: u32) -> Option<RwLockWriteGuard<'_, Slot>> {
        self.slots
            .get(index as usize)
            .map(|s| s.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply `f` to the live body named by `id`.
    fn edit<R>(&self, id: BodyId, f: impl FnOnce(&mut BodyDesc) -> R) -> Result<R> {
        let mut slot = self.write(id.index()).ok_or(BodyStoreError::Stale(id))?;
        if slot.sequence != id.sequence() {
            return Err(BodyStoreError::Stale(id));
        }
        slot.body.as_mut().map(f).ok_or(BodyStoreError::Stale(id))
    }

    /// Create a body. Lower slot indices are used first.
    pub fn create(&self, desc: BodyDesc) -> Result<BodyId> {
        let index = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(BodyStoreError::Full {
                capacity: self.capacity(),
            })?;
        let Some(mut slot) = self.write(index) else {
            return Err(BodyStoreError::Full {
                capacity: self.capacity(),
            });
        };
        slot.sequence = slot.sequence.wrapping_add(1);
        slot.body = Some(desc);
        Ok(BodyId::new(index, slot.sequence))
    }

    /// Destroy a body, returning its last state.
    ///
    /// The body must already be removed from any broadphase it was added to.
    pub fn remove(&self, id: BodyId) -> Result<BodyDesc> {
        let desc = {
            let mut slot = self.write(id.index()).ok_or(BodyStoreError::Stale(id))?;
            if slot.sequence != id.sequence() {
                return Err(BodyStoreError::Stale(id));
            }
            slot.body.take().ok_or(BodyStoreError::Stale(id))?
        };
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.index());
        Ok(desc)
    }

    /// Current state of a live body.
    pub fn get(&self, id: BodyId) -> Option<BodyDesc> {
        let slot = self.read(id.index())?;
        if slot.sequence != id.sequence() {
            return None;
        }
        slot.body
    }

    /// Whether `id` names a live body.
    pub fn is_live(&self, id: BodyId) -> bool {
        self.get(id).is_some()
    }

    /// Replace the bounds of a body.
    pub fn set_bounds(&self, id: BodyId, bounds: BoundingBox) -> Result<()> {
        self.edit(id, |b| b.bounds = bounds)
    }

    /// Move a body by `delta`, returning its new bounds.
    pub fn translate(&self, id: BodyId, delta: Vec3) -> Result<BoundingBox> {
        self.edit(id, |b| {
            b.bounds = BoundingBox::new(b.bounds.min + delta, b.bounds.max + delta);
            b.bounds
        })
    }

    /// Change the object layer of a body.
    pub fn set_object_layer(&self, id: BodyId, object_layer: ObjectLayer) -> Result<()> {
        self.edit(id, |b| b.object_layer = object_layer)
    }

    /// Wake a body up or put it to sleep.
    pub fn set_active(&self, id: BodyId, is_active: bool) -> Result<()> {
        self.edit(id, |b| b.is_active = is_active)
    }

    /// Ids of all live bodies in slot order.
    pub fn bodies(&self) -> Vec<BodyId> {
        self.collect(|_| true)
    }

    /// Ids of all awake bodies in slot order.
    pub fn active_bodies(&self) -> Vec<BodyId> {
        self.collect(|b| b.is_active)
    }

    fn collect(&self, keep: impl Fn(&BodyDesc) -> bool) -> Vec<BodyId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let slot = s.read().unwrap_or_else(PoisonError::into_inner);
                let body = slot.body.as_ref()?;
                #[allow(
                    clippy::cast_possible_truncation,
                    reason = "Slot count is clamped to the body index range."
                )]
                let index = i as u32;
                keep(body).then(|| BodyId::new(index, slot.sequence))
            })
            .collect()
    }
}

impl BodyManager for BodyStore {
    fn max_bodies(&self) -> usize {
        self.capacity()
    }

    fn body(&self, id: BodyId) -> Option<BodyView> {
        self.get(id).map(|b| BodyView {
            id,
            bounds: b.bounds,
            object_layer: b.object_layer,
            is_active: b.is_active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_at(x: f32) -> BoundingBox {
        BoundingBox::new(Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 1.0, 1.0))
    }

    #[test]
    fn create_and_read_back() {
        let store = BodyStore::new(4);
        let id = store.create(BodyDesc::new(unit_at(0.0), ObjectLayer::new(2))).unwrap();
        assert_eq!(id.index(), 0);
        assert_eq!(store.len(), 1);
        let view = store.body(id).unwrap();
        assert_eq!(view.id, id);
        assert_eq!(view.bounds, unit_at(0.0));
        assert_eq!(view.object_layer, ObjectLayer::new(2));
        assert!(view.is_active);
    }

    #[test]
    fn reuse_bumps_sequence_and_stales_old_ids() {
        let store = BodyStore::new(2);
        let a = store.create(BodyDesc::new(unit_at(0.0), ObjectLayer::new(0))).unwrap();
        store.remove(a).unwrap();
        let b = store.create(BodyDesc::new(unit_at(3.0), ObjectLayer::new(0))).unwrap();
        assert_eq!(a.index(), b.index(), "slot should be reused");
        assert_ne!(a.sequence(), b.sequence(), "sequence must change on reuse");
        assert!(store.body(a).is_none());
        assert_eq!(store.set_bounds(a, unit_at(1.0)), Err(BodyStoreError::Stale(a)));
        assert_eq!(store.remove(a), Err(BodyStoreError::Stale(a)));
        assert_eq!(store.get(b).map(|d| d.bounds), Some(unit_at(3.0)));
    }

    #[test]
    fn full_store_is_reported() {
        let store = BodyStore::new(1);
        store.create(BodyDesc::new(unit_at(0.0), ObjectLayer::new(0))).unwrap();
        let err = store
            .create(BodyDesc::new(unit_at(1.0), ObjectLayer::new(0)))
            .unwrap_err();
        assert_eq!(err, BodyStoreError::Full { capacity: 1 });
        assert_eq!(err.to_string(), "body store is full (1 bodies)");
    }

    #[test]
    fn edits_are_visible_through_the_manager() {
        let store = BodyStore::new(4);
        let id = store.create(BodyDesc::new(unit_at(0.0), ObjectLayer::new(0))).unwrap();
        let moved = store.translate(id, Vec3::new(2.0, 0.0, 0.0)).unwrap();
        assert_eq!(moved, unit_at(2.0));
        store.set_object_layer(id, ObjectLayer::new(1)).unwrap();
        store.set_active(id, false).unwrap();
        let view = store.body(id).unwrap();
        assert_eq!(view.bounds, unit_at(2.0));
        assert_eq!(view.object_layer, ObjectLayer::new(1));
        assert!(!view.is_active);
    }

    #[test]
    fn active_bodies_skip_sleepers_and_holes() {
        let store = BodyStore::new(8);
        let ids: Vec<_> = (0..5)
            .map(|i| {
                store
                    .create(BodyDesc::new(unit_at(i as f32), ObjectLayer::new(0)))
                    .unwrap()
            })
            .collect();
        store.remove(ids[1]).unwrap();
        store.set_active(ids[3], false).unwrap();
        assert_eq!(store.bodies(), vec![ids[0], ids[2], ids[3], ids[4]]);
        assert_eq!(store.active_bodies(), vec![ids[0], ids[2], ids[4]]);
    }

    #[test]
    fn out_of_range_ids_are_stale() {
        let store = BodyStore::new(2);
        let id = BodyId::new(40, 1);
        assert!(store.body(id).is_none());
        assert_eq!(store.set_active(id, true), Err(BodyStoreError::Stale(id)));
    }

    #[test]
    fn concurrent_creation_hands_out_distinct_slots() {
        let store = BodyStore::new(256);
        std::thread::scope(|s| {
            for t in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..64 {
                        let x = (t * 64 + i) as f32;
                        store
                            .create(BodyDesc::new(unit_at(x), ObjectLayer::new(0)))
                            .unwrap();
                    }
                });
            }
        });
        assert_eq!(store.len(), 256);
        let mut indices: Vec<_> = store.bodies().iter().map(|id| id.index()).collect();
        indices.dedup();
        assert_eq!(indices.len(), 256);
    }
}
