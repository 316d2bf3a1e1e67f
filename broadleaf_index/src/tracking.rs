// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dense per-body side table of tree locations.

use core::fmt;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};

use crate::layer::{BroadPhaseLayer, ObjectLayer};
use crate::node::NUM_CHILDREN;
use crate::types::BodyId;

/// Position of a body inside a tree: a leaf node index and a slot in its bucket.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct BodyLocation(u32);

impl BodyLocation {
    /// Not inserted in any tree.
    pub const INVALID: Self = Self(u32::MAX);

    #[allow(
        clippy::cast_possible_truncation,
        reason = "Slots are below NUM_CHILDREN."
    )]
    pub(crate) const fn new(node: u32, slot: usize) -> Self {
        debug_assert!(slot < NUM_CHILDREN, "slot out of range");
        Self((node << 2) | slot as u32)
    }

    /// Leaf node index.
    #[inline]
    pub const fn node(self) -> u32 {
        self.0 >> 2
    }

    /// Slot within the leaf bucket.
    #[inline]
    pub const fn slot(self) -> usize {
        (self.0 & 3) as usize
    }

    /// Whether this is a real location.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    pub(crate) const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for BodyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "BodyLocation({}:{})", self.node(), self.slot())
        } else {
            f.write_str("BodyLocation(invalid)")
        }
    }
}

/// Tracking information of one body.
struct Tracking {
    broad_phase_layer: AtomicU8,
    object_layer: AtomicU16,
    location: AtomicU32,
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            broad_phase_layer: AtomicU8::new(BroadPhaseLayer::INVALID.value()),
            object_layer: AtomicU16::new(ObjectLayer::INVALID.value()),
            location: AtomicU32::new(BodyLocation::INVALID.raw()),
        }
    }
}

/// Dense table indexed by [`BodyId::index`].
pub struct TrackingTable {
    entries: Box<[Tracking]>,
}

impl fmt::Debug for TrackingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingTable")
            .field("capacity", &self.entries.len())
            .field("tracked", &self.tracked_count())
            .finish_non_exhaustive()
    }
}

impl TrackingTable {
    /// Table for bodies with index below `max_bodies`.
    pub fn new(max_bodies: usize) -> Self {
        Self {
            entries: (0..max_bodies).map(|_| Tracking::default()).collect(),
        }
    }

    /// Number of entries.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    fn entry(&self, id: BodyId) -> Option<&Tracking> {
        self.entries.get(id.index() as usize)
    }

    /// Current tree location of `id`.
    #[inline]
    pub fn location(&self, id: BodyId) -> BodyLocation {
        self.entry(id).map_or(BodyLocation::INVALID, |t| {
            BodyLocation::from_raw(t.location.load(Ordering::Acquire))
        })
    }

    #[inline]
    pub(crate) fn set_location(&self, id: BodyId, location: BodyLocation) {
        if let Some(t) = self.entry(id) {
            t.location.store(location.raw(), Ordering::Release);
        }
    }

    /// Broadphase layer the body is inserted in, or [`BroadPhaseLayer::INVALID`].
    #[inline]
    pub fn broad_phase_layer(&self, id: BodyId) -> BroadPhaseLayer {
        self.entry(id).map_or(BroadPhaseLayer::INVALID, |t| {
            BroadPhaseLayer::new(t.broad_phase_layer.load(Ordering::Acquire))
        })
    }

    /// Object layer recorded for the body.
    #[inline]
    pub fn object_layer(&self, id: BodyId) -> ObjectLayer {
        self.entry(id).map_or(ObjectLayer::INVALID, |t| {
            ObjectLayer::new(t.object_layer.load(Ordering::Acquire))
        })
    }

    pub(crate) fn set_layers(&self, id: BodyId, bp: BroadPhaseLayer, object: ObjectLayer) {
        if let Some(t) = self.entry(id) {
            t.object_layer.store(object.value(), Ordering::Release);
            t.broad_phase_layer.store(bp.value(), Ordering::Release);
        }
    }

    pub(crate) fn set_object_layer(&self, id: BodyId, object: ObjectLayer) {
        if let Some(t) = self.entry(id) {
            t.object_layer.store(object.value(), Ordering::Release);
        }
    }

    /// Forget the body.
    pub(crate) fn clear(&self, id: BodyId) {
        if let Some(t) = self.entry(id) {
            t.location
                .store(BodyLocation::INVALID.raw(), Ordering::Release);
            t.broad_phase_layer
                .store(BroadPhaseLayer::INVALID.value(), Ordering::Release);
            t.object_layer
                .store(ObjectLayer::INVALID.value(), Ordering::Release);
        }
    }

    /// Whether the body is currently inserted in the broadphase.
    #[inline]
    pub fn is_inserted(&self, id: BodyId) -> bool {
        self.broad_phase_layer(id) != BroadPhaseLayer::INVALID
    }

    /// Number of bodies currently inserted.
    pub fn tracked_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|t| t.broad_phase_layer.load(Ordering::Acquire) != BroadPhaseLayer::INVALID.value())
            .count()
    }
}
