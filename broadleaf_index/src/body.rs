// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The body manager collaborator.

use crate::layer::ObjectLayer;
use crate::types::{BodyId, BoundingBox};

/// Snapshot of the body state the broadphase reads.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BodyView {
    /// Identifier of the body.
    pub id: BodyId,
    /// World space bounds.
    pub bounds: BoundingBox,
    /// Object layer of the body.
    pub object_layer: ObjectLayer,
    /// Whether the body is awake and moving.
    pub is_active: bool,
}

/// Source of body state.
///
/// The broadphase never owns bodies; it asks the manager for bounds and layers when bodies
/// are added, moved or rebuilt. Implementations take whatever per-body lock they need inside
/// [`BodyManager::body`] and return a copy.
pub trait BodyManager: Send + Sync {
    /// Upper bound (exclusive) on [`BodyId::index`] of any body.
    fn max_bodies(&self) -> usize;

    /// Snapshot of a body, or `None` if `id` does not name a live body.
    fn body(&self, id: BodyId) -> Option<BodyView>;
}

impl<T: BodyManager + ?Sized> BodyManager for &T {
    fn max_bodies(&self) -> usize {
        (**self).max_bodies()
    }

    fn body(&self, id: BodyId) -> Option<BodyView> {
        (**self).body(id)
    }
}

impl<T: BodyManager + ?Sized> BodyManager for std::sync::Arc<T> {
    fn max_bodies(&self) -> usize {
        (**self).max_bodies()
    }

    fn body(&self, id: BodyId) -> Option<BodyView> {
        (**self).body(id)
    }
}
