// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared helpers for unit tests.

use std::sync::RwLock;

use glam::Vec3;

use crate::body::{BodyManager, BodyView};
use crate::layer::ObjectLayer;
use crate::types::{BodyId, BoundingBox};

/// A unit cube with its minimum corner at `(x, y, z)`.
pub(crate) fn unit_at(x: f32, y: f32, z: f32) -> BoundingBox {
    BoundingBox::new(Vec3::new(x, y, z), Vec3::new(x + 1.0, y + 1.0, z + 1.0))
}

/// A growable in-memory [`BodyManager`] with sequence 0 ids.
#[derive(Debug, Default)]
pub(crate) struct TestBodies(RwLock<Vec<Option<BodyView>>>);

impl TestBodies {
    pub(crate) fn set(&self, index: u32, bounds: BoundingBox) -> BodyView {
        self.set_layer(index, bounds, ObjectLayer::new(0))
    }

    pub(crate) fn set_layer(&self, index: u32, bounds: BoundingBox, object_layer: ObjectLayer) -> BodyView {
        let view = BodyView {
            id: BodyId::new(index, 0),
            bounds,
            object_layer,
            is_active: true,
        };
        let mut v = self.0.write().unwrap();
        if v.len() <= index as usize {
            v.resize(index as usize + 1, None);
        }
        v[index as usize] = Some(view);
        view
    }

    pub(crate) fn view(&self, index: u32) -> BodyView {
        self.0.read().unwrap()[index as usize].unwrap()
    }

    pub(crate) fn kill(&self, index: u32) {
        self.0.write().unwrap()[index as usize] = None;
    }
}

impl BodyManager for TestBodies {
    fn max_bodies(&self) -> usize {
        1024
    }

    fn body(&self, id: BodyId) -> Option<BodyView> {
        self.0
            .read()
            .unwrap()
            .get(id.index() as usize)
            .copied()
            .flatten()
            .filter(|v| v.id == id)
    }
}
