// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Query shapes and their tests against bounding boxes.

use glam::{Mat3, Vec3};

use crate::collector::BroadPhaseCastResult;
use crate::types::{BodyId, BoundingBox};

/// A ray segment. `direction` spans the full cast: the segment ends at `origin + direction`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RayCast {
    /// Start point.
    pub origin: Vec3,
    /// Direction and length.
    pub direction: Vec3,
}

impl RayCast {
    /// Segment from `origin` to `origin + direction`.
    pub const fn new(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }
}

/// An axis-aligned box swept along `direction`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AABoxCast {
    /// Box at the start of the sweep.
    pub bounds: BoundingBox,
    /// Sweep direction and length.
    pub direction: Vec3,
}

/// A rotated box.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OrientedBox {
    /// Center in world space.
    pub center: Vec3,
    /// Rotation; columns are the box axes in world space.
    pub rotation: Mat3,
    /// Half size along each box axis.
    pub half_extents: Vec3,
}

impl OrientedBox {
    /// World space bounds of the box.
    pub fn bounds(&self) -> BoundingBox {
        let abs = Mat3::from_cols(
            self.rotation.x_axis.abs(),
            self.rotation.y_axis.abs(),
            self.rotation.z_axis.abs(),
        );
        BoundingBox::from_center_half_extents(self.center, abs * self.half_extents)
    }

    /// Separating axis test against an axis-aligned box (15 axes).
    pub fn overlaps(&self, b: &BoundingBox) -> bool {
        const EPS: f32 = 1.0e-6;
        let a_half = b.half_extent();
        let o_half = self.half_extents;
        let t = self.center - b.center();
        // r[i][j]: component i of box axis j.
        let r: [[f32; 3]; 3] = core::array::from_fn(|i| {
            core::array::from_fn(|j| self.rotation.col(j)[i])
        });
        let abs_r: [[f32; 3]; 3] = core::array::from_fn(|i| {
            core::array::from_fn(|j| r[i][j].abs() + EPS)
        });

        for i in 0..3 {
            let ra = a_half[i];
            let rb = o_half[0] * abs_r[i][0] + o_half[1] * abs_r[i][1] + o_half[2] * abs_r[i][2];
            if t[i].abs() > ra + rb {
                return false;
            }
        }
        for j in 0..3 {
            let ra = a_half[0] * abs_r[0][j] + a_half[1] * abs_r[1][j] + a_half[2] * abs_r[2][j];
            let rb = o_half[j];
            let d = t[0] * r[0][j] + t[1] * r[1][j] + t[2] * r[2][j];
            if d.abs() > ra + rb {
                return false;
            }
        }
        for i in 0..3 {
            let (i1, i2) = ((i + 1) % 3, (i + 2) % 3);
            for j in 0..3 {
                let (j1, j2) = ((j + 1) % 3, (j + 2) % 3);
                let ra = a_half[i1] * abs_r[i2][j] + a_half[i2] * abs_r[i1][j];
                let rb = o_half[j1] * abs_r[i][j2] + o_half[j2] * abs_r[i][j1];
                let d = t[i2] * r[i1][j] - t[i1] * r[i2][j];
                if d.abs() > ra + rb {
                    return false;
                }
            }
        }
        true
    }
}

/// Precomputed ray for repeated slab tests.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RayInvDirection {
    origin: Vec3,
    inv_direction: Vec3,
    is_parallel: [bool; 3],
}

impl RayInvDirection {
    pub(crate) fn new(origin: Vec3, direction: Vec3) -> Self {
        let is_parallel = core::array::from_fn(|i| direction[i].abs() < 1.0e-20);
        let inv_direction = Vec3::from_array(core::array::from_fn(|i| {
            if is_parallel[i] { 0.0 } else { 1.0 / direction[i] }
        }));
        Self {
            origin,
            inv_direction,
            is_parallel,
        }
    }

    /// Fraction at which the ray enters `b`, `0.0` if it starts inside, or `f32::MAX` on a miss.
    ///
    /// Boxes the segment from `origin` to `origin + direction` does not reach are misses.
    pub(crate) fn enter_fraction(&self, b: &BoundingBox) -> f32 {
        let mut t_min = 0.0_f32;
        let mut t_max = 1.0_f32;
        for i in 0..3 {
            if self.is_parallel[i] {
                if self.origin[i] < b.min[i] || self.origin[i] > b.max[i] {
                    return f32::MAX;
                }
                continue;
            }
            let t1 = (b.min[i] - self.origin[i]) * self.inv_direction[i];
            let t2 = (b.max[i] - self.origin[i]) * self.inv_direction[i];
            t_min = t_min.max(t1.min(t2));
            t_max = t_max.min(t1.max(t2));
            if t_min > t_max {
                return f32::MAX;
            }
        }
        t_min
    }
}

/// A query shape as seen by the tree traversal.
///
/// `test` returns a sort key for boxes the shape touches and `None` otherwise. Keys are
/// compared against the collector's early-out fraction: a box is only visited while its key
/// is strictly below it.
pub(crate) trait QueryShape {
    type Hit;

    fn test(&self, bounds: &BoundingBox) -> Option<f32>;

    fn hit(&self, body: BodyId, key: f32) -> Self::Hit;
}

/// Overlap queries do not order their results; every key is the lowest possible fraction.
const OVERLAP_KEY: f32 = -f32::MAX;

pub(crate) struct RayQuery(pub(crate) RayInvDirection);

impl QueryShape for RayQuery {
    type Hit = BroadPhaseCastResult;

    fn test(&self, bounds: &BoundingBox) -> Option<f32> {
        let f = self.0.enter_fraction(bounds);
        (f != f32::MAX).then_some(f)
    }

    fn hit(&self, body_id: BodyId, fraction: f32) -> BroadPhaseCastResult {
        BroadPhaseCastResult { body_id, fraction }
    }
}

pub(crate) struct BoxCastQuery {
    ray: RayInvDirection,
    half_extent: Vec3,
}

impl BoxCastQuery {
    pub(crate) fn new(cast: &AABoxCast) -> Self {
        Self {
            ray: RayInvDirection::new(cast.bounds.center(), cast.direction),
            half_extent: cast.bounds.half_extent(),
        }
    }
}

impl QueryShape for BoxCastQuery {
    type Hit = BroadPhaseCastResult;

    fn test(&self, bounds: &BoundingBox) -> Option<f32> {
        let f = self.ray.enter_fraction(&bounds.expanded(self.half_extent));
        (f != f32::MAX).then_some(f)
    }

    fn hit(&self, body_id: BodyId, fraction: f32) -> BroadPhaseCastResult {
        BroadPhaseCastResult { body_id, fraction }
    }
}

pub(crate) struct AABoxQuery(pub(crate) BoundingBox);

impl QueryShape for AABoxQuery {
    type Hit = BodyId;

    fn test(&self, bounds: &BoundingBox) -> Option<f32> {
        self.0.overlaps(bounds).then_some(OVERLAP_KEY)
    }

    fn hit(&self, body: BodyId, _key: f32) -> BodyId {
        body
    }
}

pub(crate) struct SphereQuery {
    pub(crate) center: Vec3,
    pub(crate) radius_sq: f32,
}

impl QueryShape for SphereQuery {
    type Hit = BodyId;

    fn test(&self, bounds: &BoundingBox) -> Option<f32> {
        (bounds.distance_squared_to_point(self.center) <= self.radius_sq).then_some(OVERLAP_KEY)
    }

    fn hit(&self, body: BodyId, _key: f32) -> BodyId {
        body
    }
}

pub(crate) struct PointQuery(pub(crate) Vec3);

impl QueryShape for PointQuery {
    type Hit = BodyId;

    fn test(&self, bounds: &BoundingBox) -> Option<f32> {
        bounds.contains_point(self.0).then_some(OVERLAP_KEY)
    }

    fn hit(&self, body: BodyId, _key: f32) -> BodyId {
        body
    }
}

pub(crate) struct OrientedBoxQuery {
    shape: OrientedBox,
    bounds: BoundingBox,
}

impl OrientedBoxQuery {
    pub(crate) fn new(shape: &OrientedBox) -> Self {
        Self {
            shape: *shape,
            bounds: shape.bounds(),
        }
    }
}

impl QueryShape for OrientedBoxQuery {
    type Hit = BodyId;

    fn test(&self, bounds: &BoundingBox) -> Option<f32> {
        (self.bounds.overlaps(bounds) && self.shape.overlaps(bounds)).then_some(OVERLAP_KEY)
    }

    fn hit(&self, body: BodyId, _key: f32) -> BodyId {
        body
    }
}
