// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Primitive geometry and identifier types.

use core::fmt;

use glam::Vec3;

/// Axis-aligned bounding box in 3D.
///
/// A box is valid when `min <= max` on every axis. [`BoundingBox::EMPTY`] is the
/// distinguished inverted box: it contains nothing, overlaps nothing, and is the
/// identity for [`BoundingBox::union`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundingBox {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BoundingBox {
    /// The empty (inverted) box.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(-f32::MAX),
    };

    /// Create a new box from min/max corners.
    #[inline(always)]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create a box from a center and half extents.
    #[inline]
    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// Smallest box containing all the points. Returns [`BoundingBox::EMPTY`] for no points.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points
            .into_iter()
            .fold(Self::EMPTY, |acc, p| acc.union(&Self::new(p, p)))
    }

    /// Whether `min <= max` on every axis. A single point is a valid box.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    /// Whether this box is inverted on any axis (contains nothing).
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.is_valid()
    }

    /// Center of the box.
    #[inline]
    pub fn center(&self) -> Vec3 {
        0.5 * (self.min + self.max)
    }

    /// Full size along each axis.
    #[inline]
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    /// Half size along each axis.
    #[inline]
    pub fn half_extent(&self) -> Vec3 {
        0.5 * (self.max - self.min)
    }

    /// Surface area; zero for empty boxes.
    #[inline]
    pub fn surface_area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let e = self.extent();
        2.0 * (e.x * e.y + e.y * e.z + e.z * e.x)
    }

    /// Index of the axis with the largest extent (0 = x, 1 = y, 2 = z).
    #[inline]
    pub fn largest_axis(&self) -> usize {
        let e = self.extent();
        if e.x >= e.y && e.x >= e.z {
            0
        } else if e.y >= e.z {
            1
        } else {
            2
        }
    }

    /// The smallest box enclosing both boxes.
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grow this box to enclose `other`.
    #[inline]
    pub fn encapsulate(&mut self, other: &Self) {
        *self = self.union(other);
    }

    /// Whether `other` lies entirely inside this box. An empty `other` is contained by any box.
    #[inline]
    pub fn contains(&self, other: &Self) -> bool {
        other.is_empty() || (self.min.cmple(other.min).all() && self.max.cmpge(other.max).all())
    }

    /// Whether the point lies inside the box (faces included).
    #[inline]
    pub fn contains_point(&self, p: Vec3) -> bool {
        self.min.cmple(p).all() && self.max.cmpge(p).all()
    }

    /// Whether the two boxes overlap. Touching faces count as overlapping.
    #[inline]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// A copy grown by `margin` on every side.
    #[inline]
    pub fn expanded(&self, margin: Vec3) -> Self {
        Self {
            min: self.min - margin,
            max: self.max + margin,
        }
    }

    /// Squared distance from `p` to the closest point of the box; zero when inside.
    #[inline]
    pub fn distance_squared_to_point(&self, p: Vec3) -> f32 {
        let closest = p.clamp(self.min, self.max);
        (closest - p).length_squared()
    }
}

/// Identifier of a body.
///
/// The low 23 bits are a stable slot index (used to address the tracking table),
/// the next 8 bits are a sequence number that changes every time the slot is reused.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(u32);

impl BodyId {
    /// Mask of the index bits.
    pub const INDEX_MASK: u32 = 0x007f_ffff;
    /// Largest index a body can have.
    pub const MAX_INDEX: u32 = Self::INDEX_MASK - 1;
    /// The invalid body identifier.
    pub const INVALID: Self = Self(u32::MAX);

    /// Build an identifier from a slot index and a sequence number.
    #[inline]
    pub const fn new(index: u32, sequence: u8) -> Self {
        debug_assert!(index <= Self::MAX_INDEX, "body index out of range");
        Self(((sequence as u32) << 23) | (index & Self::INDEX_MASK))
    }

    /// Reinterpret a raw value as an identifier.
    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw 32-bit value.
    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Slot index of the body.
    #[inline(always)]
    pub const fn index(self) -> u32 {
        self.0 & Self::INDEX_MASK
    }

    /// Sequence number of the body.
    #[allow(
        clippy::cast_possible_truncation,
        reason = "The sequence number occupies exactly 8 bits."
    )]
    #[inline(always)]
    pub const fn sequence(self) -> u8 {
        (self.0 >> 23) as u8
    }

    /// Whether this is not [`BodyId::INVALID`].
    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl fmt::Debug for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "BodyId({}:{})", self.index(), self.sequence())
        } else {
            f.write_str("BodyId(invalid)")
        }
    }
}

/// An unordered pair of bodies, stored as `(min, max)` when built with [`BodyPair::canonical`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyPair {
    /// The smaller identifier.
    pub first: BodyId,
    /// The larger identifier.
    pub second: BodyId,
}

impl BodyPair {
    /// Build a pair with `first < second`.
    #[inline]
    pub fn canonical(a: BodyId, b: BodyId) -> Self {
        if a <= b {
            Self {
                first: a,
                second: b,
            }
        } else {
            Self {
                first: b,
                second: a,
            }
        }
    }
}
