// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Layer filters used by queries and pair finding.
//!
//! Each filter is a single-purpose predicate passed by reference. The unit struct
//! implementations ([`AcceptAll`]) accept everything.

use core::fmt;

use crate::layer::{
    BroadPhaseLayer, BroadPhaseLayerInterface, BroadPhaseLayerInterfaceMask, ObjectLayer,
    mask_bits,
};

/// Decides which broadphase layers (trees) a query visits.
pub trait BroadPhaseLayerFilter: Sync {
    /// Whether the tree for `layer` should be searched.
    fn should_collide(&self, layer: BroadPhaseLayer) -> bool;
}

/// Decides which object layers a query reports.
pub trait ObjectLayerFilter: Sync {
    /// Whether bodies on `layer` should be reported.
    fn should_collide(&self, layer: ObjectLayer) -> bool;
}

/// Decides whether an object layer can collide with a broadphase layer at all.
pub trait ObjectVsBroadPhaseLayerFilter: Sync {
    /// Whether bodies on `object` need to look in the tree for `broad_phase`.
    fn should_collide(&self, object: ObjectLayer, broad_phase: BroadPhaseLayer) -> bool;
}

/// Decides whether two object layers collide.
pub trait ObjectLayerPairFilter: Sync {
    /// Whether a body on `a` can collide with a body on `b`.
    fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool;
}

/// Filter that accepts everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct AcceptAll;

impl BroadPhaseLayerFilter for AcceptAll {
    fn should_collide(&self, _layer: BroadPhaseLayer) -> bool {
        true
    }
}

impl ObjectLayerFilter for AcceptAll {
    fn should_collide(&self, _layer: ObjectLayer) -> bool {
        true
    }
}

impl ObjectVsBroadPhaseLayerFilter for AcceptAll {
    fn should_collide(&self, _object: ObjectLayer, _broad_phase: BroadPhaseLayer) -> bool {
        true
    }
}

impl ObjectLayerPairFilter for AcceptAll {
    fn should_collide(&self, _a: ObjectLayer, _b: ObjectLayer) -> bool {
        true
    }
}

/// Broadphase layer filter that asks an [`ObjectVsBroadPhaseLayerFilter`] on behalf of one
/// object layer.
pub struct DefaultBroadPhaseLayerFilter<'a> {
    filter: &'a dyn ObjectVsBroadPhaseLayerFilter,
    layer: ObjectLayer,
}

impl fmt::Debug for DefaultBroadPhaseLayerFilter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultBroadPhaseLayerFilter")
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

impl<'a> DefaultBroadPhaseLayerFilter<'a> {
    /// Filter for queries made by bodies on `layer`.
    pub fn new(filter: &'a dyn ObjectVsBroadPhaseLayerFilter, layer: ObjectLayer) -> Self {
        Self { filter, layer }
    }
}

impl BroadPhaseLayerFilter for DefaultBroadPhaseLayerFilter<'_> {
    fn should_collide(&self, layer: BroadPhaseLayer) -> bool {
        self.filter.should_collide(self.layer, layer)
    }
}

/// Accepts exactly one broadphase layer.
#[derive(Copy, Clone, Debug)]
pub struct SpecifiedBroadPhaseLayerFilter(pub BroadPhaseLayer);

impl BroadPhaseLayerFilter for SpecifiedBroadPhaseLayerFilter {
    fn should_collide(&self, layer: BroadPhaseLayer) -> bool {
        layer == self.0
    }
}

/// Object layer filter that asks an [`ObjectLayerPairFilter`] on behalf of one object layer.
pub struct DefaultObjectLayerFilter<'a> {
    filter: &'a dyn ObjectLayerPairFilter,
    layer: ObjectLayer,
}

impl fmt::Debug for DefaultObjectLayerFilter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultObjectLayerFilter")
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

impl<'a> DefaultObjectLayerFilter<'a> {
    /// Filter for queries made by bodies on `layer`.
    pub fn new(filter: &'a dyn ObjectLayerPairFilter, layer: ObjectLayer) -> Self {
        Self { filter, layer }
    }
}

impl ObjectLayerFilter for DefaultObjectLayerFilter<'_> {
    fn should_collide(&self, layer: ObjectLayer) -> bool {
        self.filter.should_collide(self.layer, layer)
    }
}

/// Accepts exactly one object layer.
#[derive(Copy, Clone, Debug)]
pub struct SpecifiedObjectLayerFilter(pub ObjectLayer);

impl ObjectLayerFilter for SpecifiedObjectLayerFilter {
    fn should_collide(&self, layer: ObjectLayer) -> bool {
        layer == self.0
    }
}

/// Symmetric object layer pair table.
#[derive(Clone, Debug)]
pub struct ObjectLayerPairFilterTable {
    num_layers: usize,
    bits: Vec<bool>,
}

impl ObjectLayerPairFilterTable {
    /// Table for `num_layers` layers where nothing collides.
    pub fn new(num_layers: usize) -> Self {
        Self {
            num_layers,
            bits: vec![false; num_layers * num_layers],
        }
    }

    /// Number of object layers.
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn set(&mut self, a: ObjectLayer, b: ObjectLayer, value: bool) -> &mut Self {
        let (a, b) = (usize::from(a.value()), usize::from(b.value()));
        self.bits[a * self.num_layers + b] = value;
        self.bits[b * self.num_layers + a] = value;
        self
    }

    /// Let `a` and `b` collide.
    pub fn enable_collision(&mut self, a: ObjectLayer, b: ObjectLayer) -> &mut Self {
        self.set(a, b, true)
    }

    /// Stop `a` and `b` from colliding.
    pub fn disable_collision(&mut self, a: ObjectLayer, b: ObjectLayer) -> &mut Self {
        self.set(a, b, false)
    }
}

impl ObjectLayerPairFilter for ObjectLayerPairFilterTable {
    fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool {
        let (a, b) = (usize::from(a.value()), usize::from(b.value()));
        a < self.num_layers && b < self.num_layers && self.bits[a * self.num_layers + b]
    }
}

/// Object-vs-broadphase table derived from a layer interface and a pair filter.
///
/// Object layer `a` may look into broadphase layer `l` if any object layer `b` mapped to
/// `l` collides with `a`.
#[derive(Clone, Debug)]
pub struct ObjectVsBroadPhaseLayerFilterTable {
    num_broad_phase_layers: usize,
    bits: Vec<bool>,
}

impl ObjectVsBroadPhaseLayerFilterTable {
    /// Derive the table.
    pub fn new(
        interface: &dyn BroadPhaseLayerInterface,
        pair_filter: &dyn ObjectLayerPairFilter,
        num_object_layers: u16,
    ) -> Self {
        let num_bp = interface.num_broad_phase_layers();
        let mut bits = vec![false; usize::from(num_object_layers) * num_bp];
        for a in 0..num_object_layers {
            for b in 0..num_object_layers {
                if !pair_filter.should_collide(ObjectLayer::new(a), ObjectLayer::new(b)) {
                    continue;
                }
                let bp = interface.broad_phase_layer(ObjectLayer::new(b));
                if bp.index() < num_bp {
                    bits[usize::from(a) * num_bp + bp.index()] = true;
                }
            }
        }
        Self {
            num_broad_phase_layers: num_bp,
            bits,
        }
    }
}

impl ObjectVsBroadPhaseLayerFilter for ObjectVsBroadPhaseLayerFilterTable {
    fn should_collide(&self, object: ObjectLayer, broad_phase: BroadPhaseLayer) -> bool {
        broad_phase.index() < self.num_broad_phase_layers
            && self
                .bits
                .get(usize::from(object.value()) * self.num_broad_phase_layers + broad_phase.index())
                .copied()
                .unwrap_or(false)
    }
}

/// Pair filter over group/mask bits (see [`mask_bits`]).
#[derive(Copy, Clone, Debug, Default)]
pub struct ObjectLayerPairFilterMask;

impl ObjectLayerPairFilter for ObjectLayerPairFilterMask {
    fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool {
        mask_bits::group(a) & mask_bits::mask(b) != 0 && mask_bits::group(b) & mask_bits::mask(a) != 0
    }
}

/// Object-vs-broadphase filter backed by a [`BroadPhaseLayerInterfaceMask`].
#[derive(Debug)]
pub struct ObjectVsBroadPhaseLayerFilterMask<'a> {
    interface: &'a BroadPhaseLayerInterfaceMask,
}

impl<'a> ObjectVsBroadPhaseLayerFilterMask<'a> {
    /// Filter using the include bits configured on `interface`.
    pub fn new(interface: &'a BroadPhaseLayerInterfaceMask) -> Self {
        Self { interface }
    }
}

impl ObjectVsBroadPhaseLayerFilter for ObjectVsBroadPhaseLayerFilterMask<'_> {
    fn should_collide(&self, object: ObjectLayer, broad_phase: BroadPhaseLayer) -> bool {
        self.interface.should_collide(object, broad_phase)
    }
}
