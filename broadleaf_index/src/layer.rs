// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Object layers, broadphase layers, and the mapping between them.
//!
//! Every body has an [`ObjectLayer`]. A [`BroadPhaseLayerInterface`] maps object layers
//! onto a small number of [`BroadPhaseLayer`]s; the broadphase keeps one tree per
//! broadphase layer so that, for example, static and moving bodies live apart.

use core::fmt;

/// Fine-grained layer of a body.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ObjectLayer(u16);

impl ObjectLayer {
    /// The invalid object layer.
    pub const INVALID: Self = Self(0xffff);

    /// Wrap a raw value.
    #[inline]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Raw value.
    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }
}

/// Coarse layer; each one gets its own tree.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BroadPhaseLayer(u8);

impl BroadPhaseLayer {
    /// The invalid broadphase layer.
    pub const INVALID: Self = Self(0xff);

    /// Wrap a raw value.
    #[inline]
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Raw value.
    #[inline]
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Value as an index into per-layer arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Maps object layers to broadphase layers.
pub trait BroadPhaseLayerInterface: Send + Sync {
    /// Number of broadphase layers; layers are numbered `0..count`.
    fn num_broad_phase_layers(&self) -> usize;

    /// Broadphase layer for an object layer.
    fn broad_phase_layer(&self, layer: ObjectLayer) -> BroadPhaseLayer;

    /// Name of a broadphase layer, used in tree names and logs.
    fn broad_phase_layer_name(&self, _layer: BroadPhaseLayer) -> &str {
        "Layer"
    }
}

/// Table driven [`BroadPhaseLayerInterface`].
#[derive(Clone, Debug)]
pub struct BroadPhaseLayerInterfaceTable {
    object_to_broad_phase: Vec<BroadPhaseLayer>,
    names: Vec<String>,
}

impl BroadPhaseLayerInterfaceTable {
    /// Table with every object layer mapped to [`BroadPhaseLayer::INVALID`].
    pub fn new(num_object_layers: usize, num_broad_phase_layers: usize) -> Self {
        Self {
            object_to_broad_phase: vec![BroadPhaseLayer::INVALID; num_object_layers],
            names: (0..num_broad_phase_layers)
                .map(|i| format!("Layer{i}"))
                .collect(),
        }
    }

    /// Map `object` to `broad_phase`.
    pub fn map(&mut self, object: ObjectLayer, broad_phase: BroadPhaseLayer) -> &mut Self {
        debug_assert!(
            broad_phase.index() < self.names.len(),
            "broadphase layer {broad_phase:?} out of range"
        );
        self.object_to_broad_phase[usize::from(object.value())] = broad_phase;
        self
    }

    /// Set the diagnostic name of a broadphase layer.
    pub fn set_name(&mut self, layer: BroadPhaseLayer, name: impl Into<String>) -> &mut Self {
        self.names[layer.index()] = name.into();
        self
    }
}

impl BroadPhaseLayerInterface for BroadPhaseLayerInterfaceTable {
    fn num_broad_phase_layers(&self) -> usize {
        self.names.len()
    }

    fn broad_phase_layer(&self, layer: ObjectLayer) -> BroadPhaseLayer {
        self.object_to_broad_phase
            .get(usize::from(layer.value()))
            .copied()
            .unwrap_or(BroadPhaseLayer::INVALID)
    }

    fn broad_phase_layer_name(&self, layer: BroadPhaseLayer) -> &str {
        self.names.get(layer.index()).map_or("Invalid", String::as_str)
    }
}

/// Group and mask bits packed into an [`ObjectLayer`].
///
/// The low byte is the group, the high byte the mask. Two layers collide when each one's
/// group intersects the other's mask.
pub mod mask_bits {
    use super::ObjectLayer;

    /// Mask value that collides with every group.
    pub const ALL: u8 = 0xff;

    /// Pack group and mask bits into a layer.
    #[inline]
    pub const fn object_layer(group: u8, mask: u8) -> ObjectLayer {
        ObjectLayer::new(((mask as u16) << 8) | group as u16)
    }

    /// Group bits of a layer.
    #[allow(clippy::cast_possible_truncation, reason = "Low byte by construction.")]
    #[inline]
    pub const fn group(layer: ObjectLayer) -> u8 {
        layer.value() as u8
    }

    /// Mask bits of a layer.
    #[allow(clippy::cast_possible_truncation, reason = "High byte by construction.")]
    #[inline]
    pub const fn mask(layer: ObjectLayer) -> u8 {
        (layer.value() >> 8) as u8
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct GroupRule {
    include: u8,
    exclude: u8,
}

/// [`BroadPhaseLayerInterface`] that picks a layer from group bits.
///
/// A broadphase layer accepts an object whose group intersects its include bits and does not
/// intersect its exclude bits. Layers are tried from lowest to highest; if none accepts, the
/// last layer is used.
pub struct BroadPhaseLayerInterfaceMask {
    rules: Vec<GroupRule>,
    names: Vec<String>,
}

impl fmt::Debug for BroadPhaseLayerInterfaceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadPhaseLayerInterfaceMask")
            .field("layers", &self.rules.len())
            .finish_non_exhaustive()
    }
}

impl BroadPhaseLayerInterfaceMask {
    /// Interface with `num_broad_phase_layers` unconfigured layers.
    pub fn new(num_broad_phase_layers: usize) -> Self {
        debug_assert!(num_broad_phase_layers > 0, "need at least one layer");
        Self {
            rules: vec![GroupRule::default(); num_broad_phase_layers],
            names: (0..num_broad_phase_layers)
                .map(|i| format!("Layer{i}"))
                .collect(),
        }
    }

    /// Configure which groups a layer takes.
    pub fn configure_layer(
        &mut self,
        layer: BroadPhaseLayer,
        groups_to_include: u8,
        groups_to_exclude: u8,
    ) -> &mut Self {
        self.rules[layer.index()] = GroupRule {
            include: groups_to_include,
            exclude: groups_to_exclude,
        };
        self
    }

    /// Set the diagnostic name of a broadphase layer.
    pub fn set_name(&mut self, layer: BroadPhaseLayer, name: impl Into<String>) -> &mut Self {
        self.names[layer.index()] = name.into();
        self
    }

    /// Whether an object on `object` may collide with anything in `broad_phase`.
    ///
    /// The fallback (last) layer can hold any group, so it is always considered.
    pub fn should_collide(&self, object: ObjectLayer, broad_phase: BroadPhaseLayer) -> bool {
        let mask = mask_bits::mask(object);
        let idx = broad_phase.index();
        idx + 1 == self.rules.len() || self.rules.get(idx).is_some_and(|r| r.include & mask != 0)
    }
}

impl BroadPhaseLayerInterface for BroadPhaseLayerInterfaceMask {
    fn num_broad_phase_layers(&self) -> usize {
        self.rules.len()
    }

    #[allow(clippy::cast_possible_truncation, reason = "Layer count fits in a u8.")]
    fn broad_phase_layer(&self, layer: ObjectLayer) -> BroadPhaseLayer {
        let group = mask_bits::group(layer);
        let idx = self
            .rules
            .iter()
            .position(|r| group & r.include != 0 && group & r.exclude == 0)
            .unwrap_or(self.rules.len() - 1);
        BroadPhaseLayer::new(idx as u8)
    }

    fn broad_phase_layer_name(&self, layer: BroadPhaseLayer) -> &str {
        self.names.get(layer.index()).map_or("Invalid", String::as_str)
    }
}
