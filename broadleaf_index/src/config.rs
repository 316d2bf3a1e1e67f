// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Broadphase construction parameters.

/// Extra nodes on top of the per-body estimate, so tiny worlds can still rebuild.
const NODE_SLACK: usize = 64;

/// Largest node count a [`crate::BodyLocation`] can address.
pub(crate) const MAX_NODES: usize = 1 << 30;

/// Configuration of a [`crate::BroadPhaseQuadTree`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadPhaseConfig {
    /// Upper bound on body indices.
    pub max_bodies: usize,
    /// Explicit node capacity. Defaults to an estimate that fits two full trees per layer
    /// worth of bodies.
    pub max_nodes: Option<usize>,
    /// Sort pair finding input so results come out in a reproducible order.
    pub deterministic: bool,
}

impl Default for BroadPhaseConfig {
    fn default() -> Self {
        Self {
            max_bodies: 10_240,
            max_nodes: None,
            deterministic: false,
        }
    }
}

impl BroadPhaseConfig {
    /// Configuration for `max_bodies` bodies.
    pub fn new(max_bodies: usize) -> Self {
        Self {
            max_bodies,
            ..Self::default()
        }
    }

    /// Set the body capacity.
    pub fn with_max_bodies(mut self, max_bodies: usize) -> Self {
        self.max_bodies = max_bodies;
        self
    }

    /// Set an explicit node capacity.
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    /// Request deterministic pair finding.
    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    /// Node capacity the allocator will be created with.
    ///
    /// A tree over `n` bodies needs at most about `n / 2` nodes; live and pending
    /// generations plus incremental splits are covered by four nodes per body.
    pub fn node_capacity(&self) -> usize {
        self.max_nodes
            .unwrap_or_else(|| self.max_bodies.saturating_mul(4).saturating_add(NODE_SLACK))
            .min(MAX_NODES)
    }
}
