// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Broadphase implementations.
//!
//! - `quad_tree`: one concurrent quad tree per broadphase layer, rebuilt in two phases.
//! - `brute_force` (feature `brute_force`): linear scan over every body, used as a reference.
//!
//! Tree maintenance
//! ----------------
//! Between rebuilds a tree only grows: new bodies are appended to leaf buckets, full leaves
//! are paired with a new sibling under a fresh interior node, and ancestor boxes widen.
//! Removing or shrinking a body never tightens its ancestors, so query cost drifts upward as
//! bodies move. A rebuild restores exact boxes: it splits the bodies along the largest axis of
//! their centers into up to four groups per node, rounding group sizes to whole leaves.

pub(crate) mod quad_tree;
#[cfg(feature = "brute_force")]
pub(crate) mod brute_force;

#[cfg(feature = "brute_force")]
pub use brute_force::{BroadPhaseBruteForce, BruteForceAddState};
pub use quad_tree::{BroadPhaseQuadTree, QuadTreeAddState, QuadTreeUpdateState};
