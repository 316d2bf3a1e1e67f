// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Caller-visible failures.

use thiserror::Error;

/// Errors reported by the broadphase.
///
/// None of these leave the index in an inconsistent state: a failed rebuild keeps the live
/// tree, a failed insertion leaves the affected bodies untracked.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BroadPhaseError {
    /// The node allocator ran out of slots.
    #[error("node allocator exhausted ({capacity} nodes)")]
    CapacityExhausted {
        /// Capacity of the allocator.
        capacity: usize,
    },
    /// A body index is beyond the configured maximum.
    #[error("body index {index} exceeds the maximum of {max} bodies")]
    TooManyBodies {
        /// Offending body index.
        index: u32,
        /// Configured body capacity.
        max: usize,
    },
    /// An object layer maps to no valid broadphase layer.
    #[error("object layer {0} has no broadphase layer")]
    InvalidLayer(u16),
}

/// Result type of fallible broadphase operations.
pub type Result<T, E = BroadPhaseError> = core::result::Result<T, E>;
