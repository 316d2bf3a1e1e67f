// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Broadleaf Bodies: body storage and step driving for the Broadleaf broadphase.
//!
//! [`broadleaf_index`] never owns bodies. It reads bounds and layers through the
//! [`BodyManager`](broadleaf_index::BodyManager) trait and expects its caller to follow a
//! per-step protocol. This crate supplies both halves:
//!
//! - [`BodyStore`]: a fixed-capacity body table with a lock per body. Ids are generational;
//!   removing a body and creating another in its slot bumps the sequence number, so stale
//!   ids stop resolving.
//! - [`StepDriver`]: queues additions, removals and moves, applies them in batches at the
//!   start of each step, and runs the rebuild handoff on a [`rayon`] worker while colliding
//!   pairs are found in parallel chunks.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use broadleaf_bodies::{BodyDesc, BodyStore, StepConfig, StepDriver};
//! use broadleaf_index::{
//!     BoundingBox, BroadPhaseConfig, BroadPhaseLayer, BroadPhaseLayerInterfaceTable,
//!     BroadPhaseQuadTree, ObjectLayer, ObjectLayerPairFilterTable,
//!     ObjectVsBroadPhaseLayerFilterTable, PairCollector,
//! };
//! use glam::Vec3;
//!
//! let layer = ObjectLayer::new(0);
//! let mut layers = BroadPhaseLayerInterfaceTable::new(1, 1);
//! layers.map(layer, BroadPhaseLayer::new(0));
//! let mut pair_filter = ObjectLayerPairFilterTable::new(1);
//! pair_filter.enable_collision(layer, layer);
//! let object_vs_broad_phase = ObjectVsBroadPhaseLayerFilterTable::new(&layers, &pair_filter, 1);
//!
//! let store = Arc::new(BodyStore::new(16));
//! let broad_phase = BroadPhaseQuadTree::new(store.clone(), layers, BroadPhaseConfig::new(16));
//! let mut driver = StepDriver::new(StepConfig::default(), &object_vs_broad_phase, &pair_filter);
//!
//! for x in [0.0, 0.5, 4.0] {
//!     let bounds = BoundingBox::new(Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 1.0, 1.0));
//!     driver.queue_add(store.create(BodyDesc::new(bounds, layer)).unwrap());
//! }
//!
//! let mut pairs = PairCollector::new();
//! let report = driver.step(&broad_phase, &store.active_bodies(), &mut pairs).unwrap();
//! assert_eq!(report.added, 3);
//! assert_eq!(pairs.hits.len(), 1);
//! ```

mod store;
mod step;

pub use store::{BodyDesc, BodyStore, BodyStoreError, Result};
pub use step::{StepConfig, StepDriver, StepReport};
