// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Broadleaf Index: a concurrent 3D AABB broadphase.
//!
//! Broadleaf Index is the coarse culling stage of a physics engine. It keeps the bounding
//! boxes of bodies in one quad tree per broadphase layer and answers which bodies a ray, a
//! shape or another body might touch.
//!
//! - Add, remove and move bodies from many threads at once. Mutation is lock-free: leaf
//!   buckets are claimed by compare-and-swap and ancestor boxes only ever widen.
//! - Restore tight boxes with a two-phase rebuild. [`BroadPhase::update_prepare`] builds a new
//!   tree beside the live one while queries keep running; [`BroadPhase::update_finalize`]
//!   publishes it with a single atomic store.
//! - Reclaim replaced trees at [`BroadPhase::frame_sync`], once no query can still be reading
//!   them.
//! - Query with rays, moving boxes, boxes, spheres, points and oriented boxes through a
//!   [`CollisionCollector`], and find overlapping pairs for the narrow phase.
//!
//! Bodies are owned elsewhere. The broadphase reads their bounds and layers from a
//! [`BodyManager`] and only stores body ids.
//!
//! ## Features
//!
//! - `brute_force` *(default)*: enables [`BroadPhaseBruteForce`], a linear-scan broadphase
//!   with the same interface, handy as a reference in tests.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use broadleaf_index::{
//!     AcceptAll, BodyHitCollector, BodyId, BodyManager, BodyView, BoundingBox, BroadPhase,
//!     BroadPhaseConfig, BroadPhaseLayer, BroadPhaseLayerInterfaceTable, BroadPhaseQuadTree,
//!     BroadPhaseQuery, ObjectLayer,
//! };
//! use glam::Vec3;
//!
//! // A fixed set of bodies.
//! struct Bodies(Vec<BodyView>);
//!
//! impl BodyManager for Bodies {
//!     fn max_bodies(&self) -> usize {
//!         self.0.len()
//!     }
//!
//!     fn body(&self, id: BodyId) -> Option<BodyView> {
//!         self.0.get(id.index() as usize).copied().filter(|b| b.id == id)
//!     }
//! }
//!
//! let bodies: Vec<_> = (0..3_u32)
//!     .map(|i| {
//!         let min = Vec3::splat(i as f32 * 2.0);
//!         BodyView {
//!             id: BodyId::new(i, 0),
//!             bounds: BoundingBox::new(min, min + Vec3::ONE),
//!             object_layer: ObjectLayer::new(0),
//!             is_active: true,
//!         }
//!     })
//!     .collect();
//!
//! let mut layers = BroadPhaseLayerInterfaceTable::new(1, 1);
//! layers.map(ObjectLayer::new(0), BroadPhaseLayer::new(0));
//! let bp = BroadPhaseQuadTree::new(Arc::new(Bodies(bodies)), layers, BroadPhaseConfig::new(3));
//!
//! let ids: Vec<_> = (0..3).map(|i| BodyId::new(i, 0)).collect();
//! let state = bp.add_bodies_prepare(&ids)?;
//! bp.add_bodies_finalize(state)?;
//!
//! let mut hits = BodyHitCollector::new();
//! bp.collide_point(Vec3::splat(2.5), &mut hits, &AcceptAll, &AcceptAll);
//! assert_eq!(hits.hits, [BodyId::new(1, 0)]);
//! # Ok::<(), broadleaf_index::BroadPhaseError>(())
//! ```
//!
//! ## Rebuilding
//!
//! ```rust,ignore
//! broadphase.frame_sync();
//! // ... add, remove and move bodies ...
//! let lock = broadphase.lock_modifications();
//! if let Some(state) = broadphase.update_prepare(&lock)? {
//!     broadphase.update_finalize(&lock, state);
//! }
//! drop(lock);
//! ```
//!
//! Each [`BroadPhase::update_prepare`] call rebuilds at most one layer, cycling through
//! layers that changed. A rebuild that runs out of nodes fails with
//! [`BroadPhaseError::CapacityExhausted`] and leaves the live tree untouched.
//!
//! ### Float semantics
//!
//! Bounds are assumed to be free of NaNs. Touching boxes count as overlapping.

mod allocator;
mod backend;
pub mod backends;
mod body;
mod build;
mod collector;
mod config;
mod error;
mod filter;
mod layer;
mod node;
mod query;
mod tracking;
mod tree;
mod types;
#[cfg(test)]
mod util;

pub use allocator::{FreeList, INVALID_INDEX, NodeHandle, ReleaseBatch};
pub use backend::{BroadPhase, BroadPhaseQuery, ModificationLock};
#[cfg(feature = "brute_force")]
pub use backends::BroadPhaseBruteForce;
pub use backends::BroadPhaseQuadTree;
pub use body::{BodyManager, BodyView};
pub use collector::{
    AllHitCollector, AnyHitCollector, BodyHitCollector, BroadPhaseCastResult, CastHitCollector,
    CastRayTraits, ClosestHitCollector, CollectorTraits, CollideShapeTraits, CollisionCollector,
    EarlyOut, HitFraction, PairCollector,
};
pub use config::BroadPhaseConfig;
pub use error::{BroadPhaseError, Result};
pub use filter::{
    AcceptAll, BroadPhaseLayerFilter, DefaultBroadPhaseLayerFilter, DefaultObjectLayerFilter,
    ObjectLayerFilter, ObjectLayerPairFilter, ObjectLayerPairFilterMask, ObjectLayerPairFilterTable,
    ObjectVsBroadPhaseLayerFilter, ObjectVsBroadPhaseLayerFilterMask,
    ObjectVsBroadPhaseLayerFilterTable, SpecifiedBroadPhaseLayerFilter, SpecifiedObjectLayerFilter,
};
pub use layer::{
    BroadPhaseLayer, BroadPhaseLayerInterface, BroadPhaseLayerInterfaceMask,
    BroadPhaseLayerInterfaceTable, ObjectLayer, mask_bits,
};
pub use node::{NUM_CHILDREN, Node};
pub use query::{AABoxCast, OrientedBox, RayCast};
pub use tracking::{BodyLocation, TrackingTable};
pub use tree::{ActiveBodySet, NodeAllocator, QuadTree, TreeAddState, TreeUpdateState};
pub use types::{BodyId, BodyPair, BoundingBox};
