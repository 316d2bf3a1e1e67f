// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Result sinks with early-out control.
//!
//! Every query hands its hits to a [`CollisionCollector`]. The collector keeps an
//! *early-out fraction*: casts skip anything further away than it, and the traversal stops
//! entirely once [`CollisionCollector::should_early_out`] returns `true`.

use core::fmt;
use core::marker::PhantomData;

use crate::body::BodyView;
use crate::types::BodyId;

/// Initial and terminal early-out fractions for a family of queries.
pub trait CollectorTraits {
    /// Fraction a fresh collector starts with.
    const INITIAL_EARLY_OUT_FRACTION: f32;
    /// Fraction at or below which the traversal stops.
    const SHOULD_EARLY_OUT_FRACTION: f32;
}

/// Fractions for ray and box casts: hits are reported as a fraction of the cast length.
#[derive(Copy, Clone, Debug)]
pub struct CastRayTraits;

impl CollectorTraits for CastRayTraits {
    const INITIAL_EARLY_OUT_FRACTION: f32 = 1.0 + f32::EPSILON;
    const SHOULD_EARLY_OUT_FRACTION: f32 = 0.0;
}

/// Fractions for overlap queries and pair finding.
#[derive(Copy, Clone, Debug)]
pub struct CollideShapeTraits;

impl CollectorTraits for CollideShapeTraits {
    const INITIAL_EARLY_OUT_FRACTION: f32 = f32::MAX;
    const SHOULD_EARLY_OUT_FRACTION: f32 = -f32::MAX;
}

/// Early-out fraction storage shared by the concrete collectors.
pub struct EarlyOut<C: CollectorTraits> {
    fraction: f32,
    _traits: PhantomData<C>,
}

impl<C: CollectorTraits> fmt::Debug for EarlyOut<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EarlyOut")
            .field("fraction", &self.fraction)
            .finish_non_exhaustive()
    }
}

impl<C: CollectorTraits> Default for EarlyOut<C> {
    fn default() -> Self {
        Self {
            fraction: C::INITIAL_EARLY_OUT_FRACTION,
            _traits: PhantomData,
        }
    }
}

impl<C: CollectorTraits> EarlyOut<C> {
    /// Current fraction.
    #[inline]
    pub fn get(&self) -> f32 {
        self.fraction
    }

    /// Set the fraction. It may only decrease.
    #[inline]
    pub fn update(&mut self, fraction: f32) {
        debug_assert!(fraction <= self.fraction, "early-out fraction may only shrink");
        self.fraction = fraction;
    }

    /// Back to the initial fraction.
    #[inline]
    pub fn reset(&mut self) {
        self.fraction = C::INITIAL_EARLY_OUT_FRACTION;
    }

    /// Force the traversal to stop.
    #[inline]
    pub fn force(&mut self) {
        self.fraction = C::SHOULD_EARLY_OUT_FRACTION;
    }

    /// Whether the traversal should stop.
    #[inline]
    pub fn should_stop(&self) -> bool {
        self.fraction <= C::SHOULD_EARLY_OUT_FRACTION
    }
}

/// A polymorphic sink for query results.
///
/// Hits are delivered on the thread running the query. A panic raised inside
/// [`CollisionCollector::add_hit`] unwinds through the query to its caller.
pub trait CollisionCollector {
    /// Result type.
    type Hit;
    /// Early-out fractions for this collector.
    type Traits: CollectorTraits;

    /// Receive a hit.
    fn add_hit(&mut self, hit: Self::Hit);

    /// Whether [`CollisionCollector::on_body`] should be called before each hit.
    fn wants_body(&self) -> bool {
        false
    }

    /// Snapshot of the body about to be reported. Only called when
    /// [`CollisionCollector::wants_body`] returns `true`.
    fn on_body(&mut self, _body: &BodyView) {}

    /// Prepare for a new query.
    fn reset(&mut self);

    /// Current early-out fraction.
    fn early_out_fraction(&self) -> f32;

    /// Lower the early-out fraction.
    fn update_early_out_fraction(&mut self, fraction: f32);

    /// Request that the query stops as soon as possible.
    fn force_early_out(&mut self);

    /// Whether the query should stop.
    fn should_early_out(&self) -> bool {
        self.early_out_fraction() <= <Self::Traits as CollectorTraits>::SHOULD_EARLY_OUT_FRACTION
    }
}

impl<C: CollisionCollector + ?Sized> CollisionCollector for &mut C {
    type Hit = C::Hit;
    type Traits = C::Traits;

    fn add_hit(&mut self, hit: Self::Hit) {
        (**self).add_hit(hit);
    }

    fn wants_body(&self) -> bool {
        (**self).wants_body()
    }

    fn on_body(&mut self, body: &BodyView) {
        (**self).on_body(body);
    }

    fn reset(&mut self) {
        (**self).reset();
    }

    fn early_out_fraction(&self) -> f32 {
        (**self).early_out_fraction()
    }

    fn update_early_out_fraction(&mut self, fraction: f32) {
        (**self).update_early_out_fraction(fraction);
    }

    fn force_early_out(&mut self) {
        (**self).force_early_out();
    }

    fn should_early_out(&self) -> bool {
        (**self).should_early_out()
    }
}

/// Result of a ray or box cast against the broadphase.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BroadPhaseCastResult {
    /// Body that was hit.
    pub body_id: BodyId,
    /// Fraction of the cast length at which the body's box is entered.
    pub fraction: f32,
}

/// Hit types that carry a distance-like fraction.
pub trait HitFraction {
    /// The fraction, or `0.0` for hits without one.
    fn fraction(&self) -> f32;
}

impl HitFraction for BroadPhaseCastResult {
    #[inline]
    fn fraction(&self) -> f32 {
        self.fraction
    }
}

impl HitFraction for BodyId {
    #[inline]
    fn fraction(&self) -> f32 {
        0.0
    }
}

impl HitFraction for crate::types::BodyPair {
    #[inline]
    fn fraction(&self) -> f32 {
        0.0
    }
}

/// Collects every hit.
pub struct AllHitCollector<H, C: CollectorTraits> {
    /// Collected hits, in traversal order until [`AllHitCollector::sort`] is called.
    pub hits: Vec<H>,
    early_out: EarlyOut<C>,
}

impl<H: fmt::Debug, C: CollectorTraits> fmt::Debug for AllHitCollector<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllHitCollector")
            .field("hits", &self.hits)
            .field("early_out", &self.early_out)
            .finish()
    }
}

impl<H, C: CollectorTraits> Default for AllHitCollector<H, C> {
    fn default() -> Self {
        Self {
            hits: Vec::new(),
            early_out: EarlyOut::default(),
        }
    }
}

impl<H, C: CollectorTraits> AllHitCollector<H, C> {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything was collected.
    pub fn had_hit(&self) -> bool {
        !self.hits.is_empty()
    }
}

impl<H: HitFraction, C: CollectorTraits> AllHitCollector<H, C> {
    /// Order hits by increasing fraction.
    pub fn sort(&mut self) {
        self.hits
            .sort_by(|a, b| a.fraction().total_cmp(&b.fraction()));
    }
}

impl<H, C: CollectorTraits> CollisionCollector for AllHitCollector<H, C> {
    type Hit = H;
    type Traits = C;

    fn add_hit(&mut self, hit: H) {
        self.hits.push(hit);
    }

    fn reset(&mut self) {
        self.hits.clear();
        self.early_out.reset();
    }

    fn early_out_fraction(&self) -> f32 {
        self.early_out.get()
    }

    fn update_early_out_fraction(&mut self, fraction: f32) {
        self.early_out.update(fraction);
    }

    fn force_early_out(&mut self) {
        self.early_out.force();
    }
}

/// Keeps only the hit with the smallest fraction; later casts are pruned beyond it.
pub struct ClosestHitCollector<H, C: CollectorTraits> {
    /// The closest hit so far.
    pub hit: Option<H>,
    early_out: EarlyOut<C>,
}

impl<H: fmt::Debug, C: CollectorTraits> fmt::Debug for ClosestHitCollector<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosestHitCollector")
            .field("hit", &self.hit)
            .field("early_out", &self.early_out)
            .finish()
    }
}

impl<H, C: CollectorTraits> Default for ClosestHitCollector<H, C> {
    fn default() -> Self {
        Self {
            hit: None,
            early_out: EarlyOut::default(),
        }
    }
}

impl<H, C: CollectorTraits> ClosestHitCollector<H, C> {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything was collected.
    pub fn had_hit(&self) -> bool {
        self.hit.is_some()
    }
}

impl<H: HitFraction, C: CollectorTraits> CollisionCollector for ClosestHitCollector<H, C> {
    type Hit = H;
    type Traits = C;

    fn add_hit(&mut self, hit: H) {
        let fraction = hit.fraction();
        if fraction < self.early_out.get() || self.hit.is_none() {
            // Overlap hits all have fraction 0, so the first one wins.
            self.early_out.update(fraction.min(self.early_out.get()));
            self.hit = Some(hit);
        }
    }

    fn reset(&mut self) {
        self.hit = None;
        self.early_out.reset();
    }

    fn early_out_fraction(&self) -> f32 {
        self.early_out.get()
    }

    fn update_early_out_fraction(&mut self, fraction: f32) {
        self.early_out.update(fraction);
    }

    fn force_early_out(&mut self) {
        self.early_out.force();
    }
}

/// Stops at the first hit.
pub struct AnyHitCollector<H, C: CollectorTraits> {
    /// The hit, if any.
    pub hit: Option<H>,
    early_out: EarlyOut<C>,
}

impl<H: fmt::Debug, C: CollectorTraits> fmt::Debug for AnyHitCollector<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyHitCollector")
            .field("hit", &self.hit)
            .field("early_out", &self.early_out)
            .finish()
    }
}

impl<H, C: CollectorTraits> Default for AnyHitCollector<H, C> {
    fn default() -> Self {
        Self {
            hit: None,
            early_out: EarlyOut::default(),
        }
    }
}

impl<H, C: CollectorTraits> AnyHitCollector<H, C> {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything was collected.
    pub fn had_hit(&self) -> bool {
        self.hit.is_some()
    }
}

impl<H, C: CollectorTraits> CollisionCollector for AnyHitCollector<H, C> {
    type Hit = H;
    type Traits = C;

    fn add_hit(&mut self, hit: H) {
        self.hit = Some(hit);
        self.early_out.force();
    }

    fn reset(&mut self) {
        self.hit = None;
        self.early_out.reset();
    }

    fn early_out_fraction(&self) -> f32 {
        self.early_out.get()
    }

    fn update_early_out_fraction(&mut self, fraction: f32) {
        self.early_out.update(fraction);
    }

    fn force_early_out(&mut self) {
        self.early_out.force();
    }
}

/// Collects every cast hit.
pub type CastHitCollector = AllHitCollector<BroadPhaseCastResult, CastRayTraits>;
/// Collects every overlapping body.
pub type BodyHitCollector = AllHitCollector<BodyId, CollideShapeTraits>;
/// Collects every overlapping pair.
pub type PairCollector = AllHitCollector<crate::types::BodyPair, CollideShapeTraits>;
