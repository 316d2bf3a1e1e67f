// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Driving a broadphase through simulation steps.

use core::fmt;

use hashbrown::HashSet;
use rayon::prelude::*;
use tracing::{debug, instrument, trace, warn};

use broadleaf_index::{
    BodyId, BodyPair, BroadPhase, BroadPhaseError, CollisionCollector, ObjectLayerPairFilter,
    ObjectVsBroadPhaseLayerFilter, PairCollector,
};

/// Tuning of a [`StepDriver`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StepConfig {
    /// Amount active boxes are grown by when looking for pairs.
    pub speculative_margin: f32,
    /// A rebuild is attempted every this many steps. `0` disables rebuilds.
    pub rebuild_interval: u32,
    /// Active bodies handed to one pair finding task.
    pub pair_chunk_size: usize,
    /// Deliver pairs sorted.
    pub deterministic: bool,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            speculative_margin: 0.02,
            rebuild_interval: 1,
            pair_chunk_size: 128,
            deterministic: false,
        }
    }
}

impl StepConfig {
    /// Set the speculative margin.
    pub fn with_speculative_margin(mut self, margin: f32) -> Self {
        self.speculative_margin = margin;
        self
    }

    /// Set the rebuild cadence.
    pub fn with_rebuild_interval(mut self, steps: u32) -> Self {
        self.rebuild_interval = steps;
        self
    }

    /// Set the number of active bodies per pair finding task. Clamped to at least one.
    pub fn with_pair_chunk_size(mut self, size: usize) -> Self {
        self.pair_chunk_size = size.max(1);
        self
    }

    /// Set whether pairs are delivered sorted.
    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }
}

/// What one [`StepDriver::step`] did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Index of the step, starting at 0.
    pub step: u64,
    /// Bodies added.
    pub added: usize,
    /// Bodies removed.
    pub removed: usize,
    /// Bodies whose bounds or layer were picked up.
    pub updated: usize,
    /// Pairs delivered to the collector.
    pub pairs: usize,
    /// Whether a rebuilt tree was published.
    pub rebuilt: bool,
}

/// Runs the per-step broadphase protocol.
///
/// Body changes are queued with the `queue_*` methods from any code that owns the driver
/// and are applied in batches at the start of the next [`StepDriver::step`]. Removals are
/// applied first, then additions, then layer changes, then moves. A body queued for both
/// addition and removal is left alone, a removed body is not updated and an added body is
/// not updated again.
pub struct StepDriver<'f> {
    config: StepConfig,
    object_vs_broad_phase: &'f dyn ObjectVsBroadPhaseLayerFilter,
    pair_filter: &'f dyn ObjectLayerPairFilter,
    step: u64,
    retry_rebuild: bool,
    adds: Vec<BodyId>,
    removes: Vec<BodyId>,
    moves: Vec<BodyId>,
    layer_changes: Vec<BodyId>,
}

impl fmt::Debug for StepDriver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDriver")
            .field("config", &self.config)
            .field("step", &self.step)
            .field("retry_rebuild", &self.retry_rebuild)
            .field("adds", &self.adds.len())
            .field("removes", &self.removes.len())
            .field("moves", &self.moves.len())
            .field("layer_changes", &self.layer_changes.len())
            .finish_non_exhaustive()
    }
}

impl<'f> StepDriver<'f> {
    /// A driver finding pairs with the given filters.
    pub fn new(
        config: StepConfig,
        object_vs_broad_phase: &'f dyn ObjectVsBroadPhaseLayerFilter,
        pair_filter: &'f dyn ObjectLayerPairFilter,
    ) -> Self {
        Self {
            config,
            object_vs_broad_phase,
            pair_filter,
            step: 0,
            retry_rebuild: false,
            adds: Vec::new(),
            removes: Vec::new(),
            moves: Vec::new(),
            layer_changes: Vec::new(),
        }
    }

    /// Driver configuration.
    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    /// Number of steps run so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Add a body at the next step.
    pub fn queue_add(&mut self, id: BodyId) {
        self.adds.push(id);
    }

    /// Remove a body at the next step.
    pub fn queue_remove(&mut self, id: BodyId) {
        self.removes.push(id);
    }

    /// Pick up new bounds of a body at the next step.
    pub fn queue_moved(&mut self, id: BodyId) {
        self.moves.push(id);
    }

    /// Pick up a new object layer of a body at the next step.
    pub fn queue_layer_changed(&mut self, id: BodyId) {
        self.layer_changes.push(id);
    }

    /// Whether any body change waits for the next step.
    pub fn has_pending(&self) -> bool {
        !(self.adds.is_empty()
            && self.removes.is_empty()
            && self.moves.is_empty()
            && self.layer_changes.is_empty())
    }

    /// Run one step: reclaim old trees, apply queued changes, rebuild when due and report
    /// every overlapping pair that involves a body of `active` to `collector`.
    ///
    /// Node exhaustion during a rebuild is not an error: the live tree is kept and the
    /// rebuild is attempted again on the next step. Failures while applying changes are
    /// returned; additions that failed to prepare stay queued.
    #[instrument(skip_all, fields(step = self.step))]
    pub fn step<P, C>(
        &mut self,
        broad_phase: &P,
        active: &[BodyId],
        collector: &mut C,
    ) -> Result<StepReport, BroadPhaseError>
    where
        P: BroadPhase,
        C: CollisionCollector<Hit = BodyPair> + ?Sized,
    {
        let mut report = StepReport {
            step: self.step,
            ..StepReport::default()
        };
        self.step += 1;

        broad_phase.frame_sync();
        self.apply_changes(broad_phase, &mut report)?;

        let due = self.config.rebuild_interval != 0
            && report.step % u64::from(self.config.rebuild_interval) == 0;
        let pairs = if due || self.retry_rebuild {
            let lock = broad_phase.lock_modifications();
            let this = &*self;
            let (prepared, pairs) = rayon::join(
                || broad_phase.update_prepare(&lock),
                || this.find_pairs(broad_phase, active),
            );
            match prepared {
                Ok(Some(state)) => {
                    broad_phase.update_finalize(&lock, state);
                    self.retry_rebuild = false;
                    report.rebuilt = true;
                }
                Ok(None) => self.retry_rebuild = false,
                Err(e) => {
                    warn!(error = %e, "rebuild failed, retrying next step");
                    self.retry_rebuild = true;
                }
            }
            pairs
        } else {
            self.find_pairs(broad_phase, active)
        };

        for pair in pairs {
            if collector.should_early_out() {
                break;
            }
            collector.add_hit(pair);
            report.pairs += 1;
        }
        debug!(
            added = report.added,
            removed = report.removed,
            updated = report.updated,
            pairs = report.pairs,
            rebuilt = report.rebuilt,
            "step done"
        );
        Ok(report)
    }

    fn apply_changes<P: BroadPhase>(
        &mut self,
        broad_phase: &P,
        report: &mut StepReport,
    ) -> Result<(), BroadPhaseError> {
        for queue in [
            &mut self.adds,
            &mut self.removes,
            &mut self.moves,
            &mut self.layer_changes,
        ] {
            queue.sort_unstable();
            queue.dedup();
        }
        let gone = core::mem::take(&mut self.removes);
        let mut removes = gone.clone();
        removes.retain(|id| self.adds.binary_search(id).is_err());
        self.adds.retain(|id| gone.binary_search(id).is_err());
        self.moves.retain(|id| gone.binary_search(id).is_err());
        self.layer_changes.retain(|id| gone.binary_search(id).is_err());

        if !removes.is_empty() {
            broad_phase.remove_bodies(&removes);
            report.removed = removes.len();
        }
        if !self.adds.is_empty() {
            let state = broad_phase.add_bodies_prepare(&self.adds)?;
            let added = core::mem::take(&mut self.adds);
            broad_phase.add_bodies_finalize(state)?;
            report.added = added.len();
            self.moves.retain(|id| added.binary_search(id).is_err());
            self.layer_changes.retain(|id| added.binary_search(id).is_err());
        }

        let layer_changes = core::mem::take(&mut self.layer_changes);
        let moves = core::mem::take(&mut self.moves);
        if !layer_changes.is_empty() {
            broad_phase.notify_bodies_layer_changed(&layer_changes)?;
        }
        if !moves.is_empty() {
            broad_phase.notify_bodies_aabb_changed(&moves)?;
        }
        report.updated = layer_changes.len() + moves.len();
        trace!(
            removed = report.removed,
            added = report.added,
            updated = report.updated,
            "changes applied"
        );
        Ok(())
    }

    /// Pairs of `active` against the broadphase, found in parallel chunks.
    fn find_pairs<P: BroadPhase>(&self, broad_phase: &P, active: &[BodyId]) -> Vec<BodyPair> {
        let margin = self.config.speculative_margin;
        let object_vs_broad_phase = self.object_vs_broad_phase;
        let pair_filter = self.pair_filter;
        let chunks: Vec<Vec<BodyPair>> = active
            .par_chunks(self.config.pair_chunk_size.max(1))
            .map(|chunk| {
                let mut collector = PairCollector::new();
                broad_phase.find_colliding_pairs(
                    chunk,
                    margin,
                    object_vs_broad_phase,
                    pair_filter,
                    &mut collector,
                );
                collector.hits
            })
            .collect();
        let mut pairs = chunks.concat();
        // Two active bodies in different chunks report their pair twice.
        if self.config.deterministic {
            pairs.sort_unstable();
            pairs.dedup();
        } else {
            let mut seen = HashSet::with_capacity(pairs.len());
            pairs.retain(|pair| seen.insert(*pair));
        }
        pairs
    }
}
