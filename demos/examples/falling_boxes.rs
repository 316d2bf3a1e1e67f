// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Many boxes falling onto a ground slab, driven through `StepDriver`.
//!
//! Boxes move every step and are handed to the broadphase as moves; the driver rebuilds one
//! layer per step while pairs are found in parallel. Boxes that come to rest on the ground
//! go to sleep and drop out of the active list. A ray is cast at the end.
//!
//! Run:
//! - `cargo run -p broadleaf_demos --example falling_boxes`
//! - `RUST_LOG=broadleaf_bodies=debug cargo run -p broadleaf_demos --example falling_boxes`

use std::error::Error;
use std::sync::Arc;

use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use broadleaf_bodies::{BodyDesc, BodyStore, StepConfig, StepDriver};
use broadleaf_index::{
    AcceptAll, BodyId, BoundingBox, BroadPhase, CollisionCollector, BroadPhaseConfig, BroadPhaseLayer,
    BroadPhaseLayerInterfaceTable, BroadPhaseQuadTree, BroadPhaseQuery, CastHitCollector,
    ObjectLayer, ObjectLayerPairFilterTable, ObjectVsBroadPhaseLayerFilterTable, PairCollector,
    RayCast,
};

const STATIC: ObjectLayer = ObjectLayer::new(0);
const MOVING: ObjectLayer = ObjectLayer::new(1);

const BODIES: usize = 2_000;
const STEPS: u32 = 120;
const DT: f32 = 1.0 / 60.0;
const GRAVITY: f32 = -9.81;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let mut layers = BroadPhaseLayerInterfaceTable::new(2, 2);
    layers
        .map(STATIC, BroadPhaseLayer::new(0))
        .map(MOVING, BroadPhaseLayer::new(1))
        .set_name(BroadPhaseLayer::new(0), "static")
        .set_name(BroadPhaseLayer::new(1), "moving");
    let mut pair_filter = ObjectLayerPairFilterTable::new(2);
    pair_filter
        .enable_collision(MOVING, STATIC)
        .enable_collision(MOVING, MOVING);
    let object_vs_broad_phase = ObjectVsBroadPhaseLayerFilterTable::new(&layers, &pair_filter, 2);

    let store = Arc::new(BodyStore::new(BODIES + 1));
    let broad_phase = BroadPhaseQuadTree::new(
        store.clone(),
        layers,
        BroadPhaseConfig::new(BODIES + 1).with_deterministic(true),
    );
    let config = StepConfig::default()
        .with_speculative_margin(0.05)
        .with_pair_chunk_size(64)
        .with_deterministic(true);
    let mut driver = StepDriver::new(config, &object_vs_broad_phase, &pair_filter);

    let slab = BoundingBox::new(Vec3::new(-50.0, -1.0, -50.0), Vec3::new(50.0, 0.0, 50.0));
    let ground = store.create(BodyDesc::new(slab, STATIC).with_active(false))?;
    driver.queue_add(ground);

    let mut rng = StdRng::seed_from_u64(7);
    let mut falling: Vec<(BodyId, f32)> = Vec::with_capacity(BODIES);
    for _ in 0..BODIES {
        let min = Vec3::new(
            rng.random_range(-45.0..45.0),
            rng.random_range(0.5..30.0),
            rng.random_range(-45.0..45.0),
        );
        let size = Vec3::splat(rng.random_range(0.2..1.5));
        let id = store.create(BodyDesc::new(BoundingBox::new(min, min + size), MOVING))?;
        driver.queue_add(id);
        falling.push((id, 0.0));
    }
    info!(bodies = store.len(), "scene created");

    let mut pairs = PairCollector::new();
    for _ in 0..STEPS {
        for (id, velocity) in &mut falling {
            let Some(body) = store.get(*id) else { continue };
            if !body.is_active {
                continue;
            }
            *velocity += GRAVITY * DT;
            let dy = (*velocity * DT).max(-body.bounds.min.y);
            store.translate(*id, Vec3::new(0.0, dy, 0.0))?;
            driver.queue_moved(*id);
            if body.bounds.min.y + dy <= 0.0 {
                store.set_active(*id, false)?;
            }
        }

        pairs.reset();
        let report = driver.step(&broad_phase, &store.active_bodies(), &mut pairs)?;
        if report.step % 20 == 0 {
            info!(
                step = report.step,
                pairs = report.pairs,
                updated = report.updated,
                rebuilt = report.rebuilt,
                "stepped"
            );
        }
    }

    let asleep = store.bodies().len() - store.active_bodies().len();
    info!(asleep, nodes = broad_phase.node_allocator().used(), "simulation done");

    broad_phase.optimize()?;
    let ray = RayCast::new(Vec3::new(-60.0, 0.25, 0.0), Vec3::new(120.0, 0.0, 0.0));
    let mut hits = CastHitCollector::new();
    broad_phase.cast_ray(&ray, &mut hits, &AcceptAll, &AcceptAll);
    hits.sort();
    if let Some(first) = hits.hits.first() {
        info!(hits = hits.hits.len(), first = ?first.body_id, fraction = first.fraction, "ray cast");
    }
    Ok(())
}
