//! End-to-end scenarios driving a real tile map on a small runtime.

mod common;

use std::{sync::Arc, thread, time::Duration};

use common::{Harness, RecordingGenerator, SlowGenerator, SlowStorage};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rustc_hash::FxHashMap;
use tessera_core::{
    SchedulerConfig, TileFailure,
    level::TicketKind,
    storage::RamOnlyStorage,
    tile::{BlockState, FlatTileGenerator, FullStatus, TileHeight, TileStatus},
};
use tessera_utils::{BlockPos, TilePos};
use uuid::Uuid;

fn flat_world(config: SchedulerConfig) -> Harness {
    let height = config.height;
    Harness::new(
        config,
        Arc::new(RamOnlyStorage::empty_world(height)),
        Arc::new(FlatTileGenerator::default()),
    )
}

#[test]
fn viewer_area_reaches_entity_ticking_then_unloads() {
    let mut harness = flat_world(SchedulerConfig::default());
    let viewer = Uuid::new_v4();
    let far = TilePos::new(15, 0);
    harness.map.add_viewer(viewer, TilePos::ZERO);

    assert!(harness.tick_until(|map| map.full_status(TilePos::ZERO) == FullStatus::EntityTicking));
    assert_eq!(harness.full_status(far), FullStatus::Inaccessible);
    assert!(harness.map.in_entity_ticking_range(TilePos::ZERO));
    assert!(
        harness
            .recorder
            .sent
            .lock()
            .contains(&(viewer, TilePos::ZERO))
    );
    assert_eq!(
        harness.recorder.statuses.lock().get(&TilePos::ZERO),
        Some(&FullStatus::EntityTicking)
    );

    harness.map.remove_viewer(viewer);
    assert!(
        harness.tick_until(|map| map.loaded_tile_count() == 0 && map.pending_unload_count() == 0)
    );
    assert_eq!(harness.full_status(TilePos::ZERO), FullStatus::Inaccessible);
    assert_eq!(harness.full_status(far), FullStatus::Inaccessible);
    assert!(harness.map.holder(TilePos::ZERO).is_none());
}

#[test]
fn generation_failure_spreads_only_to_dependents() {
    let failing = TilePos::new(3, 3);
    let mut harness = Harness::new(
        SchedulerConfig::default(),
        Arc::new(RamOnlyStorage::preloaded()),
        Arc::new(RecordingGenerator::failing_at(
            failing,
            TileStatus::StructureStarts,
        )),
    );
    harness
        .map
        .add_region_ticket(TicketKind::Forced, TilePos::ZERO, 10);

    let healthy = [TilePos::new(-6, -6), TilePos::new(-3, -3), TilePos::new(9, 9)];
    let broken = [failing, TilePos::ZERO, TilePos::new(8, 8)];
    assert!(harness.tick_until(|map| {
        healthy
            .iter()
            .all(|pos| map.full_status(*pos) >= FullStatus::Border)
            && broken.iter().all(|pos| {
                map.holder(*pos)
                    .is_some_and(|holder| holder.border_future().is_done())
            })
    }));

    for pos in broken {
        let holder = harness.map.holder(pos).expect("pinned holder");
        assert!(
            matches!(
                holder.border_future().now(),
                Some(Err(TileFailure::Unloaded(at))) if at == failing
            ),
            "{pos} should fail because of {failing}"
        );
        assert_eq!(harness.full_status(pos), FullStatus::Inaccessible);
    }
    assert_eq!(
        harness.map.take_fatal_error(),
        Some(TileFailure::Generation {
            pos: failing,
            status: TileStatus::StructureStarts,
        })
    );
}

#[test]
fn stages_run_after_their_dependencies() {
    let generator = Arc::new(RecordingGenerator::new());
    let mut harness = Harness::new(
        SchedulerConfig::default(),
        Arc::new(RamOnlyStorage::preloaded()),
        generator.clone(),
    );

    let mut rng = StdRng::seed_from_u64(0x7e55_e4a0);
    let centers: Vec<TilePos> = (0..3)
        .map(|_| TilePos::new(rng.random_range(-8..8), rng.random_range(-8..8)))
        .collect();
    for center in &centers {
        harness
            .map
            .add_region_ticket(TicketKind::Forced, *center, 1);
    }
    assert!(harness.tick_until(|map| centers
        .iter()
        .all(|pos| map.full_status(*pos) >= FullStatus::Border)));

    let runs = generator.runs.lock().clone();
    let order: FxHashMap<(TilePos, TileStatus), usize> = runs
        .iter()
        .enumerate()
        .map(|(index, run)| (*run, index))
        .collect();
    assert_eq!(order.len(), runs.len(), "a stage ran twice");

    for (index, (pos, status)) in runs.iter().enumerate() {
        let parent = status.parent();
        if matches!(
            parent,
            TileStatus::Empty | TileStatus::InitializeLight | TileStatus::Light
        ) {
            // The generator never sees these.
            continue;
        }
        for neighbour in pos.square(i32::from(status.range())) {
            let before = order.get(&(neighbour, parent));
            assert!(
                before.is_some_and(|before| *before < index),
                "{status} at {pos} ran before {parent} at {neighbour}"
            );
        }
    }
}

#[test]
fn settling_twice_changes_nothing() {
    let harness = flat_world(SchedulerConfig::default());
    harness
        .map
        .add_ticket(TicketKind::Forced, TilePos::ZERO, 36);
    assert!(harness.map.settle());
    let loaded = harness.map.loaded_tile_count();
    assert_eq!(loaded, 25);

    assert!(!harness.map.settle());
    assert_eq!(harness.map.loaded_tile_count(), loaded);
    assert_eq!(harness.map.ticket_level(TilePos::ZERO), 36);
    assert_eq!(harness.map.ticket_level(TilePos::new(2, -1)), 38);

    let elsewhere = TilePos::new(50, 50);
    harness.map.add_ticket(TicketKind::Forced, elsewhere, 33);
    assert!(harness.map.remove_ticket(TicketKind::Forced, elsewhere, 33));
    harness.map.settle();
    assert!(harness.map.holder(elsewhere).is_none());
    assert_eq!(harness.map.loaded_tile_count(), loaded);
}

#[test]
fn unloaded_tiles_are_saved() {
    let storage = Arc::new(RamOnlyStorage::preloaded());
    let mut harness = Harness::new(
        SchedulerConfig::default(),
        storage.clone(),
        Arc::new(FlatTileGenerator::default()),
    );
    harness
        .map
        .add_region_ticket(TicketKind::Forced, TilePos::ZERO, 0);
    assert!(harness.tick_until(|map| map.full_status(TilePos::ZERO) == FullStatus::Border));

    assert!(
        harness
            .map
            .remove_region_ticket(TicketKind::Forced, TilePos::ZERO, 0)
    );
    assert!(
        harness.tick_until(|map| map.loaded_tile_count() == 0 && map.pending_unload_count() == 0)
    );
    harness.map.save_all(true);
    let record = storage.record(TilePos::ZERO).expect("saved on unload");
    assert_eq!(record.status, TileStatus::Full);
    assert!(storage.contains(TilePos::new(5, 5)), "dependencies are saved too");
}

#[test]
fn flushing_waits_for_the_writes_of_unloaded_tiles() {
    let storage = Arc::new(SlowStorage::new(Duration::from_millis(20)));
    let mut harness = Harness::new(
        SchedulerConfig::default(),
        storage.clone(),
        Arc::new(FlatTileGenerator::default()),
    );
    harness
        .map
        .add_region_ticket(TicketKind::Forced, TilePos::ZERO, 0);
    assert!(harness.tick_until(|map| map.full_status(TilePos::ZERO) == FullStatus::Border));
    assert!(
        harness
            .map
            .remove_region_ticket(TicketKind::Forced, TilePos::ZERO, 0)
    );
    assert!(
        harness.tick_until(|map| map.loaded_tile_count() == 0 && map.pending_unload_count() == 0)
    );

    harness.map.save_all(true);
    let saved = storage.inner.save_count();
    assert!(storage.inner.contains(TilePos::ZERO));
    assert!(storage.inner.contains(TilePos::new(-5, 5)));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(storage.inner.save_count(), saved, "a write landed after the flush");
}

#[test]
fn demoted_tiles_stay_until_their_running_stage_finishes() {
    let generator = Arc::new(SlowGenerator::new(
        TilePos::ZERO,
        TileStatus::StructureStarts,
        Duration::from_millis(500),
    ));
    let mut harness = Harness::new(
        SchedulerConfig::default(),
        Arc::new(RamOnlyStorage::preloaded()),
        generator.clone(),
    );
    let border = harness.map.thresholds().border;
    harness
        .map
        .add_ticket(TicketKind::Forced, TilePos::ZERO, border);
    assert!(harness.tick_until(|_| generator.started()));

    assert!(
        harness
            .map
            .remove_ticket(TicketKind::Forced, TilePos::ZERO, border)
    );
    assert!(
        harness.tick_until(|map| map.loaded_tile_count() == 0 && map.pending_unload_count() == 0)
    );
    assert!(
        generator.finished(),
        "the tile was unloaded while its stage was still running"
    );
}

#[test]
fn block_changes_reach_viewers() {
    let mut harness = flat_world(SchedulerConfig {
        view_distance: 3,
        simulation_distance: 3,
        ..SchedulerConfig::default()
    });
    let recorder = harness.recorder.clone();
    let viewer = Uuid::new_v4();
    harness.map.add_viewer(viewer, TilePos::ZERO);
    assert!(harness.tick_until(|_| recorder.sent.lock().contains(&(viewer, TilePos::ZERO))));

    let pos = BlockPos::new(1, TileHeight::default().min_y() + 3, 1);
    assert!(harness.map.set_block(pos, BlockState::STONE));
    assert!(!harness.map.set_block(pos, BlockState::STONE), "unchanged");
    assert_eq!(harness.map.block(pos), Some(BlockState::STONE));

    assert!(harness.tick_until(|_| !recorder.block_changes.lock().is_empty()));
    assert_eq!(
        recorder.block_changes.lock()[0],
        (viewer, TilePos::ZERO, 1)
    );
}

#[test]
fn blocking_requests_generate_the_tile() {
    let harness = Harness::new(
        SchedulerConfig::default(),
        Arc::new(RamOnlyStorage::preloaded()),
        Arc::new(FlatTileGenerator::default()),
    );
    let pos = TilePos::new(20, -20);
    let tile = harness
        .map
        .get_tile_blocking(pos, TileStatus::Full)
        .expect("flat generation never fails");
    assert_eq!(tile.pos(), pos);
    assert_eq!(tile.status(), TileStatus::Full);
    assert!(tile.is_light_correct());
    assert!(harness.map.holder(pos).is_some());
}

#[test]
fn priming_makes_the_spawn_area_accessible() {
    let harness = Harness::new(
        SchedulerConfig {
            spawn_radius: 2,
            ..SchedulerConfig::default()
        },
        Arc::new(RamOnlyStorage::preloaded()),
        Arc::new(FlatTileGenerator::default()),
    );
    assert_eq!(harness.map.prime_spawn(TilePos::new(4, 4)), 25);
    assert!(
        harness
            .map
            .debug_tickets()
            .iter()
            .any(|(pos, ticket)| *pos == TilePos::new(4, 4) && ticket.kind == TicketKind::Start)
    );
}
