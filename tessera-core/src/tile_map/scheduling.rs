//! Turning wanted stages into queued work.
//!
//! A stage future is created at most once per holder and stage. Requesting a stage first
//! requests the parent stage of every neighbour within the stage's range, then runs the
//! stage on its actor once all of them are done.

use std::sync::Arc;

use tessera_utils::TilePos;

use super::{MainState, TileMap};
use crate::{
    error::TileFailure,
    level::TicketKind,
    task::{CompletableFuture, SorterExecutor, TaskActor, TaskSorter},
    tile::{
        FullStatus, HolderHost, StageWork, StatusTasks, TileData, TileFuture, TileHolder,
        TileRegion, TileResult, TileStatus,
    },
};

fn unloaded(pos: TilePos) -> TileFuture {
    CompletableFuture::completed(Err(TileFailure::Unloaded(pos)))
}

/// The first failure in `results`, reported as the dependent tile being unloaded.
fn first_failure(results: &[TileResult]) -> Option<TileFailure> {
    results
        .iter()
        .find_map(|result| result.as_ref().err())
        .map(|failure| TileFailure::Unloaded(failure.pos()))
}

const fn actor_for(status: TileStatus) -> TaskActor {
    match status {
        TileStatus::Empty => TaskActor::Io,
        TileStatus::Full => TaskActor::Main,
        _ => TaskActor::Worldgen,
    }
}

/// The [`HolderHost`] handed to holders during settlement. Borrows the locked main state.
pub(super) struct Settler<'a> {
    pub(super) map: &'a TileMap,
    pub(super) state: &'a MainState,
}

impl HolderHost for Settler<'_> {
    fn prepare_accessible(&self, holder: &Arc<TileHolder>) -> TileFuture {
        self.map
            .schedule(self.state, holder, TileStatus::Full)
            .map_async(self.map.main.clone(), Clone::clone)
    }

    fn prepare_ticking(&self, holder: &Arc<TileHolder>) -> TileFuture {
        let map = self.map.this.clone();
        let weak = Arc::downgrade(holder);
        self.map
            .join_full_around(self.state, holder.pos(), 1)
            .map_async(self.map.main.clone(), move |result: &TileResult| {
                if let Ok(tile) = result
                    && let Some(map) = map.upgrade()
                    && let Some(holder) = weak.upgrade()
                {
                    map.start_ticking(&holder, tile);
                }
                result.clone()
            })
    }

    fn prepare_entity_ticking(&self, holder: &Arc<TileHolder>) -> TileFuture {
        self.map
            .join_full_around(self.state, holder.pos(), 2)
            .map_async(self.map.main.clone(), Clone::clone)
    }

    fn schedule_promotion(
        &self,
        holder: &Arc<TileHolder>,
        future: &TileFuture,
        status: FullStatus,
        generation: u64,
    ) {
        let map = self.map.this.clone();
        let weak = Arc::downgrade(holder);
        future.on_complete_async(self.map.main.clone(), move |result: &TileResult| {
            if result.is_err() {
                return;
            }
            let (Some(map), Some(holder)) = (map.upgrade(), weak.upgrade()) else {
                return;
            };
            if holder.confirm_promotion(status, generation) {
                log::trace!("Promoted {} to {status}", holder.pos());
                map.status_listener
                    .on_full_status_change(holder.pos(), status);
            }
        });
    }

    fn on_demotion(&self, holder: &TileHolder, status: FullStatus) {
        self.map
            .status_listener
            .on_full_status_change(holder.pos(), status);
        if status < FullStatus::Ticking {
            self.map.forget_sent(holder.pos());
        }
    }

    fn sorter(&self) -> &TaskSorter {
        &self.map.sorter
    }
}

impl TileMap {
    /// Returns the future for `status` of `holder`, scheduling it and its dependencies if
    /// needed.
    pub(super) fn schedule(
        &self,
        state: &MainState,
        holder: &Arc<TileHolder>,
        status: TileStatus,
    ) -> TileFuture {
        if !holder.is_status_allowed(status) {
            return unloaded(holder.pos());
        }
        if let Some(future) = holder.stage_future(status) {
            return future;
        }
        let future = self.schedule_stage(state, holder, status);
        holder.install_stage_future(status, future.clone());
        future
    }

    fn schedule_stage(
        &self,
        state: &MainState,
        holder: &Arc<TileHolder>,
        status: TileStatus,
    ) -> TileFuture {
        let pos = holder.pos();
        let ready: CompletableFuture<Vec<TileResult>> = if status == TileStatus::Empty {
            // A reload must read what the previous unload wrote.
            match state.unload_writes.get(&pos.key()) {
                Some(write) => write.map(|()| Vec::new()),
                None => CompletableFuture::completed(Vec::new()),
            }
        } else {
            let parent = status.parent();
            CompletableFuture::join_all(
                pos.square(i32::from(status.range()))
                    .map(|neighbour| match state.holders.get(&neighbour.key()) {
                        Some(neighbour_holder) => self.schedule(state, neighbour_holder, parent),
                        None => unloaded(neighbour),
                    })
                    .collect(),
            )
        };

        let absent = self.thresholds.absent_level();
        let level_holder = Arc::downgrade(holder);
        let executor = SorterExecutor::new(self.sorter.clone(), actor_for(status), pos, move || {
            level_holder
                .upgrade()
                .map_or(absent, |holder| holder.queue_level())
        });

        let map = self.this.clone();
        let stage_holder = holder.clone();
        let result = ready.then_compose_async(
            executor,
            move |results: &Vec<TileResult>| match map.upgrade() {
                Some(map) => map.run_stage(&stage_holder, status, results),
                None => unloaded(pos),
            },
        );
        holder.add_save_dependency(result.map(|_| ()));

        // Demotion fails the slot early; the save dependency above still waits for the work.
        let slot = CompletableFuture::new();
        let out = slot.clone();
        result.on_complete(move |value: &TileResult| {
            out.complete(value.clone());
        });
        slot
    }

    /// Runs `status` once its dependencies are done. Called on the stage's actor.
    fn run_stage(
        &self,
        holder: &Arc<TileHolder>,
        status: TileStatus,
        dependencies: &[TileResult],
    ) -> TileFuture {
        let pos = holder.pos();
        if let Some(failure) = first_failure(dependencies) {
            return CompletableFuture::completed(Err(failure));
        }
        if !holder.is_status_allowed(status) {
            return unloaded(pos);
        }

        let (tile, region) = if status == TileStatus::Empty {
            let tile = StatusTasks::load(&self.context, pos);
            let region = TileRegion::new(pos, 0, vec![tile.clone()]);
            (tile, region)
        } else {
            let tiles: Vec<Arc<TileData>> = dependencies
                .iter()
                .filter_map(|result| result.as_ref().ok().cloned())
                .collect();
            let Some(tile) = tiles.get(tiles.len() / 2).cloned() else {
                return unloaded(pos);
            };
            (tile, TileRegion::new(pos, status.range(), tiles))
        };

        if status == TileStatus::Light {
            self.hold_for_light(pos);
        }

        let span = tracing::trace_span!("stage", %pos, %status);
        let _enter = span.enter();
        match StatusTasks::run(&self.context, status, &tile, &region, holder.queue_level()) {
            Ok(StageWork::Done) => CompletableFuture::completed(Ok(tile)),
            Ok(StageWork::Pending(future)) => {
                let result = future.map(move |()| Ok(tile));
                if status == TileStatus::Light {
                    let map = self.this.clone();
                    result.on_complete(move |_| {
                        if let Some(map) = map.upgrade() {
                            map.run_on_main(move |map| {
                                map.remove_ticket(TicketKind::Light, pos, map.thresholds.max_level());
                            });
                        }
                    });
                }
                result
            }
            Err(err) => {
                log::error!(
                    "Generator '{}' failed at stage {status} of tile {pos}: {err:#}",
                    self.context.generator.name()
                );
                let failure = TileFailure::Generation { pos, status };
                self.record_fatal(failure);
                CompletableFuture::completed(Err(failure))
            }
        }
    }

    /// Keeps `pos` resident while its light is propagated.
    fn hold_for_light(&self, pos: TilePos) {
        self.run_on_main(move |map| {
            map.add_ticket(TicketKind::Light, pos, map.thresholds.max_level());
        });
    }

    /// Joins the `Full` futures of every tile within `radius` of `pos`, resolving to the
    /// center tile.
    fn join_full_around(&self, state: &MainState, pos: TilePos, radius: i32) -> TileFuture {
        let futures: Vec<TileFuture> = pos
            .square(radius)
            .map(|neighbour| match state.holders.get(&neighbour.key()) {
                Some(holder) => self.schedule(state, holder, TileStatus::Full),
                None => unloaded(neighbour),
            })
            .collect();
        CompletableFuture::join_all(futures).map(move |results: &Vec<TileResult>| {
            if let Some(failure) = first_failure(results) {
                return Err(failure);
            }
            results
                .get(results.len() / 2)
                .cloned()
                .unwrap_or(Err(TileFailure::Unloaded(pos)))
        })
    }

    /// Readies a tile that just became ticking. Runs on the main actor.
    fn start_ticking(&self, holder: &TileHolder, tile: &Arc<TileData>) {
        if self.thresholds.full_status(holder.ticket_level()) < FullStatus::Ticking {
            return;
        }
        let unpacked = tile.unpack_ticks(self.current_tick());
        if unpacked > 0 {
            log::trace!("Unpacked {unpacked} scheduled ticks in {}", holder.pos());
        }
        self.send_to_viewers(tile);
    }
}
