//! The work done at each pipeline stage.
//!
//! Every function here is blocking and runs on the actor the tile map routes the stage to:
//! `Empty` on the io actor, `Full` on the main actor, everything else on the worldgen actor.
//! Light stages only enqueue work and hand back a future for it.

use std::sync::Arc;

use tessera_utils::TilePos;

use super::{
    generator::{TileGenerator, TileRegion},
    status::TileStatus,
    tile_data::{TileData, TileHeight},
};
use crate::{
    light::ThreadedLightEngine,
    storage::{TileStorage, TileType, TileTypeCache},
    task::CompletableFuture,
};

/// Everything a stage needs besides the tiles themselves.
pub struct WorldGenContext {
    /// The generator filling tiles.
    pub generator: Arc<dyn TileGenerator>,
    /// The light engine for the two light stages.
    pub light: Arc<ThreadedLightEngine>,
    /// Where tiles are loaded from.
    pub storage: Arc<dyn TileStorage>,
    /// Memo of what storage holds.
    pub type_cache: Arc<TileTypeCache>,
    /// Vertical extent of every tile.
    pub height: TileHeight,
}

/// The result of running a stage.
#[derive(Debug)]
pub enum StageWork {
    /// The stage finished synchronously.
    Done,
    /// The stage finishes once the future completes.
    Pending(CompletableFuture<()>),
}

/// Stage implementations.
pub struct StatusTasks;

impl StatusTasks {
    /// Loads `pos` from storage, or creates an empty tile if nothing usable is stored.
    ///
    /// I/O and decoding errors are logged and treated as a missing tile.
    #[must_use]
    pub fn load(context: &WorldGenContext, pos: TilePos) -> Arc<TileData> {
        if context.type_cache.get(pos) == Some(TileType::Absent) {
            return Arc::new(TileData::new_empty(pos, context.height));
        }

        let record = match context.storage.load(pos) {
            Ok(record) => record,
            Err(err) => {
                log::error!("Failed to load tile {pos}: {err}");
                None
            }
        };
        let Some(record) = record else {
            context.type_cache.set(pos, TileType::Absent);
            return Arc::new(TileData::new_empty(pos, context.height));
        };

        match TileData::from_record(&record, context.height) {
            Ok(tile) => {
                context
                    .type_cache
                    .set(pos, TileType::of_status(tile.status()));
                Arc::new(tile)
            }
            Err(err) => {
                log::error!("Discarding unreadable record for tile {pos}: {err}");
                context.type_cache.invalidate(pos);
                Arc::new(TileData::new_empty(pos, context.height))
            }
        }
    }

    /// Runs `status` for `tile`. `region` holds the dependency tiles at the parent stage.
    ///
    /// The tile's reached status is advanced once the work is done.
    pub fn run(
        context: &WorldGenContext,
        status: TileStatus,
        tile: &Arc<TileData>,
        region: &TileRegion,
        level: u8,
    ) -> anyhow::Result<StageWork> {
        let work = match status {
            TileStatus::Empty => StageWork::Done,
            TileStatus::InitializeLight => Self::initialize_light(context, tile, level),
            TileStatus::Light => Self::light(context, tile, level),
            TileStatus::Full => Self::full(tile),
            _ => Self::generate(context, status, tile, region)?,
        };

        match work {
            StageWork::Done => {
                tile.advance_status(status);
                Ok(StageWork::Done)
            }
            StageWork::Pending(future) => {
                let tile = tile.clone();
                Ok(StageWork::Pending(
                    future.map(move |()| tile.advance_status(status)),
                ))
            }
        }
    }

    /// Runs a pure generation stage unless the tile was loaded past it.
    fn generate(
        context: &WorldGenContext,
        status: TileStatus,
        tile: &Arc<TileData>,
        region: &TileRegion,
    ) -> anyhow::Result<StageWork> {
        if tile.status().is_or_after(status) {
            return Ok(StageWork::Done);
        }
        context.generator.generate(status, tile, region)?;
        tile.mark_unsaved();
        Ok(StageWork::Done)
    }

    /// Registers the tile's light sources with the light engine.
    ///
    /// Loaded tiles go through this as well, the light engine keeps nothing on disk.
    fn initialize_light(context: &WorldGenContext, tile: &Arc<TileData>, level: u8) -> StageWork {
        StageWork::Pending(context.light.initialize_light(tile.clone(), level))
    }

    /// Propagates light through the tile and its neighbours.
    fn light(context: &WorldGenContext, tile: &Arc<TileData>, level: u8) -> StageWork {
        StageWork::Pending(context.light.light_tile(tile.clone(), level))
    }

    /// Marks the tile as complete. Runs on the main actor.
    fn full(tile: &Arc<TileData>) -> StageWork {
        if !tile.status().is_or_after(TileStatus::Full) {
            tile.mark_unsaved();
        }
        StageWork::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::RamOnlyStorage,
        task::{ImmediateExecutor, ProcessorMailbox, TaskActor, TaskSorter},
        tile::{generator::FlatTileGenerator, tile_data::BlockState},
    };
    use tessera_utils::BlockPos;

    fn context(storage: Arc<dyn TileStorage>) -> WorldGenContext {
        let sorter = TaskSorter::new(40);
        sorter.register(
            TaskActor::Light,
            ProcessorMailbox::new(Arc::new(ImmediateExecutor), "light"),
            usize::MAX,
        );
        WorldGenContext {
            generator: Arc::new(FlatTileGenerator::default()),
            light: ThreadedLightEngine::new(sorter, TileHeight::default(), 1, usize::MAX),
            storage,
            type_cache: Arc::new(TileTypeCache::new()),
            height: TileHeight::default(),
        }
    }

    #[test]
    fn missing_tiles_load_empty_and_are_cached_as_absent() {
        let context = context(Arc::new(RamOnlyStorage::preloaded()));
        let tile = StatusTasks::load(&context, TilePos::new(2, 2));
        assert_eq!(tile.status(), TileStatus::Empty);
        assert_eq!(context.type_cache.get(TilePos::new(2, 2)), Some(TileType::Absent));
    }

    #[test]
    fn loaded_tiles_skip_generation() {
        let context = context(Arc::new(RamOnlyStorage::empty_world(TileHeight::default())));
        let tile = StatusTasks::load(&context, TilePos::ZERO);
        assert_eq!(context.type_cache.get(TilePos::ZERO), Some(TileType::Full));

        let region = TileRegion::new(TilePos::ZERO, 0, vec![tile.clone()]);
        let work = StatusTasks::run(&context, TileStatus::Noise, &tile, &region, 33)
            .expect("flat generator never fails");
        assert!(matches!(work, StageWork::Done));
        assert_eq!(
            tile.block(BlockPos::new(0, TileHeight::default().min_y(), 0)),
            BlockState::AIR
        );
    }

    #[test]
    fn light_stages_advance_once_lit() {
        let context = context(Arc::new(RamOnlyStorage::preloaded()));
        let tile = StatusTasks::load(&context, TilePos::ZERO);
        let region = TileRegion::new(TilePos::ZERO, 0, vec![tile.clone()]);

        for status in &TileStatus::ALL[1..=TileStatus::Features.index()] {
            let work = StatusTasks::run(&context, *status, &tile, &region, 33)
                .expect("flat generator never fails");
            assert!(matches!(work, StageWork::Done));
        }
        assert_eq!(tile.status(), TileStatus::Features);

        let StageWork::Pending(initialized) =
            StatusTasks::run(&context, TileStatus::InitializeLight, &tile, &region, 33)
                .expect("light never fails")
        else {
            panic!("light stages are asynchronous");
        };
        assert!(initialized.is_done());
        assert_eq!(tile.status(), TileStatus::InitializeLight);

        let _ = StatusTasks::run(&context, TileStatus::Light, &tile, &region, 33);
        assert!(tile.is_light_correct());
        assert_eq!(tile.status(), TileStatus::Light);
    }
}
