//! Batched light updates on the light actor.
//!
//! Every mutation is wrapped into a [`LightTaskKind::PreUpdate`] or
//! [`LightTaskKind::PostUpdate`] closure and submitted through the task sorter at the queue
//! level of the tile it concerns. Closures are buffered until a batch is full (or the tick
//! flushes it), then [`ThreadedLightEngine::run_update`] runs the pre-updates, one bounded
//! propagation pass and the post-updates.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tessera_utils::{SectionPos, TilePos, locks::SyncMutex};

use super::{LightLayer, section_graph::SectionLightEngine};
use crate::{
    task::{CompletableFuture, TaskActor, TaskSorter},
    tile::tile_data::{TileData, TileHeight},
};

/// Batch size during normal play.
pub const DEFAULT_TASKS_PER_BATCH: usize = 5;
/// Batch size while the spawn area is being primed.
pub const PRIMING_TASKS_PER_BATCH: usize = 500;

/// When a buffered closure runs relative to propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightTaskKind {
    /// Before propagation: source changes.
    PreUpdate,
    /// After propagation has drained: completions.
    PostUpdate,
}

type LightTask = Box<dyn FnOnce(&mut SectionLightEngine) + Send + 'static>;

#[derive(Default)]
struct LightTasks {
    pre: Vec<LightTask>,
    post: Vec<LightTask>,
}

impl LightTasks {
    fn len(&self) -> usize {
        self.pre.len() + self.post.len()
    }
}

/// The light engine as seen by the rest of the scheduler.
pub struct ThreadedLightEngine {
    engine: SyncMutex<SectionLightEngine>,
    sorter: Arc<TaskSorter>,
    tasks: SyncMutex<LightTasks>,
    tasks_per_batch: AtomicUsize,
    propagation_budget: usize,
    scheduled: AtomicBool,
    changed: SyncMutex<Vec<(LightLayer, SectionPos)>>,
}

impl ThreadedLightEngine {
    /// Creates an engine whose closures go through the sorter's light actor.
    #[must_use]
    pub fn new(
        sorter: Arc<TaskSorter>,
        height: TileHeight,
        tasks_per_batch: usize,
        propagation_budget: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine: SyncMutex::new(SectionLightEngine::new(height)),
            sorter,
            tasks: SyncMutex::new(LightTasks::default()),
            tasks_per_batch: AtomicUsize::new(tasks_per_batch.max(1)),
            propagation_budget: propagation_budget.max(1),
            scheduled: AtomicBool::new(false),
            changed: SyncMutex::new(Vec::new()),
        })
    }

    /// Changes how many closures are buffered before a batch runs.
    pub fn set_tasks_per_batch(&self, tasks_per_batch: usize) {
        self.tasks_per_batch
            .store(tasks_per_batch.max(1), Ordering::Release);
    }

    fn add_task<F>(self: &Arc<Self>, pos: TilePos, level: u8, kind: LightTaskKind, task: F)
    where
        F: FnOnce(&mut SectionLightEngine) + Send + 'static,
    {
        let this = self.clone();
        self.sorter.submit(
            TaskActor::Light,
            pos,
            || level,
            Box::new(move || {
                let buffered = {
                    let mut tasks = this.tasks.lock();
                    match kind {
                        LightTaskKind::PreUpdate => tasks.pre.push(Box::new(task)),
                        LightTaskKind::PostUpdate => tasks.post.push(Box::new(task)),
                    }
                    tasks.len()
                };
                if buffered >= this.tasks_per_batch.load(Ordering::Acquire) {
                    this.run_update();
                }
            }),
        );
    }

    /// Runs buffered pre-updates, one bounded propagation pass, then the post-updates if
    /// propagation drained. Post-updates stay buffered otherwise.
    pub fn run_update(&self) {
        let LightTasks { pre, post } = std::mem::take(&mut *self.tasks.lock());
        let mut engine = self.engine.lock();
        for task in pre {
            task(&mut engine);
        }
        engine.run_light_updates(self.propagation_budget);

        if engine.has_work() {
            let mut tasks = self.tasks.lock();
            let newer = std::mem::replace(&mut tasks.post, post);
            tasks.post.extend(newer);
        } else {
            for task in post {
                task(&mut engine);
            }
        }
        let changed = engine.take_changed();
        drop(engine);
        if !changed.is_empty() {
            self.changed.lock().extend(changed);
        }
    }

    /// Flushes a partial batch on the light actor if there is anything to do. Called once
    /// per tick.
    pub fn try_schedule_update(self: &Arc<Self>) {
        if !self.has_work() {
            return;
        }
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = self.clone();
        self.sorter.submit(
            TaskActor::Light,
            TilePos::ZERO,
            || 0,
            Box::new(move || {
                this.run_update();
                this.scheduled.store(false, Ordering::Release);
            }),
        );
    }

    /// Records whether a section lets sky light through.
    pub fn update_section_status(self: &Arc<Self>, section: SectionPos, is_empty: bool, level: u8) {
        self.add_task(section.tile(), level, LightTaskKind::PreUpdate, move |engine| {
            engine.update_section_status(section, is_empty);
        });
    }

    /// Sets the strongest emission inside a section.
    pub fn set_emission(self: &Arc<Self>, section: SectionPos, emission: u8, level: u8) {
        self.add_task(section.tile(), level, LightTaskKind::PreUpdate, move |engine| {
            engine.set_emission(section, emission);
        });
    }

    /// Enables or disables propagation into a tile.
    pub fn set_light_enabled(self: &Arc<Self>, tile: TilePos, enabled: bool, level: u8) {
        self.add_task(tile, level, LightTaskKind::PreUpdate, move |engine| {
            engine.set_light_enabled(tile, enabled);
        });
    }

    /// Keeps or drops the sources of a tile once it is disabled.
    pub fn retain_data(self: &Arc<Self>, tile: TilePos, retain: bool, level: u8) {
        self.add_task(tile, level, LightTaskKind::PostUpdate, move |engine| {
            engine.retain_data(tile, retain);
        });
    }

    /// Registers the light sources of a freshly generated tile and enables propagation
    /// into it. Completes once the batch carrying it has run.
    #[must_use]
    pub fn initialize_light(self: &Arc<Self>, tile: Arc<TileData>, level: u8) -> CompletableFuture<()> {
        let pos = tile.pos();
        self.add_task(pos, level, LightTaskKind::PreUpdate, move |engine| {
            let statuses: Vec<_> = tile.with_sections(|sections| {
                sections
                    .iter()
                    .map(|section| (!section.blocks_sky(), section.max_emission()))
                    .collect()
            });
            for (section, (is_empty, emission)) in tile.section_positions().zip(statuses) {
                engine.update_section_status(section, is_empty);
                engine.set_emission(section, emission);
            }
        });

        let done = CompletableFuture::new();
        let out = done.clone();
        self.add_task(pos, level, LightTaskKind::PostUpdate, move |engine| {
            engine.set_light_enabled(pos, true);
            engine.retain_data(pos, false);
            out.complete(());
        });
        done
    }

    /// Propagates light through a tile whose sources are registered. Completes once the
    /// propagation has drained, with the tile marked as correctly lit.
    #[must_use]
    pub fn light_tile(self: &Arc<Self>, tile: Arc<TileData>, level: u8) -> CompletableFuture<()> {
        let pos = tile.pos();
        self.add_task(pos, level, LightTaskKind::PreUpdate, move |engine| {
            if !engine.is_enabled(pos) {
                engine.set_light_enabled(pos, true);
            }
            engine.check_tile(pos);
        });

        let done = CompletableFuture::new();
        let out = done.clone();
        self.add_task(pos, level, LightTaskKind::PostUpdate, move |_| {
            tile.set_light_correct(true);
            out.complete(());
        });
        done
    }

    /// Stops lighting a tile and forgets its sources.
    pub fn remove_tile(self: &Arc<Self>, pos: TilePos, level: u8) {
        self.add_task(pos, level, LightTaskKind::PreUpdate, move |engine| {
            engine.retain_data(pos, false);
            engine.set_light_enabled(pos, false);
        });
    }

    /// The light level of a section.
    #[must_use]
    pub fn light_at(&self, layer: LightLayer, section: SectionPos) -> u8 {
        self.engine.lock().light_at(layer, section)
    }

    /// Returns true if closures are buffered or propagation is pending.
    #[must_use]
    pub fn has_work(&self) -> bool {
        let buffered = self.tasks.lock().len();
        buffered > 0 || self.engine.lock().has_work()
    }

    /// Sections whose light changed since the last call.
    pub fn take_changed_sections(&self) -> Vec<(LightLayer, SectionPos)> {
        std::mem::take(&mut *self.changed.lock())
    }
}

#[cfg(test)]
mod tests {
    use tessera_utils::BlockPos;

    use super::*;
    use crate::{
        task::{ImmediateExecutor, ProcessorMailbox},
        tile::tile_data::BlockState,
    };

    fn engine(tasks_per_batch: usize) -> Arc<ThreadedLightEngine> {
        let sorter = TaskSorter::new(40);
        sorter.register(
            TaskActor::Light,
            ProcessorMailbox::new(Arc::new(ImmediateExecutor), "light"),
            usize::MAX,
        );
        ThreadedLightEngine::new(sorter, TileHeight::default(), tasks_per_batch, usize::MAX)
    }

    #[test]
    fn batches_wait_for_the_tick_flush() {
        let light = engine(DEFAULT_TASKS_PER_BATCH);
        let tile = Arc::new(TileData::new_empty(TilePos::ZERO, TileHeight::default()));
        tile.set_block(BlockPos::new(0, 0, 0), BlockState::GLOWSTONE);

        let initialized = light.initialize_light(tile.clone(), 33);
        assert!(!initialized.is_done(), "two closures do not fill a batch");
        assert!(light.has_work());

        light.try_schedule_update();
        assert!(initialized.is_done());

        let lit = light.light_tile(tile.clone(), 33);
        light.try_schedule_update();
        assert!(lit.is_done());
        assert!(tile.is_light_correct());
        assert!(!light.has_work());

        assert_eq!(light.light_at(LightLayer::Block, SectionPos::new(0, 0, 0)), 15);
        assert_eq!(light.light_at(LightLayer::Sky, SectionPos::new(0, 19, 0)), 15);
        assert!(
            light
                .take_changed_sections()
                .contains(&(LightLayer::Block, SectionPos::new(0, 0, 0)))
        );
    }

    #[test]
    fn full_batches_run_without_a_flush() {
        let light = engine(2);
        let tile = Arc::new(TileData::new_empty(TilePos::new(4, 4), TileHeight::default()));
        let initialized = light.initialize_light(tile, 30);
        assert!(initialized.is_done());
    }

    #[test]
    fn removed_tiles_go_dark() {
        let light = engine(1);
        let tile = Arc::new(TileData::new_empty(TilePos::ZERO, TileHeight::default()));
        tile.set_block(BlockPos::new(3, 40, 3), BlockState::GLOWSTONE);
        let _ = light.initialize_light(tile.clone(), 33);
        let _ = light.light_tile(tile, 33);
        assert_eq!(light.light_at(LightLayer::Block, SectionPos::new(0, 2, 0)), 15);

        light.remove_tile(TilePos::ZERO, 33);
        assert_eq!(light.light_at(LightLayer::Block, SectionPos::new(0, 2, 0)), 0);
    }
}
