//! The top-level scheduler.
//!
//! [`TileMap`] owns the holder table and the distance manager, drives settlement once per
//! tick and is the only place that turns ticket levels into scheduled work. All of its
//! mutating methods run on the main loop. Worker threads only ever see holders through
//! futures or through the published snapshot.

use std::{
    mem,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::runtime::Handle;
use tessera_utils::{BlockPos, TilePos, locks::SyncMutex};
use uuid::Uuid;

use crate::{
    config::SchedulerConfig,
    error::TileFailure,
    level::{DistanceManager, ThrottleReleaser, Ticket, TicketKind, distance_manager::MAX_VIEW_DISTANCE},
    light::ThreadedLightEngine,
    storage::{TileStorage, TileTypeCache},
    task::{
        CompletableFuture, Executor, MainThreadHandle, MainThreadQueue, ProcessorMailbox,
        TaskActor, TaskSorter, WorkerExecutor,
    },
    tick::TickContext,
    tile::{
        BlockState, FullStatus, LevelThresholds, TileData, TileGenerator, TileHolder, TileResult,
        TileStatus, WorldGenContext,
    },
    world::ViewerAreaMap,
};

mod listener;
mod saving;
mod scheduling;

pub use listener::{FullStatusListener, ViewerListener};
use scheduling::Settler;

/// State only the main loop touches.
struct MainState {
    distance: DistanceManager,
    holders: FxHashMap<i64, Arc<TileHolder>>,
    /// Holders no ticket wants any more, waiting for their last save.
    pending_unloads: FxHashMap<i64, Arc<TileHolder>>,
    /// Holders whose level dropped out of range during the current settlement.
    to_drop: FxHashSet<i64>,
    /// Holders with block or light changes not yet sent.
    dirty: FxHashSet<i64>,
    /// Tick of the last autosave per tile.
    save_cooldowns: FxHashMap<i64, u64>,
    /// Final writes of unloaded tiles still on the io actor.
    unload_writes: FxHashMap<i64, CompletableFuture<()>>,
    /// The holder table changed since the snapshot was published.
    modified: bool,
}

/// The tile lifecycle scheduler.
pub struct TileMap {
    this: Weak<TileMap>,
    config: SchedulerConfig,
    thresholds: LevelThresholds,
    sorter: Arc<TaskSorter>,
    main_queue: MainThreadQueue,
    main: MainThreadHandle,
    unload_queue: MainThreadQueue,
    context: WorldGenContext,
    viewers: ViewerAreaMap,
    visible: ArcSwap<FxHashMap<i64, Arc<TileHolder>>>,
    state: SyncMutex<MainState>,
    /// Tiles whose content went out to viewers.
    sent: SyncMutex<FxHashSet<i64>>,
    viewer_listener: Arc<dyn ViewerListener>,
    status_listener: Arc<dyn FullStatusListener>,
    fatal: SyncMutex<Option<TileFailure>>,
    current_tick: AtomicU64,
    throttle_releaser: ThrottleReleaser,
}

impl TileMap {
    /// Creates a map whose background actors run on `runtime`'s blocking pool.
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        runtime: Handle,
        storage: Arc<dyn TileStorage>,
        generator: Arc<dyn TileGenerator>,
        viewer_listener: Arc<dyn ViewerListener>,
        status_listener: Arc<dyn FullStatusListener>,
    ) -> Arc<Self> {
        let thresholds = config.thresholds;
        let sorter = TaskSorter::new(usize::from(thresholds.level_count()));
        let workers: Arc<dyn Executor> = Arc::new(WorkerExecutor::new(runtime));
        sorter.register(
            TaskActor::Worldgen,
            ProcessorMailbox::new(workers.clone(), "worldgen"),
            usize::MAX,
        );
        sorter.register(
            TaskActor::Io,
            ProcessorMailbox::new(workers.clone(), "io"),
            usize::MAX,
        );
        sorter.register(
            TaskActor::Light,
            ProcessorMailbox::new(workers, "light"),
            usize::MAX,
        );

        let main_queue = MainThreadQueue::new();
        let main = main_queue.handle();
        sorter.register(
            TaskActor::Main,
            ProcessorMailbox::new(Arc::new(main.clone()), "main"),
            usize::MAX,
        );

        let light = ThreadedLightEngine::new(
            sorter.clone(),
            config.height,
            config.light.tasks_per_batch,
            config.light.propagation_budget,
        );
        let distance = DistanceManager::new(
            thresholds,
            config.ticket_timeouts.clone(),
            config.view_distance,
            config.simulation_distance,
        );
        let throttle_releaser = distance.throttle_releaser();

        log::info!(
            "Tile map using generator '{}', view distance {}, simulation distance {}",
            generator.name(),
            config.view_distance,
            config.simulation_distance
        );

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            thresholds,
            sorter,
            main_queue,
            main,
            unload_queue: MainThreadQueue::new(),
            context: WorldGenContext {
                generator,
                light,
                storage,
                type_cache: Arc::new(TileTypeCache::new()),
                height: config.height,
            },
            viewers: ViewerAreaMap::new(config.view_distance),
            visible: ArcSwap::from_pointee(FxHashMap::default()),
            state: SyncMutex::new(MainState {
                distance,
                holders: FxHashMap::default(),
                pending_unloads: FxHashMap::default(),
                to_drop: FxHashSet::default(),
                dirty: FxHashSet::default(),
                save_cooldowns: FxHashMap::default(),
                unload_writes: FxHashMap::default(),
                modified: false,
            }),
            sent: SyncMutex::new(FxHashSet::default()),
            viewer_listener,
            status_listener,
            fatal: SyncMutex::new(None),
            current_tick: AtomicU64::new(0),
            throttle_releaser,
            config,
        })
    }

    /// Runs one tick of the scheduler.
    pub fn tick(&self, ctx: &TickContext) {
        let span = tracing::debug_span!("tile_map_tick", tick = ctx.current_tick);
        let _enter = span.enter();

        self.current_tick.store(ctx.current_tick, Ordering::Release);
        self.state.lock().distance.purge_expired(ctx.current_tick);
        self.settle();
        self.main_queue.run_all();
        self.process_unloads(self.config.unloads_per_tick);
        self.context.light.try_schedule_update();
        self.apply_light_changes();
        self.flush_changes();
        self.autosave(ctx);
    }

    /// Applies every pending ticket change to the holders. Returns true if any level
    /// changed.
    pub fn settle(&self) -> bool {
        let mut state = self.state.lock();
        if !state.distance.run_all_updates() {
            self.release_throttled(&mut state);
            return false;
        }

        let max_level = self.thresholds.max_level();
        let changes = state.distance.take_level_changes();
        let mut touched = Vec::with_capacity(changes.len());
        for change in changes {
            let key = change.pos.key();
            if change.new <= max_level {
                let holder = if let Some(holder) = state.holders.get(&key) {
                    holder.clone()
                } else {
                    let holder = state.pending_unloads.remove(&key).unwrap_or_else(|| {
                        TileHolder::new(change.pos, change.new, self.thresholds, self.config.height)
                    });
                    state.holders.insert(key, holder.clone());
                    state.modified = true;
                    holder
                };
                holder.set_ticket_level(change.new);
                state.to_drop.remove(&key);
                touched.push(holder);
            } else if let Some(holder) = state.holders.get(&key).cloned() {
                holder.set_ticket_level(change.new);
                state.to_drop.insert(key);
                touched.push(holder);
            }
        }

        let settler = Settler {
            map: self,
            state: &state,
        };
        for holder in &touched {
            holder.update_futures(&settler);
        }

        self.release_throttled(&mut state);
        self.drop_unneeded(&mut state);
        if state.modified {
            state.modified = false;
            self.visible.store(Arc::new(state.holders.clone()));
        }
        log::trace!("Settled {} holders", touched.len());
        true
    }

    /// Hands throttled player tickets back once their tile is entity ticking.
    fn release_throttled(&self, state: &mut MainState) {
        for pos in state.distance.take_tickets_to_release() {
            let releaser = self.throttle_releaser.clone();
            match state.holders.get(&pos.key()) {
                Some(holder) => holder
                    .entity_ticking_future()
                    .on_complete(move |_| releaser.release(pos)),
                None => releaser.release(pos),
            }
        }
    }

    /// Moves holders nothing wants any more to the pending unloads.
    fn drop_unneeded(&self, state: &mut MainState) {
        for key in mem::take(&mut state.to_drop) {
            let Some(holder) = state.holders.get(&key) else {
                continue;
            };
            if self.thresholds.is_loaded(holder.ticket_level()) {
                continue;
            }
            let Some(holder) = state.holders.remove(&key) else {
                continue;
            };
            state.pending_unloads.insert(key, holder.clone());
            state.modified = true;
            self.schedule_unload(holder);
        }
    }

    /// Adds a ticket. Takes effect on the next settlement.
    pub fn add_ticket(&self, kind: TicketKind, pos: TilePos, level: u8) {
        self.state.lock().distance.add_ticket(kind, pos, level);
    }

    /// Removes a ticket. Takes effect on the next settlement.
    pub fn remove_ticket(&self, kind: TicketKind, pos: TilePos, level: u8) -> bool {
        self.state.lock().distance.remove_ticket(kind, pos, level)
    }

    /// Pins every tile within `radius` of `pos`.
    pub fn add_region_ticket(&self, kind: TicketKind, pos: TilePos, radius: u8) {
        self.state.lock().distance.add_region_ticket(kind, pos, radius);
    }

    /// Removes a ticket added with [`Self::add_region_ticket`].
    pub fn remove_region_ticket(&self, kind: TicketKind, pos: TilePos, radius: u8) -> bool {
        self.state
            .lock()
            .distance
            .remove_region_ticket(kind, pos, radius)
    }

    /// Registers a viewer at `pos` and sends it every tile already sent around it.
    pub fn add_viewer(&self, viewer: Uuid, pos: TilePos) {
        if self.viewers.center_of(viewer).is_some() {
            self.move_viewer(viewer, pos);
            return;
        }
        self.state.lock().distance.add_player(viewer, pos);
        self.viewers.add(viewer, pos);

        let radius = i32::from(self.viewers.radius());
        for tile_pos in pos.square(radius) {
            self.send_if_sent(viewer, tile_pos);
        }
    }

    /// Moves a viewer to `pos`, sending the tiles it now sees and forgetting the ones it
    /// no longer does.
    pub fn move_viewer(&self, viewer: Uuid, pos: TilePos) {
        let Some(old) = self.viewers.center_of(viewer) else {
            self.add_viewer(viewer, pos);
            return;
        };
        if old == pos {
            return;
        }
        {
            let mut state = self.state.lock();
            state.distance.remove_player(viewer, old);
            state.distance.add_player(viewer, pos);
        }
        self.viewers.move_viewer(viewer, old, pos);

        let radius = i32::from(self.viewers.radius());
        let before: FxHashSet<TilePos> = old.square(radius).collect();
        let after: FxHashSet<TilePos> = pos.square(radius).collect();
        let sent = self.sent.lock().clone();
        for &tile_pos in before.difference(&after) {
            if sent.contains(&tile_pos.key()) {
                self.viewer_listener.forget_tile(viewer, tile_pos);
            }
        }
        for &tile_pos in after.difference(&before) {
            self.send_if_sent(viewer, tile_pos);
        }
    }

    /// Unregisters a viewer.
    pub fn remove_viewer(&self, viewer: Uuid) {
        let Some(center) = self.viewers.remove(viewer) else {
            log::debug!("Removing unknown viewer {viewer}");
            return;
        };
        self.state.lock().distance.remove_player(viewer, center);
    }

    /// Changes the view distance of every viewer.
    pub fn set_view_distance(&self, view_distance: u8) {
        let view_distance = view_distance.clamp(3, MAX_VIEW_DISTANCE);
        self.state.lock().distance.update_view_distance(view_distance);
        self.viewers.set_radius(view_distance);
    }

    /// Changes the simulation distance of every viewer.
    pub fn set_simulation_distance(&self, simulation_distance: u8) {
        self.state
            .lock()
            .distance
            .update_simulation_distance(simulation_distance);
    }

    /// Returns the tile at `status`, loading or generating it if needed and running the
    /// main queue while waiting.
    ///
    /// Must be called from the main loop.
    pub fn get_tile_blocking(&self, pos: TilePos, status: TileStatus) -> TileResult {
        let level = self.thresholds.level_for_status(status);
        self.add_ticket(TicketKind::Unknown, pos, level);
        self.settle();

        let future = {
            let state = self.state.lock();
            match state.holders.get(&pos.key()) {
                Some(holder) => self.schedule(&state, holder, status),
                None => return Err(TileFailure::Unloaded(pos)),
            }
        };
        self.drive_until(&future)
    }

    /// Pins the spawn area around `center` and blocks until it is accessible. Light runs
    /// in large batches meanwhile. Returns how many tiles became accessible.
    pub fn prime_spawn(&self, center: TilePos) -> usize {
        let radius = self.config.spawn_radius;
        self.context
            .light
            .set_tasks_per_batch(self.config.light.priming_tasks_per_batch);
        self.add_region_ticket(TicketKind::Start, center, radius);
        self.settle();

        let pending: Vec<_> = {
            let state = self.state.lock();
            center
                .square(i32::from(radius))
                .filter_map(|pos| state.holders.get(&pos.key()))
                .map(|holder| holder.border_future())
                .collect()
        };
        let results = self.drive_until(&CompletableFuture::join_all(pending));
        self.context
            .light
            .set_tasks_per_batch(self.config.light.tasks_per_batch);

        let ready = results.iter().filter(|result| result.is_ok()).count();
        log::info!("Spawn area around {center} primed, {ready} tiles accessible");
        ready
    }

    /// Runs the main queue and flushes light until `future` completes.
    fn drive_until<T: Clone + Send + Sync + 'static>(&self, future: &CompletableFuture<T>) -> T {
        loop {
            if let Some(value) = future.now() {
                return value;
            }
            if !self.main_queue.run_one() {
                self.context.light.try_schedule_update();
                if let Some(value) = future.wait_timeout(Duration::from_millis(1)) {
                    return value;
                }
            }
        }
    }

    /// Sets a block in an accessible tile. Returns false if the tile is not accessible or
    /// nothing changed.
    pub fn set_block(&self, pos: BlockPos, block: BlockState) -> bool {
        let mut state = self.state.lock();
        let key = pos.tile().key();
        let Some(holder) = state.holders.get(&key).cloned() else {
            return false;
        };
        let Some(tile) = holder.tile_if_present(TileStatus::Full) else {
            return false;
        };
        let Some(previous) = tile.set_block(pos, block) else {
            return false;
        };

        if holder.block_changed(pos) {
            state.dirty.insert(key);
        }
        drop(state);

        let section = pos.section();
        let level = holder.queue_level();
        let Some(index) = tile.height().section_index(section.y) else {
            return true;
        };
        if previous.light_emission() != block.light_emission() {
            let emission = tile.with_sections(|sections| sections[index].max_emission());
            self.context.light.set_emission(section, emission, level);
        }
        if previous.is_opaque() != block.is_opaque() {
            let is_empty = tile.with_sections(|sections| !sections[index].blocks_sky());
            self.context
                .light
                .update_section_status(section, is_empty, level);
        }
        true
    }

    /// The block at `pos`, if its tile is accessible.
    #[must_use]
    pub fn block(&self, pos: BlockPos) -> Option<BlockState> {
        self.holder(pos.tile())?
            .tile_if_present(TileStatus::Full)
            .map(|tile| tile.block(pos))
    }

    /// Marks holders whose light changed since the last tick.
    fn apply_light_changes(&self) {
        let changed = self.context.light.take_changed_sections();
        if changed.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let MainState { holders, dirty, .. } = &mut *state;
        for (layer, section) in changed {
            let key = section.tile().key();
            if let Some(holder) = holders.get(&key)
                && holder.section_light_changed(layer, section.y)
            {
                dirty.insert(key);
            }
        }
    }

    /// Sends accumulated block and light changes to the viewers of each changed tile.
    fn flush_changes(&self) {
        let changed: Vec<_> = {
            let mut state = self.state.lock();
            let dirty = mem::take(&mut state.dirty);
            dirty
                .into_iter()
                .filter_map(|key| state.holders.get(&key).cloned())
                .collect()
        };
        if changed.is_empty() {
            return;
        }

        let span = tracing::trace_span!("flush_changes", tiles = changed.len());
        let _enter = span.enter();
        for holder in changed {
            let changes = holder.take_changes();
            let pos = holder.pos();
            if changes.is_empty() || !self.sent.lock().contains(&pos.key()) {
                continue;
            }
            for viewer in self.viewers.viewers_of(pos) {
                if !changes.blocks.is_empty() {
                    self.viewer_listener
                        .send_block_changes(viewer, pos, &changes.blocks);
                }
                if !changes.sky_light.is_empty() || !changes.block_light.is_empty() {
                    self.viewer_listener.send_light_changes(
                        viewer,
                        pos,
                        &changes.sky_light,
                        &changes.block_light,
                    );
                }
            }
        }
    }

    /// Sends `tile` to everyone who can see it. Runs on the main actor.
    fn send_to_viewers(&self, tile: &Arc<TileData>) {
        let pos = tile.pos();
        self.sent.lock().insert(pos.key());
        for viewer in self.viewers.viewers_of(pos) {
            self.viewer_listener.send_tile(viewer, tile);
        }
    }

    fn send_if_sent(&self, viewer: Uuid, pos: TilePos) {
        if !self.sent.lock().contains(&pos.key()) {
            return;
        }
        if let Some(tile) = self
            .holder(pos)
            .and_then(|holder| holder.tile_if_present(TileStatus::Full))
        {
            self.viewer_listener.send_tile(viewer, &tile);
        }
    }

    /// Tells viewers of `pos` to drop it, if it was sent.
    fn forget_sent(&self, pos: TilePos) {
        if !self.sent.lock().remove(&pos.key()) {
            return;
        }
        for viewer in self.viewers.viewers_of(pos) {
            self.viewer_listener.forget_tile(viewer, pos);
        }
    }

    /// Runs `f` on the main loop, if the map still exists by then.
    fn run_on_main<F>(&self, f: F)
    where
        F: FnOnce(&TileMap) + Send + 'static,
    {
        let map = self.this.clone();
        self.main.execute(Box::new(move || {
            if let Some(map) = map.upgrade() {
                f(&map);
            }
        }));
    }

    fn record_fatal(&self, failure: TileFailure) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(failure);
        }
    }

    /// The first unrecoverable failure, if one happened since the last call.
    pub fn take_fatal_error(&self) -> Option<TileFailure> {
        self.fatal.lock().take()
    }

    /// Saves everything, waits for in-flight saves and closes the actors.
    pub fn shutdown(&self) {
        self.save_all(true);
        self.sorter.close();
        log::info!("Tile map shut down");
    }

    /// The holder of `pos` as of the last settlement.
    #[must_use]
    pub fn holder(&self, pos: TilePos) -> Option<Arc<TileHolder>> {
        self.visible.load().get(&pos.key()).cloned()
    }

    /// The confirmed accessibility of `pos`.
    #[must_use]
    pub fn full_status(&self, pos: TilePos) -> FullStatus {
        self.holder(pos)
            .map_or(FullStatus::Inaccessible, |holder| holder.full_status())
    }

    /// The settled ticket level of `pos`.
    #[must_use]
    pub fn ticket_level(&self, pos: TilePos) -> u8 {
        self.state.lock().distance.ticket_level(pos)
    }

    /// Tickets at `pos`, lowest level first.
    #[must_use]
    pub fn tickets_at(&self, pos: TilePos) -> Vec<Ticket> {
        self.state.lock().distance.tickets_at(pos)
    }

    /// Every ticket, sorted by tile.
    #[must_use]
    pub fn debug_tickets(&self) -> Vec<(TilePos, Ticket)> {
        self.state.lock().distance.debug_tickets()
    }

    /// Every holder with whether it is still in the table (`false` while pending unload).
    #[must_use]
    pub fn debug_holders(&self) -> Vec<(Arc<TileHolder>, bool)> {
        let state = self.state.lock();
        let mut holders: Vec<_> = state
            .holders
            .values()
            .map(|holder| (holder.clone(), true))
            .chain(
                state
                    .pending_unloads
                    .values()
                    .map(|holder| (holder.clone(), false)),
            )
            .collect();
        holders.sort_by_key(|(holder, _)| (holder.pos().x, holder.pos().z));
        holders
    }

    /// Number of holders in the table.
    #[must_use]
    pub fn loaded_tile_count(&self) -> usize {
        self.state.lock().holders.len()
    }

    /// Number of holders waiting to be unloaded.
    #[must_use]
    pub fn pending_unload_count(&self) -> usize {
        self.state.lock().pending_unloads.len()
    }

    /// Returns true if a viewer is close enough to `pos` for natural spawning.
    #[must_use]
    pub fn has_player_nearby(&self, pos: TilePos) -> bool {
        self.state.lock().distance.has_player_nearby(pos)
    }

    /// Returns true if blocks in `pos` are simulated.
    #[must_use]
    pub fn in_block_ticking_range(&self, pos: TilePos) -> bool {
        self.state.lock().distance.in_block_ticking_range(pos)
    }

    /// Returns true if entities in `pos` are simulated.
    #[must_use]
    pub fn in_entity_ticking_range(&self, pos: TilePos) -> bool {
        self.state.lock().distance.in_entity_ticking_range(pos)
    }

    /// Viewers that can see `pos`.
    #[must_use]
    pub fn viewers_of(&self, pos: TilePos) -> Vec<Uuid> {
        self.viewers.viewers_of(pos)
    }

    /// The light engine.
    #[must_use]
    pub fn light(&self) -> &Arc<ThreadedLightEngine> {
        &self.context.light
    }

    /// The task sorter feeding every actor.
    #[must_use]
    pub fn sorter(&self) -> &Arc<TaskSorter> {
        &self.sorter
    }

    /// The thresholds levels are interpreted against.
    #[must_use]
    pub const fn thresholds(&self) -> LevelThresholds {
        self.thresholds
    }

    /// The tick last passed to [`Self::tick`].
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Acquire)
    }
}
