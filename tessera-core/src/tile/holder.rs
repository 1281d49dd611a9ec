//! The per-tile state machine.
//!
//! A [`TileHolder`] tracks one tile through the generation pipeline and the accessibility
//! levels above it. Stage futures are filled in lazily by the tile map; the holder only
//! knows which of them are still allowed at its ticket level. Everything that depends on
//! the rest of the map goes through [`HolderHost`].

use std::{
    collections::BTreeMap,
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};

use rustc_hash::FxHashSet;
use tessera_utils::{BitSet, BlockPos, SectionPos, TilePos, locks::SyncMutex};

use super::{
    full_status::{FullStatus, LevelThresholds},
    status::TileStatus,
    tile_data::{TileData, TileHeight},
};
use crate::{
    error::TileFailure,
    light::LightLayer,
    task::{CompletableFuture, TaskSorter},
};

/// The outcome of a tile future.
pub type TileResult = Result<Arc<TileData>, TileFailure>;
/// A future resolving to a tile at some stage or accessibility.
pub type TileFuture = CompletableFuture<TileResult>;

/// What a holder needs from the map while it settles.
pub trait HolderHost {
    /// Schedules the `Full` stage and wraps it as the border future.
    fn prepare_accessible(&self, holder: &Arc<TileHolder>) -> TileFuture;

    /// Waits for the border futures of every tile within one tile and readies block ticks.
    fn prepare_ticking(&self, holder: &Arc<TileHolder>) -> TileFuture;

    /// Waits for the border futures of every tile within two tiles.
    fn prepare_entity_ticking(&self, holder: &Arc<TileHolder>) -> TileFuture;

    /// Arranges for `status` to be confirmed on the main actor once `future` succeeds,
    /// unless a demotion with a newer generation overtakes it.
    fn schedule_promotion(&self, holder: &Arc<TileHolder>, future: &TileFuture, status: FullStatus, generation: u64);

    /// Called synchronously when the holder drops to `status`.
    fn on_demotion(&self, holder: &TileHolder, status: FullStatus);

    /// The sorter whose queues follow the holder's level.
    fn sorter(&self) -> &TaskSorter;
}

/// Block and light changes gathered since the last flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TileChanges {
    /// Changed blocks per section, as section-relative indices.
    pub blocks: Vec<(SectionPos, Vec<u16>)>,
    /// Light sections with changed sky light, indexed from one below the lowest section.
    pub sky_light: BitSet,
    /// Light sections with changed block light, same indexing.
    pub block_light: BitSet,
}

impl TileChanges {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.sky_light.is_empty() && self.block_light.is_empty()
    }
}

struct DirtyState {
    blocks: BTreeMap<i32, FxHashSet<u16>>,
    sky_light: BitSet,
    block_light: BitSet,
}

impl DirtyState {
    fn new(height: TileHeight) -> Self {
        let light_sections = height.section_count as usize + 2;
        Self {
            blocks: BTreeMap::new(),
            sky_light: BitSet::with_len(light_sections),
            block_light: BitSet::with_len(light_sections),
        }
    }

    fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.sky_light.is_empty() && self.block_light.is_empty()
    }
}

struct AccessFutures {
    border: TileFuture,
    ticking: TileFuture,
    entity_ticking: TileFuture,
}

impl AccessFutures {
    fn slot(&mut self, status: FullStatus) -> Option<&mut TileFuture> {
        match status {
            FullStatus::Inaccessible => None,
            FullStatus::Border => Some(&mut self.border),
            FullStatus::Ticking => Some(&mut self.ticking),
            FullStatus::EntityTicking => Some(&mut self.entity_ticking),
        }
    }
}

fn not_accessible(pos: TilePos) -> TileFuture {
    CompletableFuture::completed(Err(TileFailure::NotAccessible(pos)))
}

fn full_status_from_index(index: u8) -> FullStatus {
    FullStatus::ALL
        .get(usize::from(index))
        .copied()
        .unwrap_or(FullStatus::Inaccessible)
}

/// One tracked tile.
pub struct TileHolder {
    pos: TilePos,
    thresholds: LevelThresholds,
    height: TileHeight,
    ticket_level: AtomicU8,
    old_ticket_level: AtomicU8,
    queue_level: AtomicU8,
    stages: SyncMutex<[Option<TileFuture>; TileStatus::COUNT]>,
    access: SyncMutex<AccessFutures>,
    full_status: AtomicU8,
    promotion_generation: AtomicU64,
    save_future: SyncMutex<CompletableFuture<()>>,
    dirty: SyncMutex<DirtyState>,
    accessible_since_save: AtomicBool,
}

impl TileHolder {
    /// Creates an untracked holder. The first settlement moves it to `ticket_level`.
    #[must_use]
    pub fn new(pos: TilePos, ticket_level: u8, thresholds: LevelThresholds, height: TileHeight) -> Arc<Self> {
        let absent = thresholds.absent_level();
        Arc::new(Self {
            pos,
            thresholds,
            height,
            ticket_level: AtomicU8::new(ticket_level),
            old_ticket_level: AtomicU8::new(absent),
            queue_level: AtomicU8::new(absent),
            stages: SyncMutex::new(Default::default()),
            access: SyncMutex::new(AccessFutures {
                border: not_accessible(pos),
                ticking: not_accessible(pos),
                entity_ticking: not_accessible(pos),
            }),
            full_status: AtomicU8::new(0),
            promotion_generation: AtomicU64::new(0),
            save_future: SyncMutex::new(CompletableFuture::completed(())),
            dirty: SyncMutex::new(DirtyState::new(height)),
            accessible_since_save: AtomicBool::new(false),
        })
    }

    /// The tile position.
    #[must_use]
    pub const fn pos(&self) -> TilePos {
        self.pos
    }

    /// The level the ticket graph settled at.
    #[must_use]
    pub fn ticket_level(&self) -> u8 {
        self.ticket_level.load(Ordering::Acquire)
    }

    /// Records a new settled level. Takes effect on the next [`Self::update_futures`].
    pub fn set_ticket_level(&self, level: u8) {
        self.ticket_level.store(level, Ordering::Release);
    }

    /// The level as of the last settlement.
    #[must_use]
    pub fn old_ticket_level(&self) -> u8 {
        self.old_ticket_level.load(Ordering::Acquire)
    }

    /// The level the sorter files this tile's work under.
    #[must_use]
    pub fn queue_level(&self) -> u8 {
        self.queue_level.load(Ordering::Acquire)
    }

    /// Returns true if the ticket level still requires `status`.
    #[must_use]
    pub fn is_status_allowed(&self, status: TileStatus) -> bool {
        self.thresholds
            .generation_status(self.ticket_level())
            .is_some_and(|allowed| allowed.is_or_after(status))
    }

    /// The future for `status` if one was scheduled and can still be used.
    ///
    /// A future that failed with a non-sticky failure is treated as absent so the stage
    /// can be requested again.
    #[must_use]
    pub fn stage_future(&self, status: TileStatus) -> Option<TileFuture> {
        let stages = self.stages.lock();
        let future = stages[status.index()].as_ref()?;
        match future.now() {
            Some(Err(failure)) if !failure.is_sticky() => None,
            _ => Some(future.clone()),
        }
    }

    /// Installs the future for `status`, replacing any previous one.
    pub fn install_stage_future(&self, status: TileStatus, future: TileFuture) {
        self.stages.lock()[status.index()] = Some(future);
    }

    /// The most advanced stage whose future succeeded.
    #[must_use]
    pub fn latest_status(&self) -> Option<TileStatus> {
        let stages = self.stages.lock();
        TileStatus::ALL.into_iter().rev().find(|status| {
            stages[status.index()]
                .as_ref()
                .is_some_and(|future| matches!(future.now(), Some(Ok(_))))
        })
    }

    /// The tile as of the most advanced successful stage.
    #[must_use]
    pub fn latest_tile(&self) -> Option<Arc<TileData>> {
        let stages = self.stages.lock();
        stages
            .iter()
            .rev()
            .flatten()
            .find_map(|future| future.now().and_then(Result::ok))
    }

    /// The tile if `status` completed successfully.
    #[must_use]
    pub fn tile_if_present(&self, status: TileStatus) -> Option<Arc<TileData>> {
        self.stages.lock()[status.index()]
            .as_ref()
            .and_then(|future| future.now())
            .and_then(Result::ok)
    }

    /// The first failure recorded in any stage future.
    #[must_use]
    pub fn failure(&self) -> Option<TileFailure> {
        self.stages
            .lock()
            .iter()
            .flatten()
            .find_map(|future| future.now().and_then(Result::err))
    }

    /// The accessibility confirmed on the main actor.
    #[must_use]
    pub fn full_status(&self) -> FullStatus {
        full_status_from_index(self.full_status.load(Ordering::Acquire))
    }

    /// Confirms a promotion if `generation` is still current. Returns true if the status
    /// changed.
    pub fn confirm_promotion(&self, status: FullStatus, generation: u64) -> bool {
        if self.promotion_generation.load(Ordering::Acquire) != generation {
            return false;
        }
        let index = FullStatus::ALL
            .iter()
            .position(|s| *s == status)
            .unwrap_or(0) as u8;
        self.full_status.fetch_max(index, Ordering::AcqRel) < index
    }

    /// The future completing once the tile is accessible.
    #[must_use]
    pub fn border_future(&self) -> TileFuture {
        self.access.lock().border.clone()
    }

    /// The future completing once the tile ticks.
    #[must_use]
    pub fn ticking_future(&self) -> TileFuture {
        self.access.lock().ticking.clone()
    }

    /// The future completing once entities in the tile tick.
    #[must_use]
    pub fn entity_ticking_future(&self) -> TileFuture {
        self.access.lock().entity_ticking.clone()
    }

    /// Completes once every piece of work that may still mutate the tile has finished.
    #[must_use]
    pub fn save_future(&self) -> CompletableFuture<()> {
        self.save_future.lock().clone()
    }

    /// Makes the save future wait for `future` as well.
    pub fn add_save_dependency(&self, future: CompletableFuture<()>) {
        let mut save_future = self.save_future.lock();
        let combined = CompletableFuture::join_all(vec![save_future.clone(), future]).map(|_| ());
        *save_future = combined;
    }

    /// Returns true if the tile was accessible at any point since it was last saved.
    #[must_use]
    pub fn was_accessible_since_last_save(&self) -> bool {
        self.accessible_since_save.load(Ordering::Acquire)
    }

    /// Resets the flag once the tile has been saved, to what the current level allows.
    pub fn refresh_accessibility(&self) {
        let accessible = self.thresholds.full_status(self.ticket_level()) >= FullStatus::Border;
        self.accessible_since_save.store(accessible, Ordering::Release);
    }

    /// Records a changed block for the next flush. Returns true if the holder had no
    /// changes pending before.
    pub fn block_changed(&self, pos: BlockPos) -> bool {
        let mut dirty = self.dirty.lock();
        let was_clean = dirty.is_empty();
        dirty
            .blocks
            .entry(pos.y >> 4)
            .or_default()
            .insert(pos.section_relative());
        was_clean
    }

    /// Records a light change in section `y`. Returns true if the holder had no changes
    /// pending before.
    pub fn section_light_changed(&self, layer: LightLayer, y: i32) -> bool {
        let index = y - self.height.min_section + 1;
        if index < 0 || index > self.height.section_count as i32 + 1 {
            return false;
        }
        let mut dirty = self.dirty.lock();
        let was_clean = dirty.is_empty();
        match layer {
            LightLayer::Sky => dirty.sky_light.set(index as usize, true),
            LightLayer::Block => dirty.block_light.set(index as usize, true),
        }
        was_clean
    }

    /// Takes every change recorded since the last call.
    pub fn take_changes(&self) -> TileChanges {
        let mut dirty = self.dirty.lock();
        let blocks = mem::take(&mut dirty.blocks)
            .into_iter()
            .map(|(y, positions)| {
                let mut positions: Vec<_> = positions.into_iter().collect();
                positions.sort_unstable();
                (SectionPos::of(self.pos, y), positions)
            })
            .collect();
        let changes = TileChanges {
            blocks,
            sky_light: dirty.sky_light.clone(),
            block_light: dirty.block_light.clone(),
        };
        dirty.sky_light.clear();
        dirty.block_light.clear();
        changes
    }

    /// Settles the holder at its current ticket level.
    pub fn update_futures(self: &Arc<Self>, host: &impl HolderHost) {
        let old_level = self.old_ticket_level();
        let new_level = self.ticket_level();
        if old_level == new_level {
            return;
        }

        if new_level > old_level {
            self.fail_disallowed_stages(
                self.thresholds.generation_status(old_level),
                self.thresholds.generation_status(new_level),
            );
        }

        let old_full = self.thresholds.full_status(old_level);
        let new_full = self.thresholds.full_status(new_level);
        if new_full >= FullStatus::Border {
            self.accessible_since_save.store(true, Ordering::Release);
        }

        if new_full < old_full {
            let generation = self.promotion_generation.fetch_add(1, Ordering::AcqRel) + 1;
            log::trace!("Demoting {} to {new_full} (generation {generation})", self.pos);
            let index = FullStatus::ALL
                .iter()
                .position(|s| *s == new_full)
                .unwrap_or(0) as u8;
            self.full_status.fetch_min(index, Ordering::AcqRel);
        }

        for status in [FullStatus::Border, FullStatus::Ticking, FullStatus::EntityTicking] {
            let was = old_full >= status;
            let is = new_full >= status;
            if !was && is {
                let future = match status {
                    FullStatus::Border => host.prepare_accessible(self),
                    FullStatus::Ticking => host.prepare_ticking(self),
                    _ => host.prepare_entity_ticking(self),
                };
                let generation = self.promotion_generation.load(Ordering::Acquire);
                host.schedule_promotion(self, &future, status, generation);
                if status == FullStatus::Border {
                    self.add_save_dependency(future.map(|_| ()));
                }
                if let Some(slot) = self.access.lock().slot(status) {
                    *slot = future;
                }
            } else if was && !is {
                let stale = self
                    .access
                    .lock()
                    .slot(status)
                    .map(|slot| mem::replace(slot, not_accessible(self.pos)));
                if let Some(stale) = stale {
                    stale.complete(Err(TileFailure::NotAccessible(self.pos)));
                }
            }
        }

        if new_full < old_full {
            host.on_demotion(self, new_full);
        }

        let queue_level = &self.queue_level;
        host.sorter().on_level_change(
            self.pos,
            || queue_level.load(Ordering::Acquire),
            new_level,
            |level| queue_level.store(level, Ordering::Release),
        );
        self.old_ticket_level.store(new_level, Ordering::Release);
    }

    /// Fails pending stage futures the new level no longer allows and clears their slots.
    ///
    /// The load stage is kept even when nothing is allowed, so a holder revived before it
    /// is unloaded continues from the tile it already has.
    fn fail_disallowed_stages(&self, old_allowed: Option<TileStatus>, new_allowed: Option<TileStatus>) {
        let Some(old_allowed) = old_allowed else {
            return;
        };
        let first = new_allowed.map_or(1, |status| status.index() + 1);
        let stale: Vec<_> = {
            let mut stages = self.stages.lock();
            (first..=old_allowed.index())
                .filter_map(|index| stages[index].take())
                .collect()
        };
        for future in stale {
            future.complete(Err(TileFailure::Unloaded(self.pos)));
        }
    }
}

impl fmt::Debug for TileHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileHolder")
            .field("pos", &self.pos)
            .field("ticket_level", &self.ticket_level())
            .field("queue_level", &self.queue_level())
            .field("full_status", &self.full_status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingHost {
        sorter: Arc<TaskSorter>,
        prepared: AtomicUsize,
        promotions: SyncMutex<Vec<(FullStatus, u64)>>,
        demotions: SyncMutex<Vec<FullStatus>>,
        accessible: TileFuture,
    }

    impl CountingHost {
        fn new() -> Self {
            Self {
                sorter: TaskSorter::new(40),
                prepared: AtomicUsize::new(0),
                promotions: SyncMutex::new(Vec::new()),
                demotions: SyncMutex::new(Vec::new()),
                accessible: CompletableFuture::new(),
            }
        }
    }

    impl HolderHost for CountingHost {
        fn prepare_accessible(&self, _holder: &Arc<TileHolder>) -> TileFuture {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            self.accessible.clone()
        }

        fn prepare_ticking(&self, _holder: &Arc<TileHolder>) -> TileFuture {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            CompletableFuture::new()
        }

        fn prepare_entity_ticking(&self, _holder: &Arc<TileHolder>) -> TileFuture {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            CompletableFuture::new()
        }

        fn schedule_promotion(&self, _holder: &Arc<TileHolder>, _future: &TileFuture, status: FullStatus, generation: u64) {
            self.promotions.lock().push((status, generation));
        }

        fn on_demotion(&self, _holder: &TileHolder, status: FullStatus) {
            self.demotions.lock().push(status);
        }

        fn sorter(&self) -> &TaskSorter {
            &self.sorter
        }
    }

    fn holder(level: u8) -> Arc<TileHolder> {
        TileHolder::new(
            TilePos::new(2, 3),
            level,
            LevelThresholds::default(),
            TileHeight::default(),
        )
    }

    #[test]
    fn settling_twice_is_a_no_op() {
        let host = CountingHost::new();
        let holder = holder(31);
        holder.update_futures(&host);
        assert_eq!(host.prepared.load(Ordering::SeqCst), 3);
        assert_eq!(holder.queue_level(), 31);

        holder.update_futures(&host);
        assert_eq!(host.prepared.load(Ordering::SeqCst), 3);
        assert_eq!(host.promotions.lock().len(), 3);
        assert!(host.demotions.lock().is_empty());
        assert!(holder.was_accessible_since_last_save());
    }

    #[test]
    fn demotion_fails_stale_access_futures() {
        let host = CountingHost::new();
        let holder = holder(32);
        holder.update_futures(&host);
        let ticking = holder.ticking_future();
        assert!(!ticking.is_done());

        holder.set_ticket_level(33);
        holder.update_futures(&host);
        assert!(matches!(
            ticking.now(),
            Some(Err(TileFailure::NotAccessible(pos))) if pos == TilePos::new(2, 3)
        ));
        assert!(!holder.border_future().is_done(), "border is still wanted");
        assert_eq!(*host.demotions.lock(), vec![FullStatus::Border]);
    }

    #[test]
    fn promotions_from_before_a_demotion_are_ignored() {
        let host = CountingHost::new();
        let holder = holder(33);
        holder.update_futures(&host);
        let (_, generation) = host.promotions.lock()[0];

        holder.set_ticket_level(36);
        holder.update_futures(&host);
        assert!(!holder.confirm_promotion(FullStatus::Border, generation));
        assert_eq!(holder.full_status(), FullStatus::Inaccessible);

        holder.set_ticket_level(33);
        holder.update_futures(&host);
        let (_, generation) = host.promotions.lock()[1];
        assert!(holder.confirm_promotion(FullStatus::Border, generation));
        assert_eq!(holder.full_status(), FullStatus::Border);
    }

    #[test]
    fn raising_the_level_fails_pending_stages() {
        let host = CountingHost::new();
        let holder = holder(35);
        holder.update_futures(&host);
        let noise = CompletableFuture::new();
        let empty = CompletableFuture::new();
        holder.install_stage_future(TileStatus::Noise, noise.clone());
        holder.install_stage_future(TileStatus::Empty, empty.clone());

        holder.set_ticket_level(37);
        holder.update_futures(&host);
        assert!(matches!(
            noise.now(),
            Some(Err(TileFailure::Unloaded(pos))) if pos == TilePos::new(2, 3)
        ));
        assert!(holder.stage_future(TileStatus::Noise).is_none());
        assert!(!empty.is_done());
        assert!(holder.stage_future(TileStatus::Empty).is_some());

        holder.set_ticket_level(LevelThresholds::default().absent_level());
        holder.update_futures(&host);
        assert!(!empty.is_done(), "the load survives until the holder is dropped");
    }

    #[test]
    fn changes_are_bucketed_per_section() {
        let holder = holder(33);
        assert!(holder.block_changed(BlockPos::new(33, 5, 50)));
        assert!(!holder.block_changed(BlockPos::new(34, -20, 50)));
        assert!(!holder.section_light_changed(LightLayer::Sky, -5));
        assert!(!holder.section_light_changed(LightLayer::Block, 0));

        let changes = holder.take_changes();
        assert_eq!(changes.blocks.len(), 2);
        assert_eq!(changes.blocks[0].0, SectionPos::new(2, -2, 3));
        assert_eq!(changes.sky_light.ones().collect::<Vec<_>>(), vec![0]);
        assert_eq!(changes.block_light.ones().collect::<Vec<_>>(), vec![5]);
        assert!(holder.take_changes().is_empty());
    }
}
