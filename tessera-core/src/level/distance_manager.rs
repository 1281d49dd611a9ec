//! The ticket authority: turns tickets and viewers into per-tile levels.

use std::{mem, sync::Arc};

use crossbeam::channel::{Receiver, Sender, unbounded};
use rustc_hash::{FxHashMap, FxHashSet};
use tessera_utils::TilePos;
use uuid::Uuid;

use super::{
    ticket::{Ticket, TicketKind, TicketTimeouts},
    tile_tracker::{LevelChange, PlayerDistanceTracker, TicketTracker, TickingTracker},
};
use crate::{
    task::{ImmediateExecutor, ProcessorMailbox, TaskActor, TaskSorter},
    tile::LevelThresholds,
};

/// Tiles within this distance of a viewer count for natural spawning.
pub const NATURAL_SPAWN_RADIUS: u8 = 8;
/// The largest supported view distance.
pub const MAX_VIEW_DISTANCE: u8 = 33;
/// How many tiles may wait for their player ticket to settle at once.
pub const PLAYER_TICKET_THROTTLE: usize = 4;

/// Work posted back from the ticket throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThrottleCommand {
    Add(TilePos),
    Remove(TilePos),
}

/// Releases throttled player tickets from any thread.
#[derive(Clone)]
pub struct ThrottleReleaser {
    sorter: Arc<TaskSorter>,
}

impl ThrottleReleaser {
    /// Frees the throttle slot held by `pos`.
    pub fn release(&self, pos: TilePos) {
        self.sorter
            .release(TaskActor::TicketThrottler, pos, false, || {});
    }
}

/// Owns every ticket and the trackers derived from them.
///
/// All methods run on the main coordination loop. The throttler is the only part touched
/// from other threads, and it talks back through a channel drained by
/// [`DistanceManager::run_all_updates`].
pub struct DistanceManager {
    thresholds: LevelThresholds,
    timeouts: TicketTimeouts,
    tickets: TicketTracker,
    ticking: TickingTracker,
    natural_spawn: PlayerDistanceTracker,
    view: PlayerDistanceTracker,
    players_per_tile: FxHashMap<i64, FxHashSet<Uuid>>,
    view_distance: u8,
    simulation_distance: u8,
    current_tick: u64,
    throttler: Arc<TaskSorter>,
    inbox: Receiver<ThrottleCommand>,
    outbox: Sender<ThrottleCommand>,
    tickets_to_release: Vec<TilePos>,
    level_changes: Vec<LevelChange>,
}

impl DistanceManager {
    /// Creates a manager with no tickets.
    #[must_use]
    pub fn new(
        thresholds: LevelThresholds,
        timeouts: TicketTimeouts,
        view_distance: u8,
        simulation_distance: u8,
    ) -> Self {
        let throttler = TaskSorter::new(usize::from(MAX_VIEW_DISTANCE) + 2);
        throttler.register(
            TaskActor::TicketThrottler,
            ProcessorMailbox::new(Arc::new(ImmediateExecutor), "ticket-throttler"),
            PLAYER_TICKET_THROTTLE,
        );
        let (outbox, inbox) = unbounded();

        Self {
            thresholds,
            timeouts,
            tickets: TicketTracker::with_levels(thresholds.level_count()),
            ticking: TickingTracker::with_levels(thresholds.border + 1),
            natural_spawn: PlayerDistanceTracker::with_max_distance(NATURAL_SPAWN_RADIUS),
            view: PlayerDistanceTracker::with_max_distance(MAX_VIEW_DISTANCE),
            players_per_tile: FxHashMap::default(),
            view_distance: view_distance.min(MAX_VIEW_DISTANCE),
            simulation_distance,
            current_tick: 0,
            throttler,
            inbox,
            outbox,
            tickets_to_release: Vec::new(),
            level_changes: Vec::new(),
        }
    }

    /// The thresholds levels are interpreted against.
    #[must_use]
    pub const fn thresholds(&self) -> LevelThresholds {
        self.thresholds
    }

    /// The tick tickets are currently stamped with.
    #[must_use]
    pub const fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// Adds a ticket of `kind` at `pos` requiring `level`.
    pub fn add_ticket(&mut self, kind: TicketKind, pos: TilePos, level: u8) {
        let mut ticket = Ticket::new(kind, level, pos);
        ticket.created_at_tick = self.current_tick;
        log::trace!("Adding {ticket} to {pos}");
        self.tickets.add_ticket(pos, ticket);
        if kind.simulates() {
            self.ticking.add_ticket(pos, ticket);
        }
    }

    /// Removes a ticket previously added with the same kind, position and level.
    pub fn remove_ticket(&mut self, kind: TicketKind, pos: TilePos, level: u8) -> bool {
        let ticket = Ticket::new(kind, level, pos);
        let removed = self.tickets.remove_ticket(pos, &ticket);
        if kind.simulates() {
            self.ticking.remove_ticket(pos, &ticket);
        }
        if !removed {
            log::debug!("No {kind} ticket at level {level} to remove from {pos}");
        }
        removed
    }

    /// Pins every tile within `radius` of `pos`, with the outer ring at the border level.
    pub fn add_region_ticket(&mut self, kind: TicketKind, pos: TilePos, radius: u8) {
        let level = self.region_level(radius);
        self.add_ticket(kind, pos, level);
    }

    /// Removes a ticket added with [`Self::add_region_ticket`].
    pub fn remove_region_ticket(&mut self, kind: TicketKind, pos: TilePos, radius: u8) -> bool {
        let level = self.region_level(radius);
        self.remove_ticket(kind, pos, level)
    }

    /// The ticket level for a region of `radius`. Radii past the border level are clamped
    /// to it, pinning the center at level 0.
    fn region_level(&self, radius: u8) -> u8 {
        let border = self.thresholds.border;
        if radius > border {
            log::warn!("Region radius {radius} exceeds the border level, clamping to {border}");
        }
        border - radius.min(border)
    }

    /// Registers a viewer standing on `pos`.
    pub fn add_player(&mut self, viewer: Uuid, pos: TilePos) {
        let viewers = self.players_per_tile.entry(pos.key()).or_default();
        if !viewers.insert(viewer) {
            return;
        }
        let first = viewers.len() == 1;
        self.natural_spawn.add_viewer(pos);
        self.view.add_viewer(pos);
        if first {
            let ticket = self.simulation_ticket(pos);
            self.ticking.add_ticket(pos, ticket);
        }
    }

    /// Unregisters a viewer previously added at `pos`.
    pub fn remove_player(&mut self, viewer: Uuid, pos: TilePos) {
        let Some(viewers) = self.players_per_tile.get_mut(&pos.key()) else {
            log::warn!("Viewer {viewer} removed from {pos} where no viewer is registered");
            return;
        };
        if !viewers.remove(&viewer) {
            return;
        }
        let last = viewers.is_empty();
        if last {
            self.players_per_tile.remove(&pos.key());
        }
        self.natural_spawn.remove_viewer(pos);
        self.view.remove_viewer(pos);
        if last {
            let ticket = self.simulation_ticket(pos);
            self.ticking.remove_ticket(pos, &ticket);
        }
    }

    fn simulation_ticket(&self, pos: TilePos) -> Ticket {
        let level = self
            .thresholds
            .entity_ticking
            .saturating_sub(self.simulation_distance);
        let mut ticket = Ticket::new(TicketKind::Player, level, pos);
        ticket.created_at_tick = self.current_tick;
        ticket
    }

    fn player_ticket(&self, pos: TilePos) -> Ticket {
        Ticket::new(TicketKind::Player, self.thresholds.entity_ticking, pos)
    }

    /// Changes the view distance, adding and removing player tickets at the edge.
    pub fn update_view_distance(&mut self, view_distance: u8) {
        let view_distance = view_distance.min(MAX_VIEW_DISTANCE);
        if view_distance == self.view_distance {
            return;
        }
        let old = self.view_distance;
        self.view_distance = view_distance;

        let crossings: Vec<_> = self
            .view
            .state()
            .tracked()
            .filter(|(_, level)| (*level <= old) != (*level <= view_distance))
            .collect();
        for (pos, level) in crossings {
            self.throttle(pos, level <= view_distance, level);
        }
    }

    /// Changes the simulation distance, replacing every viewer's simulation ticket.
    pub fn update_simulation_distance(&mut self, simulation_distance: u8) {
        if simulation_distance == self.simulation_distance {
            return;
        }
        let tiles: Vec<_> = self
            .players_per_tile
            .keys()
            .copied()
            .map(TilePos::from_key)
            .collect();
        for &pos in &tiles {
            let ticket = self.simulation_ticket(pos);
            self.ticking.remove_ticket(pos, &ticket);
        }
        self.simulation_distance = simulation_distance;
        for pos in tiles {
            let ticket = self.simulation_ticket(pos);
            self.ticking.add_ticket(pos, ticket);
        }
    }

    /// The current view distance.
    #[must_use]
    pub const fn view_distance(&self) -> u8 {
        self.view_distance
    }

    /// The current simulation distance.
    #[must_use]
    pub const fn simulation_distance(&self) -> u8 {
        self.simulation_distance
    }

    /// Drops every ticket that outlived its timeout as of `tick`.
    pub fn purge_expired(&mut self, tick: u64) {
        self.current_tick = tick;
        let timeouts = &self.timeouts;
        let removed = self
            .tickets
            .purge(|ticket| ticket.is_expired(tick, timeouts.timeout(ticket.kind)));
        self.ticking
            .purge(|ticket| ticket.is_expired(tick, timeouts.timeout(ticket.kind)));
        if !removed.is_empty() {
            log::debug!("Purged {} expired tickets at tick {tick}", removed.len());
        }
    }

    /// Settles every tracker. Returns true if any ticket level changed; the changes are then
    /// available from [`Self::take_level_changes`].
    pub fn run_all_updates(&mut self) -> bool {
        self.natural_spawn.run_all_updates();
        self.natural_spawn.state_mut().take_changes();
        self.ticking.run_all_updates();
        self.ticking.state_mut().take_changes();

        self.view.run_all_updates();
        for change in self.view.state_mut().take_changes() {
            let was_in_view = change.old <= self.view_distance;
            let in_view = change.new <= self.view_distance;
            if was_in_view != in_view {
                self.throttle(change.pos, in_view, change.new);
            }
        }
        self.apply_throttled();

        self.tickets.run_all_updates();
        let changes = self.tickets.state_mut().take_changes();
        let changed = !changes.is_empty();
        self.level_changes.extend(changes);
        changed
    }

    fn throttle(&self, pos: TilePos, add: bool, distance: u8) {
        let outbox = self.outbox.clone();
        if add {
            self.throttler.submit_acquire(
                TaskActor::TicketThrottler,
                pos,
                move || distance,
                Box::new(move || {
                    if outbox.send(ThrottleCommand::Add(pos)).is_err() {
                        log::debug!("Distance manager gone, dropping player ticket for {pos}");
                    }
                }),
            );
        } else {
            self.throttler
                .release(TaskActor::TicketThrottler, pos, true, move || {
                    if outbox.send(ThrottleCommand::Remove(pos)).is_err() {
                        log::debug!("Distance manager gone, dropping ticket removal for {pos}");
                    }
                });
        }
    }

    fn apply_throttled(&mut self) {
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                ThrottleCommand::Add(pos) => {
                    if self.view.level(pos.key()) <= self.view_distance {
                        let mut ticket = self.player_ticket(pos);
                        ticket.created_at_tick = self.current_tick;
                        self.tickets.add_ticket(pos, ticket);
                        self.tickets_to_release.push(pos);
                    } else {
                        self.throttler
                            .release(TaskActor::TicketThrottler, pos, false, || {});
                    }
                }
                ThrottleCommand::Remove(pos) => {
                    let ticket = self.player_ticket(pos);
                    self.tickets.remove_ticket(pos, &ticket);
                }
            }
        }
    }

    /// Level changes accumulated by [`Self::run_all_updates`], most urgent first per pass.
    pub fn take_level_changes(&mut self) -> Vec<LevelChange> {
        mem::take(&mut self.level_changes)
    }

    /// Tiles whose player ticket was just added. Each must be handed back through
    /// [`ThrottleReleaser::release`] once it is entity ticking.
    pub fn take_tickets_to_release(&mut self) -> Vec<TilePos> {
        mem::take(&mut self.tickets_to_release)
    }

    /// A handle releasing throttled tiles from any thread.
    #[must_use]
    pub fn throttle_releaser(&self) -> ThrottleReleaser {
        ThrottleReleaser {
            sorter: self.throttler.clone(),
        }
    }

    /// The settled ticket level of `pos`.
    #[must_use]
    pub fn ticket_level(&self, pos: TilePos) -> u8 {
        self.tickets.level(pos.key())
    }

    /// Tickets at `pos`, lowest level first.
    #[must_use]
    pub fn tickets_at(&self, pos: TilePos) -> Vec<Ticket> {
        self.tickets.state().tickets_at(pos).copied().collect()
    }

    /// Returns true if any ticket exists.
    #[must_use]
    pub fn has_tickets(&self) -> bool {
        self.tickets.state().ticketed_tiles() > 0
    }

    /// Returns true if a viewer is within the natural spawn radius of `pos`.
    #[must_use]
    pub fn has_player_nearby(&self, pos: TilePos) -> bool {
        self.natural_spawn.is_tracked(pos)
    }

    /// Returns true if `pos` is close enough to a simulation source for block ticks.
    #[must_use]
    pub fn in_block_ticking_range(&self, pos: TilePos) -> bool {
        self.ticking.level(pos.key()) <= self.thresholds.ticking
    }

    /// Returns true if `pos` is close enough to a simulation source for entity ticks.
    #[must_use]
    pub fn in_entity_ticking_range(&self, pos: TilePos) -> bool {
        self.ticking.level(pos.key()) <= self.thresholds.entity_ticking
    }

    /// Number of tiles within the natural spawn radius of any viewer.
    #[must_use]
    pub fn natural_spawn_tile_count(&self) -> usize {
        self.natural_spawn.state().tracked_tiles()
    }

    /// Every ticket, sorted by tile then ticket order.
    #[must_use]
    pub fn debug_tickets(&self) -> Vec<(TilePos, Ticket)> {
        let mut tickets: Vec<_> = self
            .tickets
            .state()
            .all_tickets()
            .map(|(pos, ticket)| (pos, *ticket))
            .collect();
        tickets.sort();
        tickets
    }
}
