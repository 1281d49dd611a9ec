//! The 2-D instantiations of the distance graph.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tessera_utils::TilePos;

use super::{
    graph::{LevelPropagator, LevelTracker, Neighbors},
    ticket::Ticket,
};

/// A level change of one tile, as reported by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChange {
    /// The tile.
    pub pos: TilePos,
    /// The level before the pass.
    pub old: u8,
    /// The level after the pass.
    pub new: u8,
}

fn tile_neighbors(node: i64) -> Neighbors {
    let pos = TilePos::from_key(node);
    pos.square(1)
        .filter(|n| *n != pos)
        .map(TilePos::key)
        .collect()
}

/// Settled levels plus the coalesced changes since they were last taken.
#[derive(Debug)]
struct LevelMap {
    absent: u8,
    levels: FxHashMap<i64, u8>,
    /// First old level and latest new level per node.
    changes: FxHashMap<i64, (u8, u8)>,
}

impl LevelMap {
    fn new(absent: u8) -> Self {
        Self {
            absent,
            levels: FxHashMap::default(),
            changes: FxHashMap::default(),
        }
    }

    fn get(&self, node: i64) -> u8 {
        self.levels.get(&node).copied().unwrap_or(self.absent)
    }

    fn set(&mut self, node: i64, level: u8) {
        let old = if level >= self.absent {
            self.levels.remove(&node)
        } else {
            self.levels.insert(node, level)
        }
        .unwrap_or(self.absent);
        let new = level.min(self.absent);
        if old != new {
            self.changes
                .entry(node)
                .and_modify(|(_, latest)| *latest = new)
                .or_insert((old, new));
        }
    }

    /// Changes that did not cancel out, most urgent first.
    fn take_changes(&mut self) -> Vec<LevelChange> {
        let mut changes: Vec<_> = self
            .changes
            .drain()
            .filter(|(_, (old, new))| old != new)
            .map(|(node, (old, new))| LevelChange {
                pos: TilePos::from_key(node),
                old,
                new,
            })
            .collect();
        changes.sort_by_key(|change| (change.new, change.pos));
        changes
    }
}

/// Ticket-sourced levels: the source of a tile is its lowest ticket.
#[derive(Debug)]
pub struct TicketLevels {
    tickets: FxHashMap<i64, BTreeSet<Ticket>>,
    map: LevelMap,
}

impl TicketLevels {
    /// Creates an empty ticket table whose absent level is `absent`.
    #[must_use]
    pub fn new(absent: u8) -> Self {
        Self {
            tickets: FxHashMap::default(),
            map: LevelMap::new(absent),
        }
    }

    /// Tickets at `pos`, lowest level first.
    pub fn tickets_at(&self, pos: TilePos) -> impl Iterator<Item = &Ticket> {
        self.tickets.get(&pos.key()).into_iter().flatten()
    }

    /// Every ticket, grouped by tile.
    pub fn all_tickets(&self) -> impl Iterator<Item = (TilePos, &Ticket)> {
        self.tickets
            .iter()
            .flat_map(|(key, set)| set.iter().map(move |ticket| (TilePos::from_key(*key), ticket)))
    }

    /// Number of tiles carrying at least one ticket.
    #[must_use]
    pub fn ticketed_tiles(&self) -> usize {
        self.tickets.len()
    }

    /// Number of tiles with a settled level.
    #[must_use]
    pub fn tracked_tiles(&self) -> usize {
        self.map.levels.len()
    }

    /// Level changes since the last call.
    pub fn take_changes(&mut self) -> Vec<LevelChange> {
        self.map.take_changes()
    }
}

impl LevelPropagator for TicketLevels {
    fn level_from_source(&self, node: i64) -> u8 {
        self.tickets
            .get(&node)
            .and_then(BTreeSet::first)
            .map_or(self.map.absent, |ticket| ticket.level.min(self.map.absent))
    }

    fn neighbors(&self, node: i64) -> Neighbors {
        tile_neighbors(node)
    }

    fn level(&self, node: i64) -> u8 {
        self.map.get(node)
    }

    fn set_level(&mut self, node: i64, level: u8) {
        self.map.set(node, level);
    }
}

/// A tracker whose sources are tickets.
pub type TicketTracker = LevelTracker<TicketLevels>;

impl LevelTracker<TicketLevels> {
    /// Creates a ticket tracker with `level_count` levels.
    #[must_use]
    pub fn with_levels(level_count: u8) -> Self {
        Self::new(level_count, TicketLevels::new(level_count - 1))
    }

    /// Adds `ticket` at `pos`, refreshing the creation tick of an equal ticket. Returns true
    /// if the ticket lowered the tile's source level.
    pub fn add_ticket(&mut self, pos: TilePos, ticket: Ticket) -> bool {
        let old = self.state().level_from_source(pos.key());
        self.state_mut()
            .tickets
            .entry(pos.key())
            .or_default()
            .replace(ticket);
        if ticket.level < old {
            self.update(pos.key(), ticket.level, true);
            true
        } else {
            false
        }
    }

    /// Removes `ticket` from `pos`. Returns false if it was not present.
    pub fn remove_ticket(&mut self, pos: TilePos, ticket: &Ticket) -> bool {
        let key = pos.key();
        let state = self.state_mut();
        let Some(set) = state.tickets.get_mut(&key) else {
            return false;
        };
        if !set.remove(ticket) {
            return false;
        }
        if set.is_empty() {
            state.tickets.remove(&key);
        }
        let level = self.state().level_from_source(key);
        self.update(key, level, false);
        true
    }

    /// Removes every ticket for which `expired` returns true and re-derives the affected
    /// tiles. Returns the removed tickets.
    pub fn purge<F>(&mut self, mut expired: F) -> Vec<(TilePos, Ticket)>
    where
        F: FnMut(&Ticket) -> bool,
    {
        let mut removed = Vec::new();
        let mut touched = Vec::new();
        self.state_mut().tickets.retain(|key, set| {
            let before = set.first().map(|t| t.level);
            set.retain(|ticket| {
                if expired(ticket) {
                    removed.push((TilePos::from_key(*key), *ticket));
                    false
                } else {
                    true
                }
            });
            if set.first().map(|t| t.level) != before {
                touched.push(*key);
            }
            !set.is_empty()
        });
        for key in touched {
            let level = self.state().level_from_source(key);
            self.update(key, level, false);
        }
        removed
    }
}

/// Levels sourced by viewer presence, bounded by a maximum distance.
#[derive(Debug)]
pub struct PlayerDistanceLevels {
    viewers: FxHashMap<i64, usize>,
    map: LevelMap,
}

impl PlayerDistanceLevels {
    /// Tracks tiles up to `max_distance` from any viewer.
    #[must_use]
    pub fn new(max_distance: u8) -> Self {
        Self {
            viewers: FxHashMap::default(),
            map: LevelMap::new(max_distance + 1),
        }
    }

    /// The furthest tracked distance.
    #[must_use]
    pub const fn max_distance(&self) -> u8 {
        self.map.absent - 1
    }

    /// Number of tiles within range of any viewer.
    #[must_use]
    pub fn tracked_tiles(&self) -> usize {
        self.map.levels.len()
    }

    /// Every tracked tile with its distance to the nearest viewer.
    pub fn tracked(&self) -> impl Iterator<Item = (TilePos, u8)> + '_ {
        self.map
            .levels
            .iter()
            .map(|(key, level)| (TilePos::from_key(*key), *level))
    }

    /// Level changes since the last call.
    pub fn take_changes(&mut self) -> Vec<LevelChange> {
        self.map.take_changes()
    }
}

impl LevelPropagator for PlayerDistanceLevels {
    fn level_from_source(&self, node: i64) -> u8 {
        if self.viewers.contains_key(&node) {
            0
        } else {
            self.map.absent
        }
    }

    fn neighbors(&self, node: i64) -> Neighbors {
        tile_neighbors(node)
    }

    fn level(&self, node: i64) -> u8 {
        self.map.get(node)
    }

    fn set_level(&mut self, node: i64, level: u8) {
        self.map.set(node, level);
    }
}

/// A tracker of distance to the nearest viewer.
pub type PlayerDistanceTracker = LevelTracker<PlayerDistanceLevels>;

impl LevelTracker<PlayerDistanceLevels> {
    /// Creates a tracker covering `max_distance` tiles around each viewer.
    #[must_use]
    pub fn with_max_distance(max_distance: u8) -> Self {
        Self::new(max_distance + 2, PlayerDistanceLevels::new(max_distance))
    }

    /// Counts one more viewer standing on `pos`.
    pub fn add_viewer(&mut self, pos: TilePos) {
        let count = self.state_mut().viewers.entry(pos.key()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.update(pos.key(), 0, true);
        }
    }

    /// Counts one viewer less standing on `pos`.
    pub fn remove_viewer(&mut self, pos: TilePos) {
        let key = pos.key();
        let viewers = &mut self.state_mut().viewers;
        let Some(count) = viewers.get_mut(&key) else {
            log::warn!("Removing a viewer from {pos} which has none");
            return;
        };
        *count -= 1;
        if *count == 0 {
            viewers.remove(&key);
            let absent = self.absent_level();
            self.update(key, absent, false);
        }
    }

    /// Returns true if `pos` is within range of a viewer.
    #[must_use]
    pub fn is_tracked(&self, pos: TilePos) -> bool {
        self.level(pos.key()) < self.absent_level()
    }
}

/// The simulation-distance tracker. Same storage as the ticket tracker, separate tickets.
pub type TickingTracker = LevelTracker<TicketLevels>;
