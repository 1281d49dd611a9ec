//! Section-granular light propagation on top of the distance graph.
//!
//! A section's level is `15 - light`. Block light sources are sections containing an
//! emitting block; sky light sources are the sections above the highest section of a column
//! that blocks the sky. Light drops by one per section step in any of the 26 directions and
//! never leaves the tiles that have lighting enabled.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tessera_utils::{SectionPos, TilePos};

use super::LightLayer;
use crate::{
    level::graph::{LevelPropagator, LevelTracker, Neighbors},
    tile::tile_data::TileHeight,
};

/// The brightest light level.
pub const MAX_LIGHT: u8 = 15;
/// Number of graph levels: one per light level plus absent.
pub const LIGHT_LEVEL_COUNT: u8 = MAX_LIGHT + 2;
const ABSENT: u8 = LIGHT_LEVEL_COUNT - 1;

/// Light storage and sources for one layer.
#[derive(Debug)]
pub struct LightSections {
    layer: LightLayer,
    height: TileHeight,
    enabled: FxHashSet<i64>,
    retained: FxHashSet<i64>,
    emission: FxHashMap<i64, u8>,
    /// Per tile, the section ys that stop sky light.
    sky_blockers: FxHashMap<i64, BTreeSet<i32>>,
    levels: FxHashMap<i64, u8>,
    changed: FxHashSet<i64>,
}

impl LightSections {
    fn new(layer: LightLayer, height: TileHeight) -> Self {
        Self {
            layer,
            height,
            enabled: FxHashSet::default(),
            retained: FxHashSet::default(),
            emission: FxHashMap::default(),
            sky_blockers: FxHashMap::default(),
            levels: FxHashMap::default(),
            changed: FxHashSet::default(),
        }
    }

    /// The layer this storage belongs to.
    #[must_use]
    pub const fn layer(&self) -> LightLayer {
        self.layer
    }

    fn is_enabled(&self, tile: TilePos) -> bool {
        self.enabled.contains(&tile.key())
    }

    fn in_height(&self, y: i32) -> bool {
        y >= self.height.min_section && y <= self.height.max_section()
    }

    /// The highest section of the column that blocks sky light, or one below the world.
    fn sky_floor(&self, tile: TilePos) -> i32 {
        self.sky_blockers
            .get(&tile.key())
            .and_then(|ys| ys.last().copied())
            .unwrap_or(self.height.min_section - 1)
    }

    fn forget_sources(&mut self, tile: TilePos) {
        self.sky_blockers.remove(&tile.key());
        for y in self.height.min_section..=self.height.max_section() {
            self.emission.remove(&SectionPos::of(tile, y).key());
        }
    }

    /// The light level of a section.
    #[must_use]
    pub fn light(&self, section: SectionPos) -> u8 {
        MAX_LIGHT.saturating_sub(self.level(section.key()))
    }

    /// Number of sections holding light.
    #[must_use]
    pub fn lit_sections(&self) -> usize {
        self.levels.len()
    }
}

impl LevelPropagator for LightSections {
    fn level_from_source(&self, node: i64) -> u8 {
        let pos = SectionPos::from_key(node);
        if !self.is_enabled(pos.tile()) || !self.in_height(pos.y) {
            return ABSENT;
        }
        match self.layer {
            LightLayer::Block => self
                .emission
                .get(&node)
                .map_or(ABSENT, |&emission| MAX_LIGHT - emission.min(MAX_LIGHT)),
            LightLayer::Sky => {
                if pos.y > self.sky_floor(pos.tile()) {
                    0
                } else {
                    ABSENT
                }
            }
        }
    }

    fn neighbors(&self, node: i64) -> Neighbors {
        let pos = SectionPos::from_key(node);
        let mut neighbors = SmallVec::new();
        for dx in -1..=1 {
            for dz in -1..=1 {
                if !self.is_enabled(pos.tile().offset(dx, dz)) {
                    continue;
                }
                for dy in -1..=1 {
                    if (dx, dy, dz) != (0, 0, 0) && self.in_height(pos.y + dy) {
                        neighbors.push(pos.offset(dx, dy, dz).key());
                    }
                }
            }
        }
        neighbors
    }

    fn level(&self, node: i64) -> u8 {
        self.levels.get(&node).copied().unwrap_or(ABSENT)
    }

    fn set_level(&mut self, node: i64, level: u8) {
        let previous = if level >= ABSENT {
            self.levels.remove(&node)
        } else {
            self.levels.insert(node, level)
        };
        if previous.unwrap_or(ABSENT) != level.min(ABSENT) {
            self.changed.insert(node);
        }
    }

    fn level_from_neighbor(&self, _from: i64, to: i64, from_level: u8) -> u8 {
        let pos = SectionPos::from_key(to);
        if self.is_enabled(pos.tile()) {
            from_level.saturating_add(1)
        } else {
            ABSENT
        }
    }
}

/// The 3-D instantiation of the distance graph.
pub type LightSectionGraph = LevelTracker<LightSections>;

/// Block and sky light for every lit tile.
///
/// Not thread safe; [`super::ThreadedLightEngine`] serializes access.
#[derive(Debug)]
pub struct SectionLightEngine {
    height: TileHeight,
    block: LightSectionGraph,
    sky: LightSectionGraph,
}

impl SectionLightEngine {
    /// Creates an engine with no lit tiles.
    #[must_use]
    pub fn new(height: TileHeight) -> Self {
        Self {
            height,
            block: LevelTracker::new(LIGHT_LEVEL_COUNT, LightSections::new(LightLayer::Block, height)),
            sky: LevelTracker::new(LIGHT_LEVEL_COUNT, LightSections::new(LightLayer::Sky, height)),
        }
    }

    fn graph(&self, layer: LightLayer) -> &LightSectionGraph {
        match layer {
            LightLayer::Block => &self.block,
            LightLayer::Sky => &self.sky,
        }
    }

    fn sections(&self, tile: TilePos) -> impl Iterator<Item = SectionPos> + use<> {
        (self.height.min_section..=self.height.max_section()).map(move |y| SectionPos::of(tile, y))
    }

    /// Records whether a section lets sky light through.
    pub fn update_section_status(&mut self, section: SectionPos, is_empty: bool) {
        let tile = section.tile();
        let old_floor = self.sky.state().sky_floor(tile);
        let blockers = self.sky.state_mut().sky_blockers.entry(tile.key()).or_default();
        if is_empty {
            blockers.remove(&section.y);
        } else {
            blockers.insert(section.y);
        }
        let new_floor = self.sky.state().sky_floor(tile);
        if old_floor != new_floor {
            for y in old_floor.min(new_floor) + 1..=old_floor.max(new_floor) {
                self.sky.check_node(SectionPos::of(tile, y).key());
            }
        }
    }

    /// Sets the strongest emission inside a section.
    pub fn set_emission(&mut self, section: SectionPos, emission: u8) {
        let key = section.key();
        let emissions = &mut self.block.state_mut().emission;
        let changed = if emission == 0 {
            emissions.remove(&key).is_some()
        } else {
            emissions.insert(key, emission) != Some(emission)
        };
        if changed {
            self.block.check_node(key);
        }
    }

    /// Enables or disables light propagation into a tile.
    pub fn set_light_enabled(&mut self, tile: TilePos, enabled: bool) {
        for graph in [&mut self.block, &mut self.sky] {
            let state = graph.state_mut();
            let changed = if enabled {
                state.enabled.insert(tile.key())
            } else {
                state.enabled.remove(&tile.key())
            };
            if !enabled && !state.retained.contains(&tile.key()) {
                state.forget_sources(tile);
            }
            if changed {
                for y in self.height.min_section..=self.height.max_section() {
                    graph.check_node(SectionPos::of(tile, y).key());
                }
            }
        }
    }

    /// Keeps the sources of a disabled tile so re-enabling it restores its light.
    pub fn retain_data(&mut self, tile: TilePos, retain: bool) {
        for graph in [&mut self.block, &mut self.sky] {
            let state = graph.state_mut();
            if retain {
                state.retained.insert(tile.key());
            } else {
                state.retained.remove(&tile.key());
                if !state.is_enabled(tile) {
                    state.forget_sources(tile);
                }
            }
        }
    }

    /// Queues every section of `tile` for re-derivation.
    pub fn check_tile(&mut self, tile: TilePos) {
        for section in self.sections(tile) {
            self.block.check_node(section.key());
            self.sky.check_node(section.key());
        }
    }

    /// Propagates up to `budget` section updates over both layers. Returns the unused budget.
    pub fn run_light_updates(&mut self, budget: usize) -> usize {
        let budget = self.block.run_updates(budget);
        self.sky.run_updates(budget)
    }

    /// Returns true while propagation is pending.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.block.has_work() || self.sky.has_work()
    }

    /// The light level of a section.
    #[must_use]
    pub fn light_at(&self, layer: LightLayer, section: SectionPos) -> u8 {
        self.graph(layer).state().light(section)
    }

    /// Returns true if light propagates into `tile`.
    #[must_use]
    pub fn is_enabled(&self, tile: TilePos) -> bool {
        self.block.state().is_enabled(tile)
    }

    /// Sections whose light changed since the last call.
    pub fn take_changed(&mut self) -> Vec<(LightLayer, SectionPos)> {
        let mut changed = Vec::new();
        for graph in [&mut self.block, &mut self.sky] {
            let layer = graph.state().layer;
            changed.extend(
                graph
                    .state_mut()
                    .changed
                    .drain()
                    .map(|key| (layer, SectionPos::from_key(key))),
            );
        }
        changed
    }
}
