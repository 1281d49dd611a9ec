//! Tile contents shared between the scheduler's threads.
//!
//! A [`TileData`] is created by the load stage, mutated by the generation stages (one
//! worldgen task at a time) and read by the light engine, the save path and viewers. The
//! block sections sit behind one read-write lock, everything else is atomic or separately
//! locked.

use std::{
    io,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tessera_utils::{
    BlockPos, SectionPos, TilePos,
    locks::{SyncMutex, SyncRwLock},
};

use super::status::TileStatus;

/// Blocks per section.
pub const SECTION_VOLUME: usize = 16 * 16 * 16;

/// A block state id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockState(pub u16);

impl BlockState {
    /// Empty space.
    pub const AIR: Self = Self(0);
    /// Unbreakable floor.
    pub const BEDROCK: Self = Self(1);
    /// Stone.
    pub const STONE: Self = Self(2);
    /// Dirt.
    pub const DIRT: Self = Self(3);
    /// Grass block.
    pub const GRASS: Self = Self(4);
    /// A full-strength light source.
    pub const GLOWSTONE: Self = Self(5);
    /// A dim light source that lets light through.
    pub const TORCH: Self = Self(6);

    /// Light emitted by the block, `0..=15`.
    #[must_use]
    pub const fn light_emission(self) -> u8 {
        match self {
            Self::GLOWSTONE => 15,
            Self::TORCH => 14,
            _ => 0,
        }
    }

    /// Returns true if the block stops sky light.
    #[must_use]
    pub const fn is_opaque(self) -> bool {
        !matches!(self, Self::AIR | Self::TORCH)
    }

    /// Returns true for air.
    #[must_use]
    pub const fn is_air(self) -> bool {
        self.0 == Self::AIR.0
    }
}

/// The vertical extent of every tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileHeight {
    /// The lowest section y.
    pub min_section: i32,
    /// Number of sections.
    pub section_count: u32,
}

impl Default for TileHeight {
    fn default() -> Self {
        Self {
            min_section: -4,
            section_count: 24,
        }
    }
}

impl TileHeight {
    /// The highest section y, inclusive.
    #[must_use]
    pub const fn max_section(&self) -> i32 {
        self.min_section + self.section_count as i32 - 1
    }

    /// Index of section `y` inside a tile, `None` if out of range.
    #[must_use]
    pub fn section_index(&self, y: i32) -> Option<usize> {
        let index = y.checked_sub(self.min_section)?;
        (index >= 0 && index < self.section_count as i32).then_some(index as usize)
    }

    /// The lowest block y.
    #[must_use]
    pub const fn min_y(&self) -> i32 {
        self.min_section * 16
    }
}

/// Block states of one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// Every block is the same.
    Uniform(BlockState),
    /// One state per block, indexed by [`BlockPos::section_relative`].
    Mixed(Box<[BlockState]>),
}

impl Default for Section {
    fn default() -> Self {
        Self::Uniform(BlockState::AIR)
    }
}

impl Section {
    /// The state at a section-relative index.
    #[must_use]
    pub fn get(&self, index: u16) -> BlockState {
        match self {
            Self::Uniform(state) => *state,
            Self::Mixed(states) => states[usize::from(index)],
        }
    }

    /// Sets the state at a section-relative index and returns the previous one.
    pub fn set(&mut self, index: u16, state: BlockState) -> BlockState {
        match self {
            Self::Uniform(current) if *current == state => state,
            Self::Uniform(current) => {
                let previous = *current;
                let mut states = vec![previous; SECTION_VOLUME].into_boxed_slice();
                states[usize::from(index)] = state;
                *self = Self::Mixed(states);
                previous
            }
            Self::Mixed(states) => std::mem::replace(&mut states[usize::from(index)], state),
        }
    }

    /// Fills the whole section with one state.
    pub fn fill(&mut self, state: BlockState) {
        *self = Self::Uniform(state);
    }

    /// Returns true if the section only holds air.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Uniform(state) => state.is_air(),
            Self::Mixed(states) => states.iter().all(|s| s.is_air()),
        }
    }

    /// The strongest light emitted inside the section.
    #[must_use]
    pub fn max_emission(&self) -> u8 {
        match self {
            Self::Uniform(state) => state.light_emission(),
            Self::Mixed(states) => states
                .iter()
                .map(|s| s.light_emission())
                .max()
                .unwrap_or(0),
        }
    }

    /// Returns true if any block in the section stops sky light.
    #[must_use]
    pub fn blocks_sky(&self) -> bool {
        match self {
            Self::Uniform(state) => state.is_opaque(),
            Self::Mixed(states) => states.iter().any(|s| s.is_opaque()),
        }
    }

    fn to_raw(&self) -> RawSection {
        match self {
            Self::Uniform(state) => RawSection {
                palette: vec![state.0],
                indices: Vec::new(),
            },
            Self::Mixed(states) => {
                let mut palette = Vec::new();
                let mut lookup = FxHashMap::default();
                let indices = states
                    .iter()
                    .map(|state| {
                        *lookup.entry(state.0).or_insert_with(|| {
                            palette.push(state.0);
                            (palette.len() - 1) as u16
                        })
                    })
                    .collect();
                RawSection { palette, indices }
            }
        }
    }

    fn from_raw(raw: &RawSection) -> io::Result<Self> {
        match (raw.palette.as_slice(), raw.indices.len()) {
            ([single], 0) => Ok(Self::Uniform(BlockState(*single))),
            (palette, SECTION_VOLUME) if !palette.is_empty() => raw
                .indices
                .iter()
                .map(|&index| {
                    palette
                        .get(usize::from(index))
                        .map(|&id| BlockState(id))
                        .ok_or_else(|| invalid_data(format!("palette index {index} out of range")))
                })
                .collect::<io::Result<Box<[_]>>>()
                .map(Self::Mixed),
            (palette, len) => Err(invalid_data(format!(
                "section with {} palette entries and {len} indices",
                palette.len()
            ))),
        }
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// A scheduled block tick as stored with a packed tile: relative to the tick it was packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTick {
    /// The ticked block.
    pub pos: BlockPos,
    /// Ticks left when the tile was packed.
    pub delay: u32,
}

/// A scheduled block tick of a ticking tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTick {
    /// The ticked block.
    pub pos: BlockPos,
    /// The absolute tick the block fires on.
    pub trigger_tick: u64,
}

/// A serialized section: a palette and, for mixed sections, one palette index per block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSection {
    /// Distinct state ids.
    pub palette: Vec<u16>,
    /// Palette indices, empty when the palette has a single entry.
    pub indices: Vec<u16>,
}

/// A snapshot handed to persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTileRecord {
    /// The tile.
    pub pos: TilePos,
    /// The stage the tile had reached.
    pub status: TileStatus,
    /// Sections from the bottom up.
    pub sections: Vec<RawSection>,
    /// Whether light was fully computed.
    pub light_correct: bool,
    /// Scheduled block ticks.
    pub ticks: Vec<SavedTick>,
}

/// The content of one tile.
#[derive(Debug)]
pub struct TileData {
    pos: TilePos,
    height: TileHeight,
    status: AtomicU8,
    sections: SyncRwLock<Box<[Section]>>,
    unsaved: AtomicBool,
    light_correct: AtomicBool,
    saved_ticks: SyncMutex<Vec<SavedTick>>,
    active_ticks: SyncMutex<Vec<ActiveTick>>,
}

impl TileData {
    /// Allocates an all-air tile at the `Empty` stage.
    #[must_use]
    pub fn new_empty(pos: TilePos, height: TileHeight) -> Self {
        let sections = (0..height.section_count)
            .map(|_| Section::default())
            .collect();
        Self {
            pos,
            height,
            status: AtomicU8::new(TileStatus::Empty.index() as u8),
            sections: SyncRwLock::new(sections),
            unsaved: AtomicBool::new(true),
            light_correct: AtomicBool::new(false),
            saved_ticks: SyncMutex::new(Vec::new()),
            active_ticks: SyncMutex::new(Vec::new()),
        }
    }

    /// Rebuilds a tile from a stored record.
    pub fn from_record(record: &RawTileRecord, height: TileHeight) -> io::Result<Self> {
        if record.sections.len() != height.section_count as usize {
            return Err(invalid_data(format!(
                "tile {} has {} sections, expected {}",
                record.pos,
                record.sections.len(),
                height.section_count
            )));
        }
        let sections = record
            .sections
            .iter()
            .map(Section::from_raw)
            .collect::<io::Result<Box<[_]>>>()?;
        Ok(Self {
            pos: record.pos,
            height,
            status: AtomicU8::new(record.status.index() as u8),
            sections: SyncRwLock::new(sections),
            unsaved: AtomicBool::new(false),
            light_correct: AtomicBool::new(record.light_correct),
            saved_ticks: SyncMutex::new(record.ticks.clone()),
            active_ticks: SyncMutex::new(Vec::new()),
        })
    }

    /// Snapshots the tile for persistence. Active ticks are stored relative to `current_tick`.
    #[must_use]
    pub fn to_record(&self, current_tick: u64) -> RawTileRecord {
        let mut ticks = self.saved_ticks.lock().clone();
        ticks.extend(self.active_ticks.lock().iter().map(|tick| SavedTick {
            pos: tick.pos,
            delay: tick.trigger_tick.saturating_sub(current_tick) as u32,
        }));
        RawTileRecord {
            pos: self.pos,
            status: self.status(),
            sections: self.sections.read().iter().map(Section::to_raw).collect(),
            light_correct: self.is_light_correct(),
            ticks,
        }
    }

    /// The tile position.
    #[must_use]
    pub const fn pos(&self) -> TilePos {
        self.pos
    }

    /// The vertical extent.
    #[must_use]
    pub const fn height(&self) -> TileHeight {
        self.height
    }

    /// The stage the tile has reached.
    #[must_use]
    pub fn status(&self) -> TileStatus {
        TileStatus::from_index(usize::from(self.status.load(Ordering::Acquire)))
            .unwrap_or(TileStatus::Empty)
    }

    /// Records that the tile reached `status`. Never moves the status backwards.
    pub fn advance_status(&self, status: TileStatus) {
        self.status
            .fetch_max(status.index() as u8, Ordering::AcqRel);
    }

    /// The block at `pos`, air outside the tile's height.
    #[must_use]
    pub fn block(&self, pos: BlockPos) -> BlockState {
        debug_assert_eq!(pos.tile(), self.pos, "{pos} is not in tile {}", self.pos);
        self.height
            .section_index(pos.y >> 4)
            .map_or(BlockState::AIR, |index| {
                self.sections.read()[index].get(pos.section_relative())
            })
    }

    /// Sets the block at `pos` and returns the previous state, `None` outside the tile's
    /// height or if nothing changed.
    pub fn set_block(&self, pos: BlockPos, state: BlockState) -> Option<BlockState> {
        debug_assert_eq!(pos.tile(), self.pos, "{pos} is not in tile {}", self.pos);
        let index = self.height.section_index(pos.y >> 4)?;
        let previous = self.sections.write()[index].set(pos.section_relative(), state);
        if previous == state {
            return None;
        }
        self.unsaved.store(true, Ordering::Release);
        Some(previous)
    }

    /// Runs `f` with shared access to the sections.
    pub fn with_sections<R>(&self, f: impl FnOnce(&[Section]) -> R) -> R {
        f(&self.sections.read())
    }

    /// Runs `f` with exclusive access to the sections and marks the tile unsaved.
    pub fn with_sections_mut<R>(&self, f: impl FnOnce(&mut [Section]) -> R) -> R {
        let result = f(&mut self.sections.write());
        self.unsaved.store(true, Ordering::Release);
        result
    }

    /// Positions of every section of this tile, bottom up.
    pub fn section_positions(&self) -> impl Iterator<Item = SectionPos> + '_ {
        (self.height.min_section..=self.height.max_section()).map(|y| SectionPos::of(self.pos, y))
    }

    /// Returns true if the tile changed since it was last saved.
    #[must_use]
    pub fn is_unsaved(&self) -> bool {
        self.unsaved.load(Ordering::Acquire)
    }

    /// Clears the unsaved flag, returning its previous value.
    pub fn take_unsaved(&self) -> bool {
        self.unsaved.swap(false, Ordering::AcqRel)
    }

    /// Marks the tile as changed.
    pub fn mark_unsaved(&self) {
        self.unsaved.store(true, Ordering::Release);
    }

    /// Returns true once light was fully computed.
    #[must_use]
    pub fn is_light_correct(&self) -> bool {
        self.light_correct.load(Ordering::Acquire)
    }

    /// Records whether light is fully computed.
    pub fn set_light_correct(&self, correct: bool) {
        if self.light_correct.swap(correct, Ordering::AcqRel) != correct {
            self.mark_unsaved();
        }
    }

    /// Schedules a block tick `delay` ticks after the tile becomes ticking.
    pub fn schedule_tick(&self, pos: BlockPos, delay: u32) {
        self.saved_ticks.lock().push(SavedTick { pos, delay });
        self.mark_unsaved();
    }

    /// Moves packed ticks to the active list, relative to `current_tick`. Returns how many
    /// were unpacked.
    pub fn unpack_ticks(&self, current_tick: u64) -> usize {
        let saved = std::mem::take(&mut *self.saved_ticks.lock());
        let count = saved.len();
        self.active_ticks
            .lock()
            .extend(saved.into_iter().map(|tick| ActiveTick {
                pos: tick.pos,
                trigger_tick: current_tick + u64::from(tick.delay),
            }));
        count
    }

    /// Packs active ticks back, relative to `current_tick`.
    pub fn pack_ticks(&self, current_tick: u64) {
        let active = std::mem::take(&mut *self.active_ticks.lock());
        self.saved_ticks
            .lock()
            .extend(active.into_iter().map(|tick| SavedTick {
                pos: tick.pos,
                delay: tick.trigger_tick.saturating_sub(current_tick) as u32,
            }));
    }

    /// Number of active ticks.
    #[must_use]
    pub fn active_tick_count(&self) -> usize {
        self.active_ticks.lock().len()
    }

    /// Number of packed ticks.
    #[must_use]
    pub fn saved_tick_count(&self) -> usize {
        self.saved_ticks.lock().len()
    }
}
