//! Utilities for converting between ticket levels, pipeline stages and accessibility.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::status::TileStatus;

/// Coarse accessibility of a fully generated tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullStatus {
    /// Not usable by the simulation.
    Inaccessible,
    /// Readable, but not simulated.
    Border,
    /// Blocks and fluids tick.
    Ticking,
    /// Entities tick as well.
    EntityTicking,
}

impl FullStatus {
    /// Every status, lowest first.
    pub const ALL: [Self; 4] = [
        Self::Inaccessible,
        Self::Border,
        Self::Ticking,
        Self::EntityTicking,
    ];

    /// The name used in logs and dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Inaccessible => "inaccessible",
            Self::Border => "border",
            Self::Ticking => "ticking",
            Self::EntityTicking => "entity_ticking",
        }
    }

    /// Returns true if this status is at least `other`.
    #[must_use]
    pub fn is_or_after(self, other: Self) -> bool {
        self >= other
    }
}

impl fmt::Display for FullStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The ticket levels at which a tile becomes border, ticking and entity ticking.
///
/// Only the ordering `border > ticking > entity_ticking` matters to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelThresholds {
    /// Levels at or below this require a `Full` tile.
    pub border: u8,
    /// Levels at or below this tick blocks.
    pub ticking: u8,
    /// Levels at or below this tick entities.
    pub entity_ticking: u8,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            border: 33,
            ticking: 32,
            entity_ticking: 31,
        }
    }
}

impl LevelThresholds {
    /// Returns true if the thresholds are strictly ordered and leave room for the pipeline.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.border > self.ticking
            && self.ticking > self.entity_ticking
            && u16::from(self.border) + u16::from(TileStatus::max_distance()) + 2 <= u16::from(u8::MAX)
    }

    /// The highest level that still keeps a tile in memory.
    #[must_use]
    pub const fn max_level(&self) -> u8 {
        self.border + TileStatus::max_distance()
    }

    /// The level of a tile no ticket reaches.
    #[must_use]
    pub const fn absent_level(&self) -> u8 {
        self.max_level() + 1
    }

    /// Number of levels the ticket graph distinguishes, absent included.
    #[must_use]
    pub const fn level_count(&self) -> u8 {
        self.max_level() + 2
    }

    /// Returns true if `level` keeps a tile in memory.
    #[must_use]
    pub const fn is_loaded(&self, level: u8) -> bool {
        level <= self.max_level()
    }

    /// The pipeline stage a tile at `level` must reach, `None` if it should not be loaded.
    #[must_use]
    pub const fn generation_status(&self, level: u8) -> Option<TileStatus> {
        if level <= self.border {
            Some(TileStatus::Full)
        } else if level <= self.max_level() {
            Some(TileStatus::status_around_full(level - self.border))
        } else {
            None
        }
    }

    /// The accessibility a tile at `level` is entitled to once generated.
    #[must_use]
    pub const fn full_status(&self, level: u8) -> FullStatus {
        if level <= self.entity_ticking {
            FullStatus::EntityTicking
        } else if level <= self.ticking {
            FullStatus::Ticking
        } else if level <= self.border {
            FullStatus::Border
        } else {
            FullStatus::Inaccessible
        }
    }

    /// The highest level still granting `status`.
    #[must_use]
    pub const fn level_for(&self, status: FullStatus) -> u8 {
        match status {
            FullStatus::EntityTicking => self.entity_ticking,
            FullStatus::Ticking => self.ticking,
            FullStatus::Border => self.border,
            FullStatus::Inaccessible => self.absent_level(),
        }
    }

    /// The level at which `status` is the most advanced required stage.
    #[must_use]
    pub const fn level_for_status(&self, status: TileStatus) -> u8 {
        self.border + status.distance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_levels() {
        let thresholds = LevelThresholds::default();
        assert!(thresholds.is_valid());
        assert_eq!(thresholds.max_level(), 38);
        assert_eq!(thresholds.generation_status(0), Some(TileStatus::Full));
        assert_eq!(thresholds.generation_status(33), Some(TileStatus::Full));
        assert_eq!(thresholds.generation_status(34), Some(TileStatus::InitializeLight));
        assert_eq!(thresholds.generation_status(36), Some(TileStatus::Biomes));
        assert_eq!(thresholds.generation_status(38), Some(TileStatus::StructureStarts));
        assert_eq!(thresholds.generation_status(39), None);

        assert_eq!(thresholds.full_status(31), FullStatus::EntityTicking);
        assert_eq!(thresholds.full_status(32), FullStatus::Ticking);
        assert_eq!(thresholds.full_status(33), FullStatus::Border);
        assert_eq!(thresholds.full_status(36), FullStatus::Inaccessible);
        assert_eq!(thresholds.level_for_status(TileStatus::Light), 33);
    }

    #[test]
    fn ordering_is_validated() {
        let mut thresholds = LevelThresholds {
            border: 40,
            ticking: 35,
            entity_ticking: 10,
        };
        assert!(thresholds.is_valid());
        thresholds.ticking = 40;
        assert!(!thresholds.is_valid());
        thresholds = LevelThresholds {
            border: 250,
            ticking: 2,
            entity_ticking: 1,
        };
        assert!(!thresholds.is_valid());
    }
}
