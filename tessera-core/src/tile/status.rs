//! Pipeline stages of a tile.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A stage of the generation pipeline, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    /// Loaded from storage or freshly allocated.
    Empty,
    /// Structure starts placed.
    StructureStarts,
    /// References to neighbouring structure starts collected.
    StructureReferences,
    /// Biomes sampled.
    Biomes,
    /// Base terrain filled.
    Noise,
    /// Surface layer applied.
    Surface,
    /// Caves carved.
    Carvers,
    /// Features decorated.
    Features,
    /// Light sources registered.
    InitializeLight,
    /// Light propagated.
    Light,
    /// Initial spawns placed.
    Spawn,
    /// Fully generated and promoted.
    Full,
}

impl TileStatus {
    /// Number of stages.
    pub const COUNT: usize = 12;

    /// Every stage, in pipeline order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Empty,
        Self::StructureStarts,
        Self::StructureReferences,
        Self::Biomes,
        Self::Noise,
        Self::Surface,
        Self::Carvers,
        Self::Features,
        Self::InitializeLight,
        Self::Light,
        Self::Spawn,
        Self::Full,
    ];

    /// Position in the pipeline.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The stage at `index`.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < Self::COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    /// The previous stage. `Empty` is its own parent.
    #[must_use]
    pub const fn parent(self) -> Self {
        match self.index() {
            0 => Self::Empty,
            index => Self::ALL[index - 1],
        }
    }

    /// The next stage, `None` after `Full`.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    /// Radius of neighbours that must sit at the parent stage before this stage can run.
    #[must_use]
    pub const fn range(self) -> u8 {
        match self {
            Self::StructureReferences => 2,
            Self::Noise | Self::Features | Self::Light => 1,
            _ => 0,
        }
    }

    /// How far from a `Full` tile this stage is still required.
    #[must_use]
    pub const fn distance(self) -> u8 {
        match self {
            Self::Full | Self::Spawn | Self::Light => 0,
            Self::InitializeLight | Self::Features => 1,
            Self::Carvers | Self::Surface | Self::Noise => 2,
            Self::Biomes | Self::StructureReferences => 3,
            Self::StructureStarts | Self::Empty => 5,
        }
    }

    /// The largest [`TileStatus::distance`].
    #[must_use]
    pub const fn max_distance() -> u8 {
        Self::Empty.distance()
    }

    /// The most advanced stage still required `distance` tiles away from a `Full` tile.
    #[must_use]
    pub const fn status_around_full(distance: u8) -> Self {
        match distance {
            0 => Self::Full,
            1 => Self::InitializeLight,
            2 => Self::Carvers,
            3 => Self::Biomes,
            _ => Self::StructureStarts,
        }
    }

    /// The name used in logs and dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::StructureStarts => "structure_starts",
            Self::StructureReferences => "structure_references",
            Self::Biomes => "biomes",
            Self::Noise => "noise",
            Self::Surface => "surface",
            Self::Carvers => "carvers",
            Self::Features => "features",
            Self::InitializeLight => "initialize_light",
            Self::Light => "light",
            Self::Spawn => "spawn",
            Self::Full => "full",
        }
    }

    /// Returns true if this stage is at least `other`.
    #[must_use]
    pub fn is_or_after(self, other: Self) -> bool {
        self >= other
    }
}

impl fmt::Display for TileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances_are_consistent_with_ranges() {
        // A stage at distance d needs its parent within its range, which must be needed at
        // least that much further out.
        for status in TileStatus::ALL.into_iter().skip(1) {
            let parent = status.parent();
            assert!(
                parent.distance() >= status.distance() + status.range(),
                "{parent} is not required far enough out for {status}"
            );
        }
    }

    #[test]
    fn status_around_full_inverts_distance() {
        for distance in 0..=TileStatus::max_distance() {
            let status = TileStatus::status_around_full(distance);
            assert!(status.distance() >= distance, "{status} at {distance}");
            if let Some(next) = status.next() {
                assert!(next.distance() < distance, "{next} is also needed at {distance}");
            }
        }
        assert_eq!(
            TileStatus::status_around_full(TileStatus::max_distance() + 3),
            TileStatus::StructureStarts
        );
    }

    #[test]
    fn index_round_trips() {
        for status in TileStatus::ALL {
            assert_eq!(TileStatus::from_index(status.index()), Some(status));
        }
        assert_eq!(TileStatus::from_index(TileStatus::COUNT), None);
        assert_eq!(TileStatus::Empty.parent(), TileStatus::Empty);
        assert_eq!(TileStatus::Full.next(), None);
    }
}
