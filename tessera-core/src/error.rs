//! Failures carried through tile futures.

use tessera_utils::TilePos;
use thiserror::Error;

use crate::tile::TileStatus;

/// Why a tile future did not produce a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TileFailure {
    /// The tile, or a tile it depends on, is no longer resident at the required stage.
    #[error("tile {0} is not loaded")]
    Unloaded(TilePos),
    /// The generator failed. Sticky: the stage is never retried.
    #[error("generation of tile {pos} failed at stage {status}")]
    Generation {
        /// The tile that failed.
        pos: TilePos,
        /// The stage that failed.
        status: TileStatus,
    },
    /// The tile lost the accessibility the future was waiting for.
    #[error("tile {0} is no longer accessible")]
    NotAccessible(TilePos),
}

impl TileFailure {
    /// The tile the failure originated at.
    #[must_use]
    pub const fn pos(&self) -> TilePos {
        match self {
            Self::Unloaded(pos) | Self::NotAccessible(pos) | Self::Generation { pos, .. } => *pos,
        }
    }

    /// Returns true if retrying cannot help.
    #[must_use]
    pub const fn is_sticky(&self) -> bool {
        matches!(self, Self::Generation { .. })
    }
}
