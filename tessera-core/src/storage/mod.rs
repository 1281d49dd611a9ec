//! Tile persistence.
//!
//! The scheduler only needs two blocking calls: load a record and save a record. Both run
//! on the io actor.

use std::io;

use scc::HashMap;
use tessera_utils::TilePos;

use crate::tile::{RawTileRecord, TileStatus};

pub mod ram_only;

pub use ram_only::RamOnlyStorage;

/// A tile storage backend.
pub trait TileStorage: Send + Sync {
    /// Loads the record for `pos`. `Ok(None)` if nothing was ever saved there.
    fn load(&self, pos: TilePos) -> io::Result<Option<RawTileRecord>>;

    /// Saves a record. Returns `Ok(false)` if the backend decided there was nothing to do.
    fn save(&self, pos: TilePos, record: RawTileRecord) -> io::Result<bool>;
}

/// What storage is known to hold for a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileType {
    /// A fully generated tile.
    Full,
    /// A tile saved part way through generation.
    Partial,
    /// Nothing.
    Absent,
}

impl TileType {
    /// The type of a record saved at `status`.
    #[must_use]
    pub fn of_status(status: TileStatus) -> Self {
        if status == TileStatus::Full {
            Self::Full
        } else {
            Self::Partial
        }
    }
}

/// Remembers what storage holds per tile so repeated loads of absent tiles skip the backend.
///
/// Entries may be stale; a stale `Absent` is corrected by the next save.
#[derive(Default)]
pub struct TileTypeCache {
    types: HashMap<i64, TileType>,
}

impl TileTypeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached type, if known.
    #[must_use]
    pub fn get(&self, pos: TilePos) -> Option<TileType> {
        self.types.read_sync(&pos.key(), |_, tile_type| *tile_type)
    }

    /// Records what storage holds for `pos`.
    pub fn set(&self, pos: TilePos, tile_type: TileType) {
        let key = pos.key();
        if self
            .types
            .update_sync(&key, |_, cached| *cached = tile_type)
            .is_none()
        {
            let _ = self.types.insert_sync(key, tile_type);
        }
    }

    /// Forgets everything known about `pos`.
    pub fn invalidate(&self, pos: TilePos) {
        let _ = self.types.remove_sync(&pos.key());
    }

    /// Number of cached tiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
