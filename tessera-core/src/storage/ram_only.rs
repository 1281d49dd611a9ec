//! RAM-only tile storage.
//!
//! Keeps saved records in memory for the lifetime of the process. Useful for:
//! - tests
//! - throwaway worlds that never need to outlive the server

use std::{
    io,
    sync::atomic::{AtomicUsize, Ordering},
};

use scc::HashMap;
use tessera_utils::TilePos;

use super::TileStorage;
use crate::tile::{RawTileRecord, TileData, TileHeight, TileStatus};

/// In-memory tile storage.
pub struct RamOnlyStorage {
    records: HashMap<i64, RawTileRecord>,
    /// If set, misses load as all-air tiles that are already `Full` instead of `None`.
    empty_on_miss: Option<TileHeight>,
    saves: AtomicUsize,
}

impl RamOnlyStorage {
    /// Creates a storage whose misses load as all-air `Full` tiles, so nothing is generated.
    #[must_use]
    pub fn empty_world(height: TileHeight) -> Self {
        Self {
            records: HashMap::new(),
            empty_on_miss: Some(height),
            saves: AtomicUsize::new(0),
        }
    }

    /// Creates a storage that only returns previously saved records.
    #[must_use]
    pub fn preloaded() -> Self {
        Self {
            records: HashMap::new(),
            empty_on_miss: None,
            saves: AtomicUsize::new(0),
        }
    }

    fn empty_record(pos: TilePos, height: TileHeight) -> RawTileRecord {
        let tile = TileData::new_empty(pos, height);
        tile.advance_status(TileStatus::Full);
        tile.set_light_correct(true);
        tile.to_record(0)
    }

    /// Returns true if a record was saved for `pos`.
    #[must_use]
    pub fn contains(&self, pos: TilePos) -> bool {
        self.records.read_sync(&pos.key(), |_, _| ()).is_some()
    }

    /// The saved record for `pos`.
    #[must_use]
    pub fn record(&self, pos: TilePos) -> Option<RawTileRecord> {
        self.records.read_sync(&pos.key(), |_, record| record.clone())
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }
}

impl TileStorage for RamOnlyStorage {
    fn load(&self, pos: TilePos) -> io::Result<Option<RawTileRecord>> {
        if let Some(record) = self.record(pos) {
            return Ok(Some(record));
        }
        Ok(self
            .empty_on_miss
            .map(|height| Self::empty_record(pos, height)))
    }

    fn save(&self, pos: TilePos, record: RawTileRecord) -> io::Result<bool> {
        if record.pos != pos {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record for {} saved at {pos}", record.pos),
            ));
        }
        let key = pos.key();
        let mut record = Some(record);
        let _ = self.records.update_sync(&key, |_, stored| {
            if let Some(record) = record.take() {
                *stored = record;
            }
        });
        if let Some(record) = record {
            let _ = self.records.insert_sync(key, record);
        }
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }
}
