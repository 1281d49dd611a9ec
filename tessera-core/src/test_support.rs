//! Shared helpers for unit tests.

use std::sync::Arc;

use tessera_utils::{BitSet, SectionPos, TilePos};
use tokio::runtime::{Builder, Runtime};
use uuid::Uuid;

use crate::{
    tile::{FullStatus, TileData},
    tile_map::{FullStatusListener, ViewerListener},
};

/// A small multi-threaded runtime for the background actors.
pub fn runtime() -> Runtime {
    Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("test runtime")
}

/// Ignores every callback.
pub struct NullListener;

impl ViewerListener for NullListener {
    fn send_tile(&self, _viewer: Uuid, _tile: &Arc<TileData>) {}

    fn forget_tile(&self, _viewer: Uuid, _pos: TilePos) {}

    fn send_block_changes(&self, _viewer: Uuid, _pos: TilePos, _changes: &[(SectionPos, Vec<u16>)]) {}

    fn send_light_changes(&self, _viewer: Uuid, _pos: TilePos, _sky: &BitSet, _block: &BitSet) {}
}

impl FullStatusListener for NullListener {
    fn on_full_status_change(&self, _pos: TilePos, _status: FullStatus) {}
}
