//! Callbacks into the rest of the server.
//!
//! Both listeners are called from the main loop, some of them while the map's state is
//! locked. They must not call back into the [`TileMap`](super::TileMap).

use std::sync::Arc;

use tessera_utils::{BitSet, SectionPos, TilePos};
use uuid::Uuid;

use crate::tile::{FullStatus, TileData};

/// Delivers tiles and their changes to viewers.
pub trait ViewerListener: Send + Sync {
    /// A tile became visible to `viewer`.
    fn send_tile(&self, viewer: Uuid, tile: &Arc<TileData>);

    /// A tile previously sent to `viewer` is no longer available.
    fn forget_tile(&self, viewer: Uuid, pos: TilePos);

    /// Blocks changed, as section-relative indices per section.
    fn send_block_changes(&self, viewer: Uuid, pos: TilePos, changes: &[(SectionPos, Vec<u16>)]);

    /// Light changed in the marked light sections.
    fn send_light_changes(&self, viewer: Uuid, pos: TilePos, sky: &BitSet, block: &BitSet);
}

/// Observes accessibility changes, e.g. to register and unregister entities.
pub trait FullStatusListener: Send + Sync {
    /// `pos` was promoted or demoted to `status`.
    fn on_full_status_change(&self, pos: TilePos, status: FullStatus);
}
