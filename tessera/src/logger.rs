//! Log output for the binary.

use std::sync::Arc;

use tessera_core::{
    FullStatusListener, ViewerListener,
    tile::{FullStatus, TileData},
};
use tessera_utils::{BitSet, SectionPos, TilePos};
use tracing::subscriber::set_global_default;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

/// Installs the fmt subscriber and routes `log` records into it.
///
/// Filtering follows `RUST_LOG`, `info` if unset.
pub fn init() -> anyhow::Result<()> {
    LogTracer::init()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_target(true).finish();
    set_global_default(subscriber)?;
    Ok(())
}

/// Logs what would be sent to viewers. The binary has no network layer.
pub struct LoggingListener;

impl ViewerListener for LoggingListener {
    fn send_tile(&self, viewer: Uuid, tile: &Arc<TileData>) {
        log::debug!("Sending tile {} to {viewer}", tile.pos());
    }

    fn forget_tile(&self, viewer: Uuid, pos: TilePos) {
        log::debug!("Forgetting tile {pos} for {viewer}");
    }

    fn send_block_changes(&self, viewer: Uuid, pos: TilePos, changes: &[(SectionPos, Vec<u16>)]) {
        let blocks: usize = changes.iter().map(|(_, blocks)| blocks.len()).sum();
        log::trace!("Sending {blocks} block changes in {pos} to {viewer}");
    }

    fn send_light_changes(&self, viewer: Uuid, pos: TilePos, sky: &BitSet, block: &BitSet) {
        log::trace!(
            "Sending light of {} sky and {} block sections in {pos} to {viewer}",
            sky.ones().count(),
            block.ones().count()
        );
    }
}

impl FullStatusListener for LoggingListener {
    fn on_full_status_change(&self, pos: TilePos, status: FullStatus) {
        log::trace!("Tile {pos} is now {status}");
    }
}
