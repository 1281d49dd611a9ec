//! # Tessera
//!
//! Runs the tile scheduler on its own: loads the config, primes the spawn area and ticks the
//! map at a fixed rate until cancelled.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use tessera_core::{
    SchedulerConfig, TickContext, TileFailure, TileMap, debug_dump, storage::RamOnlyStorage,
    tile::FlatTileGenerator,
};
use tessera_utils::TilePos;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub mod logger;

/// Ticks per second of the main loop.
pub const TICKS_PER_SECOND: u64 = 20;
/// Length of one tick.
pub const TICK_DURATION: Duration = Duration::from_millis(1000 / TICKS_PER_SECOND);
/// Share of a tick optional work like autosaving may use.
const TICK_BUDGET: Duration = Duration::from_millis(30);

/// The scheduler and its main loop.
pub struct TesseraServer {
    /// Cancelled to stop the main loop.
    pub cancel_token: CancellationToken,
    /// The tile map being driven.
    pub map: Arc<TileMap>,
    current_tick: u64,
}

impl TesseraServer {
    /// Creates the map with in-memory storage and the flat generator.
    #[must_use]
    pub fn new(config: SchedulerConfig, runtime: Handle) -> Self {
        log::info!("Starting Tessera");
        let storage = Arc::new(RamOnlyStorage::preloaded());
        let listener = Arc::new(logger::LoggingListener);
        let map = TileMap::new(
            config,
            runtime,
            storage,
            Arc::new(FlatTileGenerator::default()),
            listener.clone(),
            listener,
        );
        Self {
            cancel_token: CancellationToken::new(),
            map,
            current_tick: 0,
        }
    }

    /// Loads the spawn area around `center` before the first tick.
    pub fn prime_spawn(&self, center: TilePos) {
        let start = Instant::now();
        let ready = self.map.prime_spawn(center);
        log::info!(
            "Prepared {ready} spawn tiles in {:.2}s",
            start.elapsed().as_secs_f64()
        );
    }

    /// Ticks the map until cancelled. Returns an error if generation failed; a crash report
    /// is written to `crash_dir` first.
    pub fn run(&mut self, crash_dir: &Path) -> anyhow::Result<()> {
        log::info!("Running at {TICKS_PER_SECOND} ticks per second");
        while !self.cancel_token.is_cancelled() {
            let start = Instant::now();
            self.current_tick += 1;
            self.map
                .tick(&TickContext::new(self.current_tick, TICK_BUDGET));

            if let Some(failure) = self.map.take_fatal_error() {
                let report = self.write_crash_report(crash_dir, failure)?;
                anyhow::bail!("{failure}, crash report written to {}", report.display());
            }

            let elapsed = start.elapsed();
            if elapsed > TICK_DURATION {
                log::debug!(
                    "Tick {} took {}ms",
                    self.current_tick,
                    elapsed.as_millis()
                );
            } else {
                thread::sleep(TICK_DURATION - elapsed);
            }
        }
        Ok(())
    }

    fn write_crash_report(&self, dir: &Path, failure: TileFailure) -> anyhow::Result<PathBuf> {
        let dir = dir.join(format!("crash-tick-{}", self.current_tick));
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating crash report directory {}", dir.display()))?;
        let summary = format!(
            "Tessera crashed at tick {}\n\n{failure}\nfailing tile: {}\nloaded tiles: {}\npending unloads: {}\n",
            self.current_tick,
            failure.pos(),
            self.map.loaded_tile_count(),
            self.map.pending_unload_count(),
        );
        fs::write(dir.join("report.txt"), summary).context("writing crash report")?;
        self.dump_debug(&dir)?;
        log::error!("Generation failed: {failure}");
        Ok(dir)
    }

    /// Writes the ticket and tile dumps into `dir`.
    pub fn dump_debug(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        debug_dump::dump_tickets(&self.map, &dir.join("tickets.tsv"))
            .context("dumping tickets")?;
        debug_dump::dump_tiles(&self.map, &dir.join("tiles.csv")).context("dumping tiles")?;
        Ok(())
    }

    /// Saves everything and stops the background actors.
    pub fn shutdown(&self) {
        log::info!("Stopping Tessera after {} ticks", self.current_tick);
        self.map.shutdown();
    }
}
