//! Shared fixtures for the tile map scenarios.

#![allow(dead_code)]

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;
use tessera_core::{
    FullStatusListener, SchedulerConfig, TickContext, TileMap, ViewerListener,
    storage::{RamOnlyStorage, TileStorage},
    tile::{
        FlatTileGenerator, FullStatus, RawTileRecord, TileData, TileGenerator, TileRegion,
        TileStatus,
    },
};
use tessera_utils::{BitSet, SectionPos, TilePos, locks::SyncMutex};
use tokio::runtime::{Builder, Runtime};
use uuid::Uuid;

/// Records every listener callback.
#[derive(Default)]
pub struct Recorder {
    pub statuses: SyncMutex<FxHashMap<TilePos, FullStatus>>,
    pub sent: SyncMutex<Vec<(Uuid, TilePos)>>,
    pub forgotten: SyncMutex<Vec<(Uuid, TilePos)>>,
    pub block_changes: SyncMutex<Vec<(Uuid, TilePos, usize)>>,
}

impl ViewerListener for Recorder {
    fn send_tile(&self, viewer: Uuid, tile: &Arc<TileData>) {
        self.sent.lock().push((viewer, tile.pos()));
    }

    fn forget_tile(&self, viewer: Uuid, pos: TilePos) {
        self.forgotten.lock().push((viewer, pos));
    }

    fn send_block_changes(&self, viewer: Uuid, pos: TilePos, changes: &[(SectionPos, Vec<u16>)]) {
        let count = changes.iter().map(|(_, blocks)| blocks.len()).sum();
        self.block_changes.lock().push((viewer, pos, count));
    }

    fn send_light_changes(&self, _viewer: Uuid, _pos: TilePos, _sky: &BitSet, _block: &BitSet) {}
}

impl FullStatusListener for Recorder {
    fn on_full_status_change(&self, pos: TilePos, status: FullStatus) {
        self.statuses.lock().insert(pos, status);
    }
}

/// Wraps the flat generator and records the order stages ran in.
pub struct RecordingGenerator {
    inner: FlatTileGenerator,
    pub runs: SyncMutex<Vec<(TilePos, TileStatus)>>,
    pub fail_at: Option<(TilePos, TileStatus)>,
}

impl RecordingGenerator {
    pub fn new() -> Self {
        Self {
            inner: FlatTileGenerator::default(),
            runs: SyncMutex::new(Vec::new()),
            fail_at: None,
        }
    }

    pub fn failing_at(pos: TilePos, status: TileStatus) -> Self {
        Self {
            fail_at: Some((pos, status)),
            ..Self::new()
        }
    }
}

impl TileGenerator for RecordingGenerator {
    fn name(&self) -> &str {
        "recording"
    }

    fn generate(&self, status: TileStatus, tile: &TileData, region: &TileRegion) -> anyhow::Result<()> {
        if self.fail_at == Some((tile.pos(), status)) {
            anyhow::bail!("refusing to generate {status} at {}", tile.pos());
        }
        self.runs.lock().push((tile.pos(), status));
        self.inner.generate(status, tile, region)
    }
}

/// Sleeps for `delay` in one stage of one tile, flat otherwise.
pub struct SlowGenerator {
    inner: FlatTileGenerator,
    at: (TilePos, TileStatus),
    delay: Duration,
    started: AtomicBool,
    finished: AtomicBool,
}

impl SlowGenerator {
    pub fn new(pos: TilePos, status: TileStatus, delay: Duration) -> Self {
        Self {
            inner: FlatTileGenerator::default(),
            at: (pos, status),
            delay,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl TileGenerator for SlowGenerator {
    fn name(&self) -> &str {
        "slow"
    }

    fn generate(&self, status: TileStatus, tile: &TileData, region: &TileRegion) -> anyhow::Result<()> {
        if self.at != (tile.pos(), status) {
            return self.inner.generate(status, tile, region);
        }
        self.started.store(true, Ordering::Release);
        thread::sleep(self.delay);
        let result = self.inner.generate(status, tile, region);
        self.finished.store(true, Ordering::Release);
        result
    }
}

/// Delays every save by a fixed time.
pub struct SlowStorage {
    pub inner: RamOnlyStorage,
    delay: Duration,
}

impl SlowStorage {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: RamOnlyStorage::preloaded(),
            delay,
        }
    }
}

impl TileStorage for SlowStorage {
    fn load(&self, pos: TilePos) -> io::Result<Option<RawTileRecord>> {
        self.inner.load(pos)
    }

    fn save(&self, pos: TilePos, record: RawTileRecord) -> io::Result<bool> {
        thread::sleep(self.delay);
        self.inner.save(pos, record)
    }
}

pub struct Harness {
    pub map: Arc<TileMap>,
    pub runtime: Runtime,
    pub recorder: Arc<Recorder>,
    pub tick: u64,
}

impl Harness {
    pub fn new(
        config: SchedulerConfig,
        storage: Arc<dyn TileStorage>,
        generator: Arc<dyn TileGenerator>,
    ) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("test runtime");
        let recorder = Arc::new(Recorder::default());
        let map = TileMap::new(
            config,
            runtime.handle().clone(),
            storage,
            generator,
            recorder.clone(),
            recorder.clone(),
        );
        Self {
            map,
            runtime,
            recorder,
            tick: 0,
        }
    }

    pub fn tick(&mut self) {
        self.tick += 1;
        self.map
            .tick(&TickContext::new(self.tick, Duration::from_millis(50)));
    }

    /// Ticks until `condition` holds. Returns false after 30 seconds.
    pub fn tick_until(&mut self, mut condition: impl FnMut(&TileMap) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(30);
        while Instant::now() < deadline {
            self.tick();
            if condition(&self.map) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    pub fn full_status(&self, pos: TilePos) -> FullStatus {
        self.map.full_status(pos)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.map.shutdown();
    }
}
