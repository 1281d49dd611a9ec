//! Scheduler configuration, read from a json5 file.

use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    level::{TicketTimeouts, distance_manager::MAX_VIEW_DISTANCE},
    light::threaded::{DEFAULT_TASKS_PER_BATCH, PRIMING_TASKS_PER_BATCH},
    tile::{LevelThresholds, TileHeight},
};

const DEFAULT_CONFIG: &str = include_str!("../../package-content/tessera_config.json5");

/// Why a configuration could not be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("config file {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The file is not valid json5 for this schema.
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json5::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Light engine batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    /// Closures buffered before a batch runs.
    pub tasks_per_batch: usize,
    /// Batch size while the spawn area is primed.
    pub priming_tasks_per_batch: usize,
    /// Graph steps per propagation call.
    pub propagation_budget: usize,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            tasks_per_batch: DEFAULT_TASKS_PER_BATCH,
            priming_tasks_per_batch: PRIMING_TASKS_PER_BATCH,
            propagation_budget: 10_000,
        }
    }
}

/// Periodic saving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Tiles saved per tick at most.
    pub saves_per_tick: usize,
    /// Ticks a tile waits after a save before it is saved again.
    pub save_cooldown_ticks: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            saves_per_tick: 20,
            save_cooldown_ticks: 200,
        }
    }
}

/// Every tuning knob of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// View distance in tiles.
    pub view_distance: u8,
    /// Simulation distance in tiles.
    pub simulation_distance: u8,
    /// Level thresholds of the accessibility states.
    pub thresholds: LevelThresholds,
    /// Vertical extent of tiles.
    pub height: TileHeight,
    /// Light batching.
    pub light: LightConfig,
    /// Holders finalized per tick.
    pub unloads_per_tick: usize,
    /// Periodic saving.
    pub autosave: AutosaveConfig,
    /// Ticket timeout overrides.
    pub ticket_timeouts: TicketTimeouts,
    /// Worker threads, `0` for one per core.
    pub worker_threads: usize,
    /// Radius of the spawn area.
    pub spawn_radius: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            view_distance: 10,
            simulation_distance: 10,
            thresholds: LevelThresholds::default(),
            height: TileHeight::default(),
            light: LightConfig::default(),
            unloads_per_tick: 200,
            autosave: AutosaveConfig::default(),
            ticket_timeouts: TicketTimeouts::default(),
            worker_threads: 0,
            spawn_radius: 3,
        }
    }
}

impl SchedulerConfig {
    /// Reads the config at `path`, writing the default file first if there is none.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        let text = if path.exists() {
            fs::read_to_string(path).map_err(io_error)?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
            fs::write(path, DEFAULT_CONFIG).map_err(io_error)?;
            log::info!("Wrote default config to {}", path.display());
            DEFAULT_CONFIG.to_owned()
        };

        Self::parse(&text)
    }

    /// Parses and validates a json5 document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json5::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(3..=MAX_VIEW_DISTANCE).contains(&self.view_distance) {
            return Err(ConfigError::Invalid("view distance must be in range 3..=33"));
        }
        if !(2..=32).contains(&self.simulation_distance) {
            return Err(ConfigError::Invalid("simulation distance must be in range 2..=32"));
        }
        if !self.thresholds.is_valid() {
            return Err(ConfigError::Invalid(
                "thresholds must satisfy border > ticking > entity_ticking",
            ));
        }
        if self.simulation_distance > self.thresholds.entity_ticking {
            return Err(ConfigError::Invalid(
                "simulation distance cannot exceed the entity ticking level",
            ));
        }
        if self.spawn_radius > self.thresholds.border {
            return Err(ConfigError::Invalid("spawn radius cannot exceed the border level"));
        }
        if self.height.section_count == 0 {
            return Err(ConfigError::Invalid("tiles need at least one section"));
        }
        if self.light.tasks_per_batch == 0
            || self.light.priming_tasks_per_batch == 0
            || self.light.propagation_budget == 0
        {
            return Err(ConfigError::Invalid("light batch sizes and budget must be positive"));
        }
        if self.unloads_per_tick == 0 {
            return Err(ConfigError::Invalid("unloads per tick must be positive"));
        }
        Ok(())
    }

    /// Worker threads to start, resolving `0` to the number of cores.
    #[must_use]
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        thread::available_parallelism().map_or(4, usize::from)
    }
}
