//! Tiles: their content, their pipeline and the per-tile state machine.

pub mod full_status;
pub mod generator;
pub mod holder;
pub mod status;
pub mod status_tasks;
pub mod tile_data;

pub use full_status::{FullStatus, LevelThresholds};
pub use generator::{FlatTileGenerator, TileGenerator, TileRegion};
pub use holder::{HolderHost, TileChanges, TileFuture, TileHolder, TileResult};
pub use status::TileStatus;
pub use status_tasks::{StageWork, StatusTasks, WorldGenContext};
pub use tile_data::{BlockState, RawTileRecord, Section, TileData, TileHeight};
