//! # Tessera Core
//!
//! A scheduler that keeps square tiles of a 2D grid resident at the right stage of a
//! generation pipeline.
//!
//! Tickets pin tiles at a level; levels spread to neighbours through [`level`]'s distance
//! graph; every resident tile gets a [`tile::TileHolder`] that turns its level into stage
//! futures. Background work goes through the priority [`task::TaskSorter`] so the tiles
//! closest to a ticket run first. [`tile_map::TileMap`] ties it together once per tick.

pub mod config;
pub mod debug_dump;
pub mod error;
pub mod level;
pub mod light;
pub mod storage;
pub mod task;
pub mod tick;
pub mod tile;
pub mod tile_map;
pub mod world;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, SchedulerConfig};
pub use error::TileFailure;
pub use tick::TickContext;
pub use tile_map::{FullStatusListener, TileMap, ViewerListener};
