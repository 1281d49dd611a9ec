//! Who is looking at which tile.

pub mod area_map;

pub use area_map::ViewerAreaMap;
