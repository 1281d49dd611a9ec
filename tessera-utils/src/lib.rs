//! # Tessera Utils
//!
//! Value types and small helpers shared by every tessera crate.

pub mod bit_set;
pub mod locks;
pub mod types;

pub use bit_set::BitSet;
pub use types::{BlockPos, SectionPos, TilePos};
