//! Coordinate types. Wrappers make it harder to mix up the underlying integers.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Side length of a tile (and of a section) in blocks.
pub const TILE_WIDTH: i32 = 16;

/// A tile position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TilePos {
    /// Tile x coordinate.
    pub x: i32,
    /// Tile z coordinate.
    pub z: i32,
}

impl TilePos {
    /// The tile at the origin.
    pub const ZERO: Self = Self::new(0, 0);

    /// Creates a new tile position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Packs the position into a single key. `x` is stored in the low half and `z` in the high half.
    #[must_use]
    pub const fn key(self) -> i64 {
        (self.x as u32 as i64) | ((self.z as u32 as i64) << 32)
    }

    /// Unpacks a key produced by [`TilePos::key`].
    #[must_use]
    pub const fn from_key(key: i64) -> Self {
        Self {
            x: key as i32,
            z: (key >> 32) as i32,
        }
    }

    /// Returns the tile containing the given block coordinates.
    #[must_use]
    pub const fn from_block(x: i32, z: i32) -> Self {
        Self::new(x >> 4, z >> 4)
    }

    /// Chebyshev (chessboard) distance to another tile.
    #[must_use]
    pub fn distance(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).max(self.z.abs_diff(other.z))
    }

    /// Returns the tile offset by the given amounts.
    #[must_use]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.x.wrapping_add(dx), self.z.wrapping_add(dz))
    }

    /// Iterates every tile in the square of the given radius around `self`, row by row.
    pub fn square(self, radius: i32) -> impl Iterator<Item = TilePos> {
        (-radius..=radius)
            .flat_map(move |dz| (-radius..=radius).map(move |dx| self.offset(dx, dz)))
    }
}

impl Display for TilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// A section position, a 16x16x16 cube of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectionPos {
    /// Section x coordinate (same as the tile x).
    pub x: i32,
    /// Section y coordinate.
    pub y: i32,
    /// Section z coordinate (same as the tile z).
    pub z: i32,
}

impl SectionPos {
    const PACKED_X_LENGTH: u32 = 22;
    const PACKED_Z_LENGTH: u32 = 22;
    const PACKED_Y_LENGTH: u32 = 20;
    const X_OFFSET: u32 = Self::PACKED_Y_LENGTH + Self::PACKED_Z_LENGTH;
    const Z_OFFSET: u32 = Self::PACKED_Y_LENGTH;
    const X_MASK: i64 = (1 << Self::PACKED_X_LENGTH) - 1;
    const Y_MASK: i64 = (1 << Self::PACKED_Y_LENGTH) - 1;
    const Z_MASK: i64 = (1 << Self::PACKED_Z_LENGTH) - 1;

    /// Creates a new section position.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Creates the section at height `y` in the given tile.
    #[must_use]
    pub const fn of(tile: TilePos, y: i32) -> Self {
        Self::new(tile.x, y, tile.z)
    }

    /// Packs the position into a single key.
    #[must_use]
    pub const fn key(self) -> i64 {
        ((self.x as i64 & Self::X_MASK) << Self::X_OFFSET)
            | (self.y as i64 & Self::Y_MASK)
            | ((self.z as i64 & Self::Z_MASK) << Self::Z_OFFSET)
    }

    /// Unpacks a key produced by [`SectionPos::key`].
    #[must_use]
    pub const fn from_key(key: i64) -> Self {
        Self {
            x: (key >> Self::X_OFFSET) as i32,
            y: ((key << (64 - Self::PACKED_Y_LENGTH)) >> (64 - Self::PACKED_Y_LENGTH)) as i32,
            z: ((key << (64 - Self::X_OFFSET)) >> (64 - Self::PACKED_Z_LENGTH)) as i32,
        }
    }

    /// The tile this section belongs to.
    #[must_use]
    pub const fn tile(self) -> TilePos {
        TilePos::new(self.x, self.z)
    }

    /// Returns the section offset by the given amounts.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }
}

impl Display for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.x, self.y, self.z)
    }
}

/// A block position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    /// Block x coordinate.
    pub x: i32,
    /// Block y coordinate.
    pub y: i32,
    /// Block z coordinate.
    pub z: i32,
}

impl BlockPos {
    /// Creates a new block position.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The tile containing this block.
    #[must_use]
    pub const fn tile(self) -> TilePos {
        TilePos::from_block(self.x, self.z)
    }

    /// The section containing this block.
    #[must_use]
    pub const fn section(self) -> SectionPos {
        SectionPos::new(self.x >> 4, self.y >> 4, self.z >> 4)
    }

    /// Packs the block's coordinates relative to its section into 12 bits (`x | z << 4 | y << 8`).
    #[must_use]
    pub const fn section_relative(self) -> u16 {
        ((self.x & 15) | ((self.z & 15) << 4) | ((self.y & 15) << 8)) as u16
    }
}

impl Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.x, self.y, self.z)
    }
}
