//! The procedural generation seam.

use std::sync::Arc;

use tessera_utils::{BlockPos, TilePos};

use super::{
    status::TileStatus,
    tile_data::{BlockState, TileData},
};

/// The tiles a generation stage may read: the square of the stage's dependency radius
/// around the tile being generated.
pub struct TileRegion {
    center: TilePos,
    radius: i32,
    tiles: Vec<Arc<TileData>>,
}

impl TileRegion {
    /// Builds a region from tiles listed row by row, as [`TilePos::square`] visits them.
    #[must_use]
    pub fn new(center: TilePos, radius: u8, tiles: Vec<Arc<TileData>>) -> Self {
        let radius = i32::from(radius);
        debug_assert_eq!(tiles.len(), ((2 * radius + 1) * (2 * radius + 1)) as usize);
        Self {
            center,
            radius,
            tiles,
        }
    }

    /// The tile being generated.
    #[must_use]
    pub const fn center(&self) -> TilePos {
        self.center
    }

    /// The region's radius.
    #[must_use]
    pub const fn radius(&self) -> i32 {
        self.radius
    }

    /// The tile at `pos`, `None` outside the region.
    #[must_use]
    pub fn get(&self, pos: TilePos) -> Option<&Arc<TileData>> {
        let dx = pos.x - self.center.x;
        let dz = pos.z - self.center.z;
        if dx.abs() > self.radius || dz.abs() > self.radius {
            return None;
        }
        let width = 2 * self.radius + 1;
        self.tiles
            .get(((dz + self.radius) * width + dx + self.radius) as usize)
    }

    /// Every tile of the region.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TileData>> {
        self.tiles.iter()
    }
}

/// Produces tile content stage by stage.
///
/// Only ever called from the worldgen actor, one tile at a time.
pub trait TileGenerator: Send + Sync {
    /// The name used in logs and crash reports.
    fn name(&self) -> &str;

    /// Runs `status` on `tile`. `region` holds the tile and every neighbour within the
    /// stage's dependency radius, all at least at the parent stage.
    fn generate(&self, status: TileStatus, tile: &TileData, region: &TileRegion) -> anyhow::Result<()>;
}

/// A generator that fills every tile with the same horizontal layers.
pub struct FlatTileGenerator {
    /// Layers from the bottom of the world upward.
    pub layers: Vec<BlockState>,
    /// Placed on top of the layers in the corner block of every tile.
    pub light_source: Option<BlockState>,
}

impl Default for FlatTileGenerator {
    fn default() -> Self {
        Self::new(
            vec![
                BlockState::BEDROCK,
                BlockState::DIRT,
                BlockState::DIRT,
                BlockState::GRASS,
            ],
            Some(BlockState::TORCH),
        )
    }
}

impl FlatTileGenerator {
    /// Creates a new `FlatTileGenerator`.
    #[must_use]
    pub fn new(layers: Vec<BlockState>, light_source: Option<BlockState>) -> Self {
        Self {
            layers,
            light_source,
        }
    }

    fn fill_layers(&self, tile: &TileData) {
        let pos = tile.pos();
        let min_y = tile.height().min_y();
        for (dy, &state) in self.layers.iter().enumerate() {
            for x in 0..16 {
                for z in 0..16 {
                    tile.set_block(
                        BlockPos::new(pos.x * 16 + x, min_y + dy as i32, pos.z * 16 + z),
                        state,
                    );
                }
            }
        }
    }

    fn place_light_source(&self, tile: &TileData) {
        if let Some(state) = self.light_source {
            let pos = tile.pos();
            let y = tile.height().min_y() + self.layers.len() as i32;
            tile.set_block(BlockPos::new(pos.x * 16, y, pos.z * 16), state);
        }
    }
}

impl TileGenerator for FlatTileGenerator {
    fn name(&self) -> &str {
        "flat"
    }

    fn generate(&self, status: TileStatus, tile: &TileData, _region: &TileRegion) -> anyhow::Result<()> {
        match status {
            TileStatus::Noise => self.fill_layers(tile),
            TileStatus::Features => self.place_light_source(tile),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::tile_data::TileHeight;

    #[test]
    fn flat_layers_start_at_the_bottom() {
        let tile = Arc::new(TileData::new_empty(TilePos::new(-2, 5), TileHeight::default()));
        let region = TileRegion::new(tile.pos(), 0, vec![tile.clone()]);
        let generator = FlatTileGenerator::default();
        generator
            .generate(TileStatus::Noise, &tile, &region)
            .expect("flat generation cannot fail");
        generator
            .generate(TileStatus::Features, &tile, &region)
            .expect("flat generation cannot fail");

        assert_eq!(tile.block(BlockPos::new(-32, -64, 80)), BlockState::BEDROCK);
        assert_eq!(tile.block(BlockPos::new(-20, -62, 95)), BlockState::DIRT);
        assert_eq!(tile.block(BlockPos::new(-17, -61, 81)), BlockState::GRASS);
        assert_eq!(tile.block(BlockPos::new(-32, -60, 80)), BlockState::TORCH);
        assert_eq!(tile.block(BlockPos::new(-31, -60, 80)), BlockState::AIR);
    }

    #[test]
    fn region_lookup_is_bounded() {
        let center = TilePos::new(3, 3);
        let tiles = center
            .square(1)
            .map(|pos| Arc::new(TileData::new_empty(pos, TileHeight::default())))
            .collect();
        let region = TileRegion::new(center, 1, tiles);
        assert_eq!(region.get(TilePos::new(2, 4)).map(|t| t.pos()), Some(TilePos::new(2, 4)));
        assert_eq!(region.get(center).map(|t| t.pos()), Some(center));
        assert!(region.get(TilePos::new(5, 3)).is_none());
        assert_eq!(region.iter().count(), 9);
    }
}
