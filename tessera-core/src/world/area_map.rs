//! Spatial index answering "which viewers can see this tile".
//!
//! Every viewer is registered in each tile of the square around its center tile, so the
//! lookup is a single map read.

use std::sync::atomic::{AtomicU8, Ordering};

use rustc_hash::FxHashSet;
use scc::HashMap;
use tessera_utils::TilePos;
use uuid::Uuid;

/// Maps tiles to the viewers whose view square contains them.
///
/// Safe to query from any thread. Mutations are expected from the main loop only.
pub struct ViewerAreaMap {
    /// Packed tile key to viewers seeing it.
    tiles: HashMap<i64, FxHashSet<Uuid>>,
    /// Viewer to its center tile.
    centers: HashMap<Uuid, TilePos>,
    radius: AtomicU8,
}

impl ViewerAreaMap {
    /// Creates an empty map whose viewers see `radius` tiles around them.
    #[must_use]
    pub fn new(radius: u8) -> Self {
        Self {
            tiles: HashMap::new(),
            centers: HashMap::new(),
            radius: AtomicU8::new(radius),
        }
    }

    /// The current view radius.
    #[must_use]
    pub fn radius(&self) -> u8 {
        self.radius.load(Ordering::Acquire)
    }

    /// Registers `viewer` centered on `center`. Re-adding a viewer moves it.
    pub fn add(&self, viewer: Uuid, center: TilePos) {
        if let Some(old) = self.center_of(viewer) {
            self.move_viewer(viewer, old, center);
            return;
        }
        let _ = self.centers.insert_sync(viewer, center);
        for pos in center.square(i32::from(self.radius())) {
            self.add_to_tile(pos.key(), viewer);
        }
    }

    /// Unregisters `viewer`. Returns its last center.
    pub fn remove(&self, viewer: Uuid) -> Option<TilePos> {
        let (_, center) = self.centers.remove_sync(&viewer)?;
        for pos in center.square(i32::from(self.radius())) {
            self.remove_from_tile(pos.key(), viewer);
        }
        Some(center)
    }

    /// Moves `viewer` from `old_center` to `new_center`, touching only the tiles that
    /// enter or leave its square.
    pub fn move_viewer(&self, viewer: Uuid, old_center: TilePos, new_center: TilePos) {
        if old_center == new_center {
            return;
        }
        let radius = i32::from(self.radius());
        let old: FxHashSet<i64> = old_center.square(radius).map(TilePos::key).collect();
        let new: FxHashSet<i64> = new_center.square(radius).map(TilePos::key).collect();

        for &key in old.difference(&new) {
            self.remove_from_tile(key, viewer);
        }
        for &key in new.difference(&old) {
            self.add_to_tile(key, viewer);
        }

        if self
            .centers
            .update_sync(&viewer, |_, center| *center = new_center)
            .is_none()
        {
            let _ = self.centers.insert_sync(viewer, new_center);
        }
    }

    /// Changes the view radius and re-registers every viewer.
    pub fn set_radius(&self, radius: u8) {
        if self.radius.swap(radius, Ordering::AcqRel) == radius {
            return;
        }
        let mut viewers = Vec::with_capacity(self.centers.len());
        self.centers.iter_sync(|viewer, center| {
            viewers.push((*viewer, *center));
            true
        });
        self.tiles.clear_sync();
        for (viewer, center) in viewers {
            for pos in center.square(i32::from(radius)) {
                self.add_to_tile(pos.key(), viewer);
            }
        }
    }

    /// The center tile of `viewer`.
    #[must_use]
    pub fn center_of(&self, viewer: Uuid) -> Option<TilePos> {
        self.centers.read_sync(&viewer, |_, center| *center)
    }

    /// Viewers that can see `pos`.
    #[must_use]
    pub fn viewers_of(&self, pos: TilePos) -> Vec<Uuid> {
        self.tiles
            .read_sync(&pos.key(), |_, viewers| viewers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns true if anyone can see `pos`.
    #[must_use]
    pub fn is_viewed(&self, pos: TilePos) -> bool {
        self.tiles.read_sync(&pos.key(), |_, _| ()).is_some()
    }

    /// Number of registered viewers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    /// Returns true if there are no viewers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    fn add_to_tile(&self, key: i64, viewer: Uuid) {
        if self
            .tiles
            .update_sync(&key, |_, viewers| {
                viewers.insert(viewer);
            })
            .is_none()
        {
            let mut viewers = FxHashSet::default();
            viewers.insert(viewer);
            let _ = self.tiles.insert_sync(key, viewers);
        }
    }

    fn remove_from_tile(&self, key: i64, viewer: Uuid) {
        let now_empty = self
            .tiles
            .update_sync(&key, |_, viewers| {
                viewers.remove(&viewer);
                viewers.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            let _ = self.tiles.remove_if_sync(&key, |viewers| viewers.is_empty());
        }
    }
}
