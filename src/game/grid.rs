//! Tile grid and hazard lifecycle
//!
//! Tiles only move forward through `Solid -> Shaking -> Fallen` within a
//! round; the whole grid resets to solid at round setup.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::math::{tile_center, world_to_tile, Vec2};

/// Lifecycle state of a single tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileState {
    Solid,
    Shaking,
    Fallen,
}

/// One grid cell.
#[derive(Debug, Clone)]
pub struct Tile {
    pub state: TileState,
    /// When the tile started shaking (ms)
    pub shake_started_at: Option<u64>,
    /// When the tile is scheduled to fall (ms)
    pub falls_at: Option<u64>,
}

impl Tile {
    fn solid() -> Self {
        Self {
            state: TileState::Solid,
            shake_started_at: None,
            falls_at: None,
        }
    }
}

/// Fixed-size tile grid for one room. Dimensions never change after creation.
#[derive(Debug, Clone)]
pub struct TileGrid {
    width: u32,
    height: u32,
    tile_size: f32,
    tiles: Vec<Tile>,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, tile_size: f32) -> Self {
        let count = (width * height) as usize;
        Self {
            width,
            height,
            tile_size,
            tiles: vec![Tile::solid(); count],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn state(&self, index: usize) -> TileState {
        self.tiles[index].state
    }

    /// Reset every tile to solid (round setup).
    pub fn reset(&mut self) {
        for tile in &mut self.tiles {
            *tile = Tile::solid();
        }
    }

    /// Row-major index for in-bounds tile coordinates.
    pub fn index_of(&self, tile_x: i32, tile_y: i32) -> Option<usize> {
        if tile_x < 0 || tile_y < 0 || tile_x >= self.width as i32 || tile_y >= self.height as i32 {
            return None;
        }
        Some((tile_y as u32 * self.width + tile_x as u32) as usize)
    }

    /// Tile index under a world position, or None when off the grid.
    pub fn tile_at(&self, pos: Vec2) -> Option<usize> {
        let (tx, ty) = world_to_tile(pos, self.tile_size);
        self.index_of(tx, ty)
    }

    /// World-space center of a tile by index.
    pub fn center_of(&self, index: usize) -> Vec2 {
        let tx = index as u32 % self.width;
        let ty = index as u32 / self.width;
        tile_center(tx, ty, self.tile_size)
    }

    /// Put a solid tile into the shaking state and schedule its fall.
    /// Returns false (no re-trigger) when the tile is already shaking or gone.
    pub fn start_shake(&mut self, index: usize, now: u64, fall_delay_ms: u64) -> bool {
        let tile = &mut self.tiles[index];
        if tile.state != TileState::Solid {
            return false;
        }
        tile.state = TileState::Shaking;
        tile.shake_started_at = Some(now);
        tile.falls_at = Some(now + fall_delay_ms);
        true
    }

    /// Drop every shaking tile whose deadline has passed.
    /// Returns the indices that fell this call, in index order.
    pub fn settle_falls(&mut self, now: u64) -> Vec<usize> {
        let mut fallen = Vec::new();
        for (index, tile) in self.tiles.iter_mut().enumerate() {
            if tile.state == TileState::Shaking && tile.falls_at.is_some_and(|at| now >= at) {
                tile.state = TileState::Fallen;
                fallen.push(index);
            }
        }
        fallen
    }

    /// Pick a uniformly random still-solid tile, if any remain.
    pub fn random_solid(&self, rng: &mut impl Rng) -> Option<usize> {
        let solid: Vec<usize> = self
            .tiles
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == TileState::Solid)
            .map(|(i, _)| i)
            .collect();
        if solid.is_empty() {
            return None;
        }
        Some(solid[rng.gen_range(0..solid.len())])
    }

    /// Spawn candidates: the ring one cell inside the outer perimeter, or the
    /// perimeter itself when the grid is too small to have an inner ring.
    /// Deterministic scan order; the caller shuffles.
    pub fn spawn_ring(&self) -> Vec<(u32, u32)> {
        let (w, h) = (self.width, self.height);
        let ring = |x0: u32, y0: u32, x1: u32, y1: u32| -> Vec<(u32, u32)> {
            let mut cells = Vec::new();
            for y in y0..=y1 {
                for x in x0..=x1 {
                    if x == x0 || x == x1 || y == y0 || y == y1 {
                        cells.push((x, y));
                    }
                }
            }
            cells
        };
        if w >= 3 && h >= 3 {
            ring(1, 1, w - 2, h - 2)
        } else {
            ring(0, 0, w - 1, h - 1)
        }
    }
}
