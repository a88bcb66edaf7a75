//! 2-D surface painter: one 16x16 RGBA tile per loaded surface chunk.
//!
//! Shares the mesher's upsert/evict/sync contract but has no neighbour
//! dependency; each tile depends only on its own chunk.

use std::collections::HashMap;
use std::sync::Arc;

use crate::colors::{ColorLookup, PaletteColors, Rgba};
use crate::store::{ChunkMap, ChunkSurface};
use crate::types::{ChunkKey, CHUNK_AREA};

/// Column height assumed for shading before a bootstrap arrives.
const DEFAULT_HEIGHT: usize = 64;

/// RGBA pixels in `z*16 + x` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceTile {
    pub pixels: Box<[Rgba; CHUNK_AREA]>,
}

impl SurfaceTile {
    pub fn pixel(&self, x: usize, z: usize) -> Option<Rgba> {
        (x < 16 && z < 16).then(|| self.pixels[ChunkSurface::index(x, z)])
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels[..])
    }
}

struct PaintedChunk {
    surface: Arc<ChunkSurface>,
    tile: SurfaceTile,
}

pub struct SurfaceRenderer<C = PaletteColors> {
    colors: C,
    palette: Vec<String>,
    height: usize,
    chunks: HashMap<ChunkKey, PaintedChunk>,
}

impl Default for SurfaceRenderer<PaletteColors> {
    fn default() -> Self {
        Self::new(PaletteColors)
    }
}

impl<C: ColorLookup> SurfaceRenderer<C> {
    pub fn new(colors: C) -> Self {
        Self {
            colors,
            palette: Vec::new(),
            height: DEFAULT_HEIGHT,
            chunks: HashMap::new(),
        }
    }

    /// Replace palette and world height, repainting every tile.
    pub fn set_world(&mut self, palette: &[String], height: usize) {
        self.palette = palette.to_vec();
        self.height = height.max(1);
        for chunk in self.chunks.values_mut() {
            chunk.tile = paint(&self.colors, &self.palette, self.height, &chunk.surface);
        }
    }

    pub fn upsert(&mut self, surface: Arc<ChunkSurface>) {
        let tile = paint(&self.colors, &self.palette, self.height, &surface);
        self.chunks
            .insert(surface.key(), PaintedChunk { surface, tile });
    }

    pub fn evict(&mut self, key: ChunkKey) -> bool {
        self.chunks.remove(&key).is_some()
    }

    pub fn sync(&mut self, next: &ChunkMap<ChunkSurface>, prev: &ChunkMap<ChunkSurface>) {
        for key in prev.keys() {
            if !next.contains_key(key) {
                self.evict(*key);
            }
        }
        for (key, surface) in next {
            let unchanged = prev.get(key).is_some_and(|p| Arc::ptr_eq(p, surface));
            if !unchanged || !self.chunks.contains_key(key) {
                self.upsert(Arc::clone(surface));
            }
        }
    }

    pub fn tile(&self, key: ChunkKey) -> Option<&SurfaceTile> {
        self.chunks.get(&key).map(|c| &c.tile)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

fn paint<C: ColorLookup>(
    colors: &C,
    palette: &[String],
    height: usize,
    surface: &ChunkSurface,
) -> SurfaceTile {
    let mut pixels = Box::new([[0u8; 4]; CHUNK_AREA]);
    for (i, (block, y)) in surface
        .blocks()
        .iter()
        .zip(surface.heights())
        .enumerate()
    {
        pixels[i] = colors.color(*block, palette, *y as usize, height);
    }
    SurfaceTile { pixels }
}
