//! Core world types shared across all modules.

use serde::{Deserialize, Serialize};

/// Width and depth of every chunk, in cells.
pub const CHUNK_SIZE: usize = 16;

/// Cells in one horizontal chunk layer (16 × 16).
pub const CHUNK_AREA: usize = CHUNK_SIZE * CHUNK_SIZE;

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

}

impl From<[f32; 3]> for Vec3 {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// Chunk addressing
// ---------------------------------------------------------------------------

/// Horizontal chunk coordinate. Chunk `(cx, cz)` covers world cells
/// `cx*16 .. cx*16+16` on X and `cz*16 .. cz*16+16` on Z.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChunkKey {
    pub cx: i32,
    pub cz: i32,
}

impl ChunkKey {
    pub fn new(cx: i32, cz: i32) -> Self {
        Self { cx, cz }
    }

    /// The four planar neighbours: -X, +X, -Z, +Z.
    pub fn neighbors(self) -> [ChunkKey; 4] {
        [
            ChunkKey::new(self.cx - 1, self.cz),
            ChunkKey::new(self.cx + 1, self.cz),
            ChunkKey::new(self.cx, self.cz - 1),
            ChunkKey::new(self.cx, self.cz + 1),
        ]
    }

    /// World-space origin of the chunk on the X/Z plane.
    pub fn origin(self) -> (i32, i32) {
        (self.cx * CHUNK_SIZE as i32, self.cz * CHUNK_SIZE as i32)
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.cx, self.cz)
    }
}

// ---------------------------------------------------------------------------
// View mode
// ---------------------------------------------------------------------------

/// Which representation the observer is currently displaying.
///
/// Volumetric chunks are only requested in [`ViewMode::ThreeD`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ViewMode {
    #[default]
    #[serde(rename = "2D")]
    TwoD,
    #[serde(rename = "3D")]
    ThreeD,
}

impl std::fmt::Display for ViewMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewMode::TwoD => f.write_str("2D"),
            ViewMode::ThreeD => f.write_str("3D"),
        }
    }
}

impl std::str::FromStr for ViewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "2D" => Ok(ViewMode::TwoD),
            "3D" => Ok(ViewMode::ThreeD),
            other => Err(format!("unknown view mode '{other}' (expected 2D or 3D)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldParams {
    pub tick_rate_hz: f64,
    /// `(16, 16, height)`.
    pub chunk_size: [u32; 3],
    pub height: u32,
    pub seed: i64,
    #[serde(rename = "boundary_r", alias = "boundary_radius")]
    pub boundary_radius: f64,
}

/// World description served by the `bootstrap` endpoint.
///
/// Immutable once received; a reconnect replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldBootstrap {
    pub protocol_version: String,
    pub world_id: String,
    pub tick: u64,
    pub world_params: WorldParams,
    /// Index == numeric block id.
    pub block_palette: Vec<String>,
}

impl WorldBootstrap {
    /// Column height in cells.
    pub fn height(&self) -> usize {
        self.world_params.height as usize
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub surface_chunks: usize,
    pub voxel_chunks: usize,
    pub agents: usize,
    pub recent_audits: usize,
    pub activity: usize,
    pub tick: u64,
}
