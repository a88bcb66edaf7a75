//! Voxel mesher.
//!
//! Turns each loaded volumetric chunk into a flat triangle list holding
//! exactly the faces that border air. Faces on the chunk's outer boundary
//! look into the adjacent chunk when it is loaded and treat it as air when
//! it is not, so an isolated chunk is closed rather than open.
//!
//! Meshes are rebuilt whole. Upserting a chunk rebuilds it and any loaded
//! planar neighbour (their boundary faces read its cells); evicting a chunk
//! only drops its own mesh.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::trace;

use crate::colors::{ColorLookup, PaletteColors};
use crate::store::{self, ChunkMap, ChunkVoxels};
use crate::types::{ChunkKey, CHUNK_SIZE};

/// Vertices emitted per visible face (two triangles, 0-1-2 and 0-2-3).
pub const VERTICES_PER_FACE: usize = 6;

// ---------------------------------------------------------------------------
// Vertex
// ---------------------------------------------------------------------------

/// One mesh vertex, laid out for direct upload to a vertex buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    /// World space.
    pub position: [f32; 3],
    pub normal: [f32; 3],
    /// Linear RGBA in `[0, 1]`.
    pub color: [f32; 4],
}

// ---------------------------------------------------------------------------
// Faces
// ---------------------------------------------------------------------------

/// The six axis-aligned faces of a voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Face {
    /// +Y
    Top,
    /// -Y
    Bottom,
    /// +X
    Right,
    /// -X
    Left,
    /// +Z
    Front,
    /// -Z
    Back,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::Top,
        Face::Bottom,
        Face::Right,
        Face::Left,
        Face::Front,
        Face::Back,
    ];

    /// Cell offset to the neighbour across this face.
    pub fn offset(self) -> [i32; 3] {
        match self {
            Face::Top => [0, 1, 0],
            Face::Bottom => [0, -1, 0],
            Face::Right => [1, 0, 0],
            Face::Left => [-1, 0, 0],
            Face::Front => [0, 0, 1],
            Face::Back => [0, 0, -1],
        }
    }

    pub fn normal(self) -> [f32; 3] {
        self.offset().map(|c| c as f32)
    }

    /// Quad corners for the unit cell whose minimum corner is `(x, y, z)`.
    fn corners(self, x: f32, y: f32, z: f32) -> [[f32; 3]; 4] {
        let (x1, y1, z1) = (x + 1.0, y + 1.0, z + 1.0);
        match self {
            Face::Top => [[x, y1, z], [x1, y1, z], [x1, y1, z1], [x, y1, z1]],
            Face::Bottom => [[x, y, z], [x, y, z1], [x1, y, z1], [x1, y, z]],
            Face::Right => [[x1, y, z], [x1, y1, z], [x1, y1, z1], [x1, y, z1]],
            Face::Left => [[x, y, z], [x, y1, z], [x, y1, z1], [x, y, z1]],
            Face::Front => [[x, y, z1], [x1, y, z1], [x1, y1, z1], [x, y1, z1]],
            Face::Back => [[x, y, z], [x, y1, z], [x1, y1, z], [x1, y, z]],
        }
    }
}

// ---------------------------------------------------------------------------
// Mesh output
// ---------------------------------------------------------------------------

/// Triangle list for one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMesh {
    pub vertices: Vec<MeshVertex>,
}

impl ChunkMesh {
    pub fn face_count(&self) -> usize {
        self.vertices.len() / VERTICES_PER_FACE
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Raw bytes, ready for a vertex buffer.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    fn push_face(&mut self, corners: [[f32; 3]; 4], normal: [f32; 3], color: [f32; 4]) {
        for i in [0, 1, 2, 0, 2, 3] {
            self.vertices.push(MeshVertex {
                position: corners[i],
                normal,
                color,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshState {
    Absent,
    Built,
}

struct MeshedChunk {
    voxels: Arc<ChunkVoxels>,
    mesh: ChunkMesh,
}

// ---------------------------------------------------------------------------
// Mesher
// ---------------------------------------------------------------------------

pub struct VoxelMesher<C = PaletteColors> {
    colors: C,
    palette: Vec<String>,
    air: u16,
    chunks: HashMap<ChunkKey, MeshedChunk>,
    rebuilds: u64,
}

impl Default for VoxelMesher<PaletteColors> {
    fn default() -> Self {
        Self::new(PaletteColors)
    }
}

impl<C: ColorLookup> VoxelMesher<C> {
    pub fn new(colors: C) -> Self {
        Self {
            colors,
            palette: Vec::new(),
            air: 0,
            chunks: HashMap::new(),
            rebuilds: 0,
        }
    }

    /// Replace the palette and rebuild every mesh, since both colours and
    /// the air id may have changed.
    pub fn set_palette(&mut self, palette: &[String]) {
        self.palette = palette.to_vec();
        self.air = store::air_block_id(&self.palette);
        let keys: Vec<ChunkKey> = self.chunks.keys().copied().collect();
        for key in keys {
            self.rebuild(key);
        }
    }

    pub fn air_block_id(&self) -> u16 {
        self.air
    }

    /// Install (or replace) a chunk's voxels and rebuild it plus its loaded
    /// neighbours.
    pub fn upsert(&mut self, voxels: Arc<ChunkVoxels>) {
        let key = voxels.key();
        self.chunks.insert(
            key,
            MeshedChunk {
                voxels,
                mesh: ChunkMesh::default(),
            },
        );
        self.rebuild(key);
        for n in key.neighbors() {
            self.rebuild(n);
        }
    }

    /// Drop a chunk's mesh. Neighbours keep their current meshes.
    pub fn evict(&mut self, key: ChunkKey) -> bool {
        self.chunks.remove(&key).is_some()
    }

    /// Reconcile against a new store snapshot: evict keys that vanished,
    /// upsert keys whose chunk handle changed.
    pub fn sync(&mut self, next: &ChunkMap<ChunkVoxels>, prev: &ChunkMap<ChunkVoxels>) {
        for key in prev.keys() {
            if !next.contains_key(key) {
                self.evict(*key);
            }
        }
        for (key, voxels) in next {
            let unchanged = prev.get(key).is_some_and(|p| Arc::ptr_eq(p, voxels));
            if !unchanged || !self.chunks.contains_key(key) {
                self.upsert(Arc::clone(voxels));
            }
        }
    }

    pub fn state(&self, key: ChunkKey) -> MeshState {
        if self.chunks.contains_key(&key) {
            MeshState::Built
        } else {
            MeshState::Absent
        }
    }

    pub fn mesh(&self, key: ChunkKey) -> Option<&ChunkMesh> {
        self.chunks.get(&key).map(|c| &c.mesh)
    }

    pub fn meshes(&self) -> impl Iterator<Item = (ChunkKey, &ChunkMesh)> {
        self.chunks.iter().map(|(k, c)| (*k, &c.mesh))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total full-chunk rebuilds performed.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    pub fn face_count(&self) -> usize {
        self.chunks.values().map(|c| c.mesh.face_count()).sum()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn rebuild(&mut self, key: ChunkKey) {
        let Some(voxels) = self.chunks.get(&key).map(|c| Arc::clone(&c.voxels)) else {
            return;
        };
        let mesh = self.build_mesh(&voxels);
        trace!("Meshed chunk {} ({} faces)", key, mesh.face_count());
        if let Some(entry) = self.chunks.get_mut(&key) {
            entry.mesh = mesh;
        }
        self.rebuilds += 1;
    }

    fn build_mesh(&self, voxels: &ChunkVoxels) -> ChunkMesh {
        let key = voxels.key();
        let (ox, oz) = key.origin();
        let height = voxels.height();
        let mut mesh = ChunkMesh::default();

        for y in 0..height {
            for z in 0..CHUNK_SIZE {
                for x in 0..CHUNK_SIZE {
                    let block = voxels.get(x, y, z).unwrap_or(self.air);
                    if block == self.air {
                        continue;
                    }

                    let [r, g, b, a] = self.colors.color(block, &self.palette, y, height);
                    let color = [r, g, b, a].map(|c| c as f32 / 255.0);
                    let (wx, wy, wz) = ((ox + x as i32) as f32, y as f32, (oz + z as i32) as f32);

                    for face in Face::ALL {
                        let [dx, dy, dz] = face.offset();
                        let neighbour = self.block_at(
                            voxels,
                            x as i32 + dx,
                            y as i32 + dy,
                            z as i32 + dz,
                        );
                        if neighbour == self.air {
                            mesh.push_face(face.corners(wx, wy, wz), face.normal(), color);
                        }
                    }
                }
            }
        }

        mesh
    }

    /// Block at chunk-local coordinates that may step one cell outside the
    /// chunk. Out-of-range y and unloaded neighbours read as air.
    fn block_at(&self, voxels: &ChunkVoxels, x: i32, y: i32, z: i32) -> u16 {
        if y < 0 || y as usize >= voxels.height() {
            return self.air;
        }
        let size = CHUNK_SIZE as i32;
        if (0..size).contains(&x) && (0..size).contains(&z) {
            return voxels
                .get(x as usize, y as usize, z as usize)
                .unwrap_or(self.air);
        }

        let key = voxels.key();
        let (ncx, lx) = wrap(key.cx, x, size);
        let (ncz, lz) = wrap(key.cz, z, size);
        self.chunks
            .get(&ChunkKey::new(ncx, ncz))
            .and_then(|n| n.voxels.get(lx as usize, y as usize, lz as usize))
            .unwrap_or(self.air)
    }
}

/// Step a local coordinate across at most one chunk boundary.
fn wrap(chunk: i32, local: i32, size: i32) -> (i32, i32) {
    if local < 0 {
        (chunk - 1, local + size)
    } else if local >= size {
        (chunk + 1, local - size)
    } else {
        (chunk, local)
    }
}
