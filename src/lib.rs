//! Voxel Observer
//!
//! A live, incrementally updated mirror of a remote voxel world, with a
//! neighbour-aware mesher and a headless client.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionManager  (connection.rs)  ← reconnect loop, SUBSCRIBE
//!   ├── Transport    (transport.rs)   ← HTTP bootstrap + WebSocket frames
//!   └── WorldStore   (store.rs)       ← copy-on-write world snapshot
//!         ├── codec.rs / protocol.rs  ← wire decoding
//!         └── subscribers
//!               ├── VoxelMesher     (mesher.rs)  ← culled triangle meshes
//!               └── SurfaceRenderer (surface.rs) ← 16x16 RGBA tiles
//! ```
//!
//! Everything runs on one thread. The store is shared as
//! `Rc<RefCell<WorldStore>>`; consumers react to slices of it through
//! [`store::WorldStore::subscribe`].

// Data model, decoding and meshing are always available (no client feature needed).
pub mod activity;
pub mod codec;
pub mod colors;
pub mod config;
pub mod error;
pub mod mesher;
pub mod protocol;
pub mod store;
pub mod surface;
pub mod types;

// Networking requires the `client` feature.
#[cfg(feature = "client")]
pub mod connection;
#[cfg(feature = "client")]
pub mod transport;

// Convenience re-exports
#[cfg(feature = "client")]
pub use connection::{Backoff, ConnectionManager, ConnectionState, StopHandle};
#[cfg(feature = "client")]
pub use transport::{Connection, Transport, WsTransport};
pub use colors::{ColorLookup, PaletteColors};
pub use config::ObserverConfig;
pub use error::{CodecError, ObserverError, ProtocolError};
pub use mesher::{ChunkMesh, MeshVertex, VoxelMesher};
pub use protocol::{decode_message, ObserverMsg};
pub use store::{SharedStore, Snapshot, WorldState, WorldStore};
pub use surface::SurfaceRenderer;
pub use types::{ChunkKey, ViewMode, WorldBootstrap};
