//! Observer configuration.
//!
//! ## Sources (later wins)
//!
//! 1. Built-in defaults (table below)
//! 2. Optional TOML file
//! 3. `OBSERVER_*` environment variables (e.g. `OBSERVER_WS_URL`)
//! 4. Command-line flags (binary only)
//!
//! | Key                    | Default                                             |
//! |------------------------|-----------------------------------------------------|
//! | `bootstrap_url`        | `http://127.0.0.1:8080/admin/v1/observer/bootstrap` |
//! | `ws_url`               | `ws://127.0.0.1:8080/admin/v1/observer/ws`          |
//! | `chunk_radius`         | `6`                                                 |
//! | `max_chunks`           | `1024`                                              |
//! | `view_mode`            | `2D`                                                |
//! | `voxel_radius`         | `4`                                                 |
//! | `voxel_max_chunks`     | `256`                                               |
//! | `follow_agent_id`      | unset                                               |
//! | `backoff_floor_ms`     | `250`                                               |
//! | `backoff_ceiling_ms`   | `5000`                                              |
//! | `backoff_factor`       | `1.7`                                               |
//! | `connect_timeout_ms`   | `10000` (bootstrap GET and WebSocket handshake)     |
//! | `status_interval_secs` | `5`                                                 |

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ObserverError;
use crate::store::WorldStore;
use crate::types::ViewMode;

pub const ENV_PREFIX: &str = "OBSERVER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub bootstrap_url: String,
    pub ws_url: String,
    pub chunk_radius: i32,
    pub max_chunks: u32,
    pub view_mode: ViewMode,
    pub voxel_radius: i32,
    pub voxel_max_chunks: u32,
    pub follow_agent_id: Option<String>,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub backoff_factor: f64,
    pub connect_timeout_ms: u64,
    pub status_interval_secs: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            bootstrap_url: "http://127.0.0.1:8080/admin/v1/observer/bootstrap".into(),
            ws_url: "ws://127.0.0.1:8080/admin/v1/observer/ws".into(),
            chunk_radius: 6,
            max_chunks: 1024,
            view_mode: ViewMode::TwoD,
            voxel_radius: 4,
            voxel_max_chunks: 256,
            follow_agent_id: None,
            backoff_floor_ms: 250,
            backoff_ceiling_ms: 5000,
            backoff_factor: 1.7,
            connect_timeout_ms: 10_000,
            status_interval_secs: 5,
        }
    }
}

impl ObserverConfig {
    /// Layer the optional TOML file and `OBSERVER_*` environment over the
    /// defaults. A missing file is not an error.
    pub fn load(file: Option<&Path>) -> Result<Self, ObserverError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;
        Ok(cfg)
    }

    /// Push the subscription-relevant settings into a store.
    pub fn apply_to(&self, store: &mut WorldStore) {
        store.set_chunk_radius(self.chunk_radius);
        store.set_max_chunks(self.max_chunks);
        store.set_view_mode(self.view_mode);
        store.set_voxel_radius(self.voxel_radius);
        store.set_voxel_max_chunks(self.voxel_max_chunks);
        if self.follow_agent_id.is_some() {
            store.set_follow(self.follow_agent_id.clone());
        }
    }
}
