//! voxel-observer binary
//!
//! Connects to a world server's observer endpoints, mirrors the world into
//! a local store, keeps voxel meshes and surface tiles current, and logs
//! activity plus a periodic status line.
//!
//! ## Configuration (flags / env / TOML via `config` crate)
//!
//! | Flag                  | Env                         | Default                    |
//! |-----------------------|-----------------------------|----------------------------|
//! | `--config`            | `OBSERVER_CONFIG`           | none                       |
//! | `--bootstrap-url`     | `OBSERVER_BOOTSTRAP_URL`    | `http://127.0.0.1:8080/...`|
//! | `--ws-url`            | `OBSERVER_WS_URL`           | `ws://127.0.0.1:8080/...`  |
//! | `--chunk-radius`      | `OBSERVER_CHUNK_RADIUS`     | `6`                        |
//! | `--max-chunks`        | `OBSERVER_MAX_CHUNKS`       | `1024`                     |
//! | `--view-mode`         | `OBSERVER_VIEW_MODE`        | `2D`                       |
//! | `--voxel-radius`      | `OBSERVER_VOXEL_RADIUS`     | `4`                        |
//! | `--voxel-max-chunks`  | `OBSERVER_VOXEL_MAX_CHUNKS` | `256`                      |
//! | `--follow`            | `OBSERVER_FOLLOW_AGENT_ID`  | none                       |
//! | `--status-interval`   | `OBSERVER_STATUS_INTERVAL_SECS` | `5`                    |
//! | `--connect-timeout-ms`| `OBSERVER_CONNECT_TIMEOUT_MS` | `10000`                  |

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use voxel_observer::{
    activity::{self, ActivityEntry},
    connection::{Backoff, ConnectionManager, ConnectionState},
    store::{SharedStore, Snapshot},
    ObserverConfig, SurfaceRenderer, ViewMode, VoxelMesher, WorldBootstrap, WorldStore,
    WsTransport,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "voxel-observer", about = "Headless voxel world observer", version)]
struct Args {
    /// Optional TOML config file
    #[arg(long, short, env = "OBSERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Bootstrap endpoint (HTTP GET)
    #[arg(long, env = "OBSERVER_BOOTSTRAP_URL")]
    bootstrap_url: Option<String>,

    /// Observer stream endpoint (WebSocket)
    #[arg(long, env = "OBSERVER_WS_URL")]
    ws_url: Option<String>,

    /// Surface chunk radius (1-32)
    #[arg(long, env = "OBSERVER_CHUNK_RADIUS")]
    chunk_radius: Option<i32>,

    /// Surface chunk budget
    #[arg(long, env = "OBSERVER_MAX_CHUNKS")]
    max_chunks: Option<u32>,

    /// 2D or 3D
    #[arg(long, env = "OBSERVER_VIEW_MODE")]
    view_mode: Option<ViewMode>,

    /// Voxel chunk radius around the focus agent (0-32)
    #[arg(long, env = "OBSERVER_VOXEL_RADIUS")]
    voxel_radius: Option<i32>,

    /// Voxel chunk budget
    #[arg(long, env = "OBSERVER_VOXEL_MAX_CHUNKS")]
    voxel_max_chunks: Option<u32>,

    /// Agent to follow
    #[arg(long, env = "OBSERVER_FOLLOW_AGENT_ID")]
    follow: Option<String>,

    /// Seconds between status lines
    #[arg(long, env = "OBSERVER_STATUS_INTERVAL_SECS")]
    status_interval: Option<u64>,

    /// Bound on the bootstrap request and the WebSocket handshake
    #[arg(long, env = "OBSERVER_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,
}

impl Args {
    fn apply(self, cfg: &mut ObserverConfig) {
        if let Some(v) = self.bootstrap_url {
            cfg.bootstrap_url = v;
        }
        if let Some(v) = self.ws_url {
            cfg.ws_url = v;
        }
        if let Some(v) = self.chunk_radius {
            cfg.chunk_radius = v;
        }
        if let Some(v) = self.max_chunks {
            cfg.max_chunks = v;
        }
        if let Some(v) = self.view_mode {
            cfg.view_mode = v;
        }
        if let Some(v) = self.voxel_radius {
            cfg.voxel_radius = v;
        }
        if let Some(v) = self.voxel_max_chunks {
            cfg.voxel_max_chunks = v;
        }
        if self.follow.is_some() {
            cfg.follow_agent_id = self.follow;
        }
        if let Some(v) = self.status_interval {
            cfg.status_interval_secs = v;
        }
        if let Some(v) = self.connect_timeout_ms {
            cfg.connect_timeout_ms = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voxel_observer=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut cfg = ObserverConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut cfg);

    log::info!(
        "Starting voxel-observer (ws='{}', radius={}, view={}, follow={})",
        cfg.ws_url,
        cfg.chunk_radius,
        cfg.view_mode,
        cfg.follow_agent_id.as_deref().unwrap_or("-"),
    );

    let store = WorldStore::shared();
    cfg.apply_to(&mut store.borrow_mut());

    let mesher = Rc::new(RefCell::new(VoxelMesher::default()));
    let surfaces = Rc::new(RefCell::new(SurfaceRenderer::default()));
    wire_consumers(&store, &mesher, &surfaces);

    let (manager, stop) = ConnectionManager::new(
        WsTransport::from_config(&cfg),
        store.clone(),
        Backoff::from_config(&cfg),
    );

    let mut status = tokio::time::interval(Duration::from_secs(cfg.status_interval_secs.max(1)));
    let run = manager.run();
    tokio::pin!(run);
    let mut stopping = false;

    // Run until shutdown
    let stats = loop {
        tokio::select! {
            stats = &mut run => break stats,
            _ = status.tick() => log_status(&store, &mesher.borrow(), &surfaces.borrow()),
            res = tokio::signal::ctrl_c(), if !stopping => {
                if let Err(e) = res {
                    log::warn!("Signal handler failed: {}", e);
                }
                log::info!("Shutting down");
                stop.stop();
                stopping = true;
            }
        }
    };

    log::info!(
        "Done: {} attempt(s), {} open(s), {} frame(s), {} ignored",
        stats.attempts,
        stats.opens,
        stats.frames,
        stats.ignored
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Store consumers
// ---------------------------------------------------------------------------

fn wire_consumers(
    store: &SharedStore,
    mesher: &Rc<RefCell<VoxelMesher>>,
    surfaces: &Rc<RefCell<SurfaceRenderer>>,
) {
    let mut st = store.borrow_mut();

    let m = Rc::clone(mesher);
    st.subscribe(
        |s| s.voxels.clone(),
        move |next, prev| m.borrow_mut().sync(next, prev),
    );

    let r = Rc::clone(surfaces);
    st.subscribe(
        |s| s.chunks.clone(),
        move |next, prev| r.borrow_mut().sync(next, prev),
    );

    let m = Rc::clone(mesher);
    let r = Rc::clone(surfaces);
    st.subscribe(
        |s| s.bootstrap.clone(),
        move |next: &Option<Snapshot<WorldBootstrap>>, _| {
            if let Some(b) = next {
                m.borrow_mut().set_palette(&b.block_palette);
                r.borrow_mut().set_world(&b.block_palette, b.height());
            }
        },
    );

    st.subscribe(
        |s| s.activity.clone(),
        |next: &Snapshot<Vec<ActivityEntry>>, prev: &Snapshot<Vec<ActivityEntry>>| {
            for entry in activity::fresh_entries(next, prev) {
                log::info!(target: "voxel_observer::activity", "{}", entry.text);
            }
        },
    );

    st.subscribe(
        |s| (s.connected, s.last_error.clone()),
        |next: &(bool, Option<String>), _| {
            if let (false, Some(err)) = next {
                log::debug!("Connection error: {}", err);
            }
        },
    );
}

fn log_status(store: &SharedStore, mesher: &VoxelMesher, surfaces: &SurfaceRenderer) {
    let st = store.borrow();
    let state = st.state();
    let stats = state.stats();
    let focus = state
        .focus_agent()
        .map(|a| format!("{} {}", a.id, a.position()))
        .unwrap_or_else(|| "-".into());
    tracing::info!(
        connection = %ConnectionState::of(state),
        focus = %focus,
        retry_ms = state.reconnect_delay.map_or(0, |d| d.as_millis() as u64),
        tick = stats.tick,
        agents = stats.agents,
        surface_chunks = stats.surface_chunks,
        voxel_chunks = stats.voxel_chunks,
        meshes = mesher.len(),
        faces = mesher.face_count(),
        tiles = surfaces.len(),
        audits = stats.recent_audits,
        "status"
    );
}
