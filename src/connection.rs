//! Connection manager.
//!
//! Drives one [`Transport`] in a reconnect loop and feeds every inbound frame
//! into the shared store:
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──(close/error)──► Disconnected
//!      ▲                │                                          │
//!      └────────────────┴──────────── backoff sleep ◄──────────────┘
//! ```
//!
//! On open the manager resets the backoff and sends `SUBSCRIBE`. While
//! connected, any change to the subscription-relevant store fields re-sends
//! `SUBSCRIBE` on the same connection. [`StopHandle::stop`] ends the loop
//! from any state: pending sleeps and in-flight bootstrap fetches are
//! abandoned and the live connection is closed.
//!
//! The bootstrap request runs alongside the stream. Voxel frames need the
//! column height it carries, so while it is outstanding they are queued and
//! replayed once it lands.

use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::config::ObserverConfig;
use crate::error::TransportError;
use crate::protocol::{self, ObserverMsg};
use crate::store::{SharedStore, SubscriptionId, WorldState};
use crate::transport::{Connection, Transport};
use crate::types::WorldBootstrap;

/// Cap on voxel frames held back while the bootstrap is still in flight.
pub const MAX_DEFERRED_FRAMES: usize = 4096;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Multiplicative reconnect delay. Only a successful open resets it.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    factor: f64,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_millis(5000), 1.7)
    }
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration, factor: f64) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            factor: factor.max(1.0),
            current: floor,
        }
    }

    pub fn from_config(cfg: &ObserverConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_floor_ms),
            Duration::from_millis(cfg.backoff_ceiling_ms),
            cfg.backoff_factor,
        )
    }

    /// The delay the next failure will wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the current delay and grow it for the following failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = (delay.as_millis() as f64 * self.factor).round() as u64;
        self.current = Duration::from_millis(grown).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn of(state: &WorldState) -> Self {
        if state.connected {
            ConnectionState::Connected
        } else if state.connecting {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// Counters returned when [`ConnectionManager::run`] finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub attempts: u32,
    pub opens: u32,
    pub subscribes: u32,
    pub frames: u64,
    pub ignored: u64,
}

// ---------------------------------------------------------------------------
// Stop handle
// ---------------------------------------------------------------------------

/// Stops a running [`ConnectionManager`]. Dropping the handle also stops it.
#[derive(Debug)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ConnectionManager<T: Transport> {
    transport: T,
    store: SharedStore,
    backoff: Backoff,
    stop_rx: watch::Receiver<bool>,
    resub_rx: mpsc::UnboundedReceiver<()>,
    watch_id: SubscriptionId,
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

enum Event {
    Stop,
    Bootstrap(Result<WorldBootstrap, TransportError>),
    Resubscribe,
    Frame(Option<Result<String, TransportError>>),
}

/// An in-flight bootstrap request. It outlives the attempt that started it.
type BootstrapFetch<'a> = LocalBoxFuture<'a, Result<WorldBootstrap, TransportError>>;

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager and start watching the store's subscription fields.
    pub fn new(transport: T, store: SharedStore, backoff: Backoff) -> (Self, StopHandle) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (resub_tx, resub_rx) = mpsc::unbounded_channel();

        let watch_id = store.borrow_mut().subscribe(
            |s: &WorldState| s.subscription_key(),
            move |_, _| {
                let _ = resub_tx.send(());
            },
        );

        let manager = Self {
            transport,
            store,
            backoff,
            stop_rx,
            resub_rx,
            watch_id,
        };
        (manager, StopHandle(stop_tx))
    }

    /// Run until stopped.
    ///
    /// The bootstrap request races the stream open: whichever finishes first
    /// is handled first and the session never waits on the bootstrap. A
    /// request still pending when the manager stops is dropped unapplied.
    pub async fn run(self) -> SessionStats {
        let Self {
            transport,
            store,
            mut backoff,
            mut stop_rx,
            mut resub_rx,
            watch_id,
        } = self;
        let mut stats = SessionStats::default();
        let mut bootstrap: Option<BootstrapFetch<'_>> = None;

        'reconnect: loop {
            if *stop_rx.borrow() {
                break;
            }

            stats.attempts += 1;
            store.borrow_mut().set_connecting();
            debug!("Connecting (attempt {})", stats.attempts);

            if bootstrap.is_none() {
                bootstrap = Some(transport.fetch_bootstrap().boxed_local());
            }
            let open = transport.open();
            tokio::pin!(open);

            let opened = loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.wait_for(|stopped| *stopped) => break 'reconnect,
                    res = next_bootstrap(&mut bootstrap) => {
                        bootstrap = None;
                        apply_bootstrap(&store, res);
                    }
                    opened = &mut open => break opened,
                }
            };

            let reason = match opened {
                Ok(mut conn) => {
                    backoff.reset();
                    stats.opens += 1;
                    store.borrow_mut().set_connection(true, None);
                    info!("Observer stream connected");

                    // The open itself sends current params.
                    while resub_rx.try_recv().is_ok() {}

                    let end = session(
                        &mut conn,
                        &store,
                        &mut bootstrap,
                        &mut stop_rx,
                        &mut resub_rx,
                        &mut stats,
                    )
                    .await;
                    match end {
                        SessionEnd::Stopped => {
                            conn.close().await;
                            break;
                        }
                        SessionEnd::Lost(reason) => reason,
                    }
                }
                Err(e) => format!("ws: {e}"),
            };

            let delay = backoff.next_delay();
            warn!("Observer stream down ({}); retrying in {:?}", reason, delay);
            store.borrow_mut().schedule_reconnect(reason, delay);

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.wait_for(|stopped| *stopped) => break 'reconnect,
                    res = next_bootstrap(&mut bootstrap) => {
                        bootstrap = None;
                        apply_bootstrap(&store, res);
                    }
                    _ = &mut sleep => break,
                }
            }
        }

        if bootstrap.take().is_some() {
            debug!("Discarding pending bootstrap request");
        }

        let mut st = store.borrow_mut();
        st.unsubscribe(watch_id);
        st.set_connection(false, None);
        info!(
            "Connection manager stopped after {} attempt(s), {} frame(s)",
            stats.attempts, stats.frames
        );
        stats
    }
}

/// Resolve the pending bootstrap request, or never if there is none.
async fn next_bootstrap(
    slot: &mut Option<BootstrapFetch<'_>>,
) -> Result<WorldBootstrap, TransportError> {
    match slot.as_mut() {
        Some(fetch) => fetch.await,
        None => std::future::pending().await,
    }
}

fn apply_bootstrap(store: &SharedStore, res: Result<WorldBootstrap, TransportError>) {
    match res {
        Ok(b) => {
            info!(
                "Bootstrap: world '{}' at tick {} ({} palette entries, height {})",
                b.world_id,
                b.tick,
                b.block_palette.len(),
                b.height()
            );
            store.borrow_mut().set_bootstrap(b);
        }
        Err(e) => {
            warn!("Bootstrap fetch failed: {}", e);
            store.borrow_mut().set_error(format!("bootstrap: {e}"));
        }
    }
}

async fn session<C: Connection>(
    conn: &mut C,
    store: &SharedStore,
    bootstrap: &mut Option<BootstrapFetch<'_>>,
    stop_rx: &mut watch::Receiver<bool>,
    resub_rx: &mut mpsc::UnboundedReceiver<()>,
    stats: &mut SessionStats,
) -> SessionEnd {
    if let Err(e) = send_subscribe(conn, store, stats).await {
        return SessionEnd::Lost(format!("send: {e}"));
    }

    // Voxel frames that arrived before the column height was known, in order.
    let mut deferred: Vec<ObserverMsg> = Vec::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => Event::Stop,
            res = next_bootstrap(bootstrap) => Event::Bootstrap(res),
            Some(()) = resub_rx.recv() => Event::Resubscribe,
            frame = conn.recv() => Event::Frame(frame),
        };

        match event {
            Event::Stop => return SessionEnd::Stopped,
            Event::Bootstrap(res) => {
                *bootstrap = None;
                apply_bootstrap(store, res);
                if !deferred.is_empty() {
                    debug!("Replaying {} deferred voxel frame(s)", deferred.len());
                    let mut st = store.borrow_mut();
                    for msg in deferred.drain(..) {
                        st.dispatch(&msg);
                    }
                }
            }
            Event::Resubscribe => {
                while resub_rx.try_recv().is_ok() {}
                if let Err(e) = send_subscribe(conn, store, stats).await {
                    return SessionEnd::Lost(format!("send: {e}"));
                }
            }
            Event::Frame(None) => return SessionEnd::Lost("connection closed".into()),
            Event::Frame(Some(Err(e))) => return SessionEnd::Lost(format!("ws: {e}")),
            Event::Frame(Some(Ok(text))) => {
                stats.frames += 1;
                let msg = match protocol::decode_message(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        stats.ignored += 1;
                        debug!("Ignoring frame: {}", e);
                        continue;
                    }
                };
                let awaiting_height =
                    bootstrap.is_some() && store.borrow().state().height().is_none();
                if msg.needs_height() && awaiting_height {
                    if deferred.len() < MAX_DEFERRED_FRAMES {
                        deferred.push(msg);
                    } else {
                        stats.ignored += 1;
                        debug!("Deferred queue full; dropping {}", msg.kind());
                    }
                    continue;
                }
                store.borrow_mut().dispatch(&msg);
            }
        }
    }
}

async fn send_subscribe<C: Connection>(
    conn: &mut C,
    store: &SharedStore,
    stats: &mut SessionStats,
) -> Result<(), TransportError> {
    let params = store.borrow().state().subscription_params();
    let frame = params
        .to_frame()
        .map_err(|e| TransportError::Other(e.to_string()))?;
    debug!(
        "SUBSCRIBE radius={} max={} focus='{}' voxel_radius={}",
        params.chunk_radius, params.max_chunks, params.focus_agent_id, params.voxel_radius
    );
    conn.send(frame).await?;
    stats.subscribes += 1;
    Ok(())
}
