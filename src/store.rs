//! `WorldStore`: the observer's single source of truth.
//!
//! All collections are held behind [`Snapshot`] handles. A mutation never
//! touches a published buffer in place: it builds a new collection (and new
//! chunk arrays where a chunk changes), then swaps the handle. A reader that
//! cloned a handle before the swap keeps a consistent view for as long as it
//! holds it.
//!
//! Consumers react to changes through [`WorldStore::subscribe`]: a selector
//! picks a slice of [`WorldState`], and the listener fires with
//! `(next, prev)` whenever that slice compares unequal after an operation.
//! [`Snapshot`] compares by pointer, so selecting a collection is cheap.
//!
//! The store lives on one thread (see [`SharedStore`]); there is no locking.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::activity::{self, ActivityEntry};
use crate::codec::{self, SurfaceCells};
use crate::error::ProtocolError;
use crate::protocol::{
    self, AgentState, AuditEntry, ChunkEvictMsg, ChunkPatchMsg, ChunkSurfaceMsg,
    ChunkVoxelPatchMsg, ChunkVoxelsMsg, ObserverMsg, Subscribe, TickMsg,
};
use crate::types::{ChunkKey, StoreStats, ViewMode, WorldBootstrap, CHUNK_AREA, CHUNK_SIZE};

/// Audits older than this many ticks are pruned.
pub const AUDIT_TTL_TICKS: u64 = 50;
/// Upper bound on retained audits, newest kept.
pub const MAX_RECENT_AUDITS: usize = 400;
/// Upper bound on activity lines, newest kept.
pub const MAX_ACTIVITY: usize = 200;

pub const MIN_CHUNK_RADIUS: i32 = 1;
pub const MAX_CHUNK_RADIUS: i32 = 32;
pub const MAX_VOXEL_RADIUS: i32 = 32;

/// Store handle shared between the connection manager, mesher and UI.
pub type SharedStore = Rc<RefCell<WorldStore>>;

// ---------------------------------------------------------------------------
// Snapshot handle
// ---------------------------------------------------------------------------

/// Immutable, reference-counted view of a published value.
///
/// Equality is identity: two snapshots are equal only if they point at the
/// same allocation.
#[derive(Debug, Default)]
pub struct Snapshot<T>(Arc<T>);

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> PartialEq for Snapshot<T> {
    fn eq(&self, other: &Self) -> bool {
        Snapshot::ptr_eq(self, other)
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Chunk collection keyed by coordinate. Values are shared, never mutated.
pub type ChunkMap<T> = HashMap<ChunkKey, Arc<T>>;

// ---------------------------------------------------------------------------
// Chunk records
// ---------------------------------------------------------------------------

/// Top-of-column surface for one chunk. Both arrays are exactly 256 long,
/// indexed `z*16 + x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSurface {
    key: ChunkKey,
    blocks: Box<[u16]>,
    heights: Box<[u8]>,
}

impl ChunkSurface {
    /// Returns `None` unless both arrays are exactly [`CHUNK_AREA`] long.
    pub fn new(key: ChunkKey, cells: SurfaceCells) -> Option<Self> {
        if cells.blocks.len() != CHUNK_AREA || cells.heights.len() != CHUNK_AREA {
            return None;
        }
        Some(Self {
            key,
            blocks: cells.blocks.into_boxed_slice(),
            heights: cells.heights.into_boxed_slice(),
        })
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn blocks(&self) -> &[u16] {
        &self.blocks
    }

    pub fn heights(&self) -> &[u8] {
        &self.heights
    }

    pub fn index(x: usize, z: usize) -> usize {
        z * CHUNK_SIZE + x
    }

    pub fn block_at(&self, x: usize, z: usize) -> Option<u16> {
        (x < CHUNK_SIZE && z < CHUNK_SIZE).then(|| self.blocks[Self::index(x, z)])
    }

    pub fn height_at(&self, x: usize, z: usize) -> Option<u8> {
        (x < CHUNK_SIZE && z < CHUNK_SIZE).then(|| self.heights[Self::index(x, z)])
    }
}

/// Full block volume for one chunk, `16*16*height` ids indexed
/// `x + z*16 + y*256`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkVoxels {
    key: ChunkKey,
    height: usize,
    blocks: Box<[u16]>,
}

impl ChunkVoxels {
    /// Returns `None` unless `blocks` is exactly `16*16*height` long.
    pub fn new(key: ChunkKey, height: usize, blocks: Vec<u16>) -> Option<Self> {
        if blocks.len() != CHUNK_AREA * height {
            return None;
        }
        Some(Self {
            key,
            height,
            blocks: blocks.into_boxed_slice(),
        })
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn blocks(&self) -> &[u16] {
        &self.blocks
    }

    pub fn index(x: usize, y: usize, z: usize) -> usize {
        x + z * CHUNK_SIZE + y * CHUNK_AREA
    }

    /// Block id at local `(x, y, z)`, or `None` outside the volume.
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<u16> {
        if x >= CHUNK_SIZE || z >= CHUNK_SIZE || y >= self.height {
            return None;
        }
        Some(self.blocks[Self::index(x, y, z)])
    }
}

// ---------------------------------------------------------------------------
// Audits
// ---------------------------------------------------------------------------

/// An audit stamped with the tick it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentAudit {
    pub audit: AuditEntry,
    pub born_tick: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Placed,
    Removed,
    Changed,
}

/// A fading marker for a recent world mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentChange {
    pub pos: [i32; 3],
    pub kind: ChangeKind,
    pub age: u64,
    pub opacity: f32,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Everything the observer knows. Read through [`WorldStore::state`];
/// mutated only through store operations.
#[derive(Debug, Clone)]
pub struct WorldState {
    pub connected: bool,
    pub connecting: bool,
    pub last_error: Option<String>,
    /// Delay before the next reconnect attempt, while one is scheduled.
    pub reconnect_delay: Option<Duration>,

    pub bootstrap: Option<Snapshot<WorldBootstrap>>,

    pub tick: u64,
    pub time_of_day: f64,
    pub weather: String,
    pub active_event_id: Option<String>,
    pub active_event_ends_tick: Option<u64>,

    pub chunk_radius: u32,
    pub max_chunks: u32,
    pub view_mode: ViewMode,
    pub voxel_radius: u32,
    pub voxel_max_chunks: u32,

    pub chunks: Snapshot<ChunkMap<ChunkSurface>>,
    pub voxels: Snapshot<ChunkMap<ChunkVoxels>>,
    pub agents: Snapshot<BTreeMap<String, AgentState>>,

    pub selected_agent_id: Option<String>,
    pub follow_agent_id: Option<String>,

    /// Newest first.
    pub activity: Snapshot<Vec<ActivityEntry>>,
    /// Newest first.
    pub recent_audits: Snapshot<Vec<RecentAudit>>,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            connected: false,
            connecting: false,
            last_error: None,
            reconnect_delay: None,
            bootstrap: None,
            tick: 0,
            time_of_day: 0.0,
            weather: "UNKNOWN".into(),
            active_event_id: None,
            active_event_ends_tick: None,
            chunk_radius: 6,
            max_chunks: 1024,
            view_mode: ViewMode::TwoD,
            voxel_radius: 4,
            voxel_max_chunks: 256,
            chunks: Snapshot::default(),
            voxels: Snapshot::default(),
            agents: Snapshot::default(),
            selected_agent_id: None,
            follow_agent_id: None,
            activity: Snapshot::default(),
            recent_audits: Snapshot::default(),
        }
    }
}

/// Every field whose change should trigger a re-subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionKey {
    pub chunk_radius: u32,
    pub max_chunks: u32,
    pub view_mode: ViewMode,
    pub voxel_radius: u32,
    pub voxel_max_chunks: u32,
    pub follow_agent_id: Option<String>,
    pub selected_agent_id: Option<String>,
}

impl WorldState {
    pub fn palette(&self) -> &[String] {
        self.bootstrap
            .as_ref()
            .map(|b| b.block_palette.as_slice())
            .unwrap_or(&[])
    }

    /// Column height from the bootstrap, if one has arrived.
    pub fn height(&self) -> Option<usize> {
        self.bootstrap.as_ref().map(|b| b.height()).filter(|h| *h > 0)
    }

    /// Palette index of `"AIR"`, falling back to 0.
    pub fn air_block_id(&self) -> u16 {
        air_block_id(self.palette())
    }

    pub fn focus_agent_id(&self) -> Option<&str> {
        self.follow_agent_id
            .as_deref()
            .or(self.selected_agent_id.as_deref())
    }

    pub fn focus_agent(&self) -> Option<&AgentState> {
        self.focus_agent_id().and_then(|id| self.agents.get(id))
    }

    pub fn subscription_key(&self) -> SubscriptionKey {
        SubscriptionKey {
            chunk_radius: self.chunk_radius,
            max_chunks: self.max_chunks,
            view_mode: self.view_mode,
            voxel_radius: self.voxel_radius,
            voxel_max_chunks: self.voxel_max_chunks,
            follow_agent_id: self.follow_agent_id.clone(),
            selected_agent_id: self.selected_agent_id.clone(),
        }
    }

    /// The `SUBSCRIBE` payload for the current configuration.
    ///
    /// The focus agent is only sent in the volumetric view; outside it the
    /// id is empty. Voxel radius and budget are zero unless the view is
    /// volumetric and there is a focus agent.
    pub fn subscription_params(&self) -> Subscribe {
        let three_d = self.view_mode == ViewMode::ThreeD;
        let focus = match self.focus_agent_id() {
            Some(id) if three_d => id.to_string(),
            _ => String::new(),
        };
        let volumetric = three_d && !focus.is_empty();
        Subscribe {
            protocol_version: protocol::PROTOCOL_VERSION.to_string(),
            chunk_radius: self.chunk_radius,
            max_chunks: self.max_chunks,
            focus_agent_id: focus,
            voxel_radius: if volumetric { self.voxel_radius } else { 0 },
            voxel_max_chunks: if volumetric { self.voxel_max_chunks } else { 0 },
        }
    }

    /// Audits still inside the TTL window at `now_tick`, with a fade-out
    /// opacity for overlay rendering.
    pub fn recent_changes(&self, now_tick: u64) -> Vec<RecentChange> {
        let air = self.air_block_id();
        self.recent_audits
            .iter()
            .filter_map(|r| {
                let age = now_tick.checked_sub(r.born_tick)?;
                if age > AUDIT_TTL_TICKS {
                    return None;
                }
                let t = 1.0 - age as f32 / AUDIT_TTL_TICKS as f32;
                let kind = match (r.audit.from == air, r.audit.to == air) {
                    (true, false) => ChangeKind::Placed,
                    (false, true) => ChangeKind::Removed,
                    _ => ChangeKind::Changed,
                };
                Some(RecentChange {
                    pos: r.audit.pos,
                    kind,
                    age,
                    opacity: (0.9 * t).clamp(0.0, 1.0),
                })
            })
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            surface_chunks: self.chunks.len(),
            voxel_chunks: self.voxels.len(),
            agents: self.agents.len(),
            recent_audits: self.recent_audits.len(),
            activity: self.activity.len(),
            tick: self.tick,
        }
    }
}

/// Palette index of `"AIR"`, or 0 when the palette is empty or lacks it.
pub fn air_block_id(palette: &[String]) -> u16 {
    palette
        .iter()
        .position(|name| name == "AIR")
        .map(|i| i as u16)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Token returned by [`WorldStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Hook = Box<dyn FnMut(&WorldState)>;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct WorldStore {
    state: WorldState,
    hooks: Vec<(SubscriptionId, Hook)>,
    next_id: u64,
    activity_seq: u64,
}

impl std::fmt::Debug for WorldStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldStore")
            .field("state", &self.state)
            .field("subscribers", &self.hooks.len())
            .finish()
    }
}

impl WorldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Watch a slice of state. `listener(next, prev)` runs after any store
    /// operation that leaves `selector(state)` unequal to its last value.
    ///
    /// Listeners receive values, not the store; they must not call back
    /// into the store.
    pub fn subscribe<T, S, F>(&mut self, selector: S, mut listener: F) -> SubscriptionId
    where
        T: PartialEq + 'static,
        S: Fn(&WorldState) -> T + 'static,
        F: FnMut(&T, &T) + 'static,
    {
        let mut last = selector(&self.state);
        let hook: Hook = Box::new(move |state: &WorldState| {
            let next = selector(state);
            if next != last {
                listener(&next, &last);
                last = next;
            }
        });

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.hooks.push((id, hook));
        id
    }

    /// Returns `false` if the token was unknown (already removed).
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(hid, _)| *hid != id);
        self.hooks.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.hooks.len()
    }

    fn publish(&mut self) {
        let state = &self.state;
        for (_, hook) in self.hooks.iter_mut() {
            hook(state);
        }
    }

    // -----------------------------------------------------------------------
    // Connection + configuration setters
    // -----------------------------------------------------------------------

    pub fn set_connecting(&mut self) {
        self.state.connecting = true;
        self.state.last_error = None;
        self.state.reconnect_delay = None;
        self.publish();
    }

    /// Settle the connection flags. Clears any scheduled reconnect.
    pub fn set_connection(&mut self, connected: bool, error: Option<String>) {
        self.state.connected = connected;
        self.state.connecting = false;
        self.state.last_error = error;
        self.state.reconnect_delay = None;
        self.publish();
    }

    /// The stream is down and another attempt follows after `delay`.
    pub fn schedule_reconnect(&mut self, error: impl Into<String>, delay: Duration) {
        self.state.connected = false;
        self.state.connecting = false;
        self.state.last_error = Some(error.into());
        self.state.reconnect_delay = Some(delay);
        self.publish();
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.state.last_error = Some(error.into());
        self.publish();
    }

    /// Replace the bootstrap wholesale. Loaded chunks are kept.
    pub fn set_bootstrap(&mut self, bootstrap: WorldBootstrap) {
        self.state.bootstrap = Some(Snapshot::new(bootstrap));
        self.publish();
    }

    pub fn select_agent(&mut self, id: Option<String>) {
        self.state.selected_agent_id = id;
        self.publish();
    }

    pub fn set_follow(&mut self, id: Option<String>) {
        self.state.follow_agent_id = id;
        self.publish();
    }

    /// Clamped to `[1, 32]`.
    pub fn set_chunk_radius(&mut self, radius: i32) {
        self.state.chunk_radius = radius.clamp(MIN_CHUNK_RADIUS, MAX_CHUNK_RADIUS) as u32;
        self.publish();
    }

    pub fn set_max_chunks(&mut self, max: u32) {
        self.state.max_chunks = max;
        self.publish();
    }

    pub fn set_view_mode(&mut self, mode: ViewMode) {
        self.state.view_mode = mode;
        self.publish();
    }

    /// Clamped to `[0, 32]`.
    pub fn set_voxel_radius(&mut self, radius: i32) {
        self.state.voxel_radius = radius.clamp(0, MAX_VOXEL_RADIUS) as u32;
        self.publish();
    }

    pub fn set_voxel_max_chunks(&mut self, max: u32) {
        self.state.voxel_max_chunks = max;
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Route a decoded message to its ingestion operation.
    /// Returns whether the state changed.
    pub fn dispatch(&mut self, msg: &ObserverMsg) -> bool {
        match msg {
            ObserverMsg::Tick(m) => {
                self.ingest_tick(m);
                true
            }
            ObserverMsg::ChunkSurface(m) => self.ingest_chunk_surface(m),
            ObserverMsg::ChunkPatch(m) => self.ingest_chunk_patch(m),
            ObserverMsg::ChunkEvict(m) => self.ingest_chunk_evict(m),
            ObserverMsg::ChunkVoxels(m) => self.ingest_chunk_voxels(m),
            ObserverMsg::ChunkVoxelPatch(m) => self.ingest_chunk_voxel_patch(m),
            ObserverMsg::ChunkVoxelsEvict(m) => self.ingest_chunk_voxels_evict(m),
        }
    }

    /// Decode and dispatch one text frame.
    pub fn apply_frame(&mut self, text: &str) -> Result<bool, ProtocolError> {
        let msg = protocol::decode_message(text)?;
        Ok(self.dispatch(&msg))
    }

    // -----------------------------------------------------------------------
    // TICK
    // -----------------------------------------------------------------------

    pub fn ingest_tick(&mut self, m: &TickMsg) {
        let tick = m.tick;

        // Activity: lines in arrival order, each prepended to the previous log.
        let mut raw: Vec<(String, &str)> = Vec::new();
        for j in &m.joins {
            raw.push((activity::format_join(tick, j), j.agent_id.as_str()));
        }
        for id in &m.leaves {
            raw.push((activity::format_leave(tick, id), id.as_str()));
        }
        for a in &m.actions {
            for line in activity::format_act(&a.agent_id, &a.act, tick) {
                raw.push((line, a.agent_id.as_str()));
            }
        }
        for a in &m.audits {
            raw.push((activity::format_audit(a), a.actor.as_str()));
        }
        let lines: Vec<ActivityEntry> = raw
            .into_iter()
            .map(|(text, agent)| {
                self.activity_seq += 1;
                ActivityEntry::new(self.activity_seq, tick, text, Some(agent))
            })
            .collect();
        let activity = if lines.is_empty() {
            self.state.activity.clone()
        } else {
            let prev = &self.state.activity;
            let mut next: Vec<ActivityEntry> = lines.into_iter().rev().collect();
            next.truncate(MAX_ACTIVITY);
            let room = MAX_ACTIVITY - next.len();
            next.extend(prev.iter().take(room).cloned());
            Snapshot::new(next)
        };

        // Agents: replaced wholesale.
        let agents: BTreeMap<String, AgentState> = m
            .agents
            .iter()
            .map(|a| (a.id.clone(), a.clone()))
            .collect();

        // Audits: prune against the arriving tick, then prepend new ones.
        let mut recent: Vec<RecentAudit> = m
            .audits
            .iter()
            .rev()
            .map(|a| RecentAudit {
                audit: a.clone(),
                born_tick: tick,
            })
            .collect();
        recent.extend(
            self.state
                .recent_audits
                .iter()
                .filter(|r| tick.checked_sub(r.born_tick).map_or(true, |age| age <= AUDIT_TTL_TICKS))
                .cloned(),
        );
        recent.truncate(MAX_RECENT_AUDITS);

        let st = &mut self.state;
        st.tick = tick;
        st.time_of_day = m.time_of_day;
        st.weather = m.weather.clone();
        st.active_event_id = m.active_event_id.clone();
        st.active_event_ends_tick = m.active_event_ends_tick;
        st.agents = Snapshot::new(agents);
        st.activity = activity;
        st.recent_audits = Snapshot::new(recent);
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Surface chunks
    // -----------------------------------------------------------------------

    /// Upsert a full surface. Undecodable payloads are dropped.
    pub fn ingest_chunk_surface(&mut self, m: &ChunkSurfaceMsg) -> bool {
        let key = m.key();
        let surface = match codec::decode_surface_payload(&m.encoding, &m.data) {
            Ok(cells) => ChunkSurface::new(key, cells),
            Err(e) => {
                debug!("Dropping CHUNK_SURFACE {}: {}", key, e);
                return false;
            }
        };
        let Some(surface) = surface else {
            return false;
        };

        let mut next = ChunkMap::clone(&self.state.chunks);
        next.insert(key, Arc::new(surface));
        self.state.chunks = Snapshot::new(next);
        self.publish();
        true
    }

    /// Apply sparse cells to a loaded surface. Never creates a chunk.
    pub fn ingest_chunk_patch(&mut self, m: &ChunkPatchMsg) -> bool {
        let key = m.key();
        let Some(prev) = self.state.chunks.get(&key) else {
            debug!("Dropping CHUNK_PATCH for unloaded chunk {}", key);
            return false;
        };
        if m.cells.is_empty() {
            return false;
        }

        let mut blocks = prev.blocks.to_vec();
        let mut heights = prev.heights.to_vec();
        for c in &m.cells {
            let (Some(x), Some(z)) = (local(c.x, CHUNK_SIZE), local(c.z, CHUNK_SIZE)) else {
                continue;
            };
            let idx = ChunkSurface::index(x, z);
            blocks[idx] = c.block;
            heights[idx] = c.y;
        }

        let patched = ChunkSurface {
            key,
            blocks: blocks.into_boxed_slice(),
            heights: heights.into_boxed_slice(),
        };
        let mut next = ChunkMap::clone(&self.state.chunks);
        next.insert(key, Arc::new(patched));
        self.state.chunks = Snapshot::new(next);
        self.publish();
        true
    }

    pub fn ingest_chunk_evict(&mut self, m: &ChunkEvictMsg) -> bool {
        let key = m.key();
        if !self.state.chunks.contains_key(&key) {
            return false;
        }
        let mut next = ChunkMap::clone(&self.state.chunks);
        next.remove(&key);
        self.state.chunks = Snapshot::new(next);
        self.publish();
        true
    }

    // -----------------------------------------------------------------------
    // Voxel chunks
    // -----------------------------------------------------------------------

    /// Upsert a full volume. Requires a bootstrap for the column height.
    pub fn ingest_chunk_voxels(&mut self, m: &ChunkVoxelsMsg) -> bool {
        let key = m.key();
        let Some(height) = self.state.height() else {
            debug!("Dropping CHUNK_VOXELS {}: no bootstrap height yet", key);
            return false;
        };
        let voxels = match codec::decode_voxel_payload(&m.encoding, &m.data, height) {
            Ok(blocks) => ChunkVoxels::new(key, height, blocks),
            Err(e) => {
                debug!("Dropping CHUNK_VOXELS {}: {}", key, e);
                return false;
            }
        };
        let Some(voxels) = voxels else {
            return false;
        };

        let mut next = ChunkMap::clone(&self.state.voxels);
        next.insert(key, Arc::new(voxels));
        self.state.voxels = Snapshot::new(next);
        self.publish();
        true
    }

    /// Apply sparse cells to a loaded volume. Never creates a chunk.
    pub fn ingest_chunk_voxel_patch(&mut self, m: &ChunkVoxelPatchMsg) -> bool {
        let key = m.key();
        let Some(prev) = self.state.voxels.get(&key) else {
            debug!("Dropping CHUNK_VOXEL_PATCH for unloaded chunk {}", key);
            return false;
        };
        if m.cells.is_empty() {
            return false;
        }

        let height = prev.height;
        let mut blocks = prev.blocks.to_vec();
        for c in &m.cells {
            let (Some(x), Some(y), Some(z)) = (
                local(c.x, CHUNK_SIZE),
                local(c.y, height),
                local(c.z, CHUNK_SIZE),
            ) else {
                continue;
            };
            blocks[ChunkVoxels::index(x, y, z)] = c.block;
        }

        let patched = ChunkVoxels {
            key,
            height,
            blocks: blocks.into_boxed_slice(),
        };
        let mut next = ChunkMap::clone(&self.state.voxels);
        next.insert(key, Arc::new(patched));
        self.state.voxels = Snapshot::new(next);
        self.publish();
        true
    }

    pub fn ingest_chunk_voxels_evict(&mut self, m: &ChunkEvictMsg) -> bool {
        let key = m.key();
        if !self.state.voxels.contains_key(&key) {
            return false;
        }
        let mut next = ChunkMap::clone(&self.state.voxels);
        next.remove(&key);
        self.state.voxels = Snapshot::new(next);
        self.publish();
        true
    }
}

/// `Some(v)` when `0 <= v < bound`.
fn local(v: i32, bound: usize) -> Option<usize> {
    usize::try_from(v).ok().filter(|v| *v < bound)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn defaults_match_observer_defaults() {
        let s = WorldState::default();
        assert_eq!(s.chunk_radius, 6);
        assert_eq!(s.max_chunks, 1024);
        assert_eq!(s.weather, "UNKNOWN");
        assert!(s.chunks.is_empty());
        assert_eq!(s.air_block_id(), 0);
    }

    #[test]
    fn snapshot_equality_is_identity() {
        let a = Snapshot::new(vec![1, 2, 3]);
        let b = a.clone();
        let c = Snapshot::new(vec![1, 2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn chunk_radius_is_clamped() {
        let mut store = WorldStore::new();
        store.set_chunk_radius(0);
        assert_eq!(store.state().chunk_radius, 1);
        store.set_chunk_radius(99);
        assert_eq!(store.state().chunk_radius, 32);
        store.set_chunk_radius(-5);
        assert_eq!(store.state().chunk_radius, 1);
        store.set_chunk_radius(12);
        assert_eq!(store.state().chunk_radius, 12);
    }

    #[test]
    fn voxel_radius_is_clamped() {
        let mut store = WorldStore::new();
        store.set_voxel_radius(-1);
        assert_eq!(store.state().voxel_radius, 0);
        store.set_voxel_radius(40);
        assert_eq!(store.state().voxel_radius, 32);
    }

    #[test]
    fn listener_fires_only_on_slice_change() {
        let mut store = WorldStore::new();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        store.subscribe(|s| s.chunk_radius, move |next, prev| {
            assert_ne!(next, prev);
            f.set(f.get() + 1);
        });

        store.select_agent(Some("A01".into()));
        assert_eq!(fired.get(), 0);
        store.set_chunk_radius(8);
        assert_eq!(fired.get(), 1);
        store.set_chunk_radius(8);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let mut store = WorldStore::new();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        let id = store.subscribe(|s| s.follow_agent_id.clone(), move |_, _| f.set(f.get() + 1));
        store.set_follow(Some("A01".into()));
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set_follow(Some("A02".into()));
        assert_eq!(fired.get(), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn subscription_params_follow_falls_back_to_selected() {
        let mut store = WorldStore::new();
        store.set_view_mode(ViewMode::ThreeD);
        store.select_agent(Some("A02".into()));
        assert_eq!(store.state().subscription_params().focus_agent_id, "A02");
        store.set_follow(Some("A01".into()));
        assert_eq!(store.state().subscription_params().focus_agent_id, "A01");
    }

    #[test]
    fn subscription_params_zero_voxels_outside_3d() {
        let mut store = WorldStore::new();
        store.set_voxel_radius(5);
        store.set_follow(Some("A01".into()));
        let p = store.state().subscription_params();
        assert_eq!(p.focus_agent_id, "");
        assert_eq!((p.voxel_radius, p.voxel_max_chunks), (0, 0));

        store.set_view_mode(ViewMode::ThreeD);
        let p = store.state().subscription_params();
        assert_eq!(p.focus_agent_id, "A01");
        assert_eq!((p.voxel_radius, p.voxel_max_chunks), (5, 256));

        store.set_follow(None);
        let p = store.state().subscription_params();
        assert_eq!(p.focus_agent_id, "");
        assert_eq!((p.voxel_radius, p.voxel_max_chunks), (0, 0));
    }

    #[test]
    fn reconnect_delay_cleared_by_connecting_and_open() {
        let mut store = WorldStore::new();
        store.schedule_reconnect("ws: refused", Duration::from_millis(425));
        assert_eq!(store.state().reconnect_delay, Some(Duration::from_millis(425)));
        assert_eq!(store.state().last_error.as_deref(), Some("ws: refused"));
        assert!(!store.state().connected);

        store.set_connecting();
        assert_eq!(store.state().reconnect_delay, None);
        store.schedule_reconnect("ws: refused", Duration::from_millis(723));
        store.set_connection(true, None);
        assert_eq!(store.state().reconnect_delay, None);
        assert!(store.state().last_error.is_none());
    }

    #[test]
    fn local_bounds() {
        assert_eq!(local(0, 16), Some(0));
        assert_eq!(local(15, 16), Some(15));
        assert_eq!(local(16, 16), None);
        assert_eq!(local(-1, 16), None);
    }

    #[test]
    fn surface_constructor_enforces_length() {
        let short = SurfaceCells {
            blocks: vec![0; 10],
            heights: vec![0; CHUNK_AREA],
        };
        assert!(ChunkSurface::new(ChunkKey::new(0, 0), short).is_none());
        assert!(ChunkVoxels::new(ChunkKey::new(0, 0), 2, vec![0; CHUNK_AREA]).is_none());
        assert!(ChunkVoxels::new(ChunkKey::new(0, 0), 2, vec![0; CHUNK_AREA * 2]).is_some());
    }
}
