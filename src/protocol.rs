//! Observer wire protocol.
//!
//! This module owns **every message that crosses the connection boundary**
//! between the world server and the observer.
//!
//! ## Message kinds
//!
//! | `type`               | Direction          | Payload                    |
//! |----------------------|--------------------|----------------------------|
//! | `SUBSCRIBE`          | observer → server  | [`Subscribe`]              |
//! | `TICK`               | server → observer  | [`TickMsg`]                |
//! | `CHUNK_SURFACE`      | server → observer  | [`ChunkSurfaceMsg`]        |
//! | `CHUNK_PATCH`        | server → observer  | [`ChunkPatchMsg`]          |
//! | `CHUNK_EVICT`        | server → observer  | [`ChunkEvictMsg`]          |
//! | `CHUNK_VOXELS`       | server → observer  | [`ChunkVoxelsMsg`]         |
//! | `CHUNK_VOXEL_PATCH`  | server → observer  | [`ChunkVoxelPatchMsg`]     |
//! | `CHUNK_VOXELS_EVICT` | server → observer  | [`ChunkEvictMsg`]          |
//!
//! ## Design rules
//!
//! 1. Every message is a JSON object carrying `type` and `protocol_version`.
//! 2. Inbound messages decode into the [`ObserverMsg`] sum type keyed by
//!    `type`; unknown or missing kinds are rejected, never guessed.
//! 3. Chunk payloads are base64 strings; [`crate::codec`] validates them.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ChunkKey, Vec3};

pub const PROTOCOL_VERSION: &str = "0.1";

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Subscription parameters sent on open and whenever they change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub protocol_version: String,
    pub chunk_radius: u32,
    pub max_chunks: u32,
    /// Empty string when there is no focus agent.
    pub focus_agent_id: String,
    pub voxel_radius: u32,
    pub voxel_max_chunks: u32,
}

impl Subscribe {
    /// Serialise as a tagged `SUBSCRIBE` frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Tagged<'a> {
            #[serde(rename = "type")]
            kind: &'static str,
            #[serde(flatten)]
            body: &'a Subscribe,
        }
        serde_json::to_string(&Tagged {
            kind: kinds::SUBSCRIBE,
            body: self,
        })
    }
}

// ---------------------------------------------------------------------------
// TICK
// ---------------------------------------------------------------------------

/// A move or work task currently held by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<[f32; 3]>,
    pub progress: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ticks: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    pub name: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub pos: [f32; 3],
    /// Degrees.
    pub yaw: f32,
    pub hp: f32,
    pub hunger: f32,
    pub stamina_milli: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_task: Option<AgentTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_task: Option<AgentTask>,
}

impl AgentState {
    pub fn position(&self) -> Vec3 {
        Vec3::from(self.pos)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinInfo {
    pub agent_id: String,
    pub name: String,
}

/// An agent's submitted action document, relayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    pub agent_id: String,
    #[serde(default)]
    pub act: serde_json::Value,
}

/// A recorded world mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub tick: u64,
    pub actor: String,
    pub action: String,
    pub pos: [i32; 3],
    pub from: u16,
    pub to: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMsg {
    #[serde(default)]
    pub protocol_version: String,
    pub tick: u64,
    #[serde(default)]
    pub time_of_day: f64,
    #[serde(default)]
    pub weather: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_event_ends_tick: Option<u64>,
    #[serde(default)]
    pub agents: Vec<AgentState>,
    #[serde(default)]
    pub joins: Vec<JoinInfo>,
    #[serde(default)]
    pub leaves: Vec<String>,
    #[serde(default)]
    pub actions: Vec<RecordedAction>,
    #[serde(default)]
    pub audits: Vec<AuditEntry>,
}

// ---------------------------------------------------------------------------
// Chunk messages
// ---------------------------------------------------------------------------

/// Full 2-D surface of one chunk (`PAL16_Y8`, 768 bytes once decoded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSurfaceMsg {
    #[serde(default)]
    pub protocol_version: String,
    pub cx: i32,
    pub cz: i32,
    pub encoding: String,
    /// Base64 payload.
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfacePatchCell {
    pub x: i32,
    pub z: i32,
    pub block: u16,
    pub y: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPatchMsg {
    #[serde(default)]
    pub protocol_version: String,
    pub cx: i32,
    pub cz: i32,
    #[serde(default)]
    pub cells: Vec<SurfacePatchCell>,
}

/// Shared shape of `CHUNK_EVICT` and `CHUNK_VOXELS_EVICT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEvictMsg {
    #[serde(default)]
    pub protocol_version: String,
    pub cx: i32,
    pub cz: i32,
}

/// Full volume of one chunk (`PAL16_U16LE_YZX`, `16*16*height*2` bytes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkVoxelsMsg {
    #[serde(default)]
    pub protocol_version: String,
    pub cx: i32,
    pub cz: i32,
    pub encoding: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoxelPatchCell {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub block: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkVoxelPatchMsg {
    #[serde(default)]
    pub protocol_version: String,
    pub cx: i32,
    pub cz: i32,
    #[serde(default)]
    pub cells: Vec<VoxelPatchCell>,
}

macro_rules! chunk_key_accessor {
    ($($ty:ty),*) => {
        $(impl $ty {
            pub fn key(&self) -> ChunkKey {
                ChunkKey::new(self.cx, self.cz)
            }
        })*
    };
}

chunk_key_accessor!(
    ChunkSurfaceMsg,
    ChunkPatchMsg,
    ChunkEvictMsg,
    ChunkVoxelsMsg,
    ChunkVoxelPatchMsg
);

// ---------------------------------------------------------------------------
// Inbound sum type
// ---------------------------------------------------------------------------

/// Every message the server may send, keyed by its `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObserverMsg {
    #[serde(rename = "TICK")]
    Tick(TickMsg),
    #[serde(rename = "CHUNK_SURFACE")]
    ChunkSurface(ChunkSurfaceMsg),
    #[serde(rename = "CHUNK_PATCH")]
    ChunkPatch(ChunkPatchMsg),
    #[serde(rename = "CHUNK_EVICT")]
    ChunkEvict(ChunkEvictMsg),
    #[serde(rename = "CHUNK_VOXELS")]
    ChunkVoxels(ChunkVoxelsMsg),
    #[serde(rename = "CHUNK_VOXEL_PATCH")]
    ChunkVoxelPatch(ChunkVoxelPatchMsg),
    #[serde(rename = "CHUNK_VOXELS_EVICT")]
    ChunkVoxelsEvict(ChunkEvictMsg),
}

impl ObserverMsg {
    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ObserverMsg::Tick(_) => kinds::TICK,
            ObserverMsg::ChunkSurface(_) => kinds::CHUNK_SURFACE,
            ObserverMsg::ChunkPatch(_) => kinds::CHUNK_PATCH,
            ObserverMsg::ChunkEvict(_) => kinds::CHUNK_EVICT,
            ObserverMsg::ChunkVoxels(_) => kinds::CHUNK_VOXELS,
            ObserverMsg::ChunkVoxelPatch(_) => kinds::CHUNK_VOXEL_PATCH,
            ObserverMsg::ChunkVoxelsEvict(_) => kinds::CHUNK_VOXELS_EVICT,
        }
    }

    /// Volumetric messages; a voxel payload can only be sized once the
    /// bootstrap's column height is known.
    pub fn needs_height(&self) -> bool {
        matches!(
            self,
            ObserverMsg::ChunkVoxels(_)
                | ObserverMsg::ChunkVoxelPatch(_)
                | ObserverMsg::ChunkVoxelsEvict(_)
        )
    }
}

/// Parse one inbound text frame.
///
/// The tag is checked first so that an unrecognised kind is reported as
/// [`ProtocolError::UnknownType`] rather than a generic schema failure.
pub fn decode_message(text: &str) -> Result<ObserverMsg, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?;

    if !kinds::INBOUND.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

/// All message `type` tags, as constants.
pub mod kinds {
    pub const SUBSCRIBE: &str = "SUBSCRIBE";

    pub const TICK: &str = "TICK";
    pub const CHUNK_SURFACE: &str = "CHUNK_SURFACE";
    pub const CHUNK_PATCH: &str = "CHUNK_PATCH";
    pub const CHUNK_EVICT: &str = "CHUNK_EVICT";
    pub const CHUNK_VOXELS: &str = "CHUNK_VOXELS";
    pub const CHUNK_VOXEL_PATCH: &str = "CHUNK_VOXEL_PATCH";
    pub const CHUNK_VOXELS_EVICT: &str = "CHUNK_VOXELS_EVICT";

    pub const INBOUND: [&str; 7] = [
        TICK,
        CHUNK_SURFACE,
        CHUNK_PATCH,
        CHUNK_EVICT,
        CHUNK_VOXELS,
        CHUNK_VOXEL_PATCH,
        CHUNK_VOXELS_EVICT,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_is_tagged() {
        let sub = Subscribe {
            protocol_version: PROTOCOL_VERSION.into(),
            chunk_radius: 6,
            max_chunks: 1024,
            focus_agent_id: "A01".into(),
            voxel_radius: 4,
            voxel_max_chunks: 256,
        };
        let frame = sub.to_frame().unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "SUBSCRIBE");
        assert_eq!(v["protocol_version"], "0.1");
        assert_eq!(v["chunk_radius"], 6);
        assert_eq!(v["focus_agent_id"], "A01");
        assert_eq!(v["voxel_max_chunks"], 256);
    }

    #[test]
    fn decodes_tick_with_missing_lists() {
        let msg = decode_message(
            r#"{"type":"TICK","protocol_version":"0.1","tick":7,"time_of_day":0.5,"weather":"CLEAR","agents":[]}"#,
        )
        .unwrap();
        match msg {
            ObserverMsg::Tick(t) => {
                assert_eq!(t.tick, 7);
                assert!(t.joins.is_empty());
                assert!(t.audits.is_empty());
            }
            other => panic!("expected TICK, got {:?}", other),
        }
    }

    #[test]
    fn voxels_evict_shares_evict_shape() {
        let msg =
            decode_message(r#"{"type":"CHUNK_VOXELS_EVICT","protocol_version":"0.1","cx":-2,"cz":5}"#)
                .unwrap();
        assert_eq!(msg.kind(), kinds::CHUNK_VOXELS_EVICT);
        if let ObserverMsg::ChunkVoxelsEvict(m) = msg {
            assert_eq!(m.key(), ChunkKey::new(-2, 5));
        } else {
            panic!("expected CHUNK_VOXELS_EVICT");
        }
    }

    #[test]
    fn only_voxel_kinds_need_height() {
        let evict = r#"{"type":"CHUNK_VOXELS_EVICT","protocol_version":"0.1","cx":1,"cz":2}"#;
        assert!(decode_message(evict).unwrap().needs_height());
        let evict = r#"{"type":"CHUNK_EVICT","protocol_version":"0.1","cx":1,"cz":2}"#;
        assert!(!decode_message(evict).unwrap().needs_height());
        let tick = r#"{"type":"TICK","protocol_version":"0.1","tick":3}"#;
        assert!(!decode_message(tick).unwrap().needs_height());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = decode_message(r#"{"type":"HELLO","protocol_version":"0.1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref k) if k == "HELLO"));
    }

    #[test]
    fn missing_kind_is_rejected() {
        let err = decode_message(r#"{"cx":0,"cz":0}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));

        let err = decode_message(r#"{"type":5}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn schema_violation_is_malformed() {
        let err = decode_message(r#"{"type":"CHUNK_EVICT","cx":"zero","cz":0}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let err = decode_message("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
