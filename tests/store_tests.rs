//! World store integration tests

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;

    use serde_json::json;
    use voxel_observer::activity::fresh_entries;
    use voxel_observer::codec::{encode_base64, SURFACE_BYTES};
    use voxel_observer::protocol::{AgentState, AuditEntry, ChunkEvictMsg, TickMsg};
    use voxel_observer::store::{
        ChangeKind, ChunkSurface, Snapshot, WorldStore, AUDIT_TTL_TICKS, MAX_ACTIVITY, MAX_RECENT_AUDITS,
    };
    use voxel_observer::types::{ChunkKey, WorldBootstrap, WorldParams, CHUNK_AREA};

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    fn bootstrap(height: u32, palette: &[&str]) -> WorldBootstrap {
        WorldBootstrap {
            protocol_version: "0.1".into(),
            world_id: "test".into(),
            tick: 0,
            world_params: WorldParams {
                tick_rate_hz: 5.0,
                chunk_size: [16, 16, height],
                height,
                seed: 1337,
                boundary_radius: 4000.0,
            },
            block_palette: palette.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn patterned_surface() -> Vec<u8> {
        (0..SURFACE_BYTES).map(|i| (i * 13 % 256) as u8).collect()
    }

    fn surface_frame(cx: i32, cz: i32, bytes: &[u8]) -> String {
        json!({
            "type": "CHUNK_SURFACE",
            "protocol_version": "0.1",
            "cx": cx,
            "cz": cz,
            "encoding": "PAL16_Y8",
            "data": encode_base64(bytes),
        })
        .to_string()
    }

    fn patch_frame(cx: i32, cz: i32, cells: serde_json::Value) -> String {
        json!({
            "type": "CHUNK_PATCH",
            "protocol_version": "0.1",
            "cx": cx,
            "cz": cz,
            "cells": cells,
        })
        .to_string()
    }

    fn voxel_frame(cx: i32, cz: i32, blocks: &[u16]) -> String {
        let bytes: Vec<u8> = blocks.iter().flat_map(|b| b.to_le_bytes()).collect();
        json!({
            "type": "CHUNK_VOXELS",
            "protocol_version": "0.1",
            "cx": cx,
            "cz": cz,
            "encoding": "PAL16_U16LE_YZX",
            "data": encode_base64(&bytes),
        })
        .to_string()
    }

    fn voxel_patch_frame(cx: i32, cz: i32, cells: serde_json::Value) -> String {
        json!({
            "type": "CHUNK_VOXEL_PATCH",
            "protocol_version": "0.1",
            "cx": cx,
            "cz": cz,
            "cells": cells,
        })
        .to_string()
    }

    fn agent(id: &str) -> AgentState {
        AgentState {
            id: id.into(),
            name: format!("bot-{id}"),
            connected: true,
            org_id: None,
            pos: [0.0, 22.0, 0.0],
            yaw: 0.0,
            hp: 20.0,
            hunger: 20.0,
            stamina_milli: 1000.0,
            move_task: None,
            work_task: None,
        }
    }

    fn audit(tick: u64, from: u16, to: u16) -> AuditEntry {
        AuditEntry {
            tick,
            actor: "A01".into(),
            action: "SET_BLOCK".into(),
            pos: [1, 2, 3],
            from,
            to,
            reason: None,
        }
    }

    fn tick(n: u64) -> TickMsg {
        TickMsg {
            protocol_version: "0.1".into(),
            tick: n,
            time_of_day: 0.25,
            weather: "CLEAR".into(),
            active_event_id: None,
            active_event_ends_tick: None,
            agents: vec![],
            joins: vec![],
            leaves: vec![],
            actions: vec![],
            audits: vec![],
        }
    }

    fn loaded_store() -> WorldStore {
        let mut store = WorldStore::new();
        store.set_bootstrap(bootstrap(1, &["AIR", "DIRT"]));
        store
            .apply_frame(&surface_frame(0, 0, &patterned_surface()))
            .unwrap();
        store
            .apply_frame(&surface_frame(1, 0, &patterned_surface()))
            .unwrap();
        store
    }

    // -----------------------------------------------------------------------
    // Surface ingestion
    // -----------------------------------------------------------------------

    #[test]
    fn end_to_end_surface_then_patch() {
        let mut store = WorldStore::new();
        store.set_bootstrap(bootstrap(1, &["AIR", "DIRT"]));

        let bytes = patterned_surface();
        assert!(store.apply_frame(&surface_frame(0, 0, &bytes)).unwrap());

        let chunk = Arc::clone(&store.state().chunks[&ChunkKey::new(0, 0)]);
        for i in 0..CHUNK_AREA {
            let block = bytes[3 * i] as u16 | (bytes[3 * i + 1] as u16) << 8;
            assert_eq!(chunk.blocks()[i], block);
            assert_eq!(chunk.heights()[i], bytes[3 * i + 2]);
        }

        let patch = patch_frame(0, 0, json!([{ "x": 9, "z": 9, "block": 5, "y": 0 }]));
        assert!(store.apply_frame(&patch).unwrap());

        let patched = &store.state().chunks[&ChunkKey::new(0, 0)];
        assert_eq!(patched.blocks()[9 * 16 + 9], 5);
        assert_eq!(patched.heights()[9 * 16 + 9], 0);
        // The snapshot taken before the patch is untouched.
        assert_eq!(chunk.blocks()[9 * 16 + 9], bytes[3 * 153] as u16 | (bytes[3 * 153 + 1] as u16) << 8);
    }

    #[test]
    fn surface_upsert_replaces_whole_chunk() {
        let mut store = loaded_store();
        let zeros = vec![0u8; SURFACE_BYTES];
        store.apply_frame(&surface_frame(0, 0, &zeros)).unwrap();
        let chunk = &store.state().chunks[&ChunkKey::new(0, 0)];
        assert!(chunk.blocks().iter().all(|b| *b == 0));
        assert!(chunk.heights().iter().all(|h| *h == 0));
    }

    #[test]
    fn malformed_surface_is_dropped_without_publishing() {
        let mut store = loaded_store();
        let before = store.state().chunks.clone();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        store.subscribe(|s| s.chunks.clone(), move |_, _| f.set(f.get() + 1));

        assert!(!store.apply_frame(&surface_frame(0, 0, &[1, 2, 3])).unwrap());
        let wrong_encoding = json!({
            "type": "CHUNK_SURFACE", "protocol_version": "0.1",
            "cx": 0, "cz": 0, "encoding": "RLE", "data": "AAAA",
        });
        assert!(!store.apply_frame(&wrong_encoding.to_string()).unwrap());

        assert_eq!(fired.get(), 0);
        assert_eq!(store.state().chunks, before);
    }

    #[test]
    fn empty_patch_leaves_chunk_identical() {
        let mut store = loaded_store();
        let key = ChunkKey::new(0, 0);
        let before = Arc::clone(&store.state().chunks[&key]);

        assert!(!store.apply_frame(&patch_frame(0, 0, json!([]))).unwrap());
        assert!(Arc::ptr_eq(&before, &store.state().chunks[&key]));
    }

    #[test]
    fn patch_is_idempotent() {
        let mut store = loaded_store();
        let key = ChunkKey::new(0, 0);
        let cells = json!([
            { "x": 0, "z": 0, "block": 7, "y": 3 },
            { "x": 15, "z": 15, "block": 8, "y": 4 }
        ]);
        store.apply_frame(&patch_frame(0, 0, cells.clone())).unwrap();
        let once: ChunkSurface = (*store.state().chunks[&key]).clone();
        store.apply_frame(&patch_frame(0, 0, cells)).unwrap();
        assert_eq!(*store.state().chunks[&key], once);
    }

    #[test]
    fn patch_never_touches_other_chunks() {
        let mut store = loaded_store();
        let other = Arc::clone(&store.state().chunks[&ChunkKey::new(1, 0)]);
        let other_bytes = other.blocks().to_vec();

        store
            .apply_frame(&patch_frame(0, 0, json!([{ "x": 1, "z": 1, "block": 9, "y": 9 }])))
            .unwrap();

        let after = &store.state().chunks[&ChunkKey::new(1, 0)];
        assert!(Arc::ptr_eq(&other, after));
        assert_eq!(after.blocks(), other_bytes.as_slice());
    }

    #[test]
    fn patch_skips_out_of_range_cells() {
        let mut store = loaded_store();
        let key = ChunkKey::new(0, 0);
        let before: ChunkSurface = (*store.state().chunks[&key]).clone();
        store
            .apply_frame(&patch_frame(
                0,
                0,
                json!([
                    { "x": 16, "z": 0, "block": 1, "y": 1 },
                    { "x": -1, "z": 0, "block": 1, "y": 1 },
                    { "x": 0, "z": 16, "block": 1, "y": 1 }
                ]),
            ))
            .unwrap();
        assert_eq!(*store.state().chunks[&key], before);
    }

    #[test]
    fn patch_never_creates_a_chunk() {
        let mut store = WorldStore::new();
        assert!(!store
            .apply_frame(&patch_frame(4, 4, json!([{ "x": 0, "z": 0, "block": 1, "y": 1 }])))
            .unwrap());
        assert!(store.state().chunks.is_empty());
    }

    #[test]
    fn evict_removes_and_later_patch_is_noop() {
        let mut store = loaded_store();
        let evict = ChunkEvictMsg {
            protocol_version: "0.1".into(),
            cx: 0,
            cz: 0,
        };
        assert!(store.ingest_chunk_evict(&evict));
        assert!(!store.state().chunks.contains_key(&ChunkKey::new(0, 0)));
        assert!(!store.ingest_chunk_evict(&evict));

        store
            .apply_frame(&patch_frame(0, 0, json!([{ "x": 0, "z": 0, "block": 1, "y": 1 }])))
            .unwrap();
        assert!(!store.state().chunks.contains_key(&ChunkKey::new(0, 0)));
        assert_eq!(store.state().chunks.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Voxel ingestion
    // -----------------------------------------------------------------------

    #[test]
    fn voxels_before_bootstrap_are_dropped() {
        let mut store = WorldStore::new();
        let blocks = vec![1u16; CHUNK_AREA * 2];
        assert!(!store.apply_frame(&voxel_frame(0, 0, &blocks)).unwrap());
        assert!(store.state().voxels.is_empty());
    }

    #[test]
    fn voxels_must_match_bootstrap_height() {
        let mut store = WorldStore::new();
        store.set_bootstrap(bootstrap(2, &["AIR", "STONE"]));
        assert!(!store
            .apply_frame(&voxel_frame(0, 0, &vec![1u16; CHUNK_AREA * 3]))
            .unwrap());
        assert!(store
            .apply_frame(&voxel_frame(0, 0, &vec![1u16; CHUNK_AREA * 2]))
            .unwrap());
        assert_eq!(store.state().voxels[&ChunkKey::new(0, 0)].height(), 2);
    }

    #[test]
    fn voxel_patch_uses_yzx_index_and_height_bound() {
        let mut store = WorldStore::new();
        store.set_bootstrap(bootstrap(2, &["AIR", "STONE"]));
        store
            .apply_frame(&voxel_frame(0, 0, &vec![0u16; CHUNK_AREA * 2]))
            .unwrap();
        let before = Arc::clone(&store.state().voxels[&ChunkKey::new(0, 0)]);

        let patch = json!({
            "type": "CHUNK_VOXEL_PATCH",
            "protocol_version": "0.1",
            "cx": 0,
            "cz": 0,
            "cells": [
                { "x": 3, "y": 1, "z": 2, "block": 1 },
                { "x": 3, "y": 2, "z": 2, "block": 1 }
            ],
        });
        assert!(store.apply_frame(&patch.to_string()).unwrap());

        let after = &store.state().voxels[&ChunkKey::new(0, 0)];
        assert_eq!(after.blocks()[3 + 2 * 16 + 256], 1);
        assert_eq!(after.blocks().iter().filter(|b| **b == 1).count(), 1);
        assert_eq!(before.get(3, 1, 2), Some(0));
    }

    #[test]
    fn voxel_evict_is_independent_of_surface() {
        let mut store = loaded_store();
        store
            .apply_frame(&voxel_frame(0, 0, &vec![1u16; CHUNK_AREA]))
            .unwrap();
        store
            .apply_frame(r#"{"type":"CHUNK_VOXELS_EVICT","protocol_version":"0.1","cx":0,"cz":0}"#)
            .unwrap();
        assert!(store.state().voxels.is_empty());
        assert!(store.state().chunks.contains_key(&ChunkKey::new(0, 0)));
    }

    #[test]
    fn voxel_patch_never_creates_a_chunk() {
        let mut store = WorldStore::new();
        store.set_bootstrap(bootstrap(2, &["AIR", "STONE"]));
        let before = store.state().voxels.clone();

        assert!(!store
            .apply_frame(&voxel_patch_frame(5, -5, json!([{ "x": 0, "y": 0, "z": 0, "block": 1 }])))
            .unwrap());
        assert!(store.state().voxels.is_empty());
        assert!(Snapshot::ptr_eq(&before, &store.state().voxels));
    }

    #[test]
    fn voxel_evict_then_patch_is_noop() {
        let mut store = WorldStore::new();
        store.set_bootstrap(bootstrap(2, &["AIR", "STONE"]));
        store
            .apply_frame(&voxel_frame(0, 0, &vec![0u16; CHUNK_AREA * 2]))
            .unwrap();
        store
            .apply_frame(r#"{"type":"CHUNK_VOXELS_EVICT","protocol_version":"0.1","cx":0,"cz":0}"#)
            .unwrap();

        assert!(!store
            .apply_frame(&voxel_patch_frame(0, 0, json!([{ "x": 1, "y": 1, "z": 1, "block": 1 }])))
            .unwrap());
        assert!(store.state().voxels.is_empty());
    }

    #[test]
    fn empty_voxel_patch_leaves_chunk_identical() {
        let mut store = WorldStore::new();
        store.set_bootstrap(bootstrap(2, &["AIR", "STONE"]));
        store
            .apply_frame(&voxel_frame(0, 0, &vec![1u16; CHUNK_AREA * 2]))
            .unwrap();
        let map = store.state().voxels.clone();
        let chunk = Arc::clone(&store.state().voxels[&ChunkKey::new(0, 0)]);

        assert!(!store.apply_frame(&voxel_patch_frame(0, 0, json!([]))).unwrap());
        assert!(Snapshot::ptr_eq(&map, &store.state().voxels));
        assert!(Arc::ptr_eq(&chunk, &store.state().voxels[&ChunkKey::new(0, 0)]));
    }

    // -----------------------------------------------------------------------
    // TICK
    // -----------------------------------------------------------------------

    #[test]
    fn tick_replaces_agent_registry() {
        let mut store = WorldStore::new();
        let mut first = tick(1);
        first.agents = vec![agent("A01"), agent("A02")];
        store.ingest_tick(&first);
        assert_eq!(store.state().agents.len(), 2);

        let mut second = tick(2);
        second.agents = vec![agent("A03")];
        store.ingest_tick(&second);
        let ids: Vec<&String> = store.state().agents.keys().collect();
        assert_eq!(ids, vec!["A03"]);
        assert_eq!(store.state().tick, 2);
        assert_eq!(store.state().weather, "CLEAR");
    }

    #[test]
    fn audit_ttl_boundary_is_inclusive() {
        let mut store = WorldStore::new();
        let mut born = tick(100);
        born.audits = vec![audit(100, 0, 1)];
        store.ingest_tick(&born);

        store.ingest_tick(&tick(100 + AUDIT_TTL_TICKS));
        assert_eq!(store.state().recent_audits.len(), 1);

        store.ingest_tick(&tick(100 + AUDIT_TTL_TICKS + 1));
        assert!(store.state().recent_audits.is_empty());
    }

    #[test]
    fn audits_are_capped_newest_first() {
        let mut store = WorldStore::new();
        let mut t = tick(1);
        t.audits = (0..(MAX_RECENT_AUDITS as u16 + 10))
            .map(|i| audit(1, i, i + 1))
            .collect();
        store.ingest_tick(&t);
        let audits = &store.state().recent_audits;
        assert_eq!(audits.len(), MAX_RECENT_AUDITS);
        assert_eq!(audits[0].audit.from, MAX_RECENT_AUDITS as u16 + 9);
    }

    #[test]
    fn activity_is_prepended_and_capped() {
        let mut store = WorldStore::new();
        for n in 0..(MAX_ACTIVITY as u64 + 5) {
            let mut t = tick(n);
            t.leaves = vec![format!("A{n}")];
            store.ingest_tick(&t);
        }
        let activity = &store.state().activity;
        assert_eq!(activity.len(), MAX_ACTIVITY);
        assert_eq!(activity[0].text, format!("[t{0}] LEAVE A{0}", MAX_ACTIVITY + 4));
    }

    #[test]
    fn activity_order_within_a_tick() {
        let mut store = WorldStore::new();
        let t: TickMsg = serde_json::from_value(json!({
            "tick": 7,
            "joins": [{ "agent_id": "A02", "name": "bot2" }],
            "leaves": ["A03"],
            "actions": [{ "agent_id": "A01", "act": { "instants": [{ "type": "SAY", "channel": "LOCAL", "text": "hi" }] } }],
            "audits": [{ "tick": 7, "actor": "A01", "action": "SET_BLOCK", "pos": [1, 2, 3], "from": 0, "to": 1 }]
        }))
        .unwrap();
        store.ingest_tick(&t);

        let lines: Vec<&str> = store.state().activity.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(
            lines,
            vec![
                "[t7] AUDIT A01 SET_BLOCK @ 1,2,3 (0->1)",
                "[t7] ACT A01 SAY(LOCAL) hi",
                "[t7] LEAVE A03",
                "[t7] JOIN A02 bot2",
            ]
        );
    }

    #[test]
    fn activity_after_server_restart_is_fresh() {
        let mut store = WorldStore::new();
        let mut late = tick(500);
        late.leaves = vec!["A01".into()];
        store.ingest_tick(&late);
        let prev = store.state().activity.clone();

        // The server restarted: ticks count from zero again.
        let mut early = tick(1);
        early.leaves = vec!["A02".into()];
        store.ingest_tick(&early);

        let next = &store.state().activity;
        assert!(next[0].seq > next[1].seq);
        let fresh: Vec<&str> = fresh_entries(next, &prev)
            .into_iter()
            .map(|e| e.text.as_str())
            .collect();
        assert_eq!(fresh, vec!["[t1] LEAVE A02"]);
    }

    #[test]
    fn recent_changes_fade_and_classify() {
        let mut store = WorldStore::new();
        store.set_bootstrap(bootstrap(4, &["DIRT", "AIR"]));
        let mut t = tick(100);
        t.audits = vec![audit(100, 1, 0), audit(100, 0, 1), audit(100, 0, 2)];
        store.ingest_tick(&t);

        let changes = store.state().recent_changes(125);
        assert_eq!(changes.len(), 3);
        let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Changed, ChangeKind::Removed, ChangeKind::Placed]
        );
        assert!((changes[0].opacity - 0.45).abs() < 1e-6);
        assert!(store.state().recent_changes(151).is_empty());
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_and_malformed_frames_leave_state_alone() {
        let mut store = loaded_store();
        let chunks = store.state().chunks.clone();
        assert!(store.apply_frame(r#"{"type":"WHO_KNOWS","protocol_version":"0.1"}"#).is_err());
        assert!(store.apply_frame(r#"{"protocol_version":"0.1"}"#).is_err());
        assert!(store.apply_frame("{").is_err());
        assert_eq!(store.state().chunks, chunks);
    }

    #[test]
    fn stats_count_collections() {
        let mut store = loaded_store();
        let mut t = tick(3);
        t.agents = vec![agent("A01")];
        store.ingest_tick(&t);
        let stats = store.state().stats();
        assert_eq!(stats.surface_chunks, 2);
        assert_eq!(stats.voxel_chunks, 0);
        assert_eq!(stats.agents, 1);
        assert_eq!(stats.tick, 3);
    }
}
