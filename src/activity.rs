//! Activity-log line formatting.
//!
//! Every line starts with `[t<tick>] <KIND>` so the feed sorts and greps
//! predictably. Action documents are opaque JSON; unknown instant or task
//! types fall back to their `type` string.

use serde_json::Value;

use crate::protocol::{AuditEntry, JoinInfo};

/// One line in the activity feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    /// Store-assigned, strictly increasing in arrival order. Unlike `tick`
    /// it never goes backwards when the server restarts.
    pub seq: u64,
    pub tick: u64,
    pub text: String,
    pub agent_id: Option<String>,
}

impl ActivityEntry {
    pub fn new(seq: u64, tick: u64, text: String, agent_id: Option<&str>) -> Self {
        Self {
            seq,
            tick,
            text,
            agent_id: agent_id.map(str::to_string),
        }
    }
}

/// Entries of a newest-first log `next` that were not in `prev`, oldest
/// first.
pub fn fresh_entries<'a>(next: &'a [ActivityEntry], prev: &[ActivityEntry]) -> Vec<&'a ActivityEntry> {
    let newest_seen = prev.first().map(|e| e.seq);
    let mut fresh: Vec<&ActivityEntry> = next
        .iter()
        .take_while(|e| newest_seen.map_or(true, |seq| e.seq > seq))
        .collect();
    fresh.reverse();
    fresh
}

pub fn format_join(tick: u64, join: &JoinInfo) -> String {
    format!("[t{}] JOIN {} {}", tick, join.agent_id, join.name)
}

pub fn format_leave(tick: u64, agent_id: &str) -> String {
    format!("[t{}] LEAVE {}", tick, agent_id)
}

pub fn format_audit(audit: &AuditEntry) -> String {
    let [x, y, z] = audit.pos;
    let what = audit
        .reason
        .as_deref()
        .map(|r| format!(" {r}"))
        .unwrap_or_default();
    format!(
        "[t{}] AUDIT {} {}{} @ {},{},{} ({}->{})",
        audit.tick, audit.actor, audit.action, what, x, y, z, audit.from, audit.to
    )
}

/// Expand one recorded action document into feed lines:
/// instants first, then tasks, then cancellations.
pub fn format_act(agent_id: &str, act: &Value, tick: u64) -> Vec<String> {
    let prefix = format!("[t{tick}] ACT {agent_id}");
    let mut lines = Vec::new();

    for instant in list(act, "instants") {
        let kind = str_or(instant, "type", "INSTANT");
        let line = match kind.as_str() {
            "SAY" => format!(
                "{prefix} SAY({}) {}",
                str_or(instant, "channel", ""),
                str_or(instant, "text", "")
            ),
            "WHISPER" => format!(
                "{prefix} WHISPER({}) {}",
                str_or(instant, "to", ""),
                str_or(instant, "text", "")
            ),
            _ => format!("{prefix} {kind}"),
        };
        lines.push(line);
    }

    for task in list(act, "tasks") {
        let kind = str_or(task, "type", "TASK");
        let line = match kind.as_str() {
            "MOVE_TO" => format!("{prefix} MOVE_TO {}", joined(task.get("target"))),
            "FOLLOW" => format!("{prefix} FOLLOW {}", str_or(task, "target_id", "")),
            "MINE" => format!("{prefix} MINE {}", joined(task.get("block_pos"))),
            "PLACE" => format!(
                "{prefix} PLACE {} {}",
                joined(task.get("block_pos")),
                str_or(task, "item_id", "")
            ),
            _ => format!("{prefix} {kind}"),
        };
        lines.push(line);
    }

    for id in list(act, "cancel") {
        lines.push(format!("{prefix} CANCEL {}", scalar(id)));
    }

    lines
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

fn list<'a>(v: &'a Value, key: &str) -> &'a [Value] {
    v.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_or(v: &Value, key: &str, default: &str) -> String {
    match v.get(key) {
        None | Some(Value::Null) => default.to_string(),
        Some(other) => scalar(other),
    }
}

/// Render a scalar the way it reads in the feed: strings unquoted,
/// integral numbers without a fraction.
fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Comma-join an array value; anything else renders empty.
fn joined(v: Option<&Value>) -> String {
    match v.and_then(Value::as_array) {
        Some(items) => items.iter().map(scalar).collect::<Vec<_>>().join(","),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(seq: u64, tick: u64) -> ActivityEntry {
        ActivityEntry::new(seq, tick, format!("[t{tick}] LEAVE A0{seq}"), None)
    }

    #[test]
    fn fresh_entries_follow_seq_not_tick() {
        let prev = vec![entry(2, 500), entry(1, 499)];
        // Server restarted: ticks went back to 1.
        let next = vec![entry(4, 2), entry(3, 1), entry(2, 500), entry(1, 499)];
        let fresh: Vec<u64> = fresh_entries(&next, &prev).iter().map(|e| e.seq).collect();
        assert_eq!(fresh, vec![3, 4]);

        assert_eq!(fresh_entries(&next, &next).len(), 0);
        assert_eq!(fresh_entries(&next, &[]).len(), 4);
    }

    #[test]
    fn join_and_leave_lines() {
        let join = JoinInfo {
            agent_id: "A02".into(),
            name: "bot2".into(),
        };
        assert_eq!(format_join(2, &join), "[t2] JOIN A02 bot2");
        assert_eq!(format_leave(9, "A02"), "[t9] LEAVE A02");
    }

    #[test]
    fn audit_line_uses_audit_tick_and_optional_reason() {
        let mut audit = AuditEntry {
            tick: 12,
            actor: "A01".into(),
            action: "SET_BLOCK".into(),
            pos: [9, 22, 9],
            from: 2,
            to: 5,
            reason: Some("BUILD_BLUEPRINT".into()),
        };
        assert_eq!(
            format_audit(&audit),
            "[t12] AUDIT A01 SET_BLOCK BUILD_BLUEPRINT @ 9,22,9 (2->5)"
        );
        audit.reason = None;
        assert_eq!(format_audit(&audit), "[t12] AUDIT A01 SET_BLOCK @ 9,22,9 (2->5)");
    }

    #[test]
    fn act_expands_instants_tasks_and_cancels_in_order() {
        let act = json!({
            "instants": [
                {"type": "SAY", "channel": "LOCAL", "text": "hello"},
                {"type": "WHISPER", "to": "A02", "text": "psst"},
                {"type": "EAT"},
                {}
            ],
            "tasks": [
                {"type": "MOVE_TO", "target": [7, 22, 5.5]},
                {"type": "FOLLOW", "target_id": "A02"},
                {"type": "MINE", "block_pos": [1, 2, 3]},
                {"type": "PLACE", "block_pos": [4, 5, 6], "item_id": "PLANK"},
                {"type": "CRAFT"}
            ],
            "cancel": ["T1", 42]
        });
        let lines = format_act("A01", &act, 10);
        assert_eq!(
            lines,
            vec![
                "[t10] ACT A01 SAY(LOCAL) hello",
                "[t10] ACT A01 WHISPER(A02) psst",
                "[t10] ACT A01 EAT",
                "[t10] ACT A01 INSTANT",
                "[t10] ACT A01 MOVE_TO 7,22,5.5",
                "[t10] ACT A01 FOLLOW A02",
                "[t10] ACT A01 MINE 1,2,3",
                "[t10] ACT A01 PLACE 4,5,6 PLANK",
                "[t10] ACT A01 CRAFT",
                "[t10] ACT A01 CANCEL T1",
                "[t10] ACT A01 CANCEL 42",
            ]
        );
    }

    #[test]
    fn act_tolerates_non_object_documents() {
        assert!(format_act("A01", &Value::Null, 1).is_empty());
        assert!(format_act("A01", &json!({"instants": "nope"}), 1).is_empty());
    }
}
