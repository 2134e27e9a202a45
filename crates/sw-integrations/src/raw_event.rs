//! Decoding of the agent runtime's raw event feed.
//!
//! The feed is a stream of `{"type": "...", "properties": {...}}` records.
//! Each known discriminator maps to one [`RawEvent`] variant; anything else,
//! including a known type whose payload does not decode, becomes
//! [`RawEvent::Unknown`] so new runtime versions never break consumers.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    SessionCreated(SessionInfo),
    SessionUpdated(SessionInfo),
    SessionStatus {
        session_id: String,
        status: RuntimeStatus,
    },
    PermissionUpdated(PermissionInfo),
    PermissionReplied {
        session_id: String,
        permission_id: String,
        response: Option<String>,
    },
    MessagePartUpdated(MessagePart),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(rename = "parentID", default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub title: String,
}

/// Session status in the runtime's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Busy,
    Idle,
    Retry {
        attempt: Option<u32>,
        message: Option<String>,
    },
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionInfo {
    pub id: String,
    pub session_id: String,
    pub kind: String,
    pub pattern: Option<String>,
    pub title: String,
    pub metadata: Value,
    /// `None` when the runtime does not report one; treated as pending.
    pub status: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
}

impl PermissionInfo {
    pub fn is_pending(&self) -> bool {
        self.status.as_deref().map_or(true, |s| s == "pending")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessagePart {
    pub session_id: String,
    pub kind: String,
    pub tool: Option<String>,
    pub state: Option<ToolState>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub title: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SessionEnvelope {
    info: SessionInfo,
}

#[derive(Deserialize)]
struct StatusWire {
    #[serde(rename = "sessionID")]
    session_id: String,
    status: Value,
}

#[derive(Deserialize)]
struct PermissionWire {
    id: String,
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    pattern: Option<Value>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    time: Option<TimeWire>,
}

#[derive(Deserialize)]
struct TimeWire {
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Deserialize)]
struct RepliedWire {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "permissionID")]
    permission_id: String,
    #[serde(default)]
    response: Option<String>,
}

#[derive(Deserialize)]
struct PartEnvelope {
    part: PartWire,
}

#[derive(Deserialize)]
struct PartWire {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    state: Option<ToolState>,
}

impl RawEvent {
    /// Decode one feed record. Never fails.
    pub fn from_value(value: Value) -> RawEvent {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let props = value.get("properties").cloned().unwrap_or(Value::Null);

        let decoded = match kind.as_str() {
            "session.created" => serde_json::from_value::<SessionEnvelope>(props)
                .ok()
                .map(|e| RawEvent::SessionCreated(e.info)),
            "session.updated" => serde_json::from_value::<SessionEnvelope>(props)
                .ok()
                .map(|e| RawEvent::SessionUpdated(e.info)),
            "session.status" => serde_json::from_value::<StatusWire>(props)
                .ok()
                .map(|w| RawEvent::SessionStatus {
                    session_id: w.session_id,
                    status: RuntimeStatus::from_value(&w.status),
                }),
            "permission.updated" => serde_json::from_value::<PermissionWire>(props)
                .ok()
                .map(|w| RawEvent::PermissionUpdated(w.into())),
            "permission.replied" => serde_json::from_value::<RepliedWire>(props)
                .ok()
                .map(|w| RawEvent::PermissionReplied {
                    session_id: w.session_id,
                    permission_id: w.permission_id,
                    response: w.response,
                }),
            "message.part.updated" => serde_json::from_value::<PartEnvelope>(props)
                .ok()
                .map(|e| {
                    RawEvent::MessagePartUpdated(MessagePart {
                        session_id: e.part.session_id,
                        kind: e.part.kind,
                        tool: e.part.tool,
                        state: e.part.state,
                    })
                }),
            _ => None,
        };

        decoded.unwrap_or(RawEvent::Unknown(kind))
    }

    /// Decode one JSON text record (e.g. an SSE `data:` payload).
    pub fn from_json(text: &str) -> RawEvent {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => RawEvent::from_value(value),
            Err(_) => RawEvent::Unknown(String::new()),
        }
    }
}

impl RuntimeStatus {
    /// Accepts either `"busy"` or `{"type": "busy", ...}`.
    fn from_value(value: &Value) -> RuntimeStatus {
        let (tag, obj) = match value {
            Value::String(s) => (s.as_str(), None),
            Value::Object(map) => (
                map.get("type").and_then(Value::as_str).unwrap_or_default(),
                Some(map),
            ),
            _ => ("", None),
        };
        match tag {
            "busy" => RuntimeStatus::Busy,
            "idle" => RuntimeStatus::Idle,
            "retry" => RuntimeStatus::Retry {
                attempt: obj
                    .and_then(|m| m.get("attempt"))
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok()),
                message: obj
                    .and_then(|m| m.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            other => RuntimeStatus::Other(other.to_string()),
        }
    }
}

impl From<PermissionWire> for PermissionInfo {
    fn from(w: PermissionWire) -> Self {
        let pattern = match w.pattern {
            Some(Value::String(s)) => Some(s),
            Some(Value::Array(items)) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                (!parts.is_empty()).then(|| parts.join(" "))
            }
            _ => None,
        };
        let requested_at = w
            .time
            .and_then(|t| t.created)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        Self {
            id: w.id,
            session_id: w.session_id,
            kind: w.kind,
            pattern,
            title: w.title,
            metadata: w.metadata,
            status: w.status,
            requested_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_child_session_creation() {
        let ev = RawEvent::from_value(json!({
            "type": "session.created",
            "properties": {"info": {"id": "ses_child", "parentID": "ses_root", "title": "Worker 1"}}
        }));
        match ev {
            RawEvent::SessionCreated(info) => {
                assert_eq!(info.id, "ses_child");
                assert_eq!(info.parent_id.as_deref(), Some("ses_root"));
                assert_eq!(info.title, "Worker 1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_status_in_both_shapes() {
        let obj = RawEvent::from_value(json!({
            "type": "session.status",
            "properties": {"sessionID": "s", "status": {"type": "retry", "attempt": 2, "message": "overloaded"}}
        }));
        assert_eq!(
            obj,
            RawEvent::SessionStatus {
                session_id: "s".into(),
                status: RuntimeStatus::Retry {
                    attempt: Some(2),
                    message: Some("overloaded".into())
                }
            }
        );
        let plain = RawEvent::from_value(json!({
            "type": "session.status",
            "properties": {"sessionID": "s", "status": "idle"}
        }));
        assert_eq!(
            plain,
            RawEvent::SessionStatus {
                session_id: "s".into(),
                status: RuntimeStatus::Idle
            }
        );
    }

    #[test]
    fn decodes_permission_with_array_pattern() {
        let ev = RawEvent::from_value(json!({
            "type": "permission.updated",
            "properties": {
                "id": "per_1", "sessionID": "s", "type": "bash",
                "pattern": ["git", "push"], "title": "Run git push",
                "metadata": {"command": "git push"}, "time": {"created": 1_700_000_000_000i64}
            }
        }));
        let RawEvent::PermissionUpdated(p) = ev else {
            panic!("expected permission");
        };
        assert_eq!(p.pattern.as_deref(), Some("git push"));
        assert!(p.is_pending());
        assert!(p.requested_at.is_some());
        assert_eq!(p.metadata["command"], "git push");
    }

    #[test]
    fn decodes_tool_part() {
        let ev = RawEvent::from_value(json!({
            "type": "message.part.updated",
            "properties": {"part": {
                "id": "prt", "sessionID": "s", "messageID": "m", "type": "tool", "tool": "bash",
                "state": {"status": "running", "input": {"command": "cargo fmt"}}
            }}
        }));
        let RawEvent::MessagePartUpdated(part) = ev else {
            panic!("expected part");
        };
        assert_eq!(part.tool.as_deref(), Some("bash"));
        assert_eq!(part.state.unwrap().input["command"], "cargo fmt");
    }

    #[test]
    fn unknown_and_malformed_records_are_unknown() {
        assert_eq!(
            RawEvent::from_value(json!({"type": "lsp.updated", "properties": {}})),
            RawEvent::Unknown("lsp.updated".into())
        );
        assert_eq!(
            RawEvent::from_value(json!({"type": "session.created", "properties": {"nope": 1}})),
            RawEvent::Unknown("session.created".into())
        );
        assert_eq!(RawEvent::from_json("not json"), RawEvent::Unknown(String::new()));
    }
}
