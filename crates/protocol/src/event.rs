//! Typed hook events.
//!
//! `HookPayload` mirrors the JSON object the agent writes to a hook's stdin
//! (plus the relay fields we inject). `HookEvent` is the normalized, immutable
//! record the consumer engine works with.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EventKind, RelayMeta};

/// Maximum length for derived tool summaries.
const MAX_TOOL_SUMMARY_LEN: usize = 120;

/// Raw hook payload. Every field is optional; unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
    /// SessionStart origin (`startup`, `resume`, `clear`, `compact`).
    #[serde(rename = "source", skip_serializing_if = "Option::is_none")]
    pub start_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teammate_name: Option<String>,

    // -- Injected by the relay --
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl HookPayload {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// One normalized hook event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    /// Unix millis. Falls back to the time of decoding when the sender sent none.
    pub timestamp: u64,
    pub kind: EventKind,
    /// Opaque fingerprint used for dedup. Empty means "never dedup".
    pub event_id: String,
    pub meta: RelayMeta,
    pub session_id: Option<String>,
    pub transcript_path: Option<String>,
    pub cwd: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input_summary: Option<String>,
    pub error: Option<String>,
    pub request_id: Option<String>,
    pub prompt: Option<String>,
    pub message: Option<String>,
    pub notification_type: Option<String>,
    pub title: Option<String>,
    pub agent_id: Option<String>,
    pub agent_type: Option<String>,
    pub task_subject: Option<String>,
    pub start_source: Option<String>,
    pub reason: Option<String>,
    pub permission_mode: Option<String>,
}

impl HookEvent {
    /// An event carrying nothing but its kind; handy for building test fixtures.
    pub fn bare(kind: EventKind, timestamp: u64) -> Self {
        HookEvent::from_payload(kind, RelayMeta::default(), HookPayload::default(), timestamp)
    }

    /// Normalize a payload. `now` is used when the payload carries no timestamp.
    pub fn from_payload(kind: EventKind, meta: RelayMeta, payload: HookPayload, now: u64) -> Self {
        let tool_input_summary = match (&payload.tool_name, &payload.tool_input) {
            (Some(name), Some(input)) => summarize_tool_input(name, input),
            _ => None,
        };
        let message = payload
            .message
            .or_else(|| payload.teammate_name.map(|name| format!("{name} is idle")));

        HookEvent {
            timestamp: payload.timestamp.filter(|ts| *ts > 0).unwrap_or(now),
            kind,
            event_id: payload.event_id.unwrap_or_default(),
            meta,
            session_id: non_empty(payload.session_id),
            transcript_path: non_empty(payload.transcript_path),
            cwd: non_empty(payload.cwd),
            tool_name: non_empty(payload.tool_name),
            tool_input_summary,
            error: non_empty(payload.error),
            request_id: non_empty(payload.request_id),
            prompt: non_empty(payload.prompt),
            message: non_empty(message),
            notification_type: non_empty(payload.notification_type),
            title: non_empty(payload.title),
            agent_id: non_empty(payload.agent_id),
            agent_type: non_empty(payload.agent_type),
            task_subject: non_empty(payload.task_subject),
            start_source: non_empty(payload.start_source),
            reason: non_empty(payload.reason),
            permission_mode: non_empty(payload.permission_mode),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Pick the most telling field out of a tool's input, truncated for display.
pub fn summarize_tool_input(tool_name: &str, tool_input: &Value) -> Option<String> {
    let field = match tool_name {
        "Bash" => "command",
        "Edit" | "MultiEdit" | "Write" | "Read" | "NotebookEdit" => "file_path",
        "Grep" | "Glob" => "pattern",
        "WebFetch" => "url",
        "WebSearch" => "query",
        "Task" => "description",
        _ => return None,
    };

    let value = tool_input.get(field)?.as_str()?.trim();
    if value.is_empty() {
        return None;
    }

    let line = value.lines().next().unwrap_or(value);
    if line.chars().count() > MAX_TOOL_SUMMARY_LEN {
        let truncated: String = line.chars().take(MAX_TOOL_SUMMARY_LEN - 3).collect();
        Some(format!("{truncated}..."))
    } else {
        Some(line.to_string())
    }
}
