//! Core types shared across the protocol

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hook event kind as carried on line 1 of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    UserPrompt,
    ToolStart,
    ToolEnd,
    ToolFailure,
    PermissionRequest,
    SubagentStart,
    SubagentStop,
    Notification,
    Stop,
    TaskCompleted,
    PreCompact,
    TeammateIdle,
    SessionEnd,
    #[serde(other)]
    Unknown,
}

/// Timeout for lifecycle hooks that may block the agent.
pub const LIFECYCLE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for permission prompts; a human may be answering.
pub const PERMISSION_SYNC_TIMEOUT: Duration = Duration::from_secs(600);

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::SessionStart,
        EventKind::UserPrompt,
        EventKind::ToolStart,
        EventKind::ToolEnd,
        EventKind::ToolFailure,
        EventKind::PermissionRequest,
        EventKind::SubagentStart,
        EventKind::SubagentStop,
        EventKind::Notification,
        EventKind::Stop,
        EventKind::TaskCompleted,
        EventKind::PreCompact,
        EventKind::TeammateIdle,
        EventKind::SessionEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::UserPrompt => "user_prompt",
            EventKind::ToolStart => "tool_start",
            EventKind::ToolEnd => "tool_end",
            EventKind::ToolFailure => "tool_failure",
            EventKind::PermissionRequest => "permission_request",
            EventKind::SubagentStart => "subagent_start",
            EventKind::SubagentStop => "subagent_stop",
            EventKind::Notification => "notification",
            EventKind::Stop => "stop",
            EventKind::TaskCompleted => "task_completed",
            EventKind::PreCompact => "pre_compact",
            EventKind::TeammateIdle => "teammate_idle",
            EventKind::SessionEnd => "session_end",
            EventKind::Unknown => "unknown",
        }
    }

    /// Parse a kind name. Accepts our snake_case names and the agent's
    /// native hook names (`PreToolUse`, `UserPromptSubmit`, ...).
    pub fn parse(name: &str) -> EventKind {
        let name = name.trim();
        match name {
            "SessionStart" => return EventKind::SessionStart,
            "UserPromptSubmit" => return EventKind::UserPrompt,
            "PreToolUse" => return EventKind::ToolStart,
            "PostToolUse" => return EventKind::ToolEnd,
            "PostToolUseFailure" => return EventKind::ToolFailure,
            "PermissionRequest" => return EventKind::PermissionRequest,
            "SubagentStart" => return EventKind::SubagentStart,
            "SubagentStop" => return EventKind::SubagentStop,
            "Notification" => return EventKind::Notification,
            "Stop" => return EventKind::Stop,
            "TaskCompleted" => return EventKind::TaskCompleted,
            "PreCompact" => return EventKind::PreCompact,
            "TeammateIdle" => return EventKind::TeammateIdle,
            "SessionEnd" => return EventKind::SessionEnd,
            _ => {}
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .unwrap_or(EventKind::Unknown)
    }

    /// Sync kinds hold the hook process until the consumer answers.
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            EventKind::PermissionRequest
                | EventKind::Stop
                | EventKind::SubagentStop
                | EventKind::TaskCompleted
                | EventKind::TeammateIdle
        )
    }

    /// How long a sync exchange may wait for its reply. `None` for async kinds.
    pub fn sync_timeout(&self) -> Option<Duration> {
        match self {
            EventKind::PermissionRequest => Some(PERMISSION_SYNC_TIMEOUT),
            kind if kind.is_sync() => Some(LIFECYCLE_SYNC_TIMEOUT),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay metadata from frame line 2: `source|run-id|terminal-id|host-pid`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMeta {
    pub source: String,
    pub run_id: String,
    pub terminal_id: String,
    pub host_pid: u32,
}

impl RelayMeta {
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            sanitize_field(&self.source),
            sanitize_field(&self.run_id),
            sanitize_field(&self.terminal_id),
            self.host_pid
        )
    }

    /// Lenient parse: missing fields default to empty, a bad pid to 0.
    pub fn parse_line(line: &str) -> RelayMeta {
        let mut parts = line.trim().splitn(4, '|');
        let mut next = || parts.next().map(str::trim).unwrap_or_default().to_string();
        let source = next();
        let run_id = next();
        let terminal_id = next();
        let host_pid = next().parse().unwrap_or(0);
        RelayMeta {
            source,
            run_id,
            terminal_id,
            host_pid,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
            && self.run_id.is_empty()
            && self.terminal_id.is_empty()
            && self.host_pid == 0
    }
}

fn sanitize_field(value: &str) -> String {
    value.replace(['|', '\n', '\r'], "_")
}

/// Session status as published to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Working,
    Ended,
}

/// A live session as published by the consumer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub key: String,
    pub session_id: Option<String>,
    pub source: String,
    pub run_id: String,
    pub terminal_id: String,
    pub host_pid: u32,
    pub cwd: Option<String>,
    pub status: SessionStatus,
    pub started_at: u64,
    pub last_event_at: u64,
    pub waiting_since: Option<u64>,
    pub current_activity: Option<String>,
    pub last_message: Option<String>,
    pub last_prompt: Option<String>,
    pub last_tool: Option<String>,
    pub pending_request_id: Option<String>,
    pub active_subagents: u32,
    pub tasks_completed: u32,
    pub compaction_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_native_and_snake_case_names() {
        assert_eq!(EventKind::parse("PreToolUse"), EventKind::ToolStart);
        assert_eq!(EventKind::parse("UserPromptSubmit"), EventKind::UserPrompt);
        assert_eq!(
            EventKind::parse("PostToolUseFailure"),
            EventKind::ToolFailure
        );
        assert_eq!(
            EventKind::parse(" permission_request "),
            EventKind::PermissionRequest
        );
        assert_eq!(EventKind::parse("nonsense"), EventKind::Unknown);
    }

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), kind);
        }
    }

    #[test]
    fn sync_kinds_have_timeouts() {
        assert_eq!(
            EventKind::PermissionRequest.sync_timeout(),
            Some(PERMISSION_SYNC_TIMEOUT)
        );
        assert_eq!(EventKind::Stop.sync_timeout(), Some(LIFECYCLE_SYNC_TIMEOUT));
        assert_eq!(EventKind::ToolStart.sync_timeout(), None);
        assert!(!EventKind::Unknown.is_sync());
    }

    #[test]
    fn meta_line_tolerates_missing_fields() {
        let meta = RelayMeta::parse_line("claude|run-1");
        assert_eq!(meta.source, "claude");
        assert_eq!(meta.run_id, "run-1");
        assert_eq!(meta.terminal_id, "");
        assert_eq!(meta.host_pid, 0);

        let meta = RelayMeta::parse_line("claude|run-1|term|not-a-pid");
        assert_eq!(meta.terminal_id, "term");
        assert_eq!(meta.host_pid, 0);
    }

    #[test]
    fn meta_line_escapes_separators() {
        let meta = RelayMeta {
            source: "a|b".into(),
            run_id: "r".into(),
            terminal_id: "t\n".into(),
            host_pid: 42,
        };
        let parsed = RelayMeta::parse_line(&meta.to_line());
        assert_eq!(parsed.source, "a_b");
        assert_eq!(parsed.terminal_id, "t_");
        assert_eq!(parsed.host_pid, 42);
    }
}
