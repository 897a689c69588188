//! Session records and merging.

use hookbridge_protocol::{HookEvent, SessionStatus, SessionSummary};

use crate::key::Identity;

/// Consumer-side aggregate for one agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub key: String,

    // -- Identity --
    pub session_id: Option<String>,
    /// Normalized.
    pub transcript_path: Option<String>,
    /// Normalized.
    pub cwd: Option<String>,
    pub source: String,
    pub run_id: String,
    pub terminal_id: String,
    pub host_pid: u32,

    // -- Timing (unix millis) --
    pub started_at: u64,
    pub last_event_at: u64,
    pub last_tool_at: Option<u64>,
    pub waiting_since: Option<u64>,
    pub ended_at: Option<u64>,

    pub status: SessionStatus,

    pub last_message: Option<String>,
    pub last_prompt: Option<String>,
    pub current_activity: Option<String>,
    pub last_tool: Option<String>,
    pub last_error: Option<String>,
    pub pending_request_id: Option<String>,

    pub active_subagents: u32,
    pub tasks_completed: u32,
    pub compaction_count: u32,

    /// Nothing but `session_start` has been seen so far.
    pub only_started: bool,
}

impl Session {
    pub fn new(key: String, started_at: u64) -> Self {
        Session {
            key,
            session_id: None,
            transcript_path: None,
            cwd: None,
            source: String::new(),
            run_id: String::new(),
            terminal_id: String::new(),
            host_pid: 0,
            started_at,
            last_event_at: 0,
            last_tool_at: None,
            waiting_since: None,
            ended_at: None,
            status: SessionStatus::Waiting,
            last_message: None,
            last_prompt: None,
            current_activity: None,
            last_tool: None,
            last_error: None,
            pending_request_id: None,
            active_subagents: 0,
            tasks_completed: 0,
            compaction_count: 0,
            only_started: true,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }

    /// Fill identity fields the record does not know yet and advance the
    /// last-event clock. Known identity is never overwritten.
    pub fn absorb_identity(&mut self, event: &HookEvent) {
        let identity = Identity::of(event);
        if self.session_id.is_none() {
            self.session_id = identity.session_id;
        }
        if self.transcript_path.is_none() {
            self.transcript_path = identity.transcript_path;
        }
        if self.cwd.is_none() {
            self.cwd = identity.cwd;
        }
        fill_empty(&mut self.source, &event.meta.source);
        fill_empty(&mut self.run_id, &event.meta.run_id);
        fill_empty(&mut self.terminal_id, &event.meta.terminal_id);
        if self.host_pid == 0 {
            self.host_pid = event.meta.host_pid;
        }
        if self.started_at == 0 || (event.timestamp > 0 && event.timestamp < self.started_at) {
            self.started_at = event.timestamp;
        }
        self.last_event_at = self.last_event_at.max(event.timestamp);
    }

    /// True when a strong identity field differs, so the two records must
    /// never be combined.
    pub fn conflicts_with(&self, other: &Session) -> bool {
        differs(&self.session_id, &other.session_id)
            || differs(&self.cwd, &other.cwd)
            || differs(&self.transcript_path, &other.transcript_path)
    }

    /// Whether an event's identity could belong to this record.
    pub fn accepts(&self, identity: &Identity) -> bool {
        !(differs(&self.session_id, &identity.session_id)
            || differs(&self.cwd, &identity.cwd)
            || differs(&self.transcript_path, &identity.transcript_path))
    }

    /// Combine two records that describe the same session. Returns `None`
    /// when they conflict. The result is keyed `key`.
    pub fn merge(a: Session, b: Session, key: String) -> Option<Session> {
        if a.conflicts_with(&b) {
            return None;
        }
        let (newer, older) = if b.last_event_at > a.last_event_at {
            (b, a)
        } else {
            (a, b)
        };

        // Either side having ended keeps the merged record ended.
        let ended_at = max_opt(newer.ended_at, older.ended_at);
        let status = if ended_at.is_some() {
            SessionStatus::Ended
        } else {
            newer.status
        };

        let started_at = match (newer.started_at, older.started_at) {
            (0, other) | (other, 0) => other,
            (x, y) => x.min(y),
        };

        Some(Session {
            key,
            session_id: newer.session_id.or(older.session_id),
            transcript_path: newer.transcript_path.or(older.transcript_path),
            cwd: newer.cwd.or(older.cwd),
            source: prefer_non_empty(newer.source, older.source),
            run_id: prefer_non_empty(newer.run_id, older.run_id),
            terminal_id: prefer_non_empty(newer.terminal_id, older.terminal_id),
            host_pid: if newer.host_pid != 0 {
                newer.host_pid
            } else {
                older.host_pid
            },
            started_at,
            last_event_at: newer.last_event_at.max(older.last_event_at),
            last_tool_at: max_opt(newer.last_tool_at, older.last_tool_at),
            waiting_since: newer.waiting_since.or(older.waiting_since),
            ended_at,
            status,
            last_message: newer.last_message.or(older.last_message),
            last_prompt: newer.last_prompt.or(older.last_prompt),
            current_activity: newer.current_activity.or(older.current_activity),
            last_tool: newer.last_tool.or(older.last_tool),
            last_error: newer.last_error.or(older.last_error),
            pending_request_id: newer.pending_request_id.or(older.pending_request_id),
            active_subagents: newer.active_subagents.saturating_add(older.active_subagents),
            tasks_completed: newer.tasks_completed.saturating_add(older.tasks_completed),
            compaction_count: newer.compaction_count.saturating_add(older.compaction_count),
            only_started: newer.only_started && older.only_started,
        })
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            key: self.key.clone(),
            session_id: self.session_id.clone(),
            source: self.source.clone(),
            run_id: self.run_id.clone(),
            terminal_id: self.terminal_id.clone(),
            host_pid: self.host_pid,
            cwd: self.cwd.clone(),
            status: self.status,
            started_at: self.started_at,
            last_event_at: self.last_event_at,
            waiting_since: self.waiting_since,
            current_activity: self.current_activity.clone(),
            last_message: self.last_message.clone(),
            last_prompt: self.last_prompt.clone(),
            last_tool: self.last_tool.clone(),
            pending_request_id: self.pending_request_id.clone(),
            active_subagents: self.active_subagents,
            tasks_completed: self.tasks_completed,
            compaction_count: self.compaction_count,
        }
    }
}

fn differs(a: &Option<String>, b: &Option<String>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x != y)
}

fn fill_empty(field: &mut String, value: &str) {
    if field.is_empty() && !value.trim().is_empty() {
        *field = value.trim().to_string();
    }
}

fn prefer_non_empty(primary: String, fallback: String) -> String {
    if primary.is_empty() {
        fallback
    } else {
        primary
    }
}

fn max_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}
