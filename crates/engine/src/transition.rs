//! Pure state transition function
//!
//! Every status change a hook event can cause lives here as a pure,
//! synchronous function: `transition(session, event) -> (session, effects)`.
//! Settling pending requests is described as effects for the engine to run.

use hookbridge_protocol::{EventKind, HookEvent, SessionStatus};

use crate::session::Session;

// ---------------------------------------------------------------------------
// Effects: work for the caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Settle every pending request of this session as allow.
    AutoAllow,
    /// A sync request now waits on this session.
    RegisterPending { request_id: String },
    /// The session has ended; the event changed nothing.
    Ignored,
}

// ---------------------------------------------------------------------------
// transition(): the pure core
// ---------------------------------------------------------------------------

pub fn transition(mut session: Session, event: &HookEvent) -> (Session, Vec<Effect>) {
    let mut effects = Vec::new();
    let ts = event.timestamp;

    if session.is_ended() {
        let revives = event.kind == EventKind::SessionStart
            && session.ended_at.map_or(true, |ended| ts > ended);
        if !revives {
            return (session, vec![Effect::Ignored]);
        }
        session.status = SessionStatus::Waiting;
        session.ended_at = None;
        session.waiting_since = None;
    }

    session.absorb_identity(event);
    if event.kind != EventKind::SessionStart {
        session.only_started = false;
    }

    match event.kind {
        // -- Status transitions -----------------------------------------------
        EventKind::SessionStart => {
            if session.status != SessionStatus::Working {
                session.status = SessionStatus::Waiting;
                session.waiting_since.get_or_insert(ts);
            }
        }

        EventKind::UserPrompt => {
            start_work(&mut session, &mut effects);
            if let Some(prompt) = &event.prompt {
                session.last_prompt = Some(prompt.clone());
            }
            session.current_activity = None;
        }

        EventKind::ToolStart => {
            start_work(&mut session, &mut effects);
            if let Some(tool) = &event.tool_name {
                session.current_activity = Some(describe_tool(tool, event));
                session.last_tool = Some(tool.clone());
            }
            session.last_tool_at = Some(ts);
        }

        EventKind::SubagentStart => {
            start_work(&mut session, &mut effects);
            session.active_subagents += 1;
        }

        EventKind::ToolEnd | EventKind::ToolFailure => {
            session.status = SessionStatus::Working;
            session.waiting_since = None;
            if let Some(tool) = &event.tool_name {
                session.last_tool = Some(tool.clone());
            }
            session.last_tool_at = Some(ts);
            if event.kind == EventKind::ToolFailure {
                session.last_error = event.error.clone().or(session.last_error);
            }
            session.current_activity = None;
        }

        EventKind::PermissionRequest => {
            session.status = SessionStatus::Waiting;
            session.waiting_since.get_or_insert(ts);
            let tool = event.tool_name.as_deref().unwrap_or("tool");
            session.current_activity = Some(format!("Permission: {}", describe_tool(tool, event)));
            if let Some(request_id) = &event.request_id {
                session.pending_request_id = Some(request_id.clone());
                effects.push(Effect::RegisterPending {
                    request_id: request_id.clone(),
                });
            }
        }

        EventKind::Stop | EventKind::Notification => {
            session.status = SessionStatus::Waiting;
            session.waiting_since.get_or_insert(ts);
            if let Some(message) = &event.message {
                session.last_message = Some(message.clone());
            }
            if event.kind == EventKind::Stop {
                session.current_activity = None;
            }
        }

        // -- Counters, no status change ---------------------------------------
        EventKind::SubagentStop => {
            session.active_subagents = session.active_subagents.saturating_sub(1);
        }

        EventKind::TaskCompleted => {
            session.tasks_completed += 1;
        }

        EventKind::PreCompact => {
            session.compaction_count += 1;
        }

        EventKind::TeammateIdle => {
            if let Some(message) = &event.message {
                session.last_message = Some(message.clone());
            }
        }

        // -- Terminal ---------------------------------------------------------
        EventKind::SessionEnd => {
            session.status = SessionStatus::Ended;
            session.ended_at = Some(ts);
            session.waiting_since = None;
            session.current_activity = None;
            session.pending_request_id = None;
            effects.push(Effect::AutoAllow);
        }

        EventKind::Unknown => {}
    }

    (session, effects)
}

fn start_work(session: &mut Session, effects: &mut Vec<Effect>) {
    session.status = SessionStatus::Working;
    session.waiting_since = None;
    session.pending_request_id = None;
    effects.push(Effect::AutoAllow);
}

fn describe_tool(tool: &str, event: &HookEvent) -> String {
    match &event.tool_input_summary {
        Some(summary) => format!("{tool} {summary}"),
        None => tool.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, ts: u64) -> HookEvent {
        let mut event = HookEvent::bare(kind, ts);
        event.session_id = Some("s1".into());
        event
    }

    fn run(kinds: &[EventKind]) -> Vec<SessionStatus> {
        let mut session = Session::new("s1".into(), 0);
        let mut statuses = Vec::new();
        for (i, kind) in kinds.iter().enumerate() {
            let (next, _) = transition(session, &event(*kind, 1_000 + i as u64));
            statuses.push(next.status);
            session = next;
        }
        statuses
    }

    #[test]
    fn start_tool_stop_sequence() {
        assert_eq!(
            run(&[
                EventKind::SessionStart,
                EventKind::ToolStart,
                EventKind::ToolEnd,
                EventKind::Stop,
            ]),
            vec![
                SessionStatus::Waiting,
                SessionStatus::Working,
                SessionStatus::Working,
                SessionStatus::Waiting,
            ]
        );
    }

    #[test]
    fn session_start_does_not_interrupt_work() {
        let statuses = run(&[EventKind::UserPrompt, EventKind::SessionStart]);
        assert_eq!(statuses, vec![SessionStatus::Working, SessionStatus::Working]);
    }

    #[test]
    fn work_events_auto_allow_pending() {
        let session = Session::new("s1".into(), 0);
        let mut request = event(EventKind::PermissionRequest, 1_000);
        request.request_id = Some("r1".into());
        request.tool_name = Some("Bash".into());
        request.tool_input_summary = Some("rm -rf build".into());

        let (session, effects) = transition(session, &request);
        assert_eq!(
            effects,
            vec![Effect::RegisterPending {
                request_id: "r1".into()
            }]
        );
        assert_eq!(session.status, SessionStatus::Waiting);
        assert_eq!(session.pending_request_id.as_deref(), Some("r1"));
        assert_eq!(
            session.current_activity.as_deref(),
            Some("Permission: Bash rm -rf build")
        );

        let (session, effects) = transition(session, &event(EventKind::ToolStart, 1_100));
        assert_eq!(effects, vec![Effect::AutoAllow]);
        assert_eq!(session.status, SessionStatus::Working);
        assert!(session.pending_request_id.is_none());
        assert!(session.waiting_since.is_none());
    }

    #[test]
    fn ended_session_ignores_late_events() {
        let session = Session::new("s1".into(), 0);
        let (session, effects) = transition(session, &event(EventKind::SessionEnd, 2_000));
        assert_eq!(effects, vec![Effect::AutoAllow]);
        assert_eq!(session.ended_at, Some(2_000));

        for kind in [EventKind::ToolStart, EventKind::Stop, EventKind::SessionEnd] {
            let before = session.clone();
            let (after, effects) = transition(session.clone(), &event(kind, 3_000));
            assert_eq!(effects, vec![Effect::Ignored]);
            assert_eq!(after, before);
        }
    }

    #[test]
    fn newer_session_start_revives_ended_session() {
        let session = Session::new("s1".into(), 0);
        let (session, _) = transition(session, &event(EventKind::SessionEnd, 2_000));

        let (stale, effects) = transition(session.clone(), &event(EventKind::SessionStart, 1_500));
        assert_eq!(effects, vec![Effect::Ignored]);
        assert_eq!(stale.status, SessionStatus::Ended);

        let (revived, effects) = transition(session, &event(EventKind::SessionStart, 2_500));
        assert!(effects.is_empty());
        assert_eq!(revived.status, SessionStatus::Waiting);
        assert_eq!(revived.ended_at, None);
        assert_eq!(revived.waiting_since, Some(2_500));
    }

    #[test]
    fn counters_do_not_change_status() {
        let session = Session::new("s1".into(), 0);
        let (session, _) = transition(session, &event(EventKind::SubagentStart, 1));
        let (session, _) = transition(session, &event(EventKind::SubagentStop, 2));
        let (session, _) = transition(session, &event(EventKind::SubagentStop, 3));
        let (session, _) = transition(session, &event(EventKind::TaskCompleted, 4));
        let (session, _) = transition(session, &event(EventKind::PreCompact, 5));

        assert_eq!(session.status, SessionStatus::Working);
        assert_eq!(session.active_subagents, 0);
        assert_eq!(session.tasks_completed, 1);
        assert_eq!(session.compaction_count, 1);
    }

    #[test]
    fn tool_failure_records_error() {
        let session = Session::new("s1".into(), 0);
        let mut failure = event(EventKind::ToolFailure, 10);
        failure.tool_name = Some("Edit".into());
        failure.error = Some("file not found".into());

        let (session, _) = transition(session, &failure);
        assert_eq!(session.last_tool.as_deref(), Some("Edit"));
        assert_eq!(session.last_tool_at, Some(10));
        assert_eq!(session.last_error.as_deref(), Some("file not found"));
        assert!(session.current_activity.is_none());
    }

    #[test]
    fn only_started_flag_clears_on_other_events() {
        let session = Session::new("s1".into(), 0);
        let (session, _) = transition(session, &event(EventKind::SessionStart, 1));
        assert!(session.only_started);
        let (session, _) = transition(session, &event(EventKind::Notification, 2));
        assert!(!session.only_started);
    }

    #[test]
    fn last_event_time_never_moves_backwards() {
        let session = Session::new("s1".into(), 0);
        let (session, _) = transition(session, &event(EventKind::ToolStart, 5_000));
        let (session, _) = transition(session, &event(EventKind::ToolEnd, 4_000));
        assert_eq!(session.last_event_at, 5_000);
    }
}
