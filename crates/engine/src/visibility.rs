//! Which sessions are published, and change-only publication.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hookbridge_protocol::{SessionStatus, SessionSummary};
use tokio::sync::watch;

use crate::session::Session;
use crate::table::SessionTable;

pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_ORPHAN_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_EXPECTED_SOURCE: &str = "claude";

#[derive(Debug, Clone)]
pub struct VisibilityPolicy {
    pub ttl: Duration,
    pub orphan_ttl: Duration,
    pub expected_source: String,
    /// The consumer's own run id. Sessions from other runs are hidden.
    pub run_id: Option<String>,
}

impl Default for VisibilityPolicy {
    fn default() -> Self {
        VisibilityPolicy {
            ttl: DEFAULT_TTL,
            orphan_ttl: DEFAULT_ORPHAN_TTL,
            expected_source: DEFAULT_EXPECTED_SOURCE.to_string(),
            run_id: None,
        }
    }
}

impl VisibilityPolicy {
    pub fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    pub fn is_visible(&self, session: &Session, now: u64) -> bool {
        if session.last_event_at == 0 || session.status == SessionStatus::Ended {
            return false;
        }
        if !session.source.is_empty() && session.source != self.expected_source {
            return false;
        }
        if let Some(run_id) = self.run_id.as_deref().filter(|r| !r.is_empty()) {
            if !session.run_id.is_empty() && session.run_id != run_id {
                return false;
            }
        }
        now.saturating_sub(session.last_event_at) <= self.ttl_ms()
    }

    /// A start that never got a follow-up and has no process to check on.
    pub fn is_orphaned_start(&self, session: &Session, now: u64) -> bool {
        session.only_started
            && session.host_pid == 0
            && !session.is_ended()
            && now.saturating_sub(session.last_event_at) > self.orphan_ttl.as_millis() as u64
    }
}

/// End orphaned starts. Returns the keys that were ended.
pub fn end_orphans(table: &mut SessionTable, policy: &VisibilityPolicy, now: u64) -> Vec<String> {
    let mut ended = Vec::new();
    for session in table.iter_mut() {
        if policy.is_orphaned_start(session, now) {
            session.status = SessionStatus::Ended;
            session.ended_at = Some(now);
            session.waiting_since = None;
            ended.push(session.key.clone());
        }
    }
    ended
}

/// Published view, sorted by start time then key.
pub fn visible_summaries(
    table: &SessionTable,
    policy: &VisibilityPolicy,
    now: u64,
) -> Vec<SessionSummary> {
    let mut out: Vec<SessionSummary> = table
        .iter()
        .filter(|s| policy.is_visible(s, now))
        .map(Session::summary)
        .collect();
    out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.key.cmp(&b.key)));
    out
}

/// Lock-free snapshot of the published list plus a revision counter that
/// bumps only when the list actually changes.
#[derive(Debug)]
pub struct Publisher {
    snapshot: Arc<ArcSwap<Vec<SessionSummary>>>,
    revision: watch::Sender<u64>,
}

impl Publisher {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Publisher {
            snapshot: Arc::new(ArcSwap::from_pointee(Vec::new())),
            revision,
        }
    }

    /// Replace the published list if it differs. Returns whether it did.
    pub fn publish(&self, next: Vec<SessionSummary>) -> bool {
        if **self.snapshot.load() == next {
            return false;
        }
        self.snapshot.store(Arc::new(next));
        self.revision.send_modify(|rev| *rev += 1);
        true
    }

    pub fn snapshot_arc(&self) -> Arc<ArcSwap<Vec<SessionSummary>>> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(key: &str, last: u64) -> Session {
        let mut s = Session::new(key.to_string(), last);
        s.last_event_at = last;
        s.only_started = false;
        s
    }

    #[test]
    fn ttl_boundary() {
        let policy = VisibilityPolicy {
            ttl: Duration::from_secs(10),
            ..Default::default()
        };
        let session = live("s1", 1_000);
        assert!(policy.is_visible(&session, 11_000));
        assert!(!policy.is_visible(&session, 11_001));
    }

    #[test]
    fn ended_unseen_and_foreign_sessions_are_hidden() {
        let policy = VisibilityPolicy {
            run_id: Some("run-a".into()),
            ..Default::default()
        };
        let now = 5_000;

        let mut ended = live("a", 4_000);
        ended.status = SessionStatus::Ended;
        assert!(!policy.is_visible(&ended, now));

        assert!(!policy.is_visible(&live("b", 0), now));

        let mut other_source = live("c", 4_000);
        other_source.source = "codex".into();
        assert!(!policy.is_visible(&other_source, now));

        let mut other_run = live("d", 4_000);
        other_run.run_id = "run-b".into();
        assert!(!policy.is_visible(&other_run, now));

        let mut same_run = live("e", 4_000);
        same_run.run_id = "run-a".into();
        same_run.source = "claude".into();
        assert!(policy.is_visible(&same_run, now));

        // Unstamped sessions are never treated as a mismatch.
        assert!(policy.is_visible(&live("f", 4_000), now));
    }

    #[test]
    fn orphaned_start_is_ended_unless_a_process_is_known() {
        let policy = VisibilityPolicy::default();
        let mut table = SessionTable::new();
        let mut event = hookbridge_protocol::HookEvent::bare(
            hookbridge_protocol::EventKind::SessionStart,
            1_000,
        );
        event.session_id = Some("orphan".into());
        let key = table
            .resolve(&crate::key::Identity::of(&event))
            .unwrap()
            .key;
        table.apply(&key, &event);

        event.session_id = Some("owned".into());
        event.meta.host_pid = 4242;
        let key = table
            .resolve(&crate::key::Identity::of(&event))
            .unwrap()
            .key;
        table.apply(&key, &event);

        assert!(end_orphans(&mut table, &policy, 60_000).is_empty());
        assert_eq!(end_orphans(&mut table, &policy, 200_000), vec!["orphan".to_string()]);
        assert_eq!(table.get("owned").unwrap().status, SessionStatus::Waiting);
    }

    #[test]
    fn summaries_sorted_by_start_then_key() {
        let policy = VisibilityPolicy::default();
        let mut table = SessionTable::new();
        for (sid, ts) in [("b", 2_000), ("a", 2_000), ("c", 1_000)] {
            let mut event = hookbridge_protocol::HookEvent::bare(
                hookbridge_protocol::EventKind::UserPrompt,
                ts,
            );
            event.session_id = Some(sid.into());
            let key = table
                .resolve(&crate::key::Identity::of(&event))
                .unwrap()
                .key;
            table.apply(&key, &event);
        }

        let keys: Vec<String> = visible_summaries(&table, &policy, 3_000)
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn publisher_bumps_revision_only_on_change() {
        let publisher = Publisher::new();
        let mut rx = publisher.subscribe();
        assert!(!publisher.publish(Vec::new()));
        assert_eq!(publisher.revision(), 0);

        let summary = live("s1", 1_000).summary();
        assert!(publisher.publish(vec![summary.clone()]));
        assert!(!publisher.publish(vec![summary]));
        assert_eq!(publisher.revision(), 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(publisher.snapshot_arc().load().len(), 1);
    }
}
