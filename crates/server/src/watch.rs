//! `hookbridge watch`: a headless consumer.
//!
//! Runs the session engine behind the consumer listener and prints the
//! published session list every time it changes. With `--auto-allow` every
//! pending request is answered with allow.

use std::time::Duration;

use anyhow::Context;
use hookbridge_engine::listener::serve;
use hookbridge_engine::{Engine, EngineConfig, EngineError, EngineHandle, VisibilityPolicy};
use hookbridge_protocol::{SessionStatus, SessionSummary, SyncReply};
use hookbridge_transport::{resolve, HostContext, Leg, Listener, SettleConfig};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::daemon::shutdown_signal;

const AUTO_ALLOW_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub ttl: Duration,
    pub auto_allow: bool,
    pub run_id: Option<String>,
}

pub async fn run(ctx: &HostContext, options: WatchOptions) -> anyhow::Result<()> {
    let endpoint = resolve(ctx, Leg::Consumer);
    let listener = Listener::bind(&endpoint)
        .await
        .with_context(|| format!("failed to bind consumer endpoint {endpoint}"))?;

    let config = EngineConfig {
        visibility: VisibilityPolicy {
            ttl: options.ttl,
            run_id: options.run_id.clone(),
            ..VisibilityPolicy::default()
        },
        ..EngineConfig::default()
    };
    let handle = Engine::spawn(config);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(
        listener,
        handle.clone(),
        SettleConfig::default(),
        async move {
            let _ = stop_rx.await;
        },
    ));

    info!(
        component = "watch",
        event = "watch.started",
        endpoint = %endpoint,
        ttl_secs = options.ttl.as_secs(),
        auto_allow = options.auto_allow,
        run_id = options.run_id.as_deref().unwrap_or(""),
    );
    println!("listening on {endpoint}");

    let mut revision = handle.subscribe();
    let mut allow_ticker = tokio::time::interval(AUTO_ALLOW_INTERVAL);
    allow_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = revision.changed() => {
                if changed.is_err() {
                    warn!(component = "watch", event = "watch.engine_gone");
                    break;
                }
                let rev = *revision.borrow_and_update();
                print_sessions(rev, &handle.sessions());
                if options.auto_allow {
                    allow_pending(&handle).await?;
                }
            }
            _ = allow_ticker.tick(), if options.auto_allow => {
                allow_pending(&handle).await?;
            }
        }
    }

    let _ = stop_tx.send(());
    let _ = server.await;
    info!(component = "watch", event = "watch.stopped");
    Ok(())
}

fn print_sessions(revision: u64, sessions: &[SessionSummary]) {
    info!(
        component = "watch",
        event = "watch.published",
        revision,
        sessions = sessions.len(),
    );
    println!("-- revision {revision}: {} session(s)", sessions.len());
    for session in sessions {
        println!("{}", format_session_line(session));
    }
}

/// Answer every pending request with allow. Returns how many were settled.
pub async fn allow_pending(handle: &EngineHandle) -> Result<usize, EngineError> {
    let mut settled = 0;
    for pending in handle.pending().await? {
        if handle
            .decide(pending.request_id.clone(), SyncReply::allow())
            .await?
            .settled()
        {
            info!(
                component = "watch",
                event = "watch.auto_allowed",
                request_id = %pending.request_id,
                session = %pending.session_key,
            );
            settled += 1;
        }
    }
    Ok(settled)
}

pub fn format_session_line(session: &SessionSummary) -> String {
    let status = match session.status {
        SessionStatus::Waiting => "waiting",
        SessionStatus::Working => "working",
        SessionStatus::Ended => "ended",
    };
    let mut line = format!("{:<8} {}", status, session.key);
    if let Some(cwd) = &session.cwd {
        line.push_str(&format!("  {cwd}"));
    }
    let detail = session
        .current_activity
        .as_deref()
        .or(session.last_message.as_deref());
    if let Some(detail) = detail {
        line.push_str(&format!("  | {detail}"));
    }
    if let Some(request_id) = &session.pending_request_id {
        line.push_str(&format!("  [pending {request_id}]"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookbridge_protocol::{Decision, EventKind, HookEvent};

    fn summary() -> SessionSummary {
        SessionSummary {
            key: "s1".into(),
            session_id: Some("s1".into()),
            source: "claude".into(),
            run_id: String::new(),
            terminal_id: String::new(),
            host_pid: 0,
            cwd: Some("/work/app".into()),
            status: SessionStatus::Waiting,
            started_at: 1,
            last_event_at: 2,
            waiting_since: Some(2),
            current_activity: Some("Permission: Bash ls".into()),
            last_message: None,
            last_prompt: None,
            last_tool: None,
            pending_request_id: Some("r1".into()),
            active_subagents: 0,
            tasks_completed: 0,
            compaction_count: 0,
        }
    }

    #[test]
    fn session_line_shows_status_location_and_pending() {
        assert_eq!(
            format_session_line(&summary()),
            "waiting  s1  /work/app  | Permission: Bash ls  [pending r1]"
        );
    }

    #[test]
    fn session_line_falls_back_to_last_message() {
        let session = SessionSummary {
            status: SessionStatus::Working,
            cwd: None,
            current_activity: None,
            last_message: Some("done".into()),
            pending_request_id: None,
            ..summary()
        };
        assert_eq!(format_session_line(&session), "working  s1  | done");
    }

    #[tokio::test]
    async fn allow_pending_answers_every_request() {
        let handle = Engine::spawn(EngineConfig::default());

        let mut event = HookEvent::bare(EventKind::PermissionRequest, 1_000);
        event.session_id = Some("s1".into());
        event.request_id = Some("r1".into());
        event.tool_name = Some("Bash".into());
        let (_, answer) = handle.ingest_sync(event).await.unwrap();

        assert_eq!(allow_pending(&handle).await.unwrap(), 1);
        let reply = answer.await.unwrap();
        assert_eq!(reply.decision, Decision::Allow);
        assert!(!reply.neutral);
        assert_eq!(allow_pending(&handle).await.unwrap(), 0);
    }
}
