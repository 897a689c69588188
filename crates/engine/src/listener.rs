//! Consumer-side listener: turns relayed frames into engine input.
//!
//! One frame per connection. Async events are ingested and the connection
//! closed. Sync events keep the connection until the engine answers, the
//! sender goes away, or the kind's timeout elapses.

use std::future::Future;
use std::time::Duration;

use hookbridge_protocol::{
    decode_frame, fingerprint, now_millis, Frame, HookEvent, SyncReply, LIFECYCLE_SYNC_TIMEOUT,
};
use hookbridge_transport::{
    collect_frame, peer_closed, write_reply, Listener, RelayStream, SettleConfig, SettleReason,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::engine::{EngineHandle, IngestOutcome};
use crate::EngineError;

/// Accept connections until `shutdown` resolves.
pub async fn serve<F>(mut listener: Listener, handle: EngineHandle, settle: SettleConfig, shutdown: F)
where
    F: Future<Output = ()>,
{
    let endpoint = listener
        .local_endpoint()
        .map(|e| e.to_string())
        .unwrap_or_default();
    info!(
        component = "listener",
        event = "listener.started",
        endpoint = %endpoint,
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handle, settle).await {
                            warn!(
                                component = "listener",
                                event = "listener.connection_failed",
                                error = %e,
                            );
                        }
                    });
                }
                Err(e) => {
                    warn!(
                        component = "listener",
                        event = "listener.accept_failed",
                        error = %e,
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }

    info!(
        component = "listener",
        event = "listener.stopped",
        endpoint = %endpoint,
    );
}

async fn handle_connection(
    mut stream: RelayStream,
    handle: EngineHandle,
    settle: SettleConfig,
) -> Result<(), EngineError> {
    let (bytes, reason) = collect_frame(&mut stream, &settle).await?;
    let raw = match decode_frame(&bytes)? {
        Frame::Probe => {
            debug!(component = "listener", event = "listener.probe");
            return Ok(());
        }
        Frame::Event(raw) => raw,
    };

    let now = now_millis();
    let kind = raw.kind();
    let payload_bytes = raw
        .payload
        .as_ref()
        .map(|p| p.to_string().into_bytes())
        .unwrap_or_default();
    let mut event = raw.into_event(now)?;
    if event.event_id.is_empty() {
        event.event_id = fingerprint(kind, &payload_bytes, event.timestamp);
    }

    if !kind.is_sync() {
        handle.ingest(event).await?;
        return Ok(());
    }

    let timeout = kind.sync_timeout().unwrap_or(LIFECYCLE_SYNC_TIMEOUT);
    let reply = wait_for_answer(&mut stream, &handle, event, reason, timeout).await?;
    if let Some(reply) = reply {
        write_reply(&mut stream, &reply).await?;
        let _ = stream.shutdown().await;
    }
    Ok(())
}

/// `None` means the sender hung up first and nothing should be written.
async fn wait_for_answer(
    stream: &mut RelayStream,
    handle: &EngineHandle,
    event: HookEvent,
    reason: SettleReason,
    timeout: Duration,
) -> Result<Option<SyncReply>, EngineError> {
    let kind = event.kind;
    let (outcome, answer) = handle.ingest_sync(event).await?;
    let request_id = match outcome {
        IngestOutcome::Applied {
            request_id: Some(id),
            ..
        } => id,
        // Already answered neutral by the engine.
        _ => return Ok(Some(answer.await.unwrap_or_else(|_| SyncReply::neutral()))),
    };

    // A sender that half-closed can't be watched for hang-up.
    let watch_close = reason != SettleReason::EndOfStream;

    tokio::select! {
        answer = answer => Ok(Some(answer.unwrap_or_else(|_| SyncReply::neutral()))),
        _ = peer_closed(stream), if watch_close => {
            debug!(
                component = "listener",
                event = "listener.sender_gone",
                kind = %kind,
                request_id = %request_id,
            );
            handle.abandon(request_id).await?;
            Ok(None)
        }
        _ = tokio::time::sleep(timeout) => {
            info!(
                component = "listener",
                event = "listener.sync_timeout",
                kind = %kind,
                request_id = %request_id,
                timeout_secs = timeout.as_secs(),
            );
            handle.abandon(request_id).await?;
            Ok(Some(SyncReply::neutral()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineConfig};
    use hookbridge_protocol::{encode_frame, Decision, EventKind, RelayMeta};
    use hookbridge_transport::{connect, read_reply_line, Endpoint};
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn settle() -> SettleConfig {
        SettleConfig {
            initial_wait: Duration::from_millis(300),
            silence: Duration::from_millis(50),
            max_bytes: 64 * 1024,
        }
    }

    async fn start() -> (Endpoint, EngineHandle, tokio::sync::oneshot::Sender<()>) {
        let handle = Engine::spawn(EngineConfig::default());
        let listener = Listener::bind(&Endpoint::loopback(0)).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, handle.clone(), settle(), async move {
            let _ = stop_rx.await;
        }));
        (endpoint, handle, stop_tx)
    }

    fn meta() -> RelayMeta {
        RelayMeta {
            source: "claude".into(),
            ..Default::default()
        }
    }

    async fn send_async(endpoint: &Endpoint, kind: EventKind, payload: serde_json::Value) {
        let mut stream = connect(endpoint, Duration::from_secs(1)).await.unwrap();
        stream
            .write_all(&encode_frame(kind.as_str(), &meta(), Some(&payload)))
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    }

    async fn wait_for<F>(handle: &EngineHandle, pred: F)
    where
        F: Fn(&[hookbridge_protocol::SessionSummary]) -> bool,
    {
        for _ in 0..100 {
            if pred(&handle.sessions()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn permission_request_is_settled_by_next_tool_start() {
        let (endpoint, handle, _stop) = start().await;

        let mut held = connect(&endpoint, Duration::from_secs(1)).await.unwrap();
        let frame = encode_frame(
            EventKind::PermissionRequest.as_str(),
            &meta(),
            Some(&json!({"session_id": "s1", "request_id": "r1", "tool_name": "Bash"})),
        );
        held.write_all(&frame).await.unwrap();

        wait_for(&handle, |s| {
            s.first().and_then(|s| s.pending_request_id.as_deref()) == Some("r1")
        })
        .await;

        send_async(&endpoint, EventKind::ToolStart, json!({"session_id": "s1", "tool_name": "Bash"})).await;

        let line = read_reply_line(&mut held, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let reply = SyncReply::parse_line(&line);
        assert_eq!(reply.decision, Decision::Allow);
        assert!(!reply.neutral);
        assert!(handle.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sender_hanging_up_abandons_the_request() {
        let (endpoint, handle, _stop) = start().await;

        let mut held = connect(&endpoint, Duration::from_secs(1)).await.unwrap();
        let frame = encode_frame(
            EventKind::Stop.as_str(),
            &meta(),
            Some(&json!({"session_id": "s1", "request_id": "r9"})),
        );
        held.write_all(&frame).await.unwrap();

        for _ in 0..100 {
            if !handle.pending().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.pending().await.unwrap().len(), 1);
        drop(held);

        for _ in 0..100 {
            if handle.pending().await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request was never abandoned");
    }

    #[tokio::test]
    async fn empty_connection_is_a_probe() {
        let (endpoint, handle, _stop) = start().await;
        let stream = connect(&endpoint, Duration::from_secs(1)).await.unwrap();
        drop(stream);

        send_async(&endpoint, EventKind::SessionStart, json!({"session_id": "s1"})).await;
        wait_for(&handle, |s| s.len() == 1).await;
        assert_eq!(handle.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let (endpoint, handle, _stop) = start().await;
        let mut stream = connect(&endpoint, Duration::from_secs(1)).await.unwrap();
        stream.write_all(b"tool_start\n\n{not json").await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        send_async(&endpoint, EventKind::UserPrompt, json!({"session_id": "s2"})).await;
        wait_for(&handle, |s| s.len() == 1).await;
        assert_eq!(handle.sessions()[0].key, "s2");
    }
}
