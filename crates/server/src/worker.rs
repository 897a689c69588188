//! Delivering one hook event to the daemon.
//!
//! Used inline for sync kinds and from the detached `relay-worker` process
//! for async ones. Nothing here fails loudly: every problem ends in a
//! neutral reply.

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use hookbridge_protocol::wire::decode_payload_bytes;
use hookbridge_protocol::{encode_frame, new_id, EventKind, RelayMeta, SyncReply};
use hookbridge_transport::{
    connect, read_reply_line, resolve, Endpoint, HostContext, Leg, RelayStream,
};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::paths::DataPaths;

/// Ids stamped onto a payload before it leaves the hook process.
#[derive(Debug, Clone, Default)]
pub struct Stamp {
    pub event_id: String,
    pub timestamp: u64,
    pub request_id: Option<String>,
}

/// Build the wire frame. `Ok(None)` means there is nothing worth sending.
pub fn build_frame(
    kind_name: &str,
    meta: &RelayMeta,
    payload_bytes: &[u8],
    stamp: &Stamp,
) -> anyhow::Result<Option<Vec<u8>>> {
    let text = decode_payload_bytes(payload_bytes);
    let text = text.trim();
    let mut payload = if text.is_empty() {
        serde_json::Map::new()
    } else {
        match serde_json::from_str::<Value>(text).context("hook payload is not valid JSON")? {
            Value::Object(map) => map,
            _ => return Ok(None),
        }
    };

    if !stamp.event_id.is_empty() {
        payload.insert("event_id".into(), Value::from(stamp.event_id.clone()));
    }
    if stamp.timestamp > 0 {
        payload.insert("timestamp".into(), Value::from(stamp.timestamp));
    }
    if let Some(request_id) = &stamp.request_id {
        payload
            .entry("request_id")
            .or_insert_with(|| Value::from(request_id.clone()));
    }

    let payload = Value::Object(payload);
    Ok(Some(encode_frame(kind_name, meta, Some(&payload))))
}

/// Send a frame and, for sync kinds, wait for the reply.
pub async fn deliver(
    ctx: &HostContext,
    paths: &DataPaths,
    config: &DispatchConfig,
    kind: EventKind,
    frame: &[u8],
) -> SyncReply {
    let endpoint = resolve(ctx, Leg::Client);
    let mut stream = match connect_or_start(&endpoint, paths, config).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                component = "worker",
                event = "worker.connect_failed",
                endpoint = %endpoint,
                kind = %kind,
                error = %e,
            );
            return SyncReply::neutral();
        }
    };

    if let Err(e) = stream.write_all(frame).await {
        warn!(
            component = "worker",
            event = "worker.write_failed",
            endpoint = %endpoint,
            error = %e,
        );
        return SyncReply::neutral();
    }
    let _ = stream.flush().await;

    let Some(timeout) = kind.sync_timeout() else {
        // Async senders half-close so the daemon sees end of stream at once.
        let _ = stream.shutdown().await;
        debug!(
            component = "worker",
            event = "worker.delivered",
            kind = %kind,
            bytes = frame.len(),
        );
        return SyncReply::neutral();
    };

    // Sync senders keep their write side open: closing the connection is
    // how the daemon learns this hook went away.
    match read_reply_line(&mut stream, timeout).await {
        Ok(Some(line)) => {
            let reply = SyncReply::parse_line(&line);
            debug!(
                component = "worker",
                event = "worker.reply",
                kind = %kind,
                decision = ?reply.decision,
                neutral = reply.neutral,
            );
            reply
        }
        Ok(None) => SyncReply::neutral(),
        Err(e) => {
            info!(
                component = "worker",
                event = "worker.reply_failed",
                kind = %kind,
                error = %e,
            );
            SyncReply::neutral()
        }
    }
}

/// Connect, starting the daemon if nobody is listening.
async fn connect_or_start(
    endpoint: &Endpoint,
    paths: &DataPaths,
    config: &DispatchConfig,
) -> anyhow::Result<RelayStream> {
    if let Ok(stream) = connect(endpoint, config.connect_timeout).await {
        return Ok(stream);
    }

    spawn_daemon(paths)?;

    let deadline = tokio::time::Instant::now() + config.autostart_wait;
    loop {
        tokio::time::sleep(config.autostart_poll).await;
        match connect(endpoint, config.connect_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) if tokio::time::Instant::now() >= deadline => {
                return Err(e).context("daemon did not come up");
            }
            Err(_) => continue,
        }
    }
}

fn spawn_daemon(paths: &DataPaths) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("failed to determine current executable path")?;
    debug!(
        component = "worker",
        event = "worker.daemon_autostart",
        exe = %exe.display(),
    );
    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("--data-dir").arg(paths.root()).arg("daemon");
    spawn_detached(cmd).context("failed to spawn daemon")
}

/// Spawn `cmd` so it outlives this process: new session on Unix, detached
/// process group on Windows, stdio redirected to null.
pub fn spawn_detached(mut cmd: std::process::Command) -> std::io::Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    cmd.spawn().map(|_| ())
}

/// Entry point of the detached `relay-worker` process.
pub async fn run_relay_worker(
    ctx: &HostContext,
    paths: &DataPaths,
    kind_name: &str,
    payload_file: &Path,
    stamp: Stamp,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(payload_file)
        .with_context(|| format!("failed to read {}", payload_file.display()))?;
    if let Err(e) = std::fs::remove_file(payload_file) {
        debug!(
            component = "worker",
            event = "worker.payload_cleanup_failed",
            path = %payload_file.display(),
            error = %e,
        );
    }

    let meta = crate::config::current_relay_meta();
    let frame = match build_frame(kind_name, &meta, &bytes, &stamp) {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(e) => {
            warn!(
                component = "worker",
                event = "worker.payload_malformed",
                kind = %kind_name,
                error = %e,
            );
            return Ok(());
        }
    };

    let config = DispatchConfig::default();
    deliver(ctx, paths, &config, EventKind::parse(kind_name), &frame).await;
    Ok(())
}

/// Request id for a sync delivery.
pub fn request_stamp(kind: EventKind) -> Option<String> {
    kind.is_sync().then(new_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookbridge_protocol::{decode_frame, Decision, Frame};
    use hookbridge_transport::{Listener, Platform};
    use tokio::io::AsyncReadExt;

    fn stamp() -> Stamp {
        Stamp {
            event_id: "abc123".into(),
            timestamp: 1_700_000_000_000,
            request_id: Some("r1".into()),
        }
    }

    fn ctx_for(port: u16, state_dir: &Path) -> HostContext {
        HostContext {
            platform: Platform::current(),
            in_container: true,
            home_dir: state_dir.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
            gateway_host: "127.0.0.1".into(),
            client_port: port,
            consumer_port: 0,
        }
    }

    #[test]
    fn frame_carries_stamp_and_meta() {
        let meta = RelayMeta {
            source: "claude".into(),
            host_pid: 77,
            ..Default::default()
        };
        let frame = build_frame("PermissionRequest", &meta, br#"{"session_id":"s1"}"#, &stamp())
            .unwrap()
            .unwrap();

        let Frame::Event(raw) = decode_frame(&frame).unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(raw.kind(), EventKind::PermissionRequest);
        assert_eq!(raw.meta.host_pid, 77);
        assert_eq!(raw.request_id(), Some("r1"));
        let event = raw.into_event(1).unwrap();
        assert_eq!(event.event_id, "abc123");
        assert_eq!(event.timestamp, 1_700_000_000_000);
        assert_eq!(event.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn utf16_payload_is_decoded() {
        let text = r#"{"session_id":"s1"}"#;
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let frame = build_frame("stop", &RelayMeta::default(), &bytes, &Stamp::default())
            .unwrap()
            .unwrap();
        let Frame::Event(raw) = decode_frame(&frame).unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(raw.into_event(1).unwrap().session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn malformed_json_is_an_error_and_non_objects_are_skipped() {
        assert!(build_frame("stop", &RelayMeta::default(), b"{oops", &stamp()).is_err());
        assert!(build_frame("stop", &RelayMeta::default(), b"[1,2]", &stamp())
            .unwrap()
            .is_none());
    }

    #[test]
    fn empty_payload_still_sends_stamp() {
        let frame = build_frame("session_end", &RelayMeta::default(), b"", &stamp())
            .unwrap()
            .unwrap();
        let Frame::Event(raw) = decode_frame(&frame).unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(raw.into_event(1).unwrap().event_id, "abc123");
    }

    #[tokio::test]
    async fn sync_delivery_returns_daemon_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = Listener::bind(&Endpoint::loopback(0)).await.unwrap();
        let Endpoint::Tcp { port, .. } = listener.local_endpoint().unwrap() else {
            panic!("expected tcp");
        };

        tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(SyncReply::deny("nope").to_line().as_bytes())
                .await
                .unwrap();
        });

        let reply = deliver(
            &ctx_for(port, dir.path()),
            &DataPaths::at(dir.path()),
            &DispatchConfig::default(),
            EventKind::PermissionRequest,
            b"permission_request\n\n{}",
        )
        .await;
        assert_eq!(reply.decision, Decision::Deny);
        assert_eq!(reply.reason.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn garbage_reply_is_neutral() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = Listener::bind(&Endpoint::loopback(0)).await.unwrap();
        let Endpoint::Tcp { port, .. } = listener.local_endpoint().unwrap() else {
            panic!("expected tcp");
        };

        tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"definitely not json\n").await.unwrap();
        });

        let reply = deliver(
            &ctx_for(port, dir.path()),
            &DataPaths::at(dir.path()),
            &DispatchConfig::default(),
            EventKind::Stop,
            b"stop\n\n{}",
        )
        .await;
        assert!(reply.neutral);
    }
}
