//! `hookbridge hook <KIND>`: the process the agent runs for every hook.
//!
//! Async kinds hand their payload to a detached relay worker and exit at
//! once. Sync kinds deliver inline and translate the reply into the agent's
//! output contract. Every failure path exits 0 with no output.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use hookbridge_protocol::{fingerprint, now_millis, EventKind, RelayMeta, SyncReply};
use hookbridge_transport::HostContext;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{current_relay_meta, DispatchConfig};
use crate::hook_output::translate;
use crate::paths::DataPaths;
use crate::worker::{build_frame, deliver, request_stamp, spawn_detached, Stamp};

/// Read at most `limit` bytes. `None` when the input is larger.
pub fn read_bounded<R: Read>(reader: R, limit: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut buf)?;
    if buf.len() > limit {
        return Ok(None);
    }
    Ok(Some(buf))
}

fn read_payload(payload_file: Option<&Path>, limit: usize) -> anyhow::Result<Option<Vec<u8>>> {
    match payload_file {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Ok(read_bounded(file, limit)?)
        }
        None => Ok(read_bounded(std::io::stdin().lock(), limit)?),
    }
}

/// Run the dispatcher and return the process exit code.
pub async fn run(
    ctx: &HostContext,
    paths: &DataPaths,
    kind_name: &str,
    payload_file: Option<&Path>,
) -> i32 {
    let kind = EventKind::parse(kind_name);
    let config = DispatchConfig::default();

    let payload = match read_payload(payload_file, config.max_payload_bytes) {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            warn!(
                component = "dispatch",
                event = "dispatch.payload_too_large",
                kind = %kind_name,
                limit = config.max_payload_bytes,
            );
            return 0;
        }
        Err(e) => {
            warn!(
                component = "dispatch",
                event = "dispatch.payload_read_failed",
                kind = %kind_name,
                error = %e,
            );
            return 0;
        }
    };

    let now = now_millis();
    let meta = current_relay_meta();
    let stamp = Stamp {
        event_id: fingerprint(kind, &payload, now),
        timestamp: now,
        request_id: request_stamp(kind),
    };

    if !kind.is_sync() {
        match hand_off(paths, kind_name, &payload, &stamp, &meta) {
            Ok(()) => return 0,
            Err(e) => {
                debug!(
                    component = "dispatch",
                    event = "dispatch.handoff_failed",
                    kind = %kind_name,
                    error = %e,
                );
            }
        }
    }

    let reply = match build_frame(kind_name, &meta, &payload, &stamp) {
        Ok(Some(frame)) => deliver(ctx, paths, &config, kind, &frame).await,
        Ok(None) => SyncReply::neutral(),
        Err(e) => {
            warn!(
                component = "dispatch",
                event = "dispatch.payload_malformed",
                kind = %kind_name,
                error = %e,
            );
            SyncReply::neutral()
        }
    };

    translate(kind, &reply).emit()
}

pub fn payload_file_path(dir: &Path) -> PathBuf {
    dir.join(format!("hookbridge-{}.payload", Uuid::new_v4()))
}

/// Write the payload to a temp file and start a detached relay worker on it.
fn hand_off(
    paths: &DataPaths,
    kind_name: &str,
    payload: &[u8],
    stamp: &Stamp,
    meta: &RelayMeta,
) -> anyhow::Result<()> {
    let payload_path = payload_file_path(&std::env::temp_dir());
    std::fs::write(&payload_path, payload)
        .with_context(|| format!("failed to write {}", payload_path.display()))?;

    let exe = std::env::current_exe().context("failed to determine current executable path")?;
    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("--data-dir")
        .arg(paths.root())
        .arg("relay-worker")
        .arg("--kind")
        .arg(kind_name)
        .arg("--payload-file")
        .arg(&payload_path)
        .arg("--event-id")
        .arg(&stamp.event_id)
        .arg("--timestamp")
        .arg(stamp.timestamp.to_string())
        // The worker's parent is this process, which is about to exit.
        .env("HOOKBRIDGE_HOST_PID", meta.host_pid.to_string());

    if let Err(e) = spawn_detached(cmd) {
        let _ = std::fs::remove_file(&payload_path);
        return Err(e).context("failed to spawn relay worker");
    }
    debug!(
        component = "dispatch",
        event = "dispatch.handed_off",
        kind = %kind_name,
        payload = %payload_path.display(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_read_accepts_up_to_limit() {
        let data = vec![b'x'; 16];
        assert_eq!(read_bounded(&data[..], 16).unwrap().unwrap().len(), 16);
        assert!(read_bounded(&data[..], 15).unwrap().is_none());
        assert_eq!(read_bounded(&b""[..], 16).unwrap().unwrap().len(), 0);
    }

    #[test]
    fn payload_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        std::fs::write(&path, br#"{"session_id":"s1"}"#).unwrap();
        let bytes = read_payload(Some(&path), 1024).unwrap().unwrap();
        assert_eq!(bytes, br#"{"session_id":"s1"}"#);
        assert!(read_payload(Some(&dir.path().join("missing")), 1024).is_err());
    }

    #[test]
    fn payload_file_names_are_unique() {
        let dir = Path::new("/tmp");
        let a = payload_file_path(dir);
        let b = payload_file_path(dir);
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("hookbridge-") && name.ends_with(".payload"));
    }
}
