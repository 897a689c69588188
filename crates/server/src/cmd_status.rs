//! `hookbridge status`: where things live and whether they are up.

use std::time::Duration;

use hookbridge_transport::endpoint::daemon_endpoints;
use hookbridge_transport::{resolve, HostContext, Leg};

use crate::daemon::probe_consumer;
use crate::paths::DataPaths;
use crate::pid_lock::{process_alive, read_pid};

const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
    Running(u32),
    Stale(u32),
    NotRunning,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub data_dir: String,
    pub in_container: bool,
    pub client_endpoint: String,
    pub daemon_endpoints: Vec<String>,
    pub consumer_endpoint: String,
    pub daemon: DaemonState,
    pub daemon_reachable: bool,
    pub consumer_reachable: bool,
    /// Contents of the daemon's endpoint file, if present.
    pub recorded_endpoints: Option<String>,
}

pub async fn gather(ctx: &HostContext, paths: &DataPaths) -> StatusReport {
    let client = resolve(ctx, Leg::Client);
    let consumer = resolve(ctx, Leg::Consumer);

    let daemon = match read_pid(&paths.pid_file_path()) {
        Some(pid) if process_alive(pid) => DaemonState::Running(pid),
        Some(pid) => DaemonState::Stale(pid),
        None => DaemonState::NotRunning,
    };

    StatusReport {
        data_dir: paths.root().display().to_string(),
        in_container: ctx.in_container,
        client_endpoint: client.to_string(),
        daemon_endpoints: daemon_endpoints(ctx).iter().map(|e| e.to_string()).collect(),
        consumer_endpoint: consumer.to_string(),
        daemon,
        daemon_reachable: probe_consumer(&client, PROBE_TIMEOUT).await,
        consumer_reachable: probe_consumer(&consumer, PROBE_TIMEOUT).await,
        recorded_endpoints: std::fs::read_to_string(paths.endpoint_file_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    }
}

pub fn render(report: &StatusReport) -> String {
    let mut lines = vec![
        format!("  hookbridge v{}", crate::VERSION),
        format!("  Data dir: {}", report.data_dir),
        format!(
            "  Host: {}",
            if report.in_container { "container" } else { "native" }
        ),
        format!("  Hook endpoint: {}", report.client_endpoint),
        format!("  Daemon listens on: {}", report.daemon_endpoints.join(", ")),
        format!("  Consumer endpoint: {}", report.consumer_endpoint),
    ];

    lines.push(match &report.daemon {
        DaemonState::Running(pid) => format!("  Daemon PID: {pid} (running)"),
        DaemonState::Stale(pid) => format!("  Daemon PID file: {pid} (stale, process not found)"),
        DaemonState::NotRunning => "  Daemon PID file: not found".to_string(),
    });
    if let Some(recorded) = &report.recorded_endpoints {
        lines.push(format!("  Daemon bound: {}", recorded.replace('\n', ", ")));
    }
    lines.push(format!(
        "  Daemon: {}",
        if report.daemon_reachable { "reachable" } else { "unreachable" }
    ));
    lines.push(format!(
        "  Consumer: {}",
        if report.consumer_reachable { "reachable" } else { "unreachable" }
    ));

    if !report.consumer_reachable {
        lines.push(String::new());
        lines.push("  No consumer is listening. Start one with: hookbridge watch".to_string());
    }
    lines.join("\n")
}

pub async fn run(ctx: &HostContext, paths: &DataPaths) -> anyhow::Result<()> {
    let report = gather(ctx, paths).await;
    println!();
    println!("{}", render(&report));
    println!();
    Ok(())
}
