//! Broker daemon.
//!
//! Sits between short-lived hook processes and the long-lived consumer.
//! Async frames are forwarded fire-and-forget; sync frames hold the hook
//! connection open until the consumer answers, the hook goes away, or the
//! kind's timeout elapses. Exits on its own after a quiet period.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use hookbridge_protocol::{decode_frame, EventKind, Frame, SyncReply};
use hookbridge_transport::endpoint::daemon_endpoints;
use hookbridge_transport::{
    collect_frame, connect, peer_closed, read_reply_line, resolve, write_reply, Endpoint,
    HostContext, Leg, Listener, RelayStream, SettleReason,
};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::paths::DataPaths;
use crate::pid_lock::PidLock;

/// State shared by every connection task.
pub struct DaemonState {
    consumer: Endpoint,
    config: DaemonConfig,
    consumer_up: AtomicBool,
    started: Instant,
    /// Milliseconds since `started` at the last accepted connection.
    last_activity: AtomicU64,
    in_flight: AtomicUsize,
}

impl DaemonState {
    pub fn new(consumer: Endpoint, config: DaemonConfig) -> Self {
        DaemonState {
            consumer,
            config,
            consumer_up: AtomicBool::new(false),
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn consumer_up(&self) -> bool {
        self.consumer_up.load(Ordering::Relaxed)
    }

    fn set_consumer_up(&self, up: bool) {
        let was = self.consumer_up.swap(up, Ordering::Relaxed);
        if was != up {
            info!(
                component = "daemon",
                event = "daemon.consumer_changed",
                consumer = %self.consumer,
                up,
            );
        }
    }

    /// Probe the consumer once and record the result.
    pub async fn refresh_consumer(&self) -> bool {
        let up = probe_consumer(&self.consumer, self.config.consumer_probe_timeout).await;
        self.set_consumer_up(up);
        up
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::Relaxed) == 0 && self.idle_for() >= self.config.idle_timeout
    }

    fn begin_exchange(self: &Arc<Self>) -> ExchangeGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        ExchangeGuard {
            state: Arc::clone(self),
        }
    }
}

/// Marks one sync exchange in flight for the idle watchdog.
struct ExchangeGuard {
    state: Arc<DaemonState>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.state.touch();
    }
}

/// A zero-byte connection: the consumer treats it as a probe.
pub async fn probe_consumer(endpoint: &Endpoint, timeout: Duration) -> bool {
    match connect(endpoint, timeout).await {
        Ok(mut stream) => {
            let _ = stream.shutdown().await;
            true
        }
        Err(_) => false,
    }
}

/// Run the daemon until a signal arrives or it has been idle long enough.
pub async fn run(ctx: &HostContext, paths: &DataPaths, config: DaemonConfig) -> anyhow::Result<()> {
    paths
        .ensure_dirs()
        .with_context(|| format!("failed to create {}", paths.root().display()))?;

    let Some(lock) = PidLock::acquire(&paths.pid_file_path())
        .with_context(|| format!("failed to lock {}", paths.pid_file_path().display()))?
    else {
        info!(
            component = "daemon",
            event = "daemon.already_running",
            pid_file = %paths.pid_file_path().display(),
        );
        return Ok(());
    };

    let mut listeners = Vec::new();
    for (index, endpoint) in daemon_endpoints(ctx).iter().enumerate() {
        match Listener::bind(endpoint).await {
            Ok(listener) => listeners.push(listener),
            Err(e) if index == 0 => {
                return Err(e).with_context(|| format!("failed to bind {endpoint}"));
            }
            Err(e) => {
                warn!(
                    component = "daemon",
                    event = "daemon.bind_failed",
                    endpoint = %endpoint,
                    error = %e,
                );
            }
        }
    }

    let bound: Vec<String> = listeners
        .iter()
        .filter_map(|l| l.local_endpoint().ok())
        .map(|e| e.to_string())
        .collect();
    let endpoint_file = paths.endpoint_file_path();
    if let Err(e) = std::fs::write(&endpoint_file, format!("{}\n", bound.join("\n"))) {
        warn!(
            component = "daemon",
            event = "daemon.endpoint_file_failed",
            path = %endpoint_file.display(),
            error = %e,
        );
    }

    let consumer = resolve(ctx, Leg::Consumer);
    info!(
        component = "daemon",
        event = "daemon.started",
        pid = lock.pid(),
        endpoints = %bound.join(", "),
        consumer = %consumer,
        idle_timeout_secs = config.idle_timeout.as_secs(),
    );

    let state = Arc::new(DaemonState::new(consumer, config));
    serve(listeners, state, shutdown_signal()).await;

    if let Err(e) = std::fs::remove_file(&endpoint_file) {
        debug!(
            component = "daemon",
            event = "daemon.endpoint_file_cleanup_failed",
            error = %e,
        );
    }
    info!(component = "daemon", event = "daemon.stopped", pid = lock.pid());
    drop(lock);
    Ok(())
}

/// Accept on every listener until `shutdown` resolves or the daemon goes idle.
pub async fn serve<F>(listeners: Vec<Listener>, state: Arc<DaemonState>, shutdown: F)
where
    F: Future<Output = ()>,
{
    state.touch();
    state.refresh_consumer().await;

    let mut tasks = JoinSet::new();
    tasks.spawn(probe_loop(Arc::clone(&state)));
    for listener in listeners {
        tasks.spawn(accept_loop(listener, Arc::clone(&state)));
    }

    tokio::select! {
        _ = shutdown => {
            info!(component = "daemon", event = "daemon.shutdown_requested");
        }
        _ = idle_watchdog(Arc::clone(&state)) => {
            info!(
                component = "daemon",
                event = "daemon.idle_exit",
                idle_secs = state.idle_for().as_secs(),
            );
        }
    }
    tasks.shutdown().await;
}

async fn probe_loop(state: Arc<DaemonState>) {
    let mut ticker = tokio::time::interval(state.config.consumer_probe_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires at once and `serve` has just probed.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        state.refresh_consumer().await;
    }
}

async fn idle_watchdog(state: Arc<DaemonState>) {
    let check = (state.config.idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(30));
    loop {
        tokio::time::sleep(check).await;
        if state.is_idle() {
            return;
        }
    }
}

async fn accept_loop(mut listener: Listener, state: Arc<DaemonState>) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                state.touch();
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_hook_connection(stream, state).await {
                        debug!(
                            component = "daemon",
                            event = "daemon.connection_failed",
                            error = %e,
                        );
                    }
                });
            }
            Err(e) => {
                warn!(
                    component = "daemon",
                    event = "daemon.accept_failed",
                    error = %e,
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_hook_connection(
    mut stream: RelayStream,
    state: Arc<DaemonState>,
) -> anyhow::Result<()> {
    let (bytes, reason) = collect_frame(&mut stream, &state.config.settle).await?;
    let kind = match decode_frame(&bytes) {
        Ok(Frame::Probe) => {
            debug!(component = "daemon", event = "daemon.probe");
            return Ok(());
        }
        Ok(Frame::Event(raw)) => raw.kind(),
        Err(e) => {
            warn!(
                component = "daemon",
                event = "daemon.frame_malformed",
                bytes = bytes.len(),
                error = %e,
            );
            return Ok(());
        }
    };

    let Some(timeout) = kind.sync_timeout() else {
        let state = Arc::clone(&state);
        let frame = bytes.freeze();
        tokio::spawn(async move { forward_async(&state, kind, &frame).await });
        return Ok(());
    };

    let _exchange = state.begin_exchange();
    if let Some(reply) = relay_sync(&state, &mut stream, kind, &bytes, reason, timeout).await {
        write_reply(&mut stream, &reply).await?;
        let _ = stream.shutdown().await;
    }
    Ok(())
}

/// `None` means the hook hung up and nothing should be written back.
async fn relay_sync(
    state: &DaemonState,
    hook: &mut RelayStream,
    kind: EventKind,
    frame: &[u8],
    reason: SettleReason,
    timeout: Duration,
) -> Option<SyncReply> {
    if !state.consumer_up() {
        debug!(
            component = "daemon",
            event = "daemon.sync_no_consumer",
            kind = %kind,
        );
        return Some(SyncReply::neutral());
    }

    let mut consumer = match connect(&state.consumer, state.config.consumer_connect_timeout).await {
        Ok(consumer) => consumer,
        Err(e) => {
            state.set_consumer_up(false);
            info!(
                component = "daemon",
                event = "daemon.consumer_connect_failed",
                kind = %kind,
                error = %e,
            );
            return Some(SyncReply::neutral());
        }
    };
    if let Err(e) = consumer.write_all(frame).await {
        info!(
            component = "daemon",
            event = "daemon.forward_failed",
            kind = %kind,
            error = %e,
        );
        return Some(SyncReply::neutral());
    }
    let _ = consumer.flush().await;

    // The consumer connection stays open for writing: dropping it is how a
    // hook hang-up reaches the consumer.
    let watch_hook = reason != SettleReason::EndOfStream;
    tokio::select! {
        line = read_reply_line(&mut consumer, timeout) => match line {
            Ok(Some(line)) => {
                let reply = SyncReply::parse_line(&line);
                debug!(
                    component = "daemon",
                    event = "daemon.sync_relayed",
                    kind = %kind,
                    decision = ?reply.decision,
                    neutral = reply.neutral,
                );
                Some(reply)
            }
            Ok(None) => Some(SyncReply::neutral()),
            Err(e) => {
                info!(
                    component = "daemon",
                    event = "daemon.sync_reply_failed",
                    kind = %kind,
                    error = %e,
                );
                Some(SyncReply::neutral())
            }
        },
        _ = peer_closed(hook), if watch_hook => {
            debug!(
                component = "daemon",
                event = "daemon.hook_gone",
                kind = %kind,
            );
            None
        }
    }
}

async fn forward_async(state: &DaemonState, kind: EventKind, frame: &[u8]) {
    let budget = state.config.async_forward_budget;
    let result = tokio::time::timeout(budget, async {
        let mut consumer = connect(&state.consumer, budget).await?;
        consumer.write_all(frame).await?;
        consumer.shutdown().await?;
        Ok::<_, anyhow::Error>(())
    })
    .await;

    match result {
        Ok(Ok(())) => {
            state.set_consumer_up(true);
            debug!(
                component = "daemon",
                event = "daemon.async_forwarded",
                kind = %kind,
                bytes = frame.len(),
            );
        }
        Ok(Err(e)) => {
            state.set_consumer_up(false);
            debug!(
                component = "daemon",
                event = "daemon.async_dropped",
                kind = %kind,
                error = %e,
            );
        }
        Err(_) => {
            state.set_consumer_up(false);
            debug!(
                component = "daemon",
                event = "daemon.async_dropped",
                kind = %kind,
                error = "forward budget elapsed",
            );
        }
    }
}

/// Ctrl-C everywhere, SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(
                component = "daemon",
                event = "daemon.signal_handler_failed",
                error = %e,
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
