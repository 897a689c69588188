//! Endpoint resolution.
//!
//! Dispatcher, worker and daemon each call [`resolve`] on their own and land
//! on the same endpoint without coordinating. Resolution is pure: detection
//! of the host context happens once in [`HostContext::detect`], and nothing
//! here creates a socket.

use std::fmt;
use std::path::{Path, PathBuf};

use hookbridge_protocol::short_hash;

/// Fixed loopback port hooks use to reach the daemon over TCP.
pub const DEFAULT_CLIENT_PORT: u16 = 47820;

/// Fixed loopback port the consumer listens on for the daemon.
pub const DEFAULT_CONSUMER_PORT: u16 = 47821;

pub const DEFAULT_GATEWAY_HOST: &str = "host.docker.internal";

const CONTAINER_SENTINELS: &[&str] = &["/.dockerenv", "/run/.containerenv"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
    NamedPipe(String),
}

impl Endpoint {
    pub fn loopback(port: u16) -> Self {
        Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::NamedPipe(name) => write!(f, "pipe://{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Which hop of the relay an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Hook process → daemon.
    Client,
    /// Loopback TCP the daemon also listens on for containerized hooks.
    Bridge,
    /// Daemon → consumer.
    Consumer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    pub platform: Platform,
    pub in_container: bool,
    pub home_dir: PathBuf,
    pub state_dir: PathBuf,
    pub gateway_host: String,
    pub client_port: u16,
    pub consumer_port: u16,
}

impl HostContext {
    /// Inspect the environment once. Reads env vars and checks for container
    /// sentinel files; never creates anything.
    pub fn detect(state_dir: &Path) -> Self {
        let sentinels: Vec<&Path> = CONTAINER_SENTINELS.iter().map(Path::new).collect();
        HostContext {
            platform: Platform::current(),
            in_container: detect_container(
                std::env::var("HOOKBRIDGE_IN_CONTAINER").ok().as_deref(),
                &sentinels,
            ),
            home_dir: dirs::home_dir().unwrap_or_else(std::env::temp_dir),
            state_dir: state_dir.to_path_buf(),
            gateway_host: std::env::var("HOOKBRIDGE_HOST_GATEWAY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GATEWAY_HOST.to_string()),
            client_port: port_from_env("HOOKBRIDGE_CLIENT_PORT", DEFAULT_CLIENT_PORT),
            consumer_port: port_from_env("HOOKBRIDGE_CONSUMER_PORT", DEFAULT_CONSUMER_PORT),
        }
    }
}

fn port_from_env(var: &str, default: u16) -> u16 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|port| *port > 0)
        .unwrap_or(default)
}

/// An explicit `HOOKBRIDGE_IN_CONTAINER` wins; otherwise any sentinel file.
pub fn detect_container(env_override: Option<&str>, sentinels: &[&Path]) -> bool {
    match env_override.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if v == "1" || v == "true" || v == "yes" => true,
        Some(v) if v == "0" || v == "false" || v == "no" => false,
        _ => sentinels.iter().any(|path| path.exists()),
    }
}

pub fn resolve(ctx: &HostContext, leg: Leg) -> Endpoint {
    match leg {
        Leg::Consumer => Endpoint::loopback(ctx.consumer_port),
        Leg::Bridge => Endpoint::loopback(ctx.client_port),
        Leg::Client if ctx.in_container => Endpoint::Tcp {
            host: ctx.gateway_host.clone(),
            port: ctx.client_port,
        },
        Leg::Client => match ctx.platform {
            Platform::Unix => Endpoint::Unix(ctx.state_dir.join("relay.sock")),
            Platform::Windows => Endpoint::NamedPipe(pipe_name(&ctx.home_dir)),
        },
    }
}

/// Per-user pipe name so concurrent users on one machine never collide.
pub fn pipe_name(home_dir: &Path) -> String {
    let hash = short_hash(home_dir.to_string_lossy().as_bytes(), 12);
    format!(r"\\.\pipe\hookbridge-{hash}")
}

/// Endpoints the daemon listens on, primary first.
pub fn daemon_endpoints(ctx: &HostContext) -> Vec<Endpoint> {
    let primary = resolve(ctx, Leg::Client);
    let bridge = resolve(ctx, Leg::Bridge);
    if matches!(primary, Endpoint::Tcp { .. }) {
        vec![bridge]
    } else {
        vec![primary, bridge]
    }
}
