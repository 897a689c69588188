//! Runtime knobs for the dispatcher, the daemon and the headless consumer.

use std::time::Duration;

use hookbridge_protocol::RelayMeta;
use hookbridge_transport::SettleConfig;

pub const DEFAULT_SOURCE: &str = "claude";

/// Hook payloads above this are dropped.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub connect_timeout: Duration,
    /// How long to keep retrying after starting the daemon ourselves.
    pub autostart_wait: Duration,
    pub autostart_poll: Duration,
    pub max_payload_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            connect_timeout: Duration::from_secs(1),
            autostart_wait: Duration::from_millis(1500),
            autostart_poll: Duration::from_millis(100),
            max_payload_bytes: MAX_PAYLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub idle_timeout: Duration,
    pub consumer_probe_interval: Duration,
    pub consumer_probe_timeout: Duration,
    pub consumer_connect_timeout: Duration,
    /// Budget for forwarding one async frame.
    pub async_forward_budget: Duration,
    pub settle: SettleConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            idle_timeout: Duration::from_secs(30 * 60),
            consumer_probe_interval: Duration::from_secs(5),
            consumer_probe_timeout: Duration::from_millis(300),
            consumer_connect_timeout: Duration::from_secs(1),
            async_forward_budget: Duration::from_secs(1),
            settle: SettleConfig::default(),
        }
    }
}

/// Relay metadata for this hook process, from the environment.
///
/// `lookup` returns a variable's value; `parent_pid` is used when no host
/// pid is configured.
pub fn relay_meta_from_env<F>(lookup: F, parent_pid: u32) -> RelayMeta
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    let terminal_id = ["HOOKBRIDGE_TERMINAL_ID", "TERM_SESSION_ID", "ITERM_SESSION_ID", "WT_SESSION"]
        .into_iter()
        .find_map(|name| get(name))
        .unwrap_or_default();

    RelayMeta {
        source: get("HOOKBRIDGE_SOURCE").unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
        run_id: get("HOOKBRIDGE_RUN_ID").unwrap_or_default(),
        terminal_id,
        host_pid: get("HOOKBRIDGE_HOST_PID")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(parent_pid),
    }
}

pub fn parent_pid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: getppid has no preconditions.
        let pid = unsafe { libc::getppid() };
        u32::try_from(pid).unwrap_or(0)
    }
    #[cfg(not(unix))]
    {
        0
    }
}

pub fn current_relay_meta() -> RelayMeta {
    relay_meta_from_env(|name| std::env::var(name).ok(), parent_pid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let meta = relay_meta_from_env(env(&[]), 321);
        assert_eq!(meta.source, "claude");
        assert_eq!(meta.run_id, "");
        assert_eq!(meta.terminal_id, "");
        assert_eq!(meta.host_pid, 321);
    }

    #[test]
    fn terminal_id_falls_back_through_known_variables() {
        let meta = relay_meta_from_env(env(&[("ITERM_SESSION_ID", "w0t1"), ("WT_SESSION", "wt")]), 0);
        assert_eq!(meta.terminal_id, "w0t1");

        let meta = relay_meta_from_env(
            env(&[("HOOKBRIDGE_TERMINAL_ID", "mine"), ("TERM_SESSION_ID", "term")]),
            0,
        );
        assert_eq!(meta.terminal_id, "mine");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let meta = relay_meta_from_env(
            env(&[
                ("HOOKBRIDGE_SOURCE", "codex"),
                ("HOOKBRIDGE_RUN_ID", "run-7"),
                ("HOOKBRIDGE_HOST_PID", "4242"),
            ]),
            1,
        );
        assert_eq!(meta.source, "codex");
        assert_eq!(meta.run_id, "run-7");
        assert_eq!(meta.host_pid, 4242);
    }

    #[test]
    fn garbage_host_pid_uses_parent() {
        let meta = relay_meta_from_env(env(&[("HOOKBRIDGE_HOST_PID", "abc")]), 9);
        assert_eq!(meta.host_pid, 9);
    }
}
