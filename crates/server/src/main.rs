//! hookbridge
//!
//! Relays coding-agent hook events to a local session tracker. The agent runs
//! `hookbridge hook <KIND>` for every hook; a broker daemon carries the event
//! to whichever consumer is listening and brings answers back for the kinds
//! that wait for one.

mod cmd_status;
mod config;
mod daemon;
mod dispatch;
mod hook_output;
mod logging;
mod paths;
mod pid_lock;
mod watch;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use hookbridge_transport::HostContext;
use tracing::error;

use crate::config::DaemonConfig;
use crate::logging::{init_logging, LogTarget};
use crate::paths::DataPaths;
use crate::worker::Stamp;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "hookbridge", version, about = "Relay agent hook events to a local session tracker")]
struct Cli {
    /// Data directory (default: ~/.hookbridge)
    #[arg(long, global = true, env = "HOOKBRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one hook invocation (payload on stdin)
    Hook {
        /// Hook kind, native (`PreToolUse`) or snake case (`tool_start`)
        #[arg(env = "HOOKBRIDGE_HOOK_KIND")]
        kind: String,

        /// Read the payload from a file instead of stdin
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },

    /// Internal: deliver an async event handed off by `hook`
    #[command(hide = true)]
    RelayWorker {
        #[arg(long)]
        kind: String,

        #[arg(long)]
        payload_file: PathBuf,

        #[arg(long, default_value = "")]
        event_id: String,

        #[arg(long, default_value_t = 0)]
        timestamp: u64,
    },

    /// Run the broker daemon in the foreground
    Daemon {
        /// Exit after this many seconds without hook traffic
        #[arg(long, env = "HOOKBRIDGE_IDLE_TIMEOUT_SECS", default_value_t = 30 * 60)]
        idle_timeout_secs: u64,
    },

    /// Run a headless consumer and print live sessions
    Watch {
        /// Hide sessions silent for longer than this
        #[arg(long, env = "HOOKBRIDGE_TTL_SECS", default_value_t = 2 * 60 * 60)]
        ttl_secs: u64,

        /// Answer every permission and lifecycle request with allow
        #[arg(long)]
        auto_allow: bool,

        /// Only show sessions started under this run id
        #[arg(long, env = "HOOKBRIDGE_RUN_ID")]
        run_id: Option<String>,
    },

    /// Show endpoints, daemon and consumer state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    let ctx = HostContext::detect(paths.root());

    match cli.command {
        Commands::Hook { kind, payload_file } => {
            // A hook must never fail the agent, so logging problems are ignored.
            let guard = init_logging(&paths.log_dir(), LogTarget::Hook).ok();
            let code = dispatch::run(&ctx, &paths, &kind, payload_file.as_deref()).await;
            drop(guard);
            std::process::exit(code);
        }
        Commands::RelayWorker {
            kind,
            payload_file,
            event_id,
            timestamp,
        } => {
            let _guard = init_logging(&paths.log_dir(), LogTarget::Hook).ok();
            let stamp = Stamp {
                event_id,
                timestamp,
                request_id: None,
            };
            if let Err(e) =
                worker::run_relay_worker(&ctx, &paths, &kind, &payload_file, stamp).await
            {
                error!(
                    component = "worker",
                    event = "worker.failed",
                    kind = %kind,
                    error = %e,
                );
            }
            Ok(())
        }
        Commands::Daemon { idle_timeout_secs } => {
            let _guard = init_logging(&paths.log_dir(), LogTarget::Daemon)?;
            let config = DaemonConfig {
                idle_timeout: Duration::from_secs(idle_timeout_secs),
                ..DaemonConfig::default()
            };
            if let Err(e) = daemon::run(&ctx, &paths, config).await {
                error!(
                    component = "daemon",
                    event = "daemon.failed",
                    error = %e,
                );
                return Err(e);
            }
            Ok(())
        }
        Commands::Watch {
            ttl_secs,
            auto_allow,
            run_id,
        } => {
            let _guard = init_logging(&paths.log_dir(), LogTarget::Watch)?;
            let options = watch::WatchOptions {
                ttl: Duration::from_secs(ttl_secs),
                auto_allow,
                run_id: run_id.filter(|id| !id.trim().is_empty()),
            };
            watch::run(&ctx, options).await
        }
        Commands::Status => cmd_status::run(&ctx, &paths).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_subcommand_parses_kind_and_payload_file() {
        let cli = Cli::try_parse_from([
            "hookbridge",
            "--data-dir",
            "/tmp/hb",
            "hook",
            "PreToolUse",
            "--payload-file",
            "/tmp/p.json",
        ])
        .unwrap();
        assert_eq!(cli.data_dir.as_deref(), Some(std::path::Path::new("/tmp/hb")));
        match cli.command {
            Commands::Hook { kind, payload_file } => {
                assert_eq!(kind, "PreToolUse");
                assert_eq!(payload_file, Some(PathBuf::from("/tmp/p.json")));
            }
            _ => panic!("expected hook"),
        }
    }

    #[test]
    fn relay_worker_accepts_handoff_arguments() {
        let cli = Cli::try_parse_from([
            "hookbridge",
            "relay-worker",
            "--kind",
            "tool_start",
            "--payload-file",
            "/tmp/x.payload",
            "--event-id",
            "abc",
            "--timestamp",
            "42",
        ])
        .unwrap();
        match cli.command {
            Commands::RelayWorker {
                kind,
                event_id,
                timestamp,
                ..
            } => {
                assert_eq!(kind, "tool_start");
                assert_eq!(event_id, "abc");
                assert_eq!(timestamp, 42);
            }
            _ => panic!("expected relay-worker"),
        }
    }

    #[test]
    fn watch_flags_parse() {
        let cli = Cli::try_parse_from(["hookbridge", "watch", "--ttl-secs", "60", "--auto-allow"])
            .unwrap();
        match cli.command {
            Commands::Watch {
                ttl_secs,
                auto_allow,
                ..
            } => {
                assert_eq!(ttl_secs, 60);
                assert!(auto_allow);
            }
            _ => panic!("expected watch"),
        }
    }
}
