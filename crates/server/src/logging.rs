use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";
const HOOK_FILTER: &str = "warn";
const HOOK_DEBUG_FILTER: &str = "debug";

/// Which process is logging; each gets its own file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Daemon,
    Hook,
    Watch,
}

impl LogTarget {
    fn file_name(self) -> &'static str {
        match self {
            LogTarget::Daemon => "daemon.log",
            LogTarget::Hook => "hook.log",
            LogTarget::Watch => "watch.log",
        }
    }

    fn default_filter(self, debug: bool) -> &'static str {
        match self {
            LogTarget::Hook if debug => HOOK_DEBUG_FILTER,
            LogTarget::Hook => HOOK_FILTER,
            LogTarget::Daemon | LogTarget::Watch => DEFAULT_FILTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `pretty` in any case selects pretty output; anything else is JSON.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// The file layer for `target`. Hook processes skip source locations to
/// keep their lines short.
fn file_layer<S>(
    writer: NonBlocking,
    format: LogFormat,
    target: LogTarget,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let locations = target != LogTarget::Hook;
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_file(locations)
        .with_line_number(locations)
        .with_target(locations);
    match format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Json => base
            .json()
            .flatten_event(true)
            .with_current_span(target == LogTarget::Daemon)
            .boxed(),
    }
}

pub struct LoggingHandle {
    pub guard: WorkerGuard,
}

/// `HOOKBRIDGE_LOG_FILTER` > `RUST_LOG` > per-target default.
pub fn filter_directive(
    explicit: Option<String>,
    rust_log: Option<String>,
    target: LogTarget,
    debug: bool,
) -> String {
    explicit
        .filter(|v| !v.trim().is_empty())
        .or_else(|| rust_log.filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| target.default_filter(debug).to_string())
}

pub fn debug_enabled() -> bool {
    matches!(
        std::env::var("HOOKBRIDGE_DEBUG").as_deref(),
        Ok("1") | Ok("true")
    )
}

pub fn init_logging(log_dir: &Path, target: LogTarget) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(target.file_name());

    let directive = filter_directive(
        std::env::var("HOOKBRIDGE_LOG_FILTER").ok(),
        std::env::var("RUST_LOG").ok(),
        target,
        debug_enabled(),
    );
    let filter = EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| EnvFilter::new(target.default_filter(false)));

    let file_appender = tracing_appender::rolling::never(log_dir, target.file_name());
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let format = LogFormat::parse(std::env::var("HOOKBRIDGE_LOG_FORMAT").ok().as_deref());

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer(writer, format, target))
        .try_init()?;

    tracing::debug!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = ?format,
        filter = %directive,
        pid = std::process::id(),
    );

    Ok(LoggingHandle { guard })
}
