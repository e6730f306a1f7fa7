use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::DiagnosticsConfig;

pub const DEFAULT_LOG_FILTER: &str = "info,splicer_core=trace";

/// Keeps the per-run JSON log alive. Buffered lines are flushed to the file when this is
/// dropped, so hold it until the process is about to exit.
pub struct TelemetryGuard {
    /// Identifies this process run; logged once at startup and embedded in the log file name.
    pub run_id: Uuid,
    /// The JSON log this run writes to.
    pub log_file: PathBuf,
    _file_guard: WorkerGuard,
}

/// Logging as configured in `[diagnostics]`.
pub fn init_tracing(diagnostics: &DiagnosticsConfig) -> anyhow::Result<TelemetryGuard> {
    init_tracing_with_options(
        &diagnostics.log_dir,
        &diagnostics.trace_file_prefix,
        &diagnostics.rust_log_filter,
    )
}

/// Compact human-readable lines on stderr, leaving stdout to command output, plus a JSON log
/// file per run under `log_dir`. `RUST_LOG` overrides `default_filter`.
///
/// Only the first call in a process installs the subscriber; later calls still create their
/// log file and guard but log through the existing one.
pub fn init_tracing_with_options(
    log_dir: impl AsRef<Path>,
    file_prefix: &str,
    default_filter: &str,
) -> anyhow::Result<TelemetryGuard> {
    let log_dir = log_dir.as_ref();
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let run_id = Uuid::new_v4();
    let file_name = log_file_name(file_prefix, Utc::now(), run_id);
    let log_file = log_dir.join(&file_name);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_thread_ids(true)
        .with_target(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(file_writer);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        Ok(()) => info!(%run_id, log_file = %log_file.display(), "tracing initialized"),
        Err(error) => warn!(?error, "global tracing subscriber already initialized"),
    }

    Ok(TelemetryGuard {
        run_id,
        log_file,
        _file_guard: file_guard,
    })
}

/// `<prefix>-<utc timestamp>-<first run id group>.log`; the id suffix keeps runs started in the
/// same second apart.
fn log_file_name(prefix: &str, started: DateTime<Utc>, run_id: Uuid) -> String {
    let simple = run_id.simple().to_string();
    let short = simple.get(..8).unwrap_or(&simple);
    format!("{prefix}-{}-{short}.log", started.format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn log_directory_is_created_on_init() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let log_dir = temp.path().join("nested").join("logs");
        let guard = init_tracing_with_options(&log_dir, "splicer-test", DEFAULT_LOG_FILTER)
            .expect("tracing should initialise");
        assert!(log_dir.is_dir());
        assert!(!guard.run_id.is_nil());
        assert_eq!(guard.log_file.parent(), Some(log_dir.as_path()));
    }

    #[test]
    fn log_file_names_carry_prefix_time_and_run() {
        let started = Utc
            .with_ymd_and_hms(2026, 3, 14, 9, 5, 7)
            .single()
            .expect("valid timestamp");
        let run_id = Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);
        assert_eq!(
            log_file_name("splicer", started, run_id),
            "splicer-20260314-090507-12345678.log"
        );
    }
}
