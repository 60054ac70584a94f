//! Logging setup for xharvest.
//!
//! Everything in the crate logs through `tracing`. The binary installs a
//! `tracing-subscriber` registry here; library users can install their own.
//! Pool workers run inside a `worker` span, so with [`LogFormat::Threads`]
//! every line carries the worker id and thread name.
//!
//! ```rust
//! use xharvest::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::default());
//! tracing::info!("harvest starting");
//! ```

use std::time::Instant;
use tracing::Span;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::LevelFilter, fmt, layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// How log lines are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One line per event.
    Compact,
    /// Multi-line, human-readable.
    Pretty,
    /// One line per event with thread names and source locations.
    Threads,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for `xharvest` targets. Ignored when `RUST_LOG` is set.
    pub level: LevelFilter,
    pub format: LogFormat,
    pub timestamps: bool,
    pub colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
            format: LogFormat::Compact,
            timestamps: true,
            colors: true,
        }
    }
}

impl LogConfig {
    /// Presets for the command-line tool. Harvest progress is rendered by the
    /// terminal sink, so tracing stays at warnings unless asked for more.
    #[must_use]
    pub fn for_cli(quiet: bool, verbose: bool, colors: bool) -> Self {
        let (level, format, timestamps) = match (quiet, verbose) {
            (true, _) => (LevelFilter::ERROR, LogFormat::Compact, false),
            (false, true) => (LevelFilter::DEBUG, LogFormat::Threads, true),
            (false, false) => (LevelFilter::WARN, LogFormat::Compact, true),
        };
        Self {
            level,
            format,
            timestamps,
            colors,
        }
    }

    fn filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(format!("xharvest={}", self.level))
        }
    }
}

fn fmt_layer(config: &LogConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.colors)
        .with_target(false);

    match (config.format, config.timestamps) {
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        (LogFormat::Pretty, true) => base.pretty().boxed(),
        (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (LogFormat::Threads, _) => base
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(config: &LogConfig) {
    tracing_subscriber::registry()
        .with(fmt_layer(config))
        .with(config.filter())
        .try_init()
        .ok();
}

/// Silent unless `RUST_LOG` is set.
pub fn init_test_logging() {
    init_logging(&LogConfig {
        level: LevelFilter::OFF,
        ..LogConfig::default()
    });
}

pub fn init_cli_logging(quiet: bool, verbose: bool, colors: bool) {
    init_logging(&LogConfig::for_cli(quiet, verbose, colors));
}

/// Span covering everything a pool worker logs.
#[must_use]
pub fn worker_span(worker: usize) -> Span {
    tracing::info_span!("worker", id = worker)
}

/// Percentage of `target` reached, 0 for an empty target.
#[must_use]
pub fn percent(done: usize, target: usize) -> u32 {
    if target == 0 {
        return 0;
    }
    let pct = (done.min(target) * 100) / target;
    u32::try_from(pct).unwrap_or(100)
}

/// Log how far a harvest has come towards its record target.
pub fn log_progress(done: usize, target: usize, phase: &str) {
    tracing::info!(
        phase,
        done,
        target,
        percent = percent(done, target),
        "Harvest progress"
    );
}

/// Logs the start and outcome of a long-running phase with its duration.
pub struct OperationGuard {
    name: &'static str,
    start: Instant,
}

impl OperationGuard {
    pub fn new(name: &'static str) -> Self {
        tracing::info!(operation = name, "Started");
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Finish successfully after producing `records`.
    pub fn complete(self, records: usize) {
        tracing::info!(
            operation = self.name,
            records,
            elapsed_ms = self.start.elapsed().as_millis(),
            "Finished"
        );
    }

    pub fn fail(self, error: &dyn std::error::Error) {
        tracing::error!(
            operation = self.name,
            elapsed_ms = self.start.elapsed().as_millis(),
            %error,
            "Failed"
        );
    }
}
