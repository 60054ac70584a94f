//! xharvest - parallel, deduplicating harvester for X search results
//!
//! The library drives headless browsers through WebDriver, scrolls search
//! result pages for chunked date ranges, and keeps only posts it has not
//! seen before.
//!
//! # Modules
//!
//! - [`dedup`] - `SQLite`-backed fingerprint store deciding what is new
//! - [`progress`] - throughput and ETA estimation
//! - [`collector`] - the per-session scroll-collect loop
//! - [`pool`] - parallel harvesting over several browsers
//! - [`harvest`] - sequential harvesting over one browser
//! - [`webdriver`] - W3C WebDriver backend and page reader
//! - [`export`] - CSV / JSON output
//! - [`cli`] - Command-line interface definitions

pub mod browser;
pub mod cli;
pub mod collector;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod export;
pub mod fingerprint;
pub mod harvest;
pub mod logging;
pub mod model;
pub mod pool;
pub mod progress;
pub mod query;
pub mod webdriver;

pub use browser::{Browser, BrowserFactory, CancelToken, Cookie, ElementHandle, PageReader};
pub use collector::{CollectorSettings, CollectorState, SessionCollector, SessionOutcome};
pub use config::Config;
pub use dedup::{
    Admission, DuplicateReason, FingerprintStore, NearDuplicateMode, StoreFaultPolicy, StoreOptions,
    StoreStats,
};
pub use error::{
    HarvestError, Result, ResultExt, VALID_EXPORT_FORMATS, VALID_SEARCH_MODES, find_closest_match,
    format_did_you_mean, format_error, format_unknown_value_error,
};
pub use events::{ChannelSink, EventSink, HarvestEvent, NullSink, TracingSink};
pub use harvest::{HarvestReport, Harvester};
pub use model::*;
pub use pool::{MAX_WORKERS, ParallelHarvester, PoolStats, SessionResult};
pub use progress::{ProgressEstimator, Statistics};

/// Default dedup database filename
pub const DEFAULT_DB_NAME: &str = "tweet_dedup.db";

/// Standard width for header dividers in CLI output
pub const HEADER_DIVIDER_WIDTH: usize = 40;

/// Get the default data directory for xharvest
#[must_use]
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("xharvest")
}

/// Get the default dedup database path
#[must_use]
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join(DEFAULT_DB_NAME)
}

/// Format a count with thousands separators.
#[must_use]
pub fn format_number(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);

    for (idx, ch) in digits.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }

    out.chars().rev().collect()
}

/// Escape text for a quoted CSV field by doubling quotes and flattening
/// newlines.
#[must_use]
pub fn csv_escape_text(text: &str) -> String {
    text.replace('"', "\"\"").replace(['\n', '\r'], " ")
}
