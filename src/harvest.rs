//! Sequential harvest: one browser, one session after another.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::browser::{Browser, BrowserFactory, CancelToken, Cookie, PageReader};
use crate::collector::{CollectorSettings, CollectorState, SessionCollector};
use crate::config::Config;
use crate::dedup::FingerprintStore;
use crate::error::Result;
use crate::events::{EventSink, HarvestEvent, LogLevel};
use crate::model::{DateRange, HarvestRequest, Record, Session};
use crate::progress::{Clock, ProgressEstimator, SystemClock};
use crate::query;

/// Drop records whose url was already seen, keeping the first occurrence.
/// Returns the kept records and how many were removed.
#[must_use]
pub fn dedup_by_url(records: Vec<Record>) -> (Vec<Record>, usize) {
    let before = records.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<Record> = records
        .into_iter()
        .filter(|r| seen.insert(r.url.clone()))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Per-session line of a [`HarvestReport`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: usize,
    pub range: DateRange,
    pub records: usize,
    pub duplicates: usize,
    /// `None` when the session failed.
    #[serde(skip)]
    pub state: Option<CollectorState>,
    pub error: Option<String>,
}

/// Result of [`Harvester::run`].
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub records: Vec<Record>,
    pub sessions: Vec<SessionSummary>,
    /// Fingerprints purged at start.
    pub purged: usize,
    /// Records dropped by the final url cleanup.
    pub removed_in_cleanup: usize,
    pub cancelled: bool,
}

/// Runs a harvest with a single browser.
pub struct Harvester {
    factory: Arc<dyn BrowserFactory>,
    reader: Arc<dyn PageReader>,
    store: Arc<FingerprintStore>,
    sink: Arc<dyn EventSink>,
    cancel: CancelToken,
    settings: CollectorSettings,
    session_interval: Duration,
    retention_days: u32,
    clock: Arc<dyn Clock>,
}

impl Harvester {
    pub fn new(
        factory: Arc<dyn BrowserFactory>,
        reader: Arc<dyn PageReader>,
        store: Arc<FingerprintStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let defaults = Config::default();
        Self {
            factory,
            reader,
            store,
            sink,
            cancel: CancelToken::new(),
            settings: CollectorSettings::from(&defaults.harvest),
            session_interval: defaults.harvest.session_interval(),
            retention_days: defaults.dedup.retention_days,
            clock: Arc::new(SystemClock::default()),
        }
    }

    /// Timing, interval and retention from a loaded configuration.
    #[must_use]
    pub fn configured(mut self, config: &Config) -> Self {
        self.settings = CollectorSettings::from(&config.harvest);
        self.session_interval = config.harvest.session_interval();
        self.retention_days = config.dedup.retention_days;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn with_settings(mut self, settings: CollectorSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub const fn with_session_interval(mut self, interval: Duration) -> Self {
        self.session_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn log(&self, level: LogLevel, message: String) {
        self.sink.log(level, None, message);
    }

    /// Run every session of `request` in order.
    ///
    /// Old fingerprints are purged first, then the credential cookie is
    /// set once and each date range is searched, pausing between sessions.
    /// A failing session is logged and the harvest moves on.
    ///
    /// # Errors
    ///
    /// Fails without touching the browser when the request is invalid (a
    /// blank credential included), and when the browser cannot be started
    /// or authenticated.
    pub fn run(&self, request: &HarvestRequest) -> Result<HarvestReport> {
        request.validate()?;

        let sessions = request.sessions();
        let mut progress = ProgressEstimator::with_clock(Arc::clone(&self.clock));
        progress.start_harvest(request.total_target(), sessions.len());
        self.log(
            LogLevel::Info,
            format!(
                "Target: {} records in {} sessions",
                request.total_target(),
                sessions.len()
            ),
        );

        let purged = match self.store.purge_older_than(self.retention_days) {
            Ok(n) => {
                if n > 0 {
                    self.log(LogLevel::Info, format!("Purged {n} old fingerprints"));
                }
                n
            }
            Err(e) => {
                self.log(LogLevel::Warn, format!("Fingerprint purge failed: {e}"));
                0
            }
        };

        self.factory.prepare()?;
        let mut browser = self.factory.create(0)?;
        let outcome = self.run_sessions(browser.as_mut(), request, &sessions, &mut progress);
        if let Err(e) = browser.quit() {
            warn!(error = %e, "Failed to close browser");
        }
        let (records, summaries, cancelled) = outcome?;

        let (records, removed_in_cleanup) = dedup_by_url(records);
        if removed_in_cleanup > 0 {
            self.log(
                LogLevel::Info,
                format!("Final cleanup removed {removed_in_cleanup} duplicate records"),
            );
        }
        let stats = self.store.stats();
        self.log(
            LogLevel::Info,
            format!("{} unique records stored in the fingerprint database", stats.total_persisted),
        );
        if records.is_empty() {
            self.log(LogLevel::Warn, "No records were collected".to_string());
        }

        Ok(HarvestReport {
            records,
            sessions: summaries,
            purged,
            removed_in_cleanup,
            cancelled,
        })
    }

    fn run_sessions(
        &self,
        browser: &mut dyn Browser,
        request: &HarvestRequest,
        sessions: &[Session],
        progress: &mut ProgressEstimator,
    ) -> Result<(Vec<Record>, Vec<SessionSummary>, bool)> {
        self.log(LogLevel::Info, "Opening x.com and setting auth cookie".to_string());
        browser.navigate(query::HOME_URL)?;
        browser.add_cookie(&Cookie::auth_token(&request.auth_token))?;

        let total = sessions.len();
        let mut records: Vec<Record> = Vec::new();
        let mut summaries = Vec::with_capacity(total);
        let mut cancelled = false;

        for (idx, session) in sessions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.log(LogLevel::Warn, "Stopped before the next session".to_string());
                cancelled = true;
                break;
            }

            progress.update_progress(0, records.len());
            let overall = progress.statistics();
            self.log(
                LogLevel::Info,
                format!("--- Session {}/{total}: {} ---", session.id, session.range()),
            );
            self.log(
                LogLevel::Info,
                format!(
                    "Overall progress: {:.1}% | Total ETA: {}",
                    overall.total_progress, overall.total_eta
                ),
            );
            self.sink.emit(HarvestEvent::Statistics(overall));

            let mut collector = SessionCollector::new(
                &mut *browser,
                self.reader.as_ref(),
                self.store.as_ref(),
                self.sink.as_ref(),
                &self.cancel,
                self.settings,
            );
            let summary = match collector.collect(session, progress) {
                Ok(outcome) => {
                    let summary = SessionSummary {
                        session_id: session.id,
                        range: session.range(),
                        records: outcome.records.len(),
                        duplicates: outcome.duplicates,
                        state: Some(outcome.state),
                        error: None,
                    };
                    records.extend(outcome.records);
                    summary
                }
                Err(e) => {
                    self.log(LogLevel::Error, format!("Session {} failed: {e}", session.id));
                    SessionSummary {
                        session_id: session.id,
                        range: session.range(),
                        records: 0,
                        duplicates: 0,
                        state: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            summaries.push(summary);
            self.log(
                LogLevel::Info,
                format!("Session done. Total records: {}", records.len()),
            );

            if idx + 1 < total && !self.cancel.is_cancelled() && !self.session_interval.is_zero() {
                self.log(
                    LogLevel::Info,
                    format!(
                        "Waiting {}s before the next session...",
                        self.session_interval.as_secs()
                    ),
                );
                self.cancel.sleep(self.session_interval);
            }
        }

        if self.cancel.is_cancelled() {
            cancelled = true;
        }
        Ok((records, summaries, cancelled))
    }
}
