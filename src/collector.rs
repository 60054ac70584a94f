//! Scroll-collect-dedup loop for a single search session.
//!
//! ```text
//! Init -> AwaitingContent -> Collecting <-> Scrolling
//!                 |               |              |
//!              TimedOut        Stopped       Completed
//! ```
//!
//! A session loads the search page once, then alternates between reading
//! every rendered result and scrolling for more until the target is met, the
//! page stops growing, or the harvest is cancelled. Each of the three
//! terminal states returns the records gathered so far (never more than the
//! session target) and closes the session on the progress estimator.

use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use crate::browser::{Browser, CancelToken, PageReader};
use crate::config::HarvestConfig;
use crate::dedup::{Admission, FingerprintStore};
use crate::error::Result;
use crate::events::{EventSink, HarvestEvent, LogLevel};
use crate::model::{Record, Session};
use crate::progress::ProgressEstimator;
use crate::query;

/// Workers report progress every this many records.
const WORKER_LOG_EVERY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Init,
    AwaitingContent,
    Collecting,
    Scrolling,
    /// Target reached or the page stopped growing.
    Completed,
    /// Cancelled; partial results.
    Stopped,
    /// No result appeared within the content wait.
    TimedOut,
}

impl CollectorState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::TimedOut)
    }
}

impl std::fmt::Display for CollectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::AwaitingContent => "awaiting content",
            Self::Collecting => "collecting",
            Self::Scrolling => "scrolling",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// Timing and termination knobs.
#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    pub scroll_pause: Duration,
    pub content_wait: Duration,
    /// The session completes once the page height has stayed the same for
    /// more than this many consecutive scrolls.
    pub max_unchanged_scrolls: u32,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self::from(&HarvestConfig::default())
    }
}

impl From<&HarvestConfig> for CollectorSettings {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            scroll_pause: config.scroll_pause(),
            content_wait: config.content_wait(),
            max_unchanged_scrolls: config.max_unchanged_scrolls,
        }
    }
}

/// What a session produced.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Accepted records in discovery order, at most the session target.
    pub records: Vec<Record>,
    pub state: CollectorState,
    /// Candidates rejected as already seen.
    pub duplicates: usize,
    /// Rendered results the page reader could not turn into a record.
    pub parse_skips: usize,
}

/// Runs sessions against one browser.
pub struct SessionCollector<'a> {
    browser: &'a mut dyn Browser,
    reader: &'a dyn PageReader,
    store: &'a FingerprintStore,
    sink: &'a dyn EventSink,
    cancel: &'a CancelToken,
    settings: CollectorSettings,
    worker: Option<usize>,
    state: CollectorState,
}

/// Accepted records keyed by url, in insertion order.
#[derive(Default)]
struct Collected {
    records: Vec<Record>,
    urls: HashSet<String>,
    duplicates: usize,
    parse_skips: usize,
}

impl Collected {
    fn len(&self) -> usize {
        self.records.len()
    }
}

impl<'a> SessionCollector<'a> {
    pub fn new(
        browser: &'a mut dyn Browser,
        reader: &'a dyn PageReader,
        store: &'a FingerprintStore,
        sink: &'a dyn EventSink,
        cancel: &'a CancelToken,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            browser,
            reader,
            store,
            sink,
            cancel,
            settings,
            worker: None,
            state: CollectorState::Init,
        }
    }

    /// Tag log events with a pool worker id. Worker sessions report a
    /// progress line every few records instead of full statistics.
    #[must_use]
    pub const fn for_worker(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }

    #[must_use]
    pub const fn state(&self) -> CollectorState {
        self.state
    }

    fn log(&self, level: LogLevel, message: String) {
        self.sink.log(level, self.worker, message);
    }

    fn transition(&mut self, next: CollectorState) {
        debug!(worker = ?self.worker, from = %self.state, to = %next, "Collector state");
        self.state = next;
    }

    /// Run one session to a terminal state.
    ///
    /// The progress estimator gets a new session; the overall count
    /// continues from its current value. Timeouts, cancellation and
    /// unreadable results are not errors.
    ///
    /// # Errors
    ///
    /// Returns browser errors (navigation failure, lost driver). The
    /// progress session is closed in that case too.
    pub fn collect(&mut self, session: &Session, progress: &mut ProgressEstimator) -> Result<SessionOutcome> {
        self.state = CollectorState::Init;
        progress.start_session(session.target_count);
        let base = progress.current_count();

        let mut collected = Collected::default();
        let result = self.run(session, progress, base, &mut collected);

        progress.update_progress(collected.len(), base + collected.len());
        progress.finish_session();
        result?;

        collected.records.truncate(session.target_count);
        if self.worker.is_none() {
            self.sink.emit(HarvestEvent::Progress {
                count: collected.len(),
                target: session.target_count,
            });
        }
        self.log(
            LogLevel::Info,
            format!(
                "Session {} {}: {} records, {} duplicates, {} unreadable",
                session.id,
                self.state,
                collected.len(),
                collected.duplicates,
                collected.parse_skips
            ),
        );

        Ok(SessionOutcome {
            records: collected.records,
            state: self.state,
            duplicates: collected.duplicates,
            parse_skips: collected.parse_skips,
        })
    }

    fn run(
        &mut self,
        session: &Session,
        progress: &mut ProgressEstimator,
        base: usize,
        collected: &mut Collected,
    ) -> Result<()> {
        let target = session.target_count;
        let url = query::search_url(session);
        self.log(LogLevel::Info, format!("Opening search page: {url}"));
        self.browser.navigate(&url)?;

        self.transition(CollectorState::AwaitingContent);
        if !self.browser.wait_for_results(self.settings.content_wait)? {
            self.log(
                LogLevel::Warn,
                format!(
                    "No results within {}s, skipping session {}",
                    self.settings.content_wait.as_secs(),
                    session.id
                ),
            );
            self.transition(CollectorState::TimedOut);
            return Ok(());
        }

        let mut last_height = self.browser.page_height()?;
        let mut unchanged = 0u32;

        loop {
            self.transition(CollectorState::Collecting);
            if self.cancel.is_cancelled() {
                self.log(LogLevel::Warn, "Stopped by user".to_string());
                self.transition(CollectorState::Stopped);
                return Ok(());
            }
            if collected.len() >= target {
                self.transition(CollectorState::Completed);
                return Ok(());
            }
            self.report(progress, base, collected, target);

            let stopped = self.collect_visible(collected, target)?;
            if stopped {
                self.log(LogLevel::Warn, "Stopped by user".to_string());
                self.transition(CollectorState::Stopped);
                return Ok(());
            }
            if collected.len() >= target {
                self.transition(CollectorState::Completed);
                return Ok(());
            }

            self.transition(CollectorState::Scrolling);
            self.browser.scroll_to_bottom()?;
            if self.cancel.sleep(self.settings.scroll_pause) {
                self.log(LogLevel::Warn, "Stopped by user".to_string());
                self.transition(CollectorState::Stopped);
                return Ok(());
            }

            let height = self.browser.page_height()?;
            if height == last_height {
                unchanged += 1;
                if unchanged > self.settings.max_unchanged_scrolls {
                    self.log(
                        LogLevel::Info,
                        "Page height stopped changing, ending session".to_string(),
                    );
                    self.transition(CollectorState::Completed);
                    return Ok(());
                }
            } else {
                unchanged = 0;
            }
            last_height = height;
        }
    }

    /// Read every rendered result once. Returns true when cancelled midway.
    fn collect_visible(&mut self, collected: &mut Collected, target: usize) -> Result<bool> {
        let elements = self.browser.results()?;
        for element in &elements {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            if collected.len() >= target {
                break;
            }

            let Some(record) = self.reader.read(&mut *self.browser, element) else {
                collected.parse_skips += 1;
                debug!(worker = ?self.worker, element = %element.0, "Unreadable result skipped");
                continue;
            };

            if collected.urls.contains(&record.url) {
                collected.duplicates += 1;
                continue;
            }
            match self.store.admit(&record) {
                Admission::Accepted { persisted } => {
                    if !persisted {
                        self.log(
                            LogLevel::Warn,
                            format!("Fingerprint for {} kept in memory only", record.url),
                        );
                    }
                    collected.urls.insert(record.url.clone());
                    self.sink.emit(HarvestEvent::Record(record.clone()));
                    collected.records.push(record);
                }
                Admission::Rejected(reason) => {
                    collected.duplicates += 1;
                    debug!(worker = ?self.worker, url = %record.url, reason = %reason, "Duplicate");
                }
            }
        }
        Ok(false)
    }

    fn report(&self, progress: &mut ProgressEstimator, base: usize, collected: &Collected, target: usize) {
        let count = collected.len();
        progress.update_progress(count, base + count);

        match self.worker {
            None => {
                let stats = progress.statistics();
                self.log(
                    LogLevel::Info,
                    format!(
                        "Records: {count}/{target} | Speed: {:.1}/min | ETA: {} | Duplicates: {}",
                        stats.current_speed, stats.session_eta, collected.duplicates
                    ),
                );
                self.sink.emit(HarvestEvent::Progress { count, target });
                self.sink.emit(HarvestEvent::Statistics(stats));
            }
            Some(_) if count > 0 && count % WORKER_LOG_EVERY == 0 => {
                self.log(LogLevel::Info, format!("Collected: {count}/{target}"));
            }
            Some(_) => {}
        }
    }
}
