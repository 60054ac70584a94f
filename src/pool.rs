//! Parallel harvesting across a fixed pool of browser workers.
//!
//! The orchestrator turns a [`HarvestRequest`] into one task per date range
//! and pushes them onto a shared queue. Each worker thread owns one browser
//! for its whole life, takes tasks until it sees a shutdown marker, and runs
//! a [`SessionCollector`] against the shared [`FingerprintStore`]. Every
//! task produces exactly one [`SessionResult`], failed ones included, so a
//! harvest of K sessions always drains K results.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::browser::{Browser, BrowserFactory, CancelToken, Cookie, PageReader};
use crate::collector::{CollectorSettings, SessionCollector};
use crate::dedup::{FingerprintStore, StoreStats};
use crate::error::{HarvestError, Result};
use crate::events::{EventSink, HarvestEvent, LogLevel};
use crate::harvest::dedup_by_url;
use crate::logging;
use crate::model::{HarvestRequest, Record, Session};
use crate::progress::ProgressEstimator;
use crate::query;

/// Upper bound on concurrent browsers.
pub const MAX_WORKERS: usize = 5;

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// Unit of work on the task queue.
#[derive(Debug, Clone)]
enum Task {
    Session(Session),
    Shutdown,
}

/// Outcome of one session task.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub session_id: usize,
    pub worker: usize,
    pub records: Vec<Record>,
    /// Set when the task failed; `records` is then empty.
    pub error: Option<String>,
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_scraped: usize,
    pub active_workers: usize,
    pub errors_count: usize,
    pub errors: Vec<String>,
    pub dedup: StoreStats,
}

#[derive(Default)]
struct Counters {
    total_scraped: usize,
    active_workers: usize,
    errors: Vec<String>,
}

/// Count of queued-but-unfinished tasks.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    done: Condvar,
}

impl Pending {
    fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    fn task_done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.done.notify_all();
        }
    }

    /// Wait up to `timeout` for the queue to drain. Returns the remaining
    /// count.
    fn wait_for(&self, timeout: Duration) -> usize {
        let mut count = self.count.lock();
        if *count > 0 {
            let _ = self.done.wait_while_for(&mut count, |c| *c > 0, timeout);
        }
        *count
    }
}

/// Everything a worker thread needs, shared by reference count.
struct WorkerContext {
    factory: Arc<dyn BrowserFactory>,
    reader: Arc<dyn PageReader>,
    store: Arc<FingerprintStore>,
    sink: Arc<dyn EventSink>,
    cancel: CancelToken,
    settings: CollectorSettings,
    counters: Arc<Mutex<Counters>>,
    pending: Arc<Pending>,
    tasks: Receiver<Task>,
    results: Sender<SessionResult>,
    auth_token: String,
}

/// Keeps the pool accounting straight when a worker thread unwinds: the
/// task in hand still yields a result and is marked done, and the worker is
/// no longer counted as active.
struct WorkerGuard<'a> {
    worker_id: usize,
    ctx: &'a WorkerContext,
    current: Option<usize>,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if let Some(session_id) = self.current.take() {
            let message = format!("Worker #{} stopped during session {session_id}", self.worker_id);
            error!(worker = self.worker_id, session = session_id, "Worker stopped mid-task");
            self.ctx.counters.lock().errors.push(message.clone());
            let _ = self.ctx.results.send(SessionResult {
                session_id,
                worker: self.worker_id,
                records: Vec::new(),
                error: Some(message),
            });
            self.ctx.pending.task_done();
        }
        let mut counters = self.ctx.counters.lock();
        counters.active_workers = counters.active_workers.saturating_sub(1);
    }
}

/// Fans a harvest out over several browsers.
pub struct ParallelHarvester {
    factory: Arc<dyn BrowserFactory>,
    reader: Arc<dyn PageReader>,
    store: Arc<FingerprintStore>,
    sink: Arc<dyn EventSink>,
    cancel: CancelToken,
    settings: CollectorSettings,
    workers: usize,
    report_interval: Duration,
    counters: Arc<Mutex<Counters>>,
}

impl ParallelHarvester {
    /// A pool of `workers` browsers, clamped to `1..=MAX_WORKERS`.
    pub fn new(
        workers: usize,
        factory: Arc<dyn BrowserFactory>,
        reader: Arc<dyn PageReader>,
        store: Arc<FingerprintStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            factory,
            reader,
            store,
            sink,
            cancel: CancelToken::new(),
            settings: CollectorSettings::default(),
            workers: workers.clamp(1, MAX_WORKERS),
            report_interval: DEFAULT_REPORT_INTERVAL,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
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

    /// How often the orchestrator emits aggregate statistics while waiting.
    #[must_use]
    pub const fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let counters = self.counters.lock();
        PoolStats {
            total_scraped: counters.total_scraped,
            active_workers: counters.active_workers,
            errors_count: counters.errors.len(),
            errors: counters.errors.clone(),
            dedup: self.store.stats(),
        }
    }

    /// Run every session of `request` and return all records, deduplicated
    /// by url.
    ///
    /// # Errors
    ///
    /// See [`ParallelHarvester::scrape_parallel_sessions`].
    pub fn scrape_parallel(&self, request: &HarvestRequest) -> Result<Vec<Record>> {
        let results = self.scrape_parallel_sessions(request)?;
        let records: Vec<Record> = results.into_iter().flat_map(|r| r.records).collect();
        let (records, removed) = dedup_by_url(records);
        if removed > 0 {
            self.sink
                .info(&format!("Removed {removed} duplicate records in final cleanup"));
        }
        Ok(records)
    }

    /// Run every session of `request` and return one result per session,
    /// ordered by session id.
    ///
    /// # Errors
    ///
    /// Fails before any worker starts when the request is invalid (a blank
    /// credential included) or the browser backend cannot be prepared.
    /// Failures inside a session never fail the harvest.
    pub fn scrape_parallel_sessions(&self, request: &HarvestRequest) -> Result<Vec<SessionResult>> {
        request.validate()?;
        *self.counters.lock() = Counters::default();

        self.sink.info(&format!(
            "Starting parallel harvest with {} workers",
            self.workers
        ));
        self.sink.info("Preparing browser driver...");
        self.factory.prepare()?;
        self.sink.info("Browser driver ready");

        let sessions = request.sessions();
        let session_count = sessions.len();
        let (task_tx, task_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let pending = Arc::new(Pending::default());

        pending.add(session_count);
        for session in sessions {
            // Receiver is alive until the workers are joined.
            let _ = task_tx.send(Task::Session(session));
        }
        self.sink
            .info(&format!("{session_count} sessions queued for parallel harvest"));

        let handles: Vec<JoinHandle<()>> = (1..=self.workers)
            .filter_map(|worker_id| {
                let ctx = WorkerContext {
                    factory: Arc::clone(&self.factory),
                    reader: Arc::clone(&self.reader),
                    store: Arc::clone(&self.store),
                    sink: Arc::clone(&self.sink),
                    cancel: self.cancel.clone(),
                    settings: self.settings,
                    counters: Arc::clone(&self.counters),
                    pending: Arc::clone(&pending),
                    tasks: task_rx.clone(),
                    results: result_tx.clone(),
                    auth_token: request.auth_token.clone(),
                };
                self.counters.lock().active_workers += 1;
                thread::Builder::new()
                    .name(format!("xh-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, &ctx))
                    .map_err(|e| {
                        self.counters.lock().active_workers -= 1;
                        error!(worker = worker_id, error = %e, "Failed to spawn worker");
                    })
                    .ok()
            })
            .collect();
        drop(result_tx);

        if handles.is_empty() {
            return Err(HarvestError::WorkerFault {
                worker: 0,
                session: 0,
                reason: "no worker thread could be started".to_string(),
            });
        }

        self.wait_for_tasks(&pending, request, session_count);

        for _ in 0..handles.len() {
            let _ = task_tx.send(Task::Shutdown);
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked outside a task");
            }
        }

        let mut results: Vec<SessionResult> = result_rx.try_iter().collect();
        results.extend(self.fail_unclaimed(&task_rx));
        results.sort_by_key(|r| r.session_id);

        let stats = self.stats();
        self.sink.info(&format!(
            "Parallel harvest finished: {} records from {} sessions",
            stats.total_scraped,
            results.len()
        ));
        if stats.errors_count > 0 {
            self.sink.log(
                LogLevel::Warn,
                None,
                format!("{} sessions failed during the harvest", stats.errors_count),
            );
        }
        Ok(results)
    }

    /// Sessions still queued after every worker is gone.
    fn fail_unclaimed(&self, tasks: &Receiver<Task>) -> Vec<SessionResult> {
        tasks
            .try_iter()
            .filter_map(|task| match task {
                Task::Session(session) => Some(session),
                Task::Shutdown => None,
            })
            .map(|session| {
                let error = HarvestError::WorkerFault {
                    worker: 0,
                    session: session.id,
                    reason: "no worker left to run the session".to_string(),
                };
                self.counters.lock().errors.push(error.to_string());
                SessionResult {
                    session_id: session.id,
                    worker: 0,
                    records: Vec::new(),
                    error: Some(error.to_string()),
                }
            })
            .collect()
    }

    /// Block until every queued task is done, emitting aggregate progress
    /// every report interval. The orchestrator is the only writer of the
    /// overall estimator.
    fn wait_for_tasks(&self, pending: &Pending, request: &HarvestRequest, session_count: usize) {
        let mut progress = ProgressEstimator::new();
        progress.start_harvest(request.total_target(), session_count);
        let interval = self.report_interval.max(Duration::from_millis(1));
        let target = request.total_target();
        let mut last_total = 0;

        loop {
            let remaining = pending.wait_for(interval);
            let total = self.counters.lock().total_scraped;
            if total != last_total {
                logging::log_progress(total, target, "parallel");
                last_total = total;
            }
            progress.set_session_index(session_count - remaining.min(session_count));
            progress.update_progress(0, total);

            self.sink.emit(HarvestEvent::Progress {
                count: total,
                target,
            });
            self.sink.emit(HarvestEvent::Statistics(progress.statistics()));
            if remaining == 0 {
                break;
            }
            if self.counters.lock().active_workers == 0 {
                warn!(remaining, "No worker left to take the remaining sessions");
                break;
            }
        }
    }
}

fn worker_loop(worker_id: usize, ctx: &WorkerContext) {
    let _span = logging::worker_span(worker_id).entered();
    ctx.sink
        .log(LogLevel::Info, Some(worker_id), format!("Worker #{worker_id} started"));

    let mut guard = WorkerGuard {
        worker_id,
        ctx,
        current: None,
    };

    let created = catch_unwind(AssertUnwindSafe(|| ctx.factory.create(worker_id)))
        .unwrap_or_else(|payload| {
            Err(HarvestError::WorkerFault {
                worker: worker_id,
                session: 0,
                reason: panic_message(payload.as_ref()),
            })
        });
    let mut browser = match created {
        Ok(browser) => {
            ctx.sink
                .log(LogLevel::Info, Some(worker_id), "Browser ready".to_string());
            Ok(browser)
        }
        Err(e) => {
            ctx.sink.log(
                LogLevel::Error,
                Some(worker_id),
                format!("Browser failed to start: {e}"),
            );
            Err(e.to_string())
        }
    };

    while let Ok(Task::Session(session)) = ctx.tasks.recv() {
        guard.current = Some(session.id);
        let result = match browser.as_mut() {
            _ if ctx.cancel.is_cancelled() => {
                debug!(worker = worker_id, session = session.id, "Skipping session after cancel");
                Ok(Vec::new())
            }
            Ok(browser) => run_task(worker_id, ctx, browser.as_mut(), &session),
            Err(reason) => Err(HarvestError::WorkerFault {
                worker: worker_id,
                session: session.id,
                reason: format!("browser unavailable: {reason}"),
            }),
        };

        let result = match result {
            Ok(records) => {
                ctx.counters.lock().total_scraped += records.len();
                ctx.sink.log(
                    LogLevel::Info,
                    Some(worker_id),
                    format!("Finished session {}: {} records", session.id, records.len()),
                );
                SessionResult {
                    session_id: session.id,
                    worker: worker_id,
                    records,
                    error: None,
                }
            }
            Err(e) => {
                let message = format!("Worker #{worker_id} failed on session {}: {e}", session.id);
                let level = if e.is_element_error() {
                    LogLevel::Warn
                } else {
                    LogLevel::Error
                };
                ctx.sink.log(level, Some(worker_id), message.clone());
                ctx.counters.lock().errors.push(message);
                SessionResult {
                    session_id: session.id,
                    worker: worker_id,
                    records: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        guard.current = None;
        let _ = ctx.results.send(result);
        ctx.pending.task_done();
    }

    if let Ok(browser) = browser.as_mut() {
        match browser.quit() {
            Ok(()) => ctx
                .sink
                .log(LogLevel::Debug, Some(worker_id), "Browser closed".to_string()),
            Err(e) => warn!(worker = worker_id, error = %e, "Failed to close browser"),
        }
    }
    drop(guard);
    debug!(worker = worker_id, "Worker stopped");
}

/// One session inside the task boundary: a panic is turned into a worker
/// fault like any other error.
fn run_task(worker_id: usize, ctx: &WorkerContext, browser: &mut dyn Browser, session: &Session) -> Result<Vec<Record>> {
    ctx.sink.log(
        LogLevel::Info,
        Some(worker_id),
        format!("Processing session {} ({})", session.id, session.range()),
    );

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        browser.navigate(query::HOME_URL)?;
        browser.add_cookie(&Cookie::auth_token(&ctx.auth_token))?;

        let mut progress = ProgressEstimator::new();
        SessionCollector::new(
            browser,
            ctx.reader.as_ref(),
            ctx.store.as_ref(),
            ctx.sink.as_ref(),
            &ctx.cancel,
            ctx.settings,
        )
        .for_worker(worker_id)
        .collect(session, &mut progress)
    }));

    match outcome {
        Ok(result) => result.map(|outcome| outcome.records),
        Err(payload) => Err(HarvestError::WorkerFault {
            worker: worker_id,
            session: session.id,
            reason: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ElementHandle;
    use crate::dedup::StoreOptions;
    use crate::events::NullSink;
    use crate::model::{DateRange, SearchMode};
    use chrono::NaiveDate;

    struct EmptyPage;

    impl Browser for EmptyPage {
        fn navigate(&mut self, _url: &str) -> Result<()> {
            Ok(())
        }
        fn add_cookie(&mut self, _cookie: &Cookie) -> Result<()> {
            Ok(())
        }
        fn wait_for_results(&mut self, _timeout: Duration) -> Result<bool> {
            Ok(false)
        }
        fn results(&mut self) -> Result<Vec<ElementHandle>> {
            Ok(Vec::new())
        }
        fn scroll_to_bottom(&mut self) -> Result<()> {
            Ok(())
        }
        fn page_height(&mut self) -> Result<u64> {
            Ok(0)
        }
        fn quit(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct EmptyFactory;

    impl BrowserFactory for EmptyFactory {
        fn create(&self, _worker_id: usize) -> Result<Box<dyn Browser>> {
            Ok(Box::new(EmptyPage))
        }
    }

    struct NoReader;

    impl PageReader for NoReader {
        fn read(&self, _browser: &mut dyn Browser, _element: &ElementHandle) -> Option<Record> {
            None
        }
    }

    fn harvester(workers: usize) -> ParallelHarvester {
        ParallelHarvester::new(
            workers,
            Arc::new(EmptyFactory),
            Arc::new(NoReader),
            Arc::new(FingerprintStore::open_memory(StoreOptions::default()).unwrap()),
            Arc::new(NullSink),
        )
        .with_report_interval(Duration::from_millis(10))
    }

    fn request(sessions: u32, token: &str) -> HarvestRequest {
        let start = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        HarvestRequest {
            keyword: "hujan".into(),
            date_ranges: (0..sessions)
                .map(|i| {
                    let s = start + chrono::Duration::days(i64::from(i));
                    DateRange::new(s, s + chrono::Duration::days(1))
                })
                .collect(),
            target_per_session: 5,
            language: "id".into(),
            search_mode: SearchMode::Top,
            auth_token: token.into(),
        }
    }

    #[test]
    fn worker_count_is_clamped() {
        assert_eq!(harvester(0).workers(), 1);
        assert_eq!(harvester(3).workers(), 3);
        assert_eq!(harvester(12).workers(), MAX_WORKERS);
    }

    #[test]
    fn every_session_yields_a_result() {
        let pool = harvester(2);
        let results = pool.scrape_parallel_sessions(&request(4, "tok")).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.session_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(results.iter().all(|r| r.records.is_empty() && r.error.is_none()));

        let stats = pool.stats();
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.errors_count, 0);
    }

    #[test]
    fn blank_credential_fails_before_workers_start() {
        struct CountingFactory(Mutex<usize>);
        impl BrowserFactory for CountingFactory {
            fn create(&self, _worker_id: usize) -> Result<Box<dyn Browser>> {
                *self.0.lock() += 1;
                Ok(Box::new(EmptyPage))
            }
        }

        let factory = Arc::new(CountingFactory(Mutex::new(0)));
        let pool = ParallelHarvester::new(
            2,
            Arc::clone(&factory) as Arc<dyn BrowserFactory>,
            Arc::new(NoReader),
            Arc::new(FingerprintStore::open_memory(StoreOptions::default()).unwrap()),
            Arc::new(NullSink),
        );
        let err = pool.scrape_parallel(&request(2, " ")).unwrap_err();
        assert!(matches!(err, HarvestError::MissingCredential));
        assert_eq!(*factory.0.lock(), 0);
    }

    #[test]
    fn pending_counter_wakes_waiter() {
        let pending = Arc::new(Pending::default());
        pending.add(2);
        assert_eq!(pending.wait_for(Duration::from_millis(1)), 2);

        let worker = Arc::clone(&pending);
        let handle = thread::spawn(move || {
            worker.task_done();
            worker.task_done();
        });
        handle.join().unwrap();
        assert_eq!(pending.wait_for(Duration::from_secs(5)), 0);
    }

    /// Run a harvest on a side thread so a stuck pool fails the test
    /// instead of hanging it.
    fn run_bounded(pool: ParallelHarvester, req: HarvestRequest) -> Vec<SessionResult> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = tx.send(pool.scrape_parallel_sessions(&req));
        });
        rx.recv_timeout(Duration::from_secs(10))
            .expect("pool did not finish")
            .unwrap()
    }

    #[test]
    fn panicking_browser_launch_fails_every_session() {
        struct CrashingFactory;
        impl BrowserFactory for CrashingFactory {
            fn create(&self, _worker_id: usize) -> Result<Box<dyn Browser>> {
                panic!("chrome binary crashed during launch");
            }
        }

        let pool = ParallelHarvester::new(
            2,
            Arc::new(CrashingFactory),
            Arc::new(NoReader),
            Arc::new(FingerprintStore::open_memory(StoreOptions::default()).unwrap()),
            Arc::new(NullSink),
        )
        .with_report_interval(Duration::from_millis(5));

        let results = run_bounded(pool, request(3, "tok"));

        assert_eq!(results.len(), 3);
        for result in &results {
            assert!(result.records.is_empty());
            assert!(result.error.as_deref().unwrap().contains("crashed during launch"));
        }
    }

    #[test]
    fn worker_dying_outside_a_task_still_accounts_for_it() {
        /// Panics whenever a worker reports a finished session.
        struct FragileSink;
        impl EventSink for FragileSink {
            fn emit(&self, event: HarvestEvent) {
                if let HarvestEvent::Log { message, .. } = &event {
                    if message.starts_with("Finished session") {
                        panic!("sink closed");
                    }
                }
            }
        }

        let store = Arc::new(FingerprintStore::open_memory(StoreOptions::default()).unwrap());
        let pool = ParallelHarvester::new(
            2,
            Arc::new(EmptyFactory),
            Arc::new(NoReader),
            store,
            Arc::new(FragileSink),
        )
        .with_report_interval(Duration::from_millis(5));
        let counters = Arc::clone(&pool.counters);

        let results = run_bounded(pool, request(3, "tok"));

        let ids: Vec<_> = results.iter().map(|r| r.session_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(results.iter().all(|r| r.error.is_some()));
        let counters = counters.lock();
        assert_eq!(counters.active_workers, 0);
        assert_eq!(counters.errors.len(), 3);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "worker panicked");
    }
}
