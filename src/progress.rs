//! Throughput and ETA estimation for long-running harvests.
//!
//! Two nested counters are tracked: the current session (one date chunk)
//! and the whole harvest. Speeds are records per minute; every division is
//! guarded so an estimator that has not started, or has seen no time pass,
//! reports zero instead of dividing by zero.
//!
//! An estimator has a single writer (the thread driving the session);
//! readers take a [`Statistics`] snapshot.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// ETA text while no speed is known yet.
pub const ETA_CALCULATING: &str = "calculating";
/// ETA text once the target has been reached.
pub const ETA_DONE: &str = "done";

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

/// Snapshot of an estimator, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub current_speed: f64,
    pub average_speed: f64,
    pub session_progress: f64,
    pub total_progress: f64,
    pub session_eta: String,
    pub total_eta: String,
    /// "3/10"
    pub session_number: String,
    /// "300/1000"
    pub records_collected: String,
    pub avg_session_time: Option<String>,
    pub best_speed: Option<f64>,
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "session {} | {} records | {:.1}/min (avg {:.1}/min) | session ETA {} | total ETA {}",
            self.session_number,
            self.records_collected,
            self.current_speed,
            self.average_speed,
            self.session_eta,
            self.total_eta
        )
    }
}

/// Throughput/ETA estimator.
pub struct ProgressEstimator {
    clock: Arc<dyn Clock>,
    start_time: Option<Duration>,
    session_start_time: Option<Duration>,
    total_target: usize,
    current_count: usize,
    session_target: usize,
    session_count: usize,
    session_index: usize,
    total_sessions: usize,
    speed_history: Vec<f64>,
    session_durations: Vec<Duration>,
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressEstimator {
    /// Estimator on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::default()))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            start_time: None,
            session_start_time: None,
            total_target: 0,
            current_count: 0,
            session_target: 0,
            session_count: 0,
            session_index: 0,
            total_sessions: 0,
            speed_history: Vec::new(),
            session_durations: Vec::new(),
        }
    }

    /// Reset overall counters and history for a new harvest.
    pub fn start_harvest(&mut self, total_target: usize, total_sessions: usize) {
        self.start_time = Some(self.clock.now());
        self.total_target = total_target;
        self.total_sessions = total_sessions;
        self.current_count = 0;
        self.session_index = 0;
        self.speed_history.clear();
        self.session_durations.clear();
    }

    /// Begin a session; the session index is incremented.
    pub fn start_session(&mut self, session_target: usize) {
        self.session_start_time = Some(self.clock.now());
        self.session_target = session_target;
        self.session_count = 0;
        self.session_index += 1;
    }

    /// Overwrite the counters with absolute values.
    pub fn update_progress(&mut self, session_count: usize, overall_count: usize) {
        self.session_count = session_count;
        self.current_count = overall_count;
    }

    fn elapsed_minutes(&self, since: Option<Duration>) -> Option<f64> {
        let since = since?;
        let elapsed = self.clock.now().saturating_sub(since).as_secs_f64() / 60.0;
        (elapsed > 0.0).then_some(elapsed)
    }

    /// Records per minute in the current session.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn current_speed(&self) -> f64 {
        self.elapsed_minutes(self.session_start_time)
            .map_or(0.0, |minutes| self.session_count as f64 / minutes)
    }

    /// Records per minute across the harvest.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_speed(&self) -> f64 {
        self.elapsed_minutes(self.start_time)
            .map_or(0.0, |minutes| self.current_count as f64 / minutes)
    }

    /// Remaining time in the current session.
    #[must_use]
    pub fn session_eta(&self) -> String {
        eta(self.session_target, self.session_count, self.current_speed())
    }

    /// Remaining time for the whole harvest.
    #[must_use]
    pub fn total_eta(&self) -> String {
        eta(self.total_target, self.current_count, self.average_speed())
    }

    /// Record the finished session's duration and throughput.
    /// Does nothing if no session was started.
    #[allow(clippy::cast_precision_loss)]
    pub fn finish_session(&mut self) {
        let Some(start) = self.session_start_time else {
            return;
        };
        let duration = self.clock.now().saturating_sub(start);
        self.session_durations.push(duration);
        if !duration.is_zero() {
            let minutes = duration.as_secs_f64() / 60.0;
            self.speed_history.push(self.session_count as f64 / minutes);
        }
    }

    /// Overall progress in percent.
    #[must_use]
    pub fn progress_percentage(&self) -> f64 {
        percentage(self.current_count, self.total_target)
    }

    /// Session progress in percent.
    #[must_use]
    pub fn session_percentage(&self) -> f64 {
        percentage(self.session_count, self.session_target)
    }

    /// Overwrite the session counter. Used by an observer that only sees
    /// sessions complete, e.g. the pool orchestrator.
    pub const fn set_session_index(&mut self, index: usize) {
        self.session_index = index;
    }

    #[must_use]
    pub const fn session_index(&self) -> usize {
        self.session_index
    }

    #[must_use]
    pub const fn current_count(&self) -> usize {
        self.current_count
    }

    /// Throughput samples of finished sessions.
    #[must_use]
    pub fn speed_history(&self) -> &[f64] {
        &self.speed_history
    }

    /// Snapshot of everything above.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn statistics(&self) -> Statistics {
        let avg_session_time = (!self.session_durations.is_empty()).then(|| {
            let total: f64 = self.session_durations.iter().map(Duration::as_secs_f64).sum();
            format_duration(total / self.session_durations.len() as f64)
        });
        let best_speed = self.speed_history.iter().copied().reduce(f64::max);

        Statistics {
            current_speed: self.current_speed(),
            average_speed: self.average_speed(),
            session_progress: self.session_percentage(),
            total_progress: self.progress_percentage(),
            session_eta: self.session_eta(),
            total_eta: self.total_eta(),
            session_number: format!("{}/{}", self.session_index, self.total_sessions),
            records_collected: format!("{}/{}", self.current_count, self.total_target),
            avg_session_time,
            best_speed,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percentage(count: usize, target: usize) -> f64 {
    if target == 0 {
        return 0.0;
    }
    count as f64 / target as f64 * 100.0
}

#[allow(clippy::cast_precision_loss)]
fn eta(target: usize, count: usize, speed: f64) -> String {
    if speed <= 0.0 {
        return ETA_CALCULATING.to_string();
    }
    if count >= target {
        return ETA_DONE.to_string();
    }
    let remaining = (target - count) as f64;
    format_duration(remaining / speed * 60.0)
}

/// Human duration: `"45s"`, `"2m 20s"`, `"3h 5m"`. Negative input is
/// treated as zero; fractions are truncated.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    if total < 60 {
        format!("{total}s")
    } else if total < 3600 {
        format!("{}m {}s", total / 60, total % 60)
    } else {
        format!("{}h {}m", total / 3600, (total % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> (Arc<ManualClock>, ProgressEstimator) {
        let clock = Arc::new(ManualClock::new());
        let estimator = ProgressEstimator::with_clock(clock.clone());
        (clock, estimator)
    }

    #[test]
    fn format_duration_tiers() {
        assert_eq!(format_duration(0.0), "0s");
        assert_eq!(format_duration(59.9), "59s");
        assert_eq!(format_duration(60.0), "1m 0s");
        assert_eq!(format_duration(140.0), "2m 20s");
        assert_eq!(format_duration(3599.0), "59m 59s");
        assert_eq!(format_duration(3600.0), "1h 0m");
        assert_eq!(format_duration(7500.0), "2h 5m");
        assert_eq!(format_duration(-5.0), "0s");
        assert_eq!(format_duration(f64::NAN), "0s");
    }

    #[test]
    fn speeds_are_zero_before_start_and_at_zero_elapsed() {
        let (_clock, mut est) = estimator();
        assert!(est.current_speed().abs() < f64::EPSILON);
        assert!(est.average_speed().abs() < f64::EPSILON);

        est.start_harvest(100, 1);
        est.start_session(100);
        est.update_progress(10, 10);
        assert!(est.current_speed().abs() < f64::EPSILON);
        assert!(est.average_speed().abs() < f64::EPSILON);
        assert_eq!(est.session_eta(), ETA_CALCULATING);
        assert_eq!(est.total_eta(), ETA_CALCULATING);
    }

    #[test]
    fn session_speed_and_eta_after_a_minute() {
        let (clock, mut est) = estimator();
        est.start_session(100);
        clock.advance(Duration::from_secs(60));
        est.update_progress(30, 30);

        assert!((est.current_speed() - 30.0).abs() < 1e-9);
        assert_eq!(est.session_eta(), "2m 20s");
    }

    #[test]
    fn eta_is_done_when_target_reached() {
        let (clock, mut est) = estimator();
        est.start_harvest(10, 1);
        est.start_session(10);
        clock.advance(Duration::from_secs(30));
        est.update_progress(12, 12);
        assert_eq!(est.session_eta(), ETA_DONE);
        assert_eq!(est.total_eta(), ETA_DONE);
    }

    #[test]
    fn eta_grows_with_remaining() {
        let speed = 30.0;
        let secs = |remaining: usize| remaining as f64 / speed * 60.0;
        let mut last = 0.0;
        for remaining in [1_usize, 5, 70, 200, 5_000] {
            let now = secs(remaining);
            assert!(now > last);
            last = now;
        }
        assert_eq!(eta(100, 30, speed), format_duration(secs(70)));
        assert_eq!(eta(100, 100, speed), ETA_DONE);
    }

    #[test]
    fn finish_session_without_start_is_noop() {
        let (_clock, mut est) = estimator();
        est.finish_session();
        let stats = est.statistics();
        assert!(stats.avg_session_time.is_none());
        assert!(stats.best_speed.is_none());
    }

    #[test]
    fn statistics_include_history() {
        let (clock, mut est) = estimator();
        est.start_harvest(200, 2);

        est.start_session(100);
        clock.advance(Duration::from_secs(60));
        est.update_progress(20, 20);
        est.finish_session();

        est.start_session(100);
        clock.advance(Duration::from_secs(120));
        est.update_progress(80, 100);
        est.finish_session();

        let stats = est.statistics();
        assert_eq!(stats.session_number, "2/2");
        assert_eq!(stats.records_collected, "100/200");
        assert_eq!(stats.avg_session_time.as_deref(), Some("1m 30s"));
        assert!((stats.best_speed.unwrap() - 40.0).abs() < 1e-9);
        assert!((stats.total_progress - 50.0).abs() < 1e-9);
        assert!((stats.session_progress - 80.0).abs() < 1e-9);
        assert_eq!(est.speed_history().len(), 2);
    }

    #[test]
    fn start_harvest_resets_history() {
        let (clock, mut est) = estimator();
        est.start_harvest(10, 1);
        est.start_session(10);
        clock.advance(Duration::from_secs(10));
        est.finish_session();
        assert_eq!(est.speed_history().len(), 1);

        est.start_harvest(10, 1);
        assert!(est.speed_history().is_empty());
        assert_eq!(est.session_index(), 0);
        assert_eq!(est.current_count(), 0);
    }

    #[test]
    fn percentages_guard_zero_target() {
        let (_clock, est) = estimator();
        assert!(est.progress_percentage().abs() < f64::EPSILON);
        assert!(est.session_percentage().abs() < f64::EPSILON);
    }
}
