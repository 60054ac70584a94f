//! Events emitted by a harvest for an external observer.
//!
//! The engine never renders anything itself. It emits [`HarvestEvent`]s into
//! an injected [`EventSink`]; the CLI turns them into a progress bar, tests
//! collect them through a channel.

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;

use crate::model::Record;
use crate::progress::Statistics;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Something an observer may want to show.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HarvestEvent {
    /// A human-readable diagnostic line. `worker` is set for lines emitted
    /// by a pool worker.
    Log {
        level: LogLevel,
        worker: Option<usize>,
        message: String,
    },
    /// Absolute progress towards a target.
    Progress { count: usize, target: usize },
    /// A newly accepted record.
    Record(Record),
    /// Throughput snapshot.
    Statistics(Statistics),
}

/// Receiver of harvest events. Must tolerate calls from several worker
/// threads at once.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: HarvestEvent);

    fn log(&self, level: LogLevel, worker: Option<usize>, message: String) {
        self.emit(HarvestEvent::Log {
            level,
            worker,
            message,
        });
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, None, message.to_string());
    }
}

/// Forwards log events to `tracing` and drops everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: HarvestEvent) {
        if let HarvestEvent::Log {
            level,
            worker,
            message,
        } = event
        {
            match (level, worker) {
                (LogLevel::Debug, Some(w)) => tracing::debug!(worker = w, "{message}"),
                (LogLevel::Debug, None) => tracing::debug!("{message}"),
                (LogLevel::Info, Some(w)) => tracing::info!(worker = w, "{message}"),
                (LogLevel::Info, None) => tracing::info!("{message}"),
                (LogLevel::Warn, Some(w)) => tracing::warn!(worker = w, "{message}"),
                (LogLevel::Warn, None) => tracing::warn!("{message}"),
                (LogLevel::Error, Some(w)) => tracing::error!(worker = w, "{message}"),
                (LogLevel::Error, None) => tracing::error!("{message}"),
            }
        }
    }
}

/// Pushes every event into a crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<HarvestEvent>,
}

impl ChannelSink {
    /// A sink and the receiving end of its channel.
    #[must_use]
    pub fn channel() -> (Self, Receiver<HarvestEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: HarvestEvent) {
        // The observer going away must not stop the harvest.
        let _ = self.tx.send(event);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: HarvestEvent) {}
}
