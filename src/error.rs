//! Custom error types for xharvest.
//!
//! Errors are grouped by the layer that raises them. Most of them are
//! recovered below the worker-task boundary (a timed-out page, a stale
//! element, an unreachable dedup database); only precondition failures such
//! as a missing credential propagate out of a harvest.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for xharvest operations.
#[derive(Error, Debug)]
pub enum HarvestError {
    // precondition

    /// No authentication token was supplied.
    #[error("No auth token supplied. Pass --auth-token or set XH_AUTH_TOKEN.")]
    MissingCredential,

    /// The harvest request itself is unusable (no sessions, zero target...).
    #[error("Invalid harvest request: {reason}")]
    InvalidRequest { reason: String },

    // browser

    /// The WebDriver endpoint could not be reached.
    #[error("WebDriver unreachable at '{url}': {reason}")]
    DriverUnavailable { url: String, reason: String },

    /// The driver answered with a protocol-level error.
    #[error("WebDriver error ({code}): {message}")]
    Driver { code: String, message: String },

    /// Element was detached from the DOM between lookup and use.
    #[error("Stale element reference: {0}")]
    StaleElement(String),

    /// A required sub-element was not present.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// The browser does not implement the requested capability.
    #[error("Browser operation not supported: {0}")]
    Unsupported(&'static str),

    /// HTTP transport failure talking to the driver.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // store

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    /// Database schema version mismatch.
    #[error("Database schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    // worker

    /// A worker thread panicked or its task failed unexpectedly.
    #[error("Worker #{worker} failed on session {session}: {reason}")]
    WorkerFault {
        worker: usize,
        session: usize,
        reason: String,
    },

    // export / io

    /// Workbook could not be built or saved.
    #[error("Excel export failed: {0}")]
    Excel(#[from] rust_xlsxwriter::XlsxError),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// File read/write error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Path-specific IO error with context.
    #[error("Failed to {operation} '{path}': {source}")]
    PathError {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // configuration

    /// Configuration file parsing error.
    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigError { path: PathBuf, reason: String },

    /// Invalid value supplied for an option.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    // generic

    /// Catch-all for other errors with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Wrapped anyhow error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for xharvest operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    /// Create an invalid request error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Create a driver-unavailable error.
    pub fn driver_unavailable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DriverUnavailable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a path error with context.
    pub fn path_error(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::PathError {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Wrap an error with additional context.
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True when the error only affects a single element and the session
    /// should keep going.
    #[must_use]
    pub const fn is_element_error(&self) -> bool {
        matches!(self, Self::StaleElement(_) | Self::ElementNotFound(_))
    }

    /// True when the error is recovered below the worker-task boundary.
    ///
    /// Everything except precondition failures is recoverable: the affected
    /// session ends empty and the harvest continues.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::MissingCredential | Self::InvalidRequest { .. } | Self::ConfigError { .. }
        )
    }

    /// Get a suggestion for how to fix this error, if applicable.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::MissingCredential => Some(
                "Copy the auth_token cookie from a logged-in browser session and pass it with --auth-token.",
            ),
            Self::DriverUnavailable { .. } => Some(
                "Start chromedriver (e.g. 'chromedriver --port=9515') or set XH_CHROMEDRIVER to its path.",
            ),
            Self::SchemaMismatch { .. } => {
                Some("Delete the dedup database to recreate it with the current schema.")
            }
            _ => None,
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error.
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily (only evaluated on error).
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| HarvestError::with_context(context, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| HarvestError::with_context(f(), e))
    }
}

use colored::Colorize;
use std::fmt::Write as _;

use crate::fingerprint::levenshtein_distance;

/// Accepted values for `--mode`.
pub const VALID_SEARCH_MODES: &[&str] = &["top", "latest"];

/// Accepted values for `--format`.
pub const VALID_EXPORT_FORMATS: &[&str] = &["csv", "json", "excel"];

const MAX_SUGGESTION_DISTANCE: usize = 2;

/// Render an operator-facing error: bold title, explanation, optional hint.
#[must_use]
pub fn format_error(title: &str, explanation: &str, hint: Option<&str>) -> String {
    let mut out = format!("{} {}", "✗".red().bold(), title.bold());
    if !explanation.is_empty() {
        let _ = write!(out, "\n   {explanation}");
    }
    if let Some(hint) = hint {
        let _ = write!(out, "\n   {} {hint}", "Hint:".cyan());
    }
    out
}

/// Case-insensitive nearest candidate within two edits. An exact match is
/// not a suggestion.
#[must_use]
pub fn find_closest_match<'a>(input: &str, candidates: &[&'a str]) -> Option<&'a str> {
    let input = input.to_lowercase();
    candidates
        .iter()
        .filter_map(|&candidate| {
            let distance = levenshtein_distance(&input, &candidate.to_lowercase());
            (1..=MAX_SUGGESTION_DISTANCE)
                .contains(&distance)
                .then_some((distance, candidate))
        })
        .min_by_key(|&(distance, _)| distance)
        .map(|(_, candidate)| candidate)
}

#[must_use]
pub fn format_did_you_mean(input: &str, candidates: &[&str]) -> Option<String> {
    find_closest_match(input, candidates).map(|m| format!("Did you mean '{m}'?"))
}

/// Error text for a `--mode` or `--format` value that does not parse.
#[must_use]
pub fn format_unknown_value_error(kind: &str, value: &str, valid: &[&str]) -> String {
    let explanation = format!("'{value}' is not a valid {kind}. Valid values: {}", valid.join(", "));
    let hint = format_did_you_mean(value, valid);
    format_error(&format!("Unknown {kind}"), &explanation, hint.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_is_not_recoverable() {
        assert!(!HarvestError::MissingCredential.is_recoverable());
        assert!(HarvestError::MissingCredential.suggestion().is_some());
    }

    #[test]
    fn element_errors_are_recoverable() {
        let stale = HarvestError::StaleElement("abc".into());
        assert!(stale.is_element_error());
        assert!(stale.is_recoverable());
        assert!(!HarvestError::Unsupported("scroll").is_element_error());
    }

    #[test]
    fn closest_match_suggests_mode() {
        assert_eq!(
            find_closest_match("lates", VALID_SEARCH_MODES),
            Some("latest")
        );
        assert_eq!(find_closest_match("top", VALID_SEARCH_MODES), None);
        assert_eq!(find_closest_match("zzzzzzz", VALID_SEARCH_MODES), None);
    }

    #[test]
    fn did_you_mean_formats_hint() {
        let hint = format_did_you_mean("jsn", VALID_EXPORT_FORMATS).unwrap();
        assert_eq!(hint, "Did you mean 'json'?");
    }

    #[test]
    fn context_wraps_source() {
        let io: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = io.context("writing export").unwrap_err();
        assert_eq!(err.to_string(), "writing export: boom");
    }
}
