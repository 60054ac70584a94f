//! Data models for harvested posts and harvest sessions.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A harvested post.
///
/// `url` is the identity of a record and the only field guaranteed to be
/// present; the engagement counts are whatever the page displayed ("1.2K",
/// "", "37") and are never parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub url: String,
    pub author_name: String,
    pub author_handle: String,
    pub posted_at: String,
    pub text: String,
    pub reply_count: String,
    pub repost_count: String,
    pub like_count: String,
}

impl Record {
    /// Create a record with only the identity and text filled in.
    pub fn new(url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    /// Builder-style setter for the author handle.
    #[must_use]
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.author_handle = handle.into();
        self
    }

    /// Builder-style setter for the author display name.
    #[must_use]
    pub fn with_author(mut self, name: impl Into<String>) -> Self {
        self.author_name = name.into();
        self
    }

    /// Builder-style setter for the post timestamp.
    #[must_use]
    pub fn with_posted_at(mut self, posted_at: impl Into<String>) -> Self {
        self.posted_at = posted_at.into();
        self
    }

    /// A record without a url is unusable and must be discarded.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// Search result ordering on the site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[default]
    Top,
    Latest,
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Top => write!(f, "top"),
            Self::Latest => write!(f, "latest"),
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "top" => Ok(Self::Top),
            "latest" | "live" => Ok(Self::Latest),
            _ => Err(format!("Invalid search mode: {s}")),
        }
    }
}

/// Output file format for the export collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
    Excel,
}

impl ExportFormat {
    /// File extension, without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Excel => "xlsx",
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Csv => write!(f, "csv"),
            Self::Json => write!(f, "json"),
            Self::Excel => write!(f, "excel"),
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "excel" | "xlsx" => Ok(Self::Excel),
            _ => Err(format!("Invalid export format: {s}")),
        }
    }
}

/// An inclusive-start, exclusive-end window of days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    #[must_use]
    pub const fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} → {}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

/// One unit of harvesting work. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// 1-based position in the harvest.
    pub id: usize,
    pub keyword: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub target_count: usize,
    pub language: String,
    pub search_mode: SearchMode,
}

impl Session {
    #[must_use]
    pub const fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }
}

/// Everything needed to run a harvest, shared by the sequential and parallel
/// drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestRequest {
    pub keyword: String,
    pub date_ranges: Vec<DateRange>,
    pub target_per_session: usize,
    pub language: String,
    pub search_mode: SearchMode,
    /// Value of the `auth_token` cookie.
    #[serde(skip_serializing)]
    pub auth_token: String,
}

impl HarvestRequest {
    /// Build the immutable session list, one per date range.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.date_ranges
            .iter()
            .enumerate()
            .map(|(idx, range)| Session {
                id: idx + 1,
                keyword: self.keyword.clone(),
                start_date: range.start,
                end_date: range.end,
                target_count: self.target_per_session,
                language: self.language.clone(),
                search_mode: self.search_mode,
            })
            .collect()
    }

    /// Target across all sessions.
    #[must_use]
    pub fn total_target(&self) -> usize {
        self.target_per_session * self.date_ranges.len()
    }

    /// Reject requests that cannot start: a blank credential first, then
    /// an empty keyword, no date ranges or a zero target.
    ///
    /// # Errors
    ///
    /// `MissingCredential` or `InvalidRequest`.
    pub fn validate(&self) -> crate::Result<()> {
        if self.auth_token.trim().is_empty() {
            return Err(crate::HarvestError::MissingCredential);
        }
        if self.keyword.trim().is_empty() {
            return Err(crate::HarvestError::invalid_request("keyword is empty"));
        }
        if self.date_ranges.is_empty() {
            return Err(crate::HarvestError::invalid_request("no date ranges to harvest"));
        }
        if self.target_per_session == 0 {
            return Err(crate::HarvestError::invalid_request(
                "target per session must be at least 1",
            ));
        }
        Ok(())
    }

    /// Earliest start and latest end across all ranges.
    #[must_use]
    pub fn span(&self) -> Option<DateRange> {
        let start = self.date_ranges.iter().map(|r| r.start).min()?;
        let end = self.date_ranges.iter().map(|r| r.end).max()?;
        Some(DateRange::new(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn request(token: &str) -> HarvestRequest {
        HarvestRequest {
            keyword: "banjir".into(),
            date_ranges: vec![DateRange::new(day(2024, 1, 1), day(2024, 1, 2))],
            target_per_session: 10,
            language: "id".into(),
            search_mode: SearchMode::Top,
            auth_token: token.into(),
        }
    }

    #[test]
    fn validate_checks_credential_first() {
        assert!(request("tok").validate().is_ok());
        assert!(matches!(
            request("  ").validate(),
            Err(crate::HarvestError::MissingCredential)
        ));

        let mut empty = request("");
        empty.date_ranges.clear();
        assert!(matches!(empty.validate(), Err(crate::HarvestError::MissingCredential)));

        let mut no_ranges = request("tok");
        no_ranges.date_ranges.clear();
        assert!(matches!(
            no_ranges.validate(),
            Err(crate::HarvestError::InvalidRequest { .. })
        ));

        let mut zero = request("tok");
        zero.target_per_session = 0;
        assert!(zero.validate().is_err());
    }

    #[test]
    fn record_without_url_is_invalid() {
        assert!(!Record::new("", "text").is_valid());
        assert!(!Record::new("   ", "text").is_valid());
        assert!(Record::new("https://x.com/u/status/1", "").is_valid());
    }

    #[test]
    fn search_mode_parses_and_displays() {
        assert_eq!("latest".parse::<SearchMode>().unwrap(), SearchMode::Latest);
        assert_eq!("TOP".parse::<SearchMode>().unwrap(), SearchMode::Top);
        assert!("hot".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::Latest.to_string(), "latest");
    }

    #[test]
    fn export_format_extension() {
        assert_eq!(ExportFormat::Csv.extension(), "csv");
        assert_eq!("xlsx".parse::<ExportFormat>().unwrap(), ExportFormat::Excel);
        assert_eq!(ExportFormat::Excel.extension(), "xlsx");
    }

    #[test]
    fn request_builds_numbered_sessions() {
        let request = HarvestRequest {
            keyword: "rust".into(),
            date_ranges: vec![
                DateRange::new(day(2024, 1, 1), day(2024, 1, 8)),
                DateRange::new(day(2024, 1, 8), day(2024, 1, 15)),
            ],
            target_per_session: 50,
            language: "en".into(),
            search_mode: SearchMode::Latest,
            auth_token: "tok".into(),
        };

        let sessions = request.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, 1);
        assert_eq!(sessions[1].id, 2);
        assert_eq!(sessions[1].start_date, day(2024, 1, 8));
        assert_eq!(request.total_target(), 100);
        assert_eq!(
            request.span(),
            Some(DateRange::new(day(2024, 1, 1), day(2024, 1, 15)))
        );
    }
}
