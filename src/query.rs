//! Search query construction and date-range chunking.

use chrono::{Duration as ChronoDuration, NaiveDate};

use crate::error::{HarvestError, Result};
use crate::model::{DateRange, SearchMode, Session};

/// Landing page used to attach the auth cookie.
pub const HOME_URL: &str = "https://x.com";

const SEARCH_URL: &str = "https://x.com/search";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Raw advanced-search query for a session:
/// `"{keyword} lang:{lang} until:{end} since:{start}"`.
#[must_use]
pub fn raw_query(session: &Session) -> String {
    format!(
        "{} lang:{} until:{} since:{}",
        session.keyword.trim(),
        session.language,
        session.end_date.format(DATE_FORMAT),
        session.start_date.format(DATE_FORMAT)
    )
}

/// Full search url with the query percent-encoded. The latest tab adds the
/// live-results modifier.
#[must_use]
pub fn search_url(session: &Session) -> String {
    let mut url = format!(
        "{SEARCH_URL}?q={}&src=typed_query",
        urlencoding::encode(&raw_query(session))
    );
    if session.search_mode == SearchMode::Latest {
        url.push_str("&f=live");
    }
    url
}

/// Split `[start, end]` into chunks of `interval_days`.
///
/// Every chunk starts where the previous one ended; the `until:` operator is
/// exclusive, so a chunk covers `interval_days` full days. The last chunk
/// may extend past `end`.
///
/// # Errors
///
/// Returns an error when `interval_days` is zero or `end` precedes `start`.
pub fn chunk_date_range(start: NaiveDate, end: NaiveDate, interval_days: u32) -> Result<Vec<DateRange>> {
    if interval_days == 0 {
        return Err(HarvestError::invalid_argument("interval must be at least one day"));
    }
    if end < start {
        return Err(HarvestError::invalid_argument(format!(
            "end date {end} is before start date {start}"
        )));
    }

    let step = ChronoDuration::days(i64::from(interval_days));
    let mut ranges = Vec::new();
    let mut current = start;
    while current <= end {
        let chunk_end = current + step;
        ranges.push(DateRange::new(current, chunk_end));
        current = chunk_end;
    }
    Ok(ranges)
}

/// `ceil(days / interval)` where `days` counts both ends.
#[must_use]
pub fn session_count(start: NaiveDate, end: NaiveDate, interval_days: u32) -> usize {
    if interval_days == 0 || end < start {
        return 0;
    }
    let days = usize::try_from((end - start).num_days() + 1).unwrap_or(0);
    let interval = interval_days as usize;
    days.div_ceil(interval)
}

/// Parse a `YYYY-MM-DD` date.
///
/// # Errors
///
/// Returns an error for anything else.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| {
        HarvestError::invalid_argument(format!("'{value}' is not a date in YYYY-MM-DD format"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn session(mode: SearchMode) -> Session {
        Session {
            id: 1,
            keyword: "banjir jakarta".into(),
            start_date: day(2024, 1, 1),
            end_date: day(2024, 1, 8),
            target_count: 100,
            language: "id".into(),
            search_mode: mode,
        }
    }

    #[test]
    fn raw_query_contains_operators() {
        assert_eq!(
            raw_query(&session(SearchMode::Top)),
            "banjir jakarta lang:id until:2024-01-08 since:2024-01-01"
        );
    }

    #[test]
    fn search_url_is_encoded() {
        let url = search_url(&session(SearchMode::Top));
        assert_eq!(
            url,
            "https://x.com/search?q=banjir%20jakarta%20lang%3Aid%20until%3A2024-01-08%20since%3A2024-01-01&src=typed_query"
        );
    }

    #[test]
    fn latest_mode_adds_live_modifier() {
        assert!(search_url(&session(SearchMode::Latest)).ends_with("&src=typed_query&f=live"));
        assert!(!search_url(&session(SearchMode::Top)).contains("f=live"));
    }

    #[test]
    fn chunks_cover_the_range() {
        let ranges = chunk_date_range(day(2024, 1, 1), day(2024, 1, 10), 3).unwrap();
        assert_eq!(
            ranges,
            vec![
                DateRange::new(day(2024, 1, 1), day(2024, 1, 4)),
                DateRange::new(day(2024, 1, 4), day(2024, 1, 7)),
                DateRange::new(day(2024, 1, 7), day(2024, 1, 10)),
                DateRange::new(day(2024, 1, 10), day(2024, 1, 13)),
            ]
        );
        assert_eq!(session_count(day(2024, 1, 1), day(2024, 1, 10), 3), ranges.len());
    }

    #[test]
    fn single_day_is_one_chunk() {
        let ranges = chunk_date_range(day(2024, 3, 5), day(2024, 3, 5), 7).unwrap();
        assert_eq!(ranges, vec![DateRange::new(day(2024, 3, 5), day(2024, 3, 12))]);
        assert_eq!(session_count(day(2024, 3, 5), day(2024, 3, 5), 7), 1);
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        assert!(chunk_date_range(day(2024, 1, 2), day(2024, 1, 1), 1).is_err());
        assert!(chunk_date_range(day(2024, 1, 1), day(2024, 1, 2), 0).is_err());
        assert_eq!(session_count(day(2024, 1, 1), day(2024, 1, 2), 0), 0);
    }

    #[test]
    fn parse_date_accepts_iso_only() {
        assert_eq!(parse_date("2024-02-29").unwrap(), day(2024, 2, 29));
        assert!(parse_date("29/02/2024").is_err());
        assert!(parse_date("2023-02-29").is_err());
    }
}
