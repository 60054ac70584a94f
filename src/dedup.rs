//! Fingerprint store: decides whether a harvested record has been seen.
//!
//! Two layers answer the question. A per-run session cache (url hashes and
//! raw urls) catches repeats cheaply; a `SQLite` table of fingerprints
//! catches posts harvested by earlier runs, reposts of identical content and
//! near-identical text.
//!
//! The store is shared by every worker of a harvest. A single mutex guards
//! the session cache together with the connection, so a check-then-add done
//! through [`FingerprintStore::admit`] is atomic with respect to other
//! workers.
//!
//! A database error during a duplicate check never aborts a harvest. What it
//! means is decided by [`StoreFaultPolicy`]: by default the record is
//! treated as unique, trading dedup strictness for availability.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::fingerprint::{Fingerprint, length_bound, normalize_text, similarity_ratio};
use crate::model::Record;

const SCHEMA_VERSION: i32 = 1;

/// Which near-duplicate check runs after the exact hash checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NearDuplicateMode {
    /// Only rows whose normalized text hashes identically.
    TextHash,
    /// Identical text hash, or a similarity ratio at or above the threshold
    /// against the most recent stored rows.
    #[default]
    Similarity,
}

/// How a duplicate check treats a database error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreFaultPolicy {
    /// Report "not a duplicate" and keep harvesting.
    #[default]
    #[serde(rename = "unique")]
    TreatAsUnique,
    /// Report a duplicate so nothing unverified is collected.
    #[serde(rename = "duplicate")]
    TreatAsDuplicate,
}

/// Tuning for a [`FingerprintStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub similarity_threshold: f64,
    pub similarity_window: usize,
    pub near_duplicate: NearDuplicateMode,
    pub on_store_fault: StoreFaultPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            similarity_window: 500,
            near_duplicate: NearDuplicateMode::Similarity,
            on_store_fault: StoreFaultPolicy::TreatAsUnique,
        }
    }
}

/// Why a record was classified as a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DuplicateReason {
    /// Url hash already in the session cache.
    SessionUrlHash,
    /// Raw url already in the session cache.
    SessionUrl,
    /// Url hash already persisted by an earlier run.
    StoredUrl,
    /// Same normalized text from the same author under another url.
    IdenticalContent { url: String },
    /// Same or nearly the same text from any author.
    SimilarText { handle: String, similarity: f64 },
    /// The database failed and the fault policy says "duplicate".
    StoreFault,
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionUrlHash => write!(f, "URL already seen in this session"),
            Self::SessionUrl => write!(f, "URL duplicate in this session"),
            Self::StoredUrl => write!(f, "URL already stored in the database"),
            Self::IdenticalContent { url } => write!(f, "identical content already stored as {url}"),
            Self::SimilarText { handle, similarity } => {
                write!(f, "similar text found from {handle} ({:.0}%)", similarity * 100.0)
            }
            Self::StoreFault => write!(f, "store unavailable, rejected by fault policy"),
        }
    }
}

/// Result of [`FingerprintStore::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// New record, added to the session cache. `persisted` is false when
    /// the database write failed.
    Accepted { persisted: bool },
    Rejected(DuplicateReason),
}

/// Store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub session_cache_size: usize,
    pub total_persisted: usize,
    pub session_url_count: usize,
}

struct Inner {
    conn: Connection,
    session_hashes: HashSet<String>,
    session_urls: HashSet<String>,
}

/// Shared, lock-guarded fingerprint store.
pub struct FingerprintStore {
    inner: Mutex<Inner>,
    options: StoreOptions,
    path: Option<PathBuf>,
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl FingerprintStore {
    /// Open or create the store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(db_path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| HarvestError::path_error("create directory", parent, e))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        migrate(&conn)?;
        debug!(path = %path.display(), "Opened fingerprint store");

        Ok(Self::from_connection(conn, options, Some(path.to_path_buf())))
    }

    /// Open an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be initialized.
    pub fn open_memory(options: StoreOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self::from_connection(conn, options, None))
    }

    fn from_connection(conn: Connection, options: StoreOptions, path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                conn,
                session_hashes: HashSet::new(),
                session_urls: HashSet::new(),
            }),
            options,
            path,
        }
    }

    #[must_use]
    pub const fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Database file, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Check a record against the session cache and the database.
    ///
    /// Returns the first matching reason, or `None` when the record is new.
    pub fn check(&self, record: &Record) -> Option<DuplicateReason> {
        let fp = Fingerprint::of(record);
        let inner = self.inner.lock();
        self.check_locked(&inner, record, &fp)
    }

    /// `(is_duplicate, reason)` with an empty reason for new records.
    pub fn is_duplicate(&self, record: &Record) -> (bool, String) {
        self.check(record)
            .map_or_else(|| (false, String::new()), |reason| (true, reason.to_string()))
    }

    /// Add a record to the session cache and the database.
    ///
    /// Adding a url that is already stored is a silent no-op in the
    /// database. Returns false only when the database write failed; the
    /// session cache is updated regardless.
    pub fn add_record(&self, record: &Record) -> bool {
        let fp = Fingerprint::of(record);
        let mut inner = self.inner.lock();
        Self::add_locked(&mut inner, record, &fp, Utc::now())
    }

    /// Like [`add_record`](Self::add_record) with an explicit `stored_at`,
    /// for backfilling fingerprints from an older export.
    pub fn add_record_at(&self, record: &Record, stored_at: DateTime<Utc>) -> bool {
        let fp = Fingerprint::of(record);
        let mut inner = self.inner.lock();
        Self::add_locked(&mut inner, record, &fp, stored_at)
    }

    /// Check and, if new, add a record under a single lock acquisition.
    pub fn admit(&self, record: &Record) -> Admission {
        let fp = Fingerprint::of(record);
        let mut inner = self.inner.lock();
        if let Some(reason) = self.check_locked(&inner, record, &fp) {
            return Admission::Rejected(reason);
        }
        let persisted = Self::add_locked(&mut inner, record, &fp, Utc::now());
        Admission::Accepted { persisted }
    }

    /// Forget the session cache. Persisted rows are untouched.
    pub fn clear_session(&self) {
        let mut inner = self.inner.lock();
        inner.session_hashes.clear();
        inner.session_urls.clear();
    }

    /// Delete persisted rows stored more than `days` days ago.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn purge_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = timestamp(Utc::now() - ChronoDuration::days(i64::from(days)));
        let inner = self.inner.lock();
        let deleted = inner
            .conn
            .execute("DELETE FROM fingerprints WHERE stored_at < ?1", params![cutoff])?;
        if deleted > 0 {
            info!(deleted, days, "Purged old fingerprints");
        }
        Ok(deleted)
    }

    /// Session cache sizes and persisted row count. A database error is
    /// logged and reported as zero persisted rows.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        let total_persisted = inner
            .conn
            .query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get::<_, i64>(0))
            .map_or_else(
                |e| {
                    warn!(error = %e, "Failed to count stored fingerprints");
                    0
                },
                |n| usize::try_from(n).unwrap_or(0),
            );
        StoreStats {
            session_cache_size: inner.session_hashes.len(),
            total_persisted,
            session_url_count: inner.session_urls.len(),
        }
    }

    fn check_locked(&self, inner: &Inner, record: &Record, fp: &Fingerprint) -> Option<DuplicateReason> {
        if inner.session_hashes.contains(&fp.url_hash) {
            return Some(DuplicateReason::SessionUrlHash);
        }
        if inner.session_urls.contains(&record.url) {
            return Some(DuplicateReason::SessionUrl);
        }

        match self.check_persisted(&inner.conn, record, fp) {
            Ok(found) => found,
            Err(e) => match self.options.on_store_fault {
                StoreFaultPolicy::TreatAsUnique => {
                    warn!(error = %e, url = %record.url, "Dedup store unavailable, treating record as unique");
                    None
                }
                StoreFaultPolicy::TreatAsDuplicate => {
                    warn!(error = %e, url = %record.url, "Dedup store unavailable, rejecting record");
                    Some(DuplicateReason::StoreFault)
                }
            },
        }
    }

    fn check_persisted(
        &self,
        conn: &Connection,
        record: &Record,
        fp: &Fingerprint,
    ) -> rusqlite::Result<Option<DuplicateReason>> {
        let stored: Option<String> = conn
            .query_row(
                "SELECT url FROM fingerprints WHERE url_hash = ?1",
                params![fp.url_hash],
                |row| row.get(0),
            )
            .optional()?;
        if stored.is_some() {
            return Ok(Some(DuplicateReason::StoredUrl));
        }

        // Text-based checks would match every text-less post (media only)
        // against every other one.
        let text = normalize_text(&record.text);
        if text.is_empty() {
            return Ok(None);
        }

        let identical: Option<String> = conn
            .query_row(
                "SELECT url FROM fingerprints WHERE content_hash = ?1 LIMIT 1",
                params![fp.content_hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(url) = identical {
            return Ok(Some(DuplicateReason::IdenticalContent { url }));
        }

        let same_text: Option<String> = conn
            .query_row(
                "SELECT author_handle FROM fingerprints WHERE text_hash = ?1 LIMIT 1",
                params![fp.text_hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(handle) = same_text {
            return Ok(Some(DuplicateReason::SimilarText {
                handle,
                similarity: 1.0,
            }));
        }

        match self.options.near_duplicate {
            NearDuplicateMode::TextHash => Ok(None),
            NearDuplicateMode::Similarity => self.find_similar(conn, &text),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn find_similar(&self, conn: &Connection, text: &str) -> rusqlite::Result<Option<DuplicateReason>> {
        let threshold = self.options.similarity_threshold.clamp(0.0, 1.0);
        if threshold <= 0.0 {
            return Ok(None);
        }
        let len = text.chars().count();
        let min_len = (len as f64 * threshold).ceil() as i64;
        let max_len = (len as f64 / threshold).floor() as i64;
        let window = i64::try_from(self.options.similarity_window).unwrap_or(i64::MAX);

        let mut stmt = conn.prepare_cached(
            "SELECT author_handle, text_norm FROM fingerprints
             WHERE text_len BETWEEN ?1 AND ?2
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![min_len, max_len, window], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (handle, candidate) = row?;
            if length_bound(len, candidate.chars().count()) < threshold {
                continue;
            }
            let similarity = similarity_ratio(text, &candidate);
            if similarity >= threshold {
                return Ok(Some(DuplicateReason::SimilarText { handle, similarity }));
            }
        }
        Ok(None)
    }

    fn add_locked(inner: &mut Inner, record: &Record, fp: &Fingerprint, stored_at: DateTime<Utc>) -> bool {
        inner.session_hashes.insert(fp.url_hash.clone());
        inner.session_urls.insert(record.url.clone());

        let text = normalize_text(&record.text);
        let text_len = i64::try_from(text.chars().count()).unwrap_or(i64::MAX);
        let result = inner.conn.execute(
            "INSERT OR IGNORE INTO fingerprints
             (url_hash, content_hash, text_hash, url, author_handle, posted_at, text_norm, text_len, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                fp.url_hash,
                fp.content_hash,
                fp.text_hash,
                record.url,
                record.author_handle,
                record.posted_at,
                text,
                text_len,
                timestamp(stored_at),
            ],
        );

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, url = %record.url, "Failed to persist fingerprint");
                false
            }
        }
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if current > SCHEMA_VERSION {
        return Err(HarvestError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            found: current,
        });
    }

    if current < SCHEMA_VERSION {
        info!("Migrating fingerprint store from version {current} to {SCHEMA_VERSION}");
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS fingerprints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url_hash TEXT NOT NULL UNIQUE,
                content_hash TEXT NOT NULL,
                text_hash TEXT NOT NULL,
                url TEXT NOT NULL,
                author_handle TEXT NOT NULL DEFAULT '',
                posted_at TEXT NOT NULL DEFAULT '',
                text_norm TEXT NOT NULL DEFAULT '',
                text_len INTEGER NOT NULL DEFAULT 0,
                stored_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_fingerprints_content ON fingerprints(content_hash);
            CREATE INDEX IF NOT EXISTS idx_fingerprints_text ON fingerprints(text_hash);
            CREATE INDEX IF NOT EXISTS idx_fingerprints_len ON fingerprints(text_len);
            CREATE INDEX IF NOT EXISTS idx_fingerprints_stored_at ON fingerprints(stored_at);
            ",
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store() -> FingerprintStore {
        FingerprintStore::open_memory(StoreOptions::default()).unwrap()
    }

    fn post(url: &str, text: &str, handle: &str) -> Record {
        Record::new(url, text).with_handle(handle)
    }

    #[test]
    fn new_record_is_not_duplicate_then_is_after_add() {
        let store = store();
        let record = post("https://x/u/1", "Hello world", "u");

        assert_eq!(store.is_duplicate(&record), (false, String::new()));
        assert!(store.add_record(&record));

        let (dup, reason) = store.is_duplicate(&record);
        assert!(dup);
        assert!(reason.contains("URL"), "reason = {reason}");
    }

    #[test]
    fn adding_twice_is_idempotent() {
        let store = store();
        let record = post("https://x/u/1", "Hello world", "u");
        assert!(store.add_record(&record));
        assert_eq!(store.stats().total_persisted, 1);
        assert!(store.add_record(&record));
        assert_eq!(store.stats().total_persisted, 1);
    }

    #[test]
    fn persisted_url_is_found_after_clearing_session() {
        let store = store();
        let record = post("https://x/u/1", "Hello world", "u");
        store.add_record(&record);
        store.clear_session();

        let stats = store.stats();
        assert_eq!(stats.session_cache_size, 0);
        assert_eq!(stats.session_url_count, 0);
        assert_eq!(stats.total_persisted, 1);
        assert_eq!(store.check(&record), Some(DuplicateReason::StoredUrl));
    }

    #[test]
    fn repost_under_new_url_is_identical_content() {
        let store = store();
        store.add_record(&post("https://x/u/1", "Big news today", "u"));
        store.clear_session();

        let repost = post("https://x/u/2", "big   NEWS today", "u");
        assert_eq!(
            store.check(&repost),
            Some(DuplicateReason::IdenticalContent {
                url: "https://x/u/1".into()
            })
        );
    }

    #[test]
    fn same_text_other_author_is_similar_text() {
        let store = store();
        store.add_record(&post("https://x/a/1", "Copy paste campaign text", "@a"));

        match store.check(&post("https://x/b/2", "copy paste campaign text", "@b")) {
            Some(DuplicateReason::SimilarText { handle, similarity }) => {
                assert_eq!(handle, "@a");
                assert!((similarity - 1.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn near_duplicate_depends_on_mode() {
        let original = post(
            "https://x/a/1",
            "The river flooded the old town tonight, stay safe everyone",
            "@a",
        );
        let variant = post(
            "https://x/b/2",
            "The river flooded the old town tonight, stay safe everyone!!",
            "@b",
        );

        let similarity = store();
        similarity.add_record(&original);
        assert!(matches!(
            similarity.check(&variant),
            Some(DuplicateReason::SimilarText { .. })
        ));

        let text_hash = FingerprintStore::open_memory(StoreOptions {
            near_duplicate: NearDuplicateMode::TextHash,
            ..StoreOptions::default()
        })
        .unwrap();
        text_hash.add_record(&original);
        assert_eq!(text_hash.check(&variant), None);
    }

    #[test]
    fn empty_text_posts_do_not_collide() {
        let store = store();
        store.add_record(&post("https://x/a/1", "", "@a"));
        assert_eq!(store.check(&post("https://x/a/2", "   ", "@a")), None);
    }

    #[test]
    fn admit_is_check_then_add() {
        let store = store();
        let record = post("https://x/u/1", "Hello", "u");
        assert_eq!(store.admit(&record), Admission::Accepted { persisted: true });
        assert_eq!(
            store.admit(&record),
            Admission::Rejected(DuplicateReason::SessionUrlHash)
        );
    }

    #[test]
    fn purge_removes_only_old_rows() {
        let store = store();
        store.add_record_at(&post("https://x/u/old", "old post", "u"), Utc::now() - ChronoDuration::days(45));
        store.add_record(&post("https://x/u/new", "new post", "u"));

        assert_eq!(store.purge_older_than(30).unwrap(), 1);
        assert_eq!(store.stats().total_persisted, 1);
        assert_eq!(store.purge_older_than(30).unwrap(), 0);
    }

    fn broken_store(policy: StoreFaultPolicy) -> (TempDir, FingerprintStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dedup.db");
        let store = FingerprintStore::open(
            &path,
            StoreOptions {
                on_store_fault: policy,
                ..StoreOptions::default()
            },
        )
        .unwrap();
        let other = Connection::open(&path).unwrap();
        other.execute_batch("DROP TABLE fingerprints;").unwrap();
        (dir, store)
    }

    #[test]
    fn store_fault_treated_as_unique_by_default() {
        let (_dir, store) = broken_store(StoreFaultPolicy::TreatAsUnique);
        let record = post("https://x/u/1", "Hello", "u");

        assert_eq!(store.is_duplicate(&record), (false, String::new()));
        // The write fails but the session cache still learns the url.
        assert!(!store.add_record(&record));
        assert_eq!(store.check(&record), Some(DuplicateReason::SessionUrlHash));
        assert_eq!(store.stats().total_persisted, 0);
    }

    #[test]
    fn store_fault_can_reject() {
        let (_dir, store) = broken_store(StoreFaultPolicy::TreatAsDuplicate);
        let record = post("https://x/u/1", "Hello", "u");
        assert_eq!(store.check(&record), Some(DuplicateReason::StoreFault));
    }

    #[test]
    fn reopening_keeps_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dedup.db");
        {
            let store = FingerprintStore::open(&path, StoreOptions::default()).unwrap();
            store.add_record(&post("https://x/u/1", "Hello", "u"));
        }
        let store = FingerprintStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.stats().total_persisted, 1);
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn concurrent_admission_accepts_each_url_once() {
        // Texts differ by a single digit, so only exact hashes apply here.
        let store = Arc::new(
            FingerprintStore::open_memory(StoreOptions {
                near_duplicate: NearDuplicateMode::TextHash,
                ..StoreOptions::default()
            })
            .unwrap(),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|i| {
                            let record = post(&format!("https://x/u/{i}"), &format!("post number {i}"), "u");
                            matches!(store.admit(&record), Admission::Accepted { .. })
                        })
                        .count()
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 50);
        assert_eq!(store.stats().total_persisted, 50);
    }
}
