//! Configuration system for xharvest.
//!
//! Layered, lowest to highest priority:
//!
//! 1. **Compiled defaults**
//! 2. **User config file** - `~/.config/xharvest/config.toml`
//! 3. **Environment variables** - `XH_*` prefix
//! 4. **CLI arguments** - applied by the binary
//!
//! # Example Configuration File
//!
//! ```toml
//! [paths]
//! db = "~/.local/share/xharvest/tweet_dedup.db"
//! output_dir = "harvests"
//!
//! [harvest]
//! scroll_pause_secs = 5
//! content_wait_secs = 20
//! session_interval_secs = 10
//! max_unchanged_scrolls = 3
//! threads = 2
//! language = "id"
//! search_mode = "top"
//!
//! [dedup]
//! retention_days = 30
//! similarity_threshold = 0.85
//! near_duplicate = "similarity"
//! on_store_fault = "unique"
//!
//! [webdriver]
//! url = "http://localhost:9515"
//! headless = true
//!
//! [output]
//! format = "csv"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dedup::{NearDuplicateMode, StoreFaultPolicy, StoreOptions};
use crate::model::{ExportFormat, SearchMode};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub harvest: HarvestConfig,
    pub dedup: DedupConfig,
    pub webdriver: WebDriverConfig,
    pub output: OutputConfig,
}

/// File locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Dedup database. Environment variable: `XH_DB`
    pub db: Option<PathBuf>,

    /// Where exports are written. Environment variable: `XH_OUTPUT_DIR`
    pub output_dir: Option<PathBuf>,
}

/// Collection loop and pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Pause after each scroll so lazy-loaded posts can render.
    pub scroll_pause_secs: u64,

    /// How long to wait for the first result to render.
    pub content_wait_secs: u64,

    /// Pause between sequential sessions.
    pub session_interval_secs: u64,

    /// Consecutive scrolls without page growth tolerated before a session
    /// is considered exhausted.
    pub max_unchanged_scrolls: u32,

    /// Parallel workers (clamped to 1..=5). Environment variable: `XH_THREADS`
    pub threads: usize,

    /// Default `lang:` operator value.
    pub language: String,

    /// Default search tab.
    pub search_mode: SearchMode,
}

/// Fingerprint store behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Persisted fingerprints older than this are purged at harvest start.
    pub retention_days: u32,

    /// Minimum similarity for the near-duplicate check (0.0 - 1.0).
    pub similarity_threshold: f64,

    /// How many recent rows the similarity check compares against.
    pub similarity_window: usize,

    /// Which near-duplicate check runs after the exact hash checks.
    pub near_duplicate: NearDuplicateMode,

    /// What a duplicate check reports when the database errors.
    pub on_store_fault: StoreFaultPolicy,
}

/// WebDriver connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverConfig {
    /// Base url of the driver. Environment variable: `XH_WEBDRIVER_URL`
    pub url: String,

    /// Driver binary to launch once per run when the url is not already
    /// serving. Environment variable: `XH_CHROMEDRIVER`
    pub driver_path: Option<PathBuf>,

    pub user_agent: String,
    pub headless: bool,
    pub window_size: String,

    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
}

/// Output formatting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Export format. Environment variable: `XH_FORMAT`
    pub format: ExportFormat,

    pub colors: bool,

    /// Suppress progress bars. Environment variable: `XH_QUIET`
    pub quiet: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            scroll_pause_secs: 5,
            content_wait_secs: 20,
            session_interval_secs: 10,
            max_unchanged_scrolls: 3,
            threads: 2,
            language: "id".to_string(),
            search_mode: SearchMode::Top,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            similarity_threshold: 0.85,
            similarity_window: 500,
            near_duplicate: NearDuplicateMode::Similarity,
            on_store_fault: StoreFaultPolicy::TreatAsUnique,
        }
    }
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9515".to_string(),
            driver_path: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            headless: true,
            window_size: "1920,1080".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::Csv,
            colors: true,
            quiet: false,
        }
    }
}

impl HarvestConfig {
    #[must_use]
    pub const fn scroll_pause(&self) -> Duration {
        Duration::from_secs(self.scroll_pause_secs)
    }

    #[must_use]
    pub const fn content_wait(&self) -> Duration {
        Duration::from_secs(self.content_wait_secs)
    }

    #[must_use]
    pub const fn session_interval(&self) -> Duration {
        Duration::from_secs(self.session_interval_secs)
    }
}

impl DedupConfig {
    /// Options for opening a [`crate::dedup::FingerprintStore`].
    #[must_use]
    pub const fn store_options(&self) -> StoreOptions {
        StoreOptions {
            similarity_threshold: self.similarity_threshold,
            similarity_window: self.similarity_window,
            near_duplicate: self.near_duplicate,
            on_store_fault: self.on_store_fault,
        }
    }
}

impl Config {
    /// Load configuration from defaults, the user file and the environment.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        config.apply_env_overrides();

        debug!("Configuration loaded: {:?}", config);
        config
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &PathBuf) -> Option<Self> {
        if !path.exists() {
            debug!("Config file not found: {}", path.display());
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    info!("Loaded config from: {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Path to the user configuration file.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("xharvest").join("config.toml"))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source (testable).
    fn apply_env_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(db) = var("XH_DB") {
            self.paths.db = Some(PathBuf::from(db));
        }
        if let Some(dir) = var("XH_OUTPUT_DIR") {
            self.paths.output_dir = Some(PathBuf::from(dir));
        }
        if let Some(threads) = var("XH_THREADS") {
            match threads.parse() {
                Ok(n) => self.harvest.threads = n,
                Err(_) => warn!("Ignoring XH_THREADS={threads}: not a number"),
            }
        }
        if let Some(url) = var("XH_WEBDRIVER_URL") {
            self.webdriver.url = url;
        }
        if let Some(path) = var("XH_CHROMEDRIVER") {
            self.webdriver.driver_path = Some(PathBuf::from(path));
        }
        if let Some(format) = var("XH_FORMAT") {
            match format.parse() {
                Ok(f) => self.output.format = f,
                Err(e) => warn!("Ignoring XH_FORMAT: {e}"),
            }
        }
        if var("XH_NO_COLOR").is_some() || var("NO_COLOR").is_some() {
            self.output.colors = false;
        }
        if var("XH_QUIET").is_some() {
            self.output.quiet = true;
        }
    }

    /// Merge another config into this one (other takes precedence).
    fn merge(&mut self, other: Self) {
        if other.paths.db.is_some() {
            self.paths.db = other.paths.db;
        }
        if other.paths.output_dir.is_some() {
            self.paths.output_dir = other.paths.output_dir;
        }

        self.harvest = other.harvest;
        self.dedup = other.dedup;

        let driver_path = other.webdriver.driver_path.or(self.webdriver.driver_path.take());
        self.webdriver = WebDriverConfig {
            driver_path,
            ..other.webdriver
        };

        self.output = other.output;
    }

    /// Dedup database path, using defaults if not configured.
    pub fn db_path(&self) -> PathBuf {
        self.paths
            .db
            .clone()
            .unwrap_or_else(crate::default_db_path)
    }

    /// Export directory, defaulting to the working directory.
    pub fn output_dir(&self) -> PathBuf {
        self.paths
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Save the current configuration to the user config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined,
    /// created, or written.
    pub fn save(&self) -> std::io::Result<PathBuf> {
        let config_path = Self::user_config_path().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory",
            )
        })?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&config_path, content)?;
        info!("Saved config to: {}", config_path.display());
        Ok(config_path)
    }

    /// Default configuration file content.
    #[must_use]
    pub fn default_config_content() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}
