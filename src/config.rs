/// Service configuration.
///
/// Loaded from a TOML file (default `./event_monitor.toml`). Every field has
/// a default, so an empty file (or no file at the default path) gives the
/// standard 40-minute run with a five-minute settle lag. `DATABASE_URL`
/// from the environment (or `.env`) overrides `queue.database_url`.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::logging::LogLevel;
use crate::model::{MonitorError, DEFAULT_UTC_OFFSET_SECS};

pub const DEFAULT_CONFIG_PATH: &str = "./event_monitor.toml";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub queue: QueueConfig,
    pub manifest: ManifestConfig,
    pub localization: LocalizationConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

/// Ingestion loop timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// How long the loop ingests before localization runs.
    pub duration_secs: u64,
    /// Delay between a bucket's end and its finalization.
    pub settle_lag_secs: i64,
    /// Upper bound on messages pulled per receive call.
    pub batch_size: usize,
    /// How long one receive call may block waiting for messages.
    pub wait_timeout_secs: u64,
    /// Shift applied to bucket starts when they are formatted for output.
    pub utc_offset_secs: i64,
    /// Forget event ids whose bucket is older than this. Unset keeps every
    /// id for the whole run.
    pub dedup_retention_secs: Option<i64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            duration_secs: 60 * 40,
            settle_lag_secs: 60 * 5,
            batch_size: 10,
            wait_timeout_secs: 5,
            utc_offset_secs: DEFAULT_UTC_OFFSET_SECS,
            dedup_retention_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Postgres,
    Replay,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub kind: QueueKind,
    /// Logical queue name; rows in `event_queue.messages` are filtered by it.
    pub name: String,
    pub database_url: Option<String>,
    /// How long a received message stays hidden before it is redelivered.
    pub visibility_timeout_secs: u64,
    /// JSON-lines file of message bodies, for `kind = "replay"`.
    pub replay_path: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            kind: QueueKind::Postgres,
            name: "event_monitor".to_string(),
            database_url: None,
            visibility_timeout_secs: 30,
            replay_path: None,
        }
    }
}

/// Where the location manifest comes from. Exactly one of `path`, `url`, or
/// `bucket` should be set; they are tried in that order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub path: Option<String>,
    pub url: Option<String>,
    pub bucket: Option<String>,
    pub key: String,
    pub region: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        ManifestConfig {
            path: None,
            url: None,
            bucket: None,
            key: "locations.json".to_string(),
            region: "eu-west-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Grid cells per axis.
    pub grid_divisions: usize,
    /// Seed the bounding box at (0, 0) so it always contains the origin.
    pub include_origin: bool,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        LocalizationConfig {
            grid_divisions: 100,
            include_origin: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub series_csv: String,
    pub grid_csv: Option<String>,
    pub summary_json: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            series_csv: "output.csv".to_string(),
            grid_csv: Some("grid.csv".to_string()),
            summary_json: Some("summary.json".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
            timestamps: false,
        }
    }
}

impl LoggingConfig {
    pub fn min_level(&self) -> Result<LogLevel, MonitorError> {
        LogLevel::parse(&self.level)
            .ok_or_else(|| MonitorError::Config(format!("unknown log level '{}'", self.level)))
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Parses configuration from TOML text and validates it.
    pub fn from_toml_str(text: &str) -> Result<Config, MonitorError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides the queue database URL, typically with `DATABASE_URL`.
    pub fn with_database_url(mut self, url: Option<String>) -> Config {
        if let Some(url) = url {
            self.queue.database_url = Some(url);
        }
        self
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.run.batch_size == 0 {
            return Err(MonitorError::Config("run.batch_size must be at least 1".into()));
        }
        if self.run.settle_lag_secs < 0 {
            return Err(MonitorError::Config("run.settle_lag_secs must not be negative".into()));
        }
        if let Some(retention) = self.run.dedup_retention_secs {
            if retention < self.run.settle_lag_secs {
                return Err(MonitorError::Config(
                    "run.dedup_retention_secs must be at least run.settle_lag_secs".into(),
                ));
            }
        }
        if self.localization.grid_divisions == 0 {
            return Err(MonitorError::Config("localization.grid_divisions must be at least 1".into()));
        }
        if self.manifest.path.is_none() && self.manifest.url.is_none() && self.manifest.bucket.is_none() {
            return Err(MonitorError::Config(
                "one of manifest.path, manifest.url or manifest.bucket is required".into(),
            ));
        }
        if self.queue.kind == QueueKind::Replay && self.queue.replay_path.is_none() {
            return Err(MonitorError::Config("queue.replay_path is required for a replay queue".into()));
        }
        self.logging.min_level()?;
        Ok(())
    }
}

/// Loads the configuration file at `path`.
///
/// A missing file is only an error when the caller asked for a specific
/// path; at the default path it falls back to defaults, which still have to
/// pass validation (so the manifest source must come from somewhere).
pub fn load_config(path: &str, explicit: bool) -> Result<Config, MonitorError> {
    if !explicit && !Path::new(path).exists() {
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let text = fs::read_to_string(path)
        .map_err(|e| MonitorError::Config(format!("cannot read {}: {}", path, e)))?;
    Config::from_toml_str(&text)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
