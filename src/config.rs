use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub queue: QueueConfig,
  pub save: SaveConfig,
  pub storage: StorageConfig,
  pub remote: RemoteConfig,
  pub logging: LoggingConfig,
}

/// Request cache settings. Bucket names are `<name_prefix>-<kind>-<generation>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub name_prefix: String,
  /// Bumping the generation retires every bucket of the previous one on activation
  pub generation: String,
  /// Critical assets fetched into the static bucket on install
  pub precache: Vec<String>,
  /// Path prefixes of build-output assets
  pub static_prefixes: Vec<String>,
  /// Path prefix of the application's own data endpoints
  pub api_prefix: String,
  pub image_prefixes: Vec<String>,
  /// Served to navigations when neither network nor cache can answer
  pub offline_page: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name_prefix: "mealsync".to_string(),
      generation: "v1".to_string(),
      precache: vec![
        "/".to_string(),
        "/offline.html".to_string(),
        "/manifest.json".to_string(),
      ],
      static_prefixes: vec!["/_next/static/".to_string(), "/static/".to_string()],
      api_prefix: "/api/".to_string(),
      image_prefixes: vec!["/images/".to_string(), "/icons/".to_string()],
      offline_page: "/offline.html".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Upper bound on stored items, terminal ones included
  pub max_size: usize,
  pub max_attempts: u32,
  pub retry_delay_ms: u64,
  pub retry_delay_multiplier: f64,
  pub max_retry_delay_ms: u64,
  /// How long completed and failed items are kept before cleanup
  pub retention_hours: i64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_size: 100,
      max_attempts: 3,
      retry_delay_ms: 1_000,
      retry_delay_multiplier: 2.0,
      max_retry_delay_ms: 60_000,
      retention_hours: 24,
    }
  }
}

impl QueueConfig {
  /// Delay before the next attempt once `attempts` failures have been recorded.
  pub fn backoff(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32) as i32;
    let delay = self.retry_delay_ms as f64 * self.retry_delay_multiplier.max(1.0).powi(exponent);
    Duration::from_millis(delay.min(self.max_retry_delay_ms as f64) as u64)
  }

  pub fn retention(&self) -> chrono::Duration {
    chrono::Duration::hours(self.retention_hours)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
  pub debounce_ms: u64,
  pub max_attempts: u32,
  pub priority: i32,
}

impl Default for SaveConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 2_000,
      max_attempts: 5,
      priority: 0,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/mealsync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL of the meal planner, e.g. "https://plan.example.com"
  pub origin: Option<String>,
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Also write a daily-rotated log file
  pub file: bool,
  /// Log directory (default: $XDG_STATE_HOME/mealsync/logs)
  pub dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mealsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mealsync/config.yaml
  ///
  /// Falls back to defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("mealsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mealsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Resolve the database path, falling back to the XDG data directory.
  pub fn storage_path(&self) -> Result<PathBuf> {
    self
      .storage
      .path
      .clone()
      .or_else(crate::storage::SqliteStore::default_path)
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }

  /// Remote origin as a parsed URL.
  pub fn origin(&self) -> Result<url::Url> {
    let origin = self
      .remote
      .origin
      .as_deref()
      .ok_or_else(|| eyre!("remote.origin is not configured"))?;
    url::Url::parse(origin).map_err(|e| eyre!("Invalid remote.origin '{}': {}", origin, e))
  }
}
