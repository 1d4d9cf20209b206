use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that manifest paths, the offline page and the sync endpoint
  /// resolve against
  pub origin: String,
  /// Generation tag appended to every bucket name
  pub version: String,
  pub buckets: BucketsConfig,
  pub routes: RoutesConfig,
  /// Paths pre-fetched into the static bucket on install
  pub precache: Vec<String>,
  /// Path of the "you are offline" document
  pub offline_page: String,
  pub sync: SyncConfig,
  pub push: PushConfig,
  pub storage: StorageConfig,
  /// Activate as soon as install finishes instead of waiting
  pub skip_waiting: bool,
  /// Network timeout in seconds
  pub timeout_secs: u64,
}

/// Logical bucket names. The stored name is `{logical}-{version}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BucketsConfig {
  #[serde(rename = "static")]
  pub static_assets: String,
  pub dynamic: String,
  pub offline_data: String,
}

/// Route classification tables, each evaluated in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Substring markers for static assets
  pub cache_first: Vec<String>,
  /// Substring markers for live data
  pub network_first: Vec<String>,
  /// Exact page routes
  pub stale_while_revalidate: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// The only sync tag that triggers a queue flush
  pub tag: String,
  /// Delivery endpoint for flushed events
  pub endpoint: String,
  /// Key of the queue blob inside the offline-data bucket
  pub queue_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub icon: String,
  pub badge: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database path (defaults to $XDG_DATA_HOME/edgecache/buckets.db)
  pub path: Option<PathBuf>,
  pub quota_bytes: Option<u64>,
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      version: "v1".to_string(),
      buckets: BucketsConfig::default(),
      routes: RoutesConfig::default(),
      precache: strings(&[
        "/",
        "/offline",
        "/manifest.json",
        "/favicon.ico",
        "/_next/static/css/",
        "/_next/static/chunks/",
      ]),
      offline_page: "/offline".to_string(),
      sync: SyncConfig::default(),
      push: PushConfig::default(),
      storage: StorageConfig::default(),
      skip_waiting: true,
      timeout_secs: 30,
    }
  }
}

impl Default for BucketsConfig {
  fn default() -> Self {
    Self {
      static_assets: "static".to_string(),
      dynamic: "dynamic".to_string(),
      offline_data: "offline-data".to_string(),
    }
  }
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      cache_first: strings(&[
        "/_next/static/",
        "/static/",
        "/icons/",
        ".png",
        ".jpg",
        ".jpeg",
        ".svg",
        ".gif",
        ".webp",
        ".ico",
        ".woff2",
      ]),
      network_first: strings(&["/api/", "/api/chat"]),
      stale_while_revalidate: strings(&["/", "/courses", "/dashboard", "/profile"]),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-offline-events".to_string(),
      endpoint: "/api/events".to_string(),
      queue_key: "/offline-queue".to_string(),
    }
  }
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/badge-72x72.png".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./edgecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/edgecache/config.yaml
  ///
  /// Falls back to the built-in defaults when nothing is found.
  /// `EDGECACHE_ORIGIN` overrides the origin either way.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("edgecache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("edgecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn with_env_overrides(self) -> Result<Self> {
    match std::env::var("EDGECACHE_ORIGIN") {
      Ok(origin) => self.with_origin(origin),
      Err(_) => Ok(self),
    }
  }

  /// Replace the origin, rejecting anything that is not an http(s) URL.
  pub fn with_origin(mut self, origin: impl Into<String>) -> Result<Self> {
    self.origin = origin.into();
    self.validate()?;
    Ok(self)
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    Ok(())
  }

  /// Current-generation bucket name for a logical name.
  pub fn bucket_name(&self, logical: &str) -> String {
    format!("{}-{}", logical, self.version)
  }

  pub fn static_bucket(&self) -> String {
    self.bucket_name(&self.buckets.static_assets)
  }

  pub fn dynamic_bucket(&self) -> String {
    self.bucket_name(&self.buckets.dynamic)
  }

  pub fn offline_data_bucket(&self) -> String {
    self.bucket_name(&self.buckets.offline_data)
  }

  /// The bucket names that survive activation.
  pub fn current_buckets(&self) -> Vec<String> {
    vec![
      self.static_bucket(),
      self.dynamic_bucket(),
      self.offline_data_bucket(),
    ]
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a configured path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Cannot resolve '{}' against {}: {}", path, self.origin, e))
  }
}
