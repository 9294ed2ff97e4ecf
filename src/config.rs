use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub shell: ShellConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Database file (defaults to $XDG_DATA_HOME/fieldpost/fieldpost.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Base URL of the remote document store
  pub document_store_url: Option<String>,
  /// Base URL of the blob store
  pub blob_store_url: Option<String>,
  /// URL probed to decide whether the device is online
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
  /// Fallback drain timer for when the connectivity signal is unreliable
  pub periodic_interval_secs: u64,
  /// A periodic drain is skipped if the last one finished more recently than this
  pub periodic_min_gap_secs: u64,
  pub request_timeout_secs: u64,
  /// IANA zone name stamped on reconnected records (falls back to $TZ, then the local offset)
  pub device_time_zone: Option<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      document_store_url: None,
      blob_store_url: None,
      probe_url: None,
      probe_interval_secs: 15,
      periodic_interval_secs: 60,
      periodic_min_gap_secs: 45,
      request_timeout_secs: 30,
      device_time_zone: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
  /// Version tag of the asset manifest; bump it whenever `manifest` changes
  pub version: String,
  /// Upstream origin that serves the application
  pub origin: String,
  pub listen: String,
  pub manifest: Vec<String>,
  pub navigation_timeout_secs: u64,
  pub navigation_preload: bool,
  /// Hosts (suffix match, case-insensitive) that are never intercepted
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub bypass_hosts: BTreeSet<String>,
  /// Hosts whose responses are treated as images regardless of extension
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub image_hosts: BTreeSet<String>,
  /// Pages served for a failed navigation with no cached match, in order
  pub fallback_pages: Vec<String>,
  /// Activate a freshly installed version at once; when false it waits
  /// for POST /__shell/skip-waiting
  pub auto_activate: bool,
}

impl Default for ShellConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      origin: "http://127.0.0.1:8080".to_string(),
      listen: "127.0.0.1:8787".to_string(),
      manifest: vec!["/".to_string(), "/index.html".to_string(), "/menu.html".to_string()],
      navigation_timeout_secs: 8,
      navigation_preload: true,
      bypass_hosts: [
        "googleapis.com",
        "gstatic.com",
        "firebaseio.com",
        "googlesyndication.com",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      image_hosts: ["googleusercontent.com"]
        .into_iter()
        .map(String::from)
        .collect(),
      fallback_pages: vec!["/menu.html".to_string(), "/index.html".to_string()],
      auto_activate: true,
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldpost.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldpost/config.yaml
  ///
  /// With no file at all the defaults are used, so a post can start offline
  /// before it was ever configured.
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
    let local = PathBuf::from("fieldpost.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldpost").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Resolve the database path, falling back to the data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.store.path {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("fieldpost.db")),
    }
  }

  /// Get the backend API token from environment variables.
  ///
  /// Checks FIELDPOST_API_TOKEN first, then FIELDPOST_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("FIELDPOST_API_TOKEN")
      .or_else(|_| std::env::var("FIELDPOST_TOKEN"))
      .map_err(|_| {
        eyre!("Backend API token not found. Set FIELDPOST_API_TOKEN or FIELDPOST_TOKEN.")
      })
  }
}

/// Directory for the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("fieldpost"))
}
