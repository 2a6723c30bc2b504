use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL all API paths are appended to (e.g. "https://reports.example.com/api")
  pub base_url: String,
  /// Per-request timeout
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Retries after a 429 response
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Wait before retrying a 429 that carries no Retry-After header
  #[serde(default = "default_retry_delay_ms")]
  pub retry_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_max_retries() -> u32 {
  3
}

fn default_retry_delay_ms() -> u64 {
  1000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite database for the key-value store
  pub database: Option<PathBuf>,
  /// Directory downloaded content is written to
  pub downloads_dir: Option<PathBuf>,
}

impl StorageConfig {
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(expand_home(p)),
      None => Ok(data_dir()?.join("store.db")),
    }
  }

  pub fn downloads_path(&self) -> Result<PathBuf> {
    match &self.downloads_dir {
      Some(p) => Ok(expand_home(p)),
      None => Ok(data_dir()?.join("files")),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Endpoint probed before a sync to check connectivity
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
  #[serde(default = "default_probe_timeout_secs")]
  pub probe_timeout_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      probe_path: default_probe_path(),
      probe_timeout_secs: default_probe_timeout_secs(),
    }
  }
}

fn default_probe_path() -> String {
  "/health".to_string()
}

fn default_probe_timeout_secs() -> u64 {
  5
}

/// Application data directory ($XDG_DATA_HOME/docvault or ~/.local/share/docvault).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("docvault"))
}

fn expand_home(path: &Path) -> PathBuf {
  match (path.strip_prefix("~"), dirs::home_dir()) {
    (Ok(rest), Some(home)) => home.join(rest),
    _ => path.to_path_buf(),
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./docvault.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/docvault/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/docvault/config.yaml\n\
                 with at least `api: {{ base_url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("docvault.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("docvault").join("config.yaml");
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
    if config.api.base_url.trim().is_empty() {
      return Err(eyre!("api.base_url must not be empty"));
    }
    Ok(config)
  }

  /// API token from the environment, used to seed the stored token.
  ///
  /// Checks DOCVAULT_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("DOCVAULT_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
