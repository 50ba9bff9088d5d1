use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the web application; precache paths resolve against it
  pub origin: Url,
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  /// Override for the durable store location
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Transactional backend; never cached, target of queued replays
  pub url: Url,
  #[serde(default = "default_schema_path")]
  pub schema_path: String,
}

fn default_schema_path() -> String {
  "/rest/v1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache-version tag of the precache generation
  pub version: String,
  pub prefix: String,
  pub runtime_store: String,
  pub manifest: Vec<String>,
  pub offline_page: String,
  /// Activate a freshly installed version without waiting
  pub skip_waiting: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      prefix: "stockroom".to_string(),
      runtime_store: "stockroom-runtime".to_string(),
      manifest: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/offline.html".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
      skip_waiting: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_retries: u32,
  pub base_delay_secs: u64,
  pub max_delay_secs: u64,
  pub batch_size: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 5,
      base_delay_secs: 2,
      max_delay_secs: 300,
      batch_size: 25,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Defaults to the API url
  pub probe_url: Option<Url>,
  pub interval_secs: u64,
  pub timeout_secs: u64,
  pub assume_online: bool,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      interval_secs: 15,
      timeout_secs: 5,
      assume_online: true,
    }
  }
}

impl ConnectivityConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stockroom.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stockroom/config.yaml
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
        "No configuration file found. Create one at ~/.config/stockroom/config.yaml\n\
                 with at least `origin:` and `api: {{ url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stockroom.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stockroom").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.connectivity.interval_secs == 0 {
      return Err(eyre!("connectivity.interval_secs must be > 0"));
    }
    Ok(config)
  }

  /// URL the connectivity probe pings.
  pub fn probe_url(&self) -> Url {
    self
      .connectivity
      .probe_url
      .clone()
      .unwrap_or_else(|| self.api.url.clone())
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks STOCKROOM_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("STOCKROOM_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set STOCKROOM_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml(
      "origin: https://app.example.com\napi:\n  url: https://db.example.co\n",
    )
    .unwrap();

    assert_eq!(config.api.schema_path, "/rest/v1");
    assert_eq!(config.cache.version, "v1");
    assert_eq!(config.cache.manifest.len(), 3);
    assert!(config.cache.skip_waiting);
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.probe_url().as_str(), "https://db.example.co/");
  }

  #[test]
  fn test_overrides() {
    let config = Config::from_yaml(
      r#"
origin: https://app.example.com
api:
  url: https://db.example.co
cache:
  version: v7
  skip_waiting: false
sync:
  max_retries: 2
connectivity:
  probe_url: https://status.example.com/ping
  interval_secs: 3
"#,
    )
    .unwrap();

    assert_eq!(config.cache.version, "v7");
    assert!(!config.cache.skip_waiting);
    // untouched fields keep their defaults
    assert_eq!(config.cache.offline_page, "/offline.html");
    assert_eq!(config.sync.max_retries, 2);
    assert_eq!(config.sync.batch_size, 25);
    assert_eq!(config.connectivity.interval(), Duration::from_secs(3));
    assert_eq!(
      config.probe_url().as_str(),
      "https://status.example.com/ping"
    );
  }

  #[test]
  fn test_zero_probe_interval_is_rejected() {
    let err = Config::from_yaml(
      "origin: https://app.example.com\napi:\n  url: https://db.example.co\nconnectivity:\n  interval_secs: 0\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("interval_secs"));
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let err = Config::load(Some(Path::new("/nonexistent/stockroom.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
