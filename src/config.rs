use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "sisa";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
  /// Root of the REST API, e.g. `https://api.example.com/v1/`
  pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// Where the databases and log files live (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
  /// Persist cached state across restarts; when off it lives in memory only
  #[serde(default = "default_true")]
  pub persist_cache: bool,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      data_dir: None,
      persist_cache: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Filter used when `RUST_LOG` is not set
  #[serde(default = "default_level")]
  pub level: String,
  /// Also write a daily-rolling log file into the data dir
  #[serde(default)]
  pub file: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_level(),
      file: false,
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_level() -> String {
  "info".to_string()
}

/// Platform data directory for the app, e.g. `~/.local/share/sisa`.
pub fn default_data_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|dir| dir.join(APP_DIR))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sisa.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sisa/config.yaml
  ///
  /// Without any file the defaults apply; the client works offline-only.
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
    let local = PathBuf::from("sisa.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is a valid, all-default config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Directory holding the databases and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.storage.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => default_data_dir(),
    }
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("sisa.db"))
  }

  /// Key-value cache file, or `None` when persistence is turned off.
  pub fn cache_path(&self) -> Result<Option<PathBuf>> {
    if !self.storage.persist_cache {
      return Ok(None);
    }
    Ok(Some(self.data_dir()?.join("cache.db")))
  }

  pub fn api_base_url(&self) -> Result<&str> {
    self
      .api
      .base_url
      .as_deref()
      .ok_or_else(|| eyre!("api.base_url is not configured"))
  }

  /// Get the API token from environment variables.
  ///
  /// Checks SISA_API_TOKEN first, then SISA_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("SISA_API_TOKEN")
      .or_else(|_| std::env::var("SISA_TOKEN"))
      .map_err(|_| eyre!("API token not found. Set SISA_API_TOKEN or SISA_TOKEN environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
api:
  base_url: https://api.example.com/v1/
storage:
  data_dir: /var/lib/sisa
  persist_cache: false
log:
  level: debug
  file: true
"#,
    )
    .unwrap();

    assert_eq!(config.api_base_url().unwrap(), "https://api.example.com/v1/");
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/var/lib/sisa"));
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/var/lib/sisa/sisa.db"));
    assert_eq!(config.cache_path().unwrap(), None);
    assert_eq!(config.log.level, "debug");
    assert!(config.log.file);
  }

  #[test]
  fn test_missing_sections_use_defaults() {
    let config = Config::parse("api:\n  base_url: http://localhost:8000/\n").unwrap();

    assert!(config.storage.persist_cache);
    assert_eq!(config.log.level, "info");
    assert!(!config.log.file);

    let empty = Config::parse("").unwrap();
    assert!(empty.api_base_url().is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(dir.path().join("nope.yaml").as_path())).is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "storage:\n  data_dir: /tmp/sisa-test\n").unwrap();

    let config = Config::load(Some(path.as_path())).unwrap();
    assert_eq!(
      config.cache_path().unwrap(),
      Some(PathBuf::from("/tmp/sisa-test/cache.db"))
    );
  }
}
