//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tablesync/config.toml)
//! 3. Environment variables (TABLESYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "TABLESYNC";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite db, server snapshot)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Path of the reference server snapshot (defaults to data_dir/server.json)
    #[serde(default)]
    pub server_path: Option<PathBuf>,

    /// Cached server credential
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Whether row attachments are pushed during sync
    #[serde(default)]
    pub push_attachments: bool,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server_path: None,
            auth_token: None,
            push_attachments: false,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TABLESYNC_DATA_DIR, TABLESYNC_SERVER_PATH, ...)
    /// 2. Config file (~/.config/tablesync/config.toml or TABLESYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from `--config` if given, otherwise the default location
    pub fn load_with_cli_override(config_path: Option<&PathBuf>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SERVER_PATH", ENV_PREFIX)) {
            self.server_path = if val.is_empty() { None } else { Some(PathBuf::from(val)) };
        }

        if let Ok(val) = std::env::var(format!("{}_AUTH_TOKEN", ENV_PREFIX)) {
            self.auth_token = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_PUSH_ATTACHMENTS", ENV_PREFIX)) {
            self.push_attachments = parse_bool(&val);
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Set a single value by key, as used by `config set`
    ///
    /// An empty value clears optional settings.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "server_path" => self.server_path = non_empty(value).map(PathBuf::from),
            "auth_token" => self.auth_token = non_empty(value).map(str::to_string),
            "push_attachments" => self.push_attachments = parse_bool(value),
            "log_file" => self.log_file = non_empty(value).map(PathBuf::from),
            _ => bail!(
                "Unknown config key '{}'. Valid keys: data_dir, server_path, auth_token, push_attachments, log_file",
                key
            ),
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TABLESYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tablesync")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("tablesync.db")
    }

    /// Get the default path of the reference server snapshot
    pub fn default_server_path(&self) -> PathBuf {
        self.data_dir.join("server.json")
    }

    /// Get the reference server snapshot path in effect
    pub fn server_path(&self) -> PathBuf {
        self.server_path
            .clone()
            .unwrap_or_else(|| self.default_server_path())
    }
}

fn parse_bool(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

fn non_empty(val: &str) -> Option<&str> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tablesync")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::tempdir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "TABLESYNC_DATA_DIR",
        "TABLESYNC_SERVER_PATH",
        "TABLESYNC_AUTH_TOKEN",
        "TABLESYNC_PUSH_ATTACHMENTS",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.push_attachments);
        assert!(config.auth_token.is_none());
        assert!(config.server_path.is_none());
        assert!(config.data_dir.ends_with("tablesync"));
    }

    #[test]
    fn test_file_paths() {
        let mut config = Config::default();
        assert!(config.sqlite_path().ends_with("tablesync.db"));
        assert!(config.default_server_path().ends_with("server.json"));
        assert_eq!(config.server_path(), config.default_server_path());

        config.server_path = Some(PathBuf::from("/srv/snapshot.json"));
        assert_eq!(config.server_path(), PathBuf::from("/srv/snapshot.json"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TABLESYNC_DATA_DIR", "/tmp/tablesync-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/tablesync-test"));
    }

    #[test]
    fn test_env_override_push_attachments() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TABLESYNC_PUSH_ATTACHMENTS", "true");
        config.apply_env_overrides();
        assert!(config.push_attachments);

        env::set_var("TABLESYNC_PUSH_ATTACHMENTS", "0");
        config.apply_env_overrides();
        assert!(!config.push_attachments);
    }

    #[test]
    fn test_env_override_auth_token() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TABLESYNC_AUTH_TOKEN", "secret");
        config.apply_env_overrides();
        assert_eq!(config.auth_token.as_deref(), Some("secret"));

        // Empty string clears it
        env::set_var("TABLESYNC_AUTH_TOKEN", "");
        config.apply_env_overrides();
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_set_values() {
        let mut config = Config::default();

        config.set("push_attachments", "true").unwrap();
        assert!(config.push_attachments);

        config.set("server_path", "/srv/server.json").unwrap();
        assert_eq!(config.server_path, Some(PathBuf::from("/srv/server.json")));

        config.set("server_path", "").unwrap();
        assert!(config.server_path.is_none());

        assert!(config.set("sync_url", "ws://example.com").is_err());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            auth_token = "secret"
            push_attachments = true
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert!(config.push_attachments);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config {
            data_dir: dir.path().join("data"),
            server_path: None,
            auth_token: Some("secret".to_string()),
            push_attachments: true,
            log_file: Some(dir.path().join("tablesync.log")),
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.auth_token, config.auth_token);
        assert_eq!(loaded.log_file, config.log_file);
        assert!(loaded.data_dir.exists());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempdir().unwrap();
        env::set_var("TABLESYNC_DATA_DIR", dir.path().join("data"));

        let config = Config::load_from_path(&dir.path().join("missing.toml")).unwrap();
        assert!(!config.push_attachments);
        assert!(config.auth_token.is_none());
    }
}
