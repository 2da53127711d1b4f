use std::path::{Path, PathBuf};

use trove_common::{Error, Result};
use tracing::info;

use crate::model::AppConfig;

pub const ENV_DB_PATH: &str = "TROVE_DB_PATH";
pub const ENV_ENCRYPTION_KEY: &str = "TROVE_ENCRYPTION_KEY";
pub const ENV_SAMPLE_DB_PASSWORD: &str = "SAMPLE_DB_PASSWORD";
pub const ENV_LOG_LEVEL: &str = "TROVE_LOG_LEVEL";

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Result<Self> {
        let config_dir = Self::default_config_dir();
        Ok(Self { config_dir })
    }

    pub fn default_config_dir() -> PathBuf {
        let home_config = dirs::home_dir().map(|h| h.join(".trove"));
        let xdg_config = dirs::config_dir().map(|c| c.join("trove"));

        match (xdg_config, home_config) {
            (Some(xdg), Some(home)) => {
                // Existing home dir wins only when XDG has not been created yet.
                if !xdg.exists() && home.exists() {
                    home
                } else {
                    xdg
                }
            }
            (Some(xdg), None) => xdg,
            (None, Some(home)) => home,
            (None, None) => PathBuf::from(".trove"),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load the config file, then apply `.env` and process environment overrides.
    pub fn load(&self) -> Result<AppConfig> {
        if let Ok(path) = dotenvy::dotenv() {
            info!("loaded environment from {}", path.display());
        }
        let config = self.load_file()?;
        Ok(apply_overrides(config, |key| std::env::var(key).ok()))
    }

    /// Load only the on-disk config, YAML preferred over TOML.
    pub fn load_file(&self) -> Result<AppConfig> {
        let yaml_path = self.config_dir.join("config.yml");
        let toml_path = self.config_dir.join("config.toml");

        if yaml_path.exists() {
            info!("loading config from {}", yaml_path.display());
            let contents = std::fs::read_to_string(&yaml_path)?;
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}")))
        } else if toml_path.exists() {
            info!("loading config from {}", toml_path.display());
            let contents = std::fs::read_to_string(&toml_path)?;
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))
        } else {
            info!("no config file found, using defaults");
            Ok(AppConfig::default())
        }
    }

    /// Path of the metadata store, falling back to `<config dir>/data/trove.db`.
    pub fn store_path(&self, config: &AppConfig) -> PathBuf {
        config
            .store
            .path
            .clone()
            .unwrap_or_else(|| self.config_dir.join("data").join("trove.db"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [self.config_dir.clone(), self.config_dir.join("data")];

        for dir in &dirs {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        Ok(())
    }
}

/// Overlay environment values on top of a loaded config. Empty values are ignored.
pub fn apply_overrides(
    mut config: AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> AppConfig {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(path) = get(ENV_DB_PATH) {
        config.store.path = Some(PathBuf::from(path));
    }
    if let Some(key) = get(ENV_ENCRYPTION_KEY) {
        config.vault.encryption_key = Some(key);
    }
    if let Some(password) = get(ENV_SAMPLE_DB_PASSWORD) {
        config.sample_db.password = password;
    }
    if let Some(level) = get(ENV_LOG_LEVEL) {
        config.log_level = Some(level);
    }
    config
}
