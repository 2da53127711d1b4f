use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub sample_db: SampleDbConfig,

    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            vault: VaultConfig::default(),
            broker: BrokerConfig::default(),
            sample_db: SampleDbConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

/// Control-plane metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file. Resolved against the config dir when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: default_pool_size(),
            operation_timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// URL-safe base64 encoded 256-bit key. When absent an ephemeral key is
    /// generated at startup and everything encrypted with it is lost on restart.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_timeout_secs(),
        }
    }
}

/// Secret material consumed by seed migrations.
#[derive(Clone, Serialize, Deserialize)]
pub struct SampleDbConfig {
    #[serde(default = "default_sample_password")]
    pub password: String,
}

impl Default for SampleDbConfig {
    fn default() -> Self {
        Self {
            password: default_sample_password(),
        }
    }
}

impl std::fmt::Debug for SampleDbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleDbConfig")
            .field("password", &"<redacted>")
            .finish()
    }
}

fn default_pool_size() -> u32 {
    8
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_sample_password() -> String {
    "postgres".to_string()
}
