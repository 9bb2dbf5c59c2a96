use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SpeculaConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub lm: LmConfig,
    pub improver: ImproverConfig,
    pub approvals: ApprovalConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub store_path: String,
    pub awareness_path: String,
    pub schema_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LmConfig {
    /// Soft switch; the analyzer also disables itself when the endpoint is
    /// unreachable.
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ImproverConfig {
    pub tick_enabled: bool,
    pub tick_interval_ms: u64,
    pub tick_budget_ms: u64,
    pub deep_cache_ttl_ms: u64,
    pub pending_ttl_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApprovalConfig {
    pub auto_approve_low: bool,
    pub auto_approve_medium: bool,
    pub auto_approve_high: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7878,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_specula_dir();
        Self {
            store_path: dir.join("context.json").to_string_lossy().into_owned(),
            awareness_path: dir.join("awareness.json").to_string_lossy().into_owned(),
            schema_path: dir.join("schema.json").to_string_lossy().into_owned(),
        }
    }
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434".into(),
            model: "llama3.2".into(),
            timeout_ms: 10_000,
        }
    }
}

impl Default for ImproverConfig {
    fn default() -> Self {
        Self {
            tick_enabled: true,
            tick_interval_ms: 300_000,
            tick_budget_ms: 30_000,
            deep_cache_ttl_ms: 3_600_000,
            pending_ttl_ms: 604_800_000,
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            auto_approve_low: true,
            auto_approve_medium: false,
            auto_approve_high: false,
        }
    }
}

/// Returns `~/.specula/`
pub fn default_specula_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".specula")
}

/// Returns the default config file path: `~/.specula/config.toml`
pub fn default_config_path() -> PathBuf {
    default_specula_dir().join("config.toml")
}

impl SpeculaConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            SpeculaConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SPECULA_STORE") {
            self.storage.store_path = val;
        }
        if let Ok(val) = std::env::var("SPECULA_AWARENESS") {
            self.storage.awareness_path = val;
        }
        if let Ok(val) = std::env::var("SPECULA_SCHEMA") {
            self.storage.schema_path = val;
        }
        if let Ok(val) = std::env::var("SPECULA_LM_URL") {
            self.lm.base_url = val;
        }
        if let Ok(val) = std::env::var("SPECULA_LM_MODEL") {
            self.lm.model = val;
        }
        if let Ok(val) = std::env::var("SPECULA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("AUTO_APPROVE_LOW") {
            self.approvals.auto_approve_low = is_truthy(&val);
        }
        if let Ok(val) = std::env::var("AUTO_APPROVE_MEDIUM") {
            self.approvals.auto_approve_medium = is_truthy(&val);
        }
        if let Ok(val) = std::env::var("AUTO_APPROVE_HIGH") {
            self.approvals.auto_approve_high = is_truthy(&val);
        }
    }

    /// Resolve the store file path, expanding `~` if needed.
    pub fn resolved_store_path(&self) -> PathBuf {
        expand_tilde(&self.storage.store_path)
    }

    pub fn resolved_awareness_path(&self) -> PathBuf {
        expand_tilde(&self.storage.awareness_path)
    }

    pub fn resolved_schema_path(&self) -> PathBuf {
        expand_tilde(&self.storage.schema_path)
    }
}

fn is_truthy(val: &str) -> bool {
    matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
