use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use canopy_core::TenantId;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub tenant: TenantConfig,
    pub engine: EngineConfigValues,
    pub sweep: SweepConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

/// The tenant the HTTP API serves.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfigValues {
    pub verify_actor: bool,
    pub ancestor_fallback: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/canopy".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            id: "00000000-0000-0000-0000-000000000000".to_string(),
            name: "default".to_string(),
        }
    }
}

impl Default for EngineConfigValues {
    fn default() -> Self {
        Self {
            verify_actor: true,
            ancestor_fallback: true,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CANOPY_HTTP_HOST") {
            self.http.host = v;
        }
        if let Ok(v) = std::env::var("CANOPY_HTTP_PORT")
            && let Ok(port) = v.parse()
        {
            self.http.port = port;
        }
        if let Ok(v) = std::env::var("CANOPY_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("CANOPY_DATABASE_MAX_CONNECTIONS")
            && let Ok(n) = v.parse()
        {
            self.database.max_connections = n;
        }
        if let Ok(v) = std::env::var("CANOPY_STORAGE_BACKEND") {
            match v.as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "postgres" => self.storage.backend = StorageBackend::Postgres,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("CANOPY_TENANT_ID") {
            self.tenant.id = v;
        }
        if let Ok(v) = std::env::var("CANOPY_SWEEP_ENABLED")
            && let Ok(enabled) = v.parse()
        {
            self.sweep.enabled = enabled;
        }
        if let Ok(v) = std::env::var("CANOPY_SWEEP_INTERVAL_SECS")
            && let Ok(n) = v.parse()
        {
            self.sweep.interval_secs = n;
        }
        if let Ok(v) = std::env::var("CANOPY_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("CANOPY_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.http.port == 0 {
            return Err(ConfigError::Validation(
                "http.port must be non-zero".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be non-zero".to_string(),
            ));
        }
        if self.sweep.enabled && self.sweep.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sweep.interval_secs must be non-zero when the sweep is enabled".to_string(),
            ));
        }
        self.tenant_id()?;
        Ok(())
    }

    pub fn tenant_id(&self) -> Result<TenantId, ConfigError> {
        uuid::Uuid::parse_str(&self.tenant.id)
            .map(TenantId::new)
            .map_err(|e| ConfigError::Validation(format!("tenant.id is not a UUID: {e}")))
    }

    pub fn to_engine_config(&self) -> canopy_core::engine::EngineConfig {
        canopy_core::engine::EngineConfig {
            verify_actor: self.engine.verify_actor,
            ancestor_fallback: self.engine.ancestor_fallback,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_secs)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}
