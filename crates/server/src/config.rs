use std::{env, net::SocketAddr, path::PathBuf, str::FromStr};

use nkata_media::BlobStoreConfig;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid configuration for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_requests_per_minute: u32,
    pub window_secs: u64,
    /// Idle time after which an identity's record is evicted.
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Key clients by `X-Real-IP`/`X-Forwarded-For` instead of the peer address.
    pub trust_proxy_headers: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 60,
            window_secs: 60,
            retention_secs: 300,
            sweep_interval_secs: 60,
            trust_proxy_headers: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// URL-safe base64 ed25519 seed. A key is generated per process when absent.
    pub signing_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MessagingConfig {
    pub max_sessions: usize,
    pub persistence_workers: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_sessions: 256,
            persistence_workers: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub metrics: MetricsConfig,
    pub admission: AdmissionConfig,
    pub media: BlobStoreConfig,
    pub auth: AuthConfig,
    pub messaging: MessagingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            metrics: MetricsConfig::default(),
            admission: AdmissionConfig::default(),
            media: BlobStoreConfig::default(),
            auth: AuthConfig::default(),
            messaging: MessagingConfig::default(),
        }
    }
}

/// Values supplied on the command line; each one wins over file and env.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub database_url: Option<String>,
    pub signing_key: Option<String>,
    pub max_requests_per_minute: Option<u32>,
    pub trust_proxy_headers: Option<bool>,
    pub media_storage_dir: Option<PathBuf>,
    pub media_public_base_url: Option<String>,
    pub max_sessions: Option<usize>,
    pub persistence_workers: Option<usize>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "NKATA_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?
            .set_default(
                "admission.max_requests_per_minute",
                defaults.admission.max_requests_per_minute as i64,
            )?
            .set_default("admission.window_secs", defaults.admission.window_secs as i64)?
            .set_default(
                "admission.retention_secs",
                defaults.admission.retention_secs as i64,
            )?
            .set_default(
                "admission.sweep_interval_secs",
                defaults.admission.sweep_interval_secs as i64,
            )?
            .set_default(
                "media.public_base_url",
                defaults.media.public_base_url.clone(),
            )?
            .set_default("media.max_blob_bytes", defaults.media.max_blob_bytes as i64)?
            .set_default(
                "messaging.max_sessions",
                defaults.messaging.max_sessions as i64,
            )?
            .set_default(
                "messaging.persistence_workers",
                defaults.messaging.persistence_workers as i64,
            )?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Configuration keys currently set through `NKATA_SERVER__*` variables.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = env::vars()
            .filter_map(|(name, _)| {
                name.strip_prefix(&prefix)
                    .map(|key| key.to_ascii_lowercase().replace("__", "."))
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(key) = &overrides.signing_key {
            self.auth.signing_key = Some(key.clone());
        }
        if let Some(max) = overrides.max_requests_per_minute {
            self.admission.max_requests_per_minute = max;
        }
        if let Some(trust) = overrides.trust_proxy_headers {
            self.admission.trust_proxy_headers = trust;
        }
        if let Some(dir) = &overrides.media_storage_dir {
            self.media.storage_dir = Some(dir.clone());
        }
        if let Some(url) = &overrides.media_public_base_url {
            self.media.public_base_url = url.clone();
        }
        if let Some(max) = overrides.max_sessions {
            self.messaging.max_sessions = max;
        }
        if let Some(workers) = overrides.persistence_workers {
            self.messaging.persistence_workers = workers;
        }

        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }

        let admission = &self.admission;
        if admission.max_requests_per_minute == 0 {
            return Err(ConfigError::invalid(
                "admission.max_requests_per_minute",
                "must be at least 1",
            ));
        }
        if admission.window_secs == 0 {
            return Err(ConfigError::invalid("admission.window_secs", "must be positive"));
        }
        if admission.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "admission.sweep_interval_secs",
                "must be positive",
            ));
        }
        if admission.retention_secs < admission.window_secs {
            return Err(ConfigError::invalid(
                "admission.retention_secs",
                "must not be shorter than admission.window_secs",
            ));
        }

        if let Some(url) = &self.database_url {
            nkata_storage::validate_database_url(url)
                .map_err(|err| ConfigError::invalid("database_url", err.to_string()))?;
        }

        nkata_media::validate_config(&self.media)
            .map_err(|err| ConfigError::invalid("media", err.to_string()))?;

        if self.messaging.max_sessions == 0 {
            return Err(ConfigError::invalid("messaging.max_sessions", "must be at least 1"));
        }
        if self.messaging.persistence_workers == 0 {
            return Err(ConfigError::invalid(
                "messaging.persistence_workers",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}
