use std::{net::SocketAddr, str::FromStr};

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid token ttl: {0}")]
    InvalidTtl(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Signing keys and validity windows for the three token kinds. Keys are
/// base64url 32-byte Ed25519 seeds; a missing key means "generate an
/// ephemeral one at startup".
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub register_signing_key: Option<String>,
    pub access_signing_key: Option<String>,
    pub refresh_signing_key: Option<String>,
    pub register_ttl_secs: i64,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            register_signing_key: None,
            access_signing_key: None,
            refresh_signing_key: None,
            register_ttl_secs: 600,
            access_ttl_secs: 1800,
            refresh_ttl_secs: 1_209_600,
        }
    }
}

impl AuthConfig {
    pub fn configured_key_count(&self) -> usize {
        [
            &self.register_signing_key,
            &self.access_signing_key,
            &self.refresh_signing_key,
        ]
        .iter()
        .filter(|key| key.is_some())
        .count()
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
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            auth: AuthConfig::default(),
        }
    }
}

/// Command-line flag values layered on top of file + environment
/// configuration.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub database_url: Option<String>,
    pub register_signing_key: Option<String>,
    pub access_signing_key: Option<String>,
    pub refresh_signing_key: Option<String>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "DEALBOARD_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(CliOverrides::default())
    }

    pub fn load_with(overrides: CliOverrides) -> Result<Self, ConfigError> {
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
            .set_default("auth.register_ttl_secs", defaults.auth.register_ttl_secs)?
            .set_default("auth.access_ttl_secs", defaults.auth.access_ttl_secs)?
            .set_default("auth.refresh_ttl_secs", defaults.auth.refresh_ttl_secs)?;

        let mut settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.apply(overrides);
        settings.validate()?;
        Ok(settings)
    }

    fn apply(&mut self, overrides: CliOverrides) {
        if overrides.bind_addr.is_some() {
            self.bind_addr = overrides.bind_addr;
        }
        if let Some(host) = overrides.host {
            self.host = host;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if overrides.database_url.is_some() {
            self.database_url = overrides.database_url;
        }
        if overrides.register_signing_key.is_some() {
            self.auth.register_signing_key = overrides.register_signing_key;
        }
        if overrides.access_signing_key.is_some() {
            self.auth.access_signing_key = overrides.access_signing_key;
        }
        if overrides.refresh_signing_key.is_some() {
            self.auth.refresh_signing_key = overrides.refresh_signing_key;
        }
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
        for (name, value) in [
            ("auth.register_ttl_secs", self.auth.register_ttl_secs),
            ("auth.access_ttl_secs", self.auth.access_ttl_secs),
            ("auth.refresh_ttl_secs", self.auth.refresh_ttl_secs),
        ] {
            if value <= 0 {
                return Err(ConfigError::InvalidTtl(format!(
                    "{name} must be positive, got {value}"
                )));
            }
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
