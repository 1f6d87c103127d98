//! Application configuration management.
//!
//! Configuration is layered with the `config` crate, later layers winning:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. TOML file (optional): `$CARDRELAY_CONFIG`, else
//!    `/etc/cardrelay/config.toml` on Linux or the platform config directory
//! 3. Environment variables `CARDRELAY__<SECTION>__<KEY>`, for example
//!    `CARDRELAY__DELIVERY__MAX_ATTEMPTS=5`
//!
//! ```toml
//! [activation]
//! scheme = "cardrelay"
//! host = "scan"
//!
//! [session]
//! timeout_ms = 5000
//! poll_interval_ms = 250
//! expected_technology = "felica"   # or "any"
//!
//! [delivery]
//! endpoint = "https://attendance.example.com/api/scans"
//! max_attempts = 3
//! base_delay_ms = 1000
//! max_delay_ms = 8000
//! request_timeout_ms = 10000
//!
//! [server]
//! bind_address = "127.0.0.1:3917"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::types::CardTechnology;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "CARDRELAY_CONFIG";

/// Prefix of configuration override variables.
pub const ENV_PREFIX: &str = "CARDRELAY";

/// Bounds for `session.timeout_ms`.
pub const SESSION_TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u64> = 500..=60_000;

/// Bounds for `delivery.max_attempts`.
pub const MAX_ATTEMPTS_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

/// RFC 3986 scheme, restricted to lowercase.
static SCHEME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9+.\-]*$").expect("scheme regex should compile"));

/// Errors loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration directory could be determined for this platform.
    #[error("Cannot determine configuration directory")]
    NoConfigDir,

    /// The file could not be read.
    #[error("Failed to read config file {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("Failed to write config file {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A layer could not be parsed or merged.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field is invalid.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong.
        message: String,
    },

    /// Several fields are invalid.
    #[error("Configuration has {} problems: {}", .0.len(), join_errors(.0))]
    MultipleValidationErrors(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Accepted activation URIs.
    pub activation: ActivationConfig,
    /// Scan session timing and card policy.
    pub session: SessionConfig,
    /// Backend delivery.
    pub delivery: DeliveryConfig,
    /// Local HTTP server.
    pub server: ServerConfig,
    /// Persistent data.
    pub storage: StorageConfig,
}

/// `[activation]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// URI scheme, lowercase.
    pub scheme: String,
    /// URI host.
    pub host: String,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            scheme: "cardrelay".into(),
            host: "scan".into(),
        }
    }
}

/// `[session]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline for one scan, from entry to polling.
    pub timeout_ms: u64,
    /// Reader polling interval (PC/SC backend).
    pub poll_interval_ms: u64,
    /// Which card technology is read.
    pub expected_technology: TechnologyFilter,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            poll_interval_ms: 250,
            expected_technology: TechnologyFilter::Only(CardTechnology::Felica),
        }
    }
}

/// Card technology accepted by a session.
///
/// Written as `"any"` or a technology prefix such as `"felica"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TechnologyFilter {
    /// Every card is read.
    Any,
    /// Only cards of this technology are read.
    Only(CardTechnology),
}

impl TechnologyFilter {
    const ANY: &'static str = "any";

    const TECHNOLOGIES: [CardTechnology; 5] = [
        CardTechnology::Felica,
        CardTechnology::Iso14443a,
        CardTechnology::Iso14443b,
        CardTechnology::Iso15693,
        CardTechnology::Unknown,
    ];

    /// The required technology, or `None` for [`TechnologyFilter::Any`].
    #[must_use]
    pub const fn technology(self) -> Option<CardTechnology> {
        match self {
            Self::Any => None,
            Self::Only(technology) => Some(technology),
        }
    }
}

impl TryFrom<String> for TechnologyFilter {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_ascii_lowercase();
        if value == Self::ANY {
            return Ok(Self::Any);
        }
        Self::TECHNOLOGIES
            .into_iter()
            .find(|technology| technology.prefix() == value)
            .map(Self::Only)
            .ok_or_else(|| format!("unknown card technology '{value}'"))
    }
}

impl From<TechnologyFilter> for String {
    fn from(filter: TechnologyFilter) -> Self {
        match filter {
            TechnologyFilter::Any => TechnologyFilter::ANY.to_string(),
            TechnologyFilter::Only(technology) => technology.prefix().to_string(),
        }
    }
}

/// `[delivery]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Backend URL receiving outcomes.
    pub endpoint: String,
    /// Total attempts per outcome.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Cap on any retry delay.
    pub max_delay_ms: u64,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/api/scans".into(),
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            request_timeout_ms: 10_000,
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3917".into(),
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Defaults to the platform location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default locations and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be parsed or the result is
    /// invalid.
    pub fn load() -> ConfigResult<Self> {
        let path = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => PathBuf::from(path),
            None => Self::default_path()?,
        };
        Self::load_from(&path)
    }

    /// Load configuration with `path` as the file layer.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be parsed or the result is
    /// invalid.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        let file = match std::fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(ConfigError::ReadError {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        debug!(path = %path.display(), found = file.is_some(), "Loading configuration");

        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?);
        if let Some(content) = file {
            builder = builder.add_source(::config::File::from_str(
                &content,
                ::config::FileFormat::Toml,
            ));
        }
        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default configuration file location.
    ///
    /// On Linux: `/etc/cardrelay/config.toml`.
    /// Elsewhere: the platform configuration directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] if no home directory is known.
    pub fn default_path() -> ConfigResult<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/cardrelay/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "cardrelay")
                .ok_or(ConfigError::NoConfigDir)?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }

    /// Check every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for one problem and
    /// [`ConfigError::MultipleValidationErrors`] for several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &'static str, message: String| {
            errors.push(ConfigError::ValidationError { field, message });
        };

        if !SCHEME_REGEX.is_match(&self.activation.scheme) {
            invalid(
                "activation.scheme",
                format!(
                    "'{}' is not a lowercase URI scheme",
                    self.activation.scheme
                ),
            );
        }
        if self.activation.host.trim().is_empty() {
            invalid("activation.host", "must not be empty".into());
        }

        if !SESSION_TIMEOUT_RANGE_MS.contains(&self.session.timeout_ms) {
            invalid(
                "session.timeout_ms",
                format!(
                    "{} is outside {}..={}",
                    self.session.timeout_ms,
                    SESSION_TIMEOUT_RANGE_MS.start(),
                    SESSION_TIMEOUT_RANGE_MS.end()
                ),
            );
        }
        if self.session.poll_interval_ms == 0 {
            invalid("session.poll_interval_ms", "must be positive".into());
        }

        if !MAX_ATTEMPTS_RANGE.contains(&self.delivery.max_attempts) {
            invalid(
                "delivery.max_attempts",
                format!(
                    "{} is outside {}..={}",
                    self.delivery.max_attempts,
                    MAX_ATTEMPTS_RANGE.start(),
                    MAX_ATTEMPTS_RANGE.end()
                ),
            );
        }
        if self.delivery.base_delay_ms > self.delivery.max_delay_ms {
            invalid(
                "delivery.base_delay_ms",
                format!(
                    "{} exceeds max_delay_ms ({})",
                    self.delivery.base_delay_ms, self.delivery.max_delay_ms
                ),
            );
        }
        if self.delivery.request_timeout_ms == 0 {
            invalid("delivery.request_timeout_ms", "must be positive".into());
        }
        match Url::parse(&self.delivery.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => invalid(
                "delivery.endpoint",
                format!("unsupported scheme '{}'", url.scheme()),
            ),
            Err(e) => invalid("delivery.endpoint", e.to_string()),
        }

        if let Err(e) = self.server.bind_address.parse::<SocketAddr>() {
            invalid("server.bind_address", e.to_string());
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}
