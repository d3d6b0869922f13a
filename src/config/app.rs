//! Agent configuration structures.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use super::validation::{ConfigError, expand_env_vars};
use crate::collector::listen::ListenAddress;

// =============================================================================
// Constants
// =============================================================================

/// Default tick interval (10 seconds).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Default shared measurement queue capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Default maximum number of measurements per HTTP batch.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Default time a partial batch may wait for more measurements.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(500);

/// Default connect / response-header timeout for delivery requests.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default listener address.
pub const DEFAULT_LISTEN_ADDRESS: &str = "unix,/tmp/vigil.sock";

/// Default metrics API endpoint.
pub const DEFAULT_HTTP_URL: &str = "https://metrics-api.librato.com/v1/metrics";

fn default_collectors() -> Vec<String> {
    ["listen", "load", "self"].map(String::from).to_vec()
}

// =============================================================================
// Output selection
// =============================================================================

/// Which outputter drains the shared queue.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OutputKind {
    /// l2met lines on stdout, counters converted to per-tick deltas.
    #[default]
    StdoutDerived,
    /// l2met lines on stdout, values as collected.
    StdoutRaw,
    /// Batched JSON POSTs to a metrics API.
    Http,
}

// =============================================================================
// Listener Configuration
// =============================================================================

/// Ingestion listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// `<transport>,<address>` (default: "unix,/tmp/vigil.sock").
    pub address: String,

    /// Report listener counters on every tick.
    pub meta: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_LISTEN_ADDRESS.to_string(),
            meta: false,
        }
    }
}

// =============================================================================
// HTTP Output Configuration
// =============================================================================

/// HTTP delivery pipeline configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Metrics API endpoint. Userinfo in the URL is used as credentials
    /// unless `user`/`token` are set.
    pub url: String,

    /// Basic auth user.
    pub user: Option<String>,

    /// Basic auth password / API token.
    pub token: Option<String>,

    /// Maximum measurements per batch (default: 200).
    pub batch_size: usize,

    /// Maximum age of a partial batch, measured from its first measurement (default: 500ms).
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Connect and response-header timeout (default: 2s).
    #[serde(with = "humantime_serde")]
    pub network_timeout: Duration,

    /// Round measure times to the nearest tick interval.
    pub round: bool,

    /// Add per-batch gauge/counter counts to every payload.
    pub meta: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_HTTP_URL.to_string(),
            user: None,
            token: None,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            round: false,
            meta: false,
        }
    }
}

impl std::fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("batch_size", &self.batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .field("network_timeout", &self.network_timeout)
            .field("round", &self.round)
            .field("meta", &self.meta)
            .finish()
    }
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// Top-level agent configuration.
///
/// Every field has a default, so an empty file (or no file) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Tick interval; also the idle deadline of listener connections (default: 10s).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Collector names, in registration order.
    pub collectors: Vec<String>,

    /// Fail startup on unknown collector names instead of skipping them.
    pub strict_collectors: bool,

    /// Outputter draining the shared queue.
    pub output: OutputKind,

    /// Prepended to every metric name.
    pub prefix: Option<String>,

    /// Source attached to every delivered measurement.
    pub source: Option<String>,

    /// Shared measurement queue capacity (default: 100).
    pub channel_capacity: usize,

    /// Ingestion listener settings.
    pub listen: ListenConfig,

    /// HTTP outputter settings.
    pub http: HttpConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            collectors: default_collectors(),
            strict_collectors: false,
            output: OutputKind::default(),
            prefix: None,
            source: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            listen: ListenConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`AgentConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::read_or_default(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file without validating it.
    ///
    /// For callers that apply overrides before calling [`AgentConfig::validate`].
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            _ => ConfigError::IoError(e),
        })?;
        Self::parse_yaml(&content)
    }

    /// Like [`AgentConfig::read`], but a missing file yields the defaults.
    pub fn read_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::read(path) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_yaml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without validating it.
    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        // An empty document deserializes to unit, not to a map.
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "interval must be non-zero".to_string(),
            ));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel_capacity must be positive".to_string(),
            ));
        }

        if self.collectors.iter().any(|name| name == "listen") {
            self.listen
                .address
                .parse::<ListenAddress>()
                .map_err(|e| ConfigError::ValidationError(format!("listen.address: {e}")))?;
        }

        if self.output == OutputKind::Http {
            if self.http.batch_size == 0 {
                return Err(ConfigError::ValidationError(
                    "http.batch_size must be positive".to_string(),
                ));
            }
            if self.http.batch_timeout.is_zero() {
                return Err(ConfigError::ValidationError(
                    "http.batch_timeout must be non-zero".to_string(),
                ));
            }
            reqwest::Url::parse(&self.http.url)
                .map_err(|e| ConfigError::ValidationError(format!("http.url: {e}")))?;
        }

        Ok(())
    }
}
