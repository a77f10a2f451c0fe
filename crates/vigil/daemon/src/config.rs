//! Configuration for vigil-daemon

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_control::ManagerConfig;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Engine configuration
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Desired-state source
    #[serde(default)]
    pub bulk: BulkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Run the engine on virtual time driven by advance-time messages
    #[serde(default)]
    pub virtual_time: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Upper bound on bus requests issued through the API, in milliseconds
    #[serde(default = "default_bus_request_timeout")]
    pub bus_request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            enable_cors: true,
            bus_request_timeout_ms: default_bus_request_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn bus_request_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_request_timeout_ms)
    }
}

/// Static credentials for the bulk API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkCredentials {
    pub user: String,
    pub password: String,
}

/// Bulk desired-state API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Base URL of the bulk API. Without it desired state is always empty.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Droplets requested per page
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Credentials used instead of asking over the bus
    #[serde(default)]
    pub credentials: Option<BulkCredentials>,

    /// How long to wait for a credentials reply, in seconds
    #[serde(default = "default_credentials_timeout")]
    pub credentials_timeout_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            batch_size: default_batch_size(),
            credentials: None,
            credentials_timeout_secs: default_credentials_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl BulkConfig {
    pub fn credentials_timeout(&self) -> Duration {
        Duration::from_secs(self.credentials_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_bus_request_timeout() -> u64 {
    2_000
}

fn default_batch_size() -> u32 {
    500
}

fn default_credentials_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then `VIGIL_*`
    /// environment variables (`VIGIL_BULK__API_URL`, `VIGIL_VIRTUAL_TIME`, ...).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("VIGIL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
