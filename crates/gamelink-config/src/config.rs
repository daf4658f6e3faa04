//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level client networking configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Backend server address lists.
    pub servers: ServerConfig,
    /// Reconnect, disconnect and keep-alive policy.
    pub connection: ConnectionConfig,
    /// Transaction timeouts and dispatcher pacing.
    pub transactions: TransactionConfig,
    /// Build identity sent in every connection preamble.
    pub product: ProductConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Candidate server addresses, one list per backend protocol.
///
/// Entries are either numeric (`"10.0.0.4"`, `"10.0.0.4:14617"`) or host
/// names that are resolved asynchronously when the protocol is initialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Authentication servers.
    pub auth: Vec<String>,
    /// Game/world servers.
    pub game: Vec<String>,
    /// File delivery servers.
    pub file: Vec<String>,
    /// CSR/support servers.
    pub csr: Vec<String>,
    /// Gatekeeper (routing) servers.
    pub gatekeeper: Vec<String>,
    /// Port used for entries that do not carry one.
    pub port: u16,
}

/// Connection manager policy. All durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Smallest delay between two automatic connect attempts.
    pub min_reconnect_interval_ms: u64,
    /// Cap on the exponential reconnect delay.
    pub max_reconnect_interval_ms: u64,
    /// Immediate disconnects tolerated before giving up on a protocol.
    pub max_immediate_disconnects: u32,
    /// Consecutive failed connects tolerated before giving up on a protocol.
    pub max_failed_connects: u32,
    /// A connection that stayed up this long counts as valid even without traffic.
    pub min_valid_connection_ms: u64,
    /// Silence from the server after which a disconnect is treated as final.
    pub disconnected_timeout_ms: u64,
    /// Send keep-alive pings on every new connection.
    pub ping_enabled: bool,
    /// Keep-alive ping interval.
    pub ping_interval_ms: u64,
    /// No reply within this window tears the connection down.
    pub ping_timeout_ms: u64,
}

/// Transaction engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransactionConfig {
    /// Deadline applied to transactions submitted without an explicit one.
    pub default_timeout_ms: u64,
    /// Interval between two dispatcher ticks.
    pub tick_interval_ms: u64,
}

/// Build identity advertised to every server in the connection preamble.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProductConfig {
    /// Build number.
    pub build_id: u32,
    /// Build flavour (e.g. 50 = live, 10 = dev).
    pub build_type: u32,
    /// Branch identifier.
    pub branch_id: u32,
    /// Product UUID in hyphenated form.
    pub product_uuid: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write JSON log files in addition to console output.
    pub file_logging: bool,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            auth: Vec::new(),
            game: Vec::new(),
            file: Vec::new(),
            csr: Vec::new(),
            gatekeeper: vec!["127.0.0.1".to_string()],
            port: 14617,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            min_reconnect_interval_ms: 500,
            max_reconnect_interval_ms: 5_000,
            max_immediate_disconnects: 5,
            max_failed_connects: 5,
            min_valid_connection_ms: 25_000,
            disconnected_timeout_ms: 30_000,
            ping_enabled: true,
            ping_interval_ms: 30_000,
            ping_timeout_ms: 300_000,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            tick_interval_ms: 10,
        }
    }
}

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            build_id: 918,
            build_type: 50,
            branch_id: 1,
            product_uuid: "ea489821-6c35-4bd0-9dae-bb17c585e680".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            file_logging: false,
        }
    }
}

impl ServerConfig {
    /// Return `true` if no protocol has a configured address.
    pub fn is_empty(&self) -> bool {
        self.auth.is_empty()
            && self.game.is_empty()
            && self.file.is_empty()
            && self.csr.is_empty()
            && self.gatekeeper.is_empty()
    }
}

// --- Validation ---

impl Config {
    /// Reject combinations the connection manager cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;
        if conn.min_reconnect_interval_ms > conn.max_reconnect_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "connection.min_reconnect_interval_ms",
                reason: "must not exceed max_reconnect_interval_ms".to_string(),
            });
        }
        if conn.ping_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connection.ping_interval_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        if conn.ping_timeout_ms < conn.ping_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "connection.ping_timeout_ms",
                reason: format!(
                    "{} is shorter than the ping interval {}",
                    conn.ping_timeout_ms, conn.ping_interval_ms
                ),
            });
        }
        if conn.max_failed_connects == 0 || conn.max_immediate_disconnects == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connection.max_failed_connects",
                reason: "disconnect and connect ceilings must be at least 1".to_string(),
            });
        }
        if self.transactions.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transactions.tick_interval_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.product.product_uuid.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "product.product_uuid",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
