//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - The first TOML file found in [`CONFIG_PATHS`]
//! - Environment variables (`PARLEY_PORT`, `PARLEY_AUTH__JWT_SECRET`, ...)

use anyhow::{bail, Context, Result};
use parley_core::{BrokerConfig, ConnectionConfig};
use parley_protocol::Encoding;
use parley_transport::WsOptions;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Files searched for configuration, in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Connection write and close deadlines.
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Handshake authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Persistence collaborator.
    #[serde(default)]
    pub persistence: CollaboratorConfig,

    /// Cross-process fan-out collaborator.
    #[serde(default)]
    pub fanout: CollaboratorConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Outbound frame encoding.
    #[serde(default)]
    pub encoding: Encoding,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Capacity of each connection's outbound mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Accepted messages buffered for the persistence and fan-out
    /// collaborators before new ones are dropped.
    #[serde(default = "default_collaborator_queue")]
    pub collaborator_queue: usize,
}

/// Heartbeat configuration.
///
/// An `interval_ms` of zero disables server pings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Read deadline in milliseconds; a silent peer is dropped after this.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Connection deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Deadline for a single transport write in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Time allowed for the closing handshake in milliseconds.
    #[serde(default = "default_close_grace")]
    pub close_grace_ms: u64,

    /// Time allowed at shutdown for queued collaborator work in milliseconds.
    #[serde(default = "default_shutdown_drain")]
    pub shutdown_drain_ms: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for HS256 tokens. Required to start the server.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Expected `iss` claim, if any.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Expected `aud` claim, if any.
    #[serde(default)]
    pub audience: Option<String>,

    /// Deadline for credential verification in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Webhook collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// Endpoint receiving accepted messages. Disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Request timeout in milliseconds.
    #[serde(default = "default_collaborator_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_rooms() -> usize {
    100_000
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_collaborator_queue() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_close_grace() -> u64 {
    5_000
}

fn default_shutdown_drain() -> u64 {
    5_000
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_collaborator_timeout() -> u64 {
    2_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connection: ConnectionSettings::default(),
            auth: AuthConfig::default(),
            persistence: CollaboratorConfig::default(),
            fanout: CollaboratorConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            encoding: Encoding::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rooms: default_max_rooms(),
            mailbox_capacity: default_mailbox_capacity(),
            max_message_size: default_max_message_size(),
            collaborator_queue: default_collaborator_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout(),
            close_grace_ms: default_close_grace(),
            shutdown_drain_ms: default_shutdown_drain(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: None,
            audience: None,
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_collaborator_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first file found, then the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// an environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(config::File::new(
                    expanded.as_ref(),
                    config::FileFormat::Toml,
                ));
                break;
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("limits.mailbox_capacity", self.limits.mailbox_capacity == 0),
            ("limits.max_message_size", self.limits.max_message_size == 0),
            ("limits.collaborator_queue", self.limits.collaborator_queue == 0),
            ("heartbeat.timeout_ms", self.heartbeat.timeout_ms == 0),
            ("connection.write_timeout_ms", self.connection.write_timeout_ms == 0),
            ("auth.handshake_timeout_ms", self.auth.handshake_timeout_ms == 0),
            ("persistence.timeout_ms", self.persistence.timeout_ms == 0),
            ("fanout.timeout_ms", self.fanout.timeout_ms == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            bail!("{} must be greater than zero", name);
        }

        // Pings are what keep an idle peer inside its read deadline
        if self.heartbeat.interval_ms != 0 && self.heartbeat.interval_ms >= self.heartbeat.timeout_ms
        {
            bail!(
                "heartbeat.interval_ms ({}) must be less than heartbeat.timeout_ms ({})",
                self.heartbeat.interval_ms,
                self.heartbeat.timeout_ms
            );
        }

        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Broker settings.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_rooms: self.limits.max_rooms,
            collaborator_queue: self.limits.collaborator_queue,
            collaborator_drain: Duration::from_millis(self.connection.shutdown_drain_ms),
        }
    }

    /// Per-connection settings.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            mailbox_capacity: self.limits.mailbox_capacity,
            max_message_size: self.limits.max_message_size,
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            write_timeout: Duration::from_millis(self.connection.write_timeout_ms),
            close_grace: Duration::from_millis(self.connection.close_grace_ms),
        }
    }

    /// WebSocket adapter settings.
    #[must_use]
    pub fn ws_options(&self) -> WsOptions {
        WsOptions {
            encoding: self.transport.encoding,
            // Leave room for the JSON envelope around the content
            max_message_size: self.limits.max_message_size + 1024,
            read_timeout: Some(Duration::from_millis(self.heartbeat.timeout_ms)),
        }
    }

    /// Deadline for handshake authentication.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.handshake_timeout_ms)
    }
}
