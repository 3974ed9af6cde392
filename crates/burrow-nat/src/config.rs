//! Traversal configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_stun::turn::{
    DEFAULT_LIFETIME, DEFAULT_PERMISSION_LIFETIME, DEFAULT_PERMISSION_TIMEOUT, MAX_LIFETIME,
    MIN_LIFETIME, MIN_SWEEP_INTERVAL, TurnOptions, TurnServer,
};
use serde::{Deserialize, Serialize};

use crate::method::ConnectionMethod;
use crate::registry::RegistryPolicy;
use crate::request::{
    DEFAULT_METHOD_TIMEOUT, DEFAULT_OVERALL_TIMEOUT, PeerAddress, TransportPreference,
};
use crate::signaling::DEFAULT_RECENCY;

/// Traversal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalConfig {
    /// Methods to try, in priority order
    #[serde(default = "default_methods")]
    pub methods: Vec<ConnectionMethod>,
    /// Bound on each method attempt
    #[serde(default = "default_method_timeout", with = "secs")]
    pub method_timeout: Duration,
    /// Bound on a whole `connect` call
    #[serde(default = "default_overall_timeout", with = "secs")]
    pub overall_timeout: Duration,
    /// Stop at the first failing method
    #[serde(default)]
    pub fail_fast: bool,
    /// Local ports to try; empty means ephemeral
    #[serde(default)]
    pub local_ports: Vec<u16>,
    /// Transport preference
    #[serde(default)]
    pub transport: TransportPreference,
    /// STUN servers
    #[serde(default)]
    pub stun_servers: Vec<PeerAddress>,
    /// TURN servers
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
    /// TURN session tuning
    #[serde(default)]
    pub turn: TurnConfig,
    /// Method registry
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Signaling
    #[serde(default)]
    pub signaling: SignalingConfig,
    /// Gateway port mapping
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// TURN session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Requested allocation lifetime
    #[serde(default = "default_turn_lifetime", with = "secs")]
    pub lifetime: Duration,
    /// Permission lifetime
    #[serde(default = "default_permission_lifetime", with = "secs")]
    pub permission_lifetime: Duration,
    /// CreatePermission timeout
    #[serde(default = "default_permission_timeout", with = "secs")]
    pub permission_timeout: Duration,
    /// Permission sweep interval
    #[serde(default = "default_sweep_interval", with = "secs")]
    pub sweep_interval: Duration,
    /// Request timeout
    #[serde(default = "default_request_timeout", with = "secs")]
    pub request_timeout: Duration,
    /// Append FINGERPRINT to requests
    #[serde(default = "default_true")]
    pub fingerprint: bool,
    /// Event queue capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// JSON file to persist the registry in; in-memory when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Staleness policy
    #[serde(flatten)]
    pub policy: RegistryPolicy,
}

/// Signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Ignore messages older than this
    #[serde(default = "default_recency", with = "secs")]
    pub recency: Duration,
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Requested mapping lifetime
    #[serde(default = "default_mapping_lifetime", with = "secs")]
    pub lifetime: Duration,
    /// Mapping description (UPnP)
    #[serde(default = "default_mapping_description")]
    pub description: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or env-filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_methods() -> Vec<ConnectionMethod> {
    ConnectionMethod::DEFAULT_ORDER.to_vec()
}

fn default_method_timeout() -> Duration {
    DEFAULT_METHOD_TIMEOUT
}

fn default_overall_timeout() -> Duration {
    DEFAULT_OVERALL_TIMEOUT
}

fn default_turn_lifetime() -> Duration {
    DEFAULT_LIFETIME
}

fn default_permission_lifetime() -> Duration {
    DEFAULT_PERMISSION_LIFETIME
}

fn default_permission_timeout() -> Duration {
    DEFAULT_PERMISSION_TIMEOUT
}

fn default_sweep_interval() -> Duration {
    MIN_SWEEP_INTERVAL
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    256
}

fn default_recency() -> Duration {
    DEFAULT_RECENCY
}

fn default_mapping_lifetime() -> Duration {
    Duration::from_secs(3600)
}

fn default_mapping_description() -> String {
    "burrow".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            methods: default_methods(),
            method_timeout: default_method_timeout(),
            overall_timeout: default_overall_timeout(),
            fail_fast: false,
            local_ports: Vec::new(),
            transport: TransportPreference::default(),
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            turn: TurnConfig::default(),
            registry: RegistryConfig::default(),
            signaling: SignalingConfig::default(),
            gateway: GatewayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            lifetime: default_turn_lifetime(),
            permission_lifetime: default_permission_lifetime(),
            permission_timeout: default_permission_timeout(),
            sweep_interval: default_sweep_interval(),
            request_timeout: default_request_timeout(),
            fingerprint: true,
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            recency: default_recency(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            lifetime: default_mapping_lifetime(),
            description: default_mapping_description(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TurnConfig {
    /// Session options for the TURN client
    #[must_use]
    pub fn options(&self) -> TurnOptions {
        TurnOptions {
            lifetime: self.lifetime,
            permission_lifetime: self.permission_lifetime,
            permission_timeout: self.permission_timeout,
            request_timeout: self.request_timeout,
            sweep_interval: self.sweep_interval,
            fingerprint: self.fingerprint,
            event_capacity: self.event_capacity,
            ..TurnOptions::default()
        }
    }
}

impl TraversalConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.methods.is_empty() {
            anyhow::bail!("At least one connection method must be configured");
        }
        for (i, method) in self.methods.iter().enumerate() {
            if self.methods[..i].contains(method) {
                anyhow::bail!("Connection method {method} listed twice");
            }
        }

        if self.method_timeout.is_zero() || self.overall_timeout.is_zero() {
            anyhow::bail!("Timeouts must be non-zero");
        }
        if self.method_timeout > self.overall_timeout {
            anyhow::bail!(
                "Method timeout ({:?}) exceeds overall timeout ({:?})",
                self.method_timeout,
                self.overall_timeout
            );
        }

        for server in &self.stun_servers {
            server
                .validate("stun_servers")
                .map_err(|e| anyhow::anyhow!("STUN server {server}: {e}"))?;
        }
        for server in &self.turn_servers {
            PeerAddress::new(server.host.clone(), server.port)
                .validate("turn_servers")
                .map_err(|e| anyhow::anyhow!("TURN server {}: {e}", server.host))?;
            if server.username.is_empty() {
                anyhow::bail!("TURN server {} has no username", server.host);
            }
        }

        if !(MIN_LIFETIME..=MAX_LIFETIME).contains(&self.turn.lifetime) {
            anyhow::bail!(
                "TURN lifetime must be between {}s and {}s",
                MIN_LIFETIME.as_secs(),
                MAX_LIFETIME.as_secs()
            );
        }
        if self.turn.sweep_interval < MIN_SWEEP_INTERVAL {
            anyhow::bail!(
                "TURN sweep interval must be at least {}s",
                MIN_SWEEP_INTERVAL.as_secs()
            );
        }
        if self.turn.permission_lifetime.is_zero()
            || self.turn.permission_timeout.is_zero()
            || self.turn.request_timeout.is_zero()
        {
            anyhow::bail!("TURN timeouts and lifetimes must be non-zero");
        }
        if self.turn.event_capacity == 0 {
            anyhow::bail!("TURN event capacity must be non-zero");
        }

        if self.signaling.recency.is_zero() {
            anyhow::bail!("Signaling recency window must be non-zero");
        }
        if self.gateway.lifetime.is_zero() || self.gateway.lifetime.as_secs() > u64::from(u32::MAX)
        {
            anyhow::bail!("Gateway mapping lifetime out of range");
        }

        tracing_subscriber::EnvFilter::try_new(&self.logging.level)
            .map_err(|e| anyhow::anyhow!("Invalid log level {}: {e}", self.logging.level))?;

        Ok(())
    }
}

/// Install a global `tracing` subscriber filtered by `level`
///
/// `RUST_LOG` takes precedence when set. Returns `false` if a subscriber was
/// already installed.
pub fn init_logging(level: &str) -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// `Duration` as whole seconds
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// `Option<Duration>` as whole seconds
pub(crate) mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_secs))
    }
}
