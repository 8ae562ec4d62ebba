//! Configuration management using Figment
//!
//! Configuration lives in the `[audit_logs]` table and is loaded from the
//! following sources, highest precedence first:
//! 1. Environment variables (prefix: `AUDIT_LOGS_`, nesting: `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/audit-logs/{service_name}/config.toml
//! 4. System directory: /etc/audit-logs/{service_name}/config.toml
//! 5. Default values
//!
//! ```toml
//! [audit_logs]
//! masked_headers = ["authorization", "cookie"]
//!
//! [audit_logs.server]
//! endpoint = "http://audit-sink:8080/records"
//!
//! [audit_logs.clients]
//! endpoint = "http://audit-sink:8080/records"
//!
//! [audit_logs.client.billing]
//! enabled = false
//! ```
//!
//! The same override from the environment is
//! `AUDIT_LOGS_CLIENT__BILLING__ENABLED=false`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::policy::PolicyTable;
use crate::audit::redaction::DEFAULT_MASKED_HEADERS;
use crate::error::{Error, Result};

/// Table holding the configuration in `config.toml`
pub const CONFIG_KEY: &str = "audit_logs";

/// Prefix of the environment variables overriding the configuration
pub const ENV_PREFIX: &str = "AUDIT_LOGS_";

/// Custom field naming the client of an outbound exchange
pub const REST_CLIENT_FIELD: &str = "rest-client";

/// Logical endpoint an exchange belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Inbound exchanges handled by this service
    Server,
    /// Outbound exchanges issued through the named client
    Client(String),
}

impl Endpoint {
    /// Outbound endpoint of a named client
    pub fn client(name: impl Into<String>) -> Self {
        Self::Client(name.into())
    }

    /// Client name, for outbound endpoints
    pub fn client_name(&self) -> Option<&str> {
        match self {
            Endpoint::Server => None,
            Endpoint::Client(name) => Some(name),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Server => f.write_str("server"),
            Endpoint::Client(name) => write!(f, "client:{}", name),
        }
    }
}

/// Audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogsConfig {
    /// Inbound exchanges
    #[serde(default)]
    pub server: SinkConfig,

    /// Defaults shared by every outbound client
    #[serde(default)]
    pub clients: SinkConfig,

    /// Per-client overrides, by client name
    #[serde(default)]
    pub client: BTreeMap<String, ClientOverride>,

    /// Headers replaced by a mask in records (case-insensitive)
    #[serde(default = "default_masked_headers")]
    pub masked_headers: Vec<String>,

    /// Connect timeout of sink requests in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Total timeout of sink requests in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Largest body buffered for capture, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Age after which an unfinished exchange is dropped (disabled when unset)
    #[serde(default)]
    pub stale_after_secs: Option<u64>,

    /// Per-route policies
    #[serde(default)]
    pub policies: PolicyTable,
}

/// Enablement and sink of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Whether exchanges are audited (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// URL records are posted to
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
        }
    }
}

/// Settings of a single client; unset fields fall back to `clients`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOverride {
    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_masked_headers() -> Vec<String> {
    DEFAULT_MASKED_HEADERS.iter().map(|h| h.to_string()).collect()
}

fn default_connect_timeout_ms() -> u64 {
    200
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for AuditLogsConfig {
    fn default() -> Self {
        Self {
            server: SinkConfig::default(),
            clients: SinkConfig::default(),
            client: BTreeMap::new(),
            masked_headers: default_masked_headers(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            stale_after_secs: None,
            policies: PolicyTable::default(),
        }
    }
}

impl AuditLogsConfig {
    /// Load configuration from all sources
    ///
    /// The service name is inferred from the binary name.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "audit-logs".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let mut figment = Self::defaults();

        // lowest priority first
        for path in Self::find_config_paths(service_name).iter().rev() {
            if path.exists() {
                tracing::info!(path = %path.display(), "Loading audit configuration");
                figment = figment.merge(Toml::file(path));
            }
        }

        Self::extract(figment.merge(Self::env()))
    }

    /// Load configuration from a specific file, then the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::extract(
            Self::defaults()
                .merge(Toml::file(path.as_ref()))
                .merge(Self::env()),
        )
    }

    /// Extract the `[audit_logs]` table from an arbitrary figment
    pub fn extract(figment: Figment) -> Result<Self> {
        Ok(figment.extract_inner(CONFIG_KEY)?)
    }

    fn defaults() -> Figment {
        Figment::from(Serialized::default(CONFIG_KEY, AuditLogsConfig::default()))
    }

    fn env() -> Env {
        Env::prefixed(ENV_PREFIX)
            .split("__")
            .map(|key| format!("{}.{}", CONFIG_KEY, key).into())
    }

    /// Config file candidates, highest priority first
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix("audit-logs");
        if let Some(path) = xdg_dirs.find_config_file(Path::new(service_name).join("config.toml")) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc/audit-logs")
                .join(service_name)
                .join("config.toml"),
        );
        paths
    }

    /// Effective settings of a named client, after fallback to `clients`
    pub fn client_or_default(&self, name: &str) -> SinkConfig {
        let overrides = self.client.get(name);
        SinkConfig {
            enabled: overrides
                .and_then(|o| o.enabled)
                .unwrap_or(self.clients.enabled),
            endpoint: overrides
                .and_then(|o| o.endpoint.clone())
                .or_else(|| self.clients.endpoint.clone()),
        }
    }

    /// Effective settings of an endpoint
    pub fn sink_for(&self, endpoint: &Endpoint) -> SinkConfig {
        match endpoint {
            Endpoint::Server => self.server.clone(),
            Endpoint::Client(name) => self.client_or_default(name),
        }
    }

    /// Whether exchanges of the endpoint are audited
    pub fn is_enabled(&self, endpoint: &Endpoint) -> bool {
        self.sink_for(endpoint).enabled
    }

    /// Check that every enabled endpoint has a sink
    ///
    /// The `clients` defaults are not checked on their own: only clients
    /// named in `client` are, after fallback.
    pub fn validate(&self) -> Result<()> {
        if self.server.enabled && self.server.endpoint.is_none() {
            return Err(Error::MissingEndpoint("server".to_string()));
        }
        if self.stale_after_secs == Some(0) {
            return Err(Error::InvalidSetting(
                "stale_after_secs must be at least 1".to_string(),
            ));
        }

        let missing: Vec<&str> = self
            .client
            .keys()
            .filter(|name| {
                let sink = self.client_or_default(name);
                sink.enabled && sink.endpoint.is_none()
            })
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingEndpoint(format!(
                "clients [{}]",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Connect timeout of sink requests
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Total timeout of sink requests
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Age after which unfinished exchanges are dropped, if configured
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }
}
