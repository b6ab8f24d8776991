// src/config.rs

//! Manages server and client configuration: loading, defaults, and validation.

use crate::core::protocol::CodecKind;
use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Configuration for TLS encryption on the server side.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "questlink.crt".to_string()
}
fn default_key_path() -> String {
    "questlink.key".to_string()
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9464
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_version")]
    version: String,
    password: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    keep_alive: Duration,
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    handshake_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_reconnect_window")]
    reconnect_window: Duration,
    #[serde(default = "default_require_resume_token")]
    require_resume_token: bool,
    #[serde(default)]
    codec: CodecKind,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4730
}
fn default_version() -> String {
    env!("QUESTLINK_VERSION").to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_connections() -> usize {
    256
}
fn default_keep_alive() -> Duration {
    Duration::from_secs(10)
}
fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_reconnect_window() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_require_resume_token() -> bool {
    true
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Represents the final, validated server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Clients must present a compatible version string.
    pub version: String,
    /// If set, clients must present this shared password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub log_level: String,
    /// Sessions that are connecting or connected, at most.
    pub max_connections: usize,
    /// Idle interval after which a ping is sent.
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// How long a session lost to a link failure is kept for reconnection.
    #[serde(with = "humantime_serde")]
    pub reconnect_window: Duration,
    /// Reconnection must present the token issued at the previous connect.
    pub require_resume_token: bool,
    pub codec: CodecKind,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            version: default_version(),
            password: None,
            log_level: default_log_level(),
            max_connections: default_max_connections(),
            keep_alive: default_keep_alive(),
            handshake_timeout: default_handshake_timeout(),
            reconnect_window: default_reconnect_window(),
            require_resume_token: default_require_resume_token(),
            codec: CodecKind::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config in '{path}'"))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        let config = Config {
            host: raw.host,
            port: raw.port,
            version: raw.version,
            password: raw.password,
            log_level: raw.log_level,
            max_connections: raw.max_connections,
            keep_alive: raw.keep_alive,
            handshake_timeout: raw.handshake_timeout,
            reconnect_window: raw.reconnect_window,
            require_resume_token: raw.require_resume_token,
            codec: raw.codec,
            tls: raw.tls,
            metrics: raw.metrics,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    /// Port 0 binds an ephemeral port.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(anyhow!("version cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections cannot be 0"));
        }
        if self.keep_alive.is_zero() {
            return Err(anyhow!("keep_alive cannot be 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(anyhow!("handshake_timeout cannot be 0"));
        }
        if self.keep_alive < Duration::from_secs(1) {
            warn!(
                "low keep_alive setting: {:?}. Idle links will be pinged very often.",
                self.keep_alive
            );
        }
        if matches!(&self.password, Some(p) if p.is_empty()) {
            return Err(anyhow!("password cannot be empty; omit it to disable"));
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}

/// TLS settings for the client side.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ClientTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// The name to verify the server certificate against. Defaults to `host`.
    #[serde(default)]
    pub domain: Option<String>,
    /// A PEM bundle of trusted roots. Without one, the webpki roots are used.
    #[serde(default)]
    pub ca_path: Option<String>,
}

/// Configuration of a client session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The unique name this client connects as.
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub codec: CodecKind,
    /// Used until the server announces its own interval.
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub tls: ClientTlsConfig,
    /// Free-form properties sent with the connect command.
    #[serde(default)]
    pub properties: IndexMap<String, String>,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: name.into(),
            display_name: None,
            version: default_version(),
            password: None,
            codec: CodecKind::default(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            tls: ClientTlsConfig::default(),
            properties: IndexMap::new(),
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read client config file at '{path}'"))?;
        let config: ClientConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("name cannot be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.keep_alive.is_zero() {
            return Err(anyhow!("keep_alive cannot be 0"));
        }
        Ok(())
    }
}
