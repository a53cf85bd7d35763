//! TOML configuration for the gateway.
//!
//! ```toml
//! [gateway]
//! listen_address = "0.0.0.0:2000"
//! session_timeout_secs = 300
//!
//! [tls]
//! cert = "certs/fogcore.cert.pem"
//! key = "private/fogcore.key.pem"
//! ca_cert = "certs/ca-chain.cert.pem"
//!
//! [adapters.lorawan]
//! network_server = "192.168.2.104:8000"
//!
//! [adapters.sixlowpan]
//! bind = "[::1]:5683"
//!
//! [[seed.platforms]]
//! address = "192.168.2.105:2000"
//! interface_type = "lorawan"
//!
//! [[seed.nodes]]
//! device_id = "0004a30b001a2b3c"
//! platform_address = "192.168.2.105:2000"
//! platform_type = "lorawan"
//! interface_type = "lorawan"
//! is_provider = true
//! ```
//!
//! # Serde default values
//!
//! Every field has a default, so an empty (or missing) file yields a
//! working configuration.  Unknown keys are rejected in every section: a
//! misspelt option fails at startup instead of being silently ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fog_core::{NodeSpec, PlatformSpec};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::adapters::AdaptersConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Listener, timeouts and queue sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySettings {
    /// `host:port` the TLS listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Hard deadline of one negotiation session.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Bound on the TLS handshake and on the wait for a connection's first
    /// frame.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Bound on connecting to a provider platform.
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// How long an admin caller waits for the control loop's verdict.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub command_queue_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub inbound_queue_capacity: usize,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Certificate material shared by the acceptor and the provider dialer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    #[serde(default = "default_cert")]
    pub cert: PathBuf,
    #[serde(default = "default_key")]
    pub key: PathBuf,
    #[serde(default = "default_ca_cert")]
    pub ca_cert: PathBuf,
    #[serde(default = "default_true")]
    pub require_client_cert: bool,
}

/// Records loaded into the store at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedConfig {
    #[serde(default)]
    pub platforms: Vec<PlatformSpec>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_listen_address() -> String {
    "192.168.2.123:2000".to_string()
}
fn default_session_timeout_secs() -> u64 {
    300
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_dial_timeout_secs() -> u64 {
    10
}
fn default_command_timeout_secs() -> u64 {
    30
}
fn default_queue_capacity() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cert() -> PathBuf {
    PathBuf::from("certs/fogcore.cert.pem")
}
fn default_key() -> PathBuf {
    PathBuf::from("private/fogcore.key.pem")
}
fn default_ca_cert() -> PathBuf {
    PathBuf::from("certs/ca-chain.cert.pem")
}
fn default_true() -> bool {
    true
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            session_timeout_secs: default_session_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            command_queue_capacity: default_queue_capacity(),
            inbound_queue_capacity: default_queue_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert: default_cert(),
            key: default_key(),
            ca_cert: default_ca_cert(),
            require_client_cert: default_true(),
        }
    }
}

impl GatewaySettings {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads the configuration at `path`, returning the defaults if the file
/// does not exist.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GatewayConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
pub fn save_config(path: &Path, config: &GatewayConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fog_core::{DeviceId, InterfaceType};

    #[test]
    fn test_defaults_match_reference_deployment() {
        // Arrange / Act
        let cfg = GatewayConfig::default();

        // Assert
        assert_eq!(cfg.gateway.listen_address, "192.168.2.123:2000");
        assert_eq!(cfg.gateway.session_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.tls.cert, PathBuf::from("certs/fogcore.cert.pem"));
        assert_eq!(cfg.tls.ca_cert, PathBuf::from("certs/ca-chain.cert.pem"));
        assert!(cfg.tls.require_client_cert);
        assert!(cfg.seed.platforms.is_empty());
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let cfg: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, GatewayConfig::default());
    }

    #[test]
    fn test_seed_records_are_parsed() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            [[seed.platforms]]
            address = "10.0.0.5:2000"
            interface_type = "lorawan"

            [[seed.nodes]]
            device_id = "bb"
            platform_address = "10.0.0.5:2000"
            platform_type = "lorawan"
            interface_type = "lorawan"
            is_provider = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.seed.platforms[0].interface_type, InterfaceType::Lorawan);
        assert_eq!(cfg.seed.nodes[0].device_id, DeviceId::new(vec![0xBB]));
        assert!(cfg.seed.nodes[0].is_provider);
    }

    #[test]
    fn test_unknown_adapter_option_fails_to_load() {
        let result: Result<GatewayConfig, _> = toml::from_str(
            r#"
            [adapters.sixlowpan]
            bind = "[::1]:5683"
            channel = 11
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_section_fails_to_load() {
        let result: Result<GatewayConfig, _> = toml::from_str("[database]\nurl = \"x\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, GatewayConfig::default());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fog-gateway.toml");
        let mut cfg = GatewayConfig::default();
        cfg.gateway.listen_address = "127.0.0.1:2100".into();
        cfg.adapters.lorawan.network_server = "10.0.0.9:8000".into();

        // Act
        save_config(&path, &cfg).unwrap();
        let restored = load_config(&path).unwrap();

        // Assert
        assert_eq!(restored, cfg);
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[gateway\n").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }
}
