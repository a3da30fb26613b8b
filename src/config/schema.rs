//! Configuration schema definitions.
//!
//! This module defines the TLS-related configuration of the MTA.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dh::SecurityLevel;

/// Default size of the record-layer receive buffer.
pub const DEFAULT_XFER_BUFFER_SIZE: usize = 4096;

/// Root TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Directory holding the DH parameter cache.
    pub spool_directory: PathBuf,

    /// DH parameter settings (server role only).
    pub dh: DhConfig,

    /// Inbound TLS settings.
    pub server: ServerTlsConfig,

    /// Idle limit for reads and the inbound handshake; 0 disables it.
    pub receive_timeout_secs: u64,

    /// Receive buffer capacity of the record layer.
    pub xfer_buffer_size: usize,

    /// Relax negotiation for interoperability with old peers.
    pub compat_mode: bool,

    /// Owner given to files written in the spool directory.
    pub service_owner: Option<ServiceOwner>,

    /// Demo listener settings.
    pub listener: ListenerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            spool_directory: PathBuf::from("/var/spool/mta"),
            dh: DhConfig::default(),
            server: ServerTlsConfig::default(),
            receive_timeout_secs: 300,
            xfer_buffer_size: DEFAULT_XFER_BUFFER_SIZE,
            compat_mode: false,
            service_owner: None,
            listener: ListenerConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl TlsConfig {
    pub fn receive_timeout(&self) -> Option<Duration> {
        (self.receive_timeout_secs > 0).then(|| Duration::from_secs(self.receive_timeout_secs))
    }
}

/// DH parameter configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DhConfig {
    /// File name prefix inside the spool directory.
    pub cache_prefix: String,

    /// Strength policy used when `bits` is not set.
    pub security_level: SecurityLevel,

    /// Explicit bit strength, overriding `security_level`.
    pub bits: Option<u32>,
}

impl Default for DhConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "dh-params".to_string(),
            security_level: SecurityLevel::default(),
            bits: None,
        }
    }
}

impl DhConfig {
    pub fn target_bits(&self) -> u32 {
        self.bits.unwrap_or_else(|| self.security_level.bits())
    }
}

/// Inbound TLS configuration. Path options are templates.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerTlsConfig {
    /// Certificate chain (PEM); may reference `$tls_sni`.
    pub certificate: Option<String>,

    /// Private key (PEM); defaults to the certificate path.
    pub privatekey: Option<String>,

    /// Trust store (PEM bundle) for client certificates.
    pub verify_certificates: Option<String>,

    /// Certificate revocation lists (PEM).
    pub crl: Option<String>,

    /// Priority expression restricting versions, ciphers and groups.
    pub require_ciphers: Option<String>,

    /// Hosts that must present a valid certificate.
    pub verify_hosts: Vec<String>,

    /// Hosts asked for a certificate without requiring it.
    pub try_verify_hosts: Vec<String>,

    /// TLS starts immediately on connect; no go-ahead response is sent.
    pub on_connect: bool,
}

/// Outbound TLS settings of one transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientTlsOptions {
    /// Client certificate (PEM) offered when the server asks.
    pub certificate: Option<String>,

    /// Private key for `certificate`; defaults to the certificate path.
    pub privatekey: Option<String>,

    /// Virtual host name to announce (SNI).
    pub sni: Option<String>,

    /// Trust store; when set the server certificate must verify.
    pub verify_certificates: Option<String>,

    /// Certificate revocation lists (PEM).
    pub crl: Option<String>,

    /// Priority expression.
    pub require_ciphers: Option<String>,

    /// Handshake deadline.
    pub timeout_secs: u64,
}

impl Default for ClientTlsOptions {
    fn default() -> Self {
        Self {
            certificate: None,
            privatekey: None,
            sni: None,
            verify_certificates: None,
            crl: None,
            require_ciphers: None,
            timeout_secs: 300,
        }
    }
}

impl ClientTlsOptions {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Runtime identity owning spool files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Listener configuration for the demo daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:2525").
    pub bind_address: String,

    /// Host name used in greetings.
    pub hostname: String,

    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2525".to_string(),
            hostname: "localhost".to_string(),
            max_connections: 1_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "mta_tls=info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: TlsConfig = toml::from_str(
            r#"
            spool_directory = "/tmp/spool"

            [server]
            certificate = "/etc/mta/${tls_sni:-default}.pem"
            verify_hosts = ["192.0.2.0/24"]
            "#,
        )
        .unwrap();

        assert_eq!(config.spool_directory, PathBuf::from("/tmp/spool"));
        assert_eq!(config.xfer_buffer_size, DEFAULT_XFER_BUFFER_SIZE);
        assert_eq!(config.receive_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.dh.cache_prefix, "dh-params");
        assert_eq!(config.dh.target_bits(), 2048);
        assert!(config.server.privatekey.is_none());
        assert_eq!(config.server.verify_hosts, vec!["192.0.2.0/24".to_string()]);
    }

    #[test]
    fn dh_bits_override_security_level() {
        let config: TlsConfig = toml::from_str(
            r#"
            [dh]
            security_level = "high"
            "#,
        )
        .unwrap();
        assert_eq!(config.dh.target_bits(), 3072);

        let config: TlsConfig = toml::from_str("[dh]\nsecurity_level = \"ultra\"\nbits = 2048\n").unwrap();
        assert_eq!(config.dh.target_bits(), 2048);
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let config = TlsConfig {
            receive_timeout_secs: 0,
            ..TlsConfig::default()
        };
        assert_eq!(config.receive_timeout(), None);
    }
}
