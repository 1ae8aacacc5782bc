//! Configuration handling for the keel daemon.
//!
//! Settings come from an optional YAML file with environment-variable
//! overrides on top; command-line flags win over both.

use anyhow::Result;
use keel_session::{EngineConfig, TlsSettings};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Daemon configuration as written in the YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    /// Address the server listens on
    pub listen: SocketAddr,
    /// Receive scratch buffer size in bytes
    pub recv_buffer_size: usize,
    /// Socket send buffer size in bytes
    pub send_buffer_size: usize,
    /// Transport negotiation deadline in seconds
    pub connect_timeout_secs: u64,
    /// Close sessions idle for this many seconds; 0 disables the cut-off
    pub recv_timeout_secs: u64,
    /// Per-write deadline in seconds; 0 disables it
    pub send_timeout_secs: u64,
    /// Disable Nagle's algorithm on accepted sockets
    pub no_delay: bool,
    /// Idle buffers retained by the pool
    pub max_idle_buffers: usize,
    /// TLS configuration
    pub tls: TlsFileConfig,
}

/// TLS section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsFileConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to the certificate chain (PEM)
    pub cert_file: Option<PathBuf>,
    /// Path to the private key (PEM)
    pub key_file: Option<PathBuf>,
    /// Path to the CA bundle for client certificates (PEM)
    pub ca_file: Option<PathBuf>,
    /// Path to a certificate revocation list (PEM)
    pub crl_file: Option<PathBuf>,
    /// Refuse clients without a certificate
    pub require_client_cert: bool,
    /// Enforce the revocation list during client validation
    pub check_revocation: bool,
}

impl Default for KeelConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7400)),
            recv_buffer_size: engine.recv_buffer_size,
            send_buffer_size: engine.send_buffer_size,
            connect_timeout_secs: engine.connect_timeout.as_secs(),
            recv_timeout_secs: 0,
            send_timeout_secs: engine.send_timeout.map(|d| d.as_secs()).unwrap_or(0),
            no_delay: engine.no_delay,
            max_idle_buffers: engine.max_idle_buffers,
            tls: TlsFileConfig::default(),
        }
    }
}

impl KeelConfig {
    /// Load configuration from file and environment variables.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<KeelConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(err) => {
                    warn!(
                        "Failed to parse config file {:?} ({err}), using defaults",
                        config_path.as_ref()
                    );
                }
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("KEEL_LISTEN") {
            match listen.parse() {
                Ok(addr) => {
                    self.listen = addr;
                    info!("Listen address overridden by environment: {}", self.listen);
                }
                Err(err) => warn!("Ignoring invalid KEEL_LISTEN ({err})"),
            }
        }

        if let Ok(size) = std::env::var("KEEL_RECV_BUFFER_SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                self.recv_buffer_size = size;
                info!("Receive buffer size overridden by environment: {}", size);
            }
        }

        if let Ok(secs) = std::env::var("KEEL_CONNECT_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.connect_timeout_secs = secs;
                info!("Connect timeout overridden by environment: {}s", secs);
            }
        }

        if let Ok(enabled) = std::env::var("KEEL_TLS_ENABLED") {
            self.tls.enabled = enabled.to_lowercase() == "true";
            info!("TLS enabled overridden by environment: {}", self.tls.enabled);
        }
    }

    /// Translate the file-level settings into the engine configuration.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let tls = if self.tls.enabled {
            let cert_file = self
                .tls
                .cert_file
                .clone()
                .ok_or_else(|| anyhow::anyhow!("TLS enabled but tls.cert_file is not set"))?;
            let key_file = self
                .tls
                .key_file
                .clone()
                .ok_or_else(|| anyhow::anyhow!("TLS enabled but tls.key_file is not set"))?;

            let mut settings = TlsSettings::new(cert_file, key_file);
            settings.ca_file = self.tls.ca_file.clone();
            settings.crl_file = self.tls.crl_file.clone();
            settings.require_client_cert = self.tls.require_client_cert;
            settings.check_revocation = self.tls.check_revocation;
            Some(settings)
        } else {
            None
        };

        Ok(EngineConfig {
            recv_buffer_size: self.recv_buffer_size,
            send_buffer_size: self.send_buffer_size,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            recv_timeout: match self.recv_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            send_timeout: match self.send_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            no_delay: self.no_delay,
            max_idle_buffers: self.max_idle_buffers,
            tls,
            ..EngineConfig::default()
        })
    }
}
