//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Tunnel-accept listen address
    pub tunnel_listen: String,
    /// Public SNI listen address
    pub sni_listen: String,
    /// Optional health endpoint listen address
    pub health_listen: Option<String>,
    /// Fernet keys accepted for handshake tokens (newest first)
    pub fernet_keys: Vec<String>,
    /// Optional per-peer byte-rate limit for dispatched traffic (bytes/sec)
    pub throttling: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tunnel_listen: format!("0.0.0.0:{}", crate::DEFAULT_TUNNEL_PORT),
            sni_listen: format!("0.0.0.0:{}", crate::DEFAULT_SNI_PORT),
            health_listen: None,
            fernet_keys: Vec::new(),
            throttling: None,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server tunnel endpoint
    pub server: String,
    /// Local backend the tunnel bridges to
    pub local_endpoint: String,
    /// Pre-shared Fernet key used to mint handshake tokens (base64)
    pub fernet_key: String,
    /// Client identity (base64, 32 bytes)
    pub identity: String,
    /// Hostnames this client serves
    pub hostnames: Vec<String>,
    /// AES session key (base64, 32 bytes)
    pub aes_key: String,
    /// AES session IV (base64, 16 bytes)
    pub aes_iv: String,
    /// Seconds between keepalive pings
    pub keepalive_secs: u64,
    /// Lifetime of minted handshake tokens in seconds
    pub token_ttl_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", crate::DEFAULT_TUNNEL_PORT),
            local_endpoint: "127.0.0.1:8123".to_string(),
            fernet_key: String::new(),
            identity: String::new(),
            hostnames: Vec::new(),
            aes_key: String::new(),
            aes_iv: String::new(),
            keepalive_secs: 30,
            token_ttl_secs: 300,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
