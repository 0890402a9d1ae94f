/// Configuration management for semaforo
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::federation::FederationSettings;

/// Main semaforo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// This node's federation identity
    pub node: NodeConfig,
    /// Federation timings and limits
    pub federation: FederationConfig,
    /// Data plane configuration
    pub proxy: ProxyConfig,
    /// Backend health check configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Origin clients use to reach this node; rewritten into proxied
    /// responses in REVERSE_PROXY and SMART modes
    pub public_origin: String,
    /// Maximum number of concurrent in-flight requests counted toward load
    pub max_connections: u32,
}

/// This node's identity inside its org's federation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Organization this node serves
    pub org_id: String,
    /// Human-readable node name
    pub node_name: String,
    /// URL peers use to reach this node
    pub node_url: String,
    /// Shared org secret presented in X-Federation-Secret
    pub secret_key: String,
}

/// Federation timings and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Seconds between partner heartbeats
    pub heartbeat_interval_sec: u64,
    /// Seconds of silence before a peer is considered lapsed
    pub heartbeat_timeout_sec: u64,
    /// Seconds an unanswered promotion request waits before auto-promotion
    pub promotion_deadline_sec: u64,
    /// Seconds between scheduled full syncs; 0 disables the loop
    pub sync_interval_sec: u64,
    /// Peers above this load percentage are skipped when routing
    pub forward_load_max: u8,
}

/// Data plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Default connect timeout for backend requests in milliseconds
    pub connect_timeout_ms: u64,
}

/// Backend health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe mode: "http" or "tcp"
    pub mode: String,
    /// Request path probed in http mode
    pub path: String,
    /// Health check interval in seconds
    pub interval_sec: u64,
    /// Health check timeout in seconds
    pub timeout_sec: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:7070".to_string(),
                public_origin: "http://localhost:7070".to_string(),
                max_connections: 10000,
            },
            node: NodeConfig {
                org_id: "default".to_string(),
                node_name: "semaforo-1".to_string(),
                node_url: "http://localhost:7070".to_string(),
                secret_key: String::new(),
            },
            federation: FederationConfig {
                heartbeat_interval_sec: 5,
                heartbeat_timeout_sec: 15,
                promotion_deadline_sec: 30,
                sync_interval_sec: 300,
                forward_load_max: 85,
            },
            proxy: ProxyConfig {
                connect_timeout_ms: 5000,
            },
            health: HealthConfig {
                mode: "http".to_string(),
                path: "/".to_string(),
                interval_sec: 10,
                timeout_sec: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid listen address: {}",
                    self.server.listen_addr
                ))
            })?;

        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.server.public_origin.is_empty() {
            return Err(ConfigError::ValidationError(
                "public_origin cannot be empty".to_string(),
            ));
        }

        if self.node.org_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "org_id cannot be empty".to_string(),
            ));
        }

        if self.node.node_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "node_url cannot be empty".to_string(),
            ));
        }

        if self.federation.heartbeat_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat_interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.federation.heartbeat_timeout_sec <= self.federation.heartbeat_interval_sec {
            return Err(ConfigError::ValidationError(
                "heartbeat_timeout_sec must be greater than heartbeat_interval_sec".to_string(),
            ));
        }

        if self.federation.promotion_deadline_sec == 0 {
            return Err(ConfigError::ValidationError(
                "promotion_deadline_sec must be greater than 0".to_string(),
            ));
        }

        if self.federation.forward_load_max > 100 {
            return Err(ConfigError::ValidationError(
                "forward_load_max is a percentage and cannot exceed 100".to_string(),
            ));
        }

        if self.proxy.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        match self.health.mode.as_str() {
            "http" | "tcp" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid health check mode: {}",
                    other
                )))
            }
        }

        if self.health.interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check timeout_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_sec >= self.health.interval_sec {
            return Err(ConfigError::ValidationError(
                "health check timeout_sec must be less than interval_sec".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Federation tunables in the form the manager consumes
    pub fn federation_settings(&self) -> FederationSettings {
        FederationSettings {
            heartbeat_interval_secs: self.federation.heartbeat_interval_sec,
            heartbeat_timeout_secs: self.federation.heartbeat_timeout_sec,
            promotion_deadline_secs: self.federation.promotion_deadline_sec,
            sync_interval_secs: self.federation.sync_interval_sec,
            forward_load_max: self.federation.forward_load_max,
            max_connections: self.server.max_connections,
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            node: NodeConfig {
                org_id: "acme".to_string(),
                node_name: "semaforo-east-1".to_string(),
                node_url: "http://10.0.1.10:7070".to_string(),
                secret_key: "change-me".to_string(),
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.server.max_connections = 0;
        assert!(config.validate().is_err());

        config.server.max_connections = 1000;
        assert!(config.validate().is_ok());

        config.federation.forward_load_max = 120;
        assert!(config.validate().is_err());
        config.federation.forward_load_max = 85;

        config.health.mode = "icmp".to_string();
        assert!(config.validate().is_err());
        config.health.mode = "tcp".to_string();
        assert!(config.validate().is_ok());

        config.server.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_timings_must_be_ordered() {
        let mut config = Config::default();
        config.federation.heartbeat_interval_sec = 15;
        config.federation.heartbeat_timeout_sec = 15;
        assert!(config.validate().is_err());

        config.federation.heartbeat_timeout_sec = 45;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded_config.validate().is_ok());
        assert_eq!(loaded_config.node.org_id, "default");
    }

    #[test]
    fn test_example_config_is_loadable() {
        let temp_file = NamedTempFile::new().unwrap();
        Config::create_example_config(temp_file.path()).unwrap();
        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.node.org_id, "acme");
        assert_eq!(loaded.federation.promotion_deadline_sec, 30);
    }

    #[test]
    fn test_federation_settings_mapping() {
        let config = Config::default();
        let settings = config.federation_settings();
        assert_eq!(settings.heartbeat_timeout_secs, 15);
        assert_eq!(settings.forward_load_max, 85);
        assert_eq!(settings.max_connections, 10000);
    }
}
