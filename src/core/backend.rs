/// Backend and cluster records
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::generate_id;

/// Operational status of a backend.
///
/// Health checks only ever flip `Healthy` and `Unhealthy`; `Draining` and
/// `Maintenance` are administrative states the checker must not touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendStatus {
    Healthy,
    Unhealthy,
    Draining,
    Maintenance,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendStatus::Healthy => "HEALTHY",
            BackendStatus::Unhealthy => "UNHEALTHY",
            BackendStatus::Draining => "DRAINING",
            BackendStatus::Maintenance => "MAINTENANCE",
        };
        write!(f, "{}", s)
    }
}

/// Scheme used to reach a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
    Http,
    Https,
}

impl fmt::Display for BackendProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendProtocol::Http => write!(f, "http"),
            BackendProtocol::Https => write!(f, "https"),
        }
    }
}

impl BackendProtocol {
    /// Port implied by the scheme when none is given explicitly
    pub fn default_port(&self) -> u16 {
        match self {
            BackendProtocol::Http => 80,
            BackendProtocol::Https => 443,
        }
    }
}

/// A single upstream server inside a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    pub cluster_id: String,
    pub host: String,
    pub port: u16,
    pub protocol: BackendProtocol,
    /// Relative weight for WEIGHTED_ROUND_ROBIN; ignored by other strategies
    pub weight: u32,
    pub status: BackendStatus,
    /// In-flight request count, maintained best-effort by the dispatcher
    pub current_connections: u32,
    pub max_connections: Option<u32>,
    pub is_active: bool,
}

impl Backend {
    pub fn new(cluster_id: &str, host: &str, port: u16) -> Result<Self, String> {
        if host.is_empty() {
            return Err("Backend host cannot be empty".to_string());
        }
        if port == 0 {
            return Err("Backend port cannot be 0".to_string());
        }

        Ok(Self {
            id: generate_id("be"),
            cluster_id: cluster_id.to_string(),
            host: host.to_string(),
            port,
            protocol: BackendProtocol::Http,
            weight: 100,
            status: BackendStatus::Healthy,
            current_connections: 0,
            max_connections: None,
            is_active: true,
        })
    }

    /// "host:port" form used in logs and the X-Backend-Host header
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fully qualified origin, e.g. "https://10.0.0.1:8443"
    pub fn origin(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Whether the backend may receive new traffic at all
    pub fn is_available(&self) -> bool {
        self.is_active && self.status == BackendStatus::Healthy
    }
}

/// Load-balancing strategy attached to a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerStrategy {
    RoundRobin,
    LeastConnections,
    Random,
    IpHash,
    WeightedRoundRobin,
}

impl fmt::Display for LoadBalancerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadBalancerStrategy::RoundRobin => "ROUND_ROBIN",
            LoadBalancerStrategy::LeastConnections => "LEAST_CONNECTIONS",
            LoadBalancerStrategy::Random => "RANDOM",
            LoadBalancerStrategy::IpHash => "IP_HASH",
            LoadBalancerStrategy::WeightedRoundRobin => "WEIGHTED_ROUND_ROBIN",
        };
        write!(f, "{}", s)
    }
}

/// A named group of backends sharing one strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCluster {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub strategy: LoadBalancerStrategy,
    pub is_active: bool,
}

impl BackendCluster {
    pub fn new(org_id: &str, name: &str) -> Result<Self, String> {
        if name.is_empty() {
            return Err("Cluster name cannot be empty".to_string());
        }

        Ok(Self {
            id: generate_id("cl"),
            org_id: org_id.to_string(),
            name: name.to_string(),
            strategy: LoadBalancerStrategy::RoundRobin,
            is_active: true,
        })
    }
}

/// Optional per-cluster strategy override consulted at selection time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub id: String,
    pub cluster_id: String,
    pub strategy: LoadBalancerStrategy,
    pub is_active: bool,
}

impl LoadBalancerConfig {
    pub fn new(cluster_id: &str, strategy: LoadBalancerStrategy) -> Self {
        Self {
            id: generate_id("lbc"),
            cluster_id: cluster_id.to_string(),
            strategy,
            is_active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_creation() {
        let backend = Backend::new("cluster-1", "10.0.0.1", 8080).unwrap();
        assert_eq!(backend.cluster_id, "cluster-1");
        assert_eq!(backend.weight, 100);
        assert_eq!(backend.status, BackendStatus::Healthy);
        assert!(backend.is_active);
        assert!(backend.id.starts_with("be-"));
    }

    #[test]
    fn test_backend_validation() {
        assert!(Backend::new("cluster-1", "", 8080).is_err());
        assert!(Backend::new("cluster-1", "10.0.0.1", 0).is_err());
    }

    #[test]
    fn test_backend_origin_and_address() {
        let mut backend = Backend::new("c1", "api.internal", 8443).unwrap();
        backend.protocol = BackendProtocol::Https;
        assert_eq!(backend.address(), "api.internal:8443");
        assert_eq!(backend.origin(), "https://api.internal:8443");
    }

    #[test]
    fn test_backend_availability() {
        let mut backend = Backend::new("c1", "10.0.0.1", 8080).unwrap();
        assert!(backend.is_available());

        backend.status = BackendStatus::Unhealthy;
        assert!(!backend.is_available());

        backend.status = BackendStatus::Healthy;
        backend.is_active = false;
        assert!(!backend.is_available());
    }

    #[test]
    fn test_strategy_wire_names() {
        let json = serde_json::to_string(&LoadBalancerStrategy::WeightedRoundRobin).unwrap();
        assert_eq!(json, "\"WEIGHTED_ROUND_ROBIN\"");

        let parsed: LoadBalancerStrategy = serde_json::from_str("\"IP_HASH\"").unwrap();
        assert_eq!(parsed, LoadBalancerStrategy::IpHash);
    }

    #[test]
    fn test_status_preserves_admin_states() {
        let json = serde_json::to_string(&BackendStatus::Draining).unwrap();
        assert_eq!(json, "\"DRAINING\"");
        let parsed: BackendStatus = serde_json::from_str("\"MAINTENANCE\"").unwrap();
        assert_eq!(parsed, BackendStatus::Maintenance);
    }

    #[test]
    fn test_cluster_creation() {
        let cluster = BackendCluster::new("org-1", "api-pool").unwrap();
        assert_eq!(cluster.strategy, LoadBalancerStrategy::RoundRobin);
        assert!(BackendCluster::new("org-1", "").is_err());
    }
}
