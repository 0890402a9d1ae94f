/// TCP connect health checker
use std::time::Duration;

use tokio::net::TcpStream;

use super::{HealthChecker, HealthStatus};
use crate::core::Backend;

/// Cheapest possible probe: a successful TCP connect to host:port. Useful
/// for backends whose HTTP surface is not probe-friendly.
pub struct TcpHealthChecker {
    check_interval: Duration,
    check_timeout: Duration,
}

impl TcpHealthChecker {
    pub fn new(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            check_interval: Duration::from_secs(interval_secs.max(1)),
            check_timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }
}

#[async_trait::async_trait]
impl HealthChecker for TcpHealthChecker {
    async fn check_health(&self, backend: &Backend) -> HealthStatus {
        match TcpStream::connect((backend.host.as_str(), backend.port)).await {
            Ok(_) => HealthStatus::Healthy,
            Err(err) => HealthStatus::Unhealthy {
                reason: format!("connect failed: {}", err),
            },
        }
    }

    fn check_interval(&self) -> Duration {
        self.check_interval
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}
