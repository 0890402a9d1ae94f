/// HTTP backend health checker
use std::time::Duration;

use super::{HealthChecker, HealthStatus};
use crate::core::Backend;

/// Probes `GET {origin}{path}` on each backend. Any response below 500
/// counts as healthy: a 404 on the probe path still proves the server is
/// up and reachable.
pub struct HttpHealthChecker {
    client: reqwest::Client,
    path: String,
    check_interval: Duration,
    check_timeout: Duration,
}

impl HttpHealthChecker {
    pub fn new(path: &str, interval_secs: u64, timeout_secs: u64) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| format!("Failed to build health check client: {}", e))?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Ok(Self {
            client,
            path,
            check_interval: Duration::from_secs(interval_secs.max(1)),
            check_timeout: Duration::from_secs(timeout_secs.max(1)),
        })
    }
}

#[async_trait::async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check_health(&self, backend: &Backend) -> HealthStatus {
        let url = format!("{}{}", backend.origin(), self.path);
        tracing::debug!("Probing {}", url);

        match self
            .client
            .get(&url)
            .timeout(self.check_timeout)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error() {
                    HealthStatus::Unhealthy {
                        reason: format!("status {}", status.as_u16()),
                    }
                } else {
                    HealthStatus::Healthy
                }
            }
            Err(err) if err.is_timeout() => HealthStatus::Timeout,
            Err(err) => HealthStatus::Unhealthy {
                reason: format!("request failed: {}", err),
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
