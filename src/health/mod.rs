/// Health checking for cluster backends
pub mod http;
pub mod tcp;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::core::{Backend, BackendStatus};
use crate::store::{ControlStore, StoreResult};

/// Outcome of probing one backend
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait::async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe a single backend
    async fn check_health(&self, backend: &Backend) -> HealthStatus;

    /// How often backends are swept
    fn check_interval(&self) -> Duration;

    /// Per-probe timeout
    fn check_timeout(&self) -> Duration;
}

/// Build the configured checker; `mode` is "http" or "tcp"
pub fn build_checker(
    mode: &str,
    path: &str,
    interval_secs: u64,
    timeout_secs: u64,
) -> Result<Box<dyn HealthChecker>, String> {
    match mode {
        "http" => Ok(Box::new(http::HttpHealthChecker::new(
            path,
            interval_secs,
            timeout_secs,
        )?)),
        "tcp" => Ok(Box::new(tcp::TcpHealthChecker::new(
            interval_secs,
            timeout_secs,
        ))),
        other => Err(format!("Unknown health check mode '{}'", other)),
    }
}

/// Sweeps every stored backend and flips `Healthy`/`Unhealthy` in the store.
/// `Draining` and `Maintenance` are administrative and never touched.
pub struct HealthMonitor {
    store: Arc<dyn ControlStore>,
    checker: Box<dyn HealthChecker>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn ControlStore>, checker: Box<dyn HealthChecker>) -> Self {
        Self { store, checker }
    }

    /// Probe with the checker's timeout applied on top
    pub async fn check_backend(&self, backend: &Backend) -> HealthStatus {
        match timeout(
            self.checker.check_timeout(),
            self.checker.check_health(backend),
        )
        .await
        {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        }
    }

    /// One pass over all backends; returns (probed, flipped)
    pub async fn sweep(&self) -> StoreResult<(usize, usize)> {
        let backends = self.store.list_all_backends().await?;
        let mut probed = 0;
        let mut flipped = 0;

        for backend in backends {
            if !backend.is_active {
                continue;
            }
            if !matches!(
                backend.status,
                BackendStatus::Healthy | BackendStatus::Unhealthy
            ) {
                continue;
            }

            let status = self.check_backend(&backend).await;
            probed += 1;
            match (&status, backend.status) {
                (HealthStatus::Healthy, BackendStatus::Unhealthy) => {
                    self.store
                        .update_backend_status(&backend.id, BackendStatus::Healthy)
                        .await?;
                    flipped += 1;
                    tracing::info!("Backend {} recovered", backend.address());
                }
                (HealthStatus::Healthy, _) => {
                    tracing::debug!("Backend {} is healthy", backend.address());
                }
                (_, BackendStatus::Healthy) => {
                    self.store
                        .update_backend_status(&backend.id, BackendStatus::Unhealthy)
                        .await?;
                    flipped += 1;
                    tracing::warn!(
                        "Backend {} failed health check: {}",
                        backend.address(),
                        status
                    );
                }
                _ => {
                    tracing::debug!("Backend {} still down: {}", backend.address(), status);
                }
            }
        }
        Ok((probed, flipped))
    }

    /// Continuous sweep at the checker's interval
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.checker.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok((probed, flipped)) if flipped > 0 => {
                    tracing::info!("Health sweep: {} probed, {} status changes", probed, flipped)
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("Health sweep failed: {}", err),
            }
        }
    }
}
