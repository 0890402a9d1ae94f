/// Semaforo - a federated traffic control plane
///
/// Semaforo publishes traffic endpoints under `/e/{slug}` and dispatches each
/// request through four stages: federation ownership (which node of the org's
/// federation owns this client's affinity key), routing policies, backend
/// selection with session affinity, and one of four proxy modes (REDIRECT,
/// PASSTHROUGH, REVERSE_PROXY, SMART). Nodes coordinate through a
/// single-writer Principle / replica Partner topology with heartbeats,
/// configuration sync and a time-bounded leadership-handover protocol.
pub mod affinity;
pub mod balance;
pub mod config;
pub mod core;
pub mod error;
pub mod federation;
pub mod health;
pub mod policy;
pub mod proxy;
pub mod ring;
pub mod server;
pub mod store;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::affinity::AffinityManager;
use crate::balance::MemoryCounter;
use crate::federation::{
    heartbeat::run_heartbeat_loop, promotion::run_promotion_watchdog, sync::run_sync_loop,
    FederationManager,
};
use crate::health::HealthMonitor;
use crate::proxy::Dispatcher;
use crate::server::AppState;
use crate::store::{ControlStore, MemoryStore};

pub use crate::config::Config;
pub use crate::error::{ProxyError, SemaforoError, SemaforoResult};

/// Seconds between expired-affinity sweeps
const AFFINITY_PURGE_INTERVAL_SECS: u64 = 60;

/// The assembled node: configuration plus the store everything runs against
pub struct Semaforo {
    config: Config,
    store: Arc<dyn ControlStore>,
}

impl Semaforo {
    /// Single-node setup over the in-memory store
    pub fn new(config: Config) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Setup over an externally provided store
    pub fn with_store(config: Config, store: Arc<dyn ControlStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ControlStore> {
        Arc::clone(&self.store)
    }

    /// Ensure this node has a persisted federation identity. A fresh node is
    /// seeded as Standalone from `[node]`; an existing row wins so roles
    /// survive restarts.
    pub async fn seed_identity(&self) -> SemaforoResult<crate::core::FederationConfig> {
        if let Some(existing) = self
            .store
            .get_federation_config(&self.config.node.org_id)
            .await?
        {
            log::info!(
                "Node {} resumes as {} for org {}",
                existing.node_id,
                existing.role,
                existing.org_id
            );
            return Ok(existing);
        }

        let identity = crate::core::FederationConfig::new(
            &self.config.node.org_id,
            &self.config.node.node_name,
            &self.config.node.node_url,
            &self.config.node.secret_key,
        );
        self.store.put_federation_config(identity.clone()).await?;
        log::info!(
            "Seeded standalone federation identity {} for org {}",
            identity.node_id,
            identity.org_id
        );
        Ok(identity)
    }

    /// Build the request-serving state: federation manager, dispatcher, router
    /// state. Seeds the identity row if needed.
    pub async fn bootstrap(&self) -> SemaforoResult<AppState> {
        let identity = self.seed_identity().await?;

        let federation = Arc::new(
            FederationManager::new(
                Arc::clone(&self.store),
                &self.config.node.org_id,
                &identity.node_id,
                self.config.federation_settings(),
            )
            .map_err(SemaforoError::internal)?,
        );
        federation.refresh_registry().await?;

        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&self.store),
                Arc::clone(&federation),
                Arc::new(MemoryCounter::new()),
                &self.config.server.public_origin,
                self.config.proxy.connect_timeout_ms,
            )
            .map_err(SemaforoError::internal)?,
        );

        Ok(AppState {
            dispatcher,
            federation,
        })
    }

    /// Run the node: background loops plus the HTTP server. Returns only on a
    /// server error.
    pub async fn run(self) -> SemaforoResult<()> {
        let state = self.bootstrap().await?;

        tokio::spawn(run_heartbeat_loop(Arc::clone(&state.federation)));
        tokio::spawn(run_promotion_watchdog(Arc::clone(&state.federation)));
        tokio::spawn(run_sync_loop(Arc::clone(&state.federation)));

        let checker = health::build_checker(
            &self.config.health.mode,
            &self.config.health.path,
            self.config.health.interval_sec,
            self.config.health.timeout_sec,
        )
        .map_err(SemaforoError::internal)?;
        tokio::spawn(HealthMonitor::new(Arc::clone(&self.store), checker).run());

        let affinity = AffinityManager::new(Arc::clone(&self.store));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                AFFINITY_PURGE_INTERVAL_SECS,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match affinity.cleanup_expired().await {
                    Ok(0) => {}
                    Ok(purged) => log::debug!("Purged {} expired affinity mapping(s)", purged),
                    Err(err) => log::warn!("Affinity purge failed: {}", err),
                }
            }
        });

        let addr: SocketAddr = self.config.server.listen_addr.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!(
            "Semaforo listening on {} (public origin {})",
            addr,
            self.config.server.public_origin
        );

        let router = server::build_router(state);
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}
