/// Partner-side heartbeat loop and staleness sweep
use std::sync::Arc;
use std::time::Duration;

use crate::core::NodeRole;

use super::{FederationManager, HEARTBEAT_FAILURE_LIMIT};

/// Drive heartbeats for one node. A Partner beats its Principle every
/// interval and escalates to a promotion request after
/// `HEARTBEAT_FAILURE_LIMIT` consecutive misses. A Principle only sweeps
/// lapsed partners out of the ring; partners announce themselves.
///
/// The role is re-read every tick, so a promotion or handover switches the
/// loop's behavior without a restart.
pub async fn run_heartbeat_loop(manager: Arc<FederationManager>) {
    let interval = manager.settings().heartbeat_interval_secs.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    loop {
        ticker.tick().await;

        let role = match manager.current_config().await {
            Ok(Some(config)) => config.role,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!("Heartbeat loop could not read federation state: {}", err);
                continue;
            }
        };

        match role {
            NodeRole::Partner => {
                for node_id in manager.expire_stale_peers().await {
                    tracing::warn!("Peer {} went stale, removed from the ring", node_id);
                }
                match manager.heartbeat_principle().await {
                    Ok(ack) => {
                        if consecutive_failures > 0 {
                            tracing::info!(
                                "Principle reachable again after {} missed heartbeat(s)",
                                consecutive_failures
                            );
                        }
                        consecutive_failures = 0;
                        tracing::debug!(
                            "Heartbeat acknowledged by {} (load {}%)",
                            ack.node_id,
                            ack.load_percent
                        );
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        tracing::warn!(
                            "Heartbeat to principle failed ({}/{}): {}",
                            consecutive_failures,
                            HEARTBEAT_FAILURE_LIMIT,
                            err
                        );
                        if consecutive_failures >= HEARTBEAT_FAILURE_LIMIT {
                            consecutive_failures = 0;
                            match manager.request_promotion("principle missed heartbeats").await {
                                Ok(promotion) => tracing::info!(
                                    "Promotion request {} filed, status {:?}",
                                    promotion.id,
                                    promotion.status
                                ),
                                Err(err) => {
                                    tracing::error!("Promotion request failed: {}", err)
                                }
                            }
                        }
                    }
                }
            }
            NodeRole::Principle => {
                consecutive_failures = 0;
                for node_id in manager.expire_stale_peers().await {
                    tracing::warn!(
                        "Partner {} missed its heartbeat window, removed from the ring",
                        node_id
                    );
                }
            }
            NodeRole::Standalone => {
                consecutive_failures = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FederationConfig, NodeRole};
    use crate::federation::FederationSettings;
    use crate::store::{ControlStore, MemoryStore};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    async fn partner_manager(
        store: Arc<MemoryStore>,
        principle_url: &str,
        interval_secs: u64,
    ) -> Arc<FederationManager> {
        let mut config = FederationConfig::new("org-1", "self", "http://self:7070", "s3cret");
        config.node_id = "node-self".to_string();
        config.role = NodeRole::Partner;
        config.principle_node_id = Some("node-principle".to_string());
        config.principle_url = Some(principle_url.to_string());
        store.put_federation_config(config).await.unwrap();
        let settings = FederationSettings {
            heartbeat_interval_secs: interval_secs,
            ..FederationSettings::default()
        };
        Arc::new(FederationManager::new(store, "org-1", "node-self", settings).unwrap())
    }

    #[tokio::test]
    async fn test_loop_beats_reachable_principle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route(
            "/api/federation/heartbeat",
            post(|| async {
                Json(serde_json::json!({
                    "node_id": "node-principle",
                    "role": "PRINCIPLE",
                    "load_percent": 5
                }))
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let store = Arc::new(MemoryStore::new());
        let manager = partner_manager(store.clone(), &format!("http://{}", addr), 1).await;
        tokio::spawn(run_heartbeat_loop(Arc::clone(&manager)));

        tokio::time::sleep(Duration::from_millis(800)).await;
        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert!(config.last_heartbeat.is_some());
        assert_eq!(config.role, NodeRole::Partner);
    }

    #[tokio::test]
    async fn test_loop_escalates_after_three_misses() {
        let store = Arc::new(MemoryStore::new());
        // Nothing listens here: every beat fails fast
        let manager = partner_manager(store.clone(), "http://127.0.0.1:1", 1).await;
        tokio::spawn(run_heartbeat_loop(Arc::clone(&manager)));

        // Misses at ~0s, ~1s, ~2s; the third files the promotion, and with an
        // unreachable principle that self-promotes on the spot
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Principle);
        assert!(config.principle_node_id.is_none());
        let pending = store.list_pending_promotions("org-1").await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_loop_idles_when_standalone() {
        let store = Arc::new(MemoryStore::new());
        let mut config = FederationConfig::new("org-1", "self", "http://self:7070", "s3cret");
        config.node_id = "node-self".to_string();
        store.put_federation_config(config).await.unwrap();
        let settings = FederationSettings {
            heartbeat_interval_secs: 1,
            ..FederationSettings::default()
        };
        let manager =
            Arc::new(FederationManager::new(store.clone(), "org-1", "node-self", settings).unwrap());
        tokio::spawn(run_heartbeat_loop(Arc::clone(&manager)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Standalone);
        assert!(config.last_heartbeat.is_none());
    }
}
