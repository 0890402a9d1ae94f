/// Configuration sync from a Principle to its Partners
///
/// Payloads address rows by natural key (cluster name, backend host:port,
/// endpoint slug, policy name) so each node keeps its own row ids. Cluster
/// ids embedded in synced rows are the sender's and are remapped on apply.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::{
    Backend, BackendCluster, FederationPartner, NodeRole, PartnerSyncState, PolicyAction,
    RoutingPolicy, SyncDirection, SyncLog, SyncLogStatus, SyncType, TrafficEndpoint,
};
use crate::error::SemaforoResult;
use crate::store::ControlStore;

use super::{FederationClient, FederationManager};

/// One configuration change, addressed by natural keys
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncChange {
    UpsertCluster {
        cluster: BackendCluster,
    },
    DeleteCluster {
        name: String,
    },
    UpsertBackend {
        cluster_name: String,
        backend: Backend,
    },
    DeleteBackend {
        cluster_name: String,
        host: String,
        port: u16,
    },
    UpsertEndpoint {
        endpoint: TrafficEndpoint,
        cluster_name: Option<String>,
    },
    DeleteEndpoint {
        slug: String,
    },
    UpsertPolicy {
        policy: RoutingPolicy,
        route_cluster_name: Option<String>,
    },
    DeletePolicy {
        name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sync_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPayload {
    Full {
        clusters: Vec<BackendCluster>,
        backends: Vec<Backend>,
        endpoints: Vec<TrafficEndpoint>,
        policies: Vec<RoutingPolicy>,
    },
    Incremental {
        change: SyncChange,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAck {
    pub applied: u32,
}

pub struct SyncEngine {
    store: Arc<dyn ControlStore>,
    client: FederationClient,
    org_id: String,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ControlStore>, client: FederationClient, org_id: &str) -> Self {
        Self {
            store,
            client,
            org_id: org_id.to_string(),
        }
    }

    /// Snapshot of everything a partner needs to serve this org
    pub async fn gather_full(&self) -> SemaforoResult<SyncPayload> {
        let clusters = self.store.list_clusters(&self.org_id).await?;
        let mut backends = Vec::new();
        for cluster in &clusters {
            backends.extend(self.store.list_backends(&cluster.id).await?);
        }
        let endpoints = self.store.list_endpoints(&self.org_id).await?;
        let policies = self.store.list_policies(&self.org_id).await?;
        Ok(SyncPayload::Full {
            clusters,
            backends,
            endpoints,
            policies,
        })
    }

    async fn local_cluster_id(&self, name: &str) -> SemaforoResult<Option<String>> {
        Ok(self
            .store
            .list_clusters(&self.org_id)
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.id))
    }

    /// Apply a received payload, remapping sender cluster ids to local ones.
    /// Returns the number of rows written or removed.
    pub async fn apply_payload(&self, payload: SyncPayload) -> SemaforoResult<u32> {
        match payload {
            SyncPayload::Full {
                clusters,
                backends,
                endpoints,
                policies,
            } => self.apply_full(clusters, backends, endpoints, policies).await,
            SyncPayload::Incremental { change } => self.apply_change(change).await,
        }
    }

    async fn apply_full(
        &self,
        clusters: Vec<BackendCluster>,
        backends: Vec<Backend>,
        endpoints: Vec<TrafficEndpoint>,
        policies: Vec<RoutingPolicy>,
    ) -> SemaforoResult<u32> {
        let mut applied = 0u32;

        // Clusters first; the upsert resolves each to its local id
        let mut cluster_ids: HashMap<String, String> = HashMap::new();
        for cluster in clusters {
            let remote_id = cluster.id.clone();
            let local = self.store.upsert_cluster(cluster).await?;
            cluster_ids.insert(remote_id, local.id);
            applied += 1;
        }

        for mut backend in backends {
            match cluster_ids.get(&backend.cluster_id) {
                Some(local_id) => {
                    backend.cluster_id = local_id.clone();
                    self.store.upsert_backend(backend).await?;
                    applied += 1;
                }
                None => tracing::warn!(
                    "Sync skipped backend {}:{}: unknown cluster {}",
                    backend.host,
                    backend.port,
                    backend.cluster_id
                ),
            }
        }

        for mut endpoint in endpoints {
            if let Some(remote_id) = endpoint.cluster_id.clone() {
                match cluster_ids.get(&remote_id) {
                    Some(local_id) => endpoint.cluster_id = Some(local_id.clone()),
                    None => {
                        tracing::warn!(
                            "Sync skipped endpoint {}: unknown cluster {}",
                            endpoint.slug,
                            remote_id
                        );
                        continue;
                    }
                }
            }
            self.store.upsert_endpoint(endpoint).await?;
            applied += 1;
        }

        for mut policy in policies {
            let routed_cluster = match &policy.action {
                PolicyAction::RouteToCluster { cluster_id } => Some(cluster_id.clone()),
                _ => None,
            };
            if let Some(remote_id) = routed_cluster {
                match cluster_ids.get(&remote_id) {
                    Some(local_id) => {
                        policy.action = PolicyAction::RouteToCluster {
                            cluster_id: local_id.clone(),
                        };
                    }
                    None => {
                        tracing::warn!(
                            "Sync skipped policy {}: unknown cluster {}",
                            policy.name,
                            remote_id
                        );
                        continue;
                    }
                }
            }
            self.store.upsert_policy(policy).await?;
            applied += 1;
        }

        Ok(applied)
    }

    async fn apply_change(&self, change: SyncChange) -> SemaforoResult<u32> {
        match change {
            SyncChange::UpsertCluster { cluster } => {
                self.store.upsert_cluster(cluster).await?;
                Ok(1)
            }
            SyncChange::DeleteCluster { name } => Ok(u32::from(
                self.store.delete_cluster(&self.org_id, &name).await?,
            )),
            SyncChange::UpsertBackend {
                cluster_name,
                backend,
            } => match self.local_cluster_id(&cluster_name).await? {
                Some(local_id) => {
                    let mut backend = backend;
                    backend.cluster_id = local_id;
                    self.store.upsert_backend(backend).await?;
                    Ok(1)
                }
                None => {
                    tracing::warn!("Change skipped: cluster {} unknown here", cluster_name);
                    Ok(0)
                }
            },
            SyncChange::DeleteBackend {
                cluster_name,
                host,
                port,
            } => match self.local_cluster_id(&cluster_name).await? {
                Some(local_id) => Ok(u32::from(
                    self.store.delete_backend(&local_id, &host, port).await?,
                )),
                None => Ok(0),
            },
            SyncChange::UpsertEndpoint {
                endpoint,
                cluster_name,
            } => {
                let mut endpoint = endpoint;
                match cluster_name {
                    Some(name) => match self.local_cluster_id(&name).await? {
                        Some(local_id) => endpoint.cluster_id = Some(local_id),
                        None => {
                            tracing::warn!("Change skipped: cluster {} unknown here", name);
                            return Ok(0);
                        }
                    },
                    // No cluster context: whatever id came along is foreign
                    None => endpoint.cluster_id = None,
                }
                self.store.upsert_endpoint(endpoint).await?;
                Ok(1)
            }
            SyncChange::DeleteEndpoint { slug } => Ok(u32::from(
                self.store.delete_endpoint(&self.org_id, &slug).await?,
            )),
            SyncChange::UpsertPolicy {
                policy,
                route_cluster_name,
            } => {
                let mut policy = policy;
                if let Some(name) = route_cluster_name {
                    match self.local_cluster_id(&name).await? {
                        Some(local_id) => {
                            policy.action = PolicyAction::RouteToCluster {
                                cluster_id: local_id,
                            };
                        }
                        None => {
                            tracing::warn!("Change skipped: cluster {} unknown here", name);
                            return Ok(0);
                        }
                    }
                }
                self.store.upsert_policy(policy).await?;
                Ok(1)
            }
            SyncChange::DeletePolicy { name } => Ok(u32::from(
                self.store.delete_policy(&self.org_id, &name).await?,
            )),
        }
    }

    /// Push one payload to one partner, recording the attempt on the partner
    /// row and in the sync log
    async fn push_to(
        &self,
        partner: &FederationPartner,
        payload: &SyncPayload,
        sync_type: SyncType,
    ) -> SemaforoResult<SyncLog> {
        let log = SyncLog::start(&partner.id, SyncDirection::Outgoing, sync_type);
        let started = Instant::now();
        let result = self
            .client
            .push_sync(&partner.node_url, &partner.secret_key, payload)
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        let mut row = partner.clone();
        let log = match result {
            Ok(ack) => {
                row.sync_status = PartnerSyncState::Synced;
                row.failed_sync_count = 0;
                row.last_sync_at = Some(chrono::Utc::now());
                tracing::debug!(
                    "Sync to {} applied {} entities in {}ms",
                    partner.node_id,
                    ack.applied,
                    elapsed
                );
                log.complete(ack.applied, elapsed)
            }
            Err(err) => {
                row.sync_status = PartnerSyncState::Failed;
                row.failed_sync_count += 1;
                tracing::warn!(
                    "Sync to {} failed ({} consecutive): {}",
                    partner.node_id,
                    row.failed_sync_count,
                    err
                );
                log.fail(&err.to_string(), elapsed)
            }
        };
        self.store.upsert_partner(row).await?;
        self.store.put_sync_log(log.clone()).await?;
        Ok(log)
    }

    /// Full snapshot to a single partner
    pub async fn sync_partner(&self, partner: &FederationPartner) -> SemaforoResult<SyncLog> {
        let payload = self.gather_full().await?;
        self.push_to(partner, &payload, SyncType::Full).await
    }

    /// Full snapshot to every active partner; each settles independently
    pub async fn sync_all(&self) -> SemaforoResult<Vec<SyncLog>> {
        let payload = self.gather_full().await?;
        let partners = self.store.list_partners(&self.org_id).await?;
        let mut logs = Vec::new();
        for partner in partners.iter().filter(|p| p.is_active) {
            logs.push(self.push_to(partner, &payload, SyncType::Full).await?);
        }
        Ok(logs)
    }

    /// Broadcast one change to every active partner
    pub async fn push_change(&self, change: SyncChange) -> SemaforoResult<Vec<SyncLog>> {
        let payload = SyncPayload::Incremental { change };
        let partners = self.store.list_partners(&self.org_id).await?;
        let mut logs = Vec::new();
        for partner in partners.iter().filter(|p| p.is_active) {
            logs.push(self.push_to(partner, &payload, SyncType::Incremental).await?);
        }
        Ok(logs)
    }

    /// Receiving side: apply the payload and record the attempt
    pub async fn receive(
        &self,
        source_node_id: &str,
        payload: SyncPayload,
    ) -> SemaforoResult<SyncAck> {
        let sync_type = match &payload {
            SyncPayload::Full { .. } => SyncType::Full,
            SyncPayload::Incremental { .. } => SyncType::Incremental,
        };
        let log = SyncLog::start(source_node_id, SyncDirection::Incoming, sync_type);
        let started = Instant::now();
        match self.apply_payload(payload).await {
            Ok(applied) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.store.put_sync_log(log.complete(applied, elapsed)).await?;
                log::info!(
                    "Applied {:?} sync from {}: {} entities",
                    sync_type,
                    source_node_id,
                    applied
                );
                Ok(SyncAck { applied })
            }
            Err(err) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.store
                    .put_sync_log(log.fail(&err.to_string(), elapsed))
                    .await?;
                Err(err)
            }
        }
    }
}

/// Periodic full-sync driver. Only a Principle pushes; the role is re-read
/// every round so a handover takes effect without a restart.
pub async fn run_sync_loop(manager: Arc<FederationManager>) {
    let interval_secs = manager.settings().sync_interval_secs;
    if interval_secs == 0 {
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let engine = manager.sync_engine();

    loop {
        ticker.tick().await;
        let role = match manager.current_config().await {
            Ok(Some(config)) => config.role,
            _ => continue,
        };
        if role != NodeRole::Principle {
            continue;
        }
        match engine.sync_all().await {
            Ok(logs) => {
                let failed = logs
                    .iter()
                    .filter(|l| l.status == SyncLogStatus::Failed)
                    .count();
                if failed > 0 {
                    tracing::warn!("Sync round: {} of {} partner(s) failed", failed, logs.len());
                } else if !logs.is_empty() {
                    tracing::debug!("Sync round completed for {} partner(s)", logs.len());
                }
            }
            Err(err) => tracing::warn!("Sync round aborted: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EndpointType, SessionAffinityMode};
    use crate::store::{MemoryStore, StoreResult};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    fn engine(store: Arc<MemoryStore>) -> SyncEngine {
        SyncEngine::new(store, FederationClient::new().unwrap(), "org-1")
    }

    async fn seed_principle(store: &MemoryStore) -> StoreResult<(String, String)> {
        let cluster = store
            .upsert_cluster(BackendCluster::new("org-1", "main").unwrap())
            .await?;
        let backend = store
            .upsert_backend(Backend::new(&cluster.id, "10.0.0.1", 8080).unwrap())
            .await?;
        let mut endpoint = TrafficEndpoint::new("org-1", "api", EndpointType::LoadBalance).unwrap();
        endpoint.cluster_id = Some(cluster.id.clone());
        endpoint.session_affinity = SessionAffinityMode::Cookie;
        store.upsert_endpoint(endpoint).await?;
        let policy = RoutingPolicy::new(
            "org-1",
            "canary",
            5,
            PolicyAction::RouteToCluster {
                cluster_id: cluster.id.clone(),
            },
        )
        .unwrap();
        store.upsert_policy(policy).await?;
        Ok((cluster.id, backend.id))
    }

    #[tokio::test]
    async fn test_full_apply_remaps_cluster_ids() {
        let principle_store = Arc::new(MemoryStore::new());
        let (remote_cluster_id, _) = seed_principle(&principle_store).await.unwrap();
        let payload = engine(principle_store).gather_full().await.unwrap();

        // The partner already knows a cluster named "main" under its own id
        let partner_store = Arc::new(MemoryStore::new());
        let local = partner_store
            .upsert_cluster(BackendCluster::new("org-1", "main").unwrap())
            .await
            .unwrap();
        assert_ne!(local.id, remote_cluster_id);

        let applied = engine(partner_store.clone())
            .apply_payload(payload)
            .await
            .unwrap();
        assert_eq!(applied, 4);

        // Still one cluster, same local id
        let clusters = partner_store.list_clusters("org-1").await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].id, local.id);

        // Backend, endpoint and policy all point at the local id
        let backends = partner_store.list_backends(&local.id).await.unwrap();
        assert_eq!(backends.len(), 1);
        let endpoint = partner_store
            .find_endpoint_by_slug("api")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(endpoint.cluster_id.as_deref(), Some(local.id.as_str()));
        let policies = partner_store.list_policies("org-1").await.unwrap();
        match &policies[0].action {
            PolicyAction::RouteToCluster { cluster_id } => assert_eq!(cluster_id, &local.id),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incremental_changes_by_natural_key() {
        let store = Arc::new(MemoryStore::new());
        let cluster = store
            .upsert_cluster(BackendCluster::new("org-1", "main").unwrap())
            .await
            .unwrap();
        let engine = engine(store.clone());

        // Upsert addressed by cluster name, backend built with a foreign id
        let backend = Backend::new("remote-cl-id", "10.0.0.9", 9000).unwrap();
        let applied = engine
            .apply_change(SyncChange::UpsertBackend {
                cluster_name: "main".to_string(),
                backend,
            })
            .await
            .unwrap();
        assert_eq!(applied, 1);
        let backends = store.list_backends(&cluster.id).await.unwrap();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].host, "10.0.0.9");

        // Unknown cluster name is skipped, not an error
        let stray = Backend::new("x", "10.0.0.10", 9001).unwrap();
        let applied = engine
            .apply_change(SyncChange::UpsertBackend {
                cluster_name: "nope".to_string(),
                backend: stray,
            })
            .await
            .unwrap();
        assert_eq!(applied, 0);

        let applied = engine
            .apply_change(SyncChange::DeleteBackend {
                cluster_name: "main".to_string(),
                host: "10.0.0.9".to_string(),
                port: 9000,
            })
            .await
            .unwrap();
        assert_eq!(applied, 1);
        assert!(store.list_backends(&cluster.id).await.unwrap().is_empty());

        let applied = engine
            .apply_change(SyncChange::DeleteCluster {
                name: "main".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(applied, 1);
        assert!(store.list_clusters("org-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_partner_records_outcome() {
        let store = Arc::new(MemoryStore::new());
        seed_principle(&store).await.unwrap();

        // A partner that accepts everything
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route(
            "/api/federation/sync/receive",
            post(|| async { Json(serde_json::json!({"applied": 4})) }),
        );
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let partner = store
            .upsert_partner(FederationPartner::new(
                "org-1",
                "node-b",
                "b",
                &format!("http://{}", addr),
                "s3cret",
            ))
            .await
            .unwrap();

        let engine = engine(store.clone());
        let log = engine.sync_partner(&partner).await.unwrap();
        assert_eq!(log.status, SyncLogStatus::Completed);
        assert_eq!(log.entities_synced, 4);

        let row = store
            .find_partner_by_node("org-1", "node-b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.sync_status, PartnerSyncState::Synced);
        assert_eq!(row.failed_sync_count, 0);
        assert!(row.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_sync_increments_streak() {
        let store = Arc::new(MemoryStore::new());
        seed_principle(&store).await.unwrap();
        let partner = store
            .upsert_partner(FederationPartner::new(
                "org-1",
                "node-b",
                "b",
                "http://127.0.0.1:1",
                "s3cret",
            ))
            .await
            .unwrap();

        let engine = engine(store.clone());
        let log = engine.sync_partner(&partner).await.unwrap();
        assert_eq!(log.status, SyncLogStatus::Failed);
        assert!(log.error_message.is_some());

        let row = store
            .find_partner_by_node("org-1", "node-b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.sync_status, PartnerSyncState::Failed);
        assert_eq!(row.failed_sync_count, 1);

        // The streak grows from the stored row
        let log = engine.sync_partner(&row).await.unwrap();
        assert_eq!(log.status, SyncLogStatus::Failed);
        let row = store
            .find_partner_by_node("org-1", "node-b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.failed_sync_count, 2);

        assert_eq!(store.list_sync_logs(&partner.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_receive_applies_and_logs_incoming() {
        let principle_store = Arc::new(MemoryStore::new());
        seed_principle(&principle_store).await.unwrap();
        let payload = engine(principle_store).gather_full().await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let ack = engine.receive("node-principle", payload).await.unwrap();
        assert_eq!(ack.applied, 4);

        let logs = store.list_sync_logs("node-principle").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].direction, SyncDirection::Incoming);
        assert_eq!(logs[0].status, SyncLogStatus::Completed);
    }

    #[test]
    fn test_change_wire_format() {
        let change = SyncChange::DeleteBackend {
            cluster_name: "main".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8080,
        };
        let json = serde_json::to_string(&SyncPayload::Incremental { change }).unwrap();
        assert!(json.contains("\"sync_type\":\"INCREMENTAL\""));
        assert!(json.contains("\"op\":\"DELETE_BACKEND\""));
        assert!(json.contains("\"cluster_name\":\"main\""));
    }
}
