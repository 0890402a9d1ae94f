/// In-memory store used by tests and single-node deployments
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::core::{
    AffinityMapping, Backend, BackendCluster, BackendStatus, FederationConfig, FederationPartner,
    FederationRequest, LoadBalancerConfig, PromotionRequest, PromotionStatus, RoutingPolicy,
    SyncLog, TrafficEndpoint,
};
use crate::store::{ControlStore, StoreResult};

type Table<T> = RwLock<HashMap<String, T>>;

/// All tables keyed by entity id except affinity, which is keyed by
/// (endpoint_id, client_key) directly.
#[derive(Default)]
pub struct MemoryStore {
    endpoints: Table<TrafficEndpoint>,
    clusters: Table<BackendCluster>,
    backends: Table<Backend>,
    lb_configs: Table<LoadBalancerConfig>,
    policies: Table<RoutingPolicy>,
    affinity: Table<AffinityMapping>,
    federation_configs: Table<FederationConfig>,
    partners: Table<FederationPartner>,
    federation_requests: Table<FederationRequest>,
    promotions: Table<PromotionRequest>,
    sync_logs: Table<SyncLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn affinity_key(endpoint_id: &str, client_key: &str) -> String {
        format!("{}:{}", endpoint_id, client_key)
    }
}

#[async_trait]
impl ControlStore for MemoryStore {
    async fn find_endpoint_by_slug(&self, slug: &str) -> StoreResult<Option<TrafficEndpoint>> {
        let endpoints = self.endpoints.read().await;
        Ok(endpoints.values().find(|e| e.slug == slug).cloned())
    }

    async fn find_endpoint(&self, id: &str) -> StoreResult<Option<TrafficEndpoint>> {
        let endpoints = self.endpoints.read().await;
        Ok(endpoints.get(id).cloned())
    }

    async fn list_endpoints(&self, org_id: &str) -> StoreResult<Vec<TrafficEndpoint>> {
        let endpoints = self.endpoints.read().await;
        Ok(endpoints
            .values()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn upsert_endpoint(&self, mut endpoint: TrafficEndpoint) -> StoreResult<TrafficEndpoint> {
        let mut endpoints = self.endpoints.write().await;
        if let Some(existing) = endpoints
            .values()
            .find(|e| e.org_id == endpoint.org_id && e.slug == endpoint.slug)
        {
            endpoint.id = existing.id.clone();
        }
        endpoints.insert(endpoint.id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    async fn delete_endpoint(&self, org_id: &str, slug: &str) -> StoreResult<bool> {
        let mut endpoints = self.endpoints.write().await;
        let id = endpoints
            .values()
            .find(|e| e.org_id == org_id && e.slug == slug)
            .map(|e| e.id.clone());
        Ok(match id {
            Some(id) => endpoints.remove(&id).is_some(),
            None => false,
        })
    }

    async fn record_endpoint_result(
        &self,
        endpoint_id: &str,
        latency_ms: f64,
        is_error: bool,
    ) -> StoreResult<()> {
        let mut endpoints = self.endpoints.write().await;
        if let Some(endpoint) = endpoints.get_mut(endpoint_id) {
            let total = endpoint.total_requests as f64;
            endpoint.avg_latency_ms = (endpoint.avg_latency_ms * total + latency_ms) / (total + 1.0);
            endpoint.total_requests += 1;
            if is_error {
                endpoint.total_errors += 1;
            }
        }
        Ok(())
    }

    async fn find_cluster(&self, id: &str) -> StoreResult<Option<BackendCluster>> {
        let clusters = self.clusters.read().await;
        Ok(clusters.get(id).cloned())
    }

    async fn list_clusters(&self, org_id: &str) -> StoreResult<Vec<BackendCluster>> {
        let clusters = self.clusters.read().await;
        Ok(clusters
            .values()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn upsert_cluster(&self, mut cluster: BackendCluster) -> StoreResult<BackendCluster> {
        let mut clusters = self.clusters.write().await;
        if let Some(existing) = clusters
            .values()
            .find(|c| c.org_id == cluster.org_id && c.name == cluster.name)
        {
            cluster.id = existing.id.clone();
        }
        clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn delete_cluster(&self, org_id: &str, name: &str) -> StoreResult<bool> {
        let mut clusters = self.clusters.write().await;
        let id = clusters
            .values()
            .find(|c| c.org_id == org_id && c.name == name)
            .map(|c| c.id.clone());
        match id {
            Some(id) => Ok(clusters.remove(&id).is_some()),
            None => Ok(false),
        }
    }

    async fn find_backend(&self, id: &str) -> StoreResult<Option<Backend>> {
        let backends = self.backends.read().await;
        Ok(backends.get(id).cloned())
    }

    async fn list_backends(&self, cluster_id: &str) -> StoreResult<Vec<Backend>> {
        let backends = self.backends.read().await;
        let mut result: Vec<Backend> = backends
            .values()
            .filter(|b| b.cluster_id == cluster_id)
            .cloned()
            .collect();
        // Stable order keeps round-robin rotation meaningful
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    async fn list_all_backends(&self) -> StoreResult<Vec<Backend>> {
        let backends = self.backends.read().await;
        Ok(backends.values().cloned().collect())
    }

    async fn upsert_backend(&self, mut backend: Backend) -> StoreResult<Backend> {
        let mut backends = self.backends.write().await;
        if let Some(existing) = backends.values().find(|b| {
            b.cluster_id == backend.cluster_id && b.host == backend.host && b.port == backend.port
        }) {
            backend.id = existing.id.clone();
        }
        backends.insert(backend.id.clone(), backend.clone());
        Ok(backend)
    }

    async fn delete_backend(&self, cluster_id: &str, host: &str, port: u16) -> StoreResult<bool> {
        let mut backends = self.backends.write().await;
        let id = backends
            .values()
            .find(|b| b.cluster_id == cluster_id && b.host == host && b.port == port)
            .map(|b| b.id.clone());
        match id {
            Some(id) => Ok(backends.remove(&id).is_some()),
            None => Ok(false),
        }
    }

    async fn update_backend_status(&self, id: &str, status: BackendStatus) -> StoreResult<()> {
        let mut backends = self.backends.write().await;
        if let Some(backend) = backends.get_mut(id) {
            backend.status = status;
        }
        Ok(())
    }

    async fn adjust_backend_connections(&self, id: &str, delta: i64) -> StoreResult<()> {
        let mut backends = self.backends.write().await;
        if let Some(backend) = backends.get_mut(id) {
            let current = backend.current_connections as i64;
            backend.current_connections = (current + delta).max(0) as u32;
        }
        Ok(())
    }

    async fn find_lb_config(&self, cluster_id: &str) -> StoreResult<Option<LoadBalancerConfig>> {
        let configs = self.lb_configs.read().await;
        Ok(configs
            .values()
            .find(|c| c.cluster_id == cluster_id)
            .cloned())
    }

    async fn upsert_lb_config(
        &self,
        mut config: LoadBalancerConfig,
    ) -> StoreResult<LoadBalancerConfig> {
        let mut configs = self.lb_configs.write().await;
        if let Some(existing) = configs
            .values()
            .find(|c| c.cluster_id == config.cluster_id)
        {
            config.id = existing.id.clone();
        }
        configs.insert(config.id.clone(), config.clone());
        Ok(config)
    }

    async fn list_policies(&self, org_id: &str) -> StoreResult<Vec<RoutingPolicy>> {
        let policies = self.policies.read().await;
        Ok(policies
            .values()
            .filter(|p| p.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn upsert_policy(&self, mut policy: RoutingPolicy) -> StoreResult<RoutingPolicy> {
        let mut policies = self.policies.write().await;
        if let Some(existing) = policies
            .values()
            .find(|p| p.org_id == policy.org_id && p.name == policy.name)
        {
            policy.id = existing.id.clone();
        }
        policies.insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }

    async fn delete_policy(&self, org_id: &str, name: &str) -> StoreResult<bool> {
        let mut policies = self.policies.write().await;
        let id = policies
            .values()
            .find(|p| p.org_id == org_id && p.name == name)
            .map(|p| p.id.clone());
        match id {
            Some(id) => Ok(policies.remove(&id).is_some()),
            None => Ok(false),
        }
    }

    async fn find_affinity(
        &self,
        endpoint_id: &str,
        client_key: &str,
    ) -> StoreResult<Option<AffinityMapping>> {
        let affinity = self.affinity.read().await;
        Ok(affinity
            .get(&Self::affinity_key(endpoint_id, client_key))
            .cloned())
    }

    async fn put_affinity(&self, mapping: AffinityMapping) -> StoreResult<()> {
        let mut affinity = self.affinity.write().await;
        let key = Self::affinity_key(&mapping.endpoint_id, &mapping.client_key);
        affinity.insert(key, mapping);
        Ok(())
    }

    async fn delete_affinity(&self, endpoint_id: &str, client_key: &str) -> StoreResult<bool> {
        let mut affinity = self.affinity.write().await;
        Ok(affinity
            .remove(&Self::affinity_key(endpoint_id, client_key))
            .is_some())
    }

    async fn purge_expired_affinity(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut affinity = self.affinity.write().await;
        let before = affinity.len();
        affinity.retain(|_, mapping| !mapping.is_expired(now));
        Ok(before - affinity.len())
    }

    async fn count_affinity(&self) -> StoreResult<usize> {
        let affinity = self.affinity.read().await;
        Ok(affinity.len())
    }

    async fn get_federation_config(&self, org_id: &str) -> StoreResult<Option<FederationConfig>> {
        let configs = self.federation_configs.read().await;
        Ok(configs.values().find(|c| c.org_id == org_id).cloned())
    }

    async fn put_federation_config(&self, config: FederationConfig) -> StoreResult<()> {
        let mut configs = self.federation_configs.write().await;
        let id = configs
            .values()
            .find(|c| c.org_id == config.org_id)
            .map(|c| c.id.clone())
            .unwrap_or_else(|| config.id.clone());
        let mut config = config;
        config.id = id.clone();
        configs.insert(id, config);
        Ok(())
    }

    async fn list_partners(&self, org_id: &str) -> StoreResult<Vec<FederationPartner>> {
        let partners = self.partners.read().await;
        let mut result: Vec<FederationPartner> = partners
            .values()
            .filter(|p| p.org_id == org_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(result)
    }

    async fn find_partner_by_node(
        &self,
        org_id: &str,
        node_id: &str,
    ) -> StoreResult<Option<FederationPartner>> {
        let partners = self.partners.read().await;
        Ok(partners
            .values()
            .find(|p| p.org_id == org_id && p.node_id == node_id)
            .cloned())
    }

    async fn upsert_partner(
        &self,
        mut partner: FederationPartner,
    ) -> StoreResult<FederationPartner> {
        let mut partners = self.partners.write().await;
        if let Some(existing) = partners
            .values()
            .find(|p| p.org_id == partner.org_id && p.node_id == partner.node_id)
        {
            partner.id = existing.id.clone();
        }
        partners.insert(partner.id.clone(), partner.clone());
        Ok(partner)
    }

    async fn delete_partner(&self, org_id: &str, node_id: &str) -> StoreResult<bool> {
        let mut partners = self.partners.write().await;
        let id = partners
            .values()
            .find(|p| p.org_id == org_id && p.node_id == node_id)
            .map(|p| p.id.clone());
        Ok(match id {
            Some(id) => partners.remove(&id).is_some(),
            None => false,
        })
    }

    async fn clear_partners(&self, org_id: &str) -> StoreResult<usize> {
        let mut partners = self.partners.write().await;
        let before = partners.len();
        partners.retain(|_, p| p.org_id != org_id);
        Ok(before - partners.len())
    }

    async fn put_federation_request(&self, request: FederationRequest) -> StoreResult<()> {
        let mut requests = self.federation_requests.write().await;
        requests.insert(request.id.clone(), request);
        Ok(())
    }

    async fn find_federation_request(&self, id: &str) -> StoreResult<Option<FederationRequest>> {
        let requests = self.federation_requests.read().await;
        Ok(requests.get(id).cloned())
    }

    async fn put_promotion(&self, request: PromotionRequest) -> StoreResult<()> {
        let mut promotions = self.promotions.write().await;
        promotions.insert(request.id.clone(), request);
        Ok(())
    }

    async fn find_promotion(&self, id: &str) -> StoreResult<Option<PromotionRequest>> {
        let promotions = self.promotions.read().await;
        Ok(promotions.get(id).cloned())
    }

    async fn list_pending_promotions(&self, org_id: &str) -> StoreResult<Vec<PromotionRequest>> {
        let promotions = self.promotions.read().await;
        Ok(promotions
            .values()
            .filter(|p| p.org_id == org_id && p.status == PromotionStatus::Pending)
            .cloned()
            .collect())
    }

    async fn put_sync_log(&self, log: SyncLog) -> StoreResult<()> {
        let mut logs = self.sync_logs.write().await;
        logs.insert(log.id.clone(), log);
        Ok(())
    }

    async fn list_sync_logs(&self, partner_id: &str) -> StoreResult<Vec<SyncLog>> {
        let logs = self.sync_logs.read().await;
        let mut result: Vec<SyncLog> = logs
            .values()
            .filter(|l| l.partner_id == partner_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }
}
