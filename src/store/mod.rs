/// Persistence boundary for the control plane
///
/// The relational store backing the control plane is an external
/// collaborator; this trait captures exactly the typed operations the
/// dispatch and federation planes need. Upserts match on natural keys
/// (endpoint slug, cluster org+name, backend cluster+host+port, policy
/// org+name) so synced entities keep local ids.
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::{
    AffinityMapping, Backend, BackendCluster, BackendStatus, FederationConfig, FederationPartner,
    FederationRequest, LoadBalancerConfig, PromotionRequest, RoutingPolicy, SyncLog,
    TrafficEndpoint,
};
use crate::error::StoreError;

pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ControlStore: Send + Sync {
    // Endpoints
    async fn find_endpoint_by_slug(&self, slug: &str) -> StoreResult<Option<TrafficEndpoint>>;
    async fn find_endpoint(&self, id: &str) -> StoreResult<Option<TrafficEndpoint>>;
    async fn list_endpoints(&self, org_id: &str) -> StoreResult<Vec<TrafficEndpoint>>;
    /// Insert or replace by (org_id, slug); an existing row keeps its id
    async fn upsert_endpoint(&self, endpoint: TrafficEndpoint) -> StoreResult<TrafficEndpoint>;
    async fn delete_endpoint(&self, org_id: &str, slug: &str) -> StoreResult<bool>;
    /// Fold one dispatch outcome into the endpoint counters (best-effort caller)
    async fn record_endpoint_result(
        &self,
        endpoint_id: &str,
        latency_ms: f64,
        is_error: bool,
    ) -> StoreResult<()>;

    // Clusters
    async fn find_cluster(&self, id: &str) -> StoreResult<Option<BackendCluster>>;
    async fn list_clusters(&self, org_id: &str) -> StoreResult<Vec<BackendCluster>>;
    /// Insert or replace by (org_id, name); an existing row keeps its id
    async fn upsert_cluster(&self, cluster: BackendCluster) -> StoreResult<BackendCluster>;
    async fn delete_cluster(&self, org_id: &str, name: &str) -> StoreResult<bool>;

    // Backends
    async fn find_backend(&self, id: &str) -> StoreResult<Option<Backend>>;
    async fn list_backends(&self, cluster_id: &str) -> StoreResult<Vec<Backend>>;
    async fn list_all_backends(&self) -> StoreResult<Vec<Backend>>;
    /// Insert or replace by (cluster_id, host, port); an existing row keeps its id
    async fn upsert_backend(&self, backend: Backend) -> StoreResult<Backend>;
    async fn delete_backend(&self, cluster_id: &str, host: &str, port: u16) -> StoreResult<bool>;
    async fn update_backend_status(&self, id: &str, status: BackendStatus) -> StoreResult<()>;
    /// Shift the in-flight connection gauge; clamped at zero
    async fn adjust_backend_connections(&self, id: &str, delta: i64) -> StoreResult<()>;

    // Load balancer overrides
    async fn find_lb_config(&self, cluster_id: &str) -> StoreResult<Option<LoadBalancerConfig>>;
    async fn upsert_lb_config(&self, config: LoadBalancerConfig) -> StoreResult<LoadBalancerConfig>;

    // Routing policies
    async fn list_policies(&self, org_id: &str) -> StoreResult<Vec<RoutingPolicy>>;
    /// Insert or replace by (org_id, name); an existing row keeps its id
    async fn upsert_policy(&self, policy: RoutingPolicy) -> StoreResult<RoutingPolicy>;
    async fn delete_policy(&self, org_id: &str, name: &str) -> StoreResult<bool>;

    // Session affinity
    async fn find_affinity(
        &self,
        endpoint_id: &str,
        client_key: &str,
    ) -> StoreResult<Option<AffinityMapping>>;
    async fn put_affinity(&self, mapping: AffinityMapping) -> StoreResult<()>;
    async fn delete_affinity(&self, endpoint_id: &str, client_key: &str) -> StoreResult<bool>;
    async fn purge_expired_affinity(&self, now: DateTime<Utc>) -> StoreResult<usize>;
    async fn count_affinity(&self) -> StoreResult<usize>;

    // Federation
    async fn get_federation_config(&self, org_id: &str) -> StoreResult<Option<FederationConfig>>;
    async fn put_federation_config(&self, config: FederationConfig) -> StoreResult<()>;
    async fn list_partners(&self, org_id: &str) -> StoreResult<Vec<FederationPartner>>;
    async fn find_partner_by_node(
        &self,
        org_id: &str,
        node_id: &str,
    ) -> StoreResult<Option<FederationPartner>>;
    /// Insert or replace by (org_id, node_id); an existing row keeps its id
    async fn upsert_partner(&self, partner: FederationPartner) -> StoreResult<FederationPartner>;
    async fn delete_partner(&self, org_id: &str, node_id: &str) -> StoreResult<bool>;
    async fn clear_partners(&self, org_id: &str) -> StoreResult<usize>;
    async fn put_federation_request(&self, request: FederationRequest) -> StoreResult<()>;
    async fn find_federation_request(&self, id: &str) -> StoreResult<Option<FederationRequest>>;
    async fn put_promotion(&self, request: PromotionRequest) -> StoreResult<()>;
    async fn find_promotion(&self, id: &str) -> StoreResult<Option<PromotionRequest>>;
    async fn list_pending_promotions(&self, org_id: &str) -> StoreResult<Vec<PromotionRequest>>;
    async fn put_sync_log(&self, log: SyncLog) -> StoreResult<()>;
    async fn list_sync_logs(&self, partner_id: &str) -> StoreResult<Vec<SyncLog>>;
}
