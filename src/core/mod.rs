/// Core domain model shared between the dispatch plane and the federation plane
pub mod backend;
pub mod endpoint;
pub mod federation;
pub mod policy;

pub use backend::{
    Backend, BackendCluster, BackendProtocol, BackendStatus, LoadBalancerConfig,
    LoadBalancerStrategy,
};
pub use endpoint::{AffinityMapping, EndpointType, ProxyMode, SessionAffinityMode, TrafficEndpoint};
pub use federation::{
    FederationConfig, FederationPartner, FederationRequest, FederationRequestStatus,
    FederationRequestType, NodeRole, PartnerSyncState, PromotionRequest, PromotionStatus,
    SyncDirection, SyncLog, SyncLogStatus, SyncType,
};
pub use policy::{ConditionType, PolicyAction, PolicyCondition, PolicyOperator, RoutingPolicy};
