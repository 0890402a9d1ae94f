/// Federation across semaforo nodes
///
/// One node per org is the Principle (authoritative configuration source);
/// Partners replicate from it and can take the role over through the
/// promotion protocol. Affinity-keyed requests are routed to the peer that
/// owns the key on the consistent hash ring, so stickiness holds across the
/// whole federation rather than one node.
pub mod client;
pub mod heartbeat;
pub mod peers;
pub mod promotion;
pub mod sync;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::response::Response;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::{
    FederationConfig, FederationPartner, FederationRequest, FederationRequestStatus,
    FederationRequestType, NodeRole, PromotionRequest, PromotionStatus,
};
use crate::error::{FederationError, ProxyError, SemaforoError, SemaforoResult, StoreError};
use crate::proxy::InboundRequest;
use crate::store::{ControlStore, StoreResult};

pub use client::FederationClient;
pub use peers::{PeerNode, PeerRegistry};
pub use sync::SyncEngine;

pub const SECRET_HEADER: &str = "x-federation-secret";
pub const FORWARDED_HEADER: &str = "x-federation-forwarded";
pub const SOURCE_HEADER: &str = "x-federation-source";
pub const HOP_HEADER: &str = "x-federation-hop";

/// A request may cross the federation at most this many times
pub const MAX_FORWARD_HOPS: u32 = 3;
/// Consecutive heartbeat failures before a Partner seeks promotion
pub const HEARTBEAT_FAILURE_LIMIT: u32 = 3;

/// Partnership requests expire if nobody acts on them
const PARTNER_REQUEST_TTL_SECS: u64 = 3600;

/// Tunables for federation behavior, fed from the application config
#[derive(Debug, Clone)]
pub struct FederationSettings {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub promotion_deadline_secs: u64,
    pub sync_interval_secs: u64,
    /// Peers above this load percentage are skipped when routing
    pub forward_load_max: u8,
    /// Denominator for this node's own load percentage
    pub max_connections: u32,
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 15,
            promotion_deadline_secs: 30,
            sync_interval_secs: 300,
            forward_load_max: 85,
            max_connections: 10_000,
        }
    }
}

/// Where an affinity-keyed request should be handled
#[derive(Debug, Clone)]
pub enum RouteDecision {
    Local,
    Peer(PeerNode),
}

/// Identity block exchanged in federation payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub node_id: String,
    pub node_name: String,
    pub node_url: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub org_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_url: String,
    pub role: NodeRole,
    pub load_percent: u8,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub node_id: String,
    pub role: NodeRole,
    pub load_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerJoinRequest {
    pub org_id: String,
    pub requester: PeerSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerAccepted {
    pub principle: PeerSummary,
}

/// Handoff package for a partner being promoted: who is stepping down and
/// every other partner it now owns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BecomePrinciplePayload {
    pub org_id: String,
    pub promotion_id: Option<String>,
    pub demoted_principle: PeerSummary,
    pub partners: Vec<PeerSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPrinciplePayload {
    pub org_id: String,
    pub principle: PeerSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionDecisionPayload {
    pub promotion_id: String,
}

pub struct FederationManager {
    store: Arc<dyn ControlStore>,
    org_id: String,
    node_id: String,
    settings: FederationSettings,
    registry: PeerRegistry,
    client: FederationClient,
    active_requests: AtomicUsize,
}

impl FederationManager {
    pub fn new(
        store: Arc<dyn ControlStore>,
        org_id: &str,
        node_id: &str,
        settings: FederationSettings,
    ) -> Result<Self, String> {
        Ok(Self {
            store,
            org_id: org_id.to_string(),
            node_id: node_id.to_string(),
            registry: PeerRegistry::new(settings.heartbeat_timeout_secs),
            client: FederationClient::new()?,
            settings,
            active_requests: AtomicUsize::new(0),
        })
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn settings(&self) -> &FederationSettings {
        &self.settings
    }

    /// Sync engine sharing this manager's store and HTTP client
    pub fn sync_engine(&self) -> SyncEngine {
        SyncEngine::new(Arc::clone(&self.store), self.client.clone(), &self.org_id)
    }

    // ---- load tracking ----

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    /// Active requests as a percentage of the configured capacity
    pub fn current_load(&self) -> u8 {
        let active = self.active_requests.load(Ordering::Relaxed) as u64;
        let max = self.settings.max_connections.max(1) as u64;
        ((active * 100) / max).min(100) as u8
    }

    // ---- persisted state ----

    pub async fn current_config(&self) -> StoreResult<Option<FederationConfig>> {
        self.store.get_federation_config(&self.org_id).await
    }

    async fn require_config(&self) -> SemaforoResult<FederationConfig> {
        self.current_config()
            .await?
            .ok_or_else(|| SemaforoError::from(FederationError::NotConfigured))
    }

    /// Inbound federation calls must present the org secret
    pub async fn validate_secret(&self, presented: &str) -> bool {
        match self.current_config().await {
            Ok(Some(config)) => !config.secret_key.is_empty() && config.secret_key == presented,
            _ => false,
        }
    }

    /// Rebuild the peer cache and hash ring from the persisted role state
    pub async fn refresh_registry(&self) -> SemaforoResult<()> {
        let config = self.require_config().await?;
        let partners = self.store.list_partners(&self.org_id).await?;
        self.registry.rebuild(&config, &partners).await;
        Ok(())
    }

    fn self_summary(config: &FederationConfig) -> PeerSummary {
        PeerSummary {
            node_id: config.node_id.clone(),
            node_name: config.node_name.clone(),
            node_url: config.node_url.clone(),
            secret_key: config.secret_key.clone(),
        }
    }

    // ---- request routing ----

    /// Decide where an affinity key belongs. The ring owner wins unless it is
    /// unhealthy or overloaded, in which case its replicas are tried in ring
    /// order; this node is always the final fallback.
    pub async fn route_request(&self, affinity_key: &str) -> RouteDecision {
        if self.registry.ring_size().await <= 1 {
            return RouteDecision::Local;
        }
        let owner = match self.registry.owner(affinity_key).await {
            Some(owner) => owner,
            None => return RouteDecision::Local,
        };
        if owner.is_self {
            return RouteDecision::Local;
        }
        if owner.healthy && owner.load_percent <= self.settings.forward_load_max {
            return RouteDecision::Peer(owner);
        }

        for peer in self.registry.replicas(affinity_key).await {
            if peer.node_id == owner.node_id {
                continue;
            }
            if peer.is_self {
                return RouteDecision::Local;
            }
            if peer.healthy && peer.load_percent <= self.settings.forward_load_max {
                return RouteDecision::Peer(peer);
            }
        }
        RouteDecision::Local
    }

    /// Forward a request to a peer. The hop ceiling is enforced before any
    /// outbound call is made.
    pub async fn forward(
        &self,
        peer: &PeerNode,
        inbound: &InboundRequest,
    ) -> Result<Response, ProxyError> {
        let hops = inbound
            .headers
            .get(HOP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        if hops >= MAX_FORWARD_HOPS {
            return Err(ProxyError::TooManyHops { hops });
        }
        self.client
            .forward_request(peer, inbound, hops + 1, &self.node_id)
            .await
    }

    // ---- heartbeats ----

    /// Record a heartbeat from a peer and answer with this node's state
    pub async fn handle_heartbeat(&self, beat: HeartbeatPayload) -> SemaforoResult<HeartbeatAck> {
        let config = self.require_config().await?;
        if beat.org_id != self.org_id {
            return Err(FederationError::Rejected {
                node: beat.node_id,
                message: "heartbeat for a different org".to_string(),
            }
            .into());
        }

        if config.principle_node_id.as_deref() == Some(beat.node_id.as_str()) {
            let mut config = config.clone();
            config.last_heartbeat = Some(Utc::now());
            self.store.put_federation_config(config).await?;
        } else if let Some(mut partner) = self
            .store
            .find_partner_by_node(&self.org_id, &beat.node_id)
            .await?
        {
            partner.last_heartbeat = Some(Utc::now());
            self.store.upsert_partner(partner).await?;
        } else {
            log::debug!("Heartbeat from unknown node {}", beat.node_id);
        }

        self.registry
            .record_heartbeat(&beat.node_id, beat.load_percent)
            .await;

        Ok(HeartbeatAck {
            node_id: self.node_id.clone(),
            role: config.role,
            load_percent: self.current_load(),
        })
    }

    /// One heartbeat from this Partner to its Principle
    pub(crate) async fn heartbeat_principle(&self) -> SemaforoResult<HeartbeatAck> {
        let config = self.require_config().await?;
        if config.role != NodeRole::Partner {
            let actual = config.role.to_string();
            return Err(FederationError::role_violation("PARTNER", actual.as_str()).into());
        }
        let principle_url = config
            .principle_url
            .clone()
            .ok_or_else(|| SemaforoError::from(FederationError::NotConfigured))?;

        let payload = HeartbeatPayload {
            org_id: self.org_id.clone(),
            node_id: config.node_id.clone(),
            node_name: config.node_name.clone(),
            node_url: config.node_url.clone(),
            role: config.role,
            load_percent: self.current_load(),
            timestamp: Utc::now(),
        };
        let ack = self
            .client
            .send_heartbeat(&principle_url, &config.secret_key, &payload)
            .await?;

        let mut config = config;
        config.last_heartbeat = Some(Utc::now());
        let principle_id = config.principle_node_id.clone();
        self.store.put_federation_config(config).await?;
        if let Some(principle_id) = principle_id {
            self.registry
                .record_heartbeat(&principle_id, ack.load_percent)
                .await;
        }
        Ok(ack)
    }

    /// Drop lapsed peers from the ring; returns the expired node ids
    pub(crate) async fn expire_stale_peers(&self) -> Vec<String> {
        self.registry.expire_stale().await
    }

    // ---- partnership ----

    /// Join another node's federation as a Partner
    pub async fn request_partnership(&self, target_url: &str) -> SemaforoResult<PartnerAccepted> {
        let config = self.require_config().await?;
        if config.role != NodeRole::Standalone {
            let actual = config.role.to_string();
            return Err(FederationError::role_violation("STANDALONE", actual.as_str()).into());
        }

        let mut request = FederationRequest::new(
            &self.org_id,
            FederationRequestType::Outgoing,
            &config.node_id,
            &config.node_url,
            target_url,
            &config.secret_key,
            PARTNER_REQUEST_TTL_SECS,
        );
        self.store.put_federation_request(request.clone()).await?;

        let join = PartnerJoinRequest {
            org_id: self.org_id.clone(),
            requester: Self::self_summary(&config),
        };
        let accepted = self
            .client
            .submit_partner_request(target_url, &config.secret_key, &join)
            .await?;

        request.status = FederationRequestStatus::Approved;
        self.store.put_federation_request(request).await?;

        let mut config = config;
        config.role = NodeRole::Partner;
        config.principle_node_id = Some(accepted.principle.node_id.clone());
        config.principle_url = Some(accepted.principle.node_url.clone());
        config.last_heartbeat = Some(Utc::now());
        self.store.put_federation_config(config).await?;
        self.refresh_registry().await?;

        log::info!(
            "Joined federation as partner of {} ({})",
            accepted.principle.node_id,
            accepted.principle.node_url
        );
        Ok(accepted)
    }

    /// Accept a partnership request (secret already checked by the caller).
    /// A Standalone node accepting its first partner becomes the Principle.
    pub async fn handle_incoming_request(
        &self,
        join: PartnerJoinRequest,
    ) -> SemaforoResult<PartnerAccepted> {
        let config = self.require_config().await?;
        if join.org_id != self.org_id {
            return Err(FederationError::Rejected {
                node: join.requester.node_id,
                message: "partnership request for a different org".to_string(),
            }
            .into());
        }
        if config.role == NodeRole::Partner {
            let actual = config.role.to_string();
            return Err(FederationError::role_violation("PRINCIPLE", actual.as_str()).into());
        }

        let mut record = FederationRequest::new(
            &self.org_id,
            FederationRequestType::Incoming,
            &join.requester.node_id,
            &join.requester.node_url,
            &config.node_url,
            &join.requester.secret_key,
            PARTNER_REQUEST_TTL_SECS,
        );
        record.status = FederationRequestStatus::Approved;
        self.store.put_federation_request(record).await?;

        let mut partner = FederationPartner::new(
            &self.org_id,
            &join.requester.node_id,
            &join.requester.node_name,
            &join.requester.node_url,
            &join.requester.secret_key,
        );
        partner.last_heartbeat = Some(Utc::now());
        self.store.upsert_partner(partner).await?;

        let mut config = config;
        if config.role == NodeRole::Standalone {
            config.role = NodeRole::Principle;
            self.store.put_federation_config(config.clone()).await?;
        }
        self.refresh_registry().await?;

        log::info!("Accepted partner {}", join.requester.node_id);
        Ok(PartnerAccepted {
            principle: Self::self_summary(&config),
        })
    }

    // ---- promotion ----

    /// Ask the Principle for the role. An unreachable Principle means
    /// immediate self-promotion; otherwise the request stays pending and the
    /// watchdog enforces the deadline.
    pub async fn request_promotion(&self, reason: &str) -> SemaforoResult<PromotionRequest> {
        let config = self.require_config().await?;
        if config.role != NodeRole::Partner {
            let actual = config.role.to_string();
            return Err(FederationError::role_violation("PARTNER", actual.as_str()).into());
        }
        let principle_url = config
            .principle_url
            .clone()
            .ok_or_else(|| SemaforoError::from(FederationError::NotConfigured))?;

        let promotion = PromotionRequest::new(
            &self.org_id,
            &config.node_id,
            config.principle_node_id.clone(),
            reason,
            self.settings.promotion_deadline_secs,
        );
        self.store.put_promotion(promotion.clone()).await?;
        tracing::info!(
            "Requesting promotion {} from principle at {}",
            promotion.id,
            principle_url
        );

        match self
            .client
            .send_promotion_request(&principle_url, &config.secret_key, &promotion)
            .await
        {
            Ok(()) => Ok(promotion),
            Err(err) => {
                tracing::warn!(
                    "Principle unreachable during promotion request, self-promoting: {}",
                    err
                );
                self.auto_promote(&promotion).await
            }
        }
    }

    /// Persist a promotion request received from a Partner for the operator
    /// (or an automated policy) to answer
    pub async fn handle_promotion_request(
        &self,
        promotion: PromotionRequest,
    ) -> SemaforoResult<()> {
        let config = self.require_config().await?;
        if config.role != NodeRole::Principle {
            let actual = config.role.to_string();
            return Err(FederationError::role_violation("PRINCIPLE", actual.as_str()).into());
        }
        tracing::info!(
            "Partner {} requests promotion ({})",
            promotion.requester_node_id,
            promotion.reason
        );
        self.store.put_promotion(promotion).await?;
        Ok(())
    }

    /// Approve or reject a pending promotion request.
    ///
    /// Approval runs the become-principle handshake against the requester and
    /// then flips this node to Partner, clearing its partner table. Rejection
    /// notifies the requester best-effort; a missed rejection settles at the
    /// requester's deadline instead.
    pub async fn respond_promotion(
        &self,
        promotion_id: &str,
        approve: bool,
    ) -> SemaforoResult<PromotionRequest> {
        let config = self.require_config().await?;
        if config.role != NodeRole::Principle {
            let actual = config.role.to_string();
            return Err(FederationError::role_violation("PRINCIPLE", actual.as_str()).into());
        }
        let mut promotion = self
            .store
            .find_promotion(promotion_id)
            .await?
            .ok_or_else(|| StoreError::not_found("promotion request", promotion_id))?;
        if promotion.status.is_terminal() {
            return Err(FederationError::promotion(format!(
                "request {} is already {:?}",
                promotion.id, promotion.status
            ))
            .into());
        }
        let requester = self
            .store
            .find_partner_by_node(&self.org_id, &promotion.requester_node_id)
            .await?
            .ok_or_else(|| {
                SemaforoError::from(FederationError::promotion(format!(
                    "requesting partner {} is unknown",
                    promotion.requester_node_id
                )))
            })?;

        if approve {
            let partners = self.store.list_partners(&self.org_id).await?;
            let transferred: Vec<PeerSummary> = partners
                .iter()
                .filter(|p| p.is_active && p.node_id != requester.node_id)
                .map(|p| PeerSummary {
                    node_id: p.node_id.clone(),
                    node_name: p.node_name.clone(),
                    node_url: p.node_url.clone(),
                    secret_key: p.secret_key.clone(),
                })
                .collect();
            let payload = BecomePrinciplePayload {
                org_id: self.org_id.clone(),
                promotion_id: Some(promotion.id.clone()),
                demoted_principle: Self::self_summary(&config),
                partners: transferred,
            };
            self.client
                .send_become_principle(&requester.node_url, &requester.secret_key, &payload)
                .await?;

            promotion.status = PromotionStatus::Approved;
            self.store.put_promotion(promotion.clone()).await?;

            let mut config = config;
            config.role = NodeRole::Partner;
            config.principle_node_id = Some(requester.node_id.clone());
            config.principle_url = Some(requester.node_url.clone());
            config.last_heartbeat = Some(Utc::now());
            self.store.put_federation_config(config).await?;
            self.store.clear_partners(&self.org_id).await?;
            self.refresh_registry().await?;
            tracing::info!("Handed principle role to {}", requester.node_id);
        } else {
            promotion.status = PromotionStatus::Rejected;
            self.store.put_promotion(promotion.clone()).await?;
            let payload = PromotionDecisionPayload {
                promotion_id: promotion.id.clone(),
            };
            if let Err(err) = self
                .client
                .send_promotion_rejected(&requester.node_url, &requester.secret_key, &payload)
                .await
            {
                tracing::warn!(
                    "Rejection callback to {} failed: {}",
                    requester.node_id,
                    err
                );
            }
            tracing::info!("Rejected promotion request {}", promotion.id);
        }
        Ok(promotion)
    }

    /// Proactive handoff: the Principle promotes a named Partner through the
    /// same handshake an approved request uses
    pub async fn promote_partner(&self, node_id: &str) -> SemaforoResult<PromotionRequest> {
        let config = self.require_config().await?;
        let partner = self
            .store
            .find_partner_by_node(&self.org_id, node_id)
            .await?
            .ok_or_else(|| StoreError::not_found("partner", node_id))?;
        let promotion = PromotionRequest::new(
            &self.org_id,
            &partner.node_id,
            Some(config.node_id.clone()),
            "principle-initiated handoff",
            self.settings.promotion_deadline_secs,
        );
        self.store.put_promotion(promotion.clone()).await?;
        self.respond_promotion(&promotion.id, true).await
    }

    /// Take over the Principle role: record the demoted Principle and the
    /// transferred partners, settle the pending request, then broadcast the
    /// new pointers
    pub async fn become_principle(&self, payload: BecomePrinciplePayload) -> SemaforoResult<()> {
        let config = self.require_config().await?;

        let mut config = config;
        config.role = NodeRole::Principle;
        config.principle_node_id = None;
        config.principle_url = None;
        self.store.put_federation_config(config.clone()).await?;

        let mut demoted = FederationPartner::new(
            &self.org_id,
            &payload.demoted_principle.node_id,
            &payload.demoted_principle.node_name,
            &payload.demoted_principle.node_url,
            &payload.demoted_principle.secret_key,
        );
        demoted.last_heartbeat = Some(Utc::now());
        self.store.upsert_partner(demoted).await?;

        for summary in &payload.partners {
            let transferred = FederationPartner::new(
                &self.org_id,
                &summary.node_id,
                &summary.node_name,
                &summary.node_url,
                &summary.secret_key,
            );
            self.store.upsert_partner(transferred).await?;
        }

        if let Some(promotion_id) = &payload.promotion_id {
            if let Some(mut promotion) = self.store.find_promotion(promotion_id).await? {
                if !promotion.status.is_terminal() {
                    promotion.status = PromotionStatus::Approved;
                    self.store.put_promotion(promotion).await?;
                }
            }
        }

        self.refresh_registry().await?;
        tracing::info!(
            "Assumed principle role for org {} ({} transferred partners)",
            self.org_id,
            payload.partners.len()
        );

        let notify = NewPrinciplePayload {
            org_id: self.org_id.clone(),
            principle: Self::self_summary(&config),
        };
        for summary in &payload.partners {
            if let Err(err) = self
                .client
                .send_new_principle(&summary.node_url, &summary.secret_key, &notify)
                .await
            {
                tracing::warn!(
                    "Partner {} missed the new-principle broadcast: {}",
                    summary.node_id,
                    err
                );
            }
        }
        Ok(())
    }

    /// Update this Partner's Principle pointers after a handoff elsewhere
    pub async fn handle_new_principle(&self, payload: NewPrinciplePayload) -> SemaforoResult<()> {
        let mut config = self.require_config().await?;
        config.role = NodeRole::Partner;
        config.principle_node_id = Some(payload.principle.node_id.clone());
        config.principle_url = Some(payload.principle.node_url.clone());
        self.store.put_federation_config(config).await?;
        // The new principle is above us now, not beside us
        self.store
            .delete_partner(&self.org_id, &payload.principle.node_id)
            .await?;
        self.refresh_registry().await?;
        log::info!("Principle pointer updated to {}", payload.principle.node_id);
        Ok(())
    }

    /// The Principle turned the promotion down; the requester stays Partner
    pub async fn handle_promotion_rejected(&self, promotion_id: &str) -> SemaforoResult<()> {
        if let Some(mut promotion) = self.store.find_promotion(promotion_id).await? {
            if !promotion.status.is_terminal() {
                promotion.status = PromotionStatus::Rejected;
                self.store.put_promotion(promotion).await?;
            }
        }
        log::info!("Promotion {} was rejected; staying partner", promotion_id);
        Ok(())
    }

    /// Self-promotion: flip to Principle and settle the promotion row
    async fn auto_promote(&self, promotion: &PromotionRequest) -> SemaforoResult<PromotionRequest> {
        let mut config = self.require_config().await?;
        config.role = NodeRole::Principle;
        config.principle_node_id = None;
        config.principle_url = None;
        self.store.put_federation_config(config).await?;

        let mut promotion = promotion.clone();
        promotion.status = PromotionStatus::AutoPromoted;
        self.store.put_promotion(promotion.clone()).await?;
        self.refresh_registry().await?;
        tracing::info!(
            "Node {} auto-promoted to principle (request {})",
            self.node_id,
            promotion.id
        );
        Ok(promotion)
    }

    /// Watchdog pass: auto-promote on every own pending request whose
    /// deadline has lapsed. Requests this node received from others are left
    /// for `respond_promotion`.
    pub async fn check_promotion_deadlines(&self) -> SemaforoResult<usize> {
        if self.current_config().await?.is_none() {
            return Ok(0);
        }
        let pending = self.store.list_pending_promotions(&self.org_id).await?;
        let now = Utc::now();
        let mut promoted = 0;
        for promotion in pending {
            if promotion.requester_node_id != self.node_id {
                continue;
            }
            if !promotion.deadline_passed(now) {
                continue;
            }
            tracing::warn!(
                "Promotion {} unanswered past its deadline, self-promoting",
                promotion.id
            );
            self.auto_promote(&promotion).await?;
            promoted += 1;
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::routing::post;
    use axum::{Json, Router};
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method};
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    fn manager_with(store: Arc<MemoryStore>, settings: FederationSettings) -> FederationManager {
        FederationManager::new(store, "org-1", "node-self", settings).unwrap()
    }

    async fn seed_partner_config(
        store: &MemoryStore,
        principle_url: &str,
    ) -> crate::core::FederationConfig {
        let mut config =
            crate::core::FederationConfig::new("org-1", "self", "http://self:7070", "s3cret");
        config.node_id = "node-self".to_string();
        config.role = NodeRole::Partner;
        config.principle_node_id = Some("node-principle".to_string());
        config.principle_url = Some(principle_url.to_string());
        store.put_federation_config(config.clone()).await.unwrap();
        config
    }

    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_promotion_against_unreachable_principle_is_immediate() {
        let store = Arc::new(MemoryStore::new());
        let addr = refused_addr().await;
        seed_partner_config(&store, &format!("http://{}", addr)).await;
        let manager = manager_with(store.clone(), FederationSettings::default());

        let started = Instant::now();
        let promotion = manager.request_promotion("principle down").await.unwrap();
        assert_eq!(promotion.status, PromotionStatus::AutoPromoted);
        // No deadline wait happened
        assert!(started.elapsed() < Duration::from_secs(8));

        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Principle);
        assert!(config.principle_node_id.is_none());
    }

    #[tokio::test]
    async fn test_promotion_against_silent_principle_waits_for_deadline() {
        // A principle that accepts the request but never answers it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route(
            "/api/federation/promote/request",
            post(|| async { Json(serde_json::json!({"status": "PENDING"})) }),
        );
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let store = Arc::new(MemoryStore::new());
        seed_partner_config(&store, &format!("http://{}", addr)).await;
        let settings = FederationSettings {
            promotion_deadline_secs: 1,
            ..FederationSettings::default()
        };
        let manager = manager_with(store.clone(), settings);

        let promotion = manager.request_promotion("testing deadline").await.unwrap();
        assert_eq!(promotion.status, PromotionStatus::Pending);

        // Deadline not reached yet: the watchdog pass does nothing
        assert_eq!(manager.check_promotion_deadlines().await.unwrap(), 0);
        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Partner);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(manager.check_promotion_deadlines().await.unwrap(), 1);

        let settled = store.find_promotion(&promotion.id).await.unwrap().unwrap();
        assert_eq!(settled.status, PromotionStatus::AutoPromoted);
        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Principle);
    }

    #[tokio::test]
    async fn test_forward_hop_ceiling_precedes_any_outbound_call() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store, FederationSettings::default());
        let peer = PeerNode {
            node_id: "node-b".to_string(),
            node_name: "b".to_string(),
            // A port nothing listens on: reaching it would error differently
            node_url: "http://127.0.0.1:1".to_string(),
            secret_key: "s3cret".to_string(),
            is_self: false,
            healthy: true,
            load_percent: 0,
            last_heartbeat: None,
        };

        for hops in ["3", "4"] {
            let mut headers = HeaderMap::new();
            headers.insert(HOP_HEADER, HeaderValue::from_static(hops));
            let inbound = InboundRequest {
                method: Method::GET,
                path: "/e/api".to_string(),
                query: None,
                headers,
                body: Bytes::new(),
                client_ip: "10.0.0.1".to_string(),
            };
            let err = manager.forward(&peer, &inbound).await.unwrap_err();
            assert_eq!(err.code(), "TOO_MANY_HOPS");
        }

        // Below the ceiling the call goes out (and fails against the dead port
        // as a backend error, not a hop error)
        let mut headers = HeaderMap::new();
        headers.insert(HOP_HEADER, HeaderValue::from_static("2"));
        let inbound = InboundRequest {
            method: Method::GET,
            path: "/e/api".to_string(),
            query: None,
            headers,
            body: Bytes::new(),
            client_ip: "10.0.0.1".to_string(),
        };
        let err = manager.forward(&peer, &inbound).await.unwrap_err();
        assert_eq!(err.code(), "BACKEND_ERROR");
    }

    #[tokio::test]
    async fn test_route_request_owner_health_and_load() {
        let store = Arc::new(MemoryStore::new());
        let mut config =
            crate::core::FederationConfig::new("org-1", "self", "http://self:7070", "s3cret");
        config.node_id = "node-self".to_string();
        config.role = NodeRole::Principle;
        store.put_federation_config(config).await.unwrap();
        let mut partner = FederationPartner::new(
            "org-1",
            "node-b",
            "b",
            "http://node-b:7070",
            "s3cret",
        );
        partner.last_heartbeat = Some(Utc::now());
        store.upsert_partner(partner).await.unwrap();

        let manager = manager_with(store, FederationSettings::default());
        manager.refresh_registry().await.unwrap();

        // Find a key the partner owns
        let mut peer_key = None;
        for i in 0..512 {
            let key = format!("client-{}", i);
            if let RouteDecision::Peer(peer) = manager.route_request(&key).await {
                assert_eq!(peer.node_id, "node-b");
                peer_key = Some(key);
                break;
            }
        }
        let peer_key = peer_key.expect("some key must land on the partner");

        // Overloaded owner: routed locally (no other replica but self)
        manager.registry.record_heartbeat("node-b", 95).await;
        assert!(matches!(
            manager.route_request(&peer_key).await,
            RouteDecision::Local
        ));

        // Healthy again with low load: back to the peer
        manager.registry.record_heartbeat("node-b", 10).await;
        assert!(matches!(
            manager.route_request(&peer_key).await,
            RouteDecision::Peer(_)
        ));

        // Unhealthy owner: out of the ring, routed locally
        manager.registry.mark_unhealthy("node-b").await;
        assert!(matches!(
            manager.route_request(&peer_key).await,
            RouteDecision::Local
        ));
    }

    #[tokio::test]
    async fn test_incoming_partner_request_promotes_standalone() {
        let store = Arc::new(MemoryStore::new());
        let mut config =
            crate::core::FederationConfig::new("org-1", "self", "http://self:7070", "s3cret");
        config.node_id = "node-self".to_string();
        store.put_federation_config(config).await.unwrap();
        let manager = manager_with(store.clone(), FederationSettings::default());

        let accepted = manager
            .handle_incoming_request(PartnerJoinRequest {
                org_id: "org-1".to_string(),
                requester: PeerSummary {
                    node_id: "node-b".to_string(),
                    node_name: "b".to_string(),
                    node_url: "http://node-b:7070".to_string(),
                    secret_key: "s3cret".to_string(),
                },
            })
            .await
            .unwrap();
        assert_eq!(accepted.principle.node_id, "node-self");

        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Principle);
        let partner = store
            .find_partner_by_node("org-1", "node-b")
            .await
            .unwrap()
            .unwrap();
        assert!(partner.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_respond_promotion_approve_hands_over() {
        // The requesting partner's become-principle handler
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route(
            "/api/federation/promote/become-principle",
            post(|| async { Json(serde_json::json!({"status": "OK"})) }),
        );
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let store = Arc::new(MemoryStore::new());
        let mut config =
            crate::core::FederationConfig::new("org-1", "self", "http://self:7070", "s3cret");
        config.node_id = "node-self".to_string();
        config.role = NodeRole::Principle;
        store.put_federation_config(config).await.unwrap();
        let mut requester = FederationPartner::new(
            "org-1",
            "node-b",
            "b",
            &format!("http://{}", addr),
            "s3cret",
        );
        requester.last_heartbeat = Some(Utc::now());
        store.upsert_partner(requester).await.unwrap();
        // A bystander partner that must be transferred and cleared
        store
            .upsert_partner(FederationPartner::new(
                "org-1",
                "node-c",
                "c",
                "http://node-c:7070",
                "s3cret",
            ))
            .await
            .unwrap();

        let manager = manager_with(store.clone(), FederationSettings::default());
        let promotion = PromotionRequest::new("org-1", "node-b", Some("node-self".to_string()), "test", 30);
        store.put_promotion(promotion.clone()).await.unwrap();

        let settled = manager.respond_promotion(&promotion.id, true).await.unwrap();
        assert_eq!(settled.status, PromotionStatus::Approved);

        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Partner);
        assert_eq!(config.principle_node_id.as_deref(), Some("node-b"));
        assert!(store.list_partners("org-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_respond_promotion_reject_keeps_roles() {
        let store = Arc::new(MemoryStore::new());
        let mut config =
            crate::core::FederationConfig::new("org-1", "self", "http://self:7070", "s3cret");
        config.node_id = "node-self".to_string();
        config.role = NodeRole::Principle;
        store.put_federation_config(config).await.unwrap();
        // Rejection callback target is unreachable; that must not fail the call
        store
            .upsert_partner(FederationPartner::new(
                "org-1",
                "node-b",
                "b",
                "http://127.0.0.1:1",
                "s3cret",
            ))
            .await
            .unwrap();

        let manager = manager_with(store.clone(), FederationSettings::default());
        let promotion = PromotionRequest::new("org-1", "node-b", Some("node-self".to_string()), "test", 30);
        store.put_promotion(promotion.clone()).await.unwrap();

        let settled = manager.respond_promotion(&promotion.id, false).await.unwrap();
        assert_eq!(settled.status, PromotionStatus::Rejected);
        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Principle);
        assert_eq!(store.list_partners("org-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_become_principle_records_handoff() {
        let store = Arc::new(MemoryStore::new());
        seed_partner_config(&store, "http://node-principle:7070").await;
        let manager = manager_with(store.clone(), FederationSettings::default());

        let payload = BecomePrinciplePayload {
            org_id: "org-1".to_string(),
            promotion_id: None,
            demoted_principle: PeerSummary {
                node_id: "node-principle".to_string(),
                node_name: "old".to_string(),
                node_url: "http://node-principle:7070".to_string(),
                secret_key: "s3cret".to_string(),
            },
            // Broadcast target is dead; the handoff itself must still land
            partners: vec![PeerSummary {
                node_id: "node-c".to_string(),
                node_name: "c".to_string(),
                node_url: "http://127.0.0.1:1".to_string(),
                secret_key: "s3cret".to_string(),
            }],
        };
        manager.become_principle(payload).await.unwrap();

        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Principle);
        assert!(config.principle_node_id.is_none());
        let partners = store.list_partners("org-1").await.unwrap();
        let ids: Vec<&str> = partners.iter().map(|p| p.node_id.as_str()).collect();
        assert!(ids.contains(&"node-principle"));
        assert!(ids.contains(&"node-c"));
    }

    #[tokio::test]
    async fn test_handle_new_principle_updates_pointers() {
        let store = Arc::new(MemoryStore::new());
        seed_partner_config(&store, "http://node-principle:7070").await;
        let manager = manager_with(store.clone(), FederationSettings::default());

        manager
            .handle_new_principle(NewPrinciplePayload {
                org_id: "org-1".to_string(),
                principle: PeerSummary {
                    node_id: "node-b".to_string(),
                    node_name: "b".to_string(),
                    node_url: "http://node-b:7070".to_string(),
                    secret_key: "s3cret".to_string(),
                },
            })
            .await
            .unwrap();

        let config = store.get_federation_config("org-1").await.unwrap().unwrap();
        assert_eq!(config.role, NodeRole::Partner);
        assert_eq!(config.principle_node_id.as_deref(), Some("node-b"));
        assert_eq!(config.principle_url.as_deref(), Some("http://node-b:7070"));
    }

    #[tokio::test]
    async fn test_heartbeat_handling_updates_partner_row() {
        let store = Arc::new(MemoryStore::new());
        let mut config =
            crate::core::FederationConfig::new("org-1", "self", "http://self:7070", "s3cret");
        config.node_id = "node-self".to_string();
        config.role = NodeRole::Principle;
        store.put_federation_config(config).await.unwrap();
        store
            .upsert_partner(FederationPartner::new(
                "org-1",
                "node-b",
                "b",
                "http://node-b:7070",
                "s3cret",
            ))
            .await
            .unwrap();

        let manager = manager_with(store.clone(), FederationSettings::default());
        manager.refresh_registry().await.unwrap();
        let ack = manager
            .handle_heartbeat(HeartbeatPayload {
                org_id: "org-1".to_string(),
                node_id: "node-b".to_string(),
                node_name: "b".to_string(),
                node_url: "http://node-b:7070".to_string(),
                role: NodeRole::Partner,
                load_percent: 30,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(ack.node_id, "node-self");
        assert_eq!(ack.role, NodeRole::Principle);

        let partner = store
            .find_partner_by_node("org-1", "node-b")
            .await
            .unwrap()
            .unwrap();
        assert!(partner.last_heartbeat.is_some());
        assert_eq!(manager.registry.get("node-b").await.unwrap().load_percent, 30);
    }

    #[tokio::test]
    async fn test_validate_secret() {
        let store = Arc::new(MemoryStore::new());
        let mut config =
            crate::core::FederationConfig::new("org-1", "self", "http://self:7070", "s3cret");
        config.node_id = "node-self".to_string();
        store.put_federation_config(config).await.unwrap();
        let manager = manager_with(store, FederationSettings::default());

        assert!(manager.validate_secret("s3cret").await);
        assert!(!manager.validate_secret("wrong").await);
        assert!(!manager.validate_secret("").await);
    }

    #[test]
    fn test_current_load_percentage() {
        let store = Arc::new(MemoryStore::new());
        let settings = FederationSettings {
            max_connections: 10,
            ..FederationSettings::default()
        };
        let manager = manager_with(store, settings);
        assert_eq!(manager.current_load(), 0);
        for _ in 0..5 {
            manager.request_started();
        }
        assert_eq!(manager.current_load(), 50);
        for _ in 0..20 {
            manager.request_started();
        }
        // Clamped
        assert_eq!(manager.current_load(), 100);
    }
}
