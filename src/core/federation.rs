/// Federation records: node roles, partners, promotion protocol, sync logs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::generate_id;

/// Role a node plays inside an org's federation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    /// Not federated; serves its org alone
    Standalone,
    /// The single writer; initiates sync and approves promotions
    Principle,
    /// Read replica; heartbeats to its Principle and receives sync
    Partner,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Standalone => "STANDALONE",
            NodeRole::Principle => "PRINCIPLE",
            NodeRole::Partner => "PARTNER",
        };
        write!(f, "{}", s)
    }
}

/// Per-org federation identity of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    pub id: String,
    pub org_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_url: String,
    pub role: NodeRole,
    pub principle_node_id: Option<String>,
    pub principle_url: Option<String>,
    pub secret_key: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl FederationConfig {
    pub fn new(org_id: &str, node_name: &str, node_url: &str, secret_key: &str) -> Self {
        Self {
            id: generate_id("fed"),
            org_id: org_id.to_string(),
            node_id: generate_id("node"),
            node_name: node_name.to_string(),
            node_url: node_url.trim_end_matches('/').to_string(),
            role: NodeRole::Standalone,
            principle_node_id: None,
            principle_url: None,
            secret_key: secret_key.to_string(),
            last_heartbeat: None,
        }
    }
}

/// Outcome of the most recent sync attempt with a partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartnerSyncState {
    Pending,
    Synced,
    Failed,
}

/// A partner node known to a Principle (or the demoted Principle after handover)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationPartner {
    pub id: String,
    pub org_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_url: String,
    pub secret_key: String,
    pub is_active: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_status: PartnerSyncState,
    pub failed_sync_count: u32,
}

impl FederationPartner {
    pub fn new(org_id: &str, node_id: &str, node_name: &str, node_url: &str, secret_key: &str) -> Self {
        Self {
            id: generate_id("prt"),
            org_id: org_id.to_string(),
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            node_url: node_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
            is_active: true,
            last_heartbeat: None,
            last_sync_at: None,
            sync_status: PartnerSyncState::Pending,
            failed_sync_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FederationRequestType {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FederationRequestStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A partnership request between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationRequest {
    pub id: String,
    pub org_id: String,
    pub request_type: FederationRequestType,
    pub requester_node_id: String,
    pub requester_node_url: String,
    pub target_node_url: String,
    pub status: FederationRequestStatus,
    pub secret_key: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl FederationRequest {
    pub fn new(
        org_id: &str,
        request_type: FederationRequestType,
        requester_node_id: &str,
        requester_node_url: &str,
        target_node_url: &str,
        secret_key: &str,
        ttl_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("freq"),
            org_id: org_id.to_string(),
            request_type,
            requester_node_id: requester_node_id.to_string(),
            requester_node_url: requester_node_url.trim_end_matches('/').to_string(),
            target_node_url: target_node_url.trim_end_matches('/').to_string(),
            status: FederationRequestStatus::Pending,
            secret_key: secret_key.to_string(),
            expires_at: crate::core::endpoint::deadline_after(now, ttl_seconds),
            created_at: now,
        }
    }
}

/// Promotion request lifecycle; terminal states are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionStatus {
    Pending,
    Approved,
    Rejected,
    AutoPromoted,
}

impl PromotionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PromotionStatus::Pending)
    }
}

/// A request by a Partner to take over the Principle role.
///
/// The `response_deadline` is persisted so the watchdog can enforce it after
/// a restart; nothing relies on an in-process timer surviving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRequest {
    pub id: String,
    pub org_id: String,
    pub requester_node_id: String,
    pub current_principle_id: Option<String>,
    pub status: PromotionStatus,
    pub response_deadline: DateTime<Utc>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl PromotionRequest {
    pub fn new(
        org_id: &str,
        requester_node_id: &str,
        current_principle_id: Option<String>,
        reason: &str,
        deadline_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("promo"),
            org_id: org_id.to_string(),
            requester_node_id: requester_node_id.to_string(),
            current_principle_id,
            status: PromotionStatus::Pending,
            response_deadline: crate::core::endpoint::deadline_after(now, deadline_seconds),
            reason: reason.to_string(),
            created_at: now,
        }
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        now > self.response_deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncLogStatus {
    InProgress,
    Completed,
    Failed,
}

/// One sync attempt against one partner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: String,
    pub partner_id: String,
    pub direction: SyncDirection,
    pub sync_type: SyncType,
    pub status: SyncLogStatus,
    pub entities_synced: u32,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl SyncLog {
    pub fn start(partner_id: &str, direction: SyncDirection, sync_type: SyncType) -> Self {
        Self {
            id: generate_id("sync"),
            partner_id: partner_id.to_string(),
            direction,
            sync_type,
            status: SyncLogStatus::InProgress,
            entities_synced: 0,
            duration_ms: 0,
            error_message: None,
            started_at: Utc::now(),
        }
    }

    pub fn complete(mut self, entities_synced: u32, duration_ms: u64) -> Self {
        self.status = SyncLogStatus::Completed;
        self.entities_synced = entities_synced;
        self.duration_ms = duration_ms;
        self
    }

    pub fn fail(mut self, message: &str, duration_ms: u64) -> Self {
        self.status = SyncLogStatus::Failed;
        self.error_message = Some(message.to_string());
        self.duration_ms = duration_ms;
        self
    }
}
