/// Published traffic endpoints and session affinity records
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::generate_id;

/// What kind of dispatch an endpoint performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointType {
    /// Select a backend from the attached cluster
    LoadBalance,
    /// Evaluate routing policies first, fall back to the attached cluster
    Route,
    /// Fixed upstream dispatch through the attached cluster
    Proxy,
    /// Return the configured mock response without contacting any backend
    Mock,
}

/// How the selected backend is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyMode {
    Redirect,
    Passthrough,
    ReverseProxy,
    Smart,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyMode::Redirect => "REDIRECT",
            ProxyMode::Passthrough => "PASSTHROUGH",
            ProxyMode::ReverseProxy => "REVERSE_PROXY",
            ProxyMode::Smart => "SMART",
        };
        write!(f, "{}", s)
    }
}

/// How the affinity key for a request is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionAffinityMode {
    None,
    Cookie,
    IpHash,
    Header,
}

/// A published endpoint reachable under `/e/{slug}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEndpoint {
    pub id: String,
    pub org_id: String,
    pub slug: String,
    pub endpoint_type: EndpointType,
    pub cluster_id: Option<String>,
    /// Pins policy evaluation to one policy instead of the org-wide set
    pub policy_id: Option<String>,
    pub proxy_mode: ProxyMode,
    pub session_affinity: SessionAffinityMode,
    pub affinity_cookie_name: String,
    pub affinity_header_name: Option<String>,
    pub affinity_ttl_seconds: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Send the inbound Host header upstream instead of the backend host
    pub preserve_host_header: bool,
    /// Force the upstream Host header to `backend:port`; loses to
    /// `preserve_host_header` when both are set
    pub rewrite_host_header: bool,
    pub strip_path_prefix: Option<String>,
    pub add_path_prefix: Option<String>,
    pub websocket_enabled: bool,
    /// Mock response fields, used only when `endpoint_type` is `Mock`
    pub mock_status: u16,
    pub mock_content_type: String,
    pub mock_body: String,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
    pub is_active: bool,
}

impl TrafficEndpoint {
    pub fn new(org_id: &str, slug: &str, endpoint_type: EndpointType) -> Result<Self, String> {
        if slug.is_empty() {
            return Err("Endpoint slug cannot be empty".to_string());
        }
        if !slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(format!(
                "Endpoint slug '{}' must be lowercase alphanumeric with dashes",
                slug
            ));
        }

        Ok(Self {
            id: generate_id("ep"),
            org_id: org_id.to_string(),
            slug: slug.to_string(),
            endpoint_type,
            cluster_id: None,
            policy_id: None,
            proxy_mode: ProxyMode::ReverseProxy,
            session_affinity: SessionAffinityMode::None,
            affinity_cookie_name: "sf_affinity".to_string(),
            affinity_header_name: None,
            affinity_ttl_seconds: 3600,
            connect_timeout_ms: 5000,
            read_timeout_ms: 30000,
            preserve_host_header: false,
            rewrite_host_header: false,
            strip_path_prefix: None,
            add_path_prefix: None,
            websocket_enabled: true,
            mock_status: 200,
            mock_content_type: "application/json".to_string(),
            mock_body: "{}".to_string(),
            total_requests: 0,
            total_errors: 0,
            avg_latency_ms: 0.0,
            is_active: true,
        })
    }
}

/// `now + seconds`, saturating at the calendar maximum instead of wrapping
/// or panicking on absurd TTLs
pub(crate) fn deadline_after(now: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Sticky mapping from a client key to a backend, persisted with a TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityMapping {
    pub id: String,
    pub endpoint_id: String,
    pub client_key: String,
    pub backend_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AffinityMapping {
    pub fn new(endpoint_id: &str, client_key: &str, backend_id: &str, ttl_seconds: u64) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("aff"),
            endpoint_id: endpoint_id.to_string(),
            client_key: client_key.to_string(),
            backend_id: backend_id.to_string(),
            expires_at: deadline_after(now, ttl_seconds),
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
