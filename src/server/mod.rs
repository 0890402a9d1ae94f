/// HTTP surface
///
/// Two route groups share one router: the public data plane under `/e/` and
/// the secret-keyed node-to-node federation surface under `/api/federation/`.
/// Everything behind `/api/federation/` requires the org secret in the
/// X-Federation-Secret header; the data plane is open.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use http::{HeaderMap, StatusCode};
use serde::Deserialize;

use crate::error::{FederationError, SemaforoError};
use crate::federation::sync::{SyncAck, SyncPayload};
use crate::federation::{
    BecomePrinciplePayload, FederationManager, HeartbeatPayload, NewPrinciplePayload,
    PartnerJoinRequest, PromotionDecisionPayload, SECRET_HEADER, SOURCE_HEADER,
};
use crate::proxy::{Dispatcher, InboundRequest};

/// Ceiling on buffered request bodies; larger uploads are refused
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub federation: Arc<FederationManager>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/e/{slug}", any(proxy_entry))
        .route("/e/{slug}/{*rest}", any(proxy_entry))
        .route("/healthz", get(health))
        .route("/api/federation/heartbeat", post(heartbeat))
        .route("/api/federation/requests", post(partnership_outgoing))
        .route("/api/federation/requests/incoming", post(partnership_incoming))
        .route("/api/federation/promote/request", post(promote_request))
        .route("/api/federation/promote/respond", post(promote_respond))
        .route(
            "/api/federation/promote/become-principle",
            post(promote_become_principle),
        )
        .route(
            "/api/federation/promote/new-principle",
            post(promote_new_principle),
        )
        .route("/api/federation/promote/rejected", post(promote_rejected))
        .route("/api/federation/sync/receive", post(sync_receive))
        .with_state(state)
}

// ---- data plane ----

async fn proxy_entry(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let inbound = InboundRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(|q| q.to_string()),
        client_ip: client_ip(&parts.headers, parts.extensions.get::<ConnectInfo<SocketAddr>>()),
        headers: parts.headers,
        body,
    };
    state.dispatcher.dispatch(inbound).await
}

/// Edge-supplied X-Forwarded-For wins over the socket peer address
fn client_ip(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    connect
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string())
}

async fn health(State(state): State<AppState>) -> Response {
    let role = match state.federation.current_config().await {
        Ok(Some(config)) => config.role.to_string(),
        _ => "STANDALONE".to_string(),
    };
    Json(serde_json::json!({
        "status": "ok",
        "node_id": state.federation.node_id(),
        "role": role,
        "load_percent": state.federation.current_load(),
    }))
    .into_response()
}

// ---- federation surface ----

async fn require_secret(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if state.federation.validate_secret(presented).await {
        Ok(())
    } else {
        Err(federation_error(
            FederationError::InvalidSecret.into(),
        ))
    }
}

fn federation_error(err: SemaforoError) -> Response {
    let status = match &err {
        SemaforoError::Federation(FederationError::InvalidSecret) => StatusCode::UNAUTHORIZED,
        SemaforoError::Federation(FederationError::NotConfigured) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SemaforoError::Federation(FederationError::RoleViolation { .. })
        | SemaforoError::Federation(FederationError::Rejected { .. })
        | SemaforoError::Federation(FederationError::Promotion { .. }) => StatusCode::CONFLICT,
        SemaforoError::Federation(FederationError::Unreachable { .. }) => StatusCode::BAD_GATEWAY,
        SemaforoError::Store(crate::error::StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = Json(serde_json::json!({ "error": err.to_string() }));
    (status, body).into_response()
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<HeartbeatPayload>,
) -> Response {
    if let Err(denied) = require_secret(&state, &headers).await {
        return denied;
    }
    match state.federation.handle_heartbeat(payload).await {
        Ok(ack) => Json(ack).into_response(),
        Err(err) => federation_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct PartnershipTarget {
    target_url: String,
}

/// Operator-initiated: join the federation behind `target_url` as a Partner
async fn partnership_outgoing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PartnershipTarget>,
) -> Response {
    if let Err(denied) = require_secret(&state, &headers).await {
        return denied;
    }
    match state.federation.request_partnership(&body.target_url).await {
        Ok(accepted) => Json(accepted).into_response(),
        Err(err) => federation_error(err),
    }
}

async fn partnership_incoming(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(join): Json<PartnerJoinRequest>,
) -> Response {
    if let Err(denied) = require_secret(&state, &headers).await {
        return denied;
    }
    match state.federation.handle_incoming_request(join).await {
        Ok(accepted) => Json(accepted).into_response(),
        Err(err) => federation_error(err),
    }
}

async fn promote_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(promotion): Json<crate::core::PromotionRequest>,
) -> Response {
    if let Err(denied) = require_secret(&state, &headers).await {
        return denied;
    }
    match state.federation.handle_promotion_request(promotion).await {
        Ok(()) => Json(serde_json::json!({ "status": "PENDING" })).into_response(),
        Err(err) => federation_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct PromotionDecision {
    promotion_id: String,
    approve: bool,
}

/// Operator-facing: answer a pending promotion request on the Principle
async fn promote_respond(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(decision): Json<PromotionDecision>,
) -> Response {
    if let Err(denied) = require_secret(&state, &headers).await {
        return denied;
    }
    match state
        .federation
        .respond_promotion(&decision.promotion_id, decision.approve)
        .await
    {
        Ok(promotion) => Json(promotion).into_response(),
        Err(err) => federation_error(err),
    }
}

async fn promote_become_principle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BecomePrinciplePayload>,
) -> Response {
    if let Err(denied) = require_secret(&state, &headers).await {
        return denied;
    }
    match state.federation.become_principle(payload).await {
        Ok(()) => Json(serde_json::json!({ "status": "OK" })).into_response(),
        Err(err) => federation_error(err),
    }
}

async fn promote_new_principle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewPrinciplePayload>,
) -> Response {
    if let Err(denied) = require_secret(&state, &headers).await {
        return denied;
    }
    match state.federation.handle_new_principle(payload).await {
        Ok(()) => Json(serde_json::json!({ "status": "OK" })).into_response(),
        Err(err) => federation_error(err),
    }
}

async fn promote_rejected(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PromotionDecisionPayload>,
) -> Response {
    if let Err(denied) = require_secret(&state, &headers).await {
        return denied;
    }
    match state
        .federation
        .handle_promotion_rejected(&payload.promotion_id)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "status": "OK" })).into_response(),
        Err(err) => federation_error(err),
    }
}

async fn sync_receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SyncPayload>,
) -> Response {
    if let Err(denied) = require_secret(&state, &headers).await {
        return denied;
    }
    let source = headers
        .get(SOURCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let engine = state.federation.sync_engine();
    match engine.receive(&source, payload).await {
        Ok(ack) => Json::<SyncAck>(ack).into_response(),
        Err(err) => federation_error(err),
    }
}
