/// Node-to-node HTTP plumbing
///
/// Every federation call is a JSON POST under `/api/federation/`, secret-keyed
/// via the X-Federation-Secret header. Heartbeats and notifications use short
/// timeouts; sync pushes, promotion calls and request forwarding get the long
/// one. Only request forwarding and the new-principle fan-out retry.
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use http::header::{CONTENT_LENGTH, HOST};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FederationError, ProxyError};
use crate::proxy::headers::{filter_response_headers, is_hop_by_hop};
use crate::proxy::InboundRequest;

use super::peers::PeerNode;
use super::{FORWARDED_HEADER, HOP_HEADER, SECRET_HEADER, SOURCE_HEADER};

/// Heartbeats and peer notifications
const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
/// Sync pushes, promotion calls and forwarded client requests
const LONG_TIMEOUT: Duration = Duration::from_secs(10);
/// Transport retries for forwarded client requests
const FORWARD_RETRIES: u32 = 2;

#[derive(Clone)]
pub struct FederationClient {
    http: reqwest::Client,
}

impl FederationClient {
    pub fn new() -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| format!("Failed to build federation HTTP client: {}", e))?;
        Ok(Self { http })
    }

    fn api_url(base_url: &str, path: &str) -> String {
        format!(
            "{}/api/federation/{}",
            base_url.trim_end_matches('/'),
            path
        )
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        base_url: &str,
        path: &str,
        secret: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, FederationError> {
        let url = Self::api_url(base_url, path);
        let response = self
            .http
            .post(&url)
            .header(SECRET_HEADER, secret)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| FederationError::Unreachable {
                node: url.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FederationError::Rejected {
                node: url,
                message: format!("status {}", status),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|err| FederationError::Rejected {
                node: url,
                message: format!("invalid response body: {}", err),
            })
    }

    pub async fn send_heartbeat(
        &self,
        base_url: &str,
        secret: &str,
        payload: &super::HeartbeatPayload,
    ) -> Result<super::HeartbeatAck, FederationError> {
        self.post_json(base_url, "heartbeat", secret, payload, SHORT_TIMEOUT)
            .await
    }

    pub async fn submit_partner_request(
        &self,
        base_url: &str,
        secret: &str,
        payload: &super::PartnerJoinRequest,
    ) -> Result<super::PartnerAccepted, FederationError> {
        self.post_json(base_url, "requests/incoming", secret, payload, LONG_TIMEOUT)
            .await
    }

    pub async fn send_promotion_request(
        &self,
        base_url: &str,
        secret: &str,
        promotion: &crate::core::PromotionRequest,
    ) -> Result<(), FederationError> {
        let _: serde_json::Value = self
            .post_json(base_url, "promote/request", secret, promotion, LONG_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn send_become_principle(
        &self,
        base_url: &str,
        secret: &str,
        payload: &super::BecomePrinciplePayload,
    ) -> Result<(), FederationError> {
        let _: serde_json::Value = self
            .post_json(
                base_url,
                "promote/become-principle",
                secret,
                payload,
                LONG_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    /// Pointer-update broadcast to a transferred partner. At-least-once with
    /// a single retry; a partner that still misses it self-heals through its
    /// own heartbeat-failure promotion path.
    pub async fn send_new_principle(
        &self,
        base_url: &str,
        secret: &str,
        payload: &super::NewPrinciplePayload,
    ) -> Result<(), FederationError> {
        let first = self
            .post_json::<_, serde_json::Value>(
                base_url,
                "promote/new-principle",
                secret,
                payload,
                SHORT_TIMEOUT,
            )
            .await;
        match first {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!(
                    "new-principle notification to {} failed, retrying once: {}",
                    base_url,
                    err
                );
                self.post_json::<_, serde_json::Value>(
                    base_url,
                    "promote/new-principle",
                    secret,
                    payload,
                    SHORT_TIMEOUT,
                )
                .await
                .map(|_| ())
            }
        }
    }

    pub async fn send_promotion_rejected(
        &self,
        base_url: &str,
        secret: &str,
        payload: &super::PromotionDecisionPayload,
    ) -> Result<(), FederationError> {
        let _: serde_json::Value = self
            .post_json(base_url, "promote/rejected", secret, payload, SHORT_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn push_sync(
        &self,
        base_url: &str,
        secret: &str,
        payload: &super::sync::SyncPayload,
    ) -> Result<super::sync::SyncAck, FederationError> {
        self.post_json(base_url, "sync/receive", secret, payload, LONG_TIMEOUT)
            .await
    }

    /// Forward a client request to the peer that owns its affinity key.
    ///
    /// The original method, path, query, headers and body travel unchanged;
    /// hop-by-hop headers are stripped and the federation markers added. Up
    /// to two transport retries, then the failure surfaces as a proxy error.
    pub async fn forward_request(
        &self,
        peer: &PeerNode,
        inbound: &InboundRequest,
        hop: u32,
        source_node_id: &str,
    ) -> Result<Response, ProxyError> {
        let mut url = format!(
            "{}{}",
            peer.node_url.trim_end_matches('/'),
            inbound.path
        );
        if let Some(query) = &inbound.query {
            url.push('?');
            url.push_str(query);
        }

        let mut headers = http::HeaderMap::new();
        for (name, value) in &inbound.headers {
            if is_hop_by_hop(name) || *name == HOST || *name == CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(FORWARDED_HEADER, http::HeaderValue::from_static("true"));
        if let Ok(value) = http::HeaderValue::from_str(source_node_id) {
            headers.insert(SOURCE_HEADER, value);
        }
        if let Ok(value) = http::HeaderValue::from_str(&hop.to_string()) {
            headers.insert(HOP_HEADER, value);
        }
        if let Ok(value) = http::HeaderValue::from_str(&peer.secret_key) {
            headers.insert(SECRET_HEADER, value);
        }

        let mut attempt: u32 = 0;
        loop {
            let request = self
                .http
                .request(inbound.method.clone(), &url)
                .headers(headers.clone())
                .body(inbound.body.clone())
                .timeout(LONG_TIMEOUT);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let response_headers = filter_response_headers(response.headers());
                    let mut forwarded = Response::new(Body::from_stream(response.bytes_stream()));
                    *forwarded.status_mut() = status;
                    *forwarded.headers_mut() = response_headers;
                    return Ok(forwarded);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > FORWARD_RETRIES {
                        return Err(if err.is_timeout() {
                            ProxyError::timeout(&url)
                        } else {
                            ProxyError::backend(format!(
                                "forward to peer {} failed: {}",
                                peer.node_id, err
                            ))
                        });
                    }
                    tracing::warn!(
                        "Forward attempt {} to peer {} failed: {}",
                        attempt,
                        peer.node_id,
                        err
                    );
                }
            }
        }
    }
}
