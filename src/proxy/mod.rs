/// Request dispatch
///
/// The dispatcher is the public data plane: it resolves the endpoint behind
/// `/e/{slug}`, consults federation ownership, routing policies and session
/// affinity, picks a backend and executes the endpoint's proxy mode. Every
/// response is stamped with diagnostic headers and folded into the endpoint
/// counters.
pub mod handlers;
pub mod headers;
pub mod rewrite;
pub mod target;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::affinity::{affinity_cookie, AffinityManager, DerivedKey};
use crate::balance::{BackendSelector, SelectionCounter};
use crate::core::{
    Backend, BackendCluster, EndpointType, LoadBalancerStrategy, PolicyAction, ProxyMode,
    TrafficEndpoint,
};
use crate::error::ProxyError;
use crate::federation::{FederationManager, RouteDecision, FORWARDED_HEADER};
use crate::policy::{PolicyEvaluator, PolicyInput};
use crate::proxy::handlers::UpstreamRequest;
use crate::store::ControlStore;

/// One inbound request, decoupled from the HTTP server types
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Full request path including the `/e/{slug}` prefix
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
}

pub struct Dispatcher {
    store: Arc<dyn ControlStore>,
    federation: Arc<FederationManager>,
    selector: BackendSelector,
    affinity: AffinityManager,
    evaluator: PolicyEvaluator,
    client: reqwest::Client,
    public_origin: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ControlStore>,
        federation: Arc<FederationManager>,
        counter: Arc<dyn SelectionCounter>,
        public_origin: &str,
        connect_timeout_ms: u64,
    ) -> Result<Self, String> {
        // Backend redirects must reach the client untouched, so the proxy
        // client never follows them itself.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_millis(connect_timeout_ms))
            .build()
            .map_err(|e| format!("Failed to build proxy HTTP client: {}", e))?;

        Ok(Self {
            affinity: AffinityManager::new(Arc::clone(&store)),
            store,
            federation,
            selector: BackendSelector::new(counter),
            evaluator: PolicyEvaluator::new(),
            client,
            public_origin: public_origin.trim_end_matches('/').to_string(),
        })
    }

    /// Handle one request end to end. Never returns an error: failures become
    /// typed JSON bodies.
    pub async fn dispatch(&self, inbound: InboundRequest) -> Response {
        let started = Instant::now();
        self.federation.request_started();
        let response = self.dispatch_timed(&inbound, started).await;
        self.federation.request_finished();
        response
    }

    async fn dispatch_timed(&self, inbound: &InboundRequest, started: Instant) -> Response {
        let (slug, sub_path) = match target::split_slug_path(&inbound.path) {
            Some(parts) => parts,
            None => {
                return error_response(&ProxyError::endpoint_not_found(inbound.path.clone()));
            }
        };

        let endpoint = match self.store.find_endpoint_by_slug(slug).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => return error_response(&ProxyError::endpoint_not_found(slug)),
            Err(err) => {
                log::error!("Store lookup for slug {} failed: {}", slug, err);
                return error_response(&ProxyError::backend(format!("store error: {}", err)));
            }
        };

        if !endpoint.is_active {
            let error = ProxyError::EndpointDisabled {
                slug: endpoint.slug.clone(),
            };
            self.record(&endpoint.id, started, true).await;
            return error_response(&error);
        }

        match self.execute(&endpoint, sub_path, inbound).await {
            Ok((mut response, minted_token)) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                stamp_diagnostics(&mut response, &endpoint, elapsed_ms);
                if let Some(token) = minted_token {
                    let cookie = affinity_cookie(&endpoint, &token);
                    if let Ok(value) = HeaderValue::from_str(&cookie) {
                        response.headers_mut().append(SET_COOKIE, value);
                    }
                }
                self.record(&endpoint.id, started, false).await;
                response
            }
            Err(error) => {
                log::warn!("Dispatch for endpoint {} failed: {}", endpoint.slug, error);
                self.record(&endpoint.id, started, true).await;
                error_response(&error)
            }
        }
    }

    /// Dispatch after endpoint resolution. Returns the response plus a fresh
    /// affinity cookie token when one was minted for this request.
    async fn execute(
        &self,
        endpoint: &TrafficEndpoint,
        sub_path: &str,
        inbound: &InboundRequest,
    ) -> Result<(Response, Option<String>), ProxyError> {
        // Mock endpoints answer locally, no backend or peer involved
        if endpoint.endpoint_type == EndpointType::Mock {
            return Ok((handlers::mock_response(endpoint), None));
        }

        if headers::is_websocket_upgrade(&inbound.headers) && !endpoint.websocket_enabled {
            return Err(ProxyError::WebsocketNotSupported {
                slug: endpoint.slug.clone(),
            });
        }

        let derived = AffinityManager::derive_key(endpoint, &inbound.client_ip, &inbound.headers);

        // Affinity-keyed requests may belong to a peer node. Requests that
        // already crossed the federation are pinned here to stop ping-pong
        // between nodes with diverging ring views.
        if !inbound.headers.contains_key(FORWARDED_HEADER) {
            if let Some(derived) = &derived {
                if let RouteDecision::Peer(peer) = self.federation.route_request(&derived.key).await
                {
                    log::debug!(
                        "Key {} for endpoint {} owned by peer {}, forwarding",
                        derived.key,
                        endpoint.slug,
                        peer.node_id
                    );
                    let response = self.federation.forward(&peer, inbound).await?;
                    return Ok((response, None));
                }
            }
        }

        // Routing policies can redirect, reject or re-target the cluster
        let mut cluster_id = endpoint.cluster_id.clone();
        if endpoint.endpoint_type == EndpointType::Route {
            match self.select_policy_action(endpoint, sub_path, inbound).await? {
                Some(PolicyAction::RouteToCluster { cluster_id: target }) => {
                    cluster_id = Some(target);
                }
                Some(PolicyAction::Redirect { location }) => {
                    return Ok((handlers::execute_redirect(&location), None));
                }
                Some(PolicyAction::Reject { status }) => {
                    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
                    return Ok((
                        handlers::assemble(status, HeaderMap::new(), Body::empty()),
                        None,
                    ));
                }
                None => {}
            }
        }

        let cluster = self.resolve_cluster(endpoint, cluster_id.as_deref()).await?;
        let strategy = self.effective_strategy(&cluster).await;

        let backends = self
            .store
            .list_backends(&cluster.id)
            .await
            .map_err(store_error)?;
        if backends.iter().filter(|b| b.is_active).count() == 0 {
            return Err(ProxyError::NoBackends {
                cluster_id: cluster.id.clone(),
            });
        }

        // Sticky backend from a previous visit, re-validated by the selector
        let mut preferred = None;
        if let Some(derived) = &derived {
            preferred = self
                .affinity
                .lookup(endpoint, &derived.key)
                .await
                .map_err(store_error)?;
        }

        let backend = self
            .selector
            .select(
                &cluster.id,
                strategy,
                &backends,
                &inbound.client_ip,
                preferred.as_deref(),
            )
            .await
            .ok_or_else(|| ProxyError::NoHealthyBackends {
                cluster_id: cluster.id.clone(),
            })?;

        let minted_token = self
            .pin_affinity(endpoint, derived.as_ref(), preferred.as_deref(), &backend)
            .await;

        if headers::is_websocket_upgrade(&inbound.headers) {
            return Ok((
                handlers::websocket_connection_info(endpoint, &backend),
                minted_token,
            ));
        }

        let target_url = target::build_target_url(endpoint, &backend, sub_path, inbound.query.as_deref());
        log::debug!(
            "Dispatching {} {} -> {} ({})",
            inbound.method,
            inbound.path,
            target_url,
            endpoint.proxy_mode
        );

        let response = match endpoint.proxy_mode {
            ProxyMode::Redirect => handlers::execute_redirect(&target_url),
            _ => {
                let upstream = UpstreamRequest {
                    method: inbound.method.clone(),
                    headers: headers::build_upstream_headers(
                        endpoint,
                        &backend,
                        &inbound.headers,
                        &inbound.client_ip,
                    ),
                    body: inbound.body.clone(),
                    target_url,
                    endpoint,
                    backend: &backend,
                };
                self.exchange(&upstream, sub_path).await?
            }
        };

        Ok((response, minted_token))
    }

    /// Perform the upstream exchange with the connection gauge held.
    ///
    /// The gauge covers the exchange itself, not the streamed response tail;
    /// it is an estimate feeding LEAST_CONNECTIONS, not an exact count.
    async fn exchange(
        &self,
        upstream: &UpstreamRequest<'_>,
        sub_path: &str,
    ) -> Result<Response, ProxyError> {
        if let Err(err) = self
            .store
            .adjust_backend_connections(&upstream.backend.id, 1)
            .await
        {
            log::debug!("Connection gauge increment failed: {}", err);
        }

        let result = match upstream.endpoint.proxy_mode {
            ProxyMode::Passthrough => handlers::execute_passthrough(&self.client, upstream).await,
            ProxyMode::Smart => {
                handlers::execute_smart(&self.client, upstream, &self.public_origin, sub_path).await
            }
            // Redirect never reaches here; everything else reverse-proxies
            _ => handlers::execute_reverse_proxy(&self.client, upstream, &self.public_origin).await,
        };

        if let Err(err) = self
            .store
            .adjust_backend_connections(&upstream.backend.id, -1)
            .await
        {
            log::debug!("Connection gauge decrement failed: {}", err);
        }

        result
    }

    async fn select_policy_action(
        &self,
        endpoint: &TrafficEndpoint,
        sub_path: &str,
        inbound: &InboundRequest,
    ) -> Result<Option<PolicyAction>, ProxyError> {
        let mut policies = self
            .store
            .list_policies(&endpoint.org_id)
            .await
            .map_err(store_error)?;
        // An endpoint pinned to one policy considers only that policy
        if let Some(pinned) = endpoint.policy_id.as_deref() {
            policies.retain(|p| p.id == pinned);
        }
        let input = PolicyInput::new(sub_path, &inbound.headers, inbound.query.as_deref());
        let selected = self.evaluator.select_policy(&policies, &input);
        if let Some(policy) = selected {
            log::debug!(
                "Policy {} (priority {}) matched endpoint {}",
                policy.name,
                policy.priority,
                endpoint.slug
            );
        }
        Ok(selected.map(|p| p.action.clone()))
    }

    async fn resolve_cluster(
        &self,
        endpoint: &TrafficEndpoint,
        cluster_id: Option<&str>,
    ) -> Result<BackendCluster, ProxyError> {
        let no_cluster = || ProxyError::NoCluster {
            slug: endpoint.slug.clone(),
        };
        let cluster_id = cluster_id.ok_or_else(no_cluster)?;
        let cluster = self
            .store
            .find_cluster(cluster_id)
            .await
            .map_err(store_error)?
            .ok_or_else(no_cluster)?;
        if !cluster.is_active {
            return Err(no_cluster());
        }
        Ok(cluster)
    }

    /// Cluster strategy, unless an active per-cluster override exists
    async fn effective_strategy(&self, cluster: &BackendCluster) -> LoadBalancerStrategy {
        match self.store.find_lb_config(&cluster.id).await {
            Ok(Some(config)) if config.is_active => config.strategy,
            Ok(_) => cluster.strategy,
            Err(err) => {
                log::debug!("LB config lookup for {} failed: {}", cluster.id, err);
                cluster.strategy
            }
        }
    }

    /// Persist the key -> backend mapping when it is new or moved. Stickiness
    /// is best-effort; a store failure here never fails the request.
    async fn pin_affinity(
        &self,
        endpoint: &TrafficEndpoint,
        derived: Option<&DerivedKey>,
        preferred: Option<&str>,
        backend: &Backend,
    ) -> Option<String> {
        let derived = derived?;
        if preferred != Some(backend.id.as_str()) {
            if let Err(err) = self.affinity.save(endpoint, &derived.key, &backend.id).await {
                log::warn!(
                    "Affinity save for endpoint {} failed: {}",
                    endpoint.slug,
                    err
                );
            }
        }
        if derived.minted_cookie {
            Some(derived.key.clone())
        } else {
            None
        }
    }

    /// Fold the outcome into the endpoint counters; failures are swallowed
    async fn record(&self, endpoint_id: &str, started: Instant, is_error: bool) {
        let latency_ms = started.elapsed().as_millis() as f64;
        if let Err(err) = self
            .store
            .record_endpoint_result(endpoint_id, latency_ms, is_error)
            .await
        {
            log::debug!("Statistics update for {} failed: {}", endpoint_id, err);
        }
    }
}

/// Typed JSON error body, `{"code", "message"}`
pub fn error_response(error: &ProxyError) -> Response {
    let body = serde_json::json!({
        "code": error.code(),
        "message": error.to_string(),
    });
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    handlers::assemble(error.http_status(), headers, Body::from(body.to_string()))
}

fn stamp_diagnostics(response: &mut Response, endpoint: &TrafficEndpoint, elapsed_ms: u64) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&endpoint.id) {
        headers.insert("x-endpoint-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&endpoint.slug) {
        headers.insert("x-endpoint-slug", value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed_ms)) {
        headers.insert("x-response-time", value);
    }
    if let Ok(value) = HeaderValue::from_str(&endpoint.proxy_mode.to_string()) {
        headers.insert("x-proxy-mode", value);
    }
}

fn store_error(err: crate::error::StoreError) -> ProxyError {
    ProxyError::backend(format!("store error: {}", err))
}
