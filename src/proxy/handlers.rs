/// Proxy mode execution
///
/// REDIRECT answers with a 302 to the backend URL. PASSTHROUGH forwards and
/// returns the backend response as-is (plus X-Backend-Host). REVERSE_PROXY
/// rewrites response headers and textual bodies so the backend stays hidden
/// behind the public origin. SMART performs the request, inspects the
/// response and picks the treatment.
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::core::{Backend, BackendProtocol, TrafficEndpoint};
use crate::error::ProxyError;
use crate::proxy::headers::{filter_response_headers, rewrite_response_headers};
use crate::proxy::rewrite::{is_textual_content_type, rewrite_body};

/// Everything needed to perform one upstream exchange
pub struct UpstreamRequest<'a> {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub target_url: String,
    pub endpoint: &'a TrafficEndpoint,
    pub backend: &'a Backend,
}

/// What SMART mode decided to do with a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmartAction {
    Proxy,
    Redirect,
}

/// File extensions treated as static assets by SMART analysis
const STATIC_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".mjs", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff", ".woff2",
    ".ttf", ".map", ".webp",
];

fn is_static_asset(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path).to_ascii_lowercase();
    STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Inspect a backend response and decide how SMART mode serves it.
///
/// Every rule currently lands on `Proxy`: upgrades, streams, auth
/// challenges, cookie-setting responses, JSON and static assets all need the
/// public origin preserved. The `Redirect` action stays part of the contract
/// for analyses that may later prefer a client-side hop; no rule returns it
/// today.
pub fn analyze_for_smart_mode(
    status: StatusCode,
    response_headers: &HeaderMap,
    request_path: &str,
) -> SmartAction {
    if response_headers.contains_key(UPGRADE) {
        return SmartAction::Proxy;
    }

    let content_type = response_headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.contains("event-stream") || content_type.contains("octet-stream") {
        return SmartAction::Proxy;
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return SmartAction::Proxy;
    }

    if response_headers.contains_key(SET_COOKIE) {
        return SmartAction::Proxy;
    }

    if content_type.contains("json") {
        return SmartAction::Proxy;
    }

    if is_static_asset(request_path) {
        return SmartAction::Proxy;
    }

    SmartAction::Proxy
}

/// Perform the upstream exchange with the endpoint's read timeout
async fn send_upstream(
    client: &reqwest::Client,
    up: &UpstreamRequest<'_>,
) -> Result<reqwest::Response, ProxyError> {
    let request = client
        .request(up.method.clone(), &up.target_url)
        .headers(up.headers.clone())
        .body(up.body.clone())
        .timeout(Duration::from_millis(up.endpoint.read_timeout_ms));

    match request.send().await {
        Ok(response) => Ok(response),
        Err(err) if err.is_timeout() => Err(ProxyError::timeout(&up.target_url)),
        Err(err) if err.is_connect() => Err(ProxyError::backend(format!(
            "connect to {} failed: {}",
            up.backend.address(),
            err
        ))),
        Err(err) => Err(ProxyError::backend(err.to_string())),
    }
}

pub(crate) fn assemble(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// REDIRECT: 302 to the target URL, no backend contact
pub fn execute_redirect(target_url: &str) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(target_url) {
        headers.insert(LOCATION, value);
    }
    assemble(StatusCode::FOUND, headers, Body::empty())
}

/// PASSTHROUGH: response streamed back unmodified except X-Backend-Host
pub async fn execute_passthrough(
    client: &reqwest::Client,
    up: &UpstreamRequest<'_>,
) -> Result<Response, ProxyError> {
    let response = send_upstream(client, up).await?;
    let status = response.status();
    let mut headers = filter_response_headers(response.headers());
    if let Ok(value) = HeaderValue::from_str(&up.backend.address()) {
        headers.insert("x-backend-host", value);
    }
    Ok(assemble(
        status,
        headers,
        Body::from_stream(response.bytes_stream()),
    ))
}

/// REVERSE_PROXY: headers rewritten, textual bodies origin-rewritten
pub async fn execute_reverse_proxy(
    client: &reqwest::Client,
    up: &UpstreamRequest<'_>,
    public_origin: &str,
) -> Result<Response, ProxyError> {
    let response = send_upstream(client, up).await?;
    finish_reverse_proxy(response, up, public_origin).await
}

/// SMART: one upstream exchange, then response analysis picks the treatment
pub async fn execute_smart(
    client: &reqwest::Client,
    up: &UpstreamRequest<'_>,
    public_origin: &str,
    request_path: &str,
) -> Result<Response, ProxyError> {
    let response = send_upstream(client, up).await?;

    match analyze_for_smart_mode(response.status(), response.headers(), request_path) {
        SmartAction::Proxy => finish_reverse_proxy(response, up, public_origin).await,
        SmartAction::Redirect => Ok(execute_redirect(&up.target_url)),
    }
}

/// Shared reverse-proxy post-processing of a backend response
async fn finish_reverse_proxy(
    response: reqwest::Response,
    up: &UpstreamRequest<'_>,
    public_origin: &str,
) -> Result<Response, ProxyError> {
    let status = response.status();
    let headers = rewrite_response_headers(up.endpoint, up.backend, public_origin, response.headers());
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if is_textual_content_type(&content_type) {
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProxyError::backend(format!("reading backend body: {}", err)))?;
        // Mislabeled binary stays untouched
        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => {
                let public_base = format!("{}/e/{}", public_origin, up.endpoint.slug);
                let rewritten = rewrite_body(&text, up.backend, &public_base);
                Ok(assemble(status, headers, Body::from(rewritten)))
            }
            Err(_) => Ok(assemble(status, headers, Body::from(bytes))),
        }
    } else {
        Ok(assemble(
            status,
            headers,
            Body::from_stream(response.bytes_stream()),
        ))
    }
}

/// Websocket upgrades are not tunneled; the client gets the backend's
/// connection coordinates and dials directly.
pub fn websocket_connection_info(endpoint: &TrafficEndpoint, backend: &Backend) -> Response {
    let ws_scheme = match backend.protocol {
        BackendProtocol::Http => "ws",
        BackendProtocol::Https => "wss",
    };
    let body = serde_json::json!({
        "endpoint": endpoint.slug,
        "websocket": {
            "host": backend.host,
            "port": backend.port,
            "url": format!("{}://{}:{}", ws_scheme, backend.host, backend.port),
        },
    });

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    assemble(StatusCode::OK, headers, Body::from(body.to_string()))
}

/// MOCK endpoints answer from configuration without touching any backend
pub fn mock_response(endpoint: &TrafficEndpoint) -> Response {
    let status =
        StatusCode::from_u16(endpoint.mock_status).unwrap_or(StatusCode::OK);
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&endpoint.mock_content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    assemble(status, headers, Body::from(endpoint.mock_body.clone()))
}
