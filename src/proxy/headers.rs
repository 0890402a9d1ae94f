/// Header surgery for proxied requests and responses
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, LOCATION, SET_COOKIE,
    UPGRADE,
};

use crate::core::{Backend, TrafficEndpoint};
use crate::proxy::rewrite::origin_variants;

/// Hop-by-hop headers are connection-scoped and never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Headers sent upstream: inbound headers minus hop-by-hop, Host handled by
/// the endpoint's host policy, forwarding headers appended.
pub fn build_upstream_headers(
    endpoint: &TrafficEndpoint,
    backend: &Backend,
    inbound: &HeaderMap,
    client_ip: &str,
) -> HeaderMap {
    let mut upstream = HeaderMap::new();

    for (name, value) in inbound {
        if is_hop_by_hop(name) || *name == HOST || *name == CONTENT_LENGTH {
            continue;
        }
        upstream.append(name.clone(), value.clone());
    }

    // preserve_host_header keeps the client-facing Host and wins over
    // rewrite_host_header, which pins Host to backend:port explicitly;
    // with neither flag the HTTP client derives Host from the target URL
    if endpoint.preserve_host_header {
        if let Some(host) = inbound.get(HOST) {
            upstream.insert(HOST, host.clone());
        }
    } else if endpoint.rewrite_host_header {
        if let Ok(value) = HeaderValue::from_str(&backend.address()) {
            upstream.insert(HOST, value);
        }
    }

    let forwarded_for = match inbound.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        upstream.insert("x-forwarded-for", value);
    }
    if !upstream.contains_key("x-real-ip") {
        if let Ok(value) = HeaderValue::from_str(client_ip) {
            upstream.insert("x-real-ip", value);
        }
    }
    if let Some(host) = inbound.get(HOST) {
        if !upstream.contains_key("x-forwarded-host") {
            upstream.insert("x-forwarded-host", host.clone());
        }
    }
    if !upstream.contains_key("x-forwarded-proto") {
        upstream.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }

    upstream
}

/// Response headers for PASSTHROUGH: hop-by-hop stripped, everything else
/// untouched
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) || *name == CONTENT_LENGTH {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Response headers for REVERSE_PROXY: backend origins swapped for the public
/// endpoint base in Location, Content-Location and Link; cookie domains
/// dropped so cookies bind to the public host; CORS origin adjusted.
pub fn rewrite_response_headers(
    endpoint: &TrafficEndpoint,
    backend: &Backend,
    public_origin: &str,
    headers: &HeaderMap,
) -> HeaderMap {
    let public_base = format!("{}/e/{}", public_origin, endpoint.slug);
    let variants = origin_variants(backend);
    let mut rewritten = HeaderMap::new();

    for (name, value) in headers {
        if is_hop_by_hop(name) || *name == CONTENT_LENGTH {
            continue;
        }

        if *name == LOCATION || *name == "content-location" || *name == "link" {
            if let Ok(text) = value.to_str() {
                let replaced = rewrite_url_value(text, &variants, &public_base, &endpoint.slug);
                if let Ok(new_value) = HeaderValue::from_str(&replaced) {
                    rewritten.append(name.clone(), new_value);
                    continue;
                }
            }
        }

        if *name == SET_COOKIE {
            if let Ok(text) = value.to_str() {
                let stripped = strip_cookie_domain(text);
                if let Ok(new_value) = HeaderValue::from_str(&stripped) {
                    rewritten.append(name.clone(), new_value);
                    continue;
                }
            }
        }

        if *name == "access-control-allow-origin" {
            if let Ok(text) = value.to_str() {
                if variants.iter().any(|v| v == text) {
                    if let Ok(new_value) = HeaderValue::from_str(public_origin) {
                        rewritten.append(name.clone(), new_value);
                        continue;
                    }
                }
            }
        }

        rewritten.append(name.clone(), value.clone());
    }

    rewritten
}

/// Swap backend origins for the public base inside a single URL-bearing
/// header value; bare absolute paths get the endpoint prefix.
fn rewrite_url_value(value: &str, variants: &[String], public_base: &str, slug: &str) -> String {
    for variant in variants {
        if let Some(rest) = value.strip_prefix(variant.as_str()) {
            return format!("{}{}", public_base, rest);
        }
    }
    if value.starts_with('/') && !value.starts_with("//") {
        return format!("/e/{}{}", slug, value);
    }
    // Link headers may carry the origin mid-value, inside angle brackets
    let mut result = value.to_string();
    for variant in variants {
        if result.contains(variant.as_str()) {
            result = result.replace(variant.as_str(), public_base);
        }
    }
    result
}

/// Remove the Domain attribute so the cookie binds to the public host
fn strip_cookie_domain(cookie: &str) -> String {
    cookie
        .split(';')
        .map(str::trim)
        .filter(|part| !part.to_ascii_lowercase().starts_with("domain="))
        .collect::<Vec<_>>()
        .join("; ")
}

/// True when the request asks for a websocket upgrade
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade_is_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrades = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade_is_websocket && connection_upgrades
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EndpointType;

    fn endpoint() -> TrafficEndpoint {
        TrafficEndpoint::new("org-1", "api-main", EndpointType::LoadBalance).unwrap()
    }

    fn backend() -> Backend {
        Backend::new("cl-1", "10.0.0.5", 8080).unwrap()
    }

    #[test]
    fn test_hop_by_hop_stripped_upstream() {
        let mut inbound = HeaderMap::new();
        inbound.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let upstream = build_upstream_headers(&endpoint(), &backend(), &inbound, "1.2.3.4");
        assert!(upstream.get(CONNECTION).is_none());
        assert!(upstream.get("transfer-encoding").is_none());
        assert_eq!(upstream.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_forwarding_headers_added() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("edge.example.com"));

        let upstream = build_upstream_headers(&endpoint(), &backend(), &inbound, "1.2.3.4");
        assert_eq!(upstream.get("x-forwarded-for").unwrap(), "1.2.3.4");
        assert_eq!(upstream.get("x-real-ip").unwrap(), "1.2.3.4");
        assert_eq!(upstream.get("x-forwarded-host").unwrap(), "edge.example.com");
        assert_eq!(upstream.get("x-forwarded-proto").unwrap(), "http");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9"));

        let upstream = build_upstream_headers(&endpoint(), &backend(), &inbound, "1.2.3.4");
        assert_eq!(upstream.get("x-forwarded-for").unwrap(), "9.9.9.9, 1.2.3.4");
    }

    #[test]
    fn test_host_policy() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("edge.example.com"));

        // Default: Host comes from the target URL, not the inbound value
        let upstream = build_upstream_headers(&endpoint(), &backend(), &inbound, "1.2.3.4");
        assert!(upstream.get(HOST).is_none());

        let mut preserving = endpoint();
        preserving.preserve_host_header = true;
        let upstream = build_upstream_headers(&preserving, &backend(), &inbound, "1.2.3.4");
        assert_eq!(upstream.get(HOST).unwrap(), "edge.example.com");

        let mut rewriting = endpoint();
        rewriting.rewrite_host_header = true;
        let upstream = build_upstream_headers(&rewriting, &backend(), &inbound, "1.2.3.4");
        assert_eq!(upstream.get(HOST).unwrap(), "10.0.0.5:8080");

        // preserve wins when both flags are set
        rewriting.preserve_host_header = true;
        let upstream = build_upstream_headers(&rewriting, &backend(), &inbound, "1.2.3.4");
        assert_eq!(upstream.get(HOST).unwrap(), "edge.example.com");
    }

    #[test]
    fn test_location_rewrite_absolute() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION,
            HeaderValue::from_static("http://10.0.0.5:8080/login?next=1"),
        );

        let rewritten =
            rewrite_response_headers(&endpoint(), &backend(), "https://edge.example.com", &headers);
        assert_eq!(
            rewritten.get(LOCATION).unwrap(),
            "https://edge.example.com/e/api-main/login?next=1"
        );
    }

    #[test]
    fn test_location_rewrite_relative() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("/login"));

        let rewritten =
            rewrite_response_headers(&endpoint(), &backend(), "https://edge.example.com", &headers);
        assert_eq!(rewritten.get(LOCATION).unwrap(), "/e/api-main/login");
    }

    #[test]
    fn test_foreign_location_untouched() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION,
            HeaderValue::from_static("https://elsewhere.example.com/x"),
        );

        let rewritten =
            rewrite_response_headers(&endpoint(), &backend(), "https://edge.example.com", &headers);
        assert_eq!(
            rewritten.get(LOCATION).unwrap(),
            "https://elsewhere.example.com/x"
        );
    }

    #[test]
    fn test_cookie_domain_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SET_COOKIE,
            HeaderValue::from_static("sid=abc; Domain=10.0.0.5; Path=/; HttpOnly"),
        );

        let rewritten =
            rewrite_response_headers(&endpoint(), &backend(), "https://edge.example.com", &headers);
        let cookie = rewritten.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(!cookie.to_lowercase().contains("domain="));
        assert!(cookie.contains("sid=abc"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[test]
    fn test_cors_origin_swapped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "access-control-allow-origin",
            HeaderValue::from_static("http://10.0.0.5:8080"),
        );

        let rewritten =
            rewrite_response_headers(&endpoint(), &backend(), "https://edge.example.com", &headers);
        assert_eq!(
            rewritten.get("access-control-allow-origin").unwrap(),
            "https://edge.example.com"
        );
    }

    #[test]
    fn test_link_header_origin_swapped_in_place() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static("<http://10.0.0.5:8080/page/2>; rel=\"next\""),
        );

        let rewritten =
            rewrite_response_headers(&endpoint(), &backend(), "https://edge.example.com", &headers);
        assert_eq!(
            rewritten.get("link").unwrap(),
            "<https://edge.example.com/e/api-main/page/2>; rel=\"next\""
        );
    }

    #[test]
    fn test_websocket_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn test_passthrough_filter_keeps_everything_else() {
        let mut headers = HeaderMap::new();
        headers.insert("x-backend-version", HeaderValue::from_static("7"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.insert(
            LOCATION,
            HeaderValue::from_static("http://10.0.0.5:8080/raw"),
        );

        let filtered = filter_response_headers(&headers);
        assert_eq!(filtered.get("x-backend-version").unwrap(), "7");
        assert!(filtered.get(CONNECTION).is_none());
        // Passthrough does not rewrite redirects
        assert_eq!(filtered.get(LOCATION).unwrap(), "http://10.0.0.5:8080/raw");
    }
}
