/// Target URL construction for proxied requests
use crate::core::{Backend, TrafficEndpoint};

/// Split an inbound path into the endpoint slug and the remaining sub-path.
///
/// "/e/api-main/v1/users" becomes ("api-main", "/v1/users");
/// "/e/api-main" becomes ("api-main", "").
pub fn split_slug_path(full_path: &str) -> Option<(&str, &str)> {
    let rest = full_path.strip_prefix("/e/")?;
    if rest.is_empty() {
        return None;
    }
    match rest.find('/') {
        Some(idx) => Some((&rest[..idx], &rest[idx..])),
        None => Some((rest, "")),
    }
}

/// Build the upstream URL for a request.
///
/// The slug prefix is already gone from `sub_path`; this applies the
/// endpoint's strip/add prefixes and prepends the backend origin, keeping the
/// query string untouched.
pub fn build_target_url(
    endpoint: &TrafficEndpoint,
    backend: &Backend,
    sub_path: &str,
    query: Option<&str>,
) -> String {
    let mut path = if sub_path.is_empty() {
        "/".to_string()
    } else {
        sub_path.to_string()
    };

    if let Some(prefix) = &endpoint.strip_path_prefix {
        if let Some(stripped) = path.strip_prefix(prefix.as_str()) {
            path = if stripped.starts_with('/') {
                stripped.to_string()
            } else {
                format!("/{}", stripped)
            };
        }
    }

    if let Some(prefix) = &endpoint.add_path_prefix {
        let prefix = prefix.trim_end_matches('/');
        path = format!("{}{}", prefix, path);
        if !path.starts_with('/') {
            path = format!("/{}", path);
        }
    }

    match query {
        Some(q) if !q.is_empty() => format!("{}{}?{}", backend.origin(), path, q),
        _ => format!("{}{}", backend.origin(), path),
    }
}
