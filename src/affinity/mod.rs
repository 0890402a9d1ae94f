/// Session affinity management
///
/// Maps a per-client key to the backend that served it, persisted with a TTL
/// so every node of the federation sees the same stickiness. Keys are derived
/// per endpoint: an opaque cookie token, a fingerprint of the client IP, or a
/// fingerprint of a configured header.
use std::sync::Arc;

use chrono::Utc;
use http::header::COOKIE;
use http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::core::{AffinityMapping, SessionAffinityMode, TrafficEndpoint};
use crate::store::{ControlStore, StoreResult};

/// Affinity key for one request, plus whether a fresh cookie token was minted
/// and must be set on the response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    pub key: String,
    pub minted_cookie: bool,
}

/// Statistics about persisted affinity mappings
#[derive(Debug, Clone)]
pub struct AffinityStats {
    pub active_mappings: usize,
}

pub struct AffinityManager {
    store: Arc<dyn ControlStore>,
}

impl AffinityManager {
    pub fn new(store: Arc<dyn ControlStore>) -> Self {
        Self { store }
    }

    /// Derive the affinity key for a request, or None when the endpoint does
    /// not use affinity (or a HEADER-mode request lacks the header).
    pub fn derive_key(
        endpoint: &TrafficEndpoint,
        client_ip: &str,
        headers: &HeaderMap,
    ) -> Option<DerivedKey> {
        match endpoint.session_affinity {
            SessionAffinityMode::None => None,
            SessionAffinityMode::Cookie => {
                match cookie_value(headers, &endpoint.affinity_cookie_name) {
                    Some(value) => Some(DerivedKey {
                        key: value,
                        minted_cookie: false,
                    }),
                    None => Some(DerivedKey {
                        key: crate::utils::generate_cookie_token(),
                        minted_cookie: true,
                    }),
                }
            }
            SessionAffinityMode::IpHash => Some(DerivedKey {
                key: fingerprint(client_ip),
                minted_cookie: false,
            }),
            SessionAffinityMode::Header => {
                let name = endpoint.affinity_header_name.as_deref()?;
                let value = headers.get(name)?.to_str().ok()?;
                Some(DerivedKey {
                    key: fingerprint(value),
                    minted_cookie: false,
                })
            }
        }
    }

    /// Look up the sticky backend for a key. Expired mappings are deleted on
    /// read; health re-validation is the selector's job.
    pub async fn lookup(
        &self,
        endpoint: &TrafficEndpoint,
        key: &str,
    ) -> StoreResult<Option<String>> {
        match self.store.find_affinity(&endpoint.id, key).await? {
            Some(mapping) if mapping.is_expired(Utc::now()) => {
                self.store.delete_affinity(&endpoint.id, key).await?;
                log::debug!(
                    "Expired affinity mapping removed for endpoint {} key {}",
                    endpoint.slug,
                    key
                );
                Ok(None)
            }
            Some(mapping) => Ok(Some(mapping.backend_id)),
            None => Ok(None),
        }
    }

    /// Record (or move) the sticky backend for a key, stamped now + TTL
    pub async fn save(
        &self,
        endpoint: &TrafficEndpoint,
        key: &str,
        backend_id: &str,
    ) -> StoreResult<()> {
        let mapping =
            AffinityMapping::new(&endpoint.id, key, backend_id, endpoint.affinity_ttl_seconds);
        self.store.put_affinity(mapping).await?;
        log::debug!(
            "Affinity mapping saved: endpoint {} key {} -> backend {}",
            endpoint.slug,
            key,
            backend_id
        );
        Ok(())
    }

    /// Remove mappings past their TTL; returns how many were purged
    pub async fn cleanup_expired(&self) -> StoreResult<usize> {
        self.store.purge_expired_affinity(Utc::now()).await
    }

    pub async fn statistics(&self) -> StoreResult<AffinityStats> {
        Ok(AffinityStats {
            active_mappings: self.store.count_affinity().await?,
        })
    }
}

/// Set-Cookie value for a freshly minted affinity token
pub fn affinity_cookie(endpoint: &TrafficEndpoint, token: &str) -> String {
    format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        endpoint.affinity_cookie_name, token, endpoint.affinity_ttl_seconds
    )
}

/// Extract one cookie from the Cookie request header
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

/// SHA-256 fingerprint truncated to 8 bytes, hex encoded
fn fingerprint(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EndpointType;
    use crate::store::MemoryStore;
    use http::HeaderValue;

    fn endpoint_with(mode: SessionAffinityMode) -> TrafficEndpoint {
        let mut ep = TrafficEndpoint::new("org-1", "api", EndpointType::LoadBalance).unwrap();
        ep.session_affinity = mode;
        ep
    }

    #[test]
    fn test_no_affinity_mode_derives_nothing() {
        let ep = endpoint_with(SessionAffinityMode::None);
        assert!(AffinityManager::derive_key(&ep, "1.2.3.4", &HeaderMap::new()).is_none());
    }

    #[test]
    fn test_cookie_mode_uses_existing_cookie() {
        let ep = endpoint_with(SessionAffinityMode::Cookie);
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("other=1; sf_affinity=tok123; x=y"),
        );

        let derived = AffinityManager::derive_key(&ep, "1.2.3.4", &headers).unwrap();
        assert_eq!(derived.key, "tok123");
        assert!(!derived.minted_cookie);
    }

    #[test]
    fn test_cookie_mode_mints_token_when_absent() {
        let ep = endpoint_with(SessionAffinityMode::Cookie);
        let derived = AffinityManager::derive_key(&ep, "1.2.3.4", &HeaderMap::new()).unwrap();
        assert!(derived.minted_cookie);
        assert_eq!(derived.key.len(), 32);
    }

    #[test]
    fn test_ip_hash_mode_is_deterministic() {
        let ep = endpoint_with(SessionAffinityMode::IpHash);
        let a = AffinityManager::derive_key(&ep, "10.0.0.9", &HeaderMap::new()).unwrap();
        let b = AffinityManager::derive_key(&ep, "10.0.0.9", &HeaderMap::new()).unwrap();
        let c = AffinityManager::derive_key(&ep, "10.0.0.10", &HeaderMap::new()).unwrap();

        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
        assert_eq!(a.key.len(), 16);
        assert!(!a.minted_cookie);
    }

    #[test]
    fn test_header_mode_requires_header() {
        let mut ep = endpoint_with(SessionAffinityMode::Header);
        ep.affinity_header_name = Some("x-tenant".to_string());

        assert!(AffinityManager::derive_key(&ep, "1.2.3.4", &HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", HeaderValue::from_static("acme"));
        let derived = AffinityManager::derive_key(&ep, "1.2.3.4", &headers).unwrap();
        assert_eq!(derived.key.len(), 16);
    }

    #[tokio::test]
    async fn test_save_and_lookup_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let manager = AffinityManager::new(store);
        let ep = endpoint_with(SessionAffinityMode::Cookie);

        assert_eq!(manager.lookup(&ep, "tok").await.unwrap(), None);
        manager.save(&ep, "tok", "be-7").await.unwrap();
        assert_eq!(
            manager.lookup(&ep, "tok").await.unwrap(),
            Some("be-7".to_string())
        );
    }

    #[tokio::test]
    async fn test_expired_mapping_deleted_on_read() {
        let store = Arc::new(MemoryStore::new());
        let manager = AffinityManager::new(store.clone());
        let mut ep = endpoint_with(SessionAffinityMode::Cookie);
        ep.affinity_ttl_seconds = 0; // expires immediately

        manager.save(&ep, "tok", "be-7").await.unwrap();
        assert_eq!(manager.lookup(&ep, "tok").await.unwrap(), None);
        // Lazy delete removed the row entirely
        assert_eq!(store.count_affinity().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_overwrites_mapping() {
        let store = Arc::new(MemoryStore::new());
        let manager = AffinityManager::new(store);
        let ep = endpoint_with(SessionAffinityMode::Cookie);

        manager.save(&ep, "tok", "be-1").await.unwrap();
        manager.save(&ep, "tok", "be-2").await.unwrap();
        assert_eq!(
            manager.lookup(&ep, "tok").await.unwrap(),
            Some("be-2".to_string())
        );
    }

    #[test]
    fn test_affinity_cookie_format() {
        let ep = endpoint_with(SessionAffinityMode::Cookie);
        let cookie = affinity_cookie(&ep, "tok123");
        assert!(cookie.starts_with("sf_affinity=tok123"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.contains("HttpOnly"));
    }
}
