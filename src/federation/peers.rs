/// Peer cache and ring membership
///
/// Process-local view of the federation: the node itself, its Principle (when
/// it has one) and its partners, each with health and load. The consistent
/// hash ring is rebuilt from the healthy subset, so peers that miss their
/// heartbeat window stop owning keys without any persisted state change.
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::core::{FederationConfig, FederationPartner, NodeRole};
use crate::ring::HashRing;

/// One federation peer as this node currently sees it
#[derive(Debug, Clone)]
pub struct PeerNode {
    pub node_id: String,
    pub node_name: String,
    pub node_url: String,
    pub secret_key: String,
    pub is_self: bool,
    pub healthy: bool,
    pub load_percent: u8,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

struct RegistryInner {
    peers: HashMap<String, PeerNode>,
    ring: HashRing,
}

pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
    heartbeat_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(heartbeat_timeout_secs: u64) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                peers: HashMap::new(),
                ring: HashRing::build(&[]),
            }),
            heartbeat_timeout: i64::try_from(heartbeat_timeout_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(Duration::MAX),
        }
    }

    /// Rebuild the peer set from persisted federation state.
    ///
    /// The node itself is always healthy. A remote peer is healthy while its
    /// last heartbeat falls inside the timeout window; a peer that has never
    /// heartbeated yet is trusted until the window from its registration
    /// passes, so fresh partners can receive traffic before their first beat.
    pub async fn rebuild(&self, config: &FederationConfig, partners: &[FederationPartner]) {
        let now = Utc::now();
        let mut peers = HashMap::new();

        peers.insert(
            config.node_id.clone(),
            PeerNode {
                node_id: config.node_id.clone(),
                node_name: config.node_name.clone(),
                node_url: config.node_url.clone(),
                secret_key: config.secret_key.clone(),
                is_self: true,
                healthy: true,
                load_percent: 0,
                last_heartbeat: None,
            },
        );

        if config.role == NodeRole::Partner {
            if let (Some(principle_id), Some(principle_url)) =
                (&config.principle_node_id, &config.principle_url)
            {
                peers.insert(
                    principle_id.clone(),
                    PeerNode {
                        node_id: principle_id.clone(),
                        node_name: principle_id.clone(),
                        node_url: principle_url.clone(),
                        secret_key: config.secret_key.clone(),
                        is_self: false,
                        healthy: self.is_fresh(config.last_heartbeat, now),
                        load_percent: 0,
                        last_heartbeat: config.last_heartbeat,
                    },
                );
            }
        }

        for partner in partners {
            if !partner.is_active {
                continue;
            }
            peers.insert(
                partner.node_id.clone(),
                PeerNode {
                    node_id: partner.node_id.clone(),
                    node_name: partner.node_name.clone(),
                    node_url: partner.node_url.clone(),
                    secret_key: partner.secret_key.clone(),
                    is_self: false,
                    healthy: self.is_fresh(partner.last_heartbeat, now),
                    load_percent: 0,
                    last_heartbeat: partner.last_heartbeat,
                },
            );
        }

        let mut inner = self.inner.write().await;
        // Carry live load figures across rebuilds
        for (node_id, previous) in &inner.peers {
            if let Some(peer) = peers.get_mut(node_id) {
                peer.load_percent = previous.load_percent;
                if peer.last_heartbeat.is_none() {
                    peer.last_heartbeat = previous.last_heartbeat;
                    peer.healthy = peer.is_self || self.is_fresh(previous.last_heartbeat, now);
                }
            }
        }
        inner.ring = Self::ring_of(&peers);
        inner.peers = peers;
    }

    fn is_fresh(&self, last_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_heartbeat {
            Some(at) => now - at <= self.heartbeat_timeout,
            // Never heard from: give it one full window
            None => true,
        }
    }

    fn ring_of(peers: &HashMap<String, PeerNode>) -> HashRing {
        let healthy: Vec<String> = peers
            .values()
            .filter(|p| p.healthy)
            .map(|p| p.node_id.clone())
            .collect();
        HashRing::build(&healthy)
    }

    /// Record a heartbeat from (or an ack by) a peer
    pub async fn record_heartbeat(&self, node_id: &str, load_percent: u8) {
        let mut inner = self.inner.write().await;
        let mut rejoined = false;
        if let Some(peer) = inner.peers.get_mut(node_id) {
            rejoined = !peer.healthy;
            peer.healthy = true;
            peer.load_percent = load_percent;
            peer.last_heartbeat = Some(Utc::now());
        }
        if rejoined {
            inner.ring = Self::ring_of(&inner.peers);
        }
    }

    pub async fn mark_unhealthy(&self, node_id: &str) {
        let mut inner = self.inner.write().await;
        let mut dropped = false;
        if let Some(peer) = inner.peers.get_mut(node_id) {
            dropped = peer.healthy;
            peer.healthy = false;
        }
        if dropped {
            inner.ring = Self::ring_of(&inner.peers);
        }
    }

    /// Drop ring membership for peers whose heartbeat window lapsed; returns
    /// the node ids that were expired
    pub async fn expire_stale(&self) -> Vec<String> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut expired = Vec::new();
        for peer in inner.peers.values_mut() {
            if peer.is_self || !peer.healthy {
                continue;
            }
            let fresh = match peer.last_heartbeat {
                Some(at) => now - at <= self.heartbeat_timeout,
                None => true,
            };
            if !fresh {
                peer.healthy = false;
                expired.push(peer.node_id.clone());
            }
        }
        if !expired.is_empty() {
            inner.ring = Self::ring_of(&inner.peers);
        }
        expired
    }

    /// Ring owner for a key
    pub async fn owner(&self, key: &str) -> Option<PeerNode> {
        let inner = self.inner.read().await;
        let node_id = inner.ring.node_for_key(key)?;
        inner.peers.get(node_id).cloned()
    }

    /// All ring replicas for a key in preference order (owner first)
    pub async fn replicas(&self, key: &str) -> Vec<PeerNode> {
        let inner = self.inner.read().await;
        let count = inner.ring.node_count();
        inner
            .ring
            .replica_nodes(key, count)
            .into_iter()
            .filter_map(|node_id| inner.peers.get(&node_id).cloned())
            .collect()
    }

    pub async fn get(&self, node_id: &str) -> Option<PeerNode> {
        let inner = self.inner.read().await;
        inner.peers.get(node_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<PeerNode> {
        let inner = self.inner.read().await;
        inner.peers.values().cloned().collect()
    }

    pub async fn ring_size(&self) -> usize {
        let inner = self.inner.read().await;
        inner.ring.node_count()
    }
}
