/// Backend selection strategies
///
/// Selection order: healthy backends first, draining backends only when no
/// healthy one remains, never unhealthy or maintenance backends. A preferred
/// backend (session affinity) short-circuits the strategy entirely when it is
/// still eligible.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

use crate::core::{Backend, BackendStatus, LoadBalancerStrategy};

/// Monotonic per-scope counters driving ROUND_ROBIN rotation.
///
/// Kept behind a trait so multi-instance deployments can move the counters
/// into a shared fast store with atomic increments; rotation is then global
/// instead of per-process.
#[async_trait]
pub trait SelectionCounter: Send + Sync {
    async fn next(&self, scope: &str) -> u64;
}

/// Process-local counter service, the default
#[derive(Default)]
pub struct MemoryCounter {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SelectionCounter for MemoryCounter {
    async fn next(&self, scope: &str) -> u64 {
        {
            let counters = self.counters.read().await;
            if let Some(counter) = counters.get(scope) {
                return counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut counters = self.counters.write().await;
        let counter = counters
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct BackendSelector {
    counter: Arc<dyn SelectionCounter>,
}

impl BackendSelector {
    pub fn new(counter: Arc<dyn SelectionCounter>) -> Self {
        Self { counter }
    }

    /// Pick a backend for one request.
    ///
    /// `scope` is the rotation scope (the cluster id), `preferred` is the
    /// backend id an affinity mapping points at.
    pub async fn select(
        &self,
        scope: &str,
        strategy: LoadBalancerStrategy,
        backends: &[Backend],
        client_ip: &str,
        preferred: Option<&str>,
    ) -> Option<Backend> {
        let eligible = Self::eligible_backends(backends);
        if eligible.is_empty() {
            return None;
        }

        if let Some(preferred_id) = preferred {
            if let Some(backend) = eligible.iter().find(|b| b.id == preferred_id) {
                return Some((*backend).clone());
            }
        }

        let index = match strategy {
            LoadBalancerStrategy::RoundRobin => {
                (self.counter.next(scope).await % eligible.len() as u64) as usize
            }
            LoadBalancerStrategy::LeastConnections => eligible
                .iter()
                .enumerate()
                .min_by_key(|(_, b)| b.current_connections)
                .map(|(i, _)| i)?,
            LoadBalancerStrategy::Random => rand::thread_rng().gen_range(0..eligible.len()),
            LoadBalancerStrategy::IpHash => Self::ip_hash_index(client_ip, eligible.len()),
            LoadBalancerStrategy::WeightedRoundRobin => Self::weighted_index(&eligible),
        };

        eligible.get(index).map(|b| (*b).clone())
    }

    /// Healthy backends, or draining ones as a last resort
    fn eligible_backends(backends: &[Backend]) -> Vec<&Backend> {
        let healthy: Vec<&Backend> = backends
            .iter()
            .filter(|b| b.is_active && b.status == BackendStatus::Healthy)
            .collect();
        if !healthy.is_empty() {
            return healthy;
        }
        backends
            .iter()
            .filter(|b| b.is_active && b.status == BackendStatus::Draining)
            .collect()
    }

    /// Sum of character codes modulo the backend count. Not a real hash:
    /// permuted addresses collide ("1.2.3.4" and "4.3.2.1" land together),
    /// which is accepted for the stability it gives without per-client state.
    fn ip_hash_index(client_ip: &str, count: usize) -> usize {
        let sum = client_ip
            .chars()
            .fold(0u32, |acc, c| acc.wrapping_add(c as u32));
        (sum as usize) % count
    }

    /// Cumulative-weight random draw; zero-weight backends never win unless
    /// every weight is zero, which degrades to a uniform draw
    fn weighted_index(eligible: &[&Backend]) -> usize {
        let total: u64 = eligible.iter().map(|b| b.weight as u64).sum();
        if total == 0 {
            return rand::thread_rng().gen_range(0..eligible.len());
        }

        let draw = rand::thread_rng().gen_range(0..total);
        let mut cumulative = 0u64;
        for (index, backend) in eligible.iter().enumerate() {
            cumulative += backend.weight as u64;
            if draw < cumulative {
                return index;
            }
        }
        eligible.len() - 1
    }
}
