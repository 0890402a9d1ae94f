/// Consistent-hash ring over federation peers
///
/// Affinity keys are routed to nodes through this ring so sticky sessions
/// stay on their owning node as peers join and leave. FNV-1a is used because
/// the placement must be identical on every node of the federation;
/// `DefaultHasher` is randomly seeded per process and cannot be used here.
use fnv::FnvHasher;
use std::hash::Hasher;

/// Virtual nodes per physical peer; evens out key distribution
pub const VIRTUAL_NODES: usize = 150;

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// (hash, node_id) sorted by hash
    points: Vec<(u64, String)>,
    nodes: Vec<String>,
}

impl HashRing {
    /// Build a ring from peer node ids. Order of the input does not matter;
    /// two nodes building from the same peer set produce identical rings.
    pub fn build(node_ids: &[String]) -> Self {
        let mut points = Vec::with_capacity(node_ids.len() * VIRTUAL_NODES);
        for node_id in node_ids {
            for i in 0..VIRTUAL_NODES {
                let hash = Self::hash_key(&format!("{}:{}", node_id, i));
                points.push((hash, node_id.clone()));
            }
        }
        points.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut nodes: Vec<String> = node_ids.to_vec();
        nodes.sort();
        nodes.dedup();

        Self { points, nodes }
    }

    /// FNV-1a 64 of an arbitrary key
    pub fn hash_key(key: &str) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(key.as_bytes());
        hasher.finish()
    }

    /// First node at or after the key's position, wrapping at the end
    pub fn node_for_key(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = Self::hash_key(key);
        let idx = self.points.partition_point(|(h, _)| *h < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(&self.points[idx].1)
    }

    /// Up to `count` distinct physical nodes walking forward from the key's
    /// position; the owning node comes first.
    pub fn replica_nodes(&self, key: &str, count: usize) -> Vec<String> {
        if self.points.is_empty() || count == 0 {
            return Vec::new();
        }
        let hash = Self::hash_key(key);
        let start = self.points.partition_point(|(h, _)| *h < hash);
        let mut result: Vec<String> = Vec::with_capacity(count);

        for offset in 0..self.points.len() {
            let (_, node_id) = &self.points[(start + offset) % self.points.len()];
            if !result.iter().any(|n| n == node_id) {
                result.push(node_id.clone());
                if result.len() == count {
                    break;
                }
            }
        }
        result
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n == node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::default();
        assert!(ring.is_empty());
        assert_eq!(ring.node_for_key("anything"), None);
        assert!(ring.replica_nodes("anything", 3).is_empty());
    }

    #[test]
    fn test_single_node_takes_everything() {
        let ring = HashRing::build(&ids(&["node-a"]));
        for i in 0..100 {
            assert_eq!(ring.node_for_key(&format!("key-{}", i)), Some("node-a"));
        }
    }

    #[test]
    fn test_deterministic_across_builds_and_input_order() {
        let ring1 = HashRing::build(&ids(&["node-a", "node-b", "node-c"]));
        let ring2 = HashRing::build(&ids(&["node-c", "node-a", "node-b"]));

        for i in 0..1000 {
            let key = format!("session-{}", i);
            assert_eq!(ring1.node_for_key(&key), ring2.node_for_key(&key));
        }
    }

    #[test]
    fn test_distribution_is_roughly_even() {
        let ring = HashRing::build(&ids(&["node-a", "node-b", "node-c"]));
        let mut counts = std::collections::HashMap::new();

        for i in 0..10_000 {
            let node = ring.node_for_key(&format!("key-{}", i)).unwrap().to_string();
            *counts.entry(node).or_insert(0u32) += 1;
        }

        // Each of 3 nodes should land near 1/3; 150 vnodes keeps skew small
        for (_, count) in counts {
            assert!(count > 2_300, "node underloaded: {}", count);
            assert!(count < 4_400, "node overloaded: {}", count);
        }
    }

    #[test]
    fn test_adding_node_remaps_bounded_fraction() {
        let before = HashRing::build(&ids(&["n1", "n2", "n3", "n4"]));
        let after = HashRing::build(&ids(&["n1", "n2", "n3", "n4", "n5"]));

        let total = 10_000;
        let mut moved = 0;
        for i in 0..total {
            let key = format!("key-{}", i);
            if before.node_for_key(&key) != after.node_for_key(&key) {
                moved += 1;
            }
        }

        // Going from 4 to 5 nodes should move about 1/5 of the keys
        let fraction = moved as f64 / total as f64;
        assert!(fraction < 0.30, "too many keys remapped: {}", fraction);
        assert!(fraction > 0.05, "suspiciously few keys remapped: {}", fraction);
    }

    #[test]
    fn test_replicas_are_distinct_and_led_by_owner() {
        let ring = HashRing::build(&ids(&["node-a", "node-b", "node-c"]));
        let replicas = ring.replica_nodes("session-42", 3);

        assert_eq!(replicas.len(), 3);
        assert_eq!(replicas[0], ring.node_for_key("session-42").unwrap());
        let mut unique = replicas.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_replicas_capped_by_node_count() {
        let ring = HashRing::build(&ids(&["node-a", "node-b"]));
        let replicas = ring.replica_nodes("session-42", 5);
        assert_eq!(replicas.len(), 2);
    }

    #[test]
    fn test_contains() {
        let ring = HashRing::build(&ids(&["node-a", "node-b"]));
        assert!(ring.contains("node-a"));
        assert!(!ring.contains("node-z"));
        assert_eq!(ring.node_count(), 2);
    }
}
