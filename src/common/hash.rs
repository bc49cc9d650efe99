//! Hashing utilities for chronodb
//!
//! - HRW (Highest Random Weight) for deterministic shard owner placement
//! - BLAKE3 as the weight function

/// Weight of `node` for `key`
fn hrw_weight(key: &str, node: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&[0]);
    hasher.update(node.as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// HRW (Highest Random Weight) hashing for replica placement
///
/// Given a key and a set of nodes, returns nodes sorted by their weight
/// (deterministic based on key). This ensures consistent placement even
/// as the cluster changes. Ties are broken by node name so every caller
/// agrees on the order.
pub fn hrw_hash(key: &str, nodes: &[String]) -> Vec<String> {
    let mut weights: Vec<(String, u64)> = nodes
        .iter()
        .map(|node| (node.clone(), hrw_weight(key, node)))
        .collect();

    weights.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    weights.into_iter().map(|(node, _)| node).collect()
}

/// Select N replicas using HRW hashing
pub fn select_replicas(key: &str, nodes: &[String], n: usize) -> Vec<String> {
    let sorted = hrw_hash(key, nodes);
    sorted.into_iter().take(n).collect()
}
