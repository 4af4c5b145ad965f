// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Consistent uniform hash mapping from shards to nodes.
//!
//! The ring must be deterministic across processes (the assignment decided
//! by one leader has to be reproducible by the next), so the hash is a fixed
//! FNV-1a rather than the std randomized hasher.

use std::collections::BTreeMap;

use common_types::shard::ShardId;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Finalizer scattering the weakly avalanched FNV value over the whole ring,
/// FNV alone clusters badly on short similar strings.
fn mix64(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    hash
}

fn hash_point(input: &str) -> u64 {
    mix64(fnv1a(input.as_bytes()))
}

pub struct ConsistentHashNodePicker {
    virtual_nodes: usize,
}

impl Default for ConsistentHashNodePicker {
    fn default() -> Self {
        Self { virtual_nodes: 128 }
    }
}

impl ConsistentHashNodePicker {
    pub fn new(virtual_nodes: usize) -> Self {
        assert!(virtual_nodes > 0);
        Self { virtual_nodes }
    }

    /// Map a shard onto one of the candidate nodes; returns `None` when no
    /// candidate exists.
    pub fn pick_node(&self, candidates: &[String], shard_id: ShardId) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let mut ring = BTreeMap::new();
        for node in candidates {
            for replica in 0..self.virtual_nodes {
                let point = hash_point(&format!("{node}#{replica}"));
                ring.insert(point, node);
            }
        }

        let key = hash_point(&format!("shard-{shard_id}"));
        let node = ring
            .range(key..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, node)| (*node).clone());
        node
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn nodes(count: usize) -> Vec<String> {
        (1..=count).map(|idx| format!("127.0.0.1:883{idx}")).collect()
    }

    #[test]
    fn test_deterministic() {
        let picker = ConsistentHashNodePicker::default();
        let candidates = nodes(3);

        for shard_id in 0..32 {
            let first = picker.pick_node(&candidates, shard_id);
            let second = picker.pick_node(&candidates, shard_id);
            assert_eq!(first, second);
            assert!(first.is_some());
        }
    }

    #[test]
    fn test_every_node_is_used() {
        let picker = ConsistentHashNodePicker::default();
        let candidates = nodes(2);

        let mut by_node: HashMap<String, usize> = HashMap::new();
        for shard_id in 0..64 {
            let node = picker.pick_node(&candidates, shard_id).unwrap();
            *by_node.entry(node).or_default() += 1;
        }
        assert_eq!(by_node.len(), 2);
    }

    #[test]
    fn test_no_candidates() {
        let picker = ConsistentHashNodePicker::default();
        assert_eq!(picker.pick_node(&[], 0), None);
    }
}
