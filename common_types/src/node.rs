// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Node types.

use serde::{Deserialize, Serialize};

use crate::shard::ShardInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Online,
    Offline,
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState::Online
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Heartbeat lease in seconds.
    pub lease: u64,
    pub zone: String,
    pub node_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_name: String,
    pub node_stats: NodeStats,
    /// Unix timestamp in milliseconds of the last received heartbeat.
    pub last_touch_time: u64,
    pub state: NodeState,
}

/// A node plus the shards it reported in its last heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredNode {
    pub node: Node,
    pub shard_infos: Vec<ShardInfo>,
}

impl RegisteredNode {
    /// A node is expired when its heartbeat has been silent for longer than
    /// its lease.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.node.last_touch_time + self.node.node_stats.lease * 1000 < now_ms
    }

    pub fn is_online(&self, now_ms: u64) -> bool {
        self.node.state == NodeState::Online && !self.is_expired(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_expiry() {
        let node = RegisteredNode {
            node: Node {
                node_name: "127.0.0.1:8831".to_string(),
                node_stats: NodeStats {
                    lease: 10,
                    ..Default::default()
                },
                last_touch_time: 1_000,
                state: NodeState::Online,
            },
            shard_infos: vec![],
        };

        assert!(!node.is_expired(1_000));
        assert!(!node.is_expired(11_000));
        assert!(node.is_expired(11_001));
    }
}
