// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Cluster level types.

use serde::{Deserialize, Serialize};

use crate::shard::ShardNode;

pub type ClusterId = u32;

/// State of a cluster.
///
/// The state is driven forward by node registration (`Empty -> Prepare`) and
/// by the scheduler once shard assignment completes (`Prepare -> Stable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Empty,
    Prepare,
    Stable,
}

impl Default for ClusterState {
    fn default() -> Self {
        ClusterState::Empty
    }
}

/// How shard assignment is decided for a cluster.
///
/// In `Static` mode an external operation tool decides the placement and the
/// meta server only re-opens shards on their recorded owners. In `Dynamic`
/// mode the meta server rebalances shards across the registered nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyType {
    Static,
    Dynamic,
}

impl Default for TopologyType {
    fn default() -> Self {
        TopologyType::Static
    }
}

/// The immutable part of the cluster metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub shard_total: u32,
    pub node_count: u32,
    pub topology_type: TopologyType,
    pub procedure_executing_batch_size: u32,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
}

/// The versioned mapping from shards to nodes.
///
/// `(version, shard_nodes)` always changes atomically and `shard_nodes` is
/// kept sorted by shard id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    pub state: ClusterState,
    pub version: u64,
    pub shard_nodes: Vec<ShardNode>,
}
