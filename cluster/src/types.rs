// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Request and response types of the cluster metadata operations.

use std::collections::HashMap;

use common_types::{
    cluster::{Cluster, TopologyType},
    node::RegisteredNode,
    shard::{ShardId, ShardInfo, ShardVersion},
    table::{PartitionInfo, TableInfo},
};
use serde::{Deserialize, Serialize};

use crate::topology::Topology;

/// Options of a new cluster, the missing knobs come from the server config.
#[derive(Debug, Clone)]
pub struct CreateClusterOpts {
    pub node_count: u32,
    pub shard_total: u32,
    pub topology_type: TopologyType,
    pub procedure_executing_batch_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTableMetadataRequest {
    pub schema_name: String,
    pub table_name: String,
    pub partition_info: Option<PartitionInfo>,
}

/// Fencing token of one shard mutation: the mutation is applied only if the
/// current version equals `prev_version` and it commits at `latest_version`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShardVersionUpdate {
    pub shard_id: ShardId,
    pub prev_version: ShardVersion,
    pub latest_version: ShardVersion,
}

/// Tables resident on one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardTables {
    pub shard_info: ShardInfo,
    pub tables: Vec<TableInfo>,
}

/// One shard served by one node endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeShard {
    pub endpoint: String,
    pub shard_info: ShardInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub table_info: TableInfo,
    pub node_shards: Vec<NodeShard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTablesResult {
    pub cluster_view_version: u64,
    /// Routes keyed by table name; missing tables are absent from the map.
    pub entries: HashMap<String, RouteEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNodeShardsResult {
    pub cluster_topology_version: u64,
    pub node_shards: Vec<NodeShard>,
}

/// An immutable, consistent copy of the whole cluster state at one point in
/// time. Schedulers only ever see snapshots.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub cluster: Cluster,
    pub topology: Topology,
    pub registered_nodes: Vec<RegisteredNode>,
}
