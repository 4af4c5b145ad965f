// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Shard level types.

use serde::{Deserialize, Serialize};

use crate::table::TableId;

pub type ShardId = u32;
pub type ShardVersion = u64;

/// Role of a shard replica on some node.
///
/// The discriminants match the wire protocol values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRole {
    Leader = 0,
    Follower = 1,
}

impl Default for ShardRole {
    fn default() -> Self {
        ShardRole::Leader
    }
}

/// Status of a shard as reported by the node hosting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Unknown,
    Ready,
    PartialOpen,
    Frozen,
}

impl Default for ShardStatus {
    fn default() -> Self {
        ShardStatus::Unknown
    }
}

/// A shard as seen by the outside: its id, role, topology version and the
/// status reported by its owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    pub role: ShardRole,
    pub version: ShardVersion,
    pub status: ShardStatus,
}

impl ShardInfo {
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.role == ShardRole::Leader
    }

    #[inline]
    pub fn is_opened(&self) -> bool {
        matches!(self.status, ShardStatus::Ready | ShardStatus::PartialOpen)
    }
}

/// Binding of one shard to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardNode {
    pub shard_id: ShardId,
    pub node: String,
    pub role: ShardRole,
}

/// The set of tables resident on a shard plus the shard version.
///
/// Every committed change of the table set bumps `version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardView {
    pub shard_id: ShardId,
    pub version: ShardVersion,
    pub table_ids: Vec<TableId>,
}

impl ShardView {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            version: 0,
            table_ids: Vec::new(),
        }
    }

    #[inline]
    pub fn contains_table(&self, table_id: TableId) -> bool {
        self.table_ids.contains(&table_id)
    }
}
