// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Outbound shard events sent to the storage nodes.

use std::sync::Arc;

use async_trait::async_trait;
use common_types::{
    shard::{ShardId, ShardInfo, ShardVersion},
    table::TableInfo,
};

use crate::Result;

pub mod dispatch_impl;

#[derive(Debug, Clone)]
pub struct OpenShardRequest {
    pub shard: ShardInfo,
}

#[derive(Debug, Clone)]
pub struct CloseShardRequest {
    pub shard_id: ShardId,
}

/// The fencing header of every table level event: the callee rejects the
/// event if its local shard version differs from `prev_version`.
#[derive(Debug, Clone)]
pub struct UpdateShardInfo {
    pub curr_shard_info: ShardInfo,
    pub prev_version: ShardVersion,
}

#[derive(Debug, Clone)]
pub struct CreateTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

#[derive(Debug, Clone)]
pub struct DropTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

#[derive(Debug, Clone)]
pub struct OpenTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

#[derive(Debug, Clone)]
pub struct CloseTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

/// Dispatch of shard events to one storage node.
///
/// The create/drop calls return the latest shard version reported by the
/// node, which the caller commits into the metadata.
#[async_trait]
pub trait EventDispatch: Send + Sync {
    async fn open_shard(&self, endpoint: &str, req: OpenShardRequest) -> Result<()>;

    async fn close_shard(&self, endpoint: &str, req: CloseShardRequest) -> Result<()>;

    async fn create_table_on_shard(
        &self,
        endpoint: &str,
        req: CreateTableOnShardRequest,
    ) -> Result<ShardVersion>;

    async fn drop_table_on_shard(
        &self,
        endpoint: &str,
        req: DropTableOnShardRequest,
    ) -> Result<ShardVersion>;

    async fn open_table_on_shard(
        &self,
        endpoint: &str,
        req: OpenTableOnShardRequest,
    ) -> Result<()>;

    async fn close_table_on_shard(
        &self,
        endpoint: &str,
        req: CloseTableOnShardRequest,
    ) -> Result<()>;
}

pub type EventDispatchRef = Arc<dyn EventDispatch>;
