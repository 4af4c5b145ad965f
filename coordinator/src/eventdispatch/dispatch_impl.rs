// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Grpc implementation of [`EventDispatch`] with pooled connections.

use std::collections::HashMap;

use async_trait::async_trait;
use ceresdbproto::{
    common::ResponseHeader,
    meta_event::{
        meta_event_service_client::MetaEventServiceClient, CloseShardRequest as CloseShardRequestPb,
        CloseTableOnShardRequest as CloseTableOnShardRequestPb,
        CreateTableOnShardRequest as CreateTableOnShardRequestPb,
        DropTableOnShardRequest as DropTableOnShardRequestPb,
        OpenShardRequest as OpenShardRequestPb, OpenTableOnShardRequest as OpenTableOnShardRequestPb,
        UpdateShardInfo as UpdateShardInfoPb,
    },
    meta_service::{ShardInfo as ShardInfoPb, TableInfo as TableInfoPb},
};
use common_types::{
    shard::{ShardInfo, ShardVersion},
    table::TableInfo,
};
use log::warn;
use snafu::{ensure, ResultExt};
use tokio::sync::RwLock;
use tonic::transport::Channel;

use super::{
    CloseShardRequest, CloseTableOnShardRequest, CreateTableOnShardRequest,
    DropTableOnShardRequest, EventDispatch, OpenShardRequest, OpenTableOnShardRequest,
    UpdateShardInfo,
};
use crate::{DispatchFailed, GrpcConnect, Result, RpcFailure};

fn make_shard_info_pb(shard: &ShardInfo) -> ShardInfoPb {
    ShardInfoPb {
        id: shard.id,
        role: shard.role as i32,
        version: shard.version,
        ..Default::default()
    }
}

fn make_table_info_pb(table: &TableInfo) -> TableInfoPb {
    TableInfoPb {
        id: table.id,
        name: table.name.clone(),
        schema_id: table.schema_id,
        schema_name: table.schema_name.clone(),
        ..Default::default()
    }
}

fn make_update_shard_info_pb(update: &UpdateShardInfo) -> UpdateShardInfoPb {
    UpdateShardInfoPb {
        curr_shard_info: Some(make_shard_info_pb(&update.curr_shard_info)),
        prev_version: update.prev_version,
        ..Default::default()
    }
}

fn check_response_header(endpoint: &str, header: Option<ResponseHeader>) -> Result<()> {
    let header = header.unwrap_or_default();
    ensure!(
        header.code == 0,
        DispatchFailed {
            endpoint,
            code: header.code,
            msg: header.error,
        }
    );
    Ok(())
}

/// Dispatch over a pool of lazily dialed grpc connections keyed by endpoint.
///
/// A connection whose call failed is evicted so the next call re-dials.
#[derive(Default)]
pub struct DispatchImpl {
    conns: RwLock<HashMap<String, MetaEventServiceClient<Channel>>>,
}

impl DispatchImpl {
    async fn get_client(&self, endpoint: &str) -> Result<MetaEventServiceClient<Channel>> {
        {
            let conns = self.conns.read().await;
            if let Some(client) = conns.get(endpoint) {
                return Ok(client.clone());
            }
        }

        let client = MetaEventServiceClient::connect(format!("http://{endpoint}"))
            .await
            .context(GrpcConnect { endpoint })?;
        self.conns
            .write()
            .await
            .insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    async fn evict(&self, endpoint: &str) {
        warn!("Evict broken connection, endpoint:{endpoint}");
        self.conns.write().await.remove(endpoint);
    }

    async fn on_rpc_result<T>(
        &self,
        endpoint: &str,
        result: std::result::Result<T, tonic::Status>,
    ) -> Result<T> {
        match result {
            Ok(v) => Ok(v),
            Err(status) => {
                self.evict(endpoint).await;
                Err(status).context(RpcFailure { endpoint })
            }
        }
    }
}

#[async_trait]
impl EventDispatch for DispatchImpl {
    async fn open_shard(&self, endpoint: &str, req: OpenShardRequest) -> Result<()> {
        let mut client = self.get_client(endpoint).await?;
        let req = OpenShardRequestPb {
            shard: Some(make_shard_info_pb(&req.shard)),
            ..Default::default()
        };
        let resp = self
            .on_rpc_result(endpoint, client.open_shard(req).await)
            .await?
            .into_inner();
        check_response_header(endpoint, resp.header)
    }

    async fn close_shard(&self, endpoint: &str, req: CloseShardRequest) -> Result<()> {
        let mut client = self.get_client(endpoint).await?;
        let req = CloseShardRequestPb {
            shard_id: req.shard_id,
            ..Default::default()
        };
        let resp = self
            .on_rpc_result(endpoint, client.close_shard(req).await)
            .await?
            .into_inner();
        check_response_header(endpoint, resp.header)
    }

    async fn create_table_on_shard(
        &self,
        endpoint: &str,
        req: CreateTableOnShardRequest,
    ) -> Result<ShardVersion> {
        let mut client = self.get_client(endpoint).await?;
        let req = CreateTableOnShardRequestPb {
            update_shard_info: Some(make_update_shard_info_pb(&req.update_shard_info)),
            table_info: Some(make_table_info_pb(&req.table_info)),
            ..Default::default()
        };
        let resp = self
            .on_rpc_result(endpoint, client.create_table_on_shard(req).await)
            .await?
            .into_inner();
        check_response_header(endpoint, resp.header)?;
        Ok(resp.latest_shard_version)
    }

    async fn drop_table_on_shard(
        &self,
        endpoint: &str,
        req: DropTableOnShardRequest,
    ) -> Result<ShardVersion> {
        let mut client = self.get_client(endpoint).await?;
        let req = DropTableOnShardRequestPb {
            update_shard_info: Some(make_update_shard_info_pb(&req.update_shard_info)),
            table_info: Some(make_table_info_pb(&req.table_info)),
            ..Default::default()
        };
        let resp = self
            .on_rpc_result(endpoint, client.drop_table_on_shard(req).await)
            .await?
            .into_inner();
        check_response_header(endpoint, resp.header)?;
        Ok(resp.latest_shard_version)
    }

    async fn open_table_on_shard(
        &self,
        endpoint: &str,
        req: OpenTableOnShardRequest,
    ) -> Result<()> {
        let mut client = self.get_client(endpoint).await?;
        let req = OpenTableOnShardRequestPb {
            update_shard_info: Some(make_update_shard_info_pb(&req.update_shard_info)),
            table_info: Some(make_table_info_pb(&req.table_info)),
            ..Default::default()
        };
        let resp = self
            .on_rpc_result(endpoint, client.open_table_on_shard(req).await)
            .await?
            .into_inner();
        check_response_header(endpoint, resp.header)
    }

    async fn close_table_on_shard(
        &self,
        endpoint: &str,
        req: CloseTableOnShardRequest,
    ) -> Result<()> {
        let mut client = self.get_client(endpoint).await?;
        let req = CloseTableOnShardRequestPb {
            update_shard_info: Some(make_update_shard_info_pb(&req.update_shard_info)),
            table_info: Some(make_table_info_pb(&req.table_info)),
            ..Default::default()
        };
        let resp = self
            .on_rpc_result(endpoint, client.close_table_on_shard(req).await)
            .await?
            .into_inner();
        check_response_header(endpoint, resp.header)
    }
}
