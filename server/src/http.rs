// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Http service
//!
//! The admin API lives under `/api/v1`; endpoints beginning with /debug are
//! for internal use and may be subject to breaking changes. Mutating
//! endpoints are transparently forwarded to the leader.

use std::{collections::HashMap, convert::Infallible, net::IpAddr, sync::Arc, time::Duration};

use cluster::types::CreateClusterOpts;
use common_types::{
    cluster::{ClusterState, TopologyType},
    shard::{ShardId, ShardNode, ShardStatus},
    table::{PartitionInfo, Table},
};
use common_util::runtime_level::RuntimeLevel;
use coordinator::{factory::CreateTableRequest, scheduler::ShardAffinityRule};
use log::{error, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use tokio::sync::oneshot::{self, Receiver, Sender};
use warp::{
    http::{HeaderMap, StatusCode},
    hyper::body::Bytes,
    reject,
    reply::{self, Reply},
    Filter,
};

use crate::{
    error_util, metrics,
    server::ServerInnerRef,
    AlreadyStarted, CoordinatorFailure, Error, EtcdFailure, EtcdUnavailable,
    FlowLimitExceeded, InvalidRequestBody, LeaderNotFound, ParseIpAddr, ProfileCpu, Result,
    WaitResult,
};

/// Http service config
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub addr: String,
    pub port: u16,
    pub max_body_size: u64,
}

pub struct Service {
    ctx: ServerInnerRef,
    log_runtime: Arc<RuntimeLevel>,
    config: HttpConfig,
    config_content: String,
    tx: Sender<()>,
    rx: Option<Receiver<()>>,
}

impl Service {
    pub fn new(
        config: HttpConfig,
        ctx: ServerInnerRef,
        log_runtime: Arc<RuntimeLevel>,
        config_content: String,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            ctx,
            log_runtime,
            config,
            config_content,
            tx,
            rx: Some(rx),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        let ip_addr: IpAddr = self.config.addr.parse().with_context(|| ParseIpAddr {
            ip: self.config.addr.to_string(),
        })?;
        let rx = self.rx.take().context(AlreadyStarted)?;

        info!(
            "HTTP server tries to listen on {}:{}",
            &self.config.addr, self.config.port
        );

        // Register filters to warp and rejection handler
        let routes = self.routes().recover(handle_rejection);
        let (_addr, server) =
            warp::serve(routes).bind_with_graceful_shutdown((ip_addr, self.config.port), async {
                rx.await.ok();
            });
        tokio::spawn(server);

        Ok(())
    }

    pub fn stop(self) {
        if let Err(e) = self.tx.send(()) {
            error!("Failed to send http service stop message, err:{:?}", e);
        }
    }
}

// Request and response bodies.

#[derive(Debug, Deserialize)]
struct GetShardTablesRequest {
    cluster_name: String,
    shard_ids: Vec<ShardId>,
}

#[derive(Debug, Deserialize)]
struct TransferLeaderRequest {
    cluster_name: String,
    shard_id: ShardId,
    old_leader: Option<String>,
    new_leader: String,
}

#[derive(Debug, Deserialize)]
struct SplitRequest {
    cluster_name: String,
    schema_name: String,
    shard_id: ShardId,
    split_tables: Vec<String>,
    target_node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    cluster_name: String,
    schema_name: String,
    table_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateTableBody {
    cluster_name: String,
    schema_name: String,
    table_name: String,
    partition_info: Option<PartitionInfo>,
}

#[derive(Debug, Deserialize)]
struct DropTableBody {
    cluster_name: String,
    schema_name: String,
    table_name: String,
}

#[derive(Debug, Deserialize)]
struct GetNodeShardsRequest {
    cluster_name: String,
}

#[derive(Debug, Deserialize)]
struct DropNodeShardsRequest {
    cluster_name: String,
    shard_nodes: Vec<ShardNode>,
}

#[derive(Debug, Deserialize)]
struct CreateClusterRequest {
    name: String,
    node_count: Option<u32>,
    shard_total: Option<u32>,
    topology_type: Option<TopologyType>,
}

#[derive(Debug, Deserialize)]
struct UpdateClusterRequest {
    node_count: u32,
    topology_type: TopologyType,
}

#[derive(Debug, Deserialize)]
struct RemoveAffinityRequest {
    shard_id: ShardId,
}

#[derive(Debug, Deserialize)]
struct EnableScheduleRequest {
    enable: bool,
}

#[derive(Debug, Deserialize)]
struct EtcdMemberAddRequest {
    peer_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EtcdMemberUpdateRequest {
    id: u64,
    peer_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EtcdMemberIdRequest {
    id: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

impl StatusResponse {
    fn ok() -> Self {
        Self { status: "ok" }
    }
}

#[derive(Debug, Serialize)]
struct ClusterInfo {
    id: u32,
    name: String,
    shard_total: u32,
    node_count: u32,
    topology_type: TopologyType,
    state: ClusterState,
    topology_version: u64,
}

#[derive(Debug, Serialize)]
struct CreateTableResponse {
    table: Table,
    shard: common_types::shard::ShardInfo,
}

#[derive(Debug, Serialize)]
struct LeaderResponse {
    leader_addr: String,
}

#[derive(Debug, Serialize)]
struct DiagnoseShardEntry {
    node: String,
    version: u64,
    status: ShardStatus,
}

#[derive(Debug, Serialize)]
struct DiagnoseShardsResponse {
    unassigned_shards: Vec<ShardId>,
    shards: HashMap<ShardId, DiagnoseShardEntry>,
}

#[derive(Debug, Serialize)]
struct EtcdMemberInfo {
    id: u64,
    name: String,
    peer_urls: Vec<String>,
    client_urls: Vec<String>,
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).context(InvalidRequestBody)
}

/// Run a handler of an endpoint that must execute on the leader: a follower
/// forwards the whole request and returns the leader's response untouched.
/// `limited` endpoints consume one flow limiter token before anything else.
async fn proxied<T, F, Fut>(
    ctx: ServerInnerRef,
    limited: bool,
    method: &'static str,
    path: String,
    headers: HeaderMap,
    body: Bytes,
    handler: F,
) -> std::result::Result<warp::reply::Response, warp::Rejection>
where
    T: Serialize,
    F: FnOnce(ServerInnerRef, Bytes) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let result = proxied_inner(ctx, limited, method, path, headers, body, handler).await;
    result.map_err(reject::custom)
}

async fn proxied_inner<T, F, Fut>(
    ctx: ServerInnerRef,
    limited: bool,
    method: &'static str,
    path: String,
    headers: HeaderMap,
    body: Bytes,
    handler: F,
) -> Result<warp::reply::Response>
where
    T: Serialize,
    F: FnOnce(ServerInnerRef, Bytes) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    if limited && !ctx.limiter.try_acquire() {
        return FlowLimitExceeded.fail();
    }

    if !ctx.member.is_leader() {
        let leader_addr = ctx.member.leader_addr().context(LeaderNotFound)?;
        return ctx
            .forwarder
            .forward(&leader_addr, method, &path, &headers, body)
            .await;
    }

    let value = handler(ctx, body).await?;
    Ok(reply::json(&value).into_response())
}

impl Service {
    fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        self.health()
            .or(self.leader())
            .or(self.list_clusters())
            .or(self.create_cluster())
            .or(self.update_cluster())
            .or(self.get_shard_tables())
            .or(self.transfer_leader())
            .or(self.split())
            .or(self.route())
            .or(self.create_table())
            .or(self.drop_table())
            .or(self.get_node_shards())
            .or(self.drop_node_shards())
            .or(self.get_flow_limiter())
            .or(self.update_flow_limiter())
            .or(self.list_procedures())
            .or(self.list_shard_affinities())
            .or(self.add_shard_affinities())
            .or(self.remove_shard_affinity())
            .or(self.get_enable_schedule())
            .or(self.update_enable_schedule())
            .or(self.diagnose_shards())
            .or(self.etcd_member_api())
            .or(self.metrics())
            .or(self.server_config())
            .or(self.update_log_level())
            .or(self.profile_cpu())
            .with(warp::log::custom(|info| {
                let path = info.path();
                // Don't record /debug API
                if path.starts_with("/debug") {
                    return;
                }

                metrics::HTTP_HANDLER_DURATION_HISTOGRAM_VEC
                    .with_label_values(&[path, info.status().as_str()])
                    .observe(info.elapsed().as_secs_f64())
            }))
    }

    fn with_ctx(&self) -> impl Filter<Extract = (ServerInnerRef,), Error = Infallible> + Clone {
        let ctx = self.ctx.clone();
        warp::any().map(move || ctx.clone())
    }

    fn body_limit(&self) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
        warp::body::content_length_limit(self.config.max_body_size)
    }

    // GET /api/v1/health
    fn health(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "health")
            .and(warp::get())
            .map(|| reply::json(&StatusResponse::ok()))
    }

    // GET /api/v1/leader
    fn leader(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "leader")
            .and(warp::get())
            .and(self.with_ctx())
            .and_then(|ctx: ServerInnerRef| async move {
                let result = ctx
                    .member
                    .leader_addr()
                    .context(LeaderNotFound)
                    .map(|leader_addr| reply::json(&LeaderResponse { leader_addr }));
                result.map_err(reject::custom)
            })
    }

    // GET /api/v1/clusters
    fn list_clusters(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "clusters")
            .and(warp::get())
            .and(self.with_ctx())
            .and_then(|ctx: ServerInnerRef| async move {
                let mut clusters = Vec::new();
                for metadata in ctx.cluster_manager.list_clusters().await {
                    let cluster = metadata.cluster().await;
                    let snapshot = metadata.snapshot().await;
                    clusters.push(ClusterInfo {
                        id: cluster.id,
                        name: cluster.name,
                        shard_total: cluster.shard_total,
                        node_count: cluster.node_count,
                        topology_type: cluster.topology_type,
                        state: snapshot.topology.cluster_view.state,
                        topology_version: snapshot.topology.cluster_view.version,
                    });
                }
                Ok::<_, warp::Rejection>(reply::json(&clusters))
            })
    }

    // POST /api/v1/clusters
    fn create_cluster(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "clusters")
            .and(warp::post())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|ctx: ServerInnerRef, headers, body| async move {
                proxied(
                    ctx,
                    false,
                    "POST",
                    "/api/v1/clusters".to_string(),
                    headers,
                    body,
                    |ctx, body| async move {
                        let req: CreateClusterRequest = parse_body(&body)?;
                        let opts = CreateClusterOpts {
                            node_count: req
                                .node_count
                                .unwrap_or(ctx.config.default_cluster_node_count),
                            shard_total: req
                                .shard_total
                                .unwrap_or(ctx.config.default_cluster_shard_total),
                            topology_type: req.topology_type.unwrap_or(ctx.config.topology_type),
                            procedure_executing_batch_size: ctx
                                .config
                                .procedure_executing_batch_size,
                        };
                        let metadata = ctx.create_cluster(&req.name, opts).await?;
                        let cluster = metadata.cluster().await;
                        Ok(ClusterInfo {
                            id: cluster.id,
                            name: cluster.name,
                            shard_total: cluster.shard_total,
                            node_count: cluster.node_count,
                            topology_type: cluster.topology_type,
                            state: ClusterState::Empty,
                            topology_version: 0,
                        })
                    },
                )
                .await
            })
    }

    // PUT /api/v1/clusters/:name
    fn update_cluster(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "clusters" / String)
            .and(warp::put())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|name: String, ctx: ServerInnerRef, headers, body| async move {
                let path = format!("/api/v1/clusters/{name}");
                proxied(ctx, false, "PUT", path, headers, body, |ctx, body| async move {
                    let req: UpdateClusterRequest = parse_body(&body)?;
                    let metadata = ctx
                        .cluster_manager
                        .get_cluster(&name)
                        .await
                        .context(crate::ClusterFailure)?;
                    metadata
                        .update_cluster(req.node_count, req.topology_type)
                        .await
                        .context(crate::ClusterFailure)?;
                    // The scheduler set depends on the topology type.
                    ctx.rebuild_coordinator(&name).await?;
                    Ok(StatusResponse::ok())
                })
                .await
            })
    }

    // POST /api/v1/getShardTables
    fn get_shard_tables(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "getShardTables")
            .and(warp::post())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::body::json())
            .and_then(|ctx: ServerInnerRef, req: GetShardTablesRequest| async move {
                let result = async move {
                    let metadata = ctx
                        .cluster_manager
                        .get_cluster(&req.cluster_name)
                        .await
                        .context(crate::ClusterFailure)?;
                    Ok::<_, Error>(metadata.get_shard_tables(&req.shard_ids).await)
                }
                .await;
                match result {
                    Ok(tables) => Ok(reply::json(&tables)),
                    Err(e) => Err(reject::custom(e)),
                }
            })
    }

    // POST /api/v1/transferLeader
    fn transfer_leader(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "transferLeader")
            .and(warp::post())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|ctx: ServerInnerRef, headers, body| async move {
                proxied(
                    ctx,
                    false,
                    "POST",
                    "/api/v1/transferLeader".to_string(),
                    headers,
                    body,
                    |ctx, body| async move {
                        let req: TransferLeaderRequest = parse_body(&body)?;
                        let coordinator = ctx.coordinator(&req.cluster_name).await?;
                        metrics::PROCEDURE_SUBMIT_COUNTER_VEC
                            .with_label_values(&["transfer_leader"])
                            .inc();
                        let (procedure, rx) = coordinator
                            .factory
                            .transfer_leader_procedure(
                                req.shard_id,
                                req.new_leader,
                                req.old_leader,
                            )
                            .await
                            .context(CoordinatorFailure)?;
                        coordinator
                            .procedure_manager
                            .submit(procedure)
                            .await
                            .context(CoordinatorFailure)?;
                        rx.await
                            .ok()
                            .context(WaitResult)?
                            .context(CoordinatorFailure)?;
                        Ok(StatusResponse::ok())
                    },
                )
                .await
            })
    }

    // POST /api/v1/split
    fn split(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "split")
            .and(warp::post())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|ctx: ServerInnerRef, headers, body| async move {
                proxied(
                    ctx,
                    false,
                    "POST",
                    "/api/v1/split".to_string(),
                    headers,
                    body,
                    |ctx, body| async move {
                        let req: SplitRequest = parse_body(&body)?;
                        let coordinator = ctx.coordinator(&req.cluster_name).await?;
                        metrics::PROCEDURE_SUBMIT_COUNTER_VEC
                            .with_label_values(&["split"])
                            .inc();

                        let target_node = match req.target_node {
                            Some(node) => node,
                            None => {
                                let snapshot = coordinator.metadata.snapshot().await;
                                snapshot
                                    .topology
                                    .shard_node(req.shard_id)
                                    .map(|binding| binding.node.clone())
                                    .with_context(|| crate::InvalidArguments {
                                        msg: format!(
                                            "shard is unassigned and no target node is given, shard_id:{}",
                                            req.shard_id
                                        ),
                                    })?
                            }
                        };

                        let (procedure, rx) = coordinator
                            .factory
                            .split_procedure(
                                req.schema_name,
                                req.shard_id,
                                req.split_tables,
                                target_node,
                            )
                            .await
                            .context(CoordinatorFailure)?;
                        coordinator
                            .procedure_manager
                            .submit(procedure)
                            .await
                            .context(CoordinatorFailure)?;
                        rx.await
                            .ok()
                            .context(WaitResult)?
                            .context(CoordinatorFailure)?;
                        Ok(StatusResponse::ok())
                    },
                )
                .await
            })
    }

    // POST /api/v1/route
    fn route(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "route")
            .and(warp::post())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|ctx: ServerInnerRef, headers, body| async move {
                proxied(
                    ctx,
                    true,
                    "POST",
                    "/api/v1/route".to_string(),
                    headers,
                    body,
                    |ctx, body| async move {
                        let req: RouteRequest = parse_body(&body)?;
                        let metadata = ctx
                            .cluster_manager
                            .get_cluster(&req.cluster_name)
                            .await
                            .context(crate::ClusterFailure)?;
                        metadata
                            .route_tables(&req.schema_name, &req.table_names)
                            .await
                            .context(crate::ClusterFailure)
                    },
                )
                .await
            })
    }

    // POST /api/v1/table
    fn create_table(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "table")
            .and(warp::post())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|ctx: ServerInnerRef, headers, body| async move {
                proxied(
                    ctx,
                    true,
                    "POST",
                    "/api/v1/table".to_string(),
                    headers,
                    body,
                    |ctx, body| async move {
                        let req: CreateTableBody = parse_body(&body)?;
                        let coordinator = ctx.coordinator(&req.cluster_name).await?;
                        metrics::PROCEDURE_SUBMIT_COUNTER_VEC
                            .with_label_values(&["create_table"])
                            .inc();
                        let (procedure, rx) = coordinator
                            .factory
                            .create_table_procedure(CreateTableRequest {
                                schema_name: req.schema_name,
                                table_name: req.table_name,
                                partition_info: req.partition_info,
                            })
                            .await
                            .context(CoordinatorFailure)?;
                        coordinator
                            .procedure_manager
                            .submit(procedure)
                            .await
                            .context(CoordinatorFailure)?;
                        let result = rx
                            .await
                            .ok()
                            .context(WaitResult)?
                            .context(CoordinatorFailure)?;
                        Ok(CreateTableResponse {
                            table: result.table,
                            shard: result.shard_info,
                        })
                    },
                )
                .await
            })
    }

    // DELETE /api/v1/table
    fn drop_table(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "table")
            .and(warp::delete())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|ctx: ServerInnerRef, headers, body| async move {
                proxied(
                    ctx,
                    true,
                    "DELETE",
                    "/api/v1/table".to_string(),
                    headers,
                    body,
                    |ctx, body| async move {
                        let req: DropTableBody = parse_body(&body)?;
                        let coordinator = ctx.coordinator(&req.cluster_name).await?;
                        metrics::PROCEDURE_SUBMIT_COUNTER_VEC
                            .with_label_values(&["drop_table"])
                            .inc();
                        let procedure = coordinator
                            .factory
                            .drop_table_procedure(&req.schema_name, &req.table_name)
                            .await
                            .context(CoordinatorFailure)?;
                        // Dropping a table that does not exist is a no-op.
                        if let Some((procedure, rx)) = procedure {
                            coordinator
                                .procedure_manager
                                .submit(procedure)
                                .await
                                .context(CoordinatorFailure)?;
                            rx.await
                                .ok()
                                .context(WaitResult)?
                                .context(CoordinatorFailure)?;
                        }
                        Ok(StatusResponse::ok())
                    },
                )
                .await
            })
    }

    // POST /api/v1/getNodeShards
    fn get_node_shards(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "getNodeShards")
            .and(warp::post())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::body::json())
            .and_then(|ctx: ServerInnerRef, req: GetNodeShardsRequest| async move {
                let result = async move {
                    let metadata = ctx
                        .cluster_manager
                        .get_cluster(&req.cluster_name)
                        .await
                        .context(crate::ClusterFailure)?;
                    Ok::<_, Error>(metadata.get_node_shards().await)
                }
                .await;
                match result {
                    Ok(node_shards) => Ok(reply::json(&node_shards)),
                    Err(e) => Err(reject::custom(e)),
                }
            })
    }

    // DELETE /api/v1/nodeShards
    fn drop_node_shards(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "nodeShards")
            .and(warp::delete())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|ctx: ServerInnerRef, headers, body| async move {
                proxied(
                    ctx,
                    false,
                    "DELETE",
                    "/api/v1/nodeShards".to_string(),
                    headers,
                    body,
                    |ctx, body| async move {
                        let req: DropNodeShardsRequest = parse_body(&body)?;
                        let metadata = ctx
                            .cluster_manager
                            .get_cluster(&req.cluster_name)
                            .await
                            .context(crate::ClusterFailure)?;
                        metadata
                            .drop_shard_nodes(req.shard_nodes)
                            .await
                            .context(crate::ClusterFailure)?;
                        Ok(StatusResponse::ok())
                    },
                )
                .await
            })
    }

    // GET /api/v1/flowLimiter
    fn get_flow_limiter(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "flowLimiter")
            .and(warp::get())
            .and(self.with_ctx())
            .map(|ctx: ServerInnerRef| reply::json(&ctx.limiter.view()))
    }

    // PUT /api/v1/flowLimiter
    fn update_flow_limiter(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "flowLimiter")
            .and(warp::put())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::body::json())
            .map(
                |ctx: ServerInnerRef, view: crate::limiter::FlowLimiterView| {
                    info!("Update flow limiter, view:{view:?}");
                    ctx.limiter.update(view);
                    reply::json(&StatusResponse::ok())
                },
            )
    }

    // GET /api/v1/clusters/:name/procedure
    fn list_procedures(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "clusters" / String / "procedure")
            .and(warp::get())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and_then(|name: String, ctx: ServerInnerRef, headers| async move {
                let path = format!("/api/v1/clusters/{name}/procedure");
                proxied(ctx, false, "GET", path, headers, Bytes::new(), |ctx, _| async move {
                    let coordinator = ctx.coordinator(&name).await?;
                    coordinator
                        .procedure_manager
                        .stored_procedures()
                        .await
                        .context(CoordinatorFailure)
                })
                .await
            })
    }

    // GET /api/v1/clusters/:name/shardAffinities
    fn list_shard_affinities(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "clusters" / String / "shardAffinities")
            .and(warp::get())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and_then(|name: String, ctx: ServerInnerRef, headers| async move {
                let path = format!("/api/v1/clusters/{name}/shardAffinities");
                proxied(ctx, false, "GET", path, headers, Bytes::new(), |ctx, _| async move {
                    let coordinator = ctx.coordinator(&name).await?;
                    coordinator
                        .scheduler_manager
                        .list_shard_affinity_rules()
                        .context(CoordinatorFailure)
                })
                .await
            })
    }

    // POST /api/v1/clusters/:name/shardAffinities
    fn add_shard_affinities(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "clusters" / String / "shardAffinities")
            .and(warp::post())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|name: String, ctx: ServerInnerRef, headers, body| async move {
                let path = format!("/api/v1/clusters/{name}/shardAffinities");
                proxied(ctx, false, "POST", path, headers, body, |ctx, body| async move {
                    let rules: Vec<ShardAffinityRule> = parse_body(&body)?;
                    let coordinator = ctx.coordinator(&name).await?;
                    for rule in rules {
                        coordinator
                            .scheduler_manager
                            .add_shard_affinity_rule(rule)
                            .await
                            .context(CoordinatorFailure)?;
                    }
                    Ok(StatusResponse::ok())
                })
                .await
            })
    }

    // DELETE /api/v1/clusters/:name/shardAffinities
    fn remove_shard_affinity(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "clusters" / String / "shardAffinities")
            .and(warp::delete())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|name: String, ctx: ServerInnerRef, headers, body| async move {
                let path = format!("/api/v1/clusters/{name}/shardAffinities");
                proxied(ctx, false, "DELETE", path, headers, body, |ctx, body| async move {
                    let req: RemoveAffinityRequest = parse_body(&body)?;
                    let coordinator = ctx.coordinator(&name).await?;
                    coordinator
                        .scheduler_manager
                        .remove_shard_affinity_rule(req.shard_id)
                        .await
                        .context(CoordinatorFailure)?;
                    Ok(StatusResponse::ok())
                })
                .await
            })
    }

    // GET /api/v1/clusters/:name/enableSchedule
    fn get_enable_schedule(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "clusters" / String / "enableSchedule")
            .and(warp::get())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and_then(|name: String, ctx: ServerInnerRef, headers| async move {
                let path = format!("/api/v1/clusters/{name}/enableSchedule");
                proxied(ctx, false, "GET", path, headers, Bytes::new(), |ctx, _| async move {
                    let coordinator = ctx.coordinator(&name).await?;
                    let enable = coordinator
                        .scheduler_manager
                        .enable_schedule()
                        .context(CoordinatorFailure)?;
                    Ok(serde_json::json!({ "enable": enable }))
                })
                .await
            })
    }

    // PUT /api/v1/clusters/:name/enableSchedule
    fn update_enable_schedule(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "clusters" / String / "enableSchedule")
            .and(warp::put())
            .and(self.body_limit())
            .and(self.with_ctx())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(|name: String, ctx: ServerInnerRef, headers, body| async move {
                let path = format!("/api/v1/clusters/{name}/enableSchedule");
                proxied(ctx, false, "PUT", path, headers, body, |ctx, body| async move {
                    let req: EnableScheduleRequest = parse_body(&body)?;
                    let coordinator = ctx.coordinator(&name).await?;
                    let prev = coordinator
                        .scheduler_manager
                        .update_enable_schedule(req.enable)
                        .context(CoordinatorFailure)?;
                    Ok(serde_json::json!({ "enable": req.enable, "prev": prev }))
                })
                .await
            })
    }

    // GET /api/v1/diagnose/:name/shards
    fn diagnose_shards(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("api" / "v1" / "diagnose" / String / "shards")
            .and(warp::get())
            .and(self.with_ctx())
            .and_then(|name: String, ctx: ServerInnerRef| async move {
                let result = async move {
                    let metadata = ctx
                        .cluster_manager
                        .get_cluster(&name)
                        .await
                        .context(crate::ClusterFailure)?;
                    let snapshot = metadata.snapshot().await;

                    let unassigned_shards = snapshot
                        .topology
                        .unassigned_shard_ids(snapshot.cluster.shard_total);
                    let mut shards = HashMap::new();
                    for binding in &snapshot.topology.cluster_view.shard_nodes {
                        let version = snapshot
                            .topology
                            .shard_view(binding.shard_id)
                            .map(|view| view.version)
                            .unwrap_or_default();
                        let status = snapshot
                            .registered_nodes
                            .iter()
                            .find(|node| node.node.node_name == binding.node)
                            .and_then(|node| {
                                node.shard_infos
                                    .iter()
                                    .find(|info| info.id == binding.shard_id)
                                    .map(|info| info.status)
                            })
                            .unwrap_or(ShardStatus::Unknown);
                        shards.insert(
                            binding.shard_id,
                            DiagnoseShardEntry {
                                node: binding.node.clone(),
                                version,
                                status,
                            },
                        );
                    }
                    Ok::<_, Error>(DiagnoseShardsResponse {
                        unassigned_shards,
                        shards,
                    })
                }
                .await;
                match result {
                    Ok(resp) => Ok(reply::json(&resp)),
                    Err(e) => Err(reject::custom(e)),
                }
            })
    }

    // GET/POST/PUT/DELETE /api/v1/etcd/member plus learner promotion and
    // leader movement.
    fn etcd_member_api(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let list = warp::path!("api" / "v1" / "etcd" / "member")
            .and(warp::get())
            .and(self.with_ctx())
            .and_then(|ctx: ServerInnerRef| async move {
                let result = async move {
                    let mut etcd = ctx.etcd.clone().context(EtcdUnavailable)?;
                    let resp = etcd
                        .member_list()
                        .await
                        .context(EtcdFailure { msg: "member list" })?;
                    let members: Vec<_> = resp
                        .members()
                        .iter()
                        .map(|member| EtcdMemberInfo {
                            id: member.id(),
                            name: member.name().to_string(),
                            peer_urls: member.peer_urls().to_vec(),
                            client_urls: member.client_urls().to_vec(),
                        })
                        .collect();
                    Ok::<_, Error>(members)
                }
                .await;
                match result {
                    Ok(members) => Ok(reply::json(&members)),
                    Err(e) => Err(reject::custom(e)),
                }
            });

        let add = warp::path!("api" / "v1" / "etcd" / "member")
            .and(warp::post())
            .and(self.with_ctx())
            .and(warp::body::json())
            .and_then(|ctx: ServerInnerRef, req: EtcdMemberAddRequest| async move {
                let result = async move {
                    let mut etcd = ctx.etcd.clone().context(EtcdUnavailable)?;
                    etcd.member_add(req.peer_urls, None)
                        .await
                        .context(EtcdFailure { msg: "member add" })?;
                    Ok::<_, Error>(StatusResponse::ok())
                }
                .await;
                match result {
                    Ok(resp) => Ok(reply::json(&resp)),
                    Err(e) => Err(reject::custom(e)),
                }
            });

        let update = warp::path!("api" / "v1" / "etcd" / "member")
            .and(warp::put())
            .and(self.with_ctx())
            .and(warp::body::json())
            .and_then(|ctx: ServerInnerRef, req: EtcdMemberUpdateRequest| async move {
                let result = async move {
                    let mut etcd = ctx.etcd.clone().context(EtcdUnavailable)?;
                    etcd.member_update(req.id, req.peer_urls)
                        .await
                        .context(EtcdFailure { msg: "member update" })?;
                    Ok::<_, Error>(StatusResponse::ok())
                }
                .await;
                match result {
                    Ok(resp) => Ok(reply::json(&resp)),
                    Err(e) => Err(reject::custom(e)),
                }
            });

        let remove = warp::path!("api" / "v1" / "etcd" / "member")
            .and(warp::delete())
            .and(self.with_ctx())
            .and(warp::body::json())
            .and_then(|ctx: ServerInnerRef, req: EtcdMemberIdRequest| async move {
                let result = async move {
                    let mut etcd = ctx.etcd.clone().context(EtcdUnavailable)?;
                    etcd.member_remove(req.id)
                        .await
                        .context(EtcdFailure { msg: "member remove" })?;
                    Ok::<_, Error>(StatusResponse::ok())
                }
                .await;
                match result {
                    Ok(resp) => Ok(reply::json(&resp)),
                    Err(e) => Err(reject::custom(e)),
                }
            });

        let promote = warp::path!("api" / "v1" / "etcd" / "promoteLearner")
            .and(warp::post())
            .and(self.with_ctx())
            .and(warp::body::json())
            .and_then(|ctx: ServerInnerRef, req: EtcdMemberIdRequest| async move {
                let result = async move {
                    let mut etcd = ctx.etcd.clone().context(EtcdUnavailable)?;
                    etcd.member_promote(req.id)
                        .await
                        .context(EtcdFailure { msg: "member promote" })?;
                    Ok::<_, Error>(StatusResponse::ok())
                }
                .await;
                match result {
                    Ok(resp) => Ok(reply::json(&resp)),
                    Err(e) => Err(reject::custom(e)),
                }
            });

        let move_leader = warp::path!("api" / "v1" / "etcd" / "moveLeader")
            .and(warp::post())
            .and(self.with_ctx())
            .and(warp::body::json())
            .and_then(|ctx: ServerInnerRef, req: EtcdMemberIdRequest| async move {
                let result = async move {
                    let mut etcd = ctx.etcd.clone().context(EtcdUnavailable)?;
                    etcd.move_leader(req.id)
                        .await
                        .context(EtcdFailure { msg: "move leader" })?;
                    Ok::<_, Error>(StatusResponse::ok())
                }
                .await;
                match result {
                    Ok(resp) => Ok(reply::json(&resp)),
                    Err(e) => Err(reject::custom(e)),
                }
            });

        list.or(add).or(update).or(remove).or(promote).or(move_leader)
    }

    // GET /metrics
    fn metrics(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("metrics").and(warp::get()).map(metrics::dump)
    }

    // GET /debug/config
    fn server_config(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let server_config_content = self.config_content.clone();
        warp::path!("debug" / "config")
            .and(warp::get())
            .map(move || server_config_content.clone())
    }

    // PUT /debug/log_level/{level}
    fn update_log_level(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let log_runtime = self.log_runtime.clone();
        warp::path!("debug" / "log_level" / String)
            .and(warp::put())
            .and(warp::any().map(move || log_runtime.clone()))
            .and_then(
                |log_level: String, log_runtime: Arc<RuntimeLevel>| async move {
                    let result = log_runtime
                        .set_level_by_str(log_level.as_str())
                        .map_err(|e| Error::HandleUpdateLogLevel { msg: e });
                    match result {
                        Ok(()) => Ok(reply::json(&log_level)),
                        Err(e) => Err(reject::custom(e)),
                    }
                },
            )
    }

    // GET /debug/profile/cpu/{seconds}
    fn profile_cpu(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path!("debug" / "profile" / "cpu" / u64)
            .and(warp::get())
            .and_then(|seconds: u64| async move {
                // Sampling blocks the thread for the whole duration.
                let handle = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                    let guard = pprof::ProfilerGuard::new(100).context(ProfileCpu)?;
                    std::thread::sleep(Duration::from_secs(seconds.min(60)));
                    let report = guard.report().build().context(ProfileCpu)?;

                    let mut graph = Vec::new();
                    report.flamegraph(&mut graph).context(ProfileCpu)?;
                    Ok(graph)
                });
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::JoinAsyncTask { msg: e.to_string() }),
                };
                match result {
                    Ok(graph) => {
                        let mut response = warp::reply::Response::new(graph.into());
                        response.headers_mut().insert(
                            "content-type",
                            warp::http::HeaderValue::from_static("image/svg+xml"),
                        );
                        Ok(response)
                    }
                    Err(e) => Err(reject::custom(e)),
                }
            })
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: u16,
    message: String,
}

fn cluster_error_status(err: &cluster::Error) -> StatusCode {
    match err {
        cluster::Error::InvalidArguments { .. } => StatusCode::BAD_REQUEST,
        cluster::Error::ClusterNotFound { .. }
        | cluster::Error::SchemaNotFound { .. }
        | cluster::Error::TableNotFound { .. }
        | cluster::Error::ShardNotFound { .. } => StatusCode::NOT_FOUND,
        cluster::Error::ClusterAlreadyExists { .. }
        | cluster::Error::TableAlreadyExists { .. }
        | cluster::Error::ShardVersionMismatch { .. } => StatusCode::CONFLICT,
        cluster::Error::InvalidClusterState { .. } => StatusCode::PRECONDITION_FAILED,
        cluster::Error::MetaStorageFailure { .. } | cluster::Error::AllocId { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn coordinator_error_status(err: &coordinator::Error) -> StatusCode {
    match err {
        coordinator::Error::ClusterFailure { source } => cluster_error_status(source),
        coordinator::Error::GrpcConnect { .. }
        | coordinator::Error::RpcFailure { .. }
        | coordinator::Error::DispatchFailed { .. }
        | coordinator::Error::StorageFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
        coordinator::Error::TableAlreadyExists { .. }
        | coordinator::Error::ProcedureConflict { .. } => StatusCode::CONFLICT,
        coordinator::Error::TableNotFound { .. } | coordinator::Error::ShardNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        coordinator::Error::NodeNumberNotEnough { .. }
        | coordinator::Error::InvalidClusterState { .. } => StatusCode::PRECONDITION_FAILED,
        coordinator::Error::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
        coordinator::Error::EncodeProcedure { .. }
        | coordinator::Error::DecodeProcedure { .. }
        | coordinator::Error::AllocProcedureId { .. }
        | coordinator::Error::ProcedureFailed { .. }
        | coordinator::Error::Cancelled { .. }
        | coordinator::Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_to_status_code(err: &Error) -> StatusCode {
    match err {
        Error::InvalidRequestBody { .. } | Error::InvalidArguments { .. } => {
            StatusCode::BAD_REQUEST
        }
        Error::FlowLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::LeaderNotFound { .. }
        | Error::ClusterNotCoordinated { .. }
        | Error::EtcdFailure { .. }
        | Error::EtcdUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::ForwardToLeader { .. } | Error::BuildForwardResponse { .. } => {
            StatusCode::BAD_GATEWAY
        }
        Error::ClusterFailure { source } => cluster_error_status(source),
        Error::CoordinatorFailure { source } => coordinator_error_status(source),
        Error::WaitResult { .. }
        | Error::ParseIpAddr { .. }
        | Error::AlreadyStarted { .. }
        | Error::HandleUpdateLogLevel { .. }
        | Error::ProfileCpu { .. }
        | Error::JoinAsyncTask { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_rejection(
    rejection: warp::Rejection,
) -> std::result::Result<(impl warp::Reply,), Infallible> {
    let code;
    let message;

    if rejection.is_not_found() {
        code = StatusCode::NOT_FOUND;
        message = String::from("NOT_FOUND");
    } else if let Some(err) = rejection.find() {
        code = error_to_status_code(err);
        let err_string = err.to_string();
        message = error_util::remove_backtrace_from_err(&err_string).to_string();
    } else {
        code = StatusCode::INTERNAL_SERVER_ERROR;
        message = error_util::remove_backtrace_from_err(&format!("UNKNOWN_ERROR: {rejection:?}"))
            .to_string();
    }

    if code.as_u16() >= 500 {
        error!("HTTP handle error: {:?}", rejection);
    }
    let json = reply::json(&ErrorResponse {
        code: code.as_u16(),
        message,
    });

    Ok((reply::with_status(json, code),))
}
