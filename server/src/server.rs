// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! The meta server instance: per cluster coordination started and stopped
//! with the leadership, plus the shared state the HTTP service works on.

use std::{collections::HashMap, sync::Arc, time::Duration};

use cluster::{
    manager::ClusterManagerRef,
    metadata::ClusterMetadataRef,
    shard_watch::{KvShardWatch, NoopShardWatch, ShardWatch, ShardWatchRef},
    types::CreateClusterOpts,
};
use common_types::cluster::TopologyType;
use coordinator::{
    eventdispatch::EventDispatchRef,
    factory::{Factory, FactoryRef},
    procedure::{
        manager::{ProcedureManager, ProcedureManagerRef},
        storage::ProcedureStorage,
        Context,
    },
    scheduler::manager::{SchedulerManager, SchedulerManagerRef},
};
use log::{error, info, warn};
use meta_storage::{kv::KvBackendRef, meta::MetaStorageRef};
use snafu::{OptionExt, ResultExt};
use tokio::{sync::RwLock, task::JoinHandle};

use crate::{
    forward::Forwarder, limiter::FlowLimiter, member::MemberRef, ClusterFailure,
    ClusterNotCoordinated, CoordinatorFailure, Result,
};

/// Everything driving one cluster, alive only on the leader.
pub struct ClusterCoordinator {
    pub metadata: ClusterMetadataRef,
    pub factory: FactoryRef,
    pub procedure_manager: ProcedureManagerRef,
    pub scheduler_manager: SchedulerManagerRef,
    shard_watch: ShardWatchRef,
}

impl ClusterCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub async fn build(
        metadata: ClusterMetadataRef,
        dispatch: EventDispatchRef,
        meta_storage: MetaStorageRef,
        kv: KvBackendRef,
        root_path: String,
        id_allocator_step: u64,
        scheduler_tick_interval: Duration,
        enable_schedule: bool,
    ) -> Result<Arc<Self>> {
        let cluster = metadata.cluster().await;

        let factory = Arc::new(
            Factory::new(
                meta_storage,
                metadata.clone(),
                dispatch,
                id_allocator_step,
            )
            .await
            .context(CoordinatorFailure)?,
        );
        let procedure_storage = Arc::new(ProcedureStorage::new(
            kv.clone(),
            root_path.clone(),
            metadata.id(),
        ));
        let procedure_manager = Arc::new(ProcedureManager::new(
            metadata.clone(),
            procedure_storage,
            cluster.procedure_executing_batch_size as usize,
        ));
        let scheduler_manager = Arc::new(SchedulerManager::new(
            metadata.clone(),
            factory.clone(),
            procedure_manager.clone(),
            kv.clone(),
            root_path.clone(),
            cluster.topology_type,
            scheduler_tick_interval,
            enable_schedule,
        ));
        let shard_watch: ShardWatchRef = match cluster.topology_type {
            TopologyType::Dynamic => Arc::new(
                KvShardWatch::new(kv, &root_path, metadata.name()).context(ClusterFailure)?,
            ),
            TopologyType::Static => Arc::new(NoopShardWatch),
        };

        Ok(Arc::new(Self {
            metadata,
            factory,
            procedure_manager,
            scheduler_manager,
            shard_watch,
        }))
    }

    pub async fn start(&self, ctx: Context) -> Result<()> {
        self.procedure_manager.start(ctx);
        self.factory
            .recover(&self.procedure_manager)
            .await
            .context(CoordinatorFailure)?;
        self.scheduler_manager
            .clone()
            .start()
            .await
            .context(CoordinatorFailure)?;
        self.shard_watch
            .start(self.scheduler_manager.clone())
            .await
            .context(ClusterFailure)?;

        info!(
            "Cluster coordinator started, cluster:{}",
            self.metadata.name()
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if let Err(e) = self.shard_watch.stop().await {
            error!("Failed to stop shard watch, err:{e}");
        }
        self.scheduler_manager.stop().await;
        self.procedure_manager.stop().await;
        info!(
            "Cluster coordinator stopped, cluster:{}",
            self.metadata.name()
        );
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub storage_root_path: String,
    pub id_allocator_step: u64,
    pub scheduler_tick_interval: Duration,
    pub enable_schedule: bool,
    pub default_cluster_name: String,
    pub default_cluster_node_count: u32,
    pub default_cluster_shard_total: u32,
    pub topology_type: TopologyType,
    pub procedure_executing_batch_size: u32,
}

/// Shared state of the server, also the context of the HTTP handlers.
pub struct ServerInner {
    pub config: ServerConfig,
    pub cluster_manager: ClusterManagerRef,
    pub member: MemberRef,
    pub limiter: FlowLimiter,
    pub forwarder: Forwarder,
    pub dispatch: EventDispatchRef,
    pub meta_storage: MetaStorageRef,
    pub kv: KvBackendRef,
    pub etcd: Option<etcd_client::Client>,
    coordinators: RwLock<HashMap<String, Arc<ClusterCoordinator>>>,
}

pub type ServerInnerRef = Arc<ServerInner>;

impl ServerInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        cluster_manager: ClusterManagerRef,
        member: MemberRef,
        limiter: FlowLimiter,
        dispatch: EventDispatchRef,
        meta_storage: MetaStorageRef,
        kv: KvBackendRef,
        etcd: Option<etcd_client::Client>,
    ) -> Self {
        Self {
            config,
            cluster_manager,
            member,
            limiter,
            forwarder: Forwarder::default(),
            dispatch,
            meta_storage,
            kv,
            etcd,
            coordinators: RwLock::new(HashMap::new()),
        }
    }

    pub async fn coordinator(&self, cluster_name: &str) -> Result<Arc<ClusterCoordinator>> {
        self.coordinators
            .read()
            .await
            .get(cluster_name)
            .cloned()
            .context(ClusterNotCoordinated { cluster_name })
    }

    /// Create the cluster and, on the leader, start coordinating it.
    pub async fn create_cluster(
        &self,
        cluster_name: &str,
        opts: CreateClusterOpts,
    ) -> Result<ClusterMetadataRef> {
        let metadata = self
            .cluster_manager
            .create_cluster(cluster_name, opts)
            .await
            .context(ClusterFailure)?;

        if self.member.is_leader() {
            self.start_coordinators().await?;
        }
        Ok(metadata)
    }

    pub async fn on_become_leader(&self) -> Result<()> {
        self.cluster_manager.load().await.context(ClusterFailure)?;

        // The default cluster is created by the first leader.
        let default_name = self.config.default_cluster_name.clone();
        match self.cluster_manager.get_cluster(&default_name).await {
            Ok(_) => {}
            Err(cluster::Error::ClusterNotFound { .. }) => {
                info!("Create default cluster, cluster:{default_name}");
                self.cluster_manager
                    .create_cluster(
                        &default_name,
                        CreateClusterOpts {
                            node_count: self.config.default_cluster_node_count,
                            shard_total: self.config.default_cluster_shard_total,
                            topology_type: self.config.topology_type,
                            procedure_executing_batch_size: self
                                .config
                                .procedure_executing_batch_size,
                        },
                    )
                    .await
                    .context(ClusterFailure)?;
            }
            Err(e) => return Err(e).context(ClusterFailure),
        }

        self.start_coordinators().await
    }

    async fn start_coordinators(&self) -> Result<()> {
        let ctx = Context::with_leadership(self.member.leader_watch());
        let clusters = self.cluster_manager.list_clusters().await;

        let mut coordinators = self.coordinators.write().await;
        for metadata in clusters {
            if coordinators.contains_key(metadata.name()) {
                continue;
            }
            let coordinator = ClusterCoordinator::build(
                metadata.clone(),
                self.dispatch.clone(),
                self.meta_storage.clone(),
                self.kv.clone(),
                self.config.storage_root_path.clone(),
                self.config.id_allocator_step,
                self.config.scheduler_tick_interval,
                self.config.enable_schedule,
            )
            .await?;
            coordinator.start(ctx.clone()).await?;
            coordinators.insert(metadata.name().to_string(), coordinator);
        }
        Ok(())
    }

    pub async fn stop_coordinators(&self) {
        let mut coordinators = self.coordinators.write().await;
        for (_, coordinator) in coordinators.drain() {
            coordinator.stop().await;
        }
    }

    /// Rebuild the coordinator of one cluster after its config changed.
    pub async fn rebuild_coordinator(&self, cluster_name: &str) -> Result<()> {
        let removed = self.coordinators.write().await.remove(cluster_name);
        if let Some(coordinator) = removed {
            coordinator.stop().await;
        }
        if self.member.is_leader() {
            self.start_coordinators().await?;
        }
        Ok(())
    }

    /// Watch the leadership and start/stop the coordination accordingly.
    pub fn spawn_leadership_loop(self: Arc<Self>) -> JoinHandle<()> {
        let inner = self;
        let mut leader_watch = inner.member.leader_watch();

        tokio::spawn(async move {
            loop {
                let is_leader = *leader_watch.borrow();
                if is_leader {
                    info!("This node becomes the leader, start coordinating");
                    if let Err(e) = inner.on_become_leader().await {
                        error!("Failed to start coordinating as leader, err:{e}");
                    }
                } else {
                    warn!("This node is a follower, stop coordinating");
                    inner.stop_coordinators().await;
                }

                if leader_watch.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}
