// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Owner of the registered schedulers of one cluster.
//!
//! A background loop wakes on a fixed tick, takes a fresh snapshot, lets
//! every scheduler inspect it and submits the emitted procedures. It also
//! drives the `Prepare -> Stable` transition once the assignment completes
//! and translates shard lease expirations into dropped shard nodes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use cluster::{
    metadata::{current_ms, ClusterMetadataRef},
    shard_watch::{ShardExpireEvent, ShardExpiryListener},
    types::Snapshot,
};
use common_types::{
    cluster::{ClusterState, TopologyType},
    shard::{ShardNode, ShardRole, ShardStatus},
};
use log::{debug, error, info, warn};
use meta_storage::{
    keys,
    kv::{KvBackend, KvBackendRef},
};
use snafu::{ensure, ResultExt};
use tokio::{
    sync::mpsc::{self, Sender},
    task::JoinHandle,
    time,
};

use super::{
    rebalanced::RebalancedShardScheduler, reopen::ReopenShardScheduler,
    static_topology::StaticTopologyScheduler, AffinityRules, Scheduler, SchedulerRef,
    ShardAffinityRule,
};
use crate::{
    factory::FactoryRef, procedure::manager::ProcedureManagerRef, EncodeProcedure,
    NotImplemented, Result, StorageFailure,
};

pub struct SchedulerManager {
    metadata: ClusterMetadataRef,
    procedure_manager: ProcedureManagerRef,
    kv: KvBackendRef,
    root_path: String,
    topology_type: TopologyType,
    tick_interval: Duration,
    enabled: AtomicBool,
    rules: AffinityRules,
    schedulers: Vec<SchedulerRef>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
    stop_tick_tx: Mutex<Option<Sender<()>>>,
}

pub type SchedulerManagerRef = Arc<SchedulerManager>;

impl SchedulerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: ClusterMetadataRef,
        factory: FactoryRef,
        procedure_manager: ProcedureManagerRef,
        kv: KvBackendRef,
        root_path: String,
        topology_type: TopologyType,
        tick_interval: Duration,
        enable_schedule: bool,
    ) -> Self {
        let rules = AffinityRules::default();
        let schedulers: Vec<SchedulerRef> = match topology_type {
            TopologyType::Static => vec![
                Arc::new(StaticTopologyScheduler::new(factory.clone())),
                Arc::new(ReopenShardScheduler::new(factory)),
            ],
            TopologyType::Dynamic => vec![
                Arc::new(RebalancedShardScheduler::new(
                    factory.clone(),
                    rules.clone(),
                )),
                Arc::new(ReopenShardScheduler::new(factory)),
            ],
        };

        // The static topology cannot be paused, assignment must always run.
        let enabled = match topology_type {
            TopologyType::Static => true,
            TopologyType::Dynamic => enable_schedule,
        };

        Self {
            metadata,
            procedure_manager,
            kv,
            root_path,
            topology_type,
            tick_interval,
            enabled: AtomicBool::new(enabled),
            rules,
            schedulers,
            tick_handle: Mutex::new(None),
            stop_tick_tx: Mutex::new(None),
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.load_affinity_rules().await?;

        let manager = self.clone();
        let tick_interval = self.tick_interval;
        let (tx, mut rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            info!(
                "Scheduler manager starts, cluster:{}, tick:{:?}",
                manager.metadata.name(),
                tick_interval
            );
            loop {
                if time::timeout(tick_interval, rx.recv()).await.is_ok() {
                    warn!("Receive exit command and exit scheduler loop");
                    break;
                }

                if !manager.enabled.load(Ordering::Relaxed) {
                    debug!("Schedule is disabled, skip this tick");
                    continue;
                }

                manager.tick().await;
            }
        });

        *self.stop_tick_tx.lock().unwrap() = Some(tx);
        *self.tick_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        let tx = self.stop_tick_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        let handle = self.tick_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn tick(&self) {
        let snapshot = self.metadata.snapshot().await;

        if let Err(e) = self.try_finish_prepare(&snapshot).await {
            error!("Failed to finish the prepare state, err:{e}");
        }

        for scheduler in &self.schedulers {
            match scheduler.schedule(&snapshot).await {
                Ok(result) => match result.procedure {
                    Some(procedure) => {
                        info!(
                            "Scheduler emits procedure, scheduler:{}, procedure:{}, reason:{}",
                            scheduler.name(),
                            procedure.id(),
                            result.reason
                        );
                        if let Err(e) = self.procedure_manager.submit(procedure).await {
                            warn!(
                                "Failed to submit procedure, scheduler:{}, err:{e}",
                                scheduler.name()
                            );
                        }
                    }
                    None => debug!(
                        "Scheduler emits nothing, scheduler:{}, reason:{}",
                        scheduler.name(),
                        result.reason
                    ),
                },
                Err(e) => error!("Scheduler failed, scheduler:{}, err:{e}", scheduler.name()),
            }
        }
    }

    /// Flip the cluster to `Stable` once every shard is assigned and its
    /// owner reports it ready.
    async fn try_finish_prepare(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.topology.cluster_view.state != ClusterState::Prepare {
            return Ok(());
        }
        if !snapshot
            .topology
            .unassigned_shard_ids(snapshot.cluster.shard_total)
            .is_empty()
        {
            return Ok(());
        }

        let now = current_ms();
        for binding in &snapshot.topology.cluster_view.shard_nodes {
            let node = snapshot
                .registered_nodes
                .iter()
                .find(|node| node.node.node_name == binding.node);
            let ready = node
                .filter(|node| node.is_online(now))
                .map(|node| {
                    node.shard_infos
                        .iter()
                        .any(|info| info.id == binding.shard_id && info.status == ShardStatus::Ready)
                })
                .unwrap_or(false);
            if !ready {
                return Ok(());
            }
        }

        self.metadata
            .update_cluster_view(
                ClusterState::Stable,
                snapshot.topology.cluster_view.shard_nodes.clone(),
            )
            .await
            .context(crate::ClusterFailure)?;
        info!("Cluster turns to stable, cluster:{}", self.metadata.name());
        Ok(())
    }

    fn ensure_dynamic(&self, operation: &str) -> Result<()> {
        ensure!(
            self.topology_type == TopologyType::Dynamic,
            NotImplemented {
                msg: format!("{operation} is only supported by the dynamic topology"),
            }
        );
        Ok(())
    }

    async fn load_affinity_rules(&self) -> Result<()> {
        let prefix = keys::affinity_prefix(&self.root_path, self.metadata.id());
        let kvs = self
            .kv
            .scan_prefix(&prefix)
            .await
            .context(StorageFailure)?;
        let mut rules = Vec::with_capacity(kvs.len());
        for (key, value) in kvs {
            let rule: ShardAffinityRule =
                serde_json::from_slice(&value).context(crate::DecodeProcedure { key })?;
            rules.push(rule);
        }
        if !rules.is_empty() {
            info!("Affinity rules loaded, count:{}", rules.len());
        }
        self.rules.load(rules);
        Ok(())
    }

    pub async fn add_shard_affinity_rule(&self, rule: ShardAffinityRule) -> Result<()> {
        self.ensure_dynamic("shard affinity")?;

        let key = keys::affinity_key(&self.root_path, self.metadata.id(), rule.shard_id);
        let value = serde_json::to_vec(&rule).context(EncodeProcedure)?;
        self.kv.put(&key, value).await.context(StorageFailure)?;
        self.rules.insert(rule);
        Ok(())
    }

    pub async fn remove_shard_affinity_rule(
        &self,
        shard_id: common_types::shard::ShardId,
    ) -> Result<()> {
        self.ensure_dynamic("shard affinity")?;

        let key = keys::affinity_key(&self.root_path, self.metadata.id(), shard_id);
        self.kv.delete(&key).await.context(StorageFailure)?;
        self.rules.remove(shard_id);
        Ok(())
    }

    pub fn list_shard_affinity_rules(&self) -> Result<Vec<ShardAffinityRule>> {
        self.ensure_dynamic("shard affinity")?;
        Ok(self.rules.list())
    }

    /// Pause or resume emission, used during deploys of the storage nodes.
    pub fn update_enable_schedule(&self, enable: bool) -> Result<bool> {
        self.ensure_dynamic("enable schedule")?;
        Ok(self.enabled.swap(enable, Ordering::Relaxed))
    }

    pub fn enable_schedule(&self) -> Result<bool> {
        self.ensure_dynamic("enable schedule")?;
        Ok(self.enabled.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl ShardExpiryListener for SchedulerManager {
    /// An expired shard lease means its holder is gone, drop the binding so
    /// the schedulers re-assign the shard.
    async fn on_shard_expired(&self, event: ShardExpireEvent) {
        info!(
            "Handle shard expiry, shard_id:{}, old_leader:{}",
            event.shard_id, event.old_leader
        );
        let dropped = vec![ShardNode {
            shard_id: event.shard_id,
            node: event.old_leader,
            role: ShardRole::Leader,
        }];
        if let Err(e) = self.metadata.drop_shard_nodes(dropped).await {
            error!(
                "Failed to drop shard nodes on expiry, shard_id:{}, err:{e}",
                event.shard_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{
        factory::Factory,
        procedure::{manager::ProcedureManager, storage::ProcedureStorage, Context},
        test_util::{heartbeat, new_test_cluster, ready_shard, wait_for_idle, MockDispatch, TEST_ROOT},
        Error,
    };

    async fn test_manager(
        node_count: u32,
        shard_total: u32,
        topology_type: TopologyType,
    ) -> (
        ClusterMetadataRef,
        ProcedureManagerRef,
        Arc<SchedulerManager>,
    ) {
        let (metadata, meta_storage, kv) =
            new_test_cluster(node_count, shard_total, topology_type).await;
        let dispatch = Arc::new(MockDispatch::default());
        let factory = Arc::new(
            Factory::new(meta_storage, metadata.clone(), dispatch, 100)
                .await
                .unwrap(),
        );
        let storage = Arc::new(ProcedureStorage::new(
            kv.clone(),
            TEST_ROOT.to_string(),
            metadata.id(),
        ));
        let procedure_manager = Arc::new(ProcedureManager::new(metadata.clone(), storage, 8));
        procedure_manager.start(Context::default());

        let manager = Arc::new(SchedulerManager::new(
            metadata.clone(),
            factory,
            procedure_manager.clone(),
            kv,
            TEST_ROOT.to_string(),
            topology_type,
            Duration::from_millis(50),
            true,
        ));
        (metadata, procedure_manager, manager)
    }

    #[tokio::test]
    async fn test_static_bootstrap_to_stable() {
        let (metadata, procedure_manager, manager) =
            test_manager(2, 8, TopologyType::Static).await;

        // One node is not enough to leave the empty state.
        metadata.register_node(heartbeat("n1", vec![])).await.unwrap();
        assert_eq!(metadata.state().await, ClusterState::Empty);
        metadata.register_node(heartbeat("n2", vec![])).await.unwrap();
        assert_eq!(metadata.state().await, ClusterState::Prepare);

        // The first tick assigns every shard across the two nodes.
        manager.tick().await;
        wait_for_idle(&procedure_manager).await;

        let snapshot = metadata.snapshot().await;
        assert!(snapshot.topology.unassigned_shard_ids(8).is_empty());
        let owners: HashSet<_> = snapshot
            .topology
            .cluster_view
            .shard_nodes
            .iter()
            .map(|binding| binding.node.clone())
            .collect();
        assert_eq!(owners.len(), 2);
        assert_eq!(metadata.state().await, ClusterState::Prepare);

        // Both nodes report their shards ready, the next tick turns stable.
        for node in ["n1", "n2"] {
            let infos: Vec<_> = snapshot
                .topology
                .cluster_view
                .shard_nodes
                .iter()
                .filter(|binding| binding.node == node)
                .map(|binding| {
                    let version = snapshot
                        .topology
                        .shard_view(binding.shard_id)
                        .unwrap()
                        .version;
                    ready_shard(binding.shard_id, version)
                })
                .collect();
            metadata.register_node(heartbeat(node, infos)).await.unwrap();
        }
        manager.tick().await;
        assert_eq!(metadata.state().await, ClusterState::Stable);
    }

    #[tokio::test]
    async fn test_static_topology_rejects_dynamic_knobs() {
        let (_, _, manager) = test_manager(1, 2, TopologyType::Static).await;

        assert!(matches!(
            manager.update_enable_schedule(false).unwrap_err(),
            Error::NotImplemented { .. }
        ));
        assert!(matches!(
            manager
                .add_shard_affinity_rule(ShardAffinityRule {
                    shard_id: 0,
                    preferred_nodes: vec!["n1".to_string()],
                    priority: 1,
                })
                .await
                .unwrap_err(),
            Error::NotImplemented { .. }
        ));
        assert!(matches!(
            manager.list_shard_affinity_rules().unwrap_err(),
            Error::NotImplemented { .. }
        ));
    }

    #[tokio::test]
    async fn test_dynamic_enable_schedule_and_affinity() {
        let (_, _, manager) = test_manager(1, 2, TopologyType::Dynamic).await;

        assert!(manager.enable_schedule().unwrap());
        assert!(manager.update_enable_schedule(false).unwrap());
        assert!(!manager.enable_schedule().unwrap());

        let rule = ShardAffinityRule {
            shard_id: 1,
            preferred_nodes: vec!["n2".to_string()],
            priority: 10,
        };
        manager.add_shard_affinity_rule(rule.clone()).await.unwrap();
        assert_eq!(manager.list_shard_affinity_rules().unwrap(), vec![rule]);
        manager.remove_shard_affinity_rule(1).await.unwrap();
        assert!(manager.list_shard_affinity_rules().unwrap().is_empty());
    }
}
