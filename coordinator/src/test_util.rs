// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Helpers shared by the coordinator tests.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use cluster::{
    manager::ClusterManager,
    metadata::{current_ms, ClusterMetadataRef},
    types::CreateClusterOpts,
};
use common_types::{
    cluster::TopologyType,
    node::{Node, NodeState, NodeStats, RegisteredNode},
    shard::{ShardId, ShardInfo, ShardRole, ShardStatus, ShardVersion},
};
use meta_storage::{
    kv::{KvBackendRef, MemoryKv},
    meta::{MetaStorage, MetaStorageRef},
};

use crate::{
    eventdispatch::{
        CloseShardRequest, CloseTableOnShardRequest, CreateTableOnShardRequest,
        DropTableOnShardRequest, EventDispatch, OpenShardRequest, OpenTableOnShardRequest,
    },
    DispatchFailed, Result,
};

pub const TEST_ROOT: &str = "/ceresmeta";

pub async fn new_test_cluster(
    node_count: u32,
    shard_total: u32,
    topology_type: TopologyType,
) -> (ClusterMetadataRef, MetaStorageRef, KvBackendRef) {
    let kv: KvBackendRef = Arc::new(MemoryKv::default());
    let meta_storage = Arc::new(MetaStorage::new(kv.clone(), TEST_ROOT.to_string()).unwrap());
    let manager = ClusterManager::new(meta_storage.clone(), 100).await.unwrap();
    let metadata = manager
        .create_cluster(
            "defaultCluster",
            CreateClusterOpts {
                node_count,
                shard_total,
                topology_type,
                procedure_executing_batch_size: 8,
            },
        )
        .await
        .unwrap();
    (metadata, meta_storage, kv)
}

pub fn heartbeat(name: &str, shard_infos: Vec<ShardInfo>) -> RegisteredNode {
    RegisteredNode {
        node: Node {
            node_name: name.to_string(),
            node_stats: NodeStats {
                lease: 10,
                zone: "default".to_string(),
                node_version: "1.2.2".to_string(),
            },
            last_touch_time: current_ms(),
            state: NodeState::Online,
        },
        shard_infos,
    }
}

pub fn ready_shard(shard_id: ShardId, version: ShardVersion) -> ShardInfo {
    ShardInfo {
        id: shard_id,
        role: ShardRole::Leader,
        version,
        status: ShardStatus::Ready,
    }
}

/// Event dispatch answering like a healthy node: table level events return
/// the incremented shard version. Creation failures can be injected to
/// simulate a lost node.
#[derive(Default)]
pub struct MockDispatch {
    fail_create: AtomicBool,
}

impl MockDispatch {
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl EventDispatch for MockDispatch {
    async fn open_shard(&self, _endpoint: &str, _req: OpenShardRequest) -> Result<()> {
        Ok(())
    }

    async fn close_shard(&self, _endpoint: &str, _req: CloseShardRequest) -> Result<()> {
        Ok(())
    }

    async fn create_table_on_shard(
        &self,
        endpoint: &str,
        req: CreateTableOnShardRequest,
    ) -> Result<ShardVersion> {
        if self.fail_create.load(Ordering::Relaxed) {
            return DispatchFailed {
                endpoint,
                code: 14u32,
                msg: "node unavailable",
            }
            .fail();
        }
        Ok(req.update_shard_info.prev_version + 1)
    }

    async fn drop_table_on_shard(
        &self,
        _endpoint: &str,
        req: DropTableOnShardRequest,
    ) -> Result<ShardVersion> {
        Ok(req.update_shard_info.prev_version + 1)
    }

    async fn open_table_on_shard(
        &self,
        _endpoint: &str,
        _req: OpenTableOnShardRequest,
    ) -> Result<()> {
        Ok(())
    }

    async fn close_table_on_shard(
        &self,
        _endpoint: &str,
        _req: CloseTableOnShardRequest,
    ) -> Result<()> {
        Ok(())
    }
}

/// Wait until the procedure manager drained its queue and running set.
pub async fn wait_for_idle(manager: &crate::procedure::manager::ProcedureManagerRef) {
    for _ in 0..400 {
        if manager.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("procedure manager is still busy");
}
