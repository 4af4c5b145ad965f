// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Manager of all clusters served by this meta server.

use std::{collections::HashMap, sync::Arc};

use common_types::{
    cluster::{Cluster, ClusterView},
    node::RegisteredNode,
    shard::ShardView,
};
use common_util::{error::BoxError, id_allocator::IdAllocator};
use log::info;
use meta_storage::meta::MetaStorageRef;
use snafu::{ensure, OptionExt, ResultExt};
use tokio::sync::RwLock;

use crate::{
    metadata::{current_ms, ClusterMetadata, ClusterMetadataRef},
    types::CreateClusterOpts,
    AllocId, ClusterAlreadyExists, ClusterNotFound, MetaStorageFailure, Result,
};

const CLUSTER_ID_NAME: &str = "cluster_id";

pub struct ClusterManager {
    meta_storage: MetaStorageRef,
    alloc_step: u64,
    cluster_id_alloc: IdAllocator,
    clusters: RwLock<HashMap<String, ClusterMetadataRef>>,
}

pub type ClusterManagerRef = Arc<ClusterManager>;

impl ClusterManager {
    pub async fn new(meta_storage: MetaStorageRef, alloc_step: u64) -> Result<Self> {
        let cluster_id_base = meta_storage
            .get_root_max_id(CLUSTER_ID_NAME)
            .await
            .context(MetaStorageFailure { msg: "get max id" })?
            .unwrap_or(0);

        Ok(Self {
            meta_storage,
            alloc_step,
            cluster_id_alloc: IdAllocator::new(cluster_id_base, cluster_id_base, alloc_step),
            clusters: RwLock::new(HashMap::new()),
        })
    }

    /// Load every persisted cluster into memory.
    pub async fn load(&self) -> Result<()> {
        let records = self
            .meta_storage
            .list_clusters()
            .await
            .context(MetaStorageFailure { msg: "list clusters" })?;

        let mut clusters = HashMap::with_capacity(records.len());
        for (cluster, _) in records {
            let name = cluster.name.clone();
            let metadata =
                ClusterMetadata::load(self.meta_storage.clone(), cluster, self.alloc_step)
                    .await?;
            clusters.insert(name, Arc::new(metadata));
        }

        info!("Cluster manager loaded, clusters:{}", clusters.len());
        *self.clusters.write().await = clusters;
        Ok(())
    }

    pub async fn create_cluster(
        &self,
        cluster_name: &str,
        opts: CreateClusterOpts,
    ) -> Result<ClusterMetadataRef> {
        {
            let clusters = self.clusters.read().await;
            ensure!(
                !clusters.contains_key(cluster_name),
                ClusterAlreadyExists { cluster_name }
            );
        }

        let cluster_id = {
            let meta_storage = self.meta_storage.clone();
            self.cluster_id_alloc
                .alloc_id(move |max_id| async move {
                    meta_storage
                        .put_root_max_id(CLUSTER_ID_NAME, max_id)
                        .await
                        .box_err()
                })
                .await
                .context(AllocId { msg: "cluster id" })?
        };

        let cluster = Cluster {
            id: cluster_id as u32,
            name: cluster_name.to_string(),
            shard_total: opts.shard_total,
            node_count: opts.node_count,
            topology_type: opts.topology_type,
            procedure_executing_batch_size: opts.procedure_executing_batch_size,
            created_at: current_ms(),
        };
        let view = ClusterView::default();
        self.meta_storage
            .create_cluster(&cluster, &view)
            .await
            .context(MetaStorageFailure { msg: "create cluster" })?;

        // Shard views are created together with the cluster.
        let shard_views: Vec<_> = (0..opts.shard_total).map(ShardView::new).collect();
        self.meta_storage
            .put_shard_views(cluster.id, &shard_views)
            .await
            .context(MetaStorageFailure {
                msg: "put shard views",
            })?;

        info!(
            "Cluster created, cluster:{cluster_name}, id:{}, shard_total:{}",
            cluster.id, opts.shard_total
        );

        let metadata = Arc::new(
            ClusterMetadata::load(self.meta_storage.clone(), cluster, self.alloc_step).await?,
        );
        self.clusters
            .write()
            .await
            .insert(cluster_name.to_string(), metadata.clone());
        Ok(metadata)
    }

    pub async fn get_cluster(&self, cluster_name: &str) -> Result<ClusterMetadataRef> {
        self.clusters
            .read()
            .await
            .get(cluster_name)
            .cloned()
            .context(ClusterNotFound { cluster_name })
    }

    pub async fn list_clusters(&self) -> Vec<ClusterMetadataRef> {
        let clusters = self.clusters.read().await;
        let mut list: Vec<_> = clusters.values().cloned().collect();
        list.sort_by_key(|cluster| cluster.id());
        list
    }

    pub async fn register_node(
        &self,
        cluster_name: &str,
        node: RegisteredNode,
    ) -> Result<()> {
        self.get_cluster(cluster_name).await?.register_node(node).await
    }
}

#[cfg(test)]
mod tests {
    use common_types::cluster::TopologyType;
    use meta_storage::{kv::MemoryKv, meta::MetaStorage};

    use super::*;
    use crate::Error;

    fn test_opts() -> CreateClusterOpts {
        CreateClusterOpts {
            node_count: 2,
            shard_total: 4,
            topology_type: TopologyType::Static,
            procedure_executing_batch_size: 8,
        }
    }

    async fn test_manager() -> ClusterManager {
        let kv = Arc::new(MemoryKv::default());
        let meta_storage =
            Arc::new(MetaStorage::new(kv, "/ceresmeta".to_string()).unwrap());
        ClusterManager::new(meta_storage, 100).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_cluster() {
        let manager = test_manager().await;

        let cluster = manager
            .create_cluster("defaultCluster", test_opts())
            .await
            .unwrap();
        assert_eq!(cluster.name(), "defaultCluster");

        let err = manager
            .create_cluster("defaultCluster", test_opts())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterAlreadyExists { .. }));

        assert!(manager.get_cluster("defaultCluster").await.is_ok());
        assert!(matches!(
            manager.get_cluster("missing").await.unwrap_err(),
            Error::ClusterNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_reload_persisted_clusters() {
        let kv = Arc::new(MemoryKv::default());
        let meta_storage =
            Arc::new(MetaStorage::new(kv, "/ceresmeta".to_string()).unwrap());

        let manager = ClusterManager::new(meta_storage.clone(), 100).await.unwrap();
        manager
            .create_cluster("defaultCluster", test_opts())
            .await
            .unwrap();

        // A fresh manager over the same storage sees the cluster.
        let reloaded = ClusterManager::new(meta_storage, 100).await.unwrap();
        reloaded.load().await.unwrap();
        let cluster = reloaded.get_cluster("defaultCluster").await.unwrap();
        assert_eq!(cluster.snapshot().await.topology.shard_views.len(), 4);
    }
}
