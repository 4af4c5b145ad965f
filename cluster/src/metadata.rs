// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! The authoritative metadata of one cluster.
//!
//! All reads are served from the in-memory cache refreshed at load time; all
//! writes take the single writer lock which also covers the KV commit, so a
//! reader never observes a state that was not persisted.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use common_types::{
    cluster::{Cluster, ClusterId, ClusterState, TopologyType},
    node::RegisteredNode,
    schema::Schema,
    shard::{ShardId, ShardInfo, ShardNode, ShardRole, ShardStatus, ShardVersion},
    table::{Table, TableId, TableInfo},
};
use common_util::{error::BoxError, id_allocator::IdAllocator};
use log::info;
use meta_storage::meta::MetaStorageRef;
use snafu::ResultExt;
use tokio::sync::RwLock;

use crate::{
    table_manager::TableManager,
    topology::TopologyManager,
    types::{
        CreateTableMetadataRequest, GetNodeShardsResult, NodeShard, RouteEntry,
        RouteTablesResult, ShardTables, ShardVersionUpdate, Snapshot,
    },
    AllocId, MetaStorageFailure, Result,
};

const SCHEMA_ID_NAME: &str = "schema_id";
const TABLE_ID_NAME: &str = "table_id";
const SHARD_ID_NAME: &str = "shard_id";

pub fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug)]
struct Inner {
    cluster: Cluster,
    topology: TopologyManager,
    tables: TableManager,
    nodes: HashMap<String, RegisteredNode>,
}

#[derive(Debug)]
pub struct ClusterMetadata {
    cluster_id: ClusterId,
    cluster_name: String,
    meta_storage: MetaStorageRef,
    schema_id_alloc: IdAllocator,
    table_id_alloc: IdAllocator,
    shard_id_alloc: IdAllocator,
    inner: RwLock<Inner>,
}

pub type ClusterMetadataRef = Arc<ClusterMetadata>;

impl ClusterMetadata {
    /// Load the whole cluster state from the meta storage.
    pub async fn load(
        meta_storage: MetaStorageRef,
        cluster: Cluster,
        alloc_step: u64,
    ) -> Result<Self> {
        let cluster_id = cluster.id;
        let view = match meta_storage
            .get_cluster(cluster_id)
            .await
            .context(MetaStorageFailure { msg: "get cluster" })?
        {
            Some((_, view)) => view,
            None => Default::default(),
        };

        let schemas = meta_storage
            .list_schemas(cluster_id)
            .await
            .context(MetaStorageFailure { msg: "list schemas" })?;
        let tables = meta_storage
            .list_tables(cluster_id)
            .await
            .context(MetaStorageFailure { msg: "list tables" })?;
        let shard_views = meta_storage
            .list_shard_views(cluster_id)
            .await
            .context(MetaStorageFailure {
                msg: "list shard views",
            })?;
        let nodes = meta_storage
            .list_nodes(cluster_id)
            .await
            .context(MetaStorageFailure { msg: "list nodes" })?;

        let schema_id_base = meta_storage
            .get_max_id(cluster_id, SCHEMA_ID_NAME)
            .await
            .context(MetaStorageFailure { msg: "get max id" })?
            .unwrap_or(0);
        let table_id_base = meta_storage
            .get_max_id(cluster_id, TABLE_ID_NAME)
            .await
            .context(MetaStorageFailure { msg: "get max id" })?
            .unwrap_or(0);
        // New shard ids (for split) start right behind the static range.
        let shard_id_base = meta_storage
            .get_max_id(cluster_id, SHARD_ID_NAME)
            .await
            .context(MetaStorageFailure { msg: "get max id" })?
            .unwrap_or(0)
            .max(cluster.shard_total.saturating_sub(1) as u64);

        let topology = TopologyManager::load(view, shard_views)?;
        let tables = TableManager::load(schemas, tables);
        let nodes = nodes
            .into_iter()
            .map(|node| (node.node.node_name.clone(), node))
            .collect();

        info!(
            "Cluster metadata loaded, cluster:{}, id:{}",
            cluster.name, cluster.id
        );

        Ok(Self {
            cluster_id,
            cluster_name: cluster.name.clone(),
            meta_storage,
            schema_id_alloc: IdAllocator::new(schema_id_base, schema_id_base, alloc_step),
            table_id_alloc: IdAllocator::new(table_id_base, table_id_base, alloc_step),
            shard_id_alloc: IdAllocator::new(shard_id_base, shard_id_base, alloc_step),
            inner: RwLock::new(Inner {
                cluster,
                topology,
                tables,
                nodes,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> ClusterId {
        self.cluster_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.cluster_name
    }

    pub async fn cluster(&self) -> Cluster {
        self.inner.read().await.cluster.clone()
    }

    pub async fn state(&self) -> ClusterState {
        self.inner.read().await.topology.cluster_view().state
    }

    pub async fn topology_type(&self) -> TopologyType {
        self.inner.read().await.cluster.topology_type
    }

    /// Assemble a consistent snapshot of the topology and the registered
    /// nodes under the read side of the metadata lock.
    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().await;
        let mut registered_nodes: Vec<_> = inner.nodes.values().cloned().collect();
        registered_nodes.sort_by(|a, b| a.node.node_name.cmp(&b.node.node_name));

        Snapshot {
            cluster: inner.cluster.clone(),
            topology: inner.topology.topology(),
            registered_nodes,
        }
    }

    pub async fn update_cluster(
        &self,
        node_count: u32,
        topology_type: TopologyType,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.cluster.node_count = node_count;
        inner.cluster.topology_type = topology_type;
        let view = inner.topology.cluster_view().clone();
        self.meta_storage
            .put_cluster(&inner.cluster, &view)
            .await
            .context(MetaStorageFailure { msg: "put cluster" })
    }

    // Node registry.

    /// Record a node heartbeat; the first heartbeats may drive the cluster
    /// from `Empty` to `Prepare` once enough distinct nodes showed up.
    pub async fn register_node(&self, node: RegisteredNode) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.meta_storage
            .put_node(self.cluster_id, &node)
            .await
            .context(MetaStorageFailure { msg: "put node" })?;
        inner.nodes.insert(node.node.node_name.clone(), node);

        if inner.topology.cluster_view().state == ClusterState::Empty {
            let now = current_ms();
            let online = inner
                .nodes
                .values()
                .filter(|node| node.is_online(now))
                .count() as u32;
            if online >= inner.cluster.node_count {
                let view = inner
                    .topology
                    .update_cluster_view(ClusterState::Prepare, vec![])?;
                self.meta_storage
                    .put_cluster(&inner.cluster, &view)
                    .await
                    .context(MetaStorageFailure { msg: "put cluster" })?;
                info!(
                    "Cluster turns to prepare, cluster:{}, online_nodes:{online}",
                    self.cluster_name
                );
            }
        }

        Ok(())
    }

    pub async fn list_registered_nodes(&self) -> Vec<RegisteredNode> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<_> = inner.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.node.node_name.cmp(&b.node.node_name));
        nodes
    }

    pub async fn get_registered_node(&self, node_name: &str) -> Option<RegisteredNode> {
        self.inner.read().await.nodes.get(node_name).cloned()
    }

    // Schema and table metadata.

    pub async fn get_or_create_schema(&self, schema_name: &str) -> Result<Schema> {
        {
            let inner = self.inner.read().await;
            if let Some(schema) = inner.tables.schema_by_name(schema_name) {
                return Ok(schema.clone());
            }
        }

        let schema_id = {
            let meta_storage = self.meta_storage.clone();
            let cluster_id = self.cluster_id;
            self.schema_id_alloc
                .alloc_id(move |max_id| async move {
                    meta_storage
                        .put_max_id(cluster_id, SCHEMA_ID_NAME, max_id)
                        .await
                        .box_err()
                })
                .await
                .context(AllocId { msg: "schema id" })?
        };

        let mut inner = self.inner.write().await;
        // Raced with another creator, keep the winner.
        if let Some(schema) = inner.tables.schema_by_name(schema_name) {
            return Ok(schema.clone());
        }
        let schema = Schema {
            id: schema_id as u32,
            name: schema_name.to_string(),
            created_at: current_ms(),
        };
        self.meta_storage
            .put_schema(self.cluster_id, &schema)
            .await
            .context(MetaStorageFailure { msg: "put schema" })?;
        inner.tables.insert_schema(schema.clone());
        Ok(schema)
    }

    pub async fn get_table(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<Table>> {
        let inner = self.inner.read().await;
        Ok(inner.tables.find_table(schema_name, table_name).cloned())
    }

    pub async fn get_table_info(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<TableInfo>> {
        let inner = self.inner.read().await;
        match inner.tables.find_table(schema_name, table_name) {
            Some(table) => Ok(Some(TableInfo::new(
                table.clone(),
                schema_name.to_string(),
            ))),
            None => Ok(None),
        }
    }

    /// Create the table record if absent; re-running with the same name
    /// returns the recorded table unchanged.
    pub async fn create_table_metadata(
        &self,
        req: CreateTableMetadataRequest,
    ) -> Result<Table> {
        let schema = self.get_or_create_schema(&req.schema_name).await?;

        {
            let inner = self.inner.read().await;
            if let Some(table) = inner.tables.find_table(&req.schema_name, &req.table_name) {
                return Ok(table.clone());
            }
        }

        let table_id = {
            let meta_storage = self.meta_storage.clone();
            let cluster_id = self.cluster_id;
            self.table_id_alloc
                .alloc_id(move |max_id| async move {
                    meta_storage
                        .put_max_id(cluster_id, TABLE_ID_NAME, max_id)
                        .await
                        .box_err()
                })
                .await
                .context(AllocId { msg: "table id" })?
        };

        let mut inner = self.inner.write().await;
        if let Some(table) = inner.tables.find_table(&req.schema_name, &req.table_name) {
            return Ok(table.clone());
        }
        let table = Table {
            id: table_id,
            name: req.table_name,
            schema_id: schema.id,
            created_at: current_ms(),
            partition_info: req.partition_info,
        };
        self.meta_storage
            .put_table(self.cluster_id, &table)
            .await
            .context(MetaStorageFailure { msg: "put table" })?;
        inner.tables.insert_table(table.clone());
        Ok(table)
    }

    /// Drop the table record, returning it if it existed.
    pub async fn drop_table_metadata(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<Table>> {
        let mut inner = self.inner.write().await;
        let table = match inner.tables.find_table(schema_name, table_name) {
            Some(table) => table.clone(),
            None => return Ok(None),
        };

        self.meta_storage
            .delete_table(self.cluster_id, table.id)
            .await
            .context(MetaStorageFailure { msg: "delete table" })?;
        self.meta_storage
            .delete_assignment(self.cluster_id, schema_name, table_name)
            .await
            .context(MetaStorageFailure {
                msg: "delete assignment",
            })?;
        inner.tables.remove_table(schema_name, table_name);
        Ok(Some(table))
    }

    // Topology mutations, all fenced by shard version.

    pub async fn add_table_topology(
        &self,
        update: ShardVersionUpdate,
        table: Table,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let shard_view = inner.topology.add_table_to_shard(&update, table.id)?;
        self.meta_storage
            .put_shard_view(self.cluster_id, &shard_view)
            .await
            .context(MetaStorageFailure {
                msg: "put shard view",
            })
    }

    pub async fn remove_table_topology(
        &self,
        update: ShardVersionUpdate,
        table_id: TableId,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let shard_view = inner.topology.remove_table_from_shard(&update, table_id)?;
        self.meta_storage
            .put_shard_view(self.cluster_id, &shard_view)
            .await
            .context(MetaStorageFailure {
                msg: "put shard view",
            })
    }

    pub async fn get_table_shard(&self, table_id: TableId) -> Option<ShardId> {
        self.inner.read().await.topology.table_shard(table_id)
    }

    pub async fn update_cluster_view(
        &self,
        state: ClusterState,
        shard_nodes: Vec<ShardNode>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let view = inner.topology.update_cluster_view(state, shard_nodes)?;
        self.meta_storage
            .put_cluster(&inner.cluster, &view)
            .await
            .context(MetaStorageFailure { msg: "put cluster" })
    }

    /// Remove exactly the given bindings, typically after their shard leases
    /// expired together with the holder node.
    pub async fn drop_shard_nodes(&self, dropped: Vec<ShardNode>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let view = inner.topology.drop_shard_nodes(&dropped);
        self.meta_storage
            .put_cluster(&inner.cluster, &view)
            .await
            .context(MetaStorageFailure { msg: "put cluster" })
    }

    /// Switch the shard leadership and return the new shard info.
    pub async fn switch_shard_leader(
        &self,
        shard_id: ShardId,
        expect_version: ShardVersion,
        node: String,
    ) -> Result<ShardInfo> {
        let mut inner = self.inner.write().await;
        let (cluster_view, shard_view) =
            inner
                .topology
                .switch_shard_leader(shard_id, expect_version, node)?;
        self.meta_storage
            .put_cluster_with_shard_views(&inner.cluster, &cluster_view, &[shard_view.clone()])
            .await
            .context(MetaStorageFailure {
                msg: "put cluster with shard views",
            })?;

        Ok(ShardInfo {
            id: shard_id,
            role: ShardRole::Leader,
            version: shard_view.version,
            status: ShardStatus::Unknown,
        })
    }

    /// Move tables of a shard out into a freshly allocated shard opened on
    /// `target_node`, returning the new shard info.
    pub async fn split_shard(
        &self,
        shard_id: ShardId,
        expect_version: ShardVersion,
        new_shard_id: ShardId,
        table_ids: &[TableId],
        target_node: String,
    ) -> Result<ShardInfo> {
        let mut inner = self.inner.write().await;
        let (cluster_view, old_view, new_view) = inner.topology.split_shard(
            shard_id,
            expect_version,
            new_shard_id,
            table_ids,
            target_node,
        )?;
        self.meta_storage
            .put_cluster_with_shard_views(
                &inner.cluster,
                &cluster_view,
                &[old_view, new_view.clone()],
            )
            .await
            .context(MetaStorageFailure {
                msg: "put cluster with shard views",
            })?;

        Ok(ShardInfo {
            id: new_shard_id,
            role: ShardRole::Leader,
            version: new_view.version,
            status: ShardStatus::Unknown,
        })
    }

    pub async fn alloc_shard_id(&self) -> Result<ShardId> {
        let meta_storage = self.meta_storage.clone();
        let cluster_id = self.cluster_id;
        let shard_id = self
            .shard_id_alloc
            .alloc_id(move |max_id| async move {
                meta_storage
                    .put_max_id(cluster_id, SHARD_ID_NAME, max_id)
                    .await
                    .box_err()
            })
            .await
            .context(AllocId { msg: "shard id" })?;
        Ok(shard_id as ShardId)
    }

    // Reads assembled from the cache.

    fn assemble_shard_info(inner: &Inner, shard_id: ShardId) -> Option<ShardInfo> {
        let shard_view = inner.topology.shard_view(shard_id)?;
        let binding = inner.topology.shard_node(shard_id);
        let status = binding
            .and_then(|binding| inner.nodes.get(&binding.node))
            .and_then(|node| {
                node.shard_infos
                    .iter()
                    .find(|info| info.id == shard_id)
                    .map(|info| info.status)
            })
            .unwrap_or(ShardStatus::Unknown);

        Some(ShardInfo {
            id: shard_id,
            role: binding.map(|b| b.role).unwrap_or_default(),
            version: shard_view.version,
            status,
        })
    }

    pub async fn get_shard_tables(
        &self,
        shard_ids: &[ShardId],
    ) -> HashMap<ShardId, ShardTables> {
        let inner = self.inner.read().await;
        let mut result = HashMap::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            let shard_view = match inner.topology.shard_view(*shard_id) {
                Some(view) => view.clone(),
                None => continue,
            };
            let shard_info = match Self::assemble_shard_info(&inner, *shard_id) {
                Some(info) => info,
                None => continue,
            };
            let tables = inner.tables.table_infos_by_ids(&shard_view.table_ids);
            result.insert(*shard_id, ShardTables { shard_info, tables });
        }
        result
    }

    pub async fn route_tables(
        &self,
        schema_name: &str,
        table_names: &[String],
    ) -> Result<RouteTablesResult> {
        let inner = self.inner.read().await;
        let mut entries = HashMap::with_capacity(table_names.len());
        for table_name in table_names {
            let table = match inner.tables.find_table(schema_name, table_name) {
                Some(table) => table,
                None => continue,
            };
            let shard_id = match inner.topology.table_shard(table.id) {
                Some(shard_id) => shard_id,
                None => continue,
            };
            let binding = match inner.topology.shard_node(shard_id) {
                Some(binding) => binding.clone(),
                None => continue,
            };
            let shard_info = match Self::assemble_shard_info(&inner, shard_id) {
                Some(info) => info,
                None => continue,
            };
            entries.insert(
                table_name.clone(),
                RouteEntry {
                    table_info: TableInfo::new(table.clone(), schema_name.to_string()),
                    node_shards: vec![NodeShard {
                        endpoint: binding.node,
                        shard_info,
                    }],
                },
            );
        }

        Ok(RouteTablesResult {
            cluster_view_version: inner.topology.cluster_view().version,
            entries,
        })
    }

    pub async fn get_node_shards(&self) -> GetNodeShardsResult {
        let inner = self.inner.read().await;
        let bindings = inner.topology.cluster_view().shard_nodes.clone();
        let node_shards = bindings
            .into_iter()
            .filter_map(|binding| {
                Self::assemble_shard_info(&inner, binding.shard_id).map(|shard_info| NodeShard {
                    endpoint: binding.node,
                    shard_info,
                })
            })
            .collect();

        GetNodeShardsResult {
            cluster_topology_version: inner.topology.cluster_view().version,
            node_shards,
        }
    }

    // Sticky table assignments of the persistent shard picker.

    pub async fn get_table_assignment(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<ShardId>> {
        self.meta_storage
            .get_assignment(self.cluster_id, schema_name, table_name)
            .await
            .context(MetaStorageFailure { msg: "get assignment" })
    }

    pub async fn put_table_assignment(
        &self,
        schema_name: &str,
        table_name: &str,
        shard_id: ShardId,
    ) -> Result<()> {
        self.meta_storage
            .put_assignment(self.cluster_id, schema_name, table_name, shard_id)
            .await
            .context(MetaStorageFailure { msg: "put assignment" })
    }

    pub async fn delete_table_assignment(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<()> {
        self.meta_storage
            .delete_assignment(self.cluster_id, schema_name, table_name)
            .await
            .context(MetaStorageFailure {
                msg: "delete assignment",
            })
    }

}

#[cfg(test)]
mod tests {
    use common_types::node::{Node, NodeState, NodeStats};
    use meta_storage::{kv::MemoryKv, meta::MetaStorage};

    use super::*;

    async fn test_metadata(node_count: u32, shard_total: u32) -> ClusterMetadata {
        let kv = Arc::new(MemoryKv::default());
        let meta_storage =
            Arc::new(MetaStorage::new(kv, "/ceresmeta".to_string()).unwrap());
        let cluster = Cluster {
            id: 1,
            name: "defaultCluster".to_string(),
            shard_total,
            node_count,
            topology_type: TopologyType::Static,
            procedure_executing_batch_size: 8,
            created_at: current_ms(),
        };
        let view = Default::default();
        meta_storage.create_cluster(&cluster, &view).await.unwrap();
        let shard_views: Vec<_> = (0..shard_total)
            .map(common_types::shard::ShardView::new)
            .collect();
        meta_storage.put_shard_views(1, &shard_views).await.unwrap();

        ClusterMetadata::load(meta_storage, cluster, 100).await.unwrap()
    }

    fn heartbeat(name: &str) -> RegisteredNode {
        RegisteredNode {
            node: Node {
                node_name: name.to_string(),
                node_stats: NodeStats {
                    lease: 10,
                    ..Default::default()
                },
                last_touch_time: current_ms(),
                state: NodeState::Online,
            },
            shard_infos: vec![],
        }
    }

    #[tokio::test]
    async fn test_register_node_drives_state() {
        let metadata = test_metadata(2, 8).await;
        assert_eq!(metadata.state().await, ClusterState::Empty);

        metadata.register_node(heartbeat("n1")).await.unwrap();
        assert_eq!(metadata.state().await, ClusterState::Empty);

        metadata.register_node(heartbeat("n2")).await.unwrap();
        assert_eq!(metadata.state().await, ClusterState::Prepare);
    }

    #[tokio::test]
    async fn test_create_table_metadata_is_idempotent() {
        let metadata = test_metadata(1, 4).await;

        let req = CreateTableMetadataRequest {
            schema_name: "public".to_string(),
            table_name: "t1".to_string(),
            partition_info: None,
        };
        let table = metadata.create_table_metadata(req.clone()).await.unwrap();
        let again = metadata.create_table_metadata(req).await.unwrap();
        assert_eq!(table, again);

        let found = metadata.get_table("public", "t1").await.unwrap().unwrap();
        assert_eq!(found.id, table.id);
    }

    #[tokio::test]
    async fn test_alloc_shard_id_starts_behind_static_range() {
        let metadata = test_metadata(1, 8).await;
        assert_eq!(metadata.alloc_shard_id().await.unwrap(), 8);
        assert_eq!(metadata.alloc_shard_id().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_add_and_remove_table_topology() {
        let metadata = test_metadata(1, 2).await;
        let table = metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                partition_info: None,
            })
            .await
            .unwrap();

        metadata
            .add_table_topology(
                ShardVersionUpdate {
                    shard_id: 0,
                    prev_version: 0,
                    latest_version: 1,
                },
                table.clone(),
            )
            .await
            .unwrap();
        assert_eq!(metadata.get_table_shard(table.id).await, Some(0));

        metadata
            .remove_table_topology(
                ShardVersionUpdate {
                    shard_id: 0,
                    prev_version: 1,
                    latest_version: 2,
                },
                table.id,
            )
            .await
            .unwrap();
        assert_eq!(metadata.get_table_shard(table.id).await, None);
    }

    #[tokio::test]
    async fn test_route_tables() {
        let metadata = test_metadata(1, 2).await;
        let table = metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                partition_info: None,
            })
            .await
            .unwrap();
        metadata
            .switch_shard_leader(0, 0, "n1".to_string())
            .await
            .unwrap();
        metadata
            .add_table_topology(
                ShardVersionUpdate {
                    shard_id: 0,
                    prev_version: 1,
                    latest_version: 2,
                },
                table,
            )
            .await
            .unwrap();

        let result = metadata
            .route_tables("public", &["t1".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(result.entries.len(), 1);
        let entry = &result.entries["t1"];
        assert_eq!(entry.node_shards[0].endpoint, "n1");
        assert_eq!(entry.node_shards[0].shard_info.version, 2);
    }
}
