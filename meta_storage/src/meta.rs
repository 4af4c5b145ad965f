// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Typed record storage over a [`KvBackend`].
//!
//! Records are stored as JSON values. The cluster record and its view are
//! kept in one key so `(version, shard_nodes)` always changes atomically.

use std::sync::Arc;

use common_types::{
    cluster::{Cluster, ClusterId, ClusterView},
    node::RegisteredNode,
    schema::Schema,
    shard::{ShardId, ShardView},
    table::{Table, TableId},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{ensure, ResultExt};

use crate::{
    keys,
    kv::{KvBackend, KvBackendRef},
    DecodeRecord, EncodeRecord, InvalidArguments, RecordAlreadyExists, Result,
};

#[derive(Debug, Serialize, Deserialize)]
struct ClusterMetaRecord {
    cluster: Cluster,
    view: ClusterView,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableAssignmentRecord {
    shard_id: ShardId,
}

pub struct MetaStorage {
    kv: KvBackendRef,
    root_path: String,
}

impl std::fmt::Debug for MetaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStorage")
            .field("root_path", &self.root_path)
            .finish()
    }
}

pub type MetaStorageRef = Arc<MetaStorage>;

impl MetaStorage {
    pub fn new(kv: KvBackendRef, root_path: String) -> Result<Self> {
        ensure!(
            root_path.starts_with('/'),
            InvalidArguments {
                msg: "root_path is required to start with /",
            }
        );

        Ok(Self { kv, root_path })
    }

    #[inline]
    pub fn kv(&self) -> KvBackendRef {
        self.kv.clone()
    }

    #[inline]
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    fn encode<T: Serialize>(key: &str, record: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context(EncodeRecord { key })
    }

    fn decode<T: DeserializeOwned>(key: &str, value: &[u8]) -> Result<T> {
        serde_json::from_slice(value).context(DecodeRecord { key })
    }

    async fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(value) => Ok(Some(Self::decode(key, &value)?)),
            None => Ok(None),
        }
    }

    async fn list_records<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let kvs = self.kv.scan_prefix(prefix).await?;
        let mut records = Vec::with_capacity(kvs.len());
        for (key, value) in kvs {
            records.push(Self::decode(&key, &value)?);
        }
        Ok(records)
    }

    // Cluster records.

    /// Create the cluster record, failing if it already exists.
    pub async fn create_cluster(&self, cluster: &Cluster, view: &ClusterView) -> Result<()> {
        let key = keys::cluster_meta_key(&self.root_path, cluster.id);
        let record = ClusterMetaRecord {
            cluster: cluster.clone(),
            view: view.clone(),
        };
        let created = self
            .kv
            .compare_and_put(&key, None, Self::encode(&key, &record)?)
            .await?;
        ensure!(created, RecordAlreadyExists { key });
        Ok(())
    }

    pub async fn put_cluster(&self, cluster: &Cluster, view: &ClusterView) -> Result<()> {
        let key = keys::cluster_meta_key(&self.root_path, cluster.id);
        let record = ClusterMetaRecord {
            cluster: cluster.clone(),
            view: view.clone(),
        };
        self.kv.put(&key, Self::encode(&key, &record)?).await
    }

    pub async fn get_cluster(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Option<(Cluster, ClusterView)>> {
        let key = keys::cluster_meta_key(&self.root_path, cluster_id);
        let record: Option<ClusterMetaRecord> = self.get_record(&key).await?;
        Ok(record.map(|r| (r.cluster, r.view)))
    }

    pub async fn list_clusters(&self) -> Result<Vec<(Cluster, ClusterView)>> {
        let prefix = keys::clusters_prefix(&self.root_path);
        let kvs = self.kv.scan_prefix(&prefix).await?;
        let mut clusters = Vec::new();
        for (key, value) in kvs {
            if !key.ends_with("/meta") {
                continue;
            }
            let record: ClusterMetaRecord = Self::decode(&key, &value)?;
            clusters.push((record.cluster, record.view));
        }
        clusters.sort_by_key(|(cluster, _)| cluster.id);
        Ok(clusters)
    }

    /// Persist the cluster record together with some shard views in one
    /// transaction, for mutations touching both sides (leader switch, split).
    pub async fn put_cluster_with_shard_views(
        &self,
        cluster: &Cluster,
        view: &ClusterView,
        shard_views: &[ShardView],
    ) -> Result<()> {
        let meta_key = keys::cluster_meta_key(&self.root_path, cluster.id);
        let record = ClusterMetaRecord {
            cluster: cluster.clone(),
            view: view.clone(),
        };
        let mut kvs = vec![(meta_key.clone(), Self::encode(&meta_key, &record)?)];
        for shard_view in shard_views {
            let key = keys::shard_view_key(&self.root_path, cluster.id, shard_view.shard_id);
            let value = Self::encode(&key, shard_view)?;
            kvs.push((key, value));
        }
        self.kv.txn_put_all(kvs).await
    }

    // Schema records.

    pub async fn put_schema(&self, cluster_id: ClusterId, schema: &Schema) -> Result<()> {
        let key = keys::schema_key(&self.root_path, cluster_id, schema.id);
        self.kv.put(&key, Self::encode(&key, schema)?).await
    }

    pub async fn list_schemas(&self, cluster_id: ClusterId) -> Result<Vec<Schema>> {
        self.list_records(&keys::schema_prefix(&self.root_path, cluster_id))
            .await
    }

    // Table records.

    pub async fn put_table(&self, cluster_id: ClusterId, table: &Table) -> Result<()> {
        let key = keys::table_key(&self.root_path, cluster_id, table.id);
        self.kv.put(&key, Self::encode(&key, table)?).await
    }

    pub async fn delete_table(&self, cluster_id: ClusterId, table_id: TableId) -> Result<()> {
        self.kv
            .delete(&keys::table_key(&self.root_path, cluster_id, table_id))
            .await
    }

    pub async fn list_tables(&self, cluster_id: ClusterId) -> Result<Vec<Table>> {
        self.list_records(&keys::table_prefix(&self.root_path, cluster_id))
            .await
    }

    // Shard view records.

    pub async fn put_shard_view(&self, cluster_id: ClusterId, view: &ShardView) -> Result<()> {
        let key = keys::shard_view_key(&self.root_path, cluster_id, view.shard_id);
        self.kv.put(&key, Self::encode(&key, view)?).await
    }

    /// Persist multiple shard views in one transaction.
    pub async fn put_shard_views(
        &self,
        cluster_id: ClusterId,
        views: &[ShardView],
    ) -> Result<()> {
        let mut kvs = Vec::with_capacity(views.len());
        for view in views {
            let key = keys::shard_view_key(&self.root_path, cluster_id, view.shard_id);
            let value = Self::encode(&key, view)?;
            kvs.push((key, value));
        }
        self.kv.txn_put_all(kvs).await
    }

    pub async fn list_shard_views(&self, cluster_id: ClusterId) -> Result<Vec<ShardView>> {
        self.list_records(&keys::shard_view_prefix(&self.root_path, cluster_id))
            .await
    }

    pub async fn delete_shard_view(
        &self,
        cluster_id: ClusterId,
        shard_id: ShardId,
    ) -> Result<()> {
        self.kv
            .delete(&keys::shard_view_key(&self.root_path, cluster_id, shard_id))
            .await
    }

    // Node records.

    pub async fn put_node(&self, cluster_id: ClusterId, node: &RegisteredNode) -> Result<()> {
        let key = keys::node_key(&self.root_path, cluster_id, &node.node.node_name);
        self.kv.put(&key, Self::encode(&key, node)?).await
    }

    pub async fn list_nodes(&self, cluster_id: ClusterId) -> Result<Vec<RegisteredNode>> {
        self.list_records(&keys::node_prefix(&self.root_path, cluster_id))
            .await
    }

    // Sticky table assignment records.

    pub async fn get_assignment(
        &self,
        cluster_id: ClusterId,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<ShardId>> {
        let key = keys::assignment_key(&self.root_path, cluster_id, schema_name, table_name);
        let record: Option<TableAssignmentRecord> = self.get_record(&key).await?;
        Ok(record.map(|r| r.shard_id))
    }

    pub async fn put_assignment(
        &self,
        cluster_id: ClusterId,
        schema_name: &str,
        table_name: &str,
        shard_id: ShardId,
    ) -> Result<()> {
        let key = keys::assignment_key(&self.root_path, cluster_id, schema_name, table_name);
        let record = TableAssignmentRecord { shard_id };
        self.kv.put(&key, Self::encode(&key, &record)?).await
    }

    pub async fn delete_assignment(
        &self,
        cluster_id: ClusterId,
        schema_name: &str,
        table_name: &str,
    ) -> Result<()> {
        self.kv
            .delete(&keys::assignment_key(
                &self.root_path,
                cluster_id,
                schema_name,
                table_name,
            ))
            .await
    }

    // Id allocator watermarks.

    pub async fn get_max_id(&self, cluster_id: ClusterId, name: &str) -> Result<Option<u64>> {
        let key = keys::cluster_id_alloc_key(&self.root_path, cluster_id, name);
        self.get_record(&key).await
    }

    pub async fn put_max_id(&self, cluster_id: ClusterId, name: &str, max_id: u64) -> Result<()> {
        let key = keys::cluster_id_alloc_key(&self.root_path, cluster_id, name);
        self.kv.put(&key, Self::encode(&key, &max_id)?).await
    }

    pub async fn get_root_max_id(&self, name: &str) -> Result<Option<u64>> {
        let key = keys::root_id_alloc_key(&self.root_path, name);
        self.get_record(&key).await
    }

    pub async fn put_root_max_id(&self, name: &str, max_id: u64) -> Result<()> {
        let key = keys::root_id_alloc_key(&self.root_path, name);
        self.kv.put(&key, Self::encode(&key, &max_id)?).await
    }
}

#[cfg(test)]
mod tests {
    use common_types::{
        cluster::{ClusterState, TopologyType},
        node::{Node, NodeState, NodeStats},
    };

    use super::*;
    use crate::kv::MemoryKv;

    fn new_storage() -> MetaStorage {
        MetaStorage::new(Arc::new(MemoryKv::default()), "/ceresmeta".to_string()).unwrap()
    }

    fn test_cluster(id: ClusterId) -> (Cluster, ClusterView) {
        let cluster = Cluster {
            id,
            name: format!("cluster{id}"),
            shard_total: 4,
            node_count: 2,
            topology_type: TopologyType::Static,
            procedure_executing_batch_size: 8,
            created_at: 1,
        };
        let view = ClusterView {
            state: ClusterState::Empty,
            version: 0,
            shard_nodes: vec![],
        };
        (cluster, view)
    }

    #[tokio::test]
    async fn test_cluster_record_roundtrip() {
        let storage = new_storage();
        let (cluster, view) = test_cluster(1);

        storage.create_cluster(&cluster, &view).await.unwrap();
        // Creating twice must fail.
        assert!(storage.create_cluster(&cluster, &view).await.is_err());

        let (got_cluster, got_view) = storage.get_cluster(1).await.unwrap().unwrap();
        assert_eq!(got_cluster, cluster);
        assert_eq!(got_view, view);

        let (other, other_view) = test_cluster(2);
        storage.create_cluster(&other, &other_view).await.unwrap();
        let clusters = storage.list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].0.id, 1);
        assert_eq!(clusters[1].0.id, 2);
    }

    #[tokio::test]
    async fn test_table_and_shard_view_records() {
        let storage = new_storage();

        let table = Table {
            id: 11,
            name: "t1".to_string(),
            schema_id: 1,
            created_at: 1,
            partition_info: None,
        };
        storage.put_table(1, &table).await.unwrap();
        assert_eq!(storage.list_tables(1).await.unwrap(), vec![table.clone()]);
        storage.delete_table(1, table.id).await.unwrap();
        assert!(storage.list_tables(1).await.unwrap().is_empty());

        let views = vec![ShardView::new(0), ShardView::new(1)];
        storage.put_shard_views(1, &views).await.unwrap();
        assert_eq!(storage.list_shard_views(1).await.unwrap(), views);
    }

    #[tokio::test]
    async fn test_assignment_and_node_records() {
        let storage = new_storage();

        storage.put_assignment(1, "public", "t1", 3).await.unwrap();
        assert_eq!(
            storage.get_assignment(1, "public", "t1").await.unwrap(),
            Some(3)
        );
        storage.delete_assignment(1, "public", "t1").await.unwrap();
        assert_eq!(storage.get_assignment(1, "public", "t1").await.unwrap(), None);

        let node = RegisteredNode {
            node: Node {
                node_name: "127.0.0.1:8831".to_string(),
                node_stats: NodeStats {
                    lease: 10,
                    zone: "default".to_string(),
                    node_version: "1.2.2".to_string(),
                },
                last_touch_time: 100,
                state: NodeState::Online,
            },
            shard_infos: vec![],
        };
        storage.put_node(1, &node).await.unwrap();
        assert_eq!(storage.list_nodes(1).await.unwrap(), vec![node]);
    }
}
