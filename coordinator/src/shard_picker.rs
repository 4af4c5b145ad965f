// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Target shard selection for new tables.

use cluster::{metadata::ClusterMetadataRef, types::Snapshot};
use common_types::shard::ShardNode;
use log::info;
use snafu::{ensure, ResultExt};

use crate::{ClusterFailure, NodeNumberNotEnough, Result};

/// Pick the least loaded assigned shards, ties broken by shard id.
pub struct LeastTableShardPicker;

impl LeastTableShardPicker {
    pub fn pick_shards(snapshot: &Snapshot, expect_count: usize) -> Result<Vec<ShardNode>> {
        let assigned = &snapshot.topology.cluster_view.shard_nodes;
        ensure!(
            !assigned.is_empty(),
            NodeNumberNotEnough {
                msg: "no shard is assigned to any node",
            }
        );

        let mut candidates = assigned.clone();
        candidates.sort_by_key(|binding| {
            (
                snapshot.topology.table_count(binding.shard_id),
                binding.shard_id,
            )
        });

        // Round robin when more shards are wanted than exist.
        let picked = (0..expect_count)
            .map(|idx| candidates[idx % candidates.len()].clone())
            .collect();
        Ok(picked)
    }
}

/// Shard picker remembering its choice, so a retried create lands on the
/// same shard.
///
/// A recorded assignment is validated against the current topology before
/// reuse; a stale record (the shard moved away or disappeared) is dropped
/// and the table is re-picked.
pub struct PersistShardPicker {
    metadata: ClusterMetadataRef,
}

impl PersistShardPicker {
    pub fn new(metadata: ClusterMetadataRef) -> Self {
        Self { metadata }
    }

    pub async fn pick(
        &self,
        snapshot: &Snapshot,
        schema_name: &str,
        table_name: &str,
    ) -> Result<ShardNode> {
        if let Some(shard_id) = self
            .metadata
            .get_table_assignment(schema_name, table_name)
            .await
            .context(ClusterFailure)?
        {
            match snapshot.topology.shard_node(shard_id) {
                Some(binding) => return Ok(binding.clone()),
                None => {
                    info!(
                        "Drop stale table assignment, table:{schema_name}.{table_name}, shard_id:{shard_id}"
                    );
                    self.metadata
                        .delete_table_assignment(schema_name, table_name)
                        .await
                        .context(ClusterFailure)?;
                }
            }
        }

        let picked = LeastTableShardPicker::pick_shards(snapshot, 1)?
            .pop()
            .expect("one shard was requested");
        self.metadata
            .put_table_assignment(schema_name, table_name, picked.shard_id)
            .await
            .context(ClusterFailure)?;
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use cluster::topology::Topology;
    use common_types::{
        cluster::{Cluster, ClusterState, ClusterView, TopologyType},
        shard::{ShardRole, ShardView},
    };

    use super::*;
    use crate::Error;

    fn snapshot_with_tables(table_counts: &[(u32, usize)]) -> Snapshot {
        let shard_nodes = table_counts
            .iter()
            .map(|(shard_id, _)| ShardNode {
                shard_id: *shard_id,
                node: format!("n{}", shard_id % 2 + 1),
                role: ShardRole::Leader,
            })
            .collect();
        let shard_views = table_counts
            .iter()
            .map(|(shard_id, tables)| {
                (
                    *shard_id,
                    ShardView {
                        shard_id: *shard_id,
                        version: 1,
                        table_ids: (0..*tables).map(|idx| idx as u64 + 1000).collect(),
                    },
                )
            })
            .collect();

        Snapshot {
            cluster: Cluster {
                id: 1,
                name: "defaultCluster".to_string(),
                shard_total: table_counts.len() as u32,
                node_count: 2,
                topology_type: TopologyType::Static,
                procedure_executing_batch_size: 8,
                created_at: 0,
            },
            topology: Topology {
                cluster_view: ClusterView {
                    state: ClusterState::Stable,
                    version: 1,
                    shard_nodes,
                },
                shard_views,
            },
            registered_nodes: vec![],
        }
    }

    #[test]
    fn test_pick_least_loaded() {
        // Shard 1 has fewer tables, shard 0 ties with shard 2 by count.
        let snapshot = snapshot_with_tables(&[(0, 2), (1, 1), (2, 2)]);

        let picked = LeastTableShardPicker::pick_shards(&snapshot, 1).unwrap();
        assert_eq!(picked[0].shard_id, 1);

        // Round robin beyond the shard count.
        let picked = LeastTableShardPicker::pick_shards(&snapshot, 5).unwrap();
        let ids: Vec<_> = picked.iter().map(|node| node.shard_id).collect();
        assert_eq!(ids, vec![1, 0, 2, 1, 0]);
    }

    #[test]
    fn test_pick_without_assignment() {
        let snapshot = snapshot_with_tables(&[]);
        let err = LeastTableShardPicker::pick_shards(&snapshot, 1).unwrap_err();
        assert!(matches!(err, Error::NodeNumberNotEnough { .. }));
    }
}
