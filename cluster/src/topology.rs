// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! In-memory view of one cluster topology with shard version fencing.

use std::collections::{BTreeMap, HashMap};

use common_types::{
    cluster::{ClusterState, ClusterView},
    shard::{ShardId, ShardNode, ShardRole, ShardView},
    table::TableId,
};
use snafu::{ensure, OptionExt};

use crate::{
    types::ShardVersionUpdate, InvalidArguments, Result, ShardNotFound, ShardVersionMismatch,
    TableAlreadyExists, TableNotFound,
};

/// A consistent copy of the cluster view and every shard view.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub cluster_view: ClusterView,
    pub shard_views: BTreeMap<ShardId, ShardView>,
}

impl Topology {
    pub fn shard_view(&self, shard_id: ShardId) -> Option<&ShardView> {
        self.shard_views.get(&shard_id)
    }

    /// Find the node binding of a shard, `shard_nodes` is sorted by shard id.
    pub fn shard_node(&self, shard_id: ShardId) -> Option<&ShardNode> {
        self.cluster_view
            .shard_nodes
            .binary_search_by_key(&shard_id, |node| node.shard_id)
            .ok()
            .map(|idx| &self.cluster_view.shard_nodes[idx])
    }

    pub fn table_count(&self, shard_id: ShardId) -> usize {
        self.shard_views
            .get(&shard_id)
            .map(|view| view.table_ids.len())
            .unwrap_or(0)
    }

    /// Shards of `0..shard_total` without any node binding.
    pub fn unassigned_shard_ids(&self, shard_total: u32) -> Vec<ShardId> {
        (0..shard_total)
            .filter(|shard_id| self.shard_node(*shard_id).is_none())
            .collect()
    }
}

/// Owner of the in-memory topology, mutated only under the cluster metadata
/// writer lock.
///
/// Invariants kept here:
/// - a table id appears in exactly one shard view;
/// - at most one shard node binding per shard;
/// - every committed shard mutation makes the shard version strictly greater.
#[derive(Debug, Default)]
pub struct TopologyManager {
    cluster_view: ClusterView,
    shard_views: BTreeMap<ShardId, ShardView>,
    table_to_shard: HashMap<TableId, ShardId>,
}

impl TopologyManager {
    pub fn load(cluster_view: ClusterView, shard_views: Vec<ShardView>) -> Result<Self> {
        let mut manager = TopologyManager {
            cluster_view,
            ..Default::default()
        };
        manager
            .cluster_view
            .shard_nodes
            .sort_by_key(|node| node.shard_id);

        for view in shard_views {
            for table_id in &view.table_ids {
                let prev = manager.table_to_shard.insert(*table_id, view.shard_id);
                ensure!(
                    prev.is_none(),
                    InvalidArguments {
                        msg: format!(
                            "table resides in multiple shards, table_id:{table_id}, shards:[{}, {}]",
                            prev.unwrap(),
                            view.shard_id
                        ),
                    }
                );
            }
            manager.shard_views.insert(view.shard_id, view);
        }

        Ok(manager)
    }

    pub fn topology(&self) -> Topology {
        Topology {
            cluster_view: self.cluster_view.clone(),
            shard_views: self.shard_views.clone(),
        }
    }

    pub fn cluster_view(&self) -> &ClusterView {
        &self.cluster_view
    }

    pub fn shard_view(&self, shard_id: ShardId) -> Option<&ShardView> {
        self.shard_views.get(&shard_id)
    }

    pub fn table_shard(&self, table_id: TableId) -> Option<ShardId> {
        self.table_to_shard.get(&table_id).copied()
    }

    pub fn shard_node(&self, shard_id: ShardId) -> Option<&ShardNode> {
        self.cluster_view
            .shard_nodes
            .binary_search_by_key(&shard_id, |node| node.shard_id)
            .ok()
            .map(|idx| &self.cluster_view.shard_nodes[idx])
    }

    fn checked_shard_view(
        &mut self,
        shard_id: ShardId,
        expect_version: u64,
    ) -> Result<&mut ShardView> {
        let view = self
            .shard_views
            .get_mut(&shard_id)
            .with_context(|| ShardNotFound {
                msg: format!("shard not found, shard_id:{shard_id}"),
            })?;
        ensure!(
            view.version == expect_version,
            ShardVersionMismatch {
                shard_id,
                expect_version,
                curr_version: view.version,
            }
        );
        Ok(view)
    }

    /// Add a table to a shard, committing at `update.latest_version`.
    pub fn add_table_to_shard(
        &mut self,
        update: &ShardVersionUpdate,
        table_id: TableId,
    ) -> Result<ShardView> {
        ensure!(
            update.latest_version > update.prev_version,
            InvalidArguments {
                msg: format!(
                    "the committed version must grow, prev:{}, latest:{}",
                    update.prev_version, update.latest_version
                ),
            }
        );
        if let Some(shard_id) = self.table_to_shard.get(&table_id) {
            return TableAlreadyExists {
                msg: format!("table already on shard, table_id:{table_id}, shard_id:{shard_id}"),
            }
            .fail();
        }

        let latest_version = update.latest_version;
        let view = self.checked_shard_view(update.shard_id, update.prev_version)?;
        view.version = latest_version;
        view.table_ids.push(table_id);
        let view = view.clone();

        self.table_to_shard.insert(table_id, update.shard_id);
        Ok(view)
    }

    /// Remove a table from a shard, committing at `update.latest_version`.
    pub fn remove_table_from_shard(
        &mut self,
        update: &ShardVersionUpdate,
        table_id: TableId,
    ) -> Result<ShardView> {
        ensure!(
            update.latest_version > update.prev_version,
            InvalidArguments {
                msg: format!(
                    "the committed version must grow, prev:{}, latest:{}",
                    update.prev_version, update.latest_version
                ),
            }
        );

        let latest_version = update.latest_version;
        let view = self.checked_shard_view(update.shard_id, update.prev_version)?;
        let table_idx = view
            .table_ids
            .iter()
            .position(|id| *id == table_id)
            .with_context(|| TableNotFound {
                msg: format!(
                    "table not on shard, table_id:{table_id}, shard_id:{}",
                    update.shard_id
                ),
            })?;
        view.version = latest_version;
        view.table_ids.swap_remove(table_idx);
        let view = view.clone();

        self.table_to_shard.remove(&table_id);
        Ok(view)
    }

    /// Replace the whole cluster view, bumping its version.
    pub fn update_cluster_view(
        &mut self,
        state: ClusterState,
        mut shard_nodes: Vec<ShardNode>,
    ) -> Result<ClusterView> {
        shard_nodes.sort_by_key(|node| node.shard_id);
        let duplicated = shard_nodes
            .windows(2)
            .any(|pair| pair[0].shard_id == pair[1].shard_id);
        ensure!(
            !duplicated,
            InvalidArguments {
                msg: "one shard is bound to multiple nodes".to_string(),
            }
        );

        self.cluster_view = ClusterView {
            state,
            version: self.cluster_view.version + 1,
            shard_nodes,
        };
        Ok(self.cluster_view.clone())
    }

    /// Remove exactly the given bindings from the cluster view.
    pub fn drop_shard_nodes(&mut self, dropped: &[ShardNode]) -> ClusterView {
        self.cluster_view.shard_nodes.retain(|binding| {
            !dropped
                .iter()
                .any(|drop| drop.shard_id == binding.shard_id && drop.node == binding.node)
        });
        self.cluster_view.version += 1;
        self.cluster_view.clone()
    }

    /// Move the leadership of a shard to `node`: the shard version and the
    /// cluster view version both grow.
    pub fn switch_shard_leader(
        &mut self,
        shard_id: ShardId,
        expect_version: u64,
        node: String,
    ) -> Result<(ClusterView, ShardView)> {
        let view = self.checked_shard_view(shard_id, expect_version)?;
        view.version += 1;
        let shard_view = view.clone();

        let binding = ShardNode {
            shard_id,
            node,
            role: ShardRole::Leader,
        };
        match self
            .cluster_view
            .shard_nodes
            .binary_search_by_key(&shard_id, |node| node.shard_id)
        {
            Ok(idx) => self.cluster_view.shard_nodes[idx] = binding,
            Err(idx) => self.cluster_view.shard_nodes.insert(idx, binding),
        }
        self.cluster_view.version += 1;

        Ok((self.cluster_view.clone(), shard_view))
    }

    /// Split `table_ids` of a shard out into the empty `new_shard_id` opened
    /// on `target_node`.
    pub fn split_shard(
        &mut self,
        shard_id: ShardId,
        expect_version: u64,
        new_shard_id: ShardId,
        table_ids: &[TableId],
        target_node: String,
    ) -> Result<(ClusterView, ShardView, ShardView)> {
        ensure!(
            !self.shard_views.contains_key(&new_shard_id),
            InvalidArguments {
                msg: format!("the new shard already exists, shard_id:{new_shard_id}"),
            }
        );

        let old_view = self.checked_shard_view(shard_id, expect_version)?;
        for table_id in table_ids {
            ensure!(
                old_view.table_ids.contains(table_id),
                TableNotFound {
                    msg: format!(
                        "table to split is not on the shard, table_id:{table_id}, shard_id:{shard_id}"
                    ),
                }
            );
        }
        old_view.version += 1;
        old_view.table_ids.retain(|id| !table_ids.contains(id));
        let old_view = old_view.clone();

        let new_view = ShardView {
            shard_id: new_shard_id,
            version: 1,
            table_ids: table_ids.to_vec(),
        };
        self.shard_views.insert(new_shard_id, new_view.clone());
        for table_id in table_ids {
            self.table_to_shard.insert(*table_id, new_shard_id);
        }

        let binding = ShardNode {
            shard_id: new_shard_id,
            node: target_node,
            role: ShardRole::Leader,
        };
        match self
            .cluster_view
            .shard_nodes
            .binary_search_by_key(&new_shard_id, |node| node.shard_id)
        {
            Ok(idx) => self.cluster_view.shard_nodes[idx] = binding,
            Err(idx) => self.cluster_view.shard_nodes.insert(idx, binding),
        }
        self.cluster_view.version += 1;

        Ok((self.cluster_view.clone(), old_view, new_view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn manager_with_shards(count: u32) -> TopologyManager {
        let views = (0..count).map(ShardView::new).collect();
        TopologyManager::load(ClusterView::default(), views).unwrap()
    }

    #[test]
    fn test_version_fencing() {
        let mut manager = manager_with_shards(2);

        let update = ShardVersionUpdate {
            shard_id: 0,
            prev_version: 0,
            latest_version: 1,
        };
        let view = manager.add_table_to_shard(&update, 11).unwrap();
        assert_eq!(view.version, 1);
        assert_eq!(view.table_ids, vec![11]);

        // A stale mutation is fenced off.
        let stale = ShardVersionUpdate {
            shard_id: 0,
            prev_version: 0,
            latest_version: 2,
        };
        let err = manager.add_table_to_shard(&stale, 12).unwrap_err();
        assert!(matches!(err, Error::ShardVersionMismatch { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_table_in_exactly_one_shard() {
        let mut manager = manager_with_shards(2);

        let update = ShardVersionUpdate {
            shard_id: 0,
            prev_version: 0,
            latest_version: 1,
        };
        manager.add_table_to_shard(&update, 11).unwrap();

        // The same table cannot land on another shard.
        let other = ShardVersionUpdate {
            shard_id: 1,
            prev_version: 0,
            latest_version: 1,
        };
        assert!(matches!(
            manager.add_table_to_shard(&other, 11).unwrap_err(),
            Error::TableAlreadyExists { .. }
        ));

        let update = ShardVersionUpdate {
            shard_id: 0,
            prev_version: 1,
            latest_version: 2,
        };
        manager.remove_table_from_shard(&update, 11).unwrap();
        assert_eq!(manager.table_shard(11), None);
    }

    #[test]
    fn test_update_and_drop_shard_nodes() {
        let mut manager = manager_with_shards(2);

        let nodes = vec![
            ShardNode {
                shard_id: 1,
                node: "n2".to_string(),
                role: ShardRole::Leader,
            },
            ShardNode {
                shard_id: 0,
                node: "n1".to_string(),
                role: ShardRole::Leader,
            },
        ];
        let view = manager
            .update_cluster_view(ClusterState::Stable, nodes)
            .unwrap();
        assert_eq!(view.version, 1);
        // Sorted by shard id for binary search.
        assert_eq!(view.shard_nodes[0].shard_id, 0);

        // A duplicated binding is rejected.
        let duplicated = vec![
            ShardNode {
                shard_id: 0,
                node: "n1".to_string(),
                role: ShardRole::Leader,
            },
            ShardNode {
                shard_id: 0,
                node: "n2".to_string(),
                role: ShardRole::Leader,
            },
        ];
        assert!(manager
            .update_cluster_view(ClusterState::Stable, duplicated)
            .is_err());

        let view = manager.drop_shard_nodes(&[ShardNode {
            shard_id: 0,
            node: "n1".to_string(),
            role: ShardRole::Leader,
        }]);
        assert_eq!(view.version, 2);
        assert_eq!(view.shard_nodes.len(), 1);
        assert_eq!(view.shard_nodes[0].shard_id, 1);
    }

    #[test]
    fn test_switch_shard_leader() {
        let mut manager = manager_with_shards(1);

        let (cluster_view, shard_view) = manager
            .switch_shard_leader(0, 0, "n1".to_string())
            .unwrap();
        assert_eq!(shard_view.version, 1);
        assert_eq!(cluster_view.version, 1);
        assert_eq!(cluster_view.shard_nodes[0].node, "n1");

        let (cluster_view, shard_view) = manager
            .switch_shard_leader(0, 1, "n2".to_string())
            .unwrap();
        assert_eq!(shard_view.version, 2);
        assert_eq!(cluster_view.version, 2);
        assert_eq!(cluster_view.shard_nodes.len(), 1);
        assert_eq!(cluster_view.shard_nodes[0].node, "n2");
    }

    #[test]
    fn test_split_shard() {
        let mut manager = manager_with_shards(1);
        for (table_id, version) in [(11, 1), (12, 2)] {
            let update = ShardVersionUpdate {
                shard_id: 0,
                prev_version: version - 1,
                latest_version: version,
            };
            manager.add_table_to_shard(&update, table_id).unwrap();
        }
        manager
            .switch_shard_leader(0, 2, "n1".to_string())
            .unwrap();

        let (cluster_view, old_view, new_view) = manager
            .split_shard(0, 3, 8, &[12], "n1".to_string())
            .unwrap();
        assert_eq!(old_view.table_ids, vec![11]);
        assert_eq!(new_view.table_ids, vec![12]);
        assert_eq!(manager.table_shard(12), Some(8));
        assert_eq!(cluster_view.shard_nodes.len(), 2);
    }

    #[test]
    fn test_unassigned_shards() {
        let mut manager = manager_with_shards(4);
        manager
            .update_cluster_view(
                ClusterState::Prepare,
                vec![ShardNode {
                    shard_id: 2,
                    node: "n1".to_string(),
                    role: ShardRole::Leader,
                }],
            )
            .unwrap();

        let topology = manager.topology();
        assert_eq!(topology.unassigned_shard_ids(4), vec![0, 1, 3]);
        assert_eq!(topology.shard_node(2).unwrap().node, "n1");
        assert_eq!(topology.shard_node(0), None);
    }
}
