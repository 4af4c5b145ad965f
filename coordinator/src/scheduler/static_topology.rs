// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Scheduler of the static topology.
//!
//! In `Prepare` it assigns the unassigned shards across the registered nodes
//! with the consistent hash picker; in `Stable` it re-opens shards whose
//! owner is online but stopped reporting them.

use async_trait::async_trait;
use cluster::{metadata::current_ms, types::Snapshot};
use common_types::cluster::ClusterState;

use super::{online_node_names, ScheduleResult, Scheduler};
use crate::{
    factory::FactoryRef, node_picker::ConsistentHashNodePicker,
    procedure::transfer_leader::TransferLeaderParams, Result,
};

pub struct StaticTopologyScheduler {
    factory: FactoryRef,
    node_picker: ConsistentHashNodePicker,
}

impl StaticTopologyScheduler {
    pub fn new(factory: FactoryRef) -> Self {
        Self {
            factory,
            node_picker: ConsistentHashNodePicker::default(),
        }
    }

    async fn schedule_prepare(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        let unassigned = snapshot
            .topology
            .unassigned_shard_ids(snapshot.cluster.shard_total);
        if unassigned.is_empty() {
            return Ok(ScheduleResult::nothing("all shards are assigned"));
        }

        let candidates = online_node_names(snapshot);
        if candidates.is_empty() {
            return Ok(ScheduleResult::nothing("no online node"));
        }

        let batch_size = snapshot.cluster.procedure_executing_batch_size as usize;
        let transfers: Vec<_> = unassigned
            .into_iter()
            .take(batch_size)
            .filter_map(|shard_id| {
                self.node_picker
                    .pick_node(&candidates, shard_id)
                    .map(|node| TransferLeaderParams {
                        shard_id,
                        old_leader: None,
                        new_leader: node,
                    })
            })
            .collect();
        if transfers.is_empty() {
            return Ok(ScheduleResult::nothing("no transfer could be planned"));
        }

        let reason = format!("assign {} shards", transfers.len());
        let (procedure, _) = self
            .factory
            .batch_transfer_leader_procedure(transfers)
            .await?;
        Ok(ScheduleResult::with_procedure(procedure, reason))
    }

    async fn schedule_stable(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        let now = current_ms();
        for binding in &snapshot.topology.cluster_view.shard_nodes {
            let node = snapshot
                .registered_nodes
                .iter()
                .find(|node| node.node.node_name == binding.node);
            let node = match node {
                Some(node) if node.is_online(now) => node,
                _ => continue,
            };

            // The owner is alive but does not serve the shard, re-open it.
            let reported = node
                .shard_infos
                .iter()
                .any(|info| info.id == binding.shard_id);
            if !reported {
                let reason = format!(
                    "reopen shard {} on node {}",
                    binding.shard_id, binding.node
                );
                let (procedure, _) = self
                    .factory
                    .transfer_leader_procedure(
                        binding.shard_id,
                        binding.node.clone(),
                        Some(binding.node.clone()),
                    )
                    .await?;
                return Ok(ScheduleResult::with_procedure(procedure, reason));
            }
        }

        Ok(ScheduleResult::nothing("all assigned shards are served"))
    }
}

#[async_trait]
impl Scheduler for StaticTopologyScheduler {
    fn name(&self) -> &str {
        "static_scheduler"
    }

    async fn schedule(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        match snapshot.topology.cluster_view.state {
            ClusterState::Empty => Ok(ScheduleResult::nothing("cluster is empty")),
            ClusterState::Prepare => self.schedule_prepare(snapshot).await,
            ClusterState::Stable => self.schedule_stable(snapshot).await,
        }
    }
}
