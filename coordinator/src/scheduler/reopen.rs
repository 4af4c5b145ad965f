// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Scheduler re-opening shards stuck in the partial open status.

use async_trait::async_trait;
use cluster::{metadata::current_ms, types::Snapshot};
use common_types::{cluster::ClusterState, shard::ShardStatus};

use super::{ScheduleResult, Scheduler};
use crate::{factory::FactoryRef, Result};

pub struct ReopenShardScheduler {
    factory: FactoryRef,
}

impl ReopenShardScheduler {
    pub fn new(factory: FactoryRef) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl Scheduler for ReopenShardScheduler {
    fn name(&self) -> &str {
        "reopen_scheduler"
    }

    async fn schedule(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        if snapshot.topology.cluster_view.state != ClusterState::Stable {
            return Ok(ScheduleResult::nothing("cluster is not stable"));
        }

        let now = current_ms();
        for node in &snapshot.registered_nodes {
            if !node.is_online(now) {
                continue;
            }
            for info in &node.shard_infos {
                if info.status != ShardStatus::PartialOpen {
                    continue;
                }
                // Only the recorded owner may re-open the shard.
                match snapshot.topology.shard_node(info.id) {
                    Some(binding) if binding.node == node.node.node_name => {}
                    _ => continue,
                }

                let reason = format!(
                    "reopen partial open shard {} on node {}",
                    info.id, node.node.node_name
                );
                let (procedure, _) = self
                    .factory
                    .transfer_leader_procedure(
                        info.id,
                        node.node.node_name.clone(),
                        Some(node.node.node_name.clone()),
                    )
                    .await?;
                return Ok(ScheduleResult::with_procedure(procedure, reason));
            }
        }

        Ok(ScheduleResult::nothing("no partial open shard"))
    }
}
