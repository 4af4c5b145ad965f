// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Scheduler of the dynamic topology, targeting an even spread of shards
//! across the online nodes while honoring the shard affinity rules.

use std::collections::HashMap;

use async_trait::async_trait;
use cluster::types::Snapshot;
use common_types::cluster::ClusterState;

use super::{online_node_names, AffinityRules, ScheduleResult, Scheduler};
use crate::{factory::FactoryRef, Result};

pub struct RebalancedShardScheduler {
    factory: FactoryRef,
    rules: AffinityRules,
}

impl RebalancedShardScheduler {
    pub fn new(factory: FactoryRef, rules: AffinityRules) -> Self {
        Self { factory, rules }
    }

    fn least_loaded<'a>(
        counts: &HashMap<&str, usize>,
        candidates: &'a [String],
    ) -> Option<&'a String> {
        candidates
            .iter()
            .min_by_key(|node| counts.get(node.as_str()).copied().unwrap_or(0))
    }

    async fn emit_transfer(
        &self,
        shard_id: common_types::shard::ShardId,
        old_leader: Option<String>,
        new_leader: String,
        reason: String,
    ) -> Result<ScheduleResult> {
        let (procedure, _) = self
            .factory
            .transfer_leader_procedure(shard_id, new_leader, old_leader)
            .await?;
        Ok(ScheduleResult::with_procedure(procedure, reason))
    }
}

#[async_trait]
impl Scheduler for RebalancedShardScheduler {
    fn name(&self) -> &str {
        "rebalanced_scheduler"
    }

    async fn schedule(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        if snapshot.topology.cluster_view.state != ClusterState::Stable {
            return Ok(ScheduleResult::nothing("cluster is not stable"));
        }

        let candidates = online_node_names(snapshot);
        if candidates.is_empty() {
            return Ok(ScheduleResult::nothing("no online node"));
        }

        let bindings = &snapshot.topology.cluster_view.shard_nodes;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for binding in bindings {
            *counts.entry(binding.node.as_str()).or_default() += 1;
        }

        // Enforce the affinity rules first, strongest priority wins.
        let mut rules = self.rules.list();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        for rule in rules {
            let binding = match snapshot.topology.shard_node(rule.shard_id) {
                Some(binding) => binding,
                None => continue,
            };
            if rule.preferred_nodes.iter().any(|node| *node == binding.node) {
                continue;
            }
            if let Some(target) = rule
                .preferred_nodes
                .iter()
                .find(|node| candidates.contains(*node))
            {
                return self
                    .emit_transfer(
                        rule.shard_id,
                        Some(binding.node.clone()),
                        target.clone(),
                        format!(
                            "move shard {} toward its affinity target {target}",
                            rule.shard_id
                        ),
                    )
                    .await;
            }
        }

        // Rescue shards bound to dead nodes.
        for binding in bindings {
            if candidates.iter().any(|node| *node == binding.node) {
                continue;
            }
            let target = match self.rules.get(binding.shard_id).and_then(|rule| {
                rule.preferred_nodes
                    .iter()
                    .find(|node| candidates.contains(*node))
                    .cloned()
            }) {
                Some(target) => target,
                None => match Self::least_loaded(&counts, &candidates) {
                    Some(target) => target.clone(),
                    None => continue,
                },
            };
            return self
                .emit_transfer(
                    binding.shard_id,
                    None,
                    target,
                    format!(
                        "move shard {} away from offline node {}",
                        binding.shard_id, binding.node
                    ),
                )
                .await;
        }

        // Even out the load: move one shard from the most loaded node to the
        // least loaded one.
        let average = (bindings.len() + candidates.len() - 1) / candidates.len();
        for binding in bindings {
            let count = counts.get(binding.node.as_str()).copied().unwrap_or(0);
            if count <= average {
                continue;
            }
            // Never move a shard pinned to its current node.
            if self.rules.is_pinned_to(binding.shard_id, &binding.node) {
                continue;
            }
            if let Some(target) = Self::least_loaded(&counts, &candidates) {
                let target_count = counts.get(target.as_str()).copied().unwrap_or(0);
                if *target != binding.node && target_count + 1 < count {
                    return self
                        .emit_transfer(
                            binding.shard_id,
                            Some(binding.node.clone()),
                            target.clone(),
                            format!(
                                "rebalance shard {} from {} to {target}",
                                binding.shard_id, binding.node
                            ),
                        )
                        .await;
                }
            }
        }

        Ok(ScheduleResult::nothing("shards are balanced"))
    }
}
