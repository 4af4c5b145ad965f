// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Schedulers diff a cluster snapshot against the target topology and emit
//! procedures closing the gap.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use cluster::{metadata::current_ms, types::Snapshot};
use common_types::shard::ShardId;
use serde::{Deserialize, Serialize};

use crate::{procedure::ProcedureRef, Result};

pub mod manager;
pub mod rebalanced;
pub mod reopen;
pub mod static_topology;

pub struct ScheduleResult {
    pub procedure: Option<ProcedureRef>,
    pub reason: String,
}

impl ScheduleResult {
    pub fn nothing(reason: impl Into<String>) -> Self {
        Self {
            procedure: None,
            reason: reason.into(),
        }
    }

    pub fn with_procedure(procedure: ProcedureRef, reason: impl Into<String>) -> Self {
        Self {
            procedure: Some(procedure),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect the snapshot and emit at most one procedure; schedulers never
    /// mutate live state themselves.
    async fn schedule(&self, snapshot: &Snapshot) -> Result<ScheduleResult>;
}

pub type SchedulerRef = Arc<dyn Scheduler>;

/// A rule pinning a shard to a set of preferred nodes; higher priority rules
/// are enforced first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardAffinityRule {
    pub shard_id: ShardId,
    pub preferred_nodes: Vec<String>,
    pub priority: u32,
}

/// Shared set of affinity rules, consulted by the dynamic schedulers.
#[derive(Clone, Default)]
pub struct AffinityRules {
    inner: Arc<RwLock<HashMap<ShardId, ShardAffinityRule>>>,
}

impl AffinityRules {
    pub fn load(&self, rules: Vec<ShardAffinityRule>) {
        let mut inner = self.inner.write().unwrap();
        inner.clear();
        for rule in rules {
            inner.insert(rule.shard_id, rule);
        }
    }

    pub fn insert(&self, rule: ShardAffinityRule) {
        self.inner.write().unwrap().insert(rule.shard_id, rule);
    }

    pub fn remove(&self, shard_id: ShardId) -> Option<ShardAffinityRule> {
        self.inner.write().unwrap().remove(&shard_id)
    }

    pub fn get(&self, shard_id: ShardId) -> Option<ShardAffinityRule> {
        self.inner.read().unwrap().get(&shard_id).cloned()
    }

    pub fn list(&self) -> Vec<ShardAffinityRule> {
        let mut rules: Vec<_> = self.inner.read().unwrap().values().cloned().collect();
        rules.sort_by_key(|rule| rule.shard_id);
        rules
    }

    /// Whether the rule of `shard_id` pins it to `node`.
    pub fn is_pinned_to(&self, shard_id: ShardId, node: &str) -> bool {
        self.get(shard_id)
            .map(|rule| rule.preferred_nodes.iter().any(|name| name == node))
            .unwrap_or(false)
    }
}

/// The names of the registered nodes that are online and not expired, the
/// only valid shard destinations.
pub(crate) fn online_node_names(snapshot: &Snapshot) -> Vec<String> {
    let now = current_ms();
    snapshot
        .registered_nodes
        .iter()
        .filter(|node| node.is_online(now))
        .map(|node| node.node.node_name.clone())
        .collect()
}
