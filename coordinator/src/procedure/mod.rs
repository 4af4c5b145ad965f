// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Resumable multi-step procedures over metadata and node events.
//!
//! A procedure is a small state machine running to a terminal state; every
//! step is idempotent given the shard version fencing, so a reloaded
//! procedure simply re-runs from the beginning.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use common_types::{
    cluster::ClusterId,
    shard::{ShardId, ShardVersion},
};
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio::sync::watch;

use crate::{Cancelled, Result};

pub mod batch_transfer_leader;
pub mod create_partition_table;
pub mod create_table;
pub mod drop_partition_table;
pub mod drop_table;
pub mod manager;
pub mod split;
pub mod storage;
pub mod transfer_leader;

pub type ProcedureId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Typ {
    CreateTable,
    DropTable,
    CreatePartitionTable,
    DropPartitionTable,
    TransferLeader,
    Split,
    BatchTransferLeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Init,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl State {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Finished | State::Failed | State::Cancelled)
    }
}

/// Smaller values run earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

/// The shards a procedure reads or writes together with their versions at
/// admission time, used for conflict detection and fencing.
#[derive(Debug, Clone, Default)]
pub struct RelatedVersionInfo {
    pub cluster_id: ClusterId,
    pub shard_with_version: HashMap<ShardId, ShardVersion>,
    pub cluster_version: u64,
}

/// Cancellation context of one procedure run.
///
/// Procedures observe cancellation between steps; losing the leadership
/// cancels every running procedure.
#[derive(Clone, Default)]
pub struct Context {
    leader_watch: Option<watch::Receiver<bool>>,
}

impl Context {
    pub fn with_leadership(leader_watch: watch::Receiver<bool>) -> Self {
        Self {
            leader_watch: Some(leader_watch),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.leader_watch {
            Some(watch) => !*watch.borrow(),
            None => false,
        }
    }

    pub fn ensure_running(&self) -> Result<()> {
        ensure!(!self.is_cancelled(), Cancelled);
        Ok(())
    }
}

#[async_trait]
pub trait Procedure: Send + Sync {
    fn id(&self) -> ProcedureId;

    fn typ(&self) -> Typ;

    fn priority(&self) -> Priority;

    fn related_version_info(&self) -> RelatedVersionInfo;

    /// The parameters to persist so the procedure survives a restart.
    fn persisted_params(&self) -> storage::ProcedureParams;

    /// Run the state machine to completion. Exactly one of the success and
    /// failure callbacks fires, at most once.
    async fn start(&self, ctx: Context) -> Result<()>;

    async fn cancel(&self) -> Result<()>;

    fn state(&self) -> State;
}

pub type ProcedureRef = Arc<dyn Procedure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
    }

    #[test]
    fn test_context_cancellation() {
        let ctx = Context::default();
        assert!(!ctx.is_cancelled());

        let (tx, rx) = watch::channel(true);
        let ctx = Context::with_leadership(rx);
        assert!(ctx.ensure_running().is_ok());

        tx.send(false).unwrap();
        assert!(ctx.is_cancelled());
        assert!(ctx.ensure_running().is_err());
    }
}
