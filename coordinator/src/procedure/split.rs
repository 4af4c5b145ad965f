// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Split procedure: move some tables of a shard into a freshly allocated
//! shard and open it on the target node.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use cluster::metadata::ClusterMetadataRef;
use common_types::shard::{ShardId, ShardStatus};
use log::info;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use tokio::sync::oneshot;

use super::{
    storage::ProcedureParams, Context, Priority, Procedure, ProcedureId, RelatedVersionInfo,
    State, Typ,
};
use crate::{
    eventdispatch::{EventDispatch, EventDispatchRef, OpenShardRequest},
    Cancelled, ClusterFailure, Error, ProcedureFailed, Result, ShardNotFound, TableNotFound,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitParams {
    pub schema_name: String,
    pub shard_id: ShardId,
    pub new_shard_id: ShardId,
    pub table_names: Vec<String>,
    pub target_node: String,
}

pub struct SplitProcedure {
    id: ProcedureId,
    params: SplitParams,
    metadata: ClusterMetadataRef,
    dispatch: EventDispatchRef,
    related: RelatedVersionInfo,
    state: RwLock<State>,
    result_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl SplitProcedure {
    pub fn new(
        id: ProcedureId,
        metadata: ClusterMetadataRef,
        dispatch: EventDispatchRef,
        related: RelatedVersionInfo,
        params: SplitParams,
    ) -> Self {
        Self {
            id,
            params,
            metadata,
            dispatch,
            related,
            state: RwLock::new(State::Init),
            result_tx: Mutex::new(None),
        }
    }

    pub fn subscribe_result(&self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        *self.result_tx.lock().unwrap() = Some(tx);
        rx
    }

    fn set_state(&self, state: State) {
        *self.state.write().unwrap() = state;
    }

    fn send_result(&self, result: Result<()>) {
        if let Some(tx) = self.result_tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }

    async fn run(&self, ctx: &Context) -> Result<()> {
        ctx.ensure_running()?;

        // Resolve the tables to move.
        let mut table_ids = Vec::with_capacity(self.params.table_names.len());
        for table_name in &self.params.table_names {
            let table = self
                .metadata
                .get_table(&self.params.schema_name, table_name)
                .await
                .context(ClusterFailure)?
                .with_context(|| TableNotFound {
                    msg: format!("table:{}.{table_name}", self.params.schema_name),
                })?;
            table_ids.push(table.id);
        }

        let snapshot = self.metadata.snapshot().await;
        let prev_version = snapshot
            .topology
            .shard_view(self.params.shard_id)
            .map(|view| view.version)
            .with_context(|| ShardNotFound {
                msg: format!("shard not found, shard_id:{}", self.params.shard_id),
            })?;

        ctx.ensure_running()?;
        let mut shard_info = self
            .metadata
            .split_shard(
                self.params.shard_id,
                prev_version,
                self.params.new_shard_id,
                &table_ids,
                self.params.target_node.clone(),
            )
            .await
            .context(ClusterFailure)?;
        shard_info.status = ShardStatus::Ready;

        self.dispatch
            .open_shard(
                &self.params.target_node,
                OpenShardRequest { shard: shard_info },
            )
            .await?;

        info!(
            "Shard split, shard_id:{}, new_shard_id:{}, tables:{:?}, target_node:{}",
            self.params.shard_id,
            self.params.new_shard_id,
            self.params.table_names,
            self.params.target_node
        );
        Ok(())
    }
}

#[async_trait]
impl Procedure for SplitProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn typ(&self) -> Typ {
        Typ::Split
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn related_version_info(&self) -> RelatedVersionInfo {
        self.related.clone()
    }

    fn persisted_params(&self) -> ProcedureParams {
        ProcedureParams::Split(self.params.clone())
    }

    async fn start(&self, ctx: Context) -> Result<()> {
        self.set_state(State::Running);
        match self.run(&ctx).await {
            Ok(()) => {
                self.set_state(State::Finished);
                self.send_result(Ok(()));
                Ok(())
            }
            Err(e) => {
                let state = if matches!(e, Error::Cancelled { .. }) {
                    State::Cancelled
                } else {
                    State::Failed
                };
                self.set_state(state);
                let msg = format!("split failed, id:{}, err:{e}", self.id);
                self.send_result(Err(e));
                ProcedureFailed { msg }.fail()
            }
        }
    }

    async fn cancel(&self) -> Result<()> {
        self.set_state(State::Cancelled);
        self.send_result(Cancelled.fail());
        Ok(())
    }

    fn state(&self) -> State {
        *self.state.read().unwrap()
    }
}
