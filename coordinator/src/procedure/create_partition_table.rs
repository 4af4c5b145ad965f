// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Create partition table procedure: fan out the sub table creations to
//! their picked shards, then create the parent table on its own shard.
//! Partial failures are cleaned up best effort and surface as one aggregated
//! failure.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use cluster::{metadata::ClusterMetadataRef, types::CreateTableMetadataRequest};
use common_types::{
    shard::{ShardId, ShardInfo, ShardRole, ShardStatus},
    table::PartitionInfo,
};
use futures::future::join_all;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::oneshot;

use super::{
    create_table::{create_on_shard, CreateTableResult},
    drop_table::execute_drop,
    storage::ProcedureParams,
    Context, Priority, Procedure, ProcedureId, RelatedVersionInfo, State, Typ,
};
use crate::{
    eventdispatch::EventDispatchRef, Cancelled, ClusterFailure, Error, ProcedureFailed, Result,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTableShard {
    pub table_name: String,
    pub shard_id: ShardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePartitionTableParams {
    pub schema_name: String,
    pub table_name: String,
    pub parent_shard_id: ShardId,
    pub sub_tables: Vec<SubTableShard>,
}

pub struct CreatePartitionTableProcedure {
    id: ProcedureId,
    params: CreatePartitionTableParams,
    metadata: ClusterMetadataRef,
    dispatch: EventDispatchRef,
    related: RelatedVersionInfo,
    state: RwLock<State>,
    result_tx: Mutex<Option<oneshot::Sender<Result<CreateTableResult>>>>,
}

impl CreatePartitionTableProcedure {
    pub fn new(
        id: ProcedureId,
        metadata: ClusterMetadataRef,
        dispatch: EventDispatchRef,
        related: RelatedVersionInfo,
        params: CreatePartitionTableParams,
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

    pub fn subscribe_result(&self) -> oneshot::Receiver<Result<CreateTableResult>> {
        let (tx, rx) = oneshot::channel();
        *self.result_tx.lock().unwrap() = Some(tx);
        rx
    }

    fn set_state(&self, state: State) {
        *self.state.write().unwrap() = state;
    }

    fn send_result(&self, result: Result<CreateTableResult>) {
        if let Some(tx) = self.result_tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }

    /// Create one sub table on its shard, skipping work already done by an
    /// earlier attempt.
    async fn create_sub_table(&self, sub_table: &SubTableShard) -> Result<()> {
        let table = self
            .metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: self.params.schema_name.clone(),
                table_name: sub_table.table_name.clone(),
                partition_info: None,
            })
            .await
            .context(ClusterFailure)?;

        if self.metadata.get_table_shard(table.id).await.is_some() {
            return Ok(());
        }
        create_on_shard(
            &self.metadata,
            &self.dispatch,
            &self.params.schema_name,
            &table,
            sub_table.shard_id,
        )
        .await
        .map(|_| ())
    }

    async fn run(&self, ctx: &Context) -> Result<CreateTableResult> {
        ctx.ensure_running()?;

        let sub_table_names: Vec<_> = self
            .params
            .sub_tables
            .iter()
            .map(|sub| sub.table_name.clone())
            .collect();
        let parent = self
            .metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: self.params.schema_name.clone(),
                table_name: self.params.table_name.clone(),
                partition_info: Some(PartitionInfo {
                    sub_table_names: sub_table_names.clone(),
                }),
            })
            .await
            .context(ClusterFailure)?;

        ctx.ensure_running()?;
        let results = join_all(
            self.params
                .sub_tables
                .iter()
                .map(|sub| self.create_sub_table(sub)),
        )
        .await;

        let failures: Vec<String> = self
            .params
            .sub_tables
            .iter()
            .zip(results.iter())
            .filter_map(|(sub, result)| {
                result
                    .as_ref()
                    .err()
                    .map(|e| format!("{}:{e}", sub.table_name))
            })
            .collect();

        if !failures.is_empty() {
            // Best effort cleanup of the sub tables that made it.
            for (sub, result) in self.params.sub_tables.iter().zip(results.iter()) {
                if result.is_ok() {
                    if let Err(e) = execute_drop(
                        &self.metadata,
                        &self.dispatch,
                        &self.params.schema_name,
                        &sub.table_name,
                    )
                    .await
                    {
                        warn!(
                            "Failed to clean up sub table, table:{}, err:{e}",
                            sub.table_name
                        );
                    }
                }
            }
            return ProcedureFailed {
                msg: format!("create sub tables failed: [{}]", failures.join(", ")),
            }
            .fail();
        }

        // The parent table lives on its own shard.
        ctx.ensure_running()?;
        let shard_info = match self.metadata.get_table_shard(parent.id).await {
            // Replay path, the parent already landed on its shard.
            Some(shard_id) => {
                let snapshot = self.metadata.snapshot().await;
                let version = snapshot
                    .topology
                    .shard_view(shard_id)
                    .map(|view| view.version)
                    .unwrap_or_default();
                ShardInfo {
                    id: shard_id,
                    role: ShardRole::Leader,
                    version,
                    status: ShardStatus::Ready,
                }
            }
            None => {
                create_on_shard(
                    &self.metadata,
                    &self.dispatch,
                    &self.params.schema_name,
                    &parent,
                    self.params.parent_shard_id,
                )
                .await?
            }
        };

        info!(
            "Create partition table finished, id:{}, table:{}.{}, sub_tables:{}",
            self.id,
            self.params.schema_name,
            self.params.table_name,
            self.params.sub_tables.len()
        );
        Ok(CreateTableResult {
            table: parent,
            shard_info,
        })
    }
}

#[async_trait]
impl Procedure for CreatePartitionTableProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn typ(&self) -> Typ {
        Typ::CreatePartitionTable
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn related_version_info(&self) -> RelatedVersionInfo {
        self.related.clone()
    }

    fn persisted_params(&self) -> ProcedureParams {
        ProcedureParams::CreatePartitionTable(self.params.clone())
    }

    async fn start(&self, ctx: Context) -> Result<()> {
        self.set_state(State::Running);
        match self.run(&ctx).await {
            Ok(result) => {
                self.set_state(State::Finished);
                self.send_result(Ok(result));
                Ok(())
            }
            Err(e) => {
                let state = if matches!(e, Error::Cancelled { .. }) {
                    State::Cancelled
                } else {
                    State::Failed
                };
                self.set_state(state);
                let msg = format!("create partition table failed, id:{}, err:{e}", self.id);
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
