// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Create table procedure.
//!
//! The state machine is `Begin -> CheckTableExists -> CreateMetadata ->
//! CreateOnShard -> Finish`; every step is idempotent so a replayed
//! procedure converges instead of duplicating work.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use cluster::{
    metadata::ClusterMetadataRef,
    types::{CreateTableMetadataRequest, ShardVersionUpdate},
};
use common_types::{
    shard::{ShardId, ShardInfo, ShardRole, ShardStatus},
    table::{Table, TableInfo},
};
use log::info;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use tokio::sync::oneshot;

use super::{
    storage::ProcedureParams, Context, Priority, Procedure, ProcedureId, RelatedVersionInfo,
    State, Typ,
};
use crate::{
    eventdispatch::{CreateTableOnShardRequest, EventDispatch, EventDispatchRef, UpdateShardInfo},
    Cancelled, ClusterFailure, Error, ProcedureFailed, Result, ShardNotFound,
    TableAlreadyExists,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableParams {
    pub schema_name: String,
    pub table_name: String,
    /// The shard picked for the table at submission time.
    pub shard_id: ShardId,
}

#[derive(Debug, Clone)]
pub struct CreateTableResult {
    pub table: Table,
    pub shard_info: ShardInfo,
}

/// Create `table` on the node owning `shard_id` and commit the mapping at
/// the shard version reported back by the node.
pub(crate) async fn create_on_shard(
    metadata: &ClusterMetadataRef,
    dispatch: &EventDispatchRef,
    schema_name: &str,
    table: &Table,
    shard_id: ShardId,
) -> Result<ShardInfo> {
    let snapshot = metadata.snapshot().await;
    let shard_view = snapshot
        .topology
        .shard_view(shard_id)
        .with_context(|| ShardNotFound {
            msg: format!("shard not found, shard_id:{shard_id}"),
        })?;
    let binding = snapshot
        .topology
        .shard_node(shard_id)
        .with_context(|| ShardNotFound {
            msg: format!("shard is unassigned, shard_id:{shard_id}"),
        })?;

    let prev_version = shard_view.version;
    let curr_shard_info = ShardInfo {
        id: shard_id,
        role: ShardRole::Leader,
        version: prev_version,
        status: ShardStatus::Ready,
    };
    let latest_version = dispatch
        .create_table_on_shard(
            &binding.node,
            CreateTableOnShardRequest {
                update_shard_info: UpdateShardInfo {
                    curr_shard_info,
                    prev_version,
                },
                table_info: TableInfo::new(table.clone(), schema_name.to_string()),
            },
        )
        .await?;

    metadata
        .add_table_topology(
            ShardVersionUpdate {
                shard_id,
                prev_version,
                latest_version,
            },
            table.clone(),
        )
        .await
        .context(ClusterFailure)?;

    Ok(ShardInfo {
        id: shard_id,
        role: ShardRole::Leader,
        version: latest_version,
        status: ShardStatus::Ready,
    })
}

enum FsmState {
    Begin,
    CheckTableExists,
    CreateMetadata { existing: Option<Table> },
    CreateOnShard { table: Table },
    Finish { table: Table, shard_info: ShardInfo },
}

pub struct CreateTableProcedure {
    id: ProcedureId,
    params: CreateTableParams,
    metadata: ClusterMetadataRef,
    dispatch: EventDispatchRef,
    related: RelatedVersionInfo,
    state: RwLock<State>,
    result_tx: Mutex<Option<oneshot::Sender<Result<CreateTableResult>>>>,
}

impl CreateTableProcedure {
    pub fn new(
        id: ProcedureId,
        metadata: ClusterMetadataRef,
        dispatch: EventDispatchRef,
        related: RelatedVersionInfo,
        params: CreateTableParams,
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

    /// Register the result channel; only the submitter calls this, recovered
    /// procedures run without one.
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

    async fn run(&self, ctx: &Context) -> Result<CreateTableResult> {
        let mut state = FsmState::Begin;
        loop {
            ctx.ensure_running()?;
            state = match state {
                FsmState::Begin => FsmState::CheckTableExists,
                FsmState::CheckTableExists => {
                    let table = self
                        .metadata
                        .get_table(&self.params.schema_name, &self.params.table_name)
                        .await
                        .context(ClusterFailure)?;
                    if let Some(table) = &table {
                        // Metadata and shard mapping both present means the
                        // table is fully created.
                        if self.metadata.get_table_shard(table.id).await.is_some() {
                            return TableAlreadyExists {
                                msg: format!(
                                    "table:{}.{}",
                                    self.params.schema_name, self.params.table_name
                                ),
                            }
                            .fail();
                        }
                    }
                    FsmState::CreateMetadata { existing: table }
                }
                FsmState::CreateMetadata { existing } => {
                    let table = match existing {
                        Some(table) => table,
                        None => self
                            .metadata
                            .create_table_metadata(CreateTableMetadataRequest {
                                schema_name: self.params.schema_name.clone(),
                                table_name: self.params.table_name.clone(),
                                partition_info: None,
                            })
                            .await
                            .context(ClusterFailure)?,
                    };
                    FsmState::CreateOnShard { table }
                }
                FsmState::CreateOnShard { table } => {
                    let shard_info = create_on_shard(
                        &self.metadata,
                        &self.dispatch,
                        &self.params.schema_name,
                        &table,
                        self.params.shard_id,
                    )
                    .await?;
                    FsmState::Finish { table, shard_info }
                }
                FsmState::Finish { table, shard_info } => {
                    self.metadata
                        .delete_table_assignment(
                            &self.params.schema_name,
                            &self.params.table_name,
                        )
                        .await
                        .context(ClusterFailure)?;
                    info!(
                        "Create table procedure finished, id:{}, table:{}.{}, shard_id:{}",
                        self.id, self.params.schema_name, self.params.table_name, shard_info.id
                    );
                    return Ok(CreateTableResult { table, shard_info });
                }
            };
        }
    }
}

#[async_trait]
impl Procedure for CreateTableProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn typ(&self) -> Typ {
        Typ::CreateTable
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn related_version_info(&self) -> RelatedVersionInfo {
        self.related.clone()
    }

    fn persisted_params(&self) -> ProcedureParams {
        ProcedureParams::CreateTable(self.params.clone())
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
                let msg = format!("create table failed, id:{}, err:{e}", self.id);
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
