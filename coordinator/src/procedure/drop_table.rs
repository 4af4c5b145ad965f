// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Drop table procedure.
//!
//! The state machine is `Begin -> Waiting -> {Finish | Failed}`: one prepare
//! step locates the shard hosting the table, dispatches the drop and removes
//! the table record at the version reported back. Dropping a table that is
//! already gone is a no-op so a replay always converges.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use cluster::{metadata::ClusterMetadataRef, types::ShardVersionUpdate};
use common_types::{
    shard::{ShardInfo, ShardRole, ShardStatus},
    table::{Table, TableInfo},
};
use log::info;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::oneshot;

use super::{
    storage::ProcedureParams, Context, Priority, Procedure, ProcedureId, RelatedVersionInfo,
    State, Typ,
};
use crate::{
    eventdispatch::{DropTableOnShardRequest, EventDispatch, EventDispatchRef, UpdateShardInfo},
    Cancelled, ClusterFailure, Error, ProcedureFailed, Result,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropTableParams {
    pub schema_name: String,
    pub table_name: String,
}

/// Drop one table: dispatch to the owning node when the shard still exists,
/// then remove the table record. Returns the dropped table, or `None` when
/// there was nothing to drop.
pub(crate) async fn execute_drop(
    metadata: &ClusterMetadataRef,
    dispatch: &EventDispatchRef,
    schema_name: &str,
    table_name: &str,
) -> Result<Option<Table>> {
    let table = match metadata
        .get_table(schema_name, table_name)
        .await
        .context(ClusterFailure)?
    {
        Some(table) => table,
        None => return Ok(None),
    };

    if let Some(shard_id) = metadata.get_table_shard(table.id).await {
        let snapshot = metadata.snapshot().await;
        if let Some(shard_view) = snapshot.topology.shard_view(shard_id) {
            let prev_version = shard_view.version;
            let latest_version = match snapshot.topology.shard_node(shard_id) {
                Some(binding) => {
                    let curr_shard_info = ShardInfo {
                        id: shard_id,
                        role: ShardRole::Leader,
                        version: prev_version,
                        status: ShardStatus::Ready,
                    };
                    dispatch
                        .drop_table_on_shard(
                            &binding.node,
                            DropTableOnShardRequest {
                                update_shard_info: UpdateShardInfo {
                                    curr_shard_info,
                                    prev_version,
                                },
                                table_info: TableInfo::new(
                                    table.clone(),
                                    schema_name.to_string(),
                                ),
                            },
                        )
                        .await?
                }
                // The shard is unassigned, finish the metadata cleanup only.
                None => prev_version + 1,
            };

            metadata
                .remove_table_topology(
                    ShardVersionUpdate {
                        shard_id,
                        prev_version,
                        latest_version,
                    },
                    table.id,
                )
                .await
                .context(ClusterFailure)?;
        }
    }

    metadata
        .drop_table_metadata(schema_name, table_name)
        .await
        .context(ClusterFailure)?;
    Ok(Some(table))
}

pub struct DropTableProcedure {
    id: ProcedureId,
    params: DropTableParams,
    metadata: ClusterMetadataRef,
    dispatch: EventDispatchRef,
    related: RelatedVersionInfo,
    state: RwLock<State>,
    result_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl DropTableProcedure {
    pub fn new(
        id: ProcedureId,
        metadata: ClusterMetadataRef,
        dispatch: EventDispatchRef,
        related: RelatedVersionInfo,
        params: DropTableParams,
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
}

#[async_trait]
impl Procedure for DropTableProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn typ(&self) -> Typ {
        Typ::DropTable
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn related_version_info(&self) -> RelatedVersionInfo {
        self.related.clone()
    }

    fn persisted_params(&self) -> ProcedureParams {
        ProcedureParams::DropTable(self.params.clone())
    }

    async fn start(&self, ctx: Context) -> Result<()> {
        self.set_state(State::Running);
        let result = async {
            ctx.ensure_running()?;
            execute_drop(
                &self.metadata,
                &self.dispatch,
                &self.params.schema_name,
                &self.params.table_name,
            )
            .await
        }
        .await;

        match result {
            Ok(dropped) => {
                self.set_state(State::Finished);
                if dropped.is_some() {
                    info!(
                        "Drop table procedure finished, id:{}, table:{}.{}",
                        self.id, self.params.schema_name, self.params.table_name
                    );
                }
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
                let msg = format!("drop table failed, id:{}, err:{e}", self.id);
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
