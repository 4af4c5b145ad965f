// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Drop partition table procedure: drop every sub table, then the parent.
//! Each sub table drop is individually idempotent, so re-submitting after a
//! partial failure converges to a clean state without orphaned sub tables.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use cluster::metadata::ClusterMetadataRef;
use log::info;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::oneshot;

use super::{
    drop_table::execute_drop, storage::ProcedureParams, Context, Priority, Procedure,
    ProcedureId, RelatedVersionInfo, State, Typ,
};
use crate::{
    eventdispatch::EventDispatchRef, Cancelled, ClusterFailure, Error, ProcedureFailed, Result,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropPartitionTableParams {
    pub schema_name: String,
    pub table_name: String,
}

pub struct DropPartitionTableProcedure {
    id: ProcedureId,
    params: DropPartitionTableParams,
    metadata: ClusterMetadataRef,
    dispatch: EventDispatchRef,
    related: RelatedVersionInfo,
    state: RwLock<State>,
    result_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl DropPartitionTableProcedure {
    pub fn new(
        id: ProcedureId,
        metadata: ClusterMetadataRef,
        dispatch: EventDispatchRef,
        related: RelatedVersionInfo,
        params: DropPartitionTableParams,
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

        let parent = match self
            .metadata
            .get_table(&self.params.schema_name, &self.params.table_name)
            .await
            .context(ClusterFailure)?
        {
            Some(table) => table,
            // Nothing left to drop.
            None => return Ok(()),
        };

        let sub_table_names = parent
            .partition_info
            .as_ref()
            .map(|info| info.sub_table_names.clone())
            .unwrap_or_default();

        let mut failures = Vec::new();
        for sub_table_name in &sub_table_names {
            ctx.ensure_running()?;
            if let Err(e) = execute_drop(
                &self.metadata,
                &self.dispatch,
                &self.params.schema_name,
                sub_table_name,
            )
            .await
            {
                failures.push(format!("{sub_table_name}:{e}"));
            }
        }
        if !failures.is_empty() {
            return ProcedureFailed {
                msg: format!("drop sub tables failed: [{}]", failures.join(", ")),
            }
            .fail();
        }

        ctx.ensure_running()?;
        execute_drop(
            &self.metadata,
            &self.dispatch,
            &self.params.schema_name,
            &self.params.table_name,
        )
        .await?;

        info!(
            "Drop partition table finished, id:{}, table:{}.{}, sub_tables:{}",
            self.id,
            self.params.schema_name,
            self.params.table_name,
            sub_table_names.len()
        );
        Ok(())
    }
}

#[async_trait]
impl Procedure for DropPartitionTableProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn typ(&self) -> Typ {
        Typ::DropPartitionTable
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn related_version_info(&self) -> RelatedVersionInfo {
        self.related.clone()
    }

    fn persisted_params(&self) -> ProcedureParams {
        ProcedureParams::DropPartitionTable(self.params.clone())
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
                let msg = format!("drop partition table failed, id:{}, err:{e}", self.id);
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
