// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Batched leader transfers, emitted by the static scheduler to assign many
//! shards in one procedure. Transfers run one by one; a failure stops the
//! batch and the scheduler re-emits the remainder on its next tick.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use cluster::metadata::ClusterMetadataRef;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::{
    storage::ProcedureParams, transfer_leader::{execute_transfer, TransferLeaderParams},
    Context, Priority, Procedure, ProcedureId, RelatedVersionInfo, State, Typ,
};
use crate::{eventdispatch::EventDispatchRef, Cancelled, Error, ProcedureFailed, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTransferLeaderParams {
    pub transfers: Vec<TransferLeaderParams>,
}

pub struct BatchTransferLeaderProcedure {
    id: ProcedureId,
    params: BatchTransferLeaderParams,
    metadata: ClusterMetadataRef,
    dispatch: EventDispatchRef,
    related: RelatedVersionInfo,
    state: RwLock<State>,
    result_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl BatchTransferLeaderProcedure {
    pub fn new(
        id: ProcedureId,
        metadata: ClusterMetadataRef,
        dispatch: EventDispatchRef,
        related: RelatedVersionInfo,
        params: BatchTransferLeaderParams,
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
        for transfer in &self.params.transfers {
            ctx.ensure_running()?;
            execute_transfer(&self.metadata, &self.dispatch, transfer).await?;
        }
        info!(
            "Batch transfer leader finished, id:{}, transfers:{}",
            self.id,
            self.params.transfers.len()
        );
        Ok(())
    }
}

#[async_trait]
impl Procedure for BatchTransferLeaderProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn typ(&self) -> Typ {
        Typ::BatchTransferLeader
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn related_version_info(&self) -> RelatedVersionInfo {
        self.related.clone()
    }

    fn persisted_params(&self) -> ProcedureParams {
        ProcedureParams::BatchTransferLeader(self.params.clone())
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
                let msg = format!("batch transfer leader failed, id:{}, err:{e}", self.id);
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
