// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Transfer leader procedure: close the shard on the old leader, commit the
//! new binding, open the shard on the new leader. Re-opening a shard on its
//! current owner is the same flow with both ends equal.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use cluster::metadata::ClusterMetadataRef;
use common_types::shard::{ShardId, ShardInfo, ShardStatus};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use tokio::sync::oneshot;

use super::{
    storage::ProcedureParams, Context, Priority, Procedure, ProcedureId, RelatedVersionInfo,
    State, Typ,
};
use crate::{
    eventdispatch::{CloseShardRequest, EventDispatch, EventDispatchRef, OpenShardRequest},
    Cancelled, ClusterFailure, Error, ProcedureFailed, Result, ShardNotFound,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLeaderParams {
    pub shard_id: ShardId,
    /// `None` means the shard is currently unassigned (or its binding is the
    /// source of truth).
    pub old_leader: Option<String>,
    pub new_leader: String,
}

/// Run one leader transfer against the current topology.
pub(crate) async fn execute_transfer(
    metadata: &ClusterMetadataRef,
    dispatch: &EventDispatchRef,
    params: &TransferLeaderParams,
) -> Result<ShardInfo> {
    let snapshot = metadata.snapshot().await;
    let prev_version = snapshot
        .topology
        .shard_view(params.shard_id)
        .map(|view| view.version)
        .with_context(|| ShardNotFound {
            msg: format!("shard not found, shard_id:{}", params.shard_id),
        })?;

    let old_leader = params.old_leader.clone().or_else(|| {
        snapshot
            .topology
            .shard_node(params.shard_id)
            .map(|binding| binding.node.clone())
    });

    // Close on the old leader first; failing to reach a dying node must not
    // wedge the transfer.
    if let Some(old_leader) = old_leader {
        if let Err(e) = dispatch
            .close_shard(
                &old_leader,
                CloseShardRequest {
                    shard_id: params.shard_id,
                },
            )
            .await
        {
            warn!(
                "Failed to close shard on the old leader, shard_id:{}, old_leader:{old_leader}, err:{e}",
                params.shard_id
            );
        }
    }

    let mut shard_info = metadata
        .switch_shard_leader(params.shard_id, prev_version, params.new_leader.clone())
        .await
        .context(ClusterFailure)?;
    shard_info.status = ShardStatus::Ready;

    dispatch
        .open_shard(
            &params.new_leader,
            OpenShardRequest {
                shard: shard_info.clone(),
            },
        )
        .await?;

    info!(
        "Shard leader transferred, shard_id:{}, new_leader:{}, version:{}",
        params.shard_id, params.new_leader, shard_info.version
    );
    Ok(shard_info)
}

pub struct TransferLeaderProcedure {
    id: ProcedureId,
    params: TransferLeaderParams,
    metadata: ClusterMetadataRef,
    dispatch: EventDispatchRef,
    related: RelatedVersionInfo,
    state: RwLock<State>,
    result_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl TransferLeaderProcedure {
    pub fn new(
        id: ProcedureId,
        metadata: ClusterMetadataRef,
        dispatch: EventDispatchRef,
        related: RelatedVersionInfo,
        params: TransferLeaderParams,
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
impl Procedure for TransferLeaderProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn typ(&self) -> Typ {
        Typ::TransferLeader
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn related_version_info(&self) -> RelatedVersionInfo {
        self.related.clone()
    }

    fn persisted_params(&self) -> ProcedureParams {
        ProcedureParams::TransferLeader(self.params.clone())
    }

    async fn start(&self, ctx: Context) -> Result<()> {
        self.set_state(State::Running);
        let result = async {
            ctx.ensure_running()?;
            execute_transfer(&self.metadata, &self.dispatch, &self.params).await
        }
        .await;

        match result {
            Ok(_) => {
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
                let msg = format!("transfer leader failed, id:{}, err:{e}", self.id);
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
