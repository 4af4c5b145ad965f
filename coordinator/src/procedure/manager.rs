// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Submission and execution of procedures.
//!
//! Admitted procedures wait in a priority queue; the executor runs up to
//! `procedure_executing_batch_size` of them concurrently, serializing those
//! whose related shard sets overlap. Submitted procedures are persisted so a
//! restarted leader re-runs the unfinished ones from the beginning.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use cluster::metadata::ClusterMetadataRef;
use common_types::shard::ShardId;
use log::{error, info, warn};
use snafu::ensure;
use tokio::{
    sync::mpsc::{self, Sender},
    sync::Notify,
    task::JoinHandle,
    time,
};

use super::{
    storage::{ProcedureMeta, ProcedureStorageRef},
    Context, Priority, Procedure, ProcedureId, ProcedureRef, State,
};
use crate::{ProcedureConflict, Result};

const EXECUTOR_WAKE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
struct RunningSet {
    shards: HashSet<ShardId>,
    procedures: HashMap<ProcedureId, ProcedureRef>,
}

struct Inner {
    queue: Mutex<BTreeMap<(Priority, ProcedureId), ProcedureRef>>,
    running: Mutex<RunningSet>,
    notify: Notify,
}

pub struct ProcedureManager {
    metadata: ClusterMetadataRef,
    storage: ProcedureStorageRef,
    batch_size: usize,
    inner: Arc<Inner>,
    executor_handle: Mutex<Option<JoinHandle<()>>>,
    stop_executor_tx: Mutex<Option<Sender<()>>>,
}

pub type ProcedureManagerRef = Arc<ProcedureManager>;

impl ProcedureManager {
    pub fn new(
        metadata: ClusterMetadataRef,
        storage: ProcedureStorageRef,
        batch_size: usize,
    ) -> Self {
        assert!(batch_size > 0);
        Self {
            metadata,
            storage,
            batch_size,
            inner: Arc::new(Inner {
                queue: Mutex::new(BTreeMap::new()),
                running: Mutex::new(RunningSet::default()),
                notify: Notify::new(),
            }),
            executor_handle: Mutex::new(None),
            stop_executor_tx: Mutex::new(None),
        }
    }

    /// Persist and enqueue a procedure.
    ///
    /// Submission is rejected when the expected shard versions are already
    /// stale, or when an in-flight procedure expects the same version of one
    /// of the shards (both cannot commit, so the loser is refused early).
    pub async fn submit(&self, procedure: ProcedureRef) -> Result<()> {
        let related = procedure.related_version_info();

        let snapshot = self.metadata.snapshot().await;
        for (shard_id, expect_version) in &related.shard_with_version {
            let curr_version = snapshot
                .topology
                .shard_view(*shard_id)
                .map(|view| view.version);
            ensure!(
                curr_version == Some(*expect_version),
                ProcedureConflict {
                    msg: format!(
                        "stale shard version, shard_id:{shard_id}, expect:{expect_version}, curr:{curr_version:?}"
                    ),
                }
            );
        }

        {
            // Lock order: running before queue, like the executor side.
            let running = self.inner.running.lock().unwrap();
            let queue = self.inner.queue.lock().unwrap();
            for other in queue.values().chain(running.procedures.values()) {
                let other_related = other.related_version_info();
                for (shard_id, expect_version) in &related.shard_with_version {
                    ensure!(
                        other_related.shard_with_version.get(shard_id) != Some(expect_version),
                        ProcedureConflict {
                            msg: format!(
                                "another procedure({}) is in flight on the same shard version, shard_id:{shard_id}",
                                other.id()
                            ),
                        }
                    );
                }
            }
        }

        let meta = ProcedureMeta {
            id: procedure.id(),
            state: State::Init,
            params: procedure.persisted_params(),
        };
        self.storage.save(&meta).await?;

        info!(
            "Procedure submitted, id:{}, typ:{:?}",
            procedure.id(),
            procedure.typ()
        );
        self.inner
            .queue
            .lock()
            .unwrap()
            .insert((procedure.priority(), procedure.id()), procedure);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// The persisted procedures, for recovery and for inspection.
    pub async fn stored_procedures(&self) -> Result<Vec<ProcedureMeta>> {
        self.storage.list().await
    }

    /// Number of queued plus running procedures.
    pub fn in_flight(&self) -> usize {
        let running = self.inner.running.lock().unwrap();
        let queue = self.inner.queue.lock().unwrap();
        running.procedures.len() + queue.len()
    }

    pub fn start(&self, ctx: Context) {
        let inner = self.inner.clone();
        let storage = self.storage.clone();
        let batch_size = self.batch_size;
        let (tx, mut rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            info!("Procedure executor starts");
            loop {
                Self::drain_admissible(&inner, &storage, batch_size, &ctx).await;

                tokio::select! {
                    _ = rx.recv() => {
                        warn!("Receive exit command and exit procedure executor loop");
                        break;
                    }
                    _ = inner.notify.notified() => {}
                    _ = time::sleep(EXECUTOR_WAKE_INTERVAL) => {}
                }
            }
        });

        *self.stop_executor_tx.lock().unwrap() = Some(tx);
        *self.executor_handle.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        let tx = self.stop_executor_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        let handle = self.executor_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Pop and spawn every queued procedure whose shard set is disjoint from
    /// the running ones, up to the executing batch size.
    async fn drain_admissible(
        inner: &Arc<Inner>,
        storage: &ProcedureStorageRef,
        batch_size: usize,
        ctx: &Context,
    ) {
        loop {
            let procedure = match Self::pop_admissible(inner, batch_size) {
                Some(procedure) => procedure,
                None => return,
            };

            let meta = ProcedureMeta {
                id: procedure.id(),
                state: State::Running,
                params: procedure.persisted_params(),
            };
            if let Err(e) = storage.save(&meta).await {
                error!(
                    "Failed to persist running procedure, id:{}, err:{e}",
                    procedure.id()
                );
            }

            let inner = inner.clone();
            let storage = storage.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let id = procedure.id();
                let related = procedure.related_version_info();
                if let Err(e) = procedure.start(ctx).await {
                    error!("Procedure failed, id:{id}, err:{e}");
                }

                match procedure.state() {
                    State::Finished => {
                        if let Err(e) = storage.delete(id).await {
                            error!("Failed to delete finished procedure, id:{id}, err:{e}");
                        }
                    }
                    state => {
                        let meta = ProcedureMeta {
                            id,
                            state,
                            params: procedure.persisted_params(),
                        };
                        if let Err(e) = storage.save(&meta).await {
                            error!("Failed to persist procedure state, id:{id}, err:{e}");
                        }
                    }
                }

                {
                    let mut running = inner.running.lock().unwrap();
                    for shard_id in related.shard_with_version.keys() {
                        running.shards.remove(shard_id);
                    }
                    running.procedures.remove(&id);
                }
                inner.notify.notify_one();
            });
        }
    }

    /// Pop the first admissible procedure and mark its shards running.
    fn pop_admissible(inner: &Arc<Inner>, batch_size: usize) -> Option<ProcedureRef> {
        let mut running = inner.running.lock().unwrap();
        if running.procedures.len() >= batch_size {
            return None;
        }

        let mut queue = inner.queue.lock().unwrap();
        let key = queue
            .iter()
            .find(|(_, procedure)| {
                procedure
                    .related_version_info()
                    .shard_with_version
                    .keys()
                    .all(|shard_id| !running.shards.contains(shard_id))
            })
            .map(|(key, _)| *key)?;
        let procedure = queue.remove(&key)?;

        for shard_id in procedure.related_version_info().shard_with_version.keys() {
            running.shards.insert(*shard_id);
        }
        running.procedures.insert(procedure.id(), procedure.clone());
        Some(procedure)
    }
}

#[cfg(test)]
mod tests {
    use common_types::{
        cluster::{ClusterState, TopologyType},
        shard::{ShardNode, ShardRole},
    };

    use super::*;
    use crate::{
        factory::{CreateTableRequest, Factory},
        procedure::storage::ProcedureStorage,
        test_util::{new_test_cluster, wait_for_idle, MockDispatch, TEST_ROOT},
        Error,
    };

    async fn stable_single_node() -> (
        cluster::metadata::ClusterMetadataRef,
        meta_storage::meta::MetaStorageRef,
        meta_storage::kv::KvBackendRef,
        Arc<Factory>,
    ) {
        let (metadata, meta_storage, kv) =
            new_test_cluster(1, 2, TopologyType::Static).await;
        metadata
            .update_cluster_view(
                ClusterState::Stable,
                vec![
                    ShardNode {
                        shard_id: 0,
                        node: "n1".to_string(),
                        role: ShardRole::Leader,
                    },
                    ShardNode {
                        shard_id: 1,
                        node: "n1".to_string(),
                        role: ShardRole::Leader,
                    },
                ],
            )
            .await
            .unwrap();
        let dispatch = Arc::new(MockDispatch::default());
        let factory = Arc::new(
            Factory::new(meta_storage.clone(), metadata.clone(), dispatch, 100)
                .await
                .unwrap(),
        );
        (metadata, meta_storage, kv, factory)
    }

    #[tokio::test]
    async fn test_submit_rejects_duplicate_expectation() {
        let (metadata, _, kv, factory) = stable_single_node().await;
        let storage = Arc::new(ProcedureStorage::new(
            kv,
            TEST_ROOT.to_string(),
            metadata.id(),
        ));
        // The executor is not started, submissions stay in flight.
        let manager = Arc::new(ProcedureManager::new(metadata, storage, 8));

        let (first, _rx) = factory
            .transfer_leader_procedure(0, "n1".to_string(), None)
            .await
            .unwrap();
        manager.submit(first).await.unwrap();

        let (second, _rx) = factory
            .transfer_leader_procedure(0, "n1".to_string(), None)
            .await
            .unwrap();
        let err = manager.submit(second).await.unwrap_err();
        assert!(matches!(err, Error::ProcedureConflict { .. }));

        // A procedure on the other shard is admitted.
        let (third, _rx) = factory
            .transfer_leader_procedure(1, "n1".to_string(), None)
            .await
            .unwrap();
        manager.submit(third).await.unwrap();
        assert_eq!(manager.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_recovery_reruns_from_begin() {
        let (metadata, _, kv, factory) = stable_single_node().await;
        let storage = Arc::new(ProcedureStorage::new(
            kv.clone(),
            TEST_ROOT.to_string(),
            metadata.id(),
        ));

        // The first manager accepts the procedure but dies before running it.
        let manager = Arc::new(ProcedureManager::new(metadata.clone(), storage, 8));
        let (procedure, _rx) = factory
            .create_table_procedure(CreateTableRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                partition_info: None,
            })
            .await
            .unwrap();
        manager.submit(procedure).await.unwrap();
        drop(manager);

        // The restarted manager reloads the persisted record and re-runs the
        // whole state machine.
        let storage = Arc::new(ProcedureStorage::new(
            kv,
            TEST_ROOT.to_string(),
            metadata.id(),
        ));
        let restarted = Arc::new(ProcedureManager::new(metadata.clone(), storage, 8));
        restarted.start(Context::default());
        factory.recover(&restarted).await.unwrap();
        wait_for_idle(&restarted).await;

        let table = metadata.get_table("public", "t1").await.unwrap().unwrap();
        assert!(metadata.get_table_shard(table.id).await.is_some());
        // The finished procedure record is gone.
        assert!(restarted.stored_procedures().await.unwrap().is_empty());
    }
}
