// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Factory building procedures from requests and from persisted records.

use std::{collections::HashMap, sync::Arc};

use cluster::{metadata::ClusterMetadataRef, types::Snapshot};
use common_types::{
    shard::ShardId,
    table::PartitionInfo,
};
use common_util::{error::BoxError, id_allocator::IdAllocator};
use log::warn;
use snafu::ResultExt;
use tokio::sync::oneshot;

use crate::{
    eventdispatch::EventDispatchRef,
    procedure::{
        batch_transfer_leader::{BatchTransferLeaderParams, BatchTransferLeaderProcedure},
        create_partition_table::{
            CreatePartitionTableParams, CreatePartitionTableProcedure, SubTableShard,
        },
        create_table::{CreateTableParams, CreateTableProcedure, CreateTableResult},
        drop_partition_table::{DropPartitionTableParams, DropPartitionTableProcedure},
        drop_table::{DropTableParams, DropTableProcedure},
        manager::ProcedureManagerRef,
        split::{SplitParams, SplitProcedure},
        storage::{ProcedureMeta, ProcedureParams},
        transfer_leader::{TransferLeaderParams, TransferLeaderProcedure},
        ProcedureId, ProcedureRef, RelatedVersionInfo,
    },
    shard_picker::{LeastTableShardPicker, PersistShardPicker},
    AllocProcedureId, ClusterFailure, Result,
};
use meta_storage::meta::MetaStorageRef;

const PROCEDURE_ID_NAME: &str = "procedure_id";

#[derive(Debug, Clone)]
pub struct CreateTableRequest {
    pub schema_name: String,
    pub table_name: String,
    pub partition_info: Option<PartitionInfo>,
}

pub struct Factory {
    meta_storage: MetaStorageRef,
    metadata: ClusterMetadataRef,
    dispatch: EventDispatchRef,
    id_alloc: IdAllocator,
}

pub type FactoryRef = Arc<Factory>;

impl Factory {
    pub async fn new(
        meta_storage: MetaStorageRef,
        metadata: ClusterMetadataRef,
        dispatch: EventDispatchRef,
        alloc_step: u64,
    ) -> Result<Self> {
        let id_base = meta_storage
            .get_max_id(metadata.id(), PROCEDURE_ID_NAME)
            .await
            .context(crate::StorageFailure)?
            .unwrap_or(0);

        Ok(Self {
            meta_storage,
            metadata,
            dispatch,
            id_alloc: IdAllocator::new(id_base, id_base, alloc_step),
        })
    }

    async fn alloc_procedure_id(&self) -> Result<ProcedureId> {
        let meta_storage = self.meta_storage.clone();
        let cluster_id = self.metadata.id();
        self.id_alloc
            .alloc_id(move |max_id| async move {
                meta_storage
                    .put_max_id(cluster_id, PROCEDURE_ID_NAME, max_id)
                    .await
                    .box_err()
            })
            .await
            .context(AllocProcedureId)
    }

    fn related_of(&self, snapshot: &Snapshot, shard_ids: &[ShardId]) -> RelatedVersionInfo {
        let mut shard_with_version = HashMap::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            if let Some(view) = snapshot.topology.shard_view(*shard_id) {
                shard_with_version.insert(*shard_id, view.version);
            }
        }

        RelatedVersionInfo {
            cluster_id: self.metadata.id(),
            shard_with_version,
            cluster_version: snapshot.topology.cluster_view.version,
        }
    }

    /// Build a create table procedure; a request carrying partition info
    /// becomes a create partition table procedure.
    pub async fn create_table_procedure(
        &self,
        req: CreateTableRequest,
    ) -> Result<(
        ProcedureRef,
        oneshot::Receiver<Result<CreateTableResult>>,
    )> {
        let snapshot = self.metadata.snapshot().await;
        let id = self.alloc_procedure_id().await?;

        match &req.partition_info {
            Some(partition_info) if !partition_info.sub_table_names.is_empty() => {
                let sub_count = partition_info.sub_table_names.len();
                // One extra pick for the parent table's own shard.
                let picks = LeastTableShardPicker::pick_shards(&snapshot, sub_count + 1)?;
                let parent_shard_id = picks[0].shard_id;
                let sub_tables: Vec<_> = partition_info
                    .sub_table_names
                    .iter()
                    .zip(picks[1..].iter())
                    .map(|(table_name, binding)| SubTableShard {
                        table_name: table_name.clone(),
                        shard_id: binding.shard_id,
                    })
                    .collect();

                let mut shard_ids: Vec<_> =
                    sub_tables.iter().map(|sub| sub.shard_id).collect();
                shard_ids.push(parent_shard_id);
                shard_ids.sort_unstable();
                shard_ids.dedup();

                let related = self.related_of(&snapshot, &shard_ids);
                let procedure = Arc::new(CreatePartitionTableProcedure::new(
                    id,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                    related,
                    CreatePartitionTableParams {
                        schema_name: req.schema_name,
                        table_name: req.table_name,
                        parent_shard_id,
                        sub_tables,
                    },
                ));
                let rx = procedure.subscribe_result();
                Ok((procedure as ProcedureRef, rx))
            }
            _ => {
                let picker = PersistShardPicker::new(self.metadata.clone());
                let picked = picker
                    .pick(&snapshot, &req.schema_name, &req.table_name)
                    .await?;
                let related = self.related_of(&snapshot, &[picked.shard_id]);
                let procedure = Arc::new(CreateTableProcedure::new(
                    id,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                    related,
                    CreateTableParams {
                        schema_name: req.schema_name,
                        table_name: req.table_name,
                        shard_id: picked.shard_id,
                    },
                ));
                let rx = procedure.subscribe_result();
                Ok((procedure as ProcedureRef, rx))
            }
        }
    }

    /// Build a drop table procedure; dropping a table that does not exist
    /// returns `None` and the request succeeds as a no-op.
    pub async fn drop_table_procedure(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<(ProcedureRef, oneshot::Receiver<Result<()>>)>> {
        let table = match self
            .metadata
            .get_table(schema_name, table_name)
            .await
            .context(ClusterFailure)?
        {
            Some(table) => table,
            None => return Ok(None),
        };

        let snapshot = self.metadata.snapshot().await;
        let id = self.alloc_procedure_id().await?;
        let related_shards: Vec<_> = self
            .metadata
            .get_table_shard(table.id)
            .await
            .into_iter()
            .collect();
        let related = self.related_of(&snapshot, &related_shards);

        if table.is_partition_table() {
            let procedure = Arc::new(DropPartitionTableProcedure::new(
                id,
                self.metadata.clone(),
                self.dispatch.clone(),
                related,
                DropPartitionTableParams {
                    schema_name: schema_name.to_string(),
                    table_name: table_name.to_string(),
                },
            ));
            let rx = procedure.subscribe_result();
            Ok(Some((procedure as ProcedureRef, rx)))
        } else {
            let procedure = Arc::new(DropTableProcedure::new(
                id,
                self.metadata.clone(),
                self.dispatch.clone(),
                related,
                DropTableParams {
                    schema_name: schema_name.to_string(),
                    table_name: table_name.to_string(),
                },
            ));
            let rx = procedure.subscribe_result();
            Ok(Some((procedure as ProcedureRef, rx)))
        }
    }

    pub async fn transfer_leader_procedure(
        &self,
        shard_id: ShardId,
        new_leader: String,
        old_leader: Option<String>,
    ) -> Result<(ProcedureRef, oneshot::Receiver<Result<()>>)> {
        let snapshot = self.metadata.snapshot().await;
        let id = self.alloc_procedure_id().await?;
        let related = self.related_of(&snapshot, &[shard_id]);

        let procedure = Arc::new(TransferLeaderProcedure::new(
            id,
            self.metadata.clone(),
            self.dispatch.clone(),
            related,
            TransferLeaderParams {
                shard_id,
                old_leader,
                new_leader,
            },
        ));
        let rx = procedure.subscribe_result();
        Ok((procedure as ProcedureRef, rx))
    }

    pub async fn batch_transfer_leader_procedure(
        &self,
        transfers: Vec<TransferLeaderParams>,
    ) -> Result<(ProcedureRef, oneshot::Receiver<Result<()>>)> {
        let snapshot = self.metadata.snapshot().await;
        let id = self.alloc_procedure_id().await?;
        let shard_ids: Vec<_> = transfers.iter().map(|transfer| transfer.shard_id).collect();
        let related = self.related_of(&snapshot, &shard_ids);

        let procedure = Arc::new(BatchTransferLeaderProcedure::new(
            id,
            self.metadata.clone(),
            self.dispatch.clone(),
            related,
            BatchTransferLeaderParams { transfers },
        ));
        let rx = procedure.subscribe_result();
        Ok((procedure as ProcedureRef, rx))
    }

    pub async fn split_procedure(
        &self,
        schema_name: String,
        shard_id: ShardId,
        table_names: Vec<String>,
        target_node: String,
    ) -> Result<(ProcedureRef, oneshot::Receiver<Result<()>>)> {
        let snapshot = self.metadata.snapshot().await;
        let id = self.alloc_procedure_id().await?;
        let new_shard_id = self
            .metadata
            .alloc_shard_id()
            .await
            .context(ClusterFailure)?;
        let related = self.related_of(&snapshot, &[shard_id]);

        let procedure = Arc::new(SplitProcedure::new(
            id,
            self.metadata.clone(),
            self.dispatch.clone(),
            related,
            SplitParams {
                schema_name,
                shard_id,
                new_shard_id,
                table_names,
                target_node,
            },
        ));
        let rx = procedure.subscribe_result();
        Ok((procedure as ProcedureRef, rx))
    }

    /// Rebuild a procedure from its persisted record, with the related
    /// versions refreshed from the current topology.
    pub async fn restore(&self, meta: ProcedureMeta) -> Result<ProcedureRef> {
        let snapshot = self.metadata.snapshot().await;
        let procedure: ProcedureRef = match meta.params {
            ProcedureParams::CreateTable(params) => {
                let related = self.related_of(&snapshot, &[params.shard_id]);
                Arc::new(CreateTableProcedure::new(
                    meta.id,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                    related,
                    params,
                ))
            }
            ProcedureParams::DropTable(params) => {
                let related = self.related_of(&snapshot, &[]);
                Arc::new(DropTableProcedure::new(
                    meta.id,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                    related,
                    params,
                ))
            }
            ProcedureParams::CreatePartitionTable(params) => {
                let mut shard_ids: Vec<_> =
                    params.sub_tables.iter().map(|sub| sub.shard_id).collect();
                shard_ids.push(params.parent_shard_id);
                shard_ids.sort_unstable();
                shard_ids.dedup();
                let related = self.related_of(&snapshot, &shard_ids);
                Arc::new(CreatePartitionTableProcedure::new(
                    meta.id,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                    related,
                    params,
                ))
            }
            ProcedureParams::DropPartitionTable(params) => {
                let related = self.related_of(&snapshot, &[]);
                Arc::new(DropPartitionTableProcedure::new(
                    meta.id,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                    related,
                    params,
                ))
            }
            ProcedureParams::TransferLeader(params) => {
                let related = self.related_of(&snapshot, &[params.shard_id]);
                Arc::new(TransferLeaderProcedure::new(
                    meta.id,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                    related,
                    params,
                ))
            }
            ProcedureParams::Split(params) => {
                let related = self.related_of(&snapshot, &[params.shard_id]);
                Arc::new(SplitProcedure::new(
                    meta.id,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                    related,
                    params,
                ))
            }
            ProcedureParams::BatchTransferLeader(params) => {
                let shard_ids: Vec<_> = params
                    .transfers
                    .iter()
                    .map(|transfer| transfer.shard_id)
                    .collect();
                let related = self.related_of(&snapshot, &shard_ids);
                Arc::new(BatchTransferLeaderProcedure::new(
                    meta.id,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                    related,
                    params,
                ))
            }
        };
        Ok(procedure)
    }

    /// Resubmit every persisted procedure that has not reached a terminal
    /// state; all steps are idempotent so re-running from the beginning is
    /// safe.
    pub async fn recover(&self, manager: &ProcedureManagerRef) -> Result<()> {
        let metas = manager.stored_procedures().await?;
        for meta in metas {
            if meta.state.is_terminal() {
                continue;
            }
            let id = meta.id;
            let procedure = self.restore(meta).await?;
            if let Err(e) = manager.submit(procedure).await {
                warn!("Failed to resubmit recovered procedure, id:{id}, err:{e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common_types::cluster::{ClusterState, TopologyType};
    use common_types::shard::{ShardNode, ShardRole};

    use super::*;
    use crate::{
        procedure::{manager::ProcedureManager, storage::ProcedureStorage, Context},
        test_util::{new_test_cluster, wait_for_idle, MockDispatch, TEST_ROOT},
        Error,
    };

    async fn stable_cluster() -> (
        ClusterMetadataRef,
        FactoryRef,
        ProcedureManagerRef,
        Arc<MockDispatch>,
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
                        node: "n2".to_string(),
                        role: ShardRole::Leader,
                    },
                ],
            )
            .await
            .unwrap();

        let dispatch = Arc::new(MockDispatch::default());
        let factory = Arc::new(
            Factory::new(
                meta_storage,
                metadata.clone(),
                dispatch.clone(),
                100,
            )
            .await
            .unwrap(),
        );
        let storage = Arc::new(ProcedureStorage::new(kv, TEST_ROOT.to_string(), metadata.id()));
        let manager = Arc::new(ProcedureManager::new(metadata.clone(), storage, 8));
        manager.start(Context::default());
        (metadata, factory, manager, dispatch)
    }

    #[tokio::test]
    async fn test_create_table_happy_path() {
        let (metadata, factory, manager, _) = stable_cluster().await;

        let (procedure, rx) = factory
            .create_table_procedure(CreateTableRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                partition_info: None,
            })
            .await
            .unwrap();
        manager.submit(procedure).await.unwrap();

        let result = rx.await.unwrap().unwrap();
        // Both shards are empty, the tie breaks to shard 0 whose version
        // grows by one.
        assert_eq!(result.shard_info.id, 0);
        assert_eq!(result.shard_info.version, 1);

        let table = metadata.get_table("public", "t1").await.unwrap().unwrap();
        assert_eq!(table.id, result.table.id);
        assert_eq!(metadata.get_table_shard(table.id).await, Some(0));
    }

    #[tokio::test]
    async fn test_create_table_already_exists() {
        let (_, factory, manager, _) = stable_cluster().await;

        let req = CreateTableRequest {
            schema_name: "public".to_string(),
            table_name: "t1".to_string(),
            partition_info: None,
        };
        let (procedure, rx) = factory.create_table_procedure(req.clone()).await.unwrap();
        manager.submit(procedure).await.unwrap();
        rx.await.unwrap().unwrap();
        wait_for_idle(&manager).await;

        let (procedure, rx) = factory.create_table_procedure(req).await.unwrap();
        manager.submit(procedure).await.unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TableAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_create_table_retries_after_node_loss() {
        let (metadata, factory, manager, dispatch) = stable_cluster().await;
        dispatch.set_fail_create(true);

        let req = CreateTableRequest {
            schema_name: "public".to_string(),
            table_name: "t1".to_string(),
            partition_info: None,
        };
        let (procedure, rx) = factory.create_table_procedure(req.clone()).await.unwrap();
        manager.submit(procedure).await.unwrap();
        // The dispatch fails, the procedure fails, but the metadata record
        // survives for the retry.
        rx.await.unwrap().unwrap_err();
        wait_for_idle(&manager).await;
        let table = metadata.get_table("public", "t1").await.unwrap().unwrap();
        assert_eq!(metadata.get_table_shard(table.id).await, None);

        // The retry replays idempotently and lands on the same shard thanks
        // to the sticky assignment.
        dispatch.set_fail_create(false);
        let (procedure, rx) = factory.create_table_procedure(req).await.unwrap();
        manager.submit(procedure).await.unwrap();
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.table.id, table.id);
        assert_eq!(metadata.get_table_shard(table.id).await, Some(result.shard_info.id));
    }

    #[tokio::test]
    async fn test_drop_nonexistent_table_is_noop() {
        let (_, factory, _, _) = stable_cluster().await;
        let procedure = factory.drop_table_procedure("public", "ghost").await.unwrap();
        assert!(procedure.is_none());
    }

    #[tokio::test]
    async fn test_drop_table_roundtrip() {
        let (metadata, factory, manager, _) = stable_cluster().await;

        let (procedure, rx) = factory
            .create_table_procedure(CreateTableRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                partition_info: None,
            })
            .await
            .unwrap();
        manager.submit(procedure).await.unwrap();
        let created = rx.await.unwrap().unwrap();
        wait_for_idle(&manager).await;

        let (procedure, rx) = factory
            .drop_table_procedure("public", "t1")
            .await
            .unwrap()
            .unwrap();
        manager.submit(procedure).await.unwrap();
        rx.await.unwrap().unwrap();

        assert!(metadata.get_table("public", "t1").await.unwrap().is_none());
        assert_eq!(metadata.get_table_shard(created.table.id).await, None);
    }

    #[tokio::test]
    async fn test_create_partition_table() {
        let (metadata, factory, manager, _) = stable_cluster().await;

        let (procedure, rx) = factory
            .create_table_procedure(CreateTableRequest {
                schema_name: "public".to_string(),
                table_name: "pt".to_string(),
                partition_info: Some(PartitionInfo {
                    sub_table_names: vec!["pt_0".to_string(), "pt_1".to_string()],
                }),
            })
            .await
            .unwrap();
        manager.submit(procedure).await.unwrap();
        let result = rx.await.unwrap().unwrap();
        wait_for_idle(&manager).await;

        let parent = metadata.get_table("public", "pt").await.unwrap().unwrap();
        assert_eq!(parent.id, result.table.id);
        assert!(parent.is_partition_table());
        for sub in ["pt_0", "pt_1"] {
            let table = metadata.get_table("public", sub).await.unwrap().unwrap();
            assert!(metadata.get_table_shard(table.id).await.is_some());
        }

        // Dropping the parent drops every sub table as well.
        let (procedure, rx) = factory
            .drop_table_procedure("public", "pt")
            .await
            .unwrap()
            .unwrap();
        manager.submit(procedure).await.unwrap();
        rx.await.unwrap().unwrap();
        for table in ["pt", "pt_0", "pt_1"] {
            assert!(metadata.get_table("public", table).await.unwrap().is_none());
        }
    }
}
