// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Persistence of submitted procedures.

use std::sync::Arc;

use common_types::cluster::ClusterId;
use meta_storage::{
    keys,
    kv::{KvBackend, KvBackendRef},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{
    batch_transfer_leader::BatchTransferLeaderParams,
    create_partition_table::CreatePartitionTableParams, create_table::CreateTableParams,
    drop_partition_table::DropPartitionTableParams, drop_table::DropTableParams,
    split::SplitParams, transfer_leader::TransferLeaderParams, ProcedureId, State,
};
use crate::{DecodeProcedure, EncodeProcedure, Result, StorageFailure};

/// Typed parameters of every procedure kind, enough to rebuild the procedure
/// after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "typ", rename_all = "snake_case")]
pub enum ProcedureParams {
    CreateTable(CreateTableParams),
    DropTable(DropTableParams),
    CreatePartitionTable(CreatePartitionTableParams),
    DropPartitionTable(DropPartitionTableParams),
    TransferLeader(TransferLeaderParams),
    Split(SplitParams),
    BatchTransferLeader(BatchTransferLeaderParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureMeta {
    pub id: ProcedureId,
    pub state: State,
    pub params: ProcedureParams,
}

pub struct ProcedureStorage {
    kv: KvBackendRef,
    root_path: String,
    cluster_id: ClusterId,
}

pub type ProcedureStorageRef = Arc<ProcedureStorage>;

impl ProcedureStorage {
    pub fn new(kv: KvBackendRef, root_path: String, cluster_id: ClusterId) -> Self {
        Self {
            kv,
            root_path,
            cluster_id,
        }
    }

    pub async fn save(&self, meta: &ProcedureMeta) -> Result<()> {
        let key = keys::procedure_key(&self.root_path, self.cluster_id, meta.id);
        let value = serde_json::to_vec(meta).context(EncodeProcedure)?;
        self.kv.put(&key, value).await.context(StorageFailure)
    }

    pub async fn delete(&self, procedure_id: ProcedureId) -> Result<()> {
        let key = keys::procedure_key(&self.root_path, self.cluster_id, procedure_id);
        self.kv.delete(&key).await.context(StorageFailure)
    }

    pub async fn list(&self) -> Result<Vec<ProcedureMeta>> {
        let prefix = keys::procedure_prefix(&self.root_path, self.cluster_id);
        let kvs = self.kv.scan_prefix(&prefix).await.context(StorageFailure)?;
        let mut metas = Vec::with_capacity(kvs.len());
        for (key, value) in kvs {
            let meta: ProcedureMeta =
                serde_json::from_slice(&value).context(DecodeProcedure { key })?;
            metas.push(meta);
        }
        metas.sort_by_key(|meta| meta.id);
        Ok(metas)
    }
}

#[cfg(test)]
mod tests {
    use meta_storage::kv::MemoryKv;

    use super::*;

    #[tokio::test]
    async fn test_procedure_roundtrip() {
        let storage = ProcedureStorage::new(
            Arc::new(MemoryKv::default()),
            "/ceresmeta".to_string(),
            1,
        );

        let meta = ProcedureMeta {
            id: 7,
            state: State::Init,
            params: ProcedureParams::DropTable(DropTableParams {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
            }),
        };
        storage.save(&meta).await.unwrap();

        let listed = storage.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 7);
        assert!(matches!(
            listed[0].params,
            ProcedureParams::DropTable(_)
        ));

        storage.delete(7).await.unwrap();
        assert!(storage.list().await.unwrap().is_empty());
    }
}
