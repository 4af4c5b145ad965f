// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Table types.

use serde::{Deserialize, Serialize};

use crate::schema::SchemaId;

pub type TableId = u64;

/// Partition information of a partition table.
///
/// The parent table carries the names of its sub tables; each sub table is an
/// ordinary table resident on its own shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub sub_table_names: Vec<String>,
}

/// The persisted table record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub schema_id: SchemaId,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
    pub partition_info: Option<PartitionInfo>,
}

impl Table {
    #[inline]
    pub fn is_partition_table(&self) -> bool {
        self.partition_info.is_some()
    }
}

/// A table together with the name of its schema, the form consumed by routing
/// and by the node event protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub schema_id: SchemaId,
    pub schema_name: String,
    pub partition_info: Option<PartitionInfo>,
}

impl TableInfo {
    pub fn new(table: Table, schema_name: String) -> Self {
        Self {
            id: table.id,
            name: table.name,
            schema_id: table.schema_id,
            schema_name,
            partition_info: table.partition_info,
        }
    }
}
