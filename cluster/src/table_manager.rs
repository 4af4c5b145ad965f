// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! In-memory schema and table records of one cluster.

use std::collections::HashMap;

use common_types::{
    schema::{Schema, SchemaId},
    table::{Table, TableId, TableInfo},
};
use snafu::OptionExt;

use crate::{Result, SchemaNotFound};

/// Owner of the schema/table cache, mutated only under the cluster metadata
/// writer lock. `(schema, name)` is unique and table ids are never reused.
#[derive(Debug, Default)]
pub struct TableManager {
    schemas: HashMap<String, Schema>,
    schema_names: HashMap<SchemaId, String>,
    /// Tables keyed by schema id and table name.
    tables: HashMap<SchemaId, HashMap<String, Table>>,
}

impl TableManager {
    pub fn load(schemas: Vec<Schema>, tables: Vec<Table>) -> Self {
        let mut manager = TableManager::default();
        for schema in schemas {
            manager.schema_names.insert(schema.id, schema.name.clone());
            manager.schemas.insert(schema.name.clone(), schema);
        }
        for table in tables {
            manager
                .tables
                .entry(table.schema_id)
                .or_default()
                .insert(table.name.clone(), table);
        }
        manager
    }

    pub fn schema_by_name(&self, schema_name: &str) -> Option<&Schema> {
        self.schemas.get(schema_name)
    }

    pub fn schema_name_by_id(&self, schema_id: SchemaId) -> Option<&str> {
        self.schema_names.get(&schema_id).map(|name| name.as_str())
    }

    pub fn insert_schema(&mut self, schema: Schema) {
        self.schema_names.insert(schema.id, schema.name.clone());
        self.schemas.insert(schema.name.clone(), schema);
    }

    pub fn find_table(&self, schema_name: &str, table_name: &str) -> Option<&Table> {
        let schema = self.schemas.get(schema_name)?;
        self.tables.get(&schema.id)?.get(table_name)
    }

    /// Find a table by id together with the name of its schema.
    pub fn table_by_id(&self, table_id: TableId) -> Option<TableInfo> {
        for (schema_id, tables) in &self.tables {
            if let Some(table) = tables.values().find(|table| table.id == table_id) {
                let schema_name = self.schema_names.get(schema_id)?;
                return Some(TableInfo::new(table.clone(), schema_name.clone()));
            }
        }
        None
    }

    pub fn insert_table(&mut self, table: Table) {
        self.tables
            .entry(table.schema_id)
            .or_default()
            .insert(table.name.clone(), table);
    }

    pub fn remove_table(&mut self, schema_name: &str, table_name: &str) -> Option<Table> {
        let schema = self.schemas.get(schema_name)?;
        self.tables.get_mut(&schema.id)?.remove(table_name)
    }

    pub fn table_info(&self, schema_name: &str, table_name: &str) -> Result<Option<TableInfo>> {
        let schema = self
            .schemas
            .get(schema_name)
            .with_context(|| SchemaNotFound {
                schema_name: schema_name.to_string(),
            })?;
        Ok(self
            .tables
            .get(&schema.id)
            .and_then(|tables| tables.get(table_name))
            .map(|table| TableInfo::new(table.clone(), schema_name.to_string())))
    }

    /// Resolve table infos of the given ids, silently skipping unknown ids.
    pub fn table_infos_by_ids(&self, table_ids: &[TableId]) -> Vec<TableInfo> {
        let mut by_id = HashMap::with_capacity(self.schemas.len());
        for (schema_id, tables) in &self.tables {
            for table in tables.values() {
                by_id.insert(table.id, (*schema_id, table));
            }
        }

        table_ids
            .iter()
            .filter_map(|table_id| {
                let (schema_id, table) = by_id.get(table_id)?;
                let schema_name = self.schema_names.get(schema_id)?;
                Some(TableInfo::new((*table).clone(), schema_name.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> TableManager {
        let schemas = vec![Schema {
            id: 1,
            name: "public".to_string(),
            created_at: 1,
        }];
        let tables = vec![Table {
            id: 11,
            name: "t1".to_string(),
            schema_id: 1,
            created_at: 1,
            partition_info: None,
        }];
        TableManager::load(schemas, tables)
    }

    #[test]
    fn test_find_and_remove() {
        let mut manager = test_manager();

        assert_eq!(manager.find_table("public", "t1").unwrap().id, 11);
        assert!(manager.find_table("public", "missing").is_none());
        assert!(manager.find_table("missing", "t1").is_none());

        let info = manager.table_by_id(11).unwrap();
        assert_eq!(info.schema_name, "public");

        let removed = manager.remove_table("public", "t1").unwrap();
        assert_eq!(removed.id, 11);
        assert!(manager.find_table("public", "t1").is_none());
    }

    #[test]
    fn test_table_infos_by_ids() {
        let manager = test_manager();
        let infos = manager.table_infos_by_ids(&[11, 999]);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "t1");
    }
}
