// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Schema types.

use serde::{Deserialize, Serialize};

pub type SchemaId = u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub id: SchemaId,
    pub name: String,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
}
