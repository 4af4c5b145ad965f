// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Basic types of the meta server shared by all crates.

pub mod cluster;
pub mod node;
pub mod schema;
pub mod shard;
pub mod table;
