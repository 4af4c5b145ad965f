// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Cluster metadata of the meta server.
//!
//! [`metadata::ClusterMetadata`] owns every persistent record of one cluster
//! and is the only place mutating them; all other components work on
//! immutable [`types::Snapshot`]s or go through the procedure engine.

#[macro_use]
extern crate common_util;

use common_types::shard::{ShardId, ShardVersion};
use snafu::{Backtrace, Snafu};

pub mod manager;
pub mod metadata;
pub mod shard_watch;
pub mod table_manager;
pub mod topology;
pub mod types;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Invalid arguments, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    InvalidArguments { msg: String, backtrace: Backtrace },

    #[snafu(display("Failed to access meta storage, msg:{}, err:{}", msg, source))]
    MetaStorageFailure {
        msg: String,
        source: meta_storage::Error,
    },

    #[snafu(display("Failed to alloc id, msg:{}, err:{}", msg, source))]
    AllocId {
        msg: String,
        source: common_util::error::GenericError,
    },

    #[snafu(display("Cluster not found, cluster_name:{}.\nBacktrace:\n{}", cluster_name, backtrace))]
    ClusterNotFound {
        cluster_name: String,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Cluster already exists, cluster_name:{}.\nBacktrace:\n{}",
        cluster_name,
        backtrace
    ))]
    ClusterAlreadyExists {
        cluster_name: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Schema not found, schema_name:{}.\nBacktrace:\n{}", schema_name, backtrace))]
    SchemaNotFound {
        schema_name: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Table not found, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    TableNotFound { msg: String, backtrace: Backtrace },

    #[snafu(display("Table already exists, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    TableAlreadyExists { msg: String, backtrace: Backtrace },

    #[snafu(display("Shard not found, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    ShardNotFound { msg: String, backtrace: Backtrace },

    #[snafu(display(
        "Shard version mismatch, shard_id:{}, expect_version:{}, curr_version:{}.\nBacktrace:\n{}",
        shard_id,
        expect_version,
        curr_version,
        backtrace
    ))]
    ShardVersionMismatch {
        shard_id: ShardId,
        expect_version: ShardVersion,
        curr_version: ShardVersion,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid cluster state, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    InvalidClusterState { msg: String, backtrace: Backtrace },
}

define_result!(Error);

impl Error {
    /// A version mismatch is recoverable, the caller may retry on a fresh
    /// snapshot.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ShardVersionMismatch { .. })
    }
}
