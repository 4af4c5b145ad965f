// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! The coordinator drives the cluster toward its target topology: it owns
//! the procedure engine executing DDL and shard operations, the schedulers
//! emitting those procedures, and the outbound event dispatch to the storage
//! nodes.

#[macro_use]
extern crate common_util;

use snafu::{Backtrace, Snafu};

pub mod eventdispatch;
pub mod factory;
pub mod node_picker;
pub mod procedure;
pub mod scheduler;
pub mod shard_picker;

#[cfg(test)]
pub(crate) mod test_util;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Failed to connect to node, endpoint:{}, err:{}", endpoint, source))]
    GrpcConnect {
        endpoint: String,
        source: tonic::transport::Error,
    },

    #[snafu(display("Failed to call node, endpoint:{}, err:{}", endpoint, source))]
    RpcFailure {
        endpoint: String,
        source: tonic::Status,
    },

    #[snafu(display(
        "Dispatch failed, endpoint:{}, code:{}, msg:{}.\nBacktrace:\n{}",
        endpoint,
        code,
        msg,
        backtrace
    ))]
    DispatchFailed {
        endpoint: String,
        code: u32,
        msg: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to operate cluster metadata, err:{}", source))]
    ClusterFailure { source: cluster::Error },

    #[snafu(display("Failed to access procedure storage, err:{}", source))]
    StorageFailure { source: meta_storage::Error },

    #[snafu(display("Failed to encode procedure, err:{}", source))]
    EncodeProcedure { source: serde_json::Error },

    #[snafu(display("Failed to decode procedure, key:{}, err:{}", key, source))]
    DecodeProcedure {
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to alloc procedure id, err:{}", source))]
    AllocProcedureId {
        source: common_util::error::GenericError,
    },

    #[snafu(display("Node number is not enough, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    NodeNumberNotEnough { msg: String, backtrace: Backtrace },

    #[snafu(display("Table already exists, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    TableAlreadyExists { msg: String, backtrace: Backtrace },

    #[snafu(display("Table not found, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    TableNotFound { msg: String, backtrace: Backtrace },

    #[snafu(display("Shard not found, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    ShardNotFound { msg: String, backtrace: Backtrace },

    #[snafu(display("Procedure conflicts, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    ProcedureConflict { msg: String, backtrace: Backtrace },

    #[snafu(display("Procedure failed, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    ProcedureFailed { msg: String, backtrace: Backtrace },

    #[snafu(display("Procedure cancelled.\nBacktrace:\n{}", backtrace))]
    Cancelled { backtrace: Backtrace },

    #[snafu(display("Not implemented, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    NotImplemented { msg: String, backtrace: Backtrace },

    #[snafu(display("Invalid cluster state, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    InvalidClusterState { msg: String, backtrace: Backtrace },

    #[snafu(display("Internal error, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    Internal { msg: String, backtrace: Backtrace },
}

define_result!(Error);
