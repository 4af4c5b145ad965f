// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! The server crate wires the cluster metadata and the coordinator together
//! behind the leader election and exposes the admin HTTP surface.

#[macro_use]
extern crate common_util;

use snafu::{Backtrace, Snafu};

pub mod error_util;
pub mod forward;
pub mod http;
pub mod limiter;
pub mod member;
pub mod metrics;
pub mod server;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Invalid request body, err:{}", source))]
    InvalidRequestBody { source: serde_json::Error },

    #[snafu(display("Invalid arguments, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    InvalidArguments { msg: String, backtrace: Backtrace },

    #[snafu(display("flow limit reached\nBacktrace:\n{}", backtrace))]
    FlowLimitExceeded { backtrace: Backtrace },

    #[snafu(display("No leader is elected.\nBacktrace:\n{}", backtrace))]
    LeaderNotFound { backtrace: Backtrace },

    #[snafu(display(
        "Cluster is not coordinated by this node yet, cluster_name:{}.\nBacktrace:\n{}",
        cluster_name,
        backtrace
    ))]
    ClusterNotCoordinated {
        cluster_name: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to forward request to leader, err:{}", source))]
    ForwardToLeader { source: reqwest::Error },

    #[snafu(display("Failed to build forwarded response, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    BuildForwardResponse { msg: String, backtrace: Backtrace },

    #[snafu(display("Failed to operate cluster metadata, err:{}", source))]
    ClusterFailure { source: cluster::Error },

    #[snafu(display("Failed to coordinate cluster, err:{}", source))]
    CoordinatorFailure { source: coordinator::Error },

    #[snafu(display("Failed to access etcd, msg:{}, err:{}", msg, source))]
    EtcdFailure {
        msg: String,
        source: etcd_client::Error,
    },

    #[snafu(display("Etcd is unavailable.\nBacktrace:\n{}", backtrace))]
    EtcdUnavailable { backtrace: Backtrace },

    #[snafu(display("Procedure result channel is broken.\nBacktrace:\n{}", backtrace))]
    WaitResult { backtrace: Backtrace },

    #[snafu(display(
        "Failed to parse ip addr, ip:{}, err:{}.\nBacktrace:\n{}",
        ip,
        source,
        backtrace
    ))]
    ParseIpAddr {
        ip: String,
        source: std::net::AddrParseError,
        backtrace: Backtrace,
    },

    #[snafu(display("Server already started.\nBacktrace:\n{}", backtrace))]
    AlreadyStarted { backtrace: Backtrace },

    #[snafu(display("Failed to handle update log level, err:{}", msg))]
    HandleUpdateLogLevel { msg: String },

    #[snafu(display("Failed to profile cpu, err:{}", source))]
    ProfileCpu { source: pprof::Error },

    #[snafu(display("Failed to join async task, err:{}", msg))]
    JoinAsyncTask { msg: String },
}

define_result!(Error);

impl warp::reject::Reject for Error {}
