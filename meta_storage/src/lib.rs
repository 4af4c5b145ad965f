// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Persistence layer of the meta server.
//!
//! All cluster records live in a replicated key value store under
//! `storage_root_path`. [`kv::KvBackend`] abstracts the store itself (etcd in
//! production, an in-memory map in tests) and [`meta::MetaStorage`] knows the
//! key layout and the record encoding.

#[macro_use]
extern crate common_util;

use snafu::{Backtrace, Snafu};

pub mod keys;
pub mod kv;
pub mod meta;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Failed to access etcd, msg:{}, err:{}", msg, source))]
    EtcdFailure {
        msg: String,
        source: etcd_client::Error,
    },

    #[snafu(display("Etcd call timeout, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    EtcdTimeout { msg: String, backtrace: Backtrace },

    #[snafu(display("Failed to encode record, key:{}, err:{}", key, source))]
    EncodeRecord {
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to decode record, key:{}, err:{}", key, source))]
    DecodeRecord {
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display("Invalid key in store, err:{}", source))]
    InvalidKey { source: etcd_client::Error },

    #[snafu(display("Record already exists, key:{}.\nBacktrace:\n{}", key, backtrace))]
    RecordAlreadyExists { key: String, backtrace: Backtrace },

    #[snafu(display(
        "Too many ops in one txn, max:{}, given:{}.\nBacktrace:\n{}",
        max,
        given,
        backtrace
    ))]
    TooManyTxnOps {
        max: usize,
        given: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid arguments, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    InvalidArguments { msg: String, backtrace: Backtrace },
}

define_result!(Error);
