// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! The binary crate of the meta server.

#![recursion_limit = "256"]

pub mod config;
pub mod setup;
pub mod signal_handler;
