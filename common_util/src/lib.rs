// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Common utils shared by the whole project.

#[macro_use]
pub mod macros;

pub mod error;
pub mod id_allocator;
pub mod runtime_level;
