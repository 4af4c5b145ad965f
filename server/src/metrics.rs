// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Metrics of the meta server.

use lazy_static::lazy_static;
use log::error;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    pub static ref HTTP_HANDLER_DURATION_HISTOGRAM_VEC: HistogramVec = register_histogram_vec!(
        "http_handler_duration",
        "Bucketed histogram of http handler duration",
        &["path", "code"]
    )
    .unwrap();
    pub static ref PROCEDURE_SUBMIT_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "procedure_submit_total",
        "Counter of submitted procedures",
        &["typ"]
    )
    .unwrap();
}

/// Dump every registered metric in the prometheus text format.
pub fn dump() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    for family in families {
        if let Err(e) = encoder.encode(&[family], &mut buffer) {
            error!("Failed to encode metrics, err:{e}");
        }
    }
    String::from_utf8(buffer).unwrap_or_default()
}
