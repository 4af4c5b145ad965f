// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Transparent proxying of mutating requests to the current leader.
//!
//! The request body and headers are passed through untouched and the
//! leader's response is returned as-is, so a client cannot tell which node
//! it talked to.

use log::debug;
use snafu::{OptionExt, ResultExt};
use warp::{
    http::HeaderMap,
    hyper::{body::Bytes, Body},
};

use crate::{BuildForwardResponse, ForwardToLeader, Result};

pub struct Forwarder {
    client: reqwest::Client,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Forwarder {
    pub async fn forward(
        &self,
        leader_addr: &str,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<warp::reply::Response> {
        let url = format!("http://{leader_addr}{path}");
        debug!("Forward request to leader, url:{url}");

        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return BuildForwardResponse {
                    msg: format!("invalid method:{method}"),
                }
                .fail()
            }
        };

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            let name = name.as_str();
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if let Ok(value) = value.to_str() {
                request = request.header(name, value);
            }
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .context(ForwardToLeader)?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        let bytes = response.bytes().await.context(ForwardToLeader)?;

        let mut builder = warp::http::Response::builder().status(status);
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Body::from(bytes.to_vec()))
            .ok()
            .with_context(|| BuildForwardResponse {
                msg: "invalid forwarded response".to_string(),
            })
    }
}
