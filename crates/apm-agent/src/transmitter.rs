// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of compressed payloads to the collection endpoint.
//!
//! One POST per call to `{endpoint}/{action}` with the query parameters
//! `token`, `name`, `environment`, `hostname` and `client_version`. Only the
//! status code of the response is used; its body is ignored. Transport
//! failures are returned as [`TransmitError::Transport`] and are retryable.

use reqwest::{header, Url};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::http::get_client;
use crate::payload::Payload;
use crate::AGENT_VERSION;

pub const CONTENT_TYPE: &str = "application/json; charset=UTF-8";

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct Transmitter {
    client: reqwest::Client,
    url: Url,
}

impl Transmitter {
    pub fn new(config: &Config, action: &str, hostname: &str) -> Result<Self, TransmitError> {
        let mut url = Url::parse(&format!("{}/{}", config.endpoint, action))
            .map_err(|e| TransmitError::InvalidUrl(format!("{}: {e}", config.endpoint)))?;
        url.query_pairs_mut()
            .append_pair("token", &config.push_api_key)
            .append_pair("name", &config.name)
            .append_pair("environment", &config.env)
            .append_pair("hostname", hostname)
            .append_pair("client_version", AGENT_VERSION);

        Ok(Transmitter {
            client: get_client(config),
            url,
        })
    }

    /// Full request url, including the push token.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POSTs `payload` and returns the response status.
    pub async fn transmit(&self, payload: &Payload) -> Result<u16, TransmitError> {
        info!(
            "TRANSMITTER | Transmitting payload of {} transactions to {}{}",
            payload.len(),
            self.url.origin().ascii_serialization(),
            self.url.path()
        );
        let response = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_TYPE, CONTENT_TYPE)
            .body(payload.body())
            .send()
            .await?;
        let status = response.status().as_u16();
        debug!("TRANSMITTER | Response code: {}", status);
        Ok(status)
    }
}
