// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction for payload delivery.
//!
//! The client enforces TLS 1.2 or newer and verifies the peer against the
//! configured PEM bundle (`ca_file_path`) or the bundled roots. A configured
//! proxy routes every request; an unusable proxy or bundle is logged and the
//! client falls back to a direct connection with the bundled roots.

use core::time::Duration;
use std::error::Error;

use reqwest::{tls, Certificate, Proxy};
use tracing::error;

use crate::config::Config;

/// Builds a client from `config`, falling back to simpler clients on error.
#[must_use]
pub fn get_client(config: &Config) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to build HTTP client: {}, falling back to direct connection",
                e
            );
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(config: &Config, full: bool) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(config.transmit_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .min_tls_version(tls::Version::TLS_1_2);

    if !full {
        return Ok(client.no_proxy().build()?);
    }

    if let Some(path) = &config.ca_file_path {
        let pem = std::fs::read(path)?;
        for certificate in Certificate::from_pem_bundle(&pem)? {
            client = client.add_root_certificate(certificate);
        }
    }

    // Proxy variables of the environment were already folded into the config.
    client = match &config.http_proxy {
        Some(proxy) => client.proxy(Proxy::all(proxy)?),
        None => client.no_proxy(),
    };

    Ok(client.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_proxy_still_yields_client() {
        let config = Config {
            http_proxy: Some("::not a url::".to_string()),
            ..Config::default()
        };
        let _client = get_client(&config);
    }

    #[test]
    fn test_missing_ca_file_falls_back() {
        let config = Config {
            ca_file_path: Some("/nonexistent/bundle.pem".into()),
            ..Config::default()
        };
        assert!(build_client(&config, true).is_err());
        assert!(build_client(&config, false).is_ok());
    }
}
