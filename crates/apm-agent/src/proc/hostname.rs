// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname reported with every payload.
//!
//! Resolution order: `APM_HOSTNAME`, `HOSTNAME`, the system hostname, then
//! `"unknown"`. Empty values are skipped.

use std::env;
use tracing::warn;

pub const HOSTNAME_ENV: &str = "APM_HOSTNAME";

#[must_use]
pub fn get_hostname() -> String {
    for var in [HOSTNAME_ENV, "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname_osstr) => {
            if let Some(hostname_str) = hostname_osstr.to_str() {
                if !hostname_str.is_empty() {
                    return hostname_str.to_string();
                }
            }
        }
        Err(e) => {
            warn!("Failed to get system hostname: {}", e);
        }
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
