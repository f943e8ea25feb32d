// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! When the agent delivers its buffered transactions.
//!
//! - `default`: a background thread sends every 10 s in the `development`
//!   environment and every 60 s elsewhere.
//! - `periodically,<ms>`: a background thread sends at a fixed interval.
//! - `manual`: no background thread; the host calls `Monitor::flush` itself
//!   (single-threaded runners and tests).
//!
//! Configured with `APM_FLUSH_STRATEGY=periodically,5000` or
//! `flush_strategy: manual` in `apm.yml`.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeriodicStrategy {
    /// Milliseconds between delivery attempts.
    pub interval: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FlushStrategy {
    #[default]
    Default,
    Periodically(PeriodicStrategy),
    Manual,
}

impl FlushStrategy {
    /// Initial sleep interval of the delivery loop, or `None` when no loop runs.
    #[must_use]
    pub fn interval(&self, env: &str) -> Option<Duration> {
        match self {
            FlushStrategy::Default if env == "development" => Some(Duration::from_secs(10)),
            FlushStrategy::Default => Some(Duration::from_secs(60)),
            FlushStrategy::Periodically(p) => Some(Duration::from_millis(p.interval)),
            FlushStrategy::Manual => None,
        }
    }
}

impl<'de> Deserialize<'de> for FlushStrategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.trim().to_lowercase().as_str() {
            "default" => Ok(FlushStrategy::Default),
            "manual" => Ok(FlushStrategy::Manual),
            other => {
                let mut split = other.split(',');
                match (split.next(), split.next().map(str::trim)) {
                    (Some("periodically"), Some(interval)) => match interval.parse() {
                        Ok(interval) if interval > 0 => {
                            Ok(FlushStrategy::Periodically(PeriodicStrategy { interval }))
                        }
                        _ => {
                            debug!("Invalid flush interval: {}, using default", interval);
                            Ok(FlushStrategy::Default)
                        }
                    },
                    _ => {
                        debug!("Invalid flush strategy: {}, using default", value);
                        Ok(FlushStrategy::Default)
                    }
                }
            }
        }
    }
}
