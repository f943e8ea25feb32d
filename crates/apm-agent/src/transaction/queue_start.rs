// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Queue start extraction.
//!
//! Front-end proxies stamp requests with the time they entered the queue, in
//! microseconds or milliseconds and sometimes with a `t=` prefix. The value is
//! stripped to its digits and scaled by 1/1 000 000, then by 1/1 000, keeping
//! the first result later than the year 2000. When neither scale passes, the
//! last one tried is kept.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// 2000-01-01 in epoch seconds; earlier results are treated as mis-scaled.
pub const MIN_QUEUE_START: f64 = 946_681_200.0;

/// Checked in order; the first present header wins.
pub const QUEUE_START_HEADERS: [&str; 2] = ["HTTP_X_QUEUE_START", "HTTP_X_REQUEST_START"];

const SCALE_FACTORS: [f64; 2] = [1_000_000.0, 1_000.0];

#[must_use]
pub fn http_queue_start(env: &HashMap<String, String>) -> Option<f64> {
    QUEUE_START_HEADERS
        .iter()
        .find_map(|header| env.get(*header))
        .and_then(|raw| parse_queue_start(raw))
}

#[must_use]
pub fn parse_queue_start(raw: &str) -> Option<f64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let value: f64 = digits.parse().ok()?;

    let mut queue_start = value / SCALE_FACTORS[0];
    for factor in &SCALE_FACTORS[1..] {
        if queue_start > MIN_QUEUE_START {
            break;
        }
        queue_start = value / factor;
    }
    Some(queue_start)
}

/// Background jobs report their enqueue time in the `queue_start` payload
/// field, in epoch seconds.
#[must_use]
pub fn job_queue_start(payload: &Map<String, Value>) -> Option<f64> {
    match payload.get("queue_start")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
