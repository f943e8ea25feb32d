// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire form of a completed transaction.
//!
//! ```json
//! {
//!   "request_id": "1",
//!   "log_entry": {
//!     "action": "BlogPostsController#show", "duration": 100.0,
//!     "end": 1389783600.1, "time": 1389783600.0, "kind": "http_request",
//!     "path": "/blog", "environment": {}, "session_data": {}, "params": {},
//!     "revision": null, "queue_duration": 40.0, "tags": {"user_id": 1},
//!     "status": "200"
//!   },
//!   "events": [{"name": "sql.query", "duration": 1.5, "time": 0, "end": 0, "payload": {}}],
//!   "exception": {"exception": "ArgumentError", "message": "oh no", "backtrace": []},
//!   "failed": true
//! }
//! ```
//!
//! Primary payload fields other than the ones the agent derives its own keys
//! from are copied into `log_entry` (`status` above).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::event::Event;
use crate::transaction::{ExceptionRecord, Kind, Transaction, TransactionType};

/// Primary payload fields that are never copied into `log_entry`.
const EXCLUDED_PAYLOAD_KEYS: &[&str] = &[
    "controller",
    "action",
    "params",
    "path",
    "class",
    "method",
    "queue_start",
    "duration",
    "end",
    "environment",
    "kind",
    "session_data",
    "revision",
    "time",
    "queue_duration",
    "tags",
];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FormatOptions {
    pub slow_request_threshold: Duration,
    pub send_params: bool,
    pub revision: Option<String>,
}

impl FormatOptions {
    #[must_use]
    pub fn from_config(config: &Config, revision: Option<String>) -> Self {
        FormatOptions {
            slow_request_threshold: config.slow_request_threshold,
            send_params: config.send_params,
            revision,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub request_id: String,
    pub log_entry: LogEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionRecord>,
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    pub environment: Map<String, Value>,
    pub kind: Kind,
    pub path: Option<String>,
    pub session_data: Map<String, Value>,
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    pub duration: f64,
    pub time: f64,
    pub end: f64,
    pub payload: Map<String, Value>,
}

impl From<&Event> for EventRecord {
    fn from(event: &Event) -> Self {
        EventRecord {
            name: event.name.clone(),
            duration: event.duration(),
            time: event.time,
            end: event.end,
            payload: event.payload.clone(),
        }
    }
}

#[must_use]
pub fn format(transaction: &Transaction, options: &FormatOptions) -> TransactionRecord {
    let primary = transaction.primary_event();
    let time = primary.map(|event| event.time).or(transaction.time());

    let queue_duration = match (transaction.queue_start(), time) {
        (Some(queue_start), Some(time)) if queue_start > 0.0 => {
            Some((time - queue_start) * 1000.0)
        }
        _ => None,
    };

    let path = transaction
        .path()
        .or_else(|| primary.and_then(|event| event.payload_str("path")))
        .map(ToString::to_string);

    let extra = primary
        .map(|event| {
            event
                .payload
                .iter()
                .filter(|(key, _)| !EXCLUDED_PAYLOAD_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default();

    let tags = (!transaction.tags().is_empty()).then(|| transaction.tags().clone());

    let log_entry = LogEntry {
        action: transaction.action().map(ToString::to_string),
        duration: primary.map(Event::duration),
        end: primary.map(|event| event.end),
        environment: transaction.sanitized_environment().clone(),
        kind: transaction.kind(),
        path,
        session_data: transaction.sanitized_session_data().clone(),
        revision: options.revision.clone(),
        params: options
            .send_params
            .then(|| transaction.sanitized_params().clone()),
        time,
        queue_duration,
        tags,
        extra,
    };

    let events = (transaction.transaction_type(options.slow_request_threshold)
        == TransactionType::SlowRequest)
        .then(|| transaction.events().iter().map(EventRecord::from).collect());

    TransactionRecord {
        request_id: transaction.request_id().to_string(),
        log_entry,
        events,
        exception: transaction.exception().cloned(),
        failed: transaction.has_exception(),
    }
}
