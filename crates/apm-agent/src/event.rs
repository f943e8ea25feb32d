// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named, timed instrumentation events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::epoch_seconds;

/// A named span of work. `time` and `end` are fractional seconds since the
/// Unix epoch; `payload` carries whatever the instrumentation recorded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub time: f64,
    pub end: f64,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    #[must_use]
    pub fn new(name: impl Into<String>, time: f64, end: f64, payload: Map<String, Value>) -> Self {
        Event {
            name: name.into(),
            time,
            end,
            payload,
        }
    }

    /// Runs `f`, returning its result with an event spanning the call.
    pub fn measure<T>(
        name: impl Into<String>,
        payload: Map<String, Value>,
        f: impl FnOnce() -> T,
    ) -> (Event, T) {
        let time = epoch_seconds();
        let result = f();
        let end = epoch_seconds();
        (Event::new(name, time, end, payload), result)
    }

    /// Elapsed time in milliseconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        (self.end - self.time) * 1000.0
    }

    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
