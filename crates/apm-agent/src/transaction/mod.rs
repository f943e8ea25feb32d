// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unit-of-work records.
//!
//! A [`Transaction`] is created by a collaborator when a request or job
//! starts, accumulates [`Event`]s while it runs and is handed to the agent on
//! completion. Its lifecycle:
//!
//! ```text
//!   new ──► add_event / set_primary_* / set_tags / add_exception
//!    │
//!    ▼
//!   sanitize_to_primitive_form   (once; raw environment released)
//!    │
//!    ├──► truncate               (regular requests: payloads dropped)
//!    ├──► clear_events           (exceptions: secondary events dropped)
//!    ▼
//!   formatter::format ──► TransactionRecord (wire form)
//! ```
//!
//! Everything that crosses a process or serialization boundary must be
//! sanitized first; the raw environment is never serialized.

pub mod formatter;
pub mod frontend;
pub mod queue_start;
pub mod registry;
pub mod sanitizer;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::Config;
use crate::event::Event;
use crate::util::epoch_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    #[default]
    HttpRequest,
    BackgroundJob,
    Exception,
    Frontend,
}

impl Kind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::HttpRequest => "http_request",
            Kind::BackgroundJob => "background_job",
            Kind::Exception => "exception",
            Kind::Frontend => "frontend",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived classification deciding how much of a transaction is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Exception,
    SlowRequest,
    RegularRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub exception: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

/// An error as reported by the host: class name, message and raw backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedError {
    pub class_name: String,
    pub message: String,
    pub backtrace: Option<Vec<String>>,
}

impl CapturedError {
    #[must_use]
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        CapturedError {
            class_name: class_name.into(),
            message: message.into(),
            backtrace: None,
        }
    }

    #[must_use]
    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = Some(backtrace);
        self
    }

    /// Captures a Rust error, using its type name (without module path) as
    /// the class name.
    #[must_use]
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        CapturedError::new(short_type_name(std::any::type_name::<E>()), err.to_string())
    }
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Hook used to strip framework frames from backtraces before they are
/// recorded.
pub trait BacktraceCleaner: Send + Sync {
    fn clean(&self, backtrace: &[String]) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCleaner;

impl BacktraceCleaner for PassthroughCleaner {
    fn clean(&self, backtrace: &[String]) -> Vec<String> {
        backtrace.to_vec()
    }
}

/// Raw request context: CGI-style header map plus the optional session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionContext {
    pub env: HashMap<String, String>,
    pub session: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionDefaults {
    pub params: Map<String, Value>,
    pub tags: Map<String, Value>,
    pub kind: Option<Kind>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transaction {
    request_id: String,
    kind: Kind,
    action: Option<String>,
    events: Vec<Event>,
    primary_event: Option<Event>,
    exception: Option<ExceptionRecord>,
    tags: Map<String, Value>,
    params: Map<String, Value>,
    paused: bool,
    queue_start: Option<f64>,
    time: Option<f64>,
    path: Option<String>,
    truncated: bool,
    sanitized: bool,
    sanitized_environment: Map<String, Value>,
    sanitized_session_data: Map<String, Value>,
    sanitized_params: Map<String, Value>,
    #[serde(skip)]
    context: Option<TransactionContext>,
}

impl Transaction {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        context: TransactionContext,
        defaults: TransactionDefaults,
    ) -> Self {
        Transaction {
            request_id: request_id.into(),
            kind: defaults.kind.unwrap_or_default(),
            action: defaults.action,
            params: defaults.params,
            tags: defaults.tags,
            context: Some(context),
            ..Transaction::default()
        }
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub(crate) fn events_mut(&mut self) -> &mut [Event] {
        &mut self.events
    }

    #[must_use]
    pub fn primary_event(&self) -> Option<&Event> {
        self.primary_event.as_ref()
    }

    #[must_use]
    pub fn exception(&self) -> Option<&ExceptionRecord> {
        self.exception.as_ref()
    }

    #[must_use]
    pub fn tags(&self) -> &Map<String, Value> {
        &self.tags
    }

    #[must_use]
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub fn queue_start(&self) -> Option<f64> {
        self.queue_start
    }

    #[must_use]
    pub fn time(&self) -> Option<f64> {
        self.time
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    #[must_use]
    pub fn is_sanitized(&self) -> bool {
        self.sanitized
    }

    /// The raw request environment; `None` once sanitized or truncated.
    #[must_use]
    pub fn env(&self) -> Option<&HashMap<String, String>> {
        self.context.as_ref().map(|c| &c.env)
    }

    #[must_use]
    pub fn sanitized_environment(&self) -> &Map<String, Value> {
        &self.sanitized_environment
    }

    #[must_use]
    pub fn sanitized_session_data(&self) -> &Map<String, Value> {
        &self.sanitized_session_data
    }

    #[must_use]
    pub fn sanitized_params(&self) -> &Map<String, Value> {
        &self.sanitized_params
    }

    /// Appends `event` unless capture is paused.
    pub fn add_event(&mut self, event: Event) {
        if !self.paused {
            self.events.push(event);
        }
    }

    pub fn set_primary_request_event(&mut self, event: &Event) {
        let controller = event.payload_str("controller");
        let action = event.payload_str("action");
        self.action = match (controller, action) {
            (Some(controller), action) => Some(format!("{controller}#{}", action.unwrap_or(""))),
            (None, action) => action.map(ToString::to_string),
        };
        self.kind = Kind::HttpRequest;
        self.primary_event = Some(event.clone());

        if let Some(queue_start) = self
            .context
            .as_ref()
            .and_then(|context| queue_start::http_queue_start(&context.env))
        {
            debug!("Setting http queue start: {}", queue_start);
            self.queue_start = Some(queue_start);
        }
    }

    pub fn set_primary_job_event(&mut self, event: &Event) {
        self.action = Some(format!(
            "{}#{}",
            event.payload_str("class").unwrap_or(""),
            event.payload_str("method").unwrap_or("")
        ));
        self.kind = Kind::BackgroundJob;
        self.primary_event = Some(event.clone());

        if let Some(queue_start) = queue_start::job_queue_start(&event.payload) {
            debug!("Setting background queue start: {}", queue_start);
            self.queue_start = Some(queue_start);
        }
    }

    /// Merges `tags` into the existing tags. Invalid tags are dropped when the
    /// transaction is sanitized.
    pub fn set_tags(&mut self, tags: Map<String, Value>) {
        self.tags.extend(tags);
    }

    pub fn add_exception(&mut self, error: &CapturedError, cleaner: &dyn BacktraceCleaner) {
        debug!(
            "Adding {} to transaction: {}",
            error.class_name, self.request_id
        );
        self.time = Some(epoch_seconds());
        self.exception = Some(ExceptionRecord {
            exception: error.class_name.clone(),
            message: error.message.clone(),
            backtrace: error
                .backtrace
                .as_deref()
                .map(|trace| cleaner.clean(trace))
                .unwrap_or_default(),
        });
    }

    #[must_use]
    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// A transaction without a primary event or exception is a heartbeat and
    /// is not delivered.
    #[must_use]
    pub fn is_completable(&self) -> bool {
        self.primary_event.is_some() || self.exception.is_some()
    }

    #[must_use]
    pub fn transaction_type(&self, slow_request_threshold: Duration) -> TransactionType {
        if self.has_exception() {
            return TransactionType::Exception;
        }
        match &self.primary_event {
            Some(event) if event.duration() >= slow_request_threshold.as_secs_f64() * 1000.0 => {
                TransactionType::SlowRequest
            }
            _ => TransactionType::RegularRequest,
        }
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Drops everything but the summary of the transaction. Irreversible.
    pub fn truncate(&mut self) {
        if self.truncated {
            return;
        }
        if let Some(event) = &mut self.primary_event {
            event.payload.clear();
        }
        self.events.clear();
        self.tags.clear();
        self.sanitized_environment.clear();
        self.sanitized_session_data.clear();
        self.sanitized_params.clear();
        self.context = None;
        self.truncated = true;
    }

    /// Converts the transaction into the form that may be serialized:
    /// payloads filtered, environment whitelisted, tags validated, raw
    /// context released. Idempotent.
    pub fn sanitize_to_primitive_form(&mut self, config: &Config) {
        if self.sanitized {
            return;
        }
        let filter = &config.filter_parameters;
        if let Some(event) = &mut self.primary_event {
            sanitizer::sanitize_map(&mut event.payload, filter);
        }
        for event in &mut self.events {
            sanitizer::sanitize_map(&mut event.payload, filter);
        }

        if let Some(context) = self.context.take() {
            self.sanitized_environment = sanitizer::sanitize_environment(&context.env);
            if self.kind == Kind::HttpRequest {
                if !config.skip_session_data {
                    if let Some(mut session) = context.session {
                        sanitizer::sanitize_map(&mut session, filter);
                        self.sanitized_session_data = session;
                    }
                }
                self.path = sanitizer::request_path(&context.env);
            }
        }

        self.tags = sanitizer::sanitize_tags(std::mem::take(&mut self.tags));

        if config.send_params {
            let mut params = self.params.clone();
            sanitizer::sanitize_map(&mut params, filter);
            self.sanitized_params = params;
        }
        self.sanitized = true;
    }
}
