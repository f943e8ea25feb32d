// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # APM Agent
//!
//! In-process application performance monitoring agent. It is embedded inside a
//! host process (a web worker or a background-job worker), captures structured
//! records of units of work ("transactions") and delivers them in compressed
//! batches to a remote collection endpoint.
//!
//! ## Architecture
//!
//! ```text
//!   host threads                          background thread
//!   ────────────                          ─────────────────
//!   Monitor::create_transaction
//!        │  add_event / instrument
//!        ▼
//!   Transaction ──complete──► Agent::enqueue ──► Aggregator
//!        │                                          │ swap
//!        │ (forked child)                           ▼
//!        └──► IpcClient ═══ unix socket ═══►  PostProcessor ─► Payload
//!                              IpcServer            │
//!                              (master)             ▼
//!                                              RetryQueue ─► Transmitter
//! ```
//!
//! - [`monitor`]: the collaborator-facing service object
//! - [`transaction`]: transaction lifecycle, sanitization and wire formatting
//! - [`aggregator`]: completed-transaction buffer and post-processing chain
//! - [`agent`]: background delivery loop, retry queue and fork handling
//! - [`ipc`]: forwarding of transactions from forked children to the master
//! - [`transmitter`]: HTTP delivery of payloads

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::module_name_repetitions)]

/// Delivery loop, retry queue and fork lifecycle
pub mod agent;

/// Completed-transaction buffer and the post-processing chain
pub mod aggregator;

/// Configuration from YAML files, environment variables and defaults
pub mod config;

/// Timed instrumentation events
pub mod event;

/// HTTP client construction
pub mod http;

/// Cross-process forwarding of completed transactions
pub mod ipc;

/// Logging infrastructure and tracing setup
pub mod logger;

/// Collaborator-facing service object
pub mod monitor;

/// Synchronous instrumentation bus
pub mod notifications;

/// Serialized and compressed batches
pub mod payload;

/// Process utilities - pid and hostname
pub mod proc;

/// Unit-of-work records
pub mod transaction;

/// Payload delivery to the collection endpoint
pub mod transmitter;

mod util;

/// Client version reported to the collection endpoint on every request.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs the agent version at INFO level.
pub fn log_build_info() {
    tracing::info!("apm-agent version: {}", AGENT_VERSION);
}
