// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarding of completed transactions from forked workers to the master.
//!
//! The master process starts an [`server::IpcServer`] on a Unix socket
//! before the host forks. Each child drops its copy of the server handle,
//! connects an [`client::IpcClient`] to the same path and sends its
//! transactions there instead of delivering them itself.
//!
//! Every message is a 4-byte big-endian length followed by a JSON encoded
//! transaction. The server answers each message with a length-prefixed
//! single byte: [`ACCEPTED`] or [`REJECTED`].

pub mod client;
pub mod server;
pub mod socket;

use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

pub const ACCEPTED: u8 = 1;
pub const REJECTED: u8 = 0;

/// Largest transaction frame accepted by the server.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode transaction: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transaction rejected by server")]
    Rejected,
    #[error("invalid socket path: {0}")]
    InvalidPath(String),
    #[error("frame of {0} bytes exceeds the maximum length")]
    FrameTooLarge(usize),
    #[error("unexpected acknowledgement of {0} bytes")]
    UnexpectedAck(u32),
}

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}
