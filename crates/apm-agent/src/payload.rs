// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A batch of transaction records, serialized as a JSON array and gzipped.

use std::io::Write;

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use thiserror::Error;

use crate::transaction::formatter::TransactionRecord;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to compress payload: {0}")]
    Compress(#[from] std::io::Error),
}

/// Compressed request body. Cloning is cheap; retries reuse the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    body: Bytes,
    records: usize,
}

impl Payload {
    pub fn build(records: &[TransactionRecord]) -> Result<Self, PayloadError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut encoder, records)?;
        encoder.flush()?;
        let body = encoder.finish()?;
        Ok(Payload {
            body: Bytes::from(body),
            records: records.len(),
        })
    }

    #[must_use]
    pub fn body(&self) -> Bytes {
        self.body.clone()
    }

    /// Number of transaction records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transaction::formatter::{format, FormatOptions};
    use crate::transaction::tests::request_event;
    use crate::transaction::{Transaction, TransactionContext, TransactionDefaults};
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_body_is_gzipped_json_array() {
        let mut txn = Transaction::new(
            "abc",
            TransactionContext::default(),
            TransactionDefaults::default(),
        );
        txn.set_primary_request_event(&request_event(1_389_783_600.0, 100.0));
        txn.sanitize_to_primitive_form(&Config::default());
        let record = format(&txn, &FormatOptions::default());

        let payload = Payload::build(&[record]).expect("payload");
        assert_eq!(payload.len(), 1);

        let body = payload.body();
        let mut decoder = GzDecoder::new(&body[..]);
        let mut json = String::new();
        decoder.read_to_string(&mut json).expect("gunzip");

        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        let array = value.as_array().expect("array");
        assert_eq!(array.len(), 1);
        assert_eq!(array[0]["request_id"], "abc");
    }

    #[test]
    fn test_empty_batch() {
        let payload = Payload::build(&[]).expect("payload");
        assert!(payload.is_empty());
        let body = payload.body();
        let mut decoder = GzDecoder::new(&body[..]);
        let mut json = String::new();
        decoder.read_to_string(&mut json).expect("gunzip");
        assert_eq!(json, "[]");
    }
}
