// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Browser-side error reports.
//!
//! A report posted by the frontend instrumentation becomes a failed
//! transaction of kind `frontend`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::transaction::{ExceptionRecord, Kind, Transaction};
use crate::util::epoch_seconds;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendError {
    /// Error class, e.g. `TypeError`.
    pub name: String,
    pub message: String,
    pub backtrace: Vec<String>,
    pub action: Option<String>,
    pub path: Option<String>,
    pub environment: Map<String, Value>,
    pub tags: Map<String, Value>,
}

impl FrontendError {
    /// Converts the report into a transaction with a fresh id. The report is
    /// already in primitive form, so the result is marked sanitized.
    #[must_use]
    pub fn into_transaction(self) -> Transaction {
        Transaction {
            request_id: Uuid::new_v4().to_string(),
            kind: Kind::Frontend,
            action: self.action,
            path: self.path,
            time: Some(epoch_seconds()),
            exception: Some(ExceptionRecord {
                exception: self.name,
                message: self.message,
                backtrace: self.backtrace,
            }),
            tags: crate::transaction::sanitizer::sanitize_tags(self.tags),
            sanitized_environment: self.environment,
            sanitized: true,
            ..Transaction::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::formatter::{format, FormatOptions};
    use serde_json::json;

    #[test]
    fn test_report_becomes_failed_frontend_transaction() {
        let report: FrontendError = serde_json::from_value(json!({
            "name": "TypeError",
            "message": "undefined is not a function",
            "backtrace": ["app.js:1:10"],
            "action": "Checkout#show",
            "path": "/checkout",
            "environment": {"HTTP_USER_AGENT": "Firefox"},
            "tags": {"release": "v2", "ratio": 0.5},
        }))
        .expect("valid report");

        let txn = report.into_transaction();
        assert_eq!(txn.kind(), Kind::Frontend);
        assert!(txn.is_sanitized());
        assert!(txn.is_completable());
        assert_eq!(txn.request_id().len(), 36);

        let record = format(&txn, &FormatOptions::default());
        assert!(record.failed);
        assert_eq!(record.log_entry.kind, Kind::Frontend);
        assert_eq!(record.log_entry.path.as_deref(), Some("/checkout"));
        assert_eq!(record.log_entry.action.as_deref(), Some("Checkout#show"));
        assert_eq!(
            record.log_entry.tags,
            Some(crate::transaction::tests::object(json!({"release": "v2"})))
        );
        let exception = record.exception.expect("exception");
        assert_eq!(exception.exception, "TypeError");
        assert_eq!(exception.backtrace, vec!["app.js:1:10"]);
    }
}
