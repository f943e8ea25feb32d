// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::aggregator::middleware::{Capabilities, MiddlewareChain};
use crate::config::Config;
use crate::transaction::formatter::{self, FormatOptions, TransactionRecord};
use crate::transaction::Transaction;

/// Turns detached transactions into wire records: sanitize, run the
/// middleware chain over every secondary event, format.
pub struct PostProcessor {
    config: Arc<Config>,
    chain: MiddlewareChain,
    options: FormatOptions,
}

impl PostProcessor {
    #[must_use]
    pub fn new(config: Arc<Config>, chain: MiddlewareChain, revision: Option<String>) -> Self {
        let options = FormatOptions::from_config(&config, revision);
        PostProcessor {
            config,
            chain,
            options,
        }
    }

    /// Uses the default chain for the capabilities enabled in `config`.
    #[must_use]
    pub fn from_config(config: Arc<Config>, revision: Option<String>) -> Self {
        let chain =
            MiddlewareChain::default_chain(Capabilities::from_config(&config), &config.root_path);
        PostProcessor::new(config, chain, revision)
    }

    #[must_use]
    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    #[must_use]
    pub fn revision(&self) -> Option<&str> {
        self.options.revision.as_deref()
    }

    #[must_use]
    pub fn process(&self, mut transaction: Transaction) -> TransactionRecord {
        transaction.sanitize_to_primitive_form(&self.config);
        for event in transaction.events_mut() {
            self.chain.invoke(event);
        }
        formatter::format(&transaction, &self.options)
    }

    #[must_use]
    pub fn post_process(&self, transactions: Vec<Transaction>) -> Vec<TransactionRecord> {
        transactions
            .into_iter()
            .map(|transaction| self.process(transaction))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::transaction::tests::{object, request_event};
    use crate::transaction::{TransactionContext, TransactionDefaults};
    use serde_json::json;

    #[test]
    fn test_post_process_runs_chain_on_events() {
        let config = Arc::new(Config {
            enable_orm_sanitizer: true,
            ..Config::default()
        });
        let processor = PostProcessor::from_config(config, Some("rev-1".to_string()));
        assert_eq!(processor.chain().len(), 2);

        let mut txn = Transaction::new(
            "1",
            TransactionContext::default(),
            TransactionDefaults::default(),
        );
        txn.set_primary_request_event(&request_event(0.0, 500.0));
        txn.add_event(Event::new(
            "sql.active_record",
            0.0,
            0.1,
            object(json!({"sql": "SELECT 1", "binds": [], "connection_id": 9, "name": null})),
        ));

        let records = processor.post_process(vec![txn]);
        assert_eq!(records.len(), 1);
        let events = records[0].events.as_ref().expect("slow request events");
        assert_eq!(events[0].payload, object(json!({"sql": "SELECT 1"})));
        assert_eq!(records[0].log_entry.revision.as_deref(), Some("rev-1"));
    }
}
