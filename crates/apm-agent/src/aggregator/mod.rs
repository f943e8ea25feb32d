// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffer of completed transactions.
//!
//! Request threads append to the active buffer; the delivery loop detaches
//! it in one short exclusive section, leaving an empty buffer behind, and
//! post-processes the detached transactions without holding any lock.
//! Transactions completed while a batch is being processed land in the new
//! buffer.
//!
//! On append a transaction is sanitized and then reduced by type:
//!
//! | type              | kept                        |
//! |-------------------|-----------------------------|
//! | `regular_request` | summary only (`truncate`)   |
//! | `exception`       | no secondary events         |
//! | `slow_request`    | everything                  |

pub mod middleware;
pub mod post_processor;

use std::sync::Mutex;

use crate::aggregator::post_processor::PostProcessor;
use crate::config::Config;
use crate::transaction::formatter::TransactionRecord;
use crate::transaction::{Transaction, TransactionType};
use crate::util::lock;

/// Sanitizes `transaction` and drops what its type does not need.
#[must_use]
pub fn prepare(mut transaction: Transaction, config: &Config) -> Transaction {
    transaction.sanitize_to_primitive_form(config);
    match transaction.transaction_type(config.slow_request_threshold) {
        TransactionType::RegularRequest => transaction.truncate(),
        TransactionType::Exception => transaction.clear_events(),
        TransactionType::SlowRequest => {}
    }
    transaction
}

#[derive(Debug, Default)]
pub struct Aggregator {
    transactions: Vec<Transaction>,
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, transaction: Transaction, config: &Config) {
        self.transactions.push(prepare(transaction, config));
    }

    pub(crate) fn push(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.transactions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    #[must_use]
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    #[must_use]
    pub fn into_transactions(self) -> Vec<Transaction> {
        self.transactions
    }
}

/// The active buffer of one agent generation, shared between request
/// threads and the delivery loop.
#[derive(Debug, Default)]
pub struct SharedAggregator {
    active: Mutex<Aggregator>,
}

impl SharedAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares `transaction` on the calling thread, then appends it.
    pub fn add(&self, transaction: Transaction, config: &Config) {
        let prepared = prepare(transaction, config);
        lock(&self.active).push(prepared);
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        lock(&self.active).has_pending()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swaps the active buffer for an empty one and returns the old one.
    #[must_use]
    pub fn detach(&self) -> Aggregator {
        std::mem::take(&mut *lock(&self.active))
    }

    #[must_use]
    pub fn drain_and_post_process(&self, post_processor: &PostProcessor) -> Vec<TransactionRecord> {
        let detached = self.detach();
        post_processor.post_process(detached.into_transactions())
    }
}
