// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live transactions and the per-thread "current transaction".
//!
//! The registry maps request ids to in-flight transactions. Each host thread
//! remembers the id of the transaction it is working on; `current` resolves
//! that id through the registry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::transaction::Transaction;
use crate::util::lock;

pub type SharedTransaction = Arc<Mutex<Transaction>>;

thread_local! {
    static CURRENT: RefCell<Option<String>> = const { RefCell::new(None) };
}

#[derive(Default)]
pub struct Registry {
    live: Mutex<HashMap<String, SharedTransaction>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transaction` and makes it current on the calling thread.
    pub fn register(&self, transaction: Transaction) -> SharedTransaction {
        let id = transaction.request_id().to_string();
        let shared = Arc::new(Mutex::new(transaction));
        lock(&self.live).insert(id.clone(), shared.clone());
        set_current_id(Some(id));
        shared
    }

    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<SharedTransaction> {
        lock(&self.live).get(request_id).cloned()
    }

    pub fn remove(&self, request_id: &str) -> Option<SharedTransaction> {
        lock(&self.live).remove(request_id)
    }

    /// The transaction associated with the calling thread, if it is still live.
    #[must_use]
    pub fn current(&self) -> Option<SharedTransaction> {
        current_id().and_then(|id| self.get(&id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[must_use]
pub fn current_id() -> Option<String> {
    CURRENT.with(|current| current.borrow().clone())
}

pub fn set_current_id(id: Option<String>) {
    CURRENT.with(|current| *current.borrow_mut() = id);
}

/// Clears the calling thread's association if it still points at `request_id`.
pub fn clear_current_if(request_id: &str) {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current.as_deref() == Some(request_id) {
            *current = None;
        }
    });
}
