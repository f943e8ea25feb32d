// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payloads awaiting acknowledgement, most recent first.
//!
//! Entries carry a stable id so that a send cycle can work on a snapshot and
//! remove exactly the entries that were acknowledged, even when another
//! caller pushed a new batch in the meantime.

use std::collections::VecDeque;

use crate::payload::Payload;

#[derive(Debug, Clone)]
pub struct QueuedPayload {
    pub id: u64,
    pub payload: Payload,
}

#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<QueuedPayload>,
    next_id: u64,
}

impl RetryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `payload` ahead of every older entry and returns its id.
    pub fn push_front(&mut self, payload: Payload) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_front(QueuedPayload { id, payload });
        id
    }

    /// Copies of the queued entries in delivery order. Payload bodies are
    /// reference counted, so this does not copy the compressed bytes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueuedPayload> {
        self.entries.iter().cloned().collect()
    }

    /// Returns whether an entry with `id` was queued.
    pub fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|entry| entry.id == id) {
            Some(index) => self.entries.remove(index).is_some(),
            None => false,
        }
    }

    /// Keeps the `limit` most recent entries, returning how many were dropped.
    pub fn truncate(&mut self, limit: usize) -> usize {
        let dropped = self.entries.len().saturating_sub(limit);
        self.entries.truncate(limit);
        dropped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Payload {
        Payload::build(&[]).expect("payload")
    }

    #[test]
    fn test_most_recent_first() {
        let mut queue = RetryQueue::new();
        let first = queue.push_front(payload());
        let second = queue.push_front(payload());
        let ids: Vec<u64> = queue.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = RetryQueue::new();
        let first = queue.push_front(payload());
        let second = queue.push_front(payload());
        assert!(queue.remove(first));
        assert!(!queue.remove(first));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.snapshot()[0].id, second);
    }

    #[test]
    fn test_truncate_keeps_newest() {
        let mut queue = RetryQueue::new();
        let ids: Vec<u64> = (0..5).map(|_| queue.push_front(payload())).collect();
        assert_eq!(queue.truncate(3), 2);
        let kept: Vec<u64> = queue.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(kept, vec![ids[4], ids[3], ids[2]]);
        assert_eq!(queue.truncate(3), 0);
    }
}
