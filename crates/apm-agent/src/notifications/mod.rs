// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synchronous instrumentation bus.
//!
//! Instrumented code publishes [`Event`]s; every subscriber is called on the
//! publishing thread before `publish` returns, so a subscriber can rely on
//! thread-local state such as the current transaction.
//!
//! Events whose name starts with `!` are internal to the instrumented library
//! and are not delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use crate::event::Event;

pub const INTERNAL_EVENT_PREFIX: char = '!';

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct Notifications {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl Notifications {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, subscriber));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, event: &Event) {
        if event.name.starts_with(INTERNAL_EVENT_PREFIX) {
            return;
        }
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();
        for subscriber in subscribers {
            subscriber(event);
        }
    }

    /// Times `f` and publishes the resulting event, returning `f`'s result.
    pub fn instrument<T>(
        &self,
        name: &str,
        payload: Map<String, Value>,
        f: impl FnOnce() -> T,
    ) -> T {
        let (event, result) = Event::measure(name, payload, f);
        self.publish(&event);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Subscriber) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let clone = seen.clone();
        let subscriber: Subscriber = Arc::new(move |event: &Event| {
            clone.lock().expect("lock poisoned").push(event.name.clone());
        });
        (seen, subscriber)
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let bus = Notifications::new();
        let (first, a) = recorder();
        let (second, b) = recorder();
        bus.subscribe(a);
        bus.subscribe(b);

        bus.publish(&Event::new("sql.query", 0.0, 1.0, Map::new()));

        assert_eq!(*first.lock().expect("lock poisoned"), vec!["sql.query"]);
        assert_eq!(*second.lock().expect("lock poisoned"), vec!["sql.query"]);
    }

    #[test]
    fn test_internal_events_are_not_delivered() {
        let bus = Notifications::new();
        let (seen, subscriber) = recorder();
        bus.subscribe(subscriber);

        bus.publish(&Event::new("!render_template", 0.0, 1.0, Map::new()));

        assert!(seen.lock().expect("lock poisoned").is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = Notifications::new();
        let (seen, subscriber) = recorder();
        let id = bus.subscribe(subscriber);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(&Event::new("sql.query", 0.0, 1.0, Map::new()));
        assert!(seen.lock().expect("lock poisoned").is_empty());
    }

    #[test]
    fn test_instrument_returns_result_and_publishes() {
        let bus = Notifications::new();
        let (seen, subscriber) = recorder();
        bus.subscribe(subscriber);

        let value = bus.instrument("render.view", Map::new(), || "html");

        assert_eq!(value, "html");
        assert_eq!(*seen.lock().expect("lock poisoned"), vec!["render.view"]);
    }
}
