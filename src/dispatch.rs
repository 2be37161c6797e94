//! In-process event dispatcher
//!
//! Typed publish/subscribe with one handler per event kind. A later
//! `subscribe` for the same kind replaces the earlier handler; the display
//! layer relies on this last-subscriber-wins overwrite to coalesce
//! re-renders, so it is a contract here, not an accident.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::types::{Event, EventKind};

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous event fan-out point between the transports and consumers
#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<HashMap<EventKind, Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any existing handler
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.insert(kind, Arc::new(handler));
    }

    /// Drop the handler for `kind`, if any
    pub fn unsubscribe(&self, kind: EventKind) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&kind);
    }

    /// Deliver `event` to the matching handler, if one is registered.
    ///
    /// Delivery is synchronous and in publish order from the caller's point
    /// of view. A panicking handler is caught and logged; publishing never
    /// fails because of a consumer. The handler is invoked outside the
    /// registry lock so handlers may publish follow-up events.
    pub fn publish(&self, event: &Event) {
        let handler = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.get(&event.kind()).cloned()
        };

        if let Some(handler) = handler {
            let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                warn!(kind = ?event.kind(), "event handler panicked; delivery continues");
            }
        }
    }

    /// Number of registered handlers (diagnostics only)
    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionState, Tick, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tick_event(symbol: &str) -> Event {
        Event::Tick(Tick {
            symbol: symbol.to_string(),
            time: 1,
            bid: 1.0,
            ask: 1.1,
            last: 1.05,
            volume: 1,
            flags: 0,
        })
    }

    #[test]
    fn test_publish_reaches_subscriber() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        dispatcher.subscribe(EventKind::Tick, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.publish(&tick_event("EURUSD"));
        dispatcher.publish(&tick_event("EURUSD"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_last_subscriber_wins() {
        let dispatcher = Dispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_clone = first.clone();
        dispatcher.subscribe(EventKind::Tick, move |_| {
            first_clone.fetch_add(1, Ordering::SeqCst);
        });
        let second_clone = second.clone();
        dispatcher.subscribe(EventKind::Tick, move |_| {
            second_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.publish(&tick_event("EURUSD"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        dispatcher.subscribe(EventKind::Tick, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.unsubscribe(EventKind::Tick);
        dispatcher.publish(&tick_event("EURUSD"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_poison_publish() {
        let dispatcher = Dispatcher::new();
        dispatcher.subscribe(EventKind::Tick, |_| panic!("consumer bug"));

        // Must not propagate to the publisher.
        dispatcher.publish(&tick_event("EURUSD"));

        // Registry still works afterwards.
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        dispatcher.subscribe(EventKind::Connection, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.publish(&Event::Connection(ConnectionState::disconnected(
            TransportKind::Socket,
        )));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_publish_followup_events() {
        let dispatcher = Arc::new(Dispatcher::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let inner = dispatcher.clone();
        dispatcher.subscribe(EventKind::Tick, move |_| {
            inner.publish(&Event::Connection(ConnectionState::disconnected(
                TransportKind::Socket,
            )));
        });
        let hits_clone = hits.clone();
        dispatcher.subscribe(EventKind::Connection, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.publish(&tick_event("EURUSD"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
