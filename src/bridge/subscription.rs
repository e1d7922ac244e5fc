//! Pipeline subscription registry
//!
//! Records which listener wants which event kinds. Every change wakes all
//! waiters, so a synchronous post blocked on "nobody listens yet" resumes as
//! soon as a pipeline subscribes instead of polling.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use super::event::EventKind;

/// Identity of a connected pipeline listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Subscriptions {
    listeners: HashMap<ListenerId, HashSet<EventKind>>,
    /// Listeners subscribed to `GetCapsSupports`
    caps_subscribers: usize,
}

impl Subscriptions {
    fn is_subscribed(&self, kind: EventKind) -> bool {
        self.listeners.values().any(|kinds| kinds.contains(&kind))
    }
}

/// Per-device subscription table
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Subscriptions>,
    changed: Condvar,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to `kind`; returns false if already subscribed
    pub fn subscribe(&self, listener: ListenerId, kind: EventKind) -> bool {
        let mut inner = self.inner.lock();
        let added = inner.listeners.entry(listener).or_default().insert(kind);
        if added {
            if kind == EventKind::GetCapsSupports {
                inner.caps_subscribers += 1;
            }
            debug!("{} subscribed to {}", listener, kind);
            self.changed.notify_all();
        }
        added
    }

    /// Unsubscribe `listener` from `kind`; returns false if it was not subscribed
    pub fn unsubscribe(&self, listener: ListenerId, kind: EventKind) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner
            .listeners
            .get_mut(&listener)
            .map(|kinds| kinds.remove(&kind))
            .unwrap_or(false);
        if removed {
            if kind == EventKind::GetCapsSupports {
                inner.caps_subscribers = inner.caps_subscribers.saturating_sub(1);
            }
            debug!("{} unsubscribed from {}", listener, kind);
            self.changed.notify_all();
        }
        removed
    }

    /// Drop every subscription of a disconnected listener
    ///
    /// Returns the number of subscriptions removed.
    pub fn remove_listener(&self, listener: ListenerId) -> usize {
        let mut inner = self.inner.lock();
        let Some(kinds) = inner.listeners.remove(&listener) else {
            return 0;
        };
        if kinds.contains(&EventKind::GetCapsSupports) {
            inner.caps_subscribers = inner.caps_subscribers.saturating_sub(1);
        }
        self.changed.notify_all();
        kinds.len()
    }

    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.inner.lock().is_subscribed(kind)
    }

    /// Listeners subscribed to `kind`, in id order
    pub fn subscribers(&self, kind: EventKind) -> Vec<ListenerId> {
        let inner = self.inner.lock();
        let mut ids: Vec<_> = inner
            .listeners
            .iter()
            .filter(|(_, kinds)| kinds.contains(&kind))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn caps_subscribers(&self) -> usize {
        self.inner.lock().caps_subscribers
    }

    /// Wait until some listener subscribes to `kind`
    pub fn wait_for_subscriber(&self, kind: EventKind, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.is_subscribed(kind))
    }

    /// Wait until at least one listener subscribes to the capabilities kind
    pub fn wait_for_first_subscriber(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.caps_subscribers > 0)
    }

    fn wait_until(&self, timeout: Duration, ready: impl Fn(&Subscriptions) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if ready(&inner) {
                return true;
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return ready(&inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_subscribe_idempotent() {
        let registry = SubscriptionRegistry::new();
        let l = ListenerId(1);

        assert!(registry.subscribe(l, EventKind::StartStream));
        assert!(!registry.subscribe(l, EventKind::StartStream));
        assert!(registry.is_subscribed(EventKind::StartStream));
        assert!(!registry.is_subscribed(EventKind::StopStream));

        assert!(registry.unsubscribe(l, EventKind::StartStream));
        assert!(!registry.unsubscribe(l, EventKind::StartStream));
        assert!(!registry.is_subscribed(EventKind::StartStream));
    }

    #[test]
    fn test_caps_subscriber_count() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ListenerId(1), EventKind::GetCapsSupports);
        registry.subscribe(ListenerId(1), EventKind::GetCapsSupports);
        registry.subscribe(ListenerId(2), EventKind::GetCapsSupports);
        assert_eq!(registry.caps_subscribers(), 2);

        assert_eq!(registry.remove_listener(ListenerId(1)), 1);
        assert_eq!(registry.caps_subscribers(), 1);
        registry.unsubscribe(ListenerId(2), EventKind::GetCapsSupports);
        assert_eq!(registry.caps_subscribers(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let registry = SubscriptionRegistry::new();
        let start = Instant::now();
        assert!(!registry.wait_for_subscriber(EventKind::NewStream, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_woken_by_subscribe() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let waiter = {
            let registry = registry.clone();
            thread::spawn(move || registry.wait_for_first_subscriber(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        registry.subscribe(ListenerId(3), EventKind::GetCapsSupports);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_one_subscribe_wakes_every_waiter() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let start = Instant::now();
                    let found = registry.wait_for_first_subscriber(Duration::from_secs(5));
                    (found, start.elapsed())
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        registry.subscribe(ListenerId(7), EventKind::GetCapsSupports);
        for waiter in waiters {
            let (found, elapsed) = waiter.join().unwrap();
            assert!(found);
            assert!(elapsed < Duration::from_secs(2));
        }
    }

    #[test]
    fn test_subscribers_sorted() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ListenerId(9), EventKind::BufferQueued);
        registry.subscribe(ListenerId(4), EventKind::BufferQueued);
        registry.subscribe(ListenerId(5), EventKind::SetCrop);
        assert_eq!(
            registry.subscribers(EventKind::BufferQueued),
            vec![ListenerId(4), ListenerId(9)]
        );
    }
}
