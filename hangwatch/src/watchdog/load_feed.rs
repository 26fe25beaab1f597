//! Module-load activity feed.
//!
//! Whatever the host loads lazily while a dispatch runs (plugins, fonts,
//! resource bundles) is a common cause of a first-time freeze. The host
//! publishes a short description of each load; every in-flight dispatch
//! analyzer holds a [`Subscription`] and lists what it received in its
//! forced reports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of one subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: Receiver<String>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Everything published since the last drain, in publication order.
    pub fn drain(&self) -> Vec<String> {
        self.rx.try_iter().collect()
    }
}

#[derive(Debug, Default)]
pub struct LoadActivityFeed {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Sender<String>)>>,
}

impl LoadActivityFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        Subscription { id, rx }
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Deliver `activity` to every live subscriber. Subscribers whose
    /// receiving end is gone are pruned.
    pub fn publish(&self, activity: impl Into<String>) {
        let activity = activity.into();
        log::debug!("Load activity: {activity}");
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(_, tx)| tx.send(activity.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let feed = LoadActivityFeed::new();
        let a = feed.subscribe();
        let b = feed.subscribe();
        feed.publish("app::plugins::spellcheck");
        feed.publish("app::fonts::serif");
        assert_eq!(a.drain(), vec!["app::plugins::spellcheck", "app::fonts::serif"]);
        assert_eq!(b.drain().len(), 2);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_unsubscribed_receives_nothing_new() {
        let feed = LoadActivityFeed::new();
        let a = feed.subscribe();
        feed.publish("one");
        assert!(feed.unsubscribe(a.id()));
        assert!(!feed.unsubscribe(a.id()));
        feed.publish("two");
        assert_eq!(a.drain(), vec!["one"]);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let feed = LoadActivityFeed::new();
        let a = feed.subscribe();
        drop(a);
        feed.publish("x");
        assert_eq!(feed.subscriber_count(), 0);
    }
}
