use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// A fan-out key. Club chat streams and per-user notification inboxes share
/// one registry instance, owned by `AppState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Club(Uuid),
    Inbox(Uuid),
}

/// A subscriber's push callback. Must be a non-blocking wake (the actual
/// snapshot render and delivery happens in the subscriber's own task).
pub type PushFn = Box<dyn Fn() + Send + Sync>;

/// In-process map from topic to the set of live subscriber callbacks.
/// Cloneable handle; store it in `AppState` and pass it to whatever needs to
/// register or broadcast.
///
/// All mutation happens under one mutex with no awaits while held;
/// `broadcast` copies the set out before invoking anything, so a concurrent
/// unregister cannot corrupt the walk.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<HashMap<Topic, HashMap<u64, Arc<PushFn>>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callback to the topic's subscriber set. The returned handle
    /// removes it again; cancelling twice is a no-op, and dropping the handle
    /// cancels it as well.
    pub fn register(&self, topic: Topic, push: PushFn) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(topic)
            .or_default()
            .insert(id, Arc::new(push));

        Subscription {
            registry: self.clone(),
            topic,
            id,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Wakes every subscriber currently registered for `topic`. Best effort:
    /// nothing is awaited and a topic with no subscribers is a silent no-op.
    pub fn broadcast(&self, topic: Topic) {
        let snapshot: Vec<Arc<PushFn>> = {
            let map = self.inner.subscribers.lock().unwrap();
            match map.get(&topic) {
                Some(set) => set.values().cloned().collect(),
                None => return,
            }
        };

        for push in snapshot {
            push();
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .get(&topic)
            .map_or(0, HashMap::len)
    }

    fn remove(&self, topic: Topic, id: u64) {
        let mut map = self.inner.subscribers.lock().unwrap();
        if let Some(set) = map.get_mut(&topic) {
            set.remove(&id);
            // Prune emptied topics so the map doesn't grow for the process
            // lifetime.
            if set.is_empty() {
                map.remove(&topic);
            }
        }
    }
}

/// Handle for one registered subscriber.
pub struct Subscription {
    registry: SubscriberRegistry,
    topic: Topic,
    id: u64,
    cancelled: AtomicBool,
}

impl Subscription {
    /// Removes the subscriber from the registry. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.registry.remove(self.topic, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter_push(counter: &Arc<AtomicUsize>) -> PushFn {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn register_then_cancel_leaves_no_subscribers() {
        let registry = SubscriberRegistry::new();
        let topic = Topic::Club(Uuid::now_v7());

        let sub = registry.register(topic, Box::new(|| {}));
        assert_eq!(registry.subscriber_count(topic), 1);

        sub.cancel();
        assert_eq!(registry.subscriber_count(topic), 0);
    }

    #[test]
    fn double_cancel_is_a_noop_and_spares_siblings() {
        let registry = SubscriberRegistry::new();
        let topic = Topic::Club(Uuid::now_v7());
        let hits = Arc::new(AtomicUsize::new(0));

        let first = registry.register(topic, Box::new(|| {}));
        let _second = registry.register(topic, counter_push(&hits));

        first.cancel();
        first.cancel();
        assert_eq!(registry.subscriber_count(topic), 1);

        registry.broadcast(topic);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broadcast_with_no_subscribers_is_a_noop() {
        let registry = SubscriberRegistry::new();
        registry.broadcast(Topic::Inbox(Uuid::now_v7()));
    }

    #[test]
    fn broadcast_wakes_every_registered_subscriber() {
        let registry = SubscriberRegistry::new();
        let topic = Topic::Club(Uuid::now_v7());
        let other = Topic::Club(Uuid::now_v7());

        let hits = Arc::new(AtomicUsize::new(0));
        let other_hits = Arc::new(AtomicUsize::new(0));
        let _a = registry.register(topic, counter_push(&hits));
        let _b = registry.register(topic, counter_push(&hits));
        let _c = registry.register(other, counter_push(&other_hits));

        registry.broadcast(topic);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_the_handle_unregisters() {
        let registry = SubscriberRegistry::new();
        let topic = Topic::Inbox(Uuid::now_v7());

        {
            let _sub = registry.register(topic, Box::new(|| {}));
            assert_eq!(registry.subscriber_count(topic), 1);
        }
        assert_eq!(registry.subscriber_count(topic), 0);
    }
}
