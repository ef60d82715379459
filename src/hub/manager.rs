//! Topic hub: topic -> subscriber queues, with non-blocking fan-out.

use super::types::{HubConfig, Subscription, SubscriptionId, SubscriptionShared};
use crate::types::{Envelope, Topic};
use crossbeam_channel::{bounded, unbounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Internal subscriber entry. The hub owns only the send half.
struct Subscriber {
    sender: Sender<Arc<Envelope>>,
    shared: Arc<SubscriptionShared>,
}

impl Subscriber {
    fn id(&self) -> SubscriptionId {
        self.shared.id
    }
}

/// Shared hub state.
///
/// The topic map lock is held for reading during publish and for writing during
/// membership changes. Each topic's own mutex serializes publishes on that
/// topic, so all of its subscribers see the same order.
pub(crate) struct HubInner {
    topics: RwLock<HashMap<Topic, Mutex<Vec<Subscriber>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    config: HubConfig,
}

impl HubInner {
    /// Unregister one subscriber, pruning its topic if it was the last.
    pub(crate) fn remove(&self, topic: &Topic, id: SubscriptionId) -> bool {
        let mut topics = self.topics.write();
        let Some(entry) = topics.get_mut(topic) else {
            return false;
        };

        let subscribers = entry.get_mut();
        let before = subscribers.len();
        subscribers.retain(|s| s.id() != id);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            topics.remove(topic);
        }
        if removed {
            debug!(topic = %topic, subscription = id.0, "subscription removed");
        }
        removed
    }
}

/// Cloneable handle to a topic pub/sub hub.
#[derive(Clone)]
pub struct TopicHub {
    inner: Arc<HubInner>,
}

impl TopicHub {
    /// Create a hub with unbounded subscriber queues.
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with the given queue settings.
    pub fn with_config(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Open a new subscription on `topic`.
    ///
    /// Only envelopes published after this call are seen. After `shutdown` the
    /// returned subscription is already terminated.
    pub fn subscribe(&self, topic: impl Into<Topic>) -> Subscription {
        let topic = topic.into();
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let shared = Arc::new(SubscriptionShared::new(
            id,
            topic.clone(),
            Arc::downgrade(&self.inner),
        ));
        let (sender, receiver) = match self.inner.config.max_queue_depth {
            // A zero-capacity channel would be a rendezvous: every publish
            // to a consumer not parked in `recv` would evict it.
            Some(depth) => bounded(depth.max(1)),
            None => unbounded(),
        };

        let mut topics = self.inner.topics.write();
        if self.inner.closed.load(Ordering::Acquire) {
            shared.mark_removed();
            return Subscription::new(shared, receiver);
        }
        topics
            .entry(topic.clone())
            .or_default()
            .get_mut()
            .push(Subscriber {
                sender,
                shared: Arc::clone(&shared),
            });
        debug!(topic = %topic, subscription = id.0, "subscription added");

        Subscription::new(shared, receiver)
    }

    /// Enqueue `envelope` on every subscriber of `topic`.
    ///
    /// Never waits for consumers. Returns the number of queues it reached;
    /// zero subscribers is a no-op.
    pub fn publish(&self, topic: &Topic, envelope: Arc<Envelope>) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        {
            let topics = self.inner.topics.read();
            let Some(entry) = topics.get(topic) else {
                trace!(topic = %topic, "publish with no subscribers");
                return 0;
            };

            let subscribers = entry.lock();
            for sub in subscribers.iter() {
                match sub.sender.try_send(Arc::clone(&envelope)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(topic = %topic, subscription = sub.id().0, "subscriber queue full, disconnecting");
                        overflowed.push(sub.id());
                    }
                    // Consumer already gone; its drop is removing it.
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
        }

        for id in overflowed {
            self.evict(topic, id);
        }

        trace!(topic = %topic, delivered, "published");
        delivered
    }

    /// Drop a subscriber from the hub side and end its stream.
    fn evict(&self, topic: &Topic, id: SubscriptionId) {
        let shared = {
            let topics = self.inner.topics.read();
            topics.get(topic).and_then(|entry| {
                entry
                    .lock()
                    .iter()
                    .find(|s| s.id() == id)
                    .map(|s| Arc::clone(&s.shared))
            })
        };
        if self.inner.remove(topic, id) {
            if let Some(shared) = shared {
                shared.mark_removed();
            }
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|entry| entry.lock().len())
            .unwrap_or(0)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.topics.read().len()
    }

    /// True once `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// End every subscription and refuse new ones.
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut topics = self.inner.topics.write();
            self.inner.closed.store(true, Ordering::Release);
            topics.drain().collect()
        };

        let mut count = 0;
        for (_, entry) in drained {
            for sub in entry.into_inner() {
                sub.shared.mark_removed();
                count += 1;
            }
        }
        if count > 0 {
            info!(subscriptions = count, "hub shut down");
        }
    }
}

impl Default for TopicHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::SubscriptionState;
    use crate::types::EventKind;
    use crossbeam_channel::{RecvTimeoutError, TryRecvError};
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn envelope(id: i64) -> Arc<Envelope> {
        Arc::new(Envelope::new(EventKind::IssueUpdated, json!({ "id": id })))
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let hub = TopicHub::new();
        let topic = Topic::issue_updated();

        let sub = hub.subscribe(topic.clone());
        assert_eq!(hub.subscriber_count(&topic), 1);
        assert_eq!(hub.topic_count(), 1);

        drop(sub);
        assert_eq!(hub.subscriber_count(&topic), 0);
        assert_eq!(hub.topic_count(), 0);
    }

    #[test]
    fn test_two_subscribers_same_topic() {
        let hub = TopicHub::new();
        let t42 = Topic::issue_status_changed(42);
        let t43 = Topic::issue_status_changed(43);

        let mut a = hub.subscribe(t42.clone());
        let mut b = hub.subscribe(t42.clone());
        let other = hub.subscribe(t43);

        assert_eq!(hub.publish(&t42, envelope(42)), 2);

        assert_eq!(a.next().unwrap().data["id"], 42);
        assert_eq!(b.next().unwrap().data["id"], 42);
        assert!(matches!(other.try_next(), Err(TryRecvError::Empty)));
        assert!(matches!(a.try_next(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = TopicHub::new();
        let topic = Topic::issue_created();

        assert_eq!(hub.publish(&topic, envelope(1)), 0);
        assert_eq!(hub.topic_count(), 0);

        // No replay for late subscribers
        let late = hub.subscribe(topic);
        assert!(matches!(late.try_next(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_order_preserved() {
        let hub = TopicHub::new();
        let topic = Topic::issue_updated();
        let sub = hub.subscribe(topic.clone());

        for i in 0..100 {
            hub.publish(&topic, envelope(i));
        }
        let ids: Vec<i64> = sub
            .take(100)
            .map(|e| e.data["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let hub = TopicHub::new();
        let topic = Topic::issue_updated();
        let mut sub = hub.subscribe(topic.clone());

        hub.publish(&topic, envelope(1));
        sub.cancel();
        assert_eq!(sub.state(), SubscriptionState::Removed);
        assert_eq!(hub.subscriber_count(&topic), 0);

        assert_eq!(hub.publish(&topic, envelope(2)), 0);
        // Queued-before-cancel envelope is discarded as well
        assert!(sub.next().is_none());
        assert!(sub.next().is_none());
    }

    #[test]
    fn test_cancel_handle_wakes_blocked_consumer() {
        let hub = TopicHub::new();
        let topic = Topic::issue_created();
        let mut sub = hub.subscribe(topic.clone());
        let handle = sub.cancel_handle();

        let consumer = thread::spawn(move || sub.next());
        thread::sleep(Duration::from_millis(20));
        handle.cancel();
        handle.cancel();

        assert!(consumer.join().unwrap().is_none());
        assert_eq!(handle.state(), SubscriptionState::Removed);
        assert_eq!(hub.topic_count(), 0);
    }

    #[test]
    fn test_bounded_queue_disconnects_slow_subscriber() {
        let hub = TopicHub::with_config(HubConfig {
            max_queue_depth: Some(2),
        });
        let topic = Topic::issue_updated();
        let slow = hub.subscribe(topic.clone());

        for i in 0..3 {
            hub.publish(&topic, envelope(i));
        }

        assert_eq!(hub.subscriber_count(&topic), 0);
        assert_eq!(slow.state(), SubscriptionState::Removed);
        assert!(matches!(
            slow.next_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_zero_depth_treated_as_one() {
        let hub = TopicHub::with_config(HubConfig {
            max_queue_depth: Some(0),
        });
        let topic = Topic::issue_updated();
        let sub = hub.subscribe(topic.clone());

        // Nobody is parked in recv, yet the first envelope fits.
        assert_eq!(hub.publish(&topic, envelope(1)), 1);
        assert_eq!(sub.state(), SubscriptionState::Active);
        assert_eq!(sub.try_next().unwrap().data["id"], 1);

        // One slot: a second unread envelope overflows.
        hub.publish(&topic, envelope(2));
        assert_eq!(hub.publish(&topic, envelope(3)), 0);
        assert_eq!(sub.state(), SubscriptionState::Removed);
        assert!(matches!(sub.try_next(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_shutdown_ends_streams() {
        let hub = TopicHub::new();
        let mut sub = hub.subscribe(Topic::issue_deleted());

        hub.shutdown();
        assert!(sub.next().is_none());
        assert!(hub.is_shut_down());

        let mut after = hub.subscribe(Topic::issue_deleted());
        assert_eq!(after.state(), SubscriptionState::Removed);
        assert!(after.next().is_none());
        assert_eq!(hub.topic_count(), 0);
    }

    #[test]
    fn test_subscription_outlives_hub() {
        let hub = TopicHub::new();
        let mut sub = hub.subscribe(Topic::issue_created());
        drop(hub);

        assert!(sub.next().is_none());
    }
}
