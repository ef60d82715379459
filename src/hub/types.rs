//! Subscription handles and hub configuration.

use super::manager::HubInner;
use crate::types::{Envelope, Topic};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Hub configuration.
#[derive(Clone, Debug, Default)]
pub struct HubConfig {
    /// Max queued envelopes per subscriber before it is disconnected.
    /// `Some(0)` is treated as `Some(1)`. Default: None (unbounded)
    pub max_queue_depth: Option<usize>,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Lifecycle of one subscription. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered on its topic and receiving.
    Active,
    /// Consumer stopped; removal from the topic in progress.
    Cancelling,
    /// No longer registered. The stream yields nothing more.
    Removed,
}

const ACTIVE: u8 = 0;
const CANCELLING: u8 = 1;
const REMOVED: u8 = 2;

/// State shared by a subscription, its cancel handles and its hub entry.
pub(crate) struct SubscriptionShared {
    pub(crate) id: SubscriptionId,
    pub(crate) topic: Topic,
    state: AtomicU8,
    hub: Weak<HubInner>,
}

impl SubscriptionShared {
    pub(crate) fn new(id: SubscriptionId, topic: Topic, hub: Weak<HubInner>) -> Self {
        Self {
            id,
            topic,
            state: AtomicU8::new(ACTIVE),
            hub,
        }
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => SubscriptionState::Active,
            CANCELLING => SubscriptionState::Cancelling,
            _ => SubscriptionState::Removed,
        }
    }

    fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    pub(crate) fn mark_removed(&self) {
        self.state.store(REMOVED, Ordering::Release);
    }

    /// Active -> Cancelling -> Removed. Later calls are no-ops.
    pub(crate) fn cancel(&self) {
        if self
            .state
            .compare_exchange(ACTIVE, CANCELLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.topic, self.id);
        }
        self.mark_removed();
    }
}

/// Consumer side of one topic subscription.
///
/// Iterating blocks until the next envelope arrives or the subscription ends.
/// The sequence is never restarted: once `next` returns `None`, it always will.
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    receiver: Receiver<Arc<Envelope>>,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubscriptionShared>, receiver: Receiver<Arc<Envelope>>) -> Self {
        Self { shared, receiver }
    }

    /// Hub-unique id of this subscription.
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    /// Topic this subscription listens on.
    pub fn topic(&self) -> &Topic {
        &self.shared.topic
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Handle that can end this subscription from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop receiving. Envelopes still queued are discarded.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Take the next envelope if one is queued.
    pub fn try_next(&self) -> Result<Arc<Envelope>, TryRecvError> {
        if !self.shared.is_active() {
            return Err(TryRecvError::Disconnected);
        }
        match self.receiver.try_recv() {
            Ok(envelope) => self.accept(envelope).ok_or(TryRecvError::Disconnected),
            Err(TryRecvError::Empty) => Err(TryRecvError::Empty),
            Err(TryRecvError::Disconnected) => {
                self.shared.mark_removed();
                Err(TryRecvError::Disconnected)
            }
        }
    }

    /// Wait up to `timeout` for the next envelope.
    pub fn next_timeout(&self, timeout: Duration) -> Result<Arc<Envelope>, RecvTimeoutError> {
        if !self.shared.is_active() {
            return Err(RecvTimeoutError::Disconnected);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(envelope) => self.accept(envelope).ok_or(RecvTimeoutError::Disconnected),
            Err(RecvTimeoutError::Timeout) => Err(RecvTimeoutError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                self.shared.mark_removed();
                Err(RecvTimeoutError::Disconnected)
            }
        }
    }

    /// Envelopes that raced with a cancel are not handed out.
    fn accept(&self, envelope: Arc<Envelope>) -> Option<Arc<Envelope>> {
        if self.shared.is_active() {
            Some(envelope)
        } else {
            None
        }
    }
}

impl Iterator for Subscription {
    type Item = Arc<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.shared.is_active() {
            return None;
        }
        match self.receiver.recv() {
            Ok(envelope) => self.accept(envelope),
            Err(_) => {
                // Hub dropped our sender: cancelled elsewhere, overflowed or shut down.
                self.shared.mark_removed();
                None
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("topic", &self.shared.topic)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Cancels a subscription from outside its consuming thread.
///
/// A consumer blocked in `next` wakes up and sees the end of the stream.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<SubscriptionShared>,
}

impl CancelHandle {
    /// Same as `Subscription::cancel`. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Lifecycle state of the subscription this handle controls.
    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }
}
