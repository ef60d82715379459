//! Typed live queries over hub subscriptions.
//!
//! A resolver holds a `LiveQuery<T>` for as long as its client keeps the
//! request open. Dropping it, or returning an error from the `forward` sink,
//! unsubscribes from the hub.

use crate::error::{RealtimeError, Result};
use crate::hub::{CancelHandle, Subscription, TopicHub};
use crate::types::{Envelope, IssuePayload, Topic};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Stream of typed payloads for one topic.
pub struct LiveQuery<T> {
    subscription: Subscription,
    _payload: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> LiveQuery<T> {
    /// Decode the envelopes of `subscription` as `T`.
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            _payload: PhantomData,
        }
    }

    /// Topic the query listens on.
    pub fn topic(&self) -> &Topic {
        self.subscription.topic()
    }

    /// Handle that ends the query from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.subscription.cancel_handle()
    }

    /// Feed every payload to `sink` until it fails or the stream ends.
    ///
    /// A sink error means the client went away. It ends the query and is not
    /// propagated; decode errors are handed to the sink like any other item.
    /// Returns the number of items the sink accepted.
    pub fn forward<F, E>(mut self, mut sink: F) -> usize
    where
        F: FnMut(Result<T>) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        let topic = self.topic().clone();
        let mut sent = 0;
        for item in self.by_ref() {
            if let Err(e) = sink(item) {
                debug!(topic = %topic, error = %e, "live query client gone");
                break;
            }
            sent += 1;
        }
        sent
    }

    fn decode(envelope: &Envelope) -> Result<T> {
        serde_json::from_value(envelope.data.clone()).map_err(|e| RealtimeError::Payload {
            expected: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }
}

impl LiveQuery<IssuePayload> {
    /// Issues created from now on.
    pub fn issue_created(hub: &TopicHub) -> Self {
        Self::new(hub.subscribe(Topic::issue_created()))
    }

    /// Every issue update from now on.
    pub fn issue_updated(hub: &TopicHub) -> Self {
        Self::new(hub.subscribe(Topic::issue_updated()))
    }

    /// Updates of a single issue.
    pub fn issue_status_changed(hub: &TopicHub, issue_id: i64) -> Self {
        Self::new(hub.subscribe(Topic::issue_status_changed(issue_id)))
    }
}

impl<T: DeserializeOwned> Iterator for LiveQuery<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let envelope: Arc<Envelope> = self.subscription.next()?;
        Some(Self::decode(&envelope))
    }
}
