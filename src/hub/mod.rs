//! Topic pub/sub hub feeding live-query consumers.
//!
//! Each `subscribe` call gets its own FIFO queue registered under one topic.
//! `publish` enqueues onto every queue of that topic without waiting for
//! consumers. A `Subscription` is a blocking iterator over its queue; dropping
//! it (or cancelling it through a `CancelHandle`) removes the queue from the
//! topic, and empty topics are pruned.
//!
//! # Example
//!
//! ```ignore
//! let hub = TopicHub::new();
//! let mut sub = hub.subscribe(Topic::issue_status_changed(42));
//!
//! hub.publish(&Topic::issue_status_changed(42), Arc::new(envelope));
//! let received = sub.next();
//! ```

mod manager;
mod types;

pub use manager::TopicHub;
pub use types::{CancelHandle, HubConfig, Subscription, SubscriptionId, SubscriptionState};
