//! # Tracker Realtime
//!
//! In-process event distribution for the issue tracker backend.
//!
//! ## Core Concepts
//!
//! - **Registry**: live transport connections, optionally indexed by user
//! - **Hub**: topic pub/sub with one FIFO queue per subscription
//! - **Broadcaster**: the post-commit entry point that feeds both
//! - **Live queries**: typed iterators over hub subscriptions
//!
//! Delivery is best-effort. Failures stay with the failing consumer and never
//! reach the business call that produced the event.
//!
//! ## Example
//!
//! ```ignore
//! use tracker_realtime::{Realtime, RealtimeConfig, LiveQuery};
//!
//! let realtime = Realtime::new(RealtimeConfig::default());
//!
//! // Socket handler
//! let session = realtime.endpoint().accept(transport, Some(user_id))?;
//!
//! // Live query resolver
//! let updates = LiveQuery::issue_status_changed(realtime.hub(), 42);
//!
//! // Business handler, after commit
//! realtime.broadcaster().issue_updated(&issue);
//! ```

pub mod broadcaster;
pub mod endpoint;
pub mod error;
pub mod hub;
pub mod live;
pub mod registry;
pub mod service;
pub mod transport;
pub mod types;

// Re-exports
pub use broadcaster::{DeliveryReport, EventBroadcaster};
pub use endpoint::{ConnectionSession, Endpoint, FrameOutcome};
pub use error::{RealtimeError, Result};
pub use hub::{CancelHandle, HubConfig, Subscription, SubscriptionId, SubscriptionState, TopicHub};
pub use live::LiveQuery;
pub use registry::{ConnectionRegistry, DeliveryOutcome, RegistryConfig, RegistryStatus};
pub use service::{Realtime, RealtimeConfig};
pub use transport::{ChannelTransport, QueuedTransport, Transport};
pub use types::*;
