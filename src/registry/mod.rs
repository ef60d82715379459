//! Connection registry: the authoritative table of live transport connections.
//!
//! Tracks every admitted connection plus an optional user -> connections index.
//! Fan-out snapshots its targets under a read lock and writes with no lock held,
//! so a slow write never blocks registration or cleanup.
//!
//! Write failures during fan-out are routine: the failing connection is
//! unregistered, the failure is logged, and delivery to the rest continues.

mod manager;

pub use manager::{ConnectionRegistry, DeliveryOutcome, RegistryConfig, RegistryStatus};
