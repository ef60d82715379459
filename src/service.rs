//! The realtime service: one owned instance tying the components together.

use crate::broadcaster::EventBroadcaster;
use crate::endpoint::Endpoint;
use crate::hub::{HubConfig, TopicHub};
use crate::registry::{ConnectionRegistry, RegistryConfig, RegistryStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Service configuration.
#[derive(Clone, Debug, Default)]
pub struct RealtimeConfig {
    pub registry: RegistryConfig,
    pub hub: HubConfig,
}

/// Process-wide realtime layer.
///
/// Built once at startup and handed to collaborators:
/// - business handlers get the `broadcaster()`
/// - socket handlers get the `endpoint()`
/// - live-query resolvers get the `hub()`
///
/// `shutdown` (also run on drop) closes every connection and ends every
/// subscription.
pub struct Realtime {
    registry: Arc<ConnectionRegistry>,
    hub: TopicHub,
    broadcaster: EventBroadcaster,
    shut_down: AtomicBool,
}

impl Realtime {
    /// Build the registry, hub and broadcaster from `config`.
    pub fn new(config: RealtimeConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_config(config.registry));
        let hub = TopicHub::with_config(config.hub);
        let broadcaster = EventBroadcaster::new(hub.clone(), Arc::clone(&registry));

        info!("realtime service started");
        Self {
            registry,
            hub,
            broadcaster,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Connection registry shared by every endpoint.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Topic hub for in-process subscribers.
    pub fn hub(&self) -> &TopicHub {
        &self.hub
    }

    /// Entry point for business code emitting events.
    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Endpoint admitting new connections into the registry.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(Arc::clone(&self.registry))
    }

    /// Connection counts, as reported by the registry.
    pub fn status(&self) -> RegistryStatus {
        self.registry.status()
    }

    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.close_all();
        self.hub.shutdown();
        info!("realtime service shut down");
    }
}

impl Default for Realtime {
    fn default() -> Self {
        Self::new(RealtimeConfig::default())
    }
}

impl Drop for Realtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use crate::types::Topic;

    #[test]
    fn test_shutdown_tears_down_both_paths() {
        let realtime = Realtime::default();
        let (transport, _rx) = ChannelTransport::pair();
        let transport = Arc::new(transport);
        let _session = realtime.endpoint().accept(transport.clone(), None).unwrap();
        let mut sub = realtime.hub().subscribe(Topic::issue_created());

        assert_eq!(realtime.status().active_connections, 1);

        realtime.shutdown();
        realtime.shutdown();

        assert_eq!(realtime.status().active_connections, 0);
        assert!(transport.is_closed());
        assert!(sub.next().is_none());
    }
}
