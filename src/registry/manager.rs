//! Registry of live connections and per-user connection sets.

use crate::error::Result;
use crate::transport::{QueuedTransport, Transport};
use crate::types::{ConnectionId, ControlMessage, Envelope, UserId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Greeting carried by the `connection_established` message.
const DEFAULT_WELCOME_MESSAGE: &str = "Connected to real-time updates";

/// Registry configuration.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Text of the `connection_established` greeting.
    pub welcome_message: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            welcome_message: DEFAULT_WELCOME_MESSAGE.to_string(),
        }
    }
}

/// Point-in-time registry status, as served to monitoring endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub active_connections: usize,
    pub active_users: usize,
    pub status: &'static str,
}

/// Result of one fan-out over registry connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Connections that accepted the frame.
    pub delivered: usize,
    /// Connections that failed and were unregistered.
    pub dropped: usize,
}

/// Internal connection entry.
struct Connection {
    transport: Arc<dyn Transport>,
    user: Option<UserId>,
}

/// Owns the connection table. Lock order is always `connections` then `users`.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    users: RwLock<HashMap<UserId, HashSet<ConnectionId>>>,
    next_id: AtomicU64,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create an empty registry with the default greeting.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create an empty registry with custom configuration.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Admit an anonymous connection.
    ///
    /// The `connection_established` greeting is written before the connection
    /// becomes a fan-out target, so it is always the first frame the peer sees.
    /// If that write fails the connection is not admitted.
    ///
    /// A transport whose `may_block` is true is given its own writer thread, so
    /// fan-out to it is an enqueue and never waits on its socket.
    pub fn register(&self, transport: Arc<dyn Transport>) -> Result<ConnectionId> {
        self.admit(transport, None).map(|(id, _)| id)
    }

    /// Admit a connection owned by `user`.
    pub fn register_for_user(
        &self,
        transport: Arc<dyn Transport>,
        user: UserId,
    ) -> Result<ConnectionId> {
        self.admit(transport, Some(user)).map(|(id, _)| id)
    }

    /// Admit a connection and return the writer fan-out uses for it.
    ///
    /// Replies from the endpoint go through the same writer, so they stay
    /// ordered with broadcast frames.
    pub(crate) fn admit(
        &self,
        transport: Arc<dyn Transport>,
        user: Option<UserId>,
    ) -> Result<(ConnectionId, Arc<dyn Transport>)> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let greeting = ControlMessage::ConnectionEstablished {
            message: self.config.welcome_message.clone(),
            connection_id: id.to_string(),
        };
        transport.send_text(&greeting.to_json()?)?;

        let transport: Arc<dyn Transport> = if transport.may_block() {
            Arc::new(QueuedTransport::spawn(transport)?)
        } else {
            transport
        };

        let mut connections = self.connections.write();
        if let Some(ref user) = user {
            self.users.write().entry(user.clone()).or_default().insert(id);
        }
        info!(connection_id = %id, user_id = ?user, active = connections.len() + 1, "connection registered");
        connections.insert(
            id,
            Connection {
                transport: Arc::clone(&transport),
                user,
            },
        );

        Ok((id, transport))
    }

    /// Remove a connection. Unknown ids are a no-op.
    ///
    /// The id is dropped from the set of `user` when given, and from the set of
    /// the user it was registered under. Emptied user entries are pruned.
    /// Returns whether the connection was still registered.
    pub fn unregister(&self, id: ConnectionId, user: Option<&UserId>) -> bool {
        let removed = {
            let mut connections = self.connections.write();
            let removed = connections.remove(&id);

            let owner = removed.as_ref().and_then(|c| c.user.as_ref());
            let mut users = self.users.write();
            for user in user.into_iter().chain(owner) {
                if let Some(set) = users.get_mut(user) {
                    set.remove(&id);
                    if set.is_empty() {
                        users.remove(user);
                    }
                }
            }

            if removed.is_some() {
                debug!(connection_id = %id, active = connections.len(), "connection unregistered");
            }
            removed
        };

        // Released with no lock held: dropping a transport may run its close.
        removed.is_some()
    }

    /// Deliver to every registered connection.
    pub fn broadcast_to_all(&self, envelope: &Envelope) -> DeliveryOutcome {
        let targets: Vec<_> = self
            .connections
            .read()
            .iter()
            .map(|(id, conn)| (*id, Arc::clone(&conn.transport)))
            .collect();

        self.deliver(envelope, targets)
    }

    /// Deliver to every connection of one user. Unknown users are a no-op.
    pub fn broadcast_to_user(&self, user: &UserId, envelope: &Envelope) -> DeliveryOutcome {
        let targets: Vec<_> = {
            let connections = self.connections.read();
            let users = self.users.read();
            match users.get(user) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| connections.get(id).map(|c| (*id, Arc::clone(&c.transport))))
                    .collect(),
                None => return DeliveryOutcome::default(),
            }
        };

        self.deliver(envelope, targets)
    }

    /// Deliver to a single connection. Unknown ids are a no-op.
    pub fn send_to_connection(&self, id: ConnectionId, envelope: &Envelope) -> DeliveryOutcome {
        let target = self
            .connections
            .read()
            .get(&id)
            .map(|c| Arc::clone(&c.transport));

        match target {
            Some(transport) => self.deliver(envelope, vec![(id, transport)]),
            None => DeliveryOutcome::default(),
        }
    }

    /// Write one frame to each target with no registry lock held.
    fn deliver(
        &self,
        envelope: &Envelope,
        targets: Vec<(ConnectionId, Arc<dyn Transport>)>,
    ) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome::default();
        if targets.is_empty() {
            return outcome;
        }

        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "dropping unserializable envelope");
                return outcome;
            }
        };

        let mut failed = Vec::new();
        for (id, transport) in targets {
            match transport.send_text(&frame) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    warn!(connection_id = %id, kind = %envelope.kind, error = %e, "send failed, dropping connection");
                    failed.push(id);
                }
            }
        }

        for id in failed {
            if self.unregister(id, None) {
                outcome.dropped += 1;
            }
        }
        outcome
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    /// Connection ids currently registered for `user`.
    pub fn connections_for_user(&self, user: &UserId) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .users
            .read()
            .get(user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Number of registered connections.
    pub fn count_connections(&self) -> usize {
        self.connections.read().len()
    }

    /// Number of users with at least one registered connection.
    pub fn count_users(&self) -> usize {
        self.users.read().len()
    }

    /// Snapshot of both counts.
    pub fn status(&self) -> RegistryStatus {
        RegistryStatus {
            active_connections: self.count_connections(),
            active_users: self.count_users(),
            status: "running",
        }
    }

    /// Close every transport and empty both tables.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut connections = self.connections.write();
            self.users.write().clear();
            connections.drain().collect()
        };

        if !drained.is_empty() {
            info!(count = drained.len(), "closing all connections");
        }
        for (_, conn) in drained {
            conn.transport.close();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
