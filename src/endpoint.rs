//! Transport endpoint layer: admission, inbound frames, and disconnect cleanup.
//!
//! Liveness probing (`ping` / `pong`) lives here, not in the hub or registry.

use crate::error::Result;
use crate::registry::ConnectionRegistry;
use crate::transport::Transport;
use crate::types::{ConnectionId, ControlMessage, UserId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reply text for inbound frames that cannot be parsed.
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// Inbound client frame. Only `type` and `timestamp` are looked at.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    timestamp: Option<serde_json::Value>,
}

/// What the read loop should do after a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    /// Replying failed; the session is over.
    Close,
}

/// Admits connections into a registry.
#[derive(Clone)]
pub struct Endpoint {
    registry: Arc<ConnectionRegistry>,
}

impl Endpoint {
    /// Create an endpoint admitting into `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Register a connection and return the session guarding it.
    ///
    /// `user` is the identity already resolved by the auth layer, if any.
    /// Blocking transports are moved behind their own writer thread; the
    /// session replies through that same writer.
    pub fn accept(
        &self,
        transport: Arc<dyn Transport>,
        user: Option<UserId>,
    ) -> Result<ConnectionSession> {
        let (id, transport) = self.registry.admit(transport, user.clone())?;

        Ok(ConnectionSession {
            id,
            user,
            transport,
            registry: Arc::clone(&self.registry),
        })
    }
}

/// One admitted connection. Unregisters itself when dropped.
pub struct ConnectionSession {
    id: ConnectionId,
    user: Option<UserId>,
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionSession {
    /// Registry id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Identity the connection was admitted under.
    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    /// Handle one inbound text frame.
    pub fn handle_frame(&self, text: &str) -> FrameOutcome {
        let reply = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) if frame.kind.as_deref() == Some("ping") => ControlMessage::Pong {
                timestamp: frame.timestamp,
            },
            Ok(_) => return FrameOutcome::Continue,
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "unreadable client frame");
                ControlMessage::Error {
                    message: INTERNAL_ERROR_MESSAGE.to_string(),
                }
            }
        };

        let sent = reply
            .to_json()
            .and_then(|json| self.transport.send_text(&json));
        match sent {
            Ok(()) => FrameOutcome::Continue,
            Err(e) => {
                debug!(connection_id = %self.id, error = %e, "reply failed, closing session");
                FrameOutcome::Close
            }
        }
    }

    /// Drive the session from an inbound frame source until it ends.
    pub fn run<I>(self, frames: I)
    where
        I: IntoIterator<Item = String>,
    {
        for frame in frames {
            if self.handle_frame(&frame) == FrameOutcome::Close {
                break;
            }
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.registry.unregister(self.id, self.user.as_ref());
        info!(connection_id = %self.id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::EventBroadcaster;
    use crate::hub::TopicHub;
    use crate::transport::ChannelTransport;
    use crate::types::IssueDeletedPayload;
    use serde_json::Value;
    use std::thread;
    use std::time::{Duration, Instant};

    fn accept(endpoint: &Endpoint, user: Option<UserId>) -> (ConnectionSession, crossbeam_channel::Receiver<String>) {
        let (transport, rx) = ChannelTransport::pair();
        let session = endpoint.accept(Arc::new(transport), user).unwrap();
        rx.recv().unwrap();
        (session, rx)
    }

    #[test]
    fn test_ping_pong() {
        let registry = Arc::new(ConnectionRegistry::new());
        let endpoint = Endpoint::new(registry);
        let (session, rx) = accept(&endpoint, None);

        let outcome = session.handle_frame(r#"{"type":"ping","timestamp":1714557600123}"#);
        assert_eq!(outcome, FrameOutcome::Continue);

        let pong: Value = serde_json::from_str(&rx.recv().unwrap()).unwrap();
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["timestamp"], 1714557600123u64);
    }

    #[test]
    fn test_garbage_gets_error_reply() {
        let registry = Arc::new(ConnectionRegistry::new());
        let endpoint = Endpoint::new(Arc::clone(&registry));
        let (session, rx) = accept(&endpoint, None);

        assert_eq!(session.handle_frame("{not json"), FrameOutcome::Continue);
        let reply: Value = serde_json::from_str(&rx.recv().unwrap()).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], INTERNAL_ERROR_MESSAGE);

        // Unknown types are ignored silently
        assert_eq!(session.handle_frame(r#"{"type":"hello"}"#), FrameOutcome::Continue);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.count_connections(), 1);
    }

    #[test]
    fn test_drop_unregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let endpoint = Endpoint::new(Arc::clone(&registry));
        let (session, _rx) = accept(&endpoint, Some(UserId::from(11)));

        assert_eq!(registry.count_users(), 1);
        let id = session.id();
        drop(session);

        assert!(!registry.contains(id));
        assert_eq!(registry.count_users(), 0);
    }

    /// Every write succeeds after `delay`.
    struct SlowSocket {
        delay: Duration,
        inner: ChannelTransport,
    }

    impl Transport for SlowSocket {
        fn send_text(&self, text: &str) -> Result<()> {
            thread::sleep(self.delay);
            self.inner.send_text(text)
        }
    }

    #[test]
    fn test_slow_socket_does_not_hold_up_broadcaster() {
        let registry = Arc::new(ConnectionRegistry::new());
        let endpoint = Endpoint::new(Arc::clone(&registry));
        let broadcaster = EventBroadcaster::new(TopicHub::new(), Arc::clone(&registry));

        let (slow_inner, slow_rx) = ChannelTransport::pair();
        let slow = endpoint
            .accept(
                Arc::new(SlowSocket {
                    delay: Duration::from_millis(300),
                    inner: slow_inner,
                }),
                None,
            )
            .unwrap();
        let (_fast, fast_rx) = accept(&endpoint, None);

        let started = Instant::now();
        let report = broadcaster.issue_deleted(&IssueDeletedPayload {
            id: 3,
            deleted_by: 1,
            timestamp: "2024-06-01T08:00:00".to_string(),
        });
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(report.connections_reached, 2);
        assert_eq!(
            serde_json::from_str::<Value>(&fast_rx.recv().unwrap()).unwrap()["type"],
            "issue_deleted"
        );

        // Ping reply is queued behind the event on the slow writer.
        assert_eq!(slow.handle_frame(r#"{"type":"ping","timestamp":5}"#), FrameOutcome::Continue);
        let order: Vec<String> = (0..3)
            .map(|_| {
                let frame = slow_rx.recv_timeout(Duration::from_secs(3)).unwrap();
                serde_json::from_str::<Value>(&frame).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(order, vec!["connection_established", "issue_deleted", "pong"]);
    }

    #[test]
    fn test_run_until_peer_gone() {
        let registry = Arc::new(ConnectionRegistry::new());
        let endpoint = Endpoint::new(Arc::clone(&registry));
        let (session, rx) = accept(&endpoint, None);
        drop(rx);

        let frames = vec![
            r#"{"type":"ping"}"#.to_string(),
            r#"{"type":"ping"}"#.to_string(),
        ];
        session.run(frames);

        assert_eq!(registry.count_connections(), 0);
    }
}
