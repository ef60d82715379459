//! Event broadcaster: the entry point business handlers call after commit.
//!
//! One call builds one envelope and hands the same `Arc<Envelope>` to both
//! audiences: hub topics (live queries) and registry connections (raw socket
//! clients). Nothing here returns an error to the caller; delivery problems
//! are logged and cleaned up locally.

use crate::hub::TopicHub;
use crate::registry::{ConnectionRegistry, DeliveryOutcome};
use crate::types::{
    Envelope, EventKind, IssueDeletedPayload, IssuePayload, Topic, UserId, UserSessionPayload,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// What one broadcaster call reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topics_published: usize,
    /// Subscriber queues the envelope was enqueued on.
    pub subscribers_reached: usize,
    /// Connections that accepted the frame.
    pub connections_reached: usize,
    /// Connections dropped after a failed write.
    pub connections_dropped: usize,
}

impl DeliveryReport {
    fn add_connections(&mut self, outcome: DeliveryOutcome) {
        self.connections_reached += outcome.delivered;
        self.connections_dropped += outcome.dropped;
    }
}

/// Who on the connection side receives an event.
enum Audience<'a> {
    Everyone,
    User(&'a UserId),
}

/// Façade over the hub and the registry.
#[derive(Clone)]
pub struct EventBroadcaster {
    hub: TopicHub,
    registry: Arc<ConnectionRegistry>,
}

impl EventBroadcaster {
    /// Create a broadcaster publishing to `hub` and pushing to `registry`.
    pub fn new(hub: TopicHub, registry: Arc<ConnectionRegistry>) -> Self {
        Self { hub, registry }
    }

    /// A new issue was committed.
    pub fn issue_created(&self, issue: &IssuePayload) -> DeliveryReport {
        self.dispatch(
            EventKind::IssueCreated,
            issue,
            &[Topic::issue_created()],
            Audience::Everyone,
        )
    }

    /// An issue was changed. Also feeds the issue's own status topic.
    pub fn issue_updated(&self, issue: &IssuePayload) -> DeliveryReport {
        self.dispatch(
            EventKind::IssueUpdated,
            issue,
            &[Topic::issue_updated(), Topic::issue_status_changed(issue.id)],
            Audience::Everyone,
        )
    }

    /// An issue was removed. Everyone hears about it.
    pub fn issue_deleted(&self, deleted: &IssueDeletedPayload) -> DeliveryReport {
        self.dispatch(
            EventKind::IssueDeleted,
            deleted,
            &[Topic::issue_deleted()],
            Audience::Everyone,
        )
    }

    /// Login is only pushed to the user's own connections.
    pub fn user_logged_in(&self, session: &UserSessionPayload) -> DeliveryReport {
        let user = UserId::from(session.user_id);
        self.dispatch(
            EventKind::UserLoggedIn,
            session,
            &[Topic::user_logged_in()],
            Audience::User(&user),
        )
    }

    /// Logout, pushed to every open connection of that user.
    pub fn user_logged_out(&self, session: &UserSessionPayload) -> DeliveryReport {
        let user = UserId::from(session.user_id);
        self.dispatch(
            EventKind::UserLoggedOut,
            session,
            &[Topic::user_logged_out()],
            Audience::User(&user),
        )
    }

    /// Push a prepared envelope to every connection.
    pub fn notify_all(&self, envelope: &Envelope) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        report.add_connections(self.registry.broadcast_to_all(envelope));
        report
    }

    /// Push a prepared envelope to one user's connections.
    pub fn notify_user(&self, user: &UserId, envelope: &Envelope) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        report.add_connections(self.registry.broadcast_to_user(user, envelope));
        report
    }

    /// Publish a prepared envelope on one topic.
    pub fn notify_topic(&self, topic: &Topic, envelope: Arc<Envelope>) -> DeliveryReport {
        DeliveryReport {
            topics_published: 1,
            subscribers_reached: self.hub.publish(topic, envelope),
            ..Default::default()
        }
    }

    fn dispatch<T: Serialize>(
        &self,
        kind: EventKind,
        payload: &T,
        topics: &[Topic],
        audience: Audience<'_>,
    ) -> DeliveryReport {
        let envelope = match Envelope::from_payload(kind, payload) {
            Ok(envelope) => Arc::new(envelope),
            Err(e) => {
                warn!(kind = %kind, error = %e, "skipping event with unserializable payload");
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport::default();
        for topic in topics {
            report.topics_published += 1;
            report.subscribers_reached += self.hub.publish(topic, Arc::clone(&envelope));
        }

        let outcome = match audience {
            Audience::Everyone => self.registry.broadcast_to_all(&envelope),
            Audience::User(user) => self.registry.broadcast_to_user(user, &envelope),
        };
        report.add_connections(outcome);

        debug!(
            kind = %kind,
            subscribers = report.subscribers_reached,
            connections = report.connections_reached,
            dropped = report.connections_dropped,
            "event dispatched"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use serde_json::Value;

    fn issue(id: i64, status: &str) -> IssuePayload {
        IssuePayload {
            id,
            title: "Login page broken".to_string(),
            description: None,
            status: status.to_string(),
            priority: "high".to_string(),
            assignee_id: Some(3),
            reporter_id: 1,
            created_at: "2024-05-01T10:00:00".to_string(),
            updated_at: "2024-05-01T10:00:00".to_string(),
            tags: vec![],
        }
    }

    fn setup() -> (EventBroadcaster, TopicHub, Arc<ConnectionRegistry>) {
        let hub = TopicHub::new();
        let registry = Arc::new(ConnectionRegistry::new());
        (
            EventBroadcaster::new(hub.clone(), Arc::clone(&registry)),
            hub,
            registry,
        )
    }

    #[test]
    fn test_issue_created_reaches_both_audiences() {
        let (broadcaster, hub, registry) = setup();
        let (transport, rx) = ChannelTransport::pair();
        registry.register(Arc::new(transport)).unwrap();
        rx.recv().unwrap();
        let mut sub = hub.subscribe(Topic::issue_created());

        let report = broadcaster.issue_created(&issue(7, "todo"));
        assert_eq!(report.subscribers_reached, 1);
        assert_eq!(report.connections_reached, 1);

        let live = sub.next().unwrap();
        let wire: Value = serde_json::from_str(&rx.recv().unwrap()).unwrap();

        assert_eq!(live.kind, EventKind::IssueCreated);
        assert_eq!(wire["type"], "issue_created");
        assert_eq!(wire["data"], live.data);
        assert_eq!(wire["timestamp"], live.timestamp.0);
    }

    #[test]
    fn test_issue_updated_feeds_status_topic() {
        let (broadcaster, hub, _registry) = setup();
        let mut general = hub.subscribe(Topic::issue_updated());
        let mut scoped = hub.subscribe(Topic::issue_status_changed(42));
        let other = hub.subscribe(Topic::issue_status_changed(43));

        let report = broadcaster.issue_updated(&issue(42, "in_progress"));
        assert_eq!(report.topics_published, 2);
        assert_eq!(report.subscribers_reached, 2);

        assert_eq!(general.next().unwrap().data["status"], "in_progress");
        assert_eq!(scoped.next().unwrap().data["id"], 42);
        assert!(other.try_next().is_err());
    }

    #[test]
    fn test_login_scoped_to_user() {
        let (broadcaster, _hub, registry) = setup();
        let (mine, rx_mine) = ChannelTransport::pair();
        let (theirs, rx_theirs) = ChannelTransport::pair();
        registry
            .register_for_user(Arc::new(mine), UserId::from(5))
            .unwrap();
        registry
            .register_for_user(Arc::new(theirs), UserId::from(6))
            .unwrap();
        rx_mine.recv().unwrap();
        rx_theirs.recv().unwrap();

        let report = broadcaster.user_logged_in(&UserSessionPayload {
            user_id: 5,
            username: "dana".to_string(),
            timestamp: "2024-05-01T10:00:00".to_string(),
        });

        assert_eq!(report.connections_reached, 1);
        let wire: Value = serde_json::from_str(&rx_mine.recv().unwrap()).unwrap();
        assert_eq!(wire["type"], "user_logged_in");
        assert_eq!(wire["data"]["username"], "dana");
        assert!(rx_theirs.try_recv().is_err());
    }

    #[test]
    fn test_no_listeners_is_noop() {
        let (broadcaster, _hub, _registry) = setup();
        let report = broadcaster.issue_deleted(&IssueDeletedPayload {
            id: 1,
            deleted_by: 2,
            timestamp: "2024-05-01T10:00:00".to_string(),
        });
        assert_eq!(
            report,
            DeliveryReport {
                topics_published: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_notify_topic() {
        let (broadcaster, hub, _registry) = setup();
        let topic = Topic::new("custom");
        let mut sub = hub.subscribe(topic.clone());

        let env = Arc::new(Envelope::new(EventKind::IssueUpdated, Value::Null));
        assert_eq!(broadcaster.notify_topic(&topic, env).subscribers_reached, 1);
        assert_eq!(sub.next().unwrap().data, Value::Null);
    }
}
