//! Per-connection session state
//!
//! Tracks one connection's room phase and turns inbound messages into broker
//! calls and replies. The connection task in `server::websocket` owns a
//! session for the lifetime of its socket.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, Decoded, EventId, ServerMessage};
use crate::broker::{GroupBroker, GroupEvent, GroupName, MemberId};

/// Room membership phase of one connection
#[derive(Debug, Clone, PartialEq)]
pub enum RoomState {
    /// Accepted, no group joined yet
    Connected,
    /// Member of one event group
    Joined { group: GroupName, event_id: EventId },
}

/// State and message handling for one client connection
pub struct ClientSession {
    id: MemberId,
    /// `event_id` query parameter captured during the upgrade, if any
    query_event_id: Option<String>,
    state: RoomState,
    broker: Arc<dyn GroupBroker>,
    /// Where the broker delivers this connection's fan-out events
    events_tx: mpsc::Sender<GroupEvent>,
}

impl ClientSession {
    /// Create a session for a freshly accepted connection
    pub fn new(
        query_event_id: Option<String>,
        broker: Arc<dyn GroupBroker>,
        events_tx: mpsc::Sender<GroupEvent>,
    ) -> Self {
        Self {
            id: MemberId::new(),
            query_event_id,
            state: RoomState::Connected,
            broker,
            events_tx,
        }
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    /// The greeting sent as soon as the connection is accepted
    pub fn connected_reply(&self) -> ServerMessage {
        ServerMessage::connected(self.query_event_id.clone())
    }

    /// Handle one inbound text frame, returning the reply to send (if any).
    ///
    /// Nothing here closes the connection: malformed frames get an ERROR
    /// reply, unknown kinds are logged and dropped, and the connection stays
    /// usable either way.
    pub async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        match ClientMessage::decode(text) {
            Ok(Decoded::Message(ClientMessage::JoinRoom {
                event_id,
                client_type,
            })) => Some(self.handle_join(event_id, client_type).await),
            Ok(Decoded::Message(ClientMessage::MealScanned {
                meal_type,
                new_count,
                timestamp,
            })) => self.handle_scan(meal_type, new_count, timestamp).await,
            Ok(Decoded::Unknown(kind)) => {
                warn!("Session {}: ignoring unknown message kind {:?}", self.id, kind);
                None
            }
            Err(err) => {
                warn!("Session {}: {}", self.id, err);
                Some(err.into())
            }
        }
    }

    /// Deregister from the joined group, if any. Safe to call on every exit
    /// path; leaving twice is a no-op.
    pub async fn teardown(&mut self) {
        if let RoomState::Joined { group, .. } = &self.state {
            let group = group.clone();
            if let Err(err) = self.broker.leave(&group, self.id).await {
                warn!(
                    "Session {}: failed to leave {} on disconnect: {}",
                    self.id, group, err
                );
            }
            self.state = RoomState::Connected;
        }
    }

    async fn handle_join(&mut self, event_id: EventId, client_type: String) -> ServerMessage {
        let group = GroupName::for_event(event_id.as_str());

        // A re-join replaces membership: release the old group first so the
        // connection is never in two groups.
        if let RoomState::Joined {
            group: old_group, ..
        } = &self.state
        {
            if *old_group != group {
                let old_group = old_group.clone();
                if let Err(err) = self.broker.leave(&old_group, self.id).await {
                    warn!(
                        "Session {}: failed to leave {} on re-join: {}",
                        self.id, old_group, err
                    );
                }
                self.state = RoomState::Connected;
            }
        }

        match self
            .broker
            .join(group.clone(), self.id, self.events_tx.clone())
            .await
        {
            Ok(()) => {
                let members = self.broker.member_count(&group).await;
                info!(
                    "Session {} joined {} as {} ({} members)",
                    self.id, group, client_type, members
                );
                self.state = RoomState::Joined {
                    group,
                    event_id: event_id.clone(),
                };
                ServerMessage::room_join_success(event_id, client_type)
            }
            Err(err) => {
                warn!("Session {}: failed to join {}: {}", self.id, group, err);
                // Make sure no partial membership survives a failed join
                let _ = self.broker.leave(&group, self.id).await;
                self.state = RoomState::Connected;
                ServerMessage::error(format!("Failed to join room: {err}"))
            }
        }
    }

    async fn handle_scan(
        &mut self,
        meal_type: String,
        new_count: i64,
        timestamp: String,
    ) -> Option<ServerMessage> {
        let RoomState::Joined { group, event_id } = &self.state else {
            debug!("Session {}: scan before join, ignoring", self.id);
            return None;
        };

        let event = match event_id.to_int() {
            Ok(id) => GroupEvent::meal_scan(meal_type, new_count, id, timestamp),
            Err(err) => {
                warn!("Session {}: cannot broadcast scan: {}", self.id, err);
                return Some(ServerMessage::error(format!(
                    "Failed to broadcast scan: {err}"
                )));
            }
        };

        match self.broker.publish(group, event).await {
            Ok(delivered) => {
                debug!(
                    "Session {}: scan fanned out to {} members of {}",
                    self.id, delivered, group
                );
                None
            }
            Err(err) => {
                warn!("Session {}: publish to {} failed: {}", self.id, group, err);
                Some(ServerMessage::error(format!(
                    "Failed to broadcast scan: {err}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, LocalBroker};
    use async_trait::async_trait;

    const JOIN_7: &str = r#"{"type":"JOIN_ROOM","event_id":"7","client_type":"scanner"}"#;
    const SCAN: &str =
        r#"{"type":"MEAL_SCANNED","meal_type":"lunch","new_count":3,"timestamp":"t1"}"#;

    fn session_on(
        broker: Arc<dyn GroupBroker>,
        query_event_id: Option<&str>,
    ) -> (ClientSession, mpsc::Receiver<GroupEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let session = ClientSession::new(query_event_id.map(str::to_string), broker, tx);
        (session, rx)
    }

    /// Broker that refuses selected operations, for the failure paths
    struct FailingBroker {
        fail_join: bool,
        fail_leave: bool,
    }

    #[async_trait]
    impl GroupBroker for FailingBroker {
        async fn join(
            &self,
            _group: GroupName,
            _member: MemberId,
            _sender: mpsc::Sender<GroupEvent>,
        ) -> Result<(), BrokerError> {
            if self.fail_join {
                Err(BrokerError::Join("backend unavailable".to_string()))
            } else {
                Ok(())
            }
        }

        async fn leave(&self, _group: &GroupName, _member: MemberId) -> Result<(), BrokerError> {
            if self.fail_leave {
                Err(BrokerError::Leave("backend unavailable".to_string()))
            } else {
                Ok(())
            }
        }

        async fn publish(
            &self,
            _group: &GroupName,
            _event: GroupEvent,
        ) -> Result<usize, BrokerError> {
            Err(BrokerError::Publish("backend unavailable".to_string()))
        }

        async fn member_count(&self, _group: &GroupName) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_connected_reply_echoes_query_event_id() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (session, _rx) = session_on(Arc::clone(&broker), Some("55"));
        assert_eq!(
            session.connected_reply(),
            ServerMessage::connected(Some("55".to_string()))
        );

        let (session, _rx) = session_on(broker, None);
        assert_eq!(session.connected_reply(), ServerMessage::connected(None));
    }

    #[tokio::test]
    async fn test_join_room_success() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (mut session, _rx) = session_on(Arc::clone(&broker), Some("7"));

        let reply = session.handle_text(JOIN_7).await;
        assert_eq!(
            reply,
            Some(ServerMessage::room_join_success(EventId::new("7"), "scanner"))
        );
        assert_eq!(
            session.state(),
            &RoomState::Joined {
                group: GroupName::for_event("7"),
                event_id: EventId::new("7"),
            }
        );
        assert_eq!(broker.member_count(&GroupName::for_event("7")).await, 1);
    }

    #[tokio::test]
    async fn test_scan_before_join_is_ignored() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (mut session, mut rx) = session_on(broker, None);

        let reply = session.handle_text(SCAN).await;
        assert_eq!(reply, None);
        assert_eq!(session.state(), &RoomState::Connected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_fans_out_to_all_members_including_sender() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (mut sender, mut rx_sender) = session_on(Arc::clone(&broker), Some("7"));
        let (mut watcher, mut rx_watcher) = session_on(broker, Some("7"));

        sender.handle_text(JOIN_7).await;
        watcher.handle_text(JOIN_7).await;

        let reply = sender.handle_text(SCAN).await;
        assert_eq!(reply, None);

        let expected = GroupEvent::meal_scan("lunch", 3, 7, "t1");
        assert_eq!(rx_watcher.recv().await, Some(expected.clone()));
        assert_eq!(rx_sender.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_and_session_stays_usable() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (mut session, _rx) = session_on(broker, None);

        let reply = session.handle_text("this is not json").await;
        match reply {
            Some(ServerMessage::Error { message }) => {
                assert!(message.contains("Invalid message"));
            }
            other => panic!("Expected Error reply, got {other:?}"),
        }

        // Still works afterwards
        let reply = session.handle_text(JOIN_7).await;
        assert!(matches!(
            reply,
            Some(ServerMessage::RoomJoinSuccess { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_ignored() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (mut session, _rx) = session_on(broker, None);

        let reply = session.handle_text(r#"{"type":"PING","seq":1}"#).await;
        assert_eq!(reply, None);
        assert_eq!(session.state(), &RoomState::Connected);
    }

    #[tokio::test]
    async fn test_rejoin_moves_the_connection() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (mut session, _rx) = session_on(Arc::clone(&broker), Some("7"));

        session.handle_text(JOIN_7).await;
        let reply = session
            .handle_text(r#"{"type":"JOIN_ROOM","event_id":"8","client_type":"scanner"}"#)
            .await;
        assert_eq!(
            reply,
            Some(ServerMessage::room_join_success(EventId::new("8"), "scanner"))
        );

        assert_eq!(broker.member_count(&GroupName::for_event("7")).await, 0);
        assert_eq!(broker.member_count(&GroupName::for_event("8")).await, 1);
    }

    #[tokio::test]
    async fn test_rejoining_the_same_event_is_idempotent() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (mut session, _rx) = session_on(Arc::clone(&broker), Some("7"));

        session.handle_text(JOIN_7).await;
        let reply = session.handle_text(JOIN_7).await;
        assert!(matches!(
            reply,
            Some(ServerMessage::RoomJoinSuccess { .. })
        ));
        assert_eq!(broker.member_count(&GroupName::for_event("7")).await, 1);
    }

    #[tokio::test]
    async fn test_join_failure_leaves_session_unjoined() {
        let broker: Arc<dyn GroupBroker> = Arc::new(FailingBroker {
            fail_join: true,
            fail_leave: false,
        });
        let (mut session, _rx) = session_on(broker, None);

        let reply = session.handle_text(JOIN_7).await;
        match reply {
            Some(ServerMessage::Error { message }) => {
                assert!(message.contains("Failed to join room"));
                assert!(message.contains("backend unavailable"));
            }
            other => panic!("Expected Error reply, got {other:?}"),
        }
        assert_eq!(session.state(), &RoomState::Connected);
    }

    #[tokio::test]
    async fn test_publish_failure_reports_error_to_sender() {
        let broker: Arc<dyn GroupBroker> = Arc::new(FailingBroker {
            fail_join: false,
            fail_leave: false,
        });
        let (mut session, _rx) = session_on(broker, None);

        session.handle_text(JOIN_7).await;
        let reply = session.handle_text(SCAN).await;
        match reply {
            Some(ServerMessage::Error { message }) => {
                assert!(message.contains("Failed to broadcast scan"));
            }
            other => panic!("Expected Error reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_numeric_event_id_cannot_broadcast() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (mut session, _rx) = session_on(broker, None);

        // Joining works; the group name does not care about numeric ids
        let reply = session
            .handle_text(r#"{"type":"JOIN_ROOM","event_id":"banquet","client_type":"scanner"}"#)
            .await;
        assert!(matches!(
            reply,
            Some(ServerMessage::RoomJoinSuccess { .. })
        ));

        // The scan fan-out carries an integer event id, so this one fails
        let reply = session.handle_text(SCAN).await;
        match reply {
            Some(ServerMessage::Error { message }) => {
                assert!(message.contains("is not an integer"));
            }
            other => panic!("Expected Error reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_teardown_leaves_the_joined_group() {
        let broker: Arc<dyn GroupBroker> = Arc::new(LocalBroker::new());
        let (mut session, _rx) = session_on(Arc::clone(&broker), Some("7"));

        session.handle_text(JOIN_7).await;
        assert_eq!(broker.member_count(&GroupName::for_event("7")).await, 1);

        session.teardown().await;
        assert_eq!(broker.member_count(&GroupName::for_event("7")).await, 0);
        assert_eq!(session.state(), &RoomState::Connected);

        // Tearing down twice is harmless
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_survives_a_failing_leave() {
        let broker: Arc<dyn GroupBroker> = Arc::new(FailingBroker {
            fail_join: false,
            fail_leave: true,
        });
        let (mut session, _rx) = session_on(broker, None);

        session.handle_text(JOIN_7).await;

        // The leave error is logged, not propagated; the session still resets
        session.teardown().await;
        assert_eq!(session.state(), &RoomState::Connected);
    }
}
