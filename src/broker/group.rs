//! Group membership and fan-out events
//!
//! A group collects the connections watching one event. Scan updates are
//! published to a group and fanned out to every member's outbound queue.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Errors surfaced by a group broker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Group join failed: {0}")]
    Join(String),
    /// Not produced by the in-process broker; surface for implementations
    /// whose leave can fail.
    #[allow(dead_code)]
    #[error("Group leave failed: {0}")]
    Leave(String),
    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Name of a broadcast group
///
/// Groups are keyed by event: every dashboard watching event 42 is a member
/// of `event_42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupName(String);

impl GroupName {
    /// Group for a given event id
    pub fn for_event(event_id: &str) -> Self {
        Self(format!("event_{event_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one group member (one connection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events fanned out to group members
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    /// A meal was scanned at the event being watched
    MealScan {
        meal_type: String,
        new_count: i64,
        event_id: i64,
        timestamp: String,
    },
    /// The broker dropped this member because its queue overflowed.
    /// Arrives as the final event once the backlog drains, so the
    /// connection can close instead of silently going quiet.
    Evicted,
}

impl GroupEvent {
    pub fn meal_scan(
        meal_type: impl Into<String>,
        new_count: i64,
        event_id: i64,
        timestamp: impl Into<String>,
    ) -> Self {
        Self::MealScan {
            meal_type: meal_type.into(),
            new_count,
            event_id,
            timestamp: timestamp.into(),
        }
    }
}

/// Group membership and publish capability
///
/// The relay only ever talks to this trait; the in-process [`LocalBroker`]
/// is the default implementation, and a transport-backed one can be swapped
/// in without touching the connection code.
///
/// [`LocalBroker`]: crate::broker::LocalBroker
#[async_trait]
pub trait GroupBroker: Send + Sync {
    /// Add a member to a group, delivering future events to `sender`.
    ///
    /// Joining a group the member already belongs to replaces its sender.
    async fn join(
        &self,
        group: GroupName,
        member: MemberId,
        sender: mpsc::Sender<GroupEvent>,
    ) -> Result<(), BrokerError>;

    /// Remove a member from a group. Removing a non-member is a no-op.
    async fn leave(&self, group: &GroupName, member: MemberId) -> Result<(), BrokerError>;

    /// Fan an event out to every member of a group.
    ///
    /// Returns how many members the event was handed to. A group with no
    /// members is not an error; the event simply reaches nobody. A member
    /// whose queue is full is dropped from the group and receives a final
    /// [`GroupEvent::Evicted`] once its backlog drains.
    async fn publish(&self, group: &GroupName, event: GroupEvent) -> Result<usize, BrokerError>;

    /// Current member count of a group
    async fn member_count(&self, group: &GroupName) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_name_for_event() {
        let group = GroupName::for_event("42");
        assert_eq!(group.as_str(), "event_42");
        assert_eq!(group.to_string(), "event_42");
    }

    #[test]
    fn test_group_names_compare_by_event() {
        assert_eq!(GroupName::for_event("7"), GroupName::for_event("7"));
        assert_ne!(GroupName::for_event("7"), GroupName::for_event("8"));
    }

    #[test]
    fn test_member_ids_are_unique() {
        assert_ne!(MemberId::new(), MemberId::new());
    }

    #[test]
    fn test_meal_scan_helper() {
        let event = GroupEvent::meal_scan("lunch", 12, 42, "2024-06-01T12:00:00Z");
        assert_eq!(
            event,
            GroupEvent::MealScan {
                meal_type: "lunch".to_string(),
                new_count: 12,
                event_id: 42,
                timestamp: "2024-06-01T12:00:00Z".to_string(),
            }
        );
    }

    #[test]
    fn test_broker_error_messages() {
        let err = BrokerError::Publish("channel closed".to_string());
        assert_eq!(err.to_string(), "Publish failed: channel closed");

        let err = BrokerError::Join("backend unavailable".to_string());
        assert_eq!(err.to_string(), "Group join failed: backend unavailable");

        let err = BrokerError::Leave("backend unavailable".to_string());
        assert_eq!(err.to_string(), "Group leave failed: backend unavailable");
    }
}
