//! In-process group broker
//!
//! Keeps the group membership table in memory and fans events out over each
//! member's mpsc queue. Single-process only; all connections joined to a
//! group must live in this relay instance.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::group::{BrokerError, GroupBroker, GroupEvent, GroupName, MemberId};

struct Member {
    id: MemberId,
    sender: mpsc::Sender<GroupEvent>,
}

/// Broker backed by an in-memory membership table
#[derive(Default)]
pub struct LocalBroker {
    groups: RwLock<HashMap<GroupName, Vec<Member>>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupBroker for LocalBroker {
    async fn join(
        &self,
        group: GroupName,
        member: MemberId,
        sender: mpsc::Sender<GroupEvent>,
    ) -> Result<(), BrokerError> {
        let mut groups = self.groups.write().await;
        let members = groups.entry(group.clone()).or_default();

        if let Some(existing) = members.iter_mut().find(|m| m.id == member) {
            existing.sender = sender;
            debug!("Member {} re-joined group {}", member, group);
        } else {
            members.push(Member { id: member, sender });
            debug!(
                "Member {} joined group {} ({} members)",
                member,
                group,
                members.len()
            );
        }
        Ok(())
    }

    async fn leave(&self, group: &GroupName, member: MemberId) -> Result<(), BrokerError> {
        let mut groups = self.groups.write().await;
        if let Some(members) = groups.get_mut(group) {
            members.retain(|m| m.id != member);
            if members.is_empty() {
                groups.remove(group);
                debug!("Group {} is empty, removed", group);
            }
        }
        Ok(())
    }

    async fn publish(&self, group: &GroupName, event: GroupEvent) -> Result<usize, BrokerError> {
        let mut groups = self.groups.write().await;
        let Some(members) = groups.get_mut(group) else {
            return Ok(0);
        };

        let mut delivered = 0;
        members.retain(|m| match m.sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Member {} dropped from group {}: outbound queue full",
                    m.id, group
                );
                // Queue the eviction notice behind the backlog; the member's
                // connection closes when it reaches it.
                let sender = m.sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(GroupEvent::Evicted).await;
                });
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Member {} of group {} is gone, removing", m.id, group);
                false
            }
        });

        if members.is_empty() {
            groups.remove(group);
        }
        Ok(delivered)
    }

    async fn member_count(&self, group: &GroupName) -> usize {
        self.groups
            .read()
            .await
            .get(group)
            .map_or(0, |members| members.len())
    }
}
