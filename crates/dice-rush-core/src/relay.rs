//! In-process presence/broadcast relay.
//!
//! [`RelayHub`] keeps members per topic. A broadcast reaches every other
//! member of the topic, never the sender. Presence lists only members that
//! have tracked a payload; every change is pushed to all members as a full
//! sync, and a departing tracked member is also announced by key.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use dice_rush_proto::{ChannelStatus, PresenceEntry};

use crate::channel::{ChannelError, ChannelEvent, Connector, EventReceiver, PeerChannel};

pub type MemberId = u64;

#[derive(Debug)]
struct Member {
    id: MemberId,
    key: String,
    presence: Option<Value>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Debug, Default)]
struct Topic {
    members: Vec<Member>,
}

impl Topic {
    fn presences(&self) -> Vec<PresenceEntry> {
        self.members
            .iter()
            .filter_map(|m| {
                m.presence.as_ref().map(|payload| PresenceEntry {
                    key: m.key.clone(),
                    payload: payload.clone(),
                })
            })
            .collect()
    }

    fn push_all(&self, event: &ChannelEvent) {
        for member in &self.members {
            let _ = member.tx.send(event.clone());
        }
    }

    fn sync_all(&self) {
        self.push_all(&ChannelEvent::PresenceSync(self.presences()));
    }
}

#[derive(Debug, Default)]
struct HubInner {
    topics: Mutex<HashMap<String, Topic>>,
    next_id: AtomicU64,
}

/// Shared relay state. Clones refer to the same hub.
#[derive(Debug, Clone, Default)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `key` to `topic`.
    ///
    /// The member first receives `Status(Subscribed)`, then the current
    /// presence list if anyone is tracked.
    pub fn join(&self, topic: &str, key: &str) -> (MemberId, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.inner.topics.lock();
        let entry = topics.entry(topic.to_string()).or_default();
        let _ = tx.send(ChannelEvent::Status(ChannelStatus::Subscribed));
        let presences = entry.presences();
        if !presences.is_empty() {
            let _ = tx.send(ChannelEvent::PresenceSync(presences));
        }
        entry.members.push(Member {
            id,
            key: key.to_string(),
            presence: None,
            tx,
        });
        tracing::debug!(topic, key, member = id, "[relay] joined");
        (id, rx)
    }

    pub fn track(&self, topic: &str, member: MemberId, payload: Value) {
        let mut topics = self.inner.topics.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return;
        };
        let Some(m) = entry.members.iter_mut().find(|m| m.id == member) else {
            return;
        };
        m.presence = Some(payload);
        entry.sync_all();
    }

    pub fn untrack(&self, topic: &str, member: MemberId) {
        let mut topics = self.inner.topics.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return;
        };
        let Some(m) = entry.members.iter_mut().find(|m| m.id == member) else {
            return;
        };
        if m.presence.take().is_some() {
            let key = m.key.clone();
            entry.push_all(&ChannelEvent::PresenceLeave(vec![key]));
            entry.sync_all();
        }
    }

    /// Deliver `payload` to every member except the sender.
    pub fn broadcast(&self, topic: &str, from: MemberId, payload: &Value) {
        let topics = self.inner.topics.lock();
        let Some(entry) = topics.get(topic) else {
            return;
        };
        for member in entry.members.iter().filter(|m| m.id != from) {
            let _ = member.tx.send(ChannelEvent::Message(payload.clone()));
        }
    }

    /// Remove a member. Unknown members are ignored.
    pub fn leave(&self, topic: &str, member: MemberId) {
        let mut topics = self.inner.topics.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return;
        };
        let Some(pos) = entry.members.iter().position(|m| m.id == member) else {
            return;
        };
        let gone = entry.members.remove(pos);
        tracing::debug!(topic, key = %gone.key, member, "[relay] left");

        if entry.members.is_empty() {
            topics.remove(topic);
            return;
        }
        if gone.presence.is_some() {
            entry.push_all(&ChannelEvent::PresenceLeave(vec![gone.key]));
            entry.sync_all();
        }
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.lock().len()
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |t| t.members.len())
    }
}

/// A hub membership used as a [`PeerChannel`]. Leaves the topic when dropped.
#[derive(Debug)]
pub struct LocalChannel {
    hub: RelayHub,
    topic: String,
    member: MemberId,
    closed: AtomicBool,
}

impl LocalChannel {
    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

impl PeerChannel for LocalChannel {
    fn broadcast(&self, payload: Value) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.hub.broadcast(&self.topic, self.member, &payload);
        Ok(())
    }

    fn track(&self, payload: Value) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.hub.track(&self.topic, self.member, payload);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.leave(&self.topic, self.member);
        }
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connects straight to an in-process [`RelayHub`].
#[derive(Debug, Clone, Default)]
pub struct LocalConnector {
    hub: RelayHub,
}

impl LocalConnector {
    pub fn new(hub: RelayHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }
}

impl Connector for LocalConnector {
    type Channel = LocalChannel;

    async fn connect(
        &self,
        topic: &str,
        key: &str,
    ) -> Result<(Self::Channel, EventReceiver), ChannelError> {
        let (member, events) = self.hub.join(topic, key);
        let channel = LocalChannel {
            hub: self.hub.clone(),
            topic: topic.to_string(),
            member,
            closed: AtomicBool::new(false),
        };
        Ok((channel, events))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn drain(rx: &mut EventReceiver) -> Vec<ChannelEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_join_reports_subscribed_then_presence() {
        let hub = RelayHub::new();
        let (a, mut rx_a) = hub.join("room:1", "a");
        assert_eq!(
            drain(&mut rx_a),
            vec![ChannelEvent::Status(ChannelStatus::Subscribed)]
        );
        hub.track("room:1", a, json!({"playerId": "a"}));

        let (_b, mut rx_b) = hub.join("room:1", "b");
        let events = drain(&mut rx_b);
        assert_eq!(events[0], ChannelEvent::Status(ChannelStatus::Subscribed));
        let ChannelEvent::PresenceSync(presences) = &events[1] else {
            panic!("expected presence sync, got {events:?}");
        };
        assert_eq!(presences.len(), 1);
        assert_eq!(presences[0].key, "a");
    }

    #[test]
    fn test_broadcast_not_echoed_to_sender() {
        let hub = RelayHub::new();
        let (a, mut rx_a) = hub.join("room:1", "a");
        let (_b, mut rx_b) = hub.join("room:1", "b");
        let (_c, mut rx_c) = hub.join("room:2", "c");
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        hub.broadcast("room:1", a, &json!({"type": "start-game"}));
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            drain(&mut rx_b),
            vec![ChannelEvent::Message(json!({"type": "start-game"}))]
        );
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn test_leave_emits_presence_leave() {
        let hub = RelayHub::new();
        let (a, mut rx_a) = hub.join("room:1", "a");
        let (b, _rx_b) = hub.join("room:1", "b");
        hub.track("room:1", a, json!({}));
        hub.track("room:1", b, json!({}));
        drain(&mut rx_a);

        hub.leave("room:1", b);
        let events = drain(&mut rx_a);
        assert_eq!(events[0], ChannelEvent::PresenceLeave(vec!["b".to_string()]));
        let ChannelEvent::PresenceSync(presences) = &events[1] else {
            panic!("expected presence sync");
        };
        assert_eq!(presences.len(), 1);

        hub.leave("room:1", b);
        hub.leave("room:1", a);
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_local_channel_leaves_on_drop() {
        let connector = LocalConnector::default();
        let (channel, _rx) = connector.connect("room:9", "x").await.unwrap();
        assert_eq!(connector.hub().member_count("room:9"), 1);
        channel.close();
        assert!(matches!(channel.broadcast(json!(1)), Err(ChannelError::Closed)));
        drop(channel);
        assert_eq!(connector.hub().member_count("room:9"), 0);

        let (channel, _rx) = connector.connect("room:9", "y").await.unwrap();
        drop(channel);
        assert_eq!(connector.hub().topic_count(), 0);
    }
}
