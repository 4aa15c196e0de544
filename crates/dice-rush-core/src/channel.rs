//! Peer channel abstraction: room-scoped broadcast plus presence.
//!
//! Sends are fire-and-forget. Everything a peer learns about the room
//! arrives as a [`ChannelEvent`] on the receiver returned by
//! [`Connector::connect`].

use std::future::Future;

use serde_json::Value;
use tokio::sync::mpsc;

use dice_rush_proto::{ChannelStatus, PresenceEntry, ServerFrame};

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    /// Full list of tracked presences in the topic.
    PresenceSync(Vec<PresenceEntry>),
    /// Keys whose presence went away.
    PresenceLeave(Vec<String>),
    /// Broadcast from another member.
    Message(Value),
}

impl ChannelEvent {
    /// Decode a relay frame. `Error` frames carry no event and yield `None`.
    pub fn from_frame(frame: ServerFrame) -> Option<Self> {
        match frame {
            ServerFrame::Status { status } => Some(Self::Status(status)),
            ServerFrame::PresenceSync { presences } => Some(Self::PresenceSync(presences)),
            ServerFrame::PresenceLeave { keys } => Some(Self::PresenceLeave(keys)),
            ServerFrame::Broadcast { payload } => Some(Self::Message(payload)),
            ServerFrame::Error { .. } => None,
        }
    }
}

impl From<ChannelEvent> for ServerFrame {
    fn from(event: ChannelEvent) -> Self {
        match event {
            ChannelEvent::Status(status) => Self::Status { status },
            ChannelEvent::PresenceSync(presences) => Self::PresenceSync { presences },
            ChannelEvent::PresenceLeave(keys) => Self::PresenceLeave { keys },
            ChannelEvent::Message(payload) => Self::Broadcast { payload },
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// A subscribed topic.
pub trait PeerChannel: Send + 'static {
    fn broadcast(&self, payload: Value) -> Result<(), ChannelError>;

    /// Attach (or replace) this member's presence payload.
    fn track(&self, payload: Value) -> Result<(), ChannelError>;

    /// Unsubscribe. Calling it twice is harmless.
    fn close(&self);
}

/// Opens topic subscriptions.
pub trait Connector: Send + Sync + 'static {
    type Channel: PeerChannel;

    /// The first event delivered is expected to be a [`ChannelEvent::Status`].
    fn connect(
        &self,
        topic: &str,
        key: &str,
    ) -> impl Future<Output = Result<(Self::Channel, EventReceiver), ChannelError>> + Send;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_frame_conversion() {
        let event = ChannelEvent::Message(json!({"type": "timer-sync"}));
        let frame = ServerFrame::from(event.clone());
        assert!(matches!(frame, ServerFrame::Broadcast { .. }));
        assert_eq!(ChannelEvent::from_frame(frame), Some(event));

        let error = ServerFrame::Error {
            message: "not joined".to_string(),
        };
        assert_eq!(ChannelEvent::from_frame(error), None);
    }
}
