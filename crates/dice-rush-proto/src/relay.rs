//! Frames exchanged with the presence/broadcast relay.
//!
//! The relay is generic: payloads are opaque JSON values and topics are
//! plain strings. Game semantics live entirely on the peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subscription status reported for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// One tracked presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub key: String,
    pub payload: Value,
}

/// Peer → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    Join { topic: String, key: String },
    Track { payload: Value },
    Untrack,
    Broadcast { payload: Value },
    Leave,
}

/// Relay → peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    Status { status: ChannelStatus },
    PresenceSync { presences: Vec<PresenceEntry> },
    PresenceLeave { keys: Vec<String> },
    Broadcast { payload: Value },
    Error { message: String },
}
