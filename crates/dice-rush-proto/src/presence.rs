//! Payload a peer attaches to its presence record.

use serde::{Deserialize, Serialize};

use crate::game::{PlayerId, Role};

/// Presence record body.
///
/// The host also carries the current round's timer stamp so that a guest
/// can recover the countdown from presence alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub player_id: PlayerId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_duration: Option<u32>,
}

impl PresencePayload {
    pub fn new(player_id: PlayerId, role: Role) -> Self {
        Self {
            player_id,
            role,
            round_start_time: None,
            timer_duration: None,
        }
    }

    #[must_use]
    pub fn with_timer(mut self, start_timestamp: u64, duration: u32) -> Self {
        self.round_start_time = Some(start_timestamp);
        self.timer_duration = Some(duration);
        self
    }

    /// `(start_timestamp, duration)` when both fields are present.
    pub fn timer(&self) -> Option<(u64, u32)> {
        Some((self.round_start_time?, self.timer_duration?))
    }
}
