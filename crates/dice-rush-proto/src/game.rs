//! Game vocabulary: predictions, bets and round results.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque player identifier, also used as the presence key.
pub type PlayerId = String;

/// Score per player. Ordered so that iteration is stable on both peers.
pub type ScoreBoard = BTreeMap<PlayerId, i32>;

/// Peer role inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Guest => f.write_str("guest"),
        }
    }
}

/// What a player bets the next dice will do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Prediction {
    #[serde(rename = "higher")]
    Higher,
    #[serde(rename = "lower")]
    Lower,
    #[serde(rename = "4-or-higher")]
    FourOrHigher,
    #[serde(rename = "3-or-lower")]
    ThreeOrLower,
}

impl Prediction {
    pub const ALL: [Prediction; 4] = [
        Prediction::Higher,
        Prediction::Lower,
        Prediction::FourOrHigher,
        Prediction::ThreeOrLower,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Prediction::Higher => "higher",
            Prediction::Lower => "lower",
            Prediction::FourOrHigher => "4-or-higher",
            Prediction::ThreeOrLower => "3-or-lower",
        }
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Prediction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Prediction::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown prediction '{s}'"))
    }
}

/// A locked bet. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub amount: u32,
    pub prediction: Prediction,
    /// Wall-clock milliseconds on the placing peer.
    pub timestamp: u64,
    pub player_id: PlayerId,
}

impl Bet {
    pub fn new(player_id: PlayerId, amount: u32, prediction: Prediction, timestamp: u64) -> Self {
        Self {
            amount,
            prediction,
            timestamp,
            player_id,
        }
    }

    /// Zero-amount bet assigned to a player who did not act before expiry.
    pub fn passed(player_id: PlayerId, timestamp: u64) -> Self {
        Self::new(player_id, 0, Prediction::Higher, timestamp)
    }

    pub fn is_passed(&self) -> bool {
        self.amount == 0
    }
}

/// Outcome of one bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetOutcome {
    Win,
    Loss,
    Push,
    Passed,
}

impl fmt::Display for BetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetOutcome::Win => f.write_str("win"),
            BetOutcome::Loss => f.write_str("loss"),
            BetOutcome::Push => f.write_str("push"),
            BetOutcome::Passed => f.write_str("passed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    pub result: BetOutcome,
    pub points_change: i32,
    pub bonuses: i32,
}

impl PlayerResult {
    /// Net score delta for the round.
    pub fn total(&self) -> i32 {
        self.points_change + self.bonuses
    }
}

/// Resolution of a single round, computed once by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResults {
    pub dice: u8,
    pub player_results: BTreeMap<PlayerId, PlayerResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameOverReason {
    OpponentZero,
    PointsThreshold,
    RoundsComplete,
    OpponentDisconnected,
}

impl fmt::Display for GameOverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameOverReason::OpponentZero => f.write_str("opponent_zero"),
            GameOverReason::PointsThreshold => f.write_str("points_threshold"),
            GameOverReason::RoundsComplete => f.write_str("rounds_complete"),
            GameOverReason::OpponentDisconnected => f.write_str("opponent_disconnected"),
        }
    }
}
