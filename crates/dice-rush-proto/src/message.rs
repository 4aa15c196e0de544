//! Room messages broadcast between host and guest.
//!
//! Every message travels as a `{type, data}` JSON record on the room's
//! channel. The transport gives no ordering or delivery guarantee, so
//! receivers rely on phase and round guards rather than sequence numbers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtoError;
use crate::game::{Bet, GameOverReason, PlayerId, RoundResults, ScoreBoard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RoomMessage {
    /// Host opens the game with the initial dice.
    StartGame { dice: u8 },
    /// A player locked a bet for the current round.
    BetLocked { bet: Bet },
    /// Host moved to a new betting round.
    NewRound {
        dice: u8,
        round: u32,
        is_rush_round: bool,
    },
    /// Host timer stamp for the current betting round.
    TimerSync { start_timestamp: u64, duration: u32 },
    /// Authoritative outcome of a round with the full score board.
    DiceResult {
        dice: u8,
        results: RoundResults,
        scores: ScoreBoard,
    },
    /// Terminal message. `winner` is absent on a draw.
    GameOver {
        scores: ScoreBoard,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        winner: Option<PlayerId>,
        reason: GameOverReason,
    },
    /// Informational: host saw the opponent arrive.
    PlayerJoined { opponent_id: PlayerId },
}

impl RoomMessage {
    pub const KNOWN_TYPES: [&'static str; 7] = [
        "start-game",
        "bet-locked",
        "new-round",
        "timer-sync",
        "dice-result",
        "game-over",
        "player-joined",
    ];

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            RoomMessage::StartGame { .. } => "start-game",
            RoomMessage::BetLocked { .. } => "bet-locked",
            RoomMessage::NewRound { .. } => "new-round",
            RoomMessage::TimerSync { .. } => "timer-sync",
            RoomMessage::DiceResult { .. } => "dice-result",
            RoomMessage::GameOver { .. } => "game-over",
            RoomMessage::PlayerJoined { .. } => "player-joined",
        }
    }

    /// Decode a broadcast payload.
    ///
    /// Unknown tags are reported separately from malformed bodies so that
    /// receivers can fall through silently on messages from newer peers.
    pub fn from_value(value: Value) -> Result<Self, ProtoError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtoError::MissingType)?;
        if !Self::KNOWN_TYPES.contains(&kind) {
            return Err(ProtoError::UnknownType(kind.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value, ProtoError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::game::{BetOutcome, PlayerResult, Prediction};

    #[test]
    fn test_new_round_wire_shape() {
        let msg = RoomMessage::NewRound {
            dice: 4,
            round: 3,
            is_rush_round: true,
        };
        let value = msg.to_value().unwrap();
        assert_eq!(
            value,
            json!({"type": "new-round", "data": {"dice": 4, "round": 3, "isRushRound": true}})
        );
        assert_eq!(RoomMessage::from_value(value).unwrap(), msg);
    }

    #[test]
    fn test_draw_omits_winner() {
        let msg = RoomMessage::GameOver {
            scores: BTreeMap::from([("a".to_string(), 150), ("b".to_string(), 150)]),
            winner: None,
            reason: GameOverReason::RoundsComplete,
        };
        let value = msg.to_value().unwrap();
        assert!(value["data"].get("winner").is_none());
        assert_eq!(value["data"]["reason"], "rounds_complete");
    }

    #[test]
    fn test_dice_result_decodes_from_peer_json() {
        let value = json!({
            "type": "dice-result",
            "data": {
                "dice": 5,
                "results": {
                    "dice": 5,
                    "playerResults": {
                        "a": {"result": "win", "pointsChange": 10, "bonuses": 12}
                    }
                },
                "scores": {"a": 122}
            }
        });
        let message = RoomMessage::from_value(value).unwrap();
        let RoomMessage::DiceResult { results, scores, .. } = message else {
            panic!("expected dice-result");
        };
        assert_eq!(
            results.player_results["a"],
            PlayerResult {
                result: BetOutcome::Win,
                points_change: 10,
                bonuses: 12
            }
        );
        assert_eq!(scores["a"], 122);
    }

    #[test]
    fn test_unknown_and_malformed_are_distinguished() {
        let unknown = RoomMessage::from_value(json!({"type": "opponent-ready"}));
        assert!(matches!(unknown, Err(ProtoError::UnknownType(t)) if t == "opponent-ready"));

        let malformed = RoomMessage::from_value(json!({"type": "bet-locked", "data": {}}));
        assert!(matches!(malformed, Err(ProtoError::Malformed(_))));

        let untagged = RoomMessage::from_value(json!({"data": 1}));
        assert!(matches!(untagged, Err(ProtoError::MissingType)));
    }

    #[test]
    fn test_bet_locked_nests_bet() {
        let msg = RoomMessage::BetLocked {
            bet: Bet::new("g".to_string(), 10, Prediction::Higher, 42),
        };
        let value = msg.to_value().unwrap();
        assert_eq!(value["data"]["bet"]["playerId"], "g");
        assert_eq!(msg.kind(), "bet-locked");
    }
}
