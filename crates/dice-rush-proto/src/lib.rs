//! Dice Rush Protocol Library
//!
//! Serde types exchanged between peers and the relay.
//!
//! # Modules
//! - `game`: bets, predictions and per-round results
//! - `message`: room messages broadcast between host and guest
//! - `presence`: payload attached to a peer's presence record
//! - `relay`: frames spoken between a peer and the presence/broadcast relay

#![allow(clippy::module_name_repetitions)]

pub mod game;
pub mod message;
pub mod presence;
pub mod relay;

pub use game::{
    Bet, BetOutcome, GameOverReason, PlayerId, PlayerResult, Prediction, Role, RoundResults,
    ScoreBoard,
};
pub use message::RoomMessage;
pub use presence::PresencePayload;
pub use relay::{ChannelStatus, ClientFrame, PresenceEntry, ServerFrame};

#[derive(thiserror::Error, Debug)]
pub enum ProtoError {
    #[error("message has no type tag")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}
