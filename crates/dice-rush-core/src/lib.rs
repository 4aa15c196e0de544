//! Dice Rush Core Library
//!
//! Host-authoritative betting rounds over an unreliable peer channel.
//!
//! # Modules
//! - `engine`: pure bet resolution and win conditions
//! - `timer`: host round timer and guest countdown mirror
//! - `round`: the round state machine, parameterised by role
//! - `session`: room create/join, presence handling and the driver task
//! - `store`: observable game view behind the `StatePort` mutation port
//! - `channel` / `relay`: peer channel traits and the in-process relay hub

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod relay;
pub mod round;
pub mod session;
pub mod store;
pub mod timer;

pub use channel::{ChannelError, ChannelEvent, Connector, EventReceiver, PeerChannel};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{BetPresets, BonusConfig, ConfigError, GameConfig};
pub use engine::GameOutcome;
pub use relay::{LocalChannel, LocalConnector, MemberId, RelayHub};
pub use round::{BetError, BetSize, Deferred, Effect, Guest, Host, RoundEvents, RoundMachine};
pub use session::{Intent, RoomHandle, SessionCoordinator, SessionError};
pub use store::{ConnectionState, GamePhase, GameStore, GameView, RoundState, StatePort};
