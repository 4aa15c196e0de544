//! Observable game state for the presentation layer.
//!
//! The round machine and the session coordinator publish through
//! [`StatePort`]; readers take [`GameView`] snapshots and await the version
//! counter to learn about changes.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use dice_rush_proto::{Bet, BetOutcome, GameOverReason, PlayerId, Role, RoundResults, ScoreBoard};

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    #[default]
    Lobby,
    Betting,
    Revealing,
    Results,
    GameOver,
}

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Per-round state. Authoritative on the host, mirrored on the guest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundState {
    pub round_number: u32,
    pub phase: GamePhase,
    pub current_dice: u8,
    pub previous_dice: u8,
    pub is_rush_round: bool,
    /// Whole seconds left in the betting window.
    pub time_remaining: u32,
    pub round_start_timestamp: Option<u64>,
}

/// Snapshot handed to the UI.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameView {
    pub room_code: Option<String>,
    pub role: Option<Role>,
    pub my_player_id: Option<PlayerId>,
    pub opponent_id: Option<PlayerId>,
    pub connection: ConnectionState,
    pub connection_error: Option<String>,

    pub round: RoundState,
    pub scores: ScoreBoard,
    pub my_score: i32,
    pub opponent_score: i32,

    pub my_bet: Option<Bet>,
    pub opponent_bet: Option<Bet>,
    pub bet_locked: bool,
    pub last_round_results: Option<RoundResults>,
    /// Consecutive local wins. Reset by a loss, untouched by push or pass.
    pub win_streak: u32,

    pub game_winner: Option<PlayerId>,
    pub game_over_reason: Option<GameOverReason>,
}

impl GameView {
    pub fn is_game_over(&self) -> bool {
        self.round.phase == GamePhase::GameOver
    }

    fn refresh_derived_scores(&mut self) {
        let lookup = |id: &Option<PlayerId>| {
            id.as_ref()
                .and_then(|id| self.scores.get(id))
                .copied()
                .unwrap_or(0)
        };
        self.my_score = lookup(&self.my_player_id);
        self.opponent_score = lookup(&self.opponent_id);
    }
}

// ============================================================================
// Mutation port
// ============================================================================

/// Setters used by the session and round machine to publish state.
pub trait StatePort: Send + Sync {
    fn set_session(&self, room_code: &str, role: Role, player_id: &str);
    fn set_opponent(&self, opponent_id: Option<PlayerId>);
    fn set_connection(&self, state: ConnectionState, error: Option<String>);

    fn set_round(&self, round: &RoundState);
    fn set_phase(&self, phase: GamePhase);
    fn set_dice(&self, current: u8, previous: u8);
    fn set_timer(&self, time_remaining: u32, round_start_timestamp: Option<u64>);

    fn set_scores(&self, scores: &ScoreBoard);
    fn set_my_bet(&self, bet: Option<Bet>);
    fn set_opponent_bet(&self, bet: Option<Bet>);
    fn set_round_results(&self, results: &RoundResults);
    fn set_winner(&self, winner: Option<PlayerId>, reason: GameOverReason);

    fn reset(&self);
}

// ============================================================================
// Store
// ============================================================================

/// Lock-guarded [`GameView`] with a change counter.
#[derive(Debug)]
pub struct GameStore {
    view: RwLock<GameView>,
    version: watch::Sender<u64>,
}

impl Default for GameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GameStore {
    pub fn new() -> Self {
        Self {
            view: RwLock::new(GameView::default()),
            version: watch::Sender::new(0),
        }
    }

    pub fn snapshot(&self) -> GameView {
        self.view.read().clone()
    }

    pub fn get_version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Receiver that is marked changed on every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Wait until `pred` holds and return the matching snapshot.
    pub async fn wait_for(&self, pred: impl Fn(&GameView) -> bool) -> GameView {
        let mut rx = self.subscribe();
        loop {
            let view = self.snapshot();
            if pred(&view) {
                return view;
            }
            // The sender lives in `self`, so this only fails if the store is gone.
            if rx.changed().await.is_err() {
                return view;
            }
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut GameView)) {
        f(&mut *self.view.write());
        self.version.send_modify(|v| *v += 1);
    }
}

impl StatePort for GameStore {
    fn set_session(&self, room_code: &str, role: Role, player_id: &str) {
        self.mutate(|view| {
            view.room_code = Some(room_code.to_string());
            view.role = Some(role);
            view.my_player_id = Some(player_id.to_string());
            view.refresh_derived_scores();
        });
    }

    fn set_opponent(&self, opponent_id: Option<PlayerId>) {
        self.mutate(|view| {
            view.opponent_id = opponent_id;
            view.refresh_derived_scores();
        });
    }

    fn set_connection(&self, state: ConnectionState, error: Option<String>) {
        self.mutate(|view| {
            view.connection = state;
            view.connection_error = error;
        });
    }

    fn set_round(&self, round: &RoundState) {
        self.mutate(|view| view.round = round.clone());
    }

    fn set_phase(&self, phase: GamePhase) {
        self.mutate(|view| view.round.phase = phase);
    }

    fn set_dice(&self, current: u8, previous: u8) {
        self.mutate(|view| {
            view.round.current_dice = current;
            view.round.previous_dice = previous;
        });
    }

    fn set_timer(&self, time_remaining: u32, round_start_timestamp: Option<u64>) {
        self.mutate(|view| {
            view.round.time_remaining = time_remaining;
            if round_start_timestamp.is_some() {
                view.round.round_start_timestamp = round_start_timestamp;
            }
        });
    }

    fn set_scores(&self, scores: &ScoreBoard) {
        self.mutate(|view| {
            view.scores = scores.clone();
            view.refresh_derived_scores();
        });
    }

    fn set_my_bet(&self, bet: Option<Bet>) {
        self.mutate(|view| {
            view.bet_locked = bet.is_some();
            view.my_bet = bet;
        });
    }

    fn set_opponent_bet(&self, bet: Option<Bet>) {
        self.mutate(|view| view.opponent_bet = bet);
    }

    fn set_round_results(&self, results: &RoundResults) {
        self.mutate(|view| {
            let mine = view
                .my_player_id
                .as_ref()
                .and_then(|id| results.player_results.get(id));
            match mine.map(|r| r.result) {
                Some(BetOutcome::Win) => view.win_streak += 1,
                Some(BetOutcome::Loss) => view.win_streak = 0,
                _ => {}
            }
            view.last_round_results = Some(results.clone());
        });
    }

    fn set_winner(&self, winner: Option<PlayerId>, reason: GameOverReason) {
        self.mutate(|view| {
            view.game_winner = winner;
            view.game_over_reason = Some(reason);
        });
    }

    fn reset(&self) {
        self.mutate(|view| *view = GameView::default());
    }
}
