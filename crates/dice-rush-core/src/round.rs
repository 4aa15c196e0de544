//! Round state machine.
//!
//! `LOBBY → BETTING → REVEALING → RESULTS → BETTING …`, ending in
//! `GAME_OVER`. The machine is sans-IO: every input returns a list of
//! [`Effect`]s that the session driver carries out.
//!
//! Authority is encoded in the type parameter. Only `RoundMachine<Host>` can
//! roll dice, resolve a round or schedule phase changes; `RoundMachine<Guest>`
//! mirrors whatever the host broadcasts and replaces its state wholesale.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use dice_rush_proto::{
    Bet, GameOverReason, PlayerId, PresencePayload, Prediction, Role, RoomMessage, RoundResults,
    ScoreBoard,
};

use crate::clock::SharedClock;
use crate::config::{BetPresets, GameConfig};
use crate::engine::{self, GameOutcome};
use crate::store::{GamePhase, RoundState, StatePort};
use crate::timer::{RoundTimer, TimerMirror};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BetError {
    #[error("Bets can only be placed while betting is open")]
    NotBetting,

    #[error("You already locked a bet this round")]
    AlreadyLocked,

    #[error("Bet must be between 1 and {max} points")]
    InvalidAmount { max: i32 },
}

/// Quick bet sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetSize {
    Small,
    Medium,
    Half,
    AllIn,
}

impl BetSize {
    /// Amount for a player holding `score` points, never above the score.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn amount(self, score: i32, presets: &BetPresets) -> u32 {
        let score = u32::try_from(score).unwrap_or(0);
        let raw = match self {
            BetSize::Small => presets.small,
            BetSize::Medium => presets.medium,
            BetSize::Half => ((f64::from(score) * presets.half).floor() as u32).max(1),
            BetSize::AllIn => score,
        };
        raw.min(score)
    }
}

impl FromStr for BetSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(BetSize::Small),
            "medium" => Ok(BetSize::Medium),
            "half" => Ok(BetSize::Half),
            "all-in" | "allin" | "all" => Ok(BetSize::AllIn),
            other => Err(format!("unknown bet size '{other}'")),
        }
    }
}

/// Delayed step scheduled by the host. Carries the round it was scheduled
/// for so a late firing can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    StartGame,
    Reveal { round: u32 },
    NextRound { round: u32 },
    GameOver { round: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Broadcast(RoomMessage),
    TrackPresence(PresencePayload),
    Schedule { deferred: Deferred, after: Duration },
    /// Abort every pending deferred step.
    CancelDeferred,
}

/// Host capability: dice source, collected bets and resolution bookkeeping.
#[derive(Debug)]
pub struct Host {
    rng: ChaCha8Rng,
    bets: BTreeMap<PlayerId, Bet>,
    timer: Option<RoundTimer>,
    resolved_round: Option<u32>,
    pending_results: Option<RoundResults>,
    pending_outcome: Option<GameOutcome>,
    started: bool,
}

/// Guest capability: timer mirror only.
#[derive(Debug, Default)]
pub struct Guest {
    timer: TimerMirror,
    pending_sync: Option<(u64, u32)>,
}

pub trait Authority: Send + 'static {
    const ROLE: Role;
}

impl Authority for Host {
    const ROLE: Role = Role::Host;
}

impl Authority for Guest {
    const ROLE: Role = Role::Guest;
}

/// Inputs the session driver feeds into a machine of either role.
pub trait RoundEvents: Send + 'static {
    fn role(&self) -> Role;
    fn phase(&self) -> GamePhase;

    fn on_opponent_joined(&mut self, opponent_id: PlayerId) -> Vec<Effect>;
    fn on_opponent_left(&mut self) -> Vec<Effect>;
    fn on_presence(&mut self, payload: &PresencePayload) -> Vec<Effect>;
    fn handle_message(&mut self, message: RoomMessage) -> Vec<Effect>;
    fn on_tick(&mut self) -> Vec<Effect>;
    fn on_deferred(&mut self, deferred: Deferred) -> Vec<Effect>;
    fn place_bet(&mut self, amount: u32, prediction: Prediction) -> Result<Vec<Effect>, BetError>;
    fn place_preset(
        &mut self,
        size: BetSize,
        prediction: Prediction,
    ) -> Result<Vec<Effect>, BetError>;
}

pub struct RoundMachine<R> {
    config: Arc<GameConfig>,
    clock: SharedClock,
    store: Arc<dyn StatePort>,
    local_id: PlayerId,
    opponent_id: Option<PlayerId>,
    round: RoundState,
    scores: ScoreBoard,
    my_bet: Option<Bet>,
    opponent_bet: Option<Bet>,
    role: R,
}

// ============================================================================
// Shared behaviour
// ============================================================================

impl<R: Authority> RoundMachine<R> {
    fn with_role(
        role: R,
        local_id: PlayerId,
        config: Arc<GameConfig>,
        clock: SharedClock,
        store: Arc<dyn StatePort>,
    ) -> Self {
        let scores = BTreeMap::from([(local_id.clone(), config.initial_score)]);
        store.set_scores(&scores);
        store.set_round(&RoundState::default());
        Self {
            config,
            clock,
            store,
            local_id,
            opponent_id: None,
            round: RoundState::default(),
            scores,
            my_bet: None,
            opponent_bet: None,
            role,
        }
    }

    pub fn round_state(&self) -> &RoundState {
        &self.round
    }

    pub fn scores(&self) -> &ScoreBoard {
        &self.scores
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn opponent_id(&self) -> Option<&str> {
        self.opponent_id.as_deref()
    }

    fn local_score(&self) -> i32 {
        self.scores.get(&self.local_id).copied().unwrap_or(0)
    }

    fn seed_opponent(&mut self, opponent_id: PlayerId) {
        self.scores
            .entry(opponent_id.clone())
            .or_insert(self.config.initial_score);
        self.opponent_id = Some(opponent_id);
        self.store.set_scores(&self.scores);
    }

    /// Local validation shared by both roles.
    fn lock_local_bet(&mut self, amount: u32, prediction: Prediction) -> Result<Bet, BetError> {
        if self.round.phase != GamePhase::Betting {
            return Err(BetError::NotBetting);
        }
        if self.my_bet.is_some() {
            return Err(BetError::AlreadyLocked);
        }
        let max = self.local_score();
        if amount == 0 || i64::from(amount) > i64::from(max) {
            return Err(BetError::InvalidAmount { max });
        }
        let bet = Bet::new(self.local_id.clone(), amount, prediction, self.clock.now_ms());
        self.my_bet = Some(bet.clone());
        self.store.set_my_bet(Some(bet.clone()));
        tracing::info!(
            role = %R::ROLE,
            round = self.round.round_number,
            amount,
            prediction = %prediction,
            "[round] bet locked"
        );
        Ok(bet)
    }

    fn preset_amount(&self, size: BetSize) -> u32 {
        size.amount(self.local_score(), &self.config.bet_presets)
    }

    fn clear_round_bets(&mut self) {
        self.my_bet = None;
        self.opponent_bet = None;
        self.store.set_my_bet(None);
        self.store.set_opponent_bet(None);
    }

    /// Unilateral end after the opponent vanished from presence.
    fn end_by_disconnect(&mut self) -> Vec<Effect> {
        if self.round.phase == GamePhase::GameOver {
            return Vec::new();
        }
        tracing::warn!(
            role = %R::ROLE,
            round = self.round.round_number,
            "[round] opponent disconnected, ending game"
        );
        self.round.phase = GamePhase::GameOver;
        self.store.set_phase(GamePhase::GameOver);
        self.store
            .set_winner(Some(self.local_id.clone()), GameOverReason::OpponentDisconnected);
        vec![Effect::CancelDeferred]
    }
}

// ============================================================================
// Host
// ============================================================================

impl RoundMachine<Host> {
    pub fn host(
        local_id: PlayerId,
        config: Arc<GameConfig>,
        clock: SharedClock,
        store: Arc<dyn StatePort>,
        seed: u64,
    ) -> Self {
        let role = Host {
            rng: ChaCha8Rng::seed_from_u64(seed),
            bets: BTreeMap::new(),
            timer: None,
            resolved_round: None,
            pending_results: None,
            pending_outcome: None,
            started: false,
        };
        Self::with_role(role, local_id, config, clock, store)
    }

    fn presence(&self) -> PresencePayload {
        let payload = PresencePayload::new(self.local_id.clone(), Role::Host);
        match self.role.timer {
            Some(timer) => payload.with_timer(timer.start_timestamp(), timer.duration_secs()),
            None => payload,
        }
    }

    fn start_game(&mut self) -> Vec<Effect> {
        if self.round.phase != GamePhase::Lobby {
            return Vec::new();
        }
        let dice = self.config.roll_dice(&mut self.role.rng);
        self.round.current_dice = dice;
        self.round.previous_dice = dice;
        self.store.set_dice(dice, dice);
        tracing::info!(dice, "[round] game started");

        let mut effects = vec![Effect::Broadcast(RoomMessage::StartGame { dice })];
        effects.extend(self.start_round(1));
        effects
    }

    /// Open the betting window for `number` and stamp the timer.
    fn start_round(&mut self, number: u32) -> Vec<Effect> {
        self.role.bets.clear();
        self.clear_round_bets();

        let is_rush_round = self.config.roll_rush(&mut self.role.rng);
        let duration = self.config.timer_secs(is_rush_round);
        let now = self.clock.now_ms();
        self.role.timer = Some(RoundTimer::start(now, duration));

        self.round.round_number = number;
        self.round.phase = GamePhase::Betting;
        self.round.is_rush_round = is_rush_round;
        self.round.time_remaining = duration;
        self.round.round_start_timestamp = Some(now);
        self.store.set_round(&self.round);

        tracing::info!(
            round = number,
            dice = self.round.current_dice,
            is_rush_round,
            duration,
            "[round] betting opened"
        );

        vec![
            Effect::CancelDeferred,
            Effect::Broadcast(RoomMessage::NewRound {
                dice: self.round.current_dice,
                round: number,
                is_rush_round,
            }),
            Effect::Broadcast(RoomMessage::TimerSync {
                start_timestamp: now,
                duration,
            }),
            Effect::TrackPresence(self.presence()),
        ]
    }

    fn record_bet(&mut self, bet: Bet) -> Vec<Effect> {
        self.role.bets.insert(bet.player_id.clone(), bet);
        if self.role.bets.len() >= 2 {
            self.resolve_round()
        } else {
            Vec::new()
        }
    }

    /// Roll, score and decide what comes next. Runs at most once per round.
    pub fn resolve_round(&mut self) -> Vec<Effect> {
        let number = self.round.round_number;
        if self.round.phase != GamePhase::Betting || self.role.resolved_round == Some(number) {
            tracing::debug!(round = number, "[round] resolution skipped");
            return Vec::new();
        }
        self.role.resolved_round = Some(number);
        self.role.timer = None;

        let old_dice = self.round.current_dice;
        let new_dice = self.config.roll_dice(&mut self.role.rng);
        let bets = std::mem::take(&mut self.role.bets);
        let results = engine::calculate_round_results(old_dice, new_dice, &bets, &self.config);
        engine::apply_round_results(&mut self.scores, &results, self.config.min_score);

        self.round.previous_dice = old_dice;
        self.round.current_dice = new_dice;
        self.round.time_remaining = 0;

        tracing::info!(
            round = number,
            old_dice,
            new_dice,
            scores = ?self.scores,
            "[round] resolved"
        );

        match engine::check_win_conditions(&self.scores, number, &self.config) {
            Some(outcome) => {
                // Scores go out before game-over so the guest shows final numbers.
                self.round.phase = GamePhase::Results;
                self.store.set_round(&self.round);
                self.store.set_round_results(&results);
                self.store.set_scores(&self.scores);
                self.role.pending_outcome = Some(outcome);
                vec![
                    Effect::Broadcast(RoomMessage::DiceResult {
                        dice: new_dice,
                        results,
                        scores: self.scores.clone(),
                    }),
                    Effect::Schedule {
                        deferred: Deferred::GameOver { round: number },
                        after: Duration::from_millis(self.config.game_over_delay_ms),
                    },
                ]
            }
            None => {
                self.round.phase = GamePhase::Revealing;
                self.store.set_phase(GamePhase::Revealing);
                self.role.pending_results = Some(results);
                vec![Effect::Schedule {
                    deferred: Deferred::Reveal { round: number },
                    after: Duration::from_millis(self.config.reveal_delay_ms),
                }]
            }
        }
    }

    fn reveal(&mut self, number: u32) -> Vec<Effect> {
        if self.round.phase != GamePhase::Revealing || self.round.round_number != number {
            return Vec::new();
        }
        let Some(results) = self.role.pending_results.take() else {
            return Vec::new();
        };
        self.round.phase = GamePhase::Results;
        self.store.set_round(&self.round);
        self.store.set_round_results(&results);
        self.store.set_scores(&self.scores);
        vec![
            Effect::Broadcast(RoomMessage::DiceResult {
                dice: self.round.current_dice,
                results,
                scores: self.scores.clone(),
            }),
            Effect::Schedule {
                deferred: Deferred::NextRound { round: number },
                after: Duration::from_millis(self.config.results_display_ms),
            },
        ]
    }

    fn finish(&mut self, number: u32) -> Vec<Effect> {
        if self.round.phase == GamePhase::GameOver || self.round.round_number != number {
            return Vec::new();
        }
        let Some(outcome) = self.role.pending_outcome.take() else {
            return Vec::new();
        };
        self.round.phase = GamePhase::GameOver;
        self.store.set_phase(GamePhase::GameOver);
        self.store.set_winner(outcome.winner.clone(), outcome.reason);
        tracing::info!(
            round = number,
            winner = ?outcome.winner,
            reason = %outcome.reason,
            "[round] game over"
        );
        vec![Effect::Broadcast(RoomMessage::GameOver {
            scores: self.scores.clone(),
            winner: outcome.winner,
            reason: outcome.reason,
        })]
    }

    /// Assign a passed bet to every player who has none yet.
    fn pass_missing_bets(&mut self) {
        let now = self.clock.now_ms();
        for id in self.scores.keys() {
            if !self.role.bets.contains_key(id) {
                tracing::info!(
                    player = %id,
                    round = self.round.round_number,
                    "[round] timed out, bet passed"
                );
                self.role.bets.insert(id.clone(), Bet::passed(id.clone(), now));
            }
        }
    }
}

impl RoundEvents for RoundMachine<Host> {
    fn role(&self) -> Role {
        Role::Host
    }

    fn phase(&self) -> GamePhase {
        self.round.phase
    }

    fn on_opponent_joined(&mut self, opponent_id: PlayerId) -> Vec<Effect> {
        self.seed_opponent(opponent_id.clone());
        if self.role.started {
            return Vec::new();
        }
        self.role.started = true;
        tracing::info!(opponent = %opponent_id, "[round] opponent joined, starting soon");
        vec![
            Effect::Broadcast(RoomMessage::PlayerJoined { opponent_id }),
            Effect::Schedule {
                deferred: Deferred::StartGame,
                after: Duration::from_millis(self.config.start_game_delay_ms),
            },
        ]
    }

    fn on_opponent_left(&mut self) -> Vec<Effect> {
        self.role.timer = None;
        self.end_by_disconnect()
    }

    fn on_presence(&mut self, _payload: &PresencePayload) -> Vec<Effect> {
        Vec::new()
    }

    fn handle_message(&mut self, message: RoomMessage) -> Vec<Effect> {
        let RoomMessage::BetLocked { bet } = message else {
            tracing::trace!(kind = message.kind(), "[round] host ignores message");
            return Vec::new();
        };
        if self.round.phase != GamePhase::Betting {
            tracing::debug!(phase = ?self.round.phase, "[round] bet outside betting ignored");
            return Vec::new();
        }
        if self.opponent_id.as_deref() != Some(bet.player_id.as_str()) {
            tracing::debug!(player = %bet.player_id, "[round] bet from unknown player ignored");
            return Vec::new();
        }
        if self.role.bets.contains_key(&bet.player_id) {
            tracing::debug!(player = %bet.player_id, "[round] duplicate bet ignored");
            return Vec::new();
        }
        self.opponent_bet = Some(bet.clone());
        self.store.set_opponent_bet(Some(bet.clone()));
        self.record_bet(bet)
    }

    fn on_tick(&mut self) -> Vec<Effect> {
        if self.round.phase != GamePhase::Betting {
            return Vec::new();
        }
        let Some(timer) = self.role.timer else {
            return Vec::new();
        };
        let now = self.clock.now_ms();
        let remaining = timer.remaining_secs(now);
        if remaining != self.round.time_remaining {
            self.round.time_remaining = remaining;
            self.store.set_timer(remaining, None);
        }
        if !timer.is_expired(now) {
            return Vec::new();
        }
        self.pass_missing_bets();
        self.resolve_round()
    }

    fn on_deferred(&mut self, deferred: Deferred) -> Vec<Effect> {
        match deferred {
            Deferred::StartGame => self.start_game(),
            Deferred::Reveal { round } => self.reveal(round),
            Deferred::NextRound { round } => {
                if self.round.phase == GamePhase::Results && self.round.round_number == round {
                    self.start_round(round + 1)
                } else {
                    Vec::new()
                }
            }
            Deferred::GameOver { round } => self.finish(round),
        }
    }

    fn place_bet(&mut self, amount: u32, prediction: Prediction) -> Result<Vec<Effect>, BetError> {
        let bet = self.lock_local_bet(amount, prediction)?;
        let mut effects = vec![Effect::Broadcast(RoomMessage::BetLocked { bet: bet.clone() })];
        effects.extend(self.record_bet(bet));
        Ok(effects)
    }

    fn place_preset(
        &mut self,
        size: BetSize,
        prediction: Prediction,
    ) -> Result<Vec<Effect>, BetError> {
        let amount = self.preset_amount(size);
        self.place_bet(amount, prediction)
    }
}

// ============================================================================
// Guest
// ============================================================================

impl RoundMachine<Guest> {
    pub fn guest(
        local_id: PlayerId,
        config: Arc<GameConfig>,
        clock: SharedClock,
        store: Arc<dyn StatePort>,
    ) -> Self {
        Self::with_role(Guest::default(), local_id, config, clock, store)
    }

    /// Take a host timer stamp from either the broadcast or presence path.
    fn apply_timer_sync(&mut self, start_timestamp: u64, duration: u32) {
        if !self.role.timer.is_newer(start_timestamp) {
            tracing::trace!(start_timestamp, "[timer] stale sync ignored");
            return;
        }
        if self.round.phase != GamePhase::Betting {
            let newer_than_pending = self
                .role
                .pending_sync
                .is_none_or(|(pending, _)| start_timestamp > pending);
            if newer_than_pending {
                self.role.pending_sync = Some((start_timestamp, duration));
            }
            return;
        }
        let now = self.clock.now_ms();
        self.role.timer.apply(start_timestamp, duration, now);
        let remaining = self.role.timer.remaining_secs(now).unwrap_or(0);
        self.round.time_remaining = remaining;
        self.round.round_start_timestamp = Some(start_timestamp);
        self.store.set_timer(remaining, Some(start_timestamp));
        tracing::debug!(start_timestamp, duration, remaining, "[timer] synced to host");
    }

    fn enter_round(&mut self, dice: u8, number: u32, is_rush_round: bool) {
        self.clear_round_bets();
        self.role.timer.clear();
        self.round.round_number = number;
        self.round.phase = GamePhase::Betting;
        self.round.current_dice = dice;
        self.round.is_rush_round = is_rush_round;
        self.round.time_remaining = self.config.timer_secs(is_rush_round);
        self.round.round_start_timestamp = None;
        self.store.set_round(&self.round);
        tracing::info!(round = number, dice, is_rush_round, "[round] betting opened");

        if let Some((start, duration)) = self.role.pending_sync.take() {
            self.apply_timer_sync(start, duration);
        }
    }
}

impl RoundEvents for RoundMachine<Guest> {
    fn role(&self) -> Role {
        Role::Guest
    }

    fn phase(&self) -> GamePhase {
        self.round.phase
    }

    fn on_opponent_joined(&mut self, opponent_id: PlayerId) -> Vec<Effect> {
        tracing::info!(opponent = %opponent_id, "[round] host found");
        self.seed_opponent(opponent_id);
        Vec::new()
    }

    fn on_opponent_left(&mut self) -> Vec<Effect> {
        self.role.timer.clear();
        self.end_by_disconnect()
    }

    fn on_presence(&mut self, payload: &PresencePayload) -> Vec<Effect> {
        if payload.role != Role::Host || self.round.phase == GamePhase::GameOver {
            return Vec::new();
        }
        if let Some((start, duration)) = payload.timer() {
            self.apply_timer_sync(start, duration);
        }
        Vec::new()
    }

    fn handle_message(&mut self, message: RoomMessage) -> Vec<Effect> {
        if self.round.phase == GamePhase::GameOver {
            tracing::trace!(kind = message.kind(), "[round] game over, message ignored");
            return Vec::new();
        }
        match message {
            RoomMessage::StartGame { dice } => {
                if self.round.phase == GamePhase::Lobby {
                    self.round.current_dice = dice;
                    self.round.previous_dice = dice;
                    self.store.set_dice(dice, dice);
                    tracing::info!(dice, "[round] game started");
                }
                Vec::new()
            }
            RoomMessage::NewRound {
                dice,
                round,
                is_rush_round,
            } => {
                if round > self.round.round_number {
                    self.enter_round(dice, round, is_rush_round);
                } else {
                    tracing::debug!(
                        round,
                        current = self.round.round_number,
                        "[round] stale new-round"
                    );
                }
                Vec::new()
            }
            RoomMessage::TimerSync {
                start_timestamp,
                duration,
            } => {
                self.apply_timer_sync(start_timestamp, duration);
                Vec::new()
            }
            RoomMessage::BetLocked { bet } => {
                let from_opponent = self.opponent_id.as_deref() == Some(bet.player_id.as_str());
                if self.round.phase == GamePhase::Betting
                    && from_opponent
                    && self.opponent_bet.is_none()
                {
                    self.opponent_bet = Some(bet.clone());
                    self.store.set_opponent_bet(Some(bet));
                }
                Vec::new()
            }
            RoomMessage::DiceResult {
                dice,
                results,
                scores,
            } => {
                self.scores = scores;
                self.store.set_scores(&self.scores);
                if self.round.phase != GamePhase::Results {
                    self.role.timer.clear();
                    self.round.previous_dice = self.round.current_dice;
                    self.round.current_dice = dice;
                    self.round.time_remaining = 0;
                    self.round.phase = GamePhase::Results;
                    self.store.set_round(&self.round);
                    self.store.set_round_results(&results);
                    tracing::info!(
                        round = self.round.round_number,
                        dice,
                        scores = ?self.scores,
                        "[round] result received"
                    );
                }
                Vec::new()
            }
            RoomMessage::GameOver {
                scores,
                winner,
                reason,
            } => {
                self.scores = scores;
                self.role.timer.clear();
                self.round.phase = GamePhase::GameOver;
                self.store.set_scores(&self.scores);
                self.store.set_phase(GamePhase::GameOver);
                tracing::info!(winner = ?winner, reason = %reason, "[round] game over");
                self.store.set_winner(winner, reason);
                vec![Effect::CancelDeferred]
            }
            RoomMessage::PlayerJoined { opponent_id } => {
                tracing::debug!(opponent = %opponent_id, "[round] host acknowledged join");
                Vec::new()
            }
        }
    }

    fn on_tick(&mut self) -> Vec<Effect> {
        if self.round.phase != GamePhase::Betting {
            return Vec::new();
        }
        let now = self.clock.now_ms();
        if let Some(remaining) = self.role.timer.remaining_secs(now)
            && remaining != self.round.time_remaining
        {
            self.round.time_remaining = remaining;
            self.store.set_timer(remaining, None);
        }
        Vec::new()
    }

    fn on_deferred(&mut self, deferred: Deferred) -> Vec<Effect> {
        tracing::trace!(?deferred, "[round] guest has no deferred steps");
        Vec::new()
    }

    fn place_bet(&mut self, amount: u32, prediction: Prediction) -> Result<Vec<Effect>, BetError> {
        let bet = self.lock_local_bet(amount, prediction)?;
        Ok(vec![Effect::Broadcast(RoomMessage::BetLocked { bet })])
    }

    fn place_preset(
        &mut self,
        size: BetSize,
        prediction: Prediction,
    ) -> Result<Vec<Effect>, BetError> {
        let amount = self.preset_amount(size);
        self.place_bet(amount, prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::GameStore;

    const T0: u64 = 1_700_000_000_000;

    fn host_machine() -> (RoundMachine<Host>, ManualClock, Arc<GameStore>) {
        let clock = ManualClock::new(T0);
        let store = Arc::new(GameStore::new());
        let machine = RoundMachine::host(
            "host".to_string(),
            Arc::new(GameConfig::default()),
            Arc::new(clock.clone()),
            store.clone(),
            42,
        );
        (machine, clock, store)
    }

    fn guest_machine() -> (RoundMachine<Guest>, ManualClock, Arc<GameStore>) {
        let clock = ManualClock::new(T0);
        let store = Arc::new(GameStore::new());
        let machine = RoundMachine::guest(
            "guest".to_string(),
            Arc::new(GameConfig::default()),
            Arc::new(clock.clone()),
            store.clone(),
        );
        (machine, clock, store)
    }

    /// Host with an opponent, past the start delay, in round 1 betting.
    fn host_in_betting() -> (RoundMachine<Host>, ManualClock, Arc<GameStore>) {
        let (mut host, clock, store) = host_machine();
        host.on_opponent_joined("guest".to_string());
        host.on_deferred(Deferred::StartGame);
        assert_eq!(host.phase(), GamePhase::Betting);
        (host, clock, store)
    }

    fn dice_results(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Broadcast(RoomMessage::DiceResult { .. })))
            .count()
    }

    fn guest_bet(amount: u32) -> RoomMessage {
        RoomMessage::BetLocked {
            bet: Bet::new("guest".to_string(), amount, Prediction::Higher, T0 + 10),
        }
    }

    #[test]
    fn test_opponent_join_schedules_start_once() {
        let (mut host, _clock, _store) = host_machine();
        let effects = host.on_opponent_joined("guest".to_string());
        assert!(effects.contains(&Effect::Schedule {
            deferred: Deferred::StartGame,
            after: Duration::from_millis(3_000),
        }));
        assert!(matches!(
            effects[0],
            Effect::Broadcast(RoomMessage::PlayerJoined { .. })
        ));
        // presence resync
        assert!(host.on_opponent_joined("guest".to_string()).is_empty());
        assert_eq!(host.scores()["guest"], 100);
    }

    #[test]
    fn test_start_game_opens_round_one() {
        let (mut host, _clock, store) = host_machine();
        host.on_opponent_joined("guest".to_string());
        let effects = host.on_deferred(Deferred::StartGame);

        assert!(matches!(effects[0], Effect::Broadcast(RoomMessage::StartGame { .. })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Broadcast(RoomMessage::NewRound { round: 1, .. })
        )));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Broadcast(RoomMessage::TimerSync { start_timestamp: T0, .. })
        )));
        let Some(Effect::TrackPresence(presence)) =
            effects.iter().find(|e| matches!(e, Effect::TrackPresence(_)))
        else {
            panic!("host must republish presence with the timer");
        };
        assert_eq!(presence.round_start_time, Some(T0));

        let view = store.snapshot();
        assert_eq!(view.round.phase, GamePhase::Betting);
        assert_eq!(view.round.round_number, 1);

        // a second start is a no-op
        assert!(host.on_deferred(Deferred::StartGame).is_empty());
    }

    #[test]
    fn test_resolution_runs_once_for_bets_and_expiry() {
        let (mut host, clock, _store) = host_in_betting();
        let mut all = host.place_bet(10, Prediction::Lower).unwrap();

        clock.advance(60_000);
        all.extend(host.handle_message(guest_bet(20)));
        all.extend(host.on_tick());
        all.extend(host.on_tick());
        assert!(all.iter().any(|e| matches!(
            e,
            Effect::Schedule {
                deferred: Deferred::Reveal { round: 1 },
                ..
            } | Effect::Schedule {
                deferred: Deferred::GameOver { round: 1 },
                ..
            }
        )));

        all.extend(host.on_deferred(Deferred::Reveal { round: 1 }));
        all.extend(host.on_deferred(Deferred::Reveal { round: 1 }));
        all.extend(host.resolve_round());
        assert_eq!(dice_results(&all), 1);
    }

    #[test]
    fn test_expiry_passes_missing_bets() {
        let (mut host, clock, store) = host_in_betting();
        host.place_bet(10, Prediction::FourOrHigher).unwrap();
        clock.advance(10_000);
        let effects = host.on_tick();
        assert_eq!(host.phase(), GamePhase::Revealing);
        assert!(!effects.is_empty());

        let effects = host.on_deferred(Deferred::Reveal { round: 1 });
        let Some(Effect::Broadcast(RoomMessage::DiceResult { results, scores, .. })) =
            effects.first()
        else {
            panic!("expected dice-result");
        };
        assert_eq!(
            results.player_results["guest"].result,
            dice_rush_proto::BetOutcome::Passed
        );
        assert_eq!(scores["guest"], 90);
        assert_eq!(store.snapshot().scores["guest"], 90);
    }

    #[test]
    fn test_host_ignores_invalid_bets() {
        let (mut host, _clock, _store) = host_machine();
        host.on_opponent_joined("guest".to_string());
        // lobby
        assert!(host.handle_message(guest_bet(10)).is_empty());

        host.on_deferred(Deferred::StartGame);
        let stranger = RoomMessage::BetLocked {
            bet: Bet::new("mallory".to_string(), 10, Prediction::Higher, T0),
        };
        assert!(host.handle_message(stranger).is_empty());
        assert!(host.handle_message(guest_bet(10)).is_empty());
        // duplicate from the same player is dropped
        assert!(host.handle_message(guest_bet(50)).is_empty());
        assert_eq!(host.role.bets["guest"].amount, 10);
    }

    #[test]
    fn test_stale_deferred_is_dropped() {
        let (mut host, _clock, _store) = host_in_betting();
        assert!(host.on_deferred(Deferred::Reveal { round: 1 }).is_empty());
        assert!(host.on_deferred(Deferred::NextRound { round: 1 }).is_empty());
        assert!(host.on_deferred(Deferred::GameOver { round: 1 }).is_empty());
        assert_eq!(host.phase(), GamePhase::Betting);
    }

    #[test]
    fn test_full_round_cycle_advances_round() {
        let (mut host, _clock, _store) = host_in_betting();
        host.place_bet(5, Prediction::Higher).unwrap();
        host.handle_message(guest_bet(5));
        host.on_deferred(Deferred::Reveal { round: 1 });
        assert_eq!(host.phase(), GamePhase::Results);
        let effects = host.on_deferred(Deferred::NextRound { round: 1 });
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Broadcast(RoomMessage::NewRound { round: 2, .. })
        )));
        assert_eq!(host.round_state().round_number, 2);
        assert!(host.place_bet(5, Prediction::Higher).is_ok());
    }

    #[test]
    fn test_game_over_broadcasts_result_first() {
        let config = GameConfig {
            max_rounds: 1,
            ..GameConfig::default()
        };
        let clock = ManualClock::new(T0);
        let store = Arc::new(GameStore::new());
        let mut host = RoundMachine::host(
            "host".to_string(),
            Arc::new(config),
            Arc::new(clock.clone()),
            store.clone(),
            7,
        );
        host.on_opponent_joined("guest".to_string());
        host.on_deferred(Deferred::StartGame);
        host.place_bet(10, Prediction::Higher).unwrap();
        let effects = host.handle_message(guest_bet(10));

        assert!(matches!(effects[0], Effect::Broadcast(RoomMessage::DiceResult { .. })));
        assert_eq!(
            effects[1],
            Effect::Schedule {
                deferred: Deferred::GameOver { round: 1 },
                after: Duration::from_millis(100),
            }
        );
        let effects = host.on_deferred(Deferred::GameOver { round: 1 });
        let [Effect::Broadcast(RoomMessage::GameOver { reason, .. })] = effects.as_slice() else {
            panic!("expected game-over broadcast");
        };
        assert_eq!(*reason, GameOverReason::RoundsComplete);
        assert_eq!(host.phase(), GamePhase::GameOver);
        assert_eq!(store.snapshot().game_over_reason, Some(GameOverReason::RoundsComplete));
    }

    #[test]
    fn test_local_bet_validation() {
        let (mut host, _clock, _store) = host_machine();
        assert_eq!(host.place_bet(10, Prediction::Higher), Err(BetError::NotBetting));

        let (mut host, _clock, store) = host_in_betting();
        assert_eq!(
            host.place_bet(0, Prediction::Higher),
            Err(BetError::InvalidAmount { max: 100 })
        );
        assert_eq!(
            host.place_bet(101, Prediction::Higher),
            Err(BetError::InvalidAmount { max: 100 })
        );
        let effects = host.place_preset(BetSize::Half, Prediction::Lower).unwrap();
        assert!(matches!(
            &effects[0],
            Effect::Broadcast(RoomMessage::BetLocked { bet }) if bet.amount == 50
        ));
        assert!(store.snapshot().bet_locked);
        assert_eq!(host.place_bet(10, Prediction::Higher), Err(BetError::AlreadyLocked));
    }

    #[test]
    fn test_bet_presets_cap_at_score() {
        let presets = BetPresets::default();
        assert_eq!(BetSize::Small.amount(100, &presets), 10);
        assert_eq!(BetSize::Medium.amount(100, &presets), 25);
        assert_eq!(BetSize::Medium.amount(12, &presets), 12);
        assert_eq!(BetSize::Half.amount(55, &presets), 27);
        assert_eq!(BetSize::Half.amount(1, &presets), 1);
        assert_eq!(BetSize::AllIn.amount(240, &presets), 240);
        assert_eq!(BetSize::AllIn.amount(0, &presets), 0);
        assert_eq!("All-In".parse::<BetSize>(), Ok(BetSize::AllIn));
    }

    #[test]
    fn test_disconnect_ends_game_with_local_winner() {
        let (mut host, _clock, store) = host_in_betting();
        assert_eq!(host.on_opponent_left(), vec![Effect::CancelDeferred]);
        let view = store.snapshot();
        assert_eq!(view.round.phase, GamePhase::GameOver);
        assert_eq!(view.game_winner.as_deref(), Some("host"));
        assert_eq!(view.game_over_reason, Some(GameOverReason::OpponentDisconnected));
        assert!(host.on_opponent_left().is_empty());
        assert!(host.on_tick().is_empty());
    }

    #[test]
    fn test_rush_round_shortens_timer() {
        let config = GameConfig {
            rush_round_chance: 1.0,
            ..GameConfig::default()
        };
        let clock = ManualClock::new(T0);
        let store = Arc::new(GameStore::new());
        let mut host = RoundMachine::host(
            "host".to_string(),
            Arc::new(config),
            Arc::new(clock.clone()),
            store.clone(),
            3,
        );
        host.on_opponent_joined("guest".to_string());
        let effects = host.on_deferred(Deferred::StartGame);

        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Broadcast(RoomMessage::NewRound {
                is_rush_round: true,
                ..
            })
        )));
        assert!(effects.contains(&Effect::Broadcast(RoomMessage::TimerSync {
            start_timestamp: T0,
            duration: 5,
        })));
        let view = store.snapshot();
        assert!(view.round.is_rush_round);
        assert_eq!(view.round.time_remaining, 5);

        clock.advance(5_000);
        host.on_tick();
        assert_eq!(host.phase(), GamePhase::Revealing);
    }

    #[test]
    fn test_guest_wins_when_host_leaves() {
        let (mut guest, _clock, store) = guest_machine();
        guest.on_opponent_joined("host".to_string());
        guest.handle_message(RoomMessage::NewRound {
            dice: 2,
            round: 1,
            is_rush_round: false,
        });

        assert_eq!(guest.on_opponent_left(), vec![Effect::CancelDeferred]);
        let view = store.snapshot();
        assert_eq!(view.round.phase, GamePhase::GameOver);
        assert_eq!(view.game_winner.as_deref(), Some("guest"));
        assert_eq!(view.game_over_reason, Some(GameOverReason::OpponentDisconnected));
        assert!(guest.on_opponent_left().is_empty());
        assert!(guest.place_bet(10, Prediction::Higher).is_err());
    }

    #[test]
    fn test_guest_recovers_timer_from_presence_alone() {
        let (mut guest, clock, store) = guest_machine();
        guest.on_opponent_joined("host".to_string());
        guest.handle_message(RoomMessage::NewRound {
            dice: 5,
            round: 1,
            is_rush_round: false,
        });

        // the timer-sync broadcast never arrives
        clock.set(T0 + 4_000);
        let presence = PresencePayload::new("host".to_string(), Role::Host).with_timer(T0, 10);
        guest.on_presence(&presence);
        let view = store.snapshot();
        assert_eq!(view.round.time_remaining, 6);
        assert_eq!(view.round.round_start_timestamp, Some(T0));

        // an older stamp must not rewind the countdown
        guest.handle_message(RoomMessage::TimerSync {
            start_timestamp: T0 - 20_000,
            duration: 10,
        });
        assert_eq!(guest.round_state().time_remaining, 6);
        assert_eq!(guest.round_state().round_start_timestamp, Some(T0));

        clock.advance(1_000);
        guest.on_tick();
        assert_eq!(store.snapshot().round.time_remaining, 5);
    }

    #[test]
    fn test_guest_timer_sync_from_delayed_message() {
        let (mut guest, clock, store) = guest_machine();
        guest.on_opponent_joined("host".to_string());
        guest.handle_message(RoomMessage::NewRound {
            dice: 3,
            round: 1,
            is_rush_round: false,
        });
        // sync processed 3s after the host stamped it
        clock.set(T0 + 3_000);
        guest.handle_message(RoomMessage::TimerSync {
            start_timestamp: T0,
            duration: 10,
        });
        assert_eq!(store.snapshot().round.time_remaining, 7);

        clock.advance(2_000);
        guest.on_tick();
        assert_eq!(store.snapshot().round.time_remaining, 5);

        // duplicate via presence does not reset the countdown
        let presence = PresencePayload::new("host".to_string(), Role::Host).with_timer(T0, 10);
        guest.on_presence(&presence);
        assert_eq!(guest.round_state().time_remaining, 5);
    }

    #[test]
    fn test_guest_holds_early_timer_sync() {
        let (mut guest, clock, _store) = guest_machine();
        guest.on_opponent_joined("host".to_string());
        // timer-sync overtakes new-round
        guest.handle_message(RoomMessage::TimerSync {
            start_timestamp: T0,
            duration: 5,
        });
        assert_eq!(guest.phase(), GamePhase::Lobby);

        clock.set(T0 + 1_000);
        guest.handle_message(RoomMessage::NewRound {
            dice: 2,
            round: 1,
            is_rush_round: true,
        });
        assert_eq!(guest.phase(), GamePhase::Betting);
        assert_eq!(guest.round_state().time_remaining, 4);
        assert_eq!(guest.round_state().round_start_timestamp, Some(T0));
    }

    #[test]
    fn test_guest_mirrors_results_and_ignores_after_game_over() {
        let (mut guest, _clock, store) = guest_machine();
        guest.on_opponent_joined("host".to_string());
        guest.handle_message(RoomMessage::StartGame { dice: 3 });
        guest.handle_message(RoomMessage::NewRound {
            dice: 3,
            round: 1,
            is_rush_round: false,
        });
        // old round replayed
        guest.handle_message(RoomMessage::NewRound {
            dice: 6,
            round: 1,
            is_rush_round: true,
        });
        assert_eq!(guest.round_state().current_dice, 3);

        let scores = BTreeMap::from([("guest".to_string(), 135), ("host".to_string(), 60)]);
        guest.handle_message(RoomMessage::DiceResult {
            dice: 5,
            results: RoundResults {
                dice: 5,
                player_results: BTreeMap::new(),
            },
            scores: scores.clone(),
        });
        let view = store.snapshot();
        assert_eq!(view.round.phase, GamePhase::Results);
        assert_eq!(view.round.current_dice, 5);
        assert_eq!(view.round.previous_dice, 3);
        assert_eq!(view.scores, scores);

        let effects = guest.handle_message(RoomMessage::GameOver {
            scores: scores.clone(),
            winner: Some("guest".to_string()),
            reason: GameOverReason::RoundsComplete,
        });
        assert_eq!(effects, vec![Effect::CancelDeferred]);

        guest.handle_message(RoomMessage::NewRound {
            dice: 1,
            round: 2,
            is_rush_round: false,
        });
        assert_eq!(guest.phase(), GamePhase::GameOver);
        assert_eq!(store.snapshot().game_winner.as_deref(), Some("guest"));
    }

    #[test]
    fn test_guest_bet_is_broadcast_not_resolved() {
        let (mut guest, _clock, _store) = guest_machine();
        guest.on_opponent_joined("host".to_string());
        guest.handle_message(RoomMessage::NewRound {
            dice: 4,
            round: 1,
            is_rush_round: false,
        });
        let effects = guest.place_bet(30, Prediction::ThreeOrLower).unwrap();
        assert_eq!(effects.len(), 1);
        assert!(matches!(
            &effects[0],
            Effect::Broadcast(RoomMessage::BetLocked { bet }) if bet.player_id == "guest"
        ));
        guest.handle_message(RoomMessage::BetLocked {
            bet: Bet::new("host".to_string(), 10, Prediction::Higher, T0),
        });
        assert_eq!(guest.phase(), GamePhase::Betting);
    }
}
