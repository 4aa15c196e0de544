//! Automated players.

use std::fmt::Write as _;
use std::time::Duration;

use clap::ValueEnum;
use rand::Rng;
use rand::seq::IndexedRandom;

use dice_rush_core::{BetSize, ConnectionState, GamePhase, GameView, RoomHandle, SessionError};
use dice_rush_proto::{GameOverReason, Prediction};

/// How a bot picks its prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Any of the four predictions.
    Random,
    /// Bet against the current dice: higher from the low half, lower from the high half.
    Odds,
    /// Alternate the two edge predictions by round.
    Edge,
}

impl Strategy {
    pub fn choose<R: Rng + ?Sized>(self, view: &GameView, midpoint: u8, rng: &mut R) -> Prediction {
        match self {
            Strategy::Random => *Prediction::ALL.choose(rng).unwrap_or(&Prediction::Higher),
            Strategy::Odds => {
                if view.round.current_dice <= midpoint {
                    Prediction::Higher
                } else {
                    Prediction::Lower
                }
            }
            Strategy::Edge => {
                if view.round.round_number % 2 == 1 {
                    Prediction::FourOrHigher
                } else {
                    Prediction::ThreeOrLower
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bot {
    pub name: String,
    pub strategy: Strategy,
    pub size: BetSize,
    /// Dice value at or below which `Odds` goes higher.
    pub midpoint: u8,
    /// Upper bound of the random pause before betting.
    pub think: Duration,
}

impl Bot {
    /// Play until the game ends or the room goes away. Returns the last view.
    pub async fn play(&self, room: &RoomHandle) -> GameView {
        let mut changes = room.store().subscribe();
        let mut bet_round = 0;
        let mut reported_round = 0;

        loop {
            let view = room.view();
            if view.is_game_over() || view.connection == ConnectionState::Error {
                return view;
            }

            if let Some(results) = &view.last_round_results
                && view.round.phase == GamePhase::Results
                && view.round.round_number != reported_round
            {
                reported_round = view.round.round_number;
                let mine = view
                    .my_player_id
                    .as_ref()
                    .and_then(|id| results.player_results.get(id));
                if let Some(mine) = mine {
                    tracing::info!(
                        bot = %self.name,
                        round = reported_round,
                        dice = results.dice,
                        result = ?mine.result,
                        points = mine.total(),
                        score = view.my_score,
                        "Round resolved"
                    );
                }
            }

            if view.round.phase == GamePhase::Betting
                && view.my_bet.is_none()
                && view.round.round_number != bet_round
            {
                bet_round = view.round.round_number;
                let (pause, prediction) = {
                    let mut rng = rand::rng();
                    let pause = self.think.mul_f64(rng.random::<f64>());
                    (pause, self.strategy.choose(&view, self.midpoint, &mut rng))
                };
                tokio::time::sleep(pause).await;
                match room.place_preset(self.size, prediction).await {
                    Ok(()) => tracing::debug!(bot = %self.name, %prediction, "Bet placed"),
                    Err(SessionError::Inactive) => return room.view(),
                    Err(err) => tracing::warn!(bot = %self.name, error = %err, "Bet rejected"),
                }
                continue;
            }

            if changes.changed().await.is_err() {
                return room.view();
            }
        }
    }
}

/// Human readable end-of-game report.
pub fn summary(view: &GameView) -> String {
    let mut out = String::new();
    let me = view.my_player_id.as_deref().unwrap_or("?");
    let verdict = match (&view.game_winner, view.my_player_id.as_ref()) {
        (Some(winner), Some(me)) if winner == me => "You won",
        (Some(_), _) => "You lost",
        (None, _) => "Draw",
    };
    let reason = match view.game_over_reason {
        Some(GameOverReason::PointsThreshold) => "winning score reached",
        Some(GameOverReason::OpponentZero) => "a player ran out of points",
        Some(GameOverReason::RoundsComplete) => "round limit reached",
        Some(GameOverReason::OpponentDisconnected) => "opponent disconnected",
        None => "game still running",
    };
    let _ = writeln!(out, "{verdict} ({reason}) after {} rounds", view.round.round_number);
    let _ = writeln!(out, "  {me}: {}", view.my_score);
    if let Some(opponent) = &view.opponent_id {
        let _ = writeln!(out, "  {opponent}: {}", view.opponent_score);
    }
    if view.win_streak > 1 {
        let _ = writeln!(out, "  win streak: {}", view.win_streak);
    }
    out
}
