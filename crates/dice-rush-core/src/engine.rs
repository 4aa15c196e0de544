//! Bet resolution.
//!
//! Pure functions over bets, dice and scores. Only the host calls into the
//! resolving half of this module; the guest never recomputes results and
//! takes score boards verbatim from the host.

use std::collections::BTreeMap;

use dice_rush_proto::{
    Bet, BetOutcome, GameOverReason, PlayerId, PlayerResult, Prediction, RoundResults, ScoreBoard,
};

use crate::config::{BonusConfig, GameConfig};

/// Terminal verdict from [`check_win_conditions`]. `winner` is `None` on a draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameOutcome {
    pub winner: Option<PlayerId>,
    pub reason: GameOverReason,
}

/// Outcome of a single prediction.
///
/// Edge predictions look only at `new_dice`. For higher/lower a repeated
/// value is a push.
pub fn calculate_round_result(old_dice: u8, new_dice: u8, prediction: Prediction) -> BetOutcome {
    let won = match prediction {
        Prediction::FourOrHigher => new_dice >= 4,
        Prediction::ThreeOrLower => new_dice <= 3,
        Prediction::Higher | Prediction::Lower if new_dice == old_dice => {
            return BetOutcome::Push;
        }
        Prediction::Higher => new_dice > old_dice,
        Prediction::Lower => new_dice < old_dice,
    };
    if won { BetOutcome::Win } else { BetOutcome::Loss }
}

/// Bonus points per player.
///
/// Only defined for a round with exactly two bets, neither of them passed.
/// Rules are additive: mirror (same prediction, both win), contrarian
/// (exactly one wins) and speed (earliest timestamp, regardless of result).
pub fn calculate_bonuses(
    bets: &BTreeMap<PlayerId, Bet>,
    old_dice: u8,
    new_dice: u8,
    values: &BonusConfig,
) -> BTreeMap<PlayerId, i32> {
    let mut bonuses = BTreeMap::new();
    if bets.len() != 2 || bets.values().any(Bet::is_passed) {
        return bonuses;
    }

    let mut iter = bets.iter();
    let (Some((id1, bet1)), Some((id2, bet2))) = (iter.next(), iter.next()) else {
        return bonuses;
    };
    let result1 = calculate_round_result(old_dice, new_dice, bet1.prediction);
    let result2 = calculate_round_result(old_dice, new_dice, bet2.prediction);

    let mut add = |id: &PlayerId, points: i32| {
        *bonuses.entry(id.clone()).or_insert(0) += points;
    };

    if bet1.prediction == bet2.prediction
        && result1 == BetOutcome::Win
        && result2 == BetOutcome::Win
    {
        add(id1, values.mirror);
        add(id2, values.mirror);
    }

    match (result1, result2) {
        (BetOutcome::Win, BetOutcome::Loss) => add(id1, values.contrarian),
        (BetOutcome::Loss, BetOutcome::Win) => add(id2, values.contrarian),
        _ => {}
    }

    // Ties go to the first player in key order.
    let fastest = if bet2.timestamp < bet1.timestamp { id2 } else { id1 };
    add(fastest, values.speed);

    bonuses
}

/// Full per-player results for a round.
pub fn calculate_round_results(
    old_dice: u8,
    new_dice: u8,
    bets: &BTreeMap<PlayerId, Bet>,
    config: &GameConfig,
) -> RoundResults {
    let bonuses = calculate_bonuses(bets, old_dice, new_dice, &config.bonuses);

    let player_results = bets
        .iter()
        .map(|(id, bet)| {
            let result = if bet.is_passed() {
                PlayerResult {
                    result: BetOutcome::Passed,
                    points_change: -config.timeout_penalty,
                    bonuses: 0,
                }
            } else {
                let result = calculate_round_result(old_dice, new_dice, bet.prediction);
                let amount = i32::try_from(bet.amount).unwrap_or(i32::MAX);
                let points_change = match result {
                    BetOutcome::Win => amount,
                    BetOutcome::Loss => -amount,
                    BetOutcome::Push | BetOutcome::Passed => 0,
                };
                PlayerResult {
                    result,
                    points_change,
                    bonuses: bonuses.get(id).copied().unwrap_or(0),
                }
            };
            (id.clone(), result)
        })
        .collect();

    RoundResults {
        dice: new_dice,
        player_results,
    }
}

/// Add each player's round total to the board, clamped at `min_score`.
pub fn apply_round_results(scores: &mut ScoreBoard, results: &RoundResults, min_score: i32) {
    for (id, result) in &results.player_results {
        if let Some(score) = scores.get_mut(id) {
            *score = score.saturating_add(result.total()).max(min_score);
        }
    }
}

/// Evaluate the end-of-game conditions in fixed priority order:
/// a player at the floor, a player at the winning threshold, the round limit.
///
/// Returns `None` unless the board holds exactly two players.
pub fn check_win_conditions(
    scores: &ScoreBoard,
    round: u32,
    config: &GameConfig,
) -> Option<GameOutcome> {
    if scores.len() != 2 {
        return None;
    }
    let mut iter = scores.iter();
    let ((id1, &score1), (id2, &score2)) = (iter.next()?, iter.next()?);

    let over = |winner: Option<&PlayerId>, reason| {
        Some(GameOutcome {
            winner: winner.cloned(),
            reason,
        })
    };

    if score1 <= config.min_score {
        return over(Some(id2), GameOverReason::OpponentZero);
    }
    if score2 <= config.min_score {
        return over(Some(id1), GameOverReason::OpponentZero);
    }
    if score1 >= config.winning_score {
        return over(Some(id1), GameOverReason::PointsThreshold);
    }
    if score2 >= config.winning_score {
        return over(Some(id2), GameOverReason::PointsThreshold);
    }
    if round >= config.max_rounds {
        let winner = match score1.cmp(&score2) {
            std::cmp::Ordering::Greater => Some(id1),
            std::cmp::Ordering::Less => Some(id2),
            std::cmp::Ordering::Equal => None,
        };
        return over(winner, GameOverReason::RoundsComplete);
    }
    None
}
