//! Game configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! `DICE_RUSH_*` environment overrides. The result is checked by
//! [`GameConfig::validate`] before use.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Points added on top of a round's win or loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BonusConfig {
    /// Both players picked the same prediction and both won.
    pub mirror: i32,
    /// Exactly one player won.
    pub contrarian: i32,
    /// Earliest bet of the round.
    pub speed: i32,
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self {
            mirror: 10,
            contrarian: 5,
            speed: 2,
        }
    }
}

/// Quick bet sizes offered to the player.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BetPresets {
    pub small: u32,
    pub medium: u32,
    /// Fraction of the current score.
    pub half: f64,
}

impl Default for BetPresets {
    fn default() -> Self {
        Self {
            small: 10,
            medium: 25,
            half: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub initial_score: i32,
    pub winning_score: i32,
    pub min_score: i32,
    pub max_rounds: u32,

    pub normal_timer_secs: u32,
    pub rush_timer_secs: u32,
    pub rush_round_chance: f64,

    pub dice_min: u8,
    pub dice_max: u8,

    pub room_code_length: usize,
    pub room_code_min: u32,
    pub room_code_max: u32,

    /// Deducted from a player who let the betting timer run out.
    pub timeout_penalty: i32,
    pub bonuses: BonusConfig,
    pub bet_presets: BetPresets,

    pub start_game_delay_ms: u64,
    pub reveal_delay_ms: u64,
    pub results_display_ms: u64,
    pub game_over_delay_ms: u64,

    pub tick_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            initial_score: 100,
            winning_score: 300,
            min_score: 0,
            max_rounds: 20,
            normal_timer_secs: 10,
            rush_timer_secs: 5,
            rush_round_chance: 0.33,
            dice_min: 1,
            dice_max: 6,
            room_code_length: 6,
            room_code_min: 100_000,
            room_code_max: 999_999,
            timeout_penalty: 10,
            bonuses: BonusConfig::default(),
            bet_presets: BetPresets::default(),
            start_game_delay_ms: 3_000,
            reveal_delay_ms: 800,
            results_display_ms: 6_000,
            game_over_delay_ms: 100,
            tick_ms: 250,
            join_timeout_ms: 10_000,
        }
    }
}

impl GameConfig {
    /// Defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_json_str(&raw)?
            }
            None => Self::default(),
        };
        let config = base.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a (possibly partial) JSON document over the defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `DICE_RUSH_*` overrides read through `lookup`.
    ///
    /// Unparseable values keep the current setting.
    #[must_use]
    pub fn with_overrides_from(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            initial_score: read_var(&lookup, "DICE_RUSH_INITIAL_SCORE", self.initial_score),
            winning_score: read_var(&lookup, "DICE_RUSH_WINNING_SCORE", self.winning_score),
            min_score: read_var(&lookup, "DICE_RUSH_MIN_SCORE", self.min_score),
            max_rounds: read_var(&lookup, "DICE_RUSH_MAX_ROUNDS", self.max_rounds),
            normal_timer_secs: read_var(
                &lookup,
                "DICE_RUSH_NORMAL_TIMER_SECS",
                self.normal_timer_secs,
            ),
            rush_timer_secs: read_var(&lookup, "DICE_RUSH_RUSH_TIMER_SECS", self.rush_timer_secs),
            rush_round_chance: read_var(
                &lookup,
                "DICE_RUSH_RUSH_ROUND_CHANCE",
                self.rush_round_chance,
            ),
            timeout_penalty: read_var(&lookup, "DICE_RUSH_TIMEOUT_PENALTY", self.timeout_penalty),
            start_game_delay_ms: read_var(
                &lookup,
                "DICE_RUSH_START_GAME_DELAY_MS",
                self.start_game_delay_ms,
            ),
            reveal_delay_ms: read_var(&lookup, "DICE_RUSH_REVEAL_DELAY_MS", self.reveal_delay_ms),
            results_display_ms: read_var(
                &lookup,
                "DICE_RUSH_RESULTS_DISPLAY_MS",
                self.results_display_ms,
            ),
            game_over_delay_ms: read_var(
                &lookup,
                "DICE_RUSH_GAME_OVER_DELAY_MS",
                self.game_over_delay_ms,
            ),
            tick_ms: read_var(&lookup, "DICE_RUSH_TICK_MS", self.tick_ms),
            join_timeout_ms: read_var(&lookup, "DICE_RUSH_JOIN_TIMEOUT_MS", self.join_timeout_ms),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.dice_min == 0 || self.dice_min >= self.dice_max {
            return invalid("dice range must be non-empty and start at 1 or above");
        }
        if self.min_score >= self.initial_score || self.initial_score >= self.winning_score {
            return invalid("scores must satisfy min_score < initial_score < winning_score");
        }
        if self.max_rounds == 0 {
            return invalid("max_rounds must be positive");
        }
        if self.normal_timer_secs == 0 || self.rush_timer_secs == 0 {
            return invalid("round timers must be positive");
        }
        if !(0.0..=1.0).contains(&self.rush_round_chance) {
            return invalid("rush_round_chance must be within 0..=1");
        }
        if self.room_code_min > self.room_code_max
            || digits(self.room_code_min) != self.room_code_length
            || digits(self.room_code_max) != self.room_code_length
        {
            return invalid("room code range must match room_code_length");
        }
        if self.timeout_penalty < 0 {
            return invalid("timeout_penalty must not be negative");
        }
        if !(0.0..=1.0).contains(&self.bet_presets.half) {
            return invalid("bet_presets.half must be within 0..=1");
        }
        if self.tick_ms == 0 {
            return invalid("tick_ms must be positive");
        }
        Ok(())
    }

    /// Betting window length in seconds.
    pub fn timer_secs(&self, is_rush_round: bool) -> u32 {
        if is_rush_round {
            self.rush_timer_secs
        } else {
            self.normal_timer_secs
        }
    }

    pub fn roll_dice<R: Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        rng.random_range(self.dice_min..=self.dice_max)
    }

    pub fn roll_rush<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        rng.random_bool(self.rush_round_chance)
    }

    pub fn generate_room_code<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let code = rng.random_range(self.room_code_min..=self.room_code_max);
        format!("{code:0width$}", width = self.room_code_length)
    }

    /// A code is exactly `room_code_length` ASCII digits.
    pub fn is_valid_room_code(&self, code: &str) -> bool {
        code.len() == self.room_code_length && code.bytes().all(|b| b.is_ascii_digit())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

fn read_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, fallback: T) -> T {
    lookup(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(fallback)
}

fn digits(mut n: u32) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GameConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timer_secs(false), 10);
        assert_eq!(config.timer_secs(true), 5);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            GameConfig::from_json_str(r#"{"max_rounds": 5, "bonuses": {"speed": 4}}"#).unwrap();
        assert_eq!(config.max_rounds, 5);
        assert_eq!(config.bonuses.speed, 4);
        assert_eq!(config.bonuses.mirror, 10);
        assert_eq!(config.initial_score, 100);
    }

    #[test]
    fn test_env_overrides() {
        let config = GameConfig::default().with_overrides_from(|key| match key {
            "DICE_RUSH_MAX_ROUNDS" => Some("7".to_string()),
            "DICE_RUSH_TICK_MS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.max_rounds, 7);
        assert_eq!(config.tick_ms, 250);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = GameConfig {
            dice_min: 6,
            dice_max: 6,
            ..GameConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = GameConfig {
            rush_round_chance: 1.5,
            ..GameConfig::default()
        };
        assert!(config.validate().is_err());

        let config = GameConfig {
            room_code_min: 1_000,
            ..GameConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_room_codes_stay_in_range() {
        let config = GameConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let code = config.generate_room_code(&mut rng);
            assert!(config.is_valid_room_code(&code), "bad code {code}");
            let n: u32 = code.parse().unwrap();
            assert!((config.room_code_min..=config.room_code_max).contains(&n));
        }
        assert!(!config.is_valid_room_code("12345"));
        assert!(!config.is_valid_room_code("12a456"));
    }
}
