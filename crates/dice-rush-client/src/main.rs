//! Dice Rush terminal client.
//!
//! `demo` runs two bots against each other over an in-process relay.
//! `play` puts one bot into a room on a running relay.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dice_rush_core::{
    BetSize, Connector, GameConfig, GameStore, GameView, LocalConnector, RelayHub, RoomHandle,
    SessionCoordinator, SessionError,
};

use crate::bot::{Bot, Strategy};
use crate::ws::WsConnector;

mod bot;
mod ws;

#[derive(Parser, Debug)]
#[command(name = "dice-rush", about = "Two-player dice betting over a relay")]
struct Cli {
    /// JSON game config layered over the defaults.
    #[arg(long, global = true, env = "DICE_RUSH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host and guest bots in one process.
    Demo {
        #[arg(long, value_enum, default_value = "odds")]
        host: Strategy,
        #[arg(long, value_enum, default_value = "random")]
        guest: Strategy,
        /// Fix the host's dice sequence.
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        bot: BotArgs,
    },
    /// Join a relay as a bot.
    Play {
        #[arg(long, default_value = "ws://127.0.0.1:3000/ws", env = "DICE_RUSH_RELAY_URL")]
        url: String,
        /// Six-digit code to join; omit to create a room.
        #[arg(long)]
        join: Option<String>,
        #[arg(long, value_enum, default_value = "odds")]
        strategy: Strategy,
        #[command(flatten)]
        bot: BotArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct BotArgs {
    /// small, medium, half or all-in.
    #[arg(long, default_value = "small", value_parser = parse_bet_size)]
    bet: BetSize,
    /// Longest pause before betting, in milliseconds.
    #[arg(long, default_value_t = 1_500)]
    think_ms: u64,
}

fn parse_bet_size(raw: &str) -> Result<BetSize, String> {
    raw.parse()
}

impl BotArgs {
    fn bot(&self, name: &str, strategy: Strategy, config: &GameConfig) -> Bot {
        Bot {
            name: name.to_string(),
            strategy,
            size: self.bet,
            midpoint: config.dice_min + (config.dice_max - config.dice_min) / 2,
            think: Duration::from_millis(self.think_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = GameConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Demo {
            host,
            guest,
            seed,
            bot,
        } => {
            let host_bot = bot.bot("host", host, &config);
            let guest_bot = bot.bot("guest", guest, &config);
            let (host_view, guest_view) = run_demo(config, seed, &host_bot, &guest_bot).await?;
            println!("[host]\n{}", bot::summary(&host_view));
            println!("[guest]\n{}", bot::summary(&guest_view));
        }
        Command::Play {
            url,
            join,
            strategy,
            bot,
        } => {
            let player = bot.bot("player", strategy, &config);
            let store = Arc::new(GameStore::new());
            let connector = WsConnector::new(url);
            tracing::info!(url = %connector.url(), "Connecting to relay");
            let mut coordinator = SessionCoordinator::new(connector, config, store);

            let mut answers = BufReader::new(tokio::io::stdin());
            let mut room = open_room(&mut coordinator, join.as_deref(), &mut answers).await?;
            println!("Room code: {}", room.room_code());
            let view = player.play(&room).await;
            println!("{}", bot::summary(&view));
            room.leave().await;
        }
    }
    Ok(())
}

async fn run_demo(
    config: GameConfig,
    seed: Option<u64>,
    host_bot: &Bot,
    guest_bot: &Bot,
) -> Result<(GameView, GameView), SessionError> {
    let hub = RelayHub::new();
    let mut host_side = SessionCoordinator::new(
        LocalConnector::new(hub.clone()),
        config.clone(),
        Arc::new(GameStore::new()),
    );
    if let Some(seed) = seed {
        host_side = host_side.with_seed(seed);
    }
    let mut guest_side =
        SessionCoordinator::new(LocalConnector::new(hub), config, Arc::new(GameStore::new()));

    let mut host = host_side.create_room().await?;
    let mut guest = guest_side.join_room(host.room_code()).await?;
    tracing::info!(room_code = %host.room_code(), "Demo room ready");

    let views = tokio::join!(host_bot.play(&host), guest_bot.play(&guest));
    guest.leave().await;
    host.leave().await;
    Ok(views)
}

/// Create or join. After a connection failure the user is asked whether to
/// retry; nothing is re-run without a yes.
async fn open_room<C: Connector, R: AsyncBufRead + Unpin>(
    coordinator: &mut SessionCoordinator<C>,
    join: Option<&str>,
    answers: &mut R,
) -> Result<RoomHandle, SessionError> {
    let mut result = match join {
        Some(code) => coordinator.join_room(code).await,
        None => coordinator.create_room().await,
    };
    loop {
        let err = match result {
            Ok(room) => return Ok(room),
            Err(err @ SessionError::InvalidRoomCode { .. }) => return Err(err),
            Err(err) => err,
        };
        eprint!("{err}\nRetry? [y/N] ");
        let mut line = String::new();
        let confirmed = matches!(answers.read_line(&mut line).await, Ok(n) if n > 0)
            && line.trim().eq_ignore_ascii_case("y");
        if !confirmed {
            return Err(err);
        }
        result = coordinator.retry().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dice_rush_core::{ChannelError, EventReceiver, Intent};

    use super::*;
    use crate::ws::WsChannel;

    #[derive(Default)]
    struct RefusingConnector {
        attempts: Arc<AtomicUsize>,
    }

    impl Connector for RefusingConnector {
        type Channel = WsChannel;

        async fn connect(
            &self,
            _topic: &str,
            _key: &str,
        ) -> Result<(WsChannel, EventReceiver), ChannelError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ChannelError::Connect("connection refused".to_string()))
        }
    }

    fn refusing() -> (SessionCoordinator<RefusingConnector>, Arc<AtomicUsize>) {
        let connector = RefusingConnector::default();
        let attempts = connector.attempts.clone();
        let coordinator =
            SessionCoordinator::new(connector, GameConfig::default(), Arc::new(GameStore::new()));
        (coordinator, attempts)
    }

    #[tokio::test]
    async fn test_failed_join_is_not_retried_without_consent() {
        let (mut coordinator, attempts) = refusing();
        let mut answers: &[u8] = b"";
        let result = open_room(&mut coordinator, Some("123456"), &mut answers).await;
        assert!(matches!(result, Err(SessionError::Channel(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.last_intent(), Some(&Intent::Join("123456".to_string())));
    }

    #[tokio::test]
    async fn test_retry_runs_once_per_yes() {
        let (mut coordinator, attempts) = refusing();
        let mut answers: &[u8] = b"y\nn\n";
        let result = open_room(&mut coordinator, None, &mut answers).await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.last_intent(), Some(&Intent::Create));
    }

    #[tokio::test]
    async fn test_bad_code_is_not_offered_a_retry() {
        let (mut coordinator, attempts) = refusing();
        let mut answers: &[u8] = b"y\n";
        let result = open_room(&mut coordinator, Some("12ab"), &mut answers).await;
        assert!(matches!(result, Err(SessionError::InvalidRoomCode { expected: 6 })));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_runs_to_game_over() {
        let config = GameConfig {
            max_rounds: 4,
            ..GameConfig::default()
        };
        let args = BotArgs {
            bet: BetSize::Medium,
            think_ms: 500,
        };
        let host = args.bot("host", Strategy::Odds, &config);
        let guest = args.bot("guest", Strategy::Edge, &config);
        assert_eq!(host.midpoint, 3);

        let (host_view, guest_view) = run_demo(config, Some(9), &host, &guest).await.unwrap();
        assert!(host_view.is_game_over());
        assert!(guest_view.is_game_over());
        assert_eq!(host_view.scores, guest_view.scores);
        assert_eq!(host_view.game_winner, guest_view.game_winner);
    }

    #[test]
    fn test_cli_parses_play() {
        let cli = Cli::try_parse_from([
            "dice-rush",
            "play",
            "--join",
            "123456",
            "--bet",
            "all-in",
            "--strategy",
            "edge",
        ])
        .unwrap();
        match cli.command {
            Command::Play {
                join, strategy, bot, ..
            } => {
                assert_eq!(join.as_deref(), Some("123456"));
                assert_eq!(strategy, Strategy::Edge);
                assert_eq!(bot.bet, BetSize::AllIn);
            }
            Command::Demo { .. } => panic!("expected play"),
        }
        assert!(Cli::try_parse_from(["dice-rush", "demo", "--bet", "huge"]).is_err());
    }
}
