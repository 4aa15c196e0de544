//! Session coordinator and the per-room driver task.
//!
//! Creating or joining a room subscribes to `room:<code>`, waits for the
//! subscription status, tracks presence and then hands the channel to a
//! driver task. The driver owns the [`RoundMachine`] and selects over
//! channel events, user commands, a periodic tick and deferred steps.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use dice_rush_proto::{
    ChannelStatus, PlayerId, PresenceEntry, PresencePayload, Prediction, ProtoError, Role,
    RoomMessage,
};

use crate::channel::{ChannelError, ChannelEvent, Connector, EventReceiver, PeerChannel};
use crate::clock::{SharedClock, SystemClock};
use crate::config::GameConfig;
use crate::round::{BetError, BetSize, Deferred, Effect, RoundEvents, RoundMachine};
use crate::store::{ConnectionState, GameStore, GameView, StatePort};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Room code must be exactly {expected} digits")]
    InvalidRoomCode { expected: usize },

    #[error("Could not connect to the room. Please try again.")]
    ConnectionFailed,

    #[error("Connection timed out. Please try again.")]
    TimedOut,

    #[error("Connection closed before the room was joined")]
    Closed,

    #[error("There is no previous room to retry")]
    NothingToRetry,

    #[error("The room is no longer active")]
    Inactive,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Bet(#[from] BetError),
}

/// What the user asked for last, kept for [`SessionCoordinator::retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Create,
    Join(String),
}

enum Command {
    PlaceBet {
        amount: u32,
        prediction: Prediction,
        reply: oneshot::Sender<Result<(), BetError>>,
    },
    PlacePreset {
        size: BetSize,
        prediction: Prediction,
        reply: oneshot::Sender<Result<(), BetError>>,
    },
    Leave,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct SessionCoordinator<C: Connector> {
    connector: C,
    config: Arc<GameConfig>,
    clock: SharedClock,
    store: Arc<GameStore>,
    seed: Option<u64>,
    last_intent: Option<Intent>,
}

impl<C: Connector> SessionCoordinator<C> {
    pub fn new(connector: C, config: GameConfig, store: Arc<GameStore>) -> Self {
        Self {
            connector,
            config: Arc::new(config),
            clock: SystemClock::shared(),
            store,
            seed: None,
            last_intent: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Fix the host dice seed. Unseeded hosts draw one per room.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn store(&self) -> &Arc<GameStore> {
        &self.store
    }

    pub fn last_intent(&self) -> Option<&Intent> {
        self.last_intent.as_ref()
    }

    /// Create a room as host and return its handle. The code is
    /// available through [`RoomHandle::room_code`].
    pub async fn create_room(&mut self) -> Result<RoomHandle, SessionError> {
        self.last_intent = Some(Intent::Create);
        let code = self.config.generate_room_code(&mut rand::rng());
        tracing::info!(room_code = %code, "Creating room");
        self.open(code, Role::Host).await
    }

    pub async fn join_room(&mut self, code: &str) -> Result<RoomHandle, SessionError> {
        let code = code.trim();
        if !self.config.is_valid_room_code(code) {
            return Err(SessionError::InvalidRoomCode {
                expected: self.config.room_code_length,
            });
        }
        self.last_intent = Some(Intent::Join(code.to_string()));
        tracing::info!(room_code = %code, "Joining room");
        self.open(code.to_string(), Role::Guest).await
    }

    /// Re-run the last create or join. The only reconnection path.
    pub async fn retry(&mut self) -> Result<RoomHandle, SessionError> {
        match self.last_intent.clone() {
            Some(Intent::Create) => self.create_room().await,
            Some(Intent::Join(code)) => self.join_room(&code).await,
            None => Err(SessionError::NothingToRetry),
        }
    }

    async fn open(&self, code: String, role: Role) -> Result<RoomHandle, SessionError> {
        let player_id = format!("player_{}", Uuid::new_v4().simple());
        let topic = format!("room:{code}");

        self.store.reset();
        self.store.set_connection(ConnectionState::Connecting, None);

        let (channel, events, backlog) = match self.subscribe(&topic, &player_id, role).await {
            Ok(subscribed) => subscribed,
            Err(err) => {
                tracing::error!(
                    room_code = %code,
                    role = %role,
                    error = %err,
                    "Failed to join room"
                );
                self.store
                    .set_connection(ConnectionState::Error, Some(err.to_string()));
                return Err(err);
            }
        };

        self.store.set_session(&code, role, &player_id);
        self.store.set_connection(ConnectionState::Connected, None);
        tracing::info!(
            room_code = %code,
            role = %role,
            player_id = %player_id,
            "Room joined"
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let port: Arc<dyn StatePort> = self.store.clone();
        let session = Session {
            room_code: code.clone(),
            local_id: player_id.clone(),
            opponent_id: None,
            channel,
            store: port.clone(),
        };
        let tick = self.config.tick_interval();
        let task = match role {
            Role::Host => {
                let seed = self.seed.unwrap_or_else(rand::random);
                let machine = RoundMachine::host(
                    player_id.clone(),
                    self.config.clone(),
                    self.clock.clone(),
                    port,
                    seed,
                );
                tokio::spawn(drive(session, machine, events, command_rx, backlog, tick))
            }
            Role::Guest => {
                let machine = RoundMachine::guest(
                    player_id.clone(),
                    self.config.clone(),
                    self.clock.clone(),
                    port,
                );
                tokio::spawn(drive(session, machine, events, command_rx, backlog, tick))
            }
        };

        Ok(RoomHandle {
            room_code: code,
            role,
            player_id,
            commands,
            task: Some(task),
            store: self.store.clone(),
        })
    }

    /// Connect and wait for `Subscribed`, then track our presence.
    ///
    /// Events that arrive before the status are handed back for replay.
    async fn subscribe(
        &self,
        topic: &str,
        player_id: &str,
        role: Role,
    ) -> Result<(C::Channel, EventReceiver, Vec<ChannelEvent>), SessionError> {
        let (channel, mut events) = self.connector.connect(topic, player_id).await?;

        let mut backlog = Vec::new();
        let waited = tokio::time::timeout(self.config.join_timeout(), async {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Status(status) => return Some(status),
                    other => backlog.push(other),
                }
            }
            None
        })
        .await;

        let status = waited.unwrap_or(Some(ChannelStatus::TimedOut));
        let failure = match status {
            Some(ChannelStatus::Subscribed) => None,
            Some(ChannelStatus::ChannelError) => Some(SessionError::ConnectionFailed),
            Some(ChannelStatus::TimedOut) => Some(SessionError::TimedOut),
            Some(ChannelStatus::Closed) | None => Some(SessionError::Closed),
        };
        if let Some(err) = failure {
            channel.close();
            return Err(err);
        }

        let presence = PresencePayload::new(player_id.to_string(), role);
        if let Err(err) = serde_json::to_value(&presence)
            .map_err(ChannelError::from)
            .and_then(|payload| channel.track(payload))
        {
            channel.close();
            return Err(err.into());
        }
        Ok((channel, events, backlog))
    }
}

// ============================================================================
// Room handle
// ============================================================================

/// Live room. Dropping it leaves the room.
pub struct RoomHandle {
    room_code: String,
    role: Role,
    player_id: PlayerId,
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
    store: Arc<GameStore>,
}

impl RoomHandle {
    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn store(&self) -> &Arc<GameStore> {
        &self.store
    }

    pub fn view(&self) -> GameView {
        self.store.snapshot()
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn place_bet(&self, amount: u32, prediction: Prediction) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PlaceBet {
            amount,
            prediction,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Inactive)??;
        Ok(())
    }

    pub async fn place_preset(
        &self,
        size: BetSize,
        prediction: Prediction,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PlacePreset {
            size,
            prediction,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Inactive)??;
        Ok(())
    }

    /// Cancel timers, unsubscribe and clear the store. Safe to call twice.
    pub async fn leave(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.commands.send(Command::Leave);
        if let Err(err) = task.await {
            tracing::warn!(
                room_code = %self.room_code,
                error = %err,
                "Session task ended abnormally"
            );
        }
        self.store.reset();
        tracing::info!(room_code = %self.room_code, "Left room");
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Inactive)
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Command::Leave);
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

enum Flow {
    Continue(Vec<Effect>),
    Stop,
}

/// Per-room state owned by the driver task.
struct Session<Ch> {
    room_code: String,
    local_id: PlayerId,
    opponent_id: Option<PlayerId>,
    channel: Ch,
    store: Arc<dyn StatePort>,
}

impl<Ch: PeerChannel> Session<Ch> {
    fn on_event<M: RoundEvents>(&mut self, event: ChannelEvent, machine: &mut M) -> Flow {
        match event {
            ChannelEvent::Status(ChannelStatus::Subscribed) => Flow::Continue(Vec::new()),
            ChannelEvent::Status(status) => {
                tracing::error!(room_code = %self.room_code, ?status, "[session] channel failed");
                self.store.set_connection(
                    ConnectionState::Error,
                    Some("Connection to the room was lost. Retry or leave.".to_string()),
                );
                Flow::Stop
            }
            ChannelEvent::PresenceSync(entries) => {
                Flow::Continue(self.on_presence_sync(entries, machine))
            }
            ChannelEvent::PresenceLeave(keys) => {
                let opponent_left = self
                    .opponent_id
                    .as_ref()
                    .is_some_and(|opponent| keys.contains(opponent));
                if !opponent_left {
                    return Flow::Continue(Vec::new());
                }
                tracing::info!(
                    room_code = %self.room_code,
                    opponent = ?self.opponent_id,
                    "[session] opponent left"
                );
                Flow::Continue(machine.on_opponent_left())
            }
            ChannelEvent::Message(value) => match RoomMessage::from_value(value) {
                Ok(message) => Flow::Continue(machine.handle_message(message)),
                Err(ProtoError::UnknownType(kind)) => {
                    tracing::debug!(%kind, "[session] unknown message type ignored");
                    Flow::Continue(Vec::new())
                }
                Err(err) => {
                    tracing::warn!(error = %err, "[session] malformed message ignored");
                    Flow::Continue(Vec::new())
                }
            },
        }
    }

    fn on_presence_sync<M: RoundEvents>(
        &mut self,
        entries: Vec<PresenceEntry>,
        machine: &mut M,
    ) -> Vec<Effect> {
        let mut peers = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<PresencePayload>(entry.payload) {
                Ok(payload) => peers.push((entry.key, payload)),
                Err(err) => {
                    tracing::warn!(
                        key = %entry.key,
                        error = %err,
                        "[session] malformed presence ignored"
                    );
                }
            }
        }

        let distinct = peers
            .iter()
            .map(|(key, _)| key.as_str())
            .chain(std::iter::once(self.local_id.as_str()))
            .collect::<BTreeSet<_>>()
            .len();
        if distinct > 2 {
            tracing::warn!(
                room_code = %self.room_code,
                peers = distinct,
                "[session] room has more than two peers, ignoring"
            );
            return Vec::new();
        }

        let mut effects = Vec::new();
        for (key, payload) in peers.iter().filter(|(key, _)| *key != self.local_id) {
            if self.opponent_id.is_none() {
                self.opponent_id = Some(key.clone());
                self.store.set_opponent(Some(key.clone()));
                effects.extend(machine.on_opponent_joined(key.clone()));
            }
            if self.opponent_id.as_deref() == Some(key.as_str()) {
                effects.extend(machine.on_presence(payload));
            }
        }
        effects
    }

    fn transport_lost(&self) -> Flow {
        tracing::error!(room_code = %self.room_code, "[session] event stream ended");
        self.store.set_connection(
            ConnectionState::Error,
            Some("Connection to the room was lost. Retry or leave.".to_string()),
        );
        Flow::Stop
    }

    fn execute(&self, effects: Vec<Effect>, deferreds: &mut JoinSet<Deferred>) {
        for effect in effects {
            match effect {
                Effect::Broadcast(message) => {
                    let kind = message.kind();
                    let sent = message.to_value().map_err(|err| err.to_string()).and_then(
                        |payload| self.channel.broadcast(payload).map_err(|err| err.to_string()),
                    );
                    match sent {
                        Ok(()) => tracing::trace!(kind, "[session] broadcast"),
                        Err(error) => tracing::warn!(kind, %error, "[session] broadcast failed"),
                    }
                }
                Effect::TrackPresence(presence) => {
                    let tracked = serde_json::to_value(&presence)
                        .map_err(ChannelError::from)
                        .and_then(|payload| self.channel.track(payload));
                    if let Err(error) = tracked {
                        tracing::warn!(%error, "[session] presence update failed");
                    }
                }
                Effect::Schedule { deferred, after } => {
                    deferreds.spawn(async move {
                        tokio::time::sleep(after).await;
                        deferred
                    });
                }
                Effect::CancelDeferred => deferreds.abort_all(),
            }
        }
    }
}

fn respond(
    result: Result<Vec<Effect>, BetError>,
    reply: oneshot::Sender<Result<(), BetError>>,
) -> Vec<Effect> {
    match result {
        Ok(effects) => {
            let _ = reply.send(Ok(()));
            effects
        }
        Err(err) => {
            let _ = reply.send(Err(err));
            Vec::new()
        }
    }
}

async fn drive<M: RoundEvents, Ch: PeerChannel>(
    mut session: Session<Ch>,
    mut machine: M,
    mut events: EventReceiver,
    mut commands: mpsc::UnboundedReceiver<Command>,
    backlog: Vec<ChannelEvent>,
    tick_every: Duration,
) {
    let mut deferreds: JoinSet<Deferred> = JoinSet::new();
    let mut tick = tokio::time::interval(tick_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        room_code = %session.room_code,
        role = %machine.role(),
        "[session] driver started"
    );

    let mut stopped = false;
    for event in backlog {
        match session.on_event(event, &mut machine) {
            Flow::Continue(effects) => session.execute(effects, &mut deferreds),
            Flow::Stop => {
                stopped = true;
                break;
            }
        }
    }

    while !stopped {
        let flow = tokio::select! {
            event = events.recv() => match event {
                Some(event) => session.on_event(event, &mut machine),
                None => session.transport_lost(),
            },
            command = commands.recv() => match command {
                Some(Command::PlaceBet { amount, prediction, reply }) => {
                    Flow::Continue(respond(machine.place_bet(amount, prediction), reply))
                }
                Some(Command::PlacePreset { size, prediction, reply }) => {
                    Flow::Continue(respond(machine.place_preset(size, prediction), reply))
                }
                Some(Command::Leave) | None => Flow::Stop,
            },
            _ = tick.tick() => Flow::Continue(machine.on_tick()),
            Some(joined) = deferreds.join_next(), if !deferreds.is_empty() => match joined {
                Ok(deferred) => Flow::Continue(machine.on_deferred(deferred)),
                Err(_) => Flow::Continue(Vec::new()),
            },
        };
        match flow {
            Flow::Continue(effects) => session.execute(effects, &mut deferreds),
            Flow::Stop => stopped = true,
        }
    }

    deferreds.abort_all();
    session.channel.close();
    tracing::info!(room_code = %session.room_code, phase = ?machine.phase(), "[session] closed");
}
