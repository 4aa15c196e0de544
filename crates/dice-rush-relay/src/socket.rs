//! One WebSocket connection bridged onto the [`RelayHub`].
//!
//! A connection holds at most one topic membership. Hub events for that
//! membership are forwarded as [`ServerFrame`]s through the connection's
//! outbound queue, which a writer task drains into the socket.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use dice_rush_core::{MemberId, RelayHub};
use dice_rush_proto::{ChannelStatus, ClientFrame, ServerFrame};

#[derive(Debug)]
struct Membership {
    topic: String,
    member: MemberId,
    forward: JoinHandle<()>,
}

#[derive(Debug)]
pub struct Connection {
    hub: RelayHub,
    out: mpsc::UnboundedSender<ServerFrame>,
    membership: Option<Membership>,
}

impl Connection {
    pub fn new(hub: RelayHub, out: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            hub,
            out,
            membership: None,
        }
    }

    pub fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => self.handle_frame(frame),
            Err(err) => {
                tracing::debug!(%err, "[socket] malformed frame");
                self.reply_error(format!("malformed frame: {err}"));
            }
        }
    }

    pub fn handle_frame(&mut self, frame: ClientFrame) {
        match frame {
            ClientFrame::Join { topic, key } => self.join(topic, &key),
            ClientFrame::Leave => self.leave(),
            ClientFrame::Track { payload } => {
                if let Some(m) = self.membership() {
                    self.hub.track(&m.topic, m.member, payload);
                }
            }
            ClientFrame::Untrack => {
                if let Some(m) = self.membership() {
                    self.hub.untrack(&m.topic, m.member);
                }
            }
            ClientFrame::Broadcast { payload } => {
                if let Some(m) = self.membership() {
                    self.hub.broadcast(&m.topic, m.member, &payload);
                }
            }
        }
    }

    pub fn is_joined(&self) -> bool {
        self.membership.is_some()
    }

    fn join(&mut self, topic: String, key: &str) {
        if let Some(current) = &self.membership {
            let message = format!("already joined {}", current.topic);
            self.reply_error(message);
            return;
        }
        if topic.trim().is_empty() || key.trim().is_empty() {
            let _ = self.out.send(ServerFrame::Status {
                status: ChannelStatus::ChannelError,
            });
            return;
        }

        let (member, mut events) = self.hub.join(&topic, key);
        let out = self.out.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if out.send(event.into()).is_err() {
                    break;
                }
            }
        });
        tracing::info!(topic = %topic, key, member, "Peer joined");
        self.membership = Some(Membership {
            topic,
            member,
            forward,
        });
    }

    fn leave(&mut self) {
        if let Some(m) = self.membership.take() {
            self.release(m);
            let _ = self.out.send(ServerFrame::Status {
                status: ChannelStatus::Closed,
            });
        }
    }

    fn release(&self, m: Membership) {
        m.forward.abort();
        self.hub.leave(&m.topic, m.member);
        tracing::info!(topic = %m.topic, member = m.member, "Peer left");
    }

    fn membership(&self) -> Option<&Membership> {
        if self.membership.is_none() {
            self.reply_error("join a topic first".to_string());
        }
        self.membership.as_ref()
    }

    fn reply_error(&self, message: String) {
        let _ = self.out.send(ServerFrame::Error { message });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(m) = self.membership.take() {
            self.release(m);
        }
    }
}

pub async fn handle_socket(socket: WebSocket, hub: RelayHub) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(%err, "[socket] failed to encode frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(hub, tx);
    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => connection.handle_text(text.as_str()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut send_task => break,
        }
    }

    tracing::debug!(joined = connection.is_joined(), "[socket] closed");
    drop(connection);
    send_task.abort();
}
