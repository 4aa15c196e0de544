//! [`Connector`] for the relay's WebSocket endpoint.

use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use dice_rush_core::{ChannelError, ChannelEvent, Connector, EventReceiver, PeerChannel};
use dice_rush_proto::{ChannelStatus, ClientFrame, ServerFrame};

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Outbound half of a relay socket. Frames are queued to a writer task.
#[derive(Debug)]
pub struct WsChannel {
    frames: mpsc::UnboundedSender<ClientFrame>,
    closed: AtomicBool,
}

impl WsChannel {
    fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.frames.send(frame).map_err(|_| ChannelError::Closed)
    }
}

impl PeerChannel for WsChannel {
    fn broadcast(&self, payload: Value) -> Result<(), ChannelError> {
        self.send(ClientFrame::Broadcast { payload })
    }

    fn track(&self, payload: Value) -> Result<(), ChannelError> {
        self.send(ClientFrame::Track { payload })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.frames.send(ClientFrame::Leave);
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl Connector for WsConnector {
    type Channel = WsChannel;

    async fn connect(
        &self,
        topic: &str,
        key: &str,
    ) -> Result<(WsChannel, EventReceiver), ChannelError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        tracing::debug!(url = %self.url, topic, "[ws] connected");

        let (mut write, mut read) = stream.split();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let leaving = frame == ClientFrame::Leave;
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(%err, "[ws] failed to encode frame");
                        continue;
                    }
                };
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if leaving {
                    let _ = write.close().await;
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = decode_frame(&text)
                            && event_tx.send(event).is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = event_tx.send(ChannelEvent::Status(ChannelStatus::Closed));
        });

        frame_tx
            .send(ClientFrame::Join {
                topic: topic.to_string(),
                key: key.to_string(),
            })
            .map_err(|_| ChannelError::Closed)?;

        let channel = WsChannel {
            frames: frame_tx,
            closed: AtomicBool::new(false),
        };
        Ok((channel, event_rx))
    }
}

/// Relay text frame to channel event. Error frames and garbage are logged
/// and dropped.
fn decode_frame(text: &str) -> Option<ChannelEvent> {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Error { message }) => {
            tracing::warn!(%message, "[ws] relay error");
            None
        }
        Ok(frame) => ChannelEvent::from_frame(frame),
        Err(err) => {
            tracing::warn!(%err, "[ws] unreadable frame");
            None
        }
    }
}
