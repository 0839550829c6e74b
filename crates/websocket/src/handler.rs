use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;

use events::{EventBus, EventEnvelope};

use crate::messages::{ClientMessage, ServerMessage, SubscriptionFilter};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscription state of one connection, independent of the socket.
///
/// Nothing is relayed until the client subscribes; a subscribe without a
/// filter receives every event.
#[derive(Debug, Default)]
pub struct Relay {
    subscription: Option<SubscriptionFilter>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Applies a client request and returns the reply.
    pub fn handle(&mut self, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::Subscribe { filter } => {
                tracing::debug!(filter = ?filter, "WebSocket client subscribed");
                self.subscription = Some(filter.clone().unwrap_or_default());
                ServerMessage::Subscribed { filter }
            }
            ClientMessage::Unsubscribe => {
                self.subscription = None;
                ServerMessage::Unsubscribed
            }
            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    /// Parses and applies a text frame.
    pub fn handle_text(&mut self, text: &str) -> ServerMessage {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message),
            Err(e) => ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            },
        }
    }

    /// The message to forward for a bus envelope, if any.
    pub fn route(&self, envelope: EventEnvelope) -> Option<ServerMessage> {
        let filter = self.subscription.as_ref()?;
        filter
            .matches(&envelope)
            .then_some(ServerMessage::Event { envelope })
    }

    pub fn lagged(&self, missed: u64) -> Option<ServerMessage> {
        self.is_subscribed().then_some(ServerMessage::Lagged { missed })
    }
}

type Sender = SplitSink<WebSocket, Message>;

/// Serialize and send one message. False once the client is gone.
async fn send(sender: &mut Sender, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to encode websocket message: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// Relays bus events to an upgraded socket until either side goes away.
pub async fn serve_connection(socket: WebSocket, event_bus: EventBus) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = event_bus.subscribe();
    let mut relay = Relay::new();

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.reset();

    tracing::debug!("WebSocket connection opened");

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if !send(&mut sender, &ServerMessage::Pong).await {
                    break;
                }
            }

            event_result = event_rx.recv() => {
                let outgoing = match event_result {
                    Ok(envelope) => relay.route(envelope),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "WebSocket client lagged behind the event bus");
                        relay.lagged(missed)
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Some(message) = outgoing {
                    if !send(&mut sender, &message).await {
                        break;
                    }
                }
            }

            msg = tokio::time::timeout(CLIENT_TIMEOUT + HEARTBEAT_INTERVAL, receiver.next()) => {
                match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        let reply = relay.handle_text(&text);
                        if !send(&mut sender, &reply).await {
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Err(_) => {
                        tracing::debug!("WebSocket client idle, heartbeat continues");
                    }
                }
            }
        }
    }

    tracing::debug!("WebSocket connection closed");
}
