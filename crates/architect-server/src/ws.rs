//! WebSocket feed of live builder and build changes.
//!
//! A new connection receives every change. Sending
//! `{"type":"subscribe","channel":"builders"}` narrows the feed to the
//! subscribed channels; unsubscribing from all of them widens it again.

use std::collections::HashSet;

use architect_core::ChangeEvent;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("WebSocket connection established");
    let mut changes = state.broker.subscribe();
    let (mut sink, mut stream) = socket.split();
    let mut channels = Channels::default();

    loop {
        let outgoing = tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<WsCommand>(&text) {
                    Ok(command) => channels.apply(command),
                    Err(e) => {
                        debug!(error = %e, "Ignoring malformed command");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket connection closed");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
            },
            change = changes.recv() => match change {
                Ok(change) if channels.wants(&change.topic) => WsMessage::Change(change),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket client fell behind");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let Ok(json) = serde_json::to_string(&outgoing) else {
            continue;
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

/// Channels a client narrowed its feed to; empty means everything.
#[derive(Debug, Default)]
struct Channels(HashSet<String>);

impl Channels {
    fn apply(&mut self, command: WsCommand) -> WsMessage {
        match command {
            WsCommand::Subscribe { channel } => {
                info!(channel = %channel, "Client subscribed");
                self.0.insert(channel.clone());
                WsMessage::Subscribed { channel }
            }
            WsCommand::Unsubscribe { channel } => {
                info!(channel = %channel, "Client unsubscribed");
                self.0.remove(&channel);
                WsMessage::Unsubscribed { channel }
            }
        }
    }

    fn wants(&self, topic: &str) -> bool {
        self.0.is_empty() || self.0.contains(topic)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage {
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Change(ChangeEvent),
}
