//! WebSocket event stream at `/api/ws`
//!
//! Clients subscribe to topics (`*`, `stream.*`, `sensor.motion`, ...) and
//! receive matching `SystemEvent`s as JSON text frames.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client-to-server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { topics: Vec<String> },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },

    #[serde(rename = "ping")]
    Ping,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.events.subscribe();
    let mut shutdown_rx = state.shutdown_signal();

    // Nothing is sent until the client subscribes
    let mut subscribed_topics: Vec<String> = vec![];

    info!("WebSocket client connected");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, &mut subscribed_topics) {
                            warn!("Failed to handle client message: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if !should_send_event(&event, &subscribed_topics) {
                            continue;
                        }
                        if let Ok(json) = serde_json::to_string(&event) {
                            if sender.send(Message::Text(json)).await.is_err() {
                                warn!("Failed to send event to client, disconnecting");
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Event bus closed");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    debug!("WebSocket handler exiting");
}

fn handle_client_message(text: &str, topics: &mut Vec<String>) -> Result<(), serde_json::Error> {
    match serde_json::from_str(text)? {
        ClientMessage::Subscribe { topics: new_topics } => {
            info!("Client subscribed to topics: {:?}", new_topics);
            *topics = new_topics;
        }
        ClientMessage::Unsubscribe {
            topics: remove_topics,
        } => {
            topics.retain(|t| !remove_topics.contains(t));
            info!("Client unsubscribed from topics: {:?}", remove_topics);
        }
        ClientMessage::Ping => {
            debug!("Received ping from client");
        }
    }
    Ok(())
}

fn should_send_event(event: &SystemEvent, topics: &[String]) -> bool {
    topics.iter().any(|topic| event.matches_topic(topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_event() -> SystemEvent {
        SystemEvent::StreamStateChanged {
            camera_id: "cam1".to_string(),
            state: "active".to_string(),
            port: Some(41000),
        }
    }

    #[test]
    fn test_should_send_event() {
        let event = state_event();
        assert!(should_send_event(&event, &["*".to_string()]));
        assert!(should_send_event(&event, &["stream.*".to_string()]));
        assert!(!should_send_event(&event, &["sensor.*".to_string()]));
        assert!(!should_send_event(&event, &[]));
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let mut topics = vec![];
        handle_client_message(
            r#"{"type":"subscribe","payload":{"topics":["stream.*","sensor.motion"]}}"#,
            &mut topics,
        )
        .unwrap();
        assert_eq!(topics, vec!["stream.*", "sensor.motion"]);

        handle_client_message(
            r#"{"type":"unsubscribe","payload":{"topics":["stream.*"]}}"#,
            &mut topics,
        )
        .unwrap();
        assert_eq!(topics, vec!["sensor.motion"]);

        assert!(handle_client_message(r#"{"type":"ping"}"#, &mut topics).is_ok());
        assert!(handle_client_message("not json", &mut topics).is_err());
    }
}
