//! WebSocket pub/sub surface.
//!
//! Each socket is one registry connection. Clients send
//! `{"cmd": "subscribe", "channels": ["tokens"]}`,
//! `{"cmd": "unsubscribe", "channels": [..]}` or
//! `{"cmd": "emit", "channel": "..", "payload": {..}}` and receive
//! `{"type": "message", ...}` frames for every channel message plus an
//! `ack` or `error` frame per command.

use axiom_signal::{Axiom, ChannelMessage, ConnectionId, Subscriber};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe {
        channels: Vec<String>,
    },
    Unsubscribe {
        channels: Vec<String>,
    },
    Emit {
        channel: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Welcome {
        connection: &'a ConnectionId,
    },
    Message {
        #[serde(flatten)]
        message: &'a ChannelMessage,
    },
    Ack {
        cmd: &'static str,
        channels: Vec<String>,
    },
    Error {
        message: String,
    },
}

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.axiom, state.shutdown))
}

async fn handle_socket(socket: WebSocket, axiom: Axiom, shutdown: CancellationToken) {
    let id = ConnectionId::new(Uuid::new_v4().to_string());
    let mut subscriber = match axiom.register_connection(id.clone()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(%id, "could not register connection: {e}");
            return;
        }
    };
    tracing::debug!(%id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();
    if send_frame(&mut sender, &ServerFrame::Welcome { connection: &id })
        .await
        .is_ok()
    {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscriber.recv() => match message {
                    Some(message) => encode(&ServerFrame::Message { message: &message }),
                    None => break,
                },
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        encode(&handle_command(&axiom, &subscriber, text.as_str()))
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                },
            };
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    }

    if let Err(e) = axiom.unregister_connection(&id) {
        tracing::debug!(%id, "unregister after disconnect: {e}");
    }
    tracing::debug!(%id, "websocket closed");
}

fn handle_command(axiom: &Axiom, subscriber: &Subscriber, text: &str) -> ServerFrame<'static> {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            return ServerFrame::Error {
                message: format!("invalid command: {e}"),
            };
        }
    };
    let id = subscriber.id();
    let result = match command {
        ClientCommand::Subscribe { channels } => axiom
            .subscribe(id, channels)
            .map(|channels| ("subscribe", channels)),
        ClientCommand::Unsubscribe { channels } => axiom
            .unsubscribe(id, channels)
            .map(|channels| ("unsubscribe", channels)),
        ClientCommand::Emit { channel, payload } => {
            // Delivery runs detached; outcomes land in the registry stats.
            drop(axiom.broadcast_to_channel(&channel, payload));
            Ok(("emit", vec![channel]))
        }
    };
    match result {
        Ok((cmd, channels)) => ServerFrame::Ack { cmd, channels },
        Err(e) => ServerFrame::Error {
            message: e.to_string(),
        },
    }
}

fn encode(frame: &ServerFrame<'_>) -> String {
    serde_json::to_string(frame).unwrap_or_else(|e| {
        tracing::error!("frame serialization failed: {e}");
        r#"{"type":"error","message":"serialization failed"}"#.to_string()
    })
}

async fn send_frame<S>(sender: &mut S, frame: &ServerFrame<'_>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    sender.send(Message::Text(encode(frame).into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axiom_core::CoreConfig;
    use axiom_signal::SignalConfig;
    use std::time::Duration;

    fn axiom() -> Axiom {
        Axiom::new(CoreConfig::default(), SignalConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_command_acks_and_delivers() {
        let ax = axiom();
        let mut sub = ax.register_connection("ws-1").unwrap();
        let frame = handle_command(&ax, &sub, r#"{"cmd":"subscribe","channels":["notes"]}"#);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["channels"], serde_json::json!(["notes"]));

        let frame = handle_command(
            &ax,
            &sub,
            r#"{"cmd":"emit","channel":"notes","payload":{"text":"hi"}}"#,
        );
        assert_eq!(serde_json::to_value(&frame).unwrap()["cmd"], "emit");
        let message = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload["text"], "hi");

        let value = serde_json::to_value(ServerFrame::Message { message: &message }).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["channel"], "notes");
    }

    #[tokio::test]
    async fn test_bad_command_yields_error_frame() {
        let ax = axiom();
        let sub = ax.register_connection("ws-2").unwrap();
        let value = serde_json::to_value(handle_command(&ax, &sub, r#"{"cmd":"dance"}"#)).unwrap();
        assert_eq!(value["type"], "error");
    }
}
