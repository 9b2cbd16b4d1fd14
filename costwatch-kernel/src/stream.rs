//! WebSocket `/api/v1/stream` : un client du hub par connexion.
//!
//! Une seule tâche par connexion surveille l'annulation, la file sortante
//! du client et les trames entrantes (`{"action":"subscribe","topics":[...]}`).

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use costwatch_sdk::event::TOPIC_SYSTEM;
use costwatch_sdk::Event;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http::AppState;
use crate::hub::EventHub;

#[derive(Debug, Deserialize)]
struct ControlMessage {
    action: String,
    #[serde(default)]
    topics: Vec<String>,
}

/// Topics demandés par une trame entrante ; tout le reste est ignoré
pub fn parse_subscribe(text: &str) -> Option<Vec<String>> {
    let msg: ControlMessage = serde_json::from_str(text).ok()?;
    (msg.action == "subscribe").then_some(msg.topics)
}

/// Trames WebSocket d'une connexion ; `WebSocket` en production
#[async_trait]
pub trait FrameSocket: Send {
    async fn send_frame(&mut self, msg: Message) -> Result<(), axum::Error>;
    async fn recv_frame(&mut self) -> Option<Result<Message, axum::Error>>;
}

#[async_trait]
impl FrameSocket for WebSocket {
    async fn send_frame(&mut self, msg: Message) -> Result<(), axum::Error> {
        self.send(msg).await
    }

    async fn recv_frame(&mut self) -> Option<Result<Message, axum::Error>> {
        self.recv().await
    }
}

pub async fn stream_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    let hub = app.hub.clone();
    let shutdown = app.shutdown.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, hub, shutdown))
}

enum Step {
    Cancelled,
    Outbound(Option<Arc<str>>),
    Inbound(Option<Result<Message, axum::Error>>),
}

fn welcome_message(client_id: &str) -> Option<String> {
    let payload = serde_json::json!({ "clientId": client_id });
    let welcome = Event::new("connected", TOPIC_SYSTEM, "kernel", &payload);
    match welcome.and_then(|evt| serde_json::to_string(&evt)) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "[stream] welcome serialization failed");
            None
        }
    }
}

async fn serve_socket<S: FrameSocket>(
    mut socket: S,
    hub: Arc<EventHub>,
    shutdown: CancellationToken,
) {
    let mut client = hub.register(&shutdown);
    let token = client.token().clone();

    if let Some(text) = welcome_message(&client.id().to_string()) {
        if socket.send_frame(Message::Text(text.into())).await.is_err() {
            hub.unregister(&client);
            return;
        }
    }

    loop {
        // la branche gagnante est traitée hors du select : socket et client restent libres
        let step = tokio::select! {
            _ = token.cancelled() => Step::Cancelled,
            outbound = client.recv() => Step::Outbound(outbound),
            inbound = socket.recv_frame() => Step::Inbound(inbound),
        };

        match step {
            Step::Cancelled => {
                let _ = socket.send_frame(Message::Close(None)).await;
                break;
            }
            Step::Outbound(None) => break,
            Step::Outbound(Some(msg)) => {
                if socket.send_frame(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            Step::Inbound(Some(Ok(Message::Text(text)))) => {
                if let Some(topics) = parse_subscribe(text.as_str()) {
                    client.subscribe(topics);
                }
            }
            Step::Inbound(Some(Ok(Message::Close(_)))) | Step::Inbound(None) => break,
            Step::Inbound(Some(Ok(_))) => {}
            Step::Inbound(Some(Err(e))) => {
                debug!(client = %client.id(), error = %e, "[stream] socket error");
                break;
            }
        }
    }

    hub.unregister(&client);
}
