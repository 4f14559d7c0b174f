//! WebSocket push channel. Every connected client becomes a hub subscriber
//! and receives each payload as one JSON text message.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use log::{debug, warn};

use crate::delivery::{DeliveryError, Subscriber, spawn_delivery};
use crate::hub::{Hub, Payload};

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/ws", get(upgrade))
        .with_state(hub)
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| session(socket, hub))
}

struct PushClient {
    sink: SplitSink<WebSocket, Message>,
    alive: bool,
}

#[async_trait]
impl Subscriber for PushClient {
    fn label(&self) -> String {
        "websocket client".to_string()
    }

    async fn accept(&mut self, payload: &Payload) -> Result<(), DeliveryError> {
        let json = serde_json::to_string(payload)?;
        if let Err(err) = self.sink.send(Message::Text(json.into())).await {
            self.alive = false;
            return Err(err.into());
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

async fn session(socket: WebSocket, hub: Arc<Hub>) {
    let (sink, mut stream) = socket.split();
    let delivery = spawn_delivery(&hub, PushClient { sink, alive: true });
    debug!("Client {} connected", delivery.id);

    // Inbound messages are ignored; reading only detects the close.
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("Client {} read error: {err}", delivery.id);
                break;
            }
        }
    }

    hub.unsubscribe(delivery.id);
    if let Err(err) = delivery.handle.await {
        warn!("Push delivery task failed: {err}");
    }
    debug!("Client {} disconnected", delivery.id);
}
