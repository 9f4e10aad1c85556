use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::select;
use tokio::sync::mpsc;

use bproxy_core::state::AppState;
use bproxy_relay::RelayChannel;

/// Listener for the in-page relay. The page script connects here; everything
/// else goes through the channel.
pub fn relay_router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(relay_ws))
        .route("/ws", get(relay_ws))
        .with_state(app)
}

async fn relay_ws(
    ws: WebSocketUpgrade,
    State(app): State<Arc<AppState>>,
) -> impl IntoResponse {
    let channel = Arc::clone(&app.channel);
    ws.on_upgrade(move |socket| handle_relay_socket(socket, channel))
}

async fn handle_relay_socket(socket: WebSocket, channel: Arc<RelayChannel>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let connection_id = channel.register(outbound_tx);
    let (mut sink, mut stream) = socket.split();

    loop {
        select! {
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else { break };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => channel.handle_text(&text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::debug!(%error, "relay socket read error");
                        break;
                    }
                }
            }
        }
    }

    channel.unregister(connection_id);
}
