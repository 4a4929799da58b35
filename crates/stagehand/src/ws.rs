//! WebSocket push channel: one connection per client at `/ws`.
//!
//! Outbound traffic is the event bus wrapped in `{type, payload, timestamp}`
//! envelopes. Inbound, clients may send `{"type":"ping"}` (answered with a
//! pong) and `{"type":"get_status"}` (answered with a session snapshot).
//! A client that falls behind the bounded event queue receives a
//! `subscriber_lagged` marker with the skipped count.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

use x32osc::Broadcast;

use crate::web::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_loop(socket, state))
}

async fn client_loop(socket: WebSocket, state: AppState) {
    info!("websocket client connected");
    let (mut sink, mut stream) = socket.split();
    let mut events = BroadcastStream::new(state.bus.subscribe());

    loop {
        tokio::select! {
            event = events.next() => {
                let text = match event {
                    Some(Ok(broadcast)) => broadcast_envelope(&broadcast),
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        debug!("websocket client lagged, skipped {} events", skipped);
                        envelope("subscriber_lagged", json!({ "skipped": skipped }))
                    }
                    None => break,
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(text.as_str(), &state).await {
                            if sink.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary / protocol ping-pong: ignore
                    Some(Err(e)) => {
                        debug!("websocket receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    info!("websocket client disconnected");
}

/// Split the tagged enum into envelope type + payload.
fn broadcast_envelope(broadcast: &Broadcast) -> String {
    let payload = match serde_json::to_value(broadcast) {
        Ok(Value::Object(mut fields)) => {
            fields.remove("type");
            Value::Object(fields)
        }
        Ok(other) => other,
        Err(_) => Value::Null,
    };
    envelope(broadcast.kind(), payload)
}

fn envelope(kind: &str, payload: Value) -> String {
    json!({
        "type": kind,
        "payload": payload,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}

async fn handle_client_message(text: &str, state: &AppState) -> Option<String> {
    let message: Value = serde_json::from_str(text).ok()?;
    match message.get("type").and_then(Value::as_str) {
        Some("ping") => Some(envelope("pong", Value::Null)),
        Some("get_status") => {
            let session = state.session.read().await.clone();
            let mode = if state.config.mock_mode { "mock" } else { "live" };
            let payload = json!({
                "state": session.connection_state().as_str(),
                "mode": mode,
                "identity": session.identity().await,
            });
            Some(envelope("status", payload))
        }
        other => {
            debug!("ignoring websocket message of type {:?}", other);
            None
        }
    }
}
