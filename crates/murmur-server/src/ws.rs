//! WebSocket transport for the realtime gateway.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{FutureExt, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use murmur_shared::protocol::{ClientEvent, ServerEvent};
use murmur_shared::types::UserId;

use crate::api::AppState;
use crate::auth::bearer_token;
use crate::error::ServerError;
use crate::realtime::{ConnectionContext, Realtime};

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// Upgrade handler: `GET /ws?token=...` (or `Authorization: Bearer`).
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let credential = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));

    let verified: Option<UserId> = match credential {
        Some(token) => match state.identity.verify(token) {
            Ok(identity) => {
                if let Err(e) = state.chats.register_identity(&identity).await {
                    warn!(user = %identity.user_id, error = %e, "Failed to refresh profile");
                }
                Some(identity.user_id)
            }
            Err(e) => return e.into_response(),
        },
        None if state.config.ws_auth_required => {
            return ServerError::Unauthenticated("missing token".into()).into_response();
        }
        None => None,
    };

    let realtime = state.realtime.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, realtime, verified))
        .into_response()
}

async fn handle_socket(socket: WebSocket, realtime: Realtime, verified: Option<UserId>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (conn_id, mut rx) = realtime.gateway().connect().await;
    let mut ctx = ConnectionContext::new(conn_id, verified);

    info!(conn = %conn_id, user = ?ctx.verified, "WebSocket connected");

    // Outbound: drain the connection queue into the socket, with keepalive pings.
    let forward_task = tokio::spawn(async move {
        let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
        ping_ticker.tick().await;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(event = event.name(), error = %e, "Failed to encode event");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping_ticker.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Inbound: one event at a time, in arrival order.
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&realtime, &mut ctx, &text).await,
            Ok(Message::Binary(_)) => {
                debug!(conn = %conn_id, "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!(conn = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    realtime.disconnect(&ctx).await;
    forward_task.abort();
    info!(conn = %conn_id, "WebSocket disconnected");
}

/// Parse and dispatch one frame. Failures are reported to this connection
/// only; a panicking handler is contained here.
async fn handle_text(realtime: &Realtime, ctx: &mut ConnectionContext, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(conn = %ctx.id, error = %e, "Unparseable frame");
            reject(realtime, ctx, &ServerError::BadRequest(format!("unrecognized event: {e}"))).await;
            return;
        }
    };
    let name = event.name();

    let outcome = AssertUnwindSafe(realtime.dispatch(ctx, event))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(conn = %ctx.id, event = name, error = %e, "Event rejected");
            reject(realtime, ctx, &e).await;
        }
        Err(_) => {
            error!(conn = %ctx.id, event = name, "Event handler panicked");
            reject(realtime, ctx, &ServerError::Internal("handler panicked".into())).await;
        }
    }
}

async fn reject(realtime: &Realtime, ctx: &ConnectionContext, e: &ServerError) {
    realtime
        .gateway()
        .send_to(ctx.id, ServerEvent::error(e.kind(), e.public_message()))
        .await;
}
