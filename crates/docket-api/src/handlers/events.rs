//! Realtime subscription endpoints.
//!
//! Both transports take the same scope query (`project_id`, `document_id`)
//! and deliver events in publication order. A subscriber that falls behind
//! receives a `resync` message and should re-read current state.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures::{SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use docket_core::defaults::{SSE_KEEPALIVE_SECS, WS_PING_INTERVAL_SECS};
use docket_core::logging::SUBSYSTEM_API;
use docket_pipeline::{ScopeFilter, Subscription, SubscriptionItem};

use crate::{ApiError, AppState, Caller};

/// Event name used to tell clients they missed events.
pub const RESYNC_EVENT: &str = "resync";

fn resync_payload(missed: u64) -> serde_json::Value {
    serde_json::json!({ "type": RESYNC_EVENT, "missed": missed })
}

fn sse_event(item: SubscriptionItem) -> Option<Event> {
    match item {
        SubscriptionItem::Event(envelope) => match serde_json::to_string(&envelope) {
            Ok(json) => Some(
                Event::default()
                    .event(envelope.event_type.as_str())
                    .id(envelope.sequence.to_string())
                    .data(json),
            ),
            Err(e) => {
                warn!(error = %e, "Failed to serialize event for SSE");
                None
            }
        },
        SubscriptionItem::Lagged { missed } => Some(
            Event::default()
                .event(RESYNC_EVENT)
                .data(resync_payload(missed).to_string()),
        ),
    }
}

/// SSE stream at `/api/v1/events`.
pub async fn sse_events(
    State(state): State<AppState>,
    caller: Caller,
    Query(filter): Query<ScopeFilter>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.pipeline.subscribe(caller.credential(), filter).await?;
    debug!(subsystem = SUBSYSTEM_API, ?filter, "SSE subscriber connected");

    let stream = subscription.filter_map(|item| async move { sse_event(item).map(Ok) });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
            .text("keepalive"),
    ))
}

/// WebSocket stream at `/api/v1/ws`. Events are sent as JSON text frames.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    caller: Caller,
    Query(filter): Query<ScopeFilter>,
) -> Result<Response, ApiError> {
    let subscription = state.pipeline.subscribe(caller.credential(), filter).await?;
    Ok(ws
        .on_upgrade(move |socket| handle_ws_connection(socket, subscription, state))
        .into_response())
}

fn ws_text(item: SubscriptionItem) -> Option<String> {
    let value = match item {
        SubscriptionItem::Event(envelope) => serde_json::to_string(&envelope),
        SubscriptionItem::Lagged { missed } => serde_json::to_string(&resync_payload(missed)),
    };
    match value {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "Failed to serialize event for WebSocket");
            None
        }
    }
}

async fn handle_ws_connection(socket: WebSocket, mut subscription: Subscription, state: AppState) {
    let count = state.ws_connections.fetch_add(1, Ordering::Relaxed) + 1;
    info!(subsystem = SUBSYSTEM_API, active = count, "WebSocket connection opened");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        loop {
            tokio::select! {
                item = subscription.next() => {
                    let Some(item) = item else { break };
                    if let Some(text) = ws_text(item) {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    let count = state.ws_connections.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(subsystem = SUBSYSTEM_API, active = count, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lagged_becomes_resync() {
        let text = ws_text(SubscriptionItem::Lagged { missed: 7 }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "resync");
        assert_eq!(value["missed"], 7);
        assert!(sse_event(SubscriptionItem::Lagged { missed: 7 }).is_some());
    }
}
