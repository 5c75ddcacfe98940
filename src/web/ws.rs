//! WebSocket push of the cluster overview.

use super::AppState;
use crate::scheduler::stopped;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{
        header::{HOST, ORIGIN},
        HeaderMap, StatusCode,
    },
    response::IntoResponse,
};
use std::time::Duration;

use super::handlers::ApiQuery;

pub const OVERVIEW_PUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const OVERVIEW_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn handle_overview_ws(
    State(state): State<AppState>,
    Query(query): Query<ApiQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !same_origin(&headers) {
        tracing::debug!("Overview: rejected cross-origin upgrade");
        return StatusCode::FORBIDDEN.into_response();
    }
    let limit = query.limit();
    ws.on_upgrade(move |socket| push_overview(socket, state, limit))
        .into_response()
}

/// Browsers always send `Origin`; its host must match the request `Host`.
/// Requests without one (non-browser clients) pass.
fn same_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let Some((_, rest)) = origin.split_once("://") else {
        return false;
    };
    let origin_host = rest.split('/').next().unwrap_or_default();

    headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|host| !host.is_empty() && host.eq_ignore_ascii_case(origin_host))
}

/// Send the overview now and then every [`OVERVIEW_PUSH_INTERVAL`].
///
/// Ends when the client goes away, a write misses its deadline, or the
/// server shuts down.
pub async fn push_overview(mut socket: WebSocket, state: AppState, limit: usize) {
    let mut shutdown = state.shutdown.clone();
    let mut ticker = tokio::time::interval(OVERVIEW_PUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::debug!("Overview stream opened (limit {})", limit);

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            },
            _ = ticker.tick() => {}
        }

        let payload = match serde_json::to_string(&state.overview(limit)) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Overview: failed to encode payload: {}", e);
                break;
            }
        };

        match tokio::time::timeout(OVERVIEW_WRITE_TIMEOUT, socket.send(Message::Text(payload.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("Overview: client write failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::debug!("Overview: client write timed out");
                break;
            }
        }
    }

    let _ = tokio::time::timeout(OVERVIEW_WRITE_TIMEOUT, socket.send(Message::Close(None))).await;
    tracing::debug!("Overview stream closed");
}
