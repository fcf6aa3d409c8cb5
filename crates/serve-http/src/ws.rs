//! The `/__cem-reload` WebSocket endpoint.
//!
//! Each connection registers a client with the hub and runs one writer
//! loop: queued events drain into the socket under the per-client write
//! timeout, heartbeat pings go out every [`PING_INTERVAL`], and a client
//! that stops answering for two intervals is closed. Queue policy itself
//! (bounds, drop-oldest, coalescing) lives in the hub.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serve_events::{CLIENT_WRITE_TIMEOUT, PING_INTERVAL};
use serve_reload::ReloadHub;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::server::RouterCtx;

pub async fn upgrade(ws: WebSocketUpgrade, State(ctx): State<Arc<RouterCtx>>) -> Response {
    let hub = ctx.hub.clone();
    ws.on_upgrade(move |socket| client_task(socket, hub))
}

async fn client_task(socket: WebSocket, hub: ReloadHub) {
    let client = hub.register();
    let id = client.id();
    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    // The first tick is immediate; skip it so the first ping waits a full
    // interval.
    ping.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            queued = client.next_event() => {
                let Some(queued) = queued else { break };
                let frame = Message::Text(queued.to_json().into());
                match tokio::time::timeout(CLIENT_WRITE_TIMEOUT, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        trace!(target: "reload.hub", client = id, ?err, "client_write_error");
                        break;
                    }
                    Err(_) => {
                        debug!(target: "reload.hub", client = id, "client_write_timeout");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > PING_INTERVAL * 2 {
                    debug!(target: "reload.hub", client = id, "client_pong_timeout");
                    break;
                }
                let ping_frame = Message::Ping(Bytes::new());
                if tokio::time::timeout(CLIENT_WRITE_TIMEOUT, sink.send(ping_frame))
                    .await
                    .map(|r| r.is_err())
                    .unwrap_or(true)
                {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        trace!(target: "reload.hub", client = id, ?err, "client_read_error");
                        break;
                    }
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    // Dropping the handle unregisters the client from the hub.
    drop(client);
}
