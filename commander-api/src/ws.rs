//! WebSocket State Stream
//!
//! `GET /ws` upgrades to a stream of [`StreamFrame`]s from the
//! [`Broadcaster`].
//!
//! ## Protocol
//!
//! 1. Server sends the full snapshot frames
//! 2. Server streams diff frames as they are emitted
//! 3. Client may send `{"type":"resync"}` for a fresh snapshot, or
//!    `{"type":"ping"}` for a `{"type":"pong"}`
//! 4. A client that falls behind the channel buffer gets
//!    `{"type":"lagged"}` and is disconnected; it reconnects for a snapshot

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::events::{ClientMessage, ServerNotice, StreamFrame};
use crate::telemetry::metrics::metrics;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<Broadcaster>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

type Sink = SplitSink<WebSocket, Message>;

/// Runs for the lifetime of one connection.
async fn handle_socket(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let (mut sender, mut receiver) = socket.split();

    let mut rx = match send_snapshot(&mut sender, &broadcaster).await {
        Some(rx) => rx,
        None => return,
    };
    if let Some(m) = metrics() {
        m.subscriber_connected();
    }
    info!(subscribers = broadcaster.subscriber_count(), "Stream subscriber connected");

    let (control_tx, mut control_rx) = mpsc::channel::<ClientMessage>(8);
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(control) => {
                        if control_tx.send(control).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "Ignoring unrecognized client message"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if let Err(e) = send_json(&mut sender, frame.as_ref()).await {
                            debug!(error = %e, "Failed to send frame, closing connection");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Stream subscriber lagged, disconnecting");
                        broadcaster.record_dropped();
                        let _ = send_json(&mut sender, &ServerNotice::Lagged { skipped }).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Broadcast channel closed");
                        break;
                    }
                }
            }

            Some(control) = control_rx.recv() => {
                match control {
                    ClientMessage::Resync => {
                        match send_snapshot(&mut sender, &broadcaster).await {
                            Some(fresh) => rx = fresh,
                            None => break,
                        }
                    }
                    ClientMessage::Ping => {
                        if send_json(&mut sender, &ServerNotice::Pong).await.is_err() {
                            break;
                        }
                    }
                }
            }

            _ = &mut recv_task => {
                debug!("Client disconnected");
                break;
            }
        }
    }

    recv_task.abort();
    let _ = sender.send(Message::Close(None)).await;
    if let Some(m) = metrics() {
        m.subscriber_disconnected();
    }
    info!("Stream subscriber disconnected");
}

/// Subscribe and send the snapshot frames. `None` ends the connection.
async fn send_snapshot(
    sender: &mut Sink,
    broadcaster: &Broadcaster,
) -> Option<broadcast::Receiver<Arc<StreamFrame>>> {
    let subscription = match broadcaster.subscribe().await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to build stream snapshot");
            let notice = ServerNotice::Error {
                message: e.to_string(),
            };
            let _ = send_json(sender, &notice).await;
            return None;
        }
    };
    for frame in &subscription.snapshot {
        if let Err(e) = send_json(sender, frame).await {
            debug!(error = %e, "Failed to send snapshot");
            return None;
        }
    }
    Some(subscription.receiver)
}

async fn send_json<T: Serialize>(sender: &mut Sink, value: &T) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).map_err(|e| {
        error!(error = %e, "Failed to serialize frame");
        axum::Error::new(e)
    })?;
    sender.send(Message::Text(json)).await
}
