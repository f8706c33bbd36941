//! Per-connection WebSocket task.
//!
//! The socket is split into a writer that drains [`PeerCommand`]s (plus a
//! periodic ping) and a reader that turns incoming text into
//! [`SessionEvent::PeerFrame`]s. Whichever half stops first ends the
//! connection, and the session is told with [`SessionEvent::PeerClosed`].

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::{SinkExt, StreamExt};
use ook_core::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::peer::{PeerCommand, PeerHandle};
use crate::session::SessionEvent;

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Run one peer connection until either side hangs up.
pub async fn handle_socket(
    socket: WebSocket,
    sessions: mpsc::UnboundedSender<SessionEvent>,
    heartbeat: Duration,
) {
    let (peer, commands) = PeerHandle::channel();
    let peer_id = peer.id().clone();
    info!(peer_id = %peer_id, "websocket peer connected");

    if sessions.send(SessionEvent::PeerConnected(peer)).is_err() {
        warn!(peer_id = %peer_id, "session controller gone, dropping connection");
        return;
    }

    let (ws_tx, ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_tx, commands, heartbeat, peer_id.clone()));
    let mut reader = tokio::spawn(read_loop(ws_rx, sessions.clone(), peer_id.clone()));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    info!(peer_id = %peer_id, "websocket peer disconnected");
    let _ = sessions.send(SessionEvent::PeerClosed { peer: peer_id });
}

async fn write_loop(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    heartbeat: Duration,
    peer_id: PeerId,
) {
    let mut ping_interval = tokio::time::interval(heartbeat.max(MIN_HEARTBEAT));
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Send(text)) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(PeerCommand::Close(reason)) => {
                    debug!(peer_id = %peer_id, code = reason.code(), "sending close frame");
                    let frame = CloseFrame {
                        code: reason.code(),
                        reason: Utf8Bytes::from_static(reason.reason()),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    let _ = ws_tx.close().await;
                    break;
                }
                None => break,
            },
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                trace!(peer_id = %peer_id, "sent ping");
            }
        }
    }
}

async fn read_loop(
    mut ws_rx: futures::stream::SplitStream<WebSocket>,
    sessions: mpsc::UnboundedSender<SessionEvent>,
    peer_id: PeerId,
) {
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "websocket read failed");
                break;
            }
        };
        let frame = match msg {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!(peer_id = %peer_id, len = data.len(), "dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!(peer_id = %peer_id, "peer sent close frame");
                break;
            }
            // axum answers pings itself
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        let event = SessionEvent::PeerFrame {
            peer: peer_id.clone(),
            frame,
        };
        if sessions.send(event).is_err() {
            break;
        }
    }
}
