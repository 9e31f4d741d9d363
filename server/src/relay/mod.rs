//! Droplink relay module.
//!
//! Owns the WebSocket lifecycle for each device: identity derivation,
//! duplicate-session resolution, welcome/heartbeat, inbound frame decode,
//! and teardown. Frame semantics live in [`router`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::hub::{ConnectionHandle, RelayHub};
use crate::identity::{self, DeviceProfile};
use crate::presence;
use crate::relay::messages::{ClientFrame, ServerFrame};
use crate::transfers::{MAX_CONCURRENT_TRANSFERS, MAX_MEMORY};

pub mod messages;
pub mod router;

pub const DEFAULT_CHUNK_SIZE: u64 = 20 * 1024 * 1024;
/// Mobile Safari sessions drop large frames; advertise a small chunk.
pub const MOBILE_CHUNK_SIZE: u64 = 1024 * 1024;
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

const WELCOME_DEBOUNCE_MS: u64 = 100;
const DUPLICATE_CLOSE_GRACE_MS: u64 = 1000;
const HEARTBEAT_SECS: u64 = 15;
const HEARTBEAT_SECS_MOBILE: u64 = 10;
/// Ping only when the channel has been quiet this long.
const QUIET_BEFORE_PING_SECS: i64 = 30;

/// The welcome frame carrying the assigned id and server limits.
pub fn welcome_frame(device_id: &str, mobile_safari: bool) -> ServerFrame {
    ServerFrame::Welcome {
        device_id: device_id.to_string(),
        chunk_size: if mobile_safari {
            MOBILE_CHUNK_SIZE
        } else {
            DEFAULT_CHUNK_SIZE
        },
        max_file_size: MAX_FILE_SIZE,
        max_concurrent_transfers: MAX_CONCURRENT_TRANSFERS as u32,
    }
}

/// Drive one accepted WebSocket until it closes.
pub async fn handle_socket(
    socket: WebSocket,
    addr: String,
    user_agent: String,
    accept_language: String,
    hub: Arc<RelayHub>,
) {
    let device_id = identity::derive_device_id(&user_agent, &addr, &accept_language);
    let profile = DeviceProfile::from_user_agent(&user_agent);
    info!(device_id = %device_id, addr = %addr, platform = %profile.platform, "channel connected");

    let device = hub
        .devices
        .upsert_on_connect(&device_id, &profile, &user_agent)
        .await;
    hub.persist_devices().await;

    let (mut socket_tx, mut socket_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let token = Uuid::new_v4();
    let closer = CancellationToken::new();

    let previous = hub
        .bind_connection(
            &device_id,
            ConnectionHandle {
                token,
                tx: tx.clone(),
                closer: closer.clone(),
                connected_at: Utc::now(),
                last_activity: Utc::now(),
                addr: addr.clone(),
                mobile_safari: profile.mobile_safari,
            },
        )
        .await;

    // Newer wins: tell the old channel it is being replaced, give it a
    // short grace to flush, then cancel its close signal so its writer
    // sends a normal closure and its socket genuinely ends.
    if let Some(old) = previous {
        debug!(device_id = %device_id, "duplicate connection, replacing previous channel");
        let _ = old.tx.send(ServerFrame::DuplicateConnection {
            keep_this_connection: false,
        });
        let _ = tx.send(ServerFrame::DuplicateConnection {
            keep_this_connection: true,
        });
        tokio::spawn(async move {
            sleep(Duration::from_millis(DUPLICATE_CLOSE_GRACE_MS)).await;
            old.closer.cancel();
        });
    }

    if profile.mobile_safari {
        // Fragile mobile sessions get the welcome before anything else.
        let _ = tx.send(welcome_frame(&device_id, true));
    } else {
        let welcome_tx = tx.clone();
        let welcome_id = device_id.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(WELCOME_DEBOUNCE_MS)).await;
            let _ = welcome_tx.send(welcome_frame(&welcome_id, false));
        });
    }

    // A rejoining member flips back online in its room's presence list.
    if let Some(room_id) = device.room_id {
        presence::broadcast_device_list(&hub, &room_id).await;
    }

    // Writer: the single place this socket is written, so outbound frames
    // stay ordered per channel. A cancelled close signal still drains the
    // queue (biased select) before the normal-closure frame goes out.
    let writer_closer = closer.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                maybe = rx.recv() => {
                    let Some(frame) = maybe else { break };
                    match serde_json::to_string(&frame) {
                        Ok(json) => {
                            if socket_tx.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("outbound frame serialization failed: {e}"),
                    }
                }
                _ = writer_closer.cancelled() => break,
            }
        }
        let _ = socket_tx.send(Message::Close(None)).await;
    });

    let heartbeat_hub = hub.clone();
    let heartbeat_tx = tx.clone();
    let heartbeat_id = device_id.clone();
    let heartbeat_period = if profile.mobile_safari {
        HEARTBEAT_SECS_MOBILE
    } else {
        HEARTBEAT_SECS
    };
    let heartbeat_closer = closer.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(heartbeat_period));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = heartbeat_closer.cancelled() => break,
            }
            let Some(last) = heartbeat_hub.last_activity(&heartbeat_id).await else {
                break;
            };
            if Utc::now() - last > chrono::Duration::seconds(QUIET_BEFORE_PING_SECS) {
                let ping = ServerFrame::Ping {
                    timestamp: Utc::now().timestamp_millis(),
                };
                if heartbeat_tx.send(ping).is_err() {
                    break;
                }
            }
        }
    });

    let recv_hub = hub.clone();
    let recv_id = device_id.clone();
    let recv_tx = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = socket_rx.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    recv_hub.touch(&recv_id).await;
                    handle_text(&recv_hub, &recv_id, &recv_tx, &text).await;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    recv_hub.touch(&recv_id).await;
                }
                Ok(Message::Binary(_)) => {
                    // The protocol is text-only; payloads ride base64.
                    let _ = recv_tx.send(ServerFrame::Error {
                        message: RelayError::MalformedFrame.to_string(),
                    });
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(device_id = %recv_id, "websocket error: {e}");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    heartbeat_task.abort();

    hub.handle_disconnect(&device_id, token).await;
    info!(device_id = %device_id, "channel closed");
}

/// Decode and dispatch one text frame. Malformed JSON and unknown types
/// are answered on the channel, which stays open.
async fn handle_text(
    hub: &Arc<RelayHub>,
    device_id: &str,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    text: &str,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            let _ = tx.send(ServerFrame::Error {
                message: RelayError::MalformedFrame.to_string(),
            });
            return;
        }
    };
    match serde_json::from_value::<ClientFrame>(value) {
        Ok(frame) => router::dispatch(hub, device_id, frame).await,
        Err(_) => {
            let _ = tx.send(ServerFrame::Error {
                message: RelayError::UnknownMessageType.to_string(),
            });
        }
    }
}

/// Handshake-layer admission: refuse new channels while the governor is
/// over its hard memory cap.
pub async fn admit(hub: &RelayHub) -> bool {
    hub.transfers.memory_in_flight().await <= MAX_MEMORY
}
