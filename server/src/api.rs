use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{ConnectInfo, Multipart, Path, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::relay::{self, MAX_FILE_SIZE};
use crate::transfers::{MAX_MEMORY, WARNING_THRESHOLD};
use crate::AppState;

const MAX_FILES_PER_UPLOAD: usize = 50;
const BLOCKED_EXTENSIONS: [&str; 7] = [".exe", ".bat", ".cmd", ".sh", ".php", ".js", ".jar"];
const ALLOWED_MIME_PREFIXES: [&str; 11] = [
    "image/",
    "video/",
    "audio/",
    "text/",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
    "application/zip",
    "application/x-rar-compressed",
];

/// WebSocket entry point. Identity material comes from the handshake
/// headers; admission is refused outright under hard memory pressure.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !relay::admit(&state.hub).await {
        warn!("connection refused: memory cap reached");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "server overloaded" })),
        )
            .into_response();
    }

    let user_agent = header_string(&headers, header::USER_AGENT);
    let accept_language = header_string(&headers, header::ACCEPT_LANGUAGE);
    let client_addr = addr.ip().to_string();

    ws.on_upgrade(move |socket| {
        relay::handle_socket(socket, client_addr, user_agent, accept_language, state.hub)
    })
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Multipart scratch upload, the fallback path next to the chunked relay.
pub async fn api_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let upload_dir = PathBuf::from(&state.config.upload_dir);
    if let Err(e) = tokio::fs::create_dir_all(&upload_dir).await {
        warn!("upload dir unavailable: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": "storage unavailable" })),
        )
            .into_response();
    }

    let mut stored = Vec::new();
    let mut total_size: u64 = 0;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "success": false, "error": e.to_string() })),
                )
                    .into_response();
            }
        };

        if stored.len() >= MAX_FILES_PER_UPLOAD {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "success": false, "error": "too many files" })),
            )
                .into_response();
        }

        let original = field.file_name().unwrap_or("upload").to_string();
        let mime = field.content_type().unwrap_or_default().to_string();
        let name = sanitize_filename(&original);

        if let Err(reason) = validate_upload(&name, &mime) {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "success": false, "error": reason, "file": name })),
            )
                .into_response();
        }

        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "success": false, "error": e.to_string() })),
                )
                    .into_response();
            }
        };
        if bytes.len() as u64 > MAX_FILE_SIZE {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({ "success": false, "error": "file too large", "file": name })),
            )
                .into_response();
        }

        let stored_name = format!("{}-{}", Utc::now().timestamp_millis(), name);
        let path = upload_dir.join(&stored_name);
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            warn!(path = %path.display(), "upload write failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "error": "write failed" })),
            )
                .into_response();
        }

        total_size += bytes.len() as u64;
        info!(file = %stored_name, size = bytes.len(), "scratch upload stored");
        stored.push(serde_json::json!({
            "name": name,
            "size": bytes.len(),
            "type": mime,
            "path": stored_name,
            "url": format!("/api/download/{stored_name}"),
            "uploadedAt": Utc::now(),
        }));
    }

    Json(serde_json::json!({
        "success": true,
        "files": stored,
        "totalSize": total_size,
    }))
    .into_response()
}

/// Stream a scratch file back as an attachment.
pub async fn api_download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    let safe = sanitize_filename(&filename);
    let path = PathBuf::from(&state.config.upload_dir).join(&safe);

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "file not found" })),
            )
                .into_response();
        }
    };

    let attachment_name = display_name(&safe);
    let body = Body::from_stream(ReaderStream::new(file));
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{attachment_name}\""),
            ),
        ],
        body,
    )
        .into_response()
}

/// Counts and memory report.
pub async fn api_server_info(State(state): State<AppState>) -> impl IntoResponse {
    let hub = &state.hub;
    Json(serde_json::json!({
        "devices": hub.devices.count().await,
        "rooms": hub.rooms.count().await,
        "connections": hub.connection_count().await,
        "transfers": {
            "active": hub.transfers.active_count().await,
            "total": hub.transfers.count().await,
        },
        "memory": {
            "inFlight": hub.transfers.memory_in_flight().await,
            "max": MAX_MEMORY,
            "warning": WARNING_THRESHOLD,
        },
    }))
}

/// Room catalog projection.
pub async fn api_get_rooms(State(state): State<AppState>) -> impl IntoResponse {
    let rooms: Vec<serde_json::Value> = state
        .hub
        .rooms
        .snapshot()
        .await
        .into_iter()
        .map(|room| {
            serde_json::json!({
                "id": room.id,
                "name": room.name,
                "created": room.created,
                "createdBy": room.created_by,
                "deviceCount": room.members.len(),
            })
        })
        .collect();
    Json(serde_json::json!({ "rooms": rooms }))
}

/// Force-release a transfer's buffers.
pub async fn api_release_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
) -> Response {
    if state.hub.transfers.force_release(&transfer_id).await {
        Json(serde_json::json!({ "status": "released", "transferId": transfer_id })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "transfer not found" })),
        )
            .into_response()
    }
}

/// Trivial capability pings kept for mobile Safari clients.
pub async fn api_ios_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "timestamp": Utc::now() }))
}

pub async fn api_safari_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "websocket": true }))
}

pub async fn api_ios_reconnect() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "action": "reconnect" }))
}

/// Collapse anything outside `[A-Za-z0-9._-]`.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches(['.', '_']).is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// The attachment name a download advertises: the stored name minus the
/// timestamp prefix.
fn display_name(stored: &str) -> String {
    match stored.split_once('-') {
        Some((prefix, rest)) if !rest.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) => {
            rest.to_string()
        }
        _ => stored.to_string(),
    }
}

fn validate_upload(name: &str, mime: &str) -> Result<(), String> {
    let lower = name.to_lowercase();
    if BLOCKED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return Err("file type not allowed".to_string());
    }
    if !ALLOWED_MIME_PREFIXES.iter().any(|p| mime.starts_with(p)) {
        return Err("content type not allowed".to_string());
    }
    Ok(())
}
