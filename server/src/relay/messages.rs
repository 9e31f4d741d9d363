use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ConnectionStrength, DeviceType, FileMeta};

/// Control frames received from clients. All frames are JSON text with a
/// `type` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Client supplies stronger identity after connect; a fresh user agent
    /// lets the server correct platform/browser, after which `welcome` is
    /// re-sent.
    #[serde(rename = "client_identify", rename_all = "camelCase")]
    ClientIdentify {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        previous_session_id: Option<String>,
        #[serde(default)]
        user_agent: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeviceInfo {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        custom_name: Option<String>,
        #[serde(default)]
        device_type: Option<DeviceType>,
        #[serde(default)]
        connection_strength: Option<ConnectionStrength>,
    },
    UpdateDeviceName {
        name: String,
    },
    CreateRoom {
        name: String,
    },
    /// Joining accepts either the server-minted id or the display name.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    LeaveRoom,
    #[serde(rename_all = "camelCase")]
    FileTransfer {
        #[serde(default)]
        transfer_id: Option<String>,
        target_device_id: String,
        files: Vec<FileMeta>,
    },
    #[serde(rename_all = "camelCase")]
    TransferAccepted {
        transfer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TransferRejected {
        transfer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        transfer_id: String,
        chunk_index: u32,
        total_chunks: u32,
        /// Base64 payload, possibly with a data-URL prefix the server strips.
        data: String,
        #[serde(default)]
        file_size: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete {
        transfer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FileProgress {
        transfer_id: String,
        progress: f64,
    },
    #[serde(rename_all = "camelCase")]
    RequestMissingChunks {
        transfer_id: String,
        missing_chunks: Vec<u32>,
        #[serde(default)]
        total_chunks: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    RequestFileDownload {
        transfer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TogglePinDevice {
        target_device_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FileCancel {
        transfer_id: String,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// One row of the room presence projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListEntry {
    pub id: String,
    pub name: String,
    pub original_name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub platform: String,
    pub browser: String,
    pub pinned: bool,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub connection_strength: ConnectionStrength,
    pub has_custom_name: bool,
}

/// Frames emitted by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Welcome {
        device_id: String,
        chunk_size: u64,
        max_file_size: u64,
        max_concurrent_transfers: u32,
    },
    #[serde(rename_all = "camelCase")]
    DeviceList {
        room_id: String,
        devices: Vec<DeviceListEntry>,
    },
    #[serde(rename_all = "camelCase")]
    DeviceJoined {
        room_id: String,
        device: DeviceListEntry,
        device_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    DeviceLeft {
        room_id: String,
        device_id: String,
        device_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    IncomingFile {
        transfer_id: String,
        from_device_id: String,
        from_name: String,
        files: Vec<FileMeta>,
        total_size: u64,
    },
    #[serde(rename_all = "camelCase")]
    TransferStarted {
        transfer_id: String,
        target_device_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UploadProgress {
        transfer_id: String,
        received_chunks: u32,
        total_chunks: u32,
        percent: u32,
    },
    #[serde(rename_all = "camelCase")]
    TransferComplete {
        transfer_id: String,
    },
    /// Receiver decision relayed to the sender.
    #[serde(rename_all = "camelCase")]
    TransferAccepted {
        transfer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TransferRejected {
        transfer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TransferProgress {
        transfer_id: String,
        progress: f64,
    },
    /// Prompt to a sender that the receiver is pulling a previously
    /// accepted offer.
    #[serde(rename_all = "camelCase")]
    SendFileData {
        transfer_id: String,
        target_device_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        transfer_id: String,
        chunk_index: u32,
        total_chunks: u32,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete {
        transfer_id: String,
        file_name: String,
        file_type: String,
        file_size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_data: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DownloadError {
        transfer_id: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    TransferError {
        #[serde(skip_serializing_if = "Option::is_none")]
        transfer_id: Option<String>,
        message: String,
    },
    RoomError {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        name: String,
        device_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomLeft {
        room_id: String,
    },
    #[serde(rename = "duplicate_connection", rename_all = "camelCase")]
    DuplicateConnection {
        keep_this_connection: bool,
    },
    #[serde(rename_all = "camelCase")]
    DeviceNameUpdated {
        device_id: String,
        name: String,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    /// Server-initiated liveness probe when a channel has been quiet.
    Ping {
        timestamp: i64,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frames_parse_wire_names() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"joinRoom","name":"Foo"}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::JoinRoom { name: Some(_), .. }));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"client_identify","sessionId":"s1","language":"en"}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::ClientIdentify { .. }));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"fileChunk","transferId":"t1","chunkIndex":0,"totalChunks":3,"data":"YWJj","fileSize":9}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::FileChunk { chunk_index, total_chunks, .. } => {
                assert_eq!(chunk_index, 0);
                assert_eq!(total_chunks, 3);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        let err = serde_json::from_str::<ClientFrame>(r#"{"type":"selfDestruct"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn outbound_frames_serialize_wire_names() {
        let json = serde_json::to_value(ServerFrame::DuplicateConnection {
            keep_this_connection: false,
        })
        .unwrap();
        assert_eq!(json["type"], "duplicate_connection");
        assert_eq!(json["keepThisConnection"], false);

        let json = serde_json::to_value(ServerFrame::RoomJoined {
            room_id: "r1".into(),
            name: "Foo".into(),
            device_count: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "roomJoined");
        assert_eq!(json["deviceCount"], 2);

        let json = serde_json::to_value(ServerFrame::Welcome {
            device_id: "device-a1b".into(),
            chunk_size: 20 * 1024 * 1024,
            max_file_size: 500 * 1024 * 1024,
            max_concurrent_transfers: 5,
        })
        .unwrap();
        assert_eq!(json["type"], "welcome");
        assert_eq!(json["deviceId"], "device-a1b");
    }

    #[test]
    fn file_complete_omits_absent_payload() {
        let json = serde_json::to_value(ServerFrame::FileComplete {
            transfer_id: "t1".into(),
            file_name: "x.txt".into(),
            file_type: "text/plain".into(),
            file_size: 9,
            file_data: None,
        })
        .unwrap();
        assert!(json.get("fileData").is_none());
    }
}
