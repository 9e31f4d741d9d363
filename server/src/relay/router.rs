use std::sync::Arc;

use tracing::debug;

use crate::error::{ErrorSurface, RelayError};
use crate::hub::RelayHub;
use crate::identity::DeviceProfile;
use crate::presence;
use crate::relay::messages::{ClientFrame, ServerFrame};
use crate::relay::welcome_frame;

/// Dispatch one decoded inbound frame. Every arm catches its own failures
/// and answers with an error frame; nothing here tears the channel down.
pub async fn dispatch(hub: &Arc<RelayHub>, device_id: &str, frame: ClientFrame) {
    match frame {
        ClientFrame::ClientIdentify { user_agent, .. } => {
            client_identify(hub, device_id, user_agent).await;
        }
        ClientFrame::DeviceInfo {
            name,
            custom_name,
            device_type,
            connection_strength,
        } => {
            let updated = hub
                .devices
                .apply_info(device_id, name, custom_name, device_type, connection_strength)
                .await;
            if let Some(device) = updated {
                hub.persist_devices().await;
                if let Some(room_id) = device.room_id {
                    presence::broadcast_device_list(hub, &room_id).await;
                }
            }
        }
        ClientFrame::UpdateDeviceName { name } => {
            if let Some(device) = hub.devices.rename(device_id, &name).await {
                hub.send_to_device(
                    device_id,
                    ServerFrame::DeviceNameUpdated {
                        device_id: device_id.to_string(),
                        name,
                    },
                )
                .await;
                hub.persist_devices().await;
                if let Some(room_id) = device.room_id {
                    presence::broadcast_device_list(hub, &room_id).await;
                }
            }
        }
        ClientFrame::CreateRoom { name } => create_room(hub, device_id, &name).await,
        ClientFrame::JoinRoom { room_id, name } => {
            let key = room_id.or(name).unwrap_or_default();
            join_room(hub, device_id, &key).await;
        }
        ClientFrame::LeaveRoom => {
            if let Some(room_id) = leave_current_room(hub, device_id).await {
                hub.send_to_device(device_id, ServerFrame::RoomLeft { room_id }).await;
            }
        }
        ClientFrame::FileTransfer {
            transfer_id,
            target_device_id,
            files,
        } => {
            file_transfer(hub, device_id, transfer_id, &target_device_id, files).await;
        }
        ClientFrame::TransferAccepted { transfer_id } => {
            let frames = hub.transfers.accept(&transfer_id, device_id).await;
            hub.send_all(frames).await;
        }
        ClientFrame::TransferRejected { transfer_id } => {
            let frames = hub.transfers.reject(&transfer_id, device_id).await;
            hub.send_all(frames).await;
        }
        ClientFrame::FileChunk {
            transfer_id,
            chunk_index,
            total_chunks,
            data,
            file_size,
        } => {
            let outcome = hub
                .transfers
                .add_chunk(&transfer_id, device_id, chunk_index, total_chunks, &data, file_size)
                .await;
            hub.send_all(outcome.outbound).await;
            if outcome.close_idle {
                close_idle_channels(hub).await;
            }
        }
        ClientFrame::FileComplete { transfer_id } => {
            let frames = hub.transfers.complete_signal(&transfer_id, device_id).await;
            hub.send_all(frames).await;
        }
        ClientFrame::FileProgress { transfer_id, progress } => {
            let frames = hub.transfers.relay_progress(&transfer_id, device_id, progress).await;
            hub.send_all(frames).await;
        }
        ClientFrame::RequestMissingChunks {
            transfer_id,
            missing_chunks,
            ..
        } => {
            let frames = hub
                .transfers
                .resend_missing(&transfer_id, device_id, &missing_chunks)
                .await;
            hub.send_all(frames).await;
        }
        ClientFrame::RequestFileDownload { transfer_id } => {
            request_download(hub, device_id, &transfer_id).await;
        }
        ClientFrame::TogglePinDevice { target_device_id } => {
            if hub.devices.toggle_pin(&target_device_id, device_id).await.is_some() {
                hub.persist_devices().await;
                if let Some(room_id) =
                    hub.devices.get(device_id).await.and_then(|d| d.room_id)
                {
                    presence::broadcast_device_list(hub, &room_id).await;
                }
            }
        }
        ClientFrame::FileCancel { transfer_id } => {
            let frames = hub.transfers.cancel(&transfer_id, device_id).await;
            hub.send_all(frames).await;
        }
        ClientFrame::Ping { timestamp } => {
            hub.send_to_device(device_id, ServerFrame::Pong { timestamp }).await;
        }
    }
}

/// Route an error to the frame its surface calls for.
pub async fn send_error(
    hub: &RelayHub,
    device_id: &str,
    error: RelayError,
    transfer_id: Option<String>,
) {
    let frame = match error.surface() {
        ErrorSurface::Room => ServerFrame::RoomError {
            message: error.to_string(),
        },
        ErrorSurface::Transfer => ServerFrame::TransferError {
            transfer_id,
            message: error.to_string(),
        },
        ErrorSurface::Generic => ServerFrame::Error {
            message: error.to_string(),
        },
    };
    hub.send_to_device(device_id, frame).await;
}

/// Fresh identity material: correct platform/browser sniffing and resend
/// the welcome so the client sees its (possibly corrected) profile.
async fn client_identify(hub: &Arc<RelayHub>, device_id: &str, user_agent: Option<String>) {
    if let Some(ua) = user_agent.filter(|ua| !ua.is_empty()) {
        let profile = DeviceProfile::from_user_agent(&ua);
        hub.devices
            .apply_info(device_id, None, None, Some(profile.device_type), None)
            .await;
        hub.devices.upsert_on_connect(device_id, &profile, &ua).await;
        hub.persist_devices().await;
    }
    let mobile_safari = hub
        .connection(device_id)
        .await
        .map(|c| c.mobile_safari)
        .unwrap_or(false);
    hub.send_to_device(device_id, welcome_frame(device_id, mobile_safari)).await;
}

async fn create_room(hub: &Arc<RelayHub>, device_id: &str, name: &str) {
    match hub.rooms.create(name, device_id).await {
        Ok(room) => {
            leave_previous_room(hub, device_id, &room.id).await;
            hub.devices.set_room(device_id, Some(room.id.clone())).await;
            hub.persist_rooms().await;
            hub.persist_devices().await;
            hub.send_to_device(
                device_id,
                ServerFrame::RoomCreated {
                    room_id: room.id.clone(),
                    name: room.name.clone(),
                },
            )
            .await;
            presence::broadcast_device_list(hub, &room.id).await;
        }
        Err(error) => send_error(hub, device_id, error, None).await,
    }
}

async fn join_room(hub: &Arc<RelayHub>, device_id: &str, key: &str) {
    if key.trim().is_empty() {
        send_error(hub, device_id, RelayError::RoomNameEmpty, None).await;
        return;
    }
    match hub.rooms.join(key, device_id).await {
        Ok(room) => {
            leave_previous_room(hub, device_id, &room.id).await;
            hub.devices.set_room(device_id, Some(room.id.clone())).await;
            hub.persist_rooms().await;
            hub.persist_devices().await;

            let device_count = room.members.len();
            // The per-channel ack precedes the first deviceList that
            // reflects the new member.
            hub.send_to_device(
                device_id,
                ServerFrame::RoomJoined {
                    room_id: room.id.clone(),
                    name: room.name.clone(),
                    device_count,
                },
            )
            .await;

            if let Some(device) = hub.devices.get(device_id).await {
                let joined = ServerFrame::DeviceJoined {
                    room_id: room.id.clone(),
                    device: presence::project(&device),
                    device_count,
                };
                for member in room.members.iter().filter(|m| m.as_str() != device_id) {
                    hub.send_to_device(member, joined.clone()).await;
                }
            }
            presence::broadcast_device_list(hub, &room.id).await;
        }
        Err(error) => send_error(hub, device_id, error, None).await,
    }
}

/// Detach the device from the room it is in, announcing the departure to
/// the remaining members. Returns the left room's id.
pub async fn leave_current_room(hub: &Arc<RelayHub>, device_id: &str) -> Option<String> {
    let room_id = hub.devices.get(device_id).await?.room_id?;
    hub.devices.set_room(device_id, None).await;
    let left = hub.rooms.leave(&room_id, device_id).await;
    hub.persist_rooms().await;
    hub.persist_devices().await;

    if let Some((room, deleted)) = left {
        if !deleted {
            let frame = ServerFrame::DeviceLeft {
                room_id: room_id.clone(),
                device_id: device_id.to_string(),
                device_count: room.members.len(),
            };
            for member in &room.members {
                hub.send_to_device(member, frame.clone()).await;
            }
            presence::broadcast_device_list(hub, &room_id).await;
        }
    }
    Some(room_id)
}

/// Moving into `next` implies leaving any other room first.
async fn leave_previous_room(hub: &Arc<RelayHub>, device_id: &str, next: &str) {
    let previous = hub.devices.get(device_id).await.and_then(|d| d.room_id);
    if previous.as_deref().is_some_and(|p| p != next) {
        leave_current_room(hub, device_id).await;
    }
}

async fn file_transfer(
    hub: &Arc<RelayHub>,
    device_id: &str,
    transfer_id: Option<String>,
    target_device_id: &str,
    files: Vec<crate::models::FileMeta>,
) {
    let Some(sender) = hub.devices.get(device_id).await else {
        return;
    };
    let Some(target) = hub.devices.get(target_device_id).await else {
        send_error(hub, device_id, RelayError::TargetNotFound, transfer_id).await;
        return;
    };
    if sender.room_id.is_none() || sender.room_id != target.room_id {
        send_error(hub, device_id, RelayError::CrossRoomTransfer, transfer_id).await;
        return;
    }
    if !hub.is_bound(target_device_id).await {
        send_error(hub, device_id, RelayError::TargetOffline, transfer_id).await;
        return;
    }
    match hub.transfers.offer(&sender, &target, files, transfer_id.clone()).await {
        Ok(frames) => hub.send_all(frames).await,
        Err(error) => send_error(hub, device_id, error, transfer_id).await,
    }
}

/// Receiver pulls a previously accepted offer: prompt the sender to start
/// streaming, or tell the receiver why it cannot happen.
async fn request_download(hub: &Arc<RelayHub>, device_id: &str, transfer_id: &str) {
    let Some((sender, target, status)) = hub.transfers.meta(transfer_id).await else {
        hub.send_to_device(
            device_id,
            ServerFrame::DownloadError {
                transfer_id: transfer_id.to_string(),
                message: RelayError::TargetNotFound.to_string(),
            },
        )
        .await;
        return;
    };
    if target != device_id || status.is_terminal() {
        hub.send_to_device(
            device_id,
            ServerFrame::DownloadError {
                transfer_id: transfer_id.to_string(),
                message: RelayError::TargetNotFound.to_string(),
            },
        )
        .await;
        return;
    }
    if !hub.is_bound(&sender).await {
        hub.send_to_device(
            device_id,
            ServerFrame::DownloadError {
                transfer_id: transfer_id.to_string(),
                message: RelayError::SenderUnavailable.to_string(),
            },
        )
        .await;
        return;
    }
    hub.send_to_device(
        &sender,
        ServerFrame::SendFileData {
            transfer_id: transfer_id.to_string(),
            target_device_id: device_id.to_string(),
        },
    )
    .await;
}

/// Emergency-cleanup companion: close channels quiet for more than 30 s.
/// The teardown cancels each channel's close signal, so the sockets end
/// with a normal closure rather than lingering.
async fn close_idle_channels(hub: &Arc<RelayHub>) {
    for (device_id, token) in hub.idle_connections(30).await {
        debug!(device_id = %device_id, "closing idle channel under memory pressure");
        hub.handle_disconnect(&device_id, token).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::test_support::{bind_fake, hub};
    use crate::identity::DeviceProfile;
    use crate::models::FileMeta;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use tokio::sync::mpsc::UnboundedReceiver;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
         AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    async fn connect(hub: &Arc<RelayHub>, id: &str) -> UnboundedReceiver<ServerFrame> {
        let profile = DeviceProfile::from_user_agent(CHROME_UA);
        hub.devices.upsert_on_connect(id, &profile, CHROME_UA).await;
        let (_token, rx) = bind_fake(hub, id).await;
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn meta(name: &str, size: u64) -> FileMeta {
        FileMeta {
            name: name.into(),
            size,
            mime_type: "text/plain".into(),
        }
    }

    #[tokio::test]
    async fn create_then_case_insensitive_join() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx_a = connect(&hub, "device-a1b").await;
        let mut rx_b = connect(&hub, "device-c2d").await;

        dispatch(&hub, "device-a1b", ClientFrame::CreateRoom { name: "Foo".into() }).await;
        let frames = drain(&mut rx_a);
        assert!(matches!(frames[0], ServerFrame::RoomCreated { .. }));
        assert!(matches!(frames[1], ServerFrame::DeviceList { .. }));

        dispatch(
            &hub,
            "device-c2d",
            ClientFrame::JoinRoom { room_id: None, name: Some("foo".into()) },
        )
        .await;
        let frames = drain(&mut rx_b);
        match &frames[0] {
            ServerFrame::RoomJoined { device_count, name, .. } => {
                assert_eq!(*device_count, 2);
                assert_eq!(name, "Foo");
            }
            other => panic!("expected roomJoined first, got {other:?}"),
        }
        assert!(matches!(frames[1], ServerFrame::DeviceList { .. }));

        // The first member saw the join announcement plus the new list.
        let frames = drain(&mut rx_a);
        assert!(frames.iter().any(|f| matches!(f, ServerFrame::DeviceJoined { device_count, .. } if *device_count == 2)));
        assert!(frames.iter().any(|f| matches!(f, ServerFrame::DeviceList { devices, .. } if devices.len() == 2)));
    }

    #[tokio::test]
    async fn duplicate_room_name_yields_room_error() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx_a = connect(&hub, "a").await;
        let mut rx_b = connect(&hub, "b").await;

        dispatch(&hub, "a", ClientFrame::CreateRoom { name: "Foo".into() }).await;
        drain(&mut rx_a);
        dispatch(&hub, "b", ClientFrame::CreateRoom { name: " FOO ".into() }).await;
        let frames = drain(&mut rx_b);
        assert!(matches!(
            &frames[0],
            ServerFrame::RoomError { message } if message == "RoomAlreadyExists"
        ));
    }

    #[tokio::test]
    async fn end_to_end_small_transfer() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx_a = connect(&hub, "device-a1b").await;
        let mut rx_b = connect(&hub, "device-c2d").await;

        dispatch(&hub, "device-a1b", ClientFrame::CreateRoom { name: "Foo".into() }).await;
        dispatch(
            &hub,
            "device-c2d",
            ClientFrame::JoinRoom { room_id: None, name: Some("foo".into()) },
        )
        .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        dispatch(
            &hub,
            "device-a1b",
            ClientFrame::FileTransfer {
                transfer_id: Some("t1".into()),
                target_device_id: "device-c2d".into(),
                files: vec![meta("x.txt", 9)],
            },
        )
        .await;
        assert!(drain(&mut rx_b)
            .iter()
            .any(|f| matches!(f, ServerFrame::IncomingFile { transfer_id, .. } if transfer_id == "t1")));
        assert!(drain(&mut rx_a)
            .iter()
            .any(|f| matches!(f, ServerFrame::TransferStarted { .. })));

        dispatch(&hub, "device-c2d", ClientFrame::TransferAccepted { transfer_id: "t1".into() }).await;
        assert!(drain(&mut rx_a)
            .iter()
            .any(|f| matches!(f, ServerFrame::TransferAccepted { .. })));

        let before = hub.transfers.memory_in_flight().await;
        for (i, part) in ["abc", "def", "ghi"].iter().enumerate() {
            dispatch(
                &hub,
                "device-a1b",
                ClientFrame::FileChunk {
                    transfer_id: "t1".into(),
                    chunk_index: i as u32,
                    total_chunks: 3,
                    data: BASE64.encode(part.as_bytes()),
                    file_size: Some(9),
                },
            )
            .await;
        }

        let received = drain(&mut rx_b);
        let payload = received
            .iter()
            .find_map(|f| match f {
                ServerFrame::FileComplete { file_data: Some(data), .. } => Some(data.clone()),
                _ => None,
            })
            .expect("assembled fileComplete");
        assert_eq!(payload, BASE64.encode(b"abcdefghi"));

        let sender_frames = drain(&mut rx_a);
        assert!(sender_frames.iter().any(|f| matches!(f, ServerFrame::TransferComplete { .. })));
        assert_eq!(hub.transfers.memory_in_flight().await, before);
    }

    #[tokio::test]
    async fn cross_room_transfer_rejected() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx_a = connect(&hub, "a").await;
        let mut _rx_b = connect(&hub, "b").await;

        dispatch(&hub, "a", ClientFrame::CreateRoom { name: "One".into() }).await;
        dispatch(&hub, "b", ClientFrame::CreateRoom { name: "Two".into() }).await;
        drain(&mut rx_a);

        dispatch(
            &hub,
            "a",
            ClientFrame::FileTransfer {
                transfer_id: None,
                target_device_id: "b".into(),
                files: vec![meta("x.txt", 9)],
            },
        )
        .await;
        let frames = drain(&mut rx_a);
        assert!(matches!(
            &frames[0],
            ServerFrame::TransferError { message, .. } if message == "CrossRoomTransfer"
        ));
    }

    #[tokio::test]
    async fn offline_target_rejected_at_offer() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx_a = connect(&hub, "a").await;

        // "b" is known and in the same room but has no bound channel.
        let profile = DeviceProfile::from_user_agent(CHROME_UA);
        hub.devices.upsert_on_connect("b", &profile, CHROME_UA).await;
        dispatch(&hub, "a", ClientFrame::CreateRoom { name: "One".into() }).await;
        let room_id = hub.devices.get("a").await.unwrap().room_id.unwrap();
        hub.rooms.join(&room_id, "b").await.unwrap();
        hub.devices.set_room("b", Some(room_id)).await;
        drain(&mut rx_a);

        dispatch(
            &hub,
            "a",
            ClientFrame::FileTransfer {
                transfer_id: None,
                target_device_id: "b".into(),
                files: vec![meta("x.txt", 9)],
            },
        )
        .await;
        let frames = drain(&mut rx_a);
        assert!(matches!(
            &frames[0],
            ServerFrame::TransferError { message, .. } if message == "TargetOffline"
        ));
    }

    #[tokio::test]
    async fn leave_room_announces_and_updates_list() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx_a = connect(&hub, "a").await;
        let mut rx_b = connect(&hub, "b").await;

        dispatch(&hub, "a", ClientFrame::CreateRoom { name: "Foo".into() }).await;
        dispatch(&hub, "b", ClientFrame::JoinRoom { room_id: None, name: Some("foo".into()) }).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        dispatch(&hub, "b", ClientFrame::LeaveRoom).await;
        let frames = drain(&mut rx_b);
        assert!(frames.iter().any(|f| matches!(f, ServerFrame::RoomLeft { .. })));

        let frames = drain(&mut rx_a);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::DeviceLeft { device_id, device_count, .. }
                if device_id == "b" && *device_count == 1
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::DeviceList { devices, .. } if devices.len() == 1
        )));
    }

    #[tokio::test]
    async fn ping_echoes_timestamp() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx = connect(&hub, "a").await;

        dispatch(&hub, "a", ClientFrame::Ping { timestamp: Some(12345) }).await;
        assert!(matches!(
            drain(&mut rx)[0],
            ServerFrame::Pong { timestamp: Some(12345) }
        ));
    }

    #[tokio::test]
    async fn request_download_prompts_online_sender() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx_a = connect(&hub, "a").await;
        let mut rx_b = connect(&hub, "b").await;

        dispatch(&hub, "a", ClientFrame::CreateRoom { name: "Foo".into() }).await;
        dispatch(&hub, "b", ClientFrame::JoinRoom { room_id: None, name: Some("foo".into()) }).await;
        dispatch(
            &hub,
            "a",
            ClientFrame::FileTransfer {
                transfer_id: Some("t1".into()),
                target_device_id: "b".into(),
                files: vec![meta("x.txt", 9)],
            },
        )
        .await;
        dispatch(&hub, "b", ClientFrame::TransferAccepted { transfer_id: "t1".into() }).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        dispatch(&hub, "b", ClientFrame::RequestFileDownload { transfer_id: "t1".into() }).await;
        assert!(drain(&mut rx_a).iter().any(|f| matches!(
            f,
            ServerFrame::SendFileData { transfer_id, .. } if transfer_id == "t1"
        )));

        dispatch(&hub, "b", ClientFrame::RequestFileDownload { transfer_id: "nope".into() }).await;
        assert!(drain(&mut rx_b).iter().any(|f| matches!(f, ServerFrame::DownloadError { .. })));
    }

    #[tokio::test]
    async fn toggle_pin_rebroadcasts_presence() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx_a = connect(&hub, "a").await;
        let mut rx_b = connect(&hub, "b").await;

        dispatch(&hub, "a", ClientFrame::CreateRoom { name: "Foo".into() }).await;
        dispatch(&hub, "b", ClientFrame::JoinRoom { room_id: None, name: Some("foo".into()) }).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        dispatch(&hub, "a", ClientFrame::TogglePinDevice { target_device_id: "b".into() }).await;
        let frames = drain(&mut rx_a);
        match frames.last() {
            Some(ServerFrame::DeviceList { devices, .. }) => {
                let b = devices.iter().find(|d| d.id == "b").unwrap();
                assert!(b.pinned);
            }
            other => panic!("expected deviceList, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receiver_disconnect_mid_stream_notifies_sender() {
        let (hub, _dir) = hub().await;
        let hub = Arc::new(hub);
        let mut rx_a = connect(&hub, "a").await;
        let _rx_b = connect(&hub, "b").await;

        dispatch(&hub, "a", ClientFrame::CreateRoom { name: "Foo".into() }).await;
        dispatch(&hub, "b", ClientFrame::JoinRoom { room_id: None, name: Some("foo".into()) }).await;
        dispatch(
            &hub,
            "a",
            ClientFrame::FileTransfer {
                transfer_id: Some("t1".into()),
                target_device_id: "b".into(),
                files: vec![meta("x.bin", 100)],
            },
        )
        .await;
        dispatch(&hub, "b", ClientFrame::TransferAccepted { transfer_id: "t1".into() }).await;
        dispatch(
            &hub,
            "a",
            ClientFrame::FileChunk {
                transfer_id: "t1".into(),
                chunk_index: 0,
                total_chunks: 5,
                data: BASE64.encode(b"xx"),
                file_size: Some(100),
            },
        )
        .await;
        drain(&mut rx_a);
        assert_eq!(hub.transfers.memory_in_flight().await, 100);

        let token = hub.connection("b").await.unwrap().token;
        hub.handle_disconnect("b", token).await;

        let frames = drain(&mut rx_a);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::TransferError { message, .. } if message == "TargetOffline"
        )));
        assert!(frames.iter().any(|f| matches!(f, ServerFrame::DeviceList { .. })));
        assert_eq!(hub.transfers.memory_in_flight().await, 0);
    }
}
