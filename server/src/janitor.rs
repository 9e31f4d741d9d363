use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::hub::RelayHub;
use crate::presence;
use crate::relay::messages::ServerFrame;

pub const SWEEP_INTERVAL_SECS: u64 = 60;
/// Channels quiet this long are closed ("Inactivity").
const CHANNEL_IDLE_CLOSE_SECS: i64 = 300;
/// Transfers, live or terminal, are dropped after an hour.
const TRANSFER_TTL_MINS: i64 = 60;
/// Scratch uploads are pruned after a day.
const UPLOAD_TTL_SECS: u64 = 24 * 60 * 60;

/// Spawn the periodic sweeper.
pub fn start(hub: Arc<RelayHub>, upload_dir: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep(&hub, &upload_dir).await;
        }
    })
}

/// One sweep: idle channels, stale devices, orphan transfers, leftover
/// scratch files, then a persist if anything is dirty.
pub async fn sweep(hub: &Arc<RelayHub>, upload_dir: &Path) {
    for (device_id, token) in hub.idle_connections(CHANNEL_IDLE_CLOSE_SECS).await {
        info!(device_id = %device_id, "closing inactive channel");
        hub.send_to_device(
            &device_id,
            ServerFrame::Error {
                message: crate::error::RelayError::Inactivity.to_string(),
            },
        )
        .await;
        hub.handle_disconnect(&device_id, token).await;
    }

    for device_id in hub.devices.expired_ids().await {
        expire_device(hub, &device_id).await;
    }

    let frames = hub
        .transfers
        .expire_older_than(chrono::Duration::minutes(TRANSFER_TTL_MINS))
        .await;
    hub.send_all(frames).await;

    prune_uploads(upload_dir).await;

    hub.persist_devices().await;
    hub.persist_rooms().await;
}

/// Forget a stale device, detaching it from its room first. The room is
/// deleted when this was its last member; otherwise the remaining members
/// get the departure fan-out.
async fn expire_device(hub: &Arc<RelayHub>, device_id: &str) {
    let Some(device) = hub.devices.remove(device_id).await else {
        return;
    };
    info!(device_id = %device_id, pinned = device.pinned, "expiring stale device");

    if let Some(room_id) = device.room_id {
        if let Some((room, deleted)) = hub.rooms.leave(&room_id, device_id).await {
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
    }
}

/// Remove scratch files whose mtime is older than a day.
async fn prune_uploads(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let cutoff = SystemTime::now() - Duration::from_secs(UPLOAD_TTL_SECS);
    while let Ok(Some(entry)) = entries.next_entry().await {
        let stale = entry
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .is_some_and(|mtime| mtime < cutoff);
        if stale {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => debug!(path = %entry.path().display(), "pruned stale upload"),
                Err(e) => warn!(path = %entry.path().display(), "upload prune failed: {e}"),
            }
        }
    }
}
