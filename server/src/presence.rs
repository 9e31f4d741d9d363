use tracing::debug;

use crate::hub::RelayHub;
use crate::models::Device;
use crate::relay::messages::{DeviceListEntry, ServerFrame};

/// One presence row for a device. The display name prefers the custom
/// override; `original_name` keeps the platform default visible.
pub fn project(device: &Device) -> DeviceListEntry {
    DeviceListEntry {
        id: device.id.clone(),
        name: device.display_name().to_string(),
        original_name: device.name.clone(),
        device_type: device.device_type,
        platform: device.platform.clone(),
        browser: device.browser.clone(),
        pinned: device.pinned,
        online: device.online,
        last_seen: device.last_seen,
        connection_strength: device.connection_strength,
        has_custom_name: device.custom_name.is_some(),
    }
}

/// Member ids of a room in stable (id) order.
pub async fn room_member_ids(hub: &RelayHub, room_id: &str) -> Vec<String> {
    match hub.rooms.get(room_id).await {
        Some(room) => room.members.into_iter().collect(),
        None => Vec::new(),
    }
}

/// The ordered device-list projection for a room.
pub async fn room_device_list(hub: &RelayHub, room_id: &str) -> Vec<DeviceListEntry> {
    let mut entries = Vec::new();
    for member in room_member_ids(hub, room_id).await {
        if let Some(device) = hub.devices.get(&member).await {
            entries.push(project(&device));
        }
    }
    entries
}

/// Recompute and fan out the room's device list to every member with an
/// open channel. Gathered first, sent after, so no registry lock is held
/// across channel writes; per-member failures only log.
pub async fn broadcast_device_list(hub: &RelayHub, room_id: &str) {
    let members = room_member_ids(hub, room_id).await;
    if members.is_empty() {
        return;
    }
    let devices = room_device_list(hub, room_id).await;
    let frame = ServerFrame::DeviceList {
        room_id: room_id.to_string(),
        devices,
    };
    for member in members {
        if !hub.send_to_device(&member, frame.clone()).await {
            debug!(device_id = %member, room_id = %room_id, "deviceList skipped, no open channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::test_support::{bind_fake, hub};
    use crate::identity::DeviceProfile;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
         AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    async fn seed_device(hub: &RelayHub, id: &str) {
        let profile = DeviceProfile::from_user_agent(CHROME_UA);
        hub.devices.upsert_on_connect(id, &profile, CHROME_UA).await;
    }

    #[tokio::test]
    async fn projection_prefers_custom_name() {
        let (hub, _dir) = hub().await;
        seed_device(&hub, "device-1").await;
        hub.devices.rename("device-1", "Desk machine").await.unwrap();

        let device = hub.devices.get("device-1").await.unwrap();
        let entry = project(&device);
        assert_eq!(entry.name, "Desk machine");
        assert!(entry.has_custom_name);
        assert_eq!(entry.platform, "Windows");
    }

    #[tokio::test]
    async fn projection_without_custom_name_uses_default() {
        let (hub, _dir) = hub().await;
        seed_device(&hub, "device-1").await;
        let device = hub.devices.get("device-1").await.unwrap();
        let entry = project(&device);
        assert_eq!(entry.name, "Windows PC");
        assert_eq!(entry.original_name, "Windows PC");
        assert!(!entry.has_custom_name);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_bound_member() {
        let (hub, _dir) = hub().await;
        seed_device(&hub, "a").await;
        seed_device(&hub, "b").await;
        let room = hub.rooms.create("Foo", "a").await.unwrap();
        hub.rooms.join(&room.id, "b").await.unwrap();
        hub.devices.set_room("a", Some(room.id.clone())).await;
        hub.devices.set_room("b", Some(room.id.clone())).await;

        let (_ta, mut rx_a) = bind_fake(&hub, "a").await;
        let (_tb, mut rx_b) = bind_fake(&hub, "b").await;

        broadcast_device_list(&hub, &room.id).await;

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                ServerFrame::DeviceList { devices, .. } => {
                    assert_eq!(devices.len(), 2);
                }
                other => panic!("expected deviceList, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unbound_member_does_not_block_others() {
        let (hub, _dir) = hub().await;
        seed_device(&hub, "a").await;
        seed_device(&hub, "b").await;
        let room = hub.rooms.create("Foo", "a").await.unwrap();
        hub.rooms.join(&room.id, "b").await.unwrap();

        // Only "a" has a live channel.
        let (_ta, mut rx_a) = bind_fake(&hub, "a").await;

        broadcast_device_list(&hub, &room.id).await;
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerFrame::DeviceList { .. }
        ));
    }
}
