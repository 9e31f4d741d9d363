use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::devices::DeviceRegistry;
use crate::models::{Device, Room};
use crate::persistence::{load_catalog, CatalogStore};
use crate::presence;
use crate::relay::messages::ServerFrame;
use crate::rooms::RoomRegistry;
use crate::transfers::TransferEngine;

/// The live channel bound to a device. Frames pushed into `tx` are
/// serialized onto the socket by that connection's writer task, which
/// preserves per-channel ordering. Cancelling `closer` makes that writer
/// drain its queue, send a normal-closure frame, and end, tearing the
/// whole socket down server-side.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub token: Uuid,
    pub tx: mpsc::UnboundedSender<ServerFrame>,
    pub closer: CancellationToken,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub addr: String,
    pub mobile_safari: bool,
}

/// Process-wide shared state: both registries, the transfer engine and the
/// connection table, plus the snapshot stores backing the catalogs.
pub struct RelayHub {
    pub devices: DeviceRegistry,
    pub rooms: RoomRegistry,
    pub transfers: TransferEngine,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    device_store: CatalogStore,
    room_store: CatalogStore,
}

impl RelayHub {
    pub fn new(device_store: CatalogStore, room_store: CatalogStore) -> Self {
        Self {
            devices: DeviceRegistry::new(),
            rooms: RoomRegistry::new(),
            transfers: TransferEngine::new(),
            connections: RwLock::new(HashMap::new()),
            device_store,
            room_store,
        }
    }

    /// Load both catalogs from disk. Devices come back offline and
    /// unbound; rooms keep their membership.
    pub async fn load_catalogs(&self) {
        let devices: Vec<Device> = load_catalog(self.device_store.path()).await;
        let rooms: Vec<Room> = load_catalog(self.room_store.path()).await;
        info!(devices = devices.len(), rooms = rooms.len(), "catalogs loaded");
        self.devices.load(devices).await;
        self.rooms.load(rooms).await;

        // Reconcile dangling memberships from a torn shutdown: a stored
        // room id must point at a room that still lists the device.
        for device in self.devices.snapshot().await {
            if let Some(room_id) = &device.room_id {
                let member = self
                    .rooms
                    .get(room_id)
                    .await
                    .is_some_and(|room| room.members.contains(&device.id));
                if !member {
                    self.devices.set_room(&device.id, None).await;
                }
            }
        }
    }

    /// Bind a channel to a device id, returning the previous binding when
    /// one was still live (duplicate-connection resolution: newer wins).
    pub async fn bind_connection(
        &self,
        device_id: &str,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write().await;
        connections.insert(device_id.to_string(), handle)
    }

    /// Drop the binding, but only if it still belongs to `token`. An old
    /// channel closing after a duplicate took over must not unbind the new
    /// one. Returns the removed handle so the caller can signal its tasks.
    pub async fn unbind_connection(
        &self,
        device_id: &str,
        token: Uuid,
    ) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write().await;
        let owned = connections
            .get(device_id)
            .is_some_and(|handle| handle.token == token);
        if owned {
            connections.remove(device_id)
        } else {
            None
        }
    }

    pub async fn connection(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(device_id).cloned()
    }

    pub async fn is_bound(&self, device_id: &str) -> bool {
        self.connections.read().await.contains_key(device_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Refresh a connection's inbound-activity stamp.
    pub async fn touch(&self, device_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(handle) = connections.get_mut(device_id) {
            handle.last_activity = Utc::now();
        }
    }

    pub async fn last_activity(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.connections
            .read()
            .await
            .get(device_id)
            .map(|h| h.last_activity)
    }

    /// Connections whose last inbound activity is older than `idle_secs`.
    pub async fn idle_connections(&self, idle_secs: i64) -> Vec<(String, Uuid)> {
        let cutoff = Utc::now() - chrono::Duration::seconds(idle_secs);
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, h)| h.last_activity < cutoff)
            .map(|(id, h)| (id.clone(), h.token))
            .collect()
    }

    pub async fn send_to_device(&self, device_id: &str, frame: ServerFrame) -> bool {
        let connections = self.connections.read().await;
        match connections.get(device_id) {
            Some(handle) => {
                if handle.tx.send(frame).is_err() {
                    debug!(device_id = %device_id, "send to closed channel dropped");
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// Gather-then-send helper for frames addressed by device id.
    pub async fn send_all(&self, outbound: Vec<(String, ServerFrame)>) {
        for (device_id, frame) in outbound {
            if !self.send_to_device(&device_id, frame).await {
                debug!(device_id = %device_id, "outbound frame dropped, device unbound");
            }
        }
    }

    /// Full teardown for a channel: unbind, signal its socket tasks to
    /// close, mark the device offline, error its live transfers, and
    /// re-broadcast presence to its room. Token-guarded so a superseded
    /// channel cannot tear down its replacement. Callers closing a channel
    /// server-side (janitor, emergency cleanup) go through here too; the
    /// cancelled token is what actually ends the socket.
    pub async fn handle_disconnect(&self, device_id: &str, token: Uuid) {
        let Some(handle) = self.unbind_connection(device_id, token).await else {
            debug!(device_id = %device_id, "close of superseded channel ignored");
            return;
        };
        handle.closer.cancel();

        let device = self.devices.mark_offline(device_id).await;
        self.persist_devices().await;

        let failed = self.transfers.fail_for_device(device_id).await;
        self.send_all(failed).await;

        if let Some(room_id) = device.and_then(|d| d.room_id) {
            let device_count = self.rooms.member_count(&room_id).await;
            let left = ServerFrame::DeviceLeft {
                room_id: room_id.clone(),
                device_id: device_id.to_string(),
                device_count,
            };
            let targets = presence::room_member_ids(self, &room_id).await;
            for target in targets {
                self.send_to_device(&target, left.clone()).await;
            }
            presence::broadcast_device_list(self, &room_id).await;
        }

        info!(device_id = %device_id, "device disconnected");
    }

    pub async fn persist_devices(&self) {
        if self.devices.take_dirty() {
            self.device_store.persist(&self.devices.snapshot().await);
        }
    }

    pub async fn persist_rooms(&self) {
        if self.rooms.take_dirty() {
            self.room_store.persist(&self.rooms.snapshot().await);
        }
    }

    /// Final flush on shutdown: snapshot both catalogs and wait for the
    /// writes.
    pub async fn flush_catalogs(&self) {
        self.device_store.persist(&self.devices.snapshot().await);
        self.room_store.persist(&self.rooms.snapshot().await);
        self.device_store.flush().await;
        self.room_store.flush().await;
    }

    /// Shutdown path: signal every open channel to close. Each writer
    /// drains its queue and sends a normal-closure frame before ending.
    pub async fn close_all_connections(&self) {
        let mut connections = self.connections.write().await;
        let count = connections.len();
        for handle in connections.values() {
            handle.closer.cancel();
        }
        connections.clear();
        if count > 0 {
            info!(count, "closed all connections for shutdown");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::persistence::CatalogStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Hub writing to a throwaway temp dir.
    pub async fn hub() -> (RelayHub, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let hub = RelayHub::new(
            CatalogStore::open(dir.path().join("devices.json")),
            CatalogStore::open(dir.path().join("rooms.json")),
        );
        (hub, dir)
    }

    /// Bind a fake channel for `device_id`, returning its token and the
    /// receiving end for frame assertions.
    pub async fn bind_fake(
        hub: &RelayHub,
        device_id: &str,
    ) -> (Uuid, UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = Uuid::new_v4();
        hub.bind_connection(
            device_id,
            ConnectionHandle {
                token,
                tx,
                closer: CancellationToken::new(),
                connected_at: Utc::now(),
                last_activity: Utc::now(),
                addr: "203.0.113.7".into(),
                mobile_safari: false,
            },
        )
        .await;
        (token, rx)
    }
}
